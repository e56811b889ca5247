//! Identity merge - collapse duplicate person records in a certification store
//!
//! The same human sometimes ends up as two persons: one created by an
//! instructor on the spot, one created when the student signed up. Merging
//! moves everything the duplicate owns onto the surviving person without
//! losing an issued certificate or counting a competency twice.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/identity-merge/
//! ├── certification.db    # SQLite, WAL mode
//! └── config.toml         # Configuration
//! ```
//!
//! ## Modules
//!
//! - [`db`] - Diesel schema, models and per-table operations
//! - [`merge`] - the merge coordinator and its steps
//! - [`config`] - TOML configuration
//! - [`error`] - [`MergeError`]

pub mod config;
pub mod db;
pub mod error;
pub mod merge;

pub use config::Config;
pub use error::{MergeError, MergeResult};
pub use merge::{
    merge_persons, CollisionPolicy, MergeInput, MergeReport, MergeService, PreferOldest,
    RetryPolicy, TargetWins,
};
