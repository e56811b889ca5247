//! Explicit unit of work threaded through every merge step

use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use tracing::debug;

use crate::error::MergeError;

/// Coordinator states, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Resolving,
    Canonicalizing,
    Relinking,
    Deduplicating,
    ReconcilingAllocations,
    Eliminating,
    Verifying,
    Committed,
}

impl MergeState {
    pub fn next(self) -> Option<MergeState> {
        use MergeState::*;
        match self {
            Resolving => Some(Canonicalizing),
            Canonicalizing => Some(Relinking),
            Relinking => Some(Deduplicating),
            Deduplicating => Some(ReconcilingAllocations),
            ReconcilingAllocations => Some(Eliminating),
            Eliminating => Some(Verifying),
            Verifying => Some(Committed),
            Committed => None,
        }
    }
}

/// A connection that is inside the merge transaction, plus the state the
/// merge has reached. Steps only ever see the database through this.
pub struct UnitOfWork<'c> {
    conn: &'c mut SqliteConnection,
    state: MergeState,
}

impl<'c> UnitOfWork<'c> {
    /// Wrap a connection that already has the transaction open
    pub(crate) fn new(conn: &'c mut SqliteConnection) -> Self {
        Self {
            conn,
            state: MergeState::Resolving,
        }
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.conn
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    /// Move to `next`, which must directly follow the current state
    pub fn advance(&mut self, next: MergeState) -> Result<(), MergeError> {
        if self.state.next() != Some(next) {
            return Err(MergeError::IntegrityViolation(format!(
                "merge cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        debug!("Merge state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }
}
