//! SQLite database module for certification records
//!
//! ## Tables
//!
//! - `persons` / `actors` - identities and their role-scoped presences
//! - `student_curricula` - enrollments, canonical while `superseded_by` is NULL
//! - `certificates` - issued certificates, owned by an enrollment
//! - `student_completed_competencies` - completed competencies backed by a certificate
//! - `cohort_allocations` / `student_cohort_progress` - class membership and progress
//!
//! All operations take `&mut SqliteConnection` so callers decide the
//! transaction boundary.

pub mod certificates;
pub mod cohorts;
pub mod curricula;
pub mod diesel_schema;
pub mod models;
pub mod persons;
pub mod schema;

use std::path::Path;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::MergeError;
use diesel_schema::{
    actors, certificates as certificates_table, cohort_allocations, persons as persons_table,
    student_cohort_progress, student_completed_competencies, student_curricula,
};

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas applied when the pool hands out a connection
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl ConnectionOptions {
    fn apply(&self, conn: &mut SqliteConnection) -> QueryResult<()> {
        // WAL for concurrent readers while a merge holds the write lock
        conn.batch_execute(&format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        ))
    }
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        self.apply(conn).map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Open a connection pool on the configured database, creating the schema
/// if needed
pub fn open_pool(config: &Config) -> Result<DbPool, MergeError> {
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let url = config.database_path.to_string_lossy().to_string();
    info!("Opening SQLite database at {:?}", config.database_path);

    let manager = ConnectionManager::<SqliteConnection>::new(url);
    let pool = Pool::builder()
        .max_size(config.pool_size)
        .connection_customizer(Box::new(ConnectionOptions {
            busy_timeout: config.busy_timeout(),
        }))
        .build(manager)
        .map_err(|e| MergeError::Pool(format!("Failed to build pool: {}", e)))?;

    let mut conn = pool
        .get()
        .map_err(|e| MergeError::Pool(format!("Failed to get connection: {}", e)))?;
    schema::init_schema(&mut conn)?;

    Ok(pool)
}

/// Open a single connection on a database file
pub fn open(path: &Path, busy_timeout: Duration) -> Result<SqliteConnection, MergeError> {
    let url = path.to_string_lossy().to_string();
    let mut conn = SqliteConnection::establish(&url)
        .map_err(|e| MergeError::Database(format!("Failed to open SQLite: {}", e)))?;

    ConnectionOptions { busy_timeout }
        .apply(&mut conn)
        .map_err(|e| MergeError::db("Failed to set PRAGMA", e))?;
    schema::init_schema(&mut conn)?;

    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_in_memory() -> Result<SqliteConnection, MergeError> {
    debug!("Opening in-memory SQLite database");

    let mut conn = SqliteConnection::establish(":memory:")
        .map_err(|e| MergeError::Database(format!("Failed to open in-memory SQLite: {}", e)))?;
    conn.batch_execute("PRAGMA foreign_keys = ON;")
        .map_err(|e| MergeError::db("Failed to set PRAGMA", e))?;
    schema::init_schema(&mut conn)?;

    Ok(conn)
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub persons: i64,
    pub actors: i64,
    pub enrollments: i64,
    pub superseded_enrollments: i64,
    pub certificates: i64,
    pub completed_competencies: i64,
    pub merge_conflict_duplicates: i64,
    pub cohort_allocations: i64,
    pub cohort_progress: i64,
}

/// Get database statistics
pub fn stats(conn: &mut SqliteConnection) -> Result<DbStats, MergeError> {
    let count_failed = |e| MergeError::db("Count query failed", e);

    Ok(DbStats {
        persons: persons_table::table.count().get_result(conn).map_err(count_failed)?,
        actors: actors::table.count().get_result(conn).map_err(count_failed)?,
        enrollments: student_curricula::table.count().get_result(conn).map_err(count_failed)?,
        superseded_enrollments: student_curricula::table
            .filter(student_curricula::superseded_by.is_not_null())
            .count()
            .get_result(conn)
            .map_err(count_failed)?,
        certificates: certificates_table::table.count().get_result(conn).map_err(count_failed)?,
        completed_competencies: student_completed_competencies::table
            .count()
            .get_result(conn)
            .map_err(count_failed)?,
        merge_conflict_duplicates: student_completed_competencies::table
            .filter(student_completed_competencies::is_merge_conflict_duplicate.eq(1))
            .count()
            .get_result(conn)
            .map_err(count_failed)?,
        cohort_allocations: cohort_allocations::table
            .filter(cohort_allocations::deleted_at.is_null())
            .count()
            .get_result(conn)
            .map_err(count_failed)?,
        cohort_progress: student_cohort_progress::table
            .count()
            .get_result(conn)
            .map_err(count_failed)?,
    })
}

#[cfg(test)]
pub(crate) fn test_db() -> SqliteConnection {
    open_in_memory().expect("Failed to create in-memory database")
}

// Re-exports
pub use certificates::CreateCertificateInput;
pub use cohorts::{CreateAllocationInput, UpsertProgressInput};
pub use curricula::{CreateEnrollmentInput, RecordCompletionInput};
pub use persons::{CreateActorInput, CreatePersonInput};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_on_empty_database() {
        let mut conn = test_db();
        let stats = stats(&mut conn).unwrap();
        assert_eq!(stats.persons, 0);
        assert_eq!(stats.certificates, 0);
    }

    #[test]
    fn test_pool_on_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: dir.path().join("nested").join("records.db"),
            pool_size: 2,
            ..Default::default()
        };

        let pool = open_pool(&config).unwrap();
        let mut conn = pool.get().unwrap();
        assert_eq!(stats(&mut conn).unwrap().persons, 0);
    }
}
