//! Database schema definitions

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use tracing::info;

use super::diesel_schema::schema_version;
use crate::error::MergeError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), MergeError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, MergeError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL PRIMARY KEY)")
        .map_err(|e| MergeError::db("Failed to create schema_version table", e))?;

    let version = schema_version::table
        .select(schema_version::version)
        .first::<i32>(conn)
        .optional()
        .map_err(|e| MergeError::db("Failed to read schema_version", e))?;

    Ok(version.unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), MergeError> {
    diesel::delete(schema_version::table)
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to clear schema_version", e))?;
    diesel::insert_into(schema_version::table)
        .values(schema_version::version.eq(version))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to set schema_version", e))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &mut SqliteConnection) -> Result<(), MergeError> {
    conn.batch_execute(IDENTITY_SCHEMA)
        .map_err(|e| MergeError::db("Failed to create identity tables", e))?;

    conn.batch_execute(CURRICULUM_SCHEMA)
        .map_err(|e| MergeError::db("Failed to create curriculum tables", e))?;

    conn.batch_execute(COHORT_SCHEMA)
        .map_err(|e| MergeError::db("Failed to create cohort tables", e))?;

    conn.batch_execute(INDEXES_SCHEMA)
        .map_err(|e| MergeError::db("Failed to create indexes", e))?;

    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &mut SqliteConnection, _from_version: i32) -> Result<(), MergeError> {
    // Add migration steps here as schema evolves
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Persons and their role-scoped actors
const IDENTITY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS persons (
    id TEXT PRIMARY KEY NOT NULL,
    first_name TEXT NOT NULL,
    last_name_prefix TEXT,
    last_name TEXT,
    date_of_birth TEXT,

    -- Link to an authentication account; linked persons are never merged away
    user_id TEXT,

    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS actors (
    id TEXT PRIMARY KEY NOT NULL,
    person_id TEXT NOT NULL,
    location_id TEXT NOT NULL,
    actor_type TEXT NOT NULL DEFAULT 'student',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    deleted_at TEXT,

    FOREIGN KEY (person_id) REFERENCES persons(id)
);
"#;

/// Enrollments, certificates and completed competencies
const CURRICULUM_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS student_curricula (
    id TEXT PRIMARY KEY NOT NULL,
    person_id TEXT NOT NULL,
    curriculum_id TEXT NOT NULL,
    gear_type_id TEXT NOT NULL,
    started_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),

    -- Set when a merge collapsed this enrollment into another one
    superseded_by TEXT,
    deleted_at TEXT,

    FOREIGN KEY (person_id) REFERENCES persons(id),
    FOREIGN KEY (superseded_by) REFERENCES student_curricula(id)
);

CREATE TABLE IF NOT EXISTS certificates (
    id TEXT PRIMARY KEY NOT NULL,
    student_curriculum_id TEXT NOT NULL,
    cohort_allocation_id TEXT,
    issued_at TEXT,
    visible_from TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    deleted_at TEXT,

    FOREIGN KEY (student_curriculum_id) REFERENCES student_curricula(id),
    FOREIGN KEY (cohort_allocation_id) REFERENCES cohort_allocations(id)
);

CREATE TABLE IF NOT EXISTS student_completed_competencies (
    id TEXT PRIMARY KEY NOT NULL,
    competency_id TEXT NOT NULL,
    student_curriculum_id TEXT NOT NULL,
    certificate_id TEXT NOT NULL,
    is_merge_conflict_duplicate INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    deleted_at TEXT,

    FOREIGN KEY (student_curriculum_id) REFERENCES student_curricula(id),
    FOREIGN KEY (certificate_id) REFERENCES certificates(id)
);
"#;

/// Cohort membership and per-competency progress
const COHORT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cohort_allocations (
    id TEXT PRIMARY KEY NOT NULL,
    cohort_id TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    student_curriculum_id TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    deleted_at TEXT,

    FOREIGN KEY (actor_id) REFERENCES actors(id),
    FOREIGN KEY (student_curriculum_id) REFERENCES student_curricula(id)
);

CREATE TABLE IF NOT EXISTS student_cohort_progress (
    id TEXT PRIMARY KEY NOT NULL,
    cohort_allocation_id TEXT NOT NULL,
    competency_id TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),

    FOREIGN KEY (cohort_allocation_id) REFERENCES cohort_allocations(id)
);
"#;

/// Index definitions, including the partial unique indexes the merge relies on
const INDEXES_SCHEMA: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_actors_unique
    ON actors(person_id, location_id, actor_type) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_actors_person ON actors(person_id);

CREATE UNIQUE INDEX IF NOT EXISTS idx_student_curricula_canonical
    ON student_curricula(person_id, curriculum_id, gear_type_id)
    WHERE superseded_by IS NULL AND deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_student_curricula_person ON student_curricula(person_id);

CREATE INDEX IF NOT EXISTS idx_certificates_curriculum ON certificates(student_curriculum_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_certificates_allocation
    ON certificates(cohort_allocation_id) WHERE cohort_allocation_id IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_completed_competencies_curriculum
    ON student_completed_competencies(student_curriculum_id, competency_id);
CREATE INDEX IF NOT EXISTS idx_completed_competencies_certificate
    ON student_completed_competencies(certificate_id);

CREATE UNIQUE INDEX IF NOT EXISTS idx_cohort_allocations_unique
    ON cohort_allocations(cohort_id, actor_id) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_cohort_allocations_actor ON cohort_allocations(actor_id);

CREATE UNIQUE INDEX IF NOT EXISTS idx_cohort_progress_unique
    ON student_cohort_progress(cohort_allocation_id, competency_id);
"#;
