//! Diesel model definitions for database tables
//!
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT queries (writing data)
//!
//! Integer columns stand in for booleans (SQLite has no native bool).

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::diesel_schema::*;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ============================================================================
// Identity Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = persons)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name_prefix: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub user_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = persons)]
pub struct NewPerson<'a> {
    pub id: &'a str,
    pub first_name: &'a str,
    pub last_name_prefix: Option<&'a str>,
    pub last_name: Option<&'a str>,
    pub date_of_birth: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// A person's role-scoped presence at one location
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = actors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Actor {
    pub id: String,
    pub person_id: String,
    pub location_id: String,
    pub actor_type: String,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = actors)]
pub struct NewActor<'a> {
    pub id: &'a str,
    pub person_id: &'a str,
    pub location_id: &'a str,
    pub actor_type: &'a str,
    pub created_at: &'a str,
}

// ============================================================================
// Curriculum Models
// ============================================================================

/// Enrollment of a person in one (curriculum, gear type) pair
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = student_curricula)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct StudentCurriculum {
    pub id: String,
    pub person_id: String,
    pub curriculum_id: String,
    pub gear_type_id: String,
    pub started_at: Option<String>,
    pub created_at: String,
    pub superseded_by: Option<String>,
    pub deleted_at: Option<String>,
}

impl StudentCurriculum {
    pub fn is_canonical(&self) -> bool {
        self.superseded_by.is_none() && self.deleted_at.is_none()
    }

    pub fn curriculum_key(&self) -> CurriculumKey {
        CurriculumKey {
            curriculum_id: self.curriculum_id.clone(),
            gear_type_id: self.gear_type_id.clone(),
        }
    }
}

/// The (curriculum, gear type) pair an enrollment is unique on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CurriculumKey {
    pub curriculum_id: String,
    pub gear_type_id: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = student_curricula)]
pub struct NewStudentCurriculum<'a> {
    pub id: &'a str,
    pub person_id: &'a str,
    pub curriculum_id: &'a str,
    pub gear_type_id: &'a str,
    pub started_at: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = certificates)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Certificate {
    pub id: String,
    pub student_curriculum_id: String,
    pub cohort_allocation_id: Option<String>,
    pub issued_at: Option<String>,
    pub visible_from: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = certificates)]
pub struct NewCertificate<'a> {
    pub id: &'a str,
    pub student_curriculum_id: &'a str,
    pub cohort_allocation_id: Option<&'a str>,
    pub issued_at: Option<&'a str>,
    pub visible_from: Option<&'a str>,
    pub completed_at: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = student_completed_competencies)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CompletedCompetency {
    pub id: String,
    pub competency_id: String,
    pub student_curriculum_id: String,
    pub certificate_id: String,
    pub is_merge_conflict_duplicate: i32,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

impl CompletedCompetency {
    pub fn is_duplicate(&self) -> bool {
        self.is_merge_conflict_duplicate != 0
    }

    /// Live, unflagged rows are the ones progress counting sees
    pub fn counts_toward_progress(&self) -> bool {
        self.deleted_at.is_none() && !self.is_duplicate()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = student_completed_competencies)]
pub struct NewCompletedCompetency<'a> {
    pub id: &'a str,
    pub competency_id: &'a str,
    pub student_curriculum_id: &'a str,
    pub certificate_id: &'a str,
    pub created_at: &'a str,
}

// ============================================================================
// Cohort Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = cohort_allocations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CohortAllocation {
    pub id: String,
    pub cohort_id: String,
    pub actor_id: String,
    pub student_curriculum_id: Option<String>,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = cohort_allocations)]
pub struct NewCohortAllocation<'a> {
    pub id: &'a str,
    pub cohort_id: &'a str,
    pub actor_id: &'a str,
    pub student_curriculum_id: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = student_cohort_progress)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CohortProgress {
    pub id: String,
    pub cohort_allocation_id: String,
    pub competency_id: String,
    pub progress: f32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = student_cohort_progress)]
pub struct NewCohortProgress<'a> {
    pub id: &'a str,
    pub cohort_allocation_id: &'a str,
    pub competency_id: &'a str,
    pub progress: f32,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

// ============================================================================
// Constants
// ============================================================================

/// Actor roles
pub mod actor_types {
    pub const STUDENT: &str = "student";
    pub const INSTRUCTOR: &str = "instructor";
    pub const LOCATION_ADMIN: &str = "location_admin";
    pub const PVB: &str = "pvb";
    pub const SECRETARIAAT: &str = "secretariaat";

    pub const ALL: [&str; 5] = [STUDENT, INSTRUCTOR, LOCATION_ADMIN, PVB, SECRETARIAAT];

    pub fn is_valid(actor_type: &str) -> bool {
        ALL.contains(&actor_type)
    }
}
