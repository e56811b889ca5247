//! Enrollment (student curriculum) and completed-competency operations
//!
//! An enrollment is canonical while `superseded_by` is NULL. Completed
//! competencies hang off an enrollment and are backed by a certificate.

use diesel::prelude::*;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::diesel_schema::{student_completed_competencies, student_curricula};
use super::models::{
    current_timestamp, CompletedCompetency, NewCompletedCompetency, NewStudentCurriculum,
    StudentCurriculum,
};
use crate::error::MergeError;

// ============================================================================
// Input Types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateEnrollmentInput {
    #[serde(default)]
    pub id: Option<String>,
    pub person_id: String,
    pub curriculum_id: String,
    pub gear_type_id: String,
    #[serde(default)]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordCompletionInput {
    #[serde(default)]
    pub id: Option<String>,
    pub competency_id: String,
    pub student_curriculum_id: String,
    pub certificate_id: String,
    /// Defaults to now; imports pass the original completion time
    #[serde(default)]
    pub created_at: Option<String>,
}

// ============================================================================
// Enrollments
// ============================================================================

pub fn create_enrollment(
    conn: &mut SqliteConnection,
    input: &CreateEnrollmentInput,
) -> Result<StudentCurriculum, MergeError> {
    let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = current_timestamp();

    let new_enrollment = NewStudentCurriculum {
        id: &id,
        person_id: &input.person_id,
        curriculum_id: &input.curriculum_id,
        gear_type_id: &input.gear_type_id,
        started_at: input.started_at.as_deref(),
        created_at: &now,
    };

    diesel::insert_into(student_curricula::table)
        .values(&new_enrollment)
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to create enrollment", e))?;

    debug!("Created enrollment {} for person {}", id, input.person_id);

    get_enrollment(conn, &id)?.ok_or_else(|| MergeError::NotFound(format!("enrollment {}", id)))
}

pub fn get_enrollment(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<StudentCurriculum>, MergeError> {
    student_curricula::table
        .filter(student_curricula::id.eq(id))
        .first(conn)
        .optional()
        .map_err(|e| MergeError::db("Failed to get enrollment", e))
}

/// Every enrollment of a person, superseded and deleted ones included
pub fn list_enrollments_for_person(
    conn: &mut SqliteConnection,
    person_id: &str,
) -> Result<Vec<StudentCurriculum>, MergeError> {
    student_curricula::table
        .filter(student_curricula::person_id.eq(person_id))
        .order((student_curricula::created_at.asc(), student_curricula::id.asc()))
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list enrollments", e))
}

/// Enrollments that are "the" enrollment for their (curriculum, gear type)
pub fn canonical_enrollments_for_person(
    conn: &mut SqliteConnection,
    person_id: &str,
) -> Result<Vec<StudentCurriculum>, MergeError> {
    student_curricula::table
        .filter(student_curricula::person_id.eq(person_id))
        .filter(student_curricula::superseded_by.is_null())
        .filter(student_curricula::deleted_at.is_null())
        .order((student_curricula::curriculum_id.asc(), student_curricula::gear_type_id.asc()))
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list canonical enrollments", e))
}

pub fn reassign_enrollment(
    conn: &mut SqliteConnection,
    id: &str,
    person_id: &str,
) -> Result<(), MergeError> {
    diesel::update(student_curricula::table.filter(student_curricula::id.eq(id)))
        .set(student_curricula::person_id.eq(person_id))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to reassign enrollment", e))?;
    Ok(())
}

/// Mark an enrollment as collapsed into `canonical_id`, owned by `person_id`
pub fn supersede_enrollment(
    conn: &mut SqliteConnection,
    id: &str,
    canonical_id: &str,
    person_id: &str,
) -> Result<(), MergeError> {
    diesel::update(student_curricula::table.filter(student_curricula::id.eq(id)))
        .set((
            student_curricula::superseded_by.eq(Some(canonical_id)),
            student_curricula::person_id.eq(person_id),
        ))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to supersede enrollment", e))?;
    Ok(())
}

pub fn enrollment_count_for_person(
    conn: &mut SqliteConnection,
    person_id: &str,
) -> Result<i64, MergeError> {
    student_curricula::table
        .filter(student_curricula::person_id.eq(person_id))
        .count()
        .get_result(conn)
        .map_err(|e| MergeError::db("Count query failed", e))
}

// ============================================================================
// Completed Competencies
// ============================================================================

pub fn record_completed_competency(
    conn: &mut SqliteConnection,
    input: &RecordCompletionInput,
) -> Result<CompletedCompetency, MergeError> {
    let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = input.created_at.clone().unwrap_or_else(current_timestamp);

    let new_completion = NewCompletedCompetency {
        id: &id,
        competency_id: &input.competency_id,
        student_curriculum_id: &input.student_curriculum_id,
        certificate_id: &input.certificate_id,
        created_at: &created_at,
    };

    diesel::insert_into(student_completed_competencies::table)
        .values(&new_completion)
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to record completed competency", e))?;

    student_completed_competencies::table
        .filter(student_completed_competencies::id.eq(&id))
        .first(conn)
        .map_err(|e| MergeError::db("Failed to fetch completed competency", e))
}

/// Completed competencies of the given enrollments, oldest first
pub fn list_completed_for_enrollments(
    conn: &mut SqliteConnection,
    enrollment_ids: &[String],
) -> Result<Vec<CompletedCompetency>, MergeError> {
    if enrollment_ids.is_empty() {
        return Ok(vec![]);
    }

    student_completed_competencies::table
        .filter(student_completed_competencies::student_curriculum_id.eq_any(enrollment_ids))
        .order((
            student_completed_competencies::created_at.asc(),
            student_completed_competencies::id.asc(),
        ))
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list completed competencies", e))
}

/// Move every completed competency from one enrollment to another
pub fn remap_completed_competencies(
    conn: &mut SqliteConnection,
    from_enrollment_id: &str,
    to_enrollment_id: &str,
) -> Result<usize, MergeError> {
    diesel::update(
        student_completed_competencies::table
            .filter(student_completed_competencies::student_curriculum_id.eq(from_enrollment_id)),
    )
    .set(student_completed_competencies::student_curriculum_id.eq(to_enrollment_id))
    .execute(conn)
    .map_err(|e| MergeError::db("Failed to remap completed competencies", e))
}

pub fn flag_merge_conflict_duplicates(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> Result<usize, MergeError> {
    if ids.is_empty() {
        return Ok(0);
    }

    diesel::update(
        student_completed_competencies::table
            .filter(student_completed_competencies::id.eq_any(ids)),
    )
    .set(student_completed_competencies::is_merge_conflict_duplicate.eq(1))
    .execute(conn)
    .map_err(|e| MergeError::db("Failed to flag duplicate completions", e))
}

/// Competencies that count toward progress on an enrollment, each once
pub fn counted_competencies(
    conn: &mut SqliteConnection,
    enrollment_id: &str,
) -> Result<Vec<String>, MergeError> {
    student_completed_competencies::table
        .filter(student_completed_competencies::student_curriculum_id.eq(enrollment_id))
        .filter(student_completed_competencies::deleted_at.is_null())
        .filter(student_completed_competencies::is_merge_conflict_duplicate.eq(0))
        .select(student_completed_competencies::competency_id)
        .distinct()
        .order(student_completed_competencies::competency_id.asc())
        .load(conn)
        .map_err(|e| MergeError::db("Failed to count completed competencies", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::certificates::{create_certificate, CreateCertificateInput};
    use crate::db::persons::{create_person, CreatePersonInput};
    use crate::db::test_db;

    fn person(conn: &mut SqliteConnection, name: &str) -> String {
        create_person(conn, &CreatePersonInput {
            first_name: name.into(),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    fn enrollment(conn: &mut SqliteConnection, person_id: &str) -> StudentCurriculum {
        create_enrollment(conn, &CreateEnrollmentInput {
            id: None,
            person_id: person_id.into(),
            curriculum_id: "cwo-1".into(),
            gear_type_id: "optimist".into(),
            started_at: None,
        })
        .unwrap()
    }

    #[test]
    fn test_second_canonical_enrollment_rejected() {
        let mut conn = test_db();
        let p = person(&mut conn, "Anna");
        enrollment(&mut conn, &p);

        let duplicate = create_enrollment(&mut conn, &CreateEnrollmentInput {
            id: None,
            person_id: p.clone(),
            curriculum_id: "cwo-1".into(),
            gear_type_id: "optimist".into(),
            started_at: None,
        });
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_superseded_enrollment_leaves_canonical_set() {
        let mut conn = test_db();
        let a = person(&mut conn, "Anna");
        let b = person(&mut conn, "Anna B");
        let keep = enrollment(&mut conn, &a);
        let absorbed = enrollment(&mut conn, &b);

        supersede_enrollment(&mut conn, &absorbed.id, &keep.id, &a).unwrap();

        let canonical = canonical_enrollments_for_person(&mut conn, &a).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].id, keep.id);
        assert_eq!(enrollment_count_for_person(&mut conn, &a).unwrap(), 2);

        let absorbed = get_enrollment(&mut conn, &absorbed.id).unwrap().unwrap();
        assert_eq!(absorbed.superseded_by.as_deref(), Some(keep.id.as_str()));
        assert!(!absorbed.is_canonical());
    }

    #[test]
    fn test_flagged_rows_do_not_count() {
        let mut conn = test_db();
        let p = person(&mut conn, "Anna");
        let e = enrollment(&mut conn, &p);
        let cert = create_certificate(&mut conn, &CreateCertificateInput {
            student_curriculum_id: e.id.clone(),
            ..Default::default()
        })
        .unwrap();

        let mut ids = vec![];
        for competency in ["a", "a", "b"] {
            let row = record_completed_competency(&mut conn, &RecordCompletionInput {
                id: None,
                competency_id: competency.into(),
                student_curriculum_id: e.id.clone(),
                certificate_id: cert.id.clone(),
                created_at: None,
            })
            .unwrap();
            ids.push(row.id);
        }

        flag_merge_conflict_duplicates(&mut conn, &ids[1..2]).unwrap();

        assert_eq!(counted_competencies(&mut conn, &e.id).unwrap(), vec!["a", "b"]);
        let rows = list_completed_for_enrollments(&mut conn, &[e.id.clone()]).unwrap();
        assert_eq!(rows.iter().filter(|r| r.is_duplicate()).count(), 1);
    }
}
