//! Cohort allocation and cohort progress operations

use diesel::prelude::*;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::diesel_schema::{cohort_allocations, student_cohort_progress};
use super::models::{
    current_timestamp, CohortAllocation, CohortProgress, NewCohortAllocation, NewCohortProgress,
};
use crate::error::MergeError;

// ============================================================================
// Input Types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateAllocationInput {
    #[serde(default)]
    pub id: Option<String>,
    pub cohort_id: String,
    pub actor_id: String,
    #[serde(default)]
    pub student_curriculum_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertProgressInput {
    pub cohort_allocation_id: String,
    pub competency_id: String,
    pub progress: f32,
}

// ============================================================================
// Allocations
// ============================================================================

pub fn create_allocation(
    conn: &mut SqliteConnection,
    input: &CreateAllocationInput,
) -> Result<CohortAllocation, MergeError> {
    let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = current_timestamp();

    let new_allocation = NewCohortAllocation {
        id: &id,
        cohort_id: &input.cohort_id,
        actor_id: &input.actor_id,
        student_curriculum_id: input.student_curriculum_id.as_deref(),
        created_at: &now,
    };

    diesel::insert_into(cohort_allocations::table)
        .values(&new_allocation)
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to create allocation", e))?;

    debug!("Allocated actor {} to cohort {}", input.actor_id, input.cohort_id);

    get_allocation(conn, &id)?.ok_or_else(|| MergeError::NotFound(format!("allocation {}", id)))
}

pub fn get_allocation(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<CohortAllocation>, MergeError> {
    cohort_allocations::table
        .filter(cohort_allocations::id.eq(id))
        .first(conn)
        .optional()
        .map_err(|e| MergeError::db("Failed to get allocation", e))
}

/// Allocations of the given actors, soft-deleted ones included
pub fn list_allocations_for_actors(
    conn: &mut SqliteConnection,
    actor_ids: &[String],
) -> Result<Vec<CohortAllocation>, MergeError> {
    if actor_ids.is_empty() {
        return Ok(vec![]);
    }

    cohort_allocations::table
        .filter(cohort_allocations::actor_id.eq_any(actor_ids))
        .order((cohort_allocations::created_at.asc(), cohort_allocations::id.asc()))
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list allocations", e))
}

/// Live allocations in a cohort for one actor
pub fn live_allocations_in_cohort(
    conn: &mut SqliteConnection,
    cohort_id: &str,
    actor_id: &str,
) -> Result<Vec<CohortAllocation>, MergeError> {
    cohort_allocations::table
        .filter(cohort_allocations::cohort_id.eq(cohort_id))
        .filter(cohort_allocations::actor_id.eq(actor_id))
        .filter(cohort_allocations::deleted_at.is_null())
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list cohort allocations", e))
}

pub fn reassign_allocation_actor(
    conn: &mut SqliteConnection,
    allocation_id: &str,
    actor_id: &str,
) -> Result<(), MergeError> {
    diesel::update(cohort_allocations::table.filter(cohort_allocations::id.eq(allocation_id)))
        .set(cohort_allocations::actor_id.eq(actor_id))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to reassign allocation", e))?;
    Ok(())
}

/// Soft-delete an allocation and hand it to `actor_id` so the original
/// actor row can be removed
pub fn retire_allocation(
    conn: &mut SqliteConnection,
    allocation_id: &str,
    actor_id: &str,
) -> Result<(), MergeError> {
    diesel::update(cohort_allocations::table.filter(cohort_allocations::id.eq(allocation_id)))
        .set((
            cohort_allocations::deleted_at.eq(Some(current_timestamp())),
            cohort_allocations::actor_id.eq(actor_id),
        ))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to retire allocation", e))?;
    Ok(())
}

pub fn set_allocation_enrollment(
    conn: &mut SqliteConnection,
    allocation_id: &str,
    enrollment_id: Option<&str>,
) -> Result<(), MergeError> {
    diesel::update(cohort_allocations::table.filter(cohort_allocations::id.eq(allocation_id)))
        .set(cohort_allocations::student_curriculum_id.eq(enrollment_id))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to set allocation enrollment", e))?;
    Ok(())
}

/// Repoint every allocation referencing one enrollment to another
pub fn remap_allocation_enrollments(
    conn: &mut SqliteConnection,
    from_enrollment_id: &str,
    to_enrollment_id: &str,
) -> Result<usize, MergeError> {
    diesel::update(
        cohort_allocations::table
            .filter(cohort_allocations::student_curriculum_id.eq(from_enrollment_id)),
    )
    .set(cohort_allocations::student_curriculum_id.eq(to_enrollment_id))
    .execute(conn)
    .map_err(|e| MergeError::db("Failed to remap allocation enrollments", e))
}

// ============================================================================
// Progress
// ============================================================================

/// Insert or overwrite the progress of one competency on an allocation
pub fn upsert_progress(
    conn: &mut SqliteConnection,
    input: &UpsertProgressInput,
) -> Result<CohortProgress, MergeError> {
    let id = Uuid::new_v4().to_string();
    let now = current_timestamp();

    let new_progress = NewCohortProgress {
        id: &id,
        cohort_allocation_id: &input.cohort_allocation_id,
        competency_id: &input.competency_id,
        progress: input.progress,
        created_at: &now,
        updated_at: &now,
    };

    diesel::insert_into(student_cohort_progress::table)
        .values(&new_progress)
        .on_conflict((
            student_cohort_progress::cohort_allocation_id,
            student_cohort_progress::competency_id,
        ))
        .do_update()
        .set((
            student_cohort_progress::progress.eq(input.progress),
            student_cohort_progress::updated_at.eq(&now),
        ))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to upsert progress", e))?;

    student_cohort_progress::table
        .filter(student_cohort_progress::cohort_allocation_id.eq(&input.cohort_allocation_id))
        .filter(student_cohort_progress::competency_id.eq(&input.competency_id))
        .first(conn)
        .map_err(|e| MergeError::db("Failed to fetch progress", e))
}

pub fn list_progress_for_allocations(
    conn: &mut SqliteConnection,
    allocation_ids: &[String],
) -> Result<Vec<CohortProgress>, MergeError> {
    if allocation_ids.is_empty() {
        return Ok(vec![]);
    }

    student_cohort_progress::table
        .filter(student_cohort_progress::cohort_allocation_id.eq_any(allocation_ids))
        .order((
            student_cohort_progress::cohort_allocation_id.asc(),
            student_cohort_progress::competency_id.asc(),
        ))
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list progress", e))
}

pub fn move_progress(
    conn: &mut SqliteConnection,
    progress_id: &str,
    allocation_id: &str,
) -> Result<(), MergeError> {
    diesel::update(student_cohort_progress::table.filter(student_cohort_progress::id.eq(progress_id)))
        .set((
            student_cohort_progress::cohort_allocation_id.eq(allocation_id),
            student_cohort_progress::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to move progress", e))?;
    Ok(())
}

pub fn set_progress_value(
    conn: &mut SqliteConnection,
    progress_id: &str,
    progress: f32,
) -> Result<(), MergeError> {
    diesel::update(student_cohort_progress::table.filter(student_cohort_progress::id.eq(progress_id)))
        .set((
            student_cohort_progress::progress.eq(progress),
            student_cohort_progress::updated_at.eq(current_timestamp()),
        ))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to set progress", e))?;
    Ok(())
}

/// Number of (allocation, competency) pairs among `allocation_ids` that
/// occur more than once
pub fn duplicate_progress_pairs(
    conn: &mut SqliteConnection,
    allocation_ids: &[String],
) -> Result<i64, MergeError> {
    use diesel::dsl::count_star;

    if allocation_ids.is_empty() {
        return Ok(0);
    }

    let counts: Vec<(String, String, i64)> = student_cohort_progress::table
        .filter(student_cohort_progress::cohort_allocation_id.eq_any(allocation_ids))
        .group_by((
            student_cohort_progress::cohort_allocation_id,
            student_cohort_progress::competency_id,
        ))
        .select((
            student_cohort_progress::cohort_allocation_id,
            student_cohort_progress::competency_id,
            count_star(),
        ))
        .load(conn)
        .map_err(|e| MergeError::db("Failed to check progress pairs", e))?;

    Ok(counts.iter().filter(|(_, _, n)| *n > 1).count() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::persons::{create_actor, create_person, CreateActorInput, CreatePersonInput};
    use crate::db::test_db;

    fn actor(conn: &mut SqliteConnection) -> String {
        let p = create_person(conn, &CreatePersonInput {
            first_name: "Ruben".into(),
            ..Default::default()
        })
        .unwrap();
        create_actor(conn, &CreateActorInput {
            id: None,
            person_id: p.id,
            location_id: "loc-1".into(),
            actor_type: "student".into(),
        })
        .unwrap()
        .id
    }

    #[test]
    fn test_upsert_overwrites_progress() {
        let mut conn = test_db();
        let actor_id = actor(&mut conn);
        let allocation = create_allocation(&mut conn, &CreateAllocationInput {
            id: None,
            cohort_id: "summer-week-1".into(),
            actor_id,
            student_curriculum_id: None,
        })
        .unwrap();

        for progress in [40.0, 100.0] {
            upsert_progress(&mut conn, &UpsertProgressInput {
                cohort_allocation_id: allocation.id.clone(),
                competency_id: "knots".into(),
                progress,
            })
            .unwrap();
        }

        let rows = list_progress_for_allocations(&mut conn, &[allocation.id.clone()]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].progress, 100.0);
        assert_eq!(duplicate_progress_pairs(&mut conn, &[allocation.id.clone()]).unwrap(), 0);
        assert_eq!(duplicate_progress_pairs(&mut conn, &[]).unwrap(), 0);
    }

    #[test]
    fn test_retired_allocation_frees_cohort_slot() {
        let mut conn = test_db();
        let actor_id = actor(&mut conn);
        let first = create_allocation(&mut conn, &CreateAllocationInput {
            id: None,
            cohort_id: "summer-week-1".into(),
            actor_id: actor_id.clone(),
            student_curriculum_id: None,
        })
        .unwrap();

        retire_allocation(&mut conn, &first.id, &actor_id).unwrap();

        create_allocation(&mut conn, &CreateAllocationInput {
            id: None,
            cohort_id: "summer-week-1".into(),
            actor_id: actor_id.clone(),
            student_curriculum_id: None,
        })
        .unwrap();

        let live = live_allocations_in_cohort(&mut conn, "summer-week-1", &actor_id).unwrap();
        assert_eq!(live.len(), 1);
        assert_ne!(live[0].id, first.id);
    }
}
