//! Post-merge verification
//!
//! Re-reads the merged state inside the transaction and checks that nothing
//! was lost or duplicated. Any failure is an [`MergeError::IntegrityViolation`]
//! and rolls the whole merge back.

use std::collections::{BTreeMap, BTreeSet};

use super::allocations::find_collisions;
use super::canonicalize::{ActorMapping, Canonicalization, EnrollmentMapping};
use super::policy::Side;
use super::resolver::MergeSnapshot;
use super::unit_of_work::UnitOfWork;
use crate::db::models::CurriculumKey;
use crate::db::{certificates, cohorts, curricula, persons};
use crate::error::{MergeError, MergeResult};

fn violation(message: String) -> MergeError {
    MergeError::IntegrityViolation(message)
}

pub fn verify_merge(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    canonical: &Canonicalization,
) -> MergeResult<()> {
    verify_certificates(uow, snapshot, &canonical.enrollments)?;
    verify_enrollments(uow, snapshot)?;
    verify_completions(uow, snapshot, &canonical.enrollments)?;
    verify_allocations(uow, snapshot)?;
    verify_progress(uow, snapshot, &canonical.actors)?;

    if persons::get_person(uow.conn(), &snapshot.source.id)?.is_some() {
        return Err(violation(format!("person {} still exists", snapshot.source.id)));
    }

    Ok(())
}

/// Every certificate survives and hangs off its canonical enrollment
fn verify_certificates(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    enrollments: &EnrollmentMapping,
) -> MergeResult<()> {
    for original in &snapshot.certificates {
        let current = certificates::get_certificate(uow.conn(), &original.id)?
            .ok_or_else(|| violation(format!("certificate {} was lost", original.id)))?;

        let expected = enrollments.canonical_of(&original.student_curriculum_id);
        if current.student_curriculum_id != expected {
            return Err(violation(format!(
                "certificate {} belongs to {}, expected {}",
                current.id, current.student_curriculum_id, expected
            )));
        }
    }
    Ok(())
}

/// One canonical enrollment per key, covering every key either person had
fn verify_enrollments(uow: &mut UnitOfWork<'_>, snapshot: &MergeSnapshot) -> MergeResult<()> {
    let current = curricula::canonical_enrollments_for_person(uow.conn(), &snapshot.target.id)?;

    let mut keys: BTreeSet<CurriculumKey> = BTreeSet::new();
    for enrollment in &current {
        if !keys.insert(enrollment.curriculum_key()) {
            return Err(violation(format!(
                "two canonical enrollments for {:?}",
                enrollment.curriculum_key()
            )));
        }
    }

    let before = snapshot
        .source_enrollments
        .iter()
        .chain(snapshot.target_enrollments.iter())
        .filter(|e| e.is_canonical())
        .map(|e| e.curriculum_key());
    for key in before {
        if !keys.contains(&key) {
            return Err(violation(format!("no canonical enrollment left for {:?}", key)));
        }
    }
    Ok(())
}

/// Competencies both identities had counted are counted exactly once
fn verify_completions(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    enrollments: &EnrollmentMapping,
) -> MergeResult<()> {
    let counted_before: BTreeMap<&str, Side> = snapshot
        .completions
        .iter()
        .filter(|c| c.counts_toward_progress())
        .filter_map(|c| {
            snapshot
                .enrollment_side(&c.student_curriculum_id)
                .map(|side| (c.id.as_str(), side))
        })
        .collect();

    let canonical_ids: Vec<String> = enrollments
        .canonical_ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    let rows = curricula::list_completed_for_enrollments(uow.conn(), &canonical_ids)?;

    let mut groups: BTreeMap<(&str, &str), (BTreeSet<Side>, usize)> = BTreeMap::new();
    for row in &rows {
        let (sides, counted) = groups
            .entry((row.student_curriculum_id.as_str(), row.competency_id.as_str()))
            .or_default();
        if let Some(side) = counted_before.get(row.id.as_str()) {
            sides.insert(*side);
        }
        if row.counts_toward_progress() {
            *counted += 1;
        }
    }

    for ((enrollment_id, competency_id), (sides, counted)) in groups {
        if sides.len() == 2 && counted != 1 {
            return Err(violation(format!(
                "competency {} on enrollment {} counted {} times",
                competency_id, enrollment_id, counted
            )));
        }
    }
    Ok(())
}

/// One live allocation per cohort per actor, one certificate per allocation
fn verify_allocations(uow: &mut UnitOfWork<'_>, snapshot: &MergeSnapshot) -> MergeResult<()> {
    let actor_ids: Vec<String> = persons::list_actors_for_person(uow.conn(), &snapshot.target.id)?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let allocations = cohorts::list_allocations_for_actors(uow.conn(), &actor_ids)?;

    let mut live = BTreeSet::new();
    for allocation in allocations.iter().filter(|a| a.deleted_at.is_none()) {
        if !live.insert((allocation.cohort_id.as_str(), allocation.actor_id.as_str())) {
            return Err(violation(format!(
                "actor {} has two live allocations in cohort {}",
                allocation.actor_id, allocation.cohort_id
            )));
        }
    }

    let allocation_ids: Vec<String> = allocations.iter().map(|a| a.id.clone()).collect();
    if cohorts::duplicate_progress_pairs(uow.conn(), &allocation_ids)? > 0 {
        return Err(violation("duplicate progress rows after merge".into()));
    }

    let mut linked = BTreeSet::new();
    for certificate in certificates::list_certificates_for_allocations(uow.conn(), &allocation_ids)? {
        if let Some(allocation_id) = certificate.cohort_allocation_id {
            if !linked.insert(allocation_id.clone()) {
                return Err(violation(format!(
                    "allocation {} carries more than one certificate",
                    allocation_id
                )));
            }
        }
    }
    Ok(())
}

/// Each surviving allocation of a collision tracks every competency either
/// original tracked, once
fn verify_progress(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    actors: &ActorMapping,
) -> MergeResult<()> {
    for collision in find_collisions(snapshot, actors) {
        let mut live = vec![];
        for original in [collision.target, collision.source] {
            let current = cohorts::get_allocation(uow.conn(), &original.id)?
                .ok_or_else(|| violation(format!("allocation {} was lost", original.id)))?;
            if current.deleted_at.is_none() {
                live.push(current);
            }
        }
        let survivor = match live.as_slice() {
            [survivor] => survivor,
            _ => {
                return Err(violation(format!(
                    "cohort {} has {} live allocations for actor {}",
                    collision.source.cohort_id,
                    live.len(),
                    collision.canonical_actor
                )))
            }
        };

        let expected: BTreeSet<&str> = snapshot
            .progress_for_allocation(&collision.target.id)
            .into_keys()
            .chain(snapshot.progress_for_allocation(&collision.source.id).into_keys())
            .collect();
        let rows = cohorts::list_progress_for_allocations(uow.conn(), &[survivor.id.clone()])?;
        let tracked: BTreeSet<&str> = rows.iter().map(|p| p.competency_id.as_str()).collect();

        if tracked != expected {
            return Err(violation(format!(
                "allocation {} tracks {:?}, expected {:?}",
                survivor.id, tracked, expected
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::diesel_schema::certificates as certificates_table;
    use crate::db::models::actor_types;
    use crate::db::{
        test_db, CreateActorInput, CreateAllocationInput, CreateCertificateInput,
        CreateEnrollmentInput, CreatePersonInput, UpsertProgressInput,
    };
    use crate::merge::canonicalize::canonicalize;
    use crate::merge::policy::TargetWins;
    use crate::merge::resolver::resolve;
    use crate::merge::MergeInput;
    use diesel::prelude::*;

    #[test]
    fn test_lost_certificate_is_a_violation() {
        let mut conn = test_db();
        let source = persons::create_person(&mut conn, &CreatePersonInput {
            first_name: "Sanne".into(),
            ..Default::default()
        })
        .unwrap();
        let target = persons::create_person(&mut conn, &CreatePersonInput {
            first_name: "Sanne".into(),
            ..Default::default()
        })
        .unwrap();
        let enrollment = curricula::create_enrollment(&mut conn, &CreateEnrollmentInput {
            person_id: source.id.clone(),
            curriculum_id: "cur-1".into(),
            gear_type_id: "gear-1".into(),
            ..Default::default()
        })
        .unwrap();
        let certificate = certificates::create_certificate(&mut conn, &CreateCertificateInput {
            student_curriculum_id: enrollment.id.clone(),
            ..Default::default()
        })
        .unwrap();

        let mut uow = UnitOfWork::new(&mut conn);
        let snapshot = resolve(&mut uow, &MergeInput::new(&source.id, &target.id)).unwrap();
        diesel::delete(certificates_table::table.filter(certificates_table::id.eq(&certificate.id)))
            .execute(uow.conn())
            .unwrap();

        let err = verify_merge(&mut uow, &snapshot, &Canonicalization::default()).unwrap_err();
        match err {
            MergeError::IntegrityViolation(msg) => assert!(msg.contains("was lost")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_canonical_key_is_a_violation() {
        let mut conn = test_db();
        let source = persons::create_person(&mut conn, &CreatePersonInput {
            first_name: "Joost".into(),
            ..Default::default()
        })
        .unwrap();
        let target = persons::create_person(&mut conn, &CreatePersonInput {
            first_name: "Joost".into(),
            ..Default::default()
        })
        .unwrap();
        curricula::create_enrollment(&mut conn, &CreateEnrollmentInput {
            person_id: source.id.clone(),
            curriculum_id: "cur-1".into(),
            gear_type_id: "gear-1".into(),
            ..Default::default()
        })
        .unwrap();

        // Nothing moved: the source's key is missing on the target
        let mut uow = UnitOfWork::new(&mut conn);
        let snapshot = resolve(&mut uow, &MergeInput::new(&source.id, &target.id)).unwrap();
        let err = verify_merge(&mut uow, &snapshot, &Canonicalization::default()).unwrap_err();
        assert!(matches!(err, MergeError::IntegrityViolation(_)));
    }

    #[test]
    fn test_progress_left_on_retired_allocation_is_a_violation() {
        let mut conn = test_db();
        let actor_of = |conn: &mut diesel::SqliteConnection| {
            let person = persons::create_person(conn, &CreatePersonInput {
                first_name: "Vera".into(),
                ..Default::default()
            })
            .unwrap();
            let actor = persons::create_actor(conn, &CreateActorInput {
                person_id: person.id.clone(),
                location_id: "loc-1".into(),
                actor_type: actor_types::STUDENT.into(),
                ..Default::default()
            })
            .unwrap();
            (person.id, actor.id)
        };
        let (target, target_actor) = actor_of(&mut conn);
        let (source, source_actor) = actor_of(&mut conn);

        cohorts::create_allocation(&mut conn, &CreateAllocationInput {
            cohort_id: "cohort-1".into(),
            actor_id: target_actor.clone(),
            ..Default::default()
        })
        .unwrap();
        let incoming = cohorts::create_allocation(&mut conn, &CreateAllocationInput {
            cohort_id: "cohort-1".into(),
            actor_id: source_actor,
            ..Default::default()
        })
        .unwrap();
        cohorts::upsert_progress(&mut conn, &UpsertProgressInput {
            cohort_allocation_id: incoming.id.clone(),
            competency_id: "knots".into(),
            progress: 50.0,
        })
        .unwrap();

        let mut uow = UnitOfWork::new(&mut conn);
        let snapshot = resolve(&mut uow, &MergeInput::new(&source, &target)).unwrap();
        let canonical = canonicalize(&mut uow, &snapshot, &TargetWins).unwrap();

        // Retired without carrying its progress over
        cohorts::retire_allocation(uow.conn(), &incoming.id, &target_actor).unwrap();

        let err = verify_progress(&mut uow, &snapshot, &canonical.actors).unwrap_err();
        match err {
            MergeError::IntegrityViolation(msg) => assert!(msg.contains("tracks")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
