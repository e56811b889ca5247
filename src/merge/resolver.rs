//! Identity resolver
//!
//! Validates the request, locks both persons and loads every row that
//! references either of them. The resulting [`MergeSnapshot`] is the
//! pre-merge picture every later step reasons about.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use super::policy::Side;
use super::unit_of_work::UnitOfWork;
use super::MergeInput;
use crate::db::models::{
    Actor, Certificate, CohortAllocation, CohortProgress, CompletedCompetency, Person,
    StudentCurriculum,
};
use crate::db::{certificates, cohorts, curricula, persons};
use crate::error::{MergeError, MergeResult};

/// Everything both identities own, as it was when the merge started
#[derive(Debug, Clone)]
pub struct MergeSnapshot {
    pub source: Person,
    pub target: Person,
    pub source_actors: Vec<Actor>,
    pub target_actors: Vec<Actor>,
    pub source_enrollments: Vec<StudentCurriculum>,
    pub target_enrollments: Vec<StudentCurriculum>,
    pub certificates: Vec<Certificate>,
    pub completions: Vec<CompletedCompetency>,
    pub allocations: Vec<CohortAllocation>,
    pub progress: Vec<CohortProgress>,
}

impl MergeSnapshot {
    pub fn enrollment_side(&self, enrollment_id: &str) -> Option<Side> {
        if self.target_enrollments.iter().any(|e| e.id == enrollment_id) {
            Some(Side::Target)
        } else if self.source_enrollments.iter().any(|e| e.id == enrollment_id) {
            Some(Side::Source)
        } else {
            None
        }
    }

    pub fn actor_side(&self, actor_id: &str) -> Option<Side> {
        if self.target_actors.iter().any(|a| a.id == actor_id) {
            Some(Side::Target)
        } else if self.source_actors.iter().any(|a| a.id == actor_id) {
            Some(Side::Source)
        } else {
            None
        }
    }

    pub fn allocations_of(&self, side: Side) -> impl Iterator<Item = &CohortAllocation> {
        self.allocations
            .iter()
            .filter(move |a| self.actor_side(&a.actor_id) == Some(side))
    }

    /// The certificate linked to an allocation, if any
    pub fn certificate_for_allocation(&self, allocation_id: &str) -> Option<&Certificate> {
        self.certificates
            .iter()
            .find(|c| c.cohort_allocation_id.as_deref() == Some(allocation_id))
    }

    /// Progress rows of an allocation keyed by competency
    pub fn progress_for_allocation(&self, allocation_id: &str) -> BTreeMap<&str, &CohortProgress> {
        self.progress
            .iter()
            .filter(|p| p.cohort_allocation_id == allocation_id)
            .map(|p| (p.competency_id.as_str(), p))
            .collect()
    }
}

/// Lock both persons and load the snapshot
pub fn resolve(uow: &mut UnitOfWork<'_>, input: &MergeInput) -> MergeResult<MergeSnapshot> {
    input.validate()?;
    let conn = uow.conn();

    let source = persons::get_live_person(conn, &input.person_id)?;
    let target = persons::get_live_person(conn, &input.target_person_id)?;

    // Stable lock order so two merges over the same pair queue the same way
    let mut lock_order = [source.id.as_str(), target.id.as_str()];
    lock_order.sort_unstable();
    for person_id in lock_order {
        persons::touch_person(conn, person_id)?;
    }

    if let Some(user_id) = &source.user_id {
        return Err(MergeError::InvalidMerge(format!(
            "person {} is linked to account {} and cannot be merged away",
            source.id, user_id
        )));
    }

    let source_actors = persons::list_actors_for_person(conn, &source.id)?;
    let target_actors = persons::list_actors_for_person(conn, &target.id)?;
    let source_enrollments = curricula::list_enrollments_for_person(conn, &source.id)?;
    let target_enrollments = curricula::list_enrollments_for_person(conn, &target.id)?;

    let enrollment_ids: Vec<String> = source_enrollments
        .iter()
        .chain(target_enrollments.iter())
        .map(|e| e.id.clone())
        .collect();
    let actor_ids: Vec<String> = source_actors
        .iter()
        .chain(target_actors.iter())
        .map(|a| a.id.clone())
        .collect();

    let allocations = cohorts::list_allocations_for_actors(conn, &actor_ids)?;
    let allocation_ids: Vec<String> = allocations.iter().map(|a| a.id.clone()).collect();

    let mut certificates = certificates::list_certificates_for_enrollments(conn, &enrollment_ids)?;
    let mut seen: HashSet<String> = certificates.iter().map(|c| c.id.clone()).collect();
    for certificate in certificates::list_certificates_for_allocations(conn, &allocation_ids)? {
        if seen.insert(certificate.id.clone()) {
            certificates.push(certificate);
        }
    }

    let completions = curricula::list_completed_for_enrollments(conn, &enrollment_ids)?;
    let progress = cohorts::list_progress_for_allocations(conn, &allocation_ids)?;

    let snapshot = MergeSnapshot {
        source,
        target,
        source_actors,
        target_actors,
        source_enrollments,
        target_enrollments,
        certificates,
        completions,
        allocations,
        progress,
    };

    check_reconcilable(&snapshot)?;

    debug!(
        "Resolved merge {} -> {}: {} enrollments, {} certificates, {} allocations",
        snapshot.source.id,
        snapshot.target.id,
        enrollment_ids.len(),
        snapshot.certificates.len(),
        snapshot.allocations.len()
    );

    Ok(snapshot)
}

/// Reject references into a third identity; the merge would have to touch
/// data it did not lock
fn check_reconcilable(snapshot: &MergeSnapshot) -> MergeResult<()> {
    for allocation in &snapshot.allocations {
        if let Some(enrollment_id) = &allocation.student_curriculum_id {
            if snapshot.enrollment_side(enrollment_id).is_none() {
                return Err(MergeError::InvalidMerge(format!(
                    "allocation {} references enrollment {} of another person",
                    allocation.id, enrollment_id
                )));
            }
        }
    }

    for certificate in &snapshot.certificates {
        if snapshot.enrollment_side(&certificate.student_curriculum_id).is_none() {
            return Err(MergeError::InvalidMerge(format!(
                "certificate {} on a cohort allocation of this person belongs to enrollment {} of another person",
                certificate.id, certificate.student_curriculum_id
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::db::CreatePersonInput;

    fn person(conn: &mut diesel::SqliteConnection, user_id: Option<&str>) -> String {
        persons::create_person(conn, &CreatePersonInput {
            first_name: "Pim".into(),
            user_id: user_id.map(str::to_string),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    #[test]
    fn test_same_person_rejected() {
        let mut conn = test_db();
        let p = person(&mut conn, None);
        let mut uow = UnitOfWork::new(&mut conn);

        let result = resolve(&mut uow, &MergeInput::new(&p, &p));
        assert!(matches!(result, Err(MergeError::InvalidMerge(_))));
    }

    #[test]
    fn test_missing_person_not_found() {
        let mut conn = test_db();
        let p = person(&mut conn, None);
        let mut uow = UnitOfWork::new(&mut conn);

        let result = resolve(&mut uow, &MergeInput::new("ghost", &p));
        assert!(matches!(result, Err(MergeError::NotFound(_))));
    }

    #[test]
    fn test_authenticated_source_rejected() {
        let mut conn = test_db();
        let source = person(&mut conn, Some("user-1"));
        let target = person(&mut conn, None);
        let mut uow = UnitOfWork::new(&mut conn);

        let result = resolve(&mut uow, &MergeInput::new(&source, &target));
        assert!(matches!(result, Err(MergeError::InvalidMerge(_))));
    }

    #[test]
    fn test_authenticated_target_allowed() {
        let mut conn = test_db();
        let source = person(&mut conn, None);
        let target = person(&mut conn, Some("user-1"));
        let mut uow = UnitOfWork::new(&mut conn);

        let snapshot = resolve(&mut uow, &MergeInput::new(&source, &target)).unwrap();
        assert_eq!(snapshot.target.user_id.as_deref(), Some("user-1"));
        assert!(snapshot.certificates.is_empty());
    }
}
