//! Cohort allocation reconciler
//!
//! Two allocations collide when a live source allocation and a live target
//! allocation sit in the same cohort under actors that collapse into the
//! same canonical actor. One survives, the other is soft-deleted; the
//! certificate links and progress rows of both are folded into the survivor.

use tracing::debug;

use super::canonicalize::{ActorMapping, Canonicalization};
use super::policy::{CertificateLinks, CollisionPolicy, Side};
use super::resolver::MergeSnapshot;
use super::unit_of_work::UnitOfWork;
use crate::db::models::{Certificate, CohortAllocation};
use crate::db::{certificates, cohorts};
use crate::error::{MergeError, MergeResult};

#[derive(Debug, Clone)]
pub struct AllocationCollision<'a> {
    pub target: &'a CohortAllocation,
    pub source: &'a CohortAllocation,
    pub canonical_actor: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub allocations_removed: usize,
    pub certificates_unlinked: usize,
    pub certificates_moved: usize,
    pub progress_moved: usize,
    pub progress_dropped: usize,
}

/// Pair up colliding allocations using the pre-merge snapshot
pub fn find_collisions<'a>(
    snapshot: &'a MergeSnapshot,
    actors: &ActorMapping,
) -> Vec<AllocationCollision<'a>> {
    let mut collisions = vec![];

    for source in snapshot.allocations_of(Side::Source).filter(|a| a.deleted_at.is_none()) {
        let canonical_actor = actors.canonical_of(&source.actor_id);
        if canonical_actor == source.actor_id {
            continue;
        }
        let target = snapshot.allocations_of(Side::Target).find(|t| {
            t.deleted_at.is_none() && t.actor_id == canonical_actor && t.cohort_id == source.cohort_id
        });
        if let Some(target) = target {
            collisions.push(AllocationCollision {
                target,
                source,
                canonical_actor: canonical_actor.to_string(),
            });
        }
    }

    collisions
}

pub fn reconcile_allocations(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    canonical: &Canonicalization,
    policy: &dyn CollisionPolicy,
) -> MergeResult<AllocationOutcome> {
    let mut outcome = AllocationOutcome::default();

    for collision in find_collisions(snapshot, &canonical.actors) {
        let (survivor, removed) = match policy.allocation_survivor(collision.target, collision.source) {
            Side::Target => (collision.target, collision.source),
            Side::Source => (collision.source, collision.target),
        };

        // Retire the loser first so the (cohort, actor) slot is free
        cohorts::retire_allocation(uow.conn(), &removed.id, &collision.canonical_actor)?;
        if survivor.actor_id != collision.canonical_actor {
            cohorts::reassign_allocation_actor(uow.conn(), &survivor.id, &collision.canonical_actor)?;
        }
        outcome.allocations_removed += 1;

        relink_allocation_certificates(uow, snapshot, survivor, removed, policy, &mut outcome)?;

        if survivor.student_curriculum_id.is_none() {
            if let Some(enrollment_id) = &removed.student_curriculum_id {
                let canonical_enrollment = canonical.enrollments.canonical_of(enrollment_id);
                cohorts::set_allocation_enrollment(uow.conn(), &survivor.id, Some(canonical_enrollment))?;
            }
        }

        merge_progress(uow, snapshot, survivor, removed, policy, &mut outcome)?;

        debug!(
            "Cohort {}: allocation {} survives, {} removed",
            survivor.cohort_id, survivor.id, removed.id
        );
    }

    Ok(outcome)
}

fn relink_allocation_certificates(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    survivor: &CohortAllocation,
    removed: &CohortAllocation,
    policy: &dyn CollisionPolicy,
    outcome: &mut AllocationOutcome,
) -> MergeResult<()> {
    let survivor_cert = snapshot.certificate_for_allocation(&survivor.id);
    let removed_cert = snapshot.certificate_for_allocation(&removed.id);

    let links = policy.allocation_certificates(survivor_cert, removed_cert);
    check_links(policy, &links, survivor_cert, removed_cert)?;

    // Unlink before linking: an allocation carries at most one certificate
    for certificate_id in &links.unlink {
        certificates::set_cohort_allocation(uow.conn(), certificate_id, None)?;
        outcome.certificates_unlinked += 1;
    }

    if let Some(keep) = &links.keep {
        if survivor_cert.map(|c| &c.id) != Some(keep) {
            certificates::set_cohort_allocation(uow.conn(), keep, Some(&survivor.id))?;
            outcome.certificates_moved += 1;
        }
    }

    Ok(())
}

/// Every certificate of the pair must end up either kept or unlinked, and
/// the policy may only name certificates it was given
fn check_links(
    policy: &dyn CollisionPolicy,
    links: &CertificateLinks,
    survivor_cert: Option<&Certificate>,
    removed_cert: Option<&Certificate>,
) -> MergeResult<()> {
    let given: Vec<&str> = survivor_cert
        .into_iter()
        .chain(removed_cert)
        .map(|c| c.id.as_str())
        .collect();

    let named: Vec<&str> = links
        .keep
        .iter()
        .chain(links.unlink.iter())
        .map(String::as_str)
        .collect();

    let unknown = named.iter().any(|id| !given.contains(id));
    let unresolved = given.iter().any(|id| !named.contains(id));
    let contradictory = links
        .keep
        .as_ref()
        .is_some_and(|keep| links.unlink.contains(keep));

    if unknown || unresolved || contradictory {
        return Err(MergeError::IntegrityViolation(format!(
            "policy {} resolved certificates {:?} as keep={:?} unlink={:?}",
            policy.name(),
            given,
            links.keep,
            links.unlink
        )));
    }
    Ok(())
}

fn merge_progress(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    survivor: &CohortAllocation,
    removed: &CohortAllocation,
    policy: &dyn CollisionPolicy,
    outcome: &mut AllocationOutcome,
) -> MergeResult<()> {
    let own = snapshot.progress_for_allocation(&survivor.id);
    let incoming = snapshot.progress_for_allocation(&removed.id);

    for (competency_id, row) in incoming {
        match own.get(competency_id) {
            None => {
                cohorts::move_progress(uow.conn(), &row.id, &survivor.id)?;
                outcome.progress_moved += 1;
            }
            Some(existing) => {
                // The losing row stays on the retired allocation
                if policy.progress_keeper(existing, row) == Side::Source {
                    cohorts::set_progress_value(uow.conn(), &existing.id, row.progress)?;
                }
                outcome.progress_dropped += 1;
            }
        }
    }

    Ok(())
}
