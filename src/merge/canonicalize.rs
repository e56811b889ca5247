//! Curriculum canonicalizer
//!
//! Decides, per (curriculum, gear type), which enrollment is "the" enrollment
//! after the merge, and which actor every source actor collapses into. The
//! decisions are frozen into [`EnrollmentMapping`] and [`ActorMapping`];
//! later steps only read them.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::allocations::find_collisions;
use super::policy::{CollisionPolicy, Side};
use super::resolver::MergeSnapshot;
use super::unit_of_work::UnitOfWork;
use crate::db::models::{CurriculumKey, StudentCurriculum};
use crate::db::{cohorts, curricula, persons};
use crate::error::MergeResult;

/// Old enrollment id -> canonical enrollment id, for every enrollment of
/// either person
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrollmentMapping {
    canonical: BTreeMap<String, String>,
}

impl EnrollmentMapping {
    pub fn canonical_of<'a>(&'a self, enrollment_id: &'a str) -> &'a str {
        self.canonical
            .get(enrollment_id)
            .map(String::as_str)
            .unwrap_or(enrollment_id)
    }

    /// Enrollments that now resolve to a different id
    pub fn superseded(&self) -> impl Iterator<Item = (&str, &str)> {
        self.canonical
            .iter()
            .filter(|(old, canonical)| old != canonical)
            .map(|(old, canonical)| (old.as_str(), canonical.as_str()))
    }

    pub fn canonical_ids(&self) -> BTreeSet<&str> {
        self.canonical.values().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

/// Source actor id -> the actor that represents it after the merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorMapping {
    canonical: BTreeMap<String, String>,
}

impl ActorMapping {
    pub fn canonical_of<'a>(&'a self, actor_id: &'a str) -> &'a str {
        self.canonical
            .get(actor_id)
            .map(String::as_str)
            .unwrap_or(actor_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Canonicalization {
    pub enrollments: EnrollmentMapping,
    pub actors: ActorMapping,
    pub enrollments_reassigned: usize,
    pub enrollments_superseded: usize,
    pub actors_reassigned: usize,
    pub allocations_reassigned: usize,
}

pub fn canonicalize(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    policy: &dyn CollisionPolicy,
) -> MergeResult<Canonicalization> {
    let mut outcome = Canonicalization::default();

    let actors = canonicalize_actors(uow, snapshot, &mut outcome)?;
    let enrollments = canonicalize_enrollments(uow, snapshot, policy, &mut outcome)?;

    // Non-colliding allocations of absorbed actors move to the canonical actor;
    // colliding ones are left to the allocation reconciler
    let colliding: BTreeSet<String> = find_collisions(snapshot, &actors)
        .iter()
        .map(|c| c.source.id.clone())
        .collect();
    for allocation in snapshot.allocations_of(Side::Source) {
        let canonical_actor = actors.canonical_of(&allocation.actor_id);
        if canonical_actor == allocation.actor_id || colliding.contains(&allocation.id) {
            continue;
        }
        cohorts::reassign_allocation_actor(uow.conn(), &allocation.id, canonical_actor)?;
        outcome.allocations_reassigned += 1;
    }

    // Dependents of superseded enrollments follow them to the canonical one
    for (old, canonical) in enrollments.superseded() {
        let moved = curricula::remap_completed_competencies(uow.conn(), old, canonical)?;
        let repointed = cohorts::remap_allocation_enrollments(uow.conn(), old, canonical)?;
        debug!(
            "Enrollment {} -> {}: {} completions, {} allocations remapped",
            old, canonical, moved, repointed
        );
    }

    outcome.actors = actors;
    outcome.enrollments = enrollments;
    Ok(outcome)
}

fn canonicalize_actors(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    outcome: &mut Canonicalization,
) -> MergeResult<ActorMapping> {
    let target_id = snapshot.target.id.as_str();
    let mut canonical = BTreeMap::new();

    for actor in &snapshot.source_actors {
        let counterpart = snapshot.target_actors.iter().find(|t| {
            t.deleted_at.is_none()
                && t.location_id == actor.location_id
                && t.actor_type == actor.actor_type
        });

        // A soft-deleted source actor is absorbed too: its allocations may still be live
        match counterpart {
            Some(existing) => {
                canonical.insert(actor.id.clone(), existing.id.clone());
            }
            _ => {
                persons::reassign_actor(uow.conn(), &actor.id, target_id)?;
                canonical.insert(actor.id.clone(), actor.id.clone());
                outcome.actors_reassigned += 1;
            }
        }
    }

    Ok(ActorMapping { canonical })
}

fn canonicalize_enrollments(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    policy: &dyn CollisionPolicy,
    outcome: &mut Canonicalization,
) -> MergeResult<EnrollmentMapping> {
    let target_id = snapshot.target.id.as_str();

    let by_key = |rows: &[StudentCurriculum]| -> BTreeMap<CurriculumKey, StudentCurriculum> {
        rows.iter()
            .filter(|e| e.is_canonical())
            .map(|e| (e.curriculum_key(), e.clone()))
            .collect()
    };
    let target_by_key = by_key(&snapshot.target_enrollments);
    let source_by_key = by_key(&snapshot.source_enrollments);

    let mut canonical: BTreeMap<String, String> = BTreeMap::new();

    for (key, target) in &target_by_key {
        if !source_by_key.contains_key(key) {
            canonical.insert(target.id.clone(), target.id.clone());
        }
    }

    for (key, source) in &source_by_key {
        match target_by_key.get(key) {
            None => {
                curricula::reassign_enrollment(uow.conn(), &source.id, target_id)?;
                canonical.insert(source.id.clone(), source.id.clone());
                outcome.enrollments_reassigned += 1;
            }
            Some(target) => {
                let (survivor, loser) = match policy.enrollment_survivor(target, source) {
                    Side::Target => (target, source),
                    Side::Source => (source, target),
                };
                // Supersede first so the canonical-enrollment index never sees two
                curricula::supersede_enrollment(uow.conn(), &loser.id, &survivor.id, target_id)?;
                if survivor.person_id != target_id {
                    curricula::reassign_enrollment(uow.conn(), &survivor.id, target_id)?;
                }
                canonical.insert(survivor.id.clone(), survivor.id.clone());
                canonical.insert(loser.id.clone(), survivor.id.clone());
                outcome.enrollments_superseded += 1;
                debug!(
                    "Enrollment {:?}: {} survives, {} superseded",
                    key, survivor.id, loser.id
                );
            }
        }
    }

    // Enrollments that were already superseded or deleted before this merge
    let previously_inactive = snapshot
        .source_enrollments
        .iter()
        .chain(snapshot.target_enrollments.iter())
        .filter(|e| !e.is_canonical());
    for enrollment in previously_inactive {
        let resolved = match &enrollment.superseded_by {
            Some(pointer) => follow_supersession(snapshot, &canonical, pointer),
            None => enrollment.id.clone(),
        };
        if enrollment.superseded_by.as_deref().is_some_and(|p| p != resolved) {
            // Keep supersession one hop deep
            curricula::supersede_enrollment(uow.conn(), &enrollment.id, &resolved, target_id)?;
        } else if enrollment.person_id != target_id {
            curricula::reassign_enrollment(uow.conn(), &enrollment.id, target_id)?;
        }
        canonical.insert(enrollment.id.clone(), resolved);
    }

    Ok(EnrollmentMapping { canonical })
}

/// Resolve a `superseded_by` pointer to the enrollment it ends at once this
/// merge's decisions are applied
fn follow_supersession(
    snapshot: &MergeSnapshot,
    decided: &BTreeMap<String, String>,
    start: &str,
) -> String {
    let mut current = start.to_string();
    let mut visited = BTreeSet::new();

    while visited.insert(current.clone()) {
        if let Some(canonical) = decided.get(&current) {
            if *canonical == current {
                break;
            }
            current = canonical.clone();
            continue;
        }
        let next = snapshot
            .source_enrollments
            .iter()
            .chain(snapshot.target_enrollments.iter())
            .find(|e| e.id == current)
            .and_then(|e| e.superseded_by.clone());
        match next {
            Some(next) => current = next,
            None => break,
        }
    }

    current
}
