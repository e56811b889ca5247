//! Completion deduplicator
//!
//! When both identities completed the same competency, both rows stay (each
//! is evidence for an issued certificate) and all but one get
//! `is_merge_conflict_duplicate` so progress counts the competency once.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::canonicalize::EnrollmentMapping;
use super::policy::{CollisionPolicy, Side};
use super::resolver::MergeSnapshot;
use super::unit_of_work::UnitOfWork;
use crate::db::curricula;
use crate::db::models::CompletedCompetency;
use crate::error::{MergeError, MergeResult};

/// Flag redundant completions on every canonical enrollment. Returns the ids
/// that were flagged.
pub fn deduplicate_completions(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    enrollments: &EnrollmentMapping,
    policy: &dyn CollisionPolicy,
) -> MergeResult<Vec<String>> {
    let canonical_ids: Vec<String> = enrollments
        .canonical_ids()
        .into_iter()
        .map(str::to_string)
        .collect();
    let rows = curricula::list_completed_for_enrollments(uow.conn(), &canonical_ids)?;

    let duplicates = select_duplicates(&rows, snapshot, policy)?;
    let flagged = curricula::flag_merge_conflict_duplicates(uow.conn(), &duplicates)?;
    if flagged != duplicates.len() {
        return Err(MergeError::IntegrityViolation(format!(
            "expected to flag {} completions, flagged {}",
            duplicates.len(),
            flagged
        )));
    }

    Ok(duplicates)
}

/// Pick the rows to flag. Only groups holding rows from both identities
/// are collisions; a competency one identity recorded twice on its own is
/// left alone.
pub(crate) fn select_duplicates(
    rows: &[CompletedCompetency],
    snapshot: &MergeSnapshot,
    policy: &dyn CollisionPolicy,
) -> MergeResult<Vec<String>> {
    let origin: BTreeMap<&str, Side> = snapshot
        .completions
        .iter()
        .filter_map(|c| {
            snapshot
                .enrollment_side(&c.student_curriculum_id)
                .map(|side| (c.id.as_str(), side))
        })
        .collect();

    let mut groups: BTreeMap<(&str, &str), Vec<&CompletedCompetency>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.counts_toward_progress()) {
        groups
            .entry((row.student_curriculum_id.as_str(), row.competency_id.as_str()))
            .or_default()
            .push(row);
    }

    let mut duplicates = vec![];
    for ((enrollment_id, competency_id), group) in groups {
        if group.len() < 2 {
            continue;
        }
        let sides: BTreeSet<Side> = group
            .iter()
            .filter_map(|r| origin.get(r.id.as_str()).copied())
            .collect();
        if sides.len() < 2 {
            continue;
        }

        let keep = policy.completion_keeper(&group);
        let kept = group.get(keep).ok_or_else(|| {
            MergeError::IntegrityViolation(format!(
                "policy {} picked completion {} of a group of {}",
                policy.name(),
                keep,
                group.len()
            ))
        })?;
        debug!(
            "Competency {} on enrollment {}: keeping {}, flagging {}",
            competency_id,
            enrollment_id,
            kept.id,
            group.len() - 1
        );

        duplicates.extend(
            group
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != keep)
                .map(|(_, r)| r.id.clone()),
        );
    }

    Ok(duplicates)
}
