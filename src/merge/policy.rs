//! Collision policies
//!
//! Every "who wins" decision the merge makes goes through a
//! [`CollisionPolicy`], so the orchestration never hard-codes a winner.
//! [`TargetWins`] is the production policy; [`PreferOldest`] is an
//! alternative used by migration tooling that trusts the older record.

use std::cmp::Ordering;

use serde::Serialize;

use crate::db::models::{Certificate, CohortAllocation, CohortProgress, CompletedCompetency, StudentCurriculum};

/// Which identity a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Target,
}

/// Outcome for the certificates of two colliding cohort allocations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateLinks {
    /// Certificate linked to the surviving allocation afterwards
    pub keep: Option<String>,
    /// Certificates whose allocation link is cleared
    pub unlink: Vec<String>,
}

pub trait CollisionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Which of two enrollments for the same (curriculum, gear type) survives
    fn enrollment_survivor(&self, target: &StudentCurriculum, source: &StudentCurriculum) -> Side;

    /// Index of the row that stays unflagged; `group` is never empty
    fn completion_keeper(&self, group: &[&CompletedCompetency]) -> usize;

    /// Which of two allocations in the same cohort survives
    fn allocation_survivor(&self, target: &CohortAllocation, source: &CohortAllocation) -> Side;

    /// Resolve the certificate links of a surviving and a removed allocation
    fn allocation_certificates(
        &self,
        survivor: Option<&Certificate>,
        removed: Option<&Certificate>,
    ) -> CertificateLinks;

    /// Whose value wins when both allocations track the same competency.
    /// `Side::Target` means the survivor's own row.
    fn progress_keeper(&self, survivor: &CohortProgress, incoming: &CohortProgress) -> Side;
}

/// Earliest created first, ties broken by id
fn creation_order(a: &CompletedCompetency, b: &CompletedCompetency) -> Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
}

fn earliest_completion(group: &[&CompletedCompetency]) -> usize {
    group
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| creation_order(a, b))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Survivor keeps its own link; an incoming link is adopted only when the
/// survivor has none. Two unlinked allocations stay unlinked.
fn survivor_link_first(survivor: Option<&Certificate>, removed: Option<&Certificate>) -> CertificateLinks {
    match (survivor, removed) {
        (Some(kept), Some(dropped)) => CertificateLinks {
            keep: Some(kept.id.clone()),
            unlink: vec![dropped.id.clone()],
        },
        (Some(kept), None) => CertificateLinks {
            keep: Some(kept.id.clone()),
            unlink: vec![],
        },
        (None, Some(adopted)) => CertificateLinks {
            keep: Some(adopted.id.clone()),
            unlink: vec![],
        },
        (None, None) => CertificateLinks::default(),
    }
}

/// The target identity's records survive every collision
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetWins;

impl CollisionPolicy for TargetWins {
    fn name(&self) -> &'static str {
        "target_wins"
    }

    fn enrollment_survivor(&self, _target: &StudentCurriculum, _source: &StudentCurriculum) -> Side {
        Side::Target
    }

    fn completion_keeper(&self, group: &[&CompletedCompetency]) -> usize {
        earliest_completion(group)
    }

    fn allocation_survivor(&self, _target: &CohortAllocation, _source: &CohortAllocation) -> Side {
        Side::Target
    }

    fn allocation_certificates(
        &self,
        survivor: Option<&Certificate>,
        removed: Option<&Certificate>,
    ) -> CertificateLinks {
        survivor_link_first(survivor, removed)
    }

    fn progress_keeper(&self, _survivor: &CohortProgress, _incoming: &CohortProgress) -> Side {
        Side::Target
    }
}

/// The older enrollment and allocation survive; progress keeps the higher value
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferOldest;

impl CollisionPolicy for PreferOldest {
    fn name(&self) -> &'static str {
        "prefer_oldest"
    }

    fn enrollment_survivor(&self, target: &StudentCurriculum, source: &StudentCurriculum) -> Side {
        match source.created_at.cmp(&target.created_at) {
            Ordering::Less => Side::Source,
            _ => Side::Target,
        }
    }

    fn completion_keeper(&self, group: &[&CompletedCompetency]) -> usize {
        earliest_completion(group)
    }

    fn allocation_survivor(&self, target: &CohortAllocation, source: &CohortAllocation) -> Side {
        match source.created_at.cmp(&target.created_at) {
            Ordering::Less => Side::Source,
            _ => Side::Target,
        }
    }

    fn allocation_certificates(
        &self,
        survivor: Option<&Certificate>,
        removed: Option<&Certificate>,
    ) -> CertificateLinks {
        survivor_link_first(survivor, removed)
    }

    fn progress_keeper(&self, survivor: &CohortProgress, incoming: &CohortProgress) -> Side {
        if incoming.progress > survivor.progress {
            Side::Source
        } else {
            Side::Target
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(id: &str, created_at: &str) -> CompletedCompetency {
        CompletedCompetency {
            id: id.into(),
            competency_id: "knots".into(),
            student_curriculum_id: "sc-1".into(),
            certificate_id: "cert-1".into(),
            is_merge_conflict_duplicate: 0,
            created_at: created_at.into(),
            deleted_at: None,
        }
    }

    fn certificate(id: &str) -> Certificate {
        Certificate {
            id: id.into(),
            student_curriculum_id: "sc-1".into(),
            cohort_allocation_id: Some("alloc".into()),
            issued_at: None,
            visible_from: None,
            completed_at: None,
            created_at: "2024-01-01T00:00:00.000Z".into(),
            deleted_at: None,
        }
    }

    fn allocation(id: &str, created_at: &str) -> CohortAllocation {
        CohortAllocation {
            id: id.into(),
            cohort_id: "cohort".into(),
            actor_id: "actor".into(),
            student_curriculum_id: None,
            created_at: created_at.into(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_earliest_completion_kept() {
        let late = completion("a", "2024-05-02T00:00:00.000Z");
        let early = completion("z", "2024-05-01T00:00:00.000Z");
        assert_eq!(TargetWins.completion_keeper(&[&late, &early]), 1);
    }

    #[test]
    fn test_completion_tie_broken_by_id() {
        let b = completion("b", "2024-05-01T00:00:00.000Z");
        let a = completion("a", "2024-05-01T00:00:00.000Z");
        assert_eq!(TargetWins.completion_keeper(&[&b, &a]), 1);
    }

    #[test]
    fn test_survivor_certificate_takes_priority() {
        let kept = certificate("t1");
        let dropped = certificate("s1");
        let links = TargetWins.allocation_certificates(Some(&kept), Some(&dropped));
        assert_eq!(links.keep.as_deref(), Some("t1"));
        assert_eq!(links.unlink, vec!["s1".to_string()]);
    }

    #[test]
    fn test_incoming_certificate_adopted_when_survivor_has_none() {
        let incoming = certificate("s1");
        let links = TargetWins.allocation_certificates(None, Some(&incoming));
        assert_eq!(links.keep.as_deref(), Some("s1"));
        assert!(links.unlink.is_empty());
    }

    #[test]
    fn test_no_link_created_from_nothing() {
        assert_eq!(TargetWins.allocation_certificates(None, None), CertificateLinks::default());
    }

    #[test]
    fn test_prefer_oldest_allocation() {
        let target = allocation("t", "2024-03-01T00:00:00.000Z");
        let source = allocation("s", "2024-02-01T00:00:00.000Z");
        assert_eq!(PreferOldest.allocation_survivor(&target, &source), Side::Source);
        assert_eq!(TargetWins.allocation_survivor(&target, &source), Side::Target);
    }
}
