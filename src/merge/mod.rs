//! Identity merge coordinator
//!
//! Collapses a duplicate person (the source) into a surviving person (the
//! target). One merge is one `BEGIN IMMEDIATE` transaction that walks the
//! steps below in order; any error rolls everything back, and serialization
//! conflicts restart the whole merge from the top.
//!
//! 1. [`resolver`] - lock both persons, load the pre-merge snapshot
//! 2. [`canonicalize`] - decide canonical enrollments and actors
//! 3. [`relink`] - point certificates at canonical enrollments
//! 4. [`dedup`] - flag redundant completed competencies
//! 5. [`allocations`] - fold colliding cohort allocations together
//! 6. [`eliminate`] - delete the source person
//! 7. [`verify`] - check the postconditions before commit

pub mod allocations;
pub mod canonicalize;
pub mod dedup;
pub mod eliminate;
pub mod policy;
pub mod relink;
pub mod resolver;
pub mod unit_of_work;
pub mod verify;

use std::thread;
use std::time::Duration;

use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};

use crate::config::Config;
use crate::db::DbPool;
use crate::error::{MergeError, MergeResult};

pub use policy::{CollisionPolicy, PreferOldest, Side, TargetWins};
pub use unit_of_work::{MergeState, UnitOfWork};

/// Merge `person_id` into `target_person_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeInput {
    /// The duplicate identity that disappears
    pub person_id: String,
    /// The identity that survives
    pub target_person_id: String,
}

impl MergeInput {
    pub fn new(person_id: impl Into<String>, target_person_id: impl Into<String>) -> Self {
        Self {
            person_id: person_id.into(),
            target_person_id: target_person_id.into(),
        }
    }

    pub fn validate(&self) -> MergeResult<()> {
        if self.person_id.trim().is_empty() || self.target_person_id.trim().is_empty() {
            return Err(MergeError::InvalidMerge("person ids must not be empty".into()));
        }
        if self.person_id == self.target_person_id {
            return Err(MergeError::InvalidMerge(format!(
                "cannot merge person {} into itself",
                self.person_id
            )));
        }
        Ok(())
    }
}

/// What a committed merge did. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub source_person_id: String,
    pub target_person_id: String,
    pub policy: String,
    pub enrollments_reassigned: usize,
    pub enrollments_superseded: usize,
    pub actors_reassigned: usize,
    pub actors_deleted: usize,
    pub certificates_relinked: usize,
    pub completions_flagged: usize,
    pub allocations_reassigned: usize,
    pub allocations_removed: usize,
    pub certificates_unlinked: usize,
    pub certificates_moved: usize,
    pub progress_moved: usize,
    pub progress_dropped: usize,
    pub attempts: u32,
}

/// How often a merge is retried after a serialization conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff(),
        }
    }
}

/// Run a merge on `conn`, retrying serialization conflicts per `retry`
pub fn merge_persons(
    conn: &mut SqliteConnection,
    input: &MergeInput,
    policy: &dyn CollisionPolicy,
    retry: &RetryPolicy,
) -> MergeResult<MergeReport> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let span = info_span!(
            "merge",
            source = %input.person_id,
            target = %input.target_person_id,
            attempt
        );
        let _guard = span.enter();

        let result = conn.immediate_transaction(|tx| run_merge(tx, input, policy));

        match result {
            Ok(mut report) => {
                report.attempts = attempt;
                info!(
                    "Merged person {} into {} ({} superseded, {} flagged, {} allocations removed)",
                    report.source_person_id,
                    report.target_person_id,
                    report.enrollments_superseded,
                    report.completions_flagged,
                    report.allocations_removed
                );
                return Ok(report);
            }
            Err(e) if e.is_retryable() => {
                if attempt >= max_attempts {
                    warn!("Giving up after {} attempts: {}", attempt, e);
                    return Err(MergeError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                warn!("Attempt {} hit a conflict, retrying: {}", attempt, e);
                thread::sleep(retry.backoff);
            }
            Err(e) => {
                if let MergeError::IntegrityViolation(detail) = &e {
                    error!(
                        policy = policy.name(),
                        "Integrity violation merging {} into {}: {}",
                        input.person_id,
                        input.target_person_id,
                        detail
                    );
                }
                return Err(e);
            }
        }
    }
}

/// One attempt, inside an open transaction
fn run_merge(
    conn: &mut SqliteConnection,
    input: &MergeInput,
    policy: &dyn CollisionPolicy,
) -> MergeResult<MergeReport> {
    let mut uow = UnitOfWork::new(conn);

    let snapshot = resolver::resolve(&mut uow, input)?;

    uow.advance(MergeState::Canonicalizing)?;
    let canonical = canonicalize::canonicalize(&mut uow, &snapshot, policy)?;

    uow.advance(MergeState::Relinking)?;
    let relinked = relink::relink_certificates(&mut uow, &snapshot, &canonical.enrollments)?;

    uow.advance(MergeState::Deduplicating)?;
    let flagged = dedup::deduplicate_completions(&mut uow, &snapshot, &canonical.enrollments, policy)?;

    uow.advance(MergeState::ReconcilingAllocations)?;
    let reconciled = allocations::reconcile_allocations(&mut uow, &snapshot, &canonical, policy)?;

    uow.advance(MergeState::Eliminating)?;
    let actors_deleted = eliminate::eliminate_source(&mut uow, &snapshot)?;

    uow.advance(MergeState::Verifying)?;
    verify::verify_merge(&mut uow, &snapshot, &canonical)?;

    uow.advance(MergeState::Committed)?;

    Ok(MergeReport {
        source_person_id: snapshot.source.id.clone(),
        target_person_id: snapshot.target.id.clone(),
        policy: policy.name().to_string(),
        enrollments_reassigned: canonical.enrollments_reassigned,
        enrollments_superseded: canonical.enrollments_superseded,
        actors_reassigned: canonical.actors_reassigned,
        actors_deleted,
        certificates_relinked: relinked,
        completions_flagged: flagged.len(),
        allocations_reassigned: canonical.allocations_reassigned,
        allocations_removed: reconciled.allocations_removed,
        certificates_unlinked: reconciled.certificates_unlinked,
        certificates_moved: reconciled.certificates_moved,
        progress_moved: reconciled.progress_moved,
        progress_dropped: reconciled.progress_dropped,
        attempts: 0,
    })
}

/// Pooled front end: one connection per merge
pub struct MergeService {
    pool: DbPool,
    retry: RetryPolicy,
    policy: Box<dyn CollisionPolicy>,
}

impl MergeService {
    pub fn new(pool: DbPool, config: &Config) -> Self {
        Self {
            pool,
            retry: RetryPolicy::from(config),
            policy: Box::new(TargetWins),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn CollisionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn merge_persons(&self, input: &MergeInput) -> MergeResult<MergeReport> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| MergeError::Pool(format!("Failed to get connection: {}", e)))?;
        merge_persons(&mut conn, input, self.policy.as_ref(), &self.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{persons, test_db, CreatePersonInput};

    #[test]
    fn test_input_rejects_self_merge() {
        let input = MergeInput::new("p-1", "p-1");
        assert!(matches!(input.validate(), Err(MergeError::InvalidMerge(_))));
        assert!(MergeInput::new("p-1", "p-2").validate().is_ok());
    }

    #[test]
    fn test_input_deserializes_from_json() {
        let input: MergeInput =
            serde_json::from_str(r#"{"person_id": "a", "target_person_id": "b"}"#).unwrap();
        assert_eq!(input, MergeInput::new("a", "b"));
    }

    #[test]
    fn test_merge_of_bare_persons() {
        let mut conn = test_db();
        let source = persons::create_person(&mut conn, &CreatePersonInput {
            first_name: "Anouk".into(),
            ..Default::default()
        })
        .unwrap();
        let target = persons::create_person(&mut conn, &CreatePersonInput {
            first_name: "Anouk".into(),
            ..Default::default()
        })
        .unwrap();

        let report = merge_persons(
            &mut conn,
            &MergeInput::new(&source.id, &target.id),
            &TargetWins,
            &RetryPolicy::default(),
        )
        .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.policy, "target_wins");
        assert!(persons::get_person(&mut conn, &source.id).unwrap().is_none());
        assert!(persons::get_person(&mut conn, &target.id).unwrap().is_some());
    }

    #[test]
    fn test_missing_person_is_not_retried() {
        let mut conn = test_db();
        let err = merge_persons(
            &mut conn,
            &MergeInput::new("missing-1", "missing-2"),
            &TargetWins,
            &RetryPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::NotFound(_)));
    }
}
