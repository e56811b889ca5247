//! Certificate relinker

use tracing::debug;

use super::canonicalize::EnrollmentMapping;
use super::resolver::MergeSnapshot;
use super::unit_of_work::UnitOfWork;
use crate::db::certificates;
use crate::error::MergeResult;

/// Point every certificate of a superseded enrollment at its canonical
/// enrollment. Returns the number of certificates moved.
pub fn relink_certificates(
    uow: &mut UnitOfWork<'_>,
    snapshot: &MergeSnapshot,
    enrollments: &EnrollmentMapping,
) -> MergeResult<usize> {
    let mut relinked = 0;

    for certificate in &snapshot.certificates {
        let canonical = enrollments.canonical_of(&certificate.student_curriculum_id);
        if canonical == certificate.student_curriculum_id {
            continue;
        }
        certificates::relink_enrollment(uow.conn(), &certificate.id, canonical)?;
        debug!(
            "Certificate {} relinked {} -> {}",
            certificate.id, certificate.student_curriculum_id, canonical
        );
        relinked += 1;
    }

    Ok(relinked)
}
