//! Certificate operations
//!
//! Certificates are issued documents. Nothing in this crate deletes or
//! re-issues one; only the enrollment and cohort-allocation references move.

use diesel::prelude::*;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::diesel_schema::certificates;
use super::models::{current_timestamp, Certificate, NewCertificate};
use crate::error::MergeError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateCertificateInput {
    #[serde(default)]
    pub id: Option<String>,
    pub student_curriculum_id: String,
    #[serde(default)]
    pub cohort_allocation_id: Option<String>,
    #[serde(default)]
    pub issued_at: Option<String>,
    #[serde(default)]
    pub visible_from: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

pub fn create_certificate(
    conn: &mut SqliteConnection,
    input: &CreateCertificateInput,
) -> Result<Certificate, MergeError> {
    let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = current_timestamp();

    let new_certificate = NewCertificate {
        id: &id,
        student_curriculum_id: &input.student_curriculum_id,
        cohort_allocation_id: input.cohort_allocation_id.as_deref(),
        issued_at: input.issued_at.as_deref(),
        visible_from: input.visible_from.as_deref(),
        completed_at: input.completed_at.as_deref(),
        created_at: &now,
    };

    diesel::insert_into(certificates::table)
        .values(&new_certificate)
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to create certificate", e))?;

    debug!("Created certificate {} on enrollment {}", id, input.student_curriculum_id);

    get_certificate(conn, &id)?.ok_or_else(|| MergeError::NotFound(format!("certificate {}", id)))
}

pub fn get_certificate(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<Certificate>, MergeError> {
    certificates::table
        .filter(certificates::id.eq(id))
        .first(conn)
        .optional()
        .map_err(|e| MergeError::db("Failed to get certificate", e))
}

/// Certificates owned by any of the given enrollments
pub fn list_certificates_for_enrollments(
    conn: &mut SqliteConnection,
    enrollment_ids: &[String],
) -> Result<Vec<Certificate>, MergeError> {
    if enrollment_ids.is_empty() {
        return Ok(vec![]);
    }

    certificates::table
        .filter(certificates::student_curriculum_id.eq_any(enrollment_ids))
        .order(certificates::id.asc())
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list certificates", e))
}

/// Certificates linked to any of the given cohort allocations
pub fn list_certificates_for_allocations(
    conn: &mut SqliteConnection,
    allocation_ids: &[String],
) -> Result<Vec<Certificate>, MergeError> {
    if allocation_ids.is_empty() {
        return Ok(vec![]);
    }

    certificates::table
        .filter(certificates::cohort_allocation_id.eq_any(allocation_ids))
        .order(certificates::id.asc())
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list allocation certificates", e))
}

/// Look up which of the given ids still exist
pub fn existing_certificate_ids(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> Result<Vec<String>, MergeError> {
    if ids.is_empty() {
        return Ok(vec![]);
    }

    certificates::table
        .filter(certificates::id.eq_any(ids))
        .select(certificates::id)
        .load(conn)
        .map_err(|e| MergeError::db("Failed to check certificates", e))
}

pub fn relink_enrollment(
    conn: &mut SqliteConnection,
    certificate_id: &str,
    enrollment_id: &str,
) -> Result<(), MergeError> {
    diesel::update(certificates::table.filter(certificates::id.eq(certificate_id)))
        .set(certificates::student_curriculum_id.eq(enrollment_id))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to relink certificate", e))?;
    Ok(())
}

/// Point a certificate at a cohort allocation, or unlink it with `None`
pub fn set_cohort_allocation(
    conn: &mut SqliteConnection,
    certificate_id: &str,
    allocation_id: Option<&str>,
) -> Result<(), MergeError> {
    diesel::update(certificates::table.filter(certificates::id.eq(certificate_id)))
        .set(certificates::cohort_allocation_id.eq(allocation_id))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to update certificate allocation", e))?;
    Ok(())
}

pub fn certificate_count(conn: &mut SqliteConnection) -> Result<i64, MergeError> {
    certificates::table
        .count()
        .get_result(conn)
        .map_err(|e| MergeError::db("Count query failed", e))
}
