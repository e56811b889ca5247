//! Shared fixture builder for the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use diesel::sqlite::SqliteConnection;
use identity_merge::db::models::actor_types;
use identity_merge::db::{
    self, certificates, cohorts, curricula, persons, CreateActorInput, CreateAllocationInput,
    CreateCertificateInput, CreateEnrollmentInput, CreatePersonInput, RecordCompletionInput,
    UpsertProgressInput,
};

pub struct Fixture {
    pub conn: SqliteConnection,
}

impl Fixture {
    pub fn in_memory() -> Self {
        Self {
            conn: db::open_in_memory().unwrap(),
        }
    }

    pub fn on_file(path: &Path, busy_timeout: Duration) -> Self {
        Self {
            conn: db::open(path, busy_timeout).unwrap(),
        }
    }

    pub fn person(&mut self, first_name: &str) -> String {
        persons::create_person(&mut self.conn, &CreatePersonInput {
            first_name: first_name.into(),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    pub fn account_person(&mut self, first_name: &str, user_id: &str) -> String {
        persons::create_person(&mut self.conn, &CreatePersonInput {
            first_name: first_name.into(),
            user_id: Some(user_id.into()),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    pub fn student(&mut self, person_id: &str, location_id: &str) -> String {
        persons::create_actor(&mut self.conn, &CreateActorInput {
            person_id: person_id.into(),
            location_id: location_id.into(),
            actor_type: actor_types::STUDENT.into(),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    pub fn enrollment(&mut self, person_id: &str, curriculum_id: &str, gear_type_id: &str) -> String {
        curricula::create_enrollment(&mut self.conn, &CreateEnrollmentInput {
            person_id: person_id.into(),
            curriculum_id: curriculum_id.into(),
            gear_type_id: gear_type_id.into(),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    pub fn allocation(&mut self, cohort_id: &str, actor_id: &str, enrollment_id: Option<&str>) -> String {
        cohorts::create_allocation(&mut self.conn, &CreateAllocationInput {
            cohort_id: cohort_id.into(),
            actor_id: actor_id.into(),
            student_curriculum_id: enrollment_id.map(str::to_string),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    pub fn certificate(&mut self, enrollment_id: &str, allocation_id: Option<&str>) -> String {
        certificates::create_certificate(&mut self.conn, &CreateCertificateInput {
            student_curriculum_id: enrollment_id.into(),
            cohort_allocation_id: allocation_id.map(str::to_string),
            issued_at: Some("2024-06-01T00:00:00.000Z".into()),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    pub fn completion(
        &mut self,
        enrollment_id: &str,
        competency_id: &str,
        certificate_id: &str,
        created_at: &str,
    ) -> String {
        curricula::record_completed_competency(&mut self.conn, &RecordCompletionInput {
            competency_id: competency_id.into(),
            student_curriculum_id: enrollment_id.into(),
            certificate_id: certificate_id.into(),
            created_at: Some(created_at.into()),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    pub fn progress(&mut self, allocation_id: &str, competency_id: &str, progress: f32) {
        cohorts::upsert_progress(&mut self.conn, &UpsertProgressInput {
            cohort_allocation_id: allocation_id.into(),
            competency_id: competency_id.into(),
            progress,
        })
        .unwrap();
    }

    pub fn stats_json(&mut self) -> serde_json::Value {
        serde_json::to_value(db::stats(&mut self.conn).unwrap()).unwrap()
    }
}

/// The two-identity scenario most tests start from.
///
/// The target completed A under certificate T1 and sits in cohort K with
/// progress {A: 100}. The source, at the same location, completed A and B
/// under S1 and sits in K with {A: 100, B: 100}.
pub struct Scenario {
    pub target: String,
    pub source: String,
    pub target_actor: String,
    pub source_actor: String,
    pub target_enrollment: String,
    pub source_enrollment: String,
    pub target_allocation: String,
    pub source_allocation: String,
    pub t1: String,
    pub s1: String,
}

pub const COHORT: &str = "cohort-k";
pub const CURRICULUM: &str = "curriculum-sailing";
pub const GEAR: &str = "gear-dinghy";
pub const LOCATION: &str = "location-harbour";

impl Scenario {
    pub fn build(fx: &mut Fixture) -> Self {
        let target = fx.person("Daan");
        let target_actor = fx.student(&target, LOCATION);
        let target_enrollment = fx.enrollment(&target, CURRICULUM, GEAR);
        let target_allocation = fx.allocation(COHORT, &target_actor, Some(&target_enrollment));
        let t1 = fx.certificate(&target_enrollment, Some(&target_allocation));
        fx.completion(&target_enrollment, "A", &t1, "2024-01-10T09:00:00.000Z");
        fx.progress(&target_allocation, "A", 100.0);

        let source = fx.person("Daan");
        let source_actor = fx.student(&source, LOCATION);
        let source_enrollment = fx.enrollment(&source, CURRICULUM, GEAR);
        let source_allocation = fx.allocation(COHORT, &source_actor, Some(&source_enrollment));
        let s1 = fx.certificate(&source_enrollment, Some(&source_allocation));
        fx.completion(&source_enrollment, "A", &s1, "2024-03-02T14:00:00.000Z");
        fx.completion(&source_enrollment, "B", &s1, "2024-03-02T15:00:00.000Z");
        fx.progress(&source_allocation, "A", 100.0);
        fx.progress(&source_allocation, "B", 100.0);

        Self {
            target,
            source,
            target_actor,
            source_actor,
            target_enrollment,
            source_enrollment,
            target_allocation,
            source_allocation,
            t1,
            s1,
        }
    }
}
