//! Source eliminator
//!
//! Runs once every reference to the source identity has been moved. The
//! absorbed actors and the source person are hard-deleted; anything still
//! pointing at them means an earlier step missed a row.

use tracing::debug;

use super::resolver::MergeSnapshot;
use super::unit_of_work::UnitOfWork;
use crate::db::{cohorts, curricula, persons};
use crate::error::{MergeError, MergeResult};

/// Returns the number of actor rows deleted with the source person
pub fn eliminate_source(uow: &mut UnitOfWork<'_>, snapshot: &MergeSnapshot) -> MergeResult<usize> {
    let source_id = snapshot.source.id.as_str();

    let remaining = curricula::enrollment_count_for_person(uow.conn(), source_id)?;
    if remaining > 0 {
        return Err(MergeError::IntegrityViolation(format!(
            "person {} still owns {} enrollments",
            source_id, remaining
        )));
    }

    let leftover_actors: Vec<String> = persons::list_actors_for_person(uow.conn(), source_id)?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let dangling = cohorts::list_allocations_for_actors(uow.conn(), &leftover_actors)?;
    if let Some(allocation) = dangling.first() {
        return Err(MergeError::IntegrityViolation(format!(
            "allocation {} still belongs to actor {} of person {}",
            allocation.id, allocation.actor_id, source_id
        )));
    }

    let actors_deleted = persons::delete_actors_for_person(uow.conn(), source_id)?;
    persons::delete_person(uow.conn(), source_id)?;

    debug!("Deleted person {} and {} absorbed actors", source_id, actors_deleted);
    Ok(actors_deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::actor_types;
    use crate::db::{test_db, CreateActorInput, CreateAllocationInput, CreatePersonInput};
    use crate::merge::resolver::resolve;
    use crate::merge::MergeInput;

    fn person(conn: &mut diesel::SqliteConnection, name: &str) -> String {
        persons::create_person(conn, &CreatePersonInput {
            first_name: name.into(),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    #[test]
    fn test_refuses_while_allocations_remain() {
        let mut conn = test_db();
        let source = person(&mut conn, "Bram");
        let target = person(&mut conn, "Bram");
        let actor = persons::create_actor(&mut conn, &CreateActorInput {
            person_id: source.clone(),
            location_id: "loc-1".into(),
            actor_type: actor_types::STUDENT.into(),
            ..Default::default()
        })
        .unwrap();
        cohorts::create_allocation(&mut conn, &CreateAllocationInput {
            cohort_id: "cohort-1".into(),
            actor_id: actor.id.clone(),
            ..Default::default()
        })
        .unwrap();

        let mut uow = UnitOfWork::new(&mut conn);
        let snapshot = resolve(&mut uow, &MergeInput::new(&source, &target)).unwrap();
        let err = eliminate_source(&mut uow, &snapshot).unwrap_err();
        assert!(matches!(err, MergeError::IntegrityViolation(_)));
        assert!(persons::get_person(&mut conn, &source).unwrap().is_some());
    }

    #[test]
    fn test_deletes_person_and_actors() {
        let mut conn = test_db();
        let source = person(&mut conn, "Fenna");
        let target = person(&mut conn, "Fenna");
        persons::create_actor(&mut conn, &CreateActorInput {
            person_id: source.clone(),
            location_id: "loc-1".into(),
            actor_type: actor_types::STUDENT.into(),
            ..Default::default()
        })
        .unwrap();

        let mut uow = UnitOfWork::new(&mut conn);
        let snapshot = resolve(&mut uow, &MergeInput::new(&source, &target)).unwrap();
        assert_eq!(eliminate_source(&mut uow, &snapshot).unwrap(), 1);
        assert!(persons::get_person(&mut conn, &source).unwrap().is_none());
        assert!(persons::list_actors_for_person(&mut conn, &source).unwrap().is_empty());
    }
}
