//! Person and actor operations
//!
//! Persons are the canonical identity records; actors are their role-scoped
//! presence at a location. Only the merge engine hard-deletes either.

use diesel::prelude::*;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::diesel_schema::{actors, persons};
use super::models::{actor_types, current_timestamp, Actor, NewActor, NewPerson, Person};
use crate::error::MergeError;

// ============================================================================
// Input Types
// ============================================================================

/// Input for registering a person
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePersonInput {
    #[serde(default)]
    pub id: Option<String>,
    pub first_name: String,
    #[serde(default)]
    pub last_name_prefix: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Input for creating an actor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateActorInput {
    #[serde(default)]
    pub id: Option<String>,
    pub person_id: String,
    pub location_id: String,
    #[serde(default = "default_actor_type")]
    pub actor_type: String,
}

fn default_actor_type() -> String {
    actor_types::STUDENT.to_string()
}

// ============================================================================
// Persons
// ============================================================================

pub fn create_person(
    conn: &mut SqliteConnection,
    input: &CreatePersonInput,
) -> Result<Person, MergeError> {
    let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = current_timestamp();

    let new_person = NewPerson {
        id: &id,
        first_name: &input.first_name,
        last_name_prefix: input.last_name_prefix.as_deref(),
        last_name: input.last_name.as_deref(),
        date_of_birth: input.date_of_birth.as_deref(),
        user_id: input.user_id.as_deref(),
        created_at: &now,
        updated_at: &now,
    };

    diesel::insert_into(persons::table)
        .values(&new_person)
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to create person", e))?;

    debug!("Created person {}", id);

    get_person(conn, &id)?.ok_or_else(|| MergeError::NotFound(format!("person {}", id)))
}

/// Get a person by ID, including soft-deleted rows
pub fn get_person(conn: &mut SqliteConnection, id: &str) -> Result<Option<Person>, MergeError> {
    persons::table
        .filter(persons::id.eq(id))
        .first(conn)
        .optional()
        .map_err(|e| MergeError::db("Failed to get person", e))
}

/// Get a person that has not been soft-deleted
pub fn get_live_person(conn: &mut SqliteConnection, id: &str) -> Result<Person, MergeError> {
    persons::table
        .filter(persons::id.eq(id))
        .filter(persons::deleted_at.is_null())
        .first(conn)
        .optional()
        .map_err(|e| MergeError::db("Failed to get person", e))?
        .ok_or_else(|| MergeError::NotFound(format!("person {}", id)))
}

/// Bump `updated_at` on a person row. Inside an immediate transaction this
/// also records the write that holds the lock for the rest of the merge.
pub fn touch_person(conn: &mut SqliteConnection, id: &str) -> Result<(), MergeError> {
    let updated = diesel::update(persons::table.filter(persons::id.eq(id)))
        .set(persons::updated_at.eq(current_timestamp()))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to lock person", e))?;

    if updated == 0 {
        return Err(MergeError::NotFound(format!("person {}", id)));
    }
    Ok(())
}

pub fn soft_delete_person(conn: &mut SqliteConnection, id: &str) -> Result<(), MergeError> {
    diesel::update(persons::table.filter(persons::id.eq(id)))
        .set(persons::deleted_at.eq(Some(current_timestamp())))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to soft-delete person", e))?;
    Ok(())
}

/// Hard delete - the row is gone afterwards
pub fn delete_person(conn: &mut SqliteConnection, id: &str) -> Result<(), MergeError> {
    let deleted = diesel::delete(persons::table.filter(persons::id.eq(id)))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to delete person", e))?;

    if deleted == 0 {
        return Err(MergeError::NotFound(format!("person {}", id)));
    }
    Ok(())
}

// ============================================================================
// Actors
// ============================================================================

pub fn create_actor(
    conn: &mut SqliteConnection,
    input: &CreateActorInput,
) -> Result<Actor, MergeError> {
    if !actor_types::is_valid(&input.actor_type) {
        return Err(MergeError::InvalidInput(format!(
            "Invalid actor type: {}",
            input.actor_type
        )));
    }

    let id = input.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let now = current_timestamp();

    let new_actor = NewActor {
        id: &id,
        person_id: &input.person_id,
        location_id: &input.location_id,
        actor_type: &input.actor_type,
        created_at: &now,
    };

    diesel::insert_into(actors::table)
        .values(&new_actor)
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to create actor", e))?;

    actors::table
        .filter(actors::id.eq(&id))
        .first(conn)
        .map_err(|e| MergeError::db("Failed to fetch actor", e))
}

/// All actors of a person, soft-deleted ones included
pub fn list_actors_for_person(
    conn: &mut SqliteConnection,
    person_id: &str,
) -> Result<Vec<Actor>, MergeError> {
    actors::table
        .filter(actors::person_id.eq(person_id))
        .order((actors::created_at.asc(), actors::id.asc()))
        .load(conn)
        .map_err(|e| MergeError::db("Failed to list actors", e))
}

pub fn reassign_actor(
    conn: &mut SqliteConnection,
    actor_id: &str,
    person_id: &str,
) -> Result<(), MergeError> {
    diesel::update(actors::table.filter(actors::id.eq(actor_id)))
        .set(actors::person_id.eq(person_id))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to reassign actor", e))?;
    Ok(())
}

/// Hard delete every actor still owned by a person
pub fn delete_actors_for_person(
    conn: &mut SqliteConnection,
    person_id: &str,
) -> Result<usize, MergeError> {
    diesel::delete(actors::table.filter(actors::person_id.eq(person_id)))
        .execute(conn)
        .map_err(|e| MergeError::db("Failed to delete actors", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_create_and_hard_delete_person() {
        let mut conn = test_db();

        let person = create_person(&mut conn, &CreatePersonInput {
            first_name: "Maartje".into(),
            last_name: Some("Visser".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(get_person(&mut conn, &person.id).unwrap().is_some());

        delete_person(&mut conn, &person.id).unwrap();
        assert!(get_person(&mut conn, &person.id).unwrap().is_none());
        assert!(matches!(
            delete_person(&mut conn, &person.id),
            Err(MergeError::NotFound(_))
        ));
    }

    #[test]
    fn test_soft_deleted_person_is_not_live() {
        let mut conn = test_db();
        let person = create_person(&mut conn, &CreatePersonInput {
            first_name: "Joris".into(),
            ..Default::default()
        })
        .unwrap();

        soft_delete_person(&mut conn, &person.id).unwrap();

        assert!(get_person(&mut conn, &person.id).unwrap().is_some());
        assert!(matches!(
            get_live_person(&mut conn, &person.id),
            Err(MergeError::NotFound(_))
        ));
    }

    #[test]
    fn test_actor_type_validated() {
        let mut conn = test_db();
        let person = create_person(&mut conn, &CreatePersonInput {
            first_name: "Sam".into(),
            ..Default::default()
        })
        .unwrap();

        let result = create_actor(&mut conn, &CreateActorInput {
            id: None,
            person_id: person.id.clone(),
            location_id: "loc-1".into(),
            actor_type: "captain".into(),
        });
        assert!(result.is_err());

        let actor = create_actor(&mut conn, &CreateActorInput {
            id: None,
            person_id: person.id.clone(),
            location_id: "loc-1".into(),
            actor_type: actor_types::STUDENT.into(),
        })
        .unwrap();
        assert_eq!(list_actors_for_person(&mut conn, &person.id).unwrap()[0].id, actor.id);
    }
}
