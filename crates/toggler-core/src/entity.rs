//! The `Entity` trait and the type-erased `Record` envelope.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kind::EntityKind;

/// A value that can be stored and cached.
///
/// Implementations serialize their identifier under the `id` field so that a
/// [`Record`] body always carries the same id as the record itself.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The kind discriminant of this entity type.
    const KIND: EntityKind;

    /// Returns the entity's identifier. Empty when not yet assigned.
    fn id(&self) -> &str;

    /// Assigns the entity's identifier.
    fn set_id(&mut self, id: String);
}

/// Generates a fresh entity identifier.
pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

/// An owned, type-erased entity value.
///
/// Records are what the object-safe storage and cache traits exchange. Every
/// record handed to a caller is an independent copy; nothing ever references
/// a backend's internal state.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: EntityKind,
    pub id: String,
    pub body: Value,
}

impl Record {
    /// Builds a record from a JSON body, taking the id from the body.
    pub fn new(kind: EntityKind, body: Value) -> Result<Self> {
        if !body.is_object() {
            return Err(CoreError::invalid_entity(format!(
                "{kind} body must be a JSON object"
            )));
        }
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self { kind, id, body })
    }

    /// Serializes an entity into a record.
    pub fn from_entity<T: Entity>(entity: &T) -> Result<Self> {
        let body = serde_json::to_value(entity)?;
        Ok(Self {
            kind: T::KIND,
            id: entity.id().to_string(),
            body,
        })
    }

    /// Decodes the record into its concrete entity type.
    pub fn decode<T: Entity>(&self) -> Result<T> {
        if self.kind != T::KIND {
            return Err(CoreError::KindMismatch {
                expected: T::KIND,
                actual: self.kind,
            });
        }
        let mut entity: T = serde_json::from_value(self.body.clone())?;
        if entity.id() != self.id {
            entity.set_id(self.id.clone());
        }
        Ok(entity)
    }

    /// Returns `true` when no id has been assigned yet.
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// Assigns the id on both the record and its body.
    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        if let Value::Object(map) = &mut self.body {
            map.insert("id".to_string(), Value::String(id.clone()));
        }
        self.id = id;
    }

    /// Assigns a fresh id if the record has none, returning the id.
    pub fn ensure_id(&mut self) -> &str {
        if !self.has_id() {
            self.set_id(new_entity_id());
        }
        &self.id
    }
}
