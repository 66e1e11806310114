//! Explicit entity registry.
//!
//! The registry maps each [`EntityKind`] to its stable tag and to a JSON codec
//! that round-trips values through the concrete Rust type. It is built once at
//! startup, validated for completeness, and handed to the components that need
//! it (cache manager, external cache backends). There is no global
//! registration state.
//!
//! # Example
//!
//! ```
//! use toggler_core::{EntityKind, EntityRegistry};
//!
//! let registry = EntityRegistry::standard();
//! assert!(registry.validate_kinds(&EntityKind::DOMAIN).is_ok());
//! assert_eq!(registry.tag(EntityKind::ReleaseFlag), "release_flag");
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::entity::{Entity, Record};
use crate::error::{CoreError, Result};
use crate::kind::EntityKind;
use crate::{DeploymentEnvironment, ReleaseFlag, ReleasePilot, ReleaseRollout, Token};

/// Serialization strategy for one entity kind.
#[derive(Clone, Copy)]
pub struct EntityCodec {
    pub kind: EntityKind,
    pub tag: &'static str,
    encode: fn(&Record) -> Result<String>,
    decode: fn(&str) -> Result<Record>,
}

impl EntityCodec {
    fn of<T: Entity>() -> Self {
        Self {
            kind: T::KIND,
            tag: T::KIND.tag(),
            encode: encode_as::<T>,
            decode: decode_as::<T>,
        }
    }

    /// Encodes a record, validating it against the concrete type.
    pub fn encode(&self, record: &Record) -> Result<String> {
        (self.encode)(record)
    }

    /// Decodes raw JSON into a record of this kind.
    pub fn decode(&self, raw: &str) -> Result<Record> {
        (self.decode)(raw)
    }
}

impl fmt::Debug for EntityCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCodec")
            .field("kind", &self.kind)
            .field("tag", &self.tag)
            .finish()
    }
}

fn encode_as<T: Entity>(record: &Record) -> Result<String> {
    let entity: T = record.decode()?;
    Ok(serde_json::to_string(&entity)?)
}

fn decode_as<T: Entity>(raw: &str) -> Result<Record> {
    let entity: T = serde_json::from_str(raw)?;
    Record::from_entity(&entity)
}

/// Registry of entity kinds and their codecs.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entries: HashMap<EntityKind, EntityCodec>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every domain entity registered.
    pub fn standard() -> Self {
        Self::new()
            .register::<ReleaseFlag>()
            .register::<ReleaseRollout>()
            .register::<ReleasePilot>()
            .register::<DeploymentEnvironment>()
            .register::<Token>()
    }

    /// Registers an entity type. Registering the same kind twice replaces
    /// the earlier entry.
    pub fn register<T: Entity>(mut self) -> Self {
        tracing::trace!(kind = %T::KIND, "registering entity kind");
        self.entries.insert(T::KIND, EntityCodec::of::<T>());
        self
    }

    pub fn contains(&self, kind: EntityKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that every known kind is registered.
    pub fn validate(&self) -> Result<()> {
        self.validate_kinds(&EntityKind::ALL)
    }

    /// Checks that the given kinds are registered, reporting all missing ones.
    pub fn validate_kinds(&self, kinds: &[EntityKind]) -> Result<()> {
        let missing: Vec<EntityKind> = kinds
            .iter()
            .copied()
            .filter(|kind| !self.contains(*kind))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::IncompleteRegistry { missing })
        }
    }

    /// Returns the tag of a registered kind.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is not registered. An unmapped kind reaching the cache
    /// is a wiring defect, not a runtime condition.
    pub fn tag(&self, kind: EntityKind) -> &'static str {
        match self.entries.get(&kind) {
            Some(codec) => codec.tag,
            None => panic!("entity kind {kind:?} is not registered in the entity registry"),
        }
    }

    /// Returns the codec of a kind.
    pub fn codec(&self, kind: EntityKind) -> Result<&EntityCodec> {
        self.entries
            .get(&kind)
            .ok_or(CoreError::UnregisteredKind(kind))
    }

    /// Encodes a record with the codec registered for its kind.
    pub fn encode(&self, record: &Record) -> Result<String> {
        self.codec(record.kind)?.encode(record)
    }

    /// Decodes raw JSON with the codec registered for `kind`.
    pub fn decode(&self, kind: EntityKind, raw: &str) -> Result<Record> {
        self.codec(kind)?.decode(raw)
    }
}
