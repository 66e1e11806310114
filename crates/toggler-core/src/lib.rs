//! # toggler-core
//!
//! Core entities for the Toggler release-management backend.
//!
//! This crate defines the domain values (flags, rollouts, pilots, deployment
//! environments, tokens), the [`EntityKind`] discriminant with its stable tags,
//! the explicit [`EntityRegistry`] and the type-erased [`Record`] envelope used
//! at every storage and cache boundary.

pub mod deployment;
pub mod entity;
pub mod error;
pub mod kind;
pub mod registry;
pub mod release;
pub mod security;

pub use deployment::DeploymentEnvironment;
pub use entity::{Entity, Record, new_entity_id};
pub use error::{CoreError, Result};
pub use kind::EntityKind;
pub use registry::{EntityCodec, EntityRegistry};
pub use release::{ReleaseFlag, ReleasePilot, ReleaseRollout, RolloutPlan};
pub use security::Token;
