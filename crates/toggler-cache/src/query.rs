//! Cached query rows and query fingerprints.

use std::fmt;

use serde::{Deserialize, Serialize};
use toggler_core::{Entity, EntityKind, EntityRegistry};

/// The result of one query, by reference: the ids of the entities that
/// satisfied it when it was computed.
///
/// A row stays valid only while every id still resolves to a current copy in
/// the cache. Any change to an entity of `entity_type` drops every row of
/// that type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedQuery {
    /// The query fingerprint.
    #[serde(default)]
    pub id: String,
    /// Tag of the entity kind the hits belong to.
    pub entity_type: String,
    /// Hit ids in result order. Empty for a cached negative result.
    #[serde(default)]
    pub hit_ids: Vec<String>,
}

impl CachedQuery {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>, hit_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            hit_ids,
        }
    }
}

impl Entity for CachedQuery {
    const KIND: EntityKind = EntityKind::CachedQuery;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

/// The registry every cache backend and the cache manager work with: all
/// domain kinds plus [`CachedQuery`].
pub fn cache_registry() -> EntityRegistry {
    EntityRegistry::standard().register::<CachedQuery>()
}

/// A deterministic query fingerprint.
///
/// Renders as `"{tag}:{operation}:{p1}|{p2}..."`. List parameters whose order
/// does not affect the result go through [`QueryId::params_sorted`].
///
/// ```
/// use toggler_cache::QueryId;
///
/// let a = QueryId::new("release_flag", "by_names").params_sorted(["b", "a"]);
/// let b = QueryId::new("release_flag", "by_names").params_sorted(["a", "b", "a"]);
/// assert_eq!(a.render(), b.render());
/// assert_eq!(a.render(), "release_flag:by_names:2#a,b");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryId {
    tag: &'static str,
    operation: &'static str,
    params: Vec<String>,
}

impl QueryId {
    pub fn new(tag: &'static str, operation: &'static str) -> Self {
        Self {
            tag,
            operation,
            params: Vec::new(),
        }
    }

    /// Appends an order-sensitive parameter.
    pub fn param(mut self, value: impl AsRef<str>) -> Self {
        self.params.push(escape(value.as_ref()));
        self
    }

    /// Appends a list parameter whose order is irrelevant. Values are sorted
    /// and de-duplicated, and the rendering leads with their count so an
    /// empty list differs from a list holding one empty value.
    pub fn params_sorted<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values: Vec<String> = values.into_iter().map(|v| escape(v.as_ref())).collect();
        values.sort();
        values.dedup();
        self.params.push(format!("{}#{}", values.len(), values.join(",")));
        self
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn render(&self) -> String {
        if self.params.is_empty() {
            format!("{}:{}", self.tag, self.operation)
        } else {
            format!("{}:{}:{}", self.tag, self.operation, self.params.join("|"))
        }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Escapes the separator characters so distinct parameter lists never
/// render to the same fingerprint.
fn escape(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('|', "%7C")
        .replace(',', "%2C")
}
