//! Staged writes of an open in-memory transaction.
//!
//! Writes made inside a transaction are recorded as [`TxOp`]s together with
//! the change events they will publish. Reads inside the transaction see the
//! committed data with the staged operations applied in order. Commit
//! re-validates the operations against the committed data and applies them;
//! rollback drops them.

use std::collections::BTreeMap;

use toggler_core::{EntityKind, Record};
use toggler_storage::ChangeEvent;

/// One staged write.
#[derive(Debug, Clone)]
pub(crate) enum TxOp {
    Create(Record),
    Update(Record),
    Delete { kind: EntityKind, id: String },
    DeleteAll(EntityKind),
}

impl TxOp {
    pub(crate) fn kind(&self) -> EntityKind {
        match self {
            TxOp::Create(record) | TxOp::Update(record) => record.kind,
            TxOp::Delete { kind, .. } | TxOp::DeleteAll(kind) => *kind,
        }
    }
}

/// Operations and events of one open transaction.
#[derive(Debug, Default)]
pub(crate) struct PendingTransaction {
    pub(crate) ops: Vec<TxOp>,
    pub(crate) events: Vec<ChangeEvent>,
}

impl PendingTransaction {
    pub(crate) fn stage(&mut self, op: TxOp, event: ChangeEvent) {
        self.ops.push(op);
        self.events.push(event);
    }

    /// Resolves one entity as seen from inside the transaction.
    pub(crate) fn resolve(
        &self,
        kind: EntityKind,
        id: &str,
        committed: Option<Record>,
    ) -> Option<Record> {
        self.ops
            .iter()
            .filter(|op| op.kind() == kind)
            .fold(committed, |current, op| match op {
                TxOp::Create(record) | TxOp::Update(record) if record.id == id => {
                    Some(record.clone())
                }
                TxOp::Delete { id: deleted, .. } if deleted == id => None,
                TxOp::DeleteAll(_) => None,
                _ => current,
            })
    }

    /// Applies the staged operations of `kind` to a committed snapshot.
    pub(crate) fn overlay(
        &self,
        kind: EntityKind,
        mut snapshot: BTreeMap<String, Record>,
    ) -> BTreeMap<String, Record> {
        for op in self.ops.iter().filter(|op| op.kind() == kind) {
            match op {
                TxOp::Create(record) | TxOp::Update(record) => {
                    snapshot.insert(record.id.clone(), record.clone());
                }
                TxOp::Delete { id, .. } => {
                    snapshot.remove(id);
                }
                TxOp::DeleteAll(_) => snapshot.clear(),
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flag(id: &str, name: &str) -> Record {
        Record::new(EntityKind::ReleaseFlag, json!({"id": id, "name": name})).unwrap()
    }

    #[test]
    fn test_resolve_applies_ops_in_order() {
        let mut tx = PendingTransaction::default();
        tx.stage(
            TxOp::Update(flag("1", "b")),
            ChangeEvent::updated(flag("1", "b")),
        );
        assert_eq!(
            tx.resolve(EntityKind::ReleaseFlag, "1", Some(flag("1", "a"))),
            Some(flag("1", "b"))
        );

        tx.stage(
            TxOp::DeleteAll(EntityKind::ReleaseFlag),
            ChangeEvent::deleted_all(EntityKind::ReleaseFlag),
        );
        tx.stage(
            TxOp::Create(flag("2", "c")),
            ChangeEvent::created(flag("2", "c")),
        );
        assert_eq!(tx.resolve(EntityKind::ReleaseFlag, "1", None), None);
        assert_eq!(
            tx.resolve(EntityKind::ReleaseFlag, "2", None),
            Some(flag("2", "c"))
        );
        assert_eq!(tx.events.len(), 3);
    }

    #[test]
    fn test_overlay_ignores_other_kinds() {
        let mut tx = PendingTransaction::default();
        tx.stage(
            TxOp::DeleteAll(EntityKind::Token),
            ChangeEvent::deleted_all(EntityKind::Token),
        );
        tx.stage(
            TxOp::Delete {
                kind: EntityKind::ReleaseFlag,
                id: "1".to_string(),
            },
            ChangeEvent::deleted(EntityKind::ReleaseFlag, "1"),
        );

        let mut snapshot = BTreeMap::new();
        snapshot.insert("1".to_string(), flag("1", "a"));
        snapshot.insert("2".to_string(), flag("2", "b"));

        let view = tx.overlay(EntityKind::ReleaseFlag, snapshot);
        assert_eq!(view.keys().collect::<Vec<_>>(), ["2"]);
    }
}
