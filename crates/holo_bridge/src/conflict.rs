//! Conflict detection for writes that arrive through replication.
//!
//! The check and the write happen in one operation: a [`ConflictFunction`]
//! turns the incoming change into a [`WriteGuard`] that the cluster evaluates
//! against the stored row right before applying the write. The per-op
//! outcome is then classified into a [`ConflictRecord`].

use std::fmt;
use std::sync::{Arc, Mutex};

use holo_cluster::{ColumnValue, KeyTuple, OpOutcome, RowVersion, WriteGuard};
use serde::Serialize;

use crate::batch::BatchedOperation;
use crate::error::{BridgeError, BridgeResult};
use crate::share::TableShare;

/// Kind of change carried by a replicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatedKind {
    Insert,
    Update,
    Delete,
}

/// One change received from a replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedWrite {
    pub kind: ReplicatedKind,
    /// After image for inserts and updates, the deleted image for deletes.
    pub columns: Vec<ColumnValue>,
    /// Row image the origin saw before the change, when shipped.
    pub before: Option<Vec<ColumnValue>>,
}

impl ReplicatedWrite {
    pub fn insert(columns: Vec<ColumnValue>) -> Self {
        Self {
            kind: ReplicatedKind::Insert,
            columns,
            before: None,
        }
    }

    pub fn update(before: Vec<ColumnValue>, after: Vec<ColumnValue>) -> Self {
        Self {
            kind: ReplicatedKind::Update,
            columns: after,
            before: Some(before),
        }
    }

    pub fn delete(image: Vec<ColumnValue>) -> Self {
        Self {
            kind: ReplicatedKind::Delete,
            before: Some(image.clone()),
            columns: image,
        }
    }
}

/// Resolution of one replicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    Apply,
    /// Conflicting write discarded; the transaction continues.
    Reject,
    /// Write discarded and recorded for external reconciliation.
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictClass {
    NoConflict,
    /// The guard evaluated to false.
    GuardFailed,
    /// The guard could not be evaluated against the stored row.
    GuardUnevaluable,
    /// Update or delete found no row.
    RowMissing,
    /// Insert found an existing row.
    RowExists,
}

/// Classification and action for one replicated write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub table: String,
    pub key: KeyTuple,
    pub kind: ReplicatedKind,
    pub class: ConflictClass,
    pub action: ConflictAction,
    pub function: &'static str,
    /// Stored row version when the guard failed.
    pub current: Option<RowVersion>,
}

/// Rule that decides whether a replicated write may be applied.
pub trait ConflictFunction: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Guard attached to the write; `None` applies it unconditionally.
    fn guard(&self, table: &str, write: &ReplicatedWrite) -> BridgeResult<Option<WriteGuard>>;
}

fn incoming_version(table: &str, write: &ReplicatedWrite, column: usize) -> BridgeResult<u64> {
    write
        .columns
        .get(column)
        .and_then(ColumnValue::as_u64)
        .ok_or_else(|| BridgeError::InvalidRow {
            table: table.to_string(),
            reason: format!("version column {column} is missing or not a u64"),
        })
}

/// Incoming version must be strictly greater than the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxVersion {
    pub column: usize,
}

impl ConflictFunction for MaxVersion {
    fn name(&self) -> &'static str {
        "max_version"
    }

    fn guard(&self, table: &str, write: &ReplicatedWrite) -> BridgeResult<Option<WriteGuard>> {
        Ok(Some(WriteGuard::VersionColumnBelow {
            column: self.column,
            value: incoming_version(table, write, self.column)?,
            inclusive: false,
        }))
    }
}

/// Like [`MaxVersion`], but a delete also wins over an equal version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxVersionDeleteWins {
    pub column: usize,
}

impl ConflictFunction for MaxVersionDeleteWins {
    fn name(&self) -> &'static str {
        "max_version_delete_wins"
    }

    fn guard(&self, table: &str, write: &ReplicatedWrite) -> BridgeResult<Option<WriteGuard>> {
        Ok(Some(WriteGuard::VersionColumnBelow {
            column: self.column,
            value: incoming_version(table, write, self.column)?,
            inclusive: write.kind == ReplicatedKind::Delete,
        }))
    }
}

/// Stored row must equal the pre-image the origin saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OldImage;

impl ConflictFunction for OldImage {
    fn name(&self) -> &'static str {
        "old_image"
    }

    fn guard(&self, table: &str, write: &ReplicatedWrite) -> BridgeResult<Option<WriteGuard>> {
        match write.kind {
            ReplicatedKind::Insert => Ok(None),
            ReplicatedKind::Update | ReplicatedKind::Delete => {
                let before = write.before.clone().ok_or_else(|| BridgeError::InvalidRow {
                    table: table.to_string(),
                    reason: "old_image conflict detection needs a before image".to_string(),
                })?;
                Ok(Some(WriteGuard::RowEquals(before)))
            }
        }
    }
}

/// Conflict policy of one table.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    function: Option<Arc<dyn ConflictFunction>>,
    on_conflict: ConflictAction,
}

impl ConflictResolver {
    /// `on_conflict` is used when the guard fails; it must not be `Apply`.
    pub fn new(function: Arc<dyn ConflictFunction>, on_conflict: ConflictAction) -> Self {
        let on_conflict = match on_conflict {
            ConflictAction::Apply => ConflictAction::Escalate,
            other => other,
        };
        Self {
            function: Some(function),
            on_conflict,
        }
    }

    /// Applies replicated writes without a guard.
    pub fn unguarded() -> Self {
        Self {
            function: None,
            on_conflict: ConflictAction::Escalate,
        }
    }

    pub fn function_name(&self) -> &'static str {
        self.function
            .as_ref()
            .map(|function| function.name())
            .unwrap_or("none")
    }

    /// Builds the guarded operation for `write`.
    pub fn prepare(&self, share: &TableShare, write: &ReplicatedWrite) -> BridgeResult<BatchedOperation> {
        let table = share.name();
        let key = share
            .definition()
            .primary_key_of(&write.columns)
            .filter(|key| !key.has_null())
            .ok_or_else(|| BridgeError::InvalidRow {
                table: table.to_string(),
                reason: "replicated row has no usable primary key".to_string(),
            })?;
        let guard = match &self.function {
            Some(function) => function.guard(table, write)?,
            None => None,
        };
        let op = match write.kind {
            // Decision: replicated inserts never overwrite; an existing row is
            // a conflict in its own right.
            ReplicatedKind::Insert => BatchedOperation::insert(table, key, write.columns.clone()),
            ReplicatedKind::Update => BatchedOperation::update(table, key, write.columns.clone()),
            ReplicatedKind::Delete => BatchedOperation::delete(table, key),
        };
        Ok(op.with_guard(if write.kind == ReplicatedKind::Insert { None } else { guard }))
    }

    /// Classifies the outcome of a prepared write. Anything other than a
    /// successful apply is never reported as `Apply`.
    pub fn resolve(&self, table: &str, key: KeyTuple, write: &ReplicatedWrite, outcome: &OpOutcome) -> ConflictRecord {
        let (class, action, current) = match outcome {
            OpOutcome::Applied { .. } | OpOutcome::Deleted => {
                (ConflictClass::NoConflict, ConflictAction::Apply, None)
            }
            OpOutcome::GuardFailed { current } => {
                (ConflictClass::GuardFailed, self.on_conflict, Some(*current))
            }
            OpOutcome::GuardUnevaluable { .. } => {
                (ConflictClass::GuardUnevaluable, ConflictAction::Escalate, None)
            }
            OpOutcome::DuplicateKey if write.kind == ReplicatedKind::Insert => {
                (ConflictClass::RowExists, ConflictAction::Escalate, None)
            }
            OpOutcome::DuplicateKey => (ConflictClass::GuardUnevaluable, ConflictAction::Escalate, None),
            OpOutcome::NotFound | OpOutcome::Found(_) => {
                (ConflictClass::RowMissing, ConflictAction::Escalate, None)
            }
        };
        ConflictRecord {
            table: table.to_string(),
            key,
            kind: write.kind,
            class,
            action,
            function: self.function_name(),
            current,
        }
    }
}

/// Destination for escalated conflict records.
pub trait ExceptionSink: Send {
    fn record(&mut self, record: ConflictRecord);
}

/// Collects escalated records in memory.
#[derive(Debug, Default)]
pub struct VecExceptionSink {
    records: Vec<ConflictRecord>,
}

impl VecExceptionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[ConflictRecord] {
        &self.records
    }

    pub fn take(&mut self) -> Vec<ConflictRecord> {
        std::mem::take(&mut self.records)
    }
}

impl ExceptionSink for VecExceptionSink {
    fn record(&mut self, record: ConflictRecord) {
        self.records.push(record);
    }
}

/// Sink shareable across sessions.
#[derive(Debug, Default, Clone)]
pub struct SharedExceptionSink {
    records: Arc<Mutex<Vec<ConflictRecord>>>,
}

impl SharedExceptionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<ConflictRecord> {
        std::mem::take(
            &mut *self
                .records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

impl ExceptionSink for SharedExceptionSink {
    fn record(&mut self, record: ConflictRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use holo_cluster::{ColumnDef, OpKind, TableDef, TableStatistics};

    use super::*;

    fn share() -> TableShare {
        TableShare::new(
            TableDef {
                name: "repl.items".to_string(),
                table_id: 3,
                schema_version: 1,
                columns: vec![ColumnDef::new("id", false), ColumnDef::new("ver", false)],
                primary_key: vec![0],
                primary_key_ordered: true,
                hidden_key: false,
                partitions: 2,
                indexes: Vec::new(),
            },
            TableStatistics::default(),
        )
    }

    fn item(id: u64, version: u64) -> Vec<ColumnValue> {
        vec![ColumnValue::from_u64(id), ColumnValue::from_u64(version)]
    }

    #[test]
    fn max_version_guards_strictly_and_delete_wins_on_ties() {
        let update = ReplicatedWrite::update(item(1, 4), item(1, 5));
        let guard = MaxVersion { column: 1 }.guard("t", &update).expect("guard");
        assert_eq!(
            guard,
            Some(WriteGuard::VersionColumnBelow {
                column: 1,
                value: 5,
                inclusive: false
            })
        );

        let delete = ReplicatedWrite::delete(item(1, 5));
        let guard = MaxVersionDeleteWins { column: 1 }
            .guard("t", &delete)
            .expect("guard");
        assert!(matches!(
            guard,
            Some(WriteGuard::VersionColumnBelow { inclusive: true, .. })
        ));
    }

    #[test]
    fn old_image_requires_a_before_image() {
        let write = ReplicatedWrite {
            kind: ReplicatedKind::Update,
            columns: item(1, 2),
            before: None,
        };
        assert!(OldImage.guard("t", &write).is_err());
    }

    #[test]
    fn mismatches_and_missing_rows_never_apply() {
        let resolver = ConflictResolver::new(Arc::new(OldImage), ConflictAction::Reject);
        let write = ReplicatedWrite::update(item(1, 1), item(1, 2));
        let key = KeyTuple::from_u64s(&[1]);
        let outcomes = [
            OpOutcome::GuardFailed {
                current: RowVersion { seq: 9, node_id: 1 },
            },
            OpOutcome::GuardUnevaluable {
                reason: "width".to_string(),
            },
            OpOutcome::NotFound,
        ];
        let actions: Vec<_> = outcomes
            .iter()
            .map(|outcome| resolver.resolve("t", key.clone(), &write, outcome).action)
            .collect();
        assert_eq!(
            actions,
            vec![
                ConflictAction::Reject,
                ConflictAction::Escalate,
                ConflictAction::Escalate
            ]
        );
        let applied = resolver.resolve(
            "t",
            key,
            &write,
            &OpOutcome::Applied {
                version: RowVersion::zero(),
                replaced: true,
            },
        );
        assert_eq!(applied.action, ConflictAction::Apply);
    }

    #[test]
    fn apply_is_not_a_valid_conflict_action() {
        let resolver = ConflictResolver::new(Arc::new(OldImage), ConflictAction::Apply);
        let record = resolver.resolve(
            "t",
            KeyTuple::from_u64s(&[1]),
            &ReplicatedWrite::delete(item(1, 1)),
            &OpOutcome::GuardFailed {
                current: RowVersion::zero(),
            },
        );
        assert_eq!(record.action, ConflictAction::Escalate);
    }

    #[test]
    fn prepared_inserts_carry_no_guard() {
        let resolver = ConflictResolver::new(Arc::new(MaxVersion { column: 1 }), ConflictAction::Reject);
        let op = resolver
            .prepare(&share(), &ReplicatedWrite::insert(item(4, 1)))
            .expect("prepare");
        assert_eq!(op.kind, OpKind::Insert);
        assert!(op.guard.is_none());

        let op = resolver
            .prepare(&share(), &ReplicatedWrite::update(item(4, 1), item(4, 2)))
            .expect("prepare");
        assert_eq!(op.kind, OpKind::Update);
        assert!(op.guard.is_some());
    }
}
