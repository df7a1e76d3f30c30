//! Deferred operation batching.
//!
//! Operations are copied into a session-owned arena at enqueue time, so the
//! caller may reuse its row buffers immediately. A flush ships every pending
//! operation in enqueue order as one execute round trip and parks each
//! outcome in its slot until the caller takes it.

use std::collections::HashMap;
use std::fmt;

use bytes::{Bytes, BytesMut};
use holo_cluster::{
    ClusterConnection, ClusterOp, ColumnValue, ExecMode, KeyAccess, KeyTuple, OpKind, OpOutcome,
    TxnId, WriteGuard,
};
use tracing::{debug, info_span, Instrument};

use crate::error::{BridgeError, BridgeResult};

/// Identity of one enqueued operation, unique for the session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchSlot(pub u64);

impl fmt::Display for BatchSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A pending write or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchedOperation {
    pub table: String,
    pub kind: OpKind,
    pub access: KeyAccess,
    pub columns: Vec<ColumnValue>,
    pub guard: Option<WriteGuard>,
    /// Originating range of a multi-range read.
    pub range_no: Option<usize>,
}

impl BatchedOperation {
    fn new(table: &str, kind: OpKind, access: KeyAccess, columns: Vec<ColumnValue>) -> Self {
        Self {
            table: table.to_string(),
            kind,
            access,
            columns,
            guard: None,
            range_no: None,
        }
    }

    pub fn insert(table: &str, key: KeyTuple, columns: Vec<ColumnValue>) -> Self {
        Self::new(table, OpKind::Insert, KeyAccess::PrimaryKey(key), columns)
    }

    pub fn update(table: &str, key: KeyTuple, columns: Vec<ColumnValue>) -> Self {
        Self::new(table, OpKind::Update, KeyAccess::PrimaryKey(key), columns)
    }

    pub fn write(table: &str, key: KeyTuple, columns: Vec<ColumnValue>) -> Self {
        Self::new(table, OpKind::Write, KeyAccess::PrimaryKey(key), columns)
    }

    pub fn delete(table: &str, key: KeyTuple) -> Self {
        Self::new(table, OpKind::Delete, KeyAccess::PrimaryKey(key), Vec::new())
    }

    pub fn read(table: &str, access: KeyAccess) -> Self {
        Self::new(table, OpKind::Read, access, Vec::new())
    }

    pub fn with_guard(mut self, guard: Option<WriteGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_range(mut self, range_no: usize) -> Self {
        self.range_no = Some(range_no);
        self
    }

    /// Buffered size used against the flush threshold: the row payload, or
    /// the key alone for operations that carry no row.
    pub fn estimated_bytes(&self) -> usize {
        if self.columns.is_empty() {
            self.access.key().encoded_len()
        } else {
            self.columns.iter().map(ColumnValue::payload_len).sum()
        }
    }

    /// Bytes copied into the arena for this operation.
    fn arena_bytes(&self) -> usize {
        let key: usize = self
            .access
            .key()
            .parts()
            .iter()
            .flatten()
            .map(Bytes::len)
            .sum();
        let guard = match &self.guard {
            Some(WriteGuard::RowEquals(image)) => scalar_bytes(image),
            _ => 0,
        };
        key + scalar_bytes(&self.columns) + guard
    }
}

fn scalar_bytes(columns: &[ColumnValue]) -> usize {
    columns
        .iter()
        .filter_map(ColumnValue::as_scalar)
        .map(Bytes::len)
        .sum()
}

/// Per-row failure kinds that stay local to one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowErrorKind {
    DuplicateKey,
    NotFound,
}

impl RowErrorKind {
    fn from_outcome(outcome: &OpOutcome, kind: OpKind) -> Option<Self> {
        match outcome {
            OpOutcome::DuplicateKey => Some(Self::DuplicateKey),
            OpOutcome::NotFound if kind != OpKind::Read => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl fmt::Display for RowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "duplicate key"),
            Self::NotFound => write!(f, "row not found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub slot: BatchSlot,
    pub kind: OpKind,
    pub range_no: Option<usize>,
    pub error: RowErrorKind,
}

/// Aggregate result of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Execute round trips issued (0 or 1).
    pub round_trips: usize,
    /// Operations that did not hit a per-row error.
    pub applied: usize,
    pub errors: Vec<RowError>,
}

#[derive(Debug)]
struct PendingOp {
    slot: BatchSlot,
    op: BatchedOperation,
}

/// Session-owned buffer of pending operations and their arena.
#[derive(Debug)]
pub struct BatchBuffer {
    arena: BytesMut,
    arena_used: usize,
    arena_capacity: usize,
    flush_threshold: usize,
    estimated_bytes: usize,
    pending: Vec<PendingOp>,
    completed: HashMap<BatchSlot, OpOutcome>,
    next_slot: u64,
}

impl BatchBuffer {
    pub fn new(flush_threshold: usize, arena_capacity: usize) -> Self {
        Self {
            arena: BytesMut::with_capacity(flush_threshold.min(arena_capacity)),
            arena_used: 0,
            arena_capacity,
            flush_threshold: flush_threshold.max(1),
            estimated_bytes: 0,
            pending: Vec::new(),
            completed: HashMap::new(),
            next_slot: 0,
        }
    }

    /// Copies `op` into the arena and returns its result slot.
    pub fn enqueue(&mut self, op: BatchedOperation) -> BridgeResult<BatchSlot> {
        let requested = op.arena_bytes();
        let available = self.arena_capacity.saturating_sub(self.arena_used);
        if requested > available {
            return Err(BridgeError::ArenaExhausted {
                requested,
                available,
            });
        }

        let estimated = op.estimated_bytes();
        let op = self.copy_into_arena(op);
        self.next_slot += 1;
        let slot = BatchSlot(self.next_slot);
        self.estimated_bytes += estimated;
        self.pending.push(PendingOp { slot, op });
        Ok(slot)
    }

    fn copy_into_arena(&mut self, op: BatchedOperation) -> BatchedOperation {
        let access = match op.access {
            KeyAccess::PrimaryKey(key) => KeyAccess::PrimaryKey(self.copy_key(&key)),
            KeyAccess::UniqueIndex { index, key } => KeyAccess::UniqueIndex {
                index,
                key: self.copy_key(&key),
            },
        };
        let columns = self.copy_columns(&op.columns);
        let guard = match op.guard {
            Some(WriteGuard::RowEquals(image)) => {
                Some(WriteGuard::RowEquals(self.copy_columns(&image)))
            }
            other => other,
        };
        BatchedOperation {
            table: op.table,
            kind: op.kind,
            access,
            columns,
            guard,
            range_no: op.range_no,
        }
    }

    fn copy_bytes(&mut self, bytes: &[u8]) -> Bytes {
        self.arena.extend_from_slice(bytes);
        self.arena_used += bytes.len();
        self.arena.split().freeze()
    }

    fn copy_key(&mut self, key: &KeyTuple) -> KeyTuple {
        KeyTuple::new(
            key.parts()
                .iter()
                .map(|part| part.as_ref().map(|bytes| self.copy_bytes(bytes)))
                .collect(),
        )
    }

    fn copy_columns(&mut self, columns: &[ColumnValue]) -> Vec<ColumnValue> {
        columns
            .iter()
            .map(|value| match value {
                ColumnValue::Scalar(bytes) => ColumnValue::Scalar(self.copy_bytes(bytes)),
                other => other.clone(),
            })
            .collect()
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub fn arena_used(&self) -> usize {
        self.arena_used
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty() && self.estimated_bytes >= self.flush_threshold
    }

    /// Removes and returns the outcome parked in `slot`.
    pub fn take_outcome(&mut self, slot: BatchSlot) -> BridgeResult<OpOutcome> {
        if let Some(outcome) = self.completed.remove(&slot) {
            return Ok(outcome);
        }
        let reason = if self.pending.iter().any(|pending| pending.slot == slot) {
            "has not been flushed yet"
        } else {
            "has no outcome"
        };
        Err(BridgeError::SlotUnavailable { slot, reason })
    }

    /// Drops the given pending operations. Arena space is reclaimed once
    /// nothing is left pending.
    pub fn cancel(&mut self, slots: &[BatchSlot]) -> usize {
        let before = self.pending.len();
        let mut released = 0;
        self.pending.retain(|pending| {
            let keep = !slots.contains(&pending.slot);
            if !keep {
                released += pending.op.estimated_bytes();
            }
            keep
        });
        self.estimated_bytes = self.estimated_bytes.saturating_sub(released);
        if self.pending.is_empty() {
            self.reset_arena();
        }
        before - self.pending.len()
    }

    /// Drops pending operations and parked outcomes (transaction end).
    pub fn discard(&mut self) {
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "holobridge discarded pending batch");
        }
        self.pending.clear();
        self.completed.clear();
        self.reset_arena();
    }

    fn reset_arena(&mut self) {
        self.arena.clear();
        self.arena_used = 0;
        self.estimated_bytes = 0;
    }

    /// Ships every pending operation as one round trip. Zero pending
    /// operations return an empty report without touching the cluster.
    pub async fn flush(
        &mut self,
        conn: &dyn ClusterConnection,
        txn: TxnId,
        tolerate_row_errors: bool,
    ) -> BridgeResult<FlushReport> {
        if self.pending.is_empty() {
            return Ok(FlushReport::default());
        }
        let pending = std::mem::take(&mut self.pending);
        let bytes = self.estimated_bytes;
        self.reset_arena();

        let mut slots = Vec::with_capacity(pending.len());
        let mut ops = Vec::with_capacity(pending.len());
        for PendingOp { slot, op } in pending {
            slots.push((slot, op.kind, op.range_no));
            ops.push(ClusterOp {
                table: op.table,
                kind: op.kind,
                access: op.access,
                columns: op.columns,
                guard: op.guard,
            });
        }
        let mode = if tolerate_row_errors {
            ExecMode::IgnoreError
        } else {
            ExecMode::AbortOnError
        };

        let span = info_span!("holo_bridge.flush", txn = %txn, ops = slots.len(), bytes);
        let result = conn
            .execute(txn, ops, mode)
            .instrument(span)
            .await
            .map_err(|err| BridgeError::cluster(err, "flush"))?;

        let mut report = FlushReport {
            round_trips: 1,
            ..FlushReport::default()
        };
        for ((slot, kind, range_no), outcome) in slots.iter().copied().zip(result.outcomes) {
            match RowErrorKind::from_outcome(&outcome, kind) {
                Some(error) => report.errors.push(RowError {
                    slot,
                    kind,
                    range_no,
                    error,
                }),
                None => report.applied += 1,
            }
            self.completed.insert(slot, outcome);
        }

        if result.aborted {
            let (slot, reason) = match report.errors.last() {
                Some(row_error) => (
                    row_error.slot,
                    format!("{} on {}", row_error.error, row_error.kind.as_str()),
                ),
                None => (
                    slots.last().map(|(slot, _, _)| *slot).unwrap_or(BatchSlot(0)),
                    "cluster aborted the transaction".to_string(),
                ),
            };
            return Err(BridgeError::BatchAborted { slot, reason });
        }
        debug!(
            txn = %txn,
            applied = report.applied,
            row_errors = report.errors.len(),
            "holobridge flushed batch"
        );
        Ok(report)
    }
}
