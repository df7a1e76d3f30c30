//! Row-level handler for one open table.
//!
//! A [`RowHandler`] is what a session gets back from
//! [`SessionContext::open_table`]. It holds a counted reference to the table
//! share and at most one scan cursor; everything transaction-scoped lives in
//! the session passed to each call.

use std::sync::Arc;

use holo_cluster::{ColumnValue, KeyTuple, OpOutcome, Row, TableStatistics, WriteGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::{BatchSlot, BatchedOperation, RowErrorKind};
use crate::conflict::{
    ConflictAction, ConflictClass, ConflictRecord, ConflictResolver, ExceptionSink, ReplicatedKind,
    ReplicatedWrite,
};
use crate::error::{BridgeError, BridgeResult};
use crate::mrr::{self, KeyRange, MultiRangeStream};
use crate::scan::{ScanCursor, ScanSpec};
use crate::session::{PartitionHint, SessionContext};
use crate::share::{LoggingPolicy, ShareRef, ShareState, TableShare};

/// Primary key of a written row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowId(pub KeyTuple);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted(RowId),
    /// [`WriteMode::Replace`] overwrote an existing row.
    Replaced(RowId),
    /// [`WriteMode::IgnoreDuplicates`] kept the existing row.
    Skipped(RowId),
    DuplicateKey,
    /// The table was altered or dropped after it was opened.
    Rejected,
}

/// How [`RowHandler::write`] treats a row whose key is already taken.
/// The mode stays in effect until changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    #[default]
    Insert,
    /// Overwrite the stored row with the same primary key.
    Replace,
    /// Leave the stored row alone and count the new one as skipped.
    IgnoreDuplicates,
}

impl WriteMode {
    fn tolerates_duplicates(self) -> bool {
        self == Self::IgnoreDuplicates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Ok,
    NotFound,
    /// The stored row changed since the old image was read.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Ok,
    NotFound,
}

/// Result of a bulk insert run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsertReport {
    pub inserted: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub duplicates: usize,
    /// Slot of the first duplicate, for error reporting.
    pub first_duplicate: Option<BatchSlot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerInfo {
    pub table: String,
    pub records: u64,
    pub statistics: TableStatistics,
    #[serde(skip)]
    pub state: ShareState,
    pub indexes: usize,
    pub hidden_key: bool,
    pub large_objects: bool,
    #[serde(skip)]
    pub logging: LoggingPolicy,
}

#[derive(Debug)]
pub struct RowHandler {
    share: ShareRef,
    cursor: Option<ScanCursor>,
    bulk: Option<Vec<(BatchSlot, WriteMode)>>,
    write_mode: WriteMode,
}

impl RowHandler {
    pub(crate) fn new(share: ShareRef) -> Self {
        Self {
            share,
            cursor: None,
            bulk: None,
            write_mode: WriteMode::default(),
        }
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    pub fn set_write_mode(&mut self, mode: WriteMode) {
        self.write_mode = mode;
    }

    pub fn share(&self) -> &TableShare {
        &self.share
    }

    pub fn table(&self) -> &str {
        self.share.name()
    }

    fn ensure_writable(&self, operation: &'static str) -> BridgeResult<()> {
        match self.share.state() {
            ShareState::Initial => Ok(()),
            state => Err(BridgeError::TableUnavailable {
                table: self.table().to_string(),
                state,
                operation,
            }),
        }
    }

    fn primary_key(&self, columns: &[ColumnValue]) -> BridgeResult<KeyTuple> {
        let def = self.share.definition();
        if columns.len() != def.columns.len() {
            return Err(BridgeError::InvalidRow {
                table: self.table().to_string(),
                reason: format!("{} columns given, table has {}", columns.len(), def.columns.len()),
            });
        }
        def.primary_key_of(columns)
            .filter(|key| !key.has_null())
            .ok_or_else(|| BridgeError::InvalidRow {
                table: self.table().to_string(),
                reason: "row has no usable primary key".to_string(),
            })
    }

    fn unexpected(operation: &'static str, outcome: &OpOutcome) -> BridgeError {
        BridgeError::Protocol {
            operation,
            detail: format!("unexpected outcome {outcome:?}"),
        }
    }

    /// Inserts `columns` under the handler's [`WriteMode`]. Outside bulk mode
    /// the row is flushed at once; inside, it is batched and duplicates
    /// surface at `end_bulk_insert`. For tables with a hidden key, column 0
    /// is overwritten with a fresh id.
    pub async fn write(
        &mut self,
        session: &mut SessionContext,
        mut columns: Vec<ColumnValue>,
    ) -> BridgeResult<WriteOutcome> {
        let state = self.share.state();
        if state != ShareState::Initial {
            debug!(table = %self.table(), state = ?state, "holobridge rejected write");
            return Ok(WriteOutcome::Rejected);
        }
        if self.share.has_hidden_key() {
            let id = self.next_auto_increment(session).await?;
            match columns.first_mut() {
                Some(slot) => *slot = ColumnValue::from_u64(id),
                None => columns.push(ColumnValue::from_u64(id)),
            }
        }
        let key = self.primary_key(&columns)?;
        let hint = PartitionHint::for_key(&self.share, &key);
        let handle = session.start(Some(&hint)).await?;
        let mode = self.write_mode;
        let op = match mode {
            WriteMode::Replace => BatchedOperation::write(self.table(), key.clone(), columns),
            WriteMode::Insert | WriteMode::IgnoreDuplicates => {
                BatchedOperation::insert(self.table(), key.clone(), columns)
            }
        };
        let slot = session.enqueue(&handle, op)?;
        let tolerate = mode.tolerates_duplicates() || session.config().per_row_error_tolerance;

        if let Some(pending) = self.bulk.as_mut() {
            pending.push((slot, mode));
            session.maybe_flush_with(&handle, tolerate).await?;
            return Ok(WriteOutcome::Inserted(RowId(key)));
        }

        session.flush_with(&handle, tolerate).await?;
        match (session.take_outcome(slot)?, mode) {
            (OpOutcome::Applied { replaced: true, .. }, _) => {
                session.note_row_change(self.share.name(), 0);
                Ok(WriteOutcome::Replaced(RowId(key)))
            }
            (OpOutcome::Applied { .. }, _) => {
                session.note_row_change(self.share.name(), 1);
                Ok(WriteOutcome::Inserted(RowId(key)))
            }
            (OpOutcome::DuplicateKey, WriteMode::IgnoreDuplicates) => {
                debug!(table = %self.table(), key = %key, "holobridge skipped duplicate row");
                Ok(WriteOutcome::Skipped(RowId(key)))
            }
            (OpOutcome::DuplicateKey, _) => Ok(WriteOutcome::DuplicateKey),
            (other, _) => Err(Self::unexpected("write", &other)),
        }
    }

    /// Enters bulk mode: writes are batched until the flush threshold.
    pub fn start_bulk_insert(&mut self) {
        if self.bulk.is_none() {
            self.bulk = Some(Vec::new());
        }
    }

    pub fn in_bulk_insert(&self) -> bool {
        self.bulk.is_some()
    }

    /// Leaves bulk mode, flushing what is still pending.
    pub async fn end_bulk_insert(&mut self, session: &mut SessionContext) -> BridgeResult<BulkInsertReport> {
        let Some(slots) = self.bulk.take() else {
            return Ok(BulkInsertReport::default());
        };
        let mut report = BulkInsertReport::default();
        if slots.is_empty() {
            return Ok(report);
        }
        let handle = session
            .active_transaction()
            .ok_or(BridgeError::NoActiveTransaction {
                operation: "end_bulk_insert",
            })?;
        let tolerate = slots.iter().any(|(_, mode)| mode.tolerates_duplicates())
            || session.config().per_row_error_tolerance;
        session.flush_with(&handle, tolerate).await?;
        for (slot, mode) in slots {
            match (session.take_outcome(slot)?, mode) {
                (OpOutcome::Applied { replaced: true, .. }, _) => report.replaced += 1,
                (OpOutcome::Applied { .. }, _) => report.inserted += 1,
                (OpOutcome::DuplicateKey, WriteMode::IgnoreDuplicates) => report.skipped += 1,
                (OpOutcome::DuplicateKey, _) => {
                    report.duplicates += 1;
                    report.first_duplicate.get_or_insert(slot);
                }
                (other, _) => return Err(Self::unexpected("bulk_insert", &other)),
            }
        }
        session.note_row_change(self.share.name(), report.inserted as i64);
        debug!(
            table = %self.table(),
            inserted = report.inserted,
            replaced = report.replaced,
            skipped = report.skipped,
            duplicates = report.duplicates,
            "holobridge bulk insert finished"
        );
        Ok(report)
    }

    /// Replaces `old` with `new`. When `old` carries a version the write is
    /// guarded by it. A changed primary key runs as delete plus insert in one
    /// flush.
    pub async fn update(
        &mut self,
        session: &mut SessionContext,
        old: &Row,
        new: Vec<ColumnValue>,
    ) -> BridgeResult<UpdateOutcome> {
        self.ensure_writable("update")?;
        let old_key = self.primary_key(&old.columns)?;
        let new_key = self.primary_key(&new)?;
        let guard = old.version.map(WriteGuard::VersionEquals);
        let hint = PartitionHint::for_key(&self.share, &old_key);
        let handle = session.start(Some(&hint)).await?;

        if old_key == new_key {
            let op = BatchedOperation::update(self.table(), old_key, new).with_guard(guard);
            let slot = session.enqueue(&handle, op)?;
            session.force_flush(&handle).await?;
            return match session.take_outcome(slot)? {
                OpOutcome::Applied { .. } => Ok(UpdateOutcome::Ok),
                OpOutcome::NotFound => Ok(UpdateOutcome::NotFound),
                OpOutcome::GuardFailed { .. } | OpOutcome::GuardUnevaluable { .. } => {
                    Ok(UpdateOutcome::Conflict)
                }
                OpOutcome::DuplicateKey => Err(BridgeError::RowFailed {
                    table: self.table().to_string(),
                    operation: "update",
                    slot,
                    error: RowErrorKind::DuplicateKey,
                }),
                other => Err(Self::unexpected("update", &other)),
            };
        }

        let delete = BatchedOperation::delete(self.table(), old_key.clone()).with_guard(guard);
        let insert = BatchedOperation::insert(self.table(), new_key.clone(), new);
        let delete_slot = session.enqueue(&handle, delete)?;
        let insert_slot = session.enqueue(&handle, insert)?;
        session.flush_with(&handle, true).await?;
        let deleted = session.take_outcome(delete_slot)?;
        let inserted = session.take_outcome(insert_slot)?;

        let outcome = match (&deleted, &inserted) {
            (OpOutcome::Deleted, OpOutcome::Applied { .. }) => return Ok(UpdateOutcome::Ok),
            (OpOutcome::Deleted, OpOutcome::DuplicateKey) => None,
            (OpOutcome::NotFound, _) => Some(UpdateOutcome::NotFound),
            (OpOutcome::GuardFailed { .. } | OpOutcome::GuardUnevaluable { .. }, _) => {
                Some(UpdateOutcome::Conflict)
            }
            (other, _) => return Err(Self::unexpected("update", other)),
        };

        // Undo whichever half applied so the pair stays atomic.
        let compensation = match (&deleted, &inserted) {
            (OpOutcome::Deleted, _) => {
                BatchedOperation::insert(self.table(), old_key, old.columns.clone())
            }
            (_, OpOutcome::Applied { .. }) => BatchedOperation::delete(self.table(), new_key),
            _ => {
                return outcome.ok_or_else(|| Self::unexpected("update", &inserted));
            }
        };
        let slot = session.enqueue(&handle, compensation)?;
        session.flush_with(&handle, true).await?;
        let undone = session.take_outcome(slot)?;
        if !matches!(undone, OpOutcome::Applied { .. } | OpOutcome::Deleted) {
            warn!(table = %self.table(), outcome = ?undone, "holobridge key-changing update compensation failed");
            session.mark_rollback_only();
        }
        match outcome {
            Some(outcome) => Ok(outcome),
            None => Err(BridgeError::RowFailed {
                table: self.table().to_string(),
                operation: "update",
                slot: insert_slot,
                error: RowErrorKind::DuplicateKey,
            }),
        }
    }

    /// Deletes the row identified by the primary key of `row`.
    pub async fn delete(&mut self, session: &mut SessionContext, row: &Row) -> BridgeResult<DeleteOutcome> {
        self.ensure_writable("delete")?;
        let key = self.primary_key(&row.columns)?;
        let hint = PartitionHint::for_key(&self.share, &key);
        let handle = session.start(Some(&hint)).await?;
        // Decision: deletes are not version guarded; a concurrent update does
        // not save the row.
        let slot = session.enqueue(&handle, BatchedOperation::delete(self.table(), key))?;
        session.force_flush(&handle).await?;
        match session.take_outcome(slot)? {
            OpOutcome::Deleted => {
                session.note_row_change(self.share.name(), -1);
                Ok(DeleteOutcome::Ok)
            }
            OpOutcome::NotFound => Ok(DeleteOutcome::NotFound),
            other => Err(Self::unexpected("delete", &other)),
        }
    }

    /// Starts a handler-owned scan, closing any previous one.
    pub async fn scan_init(&mut self, session: &mut SessionContext, spec: ScanSpec) -> BridgeResult<()> {
        self.scan_close();
        let mut cursor = ScanCursor::new(session);
        cursor.init(session, &self.share, spec).await?;
        self.cursor = Some(cursor);
        Ok(())
    }

    pub async fn scan_next(&mut self, session: &mut SessionContext) -> BridgeResult<Option<&Row>> {
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| BridgeError::InvalidScanSpec {
                reason: format!("no scan is open on '{}'", self.share.name()),
            })?;
        cursor.next(session).await
    }

    pub fn scan_close(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }

    /// Opens a multi-range read over index `index`.
    pub async fn lookup_multi(
        &mut self,
        session: &mut SessionContext,
        index: usize,
        ranges: Vec<KeyRange>,
        sorted: bool,
    ) -> BridgeResult<MultiRangeStream> {
        mrr::execute(session, &self.share, index, ranges, sorted).await
    }

    /// Applies one replicated change under the table's conflict policy.
    /// Escalated records are also handed to `sink`.
    pub async fn apply_replicated(
        &mut self,
        session: &mut SessionContext,
        write: ReplicatedWrite,
        sink: &mut dyn ExceptionSink,
    ) -> BridgeResult<ConflictRecord> {
        self.ensure_writable("apply_replicated")?;
        let resolver = self
            .share
            .conflict_resolver()
            .unwrap_or_else(|| Arc::new(ConflictResolver::unguarded()));
        let op = resolver.prepare(&self.share, &write)?;
        let key = op.access.key().clone();
        let hint = PartitionHint::for_key(&self.share, &key);
        let handle = session.start(Some(&hint)).await?;
        let slot = session.enqueue(&handle, op)?;
        session.flush_with(&handle, true).await?;
        let outcome = session.take_outcome(slot)?;
        let record = resolver.resolve(self.share.name(), key, &write, &outcome);

        match record.action {
            ConflictAction::Apply => {
                let delta = match write.kind {
                    ReplicatedKind::Insert => 1,
                    ReplicatedKind::Update => 0,
                    ReplicatedKind::Delete => -1,
                };
                session.note_row_change(self.share.name(), delta);
            }
            ConflictAction::Reject => {
                debug!(table = %record.table, key = %record.key, class = ?record.class, "holobridge rejected replicated write");
            }
            ConflictAction::Escalate => {
                info!(
                    table = %record.table,
                    key = %record.key,
                    class = ?record.class,
                    function = record.function,
                    "holobridge escalated replicated write"
                );
                sink.record(record.clone());
            }
        }
        debug_assert!(
            record.class == ConflictClass::NoConflict || record.action != ConflictAction::Apply
        );
        session.record_conflict(record.clone());
        Ok(record)
    }

    pub async fn next_auto_increment(&self, session: &mut SessionContext) -> BridgeResult<u64> {
        let prefetch = session.config().auto_increment_prefetch;
        self.share
            .next_auto_increment(&**session.connection(), prefetch)
            .await
    }

    /// Ends the current statement successfully. A bulk insert still open is
    /// finished first; a duplicate in it fails the statement.
    pub async fn commit_statement(&mut self, session: &mut SessionContext) -> BridgeResult<()> {
        self.scan_close();
        if self.bulk.is_some() {
            let report = match self.end_bulk_insert(session).await {
                Ok(report) => report,
                Err(err) => {
                    self.finish_statement(session, false).await?;
                    return Err(err);
                }
            };
            if let Some(slot) = report.first_duplicate {
                self.finish_statement(session, false).await?;
                return Err(BridgeError::RowFailed {
                    table: self.table().to_string(),
                    operation: "bulk_insert",
                    slot,
                    error: RowErrorKind::DuplicateKey,
                });
            }
        }
        self.finish_statement(session, true).await
    }

    pub async fn abort_statement(&mut self, session: &mut SessionContext) -> BridgeResult<()> {
        self.scan_close();
        self.bulk = None;
        self.finish_statement(session, false).await
    }

    async fn finish_statement(&mut self, session: &mut SessionContext, commit: bool) -> BridgeResult<()> {
        if session.statement_depth() > 0 {
            session.end_statement(commit).await
        } else if !session.has_active_transaction() {
            Ok(())
        } else if commit {
            session.commit().await
        } else {
            session.abort().await
        }
    }

    /// Committed row count plus this session's uncommitted change.
    pub fn records(&self, session: &SessionContext) -> u64 {
        let cached = self.share.statistics().row_count;
        cached.saturating_add_signed(session.row_delta(self.share.name()))
    }

    pub async fn info(&self, session: &mut SessionContext, refresh: bool) -> BridgeResult<HandlerInfo> {
        let statistics = if refresh {
            self.share.refresh_statistics(&**session.connection()).await?
        } else {
            self.share.statistics()
        };
        Ok(HandlerInfo {
            table: self.table().to_string(),
            records: statistics.row_count.saturating_add_signed(session.row_delta(self.share.name())),
            statistics,
            state: self.share.state(),
            indexes: self.share.indexes().len(),
            hidden_key: self.share.has_hidden_key(),
            large_objects: self.share.has_large_objects(),
            logging: self.share.logging_policy(),
        })
    }
}
