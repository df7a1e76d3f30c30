//! Session context and transaction manager.
//!
//! A [`SessionContext`] belongs to one logical thread of control and is used
//! through `&mut self` only. It owns at most one cluster transaction, the
//! batching arena, and plain counters. Every operation that needs the
//! transaction takes an explicit [`TransactionHandle`]; a handle whose
//! generation no longer matches the active transaction is stale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use holo_cluster::{ClusterConnection, ClusterError, KeyTuple, NodeId, OpOutcome, PartitionId, TxnId};
use tracing::{debug, info_span, warn, Instrument};

use crate::batch::{BatchBuffer, BatchSlot, BatchedOperation, FlushReport};
use crate::config::BridgeConfig;
use crate::conflict::ConflictRecord;
use crate::error::{BridgeError, BridgeResult};
use crate::handler::RowHandler;
use crate::metrics::{BridgeMetrics, SessionCounters};
use crate::share::{ShareRef, ShareRegistry, ShareState, TableShare};

/// Caller knowledge of which partition the next operation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHint {
    pub table: String,
    pub partition: PartitionId,
}

impl PartitionHint {
    pub fn new(table: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            table: table.into(),
            partition,
        }
    }

    /// Hint for the partition that owns `key`.
    pub fn for_key(share: &TableShare, key: &KeyTuple) -> Self {
        Self::new(share.name(), share.partition_of(key))
    }
}

/// Transaction-scoped context passed to flush and cursor calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle {
    txn: TxnId,
    coordinator: NodeId,
    generation: u64,
}

impl TransactionHandle {
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn coordinator(&self) -> NodeId {
        self.coordinator
    }

    /// Session-local sequence number of the transaction.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
struct ActiveTransaction {
    handle: TransactionHandle,
    /// Started outside any statement; only `commit`/`abort` end it.
    explicit: bool,
    rollback_only: bool,
    conflicts: Vec<ConflictRecord>,
}

/// Per-session state shared by handlers, cursors and readers.
pub struct SessionContext {
    conn: Arc<dyn ClusterConnection>,
    registry: Arc<ShareRegistry>,
    config: BridgeConfig,
    metrics: Arc<BridgeMetrics>,
    txn: Option<ActiveTransaction>,
    generation: u64,
    batch: BatchBuffer,
    statement_depth: usize,
    counters: SessionCounters,
    unfolded: SessionCounters,
    row_deltas: BTreeMap<String, i64>,
    changed_tables: BTreeSet<String>,
    open_tables: HashMap<String, ShareRef>,
    next_cursor_id: u64,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("txn", &self.txn.as_ref().map(|active| active.handle))
            .field("statement_depth", &self.statement_depth)
            .field("pending_ops", &self.batch.pending_ops())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn new(
        conn: Arc<dyn ClusterConnection>,
        registry: Arc<ShareRegistry>,
        config: BridgeConfig,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let batch = BatchBuffer::new(config.batch_flush_bytes, config.arena_capacity_bytes);
        Self {
            conn,
            registry,
            config,
            metrics,
            txn: None,
            generation: 0,
            batch,
            statement_depth: 0,
            counters: SessionCounters::default(),
            unfolded: SessionCounters::default(),
            row_deltas: BTreeMap::new(),
            changed_tables: BTreeSet::new(),
            open_tables: HashMap::new(),
            next_cursor_id: 0,
        }
    }

    pub fn connection(&self) -> &Arc<dyn ClusterConnection> {
        &self.conn
    }

    pub fn registry(&self) -> &Arc<ShareRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    /// Counters accumulated over the whole session.
    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    pub fn statement_depth(&self) -> usize {
        self.statement_depth
    }

    pub fn has_active_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub fn active_transaction(&self) -> Option<TransactionHandle> {
        self.txn.as_ref().map(|active| active.handle)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.txn.as_ref().is_some_and(|active| active.rollback_only)
    }

    /// Uncommitted row-count change this session made to `table`.
    pub fn row_delta(&self, table: &str) -> i64 {
        self.row_deltas.get(table).copied().unwrap_or(0)
    }

    /// Tables written by the active transaction.
    pub fn changed_tables(&self) -> impl Iterator<Item = &str> {
        self.changed_tables.iter().map(String::as_str)
    }

    /// Conflict records of the active transaction.
    pub fn conflict_records(&self) -> &[ConflictRecord] {
        self.txn
            .as_ref()
            .map(|active| active.conflicts.as_slice())
            .unwrap_or(&[])
    }

    pub fn pending_ops(&self) -> usize {
        self.batch.pending_ops()
    }

    pub fn arena_used(&self) -> usize {
        self.batch.arena_used()
    }

    /// Opens a handler on `name`, creating the table share on first use.
    pub async fn open_table(&mut self, name: &str) -> BridgeResult<RowHandler> {
        if let Some(share) = self
            .open_tables
            .get(name)
            .filter(|share| share.state() != ShareState::Dropped)
            .cloned()
        {
            return Ok(RowHandler::new(share));
        }
        let share = self.registry.acquire(name, &*self.conn).await?;
        self.open_tables.insert(name.to_string(), share.clone());
        Ok(RowHandler::new(share))
    }

    /// Releases this session's reference to `name`. Tables written by the
    /// active transaction stay open until it ends.
    pub fn close_table(&mut self, name: &str) -> bool {
        if self.changed_tables.contains(name) {
            return false;
        }
        self.open_tables.remove(name).is_some()
    }

    /// Returns the active transaction or starts one, optionally on the
    /// coordinator that owns the hinted partition.
    pub async fn start(&mut self, hint: Option<&PartitionHint>) -> BridgeResult<TransactionHandle> {
        if let Some(active) = &self.txn {
            self.metrics.record_txn_reused();
            return Ok(active.handle);
        }
        let explicit = self.statement_depth == 0;
        self.begin(hint, explicit).await
    }

    async fn begin(
        &mut self,
        hint: Option<&PartitionHint>,
        explicit: bool,
    ) -> BridgeResult<TransactionHandle> {
        if !self.conn.is_connected() {
            return Err(BridgeError::NoConnection);
        }
        let preferred = match hint {
            Some(hint) if self.config.use_partition_hints => Some(
                self.conn
                    .partition_primary(&hint.table, hint.partition)
                    .map_err(|err| BridgeError::cluster(err, "start"))?,
            ),
            _ => None,
        };
        let span = info_span!("holo_bridge.start", preferred = ?preferred);
        let started = self
            .conn
            .start_transaction(preferred)
            .instrument(span)
            .await
            .map_err(|err| BridgeError::cluster(err, "start"))?;

        let hinted = preferred == Some(started.coordinator);
        self.bump(|counters| counters.record_coordinator(started.coordinator, hinted));
        self.generation += 1;
        let handle = TransactionHandle {
            txn: started.txn,
            coordinator: started.coordinator,
            generation: self.generation,
        };
        self.txn = Some(ActiveTransaction {
            handle,
            explicit,
            rollback_only: false,
            conflicts: Vec::new(),
        });
        self.metrics.record_txn_started();
        debug!(
            txn = %handle.txn,
            coordinator = handle.coordinator,
            hinted,
            explicit,
            "holobridge transaction started"
        );
        Ok(handle)
    }

    /// Flushes pending work, checks for leaked cursors and commits.
    pub async fn commit(&mut self) -> BridgeResult<()> {
        let Some(active) = self.txn.as_ref() else {
            return Err(BridgeError::TransactionGone {
                operation: "commit",
            });
        };
        let handle = active.handle;
        if active.rollback_only {
            let _ = self.rollback_cluster(handle).await;
            self.finish(false);
            return Err(BridgeError::TransactionAborted {
                txn: handle.txn,
                operation: "commit",
            });
        }

        let report = self
            .flush_with(&handle, self.config.per_row_error_tolerance)
            .await?;
        // Decision: per-row errors nobody has observed must not commit silently.
        if let Some(row_error) = report.errors.first() {
            let err = BridgeError::BatchAborted {
                slot: row_error.slot,
                reason: format!("{} flushed at commit", row_error.error),
            };
            let _ = self.rollback_cluster(handle).await;
            self.finish(false);
            return Err(err);
        }

        let leaked = self.conn.open_scans(handle.txn);
        if !leaked.is_empty() {
            self.metrics.record_cursor_leaks(leaked.len());
            for scan in &leaked {
                self.conn.close_scan(*scan);
            }
            if self.config.strict_cursor_accounting {
                let _ = self.rollback_cluster(handle).await;
                self.finish(false);
                return Err(BridgeError::CursorLeak {
                    count: leaked.len(),
                    operation: "commit",
                });
            }
            warn!(txn = %handle.txn, leaked = leaked.len(), "holobridge closed leaked cursors at commit");
        }

        let span = info_span!("holo_bridge.commit", txn = %handle.txn);
        match self.conn.commit(handle.txn).instrument(span).await {
            Ok(()) => {
                self.finish(true);
                Ok(())
            }
            Err(err) => {
                let err = BridgeError::cluster(err, "commit");
                self.finish(false);
                Err(err)
            }
        }
    }

    /// Rolls back the active transaction and releases it.
    pub async fn abort(&mut self) -> BridgeResult<()> {
        let Some(active) = self.txn.as_ref() else {
            return Err(BridgeError::TransactionGone { operation: "abort" });
        };
        let handle = active.handle;
        let result = self.rollback_cluster(handle).await;
        self.finish(false);
        result
    }

    async fn rollback_cluster(&self, handle: TransactionHandle) -> BridgeResult<()> {
        let span = info_span!("holo_bridge.abort", txn = %handle.txn);
        match self.conn.rollback(handle.txn).instrument(span).await {
            Ok(())
            | Err(ClusterError::TransactionAborted { .. })
            | Err(ClusterError::UnknownTransaction { .. }) => Ok(()),
            Err(err) => {
                warn!(txn = %handle.txn, error = %err, "holobridge rollback failed; releasing locally");
                Err(BridgeError::cluster(err, "abort"))
            }
        }
    }

    /// Enters a statement, starting or reusing the transaction.
    pub async fn start_statement(
        &mut self,
        hint: Option<&PartitionHint>,
    ) -> BridgeResult<TransactionHandle> {
        let handle = match &self.txn {
            Some(active) => {
                self.metrics.record_txn_reused();
                active.handle
            }
            None => self.begin(hint, false).await?,
        };
        self.statement_depth += 1;
        Ok(handle)
    }

    /// Leaves a statement. Only the outermost end of a transaction the
    /// statement itself started commits or aborts it; anything else that
    /// fails marks the transaction rollback-only.
    pub async fn end_statement(&mut self, commit: bool) -> BridgeResult<()> {
        if self.statement_depth == 0 {
            return Err(BridgeError::TransactionGone {
                operation: "end_statement",
            });
        }
        self.statement_depth -= 1;
        let depth = self.statement_depth;
        let Some(active) = self.txn.as_mut() else {
            return Ok(());
        };
        if depth > 0 || active.explicit {
            if !commit && !active.rollback_only {
                active.rollback_only = true;
                debug!(txn = %active.handle.txn, depth, "holobridge transaction marked rollback-only");
            }
            return Ok(());
        }
        if commit {
            self.commit().await
        } else {
            self.abort().await
        }
    }

    pub fn mark_rollback_only(&mut self) {
        if let Some(active) = self.txn.as_mut() {
            active.rollback_only = true;
        }
    }

    /// Copies `op` into the batching arena under the active transaction.
    pub fn enqueue(&mut self, handle: &TransactionHandle, op: BatchedOperation) -> BridgeResult<BatchSlot> {
        self.check_handle(handle, "enqueue")?;
        self.batch.enqueue(op)
    }

    /// Flushes only when buffered bytes reached the configured threshold.
    pub async fn maybe_flush(&mut self, handle: &TransactionHandle) -> BridgeResult<FlushReport> {
        self.maybe_flush_with(handle, self.config.per_row_error_tolerance)
            .await
    }

    pub(crate) async fn maybe_flush_with(
        &mut self,
        handle: &TransactionHandle,
        tolerate_row_errors: bool,
    ) -> BridgeResult<FlushReport> {
        self.check_handle(handle, "flush")?;
        if !self.batch.should_flush() {
            return Ok(FlushReport::default());
        }
        self.flush_with(handle, tolerate_row_errors).await
    }

    pub async fn force_flush(&mut self, handle: &TransactionHandle) -> BridgeResult<FlushReport> {
        self.flush_with(handle, self.config.per_row_error_tolerance)
            .await
    }

    pub(crate) async fn flush_with(
        &mut self,
        handle: &TransactionHandle,
        tolerate_row_errors: bool,
    ) -> BridgeResult<FlushReport> {
        self.check_handle(handle, "flush")?;
        match self
            .batch
            .flush(&*self.conn, handle.txn, tolerate_row_errors)
            .await
        {
            Ok(report) => {
                if report.round_trips > 0 {
                    let rows = (report.applied + report.errors.len()) as u64;
                    let errors = report.errors.len() as u64;
                    self.bump(|counters| {
                        counters.execute_count += 1;
                        counters.rows_flushed += rows;
                        counters.row_errors += errors;
                    });
                }
                Ok(report)
            }
            Err(err) => {
                if matches!(err, BridgeError::BatchAborted { .. }) {
                    self.bump(|counters| {
                        counters.execute_count += 1;
                        counters.row_errors += 1;
                    });
                }
                Err(self.fail(err))
            }
        }
    }

    /// Withdraws operations enqueued by a caller that gave up before flushing.
    pub(crate) fn cancel_pending(&mut self, slots: impl IntoIterator<Item = BatchSlot>) {
        let slots: Vec<BatchSlot> = slots.into_iter().collect();
        let cancelled = self.batch.cancel(&slots);
        if cancelled > 0 {
            debug!(cancelled, "holobridge withdrew pending operations");
        }
    }

    pub fn take_outcome(&mut self, slot: BatchSlot) -> BridgeResult<OpOutcome> {
        self.batch.take_outcome(slot)
    }

    /// Ends the session, aborting any in-flight transaction.
    pub async fn end(mut self) -> BridgeResult<()> {
        let result = if self.txn.is_some() {
            self.abort().await
        } else {
            Ok(())
        };
        self.open_tables.clear();
        result
    }

    fn check_handle(&self, handle: &TransactionHandle, operation: &'static str) -> BridgeResult<()> {
        match &self.txn {
            Some(active) if active.handle.generation == handle.generation => Ok(()),
            Some(_) => Err(BridgeError::TransactionGone { operation }),
            None => Err(BridgeError::NoActiveTransaction { operation }),
        }
    }

    /// Whether `handle` still names the active transaction.
    pub(crate) fn is_current(&self, handle: &TransactionHandle) -> bool {
        self.check_handle(handle, "check").is_ok()
    }

    /// Releases the transaction locally when `err` leaves it unusable.
    pub(crate) fn fail(&mut self, err: BridgeError) -> BridgeError {
        if err.aborts_transaction() {
            if let Some(active) = &self.txn {
                warn!(txn = %active.handle.txn, error = %err, "holobridge aborting transaction after error");
                self.finish(false);
            }
        }
        err
    }

    fn finish(&mut self, committed: bool) {
        let Some(active) = self.txn.take() else {
            return;
        };
        self.conn.close_transaction(active.handle.txn);
        self.batch.discard();
        self.statement_depth = 0;
        let deltas = std::mem::take(&mut self.row_deltas);
        let changed = std::mem::take(&mut self.changed_tables);
        if committed {
            for table in &changed {
                if let Some(share) = self.open_tables.get(table) {
                    share.apply_commit(deltas.get(table).copied().unwrap_or(0));
                }
            }
            self.metrics.record_txn_committed();
        } else {
            self.metrics.record_txn_aborted();
        }
        self.metrics.fold_session(&self.unfolded);
        self.unfolded = SessionCounters::default();
        debug!(
            txn = %active.handle.txn,
            committed,
            conflicts = active.conflicts.len(),
            "holobridge transaction finished"
        );
    }

    fn bump(&mut self, update: impl Fn(&mut SessionCounters)) {
        update(&mut self.counters);
        update(&mut self.unfolded);
    }

    pub(crate) fn note_row_change(&mut self, table: &str, delta: i64) {
        self.changed_tables.insert(table.to_string());
        *self.row_deltas.entry(table.to_string()).or_default() += delta;
    }

    pub(crate) fn record_scan(&mut self, pruned: bool) {
        self.bump(|counters| {
            counters.scan_count += 1;
            if pruned {
                counters.pruned_scan_count += 1;
            }
        });
    }

    pub(crate) fn record_conflict(&mut self, record: ConflictRecord) {
        self.metrics.record_conflict(record.action);
        if let Some(active) = self.txn.as_mut() {
            active.conflicts.push(record);
        }
    }

    pub(crate) fn next_cursor_id(&mut self) -> u64 {
        self.next_cursor_id += 1;
        self.next_cursor_id
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Some(active) = self.txn.take() {
            warn!(
                txn = %active.handle.txn,
                "holobridge session dropped with an active transaction; aborting"
            );
            self.conn.close_transaction(active.handle.txn);
            self.metrics.record_txn_aborted();
        }
        self.metrics.fold_session(&self.unfolded);
    }
}
