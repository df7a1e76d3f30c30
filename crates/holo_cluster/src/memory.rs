//! In-process cluster used by tests and the workload driver.
//!
//! Rows live in per-partition ordered maps keyed by primary key. Writes are
//! applied eagerly and recorded in a per-transaction undo log; rollback (or
//! an aborting per-row error) replays the undo log in reverse. Scans are
//! resumable positions over the current partition contents, so pages never
//! repeat or skip a row that existed across the whole scan.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::types::{
    bound_contains, key_from_columns, partition_for_key, ClusterOp, ColumnValue, ExecMode,
    ExecResult, KeyAccess, KeyTuple, LargeObjectHandle, NodeId, OpKind, OpOutcome, PartitionId,
    Row, RowVersion, ScanAccess, ScanBatch, ScanId, ScanRequest, ScannedRow, StartedTransaction,
    TableDef, TableStatistics, TxnId, WriteGuard,
};
use crate::ClusterConnection;

/// Shape and limits of an [`InMemoryCluster`].
#[derive(Debug, Clone)]
pub struct InMemoryClusterConfig {
    pub data_nodes: Vec<NodeId>,
    /// Maximum concurrently open transactions before `start` is rejected.
    pub max_transactions: usize,
    /// Artificial latency added to every round trip.
    pub round_trip_delay: Duration,
}

impl Default for InMemoryClusterConfig {
    fn default() -> Self {
        Self {
            data_nodes: vec![1, 2],
            max_transactions: 1024,
            round_trip_delay: Duration::ZERO,
        }
    }
}

/// In-process [`ClusterConnection`] with failure injection hooks.
#[derive(Debug)]
pub struct InMemoryCluster {
    config: InMemoryClusterConfig,
    connected: AtomicBool,
    round_trips: AtomicU64,
    execute_round_trips: AtomicU64,
    state: Mutex<ClusterState>,
}

#[derive(Debug, Default)]
struct ClusterState {
    tables: BTreeMap<String, TableState>,
    transactions: HashMap<TxnId, TxnState>,
    scans: HashMap<ScanId, ScanState>,
    large_objects: HashMap<LargeObjectHandle, Bytes>,
    unavailable_nodes: BTreeSet<NodeId>,
    next_txn: u64,
    next_scan: u64,
    next_large_object: u64,
    next_seq: u64,
    next_coordinator: usize,
}

#[derive(Debug)]
struct TableState {
    def: TableDef,
    partitions: Vec<BTreeMap<KeyTuple, StoredRow>>,
    next_tuple_id: u64,
    commit_count: u64,
}

#[derive(Debug, Clone)]
struct StoredRow {
    columns: Vec<ColumnValue>,
    version: RowVersion,
}

impl StoredRow {
    fn to_row(&self) -> Row {
        Row::new(self.columns.clone()).with_version(self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct TxnState {
    coordinator: NodeId,
    status: TxnStatus,
    undo: Vec<UndoEntry>,
    touched: BTreeSet<String>,
}

#[derive(Debug)]
struct UndoEntry {
    table: String,
    partition: usize,
    key: KeyTuple,
    previous: Option<StoredRow>,
}

/// Resume position: bound index, sort key, primary key of the last row sent.
type ScanPosition = (usize, KeyTuple, KeyTuple);

#[derive(Debug)]
struct ScanState {
    txn: TxnId,
    request: ScanRequest,
    position: Option<ScanPosition>,
    done: bool,
}

impl InMemoryCluster {
    pub fn new(config: InMemoryClusterConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(true),
            round_trips: AtomicU64::new(0),
            execute_round_trips: AtomicU64::new(0),
            state: Mutex::new(ClusterState::default()),
        }
    }

    /// Registers a table in the catalog (stands in for DDL).
    pub fn create_table(&self, def: TableDef) -> ClusterResult<()> {
        if def.partitions == 0 {
            return Err(ClusterError::InvalidRequest(format!(
                "table '{}' needs at least one partition",
                def.name
            )));
        }
        if def.primary_key.is_empty() {
            return Err(ClusterError::InvalidRequest(format!(
                "table '{}' has no primary key",
                def.name
            )));
        }
        let column_count = def.columns.len();
        let positions_valid = def.primary_key.iter().all(|pos| *pos < column_count)
            && def
                .indexes
                .iter()
                .all(|index| index.columns.iter().all(|pos| *pos < column_count));
        if !positions_valid {
            return Err(ClusterError::InvalidRequest(format!(
                "table '{}' references a column outside its definition",
                def.name
            )));
        }

        let mut state = self.state();
        let partitions = (0..def.partitions).map(|_| BTreeMap::new()).collect();
        state.tables.insert(
            def.name.clone(),
            TableState {
                def,
                partitions,
                next_tuple_id: 1,
                commit_count: 0,
            },
        );
        Ok(())
    }

    /// Drops a table from the catalog.
    pub fn drop_table(&self, table: &str) -> bool {
        self.state().tables.remove(table).is_some()
    }

    /// Bumps the schema version of a table (stands in for an online alter).
    pub fn bump_schema_version(&self, table: &str) -> ClusterResult<u32> {
        let mut state = self.state();
        let table_state = state
            .tables
            .get_mut(table)
            .ok_or_else(|| ClusterError::UnknownTable {
                table: table.to_string(),
            })?;
        table_state.def.schema_version = table_state.def.schema_version.saturating_add(1);
        Ok(table_state.def.schema_version)
    }

    /// Writes a committed row outside any client transaction, as another
    /// cluster client would. Returns the stored version.
    pub fn write_row_direct(&self, table: &str, columns: Vec<ColumnValue>) -> ClusterResult<RowVersion> {
        let mut state = self.state();
        let node = self.config.data_nodes.first().copied().unwrap_or(0);
        let ClusterState {
            tables,
            large_objects,
            next_seq,
            next_large_object,
            ..
        } = &mut *state;
        let table_state = tables.get_mut(table).ok_or_else(|| ClusterError::UnknownTable {
            table: table.to_string(),
        })?;
        if columns.len() != table_state.def.columns.len() {
            return Err(ClusterError::InvalidRequest(format!(
                "row for '{table}' has {} columns, expected {}",
                columns.len(),
                table_state.def.columns.len()
            )));
        }
        let key = table_state.def.primary_key_of(&columns).ok_or_else(|| {
            ClusterError::InvalidRequest(format!("row for '{table}' has no usable primary key"))
        })?;
        let partition = partition_for_key(&key, table_state.def.partitions) as usize;
        *next_seq += 1;
        let version = RowVersion {
            seq: *next_seq,
            node_id: node,
        };
        let stored = store_columns(columns, &table_state.def, large_objects, next_large_object);
        table_state.partitions[partition].insert(
            key,
            StoredRow {
                columns: stored,
                version,
            },
        );
        table_state.commit_count += 1;
        Ok(version)
    }

    /// Deletes a committed row outside any client transaction.
    pub fn delete_row_direct(&self, table: &str, key: &KeyTuple) -> ClusterResult<bool> {
        let mut state = self.state();
        let table_state = state
            .tables
            .get_mut(table)
            .ok_or_else(|| ClusterError::UnknownTable {
                table: table.to_string(),
            })?;
        let partition = partition_for_key(key, table_state.def.partitions) as usize;
        let removed = table_state.partitions[partition].remove(key).is_some();
        if removed {
            table_state.commit_count += 1;
        }
        Ok(removed)
    }

    /// Reads the current stored image of a row.
    pub fn read_row(&self, table: &str, key: &KeyTuple) -> Option<Row> {
        let state = self.state();
        let table_state = state.tables.get(table)?;
        let partition = partition_for_key(key, table_state.def.partitions) as usize;
        table_state.partitions[partition].get(key).map(StoredRow::to_row)
    }

    /// All rows currently stored in one partition, in primary key order.
    pub fn partition_rows(&self, table: &str, partition: PartitionId) -> Vec<Row> {
        let state = self.state();
        state
            .tables
            .get(table)
            .and_then(|table_state| table_state.partitions.get(partition as usize))
            .map(|rows| rows.values().map(StoredRow::to_row).collect())
            .unwrap_or_default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Marks a data node up or down. Transactions coordinated by a down node
    /// fail their next round trip and are aborted.
    pub fn set_node_available(&self, node: NodeId, available: bool) {
        let mut state = self.state();
        if available {
            state.unavailable_nodes.remove(&node);
        } else {
            state.unavailable_nodes.insert(node);
        }
    }

    /// Total round trips served.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Round trips served by [`ClusterConnection::execute`].
    pub fn execute_round_trips(&self) -> u64 {
        self.execute_round_trips.load(Ordering::SeqCst)
    }

    /// Transaction handles not yet closed.
    pub fn open_transactions(&self) -> usize {
        self.state().transactions.len()
    }

    /// Scans not yet closed, across all transactions.
    pub fn open_scan_count(&self) -> usize {
        self.state().scans.len()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn round_trip(&self) -> ClusterResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ClusterError::Disconnected);
        }
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.config.round_trip_delay > Duration::ZERO {
            tokio::time::sleep(self.config.round_trip_delay).await;
        }
        Ok(())
    }
}

impl ClusterState {
    /// Validates that `txn` is open and its coordinator is reachable.
    fn ensure_active(&mut self, txn: TxnId) -> ClusterResult<NodeId> {
        let txn_state = self
            .transactions
            .get(&txn)
            .ok_or(ClusterError::UnknownTransaction { txn })?;
        match txn_state.status {
            TxnStatus::Active => {}
            TxnStatus::Aborted => return Err(ClusterError::TransactionAborted { txn }),
            TxnStatus::Committed => {
                return Err(ClusterError::InvalidRequest(format!(
                    "transaction {txn} is already committed"
                )))
            }
        }
        let coordinator = txn_state.coordinator;
        // Decision: a lost coordinator takes the transaction with it.
        if self.unavailable_nodes.contains(&coordinator) {
            self.abort_txn(txn);
            return Err(ClusterError::NodeUnavailable { node: coordinator });
        }
        Ok(coordinator)
    }

    fn abort_txn(&mut self, txn: TxnId) {
        let undo = match self.transactions.get_mut(&txn) {
            Some(txn_state) => {
                txn_state.status = TxnStatus::Aborted;
                std::mem::take(&mut txn_state.undo)
            }
            None => Vec::new(),
        };
        for entry in undo.into_iter().rev() {
            if let Some(table) = self.tables.get_mut(&entry.table) {
                let Some(partition) = table.partitions.get_mut(entry.partition) else {
                    continue;
                };
                match entry.previous {
                    Some(previous) => {
                        partition.insert(entry.key, previous);
                    }
                    None => {
                        partition.remove(&entry.key);
                    }
                }
            }
        }
        self.scans.retain(|_, scan| scan.txn != txn);
    }

    fn apply_op(&mut self, txn: TxnId, coordinator: NodeId, op: ClusterOp) -> ClusterResult<OpOutcome> {
        let ClusterState {
            tables,
            transactions,
            large_objects,
            next_seq,
            next_large_object,
            ..
        } = self;
        let table = tables.get_mut(&op.table).ok_or_else(|| ClusterError::UnknownTable {
            table: op.table.clone(),
        })?;

        let primary_key = match &op.access {
            KeyAccess::PrimaryKey(key) => Some(key.clone()),
            KeyAccess::UniqueIndex { index, key } => {
                if op.kind == OpKind::Insert {
                    return Err(ClusterError::InvalidRequest(
                        "inserts must address the primary key".to_string(),
                    ));
                }
                let columns = table
                    .def
                    .index(*index)
                    .filter(|def| def.unique)
                    .map(|def| def.columns.clone())
                    .ok_or_else(|| ClusterError::UnknownIndex {
                        table: op.table.clone(),
                        index: format!("{}", index.0),
                    })?;
                table.find_by_index(&columns, key)
            }
        };
        let Some(primary_key) = primary_key else {
            return Ok(OpOutcome::NotFound);
        };

        if op.kind.carries_row() {
            if op.columns.len() != table.def.columns.len() {
                return Err(ClusterError::InvalidRequest(format!(
                    "{} on '{}' carries {} columns, expected {}",
                    op.kind.as_str(),
                    op.table,
                    op.columns.len(),
                    table.def.columns.len()
                )));
            }
            if table.def.primary_key_of(&op.columns).as_ref() != Some(&primary_key) {
                return Err(ClusterError::InvalidRequest(format!(
                    "{} on '{}' row image does not match key {}",
                    op.kind.as_str(),
                    op.table,
                    primary_key
                )));
            }
        }

        let partition = partition_for_key(&primary_key, table.def.partitions) as usize;
        let existing = table.partitions[partition].get(&primary_key).cloned();

        if op.kind == OpKind::Read {
            return Ok(existing
                .map(|stored| OpOutcome::Found(stored.to_row()))
                .unwrap_or(OpOutcome::NotFound));
        }

        match (&op.kind, &existing) {
            (OpKind::Insert, Some(_)) => return Ok(OpOutcome::DuplicateKey),
            (OpKind::Update | OpKind::Delete, None) => return Ok(OpOutcome::NotFound),
            _ => {}
        }
        if let Some(stored) = existing.as_ref() {
            if let Some(rejection) = check_guard(op.guard.as_ref(), stored) {
                return Ok(rejection);
            }
        }
        if op.kind.carries_row() && table.unique_conflict(&op.columns, &primary_key) {
            return Ok(OpOutcome::DuplicateKey);
        }

        let txn_state = transactions
            .get_mut(&txn)
            .ok_or(ClusterError::UnknownTransaction { txn })?;
        let replaced = existing.is_some();
        txn_state.undo.push(UndoEntry {
            table: op.table.clone(),
            partition,
            key: primary_key.clone(),
            previous: existing,
        });
        txn_state.touched.insert(op.table.clone());

        if op.kind == OpKind::Delete {
            table.partitions[partition].remove(&primary_key);
            return Ok(OpOutcome::Deleted);
        }

        *next_seq += 1;
        let version = RowVersion {
            seq: *next_seq,
            node_id: coordinator,
        };
        let columns = store_columns(op.columns, &table.def, large_objects, next_large_object);
        table.partitions[partition].insert(primary_key, StoredRow { columns, version });
        Ok(OpOutcome::Applied { version, replaced })
    }

    fn fetch(&mut self, scan_id: ScanId, max_rows: usize) -> ClusterResult<ScanBatch> {
        let scan = self
            .scans
            .get(&scan_id)
            .ok_or(ClusterError::UnknownScan { scan: scan_id })?;
        if scan.done {
            return Ok(ScanBatch {
                rows: Vec::new(),
                done: true,
            });
        }
        let request = &scan.request;
        let table = self
            .tables
            .get(&request.table)
            .ok_or_else(|| ClusterError::UnknownTable {
                table: request.table.clone(),
            })?;
        let key_columns = match request.access {
            ScanAccess::PrimaryKey => table.def.primary_key.clone(),
            ScanAccess::OrderedIndex(index) => table
                .def
                .index(index)
                .map(|def| def.columns.clone())
                .ok_or_else(|| ClusterError::UnknownIndex {
                    table: request.table.clone(),
                    index: format!("{}", index.0),
                })?,
        };
        let partitions: Vec<usize> = match request.partition {
            Some(partition) => vec![partition as usize],
            None => (0..table.partitions.len()).collect(),
        };
        let unbounded = [(None, Bound::Unbounded, Bound::Unbounded)];
        let tagged: Vec<(Option<usize>, Bound<KeyTuple>, Bound<KeyTuple>)> = if request.bounds.is_empty() {
            unbounded.to_vec()
        } else {
            request
                .bounds
                .iter()
                .map(|bound| (Some(bound.range_no), bound.low.clone(), bound.high.clone()))
                .collect()
        };

        let mut candidates = Vec::new();
        for partition in partitions {
            let Some(rows) = table.partitions.get(partition) else {
                continue;
            };
            for (primary_key, stored) in rows {
                let Some(sort_key) = key_from_columns(&stored.columns, &key_columns) else {
                    continue;
                };
                for (bound_idx, (range_no, low, high)) in tagged.iter().enumerate() {
                    if bound_contains(&sort_key, low, high) {
                        candidates.push((bound_idx, sort_key.clone(), primary_key.clone(), *range_no, stored));
                    }
                }
            }
        }

        let descending = request.descending;
        candidates.sort_by(|left, right| {
            left.0.cmp(&right.0).then_with(|| {
                let ordering = (&left.1, &left.2).cmp(&(&right.1, &right.2));
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            })
        });
        if let Some((pos_idx, pos_key, pos_pk)) = scan.position.as_ref() {
            candidates.retain(|candidate| {
                if candidate.0 != *pos_idx {
                    return candidate.0 > *pos_idx;
                }
                let ordering = (&candidate.1, &candidate.2).cmp(&(pos_key, pos_pk));
                if descending {
                    ordering == std::cmp::Ordering::Less
                } else {
                    ordering == std::cmp::Ordering::Greater
                }
            });
        }

        let max_rows = max_rows.max(1);
        let done = candidates.len() <= max_rows;
        let mut rows = Vec::with_capacity(candidates.len().min(max_rows));
        let mut position = None;
        for (bound_idx, sort_key, primary_key, range_no, stored) in candidates.into_iter().take(max_rows) {
            rows.push(ScannedRow {
                range_no,
                row: stored.to_row(),
            });
            position = Some((bound_idx, sort_key, primary_key));
        }

        if let Some(scan) = self.scans.get_mut(&scan_id) {
            if position.is_some() {
                scan.position = position;
            }
            scan.done = done;
        }
        Ok(ScanBatch { rows, done })
    }
}

impl TableState {
    fn find_by_index(&self, columns: &[usize], key: &KeyTuple) -> Option<KeyTuple> {
        self.partitions.iter().find_map(|rows| {
            rows.iter()
                .find(|(_, stored)| key_from_columns(&stored.columns, columns).as_ref() == Some(key))
                .map(|(primary_key, _)| primary_key.clone())
        })
    }

    /// Returns `true` when `columns` would duplicate a non-null unique index
    /// key held by a different row.
    fn unique_conflict(&self, columns: &[ColumnValue], primary_key: &KeyTuple) -> bool {
        self.def.indexes.iter().filter(|index| index.unique).any(|index| {
            let Some(key) = key_from_columns(columns, &index.columns) else {
                return false;
            };
            if key.has_null() {
                return false;
            }
            self.partitions.iter().any(|rows| {
                rows.iter().any(|(other_pk, stored)| {
                    other_pk != primary_key
                        && key_from_columns(&stored.columns, &index.columns).as_ref() == Some(&key)
                })
            })
        })
    }
}

/// Evaluates an attached guard; `Some` means the write must not be applied.
fn check_guard(guard: Option<&WriteGuard>, stored: &StoredRow) -> Option<OpOutcome> {
    let guard = guard?;
    let failed = OpOutcome::GuardFailed {
        current: stored.version,
    };
    match guard {
        WriteGuard::VersionEquals(expected) => (stored.version != *expected).then_some(failed),
        WriteGuard::VersionColumnBelow {
            column,
            value,
            inclusive,
        } => match stored.columns.get(*column).and_then(ColumnValue::as_u64) {
            None => Some(OpOutcome::GuardUnevaluable {
                reason: format!("column {column} does not hold a u64 version"),
            }),
            Some(current) => {
                let passes = if *inclusive {
                    current <= *value
                } else {
                    current < *value
                };
                (!passes).then_some(failed)
            }
        },
        WriteGuard::RowEquals(image) => {
            if image.len() != stored.columns.len() {
                return Some(OpOutcome::GuardUnevaluable {
                    reason: format!(
                        "pre-image has {} columns, stored row has {}",
                        image.len(),
                        stored.columns.len()
                    ),
                });
            }
            let matches = image.iter().zip(stored.columns.iter()).all(|(expected, actual)| {
                matches!(expected, ColumnValue::LargeObject(_))
                    || matches!(actual, ColumnValue::LargeObject(_))
                    || expected == actual
            });
            (!matches).then_some(failed)
        }
    }
}

/// Moves large-object column payloads out of row.
fn store_columns(
    columns: Vec<ColumnValue>,
    def: &TableDef,
    large_objects: &mut HashMap<LargeObjectHandle, Bytes>,
    next_large_object: &mut u64,
) -> Vec<ColumnValue> {
    columns
        .into_iter()
        .zip(def.columns.iter())
        .map(|(value, column)| match value {
            ColumnValue::Scalar(bytes) if column.large_object => {
                *next_large_object += 1;
                let handle = LargeObjectHandle(*next_large_object);
                large_objects.insert(handle, bytes);
                ColumnValue::LargeObject(handle)
            }
            other => other,
        })
        .collect()
}

#[async_trait]
impl ClusterConnection for InMemoryCluster {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn data_nodes(&self) -> Vec<NodeId> {
        self.config.data_nodes.clone()
    }

    async fn fetch_table(&self, table: &str) -> ClusterResult<Option<TableDef>> {
        self.round_trip().await?;
        Ok(self.state().tables.get(table).map(|state| state.def.clone()))
    }

    async fn table_statistics(&self, table: &str) -> ClusterResult<TableStatistics> {
        self.round_trip().await?;
        let state = self.state();
        let table_state = state
            .tables
            .get(table)
            .ok_or_else(|| ClusterError::UnknownTable {
                table: table.to_string(),
            })?;
        let row_count: u64 = table_state
            .partitions
            .iter()
            .map(|rows| rows.len() as u64)
            .sum();
        let bytes: u64 = table_state
            .partitions
            .iter()
            .flat_map(|rows| rows.values())
            .map(|stored| stored.columns.iter().map(ColumnValue::payload_len).sum::<usize>() as u64)
            .sum();
        Ok(TableStatistics {
            row_count,
            commit_count: table_state.commit_count,
            row_size: if row_count == 0 { 0 } else { bytes / row_count },
            fragment_memory: bytes,
        })
    }

    async fn reserve_tuple_ids(&self, table: &str, count: u64) -> ClusterResult<u64> {
        self.round_trip().await?;
        let mut state = self.state();
        let table_state = state
            .tables
            .get_mut(table)
            .ok_or_else(|| ClusterError::UnknownTable {
                table: table.to_string(),
            })?;
        let first = table_state.next_tuple_id;
        table_state.next_tuple_id = first.saturating_add(count.max(1));
        Ok(first)
    }

    fn partition_primary(&self, table: &str, partition: PartitionId) -> ClusterResult<NodeId> {
        let state = self.state();
        let table_state = state
            .tables
            .get(table)
            .ok_or_else(|| ClusterError::UnknownTable {
                table: table.to_string(),
            })?;
        if partition >= table_state.def.partitions {
            return Err(ClusterError::InvalidRequest(format!(
                "partition {partition} out of range for '{table}'"
            )));
        }
        let nodes = &self.config.data_nodes;
        if nodes.is_empty() {
            return Err(ClusterError::InvalidRequest("cluster has no data nodes".to_string()));
        }
        Ok(nodes[partition as usize % nodes.len()])
    }

    async fn start_transaction(
        &self,
        coordinator: Option<NodeId>,
    ) -> ClusterResult<StartedTransaction> {
        self.round_trip().await?;
        let mut state = self.state();
        if state.transactions.len() >= self.config.max_transactions {
            return Err(ClusterError::TooManyTransactions {
                limit: self.config.max_transactions,
            });
        }
        let available: Vec<NodeId> = self
            .config
            .data_nodes
            .iter()
            .copied()
            .filter(|node| !state.unavailable_nodes.contains(node))
            .collect();
        if available.is_empty() {
            return Err(ClusterError::NodeUnavailable {
                node: coordinator.unwrap_or(0),
            });
        }
        // Decision: an unavailable preferred node falls back to round-robin.
        let coordinator = match coordinator {
            Some(node) if available.contains(&node) => node,
            _ => {
                let idx = state.next_coordinator % available.len();
                state.next_coordinator = state.next_coordinator.wrapping_add(1);
                available[idx]
            }
        };
        state.next_txn += 1;
        let txn = TxnId(state.next_txn);
        state.transactions.insert(
            txn,
            TxnState {
                coordinator,
                status: TxnStatus::Active,
                undo: Vec::new(),
                touched: BTreeSet::new(),
            },
        );
        debug!(txn = %txn, coordinator, "in-memory cluster started transaction");
        Ok(StartedTransaction { txn, coordinator })
    }

    async fn execute(
        &self,
        txn: TxnId,
        ops: Vec<ClusterOp>,
        mode: ExecMode,
    ) -> ClusterResult<ExecResult> {
        self.round_trip().await?;
        self.execute_round_trips.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let coordinator = state.ensure_active(txn)?;
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            let kind = op.kind;
            let outcome = state.apply_op(txn, coordinator, op)?;
            let abort = mode == ExecMode::AbortOnError && outcome.is_row_error(kind);
            outcomes.push(outcome);
            if abort {
                state.abort_txn(txn);
                return Ok(ExecResult {
                    outcomes,
                    aborted: true,
                });
            }
        }
        Ok(ExecResult {
            outcomes,
            aborted: false,
        })
    }

    async fn commit(&self, txn: TxnId) -> ClusterResult<()> {
        self.round_trip().await?;
        let mut state = self.state();
        state.ensure_active(txn)?;
        let touched = match state.transactions.get_mut(&txn) {
            Some(txn_state) => {
                txn_state.status = TxnStatus::Committed;
                txn_state.undo.clear();
                std::mem::take(&mut txn_state.touched)
            }
            None => BTreeSet::new(),
        };
        for table in touched {
            if let Some(table_state) = state.tables.get_mut(&table) {
                table_state.commit_count += 1;
            }
        }
        state.scans.retain(|_, scan| scan.txn != txn);
        Ok(())
    }

    async fn rollback(&self, txn: TxnId) -> ClusterResult<()> {
        self.round_trip().await?;
        let mut state = self.state();
        match state.transactions.get(&txn).map(|txn_state| txn_state.status) {
            None => Err(ClusterError::UnknownTransaction { txn }),
            Some(TxnStatus::Committed) => Err(ClusterError::InvalidRequest(format!(
                "transaction {txn} is already committed"
            ))),
            Some(_) => {
                state.abort_txn(txn);
                Ok(())
            }
        }
    }

    fn close_transaction(&self, txn: TxnId) {
        let mut state = self.state();
        let active = matches!(
            state.transactions.get(&txn).map(|txn_state| txn_state.status),
            Some(TxnStatus::Active)
        );
        if active {
            warn!(txn = %txn, "closing unfinished transaction; rolling back");
            state.abort_txn(txn);
        }
        state.transactions.remove(&txn);
        state.scans.retain(|_, scan| scan.txn != txn);
    }

    async fn open_scan(&self, txn: TxnId, request: ScanRequest) -> ClusterResult<ScanId> {
        self.round_trip().await?;
        let mut state = self.state();
        state.ensure_active(txn)?;
        let table = state
            .tables
            .get(&request.table)
            .ok_or_else(|| ClusterError::UnknownTable {
                table: request.table.clone(),
            })?;
        if let ScanAccess::OrderedIndex(index) = request.access {
            let ordered = table.def.index(index).map(|def| def.ordered).unwrap_or(false);
            if !ordered {
                return Err(ClusterError::UnknownIndex {
                    table: request.table.clone(),
                    index: format!("{}", index.0),
                });
            }
        }
        if let Some(partition) = request.partition {
            if partition >= table.def.partitions {
                return Err(ClusterError::InvalidRequest(format!(
                    "partition {partition} out of range for '{}'",
                    request.table
                )));
            }
        }
        state.next_scan += 1;
        let scan = ScanId(state.next_scan);
        state.scans.insert(
            scan,
            ScanState {
                txn,
                request,
                position: None,
                done: false,
            },
        );
        Ok(scan)
    }

    async fn fetch_scan(&self, scan: ScanId, max_rows: usize) -> ClusterResult<ScanBatch> {
        self.round_trip().await?;
        let mut state = self.state();
        let txn = state
            .scans
            .get(&scan)
            .map(|scan_state| scan_state.txn)
            .ok_or(ClusterError::UnknownScan { scan })?;
        state.ensure_active(txn)?;
        state.fetch(scan, max_rows)
    }

    fn close_scan(&self, scan: ScanId) {
        self.state().scans.remove(&scan);
    }

    fn open_scans(&self, txn: TxnId) -> Vec<ScanId> {
        let state = self.state();
        let mut scans: Vec<ScanId> = state
            .scans
            .iter()
            .filter(|(_, scan)| scan.txn == txn)
            .map(|(id, _)| *id)
            .collect();
        scans.sort();
        scans
    }

    async fn read_large_object(&self, handle: LargeObjectHandle) -> ClusterResult<Bytes> {
        self.round_trip().await?;
        self.state()
            .large_objects
            .get(&handle)
            .cloned()
            .ok_or_else(|| ClusterError::InvalidRequest(format!("unknown large object {}", handle.0)))
    }
}
