//! Scan cursor: streams rows of one (possibly pruned) scan one at a time.
//!
//! State machine:
//!
//! ```text
//! Idle -> Initialized -> Fetching -> RowReady -> ... -> Exhausted
//!   \__________\___________\___________\______________-> Closed
//! ```
//!
//! One cluster scan is opened per targeted partition. Ordered scans over
//! several partitions merge the per-partition streams by key; unordered scans
//! drain the streams one after another. Only one row is current at a time and
//! it is lent out, so it must be copied before the next call.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use holo_cluster::{
    key_from_columns, ClusterConnection, KeyTuple, PartitionId, Row, ScanAccess, ScanBound, ScanId,
    ScanRequest,
};
use tracing::{debug, info_span, Instrument};

use crate::error::{BridgeError, BridgeResult};
use crate::row::{materialize_row, LargeObjectSource};
use crate::session::{PartitionHint, SessionContext, TransactionHandle};
use crate::share::TableShare;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Unordered,
    Ascending,
    Descending,
}

/// What to scan. Bounds are given in traversal order: for a descending scan
/// `start` is the high end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec {
    /// Index number; `None` scans the whole table.
    pub index: Option<usize>,
    pub start: Bound<KeyTuple>,
    pub end: Bound<KeyTuple>,
    pub order: ScanOrder,
    /// Restricts the scan to one partition.
    pub partition: Option<PartitionId>,
}

impl ScanSpec {
    pub fn full_table() -> Self {
        Self {
            index: None,
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            order: ScanOrder::Unordered,
            partition: None,
        }
    }

    pub fn index_range(index: usize, start: Bound<KeyTuple>, end: Bound<KeyTuple>) -> Self {
        Self {
            index: Some(index),
            start,
            end,
            order: ScanOrder::Ascending,
            partition: None,
        }
    }

    pub fn ordered(mut self, order: ScanOrder) -> Self {
        self.order = order;
        self
    }

    pub fn pinned(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Idle,
    Initialized,
    Fetching,
    RowReady,
    Exhausted,
    Closed,
}

#[derive(Debug)]
struct PartitionStream {
    scan: ScanId,
    partition: PartitionId,
    buffer: VecDeque<Row>,
    done: bool,
}

/// Validated, cluster-ready form of a [`ScanSpec`].
#[derive(Debug)]
struct ScanPlan {
    access: ScanAccess,
    sort_columns: Vec<usize>,
    bounds: Vec<ScanBound>,
    partitions: Vec<PartitionId>,
    pruned: bool,
}

fn invalid(reason: impl Into<String>) -> BridgeError {
    BridgeError::InvalidScanSpec {
        reason: reason.into(),
    }
}

fn bound_key(bound: &Bound<KeyTuple>) -> Option<&KeyTuple> {
    match bound {
        Bound::Included(key) | Bound::Excluded(key) => Some(key),
        Bound::Unbounded => None,
    }
}

fn plan_scan(share: &TableShare, spec: &ScanSpec) -> BridgeResult<ScanPlan> {
    let def = share.definition();
    let (access, sort_columns, primary) = match spec.index {
        None => {
            if spec.start != Bound::Unbounded || spec.end != Bound::Unbounded {
                return Err(invalid("a full table scan takes no bounds"));
            }
            (ScanAccess::PrimaryKey, def.primary_key.clone(), true)
        }
        Some(number) => {
            let index = share.index(number).ok_or_else(|| {
                invalid(format!("index {number} does not exist on '{}'", share.name()))
            })?;
            if !index.is_active() {
                return Err(invalid(format!("index '{}' is not active", index.name)));
            }
            if !index.is_ordered() {
                return Err(invalid(format!("index '{}' has no ordered part", index.name)));
            }
            let access = match index.index_id {
                Some(id) if !index.is_primary() => ScanAccess::OrderedIndex(id),
                _ => ScanAccess::PrimaryKey,
            };
            (access, index.columns.clone(), index.is_primary())
        }
    };

    for key in [bound_key(&spec.start), bound_key(&spec.end)].into_iter().flatten() {
        if key.len() > sort_columns.len() {
            return Err(invalid(format!(
                "bound {key} has {} parts, index has {}",
                key.len(),
                sort_columns.len()
            )));
        }
    }
    let (low, high) = match spec.order {
        ScanOrder::Descending => (spec.end.clone(), spec.start.clone()),
        ScanOrder::Ascending | ScanOrder::Unordered => (spec.start.clone(), spec.end.clone()),
    };
    if let (Some(low_key), Some(high_key)) = (bound_key(&low), bound_key(&high)) {
        if low_key.cmp_prefix(high_key) == std::cmp::Ordering::Greater {
            return Err(invalid(format!(
                "start {} lies beyond end {} for a {:?} scan",
                bound_key(&spec.start).map(ToString::to_string).unwrap_or_default(),
                bound_key(&spec.end).map(ToString::to_string).unwrap_or_default(),
                spec.order
            )));
        }
    }

    let pinned = match spec.partition {
        Some(partition) if partition >= def.partitions => {
            return Err(invalid(format!(
                "partition {partition} out of range for '{}' ({} partitions)",
                share.name(),
                def.partitions
            )));
        }
        Some(partition) => Some(partition),
        // A full primary-key equality lives in exactly one partition.
        None => match (&low, &high) {
            (Bound::Included(low_key), Bound::Included(high_key))
                if primary
                    && low_key == high_key
                    && low_key.len() == def.primary_key.len()
                    && !low_key.has_null() =>
            {
                Some(share.partition_of(low_key))
            }
            _ => None,
        },
    };
    let partitions = match pinned {
        Some(partition) => vec![partition],
        None => (0..def.partitions).collect(),
    };
    let bounds = if low == Bound::Unbounded && high == Bound::Unbounded {
        Vec::new()
    } else {
        vec![ScanBound {
            range_no: 0,
            low,
            high,
        }]
    };

    Ok(ScanPlan {
        access,
        sort_columns,
        bounds,
        partitions,
        pruned: pinned.is_some(),
    })
}

/// Cursor over one scan, owned by a handler or a caller.
pub struct ScanCursor {
    id: u64,
    conn: Arc<dyn ClusterConnection>,
    table: String,
    state: CursorState,
    handle: Option<TransactionHandle>,
    order: ScanOrder,
    sort_columns: Vec<usize>,
    primary_key: Vec<usize>,
    streams: Vec<PartitionStream>,
    current: Option<Row>,
    batch_rows: usize,
    pruned: bool,
    delivered: u64,
}

impl std::fmt::Debug for ScanCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCursor")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl ScanCursor {
    pub fn new(session: &mut SessionContext) -> Self {
        Self {
            id: session.next_cursor_id(),
            conn: Arc::clone(session.connection()),
            table: String::new(),
            state: CursorState::Idle,
            handle: None,
            order: ScanOrder::Unordered,
            sort_columns: Vec::new(),
            primary_key: Vec::new(),
            streams: Vec::new(),
            current: None,
            batch_rows: session.config().scan_batch_rows.max(1),
            pruned: false,
            delivered: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// The row returned by the last successful `next`.
    pub fn current(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    /// Rows handed out so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    /// Partitions this cursor reads from.
    pub fn partitions(&self) -> Vec<PartitionId> {
        self.streams.iter().map(|stream| stream.partition).collect()
    }

    /// Validates `spec` and opens the cluster scans under the session's
    /// transaction (started if needed).
    pub async fn init(
        &mut self,
        session: &mut SessionContext,
        share: &TableShare,
        spec: ScanSpec,
    ) -> BridgeResult<()> {
        if self.state != CursorState::Idle {
            return Err(invalid(format!("cursor {} is already initialized", self.id)));
        }
        let plan = plan_scan(share, &spec)?;
        let hint = match plan.partitions.as_slice() {
            [partition] => Some(PartitionHint::new(share.name(), *partition)),
            _ => None,
        };
        let handle = session.start(hint.as_ref()).await?;

        self.table = share.name().to_string();
        self.order = spec.order;
        self.sort_columns = plan.sort_columns;
        self.primary_key = share.definition().primary_key.clone();
        self.pruned = plan.pruned;
        self.handle = Some(handle);

        for partition in plan.partitions {
            let request = ScanRequest {
                table: self.table.clone(),
                access: plan.access,
                partition: Some(partition),
                bounds: plan.bounds.clone(),
                descending: spec.order == ScanOrder::Descending,
            };
            let span = info_span!("holo_bridge.scan_open", cursor = self.id, table = %self.table, partition);
            match self.conn.open_scan(handle.txn(), request).instrument(span).await {
                Ok(scan) => {
                    self.streams.push(PartitionStream {
                        scan,
                        partition,
                        buffer: VecDeque::new(),
                        done: false,
                    });
                    session.record_scan(plan.pruned);
                }
                Err(err) => {
                    self.release();
                    self.state = CursorState::Closed;
                    return Err(session.fail(BridgeError::cluster(err, "scan_open")));
                }
            }
        }
        self.state = CursorState::Initialized;
        debug!(
            cursor = self.id,
            table = %self.table,
            streams = self.streams.len(),
            pruned = self.pruned,
            "holobridge cursor initialized"
        );
        Ok(())
    }

    /// Advances to the next row. `None` reports exhaustion; later calls keep
    /// returning `None` without touching the cluster.
    pub async fn next(&mut self, session: &mut SessionContext) -> BridgeResult<Option<&Row>> {
        match self.state {
            CursorState::Idle => {
                return Err(invalid(format!("cursor {} used before init", self.id)))
            }
            CursorState::Closed => return Err(BridgeError::CursorClosed { cursor: self.id }),
            CursorState::Exhausted => return Ok(None),
            CursorState::Initialized | CursorState::Fetching | CursorState::RowReady => {}
        }
        let current_txn = self.handle.is_some_and(|handle| session.is_current(&handle));
        if !current_txn {
            self.close();
            return Err(BridgeError::CursorClosed { cursor: self.id });
        }

        self.current = None;
        let row = match self.order {
            ScanOrder::Unordered => self.next_unordered(session).await?,
            ScanOrder::Ascending | ScanOrder::Descending => self.next_merged(session).await?,
        };
        match row {
            Some(row) => {
                self.delivered += 1;
                self.state = CursorState::RowReady;
                self.current = Some(row);
                Ok(self.current.as_ref())
            }
            None => {
                self.release();
                self.state = CursorState::Exhausted;
                debug!(cursor = self.id, delivered = self.delivered, "holobridge cursor exhausted");
                Ok(None)
            }
        }
    }

    /// Like [`Self::next`], returning an owned copy with large objects resolved.
    pub async fn next_materialized(
        &mut self,
        session: &mut SessionContext,
        source: &dyn LargeObjectSource,
    ) -> BridgeResult<Option<Row>> {
        let row = match self.next(session).await? {
            Some(row) => row.clone(),
            None => return Ok(None),
        };
        materialize_row(&row, source).await.map(Some)
    }

    async fn next_unordered(&mut self, session: &mut SessionContext) -> BridgeResult<Option<Row>> {
        loop {
            let Some(idx) = self
                .streams
                .iter()
                .position(|stream| !stream.buffer.is_empty() || !stream.done)
            else {
                return Ok(None);
            };
            if let Some(row) = self.streams[idx].buffer.pop_front() {
                return Ok(Some(row));
            }
            self.refill(session, idx).await?;
        }
    }

    async fn next_merged(&mut self, session: &mut SessionContext) -> BridgeResult<Option<Row>> {
        for idx in 0..self.streams.len() {
            while self.streams[idx].buffer.is_empty() && !self.streams[idx].done {
                self.refill(session, idx).await?;
            }
        }
        let descending = self.order == ScanOrder::Descending;
        let mut best: Option<(usize, KeyTuple, KeyTuple)> = None;
        for (idx, stream) in self.streams.iter().enumerate() {
            let Some(head) = stream.buffer.front() else {
                continue;
            };
            let sort_key = key_from_columns(&head.columns, &self.sort_columns).unwrap_or_default();
            let primary_key = key_from_columns(&head.columns, &self.primary_key).unwrap_or_default();
            let better = match &best {
                None => true,
                Some((_, best_sort, best_pk)) => {
                    let ordering = (&sort_key, &primary_key).cmp(&(best_sort, best_pk));
                    if descending {
                        ordering == std::cmp::Ordering::Greater
                    } else {
                        ordering == std::cmp::Ordering::Less
                    }
                }
            };
            if better {
                best = Some((idx, sort_key, primary_key));
            }
        }
        Ok(best.and_then(|(idx, _, _)| self.streams[idx].buffer.pop_front()))
    }

    async fn refill(&mut self, session: &mut SessionContext, idx: usize) -> BridgeResult<()> {
        self.state = CursorState::Fetching;
        let scan = self.streams[idx].scan;
        let span = info_span!("holo_bridge.scan_fetch", cursor = self.id, scan = %scan);
        let fetched = self
            .conn
            .fetch_scan(scan, self.batch_rows)
            .instrument(span)
            .await;
        match fetched {
            Ok(batch) => {
                let stream = &mut self.streams[idx];
                stream.buffer.extend(batch.rows.into_iter().map(|scanned| scanned.row));
                if batch.done {
                    stream.done = true;
                    self.conn.close_scan(scan);
                }
                Ok(())
            }
            Err(err) => {
                let err = BridgeError::cluster(err, "scan_fetch");
                if err.aborts_transaction() {
                    self.close();
                }
                Err(session.fail(err))
            }
        }
    }

    /// Releases the cursor. Idempotent and safe after the transaction ended.
    pub fn close(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        self.release();
        self.current = None;
        self.state = CursorState::Closed;
    }

    fn release(&mut self) {
        for stream in self.streams.drain(..) {
            if !stream.done {
                self.conn.close_scan(stream.scan);
            }
        }
    }
}

impl Drop for ScanCursor {
    fn drop(&mut self) {
        self.release();
    }
}
