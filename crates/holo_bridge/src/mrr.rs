//! Multi-range reads.
//!
//! A list of key ranges over one index is read in rounds. Each round holds a
//! bounded number of ranges; equality ranges that a unique access path can
//! answer become batched key reads, the rest of the round becomes a single
//! multi-bound scan. Every returned row is tagged with the position of the
//! range that produced it.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use holo_cluster::{
    key_from_columns, ClusterConnection, KeyAccess, KeyTuple, OpOutcome, Row, ScanAccess, ScanBound,
    ScanId, ScanRequest,
};
use tracing::{debug, info_span, Instrument};

use crate::batch::BatchedOperation;
use crate::error::{BridgeError, BridgeResult};
use crate::session::{PartitionHint, SessionContext, TransactionHandle};
use crate::share::{IndexDescriptor, TableShare};

/// One key range of a multi-range read, in index key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub low: Bound<KeyTuple>,
    pub high: Bound<KeyTuple>,
}

impl KeyRange {
    pub fn point(key: KeyTuple) -> Self {
        Self {
            low: Bound::Included(key.clone()),
            high: Bound::Included(key),
        }
    }

    pub fn between(low: Bound<KeyTuple>, high: Bound<KeyTuple>) -> Self {
        Self { low, high }
    }

    /// The key when both ends include the same key.
    pub fn equality_key(&self) -> Option<&KeyTuple> {
        match (&self.low, &self.high) {
            (Bound::Included(low), Bound::Included(high)) if low == high => Some(low),
            _ => None,
        }
    }

    fn encoded_len(&self) -> usize {
        [&self.low, &self.high]
            .into_iter()
            .map(|bound| match bound {
                Bound::Included(key) | Bound::Excluded(key) => key.encoded_len(),
                Bound::Unbounded => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
enum RangePlan {
    Lookup(KeyAccess),
    Scan,
}

fn invalid(reason: impl Into<String>) -> BridgeError {
    BridgeError::InvalidScanSpec {
        reason: reason.into(),
    }
}

fn start_cmp(left: &Bound<KeyTuple>, right: &Bound<KeyTuple>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (left, right) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (
            Bound::Included(left) | Bound::Excluded(left),
            Bound::Included(right) | Bound::Excluded(right),
        ) => left.cmp(right),
    }
}

fn plan_ranges(
    index: &IndexDescriptor,
    ranges: &[KeyRange],
    sorted: bool,
) -> BridgeResult<Vec<RangePlan>> {
    if !index.is_active() {
        return Err(invalid(format!("index '{}' is not active", index.name)));
    }
    let mut plans = Vec::with_capacity(ranges.len());
    for (range_no, range) in ranges.iter().enumerate() {
        for bound in [&range.low, &range.high] {
            if let Bound::Included(key) | Bound::Excluded(key) = bound {
                if key.len() > index.columns.len() {
                    return Err(invalid(format!(
                        "range {range_no} has a {}-part key, index '{}' has {}",
                        key.len(),
                        index.name,
                        index.columns.len()
                    )));
                }
            }
        }
        if let (
            Bound::Included(low) | Bound::Excluded(low),
            Bound::Included(high) | Bound::Excluded(high),
        ) = (&range.low, &range.high)
        {
            if low.cmp_prefix(high) == std::cmp::Ordering::Greater {
                return Err(invalid(format!("range {range_no} starts at {low} beyond its end {high}")));
            }
        }
        if sorted && range_no > 0 && start_cmp(&range.low, &ranges[range_no - 1].low).is_lt() {
            return Err(invalid(format!(
                "sorted read needs non-decreasing range starts; range {range_no} goes backwards"
            )));
        }

        let lookup = range.equality_key().and_then(|key| match index.index_id {
            None if key.len() == index.columns.len() => Some(KeyAccess::PrimaryKey(key.clone())),
            Some(id) if index.point_lookup_allowed(key) => Some(KeyAccess::UniqueIndex {
                index: id,
                key: key.clone(),
            }),
            _ => None,
        });
        match lookup {
            Some(access) => plans.push(RangePlan::Lookup(access)),
            None if index.is_ordered() => plans.push(RangePlan::Scan),
            None => {
                return Err(invalid(format!(
                    "range {range_no} needs an ordered scan but index '{}' is hash only",
                    index.name
                )))
            }
        }
    }
    Ok(plans)
}

/// End (exclusive) of the round starting at `start`: at most `max_ranges`
/// ranges and `byte_budget` bytes of bounds, but always at least one range.
fn round_end(ranges: &[KeyRange], start: usize, max_ranges: usize, byte_budget: usize) -> usize {
    let mut end = start;
    let mut bytes = 0usize;
    while end < ranges.len() && end - start < max_ranges.max(1) {
        let len = ranges[end].encoded_len();
        if end > start && bytes.saturating_add(len) > byte_budget {
            break;
        }
        bytes = bytes.saturating_add(len);
        end += 1;
    }
    end
}

/// Partition of a read that is a single key lookup, when the primary key is
/// known or can be rebuilt from the unique index key.
fn partition_hint(
    share: &TableShare,
    index: &IndexDescriptor,
    plans: &[RangePlan],
) -> Option<PartitionHint> {
    let primary_key = match plans {
        [RangePlan::Lookup(KeyAccess::PrimaryKey(key))] => key.clone(),
        [RangePlan::Lookup(KeyAccess::UniqueIndex { key, .. })] => index.primary_key_from(key)?,
        _ => return None,
    };
    Some(PartitionHint::for_key(share, &primary_key))
}

/// Opens a lazy multi-range read over index `index` of `share`. No round
/// trip happens until the first `next`.
pub async fn execute(
    session: &mut SessionContext,
    share: &TableShare,
    index: usize,
    ranges: Vec<KeyRange>,
    sorted: bool,
) -> BridgeResult<MultiRangeStream> {
    let descriptor = share
        .index(index)
        .ok_or_else(|| invalid(format!("index {index} does not exist on '{}'", share.name())))?;
    let plans = plan_ranges(&descriptor, &ranges, sorted)?;

    let hint = partition_hint(share, &descriptor, &plans);
    let handle = session.start(hint.as_ref()).await?;
    let config = session.config();
    let (max_ranges, byte_budget, batch_rows) = (
        config.mrr_max_ranges_per_round,
        config.batch_flush_bytes,
        config.scan_batch_rows.max(1),
    );
    Ok(MultiRangeStream {
        id: session.next_cursor_id(),
        conn: Arc::clone(session.connection()),
        table: share.name().to_string(),
        index: descriptor,
        primary_key: share.definition().primary_key.clone(),
        handle,
        ranges,
        plans,
        sorted,
        max_ranges,
        byte_budget,
        batch_rows,
        next_range: 0,
        ready: VecDeque::new(),
        held: Vec::new(),
        scan: None,
        rounds: 0,
        closed: false,
    })
}

/// Lazy result stream of a multi-range read.
pub struct MultiRangeStream {
    id: u64,
    conn: Arc<dyn ClusterConnection>,
    table: String,
    index: IndexDescriptor,
    primary_key: Vec<usize>,
    handle: TransactionHandle,
    ranges: Vec<KeyRange>,
    plans: Vec<RangePlan>,
    sorted: bool,
    max_ranges: usize,
    byte_budget: usize,
    batch_rows: usize,
    next_range: usize,
    ready: VecDeque<(usize, Row)>,
    /// Sorted rows that may interleave with rows of the next round.
    held: Vec<(usize, Row)>,
    /// Scan still streaming in unsorted mode.
    scan: Option<ScanId>,
    rounds: u64,
    closed: bool,
}

impl std::fmt::Debug for MultiRangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiRangeStream")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("index", &self.index.name)
            .field("ranges", &self.ranges.len())
            .field("next_range", &self.next_range)
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}

impl MultiRangeStream {
    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    /// Rounds issued so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Next `(range_index, row)`; `None` once every range is consumed.
    pub async fn next(&mut self, session: &mut SessionContext) -> BridgeResult<Option<(usize, Row)>> {
        if self.closed {
            return Err(BridgeError::CursorClosed { cursor: self.id });
        }
        let drained =
            self.ready.is_empty() && self.next_range >= self.ranges.len() && self.scan.is_none();
        if !drained && !session.is_current(&self.handle) {
            self.close();
            return Err(BridgeError::CursorClosed { cursor: self.id });
        }
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Ok(Some(item));
            }
            if self.next_range >= self.ranges.len() && self.scan.is_none() {
                return Ok(None);
            }
            match self.scan {
                Some(scan) => {
                    let done = self.fetch_page(session, scan).await?;
                    if done {
                        self.scan = None;
                    }
                }
                None => self.run_round(session).await?,
            }
        }
    }

    async fn run_round(&mut self, session: &mut SessionContext) -> BridgeResult<()> {
        let start = self.next_range;
        let end = round_end(&self.ranges, start, self.max_ranges, self.byte_budget);
        self.next_range = end;
        self.rounds += 1;
        let span = info_span!(
            "holo_bridge.mrr_round",
            stream = self.id,
            table = %self.table,
            first_range = start,
            ranges = end - start
        );

        let mut lookups = Vec::new();
        let mut bounds = Vec::new();
        for range_no in start..end {
            match &self.plans[range_no] {
                RangePlan::Lookup(access) => lookups.push((range_no, access.clone())),
                RangePlan::Scan => bounds.push(ScanBound {
                    range_no,
                    low: self.ranges[range_no].low.clone(),
                    high: self.ranges[range_no].high.clone(),
                }),
            }
        }

        if !lookups.is_empty() {
            let mut slots = Vec::with_capacity(lookups.len());
            for (range_no, access) in lookups {
                let op = BatchedOperation::read(&self.table, access).with_range(range_no);
                match session.enqueue(&self.handle, op) {
                    Ok(slot) => slots.push((range_no, slot)),
                    Err(err) => {
                        session.cancel_pending(slots.iter().map(|(_, slot)| *slot));
                        return Err(err);
                    }
                }
            }
            session
                .force_flush(&self.handle)
                .instrument(span.clone())
                .await?;
            let mut unexpected = None;
            for (range_no, slot) in slots {
                match session.take_outcome(slot)? {
                    OpOutcome::Found(row) => self.ready.push_back((range_no, row)),
                    OpOutcome::NotFound => {}
                    other => unexpected = unexpected.or(Some(other)),
                }
            }
            if let Some(other) = unexpected {
                return Err(session.fail(BridgeError::Protocol {
                    operation: "mrr_lookup",
                    detail: format!("unexpected outcome {other:?} for a key read"),
                }));
            }
        }

        if !bounds.is_empty() {
            let access = match self.index.index_id {
                Some(id) => ScanAccess::OrderedIndex(id),
                None => ScanAccess::PrimaryKey,
            };
            let request = ScanRequest {
                table: self.table.clone(),
                access,
                partition: None,
                bounds,
                descending: false,
            };
            let opened = self
                .conn
                .open_scan(self.handle.txn(), request)
                .instrument(span.clone())
                .await;
            let scan = match opened {
                Ok(scan) => scan,
                Err(err) => return Err(session.fail(BridgeError::cluster(err, "mrr_scan"))),
            };
            session.record_scan(false);
            if self.sorted {
                while !self.fetch_page(session, scan).await? {}
            } else {
                self.scan = Some(scan);
            }
        }

        if self.sorted {
            self.merge_sorted_round(end);
        }
        debug!(
            stream = self.id,
            round = self.rounds,
            rows = self.ready.len(),
            held = self.held.len(),
            "holobridge multi-range round issued"
        );
        Ok(())
    }

    /// Orders the rows of the round ending before range `end` together with
    /// rows held back from earlier rounds. Starts never decrease, so a row
    /// below the next round's first start can no longer be overtaken; the
    /// rest is held back and merged with the next round.
    fn merge_sorted_round(&mut self, end: usize) {
        let columns = &self.index.columns;
        let primary_key = &self.primary_key;
        let index_key = |row: &Row| key_from_columns(&row.columns, columns).unwrap_or_default();
        let mut round = std::mem::take(&mut self.held);
        round.extend(self.ready.drain(..));
        round.sort_by_cached_key(|(range_no, row)| {
            (
                index_key(row),
                *range_no,
                key_from_columns(&row.columns, primary_key).unwrap_or_default(),
            )
        });
        let settled = match self.ranges.get(end).map(|range| &range.low) {
            None => round.len(),
            Some(Bound::Unbounded) => 0,
            Some(Bound::Included(next) | Bound::Excluded(next)) => {
                round.partition_point(|(_, row)| index_key(row).cmp_prefix(next).is_lt())
            }
        };
        self.held = round.split_off(settled);
        self.ready = round.into();
    }

    /// Fetches one page of `scan` into the ready queue; returns whether the
    /// scan is exhausted.
    async fn fetch_page(&mut self, session: &mut SessionContext, scan: ScanId) -> BridgeResult<bool> {
        let span = info_span!("holo_bridge.scan_fetch", stream = self.id, scan = %scan);
        let fetched = self
            .conn
            .fetch_scan(scan, self.batch_rows)
            .instrument(span)
            .await;
        let batch = match fetched {
            Ok(batch) => batch,
            Err(err) => {
                self.conn.close_scan(scan);
                self.scan = None;
                return Err(session.fail(BridgeError::cluster(err, "mrr_fetch")));
            }
        };
        for scanned in batch.rows {
            let Some(range_no) = scanned.range_no else {
                self.conn.close_scan(scan);
                self.scan = None;
                return Err(session.fail(BridgeError::Protocol {
                    operation: "mrr_fetch",
                    detail: "multi-range scan row carries no range number".to_string(),
                }));
            };
            self.ready.push_back((range_no, scanned.row));
        }
        if batch.done {
            self.conn.close_scan(scan);
        }
        Ok(batch.done)
    }

    /// Stops the read and releases any open scan. Idempotent.
    pub fn close(&mut self) {
        if let Some(scan) = self.scan.take() {
            self.conn.close_scan(scan);
        }
        self.ready.clear();
        self.held.clear();
        self.closed = true;
    }
}

impl Drop for MultiRangeStream {
    fn drop(&mut self) {
        if let Some(scan) = self.scan.take() {
            self.conn.close_scan(scan);
        }
    }
}
