//! Multi-range reads over primary, unique and ordered indexes.
//!
//! Test flow:
//! 1) Seed orders spread over customers and references.
//! 2) Read several ranges at once, with small round limits.
//! 3) Mix key lookups with range scans and abort mid-stream.
//!
//! Failure model covered:
//! - Rows attributed to the wrong range.
//! - Ranges dropped at round boundaries.
//! - Streams surviving the end of their transaction.
//!
//! Verification:
//! - Per-range row sets match a model computed from the seed.
//! - Sorted mode yields non-decreasing index keys.

mod common;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use holo_bridge::{BridgeConfig, BridgeError, KeyRange, SessionContext};
use holo_cluster::{
    ClusterConnection, ClusterOp, ClusterResult, ExecMode, ExecResult, InMemoryCluster, KeyTuple,
    LargeObjectHandle, NodeId, PartitionId, ScanBatch, ScanId, ScanRequest, StartedTransaction,
    TableDef, TableStatistics, TxnId,
};

use common::{
    key, order, test_config, u64_at, Harness, ORDERS, ORDERS_BY_CUSTOMER, ORDERS_BY_REFERENCE,
    ORDERS_PRIMARY,
};

fn reference_key(reference: &str) -> KeyTuple {
    KeyTuple::new(vec![Some(Bytes::copy_from_slice(reference.as_bytes()))])
}

/// In-memory cluster whose scans lose the range number of every row.
#[derive(Debug)]
struct UntaggedScans(Arc<InMemoryCluster>);

#[async_trait]
impl ClusterConnection for UntaggedScans {
    fn is_connected(&self) -> bool {
        self.0.is_connected()
    }

    fn data_nodes(&self) -> Vec<NodeId> {
        self.0.data_nodes()
    }

    async fn fetch_table(&self, table: &str) -> ClusterResult<Option<TableDef>> {
        self.0.fetch_table(table).await
    }

    async fn table_statistics(&self, table: &str) -> ClusterResult<TableStatistics> {
        self.0.table_statistics(table).await
    }

    async fn reserve_tuple_ids(&self, table: &str, count: u64) -> ClusterResult<u64> {
        self.0.reserve_tuple_ids(table, count).await
    }

    fn partition_primary(&self, table: &str, partition: PartitionId) -> ClusterResult<NodeId> {
        self.0.partition_primary(table, partition)
    }

    async fn start_transaction(
        &self,
        coordinator: Option<NodeId>,
    ) -> ClusterResult<StartedTransaction> {
        self.0.start_transaction(coordinator).await
    }

    async fn execute(
        &self,
        txn: TxnId,
        ops: Vec<ClusterOp>,
        mode: ExecMode,
    ) -> ClusterResult<ExecResult> {
        self.0.execute(txn, ops, mode).await
    }

    async fn commit(&self, txn: TxnId) -> ClusterResult<()> {
        self.0.commit(txn).await
    }

    async fn rollback(&self, txn: TxnId) -> ClusterResult<()> {
        self.0.rollback(txn).await
    }

    fn close_transaction(&self, txn: TxnId) {
        self.0.close_transaction(txn)
    }

    async fn open_scan(&self, txn: TxnId, request: ScanRequest) -> ClusterResult<ScanId> {
        self.0.open_scan(txn, request).await
    }

    async fn fetch_scan(&self, scan: ScanId, max_rows: usize) -> ClusterResult<ScanBatch> {
        let mut batch = self.0.fetch_scan(scan, max_rows).await?;
        for scanned in &mut batch.rows {
            scanned.range_no = None;
        }
        Ok(batch)
    }

    fn close_scan(&self, scan: ScanId) {
        self.0.close_scan(scan)
    }

    fn open_scans(&self, txn: TxnId) -> Vec<ScanId> {
        self.0.open_scans(txn)
    }

    async fn read_large_object(&self, handle: LargeObjectHandle) -> ClusterResult<Bytes> {
        self.0.read_large_object(handle).await
    }
}

#[tokio::test]
async fn rows_are_tagged_with_their_range_across_rounds() -> Result<()> {
    let harness = Harness::new(BridgeConfig {
        mrr_max_ranges_per_round: 2,
        scan_batch_rows: 4,
        ..test_config()
    });
    harness.seed_orders(1..=30);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let ranges = vec![
        KeyRange::point(key(0)),
        KeyRange::point(key(1)),
        KeyRange::between(Bound::Included(key(2)), Bound::Included(key(3))),
        KeyRange::point(key(4)),
    ];
    let mut stream = orders
        .lookup_multi(&mut session, ORDERS_BY_CUSTOMER, ranges, false)
        .await
        .context("open stream")?;
    assert_eq!(stream.rounds(), 0, "reads are lazy");

    let mut per_range: BTreeMap<usize, Vec<u64>> = BTreeMap::new();
    while let Some((range_no, row)) = stream.next(&mut session).await.context("next")? {
        let customer = u64_at(&row, 1);
        match range_no {
            0 => assert_eq!(customer, 0),
            1 => assert_eq!(customer, 1),
            2 => assert!((2..=3).contains(&customer)),
            3 => assert_eq!(customer, 4),
            other => panic!("unexpected range {other}"),
        }
        per_range.entry(range_no).or_default().push(u64_at(&row, 0));
    }
    assert_eq!(stream.rounds(), 2);
    let counts: Vec<usize> = per_range.values().map(Vec::len).collect();
    assert_eq!(counts, vec![6, 6, 12, 6]);
    assert!(stream.next(&mut session).await.context("after end")?.is_none());
    assert_eq!(harness.cluster.open_scan_count(), 0);

    drop(stream);
    orders.commit_statement(&mut session).await.context("commit")?;
    Ok(())
}

#[tokio::test]
async fn sorted_mode_returns_rows_in_index_order() -> Result<()> {
    let harness = Harness::new(BridgeConfig {
        scan_batch_rows: 3,
        ..test_config()
    });
    harness.seed_orders(1..=25);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let ranges = vec![
        KeyRange::point(key(1)),
        KeyRange::between(Bound::Included(key(2)), Bound::Excluded(key(4))),
    ];
    let mut stream = orders
        .lookup_multi(&mut session, ORDERS_BY_CUSTOMER, ranges, true)
        .await
        .context("open stream")?;
    let mut seen = Vec::new();
    while let Some((_, row)) = stream.next(&mut session).await.context("next")? {
        seen.push((u64_at(&row, 1), u64_at(&row, 0)));
    }
    let mut expected: Vec<(u64, u64)> = (1..=25u64)
        .map(|id| (id % 5, id))
        .filter(|(customer, _)| (1..4).contains(customer))
        .collect();
    expected.sort();
    assert_eq!(seen, expected);
    drop(stream);
    session.commit().await.context("commit")?;
    Ok(())
}

#[tokio::test]
async fn sorted_mode_keeps_key_order_across_rounds() -> Result<()> {
    let harness = Harness::new(BridgeConfig {
        mrr_max_ranges_per_round: 1,
        ..test_config()
    });
    harness.seed_orders(1..=10);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    // The second range overlaps the first and is read in a later round.
    let ranges = vec![
        KeyRange::between(Bound::Included(key(0)), Bound::Included(key(4))),
        KeyRange::point(key(1)),
    ];
    let mut stream = orders
        .lookup_multi(&mut session, ORDERS_BY_CUSTOMER, ranges, true)
        .await
        .context("open stream")?;
    let mut seen = Vec::new();
    while let Some((range_no, row)) = stream.next(&mut session).await.context("next")? {
        seen.push((u64_at(&row, 1), range_no));
    }
    assert_eq!(stream.rounds(), 2);
    assert_eq!(
        seen,
        vec![
            (0, 0),
            (0, 0),
            (1, 0),
            (1, 0),
            (1, 1),
            (1, 1),
            (2, 0),
            (2, 0),
            (3, 0),
            (3, 0),
            (4, 0),
            (4, 0),
        ]
    );
    assert!(stream.next(&mut session).await.context("after end")?.is_none());

    drop(stream);
    session.commit().await.context("commit")?;
    Ok(())
}

#[tokio::test]
async fn sorted_rounds_release_rows_below_the_next_start() -> Result<()> {
    let harness = Harness::new(BridgeConfig {
        mrr_max_ranges_per_round: 1,
        ..test_config()
    });
    harness.seed_orders(1..=10);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let ranges = vec![
        KeyRange::between(Bound::Included(key(0)), Bound::Included(key(2))),
        KeyRange::point(key(2)),
        KeyRange::point(key(4)),
    ];
    let mut stream = orders
        .lookup_multi(&mut session, ORDERS_BY_CUSTOMER, ranges, true)
        .await
        .context("open stream")?;
    let mut customers = Vec::new();
    for _ in 0..4 {
        let (_, row) = stream
            .next(&mut session)
            .await
            .context("next")?
            .context("row below the second start")?;
        customers.push(u64_at(&row, 1));
    }
    assert_eq!(customers, vec![0, 0, 1, 1]);
    assert_eq!(stream.rounds(), 1, "rows below the next start need no further round");

    while let Some((_, row)) = stream.next(&mut session).await.context("next")? {
        customers.push(u64_at(&row, 1));
    }
    assert_eq!(customers, vec![0, 0, 1, 1, 2, 2, 2, 2, 4, 4]);
    assert_eq!(stream.rounds(), 3);
    drop(stream);
    session.commit().await.context("commit")?;
    Ok(())
}

#[tokio::test]
async fn sorted_mode_rejects_decreasing_starts() -> Result<()> {
    let harness = Harness::new(test_config());
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let ranges = vec![KeyRange::point(key(4)), KeyRange::point(key(2))];
    let err = orders
        .lookup_multi(&mut session, ORDERS_BY_CUSTOMER, ranges.clone(), true)
        .await
        .expect_err("decreasing starts");
    assert!(matches!(err, BridgeError::InvalidScanSpec { .. }));
    assert!(!session.has_active_transaction());

    let mut unsorted = orders
        .lookup_multi(&mut session, ORDERS_BY_CUSTOMER, ranges, false)
        .await
        .context("unsorted accepts any order")?;
    assert!(unsorted.next(&mut session).await.context("next")?.is_none());
    drop(unsorted);
    session.abort().await.context("abort")?;
    Ok(())
}

#[tokio::test]
async fn primary_key_points_are_batched_lookups() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.seed_orders(1..=20);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let ranges = vec![
        KeyRange::point(key(3)),
        KeyRange::point(key(99)),
        KeyRange::point(key(7)),
        KeyRange::between(Bound::Included(key(10)), Bound::Included(key(12))),
    ];
    let mut stream = orders
        .lookup_multi(&mut session, ORDERS_PRIMARY, ranges, false)
        .await
        .context("open stream")?;
    let mut hits = Vec::new();
    while let Some((range_no, row)) = stream.next(&mut session).await.context("next")? {
        hits.push((range_no, u64_at(&row, 0)));
    }
    hits.sort();
    assert_eq!(hits, vec![(0, 3), (2, 7), (3, 10), (3, 11), (3, 12)]);
    assert_eq!(stream.rounds(), 1);
    // The three points share one flush; only the range needs a scan.
    assert_eq!(session.counters().execute_count, 1);
    assert_eq!(session.counters().scan_count, 1);

    drop(stream);
    session.commit().await.context("commit")?;
    Ok(())
}

#[tokio::test]
async fn null_reference_falls_back_to_a_scan() -> Result<()> {
    let harness = Harness::new(test_config());
    for row in [
        order(1, 1, 10, Some("A")),
        order(2, 1, 20, None),
        order(3, 2, 30, Some("B")),
        order(4, 2, 40, None),
    ] {
        harness
            .cluster
            .write_row_direct(ORDERS, row)
            .context("seed")?;
    }
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let ranges = vec![
        KeyRange::point(KeyTuple::new(vec![None])),
        KeyRange::point(reference_key("B")),
        KeyRange::point(reference_key("Z")),
    ];
    let mut stream = orders
        .lookup_multi(&mut session, ORDERS_BY_REFERENCE, ranges, false)
        .await
        .context("open stream")?;
    let mut hits = Vec::new();
    while let Some((range_no, row)) = stream.next(&mut session).await.context("next")? {
        hits.push((range_no, u64_at(&row, 0)));
    }
    hits.sort();
    assert_eq!(hits, vec![(0, 2), (0, 4), (1, 3)]);
    assert_eq!(session.counters().scan_count, 1);
    assert_eq!(session.counters().execute_count, 1);

    drop(stream);
    session.commit().await.context("commit")?;
    Ok(())
}

#[tokio::test]
async fn abort_invalidates_an_open_stream() -> Result<()> {
    let harness = Harness::new(BridgeConfig {
        scan_batch_rows: 2,
        ..test_config()
    });
    harness.seed_orders(1..=20);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let ranges = vec![KeyRange::between(Bound::Unbounded, Bound::Unbounded)];
    let mut stream = orders
        .lookup_multi(&mut session, ORDERS_BY_CUSTOMER, ranges, false)
        .await
        .context("open stream")?;
    assert!(stream.next(&mut session).await.context("first row")?.is_some());

    session.abort().await.context("abort")?;
    assert!(matches!(
        stream.next(&mut session).await,
        Err(BridgeError::CursorClosed { .. })
    ));
    assert!(matches!(
        stream.next(&mut session).await,
        Err(BridgeError::CursorClosed { .. })
    ));
    assert_eq!(harness.cluster.open_scan_count(), 0);
    Ok(())
}

#[tokio::test]
async fn arena_overflow_withdraws_the_partial_lookup_batch() -> Result<()> {
    let harness = Harness::new(BridgeConfig {
        arena_capacity_bytes: 20,
        ..test_config()
    });
    harness.seed_orders(1..=5);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let ranges = (1..=4).map(|id| KeyRange::point(key(id))).collect();
    let mut stream = orders
        .lookup_multi(&mut session, ORDERS_PRIMARY, ranges, false)
        .await
        .context("open stream")?;
    assert!(matches!(
        stream.next(&mut session).await,
        Err(BridgeError::ArenaExhausted { .. })
    ));
    assert_eq!(session.pending_ops(), 0);
    assert_eq!(session.arena_used(), 0);
    assert_eq!(harness.cluster.execute_round_trips(), 0, "nothing was shipped");

    drop(stream);
    session.commit().await.context("commit")?;
    Ok(())
}

#[tokio::test]
async fn untagged_scan_rows_close_the_scan() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.seed_orders(1..=10);
    let mut session = SessionContext::new(
        Arc::new(UntaggedScans(Arc::clone(&harness.cluster))),
        Arc::clone(&harness.registry),
        harness.config.clone(),
        Arc::clone(&harness.metrics),
    );
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    for sorted in [true, false] {
        let ranges = vec![KeyRange::between(Bound::Included(key(1)), Bound::Included(key(3)))];
        let mut stream = orders
            .lookup_multi(&mut session, ORDERS_BY_CUSTOMER, ranges, sorted)
            .await
            .context("open stream")?;
        assert!(matches!(
            stream.next(&mut session).await,
            Err(BridgeError::Protocol { .. })
        ));
        assert_eq!(harness.cluster.open_scan_count(), 0);
        assert!(!session.has_active_transaction());
    }
    Ok(())
}
