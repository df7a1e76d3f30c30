//! Row handler operations and table share lifecycle.
//!
//! Test flow:
//! 1) Write, update and delete through handlers of one or more sessions.
//! 2) Change primary keys and race stale row images.
//! 3) Drop and reopen shares while handlers still hold them.
//!
//! Failure model covered:
//! - Lost updates when a stale image overwrites a newer row.
//! - Half-applied key changes.
//! - Dropped table metadata served to new opens.
//!
//! Verification:
//! - Stored rows and record counts match the applied operations.
//! - Registry reference counts return to zero once every handle is gone.

mod common;

use anyhow::{Context, Result};
use holo_bridge::{
    BridgeConfig, BridgeError, DeleteOutcome, RowId, ShareState, UpdateOutcome, WriteMode,
    WriteOutcome,
};
use holo_cluster::{ColumnValue, Row};

use common::{key, order, test_config, u64_at, Harness, EVENTS, ORDERS};

#[tokio::test]
async fn records_follow_uncommitted_and_committed_changes() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.seed_orders(1..=3);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;
    assert_eq!(orders.records(&session), 3);

    for id in 10..=11 {
        orders
            .write(&mut session, order(id, 1, 5, None))
            .await
            .context("write")?;
    }
    assert_eq!(orders.records(&session), 5);
    let victim = harness.cluster.read_row(ORDERS, &key(2)).context("row 2")?;
    assert_eq!(
        orders.delete(&mut session, &victim).await.context("delete")?,
        DeleteOutcome::Ok
    );
    assert_eq!(
        orders.delete(&mut session, &victim).await.context("delete again")?,
        DeleteOutcome::NotFound
    );
    assert_eq!(orders.records(&session), 4);
    assert_eq!(session.row_delta(ORDERS), 1);

    orders.commit_statement(&mut session).await.context("commit")?;
    assert_eq!(session.row_delta(ORDERS), 0);
    assert_eq!(orders.records(&session), 4);

    let info = orders.info(&mut session, true).await.context("info")?;
    assert_eq!(info.records, 4);
    assert_eq!(info.statistics.row_count, 4);
    assert_eq!(info.indexes, 3);
    assert!(!info.hidden_key);
    let json = serde_json::to_value(&info).context("serialize info")?;
    assert_eq!(json["table"], ORDERS);
    assert_eq!(json["records"], 4);
    Ok(())
}

#[tokio::test]
async fn stale_images_conflict_instead_of_overwriting() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.seed_orders([1]);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let original = harness.cluster.read_row(ORDERS, &key(1)).context("row 1")?;
    assert!(original.version.is_some());
    let first = orders
        .update(&mut session, &original, order(1, 1, 111, None))
        .await
        .context("first update")?;
    assert_eq!(first, UpdateOutcome::Ok);

    let stale = orders
        .update(&mut session, &original, order(1, 1, 222, None))
        .await
        .context("stale update")?;
    assert_eq!(stale, UpdateOutcome::Conflict);

    let missing = Row {
        columns: order(50, 1, 1, None),
        version: None,
    };
    let outcome = orders
        .update(&mut session, &missing, order(50, 1, 2, None))
        .await
        .context("missing update")?;
    assert_eq!(outcome, UpdateOutcome::NotFound);

    session.commit().await.context("commit")?;
    let stored = harness.cluster.read_row(ORDERS, &key(1)).context("row 1")?;
    assert_eq!(u64_at(&stored, 2), 111);
    Ok(())
}

#[tokio::test]
async fn key_changing_updates_move_the_row_or_leave_it_alone() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.seed_orders([1, 2]);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let row = harness.cluster.read_row(ORDERS, &key(1)).context("row 1")?;
    let moved = orders
        .update(&mut session, &row, order(3, 1, 10, None))
        .await
        .context("move 1 to 3")?;
    assert_eq!(moved, UpdateOutcome::Ok);
    assert!(harness.cluster.read_row(ORDERS, &key(1)).is_none());

    let row = harness.cluster.read_row(ORDERS, &key(3)).context("row 3")?;
    let err = orders
        .update(&mut session, &row, order(2, 1, 10, None))
        .await
        .expect_err("key 2 is taken");
    assert!(matches!(err, BridgeError::RowFailed { operation: "update", .. }));
    assert!(session.has_active_transaction());
    assert!(!session.is_rollback_only());

    session.commit().await.context("commit")?;
    assert!(harness.cluster.read_row(ORDERS, &key(1)).is_none());
    let kept = harness.cluster.read_row(ORDERS, &key(3)).context("row 3 survives")?;
    assert_eq!(u64_at(&kept, 0), 3);
    let untouched = harness.cluster.read_row(ORDERS, &key(2)).context("row 2")?;
    assert_eq!(u64_at(&untouched, 2), 20);
    Ok(())
}

#[tokio::test]
async fn hidden_keys_come_from_a_shared_range() -> Result<()> {
    let harness = Harness::new(BridgeConfig {
        auto_increment_prefetch: 2,
        ..test_config()
    });
    let mut first = harness.session();
    let mut second = harness.session();
    let mut events_a = first.open_table(EVENTS).await.context("open events")?;
    let mut events_b = second.open_table(EVENTS).await.context("open events")?;

    let event = || vec![ColumnValue::Null, ColumnValue::scalar(&b"ping"[..])];
    let inserted = |outcome: WriteOutcome| match outcome {
        WriteOutcome::Inserted(RowId(id)) => id,
        other => panic!("unexpected outcome {other:?}"),
    };
    let one = inserted(events_a.write(&mut first, event()).await.context("first event")?);
    let two = inserted(events_b.write(&mut second, event()).await.context("second event")?);
    let three = inserted(events_a.write(&mut first, event()).await.context("third event")?);
    assert_eq!(vec![one, two, three], vec![key(1), key(2), key(3)]);

    first.commit().await.context("commit first")?;
    second.commit().await.context("commit second")?;
    assert!(harness.cluster.read_row(EVENTS, &key(3)).is_some());
    Ok(())
}

#[tokio::test]
async fn malformed_rows_are_refused() -> Result<()> {
    let harness = Harness::new(test_config());
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;

    let short = vec![ColumnValue::from_u64(1)];
    assert!(matches!(
        orders.write(&mut session, short).await,
        Err(BridgeError::InvalidRow { .. })
    ));
    let mut null_key = order(1, 1, 1, None);
    null_key[0] = ColumnValue::Null;
    assert!(matches!(
        orders.write(&mut session, null_key).await,
        Err(BridgeError::InvalidRow { .. })
    ));
    assert!(!session.has_active_transaction());
    Ok(())
}

#[tokio::test]
async fn dropped_share_refuses_writes_and_is_rebuilt_on_reopen() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.seed_orders([1]);
    let mut session = harness.session();
    let mut stale = session.open_table(ORDERS).await.context("open orders")?;
    assert!(stale.share().mark_dropped());
    assert_eq!(stale.share().state(), ShareState::Dropped);

    assert_eq!(
        stale
            .write(&mut session, order(2, 1, 1, None))
            .await
            .context("write")?,
        WriteOutcome::Rejected
    );
    let row = harness.cluster.read_row(ORDERS, &key(1)).context("row 1")?;
    assert!(matches!(
        stale.update(&mut session, &row, order(1, 1, 2, None)).await,
        Err(BridgeError::TableUnavailable { .. })
    ));
    assert!(!session.has_active_transaction());

    let mut fresh = session.open_table(ORDERS).await.context("reopen orders")?;
    assert_eq!(fresh.share().state(), ShareState::Initial);
    assert_eq!(harness.registry.refcount(ORDERS), Some(2));
    let outcome = fresh
        .write(&mut session, order(2, 1, 1, None))
        .await
        .context("write through fresh share")?;
    assert!(matches!(outcome, WriteOutcome::Inserted(_)));
    fresh.commit_statement(&mut session).await.context("commit")?;

    drop(stale);
    assert_eq!(harness.registry.refcount(ORDERS), Some(2));
    Ok(())
}

#[tokio::test]
async fn registry_counts_references_across_sessions() -> Result<()> {
    let harness = Harness::new(test_config());
    let mut first = harness.session();
    let mut second = harness.session();

    let mut orders_a = first.open_table(ORDERS).await.context("open in first")?;
    assert_eq!(harness.registry.refcount(ORDERS), Some(2));
    let orders_b = second.open_table(ORDERS).await.context("open in second")?;
    assert_eq!(harness.registry.refcount(ORDERS), Some(4));
    assert!(std::ptr::eq(orders_a.share(), orders_b.share()));

    orders_a
        .write(&mut first, order(1, 1, 1, None))
        .await
        .context("write")?;
    assert!(!first.close_table(ORDERS), "written tables stay open");
    first.commit().await.context("commit")?;
    drop(orders_a);
    assert!(first.close_table(ORDERS));
    assert_eq!(harness.registry.refcount(ORDERS), Some(2));

    drop(orders_b);
    second.end().await.context("end second")?;
    assert!(!harness.registry.contains(ORDERS));
    assert!(harness.registry.is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_tables_and_alter_pins() -> Result<()> {
    let harness = Harness::new(test_config());
    let mut session = harness.session();
    assert!(matches!(
        session.open_table("shop.missing").await,
        Err(BridgeError::TableNotFound { .. })
    ));
    assert!(harness.registry.is_empty());

    let mut orders = session.open_table(ORDERS).await.context("open orders")?;
    orders
        .write(&mut session, order(1, 1, 1, None))
        .await
        .context("write")?;
    orders.abort_statement(&mut session).await.context("abort")?;
    assert!(harness.cluster.read_row(ORDERS, &key(1)).is_none());
    assert_eq!(session.row_delta(ORDERS), 0);

    orders.share().pin_for_alter();
    drop(orders);
    assert!(session.close_table(ORDERS));
    assert_eq!(harness.registry.refcount(ORDERS), Some(0));

    harness.registry.unpin(ORDERS);
    assert!(!harness.registry.contains(ORDERS));
    Ok(())
}

#[tokio::test]
async fn replace_mode_overwrites_and_counts_only_new_rows() -> Result<()> {
    let harness = Harness::new(test_config());
    harness.seed_orders([1, 2]);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;
    orders.set_write_mode(WriteMode::Replace);

    let replaced = orders
        .write(&mut session, order(1, 4, 500, None))
        .await
        .context("replace row 1")?;
    assert_eq!(replaced, WriteOutcome::Replaced(RowId(key(1))));
    let inserted = orders
        .write(&mut session, order(3, 3, 30, None))
        .await
        .context("write row 3")?;
    assert_eq!(inserted, WriteOutcome::Inserted(RowId(key(3))));
    assert_eq!(session.row_delta(ORDERS), 1);

    orders.start_bulk_insert();
    for row in [order(2, 2, 222, None), order(4, 4, 40, None)] {
        orders.write(&mut session, row).await.context("bulk write")?;
    }
    let report = orders.end_bulk_insert(&mut session).await.context("end bulk")?;
    assert_eq!((report.inserted, report.replaced, report.duplicates), (1, 1, 0));
    assert_eq!(orders.records(&session), 4);

    orders.commit_statement(&mut session).await.context("commit")?;
    assert_eq!(orders.records(&session), 4);
    let first = harness.cluster.read_row(ORDERS, &key(1)).context("row 1")?;
    assert_eq!((u64_at(&first, 1), u64_at(&first, 2)), (4, 500));
    let second = harness.cluster.read_row(ORDERS, &key(2)).context("row 2")?;
    assert_eq!(u64_at(&second, 2), 222);
    Ok(())
}

#[tokio::test]
async fn ignore_mode_skips_duplicates_without_failing_the_statement() -> Result<()> {
    let harness = Harness::new(BridgeConfig {
        per_row_error_tolerance: false,
        ..test_config()
    });
    harness.seed_orders([1]);
    let mut session = harness.session();
    let mut orders = session.open_table(ORDERS).await.context("open orders")?;
    orders.set_write_mode(WriteMode::IgnoreDuplicates);

    let skipped = orders
        .write(&mut session, order(1, 1, 999, None))
        .await
        .context("duplicate write")?;
    assert_eq!(skipped, WriteOutcome::Skipped(RowId(key(1))));
    assert!(session.has_active_transaction());
    assert!(!session.is_rollback_only());

    orders.start_bulk_insert();
    for id in [1, 2, 3] {
        orders
            .write(&mut session, order(id, 1, 7, None))
            .await
            .context("bulk write")?;
    }
    let report = orders.end_bulk_insert(&mut session).await.context("end bulk")?;
    assert_eq!((report.inserted, report.skipped, report.duplicates), (2, 1, 0));
    assert_eq!(report.first_duplicate, None);

    orders.commit_statement(&mut session).await.context("commit")?;
    assert_eq!(orders.records(&session), 3);
    let kept = harness.cluster.read_row(ORDERS, &key(1)).context("row 1")?;
    assert_eq!(u64_at(&kept, 2), 10);

    orders.set_write_mode(WriteMode::Insert);
    assert_eq!(orders.write_mode(), WriteMode::Insert);
    Ok(())
}
