//! Replicated writes under conflict detection.
//!
//! Test flow:
//! 1) Seed account rows carrying a version column.
//! 2) Replay inserts, updates and deletes with each conflict function.
//! 3) Collect escalations in an exception sink.
//!
//! Failure model covered:
//! - An older change overwriting a newer row.
//! - A conflicting write reported as applied.
//! - Escalations lost between sessions.
//!
//! Verification:
//! - Stored rows keep the winning image.
//! - Metrics and per-transaction records match every classification.

mod common;

use std::sync::Arc;

use anyhow::{Context, Result};
use holo_bridge::{
    BridgeError, ConflictAction, ConflictClass, ConflictResolver, MaxVersion, MaxVersionDeleteWins,
    OldImage, ReplicatedWrite, RowHandler, SharedExceptionSink, VecExceptionSink,
};

use common::{account, key, test_config, u64_at, Harness, ACCOUNTS};

fn with_resolver(handler: &RowHandler, resolver: ConflictResolver) {
    handler
        .share()
        .set_conflict_resolver(Some(Arc::new(resolver)));
}

#[tokio::test]
async fn max_version_keeps_the_newest_row() -> Result<()> {
    let harness = Harness::new(test_config());
    harness
        .cluster
        .write_row_direct(ACCOUNTS, account(1, 100, 5))
        .context("seed")?;
    let mut session = harness.session();
    let mut accounts = session.open_table(ACCOUNTS).await.context("open accounts")?;
    with_resolver(
        &accounts,
        ConflictResolver::new(Arc::new(MaxVersion { column: 2 }), ConflictAction::Reject),
    );
    let mut sink = VecExceptionSink::new();

    let newer = ReplicatedWrite::update(account(1, 100, 5), account(1, 150, 6));
    let record = accounts
        .apply_replicated(&mut session, newer, &mut sink)
        .await
        .context("newer update")?;
    assert_eq!(record.class, ConflictClass::NoConflict);
    assert_eq!(record.action, ConflictAction::Apply);
    assert_eq!(record.function, "max_version");

    for (version, balance) in [(6, 999), (4, 1)] {
        let stale = ReplicatedWrite::update(account(1, 100, 5), account(1, balance, version));
        let record = accounts
            .apply_replicated(&mut session, stale, &mut sink)
            .await
            .context("stale update")?;
        assert_eq!(record.class, ConflictClass::GuardFailed);
        assert_eq!(record.action, ConflictAction::Reject);
        assert!(record.current.is_some());
    }

    let clash = ReplicatedWrite::insert(account(1, 7, 9));
    let record = accounts
        .apply_replicated(&mut session, clash, &mut sink)
        .await
        .context("insert over existing row")?;
    assert_eq!(record.class, ConflictClass::RowExists);
    assert_eq!(record.action, ConflictAction::Escalate);

    let missing = ReplicatedWrite::update(account(9, 0, 1), account(9, 10, 2));
    let record = accounts
        .apply_replicated(&mut session, missing, &mut sink)
        .await
        .context("update of missing row")?;
    assert_eq!(record.class, ConflictClass::RowMissing);
    assert_eq!(record.key, key(9));

    assert_eq!(sink.records().len(), 2);
    assert_eq!(session.conflict_records().len(), 5);
    assert!(session.has_active_transaction(), "conflicts never abort");
    session.commit().await.context("commit")?;

    let stored = harness.cluster.read_row(ACCOUNTS, &key(1)).context("row 1")?;
    assert_eq!((u64_at(&stored, 1), u64_at(&stored, 2)), (150, 6));
    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.conflicts_applied, 1);
    assert_eq!(snapshot.conflicts_rejected, 2);
    assert_eq!(snapshot.conflicts_escalated, 2);
    Ok(())
}

#[tokio::test]
async fn delete_wins_ties_only_with_the_delete_wins_variant() -> Result<()> {
    let harness = Harness::new(test_config());
    for id in [1, 2] {
        harness
            .cluster
            .write_row_direct(ACCOUNTS, account(id, 10, 3))
            .context("seed")?;
    }
    let mut session = harness.session();
    let mut accounts = session.open_table(ACCOUNTS).await.context("open accounts")?;
    let mut sink = VecExceptionSink::new();

    with_resolver(
        &accounts,
        ConflictResolver::new(Arc::new(MaxVersion { column: 2 }), ConflictAction::Reject),
    );
    let record = accounts
        .apply_replicated(&mut session, ReplicatedWrite::delete(account(1, 10, 3)), &mut sink)
        .await
        .context("tied delete")?;
    assert_eq!(record.action, ConflictAction::Reject);

    with_resolver(
        &accounts,
        ConflictResolver::new(
            Arc::new(MaxVersionDeleteWins { column: 2 }),
            ConflictAction::Reject,
        ),
    );
    let record = accounts
        .apply_replicated(&mut session, ReplicatedWrite::delete(account(2, 10, 3)), &mut sink)
        .await
        .context("tied delete wins")?;
    assert_eq!(record.action, ConflictAction::Apply);
    assert_eq!(accounts.records(&session), 1);

    session.commit().await.context("commit")?;
    assert!(harness.cluster.read_row(ACCOUNTS, &key(1)).is_some());
    assert!(harness.cluster.read_row(ACCOUNTS, &key(2)).is_none());
    Ok(())
}

#[tokio::test]
async fn old_image_mismatch_is_escalated() -> Result<()> {
    let harness = Harness::new(test_config());
    harness
        .cluster
        .write_row_direct(ACCOUNTS, account(2, 50, 1))
        .context("seed")?;
    let mut session = harness.session();
    let mut accounts = session.open_table(ACCOUNTS).await.context("open accounts")?;
    // Apply is not a valid conflict action and is treated as Escalate.
    with_resolver(
        &accounts,
        ConflictResolver::new(Arc::new(OldImage), ConflictAction::Apply),
    );
    let mut sink = SharedExceptionSink::new();

    let matching = ReplicatedWrite::update(account(2, 50, 1), account(2, 70, 2));
    let record = accounts
        .apply_replicated(&mut session, matching, &mut sink)
        .await
        .context("matching image")?;
    assert_eq!(record.action, ConflictAction::Apply);

    let outdated = ReplicatedWrite::update(account(2, 50, 1), account(2, 90, 3));
    let record = accounts
        .apply_replicated(&mut session, outdated, &mut sink.clone())
        .await
        .context("outdated image")?;
    assert_eq!(record.class, ConflictClass::GuardFailed);
    assert_eq!(record.action, ConflictAction::Escalate);

    let truncated = ReplicatedWrite::update(vec![account(2, 70, 2)[0].clone()], account(2, 1, 4));
    let record = accounts
        .apply_replicated(&mut session, truncated, &mut sink)
        .await
        .context("truncated image")?;
    assert_eq!(record.class, ConflictClass::GuardUnevaluable);
    assert_eq!(record.action, ConflictAction::Escalate);

    let fresh = ReplicatedWrite::insert(account(3, 5, 1));
    let record = accounts
        .apply_replicated(&mut session, fresh, &mut sink)
        .await
        .context("fresh insert")?;
    assert_eq!(record.action, ConflictAction::Apply);

    session.commit().await.context("commit")?;
    let escalated = sink.drain();
    assert_eq!(escalated.len(), 2);
    assert!(escalated.iter().all(|record| record.function == "old_image"));
    assert!(sink.is_empty());
    let stored = harness.cluster.read_row(ACCOUNTS, &key(2)).context("row 2")?;
    assert_eq!(u64_at(&stored, 1), 70);
    Ok(())
}

#[tokio::test]
async fn tables_without_a_policy_apply_unguarded() -> Result<()> {
    let harness = Harness::new(test_config());
    harness
        .cluster
        .write_row_direct(ACCOUNTS, account(4, 10, 8))
        .context("seed")?;
    let mut session = harness.session();
    let mut accounts = session.open_table(ACCOUNTS).await.context("open accounts")?;
    let mut sink = VecExceptionSink::new();

    let older = ReplicatedWrite::update(account(4, 0, 0), account(4, 20, 1));
    let record = accounts
        .apply_replicated(&mut session, older, &mut sink)
        .await
        .context("unguarded update")?;
    assert_eq!(record.action, ConflictAction::Apply);
    assert_eq!(record.function, "none");
    session.commit().await.context("commit")?;
    let stored = harness.cluster.read_row(ACCOUNTS, &key(4)).context("row 4")?;
    assert_eq!(u64_at(&stored, 2), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_replicated_rows_are_refused() -> Result<()> {
    let harness = Harness::new(test_config());
    let mut session = harness.session();
    let mut accounts = session.open_table(ACCOUNTS).await.context("open accounts")?;
    with_resolver(
        &accounts,
        ConflictResolver::new(Arc::new(OldImage), ConflictAction::Reject),
    );
    let mut sink = VecExceptionSink::new();

    let mut no_before = ReplicatedWrite::update(account(1, 1, 1), account(1, 2, 2));
    no_before.before = None;
    let err = accounts
        .apply_replicated(&mut session, no_before, &mut sink)
        .await
        .expect_err("old_image needs a before image");
    assert!(matches!(err, BridgeError::InvalidRow { .. }));
    assert!(!session.has_active_transaction());

    accounts.share().mark_dropped();
    let err = accounts
        .apply_replicated(&mut session, ReplicatedWrite::insert(account(1, 1, 1)), &mut sink)
        .await
        .expect_err("dropped table");
    assert!(matches!(err, BridgeError::TableUnavailable { .. }));
    assert!(sink.records().is_empty());
    Ok(())
}
