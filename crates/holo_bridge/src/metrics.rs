//! Process-wide counters for bridge activity.
//!
//! Hot-path counters are lock-free atomics. Sessions accumulate their own
//! [`SessionCounters`] without synchronization and fold them in when a
//! transaction ends.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use holo_cluster::NodeId;
use serde::Serialize;

use crate::conflict::ConflictAction;

/// Per-data-node coordinator selection counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeHintMetrics {
    /// Transactions started on this node because a partition hint chose it.
    pub hinted: u64,
    /// Transactions the cluster placed on this node without a hint.
    pub unhinted: u64,
}

/// Plain per-session counters; no atomics because a session has one owner.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    /// Execute round trips (flushes that reached the cluster).
    pub execute_count: u64,
    /// Cluster scans opened.
    pub scan_count: u64,
    /// Scans pinned to a single partition.
    pub pruned_scan_count: u64,
    /// Rows sent through flushes.
    pub rows_flushed: u64,
    /// Per-row errors reported by flushes.
    pub row_errors: u64,
    pub node_hints: BTreeMap<NodeId, NodeHintMetrics>,
}

impl SessionCounters {
    pub(crate) fn record_coordinator(&mut self, node: NodeId, hinted: bool) {
        let entry = self.node_hints.entry(node).or_default();
        if hinted {
            entry.hinted += 1;
        } else {
            entry.unhinted += 1;
        }
    }
}

/// Aggregated counters for every session of one process.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    execute_count: AtomicU64,
    scan_count: AtomicU64,
    pruned_scan_count: AtomicU64,
    rows_flushed: AtomicU64,
    row_errors: AtomicU64,
    txn_started: AtomicU64,
    txn_committed: AtomicU64,
    txn_aborted: AtomicU64,
    txn_reused: AtomicU64,
    cursor_leaks: AtomicU64,
    conflicts_applied: AtomicU64,
    conflicts_rejected: AtomicU64,
    conflicts_escalated: AtomicU64,
    node_hints: Mutex<BTreeMap<NodeId, NodeHintMetrics>>,
}

/// Immutable snapshot view of [`BridgeMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeMetricsSnapshot {
    pub execute_count: u64,
    pub scan_count: u64,
    pub pruned_scan_count: u64,
    pub rows_flushed: u64,
    pub row_errors: u64,
    pub txn_started: u64,
    pub txn_committed: u64,
    pub txn_aborted: u64,
    pub txn_reused: u64,
    pub cursor_leaks: u64,
    pub conflicts_applied: u64,
    pub conflicts_rejected: u64,
    pub conflicts_escalated: u64,
    pub node_hints: BTreeMap<NodeId, NodeHintMetrics>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_txn_started(&self) {
        self.txn_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txn_committed(&self) {
        self.txn_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_txn_aborted(&self) {
        self.txn_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a `start` that returned the already-active handle.
    pub fn record_txn_reused(&self) {
        self.txn_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cursor_leaks(&self, count: usize) {
        self.cursor_leaks.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_conflict(&self, action: ConflictAction) {
        let counter = match action {
            ConflictAction::Apply => &self.conflicts_applied,
            ConflictAction::Reject => &self.conflicts_rejected,
            ConflictAction::Escalate => &self.conflicts_escalated,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds a session's unreported counters into the process totals.
    pub fn fold_session(&self, counters: &SessionCounters) {
        self.execute_count
            .fetch_add(counters.execute_count, Ordering::Relaxed);
        self.scan_count.fetch_add(counters.scan_count, Ordering::Relaxed);
        self.pruned_scan_count
            .fetch_add(counters.pruned_scan_count, Ordering::Relaxed);
        self.rows_flushed
            .fetch_add(counters.rows_flushed, Ordering::Relaxed);
        self.row_errors.fetch_add(counters.row_errors, Ordering::Relaxed);
        if counters.node_hints.is_empty() {
            return;
        }
        let mut node_hints = self
            .node_hints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (node, hints) in &counters.node_hints {
            let entry = node_hints.entry(*node).or_default();
            entry.hinted = entry.hinted.saturating_add(hints.hinted);
            entry.unhinted = entry.unhinted.saturating_add(hints.unhinted);
        }
    }

    pub fn snapshot(&self) -> BridgeMetricsSnapshot {
        let node_hints = self
            .node_hints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        BridgeMetricsSnapshot {
            execute_count: self.execute_count.load(Ordering::Relaxed),
            scan_count: self.scan_count.load(Ordering::Relaxed),
            pruned_scan_count: self.pruned_scan_count.load(Ordering::Relaxed),
            rows_flushed: self.rows_flushed.load(Ordering::Relaxed),
            row_errors: self.row_errors.load(Ordering::Relaxed),
            txn_started: self.txn_started.load(Ordering::Relaxed),
            txn_committed: self.txn_committed.load(Ordering::Relaxed),
            txn_aborted: self.txn_aborted.load(Ordering::Relaxed),
            txn_reused: self.txn_reused.load(Ordering::Relaxed),
            cursor_leaks: self.cursor_leaks.load(Ordering::Relaxed),
            conflicts_applied: self.conflicts_applied.load(Ordering::Relaxed),
            conflicts_rejected: self.conflicts_rejected.load(Ordering::Relaxed),
            conflicts_escalated: self.conflicts_escalated.load(Ordering::Relaxed),
            node_hints,
        }
    }
}
