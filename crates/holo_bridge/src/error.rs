//! Error taxonomy for the bridge core.
//!
//! Every variant belongs to exactly one [`ErrorClass`]. Conflict outcomes are
//! not errors; they are reported as [`crate::conflict::ConflictRecord`] data.

use holo_cluster::{ClusterError, NodeId, TxnId};
use thiserror::Error;

use crate::batch::{BatchSlot, RowErrorKind};
use crate::share::ShareState;

/// Coarse error class used for retry and propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Cluster hiccup; safe to retry at a higher layer.
    Transient,
    /// Catalog problem; metadata must be refreshed before retrying.
    Schema,
    /// Failure isolated to one batched row.
    PerRow,
    /// Resource or usage error; fatal to the current statement.
    Resource,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cluster connection is unavailable")]
    NoConnection,
    #[error("cluster rejected a new transaction: {detail}")]
    ResourceExhausted { detail: String },
    #[error("data node {node} unavailable during {operation}")]
    NodeUnavailable {
        node: NodeId,
        operation: &'static str,
    },
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("transaction {txn} aborted during {operation}")]
    TransactionAborted {
        txn: TxnId,
        operation: &'static str,
    },

    #[error("table '{table}' not found")]
    TableNotFound { table: String },
    #[error("index '{index}' not found on table '{table}'")]
    IndexNotFound { table: String, index: String },
    #[error("schema version mismatch on '{table}': expected {expected}, found {actual}")]
    SchemaVersionMismatch {
        table: String,
        expected: u32,
        actual: u32,
    },
    #[error("table '{table}' is {state:?} and no longer accepts {operation}")]
    TableUnavailable {
        table: String,
        state: ShareState,
        operation: &'static str,
    },

    #[error("{operation} on '{table}' failed at slot {slot}: {error}")]
    RowFailed {
        table: String,
        operation: &'static str,
        slot: BatchSlot,
        error: RowErrorKind,
    },
    #[error("batch aborted at slot {slot}: {reason}")]
    BatchAborted { slot: BatchSlot, reason: String },

    #[error("no active transaction for {operation}")]
    TransactionGone { operation: &'static str },
    #[error("{operation} requires an active transaction")]
    NoActiveTransaction { operation: &'static str },
    #[error("batch arena exhausted: {requested} bytes requested, {available} available")]
    ArenaExhausted { requested: usize, available: usize },
    #[error("slot {slot} {reason}")]
    SlotUnavailable {
        slot: BatchSlot,
        reason: &'static str,
    },
    #[error("invalid scan spec: {reason}")]
    InvalidScanSpec { reason: String },
    #[error("cursor {cursor} is closed")]
    CursorClosed { cursor: u64 },
    #[error("{count} cursor(s) still open at {operation}")]
    CursorLeak {
        count: usize,
        operation: &'static str,
    },
    #[error("invalid row for '{table}': {reason}")]
    InvalidRow { table: String, reason: String },
    #[error("cluster protocol error during {operation}: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
    },
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Converts a transport error, tagging it with the failing operation.
    pub fn cluster(err: ClusterError, operation: &'static str) -> Self {
        match err {
            ClusterError::Disconnected => Self::NoConnection,
            ClusterError::TooManyTransactions { limit } => Self::ResourceExhausted {
                detail: format!("transaction limit {limit} reached"),
            },
            ClusterError::NodeUnavailable { node } => Self::NodeUnavailable { node, operation },
            ClusterError::Timeout => Self::Timeout { operation },
            ClusterError::UnknownTable { table } => Self::TableNotFound { table },
            ClusterError::UnknownIndex { table, index } => Self::IndexNotFound { table, index },
            ClusterError::UnknownTransaction { txn } | ClusterError::TransactionAborted { txn } => {
                Self::TransactionAborted { txn, operation }
            }
            ClusterError::SchemaVersionMismatch {
                table,
                expected,
                actual,
            } => Self::SchemaVersionMismatch {
                table,
                expected,
                actual,
            },
            other @ (ClusterError::UnknownScan { .. } | ClusterError::InvalidRequest(_)) => {
                Self::Protocol {
                    operation,
                    detail: other.to_string(),
                }
            }
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NoConnection
            | Self::ResourceExhausted { .. }
            | Self::NodeUnavailable { .. }
            | Self::Timeout { .. }
            | Self::TransactionAborted { .. } => ErrorClass::Transient,
            Self::TableNotFound { .. }
            | Self::IndexNotFound { .. }
            | Self::SchemaVersionMismatch { .. }
            | Self::TableUnavailable { .. } => ErrorClass::Schema,
            Self::RowFailed { .. } | Self::BatchAborted { .. } => ErrorClass::PerRow,
            Self::TransactionGone { .. }
            | Self::NoActiveTransaction { .. }
            | Self::ArenaExhausted { .. }
            | Self::SlotUnavailable { .. }
            | Self::InvalidScanSpec { .. }
            | Self::CursorClosed { .. }
            | Self::CursorLeak { .. }
            | Self::InvalidRow { .. }
            | Self::Protocol { .. } => ErrorClass::Resource,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Errors after which the cluster transaction cannot continue.
    pub fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            Self::NoConnection
                | Self::NodeUnavailable { .. }
                | Self::Timeout { .. }
                | Self::TransactionAborted { .. }
                | Self::BatchAborted { .. }
                | Self::CursorLeak { .. }
                | Self::Protocol { .. }
        )
    }
}

impl From<ClusterError> for BridgeError {
    fn from(err: ClusterError) -> Self {
        Self::cluster(err, "cluster")
    }
}
