//! Transport-level failures reported by a cluster connection.

use thiserror::Error;

use crate::types::{NodeId, ScanId, TxnId};

/// Errors surfaced by [`crate::ClusterConnection`] round trips.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("cluster connection is down")]
    Disconnected,
    #[error("cluster transaction limit reached (limit={limit})")]
    TooManyTransactions { limit: usize },
    #[error("data node {node} is unavailable")]
    NodeUnavailable { node: NodeId },
    #[error("cluster request timed out")]
    Timeout,
    #[error("table '{table}' does not exist in the cluster catalog")]
    UnknownTable { table: String },
    #[error("index '{index}' does not exist on table '{table}'")]
    UnknownIndex { table: String, index: String },
    #[error("unknown transaction {txn}")]
    UnknownTransaction { txn: TxnId },
    #[error("transaction {txn} has been aborted")]
    TransactionAborted { txn: TxnId },
    #[error("unknown scan {scan}")]
    UnknownScan { scan: ScanId },
    #[error("schema version mismatch for table '{table}': expected {expected}, found {actual}")]
    SchemaVersionMismatch {
        table: String,
        expected: u32,
        actual: u32,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
