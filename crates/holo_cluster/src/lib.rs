//! Client contract for the partitioned HoloStore row cluster.
//!
//! The bridge core talks to the cluster exclusively through
//! [`ClusterConnection`]. Round trips are `async`; releasing scans and
//! transactions is local bookkeeping in the client and therefore synchronous,
//! which lets owners release them from `Drop`.
//!
//! [`InMemoryCluster`] implements the contract in process. It keeps real
//! partitions, versions, undo logs and paged scans so tests and the workload
//! driver exercise the same code paths a networked client would.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

mod error;
pub mod memory;
mod types;

pub use error::{ClusterError, ClusterResult};
pub use memory::{InMemoryCluster, InMemoryClusterConfig};
pub use types::*;

/// Connection to the storage cluster shared by every session of a process.
#[async_trait]
pub trait ClusterConnection: Send + Sync + fmt::Debug {
    /// Returns `false` once the connection to the cluster is lost.
    fn is_connected(&self) -> bool;

    /// Data nodes currently known to the client.
    fn data_nodes(&self) -> Vec<NodeId>;

    /// Fetches the catalog definition of `table`, `None` when absent.
    async fn fetch_table(&self, table: &str) -> ClusterResult<Option<TableDef>>;

    /// Fetches committed statistics for `table`.
    async fn table_statistics(&self, table: &str) -> ClusterResult<TableStatistics>;

    /// Reserves `count` consecutive tuple ids and returns the first one.
    async fn reserve_tuple_ids(&self, table: &str, count: u64) -> ClusterResult<u64>;

    /// Primary data node of one partition of `table`.
    fn partition_primary(&self, table: &str, partition: PartitionId) -> ClusterResult<NodeId>;

    /// Starts a transaction, optionally on a preferred coordinator node.
    async fn start_transaction(&self, coordinator: Option<NodeId>)
        -> ClusterResult<StartedTransaction>;

    /// Executes `ops` in order inside `txn` as one round trip.
    async fn execute(
        &self,
        txn: TxnId,
        ops: Vec<ClusterOp>,
        mode: ExecMode,
    ) -> ClusterResult<ExecResult>;

    async fn commit(&self, txn: TxnId) -> ClusterResult<()>;

    async fn rollback(&self, txn: TxnId) -> ClusterResult<()>;

    /// Releases the transaction handle; an unfinished transaction is aborted.
    fn close_transaction(&self, txn: TxnId);

    async fn open_scan(&self, txn: TxnId, request: ScanRequest) -> ClusterResult<ScanId>;

    /// Fetches the next page of at most `max_rows` rows.
    async fn fetch_scan(&self, scan: ScanId, max_rows: usize) -> ClusterResult<ScanBatch>;

    /// Releases a scan; unknown or already-closed scans are ignored.
    fn close_scan(&self, scan: ScanId);

    /// Scans still open under `txn`.
    fn open_scans(&self, txn: TxnId) -> Vec<ScanId>;

    async fn read_large_object(&self, handle: LargeObjectHandle) -> ClusterResult<Bytes>;
}
