//! HoloBridge: the client-side bridge between a row-oriented SQL executor and
//! the partitioned HoloStore row cluster.
//!
//! The bridge owns:
//! - process-wide table shares and their registry,
//! - per-session transactions, statement nesting and write batching,
//! - scan cursors, multi-range reads and replicated-write conflict checks.
//!
//! Everything that crosses the network goes through
//! [`holo_cluster::ClusterConnection`] and is `async`.

pub mod batch;
pub mod config;
pub mod conflict;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod mrr;
pub mod row;
pub mod scan;
pub mod session;
pub mod share;

pub use batch::{BatchSlot, BatchedOperation, FlushReport, RowError, RowErrorKind};
pub use config::BridgeConfig;
pub use conflict::{
    ConflictAction, ConflictClass, ConflictFunction, ConflictRecord, ConflictResolver,
    ExceptionSink, MaxVersion, MaxVersionDeleteWins, OldImage, ReplicatedKind, ReplicatedWrite,
    SharedExceptionSink, VecExceptionSink,
};
pub use error::{BridgeError, BridgeResult, ErrorClass};
pub use handler::{
    BulkInsertReport, DeleteOutcome, HandlerInfo, RowHandler, RowId, UpdateOutcome, WriteMode,
    WriteOutcome,
};
pub use metrics::{BridgeMetrics, BridgeMetricsSnapshot, NodeHintMetrics, SessionCounters};
pub use mrr::{KeyRange, MultiRangeStream};
pub use row::{materialize_row, ClusterLargeObjects, LargeObjectSource};
pub use scan::{CursorState, ScanCursor, ScanOrder, ScanSpec};
pub use session::{PartitionHint, SessionContext, TransactionHandle};
pub use share::{
    IndexDescriptor, IndexKind, IndexStatus, LoggingPolicy, ShareRef, ShareRegistry, ShareState,
    TableShare,
};
