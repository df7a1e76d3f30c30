//! Value types exchanged with the cluster: keys, rows, versions, catalog
//! definitions, batched operations and scan requests.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Data node identifier.
pub type NodeId = u32;
/// Partition (fragment) identifier within one table.
pub type PartitionId = u32;

/// Cluster-assigned transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Cluster-assigned identifier of one open server-side scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan-{}", self.0)
    }
}

/// Catalog identifier of one index object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexId(pub u32);

/// Handle to a large-object value stored outside the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LargeObjectHandle(pub u64);

/// Version metadata stamped on every stored row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowVersion {
    pub seq: u64,
    pub node_id: NodeId,
}

impl RowVersion {
    pub const fn zero() -> Self {
        Self { seq: 0, node_id: 0 }
    }
}

/// One column value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    Scalar(Bytes),
    LargeObject(LargeObjectHandle),
}

impl ColumnValue {
    /// Builds a scalar value from anything convertible into `Bytes`.
    pub fn scalar(value: impl Into<Bytes>) -> Self {
        Self::Scalar(value.into())
    }

    /// Big-endian `u64` scalar, the layout used for version and id columns.
    pub fn from_u64(value: u64) -> Self {
        Self::Scalar(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn as_scalar(&self) -> Option<&Bytes> {
        match self {
            Self::Scalar(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Decodes an 8-byte big-endian scalar.
    pub fn as_u64(&self) -> Option<u64> {
        let bytes = self.as_scalar()?;
        let raw: [u8; 8] = bytes.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(raw))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Bytes this value occupies in a row payload.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Scalar(bytes) => bytes.len(),
            Self::LargeObject(_) => std::mem::size_of::<u64>(),
        }
    }
}

/// Ordered composite key. `None` components are SQL NULLs and sort first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyTuple(pub Vec<Option<Bytes>>);

impl KeyTuple {
    pub fn new(parts: Vec<Option<Bytes>>) -> Self {
        Self(parts)
    }

    /// Builds a key of non-null big-endian `u64` components.
    pub fn from_u64s(values: &[u64]) -> Self {
        Self(
            values
                .iter()
                .map(|value| Some(Bytes::copy_from_slice(&value.to_be_bytes())))
                .collect(),
        )
    }

    pub fn parts(&self) -> &[Option<Bytes>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_null(&self) -> bool {
        self.0.iter().any(Option::is_none)
    }

    /// Approximate encoded size used for batch budgeting.
    pub fn encoded_len(&self) -> usize {
        self.0
            .iter()
            .map(|part| part.as_ref().map(Bytes::len).unwrap_or(0).saturating_add(1))
            .sum()
    }

    /// Compares this key against a (possibly shorter) bound on the bound's
    /// prefix length only.
    pub fn cmp_prefix(&self, bound: &KeyTuple) -> Ordering {
        let len = bound.len().min(self.len());
        self.0[..len].cmp(&bound.0[..len])
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, part) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            match part {
                Some(bytes) => write!(f, "{}", hex::encode(bytes))?,
                None => write!(f, "NULL")?,
            }
        }
        write!(f, ")")
    }
}

/// Returns `true` when `key` lies within `[low, high]` honoring bound kinds
/// and prefix semantics.
pub fn bound_contains(key: &KeyTuple, low: &Bound<KeyTuple>, high: &Bound<KeyTuple>) -> bool {
    let above_low = match low {
        Bound::Unbounded => true,
        Bound::Included(bound) => key.cmp_prefix(bound) != Ordering::Less,
        Bound::Excluded(bound) => key.cmp_prefix(bound) == Ordering::Greater,
    };
    let below_high = match high {
        Bound::Unbounded => true,
        Bound::Included(bound) => key.cmp_prefix(bound) != Ordering::Greater,
        Bound::Excluded(bound) => key.cmp_prefix(bound) == Ordering::Less,
    };
    above_low && below_high
}

/// Stable partition function shared by the cluster and its clients.
pub fn partition_for_key(key: &KeyTuple, partitions: u32) -> PartitionId {
    let mut hasher = crc32fast::Hasher::new();
    for part in key.parts() {
        match part {
            Some(bytes) => {
                hasher.update(&[1]);
                hasher.update(&(bytes.len() as u32).to_be_bytes());
                hasher.update(bytes);
            }
            None => hasher.update(&[0]),
        }
    }
    hasher.finalize() % partitions.max(1)
}

/// One row image. `version` is set on rows read from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<ColumnValue>,
    pub version: Option<RowVersion>,
}

impl Row {
    pub fn new(columns: Vec<ColumnValue>) -> Self {
        Self {
            columns,
            version: None,
        }
    }

    pub fn with_version(mut self, version: RowVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Extracts a key over `positions`; `None` when a position is missing or
    /// holds a large object.
    pub fn key_for(&self, positions: &[usize]) -> Option<KeyTuple> {
        key_from_columns(&self.columns, positions)
    }

    pub fn payload_len(&self) -> usize {
        self.columns.iter().map(ColumnValue::payload_len).sum()
    }
}

/// Extracts a key tuple from a column slice.
pub fn key_from_columns(columns: &[ColumnValue], positions: &[usize]) -> Option<KeyTuple> {
    let mut parts = Vec::with_capacity(positions.len());
    for position in positions {
        match columns.get(*position)? {
            ColumnValue::Null => parts.push(None),
            ColumnValue::Scalar(bytes) => parts.push(Some(bytes.clone())),
            ColumnValue::LargeObject(_) => return None,
        }
    }
    Some(KeyTuple(parts))
}

/// Catalog column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub nullable: bool,
    /// Stored out of row and returned as a [`LargeObjectHandle`].
    pub large_object: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            nullable,
            large_object: false,
        }
    }

    pub fn large_object(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            large_object: true,
        }
    }
}

/// Catalog index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub id: IndexId,
    pub name: String,
    /// Has a unique hash part.
    pub unique: bool,
    /// Has an ordered (range-scannable) part.
    pub ordered: bool,
    pub columns: Vec<usize>,
}

/// Catalog table definition fetched on first open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub table_id: u64,
    pub schema_version: u32,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<usize>,
    /// Primary key also has an ordered index.
    pub primary_key_ordered: bool,
    /// Primary key is a synthetic `u64` in column 0 allocated by the client.
    pub hidden_key: bool,
    pub partitions: u32,
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn primary_key_of(&self, columns: &[ColumnValue]) -> Option<KeyTuple> {
        key_from_columns(columns, &self.primary_key)
    }

    pub fn index(&self, id: IndexId) -> Option<&IndexDef> {
        self.indexes.iter().find(|index| index.id == id)
    }

    pub fn index_by_name(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|index| index.name == name)
    }

    pub fn has_large_objects(&self) -> bool {
        self.columns.iter().any(|column| column.large_object)
    }
}

/// Statistics the cluster keeps per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatistics {
    pub row_count: u64,
    pub commit_count: u64,
    pub row_size: u64,
    pub fragment_memory: u64,
}

/// Batched operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Update,
    /// Insert-or-overwrite.
    Write,
    Delete,
    Read,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Read => "read",
        }
    }

    pub fn carries_row(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Write)
    }
}

/// How an operation addresses its row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAccess {
    PrimaryKey(KeyTuple),
    UniqueIndex { index: IndexId, key: KeyTuple },
}

impl KeyAccess {
    pub fn key(&self) -> &KeyTuple {
        match self {
            Self::PrimaryKey(key) => key,
            Self::UniqueIndex { key, .. } => key,
        }
    }
}

/// Interpreted predicate evaluated by the cluster against the stored row
/// immediately before applying the write it is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteGuard {
    /// Stored row version must equal the given version.
    VersionEquals(RowVersion),
    /// Stored `u64` column must be below `value` (or equal when inclusive).
    VersionColumnBelow {
        column: usize,
        value: u64,
        inclusive: bool,
    },
    /// Stored in-row columns must equal this image (large objects ignored).
    RowEquals(Vec<ColumnValue>),
}

/// One operation inside an execute round trip.
#[derive(Debug, Clone)]
pub struct ClusterOp {
    pub table: String,
    pub kind: OpKind,
    pub access: KeyAccess,
    pub columns: Vec<ColumnValue>,
    pub guard: Option<WriteGuard>,
}

/// Per-operation outcome of an execute round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// `replaced` is set when a write overwrote an existing row.
    Applied { version: RowVersion, replaced: bool },
    Deleted,
    Found(Row),
    NotFound,
    DuplicateKey,
    GuardFailed { current: RowVersion },
    GuardUnevaluable { reason: String },
}

impl OpOutcome {
    /// Per-row failures that abort the transaction under
    /// [`ExecMode::AbortOnError`].
    pub fn is_row_error(&self, kind: OpKind) -> bool {
        match self {
            Self::DuplicateKey => true,
            Self::NotFound => kind != OpKind::Read,
            _ => false,
        }
    }
}

/// Error policy for one execute round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// First per-row error aborts the transaction.
    AbortOnError,
    /// Per-row errors are reported and siblings continue.
    IgnoreError,
}

/// Result of one execute round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Outcomes in operation order; shorter than the request when aborted.
    pub outcomes: Vec<OpOutcome>,
    pub aborted: bool,
}

/// Transaction started on a coordinator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedTransaction {
    pub txn: TxnId,
    pub coordinator: NodeId,
}

/// Access path for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAccess {
    /// Table order (primary key); unbounded means a full table scan.
    PrimaryKey,
    OrderedIndex(IndexId),
}

/// One bound pair of a (multi-)range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanBound {
    pub range_no: usize,
    pub low: Bound<KeyTuple>,
    pub high: Bound<KeyTuple>,
}

/// Server-side scan definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub table: String,
    pub access: ScanAccess,
    /// `None` fans out to every partition.
    pub partition: Option<PartitionId>,
    /// Empty means unbounded.
    pub bounds: Vec<ScanBound>,
    pub descending: bool,
}

/// A scanned row tagged with the bound that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRow {
    pub range_no: Option<usize>,
    pub row: Row,
}

/// One fetched page of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanBatch {
    pub rows: Vec<ScannedRow>,
    pub done: bool,
}
