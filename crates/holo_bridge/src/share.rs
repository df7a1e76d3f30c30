//! Process-wide table shares and the registry that owns them.
//!
//! A [`TableShare`] is the metadata every session sees for one cluster table:
//! lifecycle state, index descriptors, cached statistics, logging policy and
//! the auto-increment range cache. Mutable parts live behind one per-share
//! mutex. The [`ShareRegistry`] keeps shares alive while any [`ShareRef`]
//! exists (or while an alter holds a pin) and rebuilds them from the cluster
//! catalog on first open.
//!
//! Lock order: registry lock before share lock, never the reverse.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use holo_cluster::{
    partition_for_key, ClusterConnection, IndexDef, IndexId, KeyTuple, PartitionId, TableDef,
    TableStatistics,
};
use tracing::{debug, info, warn};

use crate::conflict::ConflictResolver;
use crate::error::{BridgeError, BridgeResult};

/// Lifecycle of a share. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    Initial,
    Altered,
    Dropped,
}

impl ShareState {
    fn rank(self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::Altered => 1,
            Self::Dropped => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    PrimaryKey,
    PrimaryKeyOrdered,
    Unique,
    UniqueOrdered,
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Undefined,
    Active,
    ToBeDropped,
}

/// Client-side view of one index. Number 0 is always the primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub kind: IndexKind,
    pub status: IndexStatus,
    /// Cluster index object; `None` addresses the primary key itself.
    pub index_id: Option<IndexId>,
    /// Row positions of the index columns, in index order.
    pub columns: Vec<usize>,
    /// For each primary-key attribute, its position inside the index key.
    pub primary_key_map: Vec<Option<usize>>,
    /// Some index column is nullable.
    pub nullable: bool,
}

impl IndexDescriptor {
    fn primary(def: &TableDef) -> Self {
        Self {
            name: "PRIMARY".to_string(),
            kind: if def.primary_key_ordered {
                IndexKind::PrimaryKeyOrdered
            } else {
                IndexKind::PrimaryKey
            },
            status: IndexStatus::Active,
            index_id: None,
            columns: def.primary_key.clone(),
            primary_key_map: (0..def.primary_key.len()).map(Some).collect(),
            nullable: false,
        }
    }

    fn secondary(def: &TableDef, index: &IndexDef) -> Self {
        let kind = match (index.unique, index.ordered) {
            (true, true) => IndexKind::UniqueOrdered,
            (true, false) => IndexKind::Unique,
            _ => IndexKind::Ordered,
        };
        let primary_key_map = def
            .primary_key
            .iter()
            .map(|pk_column| index.columns.iter().position(|column| column == pk_column))
            .collect();
        let nullable = index
            .columns
            .iter()
            .any(|column| def.columns.get(*column).map(|c| c.nullable).unwrap_or(true));
        Self {
            name: index.name.clone(),
            kind,
            status: IndexStatus::Active,
            index_id: Some(index.id),
            columns: index.columns.clone(),
            primary_key_map,
            nullable,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.kind, IndexKind::PrimaryKey | IndexKind::PrimaryKeyOrdered)
    }

    pub fn is_unique(&self) -> bool {
        !matches!(self.kind, IndexKind::Ordered)
    }

    /// Has an ordered part usable for range scans.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self.kind,
            IndexKind::PrimaryKeyOrdered | IndexKind::UniqueOrdered | IndexKind::Ordered
        )
    }

    pub fn is_active(&self) -> bool {
        self.status == IndexStatus::Active
    }

    /// Whether an equality lookup on `key` can use the hash part. A NULL
    /// component in a nullable unique index does not identify one row.
    pub fn point_lookup_allowed(&self, key: &KeyTuple) -> bool {
        self.is_active()
            && self.is_unique()
            && key.len() == self.columns.len()
            && !(self.nullable && key.has_null())
    }

    /// Rebuilds the primary key from a full index key when the index covers
    /// every primary-key attribute.
    pub fn primary_key_from(&self, key: &KeyTuple) -> Option<KeyTuple> {
        let parts = self
            .primary_key_map
            .iter()
            .map(|position| position.and_then(|pos| key.parts().get(pos).cloned()))
            .collect::<Option<Vec<_>>>()?;
        Some(KeyTuple::new(parts))
    }
}

/// Binary-log policy flags of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggingPolicy {
    pub no_logging: bool,
    /// Log full row images instead of changed columns only.
    pub full_row_logging: bool,
    /// Log updates as updates rather than as write (upsert) events.
    pub log_updates_as_update: bool,
}

#[derive(Debug, Default)]
struct AutoIncrementRange {
    next: u64,
    end: u64,
}

#[derive(Debug)]
struct ShareInner {
    state: ShareState,
    indexes: Vec<IndexDescriptor>,
    statistics: TableStatistics,
    logging: LoggingPolicy,
    auto_increment: AutoIncrementRange,
    pinned_for_alter: bool,
    conflict_resolver: Option<Arc<ConflictResolver>>,
}

/// Shared metadata for one cluster table.
pub struct TableShare {
    name: String,
    def: TableDef,
    inner: Mutex<ShareInner>,
}

impl fmt::Debug for TableShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableShare")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TableShare {
    pub fn new(def: TableDef, statistics: TableStatistics) -> Self {
        let mut indexes = vec![IndexDescriptor::primary(&def)];
        indexes.extend(
            def.indexes
                .iter()
                .map(|index| IndexDescriptor::secondary(&def, index)),
        );
        Self {
            name: def.name.clone(),
            inner: Mutex::new(ShareInner {
                state: ShareState::Initial,
                indexes,
                statistics,
                logging: LoggingPolicy::default(),
                auto_increment: AutoIncrementRange::default(),
                pinned_for_alter: false,
                conflict_resolver: None,
            }),
            def,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &TableDef {
        &self.def
    }

    pub fn has_hidden_key(&self) -> bool {
        self.def.hidden_key
    }

    pub fn has_large_objects(&self) -> bool {
        self.def.has_large_objects()
    }

    fn lock(&self) -> MutexGuard<'_, ShareInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ShareState {
        self.lock().state
    }

    pub fn mark_altered(&self) -> bool {
        self.transition(ShareState::Altered)
    }

    pub fn mark_dropped(&self) -> bool {
        self.transition(ShareState::Dropped)
    }

    fn transition(&self, target: ShareState) -> bool {
        let mut inner = self.lock();
        if target.rank() <= inner.state.rank() {
            if target != inner.state {
                warn!(
                    table = %self.name,
                    current = ?inner.state,
                    requested = ?target,
                    "holobridge ignored share state reversal"
                );
            }
            return false;
        }
        debug!(table = %self.name, from = ?inner.state, to = ?target, "holobridge share state change");
        inner.state = target;
        true
    }

    pub fn pin_for_alter(&self) {
        self.lock().pinned_for_alter = true;
    }

    pub fn unpin_alter(&self) {
        self.lock().pinned_for_alter = false;
    }

    pub fn is_pinned_for_alter(&self) -> bool {
        self.lock().pinned_for_alter
    }

    /// Snapshot of every index descriptor, primary key first.
    pub fn indexes(&self) -> Vec<IndexDescriptor> {
        self.lock().indexes.clone()
    }

    pub fn index(&self, number: usize) -> Option<IndexDescriptor> {
        self.lock().indexes.get(number).cloned()
    }

    pub fn index_number(&self, name: &str) -> Option<usize> {
        self.lock().indexes.iter().position(|index| index.name == name)
    }

    /// Records a status change made by index add/drop outside the core.
    pub fn set_index_status(&self, number: usize, status: IndexStatus) -> bool {
        let mut inner = self.lock();
        match inner.indexes.get_mut(number) {
            Some(index) => {
                index.status = status;
                true
            }
            None => false,
        }
    }

    pub fn statistics(&self) -> TableStatistics {
        self.lock().statistics
    }

    pub async fn refresh_statistics(&self, conn: &dyn ClusterConnection) -> BridgeResult<TableStatistics> {
        let statistics = conn
            .table_statistics(&self.name)
            .await
            .map_err(|err| BridgeError::cluster(err, "table_statistics"))?;
        self.lock().statistics = statistics;
        Ok(statistics)
    }

    /// Folds one committed transaction's row delta into the cached counters.
    pub fn apply_commit(&self, row_delta: i64) {
        let mut inner = self.lock();
        inner.statistics.commit_count = inner.statistics.commit_count.saturating_add(1);
        inner.statistics.row_count = inner.statistics.row_count.saturating_add_signed(row_delta);
    }

    pub fn logging_policy(&self) -> LoggingPolicy {
        self.lock().logging
    }

    pub fn set_logging_policy(&self, policy: LoggingPolicy) {
        self.lock().logging = policy;
    }

    pub fn conflict_resolver(&self) -> Option<Arc<ConflictResolver>> {
        self.lock().conflict_resolver.clone()
    }

    pub fn set_conflict_resolver(&self, resolver: Option<Arc<ConflictResolver>>) {
        self.lock().conflict_resolver = resolver;
    }

    /// Partition that owns `key` under the table's partition function.
    pub fn partition_of(&self, key: &KeyTuple) -> PartitionId {
        partition_for_key(key, self.def.partitions)
    }

    /// Hands out the next auto-increment (or hidden primary key) value,
    /// reserving `prefetch` ids from the cluster when the cached range is empty.
    pub async fn next_auto_increment(
        &self,
        conn: &dyn ClusterConnection,
        prefetch: u64,
    ) -> BridgeResult<u64> {
        if let Some(id) = self.take_cached_id() {
            return Ok(id);
        }
        let prefetch = prefetch.max(1);
        let first = conn
            .reserve_tuple_ids(&self.name, prefetch)
            .await
            .map_err(|err| BridgeError::cluster(err, "reserve_tuple_ids"))?;
        let mut inner = self.lock();
        // Decision: a range refilled concurrently by another session is
        // replaced; its unused ids are skipped, never reissued.
        inner.auto_increment = AutoIncrementRange {
            next: first.saturating_add(1),
            end: first.saturating_add(prefetch),
        };
        debug!(table = %self.name, first, prefetch, "holobridge reserved auto-increment range");
        Ok(first)
    }

    fn take_cached_id(&self) -> Option<u64> {
        let mut inner = self.lock();
        let range = &mut inner.auto_increment;
        if range.next < range.end {
            let id = range.next;
            range.next += 1;
            Some(id)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct RegistryEntry {
    share: Arc<TableShare>,
    refs: usize,
}

/// Registry of open shares keyed by fully-qualified table name.
#[derive(Debug, Default)]
pub struct ShareRegistry {
    shares: Mutex<HashMap<String, RegistryEntry>>,
}

impl ShareRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        self.shares
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a counted reference to the share for `name`, building it from
    /// the cluster catalog on first open.
    pub async fn acquire(
        self: &Arc<Self>,
        name: &str,
        conn: &dyn ClusterConnection,
    ) -> BridgeResult<ShareRef> {
        if let Some(share) = self.try_acquire(name) {
            return Ok(share);
        }

        let def = conn
            .fetch_table(name)
            .await
            .map_err(|err| BridgeError::cluster(err, "fetch_table"))?
            .ok_or_else(|| BridgeError::TableNotFound {
                table: name.to_string(),
            })?;
        let statistics = conn
            .table_statistics(name)
            .await
            .map_err(|err| BridgeError::cluster(err, "table_statistics"))?;
        let fresh = Arc::new(TableShare::new(def, statistics));

        let mut shares = self.lock();
        // Another session may have opened the table while we were fetching.
        if let Some(entry) = shares.get_mut(name) {
            if entry.share.state() != ShareState::Dropped {
                entry.refs += 1;
                return Ok(ShareRef {
                    registry: Arc::clone(self),
                    share: Arc::clone(&entry.share),
                });
            }
        }
        info!(table = %name, "holobridge opened table share");
        shares.insert(
            name.to_string(),
            RegistryEntry {
                share: Arc::clone(&fresh),
                refs: 1,
            },
        );
        Ok(ShareRef {
            registry: Arc::clone(self),
            share: fresh,
        })
    }

    fn try_acquire(self: &Arc<Self>, name: &str) -> Option<ShareRef> {
        let mut shares = self.lock();
        let entry = shares.get_mut(name)?;
        // Decision: a dropped share is never handed out again; the next open
        // rebuilds it from the catalog.
        if entry.share.state() == ShareState::Dropped {
            return None;
        }
        entry.refs += 1;
        Some(ShareRef {
            registry: Arc::clone(self),
            share: Arc::clone(&entry.share),
        })
    }

    fn release(&self, share: &Arc<TableShare>) {
        let mut shares = self.lock();
        let Some(entry) = shares.get_mut(share.name()) else {
            return;
        };
        if !Arc::ptr_eq(&entry.share, share) {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 && !entry.share.is_pinned_for_alter() {
            shares.remove(share.name());
            debug!(table = %share.name(), "holobridge destroyed table share");
        }
    }

    /// Clears an alter pin and destroys the share if nobody references it.
    pub fn unpin(&self, name: &str) {
        let mut shares = self.lock();
        let Some(entry) = shares.get(name) else {
            return;
        };
        entry.share.unpin_alter();
        if entry.refs == 0 {
            shares.remove(name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn refcount(&self, name: &str) -> Option<usize> {
        self.lock().get(name).map(|entry| entry.refs)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Counted handle to a registered share; dropping it releases the reference.
#[derive(Debug)]
pub struct ShareRef {
    registry: Arc<ShareRegistry>,
    share: Arc<TableShare>,
}

impl Clone for ShareRef {
    fn clone(&self) -> Self {
        let mut shares = self.registry.lock();
        if let Some(entry) = shares.get_mut(self.share.name()) {
            if Arc::ptr_eq(&entry.share, &self.share) {
                entry.refs += 1;
            }
        }
        Self {
            registry: Arc::clone(&self.registry),
            share: Arc::clone(&self.share),
        }
    }
}

impl Deref for ShareRef {
    type Target = TableShare;

    fn deref(&self) -> &TableShare {
        &self.share
    }
}

impl Drop for ShareRef {
    fn drop(&mut self) {
        self.registry.release(&self.share);
    }
}
