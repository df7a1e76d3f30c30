//! Shared helpers for bridge integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use holo_bridge::{BridgeConfig, BridgeMetrics, SessionContext, ShareRegistry};
use holo_cluster::{
    ClusterConnection, ColumnDef, ColumnValue, IndexDef, IndexId, InMemoryCluster,
    InMemoryClusterConfig, KeyTuple, Row, TableDef,
};

pub const ORDERS: &str = "shop.orders";
pub const PAYLOADS: &str = "shop.payloads";
pub const EVENTS: &str = "shop.events";
pub const DOCUMENTS: &str = "shop.documents";
pub const ACCOUNTS: &str = "repl.accounts";

/// Index numbers of `shop.orders` as seen through a share.
pub const ORDERS_PRIMARY: usize = 0;
pub const ORDERS_BY_CUSTOMER: usize = 1;
pub const ORDERS_BY_REFERENCE: usize = 2;

/// One in-memory cluster plus the process-wide bridge objects.
pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub registry: Arc<ShareRegistry>,
    pub metrics: Arc<BridgeMetrics>,
    pub config: BridgeConfig,
}

impl Harness {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_cluster(InMemoryClusterConfig::default(), config)
    }

    pub fn with_cluster(cluster_config: InMemoryClusterConfig, config: BridgeConfig) -> Self {
        let cluster = Arc::new(InMemoryCluster::new(cluster_config));
        for def in [
            orders_table(2),
            payloads_table(),
            events_table(),
            documents_table(),
            accounts_table(),
        ] {
            cluster.create_table(def).expect("create table");
        }
        Self {
            cluster,
            registry: ShareRegistry::new(),
            metrics: Arc::new(BridgeMetrics::new()),
            config,
        }
    }

    /// Replaces `shop.orders` with a layout of `partitions` partitions.
    pub fn recreate_orders(&self, partitions: u32) {
        self.cluster.drop_table(ORDERS);
        self.cluster
            .create_table(orders_table(partitions))
            .expect("recreate orders");
    }

    pub fn connection(&self) -> Arc<dyn ClusterConnection> {
        self.cluster.clone()
    }

    pub fn session(&self) -> SessionContext {
        SessionContext::new(
            self.connection(),
            Arc::clone(&self.registry),
            self.config.clone(),
            Arc::clone(&self.metrics),
        )
    }

    /// Seeds committed orders `ids` with customer `id % 5` and no reference.
    pub fn seed_orders(&self, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            self.cluster
                .write_row_direct(ORDERS, order(id, id % 5, id * 10, None))
                .expect("seed order");
        }
    }
}

/// Strict cursor accounting regardless of build profile.
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        strict_cursor_accounting: true,
        ..BridgeConfig::default()
    }
}

/// `shop.orders(id, customer, amount, reference)`: ordered non-unique index
/// on customer, unique ordered index on the nullable reference.
pub fn orders_table(partitions: u32) -> TableDef {
    TableDef {
        name: ORDERS.to_string(),
        table_id: 10,
        schema_version: 1,
        columns: vec![
            ColumnDef::new("id", false),
            ColumnDef::new("customer", false),
            ColumnDef::new("amount", false),
            ColumnDef::new("reference", true),
        ],
        primary_key: vec![0],
        primary_key_ordered: true,
        hidden_key: false,
        partitions,
        indexes: vec![
            IndexDef {
                id: IndexId(1),
                name: "orders_customer".to_string(),
                unique: false,
                ordered: true,
                columns: vec![1],
            },
            IndexDef {
                id: IndexId(2),
                name: "orders_reference".to_string(),
                unique: true,
                ordered: true,
                columns: vec![3],
            },
        ],
    }
}

fn payloads_table() -> TableDef {
    TableDef {
        name: PAYLOADS.to_string(),
        table_id: 11,
        schema_version: 1,
        columns: vec![ColumnDef::new("id", false), ColumnDef::new("data", false)],
        primary_key: vec![0],
        primary_key_ordered: true,
        hidden_key: false,
        partitions: 2,
        indexes: Vec::new(),
    }
}

fn events_table() -> TableDef {
    TableDef {
        name: EVENTS.to_string(),
        table_id: 12,
        schema_version: 1,
        columns: vec![ColumnDef::new("$pk", false), ColumnDef::new("payload", true)],
        primary_key: vec![0],
        primary_key_ordered: false,
        hidden_key: true,
        partitions: 2,
        indexes: Vec::new(),
    }
}

fn documents_table() -> TableDef {
    TableDef {
        name: DOCUMENTS.to_string(),
        table_id: 13,
        schema_version: 1,
        columns: vec![ColumnDef::new("id", false), ColumnDef::large_object("body")],
        primary_key: vec![0],
        primary_key_ordered: true,
        hidden_key: false,
        partitions: 2,
        indexes: Vec::new(),
    }
}

/// `repl.accounts(id, balance, version)`.
fn accounts_table() -> TableDef {
    TableDef {
        name: ACCOUNTS.to_string(),
        table_id: 14,
        schema_version: 1,
        columns: vec![
            ColumnDef::new("id", false),
            ColumnDef::new("balance", false),
            ColumnDef::new("version", false),
        ],
        primary_key: vec![0],
        primary_key_ordered: true,
        hidden_key: false,
        partitions: 2,
        indexes: Vec::new(),
    }
}

pub fn order(id: u64, customer: u64, amount: u64, reference: Option<&str>) -> Vec<ColumnValue> {
    vec![
        ColumnValue::from_u64(id),
        ColumnValue::from_u64(customer),
        ColumnValue::from_u64(amount),
        reference
            .map(|reference| ColumnValue::scalar(reference.as_bytes().to_vec()))
            .unwrap_or(ColumnValue::Null),
    ]
}

/// A `shop.payloads` row whose payload is exactly `size` bytes.
pub fn payload(id: u64, size: usize) -> Vec<ColumnValue> {
    vec![ColumnValue::from_u64(id), ColumnValue::scalar(vec![0xAB; size - 8])]
}

pub fn account(id: u64, balance: u64, version: u64) -> Vec<ColumnValue> {
    vec![
        ColumnValue::from_u64(id),
        ColumnValue::from_u64(balance),
        ColumnValue::from_u64(version),
    ]
}

pub fn key(id: u64) -> KeyTuple {
    KeyTuple::from_u64s(&[id])
}

pub fn u64_at(row: &Row, column: usize) -> u64 {
    row.columns
        .get(column)
        .and_then(ColumnValue::as_u64)
        .expect("u64 column")
}
