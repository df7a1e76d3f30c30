//! Large-object materialization on the read path.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use holo_cluster::{ClusterConnection, ColumnValue, LargeObjectHandle, Row};

use crate::error::{BridgeError, BridgeResult};

/// Capability that resolves large-object handles into their bytes.
#[async_trait]
pub trait LargeObjectSource: Send + Sync {
    async fn fetch(&self, handle: LargeObjectHandle) -> BridgeResult<Bytes>;
}

/// Reads large objects straight from the cluster connection.
#[derive(Debug, Clone)]
pub struct ClusterLargeObjects {
    conn: Arc<dyn ClusterConnection>,
}

impl ClusterLargeObjects {
    pub fn new(conn: Arc<dyn ClusterConnection>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LargeObjectSource for ClusterLargeObjects {
    async fn fetch(&self, handle: LargeObjectHandle) -> BridgeResult<Bytes> {
        self.conn
            .read_large_object(handle)
            .await
            .map_err(|err| BridgeError::cluster(err, "read_large_object"))
    }
}

/// Copies `row`, replacing every large-object handle with its bytes.
pub async fn materialize_row(row: &Row, source: &dyn LargeObjectSource) -> BridgeResult<Row> {
    let mut columns = Vec::with_capacity(row.columns.len());
    for value in &row.columns {
        match value {
            ColumnValue::LargeObject(handle) => {
                columns.push(ColumnValue::Scalar(source.fetch(*handle).await?));
            }
            other => columns.push(other.clone()),
        }
    }
    Ok(Row {
        columns,
        version: row.version,
    })
}
