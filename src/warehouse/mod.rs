//! Warehouse access.
//!
//! The loader needs two things from a warehouse: ledger reads outside any
//! transaction, and one transaction per commit in which it re-reads the
//! ledger, appends checkpoint rows and runs the bulk load. [`redshift`] talks
//! to a real cluster over the Postgres protocol; [`memory`] keeps everything
//! in process with the same transaction semantics.

pub mod memory;
pub mod redshift;

use async_trait::async_trait;
use serde::Serialize;

use crate::checkpoint::{CheckpointRow, LedgerKey, NewCheckpoint};
use crate::error::WarehouseError;

pub use memory::MemoryWarehouse;
pub use redshift::RedshiftWarehouse;

/// Most recent diagnostic rows fetched after a failed bulk load.
pub const LOAD_ERROR_LIMIT: usize = 20;

/// A bulk load of every blob listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkLoadRequest {
    pub table: String,
    pub manifest_url: String,
    /// Rows that may be rejected before the whole load fails.
    pub max_error: u32,
    #[serde(skip)]
    pub credentials: Option<String>,
}

/// What the bulk load reported through its own status channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BulkLoadStatus {
    Loaded { rows: u64 },
    Failed { message: String },
}

/// One row of the warehouse's load-error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadErrorRow {
    pub query_id: i64,
    pub filename: String,
    pub line_number: i64,
    pub column: String,
    pub raw_line: String,
    pub raw_field_value: String,
    pub error_code: i32,
    pub reason: String,
}

/// Connection-level warehouse operations.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Open the transaction that carries one commit.
    async fn begin(&self) -> Result<Box<dyn WarehouseTransaction>, WarehouseError>;

    /// Up to `limit` ledger rows of one shard, newest first.
    async fn recent_checkpoints(
        &self,
        key: &LedgerKey,
        limit: usize,
    ) -> Result<Vec<CheckpointRow>, WarehouseError>;

    /// Every ledger row of the given shards. An empty slice selects all shards.
    async fn checkpoints(
        &self,
        table: &str,
        stream: &str,
        shard_ids: &[String],
    ) -> Result<Vec<CheckpointRow>, WarehouseError>;

    /// Load errors recorded against `table` for the given staged files,
    /// limited to the most recent failing load.
    async fn load_errors(
        &self,
        table: &str,
        files: &[String],
    ) -> Result<Vec<LoadErrorRow>, WarehouseError>;

    /// Run a DDL statement in autocommit mode.
    async fn execute_ddl(&self, ddl: &str) -> Result<(), WarehouseError>;
}

/// Operations available inside an open transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait WarehouseTransaction: Send {
    async fn recent_checkpoints(
        &mut self,
        key: &LedgerKey,
        limit: usize,
    ) -> Result<Vec<CheckpointRow>, WarehouseError>;

    async fn checkpoints(
        &mut self,
        table: &str,
        stream: &str,
        shard_ids: &[String],
    ) -> Result<Vec<CheckpointRow>, WarehouseError>;

    /// Append one ledger row per entry, stamped with the warehouse clock.
    async fn insert_checkpoints(&mut self, rows: &[NewCheckpoint]) -> Result<(), WarehouseError>;

    async fn bulk_load(
        &mut self,
        request: &BulkLoadRequest,
    ) -> Result<BulkLoadStatus, WarehouseError>;

    async fn commit(self: Box<Self>) -> Result<(), WarehouseError>;

    async fn rollback(self: Box<Self>) -> Result<(), WarehouseError>;
}

/// Keep only the rows of the first (most recent) query id.
pub(crate) fn first_query_only(rows: Vec<LoadErrorRow>) -> Vec<LoadErrorRow> {
    let Some(first) = rows.first().map(|row| row.query_id) else {
        return rows;
    };
    rows.into_iter()
        .take_while(|row| row.query_id == first)
        .collect()
}
