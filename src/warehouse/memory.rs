//! In-process warehouse.
//!
//! Holds the ledger and loaded rows in memory. Transactions are serialized
//! through a writer lock, buffer their writes, and publish them only on
//! commit. Bulk loads resolve the manifest through the blob stage and load
//! one row per JSON line, so a full load cycle can run without a cluster.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta, Utc};
use flate2::read::GzDecoder;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use super::{
    BulkLoadRequest, BulkLoadStatus, LOAD_ERROR_LIMIT, LoadErrorRow, Warehouse,
    WarehouseTransaction, first_query_only,
};
use crate::checkpoint::{CheckpointRow, LedgerKey, NewCheckpoint};
use crate::error::{
    BulkLoadDecodeSnafu, BulkLoadInputSnafu, InjectedSnafu, ManifestJsonSnafu, WarehouseError,
};
use crate::loader::manifest::Manifest;
use crate::sequence::SequenceRange;
use crate::stage::BlobStage;

/// A failure to inject into the next bulk load.
#[derive(Debug, Clone)]
enum Injection {
    /// The load reports failure through its status.
    Reject(String),
    /// The load call itself errors.
    Error(String),
}

#[derive(Debug, Default)]
struct State {
    ledger: Vec<CheckpointRow>,
    tables: HashMap<String, Vec<Value>>,
    load_errors: Vec<(String, LoadErrorRow)>,
    ddl: Vec<String>,
    last_timestamp: Option<NaiveDateTime>,
    next_query_id: i64,
    injections: VecDeque<Injection>,
    transactions: usize,
}

impl State {
    /// Warehouse clock, strictly increasing across calls.
    fn now(&mut self) -> NaiveDateTime {
        let wall = Utc::now().naive_utc();
        let now = match self.last_timestamp {
            Some(last) if wall <= last => last + TimeDelta::microseconds(1),
            _ => wall,
        };
        self.last_timestamp = Some(now);
        now
    }

    fn recent(&self, key: &LedgerKey, extra: &[CheckpointRow], limit: usize) -> Vec<CheckpointRow> {
        let mut rows: Vec<CheckpointRow> = self
            .ledger
            .iter()
            .chain(extra)
            .filter(|row| row.key() == *key)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.load_timestamp.cmp(&a.load_timestamp));
        rows.truncate(limit);
        rows
    }

    fn select(
        &self,
        table: &str,
        stream: &str,
        shard_ids: &[String],
        extra: &[CheckpointRow],
    ) -> Vec<CheckpointRow> {
        let mut rows: Vec<CheckpointRow> = self
            .ledger
            .iter()
            .chain(extra)
            .filter(|row| row.table_name == table && row.stream_name == stream)
            .filter(|row| shard_ids.is_empty() || shard_ids.contains(&row.shard_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.load_timestamp.cmp(&b.load_timestamp));
        rows
    }
}

struct Inner {
    state: Mutex<State>,
    writer: Arc<tokio::sync::Mutex<()>>,
    stage: BlobStage,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Warehouse kept entirely in memory.
#[derive(Clone)]
pub struct MemoryWarehouse {
    inner: Arc<Inner>,
}

impl MemoryWarehouse {
    /// `stage` is where bulk loads read manifests and blobs from.
    pub fn new(stage: BlobStage) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                writer: Arc::new(tokio::sync::Mutex::new(())),
                stage,
            }),
        }
    }

    /// Append a committed ledger row directly, outside any transaction.
    pub fn seed_checkpoint(&self, key: LedgerKey, range: SequenceRange) -> CheckpointRow {
        let mut state = self.inner.state();
        let row = CheckpointRow {
            stream_name: key.stream,
            shard_id: key.shard_id,
            table_name: key.table,
            starting_sequence_number: range.start,
            ending_sequence_number: range.end,
            load_timestamp: state.now(),
        };
        state.ledger.push(row.clone());
        row
    }

    /// Append a committed ledger row with a caller-chosen timestamp.
    pub fn seed_checkpoint_at(
        &self,
        key: LedgerKey,
        range: SequenceRange,
        load_timestamp: NaiveDateTime,
    ) -> CheckpointRow {
        let row = CheckpointRow {
            stream_name: key.stream,
            shard_id: key.shard_id,
            table_name: key.table,
            starting_sequence_number: range.start,
            ending_sequence_number: range.end,
            load_timestamp,
        };
        self.inner.state().ledger.push(row.clone());
        row
    }

    /// Make the next bulk load report failure through its status.
    pub fn reject_next_bulk_load(&self, message: impl Into<String>) {
        self.inner
            .state()
            .injections
            .push_back(Injection::Reject(message.into()));
    }

    /// Make the next bulk load call return an error.
    pub fn break_next_bulk_load(&self, message: impl Into<String>) {
        self.inner
            .state()
            .injections
            .push_back(Injection::Error(message.into()));
    }

    /// Every committed ledger row, in insertion order.
    pub fn ledger(&self) -> Vec<CheckpointRow> {
        self.inner.state().ledger.clone()
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.inner
            .state()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// DDL statements executed so far.
    pub fn ddl_statements(&self) -> Vec<String> {
        self.inner.state().ddl.clone()
    }

    /// Number of transactions opened so far.
    pub fn transactions_started(&self) -> usize {
        self.inner.state().transactions
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn begin(&self) -> Result<Box<dyn WarehouseTransaction>, WarehouseError> {
        let writer = self.inner.writer.clone().lock_owned().await;
        self.inner.state().transactions += 1;
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            _writer: writer,
            checkpoints: Vec::new(),
            rows: Vec::new(),
        }))
    }

    async fn recent_checkpoints(
        &self,
        key: &LedgerKey,
        limit: usize,
    ) -> Result<Vec<CheckpointRow>, WarehouseError> {
        Ok(self.inner.state().recent(key, &[], limit))
    }

    async fn checkpoints(
        &self,
        table: &str,
        stream: &str,
        shard_ids: &[String],
    ) -> Result<Vec<CheckpointRow>, WarehouseError> {
        Ok(self.inner.state().select(table, stream, shard_ids, &[]))
    }

    async fn load_errors(
        &self,
        table: &str,
        files: &[String],
    ) -> Result<Vec<LoadErrorRow>, WarehouseError> {
        let state = self.inner.state();
        let mut rows: Vec<LoadErrorRow> = state
            .load_errors
            .iter()
            .filter(|(t, row)| t == table && files.contains(&row.filename))
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| b.query_id.cmp(&a.query_id));
        rows.truncate(LOAD_ERROR_LIMIT);
        Ok(first_query_only(rows))
    }

    async fn execute_ddl(&self, ddl: &str) -> Result<(), WarehouseError> {
        self.inner.state().ddl.push(ddl.to_string());
        Ok(())
    }
}

/// Buffered writes of one open transaction.
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    _writer: OwnedMutexGuard<()>,
    checkpoints: Vec<CheckpointRow>,
    rows: Vec<(String, Value)>,
}

impl MemoryTransaction {
    /// Parse every staged blob listed in the manifest.
    async fn read_manifest(
        &self,
        request: &BulkLoadRequest,
    ) -> Result<(Vec<Value>, Vec<LoadErrorRow>), WarehouseError> {
        let stage = &self.inner.stage;
        let bytes = stage
            .read(&request.manifest_url)
            .await
            .context(BulkLoadInputSnafu)?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .context(ManifestJsonSnafu)
            .context(BulkLoadInputSnafu)?;

        let mut rows = Vec::new();
        let mut errors = Vec::new();
        for entry in &manifest.entries {
            let blob = match stage.read(&entry.url).await {
                Ok(blob) => blob,
                Err(e) if !entry.mandatory => {
                    debug!(url = %entry.url, error = %e, "Skipping optional manifest entry");
                    continue;
                }
                Err(source) => return Err(WarehouseError::BulkLoadInput { source }),
            };

            let reader = BufReader::new(GzDecoder::new(&blob[..]));
            for (index, line) in reader.lines().enumerate() {
                let line = line.context(BulkLoadDecodeSnafu { url: &entry.url })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(value @ Value::Object(_)) => rows.push(value),
                    Ok(_) => errors.push(error_row(&entry.url, index, &line, "Not a JSON object")),
                    Err(e) => errors.push(error_row(&entry.url, index, &line, &e.to_string())),
                }
            }
        }
        Ok((rows, errors))
    }
}

fn error_row(filename: &str, index: usize, raw_line: &str, reason: &str) -> LoadErrorRow {
    LoadErrorRow {
        query_id: 0,
        filename: filename.to_string(),
        line_number: index as i64 + 1,
        column: String::new(),
        raw_line: raw_line.to_string(),
        raw_field_value: String::new(),
        error_code: 1216,
        reason: reason.to_string(),
    }
}

#[async_trait]
impl WarehouseTransaction for MemoryTransaction {
    async fn recent_checkpoints(
        &mut self,
        key: &LedgerKey,
        limit: usize,
    ) -> Result<Vec<CheckpointRow>, WarehouseError> {
        Ok(self.inner.state().recent(key, &self.checkpoints, limit))
    }

    async fn checkpoints(
        &mut self,
        table: &str,
        stream: &str,
        shard_ids: &[String],
    ) -> Result<Vec<CheckpointRow>, WarehouseError> {
        Ok(self
            .inner
            .state()
            .select(table, stream, shard_ids, &self.checkpoints))
    }

    async fn insert_checkpoints(&mut self, rows: &[NewCheckpoint]) -> Result<(), WarehouseError> {
        let load_timestamp = self.inner.state().now();
        self.checkpoints.extend(rows.iter().map(|row| CheckpointRow {
            stream_name: row.key.stream.clone(),
            shard_id: row.key.shard_id.clone(),
            table_name: row.key.table.clone(),
            starting_sequence_number: row.range.start.clone(),
            ending_sequence_number: row.range.end.clone(),
            load_timestamp,
        }));
        Ok(())
    }

    async fn bulk_load(
        &mut self,
        request: &BulkLoadRequest,
    ) -> Result<BulkLoadStatus, WarehouseError> {
        let injection = self.inner.state().injections.pop_front();
        match injection {
            Some(Injection::Error(message)) => return InjectedSnafu { message }.fail(),
            Some(Injection::Reject(message)) => return Ok(BulkLoadStatus::Failed { message }),
            None => {}
        }

        let (rows, mut errors) = self.read_manifest(request).await?;
        if !errors.is_empty() {
            let mut state = self.inner.state();
            state.next_query_id += 1;
            let query_id = state.next_query_id;
            for error in &mut errors {
                error.query_id = query_id;
            }
            warn!(
                table = %request.table,
                errors = errors.len(),
                max_error = request.max_error,
                "Bulk load skipped malformed lines"
            );
            let failed = errors.len() > request.max_error as usize;
            state
                .load_errors
                .extend(errors.into_iter().map(|e| (request.table.clone(), e)));
            if failed {
                return Ok(BulkLoadStatus::Failed {
                    message: format!(
                        "Load into table '{}' failed. Check 'stl_load_errors' system table for details.",
                        request.table
                    ),
                });
            }
        }

        let loaded = rows.len() as u64;
        self.rows
            .extend(rows.into_iter().map(|row| (request.table.clone(), row)));
        Ok(BulkLoadStatus::Loaded { rows: loaded })
    }

    async fn commit(self: Box<Self>) -> Result<(), WarehouseError> {
        let this = *self;
        let mut state = this.inner.state();
        state.ledger.extend(this.checkpoints);
        for (table, row) in this.rows {
            state.tables.entry(table).or_default().push(row);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), WarehouseError> {
        Ok(())
    }
}
