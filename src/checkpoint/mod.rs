//! Checkpoint ledger.
//!
//! An append-only warehouse table with one row per successful load per shard.
//! It is the only state that survives a cycle: resumption reads the newest
//! row of each shard, and the commit protocol uses the full history to reject
//! ranges that were already loaded.

use chrono::NaiveDateTime;
use serde::Serialize;
use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::broker::ShardDescriptor;
use crate::error::{AmbiguousCheckpointSnafu, LedgerError, LedgerQuerySnafu};
use crate::schema::{ColumnSpec, TableSchema};
use crate::sequence::{SequenceNumber, SequenceRange};
use crate::warehouse::Warehouse;

/// Identity of one shard's history in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LedgerKey {
    pub table: String,
    pub stream: String,
    pub shard_id: String,
}

impl LedgerKey {
    pub fn new(
        table: impl Into<String>,
        stream: impl Into<String>,
        shard_id: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            stream: stream.into(),
            shard_id: shard_id.into(),
        }
    }
}

/// One committed load of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointRow {
    pub stream_name: String,
    pub shard_id: String,
    pub table_name: String,
    pub starting_sequence_number: SequenceNumber,
    pub ending_sequence_number: SequenceNumber,
    pub load_timestamp: NaiveDateTime,
}

impl CheckpointRow {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(&self.table_name, &self.stream_name, &self.shard_id)
    }

    pub fn range(&self) -> SequenceRange {
        SequenceRange::new(
            self.starting_sequence_number.clone(),
            self.ending_sequence_number.clone(),
        )
    }
}

/// A row about to be inserted; the warehouse supplies the timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewCheckpoint {
    pub key: LedgerKey,
    pub range: SequenceRange,
}

/// Pick the newest row out of rows sorted newest first.
///
/// Two rows sharing the newest timestamp make the resume point ambiguous.
pub fn latest(
    key: &LedgerKey,
    rows_newest_first: Vec<CheckpointRow>,
) -> Result<Option<CheckpointRow>, LedgerError> {
    let mut rows = rows_newest_first.into_iter();
    let Some(newest) = rows.next() else {
        return Ok(None);
    };
    if let Some(next) = rows.next() {
        ensure!(
            next.load_timestamp != newest.load_timestamp,
            AmbiguousCheckpointSnafu {
                table: &key.table,
                stream: &key.stream,
                shard_id: &key.shard_id,
                load_timestamp: newest.load_timestamp,
            }
        );
    }
    Ok(Some(newest))
}

/// First committed row that a candidate range collides with.
pub fn find_overlap<'a>(
    candidates: &'a [NewCheckpoint],
    committed: &'a [CheckpointRow],
) -> Option<(&'a NewCheckpoint, &'a CheckpointRow)> {
    committed.iter().find_map(|row| {
        candidates
            .iter()
            .filter(|c| c.key.shard_id == row.shard_id && c.key.stream == row.stream_name)
            .find(|c| c.range.overlaps(&row.range()))
            .map(|c| (c, row))
    })
}

/// Read access to the ledger outside the commit transaction.
#[derive(Clone)]
pub struct CheckpointLedger {
    warehouse: Arc<dyn Warehouse>,
}

impl CheckpointLedger {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Most recent checkpoint of one shard.
    pub async fn last_checkpoint(
        &self,
        key: &LedgerKey,
    ) -> Result<Option<CheckpointRow>, LedgerError> {
        let rows = self
            .warehouse
            .recent_checkpoints(key, 2)
            .await
            .context(LedgerQuerySnafu)?;
        latest(key, rows)
    }

    /// Most recent checkpoint of every shard, keyed by shard id.
    pub async fn last_checkpoints(
        &self,
        table: &str,
        stream: &str,
        shards: &[ShardDescriptor],
    ) -> Result<HashMap<String, Option<CheckpointRow>>, LedgerError> {
        let mut checkpoints = HashMap::with_capacity(shards.len());
        for shard in shards {
            let key = LedgerKey::new(table, stream, &shard.shard_id);
            checkpoints.insert(shard.shard_id.clone(), self.last_checkpoint(&key).await?);
        }
        Ok(checkpoints)
    }

    /// Full history of the given shards.
    pub async fn history(
        &self,
        table: &str,
        stream: &str,
        shard_ids: &[String],
    ) -> Result<Vec<CheckpointRow>, LedgerError> {
        self.warehouse
            .checkpoints(table, stream, shard_ids)
            .await
            .context(LedgerQuerySnafu)
    }
}

/// Something wrong with a shard's committed history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerViolation {
    /// Two committed ranges intersect.
    Overlap {
        first: CheckpointRow,
        second: CheckpointRow,
    },
    /// A later load starts below the end of the one before it.
    OutOfOrder {
        previous: CheckpointRow,
        next: CheckpointRow,
    },
    /// Several rows share a timestamp.
    DuplicateTimestamp { rows: Vec<CheckpointRow> },
}

/// Check every shard's history for overlaps and regressions.
pub fn audit(rows: &[CheckpointRow]) -> Vec<LedgerViolation> {
    let mut by_shard: BTreeMap<LedgerKey, Vec<&CheckpointRow>> = BTreeMap::new();
    for row in rows {
        by_shard.entry(row.key()).or_default().push(row);
    }

    let mut violations = Vec::new();
    for history in by_shard.values_mut() {
        history.sort_by(|a, b| a.load_timestamp.cmp(&b.load_timestamp));

        for (i, first) in history.iter().enumerate() {
            for second in &history[i + 1..] {
                if second.range().overlaps(&first.range()) {
                    violations.push(LedgerViolation::Overlap {
                        first: (*first).clone(),
                        second: (*second).clone(),
                    });
                }
            }
        }

        for pair in history.windows(2) {
            let (previous, next) = (pair[0], pair[1]);
            if previous.load_timestamp == next.load_timestamp {
                violations.push(LedgerViolation::DuplicateTimestamp {
                    rows: vec![previous.clone(), next.clone()],
                });
            }
            if next.starting_sequence_number < previous.ending_sequence_number {
                violations.push(LedgerViolation::OutOfOrder {
                    previous: previous.clone(),
                    next: next.clone(),
                });
            }
        }
    }
    violations
}

/// Schema of the ledger table.
pub fn ledger_schema() -> TableSchema {
    let varchar = |name: &str| ColumnSpec {
        name: name.to_string(),
        type_name: "varchar(64)".to_string(),
        constraint: None,
    };

    TableSchema {
        columns: vec![
            varchar("stream_name"),
            varchar("shard_id"),
            varchar("table_name"),
            varchar("starting_sequence_number"),
            varchar("ending_sequence_number"),
            ColumnSpec {
                name: "load_timestamp".to_string(),
                type_name: "timestamp".to_string(),
                constraint: Some("not null".to_string()),
            },
        ],
        distkey: None,
        sortkey: Some("load_timestamp".to_string()),
    }
}
