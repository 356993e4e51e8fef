//! The commit protocol.
//!
//! One warehouse transaction per batch:
//!
//! 1. re-read each shard's latest checkpoint and compare it with the one the
//!    read phase resumed from (race check);
//! 2. compare the candidate ranges with every committed range of those shards
//!    (overlap check);
//! 3. append one checkpoint row per shard;
//! 4. bulk load the manifest;
//! 5. commit only when the bulk load reports success.
//!
//! Any other path rolls back. Rejections are values, not errors: callers
//! inspect the returned [`LoadOutcome`].

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointRow, NewCheckpoint, find_overlap, latest};
use crate::emit;
use crate::metrics::events::{CommitRejected, RecordsLoaded, RejectReason};
use crate::sequence::SequenceRange;
use crate::warehouse::{
    BulkLoadRequest, BulkLoadStatus, LoadErrorRow, Warehouse, WarehouseTransaction,
};

/// Protocol step at which a batch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStep {
    Begin,
    RaceCheck,
    OverlapCheck,
    InsertCheckpoints,
    BulkLoad,
    Commit,
}

impl fmt::Display for CommitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitStep::Begin => "begin",
            CommitStep::RaceCheck => "race check",
            CommitStep::OverlapCheck => "overlap check",
            CommitStep::InsertCheckpoints => "checkpoint insert",
            CommitStep::BulkLoad => "bulk load",
            CommitStep::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Why a batch was not committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadFailure {
    /// Another loader committed this shard after the read phase started.
    Race {
        shard_id: String,
        observed: Option<CheckpointRow>,
        current: Option<CheckpointRow>,
    },
    /// A candidate range intersects a committed one.
    Overlap {
        shard_id: String,
        candidate: SequenceRange,
        existing: CheckpointRow,
    },
    /// The bulk load, or the transaction around it, failed.
    BulkLoad {
        step: CommitStep,
        message: String,
        diagnostics: Vec<LoadErrorRow>,
        /// Set when the diagnostics themselves could not be fetched.
        diagnostics_error: Option<String>,
    },
}

/// Result of one commit attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadOutcome {
    pub success: bool,
    pub records_loaded: Option<u64>,
    pub failure: Option<LoadFailure>,
}

impl LoadOutcome {
    pub fn loaded(records: u64) -> Self {
        Self {
            success: true,
            records_loaded: Some(records),
            failure: None,
        }
    }

    pub fn failed(failure: LoadFailure) -> Self {
        Self {
            success: false,
            records_loaded: None,
            failure: Some(failure),
        }
    }

    pub fn is_race(&self) -> bool {
        matches!(self.failure, Some(LoadFailure::Race { .. }))
    }

    pub fn is_overlap(&self) -> bool {
        matches!(self.failure, Some(LoadFailure::Overlap { .. }))
    }

    /// One-line summary for logs and error messages.
    pub fn describe(&self) -> String {
        match &self.failure {
            None => format!("loaded {} records", self.records_loaded.unwrap_or(0)),
            Some(LoadFailure::Race { shard_id, .. }) => {
                format!("race on shard {shard_id}: checkpoint changed since the read phase")
            }
            Some(LoadFailure::Overlap {
                shard_id,
                candidate,
                existing,
            }) => format!(
                "range {candidate} of shard {shard_id} overlaps committed range {}",
                existing.range()
            ),
            Some(LoadFailure::BulkLoad {
                step,
                message,
                diagnostics,
                ..
            }) => format!(
                "{step} failed: {message} ({} diagnostic rows)",
                diagnostics.len()
            ),
        }
    }
}

/// Everything the commit needs about one batch.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub table: String,
    pub stream: String,
    pub candidates: Vec<NewCheckpoint>,
    /// Latest checkpoint per shard as seen before reading.
    pub observed: HashMap<String, Option<CheckpointRow>>,
    pub manifest_url: String,
    /// Staged blob URLs, used to look up load errors.
    pub files: Vec<String>,
    pub max_error: u32,
    pub credentials: Option<String>,
}

impl CommitBatch {
    fn shard_ids(&self) -> Vec<String> {
        self.candidates
            .iter()
            .map(|c| c.key.shard_id.clone())
            .collect()
    }

    fn bulk_load_request(&self) -> BulkLoadRequest {
        BulkLoadRequest {
            table: self.table.clone(),
            manifest_url: self.manifest_url.clone(),
            max_error: self.max_error,
            credentials: self.credentials.clone(),
        }
    }
}

/// Step 1..4 result: either move on or stop with a failure.
enum Checked {
    Proceed,
    Reject(LoadFailure),
    Fail(CommitStep, String),
}

/// Run the commit protocol for `batch`.
pub async fn commit_batch(warehouse: &dyn Warehouse, batch: &CommitBatch) -> LoadOutcome {
    let mut tx = match warehouse.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            return bulk_load_failure(warehouse, batch, CommitStep::Begin, e.to_string()).await;
        }
    };

    match check_and_insert(tx.as_mut(), batch).await {
        Checked::Proceed => {}
        Checked::Reject(failure) => {
            rollback(tx).await;
            let reason = match failure {
                LoadFailure::Race { .. } => RejectReason::Race,
                _ => RejectReason::Overlap,
            };
            let outcome = LoadOutcome::failed(failure);
            warn!(table = %batch.table, stream = %batch.stream, "Commit rejected: {}", outcome.describe());
            emit!(CommitRejected { reason });
            return outcome;
        }
        Checked::Fail(step, message) => {
            rollback(tx).await;
            return bulk_load_failure(warehouse, batch, step, message).await;
        }
    }

    let rows = match tx.bulk_load(&batch.bulk_load_request()).await {
        Ok(BulkLoadStatus::Loaded { rows }) => rows,
        Ok(BulkLoadStatus::Failed { message }) => {
            rollback(tx).await;
            return bulk_load_failure(warehouse, batch, CommitStep::BulkLoad, message).await;
        }
        Err(e) => {
            rollback(tx).await;
            return bulk_load_failure(warehouse, batch, CommitStep::BulkLoad, e.to_string())
                .await;
        }
    };

    if let Err(e) = tx.commit().await {
        return bulk_load_failure(warehouse, batch, CommitStep::Commit, e.to_string()).await;
    }

    info!(
        table = %batch.table,
        stream = %batch.stream,
        shards = batch.candidates.len(),
        records = rows,
        "Committed load"
    );
    emit!(RecordsLoaded {
        table: batch.table.clone(),
        count: rows,
    });
    LoadOutcome::loaded(rows)
}

async fn check_and_insert(tx: &mut dyn WarehouseTransaction, batch: &CommitBatch) -> Checked {
    for candidate in &batch.candidates {
        let rows = match tx.recent_checkpoints(&candidate.key, 2).await {
            Ok(rows) => rows,
            Err(e) => return Checked::Fail(CommitStep::RaceCheck, e.to_string()),
        };
        let current = match latest(&candidate.key, rows) {
            Ok(current) => current,
            Err(e) => return Checked::Fail(CommitStep::RaceCheck, e.to_string()),
        };
        let observed = batch
            .observed
            .get(&candidate.key.shard_id)
            .cloned()
            .flatten();
        if current != observed {
            return Checked::Reject(LoadFailure::Race {
                shard_id: candidate.key.shard_id.clone(),
                observed,
                current,
            });
        }
    }

    let committed = match tx
        .checkpoints(&batch.table, &batch.stream, &batch.shard_ids())
        .await
    {
        Ok(rows) => rows,
        Err(e) => return Checked::Fail(CommitStep::OverlapCheck, e.to_string()),
    };
    if let Some((candidate, existing)) = find_overlap(&batch.candidates, &committed) {
        return Checked::Reject(LoadFailure::Overlap {
            shard_id: candidate.key.shard_id.clone(),
            candidate: candidate.range.clone(),
            existing: existing.clone(),
        });
    }

    match tx.insert_checkpoints(&batch.candidates).await {
        Ok(()) => Checked::Proceed,
        Err(e) => Checked::Fail(CommitStep::InsertCheckpoints, e.to_string()),
    }
}

async fn rollback(tx: Box<dyn WarehouseTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

/// Build a bulk load failure, attaching whatever diagnostics the warehouse has.
async fn bulk_load_failure(
    warehouse: &dyn Warehouse,
    batch: &CommitBatch,
    step: CommitStep,
    message: String,
) -> LoadOutcome {
    error!(table = %batch.table, %step, %message, "Load failed");
    emit!(CommitRejected {
        reason: RejectReason::BulkLoad
    });

    let (diagnostics, diagnostics_error) =
        match warehouse.load_errors(&batch.table, &batch.files).await {
            Ok(rows) => (rows, None),
            Err(e) => {
                warn!(table = %batch.table, error = %e, "Could not fetch load errors");
                (Vec::new(), Some(e.to_string()))
            }
        };
    for row in &diagnostics {
        warn!(
            file = %row.filename,
            line = row.line_number,
            column = %row.column,
            code = row.error_code,
            reason = %row.reason,
            "Load error"
        );
    }

    LoadOutcome::failed(LoadFailure::BulkLoad {
        step,
        message,
        diagnostics,
        diagnostics_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::LedgerKey;
    use crate::stage::{BlobStage, StagePolicy};
    use crate::storage::StorageProvider;
    use crate::warehouse::MemoryWarehouse;
    use bytes::Bytes;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    const STREAM: &str = "a.b.clicks";

    fn key(shard: &str) -> LedgerKey {
        LedgerKey::new("clicks", STREAM, shard)
    }

    fn range(start: u64, end: u64) -> SequenceRange {
        SequenceRange::new(start.into(), end.into())
    }

    async fn setup(dir: &TempDir, lines: &str) -> (MemoryWarehouse, String, String) {
        let storage =
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap();
        let stage = BlobStage::new(Arc::new(storage), StagePolicy::default());

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(lines.as_bytes()).unwrap();
        let blob_url = stage
            .put("load/s1-0.json.gz", Bytes::from(encoder.finish().unwrap()))
            .await
            .unwrap();
        let manifest = format!(r#"{{"entries":[{{"url":"{blob_url}","mandatory":true}}]}}"#);
        let manifest_url = stage
            .put("load/manifest.json", Bytes::from(manifest))
            .await
            .unwrap();
        (MemoryWarehouse::new(stage), manifest_url, blob_url)
    }

    fn batch(
        manifest_url: &str,
        blob_url: &str,
        candidate: SequenceRange,
        observed: Option<CheckpointRow>,
    ) -> CommitBatch {
        CommitBatch {
            table: "clicks".into(),
            stream: STREAM.into(),
            candidates: vec![NewCheckpoint {
                key: key("s1"),
                range: candidate,
            }],
            observed: HashMap::from([("s1".to_string(), observed)]),
            manifest_url: manifest_url.into(),
            files: vec![blob_url.into()],
            max_error: 2,
            credentials: None,
        }
    }

    #[tokio::test]
    async fn test_commits_checkpoint_and_rows() {
        let dir = TempDir::new().unwrap();
        let (warehouse, manifest, blob) = setup(&dir, "{\"a\":1}\n{\"a\":2}\n").await;

        let outcome = commit_batch(&warehouse, &batch(&manifest, &blob, range(10, 20), None)).await;
        assert_eq!(outcome, LoadOutcome::loaded(2));
        assert_eq!(warehouse.ledger().len(), 1);
        assert_eq!(warehouse.ledger()[0].range(), range(10, 20));
        assert_eq!(warehouse.rows("clicks").len(), 2);
    }

    #[tokio::test]
    async fn test_race_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (warehouse, manifest, blob) = setup(&dir, "{\"a\":1}\n").await;
        let observed = warehouse.seed_checkpoint(key("s1"), range(0, 10));
        // Another loader commits after our read phase.
        warehouse.seed_checkpoint(key("s1"), range(10, 15));

        let outcome = commit_batch(
            &warehouse,
            &batch(&manifest, &blob, range(11, 20), Some(observed)),
        )
        .await;
        assert!(outcome.is_race());
        assert_eq!(warehouse.ledger().len(), 2);
        assert!(warehouse.rows("clicks").is_empty());
    }

    #[tokio::test]
    async fn test_overlap_variants_are_rejected() {
        for candidate in [range(100, 200), range(120, 180), range(150, 250), range(50, 150)] {
            let dir = TempDir::new().unwrap();
            let (warehouse, manifest, blob) = setup(&dir, "{\"a\":1}\n").await;
            warehouse.seed_checkpoint(key("s1"), range(100, 200));
            // An unrelated newer row keeps the race check out of the way.
            let latest = warehouse.seed_checkpoint(key("s1"), range(300, 400));

            let outcome = commit_batch(
                &warehouse,
                &batch(&manifest, &blob, candidate.clone(), Some(latest)),
            )
            .await;
            assert!(outcome.is_overlap(), "{candidate} should overlap");
            assert_eq!(warehouse.ledger().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_bulk_load_failure_attaches_diagnostics() {
        let dir = TempDir::new().unwrap();
        let (warehouse, manifest, blob) = setup(&dir, "x\ny\nz\n{\"a\":1}\n").await;

        let outcome = commit_batch(&warehouse, &batch(&manifest, &blob, range(1, 4), None)).await;
        match outcome.failure {
            Some(LoadFailure::BulkLoad {
                step,
                diagnostics,
                diagnostics_error,
                ..
            }) => {
                assert_eq!(step, CommitStep::BulkLoad);
                assert_eq!(diagnostics.len(), 3);
                assert!(diagnostics_error.is_none());
            }
            other => panic!("expected bulk load failure, got {other:?}"),
        }
        assert!(warehouse.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_load_error_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (warehouse, manifest, blob) = setup(&dir, "{\"a\":1}\n").await;
        warehouse.break_next_bulk_load("connection reset");

        let outcome = commit_batch(&warehouse, &batch(&manifest, &blob, range(1, 4), None)).await;
        assert!(!outcome.success);
        assert!(outcome.describe().contains("connection reset"));
        assert!(warehouse.ledger().is_empty());
    }
}
