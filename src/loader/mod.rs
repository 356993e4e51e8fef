//! Load cycle orchestration.
//!
//! A cycle for one table: list shards, look up each shard's last checkpoint,
//! read and stage every shard in parallel, build the manifest, then run the
//! commit protocol. Nothing is committed unless every shard read cleanly.

pub mod commit;
pub mod manifest;
pub mod reader;

use chrono::Utc;
use serde::Serialize;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::{BrokerRef, ReadLimits, ShardDescriptor, ShardReadResult};
use crate::checkpoint::{CheckpointLedger, CheckpointRow, LedgerKey, NewCheckpoint};
use crate::cluster::ClusterMetadata;
use crate::config::Config;
use crate::emit;
use crate::error::{
    LoadBrokerSnafu, LoadClusterSnafu, LoadError, LoadLedgerSnafu, NoShardsSnafu,
};
use crate::metrics::events::{CycleStatus, LoadCycleCompleted};
use crate::sequence::SequenceRange;
use crate::stage::{BlobStage, StageLayout};
use crate::warehouse::Warehouse;

pub use commit::{CommitBatch, CommitStep, LoadFailure, LoadOutcome, commit_batch};
pub use manifest::{Manifest, ManifestEntry};
pub use reader::{ShardFailure, ShardJob, ShardOutcomes, ShardReader};

/// Loader knobs taken from configuration.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub read_limits: ReadLimits,
    pub max_concurrent_shards: usize,
    pub max_error: u32,
    pub credentials: Option<String>,
    pub layout: StageLayout,
    pub poll_interval: Duration,
}

impl LoaderSettings {
    pub fn from_config(config: &Config) -> Self {
        let warehouse = &config.warehouse;
        Self {
            read_limits: config.loader.read_limits(),
            max_concurrent_shards: config.loader.max_concurrent_shards,
            max_error: warehouse.max_error,
            credentials: warehouse.copy_credentials.clone(),
            layout: StageLayout::new(
                warehouse.cluster_name.as_deref().unwrap_or("default"),
                warehouse.database.as_deref().unwrap_or("default"),
            ),
            poll_interval: config.loader.poll_interval(),
        }
    }
}

/// Snapshot of a cycle, detailed enough to replay or debug it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadContext {
    pub table: String,
    pub stream: String,
    pub shards: Vec<ShardDescriptor>,
    pub checkpoints: HashMap<String, Option<CheckpointRow>>,
    pub load_prefix: String,
    pub results: Vec<ShardReadResult>,
    pub failures: Vec<ShardFailure>,
    pub staged_urls: Vec<String>,
    pub manifest: Option<Manifest>,
    pub manifest_url: Option<String>,
}

/// Summary of a successful cycle.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub stream: String,
    pub records_loaded: u64,
    pub shards: usize,
    pub shards_with_records: usize,
    pub manifest_url: Option<String>,
    pub duration_ms: u64,
}

/// Totals over the lifetime of [`Loader::run`].
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub cycles: usize,
    pub failed_cycles: usize,
    pub records_loaded: u64,
}

/// Moves stream records into warehouse tables.
pub struct Loader {
    broker: BrokerRef,
    stage: BlobStage,
    warehouse: Arc<dyn Warehouse>,
    ledger: CheckpointLedger,
    cluster: Arc<dyn ClusterMetadata>,
    settings: LoaderSettings,
}

impl Loader {
    pub fn new(
        broker: BrokerRef,
        stage: BlobStage,
        warehouse: Arc<dyn Warehouse>,
        cluster: Arc<dyn ClusterMetadata>,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            broker,
            stage,
            ledger: CheckpointLedger::new(warehouse.clone()),
            warehouse,
            cluster,
            settings,
        }
    }

    pub fn ledger(&self) -> &CheckpointLedger {
        &self.ledger
    }

    /// Run one load cycle for `table`.
    pub async fn load(&self, table: &str) -> Result<LoadReport, LoadError> {
        let started = Instant::now();
        let result = self.load_cycle(table, started).await;

        let status = match &result {
            Ok(report) if report.records_loaded == 0 && report.manifest_url.is_none() => {
                CycleStatus::Empty
            }
            Ok(_) => CycleStatus::Loaded,
            Err(LoadError::Rejected { .. }) => CycleStatus::Rejected,
            Err(_) => CycleStatus::Failed,
        };
        emit!(LoadCycleCompleted {
            table: table.to_string(),
            status,
            duration: started.elapsed(),
        });
        result
    }

    async fn load_cycle(&self, table: &str, started: Instant) -> Result<LoadReport, LoadError> {
        let stream = self
            .broker
            .stream_name(table)
            .context(LoadBrokerSnafu { table })?;
        let shards = self
            .broker
            .shard_descriptors(&stream)
            .await
            .context(LoadBrokerSnafu { table })?;
        ensure!(!shards.is_empty(), NoShardsSnafu { stream: &stream });

        let slices = self.cluster.slice_count().await.context(LoadClusterSnafu)?;
        let checkpoints = self
            .ledger
            .last_checkpoints(table, &stream, &shards)
            .await
            .context(LoadLedgerSnafu { stream: &stream })?;

        let load_prefix = self.settings.layout.load_prefix(table, Utc::now());
        info!(
            table,
            stream = %stream,
            shards = shards.len(),
            slices,
            prefix = %load_prefix,
            broker = self.broker.kind(),
            "Starting load cycle"
        );

        let jobs = shards
            .iter()
            .map(|shard| ShardJob {
                stream: stream.clone(),
                shard: shard.clone(),
                resume_after: checkpoints
                    .get(&shard.shard_id)
                    .and_then(|row| row.as_ref())
                    .map(|row| row.ending_sequence_number.clone()),
            })
            .collect();
        let reader = Arc::new(ShardReader::new(
            self.broker.clone(),
            self.stage.clone(),
            self.settings.read_limits.clone(),
            slices,
            load_prefix.clone(),
        ));
        let outcomes = reader
            .read_all(jobs, self.settings.max_concurrent_shards)
            .await;

        let mut context = LoadContext {
            table: table.to_string(),
            stream: stream.clone(),
            shards,
            checkpoints,
            load_prefix,
            staged_urls: outcomes
                .results
                .iter()
                .flat_map(|r| r.staged_blob_urls.iter().cloned())
                .collect(),
            results: outcomes.results,
            failures: outcomes.failures,
            ..Default::default()
        };

        if !context.failures.is_empty() {
            return Err(LoadError::ShardRead {
                context: Box::new(context),
            });
        }

        let manifest = Manifest::from_results(&context.results);
        let shards_with_records = context.results.iter().filter(|r| r.records > 0).count();
        if manifest.is_empty() {
            info!(table, stream = %stream, "No new records in any shard");
            return Ok(LoadReport {
                table: context.table,
                stream: context.stream,
                records_loaded: 0,
                shards: context.shards.len(),
                shards_with_records,
                manifest_url: None,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let manifest_url = match manifest.upload(&self.stage, &context.load_prefix).await {
            Ok(url) => url,
            Err(source) => {
                context.manifest = Some(manifest);
                return Err(LoadError::LoadManifest {
                    context: Box::new(context),
                    source,
                });
            }
        };
        context.manifest_url = Some(manifest_url.clone());

        let batch = CommitBatch {
            table: table.to_string(),
            stream: stream.clone(),
            candidates: candidates(table, &stream, &context.results),
            observed: context.checkpoints.clone(),
            manifest_url: manifest_url.clone(),
            files: manifest.urls(),
            max_error: self.settings.max_error,
            credentials: self.settings.credentials.clone(),
        };
        context.manifest = Some(manifest);

        let outcome = commit_batch(self.warehouse.as_ref(), &batch).await;
        if !outcome.success {
            return Err(LoadError::Rejected {
                context: Box::new(context),
                outcome,
            });
        }

        Ok(LoadReport {
            table: context.table,
            stream: context.stream,
            records_loaded: outcome.records_loaded.unwrap_or(0),
            shards: context.shards.len(),
            shards_with_records,
            manifest_url: Some(manifest_url),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Load every table once per poll interval until `shutdown` fires.
    ///
    /// A failed cycle is logged and retried on the next poll.
    pub async fn run(&self, tables: &[String], shutdown: CancellationToken) -> RunStats {
        let mut stats = RunStats::default();
        info!(tables = ?tables, "Starting loader");

        'poll: loop {
            for table in tables {
                let result = tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!("Shutdown requested during load cycle");
                        break 'poll;
                    }
                    result = self.load(table) => result,
                };

                stats.cycles += 1;
                match result {
                    Ok(report) => {
                        stats.records_loaded += report.records_loaded;
                        info!(
                            table = %report.table,
                            records = report.records_loaded,
                            duration_ms = report.duration_ms,
                            "Load cycle complete"
                        );
                    }
                    Err(e) => {
                        stats.failed_cycles += 1;
                        error!(table = %table, error = %snafu::Report::from_error(e), "Load cycle failed");
                    }
                }
            }

            info!(
                "Waiting {}s before next poll",
                self.settings.poll_interval.as_secs()
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during poll wait");
                    break;
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!(?stats, "Loader stopped");
        stats
    }
}

/// One checkpoint candidate per shard that read records.
fn candidates(table: &str, stream: &str, results: &[ShardReadResult]) -> Vec<NewCheckpoint> {
    results
        .iter()
        .filter(|r| r.records > 0)
        .filter_map(|r| {
            let start = r.starting_sequence_number.clone()?;
            let end = r.ending_sequence_number.clone()?;
            Some(NewCheckpoint {
                key: LedgerKey::new(table, stream, &r.shard_id),
                range: SequenceRange::new(start, end),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceNumber;

    fn result(shard: &str, records: usize, bounds: Option<(u64, u64)>) -> ShardReadResult {
        ShardReadResult {
            shard_id: shard.into(),
            records,
            starting_sequence_number: bounds.map(|(s, _)| SequenceNumber::from(s)),
            ending_sequence_number: bounds.map(|(_, e)| SequenceNumber::from(e)),
            next_iterator: None,
            staged_blob_urls: Vec::new(),
        }
    }

    #[test]
    fn test_candidates_skip_empty_shards() {
        let results = vec![
            result("s1", 150, Some((1000, 1150))),
            result("s2", 0, None),
        ];
        let candidates = candidates("clicks", "a.b.clicks", &results);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].key, LedgerKey::new("clicks", "a.b.clicks", "s1"));
        assert_eq!(
            candidates[0].range,
            SequenceRange::new(1000u64.into(), 1150u64.into())
        );
    }

    #[test]
    fn test_context_serializes_for_replay() {
        let context = LoadContext {
            table: "clicks".into(),
            stream: "a.b.clicks".into(),
            results: vec![result("s1", 2, Some((5, 6)))],
            failures: vec![ShardFailure {
                shard_id: "s2".into(),
                error: "boom".into(),
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&context).unwrap();
        assert_eq!(json["results"][0]["starting_sequence_number"], "5");
        assert_eq!(json["failures"][0]["shard_id"], "s2");
    }
}
