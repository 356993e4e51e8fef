//! Parallel shard reader.
//!
//! Every shard gets its own spawned task. At most `max_concurrent` run at
//! once; the next one starts as soon as a running one finishes. Workers only
//! talk to the broker and the stage and hand a single result back. The
//! caller gets every shard's outcome, failures included.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use snafu::prelude::*;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerRef, ReadLimits, RecordSink, ShardDescriptor, ShardReadResult};
use crate::emit;
use crate::error::{
    CompressSnafu, ShardBrokerSnafu, ShardReadError, ShardStageSnafu,
};
use crate::metrics::events::ActiveShardReads;
use crate::sequence::SequenceNumber;
use crate::stage::{BlobStage, blob_key};

type ShardFuture = Pin<Box<dyn Future<Output = (usize, String, ShardOutcome)> + Send>>;
type ShardOutcome = Result<ShardReadResult, ShardReadError>;

/// Work for one shard.
#[derive(Debug, Clone)]
pub struct ShardJob {
    pub stream: String,
    pub shard: ShardDescriptor,
    /// End of the last committed range, if any.
    pub resume_after: Option<SequenceNumber>,
}

/// A shard that failed to read or stage.
#[derive(Debug, Clone, Serialize)]
pub struct ShardFailure {
    pub shard_id: String,
    pub error: String,
}

/// Everything the workers produced, in shard order.
#[derive(Debug, Default)]
pub struct ShardOutcomes {
    pub results: Vec<ShardReadResult>,
    pub failures: Vec<ShardFailure>,
}

/// Shared, read-only inputs of every worker.
pub struct ShardReader {
    broker: BrokerRef,
    stage: BlobStage,
    limits: ReadLimits,
    slices: usize,
    prefix: String,
}

impl ShardReader {
    pub fn new(
        broker: BrokerRef,
        stage: BlobStage,
        limits: ReadLimits,
        slices: usize,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            stage,
            limits,
            slices: slices.max(1),
            prefix: prefix.into(),
        }
    }

    /// Run every job and wait for all of them.
    pub async fn read_all(self: Arc<Self>, jobs: Vec<ShardJob>, max_concurrent: usize) -> ShardOutcomes {
        let max_concurrent = max_concurrent.max(1);
        let mut running: FuturesUnordered<ShardFuture> = FuturesUnordered::new();
        let mut pending = jobs.into_iter().enumerate();
        let mut finished = Vec::new();

        for (index, job) in pending.by_ref().take(max_concurrent) {
            running.push(self.clone().spawn(index, job));
        }
        emit!(ActiveShardReads {
            count: running.len()
        });

        while let Some(done) = running.next().await {
            finished.push(done);
            if let Some((index, job)) = pending.next() {
                running.push(self.clone().spawn(index, job));
            }
            emit!(ActiveShardReads {
                count: running.len()
            });
        }

        finished.sort_by_key(|(index, _, _)| *index);
        let mut outcomes = ShardOutcomes::default();
        for (_, shard_id, outcome) in finished {
            match outcome {
                Ok(result) => outcomes.results.push(result),
                Err(e) => {
                    warn!(shard_id = %shard_id, error = %e, "Shard read failed");
                    outcomes.failures.push(ShardFailure {
                        shard_id,
                        error: snafu::Report::from_error(e).to_string(),
                    });
                }
            }
        }
        outcomes
    }

    fn spawn(self: Arc<Self>, index: usize, job: ShardJob) -> ShardFuture {
        let shard_id = job.shard.shard_id.clone();
        let handle = tokio::spawn(async move { self.read_shard(job).await });
        Box::pin(async move {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ShardReadError::WorkerJoin {
                    message: e.to_string(),
                }),
            };
            (index, shard_id, outcome)
        })
    }

    /// Read one shard from its resume point and stage every non-empty sink.
    pub async fn read_shard(&self, job: ShardJob) -> ShardOutcome {
        let shard_id = job.shard.shard_id.clone();
        match &job.resume_after {
            Some(after) => debug!(shard_id = %shard_id, %after, "Resuming shard"),
            None => warn!(
                shard_id = %shard_id,
                stream = %job.stream,
                "No checkpoint for shard, reading from the beginning"
            ),
        }

        let iterator = self
            .broker
            .shard_iterator(&job.stream, &job.shard, job.resume_after.as_ref())
            .await
            .context(ShardBrokerSnafu)?;

        let mut sinks = RecordSink::many(self.slices);
        let mut result = self
            .broker
            .read(iterator, &mut sinks, &self.limits)
            .await
            .context(ShardBrokerSnafu)?;

        if result.records == 0 {
            debug!(shard_id = %shard_id, "No new records");
            return Ok(result);
        }

        if let (Some(started), Some(checkpoint)) =
            (&result.starting_sequence_number, &job.resume_after)
            && started <= checkpoint
        {
            // The commit rejects the range if it overlaps the ledger.
            warn!(
                shard_id = %shard_id,
                %started,
                %checkpoint,
                "Read started at or before the checkpoint"
            );
        }

        for (slice, sink) in sinks.into_iter().enumerate() {
            if sink.is_empty() {
                continue;
            }
            let data = sink
                .finish()
                .context(CompressSnafu)
                .context(ShardStageSnafu)?;
            let url = self
                .stage
                .put(&blob_key(&self.prefix, &shard_id, slice), data)
                .await
                .context(ShardStageSnafu)?;
            result.staged_blob_urls.push(url);
        }

        info!(
            shard_id = %shard_id,
            records = result.records,
            blobs = result.staged_blob_urls.len(),
            "Staged shard"
        );
        Ok(result)
    }
}
