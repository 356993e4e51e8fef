//! Internal events for metrics emission.
//!
//! Each struct describes one thing that happened during a load cycle or a
//! write, and knows which Prometheus series it feeds.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Records pulled from one shard during a read.
pub struct ShardRecordsRead {
    pub shard_id: String,
    pub count: u64,
}

impl InternalEvent for ShardRecordsRead {
    fn emit(self) {
        trace!(shard_id = %self.shard_id, count = self.count, "Shard records read");
        counter!("floe_shard_records_read_total", "shard_id" => self.shard_id)
            .increment(self.count);
    }
}

/// A sink (or manifest) was uploaded to the stage.
pub struct BlobStaged {
    pub bytes: u64,
}

impl InternalEvent for BlobStaged {
    fn emit(self) {
        trace!(bytes = self.bytes, "Blob staged");
        counter!("floe_blobs_staged_total").increment(1);
        counter!("floe_staged_bytes_total").increment(self.bytes);
    }
}

/// Stored size never matched after all verification attempts.
pub struct BlobVerificationFailed;

impl InternalEvent for BlobVerificationFailed {
    fn emit(self) {
        trace!("Blob verification failed");
        counter!("floe_blob_verification_failures_total").increment(1);
    }
}

/// A stream write attempt failed and will be retried.
pub struct BrokerWriteRetried;

impl InternalEvent for BrokerWriteRetried {
    fn emit(self) {
        trace!("Broker write retried");
        counter!("floe_broker_write_retries_total").increment(1);
    }
}

/// Final status of one load cycle.
#[derive(Debug, Clone, Copy)]
pub enum CycleStatus {
    Loaded,
    Empty,
    Rejected,
    Failed,
}

impl CycleStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Loaded => "loaded",
            CycleStatus::Empty => "empty",
            CycleStatus::Rejected => "rejected",
            CycleStatus::Failed => "failed",
        }
    }
}

/// A load cycle finished.
pub struct LoadCycleCompleted {
    pub table: String,
    pub status: CycleStatus,
    pub duration: Duration,
}

impl InternalEvent for LoadCycleCompleted {
    fn emit(self) {
        trace!(
            table = %self.table,
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis() as u64,
            "Load cycle completed"
        );
        counter!(
            "floe_load_cycles_total",
            "table" => self.table.clone(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!("floe_load_cycle_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Rows the warehouse reported for a committed bulk load.
pub struct RecordsLoaded {
    pub table: String,
    pub count: u64,
}

impl InternalEvent for RecordsLoaded {
    fn emit(self) {
        trace!(table = %self.table, count = self.count, "Records loaded");
        counter!("floe_records_loaded_total", "table" => self.table).increment(self.count);
    }
}

/// Why the commit protocol refused a batch.
#[derive(Debug, Clone, Copy)]
pub enum RejectReason {
    Race,
    Overlap,
    BulkLoad,
}

impl RejectReason {
    fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Race => "race",
            RejectReason::Overlap => "overlap",
            RejectReason::BulkLoad => "bulk_load",
        }
    }
}

/// The commit protocol rolled back.
pub struct CommitRejected {
    pub reason: RejectReason,
}

impl InternalEvent for CommitRejected {
    fn emit(self) {
        trace!(reason = self.reason.as_str(), "Commit rejected");
        counter!("floe_commit_rejections_total", "reason" => self.reason.as_str()).increment(1);
    }
}

/// Shard workers currently running.
pub struct ActiveShardReads {
    pub count: usize,
}

impl InternalEvent for ActiveShardReads {
    fn emit(self) {
        trace!(count = self.count, "Active shard reads");
        gauge!("floe_active_shard_reads").set(self.count as f64);
    }
}
