//! Stream brokers.
//!
//! A broker exposes shard topology, resumable per-shard iterators, bounded
//! reads fanned out into gzip sinks, and retried writes. Two implementations
//! exist: [`kinesis::KinesisBroker`] for production and
//! [`local::LocalFileBroker`] for single-host development.

pub mod kinesis;
pub mod local;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use num_bigint::BigUint;
use serde::{Serialize, Serializer};
use snafu::prelude::*;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::emit;
use crate::error::{
    BrokerError, ConfigError, MissingStreamNamingSnafu, NoSinksSnafu, SinkWriteSnafu,
};
use crate::metrics::events::BrokerWriteRetried;
use crate::sequence::SequenceNumber;

pub use kinesis::KinesisBroker;
pub use local::LocalFileBroker;

/// Number of attempts made by [`Broker::write`].
pub const WRITE_ATTEMPTS: usize = 3;

/// A reference-counted broker shared by shard workers.
pub type BrokerRef = Arc<dyn Broker>;

fn biguint_as_string<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Names the stream that feeds a table: `<cluster>.<database>.<table>`.
#[derive(Debug, Clone, Default)]
pub struct StreamNaming {
    pub cluster_name: Option<String>,
    pub database: Option<String>,
}

impl StreamNaming {
    pub fn stream_name(&self, table: &str) -> Result<String, ConfigError> {
        match (self.cluster_name.as_deref(), self.database.as_deref()) {
            (Some(cluster), Some(database)) if !cluster.is_empty() && !database.is_empty() => {
                Ok(format!("{cluster}.{database}.{table}"))
            }
            _ => MissingStreamNamingSnafu.fail(),
        }
    }
}

/// Inclusive hash key range owned by a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashKeyRange {
    #[serde(serialize_with = "biguint_as_string")]
    pub start: BigUint,
    #[serde(serialize_with = "biguint_as_string")]
    pub end: BigUint,
}

impl HashKeyRange {
    /// Hash key at which to split this range in two.
    pub fn midpoint(&self) -> BigUint {
        (&self.start + &self.end) >> 1u32
    }
}

/// Snapshot of one shard as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardDescriptor {
    pub shard_id: String,
    pub hash_key_range: HashKeyRange,
    pub starting_sequence_number: SequenceNumber,
    /// `None` while the shard is still open for writes.
    pub ending_sequence_number: Option<SequenceNumber>,
}

impl ShardDescriptor {
    pub fn is_open(&self) -> bool {
        self.ending_sequence_number.is_none()
    }
}

/// Where an iterator starts reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "sequence_number", rename_all = "snake_case")]
pub enum StartPosition {
    /// Oldest record still retained by the shard.
    TrimHorizon,
    /// First record strictly after the given sequence number.
    AfterSequenceNumber(SequenceNumber),
}

impl StartPosition {
    pub fn after(sequence_number: Option<&SequenceNumber>) -> Self {
        match sequence_number {
            Some(seq) => StartPosition::AfterSequenceNumber(seq.clone()),
            None => StartPosition::TrimHorizon,
        }
    }

    pub fn resume_point(&self) -> Option<&SequenceNumber> {
        match self {
            StartPosition::TrimHorizon => None,
            StartPosition::AfterSequenceNumber(seq) => Some(seq),
        }
    }
}

/// Resumable cursor bound to one shard.
///
/// `token` is meaningful only to the broker that issued it: a Kinesis shard
/// iterator string or a local log file path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardIterator {
    pub shard_id: String,
    pub start: StartPosition,
    pub token: String,
}

/// Bounds on a single [`Broker::read`] call.
#[derive(Debug, Clone)]
pub struct ReadLimits {
    pub max_requests: usize,
    pub max_records_per_request: usize,
    /// Pause between consecutive requests against the same shard.
    pub request_interval: Duration,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            max_requests: 100,
            max_records_per_request: 10_000,
            request_interval: Duration::from_millis(200),
        }
    }
}

/// Outcome of reading (and later staging) one shard.
///
/// `records == 0` is a normal result; the sequence bounds are then `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardReadResult {
    pub shard_id: String,
    pub records: usize,
    pub starting_sequence_number: Option<SequenceNumber>,
    pub ending_sequence_number: Option<SequenceNumber>,
    #[serde(skip)]
    pub next_iterator: Option<ShardIterator>,
    /// Filled in by the shard reader once sinks are staged.
    pub staged_blob_urls: Vec<String>,
}

impl ShardReadResult {
    pub fn empty(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            records: 0,
            starting_sequence_number: None,
            ending_sequence_number: None,
            next_iterator: None,
            staged_blob_urls: Vec::new(),
        }
    }
}

/// Gzip-compressed newline-delimited buffer that receives records during a read.
pub struct RecordSink {
    encoder: GzEncoder<Vec<u8>>,
    records: usize,
}

impl Default for RecordSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSink {
    pub fn new() -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            records: 0,
        }
    }

    /// One sink per warehouse slice.
    pub fn many(count: usize) -> Vec<Self> {
        (0..count).map(|_| Self::new()).collect()
    }

    /// Append one record as a line.
    pub fn push(&mut self, record: &[u8]) -> Result<(), BrokerError> {
        self.encoder.write_all(record).context(SinkWriteSnafu)?;
        if !record.ends_with(b"\n") {
            self.encoder.write_all(b"\n").context(SinkWriteSnafu)?;
        }
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Finish the gzip stream and return the compressed bytes.
    pub fn finish(self) -> std::io::Result<Bytes> {
        self.encoder.finish().map(Bytes::from)
    }
}

/// Running min/max of the sequence numbers seen during one read.
#[derive(Debug, Default)]
pub(crate) struct SequenceTracker {
    min: Option<SequenceNumber>,
    max: Option<SequenceNumber>,
    last: Option<SequenceNumber>,
}

impl SequenceTracker {
    /// Record `seq`. Returns `false` if it arrived below its predecessor.
    pub(crate) fn observe(&mut self, seq: SequenceNumber) -> bool {
        let in_order = self.last.as_ref().is_none_or(|last| *last <= seq);
        if self.min.as_ref().is_none_or(|min| seq < *min) {
            self.min = Some(seq.clone());
        }
        if self.max.as_ref().is_none_or(|max| seq > *max) {
            self.max = Some(seq.clone());
        }
        self.last = Some(seq);
        in_order
    }

    pub(crate) fn bounds(self) -> (Option<SequenceNumber>, Option<SequenceNumber>) {
        (self.min, self.max)
    }
}

/// Round-robin distributor over a set of sinks.
pub(crate) struct SinkFanout<'a> {
    sinks: &'a mut [RecordSink],
    written: usize,
}

impl<'a> SinkFanout<'a> {
    pub(crate) fn new(sinks: &'a mut [RecordSink]) -> Result<Self, BrokerError> {
        ensure!(!sinks.is_empty(), NoSinksSnafu);
        Ok(Self { sinks, written: 0 })
    }

    pub(crate) fn push(&mut self, record: &[u8]) -> Result<(), BrokerError> {
        let slot = self.written % self.sinks.len();
        self.sinks[slot].push(record)?;
        self.written += 1;
        Ok(())
    }

    pub(crate) fn written(&self) -> usize {
        self.written
    }
}

/// Pseudo-random partition key for writers that do not care about ordering.
pub fn random_partition_key() -> String {
    rand::random_range(0..100u32).to_string()
}

/// Run `attempt` up to [`WRITE_ATTEMPTS`] times with a fixed pause, returning
/// the last error once all attempts fail.
pub async fn retry_write<F, Fut, T>(
    stream: &str,
    delay: Duration,
    mut attempt: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if tries < WRITE_ATTEMPTS => {
                warn!(stream, attempt = tries, error = %e, "Stream write failed, retrying");
                emit!(BrokerWriteRetried);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Capabilities shared by every stream broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Stream identifier for a warehouse table.
    fn stream_name(&self, table: &str) -> Result<String, BrokerError>;

    /// Current shard topology of `stream`.
    async fn shard_descriptors(&self, stream: &str) -> Result<Vec<ShardDescriptor>, BrokerError>;

    /// Iterator that starts right after `after`, or at the beginning of the shard.
    async fn shard_iterator(
        &self,
        stream: &str,
        shard: &ShardDescriptor,
        after: Option<&SequenceNumber>,
    ) -> Result<ShardIterator, BrokerError>;

    /// Read bounded batches from `iterator`, distributing records round-robin over `sinks`.
    async fn read(
        &self,
        iterator: ShardIterator,
        sinks: &mut [RecordSink],
        limits: &ReadLimits,
    ) -> Result<ShardReadResult, BrokerError>;

    /// Append `payload` to the stream, retrying transient failures.
    async fn write(
        &self,
        stream: &str,
        payload: &str,
        partition_key: Option<&str>,
    ) -> Result<bool, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gunzip(bytes: &[u8]) -> String {
        let mut out = String::new();
        GzDecoder::new(bytes).read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_fanout_is_round_robin() {
        let mut sinks = RecordSink::many(3);
        let mut fanout = SinkFanout::new(&mut sinks).unwrap();
        for i in 0..7 {
            fanout.push(format!("{{\"n\":{i}}}").as_bytes()).unwrap();
        }
        assert_eq!(fanout.written(), 7);

        let counts: Vec<usize> = sinks.iter().map(RecordSink::records).collect();
        assert_eq!(counts, vec![3, 2, 2]);

        let first = sinks.remove(0).finish().unwrap();
        assert_eq!(gunzip(&first), "{\"n\":0}\n{\"n\":3}\n{\"n\":6}\n");
    }

    #[test]
    fn test_fanout_requires_sinks() {
        let mut sinks: Vec<RecordSink> = Vec::new();
        assert!(matches!(
            SinkFanout::new(&mut sinks),
            Err(BrokerError::NoSinks)
        ));
    }

    #[test]
    fn test_tracker_reports_out_of_order() {
        let mut tracker = SequenceTracker::default();
        assert!(tracker.observe(SequenceNumber::from(10)));
        assert!(tracker.observe(SequenceNumber::from(12)));
        assert!(!tracker.observe(SequenceNumber::from(11)));
        let (min, max) = tracker.bounds();
        assert_eq!(min, Some(SequenceNumber::from(10)));
        assert_eq!(max, Some(SequenceNumber::from(12)));
    }

    #[test]
    fn test_hash_key_midpoint() {
        let range = HashKeyRange {
            start: BigUint::from(0u32),
            end: "340282366920938463463374607431768211455".parse().unwrap(),
        };
        assert_eq!(
            range.midpoint().to_string(),
            "170141183460469231731687303715884105727"
        );
    }

    #[test]
    fn test_random_partition_key_in_range() {
        for _ in 0..50 {
            let key: u32 = random_partition_key().parse().unwrap();
            assert!(key < 100);
        }
    }

    #[tokio::test]
    async fn test_retry_write_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<bool, BrokerError> =
            retry_write("s", Duration::from_millis(1), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err(BrokerError::Kinesis {
                        operation: "PutRecord",
                        message: format!("attempt {n}"),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), WRITE_ATTEMPTS);
        match result {
            Err(BrokerError::Kinesis { message, .. }) => assert_eq!(message, "attempt 2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_write_recovers() {
        let calls = AtomicUsize::new(0);
        let result = retry_write("s", Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BrokerError::NoSinks)
                } else {
                    Ok(true)
                }
            }
        })
        .await;
        assert!(result.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
