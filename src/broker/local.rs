//! Local-file broker for single-host setups.
//!
//! Each stream is one append-only file under a base directory. A read renames
//! the live file aside (`<stream>.<timestamp>`) so writers immediately start a
//! fresh file, then drains the rotated copy. The rotation timestamp stands in
//! for a sequence number: every read produces a single-point range.

use async_trait::async_trait;
use num_bigint::BigUint;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    Broker, HashKeyRange, ReadLimits, RecordSink, ShardDescriptor, ShardIterator, ShardReadResult,
    SinkFanout, StartPosition, StreamNaming, retry_write,
};
use crate::emit;
use crate::error::{BrokerError, LocalIoSnafu, StreamNamingSnafu};
use crate::metrics::events::ShardRecordsRead;
use crate::sequence::SequenceNumber;

/// Local broker rooted at a directory.
pub struct LocalFileBroker {
    directory: PathBuf,
    naming: StreamNaming,
    shard_id: String,
    last_timestamp: AtomicU64,
    append: Mutex<()>,
    retry_delay: Duration,
}

impl LocalFileBroker {
    pub fn new(directory: impl Into<PathBuf>, naming: StreamNaming) -> Self {
        let shard_id = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            directory: directory.into(),
            naming,
            shard_id,
            last_timestamp: AtomicU64::new(0),
            append: Mutex::new(()),
            retry_delay: Duration::from_millis(100),
        }
    }

    /// Override the host-derived shard id.
    pub fn with_shard_id(mut self, shard_id: impl Into<String>) -> Self {
        self.shard_id = shard_id.into();
        self
    }

    pub fn stream_path(&self, stream: &str) -> PathBuf {
        self.directory.join(stream)
    }

    /// Millisecond timestamp, strictly above every earlier one and above `floor`.
    fn next_timestamp(&self, floor: Option<&SequenceNumber>) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let floor = floor
            .and_then(|seq| u64::try_from(seq.as_biguint()).ok())
            .unwrap_or(0);

        let mut previous = self.last_timestamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(previous.saturating_add(1)).max(floor.saturating_add(1));
            match self.last_timestamp.compare_exchange(
                previous,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    async fn append_line(&self, path: &Path, line: &str) -> Result<(), BrokerError> {
        let _guard = self.append.lock().await;
        let display = path.display().to_string();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(LocalIoSnafu { path: &display })?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context(LocalIoSnafu { path: &display })?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.trim_end_matches('\n').as_bytes());
        buf.push(b'\n');
        file.write_all(&buf)
            .await
            .context(LocalIoSnafu { path: &display })?;
        file.flush().await.context(LocalIoSnafu { path: &display })
    }
}

#[async_trait]
impl Broker for LocalFileBroker {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn stream_name(&self, table: &str) -> Result<String, BrokerError> {
        self.naming
            .stream_name(table)
            .context(StreamNamingSnafu { table })
    }

    async fn shard_descriptors(&self, _stream: &str) -> Result<Vec<ShardDescriptor>, BrokerError> {
        Ok(vec![ShardDescriptor {
            shard_id: self.shard_id.clone(),
            hash_key_range: HashKeyRange {
                start: BigUint::from(0u32),
                end: BigUint::from(u128::MAX),
            },
            starting_sequence_number: SequenceNumber::from(0),
            ending_sequence_number: None,
        }])
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard: &ShardDescriptor,
        after: Option<&SequenceNumber>,
    ) -> Result<ShardIterator, BrokerError> {
        Ok(ShardIterator {
            shard_id: shard.shard_id.clone(),
            start: StartPosition::after(after),
            token: self.stream_path(stream).display().to_string(),
        })
    }

    async fn read(
        &self,
        iterator: ShardIterator,
        sinks: &mut [RecordSink],
        _limits: &ReadLimits,
    ) -> Result<ShardReadResult, BrokerError> {
        let mut fanout = SinkFanout::new(sinks)?;
        let live = PathBuf::from(&iterator.token);

        if !tokio::fs::try_exists(&live).await.unwrap_or(false) {
            debug!(path = %live.display(), "No local stream file; nothing to read");
            return Ok(ShardReadResult::empty(iterator.shard_id));
        }

        // The whole rotated file is drained, so request limits do not apply.
        let timestamp = self.next_timestamp(iterator.start.resume_point());
        let rotated = PathBuf::from(format!("{}.{timestamp}", iterator.token));
        match tokio::fs::rename(&live, &rotated).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ShardReadResult::empty(iterator.shard_id));
            }
            Err(source) => {
                return Err(BrokerError::LocalIo {
                    path: live.display().to_string(),
                    source,
                });
            }
        }
        info!(rotated = %rotated.display(), "Rotated local stream file");

        let rotated_display = rotated.display().to_string();
        let file = tokio::fs::File::open(&rotated)
            .await
            .context(LocalIoSnafu {
                path: &rotated_display,
            })?;
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await.context(LocalIoSnafu {
            path: &rotated_display,
        })? {
            if line.trim().is_empty() {
                continue;
            }
            fanout.push(line.as_bytes())?;
        }

        let records = fanout.written();
        emit!(ShardRecordsRead {
            shard_id: iterator.shard_id.clone(),
            count: records as u64,
        });

        if records == 0 {
            return Ok(ShardReadResult::empty(iterator.shard_id));
        }

        let sequence = SequenceNumber::from(timestamp);
        Ok(ShardReadResult {
            next_iterator: Some(ShardIterator {
                shard_id: iterator.shard_id.clone(),
                start: StartPosition::AfterSequenceNumber(sequence.clone()),
                token: iterator.token.clone(),
            }),
            shard_id: iterator.shard_id,
            records,
            starting_sequence_number: Some(sequence.clone()),
            ending_sequence_number: Some(sequence),
            staged_blob_urls: Vec::new(),
        })
    }

    async fn write(
        &self,
        stream: &str,
        payload: &str,
        _partition_key: Option<&str>,
    ) -> Result<bool, BrokerError> {
        let path = self.stream_path(stream);
        retry_write(stream, self.retry_delay, || self.append_line(&path, payload)).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn naming() -> StreamNaming {
        StreamNaming {
            cluster_name: Some("analytics".into()),
            database: Some("events".into()),
        }
    }

    fn broker(dir: &TempDir) -> LocalFileBroker {
        LocalFileBroker::new(dir.path(), naming()).with_shard_id("host-a")
    }

    fn gunzip(sink: RecordSink) -> String {
        let bytes = sink.finish().unwrap();
        let mut out = String::new();
        GzDecoder::new(&bytes[..]).read_to_string(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_single_synthetic_shard() {
        let dir = TempDir::new().unwrap();
        let shards = broker(&dir).shard_descriptors("s").await.unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].shard_id, "host-a");
        assert!(shards[0].is_open());
    }

    #[tokio::test]
    async fn test_missing_file_reads_zero_records() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let shard = &broker.shard_descriptors("s").await.unwrap()[0];
        let iterator = broker.shard_iterator("s", shard, None).await.unwrap();
        assert_eq!(iterator.start, StartPosition::TrimHorizon);

        let mut sinks = RecordSink::many(2);
        let result = broker
            .read(iterator, &mut sinks, &ReadLimits::default())
            .await
            .unwrap();
        assert_eq!(result.records, 0);
        assert!(result.starting_sequence_number.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_rotates_file() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let stream = broker.stream_name("clicks").unwrap();
        assert_eq!(stream, "analytics.events.clicks");

        for i in 0..5 {
            assert!(broker.write(&stream, &format!("{{\"n\":{i}}}"), None).await.unwrap());
        }

        let shard = &broker.shard_descriptors(&stream).await.unwrap()[0];
        let iterator = broker.shard_iterator(&stream, shard, None).await.unwrap();
        let mut sinks = RecordSink::many(2);
        let result = broker
            .read(iterator, &mut sinks, &ReadLimits::default())
            .await
            .unwrap();

        assert_eq!(result.records, 5);
        assert_eq!(result.starting_sequence_number, result.ending_sequence_number);
        assert!(!broker.stream_path(&stream).exists());

        let rotated = dir.path().join(format!(
            "{stream}.{}",
            result.ending_sequence_number.as_ref().unwrap()
        ));
        assert!(rotated.exists());

        let second = sinks.pop().unwrap();
        let first = sinks.pop().unwrap();
        assert_eq!(gunzip(first), "{\"n\":0}\n{\"n\":2}\n{\"n\":4}\n");
        assert_eq!(gunzip(second), "{\"n\":1}\n{\"n\":3}\n");
    }

    #[tokio::test]
    async fn test_timestamps_increase_past_resume_point() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let far_future = SequenceNumber::from(u64::MAX / 2);

        let first = broker.next_timestamp(Some(&far_future));
        let second = broker.next_timestamp(None);
        assert!(SequenceNumber::from(first) > far_future);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_writes_after_rotation_start_new_file() {
        let dir = TempDir::new().unwrap();
        let broker = broker(&dir);
        let stream = broker.stream_name("clicks").unwrap();
        let shard = broker.shard_descriptors(&stream).await.unwrap().remove(0);

        broker.write(&stream, "{\"a\":1}", None).await.unwrap();
        let iterator = broker.shard_iterator(&stream, &shard, None).await.unwrap();
        let first = broker
            .read(iterator, &mut RecordSink::many(1), &ReadLimits::default())
            .await
            .unwrap();

        broker.write(&stream, "{\"a\":2}", None).await.unwrap();
        let iterator = broker
            .shard_iterator(&stream, &shard, first.ending_sequence_number.as_ref())
            .await
            .unwrap();
        let second = broker
            .read(iterator, &mut RecordSink::many(1), &ReadLimits::default())
            .await
            .unwrap();

        assert_eq!(second.records, 1);
        assert!(second.starting_sequence_number > first.ending_sequence_number);
    }
}
