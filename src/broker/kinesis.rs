//! Kinesis broker.
//!
//! Records are written wrapped as `{"data": <payload>}` and unwrapped again on
//! read, one JSON line per record. Reads walk the shard iterator chain until
//! it ends, the request budget runs out, or the shard reports zero lag.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kinesis::Client;
use aws_sdk_kinesis::error::DisplayErrorContext;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::{ShardIteratorType, StreamStatus};
use num_bigint::BigUint;
use serde_json::{Value, json};
use snafu::prelude::*;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    Broker, HashKeyRange, ReadLimits, RecordSink, SequenceTracker, ShardDescriptor,
    ShardIterator, ShardReadResult, SinkFanout, StartPosition, StreamNaming,
    random_partition_key, retry_write,
};
use crate::emit;
use crate::error::{
    BrokerError, BrokerSequenceSnafu, EnvelopeSnafu, MissingFieldSnafu, NotActiveSnafu,
    StreamNamingSnafu,
};
use crate::metrics::events::ShardRecordsRead;
use crate::sequence::SequenceNumber;

/// Largest `Limit` accepted by GetRecords.
const MAX_GET_RECORDS_LIMIT: usize = 10_000;

/// Status checks made while waiting for a stream to become ACTIVE.
const ACTIVE_CHECKS: usize = 6;

fn kinesis_error<E>(operation: &'static str) -> impl FnOnce(E) -> BrokerError
where
    E: std::error::Error + 'static,
{
    move |e| BrokerError::Kinesis {
        operation,
        message: DisplayErrorContext(&e).to_string(),
    }
}

fn parse_hash_key(value: &str, field: &'static str) -> Result<BigUint, BrokerError> {
    BigUint::parse_bytes(value.as_bytes(), 10).context(MissingFieldSnafu {
        operation: "ListShards",
        field,
    })
}

/// Extract the payload line from a stored record.
fn unwrap_envelope(data: &[u8]) -> Vec<u8> {
    match serde_json::from_slice::<Value>(data) {
        Ok(Value::Object(mut envelope)) if envelope.contains_key("data") => {
            match envelope.remove("data") {
                Some(Value::String(payload)) => payload.into_bytes(),
                Some(other) => other.to_string().into_bytes(),
                None => data.to_vec(),
            }
        }
        _ => data.to_vec(),
    }
}

/// Broker backed by AWS Kinesis Data Streams.
pub struct KinesisBroker {
    client: Client,
    naming: StreamNaming,
    retry_delay: Duration,
    active_poll_interval: Duration,
}

impl KinesisBroker {
    pub fn new(client: Client, naming: StreamNaming) -> Self {
        Self {
            client,
            naming,
            retry_delay: Duration::from_millis(500),
            active_poll_interval: Duration::from_secs(10),
        }
    }

    /// Build a client from the default AWS credential chain.
    pub async fn connect(
        naming: StreamNaming,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config), naming)
    }

    /// Create the stream that feeds `table`.
    pub async fn create_stream(&self, table: &str, shard_count: u32) -> Result<String, BrokerError> {
        let stream = self.stream_name(table)?;
        self.client
            .create_stream()
            .stream_name(&stream)
            .shard_count(shard_count as i32)
            .send()
            .await
            .map_err(kinesis_error("CreateStream"))?;
        info!(stream = %stream, shard_count, "Created stream");
        Ok(stream)
    }

    /// Split every open shard at the midpoint of its hash key range.
    ///
    /// Kinesis allows one resharding operation at a time, so the stream must be
    /// ACTIVE before each split.
    pub async fn split_shards(&self, stream: &str) -> Result<usize, BrokerError> {
        let open: Vec<ShardDescriptor> = self
            .shard_descriptors(stream)
            .await?
            .into_iter()
            .filter(ShardDescriptor::is_open)
            .collect();

        for shard in &open {
            self.wait_until_active(stream).await?;
            let midpoint = shard.hash_key_range.midpoint();
            self.client
                .split_shard()
                .stream_name(stream)
                .shard_to_split(&shard.shard_id)
                .new_starting_hash_key(midpoint.to_string())
                .send()
                .await
                .map_err(kinesis_error("SplitShard"))?;
            info!(stream, shard_id = %shard.shard_id, %midpoint, "Split shard");
        }

        Ok(open.len())
    }

    async fn wait_until_active(&self, stream: &str) -> Result<(), BrokerError> {
        for check in 1..=ACTIVE_CHECKS {
            let output = self
                .client
                .describe_stream_summary()
                .stream_name(stream)
                .send()
                .await
                .map_err(kinesis_error("DescribeStreamSummary"))?;

            let status = output
                .stream_description_summary()
                .map(|summary| summary.stream_status().clone())
                .context(MissingFieldSnafu {
                    operation: "DescribeStreamSummary",
                    field: "StreamDescriptionSummary",
                })?;

            if status == StreamStatus::Active {
                return Ok(());
            }
            debug!(stream, ?status, check, "Waiting for stream to become active");
            tokio::time::sleep(self.active_poll_interval).await;
        }

        NotActiveSnafu {
            stream,
            attempts: ACTIVE_CHECKS,
        }
        .fail()
    }

    async fn put_once(
        &self,
        stream: &str,
        envelope: &[u8],
        partition_key: &str,
    ) -> Result<(), BrokerError> {
        self.client
            .put_record()
            .stream_name(stream)
            .partition_key(partition_key)
            .data(Blob::new(envelope.to_vec()))
            .send()
            .await
            .map_err(kinesis_error("PutRecord"))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for KinesisBroker {
    fn kind(&self) -> &'static str {
        "kinesis"
    }

    fn stream_name(&self, table: &str) -> Result<String, BrokerError> {
        self.naming
            .stream_name(table)
            .context(StreamNamingSnafu { table })
    }

    async fn shard_descriptors(&self, stream: &str) -> Result<Vec<ShardDescriptor>, BrokerError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // ListShards rejects a stream name alongside a continuation token.
            let request = match &next_token {
                Some(token) => self.client.list_shards().next_token(token),
                None => self.client.list_shards().stream_name(stream),
            };
            let output = request
                .send()
                .await
                .map_err(kinesis_error("ListShards"))?;

            for shard in output.shards() {
                let hash_keys = shard.hash_key_range().context(MissingFieldSnafu {
                    operation: "ListShards",
                    field: "HashKeyRange",
                })?;
                let sequence_numbers = shard.sequence_number_range().context(MissingFieldSnafu {
                    operation: "ListShards",
                    field: "SequenceNumberRange",
                })?;

                shards.push(ShardDescriptor {
                    shard_id: shard.shard_id().to_string(),
                    hash_key_range: HashKeyRange {
                        start: parse_hash_key(hash_keys.starting_hash_key(), "StartingHashKey")?,
                        end: parse_hash_key(hash_keys.ending_hash_key(), "EndingHashKey")?,
                    },
                    starting_sequence_number: sequence_numbers
                        .starting_sequence_number()
                        .parse()
                        .context(BrokerSequenceSnafu)?,
                    ending_sequence_number: sequence_numbers
                        .ending_sequence_number()
                        .map(str::parse::<SequenceNumber>)
                        .transpose()
                        .context(BrokerSequenceSnafu)?,
                });
            }

            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        debug!(stream, shards = shards.len(), "Listed shards");
        Ok(shards)
    }

    async fn shard_iterator(
        &self,
        stream: &str,
        shard: &ShardDescriptor,
        after: Option<&SequenceNumber>,
    ) -> Result<ShardIterator, BrokerError> {
        let request = self
            .client
            .get_shard_iterator()
            .stream_name(stream)
            .shard_id(&shard.shard_id);

        let request = match after {
            Some(seq) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(seq.to_string()),
            None => {
                warn!(
                    stream,
                    shard_id = %shard.shard_id,
                    "No checkpoint for shard; reading from the trim horizon"
                );
                request.shard_iterator_type(ShardIteratorType::TrimHorizon)
            }
        };

        let output = request
            .send()
            .await
            .map_err(kinesis_error("GetShardIterator"))?;
        let token = output.shard_iterator().context(MissingFieldSnafu {
            operation: "GetShardIterator",
            field: "ShardIterator",
        })?;

        Ok(ShardIterator {
            shard_id: shard.shard_id.clone(),
            start: StartPosition::after(after),
            token: token.to_string(),
        })
    }

    async fn read(
        &self,
        iterator: ShardIterator,
        sinks: &mut [RecordSink],
        limits: &ReadLimits,
    ) -> Result<ShardReadResult, BrokerError> {
        let mut fanout = SinkFanout::new(sinks)?;
        let mut tracker = SequenceTracker::default();
        let limit = limits.max_records_per_request.clamp(1, MAX_GET_RECORDS_LIMIT) as i32;

        let mut token = Some(iterator.token.clone());
        let mut requests = 0;

        while requests < limits.max_requests {
            let Some(current) = token.take() else { break };
            if requests > 0 {
                tokio::time::sleep(limits.request_interval).await;
            }
            requests += 1;

            let output = self
                .client
                .get_records()
                .shard_iterator(&current)
                .limit(limit)
                .send()
                .await
                .map_err(kinesis_error("GetRecords"))?;

            for record in output.records() {
                let seq: SequenceNumber = record
                    .sequence_number()
                    .parse()
                    .context(BrokerSequenceSnafu)?;
                if !tracker.observe(seq.clone()) {
                    warn!(
                        shard_id = %iterator.shard_id,
                        sequence_number = %seq,
                        "Out-of-order sequence number in batch"
                    );
                }
                fanout.push(&unwrap_envelope(record.data().as_ref()))?;
            }

            token = output.next_shard_iterator().map(str::to_string);
            if output.records().is_empty() && output.millis_behind_latest() == Some(0) {
                debug!(shard_id = %iterator.shard_id, requests, "Shard caught up");
                break;
            }
        }

        let records = fanout.written();
        emit!(ShardRecordsRead {
            shard_id: iterator.shard_id.clone(),
            count: records as u64,
        });

        let (starting_sequence_number, ending_sequence_number) = tracker.bounds();
        let next_iterator = token.map(|token| ShardIterator {
            shard_id: iterator.shard_id.clone(),
            start: StartPosition::after(ending_sequence_number.as_ref()),
            token,
        });

        Ok(ShardReadResult {
            shard_id: iterator.shard_id,
            records,
            starting_sequence_number,
            ending_sequence_number,
            next_iterator,
            staged_blob_urls: Vec::new(),
        })
    }

    async fn write(
        &self,
        stream: &str,
        payload: &str,
        partition_key: Option<&str>,
    ) -> Result<bool, BrokerError> {
        let envelope = serde_json::to_vec(&json!({ "data": payload })).context(EnvelopeSnafu)?;
        let partition_key = partition_key
            .map(str::to_string)
            .unwrap_or_else(random_partition_key);

        retry_write(stream, self.retry_delay, || {
            self.put_once(stream, &envelope, &partition_key)
        })
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_string_envelope() {
        let stored = serde_json::to_vec(&json!({"data": "{\"user_id\":7}"})).unwrap();
        assert_eq!(unwrap_envelope(&stored), b"{\"user_id\":7}".to_vec());
    }

    #[test]
    fn test_unwrap_object_envelope() {
        let stored = br#"{"data":{"user_id":7}}"#;
        assert_eq!(unwrap_envelope(stored), br#"{"user_id":7}"#.to_vec());
    }

    #[test]
    fn test_foreign_records_pass_through() {
        let stored = br#"{"user_id":7}"#;
        assert_eq!(unwrap_envelope(stored), stored.to_vec());
        assert_eq!(unwrap_envelope(b"not json"), b"not json".to_vec());
    }

    #[test]
    fn test_parse_hash_key() {
        let key = parse_hash_key("340282366920938463463374607431768211455", "EndingHashKey")
            .unwrap();
        assert_eq!(key, BigUint::from(u128::MAX));
        assert!(parse_hash_key("abc", "EndingHashKey").is_err());
    }

    #[tokio::test]
    async fn test_connect_uses_configured_region() {
        let naming = StreamNaming {
            cluster_name: Some("analytics".into()),
            database: Some("events".into()),
        };
        let broker = KinesisBroker::connect(
            naming,
            Some("eu-west-1".into()),
            Some("http://localhost:4566".into()),
        )
        .await;
        let region = broker.client.config().region().map(|r| r.as_ref().to_string());
        assert_eq!(region.as_deref(), Some("eu-west-1"));
    }
}
