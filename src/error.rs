//! Error types for floe using snafu.
//!
//! Each concern owns an error enum with context selectors. The loader folds
//! them into [`LoadError`], and the CLI folds everything into [`AppError`].

use snafu::prelude::*;

use crate::loader::{LoadContext, LoadOutcome};

// ============ Storage Errors ============

/// Errors that can occur during object storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Stage Errors ============

/// Errors raised while staging blobs for a bulk load.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StageError {
    /// Upload failed after exhausting retries. Carries the last failure.
    #[snafu(display("Failed to upload {key} after {attempts} attempt(s)"))]
    Upload {
        key: String,
        attempts: usize,
        source: StorageError,
    },

    /// Stored size never matched the local size (strict verification only).
    #[snafu(display("Size verification failed for {key}: expected {expected} bytes, found {found:?}"))]
    Verification {
        key: String,
        expected: u64,
        found: Option<u64>,
    },

    /// Reading a staged blob failed.
    #[snafu(display("Failed to read staged blob {key}"))]
    Read { key: String, source: StorageError },

    /// Deleting staged blobs failed.
    #[snafu(display("Failed to delete staged blobs under {prefix}"))]
    Cleanup {
        prefix: String,
        source: StorageError,
    },

    /// A URL does not belong to this stage.
    #[snafu(display("URL {url} is not inside stage {stage}"))]
    ForeignUrl { url: String, stage: String },

    /// Gzip compression of a sink failed.
    #[snafu(display("Failed to compress staged data"))]
    Compress { source: std::io::Error },

    /// Manifest (de)serialization failed.
    #[snafu(display("Manifest JSON error"))]
    ManifestJson { source: serde_json::Error },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Stage URL is empty.
    #[snafu(display("Stage URL cannot be empty"))]
    EmptyStageUrl,

    /// Bulk load error tolerance must be positive.
    #[snafu(display("warehouse.max_error must be greater than zero"))]
    ZeroMaxError,

    /// A count that must be positive was zero.
    #[snafu(display("{field} must be greater than zero"))]
    ZeroValue { field: &'static str },

    /// A table or column name is not a plain SQL identifier.
    #[snafu(display("Invalid SQL identifier: {name:?}"))]
    InvalidIdentifier { name: String },

    /// Stream naming requires both cluster and database names.
    #[snafu(display("Stream naming requires warehouse.cluster_name and warehouse.database"))]
    MissingStreamNaming,

    /// Neither a static topology nor a cluster to describe is configured.
    #[snafu(display("Set warehouse.topology or warehouse.cluster_name to size the load"))]
    MissingTopology,

    /// Warehouse node type has no known slice factor.
    #[snafu(display("Unrecognized node type: {node_type}"))]
    UnknownNodeType { node_type: String },

    /// Column type string could not be parsed.
    #[snafu(display("Invalid column type {type_name:?} for column {column}"))]
    InvalidColumnType { column: String, type_name: String },

    /// No schema is configured for a table.
    #[snafu(display("No schema configured for table {table}"))]
    MissingSchema { table: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Broker Errors ============

/// Errors raised by stream brokers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BrokerError {
    /// Stream naming configuration is incomplete.
    #[snafu(display("Cannot derive stream name for {table}"))]
    StreamNaming { table: String, source: ConfigError },

    /// A Kinesis API call failed.
    #[snafu(display("Kinesis {operation} failed: {message}"))]
    Kinesis {
        operation: &'static str,
        message: String,
    },

    /// Kinesis returned a response without a field we depend on.
    #[snafu(display("Kinesis {operation} response is missing {field}"))]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },

    /// Stream did not reach ACTIVE in time.
    #[snafu(display("Stream {stream} did not become active after {attempts} checks"))]
    NotActive { stream: String, attempts: usize },

    /// Local log file IO failed.
    #[snafu(display("IO error on {path}"))]
    LocalIo {
        path: String,
        source: std::io::Error,
    },

    /// A record payload could not be (de)serialized.
    #[snafu(display("Record envelope JSON error"))]
    Envelope { source: serde_json::Error },

    /// Writing into a sink failed.
    #[snafu(display("Failed to write record into sink"))]
    SinkWrite { source: std::io::Error },

    /// Reads require at least one sink.
    #[snafu(display("read requires at least one sink"))]
    NoSinks,

    /// The broker reported a sequence number that is not a decimal integer.
    #[snafu(display("Invalid sequence number from broker"))]
    BrokerSequence {
        source: crate::sequence::SequenceParseError,
    },

    /// Operation only makes sense for the remote broker.
    #[snafu(display("{operation} is not supported by the {kind} broker"))]
    Unsupported {
        operation: &'static str,
        kind: &'static str,
    },
}

// ============ Warehouse Errors ============

/// Errors raised by warehouse connections and transactions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// Connecting to the warehouse failed.
    #[snafu(display("Failed to connect to warehouse"))]
    Connect { source: sqlx::Error },

    /// A SQL statement failed.
    #[snafu(display("Warehouse statement failed: {statement}"))]
    Sql {
        statement: &'static str,
        source: sqlx::Error,
    },

    /// Ledger row holds a sequence number that is not a decimal integer.
    #[snafu(display("Ledger row for shard {shard_id} has an invalid sequence number"))]
    LedgerSequence {
        shard_id: String,
        source: crate::sequence::SequenceParseError,
    },

    /// The bulk load could not read its manifest or blobs.
    #[snafu(display("Bulk load could not read staged input"))]
    BulkLoadInput { source: StageError },

    /// A staged blob held invalid gzip data.
    #[snafu(display("Staged blob {url} is not valid gzip"))]
    BulkLoadDecode {
        url: String,
        source: std::io::Error,
    },

    /// The in-memory warehouse was told to fail.
    #[snafu(display("Injected warehouse failure: {message}"))]
    Injected { message: String },
}

// ============ Ledger Errors ============

/// Errors raised while consulting the checkpoint ledger.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LedgerError {
    /// Two rows claim the latest load instant for one shard.
    #[snafu(display(
        "Ambiguous checkpoint for {table}/{stream}/{shard_id}: several rows at {load_timestamp}"
    ))]
    AmbiguousCheckpoint {
        table: String,
        stream: String,
        shard_id: String,
        load_timestamp: chrono::NaiveDateTime,
    },

    /// The underlying warehouse query failed.
    #[snafu(display("Ledger query failed"))]
    LedgerQuery { source: WarehouseError },
}

// ============ Cluster Errors ============

/// Errors raised while resolving warehouse topology.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClusterError {
    /// Describe call failed.
    #[snafu(display("Failed to describe cluster {cluster}: {message}"))]
    Describe { cluster: String, message: String },

    /// Cluster was not found.
    #[snafu(display("Cluster {cluster} not found"))]
    ClusterNotFound { cluster: String },

    /// Cluster description lacks node information.
    #[snafu(display("Cluster {cluster} description is missing {field}"))]
    MissingAttribute {
        cluster: String,
        field: &'static str,
    },

    /// Topology is not usable (unknown node type).
    #[snafu(display("Invalid cluster topology"))]
    Topology { source: ConfigError },
}

// ============ Shard Read Errors ============

/// Failure of one shard worker during the read/stage phase.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ShardReadError {
    /// Broker call failed.
    #[snafu(display("Broker failed"))]
    ShardBroker { source: BrokerError },

    /// Staging a sink failed.
    #[snafu(display("Staging failed"))]
    ShardStage { source: StageError },

    /// The worker task panicked or was cancelled.
    #[snafu(display("Shard worker did not complete: {message}"))]
    WorkerJoin { message: String },
}

// ============ Load Errors ============

/// Errors from a top-level load cycle.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoadError {
    /// Broker metadata call failed.
    #[snafu(display("Broker failed for table {table}"))]
    LoadBroker { table: String, source: BrokerError },

    /// Stream has no shards.
    #[snafu(display("Stream {stream} has no shards"))]
    NoShards { stream: String },

    /// Slice count could not be determined.
    #[snafu(display("Cannot determine warehouse slice count"))]
    LoadCluster { source: ClusterError },

    /// Checkpoint lookup failed.
    #[snafu(display("Checkpoint lookup failed for {stream}"))]
    LoadLedger { stream: String, source: LedgerError },

    /// Manifest build or upload failed.
    #[snafu(display("Manifest staging failed for {}", context.stream))]
    LoadManifest {
        context: Box<LoadContext>,
        source: StageError,
    },

    /// At least one shard worker failed; nothing was committed.
    #[snafu(display(
        "{} shard(s) failed to read for {}; cycle aborted",
        context.failures.len(),
        context.stream
    ))]
    ShardRead { context: Box<LoadContext> },

    /// The commit protocol rejected or failed the batch.
    #[snafu(display("Load of {} rejected: {}", context.table, outcome.describe()))]
    Rejected {
        context: Box<LoadContext>,
        outcome: LoadOutcome,
    },
}

impl LoadError {
    /// Replay context, when the failure happened after the read phase started.
    pub fn context(&self) -> Option<&LoadContext> {
        match self {
            LoadError::LoadManifest { context, .. }
            | LoadError::ShardRead { context }
            | LoadError::Rejected { context, .. } => Some(context),
            _ => None,
        }
    }
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to install Prometheus recorder.
    #[snafu(display("Failed to install Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Application Errors ============

/// Top-level error type for the CLI.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error"))]
    Storage { source: StorageError },

    /// Staging error.
    #[snafu(display("Stage error"))]
    Stage { source: StageError },

    /// Broker error.
    #[snafu(display("Broker error"))]
    Broker { source: BrokerError },

    /// Warehouse error.
    #[snafu(display("Warehouse error"))]
    Warehouse { source: WarehouseError },

    /// Load cycle error.
    #[snafu(display("Load failed"))]
    Load { source: LoadError },

    /// Record rejected by the table schema.
    #[snafu(display("Record rejected"))]
    Validation {
        source: crate::schema::ValidationError,
    },

    /// Record argument is not a JSON object.
    #[snafu(display("Record must be a JSON object"))]
    RecordJson { source: serde_json::Error },

    /// Command output could not be rendered as JSON.
    #[snafu(display("Failed to render output"))]
    Render { source: serde_json::Error },

    /// Ledger audit found violations.
    #[snafu(display("Ledger audit found {count} violation(s)"))]
    AuditFailed { count: usize },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// Address parse error.
    #[snafu(display("Invalid metrics address"))]
    AddressParse { source: std::net::AddrParseError },
}

impl From<ConfigError> for AppError {
    fn from(source: ConfigError) -> Self {
        AppError::Config { source }
    }
}

impl From<LoadError> for AppError {
    fn from(source: LoadError) -> Self {
        AppError::Load { source }
    }
}

impl From<BrokerError> for AppError {
    fn from(source: BrokerError) -> Self {
        AppError::Broker { source }
    }
}

impl From<WarehouseError> for AppError {
    fn from(source: WarehouseError) -> Self {
        AppError::Warehouse { source }
    }
}
