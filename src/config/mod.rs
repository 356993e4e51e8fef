//! Configuration loading.
//!
//! A single YAML file describes the warehouse, the stream broker, the blob
//! stage and the tables to load. Environment references are expanded before
//! parsing (see [`vars`]).

mod vars;

use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use crate::broker::{ReadLimits, StreamNaming};
use crate::cluster::ClusterTopology;
use crate::error::{
    ConfigError, EmptyStageUrlSnafu, EnvInterpolationSnafu, InvalidIdentifierSnafu,
    ReadFileSnafu, YamlParseSnafu, ZeroMaxSnafu, ZeroValueSnafu,
};
use crate::schema::TableSchema;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("identifier pattern is valid")
});

/// Check that `name` can be spliced into SQL as a (optionally schema-qualified) identifier.
pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    ensure!(IDENTIFIER.is_match(name), InvalidIdentifierSnafu { name });
    Ok(())
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub warehouse: WarehouseConfig,
    pub broker: BrokerConfig,
    pub stage: StageConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    /// Per-table schemas used by the write path and `create-table`.
    #[serde(default)]
    pub schemas: HashMap<String, TableSchema>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Warehouse connection, naming and bulk load settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Cluster identifier. Used for stream naming, stage layout and topology lookup.
    #[serde(default)]
    pub cluster_name: Option<String>,
    /// Database name. Used for stream naming and stage layout.
    #[serde(default)]
    pub database: Option<String>,
    /// Postgres-protocol connection string.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,
    /// Rows the bulk load may reject before failing the batch.
    #[serde(default = "default_max_error")]
    pub max_error: u32,
    /// Credentials clause passed to the bulk load, e.g. `aws_iam_role=arn:...`.
    #[serde(default)]
    pub copy_credentials: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Static topology. When absent the cluster is described through AWS.
    #[serde(default)]
    pub topology: Option<ClusterTopology>,
}

impl WarehouseConfig {
    pub fn stream_naming(&self) -> StreamNaming {
        StreamNaming {
            cluster_name: self.cluster_name.clone(),
            database: self.database.clone(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_ledger_table() -> String {
    "kinesis_loads".to_string()
}

fn default_max_error() -> u32 {
    2
}

/// Stream broker selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BrokerConfig {
    Kinesis {
        #[serde(default)]
        region: Option<String>,
        /// Override endpoint (e.g. a local emulator).
        #[serde(default)]
        endpoint: Option<String>,
    },
    Local {
        #[serde(default = "default_local_directory")]
        directory: String,
    },
}

fn default_local_directory() -> String {
    "log".to_string()
}

/// Blob stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage location: `s3://bucket/prefix` or a local directory.
    pub url: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    #[serde(default = "default_attempts")]
    pub upload_attempts: usize,
    #[serde(default = "default_attempts")]
    pub verify_attempts: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Fail the cycle when size verification never succeeds.
    #[serde(default)]
    pub strict_verification: bool,
}

impl StageConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_attempts() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

/// Load cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Tables polled by `run`.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default = "default_max_concurrent_shards")]
    pub max_concurrent_shards: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_max_records_per_request")]
    pub max_records_per_request: usize,
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            max_concurrent_shards: default_max_concurrent_shards(),
            poll_interval_secs: default_poll_interval_secs(),
            max_requests: default_max_requests(),
            max_records_per_request: default_max_records_per_request(),
            request_interval_ms: default_request_interval_ms(),
        }
    }
}

impl LoaderConfig {
    pub fn read_limits(&self) -> ReadLimits {
        ReadLimits {
            max_requests: self.max_requests,
            max_records_per_request: self.max_records_per_request,
            request_interval: Duration::from_millis(self.request_interval_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_max_concurrent_shards() -> usize {
    16
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_max_requests() -> usize {
    100
}

fn default_max_records_per_request() -> usize {
    10_000
}

fn default_request_interval_ms() -> u64 {
    200
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text, expanding environment references first.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = vars::interpolate(yaml).map_err(|problems| {
            EnvInterpolationSnafu {
                message: problems.join("\n"),
            }
            .build()
        })?;
        let config: Config = serde_yaml::from_str(&expanded).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.stage.url.trim().is_empty(), EmptyStageUrlSnafu);
        ensure!(self.warehouse.max_error > 0, ZeroMaxSnafu);
        ensure!(
            self.stage.upload_attempts > 0,
            ZeroValueSnafu {
                field: "stage.upload_attempts"
            }
        );
        ensure!(
            self.stage.verify_attempts > 0,
            ZeroValueSnafu {
                field: "stage.verify_attempts"
            }
        );
        ensure!(
            self.loader.max_concurrent_shards > 0,
            ZeroValueSnafu {
                field: "loader.max_concurrent_shards"
            }
        );
        ensure!(
            self.loader.max_records_per_request > 0,
            ZeroValueSnafu {
                field: "loader.max_records_per_request"
            }
        );

        validate_identifier(&self.warehouse.ledger_table)?;
        for table in self.loader.tables.iter().chain(self.schemas.keys()) {
            validate_identifier(table)?;
        }
        for schema in self.schemas.values() {
            schema.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
warehouse:
  cluster_name: analytics
  database: events
  url: postgres://loader@localhost:5439/events
broker:
  kind: local
stage:
  url: /tmp/floe-stage
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.warehouse.ledger_table, "kinesis_loads");
        assert_eq!(config.warehouse.max_error, 2);
        assert_eq!(config.stage.verify_attempts, 3);
        assert_eq!(config.stage.upload_attempts, 3);
        assert!(!config.stage.strict_verification);
        assert_eq!(config.loader.max_requests, 100);
        assert_eq!(config.loader.max_records_per_request, 10_000);
        assert!(!config.metrics.enabled);
        assert!(matches!(
            config.broker,
            BrokerConfig::Local { ref directory } if directory == "log"
        ));
    }

    #[test]
    fn test_kinesis_broker_section() {
        let yaml = MINIMAL.replace(
            "  kind: local",
            "  kind: kinesis\n  region: us-east-1\n  endpoint: http://localhost:4566",
        );
        let config = Config::from_yaml(&yaml).unwrap();
        match config.broker {
            BrokerConfig::Kinesis { region, endpoint } => {
                assert_eq!(region.as_deref(), Some("us-east-1"));
                assert_eq!(endpoint.as_deref(), Some("http://localhost:4566"));
            }
            other => panic!("unexpected broker {other:?}"),
        }
    }

    #[test]
    fn test_stream_name() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.warehouse.stream_naming().stream_name("clicks").unwrap(),
            "analytics.events.clicks"
        );
    }

    #[test]
    fn test_stream_name_requires_cluster_and_database() {
        let yaml = MINIMAL.replace("  cluster_name: analytics\n", "");
        let config = Config::from_yaml(&yaml).unwrap();
        assert!(matches!(
            config.warehouse.stream_naming().stream_name("clicks"),
            Err(ConfigError::MissingStreamNaming)
        ));
    }

    #[test]
    fn test_rejects_zero_max_error() {
        let yaml = MINIMAL.replace(
            "  database: events\n",
            "  database: events\n  max_error: 0\n",
        );
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(ConfigError::ZeroMaxError)
        ));
    }

    #[test]
    fn test_rejects_injection_in_table_names() {
        let yaml = format!("{MINIMAL}loader:\n  tables: [\"clicks; drop table x\"]\n");
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(ConfigError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_env_interpolation() {
        unsafe {
            std::env::set_var("FLOE_CONFIG_TEST_STAGE", "/tmp/from-env");
        }
        let yaml = MINIMAL.replace("/tmp/floe-stage", "${FLOE_CONFIG_TEST_STAGE}");
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.stage.url, "/tmp/from-env");
    }

    #[test]
    fn test_missing_env_is_reported() {
        unsafe {
            std::env::remove_var("FLOE_CONFIG_TEST_MISSING");
        }
        let yaml = MINIMAL.replace("/tmp/floe-stage", "${FLOE_CONFIG_TEST_MISSING}");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("FLOE_CONFIG_TEST_MISSING"));
    }
}
