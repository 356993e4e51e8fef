//! Builds the runtime components from configuration.

use serde_json::{Map, Value};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::debug;

use crate::broker::{Broker, BrokerRef, KinesisBroker, LocalFileBroker};
use crate::cluster::{ClusterMetadata, RedshiftClusterMetadata, StaticClusterMetadata};
use crate::config::{BrokerConfig, Config};
use crate::error::{
    AppError, BrokerError, ConfigError, MissingTopologySnafu, RecordJsonSnafu, StageSnafu,
    StorageSnafu, UnsupportedSnafu, ValidationSnafu, WarehouseError,
};
use crate::loader::{Loader, LoaderSettings};
use crate::stage::BlobStage;
use crate::warehouse::RedshiftWarehouse;

/// The configured broker.
pub async fn broker(config: &Config) -> BrokerRef {
    let naming = config.warehouse.stream_naming();
    match &config.broker {
        BrokerConfig::Kinesis { region, endpoint } => Arc::new(
            KinesisBroker::connect(naming, region.clone(), endpoint.clone()).await,
        ),
        BrokerConfig::Local { directory } => Arc::new(LocalFileBroker::new(directory, naming)),
    }
}

/// The configured broker, for commands that only Kinesis supports.
pub async fn kinesis(config: &Config, operation: &'static str) -> Result<KinesisBroker, BrokerError> {
    match &config.broker {
        BrokerConfig::Kinesis { region, endpoint } => Ok(KinesisBroker::connect(
            config.warehouse.stream_naming(),
            region.clone(),
            endpoint.clone(),
        )
        .await),
        BrokerConfig::Local { .. } => UnsupportedSnafu {
            operation,
            kind: "local",
        }
        .fail(),
    }
}

pub async fn stage(config: &Config) -> Result<BlobStage, AppError> {
    BlobStage::from_config(&config.stage)
        .await
        .context(StorageSnafu)
}

pub async fn warehouse(config: &Config) -> Result<RedshiftWarehouse, WarehouseError> {
    RedshiftWarehouse::connect(&config.warehouse).await
}

/// Slice count source: static topology when configured, else the Redshift API.
pub async fn cluster(config: &Config) -> Result<Arc<dyn ClusterMetadata>, ConfigError> {
    let warehouse = &config.warehouse;
    if let Some(topology) = &warehouse.topology {
        debug!(node_type = %topology.node_type, nodes = topology.number_of_nodes, "Using static topology");
        return Ok(Arc::new(StaticClusterMetadata(topology.clone())));
    }
    let cluster = warehouse.cluster_name.clone().context(MissingTopologySnafu)?;
    Ok(Arc::new(
        RedshiftClusterMetadata::connect(cluster, warehouse.region.clone()).await,
    ))
}

/// A loader wired to the configured broker, stage, warehouse and cluster.
pub async fn loader(config: &Config) -> Result<Loader, AppError> {
    let broker = broker(config).await;
    let stage = stage(config).await?;
    let warehouse = warehouse(config).await?;
    let cluster = cluster(config).await?;
    Ok(Loader::new(
        broker,
        stage,
        Arc::new(warehouse),
        cluster,
        LoaderSettings::from_config(config),
    ))
}

/// Validate `data` against the table's schema (when one is configured) and
/// write it to the table's stream.
pub async fn write_record(
    broker: &dyn Broker,
    config: &Config,
    table: &str,
    data: &str,
    partition_key: Option<&str>,
) -> Result<bool, AppError> {
    let record: Map<String, Value> = serde_json::from_str(data).context(RecordJsonSnafu)?;
    let record = match config.schemas.get(table) {
        Some(schema) => schema
            .validate_record(table, record)
            .context(ValidationSnafu)?,
        None => record,
    };

    let stream = broker.stream_name(table)?;
    let payload = serde_json::to_string(&record).context(RecordJsonSnafu)?;
    Ok(broker.write(&stream, &payload, partition_key).await?)
}

/// Delete one day of staged blobs for `table`.
pub async fn cleanup(
    stage: &BlobStage,
    config: &Config,
    table: &str,
    date: chrono::NaiveDate,
) -> Result<usize, AppError> {
    let layout = LoaderSettings::from_config(config).layout;
    stage
        .cleanup(&layout.day_prefix(table, date))
        .await
        .context(StageSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config::from_yaml(&format!(
            r#"
warehouse:
  cluster_name: analytics
  database: events
  url: postgres://loader@localhost:5439/events
broker:
  kind: local
  directory: {dir}/log
stage:
  url: {dir}/stage
schemas:
  clicks:
    columns:
      - {{ name: user_id, type: bigint, constraint: not null }}
      - {{ name: page, type: varchar(4) }}
"#,
            dir = dir.path().display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_validates_then_appends() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let broker = broker(&config).await;

        let written = write_record(
            broker.as_ref(),
            &config,
            "clicks",
            r#"{"user_id": 7, "page": "checkout"}"#,
            None,
        )
        .await
        .unwrap();
        assert!(written);

        let log = std::fs::read_to_string(dir.path().join("log/analytics.events.clicks")).unwrap();
        assert_eq!(log, "{\"page\":\"chec\",\"user_id\":7}\n");
    }

    #[tokio::test]
    async fn test_write_rejects_invalid_records() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let broker = broker(&config).await;

        let missing = write_record(broker.as_ref(), &config, "clicks", r#"{"page": "a"}"#, None).await;
        assert!(matches!(missing, Err(AppError::Validation { .. })));

        let not_object = write_record(broker.as_ref(), &config, "clicks", "[1]", None).await;
        assert!(matches!(not_object, Err(AppError::RecordJson { .. })));
    }

    #[tokio::test]
    async fn test_kinesis_only_commands_refuse_local_broker() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        assert!(matches!(
            kinesis(&config, "create-stream").await,
            Err(BrokerError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_cluster_requires_topology_or_name() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.warehouse.cluster_name = None;
        assert!(matches!(
            cluster(&config).await,
            Err(ConfigError::MissingTopology)
        ));

        config.warehouse.topology = Some(crate::cluster::ClusterTopology {
            node_type: "dc2.large".into(),
            number_of_nodes: 2,
        });
        let metadata = cluster(&config).await.unwrap();
        assert_eq!(metadata.slice_count().await.unwrap(), 4);
    }
}
