//! End-to-end runs of the local-file broker through the loader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use floe::app;
use floe::broker::{Broker, LocalFileBroker, StreamNaming};
use floe::checkpoint::audit;
use floe::cluster::StaticClusterMetadata;
use floe::config::Config;
use floe::loader::{Loader, LoaderSettings};
use floe::stage::{BlobStage, StagePolicy};
use floe::storage::StorageProvider;
use floe::warehouse::MemoryWarehouse;

fn config(dir: &TempDir) -> Config {
    Config::from_yaml(&format!(
        r#"
warehouse:
  cluster_name: analytics
  database: events
  url: postgres://loader@localhost:5439/events
  topology:
    node_type: ds2.xlarge
    number_of_nodes: 1
broker:
  kind: local
  directory: {dir}/log
stage:
  url: {dir}/stage
  retry_delay_ms: 1
schemas:
  clicks:
    columns:
      - {{ name: user_id, type: bigint, constraint: not null }}
      - {{ name: page, type: varchar(16) }}
"#,
        dir = dir.path().display()
    ))
    .unwrap()
}

async fn setup(dir: &TempDir) -> (Config, Arc<LocalFileBroker>, Arc<MemoryWarehouse>, Loader) {
    let config = config(dir);
    let broker = Arc::new(
        LocalFileBroker::new(dir.path().join("log"), config.warehouse.stream_naming())
            .with_shard_id("host-a"),
    );
    let storage = StorageProvider::for_url_with_options(
        dir.path().join("stage").to_str().unwrap(),
        HashMap::new(),
    )
    .await
    .unwrap();
    let stage = BlobStage::new(
        Arc::new(storage),
        StagePolicy {
            retry_delay: Duration::from_millis(1),
            ..StagePolicy::default()
        },
    );
    let warehouse = Arc::new(MemoryWarehouse::new(stage.clone()));
    let topology = config.warehouse.topology.clone().unwrap();
    let loader = Loader::new(
        broker.clone(),
        stage,
        warehouse.clone(),
        Arc::new(StaticClusterMetadata(topology)),
        LoaderSettings::from_config(&config),
    );
    (config, broker, warehouse, loader)
}

#[tokio::test]
async fn test_written_records_are_loaded_once() {
    let dir = TempDir::new().unwrap();
    let (config, broker, warehouse, loader) = setup(&dir).await;

    for user in 1..=3 {
        let data = format!(r#"{{"user_id": {user}, "page": "home"}}"#);
        app::write_record(broker.as_ref(), &config, "clicks", &data, None)
            .await
            .unwrap();
    }

    let report = loader.load("clicks").await.unwrap();
    assert_eq!(report.stream, "analytics.events.clicks");
    assert_eq!(report.records_loaded, 3);
    assert_eq!(warehouse.rows("clicks").len(), 3);

    let ledger = warehouse.ledger();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].shard_id, "host-a");
    // The rotation timestamp covers the whole read.
    assert_eq!(
        ledger[0].starting_sequence_number,
        ledger[0].ending_sequence_number
    );

    let report = loader.load("clicks").await.unwrap();
    assert_eq!(report.records_loaded, 0);
    assert_eq!(warehouse.ledger().len(), 1);
}

#[tokio::test]
async fn test_rotations_chain_in_the_ledger() {
    let dir = TempDir::new().unwrap();
    let (config, broker, warehouse, loader) = setup(&dir).await;
    let stream = broker.stream_name("clicks").unwrap();

    for round in 0..3 {
        for user in 0..2 {
            let data = format!(r#"{{"user_id": {}, "page": "p{round}"}}"#, round * 10 + user);
            app::write_record(broker.as_ref(), &config, "clicks", &data, Some("key"))
                .await
                .unwrap();
        }
        loader.load("clicks").await.unwrap();
    }

    let ledger = warehouse.ledger();
    assert_eq!(ledger.len(), 3);
    assert!(ledger.iter().all(|row| row.stream_name == stream));
    assert!(
        ledger
            .windows(2)
            .all(|pair| pair[0].ending_sequence_number < pair[1].starting_sequence_number)
    );
    assert!(audit(&ledger).is_empty());
    assert_eq!(warehouse.rows("clicks").len(), 6);

    // Every rotated file is kept next to the live one.
    let rotated = std::fs::read_dir(dir.path().join("log"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(&format!("{stream}."))
        })
        .count();
    assert_eq!(rotated, 3);
}

#[tokio::test]
async fn test_invalid_records_never_reach_the_stream() {
    let dir = TempDir::new().unwrap();
    let (config, broker, warehouse, loader) = setup(&dir).await;

    let result = app::write_record(
        broker.as_ref(),
        &config,
        "clicks",
        r#"{"user_id": "seven"}"#,
        None,
    )
    .await;
    assert!(result.is_err());

    let report = loader.load("clicks").await.unwrap();
    assert_eq!(report.records_loaded, 0);
    assert!(warehouse.ledger().is_empty());
}
