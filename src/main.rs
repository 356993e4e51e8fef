//! floe: load sharded stream records into a columnar warehouse, exactly once per range.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use snafu::prelude::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use floe::checkpoint::{audit, ledger_schema};
use floe::config::Config;
use floe::error::{
    AddressParseSnafu, AppError, AuditFailedSnafu, ConfigSnafu, LoadSnafu, MetricsSnafu,
    MissingSchemaSnafu, RenderSnafu,
};
use floe::warehouse::Warehouse;
use floe::{Broker, app, metrics, signal};

/// Sharded stream to warehouse loader.
#[derive(Parser, Debug)]
#[command(name = "floe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one load cycle for a table.
    Load {
        #[arg(long)]
        table: String,
    },
    /// Poll the configured tables until interrupted.
    Run {
        /// Tables to load instead of `loader.tables`.
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// Validate a JSON record and write it to the table's stream.
    Write {
        #[arg(long)]
        table: String,
        #[arg(long)]
        data: String,
        #[arg(long)]
        partition_key: Option<String>,
    },
    /// Create the checkpoint ledger table.
    CreateLedger,
    /// Create a table from its configured schema.
    CreateTable {
        #[arg(long)]
        table: String,
    },
    /// Create the Kinesis stream feeding a table.
    CreateStream {
        #[arg(long)]
        table: String,
        #[arg(long, default_value_t = 1)]
        shards: u32,
    },
    /// Split every open shard of a table's stream in two.
    SplitShards {
        #[arg(long)]
        table: String,
    },
    /// Check a table's ledger for overlapping or regressing ranges.
    AuditLedger {
        #[arg(long)]
        table: String,
    },
    /// Delete one day of staged blobs for a table.
    Cleanup {
        #[arg(long)]
        table: String,
        /// Day to delete, as YYYY-MM-DD.
        #[arg(long)]
        date: NaiveDate,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), AppError> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if config.metrics.enabled {
        let addr: SocketAddr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    match args.command {
        Command::Load { table } => load(&config, &table).await,
        Command::Run { tables } => {
            let tables = if tables.is_empty() {
                config.loader.tables.clone()
            } else {
                tables
            };
            if tables.is_empty() {
                warn!("No tables to load; set loader.tables or pass --table");
                return Ok(());
            }
            let loader = app::loader(&config).await?;
            let stats = loader.run(&tables, signal::shutdown_token()).await;
            info!(
                cycles = stats.cycles,
                failed = stats.failed_cycles,
                records = stats.records_loaded,
                "Loader finished"
            );
            Ok(())
        }
        Command::Write {
            table,
            data,
            partition_key,
        } => {
            let broker = app::broker(&config).await;
            app::write_record(
                broker.as_ref(),
                &config,
                &table,
                &data,
                partition_key.as_deref(),
            )
            .await?;
            info!(table = %table, "Record written");
            Ok(())
        }
        Command::CreateLedger => {
            let warehouse = app::warehouse(&config).await?;
            let ledger = &config.warehouse.ledger_table;
            warehouse.execute_ddl(&ledger_schema().ddl(ledger)).await?;
            info!(table = %ledger, "Created ledger table");
            Ok(())
        }
        Command::CreateTable { table } => {
            let schema = config
                .schemas
                .get(&table)
                .context(MissingSchemaSnafu { table: &table })?;
            let warehouse = app::warehouse(&config).await?;
            warehouse.execute_ddl(&schema.ddl(&table)).await?;
            info!(table = %table, "Created table");
            Ok(())
        }
        Command::CreateStream { table, shards } => {
            let broker = app::kinesis(&config, "create-stream").await?;
            let stream = broker.create_stream(&table, shards).await?;
            info!(stream = %stream, shards, "Created stream");
            Ok(())
        }
        Command::SplitShards { table } => {
            let broker = app::kinesis(&config, "split-shards").await?;
            let stream = broker.stream_name(&table)?;
            let split = broker.split_shards(&stream).await?;
            info!(stream = %stream, split, "Split shards");
            Ok(())
        }
        Command::AuditLedger { table } => {
            let broker = app::broker(&config).await;
            let stream = broker.stream_name(&table)?;
            let warehouse = app::warehouse(&config).await?;
            let rows = warehouse.checkpoints(&table, &stream, &[]).await?;
            let violations = audit(&rows);
            print_json(&violations)?;
            info!(rows = rows.len(), violations = violations.len(), "Audited ledger");
            ensure!(
                violations.is_empty(),
                AuditFailedSnafu {
                    count: violations.len()
                }
            );
            Ok(())
        }
        Command::Cleanup { table, date } => {
            let stage = app::stage(&config).await?;
            let deleted = app::cleanup(&stage, &config, &table, date).await?;
            info!(table = %table, %date, deleted, "Deleted staged blobs");
            Ok(())
        }
    }
}

async fn load(config: &Config, table: &str) -> Result<(), AppError> {
    let loader = app::loader(config).await?;
    match loader.load(table).await {
        Ok(report) => print_json(&report),
        Err(e) => {
            if let Some(context) = e.context() {
                match serde_json::to_string_pretty(context) {
                    Ok(json) => error!("Load context:\n{json}"),
                    Err(render) => warn!(error = %render, "Could not render load context"),
                }
            }
            Err(e).context(LoadSnafu)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(value).context(RenderSnafu)?;
    println!("{json}");
    Ok(())
}
