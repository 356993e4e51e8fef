//! floe: exactly-once-per-range loading from sharded streams into a columnar warehouse.
//!
//! Records are read shard by shard from a stream broker, staged as gzip
//! blobs, and bulk loaded through a manifest inside one warehouse
//! transaction that also appends to a checkpoint ledger. The ledger is the
//! only durable state: it drives resumption and rejects ranges that were
//! already loaded.
//!
//! # Example
//!
//! ```ignore
//! use floe::{Config, app};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), floe::error::AppError> {
//!     let config = Config::from_file("floe.yaml")?;
//!     let loader = app::loader(&config).await?;
//!     let report = loader.load("clicks").await?;
//!     println!("Loaded {} records", report.records_loaded);
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod broker;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod schema;
pub mod sequence;
pub mod signal;
pub mod stage;
pub mod storage;
pub mod warehouse;

// Re-export main types
pub use broker::{Broker, BrokerRef};
pub use config::Config;
pub use loader::{LoadOutcome, LoadReport, Loader};
pub use sequence::{SequenceNumber, SequenceRange};
