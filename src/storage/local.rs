//! Local filesystem storage backend.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use snafu::prelude::*;
use std::sync::Arc;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// Local stage directory. Relative paths are resolved against the working
/// directory so staged URLs stay valid after a `cd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

impl StorageProvider {
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        let root = std::path::absolute(&config.path).context(IoSnafu)?;
        tokio::fs::create_dir_all(&root).await.context(IoSnafu)?;

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(&root).context(ObjectStoreSnafu)?);
        let base_url = format!("file://{}", root.display());

        Ok(Self {
            config: BackendConfig::Local(LocalConfig {
                path: root.display().to_string(),
            }),
            object_store,
            base_url,
        })
    }
}
