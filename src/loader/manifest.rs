//! Load manifest.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::broker::ShardReadResult;
use crate::error::{ManifestJsonSnafu, StageError};
use crate::stage::BlobStage;

/// Key suffix of the manifest inside a load prefix.
pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub mandatory: bool,
}

/// The set of staged blobs loaded as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// One mandatory entry per blob of every shard that read records.
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a ShardReadResult>) -> Self {
        let entries = results
            .into_iter()
            .filter(|result| result.records > 0)
            .flat_map(|result| &result.staged_blob_urls)
            .map(|url| ManifestEntry {
                url: url.clone(),
                mandatory: true,
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn urls(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.url.clone()).collect()
    }

    /// Upload the manifest under `prefix` and return its URL.
    pub async fn upload(&self, stage: &BlobStage, prefix: &str) -> Result<String, StageError> {
        let body = serde_json::to_vec(self).context(ManifestJsonSnafu)?;
        stage
            .put(&format!("{prefix}{MANIFEST_NAME}"), Bytes::from(body))
            .await
    }
}
