//! Object storage access for the blob stage.
//!
//! Wraps an `object_store` backend (S3 or the local filesystem) rooted at a
//! configured URL. All paths passed in are relative to that root.

mod local;
mod s3;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::debug;

use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};

pub use local::LocalConfig;
pub use s3::S3Config;

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+?))?/?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+?))?/?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+?))?/?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+?))?/?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_PATH: &str = r"^(?P<path>[^:]+)$";

static S3_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [S3_PATH, S3_VIRTUAL, S3_ENDPOINT_URL, S3_URL]
        .into_iter()
        .map(|pattern| Regex::new(pattern).expect("S3 URL pattern is valid"))
        .collect()
});

static LOCAL_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [FILE_URI, FILE_PATH]
        .into_iter()
        .map(|pattern| Regex::new(pattern).expect("local path pattern is valid"))
        .collect()
});

/// Backend configuration parsed from a stage URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a stage URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if let Some(caps) = S3_MATCHERS.iter().find_map(|r| r.captures(url)) {
            return Ok(BackendConfig::S3(S3Config::from_captures(&caps)));
        }
        if let Some(caps) = LOCAL_MATCHERS.iter().find_map(|r| r.captures(url)) {
            let path = caps.name("path").map(|m| m.as_str()).unwrap_or("/");
            return Ok(BackendConfig::Local(LocalConfig {
                path: path.trim_end_matches('/').to_string(),
            }));
        }

        InvalidUrlSnafu { url }.fail()
    }

    /// Key prefix applied to every relative path.
    fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

/// Storage provider over one backend.
#[derive(Clone)]
pub struct StorageProvider {
    config: BackendConfig,
    object_store: Arc<dyn ObjectStore>,
    /// URL that blob keys are appended to, without a trailing slash.
    base_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.base_url)
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with backend options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Prefix `path` with the configured key.
    fn qualify(&self, path: &str) -> Path {
        let relative = Path::from(path);
        match self.config.key() {
            Some(prefix) => prefix.parts().chain(relative.parts()).collect(),
            None => relative,
        }
    }

    pub async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let location = self.qualify(path);
        let start = Instant::now();
        self.object_store
            .put(&location, PutPayload::from(bytes))
            .await
            .context(ObjectStoreSnafu)?;
        debug!(%location, elapsed_ms = start.elapsed().as_millis() as u64, "Put object");
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let location = self.qualify(path);
        self.object_store
            .get(&location)
            .await
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }

    /// Stored size of `path`, or `None` if it does not exist (yet).
    pub async fn size(&self, path: &str) -> Result<Option<u64>, StorageError> {
        match self.object_store.head(&self.qualify(path)).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(source) => Err(StorageError::ObjectStore { source }),
        }
    }

    /// Delete every object under `prefix`. Returns how many were removed.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let location = self.qualify(prefix);
        let objects: Vec<Path> = self
            .object_store
            .list(Some(&location))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await
            .context(ObjectStoreSnafu)?;

        for object in &objects {
            self.object_store
                .delete(object)
                .await
                .context(ObjectStoreSnafu)?;
        }
        debug!(%location, deleted = objects.len(), "Deleted objects under prefix");
        Ok(objects.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_s3_url_with_prefix() {
        let config = BackendConfig::parse_url("s3://staging-bucket/floe/loads/").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "staging-bucket");
                assert_eq!(s3.key.as_ref().map(|k| k.to_string()).as_deref(), Some("floe/loads"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_local_paths() {
        assert_eq!(
            BackendConfig::parse_url("/var/lib/floe/stage/").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/var/lib/floe/stage".into()
            })
        );
        assert_eq!(
            BackendConfig::parse_url("file:///tmp/stage").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/tmp/stage".into()
            })
        );
    }

    #[test]
    fn test_parse_relative_path() {
        assert_eq!(
            BackendConfig::parse_url("stage/").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "stage".into()
            })
        );
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(matches!(
            BackendConfig::parse_url("gs://bucket/key"),
            Err(StorageError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_put_get_size_delete() {
        let dir = TempDir::new().unwrap();
        let url = dir.path().to_str().unwrap();
        let storage = StorageProvider::for_url_with_options(url, HashMap::new())
            .await
            .unwrap();

        assert_eq!(storage.base_url(), format!("file://{url}"));
        assert_eq!(storage.size("a/b.json.gz").await.unwrap(), None);

        storage
            .put("a/b.json.gz", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        storage
            .put("a/c.json.gz", Bytes::from_static(b"hi"))
            .await
            .unwrap();

        assert_eq!(storage.size("a/b.json.gz").await.unwrap(), Some(5));
        assert_eq!(
            storage.get("a/b.json.gz").await.unwrap(),
            Bytes::from_static(b"hello")
        );

        assert_eq!(storage.delete_prefix("a").await.unwrap(), 2);
        assert_eq!(storage.size("a/c.json.gz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage =
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
                .await
                .unwrap();
        let err = storage.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
