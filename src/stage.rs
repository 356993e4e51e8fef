//! Blob stage between the stream and the warehouse.
//!
//! Staged blobs are written once, then their stored size is read back and
//! compared with the local size. Object stores may serve stale metadata right
//! after a write, so verification is retried with a pause. When it never
//! matches the stage logs a warning and still returns the URL, unless strict
//! verification is configured.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StageConfig;
use crate::emit;
use crate::error::{
    CleanupSnafu, ForeignUrlSnafu, ReadSnafu, StageError, StorageError, UploadSnafu,
    VerificationSnafu,
};
use crate::metrics::events::{BlobStaged, BlobVerificationFailed};
use crate::storage::StorageProvider;

/// Minimal object store surface the stage needs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// URL that keys are appended to, without a trailing slash.
    fn base_url(&self) -> &str;

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Stored size, `None` when the object is not visible.
    async fn size(&self, key: &str) -> Result<Option<u64>, StorageError>;

    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError>;
}

#[async_trait]
impl BlobStore for StorageProvider {
    fn base_url(&self) -> &str {
        StorageProvider::base_url(self)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        StorageProvider::put(self, key, data).await
    }

    async fn size(&self, key: &str) -> Result<Option<u64>, StorageError> {
        StorageProvider::size(self, key).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        StorageProvider::get(self, key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        StorageProvider::delete_prefix(self, prefix).await
    }
}

/// Retry and verification behaviour of [`BlobStage::put`].
#[derive(Debug, Clone)]
pub struct StagePolicy {
    pub upload_attempts: usize,
    pub verify_attempts: usize,
    pub retry_delay: Duration,
    pub strict_verification: bool,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            upload_attempts: 3,
            verify_attempts: 3,
            retry_delay: Duration::from_secs(5),
            strict_verification: false,
        }
    }
}

impl From<&StageConfig> for StagePolicy {
    fn from(config: &StageConfig) -> Self {
        Self {
            upload_attempts: config.upload_attempts,
            verify_attempts: config.verify_attempts,
            retry_delay: config.retry_delay(),
            strict_verification: config.strict_verification,
        }
    }
}

/// Write-once blob staging area.
#[derive(Clone)]
pub struct BlobStage {
    store: Arc<dyn BlobStore>,
    policy: StagePolicy,
}

impl std::fmt::Debug for BlobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlobStage<{}>", self.store.base_url())
    }
}

impl BlobStage {
    pub fn new(store: Arc<dyn BlobStore>, policy: StagePolicy) -> Self {
        Self { store, policy }
    }

    /// Open the stage described by `config`.
    pub async fn from_config(config: &StageConfig) -> Result<Self, StorageError> {
        let storage =
            StorageProvider::for_url_with_options(&config.url, config.storage_options.clone())
                .await?;
        Ok(Self::new(Arc::new(storage), StagePolicy::from(config)))
    }

    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    /// URL of the blob stored under `key`.
    pub fn url_for(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.store.base_url().trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    /// Key of a URL previously returned by [`BlobStage::url_for`].
    pub fn key_for(&self, url: &str) -> Result<String, StageError> {
        let base = self.store.base_url().trim_end_matches('/');
        url.strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
            .context(ForeignUrlSnafu { url, stage: base })
    }

    /// Upload `data` under `key`, verify its stored size, and return its URL.
    pub async fn put(&self, key: &str, data: Bytes) -> Result<String, StageError> {
        let expected = data.len() as u64;
        self.upload(key, data).await?;
        emit!(BlobStaged { bytes: expected });

        let url = self.url_for(key);
        let mut found = None;
        for attempt in 1..=self.policy.verify_attempts {
            match self.store.size(key).await {
                Ok(Some(size)) if size == expected => {
                    debug!(%url, size, attempt, "Verified staged blob");
                    return Ok(url);
                }
                Ok(size) => {
                    found = size;
                    warn!(%url, expected, found = ?size, attempt, "Staged blob size mismatch");
                }
                Err(e) => {
                    warn!(%url, attempt, error = %e, "Could not read staged blob metadata");
                }
            }
            if attempt < self.policy.verify_attempts {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }

        emit!(BlobVerificationFailed);
        ensure!(
            !self.policy.strict_verification,
            VerificationSnafu {
                key,
                expected,
                found
            }
        );
        warn!(
            %url,
            expected,
            attempts = self.policy.verify_attempts,
            "Staged blob size never verified; keeping it in the load"
        );
        Ok(url)
    }

    async fn upload(&self, key: &str, data: Bytes) -> Result<(), StageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.put(key, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.policy.upload_attempts => {
                    warn!(key, attempt, error = %e, "Blob upload failed, retrying");
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
                Err(source) => {
                    return Err(source).context(UploadSnafu {
                        key,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Read a staged blob back by URL.
    pub async fn read(&self, url: &str) -> Result<Bytes, StageError> {
        let key = self.key_for(url)?;
        self.store
            .get(&key)
            .await
            .context(ReadSnafu { key: key.clone() })
    }

    /// Delete everything staged under `prefix`.
    pub async fn cleanup(&self, prefix: &str) -> Result<usize, StageError> {
        self.store
            .delete_prefix(prefix)
            .await
            .context(CleanupSnafu { prefix })
    }
}

/// Stage key layout: `floe/<cluster>/<database>/<table>/<YYYYMMDD>/load-<id>/`.
#[derive(Debug, Clone)]
pub struct StageLayout {
    pub cluster: String,
    pub database: String,
}

impl StageLayout {
    pub fn new(cluster: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            database: database.into(),
        }
    }

    /// Prefix holding every load of `table` started on `date`.
    pub fn day_prefix(&self, table: &str, date: NaiveDate) -> String {
        format!(
            "floe/{}/{}/{table}/{}/",
            self.cluster,
            self.database,
            date.format("%Y%m%d")
        )
    }

    /// Fresh prefix for one load cycle.
    pub fn load_prefix(&self, table: &str, at: DateTime<Utc>) -> String {
        let suffix: u16 = rand::random();
        format!(
            "{}load-{}-{suffix:04x}/",
            self.day_prefix(table, at.date_naive()),
            at.timestamp_millis()
        )
    }
}

/// Key of the staged blob for one shard slice.
pub fn blob_key(prefix: &str, shard_id: &str, slice: usize) -> String {
    format!("{prefix}{shard_id}-{slice}.json.gz")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn local_stage(dir: &TempDir, policy: StagePolicy) -> BlobStage {
        let storage =
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), Default::default())
                .await
                .unwrap();
        BlobStage::new(Arc::new(storage), policy)
    }

    fn fast_policy() -> StagePolicy {
        StagePolicy {
            retry_delay: Duration::from_millis(1),
            ..StagePolicy::default()
        }
    }

    /// Store whose metadata always lags behind writes.
    struct StaleStore {
        inner: StorageProvider,
        size_checks: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for StaleStore {
        fn base_url(&self) -> &str {
            self.inner.base_url()
        }
        async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
            self.inner.put(key, data).await
        }
        async fn size(&self, _key: &str) -> Result<Option<u64>, StorageError> {
            self.size_checks.fetch_add(1, Ordering::SeqCst);
            Ok(Some(0))
        }
        async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
            self.inner.get(key).await
        }
        async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
            self.inner.delete_prefix(prefix).await
        }
    }

    async fn stale_store(dir: &TempDir) -> Arc<StaleStore> {
        let inner =
            StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), Default::default())
                .await
                .unwrap();
        Arc::new(StaleStore {
            inner,
            size_checks: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_put_returns_url_and_data_reads_back() {
        let dir = TempDir::new().unwrap();
        let stage = local_stage(&dir, fast_policy()).await;

        let url = stage
            .put("floe/a/b.json.gz", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(
            url,
            format!("file://{}/floe/a/b.json.gz", dir.path().display())
        );
        assert_eq!(stage.read(&url).await.unwrap(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_verification_failure_still_returns_url() {
        let dir = TempDir::new().unwrap();
        let store = stale_store(&dir).await;
        let stage = BlobStage::new(store.clone(), fast_policy());

        let url = stage
            .put("x.json.gz", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert!(url.ends_with("/x.json.gz"));
        assert_eq!(store.size_checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_strict_verification_fails() {
        let dir = TempDir::new().unwrap();
        let stage = BlobStage::new(
            stale_store(&dir).await,
            StagePolicy {
                strict_verification: true,
                ..fast_policy()
            },
        );

        let err = stage
            .put("x.json.gz", Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Verification {
                expected: 3,
                found: Some(0),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_foreign_url_is_rejected() {
        let dir = TempDir::new().unwrap();
        let stage = local_stage(&dir, fast_policy()).await;
        assert!(matches!(
            stage.read("s3://elsewhere/key").await,
            Err(StageError::ForeignUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_cleanup_removes_day_prefix() {
        let dir = TempDir::new().unwrap();
        let stage = local_stage(&dir, fast_policy()).await;
        let layout = StageLayout::new("analytics", "events");
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let prefix = layout.day_prefix("clicks", day);

        stage
            .put(&blob_key(&prefix, "shard-1", 0), Bytes::from_static(b"a"))
            .await
            .unwrap();
        stage
            .put(&blob_key(&prefix, "shard-1", 1), Bytes::from_static(b"b"))
            .await
            .unwrap();

        assert_eq!(stage.cleanup(&prefix).await.unwrap(), 2);
    }

    #[test]
    fn test_layout() {
        let layout = StageLayout::new("analytics", "events");
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let prefix = layout.load_prefix("clicks", at);
        assert!(prefix.starts_with("floe/analytics/events/clicks/20240301/load-1709287200000-"));
        assert!(prefix.ends_with('/'));
        assert_eq!(
            blob_key(&prefix, "shardId-000000000001", 3),
            format!("{prefix}shardId-000000000001-3.json.gz")
        );
    }
}
