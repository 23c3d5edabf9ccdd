//! Cache layer: typed operations over a pluggable key-value store.
//!
//! The store itself ([`CacheStore`]) is a collaborator: anything that can
//! get/set/delete byte values under string keys, with a
//! [`CacheStoreError::Miss`] sentinel distinguishing absence from backend
//! failure. On top of it, [`RenderCache`] exposes the typed operations the
//! core needs: rendered manifests, resolved revisions, per-commit metadata,
//! per-path directory listings, file bundles, and chart detail.
//!
//! # Failure memoization
//!
//! Rendered-manifest entries double as failure records: the same key holds
//! either a successful [`ManifestResponse`] or the failure counters
//! ([`CachedManifestEntry::first_failure_at`],
//! [`CachedManifestEntry::consecutive_failures`],
//! [`CachedManifestEntry::most_recent_error`],
//! [`CachedManifestEntry::cached_response_count`]); writing one form
//! overwrites the other. The backoff *policy* (when to serve the memoized
//! error, when to let a real render through again) lives in the
//! orchestrator; this module only stores and retrieves the records.
//!
//! # Error policy
//!
//! Read failures from the backend are logged and treated as misses by the
//! `lookup_*` helpers; write failures are logged as warnings by callers. The
//! raw `get_/set_` manifest operations preserve the error because the
//! orchestrator must distinguish a miss from a broken store when updating
//! failure counters.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::models::{AppList, ChartDetail, DirectoryListing, FileBundle, ManifestResponse, RevisionMetadata};

pub mod key;
pub use key::ManifestCacheKey;

/// Errors surfaced by a cache store.
#[derive(Debug, Error)]
pub enum CacheStoreError {
    /// The key is absent. Not a failure.
    #[error("cache: key is missing")]
    Miss,
    /// The backend failed.
    #[error("cache store failure: {0}")]
    Backend(String),
}

impl CacheStoreError {
    /// Whether this error is the miss sentinel.
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// Pluggable key-value store interface.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetches the value for a key, [`CacheStoreError::Miss`] when absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheStoreError>;

    /// Stores a value, optionally with a time-to-live.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheStoreError>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheStoreError>;
}

/// In-process store used by tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl InMemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheStoreError> {
        match self.entries.get(key) {
            Some(entry) => {
                let (value, deadline) = entry.value();
                if deadline.is_some_and(|d| Instant::now() > d) {
                    drop(entry);
                    self.entries.remove(key);
                    return Err(CacheStoreError::Miss);
                }
                Ok(value.clone())
            }
            None => Err(CacheStoreError::Miss),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), (value, deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheStoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One rendered-manifest cache record: either a successful response or a
/// failure record with its counters. The two forms share a key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CachedManifestEntry {
    /// The successful response, absent in failure records.
    pub response: Option<ManifestResponse>,
    /// Unix seconds of the first failure in the current streak. Zero when
    /// no failure has been recorded.
    pub first_failure_at: i64,
    /// Length of the current failure streak.
    pub consecutive_failures: u32,
    /// Message of the most recent failure.
    pub most_recent_error: String,
    /// How many times the memoized error has been served.
    pub cached_response_count: u32,
}

impl CachedManifestEntry {
    /// A fresh success record; all failure fields reset.
    #[must_use]
    pub fn success(response: ManifestResponse) -> Self {
        Self { response: Some(response), ..Default::default() }
    }

    /// Whether this record carries failure state.
    #[must_use]
    pub fn is_failure_record(&self) -> bool {
        self.first_failure_at > 0
    }
}

/// Typed cache operations over an arbitrary [`CacheStore`].
#[derive(Clone)]
pub struct RenderCache {
    store: Arc<dyn CacheStore>,
    revision_ttl: Option<Duration>,
    manifest_ttl: Option<Duration>,
}

impl RenderCache {
    /// Wraps a store with the configured TTLs (zero seconds means no TTL).
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, revision_ttl_secs: u64, manifest_ttl_secs: u64) -> Self {
        let ttl = |secs: u64| if secs == 0 { None } else { Some(Duration::from_secs(secs)) };
        Self { store, revision_ttl: ttl(revision_ttl_secs), manifest_ttl: ttl(manifest_ttl_secs) }
    }

    async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<T, CacheStoreError> {
        let bytes = self.store.get(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| CacheStoreError::Backend(format!("corrupt cache entry at {key}: {err}")))
    }

    async fn set_typed<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheStoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|err| CacheStoreError::Backend(format!("serializing cache entry: {err}")))?;
        self.store.set(key, bytes, ttl).await
    }

    /// Read-as-miss helper for operations where a broken store should just
    /// cost a recomputation.
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get_typed(key).await {
            Ok(value) => Some(value),
            Err(CacheStoreError::Miss) => None,
            Err(err) => {
                tracing::warn!(target: "repogen::cache", "cache get error at {key}: {err}");
                None
            }
        }
    }

    /// Write helper for operations where a broken store is only worth a
    /// warning.
    async fn store_quiet<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        if let Err(err) = self.set_typed(key, value, ttl).await {
            tracing::warn!(target: "repogen::cache", "cache set error at {key}: {err}");
        }
    }

    // Rendered manifests. Errors are preserved so the orchestrator can apply
    // its negative-entry policy.

    /// Fetches the rendered-manifest record for a key.
    pub async fn get_manifests(&self, key: &ManifestCacheKey) -> Result<CachedManifestEntry, CacheStoreError> {
        self.get_typed(&key.store_key()).await
    }

    /// Stores a rendered-manifest record.
    pub async fn set_manifests(
        &self,
        key: &ManifestCacheKey,
        entry: &CachedManifestEntry,
    ) -> Result<(), CacheStoreError> {
        self.set_typed(&key.store_key(), entry, self.manifest_ttl).await
    }

    /// Deletes the rendered-manifest record for a key.
    pub async fn delete_manifests(&self, key: &ManifestCacheKey) -> Result<(), CacheStoreError> {
        self.store.delete(&key.store_key()).await
    }

    /// Relabels a rendered entry from `old_key` to `new_key` without
    /// re-rendering. Returns whether an entry was moved. Only callers that
    /// have proven the underlying paths did not change between the two
    /// revisions may use this.
    pub async fn move_manifests(
        &self,
        old_key: &ManifestCacheKey,
        new_key: &ManifestCacheKey,
    ) -> Result<bool, CacheStoreError> {
        let bytes = match self.store.get(&old_key.store_key()).await {
            Ok(bytes) => bytes,
            Err(CacheStoreError::Miss) => return Ok(false),
            Err(err) => return Err(err),
        };
        self.store.set(&new_key.store_key(), bytes, self.manifest_ttl).await?;
        self.store.delete(&old_key.store_key()).await?;
        Ok(true)
    }

    // Resolved revisions.

    /// Cached resolution of an ambiguous revision, if present.
    pub async fn get_resolved_revision(&self, url: &str, ambiguous: &str) -> Option<String> {
        self.lookup(&format!("rev|{url}|{ambiguous}")).await
    }

    /// Caches the resolution of an ambiguous revision.
    pub async fn set_resolved_revision(&self, url: &str, ambiguous: &str, resolved: &str) {
        self.store_quiet(&format!("rev|{url}|{ambiguous}"), &resolved, self.revision_ttl).await;
    }

    // Per-revision payloads for the supplemental operations.

    /// Cached application roster at a revision.
    pub async fn get_app_list(&self, url: &str, revision: &str) -> Option<AppList> {
        self.lookup(&format!("apps|{url}|{revision}")).await
    }

    /// Caches the application roster at a revision.
    pub async fn set_app_list(&self, url: &str, revision: &str, apps: &AppList) {
        self.store_quiet(&format!("apps|{url}|{revision}"), apps, self.manifest_ttl).await;
    }

    /// Cached directory listing at a revision.
    pub async fn get_directory_listing(
        &self,
        url: &str,
        revision: &str,
        include_hidden: bool,
    ) -> Option<DirectoryListing> {
        self.lookup(&format!("dirs|{url}|{revision}|{include_hidden}")).await
    }

    /// Caches a directory listing at a revision.
    pub async fn set_directory_listing(
        &self,
        url: &str,
        revision: &str,
        include_hidden: bool,
        listing: &DirectoryListing,
    ) {
        self.store_quiet(&format!("dirs|{url}|{revision}|{include_hidden}"), listing, self.manifest_ttl)
            .await;
    }

    /// Cached file bundle for a pattern at a revision.
    pub async fn get_file_bundle(&self, url: &str, revision: &str, pattern: &str) -> Option<FileBundle> {
        self.lookup(&format!("files|{url}|{revision}|{pattern}")).await
    }

    /// Caches a file bundle for a pattern at a revision.
    pub async fn set_file_bundle(&self, url: &str, revision: &str, pattern: &str, bundle: &FileBundle) {
        self.store_quiet(&format!("files|{url}|{revision}|{pattern}"), bundle, self.manifest_ttl).await;
    }

    /// Cached commit metadata at a revision.
    pub async fn get_revision_metadata(&self, url: &str, revision: &str) -> Option<RevisionMetadata> {
        self.lookup(&format!("meta|{url}|{revision}")).await
    }

    /// Caches commit metadata at a revision.
    pub async fn set_revision_metadata(&self, url: &str, revision: &str, metadata: &RevisionMetadata) {
        self.store_quiet(&format!("meta|{url}|{revision}"), metadata, self.manifest_ttl).await;
    }

    /// Cached chart descriptor detail at an exact version.
    pub async fn get_chart_detail(&self, url: &str, chart: &str, version: &str) -> Option<ChartDetail> {
        self.lookup(&format!("chart|{url}|{chart}|{version}")).await
    }

    /// Caches chart descriptor detail at an exact version.
    pub async fn set_chart_detail(&self, url: &str, chart: &str, version: &str, detail: &ChartDetail) {
        self.store_quiet(&format!("chart|{url}|{chart}|{version}"), detail, self.manifest_ttl).await;
    }
}
