//! Registry client abstractions for chart and archive sources.
//!
//! Chart registries (classic index-file registries and tag-listing archive
//! registries alike) and content-addressed archive registries are external
//! collaborators; the core consumes them through these traits. An extraction
//! returns the path of the extracted content plus an [`ExtractionCleanup`]
//! guard that removes the per-request directory when dropped, so cleanup runs
//! on every exit path including cancellation.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::models::ChartDetail;

/// Deletes a per-request extraction directory when dropped.
pub struct ExtractionCleanup {
    path: Option<PathBuf>,
}

impl ExtractionCleanup {
    /// Guard that removes `path` recursively on drop.
    #[must_use]
    pub fn removing(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// Guard that leaves the extraction in place (registry-managed caches).
    #[must_use]
    pub fn noop() -> Self {
        Self { path: None }
    }
}

impl Drop for ExtractionCleanup {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = std::fs::remove_dir_all(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        target: "repogen::registry",
                        "failed to remove extraction directory {}: {}",
                        path.display(),
                        err
                    );
                }
            }
        }
    }
}

/// Client for a chart registry.
#[async_trait]
pub trait ChartRegistryClient: Send + Sync {
    /// Registry URL this client talks to.
    fn url(&self) -> &str;

    /// All published versions of a chart, newest ordering not guaranteed.
    /// Tag list for archive-backed registries, index file for classic ones.
    async fn list_versions(&self, chart: &str, bypass_cache: bool) -> Result<Vec<String>>;

    /// Extracts a chart at an exact version into a fresh per-request
    /// directory, enforcing `max_extracted_bytes` when set.
    async fn extract_chart(
        &self,
        chart: &str,
        version: &str,
        max_extracted_bytes: Option<u64>,
    ) -> Result<(PathBuf, ExtractionCleanup)>;

    /// Drops any registry-side cache for a chart version.
    async fn clean_chart_cache(&self, chart: &str, version: &str) -> Result<()>;

    /// Chart descriptor fields at an exact version.
    async fn chart_details(&self, chart: &str, version: &str) -> Result<ChartDetail>;
}

/// Client for a content-addressed archive registry.
#[async_trait]
pub trait ArchiveRegistryClient: Send + Sync {
    /// Registry URL this client talks to.
    fn url(&self) -> &str;

    /// Canonicalizes a reference (tag or digest) to its digest form.
    async fn resolve_digest(&self, reference: &str, bypass_cache: bool) -> Result<String>;

    /// Tags published under the repository.
    async fn get_tags(&self, bypass_cache: bool) -> Result<Vec<String>>;

    /// Extracts the archive for a digest into a fresh per-request directory,
    /// enforcing `max_extracted_bytes` when set.
    async fn extract(
        &self,
        digest: &str,
        max_extracted_bytes: Option<u64>,
    ) -> Result<(PathBuf, ExtractionCleanup)>;

    /// Drops any registry-side cache for a digest.
    async fn clean_cache(&self, digest: &str) -> Result<()>;

    /// Annotations attached to the manifest for a digest.
    async fn digest_metadata(&self, digest: &str) -> Result<HashMap<String, String>>;
}

/// Produces a chart registry client for a registry URL.
pub type ChartClientFactory = Arc<dyn Fn(&str) -> Arc<dyn ChartRegistryClient> + Send + Sync>;

/// Produces an archive registry client for a registry URL.
pub type ArchiveClientFactory = Arc<dyn Fn(&str) -> Arc<dyn ArchiveRegistryClient> + Send + Sync>;
