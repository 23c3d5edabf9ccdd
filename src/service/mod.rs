//! Manifest generation orchestrator.
//!
//! [`GenerationService`] is the top-level entry point. One request flows
//! through: ref-only pre-check, revision resolution, cross-resolution (so
//! the CrossRef map is part of the cache key), cache probe, parallelism
//! admission, source acquisition under the working-tree lock, a double cache
//! check after the lock is held, optional commit-signature verification,
//! rendering, and the cache write.
//!
//! The orchestrator is the only layer that touches the negative-entry cache:
//! render failures feed the memoized-failure counters, successful renders
//! clear them, and while a key is paused the memoized error is served with
//! the `Manifest generation error (cached)` prefix instead of rendering.
//!
//! For the plugin strategy the render runs as a background task wired to the
//! orchestrator through channels; the working-tree lock is released the
//! moment the tar upload concludes, before the plugin's reply is awaited.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use walkdir::WalkDir;

use crate::acquire::{self, paths::RandomizedTempPaths};
use crate::cache::{CacheStore, CachedManifestEntry, ManifestCacheKey, RenderCache};
use crate::config::GenerationConfig;
use crate::constants::CACHED_MANIFEST_ERROR_PREFIX;
use crate::core::RenderError;
use crate::git::{normalize_git_url, GitClient, GitClientFactory};
use crate::lock::{KeyedLocks, TreeLockGuard, WorkingTreeLocks};
use crate::models::{
    AppIdentity, AppList, ChartDetail, DirectoryListing, FileBundle, ManifestResponse, RemoteRefs,
    RevisionMetadata,
};
use crate::plugin::{application_root_path, generate_manifests_via_plugin, PluginClient, PluginRegistry};
use crate::registry::{ArchiveClientFactory, ChartClientFactory, ExtractionCleanup};
use crate::render::{
    self, directory::DirectoryContext, overlay::render_overlay, script::render_script,
    template::render_template, template::TemplateContext, Env, RenderEngines, RenderStrategy,
};
use crate::resolver::{
    resolve_referenced_sources, CrossResolution, RefRevisionResolver, RefTarget, RevisionResolver,
};
use crate::source::{overrides::merge_source_overrides, SourceKind, SourceRef};

/// Supplies short-lived credential environment snapshots for plugins that
/// request repository credentials.
#[async_trait]
pub trait RepoCredentialSource: Send + Sync {
    /// Environment entries granting access to `repo_url`.
    async fn environ(&self, repo_url: &str) -> Result<Vec<(String, String)>>;
}

/// One manifest generation request.
#[derive(Clone, Default)]
pub struct ManifestRequest {
    /// The source to render.
    pub source: SourceRef,
    /// Requested revision; empty means the source's target revision.
    pub revision: String,
    /// Application identity.
    pub app: AppIdentity,
    /// Declared `$token` reference targets for multi-source requests.
    pub ref_sources: HashMap<String, RefTarget>,
    /// Whether the application declares multiple sources.
    pub has_multiple_sources: bool,
    /// Skip the manifest cache entirely.
    pub no_cache: bool,
    /// Skip only the resolved-revision cache.
    pub no_revision_cache: bool,
    /// Verify the commit signature before rendering.
    pub verify_signature: bool,
    /// Kubernetes version advertised to engines.
    pub kube_version: String,
    /// API versions advertised to engines.
    pub api_versions: Vec<String>,
    /// Value of the manifest-generate-paths annotation, if present.
    pub manifest_generate_paths: Option<String>,
}

/// Request to relabel cached manifests from one revision to another when no
/// watched path changed between them.
#[derive(Clone, Default)]
pub struct UpdateRevisionRequest {
    /// The source whose cache entry may be relabeled.
    pub source: SourceRef,
    /// New (possibly ambiguous) revision.
    pub revision: String,
    /// Previously synced resolved revision.
    pub sync_revision: String,
    /// Path globs that affect manifest generation.
    pub paths: Vec<String>,
    /// Application identity.
    pub app: AppIdentity,
    /// Cross-reference revisions participating in the cache key.
    pub cross_refs: BTreeMap<String, String>,
    /// Skip the resolved-revision cache.
    pub no_revision_cache: bool,
}

/// Outcome of [`GenerationService::update_revision_for_paths`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateRevisionResponse {
    /// The newly resolved revision.
    pub revision: String,
    /// Whether any watched path changed (the caller must regenerate).
    pub changes: bool,
}

enum CacheProbe {
    Miss,
    Hit(ManifestResponse),
    NegativeHit(String),
}

/// Everything acquired for one render: tree location plus the guards whose
/// drop releases the lock and deletes per-request extractions.
struct AcquiredTree {
    root: PathBuf,
    app_path: PathBuf,
    commit_sha: String,
    tree_guard: Option<TreeLockGuard>,
    ref_guards: Vec<TreeLockGuard>,
    extraction: Option<ExtractionCleanup>,
}

impl AcquiredTree {
    /// Releases the working-tree lock and the per-request extraction. Used
    /// by the plugin path once the tar upload concludes.
    fn release(&mut self) {
        self.tree_guard.take();
        self.ref_guards.clear();
        self.extraction.take();
    }
}

struct ServiceRefResolver<'a> {
    service: &'a GenerationService,
    no_revision_cache: bool,
}

#[async_trait]
impl RefRevisionResolver for ServiceRefResolver<'_> {
    async fn resolve(&self, target: &RefTarget) -> Result<String> {
        let client = self.service.git_client(&target.repo_url);
        self.service
            .resolver
            .resolve_repo_revision(&*client, &target.target_revision, self.no_revision_cache)
            .await
    }
}

/// The manifest generation service.
pub struct GenerationService {
    config: GenerationConfig,
    cache: RenderCache,
    resolver: RevisionResolver,
    locks: Arc<WorkingTreeLocks>,
    dep_build_locks: KeyedLocks,
    fetch_locks: KeyedLocks,
    repo_paths: Arc<RandomizedTempPaths>,
    parallelism: Option<Arc<Semaphore>>,
    git_factory: GitClientFactory,
    chart_factory: ChartClientFactory,
    archive_factory: ArchiveClientFactory,
    engines: RenderEngines,
    plugins: Option<Arc<dyn PluginRegistry>>,
    credentials: Option<Arc<dyn RepoCredentialSource>>,
    sanitizer: Regex,
    now: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl GenerationService {
    /// Creates a service over the given collaborators.
    pub fn new(
        config: GenerationConfig,
        store: Arc<dyn CacheStore>,
        git_factory: GitClientFactory,
        chart_factory: ChartClientFactory,
        archive_factory: ArchiveClientFactory,
        engines: RenderEngines,
    ) -> Result<Self> {
        let cache = RenderCache::new(
            store,
            config.revision_cache_ttl_secs,
            config.manifest_cache_ttl_secs,
        );
        let parallelism = match config.parallelism_limit {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };
        // Randomized path segments contain no spaces, so everything from the
        // root to the next space or separator is the sensitive part.
        let sanitizer = Regex::new(&format!(
            "{}/[^ /]*",
            regex::escape(&config.root_dir.display().to_string())
        ))
        .context("building path sanitizer")?;

        Ok(Self {
            resolver: RevisionResolver::new(cache.clone()),
            cache,
            locks: Arc::new(WorkingTreeLocks::new()),
            dep_build_locks: KeyedLocks::new(),
            fetch_locks: KeyedLocks::new(),
            repo_paths: Arc::new(RandomizedTempPaths::new(config.root_dir.clone())),
            parallelism,
            git_factory,
            chart_factory,
            archive_factory,
            engines,
            plugins: None,
            credentials: None,
            sanitizer,
            now: Arc::new(|| chrono::Utc::now().timestamp()),
            config,
        })
    }

    /// Wires a plugin registry.
    #[must_use]
    pub fn with_plugins(mut self, plugins: Arc<dyn PluginRegistry>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Wires a repository credential source for plugins that request it.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn RepoCredentialSource>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Replaces the clock. Test hook.
    #[must_use]
    pub fn with_clock(mut self, now: Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.now = now;
        self
    }

    /// Prepares the scratch root and re-associates working trees that
    /// survived a restart with their repositories. Listing permission on
    /// the root is granted only for the duration of the scan.
    pub async fn init(&self) -> Result<()> {
        acquire::prepare_scratch_root(&self.config.root_dir)?;
        let _permit = acquire::ScratchScanPermit::open(&self.config.root_dir)?;

        let mut entries = match tokio::fs::read_dir(&self.config.root_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    target: "repogen::service",
                    "failed to restore working tree paths: {err}"
                );
                return Ok(());
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            match crate::git::remote_origin_url(&path).await {
                Ok(url) => {
                    tracing::debug!(
                        target: "repogen::service",
                        "restored working tree for {url}"
                    );
                    self.repo_paths.add(&normalize_git_url(&url), path);
                }
                Err(_) => {
                    tracing::debug!(
                        target: "repogen::service",
                        "ignoring unrecognized scratch entry {}",
                        path.display()
                    );
                }
            }
        }
        Ok(())
    }

    fn git_client(&self, url: &str) -> Arc<dyn GitClient> {
        let root = self.repo_paths.get_or_create(&normalize_git_url(url));
        (self.git_factory)(url, root)
    }

    fn now(&self) -> i64 {
        (self.now)()
    }

    /// Replaces randomized tree path segments in a message with a
    /// placeholder.
    fn sanitize(&self, message: &str) -> String {
        self.sanitizer
            .replace_all(message, crate::constants::PATH_SANITIZER_PLACEHOLDER)
            .to_string()
    }

    fn sanitize_error(&self, err: anyhow::Error) -> anyhow::Error {
        let message = format!("{err:#}");
        let sanitized = self.sanitize(&message);
        if sanitized == message {
            err
        } else {
            anyhow!(sanitized)
        }
    }

    // Cache probe, shared by the pre-admission check and the double check
    // after lock acquisition. Mirrors the negative-entry contract: while a
    // key is paused the memoized error is served (counted on the first
    // invocation only); the pause exits through either the elapsed-time or
    // the served-count threshold, both of which delete the record.
    async fn probe_manifest_cache(&self, key: &ManifestCacheKey, first_invocation: bool) -> CacheProbe {
        let entry = match self.cache.get_manifests(key).await {
            Ok(entry) => entry,
            Err(err) if err.is_miss() => {
                tracing::debug!(target: "repogen::service", "manifest cache miss: {}", key.fingerprint);
                return CacheProbe::Miss;
            }
            Err(err) => {
                tracing::warn!(target: "repogen::service", "manifest cache error: {err}");
                return CacheProbe::Miss;
            }
        };

        if self.config.pause_after_failures > 0 && entry.is_failure_record() {
            if entry.consecutive_failures >= self.config.pause_after_failures {
                if self.config.pause_minutes > 0 {
                    let elapsed_minutes = (self.now() - entry.first_failure_at) / 60;
                    if elapsed_minutes >= i64::from(self.config.pause_minutes) {
                        tracing::info!(
                            target: "repogen::service",
                            "manifest error cache hit and reset (elapsed): {}",
                            key.fingerprint
                        );
                        if let Err(err) = self.cache.delete_manifests(key).await {
                            tracing::warn!(target: "repogen::service", "manifest cache delete error: {err}");
                        }
                        return CacheProbe::Miss;
                    }
                }

                if self.config.pause_requests > 0
                    && entry.cached_response_count >= self.config.pause_requests
                {
                    tracing::info!(
                        target: "repogen::service",
                        "manifest error cache hit and reset (request count): {}",
                        key.fingerprint
                    );
                    if let Err(err) = self.cache.delete_manifests(key).await {
                        tracing::warn!(target: "repogen::service", "manifest cache delete error: {err}");
                    }
                    return CacheProbe::Miss;
                }

                tracing::info!(
                    target: "repogen::service",
                    "manifest error cache hit: {}",
                    key.fingerprint
                );
                if first_invocation {
                    let mut updated = entry.clone();
                    updated.cached_response_count += 1;
                    if let Err(err) = self.cache.set_manifests(key, &updated).await {
                        tracing::warn!(target: "repogen::service", "manifest cache set error: {err}");
                    }
                }
                return CacheProbe::NegativeHit(format!(
                    "{CACHED_MANIFEST_ERROR_PREFIX}: {}",
                    entry.most_recent_error
                ));
            }
            // Below the failure threshold: render again.
            return CacheProbe::Miss;
        }

        match entry.response {
            Some(response) => {
                tracing::info!(target: "repogen::service", "manifest cache hit: {}", key.fingerprint);
                CacheProbe::Hit(response)
            }
            None => CacheProbe::Miss,
        }
    }

    /// Applies the failure-memoization update for an error that reached the
    /// post-cache-probe stage. A cache-store failure while updating the
    /// counters is a hard error.
    async fn record_render_failure(&self, key: &ManifestCacheKey, message: &str) -> Result<()> {
        if self.config.pause_after_failures == 0 {
            return Ok(());
        }
        // Fetch a fresh copy so a potentially lengthy render does not
        // clobber counters advanced by concurrent requests.
        let mut entry = match self.cache.get_manifests(key).await {
            Ok(entry) => entry,
            Err(err) if err.is_miss() => CachedManifestEntry::default(),
            Err(err) => return Err(RenderError::CacheStoreFailure(err.to_string()).into()),
        };
        if entry.first_failure_at == 0 {
            entry.first_failure_at = self.now();
        }
        entry.consecutive_failures += 1;
        entry.most_recent_error = message.to_string();
        self.cache
            .set_manifests(key, &entry)
            .await
            .map_err(|err| RenderError::CacheStoreFailure(err.to_string()))?;
        Ok(())
    }

    /// Resolves the request's primary revision according to its source
    /// kind.
    async fn resolve_primary(&self, source: &SourceRef, revision: &str, bypass: bool) -> Result<String> {
        match source.kind {
            SourceKind::Repo => {
                let client = self.git_client(&source.url);
                self.resolver.resolve_repo_revision(&*client, revision, bypass).await
            }
            SourceKind::Chart => {
                let client = (self.chart_factory)(&source.url);
                self.resolver.resolve_chart_version(&*client, &source.chart, revision, bypass).await
            }
            SourceKind::Archive => {
                let client = (self.archive_factory)(&source.url);
                self.resolver.resolve_archive_digest(&*client, revision, bypass).await
            }
        }
    }

    /// Top-level entry point: renders one request into its manifest list.
    pub async fn generate_manifests(&self, request: &ManifestRequest) -> Result<ManifestResponse> {
        let source = &request.source;
        let revision = first_non_empty(&request.revision, &source.target_revision);
        let bypass_revision_cache = request.no_cache || request.no_revision_cache;

        // Ref-only sources resolve their revision and produce nothing.
        if request.has_multiple_sources && source.is_ref_only() {
            tracing::debug!(
                target: "repogen::service",
                "skipping manifest generation for ref-only source of {}",
                request.app.app_name
            );
            let resolved = self.resolve_primary(source, revision, bypass_revision_cache).await?;
            return Ok(ManifestResponse { revision: resolved, ..Default::default() });
        }

        let resolved = self.resolve_primary(source, revision, bypass_revision_cache).await?;

        // Cross-resolution runs before the cache probe so the CrossRef map
        // participates in the cache key.
        let cross = if request.has_multiple_sources {
            let primary_canonical = normalize_git_url(&source.url);
            let primary = if source.kind == SourceKind::Repo {
                Some((primary_canonical.as_str(), revision, resolved.as_str()))
            } else {
                None
            };
            resolve_referenced_sources(
                source.render_options.template.as_ref(),
                &request.ref_sources,
                primary,
                &ServiceRefResolver { service: self, no_revision_cache: bypass_revision_cache },
            )
            .await?
        } else {
            CrossResolution::default()
        };

        let key = ManifestCacheKey::new(source, &resolved, &cross.revisions, &request.app);

        if !request.no_cache {
            match self.probe_manifest_cache(&key, true).await {
                CacheProbe::Hit(response) => return Ok(response),
                CacheProbe::NegativeHit(message) => return Err(anyhow!(message)),
                CacheProbe::Miss => {}
            }
        }

        // Admission: one slot of the global render budget.
        let _permit = match &self.parallelism {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| RenderError::Cancelled)?,
            ),
            None => None,
        };

        let mut acquired = match self.acquire_source(request, &resolved, &cross).await {
            Ok(acquired) => acquired,
            Err(err) => {
                let sanitized = self.sanitize_error(err);
                let counts = sanitized
                    .downcast_ref::<RenderError>()
                    .map_or(true, RenderError::counts_toward_failure_backoff);
                if counts {
                    self.record_render_failure(&key, &format!("{sanitized:#}")).await?;
                }
                return Err(sanitized);
            }
        };

        // Double-checked locking: another request may have populated the
        // entry while this one waited for the lock or the semaphore.
        if !request.no_cache {
            match self.probe_manifest_cache(&key, false).await {
                CacheProbe::Hit(response) => return Ok(response),
                CacheProbe::NegativeHit(message) => return Err(anyhow!(message)),
                CacheProbe::Miss => {}
            }
        }

        let verify_result = if request.verify_signature && source.kind == SourceKind::Repo {
            let client = self.git_client(&source.url);
            // Annotated tags verify against the tag name, not the commit it
            // points at.
            let rev_to_verify =
                if client.is_annotated_tag(revision).await { revision } else { resolved.as_str() };
            match client.verify_commit_signature(rev_to_verify).await {
                Ok(output) => output,
                Err(err) => {
                    let failure = self.sanitize_error(err.context("signature verification failed"));
                    self.record_render_failure(&key, &format!("{failure:#}")).await?;
                    return Err(failure);
                }
            }
        } else {
            String::new()
        };

        let commit_sha = acquired.commit_sha.clone();
        match self.render_acquired(request, &mut acquired, &commit_sha).await {
            Ok(mut response) => {
                response.revision = commit_sha;
                response.verify_result = verify_result;
                let entry = CachedManifestEntry::success(response.clone());
                if let Err(err) = self.cache.set_manifests(&key, &entry).await {
                    tracing::warn!(target: "repogen::service", "manifest cache set error: {err}");
                }
                Ok(response)
            }
            Err(err) => {
                let sanitized = self.sanitize_error(err);
                let counts = sanitized
                    .downcast_ref::<RenderError>()
                    .map_or(true, RenderError::counts_toward_failure_backoff);
                if counts {
                    self.record_render_failure(&key, &format!("{sanitized:#}")).await?;
                }
                Err(sanitized)
            }
        }
    }

    /// Acquires the source tree for a request: repository checkout under the
    /// working-tree lock, or bounded chart/archive extraction. Referenced
    /// repositories are acquired with shared access and held for the
    /// duration of the render.
    async fn acquire_source(
        &self,
        request: &ManifestRequest,
        resolved: &str,
        cross: &CrossResolution,
    ) -> Result<AcquiredTree> {
        let source = &request.source;
        match source.kind {
            SourceKind::Chart => {
                let client = (self.chart_factory)(&source.url);
                if request.no_cache {
                    client.clean_chart_cache(&source.chart, resolved).await?;
                }
                let (path, cleanup) = client
                    .extract_chart(&source.chart, resolved, self.config.chart_extraction_cap())
                    .await
                    .map_err(|err| RenderError::AcquisitionFailure { reason: format!("{err:#}") })?;
                if !self.config.allow_out_of_bounds_symlinks {
                    acquire::check_out_of_bounds_symlinks(&path)?;
                }
                Ok(AcquiredTree {
                    app_path: path.clone(),
                    root: path,
                    commit_sha: resolved.to_string(),
                    tree_guard: None,
                    ref_guards: Vec::new(),
                    extraction: Some(cleanup),
                })
            }
            SourceKind::Archive => {
                let client = (self.archive_factory)(&source.url);
                if request.no_cache {
                    client.clean_cache(resolved).await?;
                }
                let (path, cleanup) = client
                    .extract(resolved, self.config.archive_extraction_cap())
                    .await
                    .map_err(|err| RenderError::AcquisitionFailure { reason: format!("{err:#}") })?;
                if !self.config.allow_out_of_bounds_symlinks {
                    acquire::check_out_of_bounds_symlinks(&path)?;
                }
                let app_path = acquire::paths::app_path(&path, &source.path)?;
                Ok(AcquiredTree {
                    root: path,
                    app_path,
                    commit_sha: resolved.to_string(),
                    tree_guard: None,
                    ref_guards: Vec::new(),
                    extraction: Some(cleanup),
                })
            }
            SourceKind::Repo => {
                let client = self.git_client(&source.url);
                let root = client.root().to_path_buf();
                let submodules = self.config.submodules_enabled;
                let checkout_client = client.clone();
                let guard = self
                    .locks
                    .lock(&root, resolved, source.allows_concurrent_processing(), || async move {
                        acquire::checkout_revision(&*checkout_client, resolved, submodules).await
                    })
                    .await?;

                if !self.config.allow_out_of_bounds_symlinks {
                    acquire::check_out_of_bounds_symlinks(&root)?;
                }

                let commit_sha = if request.has_multiple_sources {
                    resolved.to_string()
                } else {
                    client.commit_sha().await.context("failed to get commit SHA")?
                };

                let mut ref_guards = Vec::new();
                for referenced in cross.entries.values() {
                    let ref_client = self.git_client(&referenced.repo_url);
                    let ref_root = ref_client.root().to_path_buf();
                    if ref_root == root {
                        // Same repository as the primary source; already
                        // checked out at a consistent commit.
                        continue;
                    }
                    let ref_resolved = referenced.resolved.clone();
                    let rev_for_checkout = ref_resolved.clone();
                    let checkout_client = ref_client.clone();
                    let ref_guard = self
                        .locks
                        .lock(&ref_root, &ref_resolved, true, || async move {
                            acquire::checkout_revision(&*checkout_client, &rev_for_checkout, submodules)
                                .await
                        })
                        .await
                        .with_context(|| {
                            format!("failed to acquire referenced source {}", referenced.repo_url)
                        })?;
                    if !self.config.allow_out_of_bounds_symlinks {
                        acquire::check_out_of_bounds_symlinks(&ref_root)?;
                    }
                    ref_guards.push(ref_guard);
                }

                let app_path = acquire::paths::app_path(&root, &source.path)?;
                Ok(AcquiredTree {
                    root,
                    app_path,
                    commit_sha,
                    tree_guard: Some(guard),
                    ref_guards,
                    extraction: None,
                })
            }
        }
    }

    /// Renders an acquired tree. For the plugin strategy the working-tree
    /// lock is released as soon as the tar upload concludes.
    async fn render_acquired(
        &self,
        request: &ManifestRequest,
        acquired: &mut AcquiredTree,
        commit_sha: &str,
    ) -> Result<ManifestResponse> {
        let app = &request.app;

        // Multi-source entries carrying neither path nor chart produce no
        // manifests.
        if request.has_multiple_sources && request.source.path.is_empty() && request.source.chart.is_empty()
        {
            return Ok(ManifestResponse { revision: commit_sha.to_string(), ..Default::default() });
        }

        // In-tree overrides may only adjust tool options; the cache key was
        // assembled from the request's declared options beforehand.
        let mut source = request.source.clone();
        merge_source_overrides(&mut source, &acquired.app_path, &app.app_name)?;

        let strategy = match source.explicit_strategy()? {
            Some(declared) => render::apply_enablement(declared, &self.config),
            None => match render::detect_strategy_from_files(&acquired.app_path) {
                Some(detected) => render::apply_enablement(detected, &self.config),
                None => match &self.plugins {
                    Some(registry) => match registry.find_matching(&acquired.app_path).await? {
                        Some((name, _)) => render::apply_enablement(
                            RenderStrategy::Plugin(name),
                            &self.config,
                        ),
                        None => RenderStrategy::RawDirectory,
                    },
                    None => RenderStrategy::RawDirectory,
                },
            },
        };

        let env = Env::for_request(app, &source, commit_sha);
        tracing::debug!(
            target: "repogen::service",
            "rendering {} with {strategy}",
            app.app_name
        );

        let mut commands = Vec::new();
        let resources = match &strategy {
            RenderStrategy::Template => {
                let ctx = TemplateContext {
                    app_path: &acquired.app_path,
                    repo_root: &acquired.root,
                    env: &env,
                    options: source.render_options.template.as_ref(),
                    app,
                    kube_version: &request.kube_version,
                    api_versions: &request.api_versions,
                    ref_sources: &request.ref_sources,
                    repo_paths: &self.repo_paths,
                    allowed_schemes: &self.config.allowed_value_file_schemes,
                    dep_build_locks: &self.dep_build_locks,
                };
                let (resources, command) = render_template(&*self.engines.template, ctx).await?;
                commands.push(command);
                resources
            }
            RenderStrategy::Overlay => {
                let (resources, _images, command) = render_overlay(
                    &*self.engines.overlay,
                    &acquired.app_path,
                    source.render_options.overlay.as_ref(),
                    &request.kube_version,
                    &request.api_versions,
                    &env,
                )
                .await?;
                commands.push(command);
                resources
            }
            RenderStrategy::Script => {
                let options = source.render_options.script.clone().unwrap_or_default();
                render_script(
                    &*self.engines.script,
                    &acquired.app_path,
                    &acquired.root,
                    &options,
                    &env,
                )
                .await?
            }
            RenderStrategy::RawDirectory => {
                let options = source.render_options.directory.clone().unwrap_or_default();
                let ctx = DirectoryContext {
                    app_path: &acquired.app_path,
                    repo_root: &acquired.root,
                    options: &options,
                    env: &env,
                    max_combined_bytes: self.config.max_combined_directory_manifests_bytes,
                };
                render::directory::render_directory(&*self.engines.script, ctx).await?
            }
            RenderStrategy::Plugin(name) => {
                return self
                    .render_via_plugin(request, acquired, commit_sha, &source, name, &env)
                    .await;
            }
        };

        let manifests = render::finalize_manifests(resources, app)?;
        Ok(ManifestResponse {
            manifests,
            source_type: strategy_source_type(&strategy).to_string(),
            commands,
            revision: commit_sha.to_string(),
            verify_result: String::new(),
        })
    }

    /// Plugin rendering: background task plus channel signalling so the
    /// working-tree lock releases once the archive is on the wire.
    async fn render_via_plugin(
        &self,
        request: &ManifestRequest,
        acquired: &mut AcquiredTree,
        commit_sha: &str,
        source: &SourceRef,
        plugin_name: &str,
        env: &Env,
    ) -> Result<ManifestResponse> {
        let registry = self.plugins.as_ref().ok_or_else(|| RenderError::PluginFailure {
            phase: "connect".to_string(),
            message: "no plugin registry configured".to_string(),
        })?;

        let client: Arc<dyn PluginClient> = if plugin_name.is_empty() {
            let (name, client) =
                registry.find_matching(&acquired.app_path).await?.ok_or_else(|| {
                    RenderError::PluginFailure {
                        phase: "connect".to_string(),
                        message: "no plugin supports the application directory".to_string(),
                    }
                })?;
            tracing::debug!(target: "repogen::service", "autodetected plugin {name}");
            client
        } else {
            registry.connect(plugin_name).await.map_err(|err| RenderError::PluginFailure {
                phase: "connect".to_string(),
                message: format!("{err:#}"),
            })?
        };

        let configuration =
            client.check_configuration().await.map_err(|err| RenderError::PluginFailure {
                phase: "configuration".to_string(),
                message: format!("{err:#}"),
            })?;

        let mut plugin_env = env.vars().to_vec();
        plugin_env.push(("KUBE_VERSION".to_string(), request.kube_version.clone()));
        plugin_env.push(("KUBE_API_VERSIONS".to_string(), request.api_versions.join(",")));
        if let Some(options) = &source.render_options.plugin {
            for (name, value) in &options.env {
                plugin_env.push((name.clone(), env.envsubst(value)));
            }
            for (name, value) in &options.parameters {
                plugin_env.push((format!("PARAM_{}", name.to_uppercase()), value.clone()));
            }
        }
        if configuration.needs_repo_credentials {
            if let Some(credentials) = &self.credentials {
                plugin_env.extend(credentials.environ(&source.url).await?);
            }
        }

        let archive_root = if self.config.plugin_use_manifest_generate_paths {
            let root = application_root_path(
                request.manifest_generate_paths.as_deref(),
                &acquired.app_path,
                &acquired.root,
            );
            tracing::debug!(
                target: "repogen::service",
                "archive root for {}: {}",
                request.app.app_name,
                root.display()
            );
            root
        } else {
            acquired.root.clone()
        };

        let (tar_done_tx, tar_done_rx) = oneshot::channel();
        let excluded = self.config.plugin_tar_excluded_globs.clone();
        let app_path = acquired.app_path.clone();
        let task = tokio::spawn(async move {
            generate_manifests_via_plugin(
                client,
                &archive_root,
                &app_path,
                plugin_env,
                &excluded,
                tar_done_tx,
            )
            .await
        });

        // A closed channel means the task failed before concluding the
        // upload; keep the lock until the error is collected.
        if tar_done_rx.await.is_ok() {
            tracing::debug!(
                target: "repogen::service",
                "tar upload concluded; releasing working tree before awaiting plugin reply"
            );
            acquired.release();
        }

        let reply = task
            .await
            .map_err(|err| RenderError::PluginFailure {
                phase: "response".to_string(),
                message: format!("plugin task failed: {err}"),
            })??;

        let mut resources = Vec::new();
        for manifest in &reply.manifests {
            resources.extend(render::split_yaml_or_json(manifest).map_err(|err| {
                RenderError::PluginFailure {
                    phase: "response".to_string(),
                    message: format!("failed to parse plugin manifests: {err:#}"),
                }
            })?);
        }

        let manifests = render::finalize_manifests(resources, &request.app)?;
        Ok(ManifestResponse {
            manifests,
            source_type: "Plugin".to_string(),
            commands: Vec::new(),
            revision: commit_sha.to_string(),
            verify_result: String::new(),
        })
    }
}

fn strategy_source_type(strategy: &RenderStrategy) -> &'static str {
    match strategy {
        RenderStrategy::Template => "Template",
        RenderStrategy::Overlay => "Overlay",
        RenderStrategy::Script => "Script",
        RenderStrategy::Plugin(_) => "Plugin",
        RenderStrategy::RawDirectory => "RawDirectory",
    }
}

fn first_non_empty<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a.is_empty() {
        b
    } else {
        a
    }
}

// Supplemental repository operations: listings, metadata, and the
// update-for-paths relabel flow. Each one follows the same
// resolve → cache → lock → compute → cache pipeline.
impl GenerationService {
    /// Branches and tags of a repository.
    pub async fn list_refs(&self, repo_url: &str) -> Result<RemoteRefs> {
        self.git_client(repo_url).ls_refs().await
    }

    /// Names of the available render plugins.
    pub fn list_plugins(&self) -> Result<Vec<String>> {
        match &self.plugins {
            Some(registry) => registry.list(),
            None => Ok(Vec::new()),
        }
    }

    /// Resolves a source's target revision without rendering.
    pub async fn resolve_revision(&self, source: &SourceRef, ambiguous: &str) -> Result<String> {
        let revision = first_non_empty(ambiguous, &source.target_revision);
        self.resolve_primary(source, revision, false).await
    }

    /// Acquires a repository tree at a revision with shared access and runs
    /// `compute` on it.
    async fn with_repo_tree<T, F>(&self, repo_url: &str, resolved: &str, compute: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Result<T>,
    {
        let client = self.git_client(repo_url);
        let root = client.root().to_path_buf();
        let submodules = self.config.submodules_enabled;
        let checkout_client = client.clone();
        let resolved_owned = resolved.to_string();
        let _guard = self
            .locks
            .lock(&root, resolved, true, || async move {
                acquire::checkout_revision(&*checkout_client, &resolved_owned, submodules).await
            })
            .await?;
        compute(root)
    }

    /// Candidate application directories at a revision, with their detected
    /// strategies.
    pub async fn list_apps(&self, repo_url: &str, revision: &str) -> Result<AppList> {
        let client = self.git_client(repo_url);
        let resolved = self.resolver.resolve_repo_revision(&*client, revision, false).await?;
        let canonical = normalize_git_url(repo_url);

        if let Some(apps) = self.cache.get_app_list(&canonical, &resolved).await {
            tracing::info!(target: "repogen::service", "app list cache hit: {canonical}/{revision}");
            return Ok(apps);
        }

        let apps = self
            .with_repo_tree(repo_url, &resolved, |root| {
                let mut apps = AppList::new();
                for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
                    let entry = entry?;
                    if !entry.file_type().is_dir() {
                        continue;
                    }
                    if entry.path().components().any(|c| c.as_os_str() == ".git") {
                        continue;
                    }
                    if let Some(strategy) = render::detect_strategy_from_files(entry.path()) {
                        let rel = entry
                            .path()
                            .strip_prefix(&root)
                            .unwrap_or(entry.path())
                            .display()
                            .to_string();
                        apps.insert(rel, strategy_source_type(&strategy).to_string());
                    }
                }
                Ok(apps)
            })
            .await?;

        self.cache.set_app_list(&canonical, &resolved, &apps).await;
        Ok(apps)
    }

    /// Commit metadata at a revision.
    pub async fn revision_metadata(&self, repo_url: &str, revision: &str) -> Result<RevisionMetadata> {
        let client = self.git_client(repo_url);
        let resolved = self.resolver.resolve_repo_revision(&*client, revision, false).await?;
        let canonical = normalize_git_url(repo_url);

        if let Some(metadata) = self.cache.get_revision_metadata(&canonical, &resolved).await {
            return Ok(metadata);
        }

        let _fetch_guard = self.fetch_locks.lock(client.root()).await;
        client.init().await?;
        acquire::fetch_revisions(&*client, std::slice::from_ref(&resolved)).await?;
        let metadata = client.revision_metadata(&resolved).await?;

        self.cache.set_revision_metadata(&canonical, &resolved, &metadata).await;
        Ok(metadata)
    }

    /// Chart descriptor detail at an exact version.
    pub async fn chart_details(&self, registry_url: &str, chart: &str, version: &str) -> Result<ChartDetail> {
        let client = (self.chart_factory)(registry_url);
        let resolved =
            self.resolver.resolve_chart_version(&*client, chart, version, false).await?;
        let canonical = normalize_git_url(registry_url);

        if let Some(detail) = self.cache.get_chart_detail(&canonical, chart, &resolved).await {
            return Ok(detail);
        }
        let detail = client.chart_details(chart, &resolved).await?;
        self.cache.set_chart_detail(&canonical, chart, &resolved, &detail).await;
        Ok(detail)
    }

    /// Contents of tracked files matching a pattern at a revision.
    pub async fn git_files(&self, repo_url: &str, revision: &str, pattern: &str) -> Result<FileBundle> {
        let client = self.git_client(repo_url);
        let resolved = self.resolver.resolve_repo_revision(&*client, revision, false).await?;
        let canonical = normalize_git_url(repo_url);

        if let Some(bundle) = self.cache.get_file_bundle(&canonical, &resolved, pattern).await {
            tracing::info!(target: "repogen::service", "file bundle cache hit: {canonical}/{revision}");
            return Ok(bundle);
        }

        let strict = self.config.strict_file_globbing;
        let pattern_owned = pattern.to_string();
        let listed = {
            let client = client.clone();
            let resolved = resolved.clone();
            let root = client.root().to_path_buf();
            let submodules = self.config.submodules_enabled;
            let checkout_client = client.clone();
            let resolved_for_checkout = resolved.clone();
            let _guard = self
                .locks
                .lock(&root, &resolved, true, || async move {
                    acquire::checkout_revision(&*checkout_client, &resolved_for_checkout, submodules)
                        .await
                })
                .await?;

            let mut files = client.ls_files(&pattern_owned).await?;
            if strict {
                let matcher = glob::Pattern::new(&pattern_owned)
                    .map_err(|err| anyhow!("invalid file pattern {pattern_owned:?}: {err}"))?;
                files.retain(|file| matcher.matches(file));
            }

            let mut bundle = FileBundle::default();
            for file in files {
                let path = acquire::paths::resolve_within(&root, &root, &file)?;
                if !path.is_file() {
                    continue;
                }
                bundle.files.insert(file.clone(), std::fs::read(&path)?);
            }
            bundle
        };

        self.cache.set_file_bundle(&canonical, &resolved, pattern, &listed).await;
        Ok(listed)
    }

    /// Directory roster at a revision.
    pub async fn git_directories(&self, repo_url: &str, revision: &str) -> Result<DirectoryListing> {
        let client = self.git_client(repo_url);
        let resolved = self.resolver.resolve_repo_revision(&*client, revision, false).await?;
        let canonical = normalize_git_url(repo_url);
        let include_hidden = self.config.include_hidden_directories;

        if let Some(listing) =
            self.cache.get_directory_listing(&canonical, &resolved, include_hidden).await
        {
            return Ok(listing);
        }

        let listing = self
            .with_repo_tree(repo_url, &resolved, |root| {
                let mut listing = DirectoryListing::default();
                for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
                    let entry = entry?;
                    if !entry.file_type().is_dir() || entry.path() == root {
                        continue;
                    }
                    let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                    let components: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().to_string())
                        .collect();
                    if components.iter().any(|c| c == ".git") {
                        continue;
                    }
                    if !include_hidden && components.iter().any(|c| c.starts_with('.')) {
                        continue;
                    }
                    listing.paths.push(rel.display().to_string());
                }
                Ok(listing)
            })
            .await?;

        self.cache.set_directory_listing(&canonical, &resolved, include_hidden, &listing).await;
        Ok(listing)
    }

    /// Resolves the new revision and, when no watched path changed between
    /// the synced and the new revision, relabels the cached manifests for
    /// the new revision instead of re-rendering.
    pub async fn update_revision_for_paths(
        &self,
        request: &UpdateRevisionRequest,
    ) -> Result<UpdateRevisionResponse> {
        let client = self.git_client(&request.source.url);
        let new_resolved = self
            .resolver
            .resolve_repo_revision(&*client, &request.revision, request.no_revision_cache)
            .await?;
        let old_resolved = self
            .resolver
            .resolve_repo_revision(&*client, &request.sync_revision, request.no_revision_cache)
            .await?;

        if new_resolved == old_resolved {
            return Ok(UpdateRevisionResponse { revision: new_resolved, changes: false });
        }
        if request.paths.is_empty() {
            // Nothing to prove path-irrelevance against.
            return Ok(UpdateRevisionResponse { revision: new_resolved, changes: true });
        }

        let changed = {
            let _fetch_guard = self.fetch_locks.lock(client.root()).await;
            client.init().await?;
            acquire::fetch_revisions(
                &*client,
                &[old_resolved.clone(), new_resolved.clone()],
            )
            .await?;
            let files = client.changed_files(&old_resolved, &new_resolved).await?;
            files_match_paths(&files, &request.paths)
        };

        if changed {
            tracing::info!(
                target: "repogen::service",
                "{} -> {} changed watched paths for {}",
                old_resolved,
                new_resolved,
                request.app.app_name
            );
            return Ok(UpdateRevisionResponse { revision: new_resolved, changes: true });
        }

        // Nothing relevant changed: relabel the cached entry for the new
        // revision and advance the resolved-revision cache.
        let old_key =
            ManifestCacheKey::new(&request.source, &old_resolved, &request.cross_refs, &request.app);
        let new_key =
            ManifestCacheKey::new(&request.source, &new_resolved, &request.cross_refs, &request.app);
        match self.cache.move_manifests(&old_key, &new_key).await {
            Ok(moved) => {
                tracing::debug!(
                    target: "repogen::service",
                    moved,
                    "relabeled manifests from {old_resolved} to {new_resolved}"
                );
            }
            Err(err) => {
                tracing::warn!(target: "repogen::service", "manifest cache move error: {err}");
            }
        }
        let canonical = normalize_git_url(&request.source.url);
        self.cache.set_resolved_revision(&canonical, &request.revision, &new_resolved).await;

        Ok(UpdateRevisionResponse { revision: new_resolved, changes: false })
    }
}

/// Whether any changed file falls under any of the watched path globs.
/// Globs match exactly or as directory prefixes.
fn files_match_paths(changed: &[String], watched: &[String]) -> bool {
    for raw in watched {
        let watched_path = raw.trim_start_matches("./").trim_start_matches('/').trim_end_matches('/');
        if watched_path.is_empty() {
            return !changed.is_empty();
        }
        let pattern = glob::Pattern::new(watched_path).ok();
        for file in changed {
            if file == watched_path || file.starts_with(&format!("{watched_path}/")) {
                return true;
            }
            if pattern.as_ref().is_some_and(|p| p.matches(file)) {
                return true;
            }
        }
    }
    false
}
