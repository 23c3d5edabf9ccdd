//! Shared fixtures for the integration suites: in-memory collaborator
//! implementations with call counters, plus a service builder wiring them
//! together over a temporary scratch root.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use repogen::cache::{CacheStore, InMemoryCacheStore};
use repogen::config::GenerationConfig;
use repogen::git::{GitClient, GitClientFactory};
use repogen::models::{RemoteRefs, RevisionMetadata};
use repogen::plugin::{
    PluginClient, PluginConfigResponse, PluginGenerateStream, PluginManifestResponse, PluginRegistry,
};
use repogen::registry::{
    ArchiveClientFactory, ArchiveRegistryClient, ChartClientFactory, ChartRegistryClient,
    ExtractionCleanup,
};
use repogen::render::{
    EngineError, EngineOutput, OverlayEngine, OverlayInvocation, OverlayOutput, RenderEngines,
    ScriptEngine, ScriptInvocation, TemplateEngine, TemplateInvocation,
};
use repogen::service::GenerationService;

/// Behavior and counters for one mocked repository.
#[derive(Default)]
pub struct MockRepo {
    /// Ambiguous revision to resolved identifier.
    pub ls_remote: Mutex<HashMap<String, String>>,
    /// Files written into the tree on checkout, as `(path, contents)`.
    pub files: Mutex<Vec<(String, String)>>,
    /// Revisions that are annotated tags.
    pub annotated_tags: Mutex<HashSet<String>>,
    /// Output of signature verification.
    pub signature: Mutex<String>,
    /// Paths reported changed between any two revisions.
    pub changed_files: Mutex<Vec<String>>,
    /// Artificial checkout latency.
    pub checkout_delay: Mutex<Duration>,
    /// Number of checkouts performed.
    pub checkouts: AtomicUsize,
    /// Number of remote ref lookups performed.
    pub ls_remote_calls: AtomicUsize,
    /// Wall-clock instants at which checkouts started.
    pub checkout_started_at: Mutex<Vec<std::time::Instant>>,
}

impl MockRepo {
    pub fn resolving(rev: &str, sha: &str) -> Arc<Self> {
        let repo = Self::default();
        repo.ls_remote.lock().unwrap().insert(rev.to_string(), sha.to_string());
        Arc::new(repo)
    }

    pub fn with_file(self: Arc<Self>, path: &str, contents: &str) -> Arc<Self> {
        self.files.lock().unwrap().push((path.to_string(), contents.to_string()));
        self
    }
}

/// All mocked repositories, keyed by URL as the factory receives it.
#[derive(Default)]
pub struct MockGitWorld {
    repos: Mutex<HashMap<String, Arc<MockRepo>>>,
}

impl MockGitWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, url: &str, repo: Arc<MockRepo>) {
        self.repos.lock().unwrap().insert(url.to_string(), repo);
    }

    pub fn repo(&self, url: &str) -> Arc<MockRepo> {
        self.repos
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(MockRepo::default()))
            .clone()
    }

    pub fn factory(self: &Arc<Self>) -> GitClientFactory {
        let world = Arc::clone(self);
        Arc::new(move |url: &str, root: PathBuf| {
            Arc::new(MockGitClient {
                url: url.to_string(),
                root,
                repo: world.repo(url),
            }) as Arc<dyn GitClient>
        })
    }
}

pub struct MockGitClient {
    url: String,
    root: PathBuf,
    repo: Arc<MockRepo>,
}

const MOCK_HEAD_FILE: &str = ".mock-head";

#[async_trait]
impl GitClient for MockGitClient {
    fn root(&self) -> &Path {
        &self.root
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn fetch(&self, _refspec: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn checkout(&self, rev: &str, _submodules: bool) -> Result<String> {
        self.repo.checkout_started_at.lock().unwrap().push(std::time::Instant::now());
        let delay = *self.repo.checkout_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.repo.checkouts.fetch_add(1, Ordering::SeqCst);

        tokio::fs::create_dir_all(&self.root).await?;
        for (path, contents) in self.repo.files.lock().unwrap().iter() {
            let target = self.root.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }
        std::fs::write(self.root.join(MOCK_HEAD_FILE), rev)?;
        Ok(rev.to_string())
    }

    async fn is_revision_present(&self, _rev: &str) -> bool {
        true
    }

    async fn ls_remote(&self, rev: &str) -> Result<String> {
        self.repo.ls_remote_calls.fetch_add(1, Ordering::SeqCst);
        self.repo
            .ls_remote
            .lock()
            .unwrap()
            .get(rev)
            .cloned()
            .ok_or_else(|| anyhow!("unknown revision {rev:?}"))
    }

    async fn ls_refs(&self) -> Result<RemoteRefs> {
        let refs = self.repo.ls_remote.lock().unwrap();
        Ok(RemoteRefs {
            branches: refs.keys().cloned().collect(),
            tags: Vec::new(),
        })
    }

    async fn ls_files(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob::Pattern::new(pattern).map_err(|err| anyhow!("bad pattern: {err}"))?;
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.root).unwrap().display().to_string();
            if rel == MOCK_HEAD_FILE {
                continue;
            }
            if matcher.matches(&rel) {
                files.push(rel);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn revision_metadata(&self, _rev: &str) -> Result<RevisionMetadata> {
        Ok(RevisionMetadata {
            author: "Test Author <author@example.com>".to_string(),
            message: "mock commit".to_string(),
            ..Default::default()
        })
    }

    async fn verify_commit_signature(&self, _rev: &str) -> Result<String> {
        Ok(self.repo.signature.lock().unwrap().clone())
    }

    async fn changed_files(&self, _old: &str, _new: &str) -> Result<Vec<String>> {
        Ok(self.repo.changed_files.lock().unwrap().clone())
    }

    async fn is_annotated_tag(&self, rev: &str) -> bool {
        self.repo.annotated_tags.lock().unwrap().contains(rev)
    }

    async fn commit_sha(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.root.join(MOCK_HEAD_FILE))?)
    }
}

/// Chart registry serving archives from in-memory file sets.
#[derive(Default)]
pub struct MockChartRegistry {
    pub url: String,
    pub versions: Mutex<Vec<String>>,
    pub files: Mutex<Vec<(String, String)>>,
    pub extractions: AtomicUsize,
}

#[async_trait]
impl ChartRegistryClient for MockChartRegistry {
    fn url(&self) -> &str {
        &self.url
    }

    async fn list_versions(&self, _chart: &str, _bypass_cache: bool) -> Result<Vec<String>> {
        Ok(self.versions.lock().unwrap().clone())
    }

    async fn extract_chart(
        &self,
        _chart: &str,
        _version: &str,
        _max_extracted_bytes: Option<u64>,
    ) -> Result<(PathBuf, ExtractionCleanup)> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("repogen-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        for (path, contents) in self.files.lock().unwrap().iter() {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }
        Ok((dir.clone(), ExtractionCleanup::removing(dir)))
    }

    async fn clean_chart_cache(&self, _chart: &str, _version: &str) -> Result<()> {
        Ok(())
    }

    async fn chart_details(&self, _chart: &str, _version: &str) -> Result<repogen::models::ChartDetail> {
        Ok(repogen::models::ChartDetail {
            description: "mock chart".to_string(),
            ..Default::default()
        })
    }
}

/// Archive registry resolving tags to digests and extracting file sets.
#[derive(Default)]
pub struct MockArchiveRegistry {
    pub url: String,
    pub digests: Mutex<HashMap<String, String>>,
    pub files: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ArchiveRegistryClient for MockArchiveRegistry {
    fn url(&self) -> &str {
        &self.url
    }

    async fn resolve_digest(&self, reference: &str, _bypass_cache: bool) -> Result<String> {
        self.digests
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow!("unknown reference {reference:?}"))
    }

    async fn get_tags(&self, _bypass_cache: bool) -> Result<Vec<String>> {
        Ok(self.digests.lock().unwrap().keys().cloned().collect())
    }

    async fn extract(
        &self,
        _digest: &str,
        _max_extracted_bytes: Option<u64>,
    ) -> Result<(PathBuf, ExtractionCleanup)> {
        let dir = std::env::temp_dir().join(format!("repogen-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        for (path, contents) in self.files.lock().unwrap().iter() {
            std::fs::write(dir.join(path), contents)?;
        }
        Ok((dir.clone(), ExtractionCleanup::removing(dir)))
    }

    async fn clean_cache(&self, _digest: &str) -> Result<()> {
        Ok(())
    }

    async fn digest_metadata(&self, _digest: &str) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Template engine with scripted outcomes and an invocation counter.
#[derive(Default)]
pub struct MockTemplateEngine {
    pub calls: AtomicUsize,
    pub fail_with: Mutex<Option<String>>,
    pub output: Mutex<String>,
}

#[async_trait]
impl TemplateEngine for MockTemplateEngine {
    async fn template(&self, _invocation: &TemplateInvocation) -> Result<EngineOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(EngineError::Failed(message));
        }
        Ok(EngineOutput {
            manifests: self.output.lock().unwrap().clone(),
            command: "template demo .".to_string(),
        })
    }

    async fn build_dependencies(&self, _app_path: &Path) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Overlay engine with a fixed output and an invocation counter.
#[derive(Default)]
pub struct MockOverlayEngine {
    pub calls: AtomicUsize,
    pub output: Mutex<String>,
}

#[async_trait]
impl OverlayEngine for MockOverlayEngine {
    async fn build(&self, _invocation: &OverlayInvocation) -> Result<OverlayOutput, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OverlayOutput {
            manifests: self.output.lock().unwrap().clone(),
            images: Vec::new(),
            command: "build .".to_string(),
        })
    }
}

/// Script engine that rejects every evaluation; suites that exercise script
/// files replace it.
pub struct FailingScriptEngine;

#[async_trait]
impl ScriptEngine for FailingScriptEngine {
    async fn evaluate_file(
        &self,
        _invocation: &ScriptInvocation,
        file: &Path,
    ) -> Result<String, EngineError> {
        Err(EngineError::Failed(format!("no script engine configured for {}", file.display())))
    }
}

/// Plugin whose reply is delayed, for lock-release ordering tests.
pub struct SlowPlugin {
    pub delay: Duration,
    pub reply: String,
    pub replied_at: Arc<Mutex<Option<std::time::Instant>>>,
}

struct SlowPluginStream {
    delay: Duration,
    reply: String,
    replied_at: Arc<Mutex<Option<std::time::Instant>>>,
}

#[async_trait]
impl PluginGenerateStream for SlowPluginStream {
    async fn send_metadata(&mut self, _app_rel_path: &str, _env: &[(String, String)]) -> Result<()> {
        Ok(())
    }

    async fn send_chunk(&mut self, _chunk: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn close_and_recv(self: Box<Self>) -> Result<PluginManifestResponse> {
        tokio::time::sleep(self.delay).await;
        *self.replied_at.lock().unwrap() = Some(std::time::Instant::now());
        Ok(PluginManifestResponse { manifests: vec![self.reply] })
    }
}

#[async_trait]
impl PluginClient for SlowPlugin {
    async fn check_configuration(&self) -> Result<PluginConfigResponse> {
        Ok(PluginConfigResponse::default())
    }

    async fn open_generate_stream(&self) -> Result<Box<dyn PluginGenerateStream>> {
        Ok(Box::new(SlowPluginStream {
            delay: self.delay,
            reply: self.reply.clone(),
            replied_at: self.replied_at.clone(),
        }))
    }
}

/// Registry exposing a single named plugin. `autodetect` controls whether
/// the plugin claims trees during discovery; explicit-name connections work
/// either way.
pub struct SinglePluginRegistry {
    pub name: String,
    pub client: Arc<dyn PluginClient>,
    pub autodetect: bool,
}

#[async_trait]
impl PluginRegistry for SinglePluginRegistry {
    fn list(&self) -> Result<Vec<String>> {
        Ok(vec![self.name.clone()])
    }

    async fn connect(&self, name: &str) -> Result<Arc<dyn PluginClient>> {
        if name == self.name {
            Ok(self.client.clone())
        } else {
            Err(anyhow!("unknown plugin {name:?}"))
        }
    }

    async fn find_matching(&self, _app_path: &Path) -> Result<Option<(String, Arc<dyn PluginClient>)>> {
        if self.autodetect {
            Ok(Some((self.name.clone(), self.client.clone())))
        } else {
            Ok(None)
        }
    }
}

/// Everything a suite needs to drive the service.
pub struct Harness {
    pub service: Arc<GenerationService>,
    pub world: Arc<MockGitWorld>,
    pub store: Arc<InMemoryCacheStore>,
    pub template: Arc<MockTemplateEngine>,
    pub overlay: Arc<MockOverlayEngine>,
    pub charts: Arc<MockChartRegistry>,
    pub archives: Arc<MockArchiveRegistry>,
    pub scratch: tempfile::TempDir,
}

/// Builds a service over mocks. `configure` adjusts the default config
/// (whose scratch root already points at a fresh temp dir).
pub fn harness(configure: impl FnOnce(&mut GenerationConfig)) -> Harness {
    harness_with(configure, None, None)
}

/// Like [`harness`], optionally wiring a plugin registry and a test clock.
pub fn harness_with(
    configure: impl FnOnce(&mut GenerationConfig),
    plugins: Option<Arc<dyn PluginRegistry>>,
    clock: Option<Arc<dyn Fn() -> i64 + Send + Sync>>,
) -> Harness {
    let scratch = tempfile::TempDir::new().expect("scratch dir");
    let mut config = GenerationConfig {
        root_dir: scratch.path().join("scratch"),
        ..Default::default()
    };
    configure(&mut config);

    let world = MockGitWorld::new();
    let store = Arc::new(InMemoryCacheStore::new());
    let template = Arc::new(MockTemplateEngine::default());
    let overlay = Arc::new(MockOverlayEngine::default());

    let chart_registry = Arc::new(MockChartRegistry {
        url: "https://charts.example.com".to_string(),
        ..Default::default()
    });
    let archive_registry = Arc::new(MockArchiveRegistry {
        url: "registry.example.com/apps/demo".to_string(),
        ..Default::default()
    });

    let chart_factory: ChartClientFactory = {
        let chart_registry = chart_registry.clone();
        Arc::new(move |_url: &str| chart_registry.clone() as Arc<dyn ChartRegistryClient>)
    };
    let archive_factory: ArchiveClientFactory = {
        let archive_registry = archive_registry.clone();
        Arc::new(move |_url: &str| archive_registry.clone() as Arc<dyn ArchiveRegistryClient>)
    };

    let engines = RenderEngines {
        template: template.clone(),
        overlay: overlay.clone(),
        script: Arc::new(FailingScriptEngine),
    };

    let mut service = GenerationService::new(
        config,
        store.clone() as Arc<dyn CacheStore>,
        world.factory(),
        chart_factory,
        archive_factory,
        engines,
    )
    .expect("service construction");
    if let Some(plugins) = plugins {
        service = service.with_plugins(plugins);
    }
    if let Some(clock) = clock {
        service = service.with_clock(clock);
    }

    Harness {
        service: Arc::new(service),
        world,
        store,
        template,
        overlay,
        charts: chart_registry,
        archives: archive_registry,
        scratch,
    }
}

/// A 40-hex commit sha for tests.
pub fn sha(fill: char) -> String {
    std::iter::repeat(fill).take(40).collect()
}
