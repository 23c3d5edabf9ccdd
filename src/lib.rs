//! repogen - Manifest generation core for a GitOps repository server
//!
//! This crate turns an application's *source reference* (a remote repository
//! at some revision, plus a path and per-tool options) into a deterministic
//! list of rendered resource manifests, while preventing redundant work
//! across concurrent requests, caching results keyed by a fingerprint of all
//! render-influencing inputs, and capping resource consumption even under
//! adversarial inputs.
//!
//! # Architecture Overview
//!
//! A request flows through the [`service::GenerationService`] orchestrator:
//!
//! ```text
//! Request → Orchestrator → [Cache hit? return] → Resolver → Lock Manager ⇄
//!        Source Acquisition → Render Dispatcher → (optional) Plugin Stream
//!        → Output → Cache write → Response
//! ```
//!
//! # Core Modules
//!
//! - [`resolver`] - ambiguous revisions (branches, tags, semver ranges,
//!   floating tags) to concrete immutable identifiers
//! - [`lock`] - per-working-tree reference-counted locks with FIFO waiters
//!   and revision-aware sharing
//! - [`acquire`] - checkout and bounded extraction into randomized scratch
//!   directories, with out-of-bounds symlink validation
//! - [`cache`] - two-tier cache (resolved revisions + rendered manifests)
//!   with memoized failures and backoff
//! - [`render`] - strategy selection and the four render strategies plus the
//!   raw-directory fallback
//! - [`plugin`] - streaming protocol to out-of-process render plugins,
//!   releasing the source-tree lock as soon as the upload is on the wire
//! - [`service`] - the orchestrator composing all of the above
//!
//! # Collaborator Seams
//!
//! The repository client ([`git::GitClient`]), registry clients
//! ([`registry::ChartRegistryClient`], [`registry::ArchiveRegistryClient`]),
//! cache store ([`cache::CacheStore`]), render engines
//! ([`render::TemplateEngine`], [`render::OverlayEngine`],
//! [`render::ScriptEngine`]) and plugin transport
//! ([`plugin::PluginRegistry`]) are traits; the crate ships a
//! subprocess-backed git client and an in-memory cache store, and the outer
//! server wires the rest.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use repogen::cache::InMemoryCacheStore;
//! use repogen::config::GenerationConfig;
//! use repogen::git::CliGitClient;
//! use repogen::service::{GenerationService, ManifestRequest};
//!
//! # async fn example(
//! #     chart_factory: repogen::registry::ChartClientFactory,
//! #     archive_factory: repogen::registry::ArchiveClientFactory,
//! #     engines: repogen::render::RenderEngines,
//! # ) -> anyhow::Result<()> {
//! let service = GenerationService::new(
//!     GenerationConfig::default(),
//!     Arc::new(InMemoryCacheStore::new()),
//!     CliGitClient::factory(),
//!     chart_factory,
//!     archive_factory,
//!     engines,
//! )?;
//! service.init().await?;
//!
//! let request = ManifestRequest {
//!     source: repogen::source::SourceRef {
//!         url: "https://github.com/example/deploys.git".into(),
//!         path: "apps/guestbook".into(),
//!         target_revision: "main".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! let response = service.generate_manifests(&request).await?;
//! println!("{} manifests at {}", response.manifests.len(), response.revision);
//! # Ok(())
//! # }
//! ```

pub mod acquire;
pub mod cache;
pub mod config;
pub mod constants;
pub mod core;
pub mod git;
pub mod lock;
pub mod models;
pub mod plugin;
pub mod registry;
pub mod render;
pub mod resolver;
pub mod service;
pub mod source;

pub use crate::core::RenderError;
