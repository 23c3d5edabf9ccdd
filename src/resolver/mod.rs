//! Revision resolution: ambiguous references to concrete identifiers.
//!
//! A request may target a branch name, a tag, a semver range, or a floating
//! archive tag. Before anything touches disk the resolver turns that into an
//! immutable identifier: a commit hash for repositories, the maximum
//! satisfying version for charts, a content digest for archives. Resolution
//! results are cached briefly so a burst of requests for the same branch
//! costs one network round-trip; `no_revision_cache` bypasses that cache.
//!
//! Resolution never falls back silently: an unresolvable reference is a
//! [`RenderError::ResolveFailure`].
//!
//! The multi-source cross-resolver lives here too: it maps each `$token`
//! reference in template value files to a `{canonical URL → resolved
//! revision}` entry and enforces the cross-repository consistency rules.

use anyhow::Result;
use async_trait::async_trait;
use semver::{Version, VersionReq};
use std::collections::{BTreeMap, HashMap};

use crate::cache::RenderCache;
use crate::core::RenderError;
use crate::git::{is_commit_sha, normalize_git_url, GitClient};
use crate::registry::{ArchiveRegistryClient, ChartRegistryClient};
use crate::source::{TemplateFileParameter, TemplateOptions};

/// A source that other sources in the same request may point at via its
/// `ref` token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefTarget {
    /// Repository URL of the referenced source.
    pub repo_url: String,
    /// Its target revision (possibly ambiguous).
    pub target_revision: String,
    /// Chart name; non-empty values make the target unreferenceable.
    pub chart: String,
}

/// One resolved cross-reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencedSource {
    /// The `$token` that referenced the repository first.
    pub token: String,
    /// The target revision named by that token.
    pub target_revision: String,
    /// The revision it resolved to.
    pub resolved: String,
    /// Original (non-normalized) repository URL, used for acquisition.
    pub repo_url: String,
}

/// Output of cross-resolution: the CrossRef map feeding the cache key plus
/// the per-repository detail needed for acquisition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrossResolution {
    /// Canonical URL to resolved revision; exactly one revision per URL.
    pub revisions: BTreeMap<String, String>,
    /// Canonical URL to full reference detail.
    pub entries: BTreeMap<String, ReferencedSource>,
}

/// Resolves the target revision of one referenced repository. The
/// orchestrator implements this over its client factory so the
/// cross-resolver stays independent of tree placement.
#[async_trait]
pub trait RefRevisionResolver: Send + Sync {
    /// Resolves `target.target_revision` against `target.repo_url`.
    async fn resolve(&self, target: &RefTarget) -> Result<String>;
}

/// Resolver for ambiguous revisions, with a short-lived resolution cache.
#[derive(Clone)]
pub struct RevisionResolver {
    cache: RenderCache,
}

impl RevisionResolver {
    /// Creates a resolver backed by the given cache.
    #[must_use]
    pub fn new(cache: RenderCache) -> Self {
        Self { cache }
    }

    /// Resolves a repository revision to a commit hash.
    ///
    /// A 40-character hex input is accepted verbatim without touching the
    /// network or the cache.
    pub async fn resolve_repo_revision(
        &self,
        client: &dyn GitClient,
        ambiguous: &str,
        no_revision_cache: bool,
    ) -> Result<String> {
        if is_commit_sha(ambiguous) {
            return Ok(ambiguous.to_string());
        }
        let url = normalize_git_url(client.url());
        if !no_revision_cache {
            if let Some(cached) = self.cache.get_resolved_revision(&url, ambiguous).await {
                tracing::debug!(target: "repogen::resolver", "revision cache hit: {url}@{ambiguous}");
                return Ok(cached);
            }
        }
        let resolved = client.ls_remote(ambiguous).await.map_err(|err| {
            RenderError::ResolveFailure {
                url: client.url().to_string(),
                revision: ambiguous.to_string(),
                reason: format!("{err:#}"),
            }
        })?;
        self.cache.set_resolved_revision(&url, ambiguous, &resolved).await;
        Ok(resolved)
    }

    /// Resolves a chart constraint to the maximum satisfying published
    /// version. A fully qualified semver input is accepted verbatim.
    pub async fn resolve_chart_version(
        &self,
        client: &dyn ChartRegistryClient,
        chart: &str,
        constraint: &str,
        no_revision_cache: bool,
    ) -> Result<String> {
        if Version::parse(constraint.trim_start_matches('v')).is_ok() {
            return Ok(constraint.to_string());
        }
        let cache_key = format!("{}#{chart}", normalize_git_url(client.url()));
        if !no_revision_cache {
            if let Some(cached) = self.cache.get_resolved_revision(&cache_key, constraint).await {
                return Ok(cached);
            }
        }
        let versions = client.list_versions(chart, no_revision_cache).await.map_err(|err| {
            RenderError::ResolveFailure {
                url: client.url().to_string(),
                revision: constraint.to_string(),
                reason: format!("{err:#}"),
            }
        })?;
        let resolved = max_satisfying(&versions, constraint).ok_or_else(|| {
            RenderError::ResolveFailure {
                url: client.url().to_string(),
                revision: constraint.to_string(),
                reason: format!("no version satisfies constraint out of {} published", versions.len()),
            }
        })?;
        self.cache.set_resolved_revision(&cache_key, constraint, &resolved).await;
        Ok(resolved)
    }

    /// Resolves an archive reference (tag or digest) to its canonical
    /// digest.
    pub async fn resolve_archive_digest(
        &self,
        client: &dyn ArchiveRegistryClient,
        reference: &str,
        no_revision_cache: bool,
    ) -> Result<String> {
        let url = normalize_git_url(client.url());
        if !no_revision_cache {
            if let Some(cached) = self.cache.get_resolved_revision(&url, reference).await {
                return Ok(cached);
            }
        }
        let digest = client.resolve_digest(reference, no_revision_cache).await.map_err(|err| {
            RenderError::ResolveFailure {
                url: client.url().to_string(),
                revision: reference.to_string(),
                reason: format!("{err:#}"),
            }
        })?;
        self.cache.set_resolved_revision(&url, reference, &digest).await;
        Ok(digest)
    }
}

/// Picks the maximum version satisfying a constraint string.
///
/// An empty constraint or `*` matches every parseable version. Leading `v`
/// prefixes are tolerated on both sides; the returned string keeps its
/// published form.
#[must_use]
pub fn max_satisfying(versions: &[String], constraint: &str) -> Option<String> {
    let constraint = constraint.trim();
    let requirement = if constraint.is_empty() || constraint == "*" {
        None
    } else {
        Some(VersionReq::parse(constraint.trim_start_matches('v')).ok()?)
    };

    let mut best: Option<(Version, &String)> = None;
    for raw in versions {
        let Ok(parsed) = Version::parse(raw.trim_start_matches('v')) else {
            continue;
        };
        if let Some(req) = &requirement {
            if !req.matches(&parsed) {
                continue;
            }
        }
        let better = match &best {
            Some((best_version, _)) => parsed > *best_version,
            None => true,
        };
        if better {
            best = Some((parsed, raw));
        }
    }
    best.map(|(_, raw)| raw.clone())
}

/// Collects the `$`-prefixed value-file candidates of a template source.
fn ref_candidates<'a>(
    value_files: &'a [String],
    file_parameters: &'a [TemplateFileParameter],
) -> impl Iterator<Item = &'a str> {
    value_files
        .iter()
        .map(String::as_str)
        .chain(file_parameters.iter().map(|p| p.path.as_str()))
        .filter(|path| path.starts_with('$'))
}

/// Resolves every repository referenced through `$token` value-file paths
/// and enforces the cross-repository consistency rules.
///
/// `primary` is the `(canonical URL, resolved revision)` of the request's
/// own source when known; a reference to the same repository must resolve to
/// the same commit.
pub async fn resolve_referenced_sources(
    template: Option<&TemplateOptions>,
    ref_sources: &HashMap<String, RefTarget>,
    primary: Option<(&str, &str, &str)>,
    resolver: &dyn RefRevisionResolver,
) -> Result<CrossResolution> {
    let mut resolution = CrossResolution::default();
    let Some(template) = template else {
        return Ok(resolution);
    };

    for candidate in ref_candidates(&template.value_files, &template.file_parameters) {
        let token = candidate.split('/').next().unwrap_or(candidate);

        let Some(target) = ref_sources.get(token) else {
            let mut available: Vec<&str> = ref_sources.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Err(RenderError::UnresolvedReference {
                token: token.to_string(),
                available: if available.is_empty() {
                    "no sources declare a ref".to_string()
                } else {
                    available.join(", ")
                },
            }
            .into());
        };
        if !target.chart.is_empty() {
            return Err(RenderError::ReferenceNotAllowed { token: token.to_string() }.into());
        }

        let canonical = normalize_git_url(&target.repo_url);
        if let Some(existing) = resolution.entries.get(&canonical) {
            if existing.target_revision != target.target_revision {
                return Err(RenderError::InconsistentReferenceRevisions {
                    token: token.to_string(),
                    revision: target.target_revision.clone(),
                    other_token: existing.token.clone(),
                    other_revision: existing.target_revision.clone(),
                }
                .into());
            }
            continue;
        }

        let resolved = resolver.resolve(target).await?;

        if let Some((primary_url, primary_revision, primary_resolved)) = primary {
            if canonical == primary_url && resolved != primary_resolved {
                return Err(RenderError::InconsistentPrimaryReference {
                    token: token.to_string(),
                    revision: target.target_revision.clone(),
                    resolved,
                    primary_revision: primary_revision.to_string(),
                    primary_resolved: primary_resolved.to_string(),
                }
                .into());
            }
        }

        resolution.revisions.insert(canonical.clone(), resolved.clone());
        resolution.entries.insert(
            canonical,
            ReferencedSource {
                token: token.to_string(),
                target_revision: target.target_revision.clone(),
                resolved,
                repo_url: target.repo_url.clone(),
            },
        );
    }

    Ok(resolution)
}
