//! Repository client abstraction and its subprocess-backed implementation.
//!
//! The core consumes repositories through the [`GitClient`] trait so tests
//! and alternative transports can substitute their own backends. The shipped
//! [`CliGitClient`] shells out to the system `git` binary through
//! [`GitCommand`], the same way a human operator would, which keeps
//! authentication and proxy behavior identical to the surrounding tooling.
//!
//! A client is bound to one working tree on disk. It never chooses the tree
//! location itself; the acquisition layer assigns randomized roots and the
//! lock manager serializes which revision a tree holds.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::models::{RemoteRefs, RevisionMetadata};

pub mod command_builder;
pub use command_builder::GitCommand;

/// Produces a repository client for a URL rooted at a working tree path.
///
/// The orchestrator owns the mapping from URL to randomized tree root; the
/// factory only wires a transport to that location.
pub type GitClientFactory = Arc<dyn Fn(&str, PathBuf) -> Arc<dyn GitClient> + Send + Sync>;

/// Operations the core needs from a repository backend.
#[async_trait]
pub trait GitClient: Send + Sync {
    /// Root of the working tree this client operates on.
    fn root(&self) -> &Path;

    /// Remote URL this client talks to.
    fn url(&self) -> &str;

    /// Initializes the working tree (idempotent) and points origin at the
    /// remote URL.
    async fn init(&self) -> Result<()>;

    /// Fetches from origin. `None` fetches the default refspec plus tags;
    /// `Some(refspec)` fetches one ref explicitly.
    async fn fetch(&self, refspec: Option<&str>) -> Result<()>;

    /// Checks out a revision, returning the commit hash of the resulting
    /// `HEAD`.
    async fn checkout(&self, rev: &str, submodules: bool) -> Result<String>;

    /// Whether the object for a revision is already present locally.
    async fn is_revision_present(&self, rev: &str) -> bool;

    /// Resolves a ref against the remote without fetching objects.
    async fn ls_remote(&self, rev: &str) -> Result<String>;

    /// Branches and tags advertised by the remote.
    async fn ls_refs(&self) -> Result<RemoteRefs>;

    /// Tracked files matching a pathspec, relative to the tree root.
    async fn ls_files(&self, pattern: &str) -> Result<Vec<String>>;

    /// Commit metadata for a revision present locally.
    async fn revision_metadata(&self, rev: &str) -> Result<RevisionMetadata>;

    /// Verifies the signature on a commit or annotated tag, returning the
    /// verifier's raw output.
    async fn verify_commit_signature(&self, rev: &str) -> Result<String>;

    /// Paths changed between two revisions.
    async fn changed_files(&self, old: &str, new: &str) -> Result<Vec<String>>;

    /// Whether a revision names an annotated tag.
    async fn is_annotated_tag(&self, rev: &str) -> bool;

    /// Commit hash of the currently checked-out `HEAD`.
    async fn commit_sha(&self) -> Result<String>;
}

/// Returns true when the string is a full 40-character hex commit hash.
#[must_use]
pub fn is_commit_sha(rev: &str) -> bool {
    rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

/// Canonicalizes a repository URL for map keys and cross-reference
/// comparisons: whitespace trimmed, `.git` suffix and trailing slashes
/// dropped, lowercased.
#[must_use]
pub fn normalize_git_url(url: &str) -> String {
    let mut url = url.trim().trim_end_matches('/');
    if let Some(stripped) = url.strip_suffix(".git") {
        url = stripped;
    }
    url.trim_end_matches('/').to_ascii_lowercase()
}

/// Reads the configured origin URL of an existing working tree. Used by the
/// startup scan to re-associate surviving trees with their repositories.
pub async fn remote_origin_url(root: &Path) -> Result<String> {
    GitCommand::remote_url().current_dir(root).execute_stdout().await
}

/// Repository client backed by the system `git` binary.
pub struct CliGitClient {
    url: String,
    root: PathBuf,
}

impl CliGitClient {
    /// Creates a client for `url` operating on the tree at `root`.
    pub fn new(url: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self { url: url.into(), root: root.into() }
    }

    /// The default factory wiring [`CliGitClient`] into the service.
    #[must_use]
    pub fn factory() -> GitClientFactory {
        Arc::new(|url: &str, root: PathBuf| Arc::new(Self::new(url, root)) as Arc<dyn GitClient>)
    }

    async fn ensure_origin(&self) -> Result<()> {
        let current = GitCommand::remote_url().current_dir(&self.root).execute_stdout().await;
        match current {
            Ok(existing) if existing == self.url => Ok(()),
            Ok(_) => {
                GitCommand::set_remote_url(&self.url).current_dir(&self.root).execute_success().await
            }
            Err(_) => GitCommand::add_remote(&self.url).current_dir(&self.root).execute_success().await,
        }
    }
}

#[async_trait]
impl GitClient for CliGitClient {
    fn root(&self) -> &Path {
        &self.root
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating working tree root {}", self.root.display()))?;
        if !self.root.join(".git").exists() {
            GitCommand::init().current_dir(&self.root).execute_success().await?;
        }
        self.ensure_origin().await
    }

    async fn fetch(&self, refspec: Option<&str>) -> Result<()> {
        let cmd = match refspec {
            Some(refspec) => GitCommand::fetch_ref(refspec),
            None => GitCommand::fetch_default(),
        };
        cmd.current_dir(&self.root).execute_success().await
    }

    async fn checkout(&self, rev: &str, submodules: bool) -> Result<String> {
        GitCommand::checkout(rev).current_dir(&self.root).execute_success().await?;
        if submodules {
            GitCommand::submodule_update().current_dir(&self.root).execute_success().await?;
        }
        // Drop untracked leftovers (dependency-build markers, rendered
        // artifacts) so the tree matches the revision exactly.
        GitCommand::clean().current_dir(&self.root).execute_success().await?;
        self.commit_sha().await
    }

    async fn is_revision_present(&self, rev: &str) -> bool {
        GitCommand::object_type(rev).current_dir(&self.root).execute_success().await.is_ok()
    }

    async fn ls_remote(&self, rev: &str) -> Result<String> {
        let rev = if rev.is_empty() { "HEAD" } else { rev };
        // No -C here: the query runs against the remote and must work before
        // the working tree exists.
        let output = GitCommand::ls_remote(&self.url, rev).execute_stdout().await?;

        let mut refs: HashMap<String, String> = HashMap::new();
        for line in output.lines() {
            if let Some((sha, name)) = line.split_once('\t') {
                refs.insert(name.trim().to_string(), sha.trim().to_string());
            }
        }

        // Peeled annotated tags point at the commit, so they win over the
        // tag object itself.
        let candidates = [
            format!("refs/heads/{rev}"),
            format!("refs/tags/{rev}^{{}}"),
            format!("refs/tags/{rev}"),
            rev.to_string(),
        ];
        for candidate in &candidates {
            if let Some(sha) = refs.get(candidate) {
                return Ok(sha.clone());
            }
        }

        if is_commit_sha(rev) {
            return Ok(rev.to_string());
        }
        Err(anyhow!("unable to resolve {rev:?} to a commit SHA against {}", self.url))
    }

    async fn ls_refs(&self) -> Result<RemoteRefs> {
        let output = GitCommand::ls_remote_refs(&self.url).execute_stdout().await?;
        let mut refs = RemoteRefs::default();
        for line in output.lines() {
            let Some((_, name)) = line.split_once('\t') else { continue };
            let name = name.trim();
            if name.ends_with("^{}") {
                continue;
            }
            if let Some(branch) = name.strip_prefix("refs/heads/") {
                refs.branches.push(branch.to_string());
            } else if let Some(tag) = name.strip_prefix("refs/tags/") {
                refs.tags.push(tag.to_string());
            }
        }
        Ok(refs)
    }

    async fn ls_files(&self, pattern: &str) -> Result<Vec<String>> {
        let output =
            GitCommand::ls_files(pattern).current_dir(&self.root).execute_stdout().await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    async fn revision_metadata(&self, rev: &str) -> Result<RevisionMetadata> {
        let output = GitCommand::show_metadata(rev).current_dir(&self.root).execute_stdout().await?;
        let mut lines = output.lines();
        let author = lines.next().unwrap_or_default().to_string();
        let date = lines
            .next()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&chrono::Utc));
        let message = lines.collect::<Vec<_>>().join("\n").trim().to_string();

        let tags_output =
            GitCommand::tags_pointing_at(rev).current_dir(&self.root).execute_stdout().await?;
        let tags = tags_output.lines().map(str::to_string).filter(|t| !t.is_empty()).collect();

        Ok(RevisionMetadata { author, date, tags, message, references: Vec::new() })
    }

    async fn verify_commit_signature(&self, rev: &str) -> Result<String> {
        let annotated = self.is_annotated_tag(rev).await;
        let cmd = if annotated { GitCommand::verify_tag(rev) } else { GitCommand::verify_commit(rev) };
        let output = cmd.current_dir(&self.root).execute().await?;
        // gpg writes verification details to stderr.
        Ok(if output.stderr.is_empty() { output.stdout } else { output.stderr })
    }

    async fn changed_files(&self, old: &str, new: &str) -> Result<Vec<String>> {
        let output = GitCommand::diff_name_only(old, new)
            .current_dir(&self.root)
            .execute_stdout()
            .await?;
        Ok(output.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    async fn is_annotated_tag(&self, rev: &str) -> bool {
        GitCommand::tag_object_type(rev)
            .current_dir(&self.root)
            .execute_stdout()
            .await
            .map(|object_type| object_type == "tag")
            .unwrap_or(false)
    }

    async fn commit_sha(&self) -> Result<String> {
        GitCommand::rev_parse("HEAD").current_dir(&self.root).execute_stdout().await
    }
}
