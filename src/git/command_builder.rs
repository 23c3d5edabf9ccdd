//! Type-safe git command builder for consistent subprocess execution.
//!
//! This module provides a fluent API for building and executing git
//! commands, eliminating duplication and ensuring consistent timeout and
//! error handling across the repository client.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::GIT_COMMAND_TIMEOUT;
use crate::core::RenderError;

/// Builder for a single git subprocess invocation.
///
/// Working trees are addressed with `-C` rather than by changing the process
/// working directory, so concurrent invocations against different trees never
/// interfere. Commands default to a five-minute timeout and captured output.
pub struct GitCommand {
    args: Vec<String>,
    current_dir: Option<std::path::PathBuf>,
    env_vars: Vec<(String, String)>,
    timeout_duration: Option<Duration>,
    /// Context string included in debug logs to distinguish concurrent
    /// operations.
    context: Option<String>,
}

impl Default for GitCommand {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            current_dir: None,
            env_vars: Vec::new(),
            timeout_duration: Some(GIT_COMMAND_TIMEOUT),
            context: None,
        }
    }
}

/// Output from a completed git command.
pub struct GitCommandOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl GitCommand {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the repository the command runs against (via `-C`).
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the subprocess.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Overrides the default timeout (`None` disables it).
    pub const fn with_timeout(mut self, duration: Option<Duration>) -> Self {
        self.timeout_duration = duration;
        self
    }

    /// Attaches a context string included in debug logs.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Executes the command, capturing output.
    pub async fn execute(self) -> Result<GitCommandOutput> {
        let mut cmd = Command::new("git");

        let mut full_args = Vec::new();
        if let Some(ref dir) = self.current_dir {
            full_args.push("-C".to_string());
            full_args.push(dir.display().to_string());
        }
        full_args.extend(self.args.clone());
        cmd.args(&full_args);

        if let Some(ref ctx) = self.context {
            tracing::debug!(target: "repogen::git", "({}) git {}", ctx, full_args.join(" "));
        } else {
            tracing::debug!(target: "repogen::git", "git {}", full_args.join(" "));
        }

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        // Never let a subprocess block on an interactive credential prompt.
        cmd.env("GIT_TERMINAL_PROMPT", "0");

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());

        let operation = self.operation_name(&full_args);

        let output_future = cmd.output();
        let output = if let Some(duration) = self.timeout_duration {
            match timeout(duration, output_future).await {
                Ok(result) => {
                    result.with_context(|| format!("failed to execute git {}", full_args.join(" ")))?
                }
                Err(_) => {
                    tracing::warn!(
                        target: "repogen::git",
                        "command timed out after {}s: git {}",
                        duration.as_secs(),
                        full_args.join(" ")
                    );
                    return Err(RenderError::GitCommandError {
                        operation,
                        stderr: format!("git command timed out after {} seconds", duration.as_secs()),
                    }
                    .into());
                }
            }
        } else {
            output_future
                .await
                .with_context(|| format!("failed to execute git {}", full_args.join(" ")))?
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            tracing::debug!(
                target: "repogen::git",
                "git {} failed with exit code {:?}: {}",
                operation,
                output.status.code(),
                stderr.trim()
            );
            return Err(RenderError::GitCommandError {
                operation,
                stderr: if stderr.is_empty() { stdout } else { stderr },
            }
            .into());
        }

        Ok(GitCommandOutput { stdout, stderr })
    }

    /// Executes the command and returns trimmed stdout.
    pub async fn execute_stdout(self) -> Result<String> {
        let output = self.execute().await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Executes the command, discarding output.
    pub async fn execute_success(self) -> Result<()> {
        self.execute().await?;
        Ok(())
    }

    fn operation_name(&self, full_args: &[String]) -> String {
        let skip = if full_args.first().map(String::as_str) == Some("-C") { 2 } else { 0 };
        full_args.get(skip).cloned().unwrap_or_else(|| "unknown".to_string())
    }
}

// Convenience builders for the operations the repository client needs.

impl GitCommand {
    /// `git init` in the tree root.
    pub fn init() -> Self {
        Self::new().arg("init")
    }

    /// `git fetch origin` of the default refspec plus tags. Fetching
    /// without an explicit revision avoids repository bloat from
    /// single-commit refspecs.
    pub fn fetch_default() -> Self {
        Self::new().args(["fetch", "origin", "--tags", "--force", "--prune"])
    }

    /// `git fetch origin <refspec>` for a revision the default refspec
    /// missed.
    pub fn fetch_ref(refspec: &str) -> Self {
        Self::new().args(["fetch", "origin", refspec, "--tags", "--force"])
    }

    /// Forced checkout of a revision.
    pub fn checkout(rev: &str) -> Self {
        Self::new().args(["checkout", "--force", rev])
    }

    /// Removes untracked files and directories left by a previous render.
    pub fn clean() -> Self {
        Self::new().args(["clean", "-ffdx"])
    }

    /// Initializes and updates submodules recursively.
    pub fn submodule_update() -> Self {
        Self::new().args(["submodule", "update", "--init", "--recursive"])
    }

    /// Resolves a ref against the remote without fetching.
    pub fn ls_remote(url: &str, rev: &str) -> Self {
        Self::new().args(["ls-remote", url, rev])
    }

    /// Lists remote heads and tags.
    pub fn ls_remote_refs(url: &str) -> Self {
        Self::new().args(["ls-remote", "--heads", "--tags", url])
    }

    /// Lists tracked files matching a pathspec.
    pub fn ls_files(pattern: &str) -> Self {
        Self::new().args(["ls-files", "--", pattern])
    }

    /// `git rev-parse` of a revision.
    pub fn rev_parse(rev: &str) -> Self {
        Self::new().args(["rev-parse", rev])
    }

    /// Checks whether an object is present locally.
    pub fn object_type(rev: &str) -> Self {
        Self::new().args(["cat-file", "-t", rev])
    }

    /// Commit metadata in a fixed parseable format.
    pub fn show_metadata(rev: &str) -> Self {
        Self::new().args(["show", "-s", "--format=%an <%ae>%n%aI%n%B", rev])
    }

    /// Tags pointing at a commit.
    pub fn tags_pointing_at(rev: &str) -> Self {
        Self::new().args(["tag", "--points-at", rev])
    }

    /// Object type of a tag ref; annotated tags report `tag`.
    pub fn tag_object_type(tag: &str) -> Self {
        Self::new().args([
            "for-each-ref".to_string(),
            format!("refs/tags/{tag}"),
            "--format=%(objecttype)".to_string(),
        ])
    }

    /// Signature verification of a commit.
    pub fn verify_commit(rev: &str) -> Self {
        Self::new().args(["verify-commit", "--raw", rev])
    }

    /// Signature verification of an annotated tag.
    pub fn verify_tag(tag: &str) -> Self {
        Self::new().args(["verify-tag", "--raw", tag])
    }

    /// Paths changed between two revisions.
    pub fn diff_name_only(old: &str, new: &str) -> Self {
        Self::new().args(["diff", "--name-only", &format!("{old}..{new}")])
    }

    /// Origin URL configured for the tree.
    pub fn remote_url() -> Self {
        Self::new().args(["remote", "get-url", "origin"])
    }

    /// Points origin at a URL, adding the remote when absent.
    pub fn set_remote_url(url: &str) -> Self {
        Self::new().args(["remote", "set-url", "origin", url])
    }

    /// Adds the origin remote.
    pub fn add_remote(url: &str) -> Self {
        Self::new().args(["remote", "add", "origin", url])
    }
}
