//! Raw-directory strategy: collect manifest-shaped files from the tree.
//!
//! The walk honors the request's `recurse`, `include` and `exclude` options,
//! accepts only regular files (or symlinks to in-tree regular files) with a
//! manifest extension, skips files carrying the skip-rendering marker, and
//! enforces a combined byte budget over everything that is not a script
//! file. Validation happens before any file is parsed so an oversized
//! directory fails cheaply.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::constants::SKIP_FILE_RENDERING_MARKER;
use crate::core::RenderError;
use crate::render::{split_yaml_or_json, Env, ScriptEngine, ScriptInvocation};
use crate::source::DirectoryOptions;

static MANIFEST_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.*\.(yaml|yml|json|jsonnet)$").unwrap());

/// Everything the raw-directory strategy needs from the orchestrator.
pub struct DirectoryContext<'a> {
    /// Application directory inside the tree.
    pub app_path: &'a Path,
    /// Root of the acquired tree; symlink targets must stay inside it.
    pub repo_root: &'a Path,
    /// Directory options from the request.
    pub options: &'a DirectoryOptions,
    /// Render environment, substituted into script bindings.
    pub env: &'a Env,
    /// Combined byte budget for non-script manifest files. Zero means
    /// unlimited.
    pub max_combined_bytes: u64,
}

struct CandidateFile {
    path: PathBuf,
    contents: String,
}

fn glob_matches(pattern: &str, rel: &Path) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| {
            p.matches_path_with(
                rel,
                glob::MatchOptions {
                    case_sensitive: true,
                    require_literal_separator: false,
                    require_literal_leading_dot: false,
                },
            )
        })
        .unwrap_or(false)
}

/// Collects candidate manifest files, applying every validation that does
/// not require parsing: extension, symlink bounds, regular-file-ness,
/// include/exclude globs, skip marker, and the combined size budget.
fn collect_candidates(ctx: &DirectoryContext<'_>) -> Result<Vec<CandidateFile>> {
    let mut walker = WalkDir::new(ctx.app_path).follow_links(false).sort_by_file_name();
    if !ctx.options.recurse {
        walker = walker.max_depth(1);
    }

    let canonical_root = ctx
        .repo_root
        .canonicalize()
        .with_context(|| format!("canonicalizing tree root {}", ctx.repo_root.display()))?;

    let mut combined_size: u64 = 0;
    let mut candidates = Vec::new();

    for entry in walker {
        let entry = entry.context("walking application directory")?;
        if entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy();
        if !MANIFEST_FILE.is_match(&file_name) {
            continue;
        }

        let rel = path.strip_prefix(ctx.app_path).unwrap_or(path);
        if !ctx.options.exclude.is_empty() && glob_matches(&ctx.options.exclude, rel) {
            continue;
        }
        if !ctx.options.include.is_empty() && !glob_matches(&ctx.options.include, rel) {
            continue;
        }

        // Only regular files, or symlinks to in-tree regular files, are
        // eligible; anything else has platform-specific size semantics.
        let real_metadata = if entry.path_is_symlink() {
            let real = match path.canonicalize() {
                Ok(real) => real,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(
                        target: "repogen::render",
                        "skipping manifest file {}: destination of symlink is missing",
                        rel.display()
                    );
                    continue;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to evaluate symlink at {}", rel.display()));
                }
            };
            if !real.starts_with(&canonical_root) {
                bail!("illegal filepath in symlink at {}", rel.display());
            }
            let metadata = std::fs::metadata(&real)
                .with_context(|| format!("reading symlink target metadata for {}", rel.display()))?;
            if !metadata.is_file() {
                tracing::warn!(
                    target: "repogen::render",
                    "ignoring symlink at {} to non-regular file",
                    rel.display()
                );
                continue;
            }
            metadata
        } else {
            entry.metadata().context("reading file metadata")?
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", rel.display()))?;
        if contents.contains(SKIP_FILE_RENDERING_MARKER) {
            continue;
        }

        // Script files manage their own memory; everything else counts
        // against the combined budget.
        if !file_name.ends_with(".jsonnet") {
            combined_size = combined_size.saturating_add(real_metadata.len());
            if ctx.max_combined_bytes != 0 && combined_size > ctx.max_combined_bytes {
                return Err(RenderError::CombinedSizeExceeded.into());
            }
        }

        candidates.push(CandidateFile { path: path.to_path_buf(), contents });
    }

    Ok(candidates)
}

fn looks_like_resource(contents: &str) -> bool {
    contents.contains("apiVersion:") && contents.contains("kind:") && contents.contains("metadata:")
}

fn parse_json_file(candidate: &CandidateFile) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(&candidate.contents)
        .with_context(|| format!("failed to unmarshal {:?}", candidate.path.file_name()))?;
    Ok(vec![value])
}

fn parse_yaml_file(candidate: &CandidateFile) -> Result<Vec<Value>> {
    match split_yaml_or_json(&candidate.contents) {
        Ok(values) => Ok(values),
        Err(err) => {
            // Unparseable YAML that doesn't look like a resource is treated
            // as an unrelated file and ignored.
            if looks_like_resource(&candidate.contents) {
                Err(err.context(format!("failed to unmarshal {:?}", candidate.path.file_name())))
            } else {
                tracing::debug!(
                    target: "repogen::render",
                    "ignoring non-manifest file {:?}",
                    candidate.path.file_name()
                );
                Ok(Vec::new())
            }
        }
    }
}

/// Renders the raw-directory strategy: collects, validates and parses the
/// manifest files under the application path.
pub async fn render_directory(
    script_engine: &dyn ScriptEngine,
    ctx: DirectoryContext<'_>,
) -> Result<Vec<Value>> {
    let candidates = collect_candidates(&ctx)?;

    let script_invocation = ScriptInvocation {
        search_paths: vec![ctx.app_path.to_path_buf()],
        tlas: ctx.env.substitute_vars(&ctx.options.script.tlas),
        ext_vars: ctx.env.substitute_vars(&ctx.options.script.ext_vars),
    };

    let mut resources = Vec::new();
    for candidate in candidates {
        let file_name = candidate.path.file_name().map(|n| n.to_string_lossy().to_string());
        if file_name.as_deref().is_some_and(|name| name.ends_with(".jsonnet")) {
            let json = script_engine
                .evaluate_file(&script_invocation, &candidate.path)
                .await
                .map_err(|err| anyhow::anyhow!("failed to evaluate {:?}: {err}", file_name))?;
            resources.extend(crate::render::script::parse_script_output(&json, &candidate.path)?);
        } else if file_name.as_deref().is_some_and(|name| name.ends_with(".json")) {
            resources.extend(parse_json_file(&candidate)?);
        } else {
            resources.extend(parse_yaml_file(&candidate)?);
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::EngineError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoScript;

    #[async_trait]
    impl ScriptEngine for NoScript {
        async fn evaluate_file(
            &self,
            _invocation: &ScriptInvocation,
            _file: &Path,
        ) -> Result<String, EngineError> {
            Err(EngineError::Failed("no script engine in this test".into()))
        }
    }

    fn ctx<'a>(tree: &'a TempDir, options: &'a DirectoryOptions, env: &'a Env) -> DirectoryContext<'a> {
        DirectoryContext {
            app_path: tree.path(),
            repo_root: tree.path(),
            options,
            env,
            max_combined_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_collects_yaml_and_json() {
        let tree = TempDir::new().unwrap();
        std::fs::write(
            tree.path().join("deploy.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n",
        )
        .unwrap();
        std::fs::write(tree.path().join("svc.json"), "{\"kind\": \"Service\"}").unwrap();
        std::fs::write(tree.path().join("README.md"), "docs").unwrap();

        let options = DirectoryOptions::default();
        let env = Env::default();
        let resources = render_directory(&NoScript, ctx(&tree, &options, &env)).await.unwrap();
        assert_eq!(resources.len(), 2);
    }

    #[tokio::test]
    async fn test_recurse_flag() {
        let tree = TempDir::new().unwrap();
        std::fs::create_dir_all(tree.path().join("nested")).unwrap();
        std::fs::write(tree.path().join("nested/deploy.yaml"), "kind: ConfigMap\n").unwrap();

        let options = DirectoryOptions::default();
        let env = Env::default();
        let resources = render_directory(&NoScript, ctx(&tree, &options, &env)).await.unwrap();
        assert!(resources.is_empty(), "non-recursive walk ignores nested files");

        let options = DirectoryOptions { recurse: true, ..Default::default() };
        let resources = render_directory(&NoScript, ctx(&tree, &options, &env)).await.unwrap();
        assert_eq!(resources.len(), 1);
    }

    #[tokio::test]
    async fn test_include_exclude_globs() {
        let tree = TempDir::new().unwrap();
        std::fs::write(tree.path().join("keep.yaml"), "kind: A\n").unwrap();
        std::fs::write(tree.path().join("drop.yaml"), "kind: B\n").unwrap();

        let env = Env::default();
        let options = DirectoryOptions { exclude: "drop.yaml".to_string(), ..Default::default() };
        let resources = render_directory(&NoScript, ctx(&tree, &options, &env)).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0]["kind"], "A");

        let options = DirectoryOptions { include: "keep.yaml".to_string(), ..Default::default() };
        let resources = render_directory(&NoScript, ctx(&tree, &options, &env)).await.unwrap();
        assert_eq!(resources.len(), 1);
    }

    #[tokio::test]
    async fn test_skip_marker() {
        let tree = TempDir::new().unwrap();
        std::fs::write(
            tree.path().join("skipped.yaml"),
            format!("# {SKIP_FILE_RENDERING_MARKER}\nkind: ConfigMap\n"),
        )
        .unwrap();

        let options = DirectoryOptions::default();
        let env = Env::default();
        let resources = render_directory(&NoScript, ctx(&tree, &options, &env)).await.unwrap();
        assert!(resources.is_empty());
    }

    #[tokio::test]
    async fn test_combined_size_budget() {
        let tree = TempDir::new().unwrap();
        std::fs::write(tree.path().join("a.yaml"), "kind: A\n".repeat(100)).unwrap();
        std::fs::write(tree.path().join("b.yaml"), "kind: B\n".repeat(100)).unwrap();

        let options = DirectoryOptions::default();
        let env = Env::default();
        let mut context = ctx(&tree, &options, &env);
        context.max_combined_bytes = 900;

        let err = render_directory(&NoScript, context).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>().unwrap(),
            RenderError::CombinedSizeExceeded
        ));
    }

    #[tokio::test]
    async fn test_unparseable_non_resource_yaml_is_ignored() {
        let tree = TempDir::new().unwrap();
        std::fs::write(tree.path().join("config.yaml"), "*unresolved-alias\n").unwrap();

        let options = DirectoryOptions::default();
        let env = Env::default();
        let resources = render_directory(&NoScript, ctx(&tree, &options, &env)).await.unwrap();
        assert!(resources.is_empty());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_to_out_of_tree_file_fails() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.yaml"), "kind: Secret\n").unwrap();

        let tree = TempDir::new().unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.yaml"),
            tree.path().join("link.yaml"),
        )
        .unwrap();

        let options = DirectoryOptions::default();
        let env = Env::default();
        let err = render_directory(&NoScript, ctx(&tree, &options, &env)).await.unwrap_err();
        assert!(err.to_string().contains("illegal filepath in symlink"));
    }
}
