//! Template strategy: value-file resolution, parameter collection, and the
//! once-per-tree dependency build.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::acquire::paths::{self, RandomizedTempPaths};
use crate::constants::{DEP_BUILD_MARKER_FILE, MAX_RELEASE_NAME_LEN};
use crate::core::RenderError;
use crate::git::normalize_git_url;
use crate::lock::KeyedLocks;
use crate::models::AppIdentity;
use crate::render::{split_yaml_or_json, EngineError, Env, RenderStrategy, TemplateEngine, TemplateInvocation};
use crate::resolver::RefTarget;
use crate::source::TemplateOptions;

/// Everything the template strategy needs from the orchestrator.
pub struct TemplateContext<'a> {
    /// Application directory inside the tree.
    pub app_path: &'a Path,
    /// Root of the acquired tree.
    pub repo_root: &'a Path,
    /// Render environment.
    pub env: &'a Env,
    /// Template options from the request, if any.
    pub options: Option<&'a TemplateOptions>,
    /// Application identity (release name fallback, namespace default).
    pub app: &'a AppIdentity,
    /// Kubernetes version from the request, overridable per source.
    pub kube_version: &'a str,
    /// API versions from the request, overridable per source.
    pub api_versions: &'a [String],
    /// Declared `$token` reference targets.
    pub ref_sources: &'a HashMap<String, RefTarget>,
    /// Mapping from canonical URL to acquired tree path, for `$token`
    /// value-file resolution.
    pub repo_paths: &'a RandomizedTempPaths,
    /// URL schemes permitted for remote value files.
    pub allowed_schemes: &'a [String],
    /// Per-path mutexes guarding dependency builds.
    pub dep_build_locks: &'a KeyedLocks,
}

/// Coerces an application name into a valid release name: at most 53
/// characters, no underscores.
#[must_use]
pub fn coerce_release_name(name: &str) -> String {
    let cleaned = name.replace('_', "-");
    let mut truncated = cleaned;
    truncated.truncate(MAX_RELEASE_NAME_LEN);
    truncated.trim_end_matches('-').to_string()
}

/// Resolves one raw value-file string to an absolute path or allowed URL.
///
/// `$token/...` paths resolve inside the referenced repository's acquired
/// tree; environment substitution happens after the token is stripped so a
/// variable can never fabricate a reference.
fn resolve_value_file(
    raw: &str,
    ctx: &TemplateContext<'_>,
) -> Result<Option<String>> {
    if let Some(token) = raw.strip_prefix('$').and_then(|_| raw.split('/').next()) {
        if let Some(target) = ctx.ref_sources.get(token) {
            let canonical = normalize_git_url(&target.repo_url);
            let repo_path = ctx.repo_paths.get_if_exists(&canonical).ok_or_else(|| {
                anyhow::anyhow!("failed to find repo {:?}", target.repo_url)
            })?;
            let rest = raw.strip_prefix(token).unwrap_or("").trim_start_matches('/');
            let resolved =
                paths::resolve_within(&repo_path, &repo_path, &ctx.env.envsubst(rest))?;
            return Ok(Some(resolved.display().to_string()));
        }
        // A $-prefixed path with no matching ref falls through to ordinary
        // resolution; cross-resolution has already rejected genuinely
        // unresolved tokens for multi-source requests.
    }

    let substituted = ctx.env.envsubst(raw);
    if let Some(url) = paths::remote_value_file(&substituted, ctx.allowed_schemes)? {
        return Ok(Some(url));
    }
    let resolved = paths::resolve_within(ctx.repo_root, ctx.app_path, &substituted)?;
    Ok(Some(resolved.display().to_string()))
}

/// Runs the engine's dependency build at most once per tree.
///
/// The keyed mutex serializes tasks inside this process; the marker file
/// short-circuits repeats across processes until the tree switches
/// revisions (checkout cleans untracked files, removing the marker).
async fn build_dependencies_once(
    engine: &dyn TemplateEngine,
    app_path: &Path,
    locks: &KeyedLocks,
) -> Result<(), EngineError> {
    let _guard = locks.lock(app_path).await;

    let marker = app_path.join(DEP_BUILD_MARKER_FILE);
    if marker.exists() {
        return Ok(());
    }

    engine.build_dependencies(app_path).await?;

    std::fs::File::create(&marker)
        .and_then(|mut file| file.write_all(b"marker"))
        .map_err(|err| EngineError::Failed(format!("writing dependency-build marker: {err}")))?;
    Ok(())
}

/// Renders the template strategy, returning parsed resources and the
/// display command.
pub async fn render_template(
    engine: &dyn TemplateEngine,
    ctx: TemplateContext<'_>,
) -> Result<(Vec<Value>, String)> {
    let mut invocation = TemplateInvocation {
        app_path: ctx.app_path.to_path_buf(),
        release_name: coerce_release_name(&ctx.app.app_name),
        namespace: ctx.app.namespace.clone(),
        kube_version: ctx.kube_version.to_string(),
        api_versions: ctx.api_versions.to_vec(),
        env: ctx.env.vars().to_vec(),
        ..Default::default()
    };

    // Holds the inline-values temp file open for the duration of the render.
    let mut extra_values_guard = None;

    if let Some(options) = ctx.options {
        if !options.release_name.is_empty() {
            invocation.release_name = coerce_release_name(&options.release_name);
        }
        if !options.namespace.is_empty() {
            invocation.namespace = options.namespace.clone();
        }
        if !options.kube_version.is_empty() {
            invocation.kube_version = options.kube_version.clone();
        }
        if !options.api_versions.is_empty() {
            invocation.api_versions = options.api_versions.clone();
        }
        invocation.version_hint = options.version.clone();
        invocation.skip_crds = options.skip_crds;
        invocation.skip_tests = options.skip_tests;
        invocation.skip_schema_validation = options.skip_schema_validation;

        for raw in &options.value_files {
            match resolve_value_file(raw, &ctx) {
                Ok(Some(resolved)) => {
                    let missing = !resolved.contains("://") && !Path::new(&resolved).exists();
                    if missing && options.ignore_missing_value_files {
                        tracing::debug!(
                            target: "repogen::render",
                            "values file {resolved} does not exist"
                        );
                        continue;
                    }
                    invocation.value_files.push(resolved);
                }
                Ok(None) => {}
                Err(err) => return Err(err.context("error resolving value file path")),
            }
        }

        if options.has_inline_values() {
            let mut file = tempfile::NamedTempFile::new()
                .context("error creating temp file for inline values")?;
            file.write_all(options.values.as_bytes())
                .context("error writing inline values file")?;
            invocation.extra_values_file = Some(file.path().to_path_buf());
            extra_values_guard = Some(file);
        }

        for parameter in &options.parameters {
            let value = ctx.env.envsubst(&parameter.value);
            if parameter.force_string {
                invocation.set_string.push((parameter.name.clone(), value));
            } else {
                invocation.set.push((parameter.name.clone(), value));
            }
        }
        for parameter in &options.file_parameters {
            let resolved = resolve_value_file(&parameter.path, &ctx)
                .context("error resolving file parameter path")?
                .ok_or_else(|| anyhow::anyhow!("unresolvable file parameter {:?}", parameter.path))?;
            invocation.set_file.push((parameter.name.clone(), resolved.into()));
        }
    }

    let output = match engine.template(&invocation).await {
        Ok(output) => output,
        Err(EngineError::MissingDependency(detail)) => {
            tracing::debug!(
                target: "repogen::render",
                "dependency build required for {}: {detail}",
                ctx.app_path.display()
            );
            build_dependencies_once(engine, ctx.app_path, ctx.dep_build_locks)
                .await
                .map_err(|err| RenderError::RenderFailure {
                    strategy: RenderStrategy::Template,
                    detail: format!("error building chart dependencies: {err}"),
                })?;
            engine.template(&invocation).await.map_err(|err| RenderError::RenderFailure {
                strategy: RenderStrategy::Template,
                detail: err.to_string(),
            })?
        }
        Err(err) => {
            return Err(RenderError::RenderFailure {
                strategy: RenderStrategy::Template,
                detail: err.to_string(),
            }
            .into());
        }
    };

    let resources = split_yaml_or_json(&output.manifests)?;

    let mut command = output.command;
    for path in ctx.repo_paths.all_paths() {
        command = command.replace(&path.display().to_string(), ".");
    }
    if let Some(extra) = &extra_values_guard {
        command = command.replace(
            &extra.path().display().to_string(),
            "<temp file with inline values>",
        );
    }

    Ok((resources, command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct RecordingEngine {
        outputs: Mutex<Vec<Result<crate::render::EngineOutput, EngineError>>>,
        dependency_builds: AtomicUsize,
        invocations: Mutex<Vec<TemplateInvocation>>,
    }

    impl RecordingEngine {
        fn returning(outputs: Vec<Result<crate::render::EngineOutput, EngineError>>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                dependency_builds: AtomicUsize::new(0),
                invocations: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TemplateEngine for RecordingEngine {
        async fn template(
            &self,
            invocation: &TemplateInvocation,
        ) -> Result<crate::render::EngineOutput, EngineError> {
            self.invocations.lock().unwrap().push(invocation.clone());
            self.outputs.lock().unwrap().remove(0)
        }

        async fn build_dependencies(&self, _app_path: &Path) -> Result<(), EngineError> {
            self.dependency_builds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ok_output(yaml: &str) -> Result<crate::render::EngineOutput, EngineError> {
        Ok(crate::render::EngineOutput {
            manifests: yaml.to_string(),
            command: "template .".to_string(),
        })
    }

    fn context<'a>(
        tree: &'a TempDir,
        env: &'a Env,
        app: &'a AppIdentity,
        options: Option<&'a TemplateOptions>,
        repo_paths: &'a RandomizedTempPaths,
        ref_sources: &'a HashMap<String, RefTarget>,
        locks: &'a KeyedLocks,
        schemes: &'a [String],
    ) -> TemplateContext<'a> {
        TemplateContext {
            app_path: tree.path(),
            repo_root: tree.path(),
            env,
            options,
            app,
            kube_version: "1.31",
            api_versions: &[],
            ref_sources,
            repo_paths,
            allowed_schemes: schemes,
            dep_build_locks: locks,
        }
    }

    #[test]
    fn test_coerce_release_name() {
        assert_eq!(coerce_release_name("my_app"), "my-app");
        let long = "a".repeat(80);
        assert_eq!(coerce_release_name(&long).len(), MAX_RELEASE_NAME_LEN);
        assert_eq!(coerce_release_name("app"), "app");
    }

    #[tokio::test]
    async fn test_missing_dependency_triggers_one_build_and_retry() {
        let tree = TempDir::new().unwrap();
        let engine = RecordingEngine::returning(vec![
            Err(EngineError::MissingDependency("chart.lock out of date".into())),
            ok_output("kind: ConfigMap\nmetadata:\n  name: cm\n"),
        ]);
        let env = Env::default();
        let app = AppIdentity { app_name: "demo".into(), ..Default::default() };
        let repo_paths = RandomizedTempPaths::new(std::env::temp_dir());
        let ref_sources = HashMap::new();
        let locks = KeyedLocks::new();
        let schemes = vec!["https".to_string()];

        let ctx = context(&tree, &env, &app, None, &repo_paths, &ref_sources, &locks, &schemes);
        let (resources, _) = render_template(&engine, ctx).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(engine.dependency_builds.load(Ordering::SeqCst), 1);
        assert!(tree.path().join(DEP_BUILD_MARKER_FILE).exists());

        // A second render in the same tree skips the build via the marker.
        let engine2 = RecordingEngine::returning(vec![
            Err(EngineError::MissingDependency("still missing".into())),
            ok_output("kind: ConfigMap\nmetadata:\n  name: cm\n"),
        ]);
        let ctx = context(&tree, &env, &app, None, &repo_paths, &ref_sources, &locks, &schemes);
        render_template(&engine2, ctx).await.unwrap();
        assert_eq!(engine2.dependency_builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_value_files_resolved_and_parameters_substituted() {
        let tree = TempDir::new().unwrap();
        std::fs::write(tree.path().join("values.yaml"), "replicas: 2\n").unwrap();

        let options = TemplateOptions {
            value_files: vec!["values.yaml".to_string(), "absent.yaml".to_string()],
            ignore_missing_value_files: true,
            parameters: vec![crate::source::TemplateParameter {
                name: "image.tag".to_string(),
                value: "$REVISION".to_string(),
                force_string: false,
            }],
            ..Default::default()
        };
        let source = crate::source::SourceRef {
            url: "https://github.com/example/deploys.git".to_string(),
            target_revision: "main".to_string(),
            ..Default::default()
        };
        let app = AppIdentity { app_name: "demo".into(), ..Default::default() };
        let env = Env::for_request(&app, &source, "abc1234567");
        let repo_paths = RandomizedTempPaths::new(std::env::temp_dir());
        let ref_sources = HashMap::new();
        let locks = KeyedLocks::new();
        let schemes = vec!["https".to_string()];

        let engine = RecordingEngine::returning(vec![ok_output("kind: ConfigMap\n")]);
        let ctx =
            context(&tree, &env, &app, Some(&options), &repo_paths, &ref_sources, &locks, &schemes);
        render_template(&engine, ctx).await.unwrap();

        let invocations = engine.invocations.lock().unwrap();
        let invocation = &invocations[0];
        assert_eq!(invocation.value_files.len(), 1, "missing value file is skipped");
        assert!(invocation.value_files[0].ends_with("values.yaml"));
        assert_eq!(invocation.set, vec![("image.tag".to_string(), "abc1234567".to_string())]);
    }

    #[tokio::test]
    async fn test_ref_value_file_resolves_into_referenced_tree() {
        let tree = TempDir::new().unwrap();
        let referenced = TempDir::new().unwrap();
        std::fs::write(referenced.path().join("common.yaml"), "a: 1\n").unwrap();

        let repo_paths = RandomizedTempPaths::new(std::env::temp_dir());
        repo_paths.add("https://github.com/example/values", referenced.path().to_path_buf());

        let mut ref_sources = HashMap::new();
        ref_sources.insert(
            "$values".to_string(),
            RefTarget {
                repo_url: "https://github.com/example/Values.git".to_string(),
                target_revision: "main".to_string(),
                chart: String::new(),
            },
        );

        let options = TemplateOptions {
            value_files: vec!["$values/common.yaml".to_string()],
            ..Default::default()
        };
        let app = AppIdentity { app_name: "demo".into(), ..Default::default() };
        let env = Env::default();
        let locks = KeyedLocks::new();
        let schemes = vec!["https".to_string()];

        let engine = RecordingEngine::returning(vec![ok_output("kind: ConfigMap\n")]);
        let ctx =
            context(&tree, &env, &app, Some(&options), &repo_paths, &ref_sources, &locks, &schemes);
        render_template(&engine, ctx).await.unwrap();

        let invocations = engine.invocations.lock().unwrap();
        assert_eq!(invocations[0].value_files, vec![referenced
            .path()
            .join("common.yaml")
            .display()
            .to_string()]);
    }

    #[tokio::test]
    async fn test_ref_value_file_cannot_escape_referenced_tree() {
        let tree = TempDir::new().unwrap();
        let referenced = TempDir::new().unwrap();

        let repo_paths = RandomizedTempPaths::new(std::env::temp_dir());
        repo_paths.add("https://github.com/example/values", referenced.path().to_path_buf());

        let mut ref_sources = HashMap::new();
        ref_sources.insert(
            "$values".to_string(),
            RefTarget {
                repo_url: "https://github.com/example/values.git".to_string(),
                target_revision: "main".to_string(),
                chart: String::new(),
            },
        );

        let options = TemplateOptions {
            value_files: vec!["$values/../../etc/passwd".to_string()],
            ..Default::default()
        };
        let app = AppIdentity { app_name: "demo".into(), ..Default::default() };
        let env = Env::default();
        let locks = KeyedLocks::new();
        let schemes = vec!["https".to_string()];

        let engine = RecordingEngine::returning(vec![ok_output("kind: ConfigMap\n")]);
        let ctx =
            context(&tree, &env, &app, Some(&options), &repo_paths, &ref_sources, &locks, &schemes);
        assert!(render_template(&engine, ctx).await.is_err());
    }
}
