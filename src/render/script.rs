//! Script strategy: evaluate `*.jsonnet` files through the script engine.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use walkdir::WalkDir;

use crate::acquire::paths;
use crate::render::{Env, ScriptEngine, ScriptInvocation};
use crate::source::ScriptOptions;

/// Parses the JSON a script evaluation produced: either a single object or
/// an array of objects.
pub fn parse_script_output(json: &str, file: &Path) -> Result<Vec<Value>> {
    if let Ok(values) = serde_json::from_str::<Vec<Value>>(json) {
        return Ok(values);
    }
    let value: Value = serde_json::from_str(json)
        .with_context(|| format!("failed to unmarshal generated json {:?}", file.file_name()))?;
    Ok(vec![value])
}

/// Builds the shared invocation for a render: the tree root goes on the
/// search path, followed by each declared library directory resolved
/// relative to the repository root with escape prevention.
pub fn build_invocation(
    app_path: &Path,
    repo_root: &Path,
    options: &ScriptOptions,
    env: &Env,
) -> Result<ScriptInvocation> {
    let mut search_paths = vec![app_path.to_path_buf()];
    for lib in &options.libs {
        let resolved = paths::resolve_within(repo_root, repo_root, lib)
            .with_context(|| format!("resolving script library directory {lib:?}"))?;
        search_paths.push(resolved);
    }
    Ok(ScriptInvocation {
        search_paths,
        tlas: env.substitute_vars(&options.tlas),
        ext_vars: env.substitute_vars(&options.ext_vars),
    })
}

/// Renders the script strategy: every `*.jsonnet` file under the
/// application path is evaluated with the shared invocation.
pub async fn render_script(
    engine: &dyn ScriptEngine,
    app_path: &Path,
    repo_root: &Path,
    options: &ScriptOptions,
    env: &Env,
) -> Result<Vec<Value>> {
    let invocation = build_invocation(app_path, repo_root, options, env)?;

    let mut resources = Vec::new();
    for entry in WalkDir::new(app_path).follow_links(false).sort_by_file_name() {
        let entry = entry.context("walking application directory for script files")?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !entry.file_name().to_string_lossy().ends_with(".jsonnet") {
            continue;
        }
        let json = engine
            .evaluate_file(&invocation, entry.path())
            .await
            .map_err(|err| anyhow::anyhow!("failed to evaluate {:?}: {err}", entry.file_name()))?;
        resources.extend(parse_script_output(&json, entry.path())?);
    }
    Ok(resources)
}
