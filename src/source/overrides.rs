//! In-tree source override patching.
//!
//! Repositories may carry `.argocd-source.yaml` (applies to every application
//! rooted at a path) and `.argocd-source-<appName>.yaml` (applies to one
//! application). Each file is a JSON merge patch over the serialized source
//! reference. After merging, the identity fields are reset from the incoming
//! request so an override can only adjust tool options, never redirect the
//! request to a different repository, path, chart, or revision.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use crate::constants::{APP_SOURCE_OVERRIDE_FILE, SOURCE_OVERRIDE_FILE};
use crate::source::SourceRef;

/// Applies JSON merge patch semantics (RFC 7386) of `patch` onto `target`.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let target_map = target.as_object_mut().unwrap();
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    target_map.remove(key);
                } else {
                    let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                    merge_patch(slot, patch_value);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Merges any in-tree override files at `app_path` into `source`.
///
/// Missing override files are skipped; a directory squatting on an override
/// name is ignored. Malformed override content fails the request, since
/// silently ignoring it would render something other than what the repo
/// declares.
pub fn merge_source_overrides(source: &mut SourceRef, app_path: &Path, app_name: &str) -> Result<()> {
    let mut candidates = vec![app_path.join(SOURCE_OVERRIDE_FILE)];
    if !app_name.is_empty() {
        candidates.push(app_path.join(APP_SOURCE_OVERRIDE_FILE.replace("{}", app_name)));
    }

    let mut merged = serde_json::to_value(&*source).context("serializing source for override merge")?;
    let mut touched = false;

    for candidate in candidates {
        let metadata = match std::fs::symlink_metadata(&candidate) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("{}", candidate.display()));
            }
        };
        if metadata.is_dir() {
            continue;
        }

        let raw = std::fs::read_to_string(&candidate)
            .with_context(|| format!("{}", candidate.display()))?;
        let patch: Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("{}: invalid override document", candidate.display()))?;
        tracing::debug!(
            target: "repogen::source",
            "merging source override {}",
            candidate.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        );
        merge_patch(&mut merged, &patch);
        touched = true;
    }

    if !touched {
        return Ok(());
    }

    let mut patched: SourceRef =
        serde_json::from_value(merged).context("deserializing merged source overrides")?;

    // Overrides may only touch tool options. Identity comes from the request.
    patched.kind = source.kind;
    patched.url = source.url.clone();
    patched.path = source.path.clone();
    patched.chart = source.chart.clone();
    patched.target_revision = source.target_revision.clone();
    patched.ref_name = source.ref_name.clone();

    *source = patched;
    Ok(())
}
