//! Render dispatcher: strategy selection, engine contracts, and output
//! normalization.
//!
//! Rendering strategies are black-box engines invoked through a uniform
//! contract ([`TemplateEngine`], [`OverlayEngine`], [`ScriptEngine`]); only
//! the raw-directory strategy is implemented entirely in-crate. The
//! dispatcher picks the strategy (explicit declaration first, then
//! autodetection over the tree's file roster), seeds the render environment
//! from the application identity, runs the strategy, and normalizes whatever
//! comes back into a flat list of serialized resources with the
//! application's tracking stamp applied.
//!
//! The plugin strategy is not rendered here: its streaming protocol needs
//! the lock-release signalling owned by the orchestrator (see
//! [`crate::plugin`] and [`crate::service`]).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::GenerationConfig;
use crate::models::{shorten_revision, AppIdentity, TrackingMethod};
use crate::source::{ScriptVar, SourceRef};

pub mod directory;
pub mod overlay;
pub mod script;
pub mod template;

/// Annotation key carrying the tracking identity when tracking by
/// annotation.
pub const TRACKING_ANNOTATION: &str = "argocd.argoproj.io/tracking-id";

/// The rendering strategy selected for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderStrategy {
    /// Chart templating engine.
    Template,
    /// Overlay (kustomization) engine.
    Overlay,
    /// Embedded scripting language over `*.jsonnet` files.
    Script,
    /// Out-of-process plugin, by name (empty = autodetected).
    Plugin(String),
    /// Plain manifest files collected from the tree.
    RawDirectory,
}

impl RenderStrategy {
    /// Stable lowercase name used in configuration maps.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Overlay => "overlay",
            Self::Script => "script",
            Self::Plugin(_) => "plugin",
            Self::RawDirectory => "directory",
        }
    }
}

impl fmt::Display for RenderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template => write!(f, "Template"),
            Self::Overlay => write!(f, "Overlay"),
            Self::Script => write!(f, "Script"),
            Self::Plugin(name) if !name.is_empty() => write!(f, "Plugin({name})"),
            Self::Plugin(_) => write!(f, "Plugin"),
            Self::RawDirectory => write!(f, "RawDirectory"),
        }
    }
}

/// Environment seeded into every renderer from the application identity.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: Vec<(String, String)>,
}

impl Env {
    /// Builds the render environment for a request.
    #[must_use]
    pub fn for_request(app: &AppIdentity, source: &SourceRef, revision: &str) -> Self {
        let vars = vec![
            ("APP_NAME".to_string(), app.app_name.clone()),
            ("APP_NAMESPACE".to_string(), app.namespace.clone()),
            ("REVISION".to_string(), revision.to_string()),
            ("REVISION_SHORT".to_string(), shorten_revision(revision, 7).to_string()),
            ("REVISION_SHORT_8".to_string(), shorten_revision(revision, 8).to_string()),
            ("SOURCE_REPO_URL".to_string(), source.url.clone()),
            ("SOURCE_PATH".to_string(), source.path.clone()),
            ("SOURCE_TARGET_REVISION".to_string(), source.target_revision.clone()),
        ];
        Self { vars }
    }

    /// Adds one variable.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.push((name.into(), value.into()));
    }

    /// The seeded variables.
    #[must_use]
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// Substitutes `$NAME` and `${NAME}` occurrences of the seeded
    /// variables in a string.
    #[must_use]
    pub fn envsubst(&self, input: &str) -> String {
        let mut result = input.to_string();
        // Longest names first so $APP_NAME never clobbers $APP_NAMESPACE.
        let mut ordered: Vec<&(String, String)> = self.vars.iter().collect();
        ordered.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));
        for (name, value) in ordered {
            result = result.replace(&format!("${{{name}}}"), value);
            result = result.replace(&format!("${name}"), value);
        }
        result
    }

    /// Substitutes variables inside a list of script bindings.
    #[must_use]
    pub fn substitute_vars(&self, vars: &[ScriptVar]) -> Vec<ScriptVar> {
        vars.iter()
            .map(|var| ScriptVar {
                name: var.name.clone(),
                value: self.envsubst(&var.value),
                code: var.code,
            })
            .collect()
    }
}

/// Failure reported by a rendering engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The chart's dependencies have not been built in this tree yet.
    #[error("missing chart dependencies: {0}")]
    MissingDependency(String),
    /// Any other engine failure.
    #[error("{0}")]
    Failed(String),
}

/// Raw output of a template or overlay engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Multi-document YAML produced by the engine.
    pub manifests: String,
    /// The command line executed, for display. Sanitized by the caller.
    pub command: String,
}

/// Inputs to one template engine invocation.
#[derive(Debug, Clone, Default)]
pub struct TemplateInvocation {
    /// Directory holding the chart.
    pub app_path: PathBuf,
    /// Release name, already coerced to engine constraints.
    pub release_name: String,
    /// Target namespace.
    pub namespace: String,
    /// Kubernetes version advertised to the engine.
    pub kube_version: String,
    /// API versions advertised to the engine.
    pub api_versions: Vec<String>,
    /// Resolved value files: absolute paths or allowed remote URLs.
    pub value_files: Vec<String>,
    /// Temp file holding the request's inline values, if any.
    pub extra_values_file: Option<PathBuf>,
    /// Scalar parameters.
    pub set: Vec<(String, String)>,
    /// Parameters forced to string type.
    pub set_string: Vec<(String, String)>,
    /// File-backed parameters, resolved.
    pub set_file: Vec<(String, PathBuf)>,
    /// Skip rendering custom resource definitions.
    pub skip_crds: bool,
    /// Skip chart tests.
    pub skip_tests: bool,
    /// Skip schema validation.
    pub skip_schema_validation: bool,
    /// Engine version hint.
    pub version_hint: String,
    /// Render environment.
    pub env: Vec<(String, String)>,
}

/// Chart templating engine.
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    /// Renders the chart at `invocation.app_path`.
    async fn template(&self, invocation: &TemplateInvocation) -> Result<EngineOutput, EngineError>;

    /// Builds chart dependencies in place. Called at most once per tree per
    /// revision, guarded by a keyed mutex and a marker file.
    async fn build_dependencies(&self, app_path: &Path) -> Result<(), EngineError>;
}

/// Inputs to one overlay engine invocation.
#[derive(Debug, Clone, Default)]
pub struct OverlayInvocation {
    /// Directory holding the overlay.
    pub app_path: PathBuf,
    /// Overlay options from the request.
    pub options: crate::source::OverlayOptions,
    /// Kubernetes version advertised to the engine.
    pub kube_version: String,
    /// API versions advertised to the engine.
    pub api_versions: Vec<String>,
    /// Render environment.
    pub env: Vec<(String, String)>,
}

/// Output of an overlay engine run.
#[derive(Debug, Clone, Default)]
pub struct OverlayOutput {
    /// Multi-document YAML produced by the engine.
    pub manifests: String,
    /// Images referenced by the overlay; consumed by the detail endpoint
    /// only.
    pub images: Vec<String>,
    /// The command line executed, for display.
    pub command: String,
}

/// Overlay (kustomization) engine.
#[async_trait]
pub trait OverlayEngine: Send + Sync {
    /// Builds the overlay at `invocation.app_path`.
    async fn build(&self, invocation: &OverlayInvocation) -> Result<OverlayOutput, EngineError>;
}

/// Inputs shared by every script evaluation in one render.
#[derive(Debug, Clone, Default)]
pub struct ScriptInvocation {
    /// Import search paths: the tree root plus declared library
    /// directories.
    pub search_paths: Vec<PathBuf>,
    /// Top-level argument bindings, environment-substituted.
    pub tlas: Vec<ScriptVar>,
    /// External variable bindings, environment-substituted.
    pub ext_vars: Vec<ScriptVar>,
}

/// Embedded scripting-language engine.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Evaluates one script file, returning its JSON output: a single
    /// object or an array of objects.
    async fn evaluate_file(
        &self,
        invocation: &ScriptInvocation,
        file: &Path,
    ) -> Result<String, EngineError>;
}

/// The engine set a service renders with.
#[derive(Clone)]
pub struct RenderEngines {
    /// Template engine.
    pub template: Arc<dyn TemplateEngine>,
    /// Overlay engine.
    pub overlay: Arc<dyn OverlayEngine>,
    /// Script engine.
    pub script: Arc<dyn ScriptEngine>,
}

/// Overlay file names that mark a directory as an overlay root.
const OVERLAY_FILES: &[&str] = &["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// Chart descriptor file marking a directory as a chart root.
const CHART_DESCRIPTOR: &str = "Chart.yaml";

/// Detects the strategy that applies to a tree without consulting plugins.
///
/// Returns `None` when only a plugin (or nothing) could match, so the caller
/// can run plugin discovery.
#[must_use]
pub fn detect_strategy_from_files(app_path: &Path) -> Option<RenderStrategy> {
    if app_path.join(CHART_DESCRIPTOR).is_file() {
        return Some(RenderStrategy::Template);
    }
    if OVERLAY_FILES.iter().any(|name| app_path.join(name).is_file()) {
        return Some(RenderStrategy::Overlay);
    }
    None
}

/// Applies the config-level enablement rule: a disabled strategy demotes the
/// source to raw-directory rendering.
#[must_use]
pub fn apply_enablement(strategy: RenderStrategy, config: &GenerationConfig) -> RenderStrategy {
    if config.strategy_enabled(&strategy) {
        strategy
    } else {
        tracing::debug!(
            target: "repogen::render",
            "manifest generation is disabled for {}; assuming plain manifest files",
            strategy.kind_name()
        );
        RenderStrategy::RawDirectory
    }
}

/// Splits a multi-document YAML (or JSON) string into individual values,
/// dropping null documents.
pub fn split_yaml_or_json(content: &str) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).context("failed to unmarshal manifest")?;
        if value.is_null() {
            continue;
        }
        values.push(value);
    }
    Ok(values)
}

fn is_crd(resource: &Value) -> bool {
    resource.get("kind").and_then(Value::as_str) == Some("CustomResourceDefinition")
        && resource
            .get("apiVersion")
            .and_then(Value::as_str)
            .is_some_and(|v| v.starts_with("apiextensions.k8s.io"))
}

/// A `List` whose `items` is null rather than an empty array. Such objects
/// produce no resources.
fn is_null_list(resource: &Value) -> bool {
    if resource.get("spec").is_some() || resource.get("status").is_some() {
        return false;
    }
    matches!(resource.get("items"), Some(Value::Null))
}

fn is_list_kind(resource: &Value) -> bool {
    resource.get("kind").and_then(Value::as_str).is_some_and(|kind| kind.ends_with("List"))
        && resource.get("items").is_some_and(Value::is_array)
}

fn tracking_id(app: &AppIdentity, resource: &Value) -> String {
    let group = resource
        .get("apiVersion")
        .and_then(Value::as_str)
        .and_then(|api_version| api_version.split_once('/').map(|(group, _)| group))
        .unwrap_or("");
    let kind = resource.get("kind").and_then(Value::as_str).unwrap_or("");
    let metadata = resource.get("metadata");
    let name = metadata.and_then(|m| m.get("name")).and_then(Value::as_str).unwrap_or("");
    let namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .unwrap_or(&app.namespace);
    format!("{}:{group}/{kind}:{namespace}/{name}", app.app_name)
}

fn stamp_tracking(resource: &mut Value, app: &AppIdentity) {
    let id = tracking_id(app, resource);
    let Some(metadata) = ensure_object(resource, "metadata") else { return };

    match app.tracking_method {
        TrackingMethod::Label => {
            set_nested(metadata, "labels", &app.app_label_key, &app.app_name);
        }
        TrackingMethod::Annotation => {
            set_nested(metadata, "annotations", TRACKING_ANNOTATION, &id);
        }
        TrackingMethod::AnnotationAndLabel => {
            set_nested(metadata, "labels", &app.app_label_key, &app.app_name);
            set_nested(metadata, "annotations", TRACKING_ANNOTATION, &id);
        }
    }
}

fn ensure_object<'a>(value: &'a mut Value, key: &str) -> Option<&'a mut serde_json::Map<String, Value>> {
    let object = value.as_object_mut()?;
    let slot = object.entry(key.to_string()).or_insert_with(|| Value::Object(Default::default()));
    if !slot.is_object() {
        *slot = Value::Object(Default::default());
    }
    slot.as_object_mut()
}

fn set_nested(metadata: &mut serde_json::Map<String, Value>, section: &str, key: &str, value: &str) {
    let slot = metadata
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if !slot.is_object() {
        *slot = Value::Object(Default::default());
    }
    if let Some(map) = slot.as_object_mut() {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// Normalizes strategy output to the flat manifest list: expands list-typed
/// resources into individual entries, stamps the tracking identity onto each
/// non-CRD resource, and serializes each resource deterministically.
pub fn finalize_manifests(resources: Vec<Value>, app: &AppIdentity) -> Result<Vec<String>> {
    let mut manifests = Vec::new();
    for resource in resources {
        if resource.is_null() {
            continue;
        }

        let targets: Vec<Value> = if is_list_kind(&resource) {
            let Some(items) = resource.get("items").and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                if !item.is_object() {
                    bail!("resource list item has unexpected type");
                }
            }
            items.clone()
        } else if is_null_list(&resource) {
            continue;
        } else {
            vec![resource]
        };

        for mut target in targets {
            if !app.app_label_key.is_empty() && !app.app_name.is_empty() && !is_crd(&target) {
                stamp_tracking(&mut target, app);
            }
            manifests
                .push(serde_json::to_string(&target).context("serializing rendered resource")?);
        }
    }
    Ok(manifests)
}
