//! Source references and per-tool render options.
//!
//! A [`SourceRef`] is the logical input of a generation request: where the
//! content lives (repository, chart registry, or archive registry), which
//! revision is wanted, which path inside the tree is the application, and the
//! tool-specific options that shape rendering. Once a request begins the
//! reference is immutable; the only sanctioned mutation is the in-tree
//! override merge in [`overrides`], which resets the identity fields
//! afterwards so an override can never redirect a request to a different
//! source.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::render::RenderStrategy;

pub mod overrides;

/// What kind of backend a source reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A git repository; revisions are commit hashes.
    #[default]
    Repo,
    /// A chart registry; revisions are exact version strings.
    Chart,
    /// An archive registry; revisions are content digests.
    Archive,
}

/// A single template parameter (`--set` / `--set-string` equivalent).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateParameter {
    /// Dotted parameter name.
    pub name: String,
    /// Parameter value, subject to environment substitution.
    pub value: String,
    /// Force the value to be treated as a string.
    pub force_string: bool,
}

/// A template parameter whose value is read from a file (`--set-file`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateFileParameter {
    /// Dotted parameter name.
    pub name: String,
    /// Path of the value file; may begin with a `$token/` cross-reference.
    pub path: String,
}

/// Options for the template (chart) rendering strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateOptions {
    /// Declared value files; entries may begin with a `$token/`
    /// cross-reference or be remote URLs with an allowed scheme.
    pub value_files: Vec<String>,
    /// Inline values document, written to a temp file before templating.
    pub values: String,
    /// Explicit release name; defaults to the application name.
    pub release_name: String,
    /// Explicit namespace override.
    pub namespace: String,
    /// Scalar parameters.
    pub parameters: Vec<TemplateParameter>,
    /// File-backed parameters.
    pub file_parameters: Vec<TemplateFileParameter>,
    /// Skip value files that do not exist instead of failing.
    pub ignore_missing_value_files: bool,
    /// Do not render custom resource definitions.
    pub skip_crds: bool,
    /// Skip chart tests.
    pub skip_tests: bool,
    /// Skip schema validation of values.
    pub skip_schema_validation: bool,
    /// Template engine version hint.
    pub version: String,
    /// Kubernetes version advertised to the engine.
    pub kube_version: String,
    /// API versions advertised to the engine.
    pub api_versions: Vec<String>,
    /// Forward repository credentials to chart dependencies.
    pub pass_credentials: bool,
}

impl TemplateOptions {
    /// Whether inline values were supplied.
    #[must_use]
    pub fn has_inline_values(&self) -> bool {
        !self.values.trim().is_empty()
    }
}

/// Options for the overlay (kustomization) rendering strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OverlayOptions {
    /// Prefix prepended to resource names.
    pub name_prefix: String,
    /// Suffix appended to resource names.
    pub name_suffix: String,
    /// Image overrides in `name=newref` form.
    pub images: Vec<String>,
    /// Labels applied to every resource.
    pub common_labels: BTreeMap<String, String>,
    /// Annotations applied to every resource.
    pub common_annotations: BTreeMap<String, String>,
    /// Kubernetes version advertised to the engine.
    pub kube_version: String,
    /// API versions advertised to the engine.
    pub api_versions: Vec<String>,
}

impl OverlayOptions {
    /// Whether rendering mutates files inside the working tree.
    ///
    /// Overlay engines apply name/image/label modifications by editing the
    /// overlay file in place, so a source carrying any of them must hold the
    /// tree exclusively.
    #[must_use]
    pub fn mutates_tree(&self) -> bool {
        !self.name_prefix.is_empty()
            || !self.name_suffix.is_empty()
            || !self.images.is_empty()
            || !self.common_labels.is_empty()
            || !self.common_annotations.is_empty()
    }
}

/// One script variable binding (top-level arg or external variable).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptVar {
    /// Variable name.
    pub name: String,
    /// Variable value, subject to environment substitution.
    pub value: String,
    /// Bind as code rather than as a string literal.
    pub code: bool,
}

/// Options for the embedded scripting-language strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptOptions {
    /// Top-level argument bindings.
    pub tlas: Vec<ScriptVar>,
    /// External variable bindings.
    pub ext_vars: Vec<ScriptVar>,
    /// Library directories, relative to the repository root.
    pub libs: Vec<String>,
}

/// Options for the out-of-process plugin strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginOptions {
    /// Plugin name; empty means autodetect by asking each discovered plugin
    /// whether it accepts the tree.
    pub name: String,
    /// Additional environment entries forwarded to the plugin, values
    /// subject to environment substitution.
    pub env: BTreeMap<String, String>,
    /// Announced plugin parameters.
    pub parameters: BTreeMap<String, String>,
}

/// Options for the raw-directory strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DirectoryOptions {
    /// Walk subdirectories of the application path.
    pub recurse: bool,
    /// Glob restricting which files are considered, relative to the
    /// application path.
    pub include: String,
    /// Glob excluding files, relative to the application path.
    pub exclude: String,
    /// Script options applied when evaluating `*.jsonnet` files found in
    /// the directory.
    pub script: ScriptOptions,
}

/// Per-tool render options. At most one strategy block may be present; the
/// dispatcher autodetects over the file roster when none is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderOptions {
    /// Template strategy options.
    pub template: Option<TemplateOptions>,
    /// Overlay strategy options.
    pub overlay: Option<OverlayOptions>,
    /// Script strategy options.
    pub script: Option<ScriptOptions>,
    /// Plugin strategy options.
    pub plugin: Option<PluginOptions>,
    /// Raw-directory strategy options.
    pub directory: Option<DirectoryOptions>,
}

/// The logical input of a generation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceRef {
    /// Backend kind.
    pub kind: SourceKind,
    /// Repository or registry URL.
    pub url: String,
    /// Path of the application inside the tree. Empty for chart sources and
    /// for ref-only sources.
    pub path: String,
    /// Chart name, for chart sources.
    pub chart: String,
    /// The possibly ambiguous revision the request targets.
    pub target_revision: String,
    /// Tool-specific options.
    pub render_options: RenderOptions,
    /// Symbolic name other sources in the same request use to point here.
    pub ref_name: Option<String>,
}

impl SourceRef {
    /// Whether this source only declares a `ref` for others to point at and
    /// produces no manifests of its own.
    #[must_use]
    pub fn is_ref_only(&self) -> bool {
        self.ref_name.as_deref().is_some_and(|r| !r.is_empty())
            && self.path.is_empty()
            && self.chart.is_empty()
            && self.kind == SourceKind::Repo
    }

    /// The explicitly declared strategy, if any.
    ///
    /// Fails when more than one strategy block is present, since the request
    /// would be ambiguous.
    pub fn explicit_strategy(&self) -> Result<Option<RenderStrategy>> {
        let opts = &self.render_options;
        let mut declared: Vec<RenderStrategy> = Vec::new();
        if opts.template.is_some() {
            declared.push(RenderStrategy::Template);
        }
        if opts.overlay.is_some() {
            declared.push(RenderStrategy::Overlay);
        }
        if opts.script.is_some() {
            declared.push(RenderStrategy::Script);
        }
        if let Some(plugin) = &opts.plugin {
            declared.push(RenderStrategy::Plugin(plugin.name.clone()));
        }
        if opts.directory.is_some() {
            declared.push(RenderStrategy::RawDirectory);
        }
        match declared.len() {
            0 => Ok(None),
            1 => Ok(declared.pop()),
            _ => bail!(
                "multiple render strategies declared for one source: {}",
                declared.iter().map(RenderStrategy::kind_name).collect::<Vec<_>>().join(", ")
            ),
        }
    }

    /// Whether several requests may render against the same checked-out tree
    /// at once.
    ///
    /// Strategies that write marker or override files into the tree must
    /// hold it exclusively even when every caller wants the same revision.
    #[must_use]
    pub fn allows_concurrent_processing(&self) -> bool {
        match &self.render_options.overlay {
            Some(overlay) => !overlay.mutates_tree(),
            None => true,
        }
    }
}
