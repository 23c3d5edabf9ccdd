//! Shared data models for requests, responses and cached payloads.
//!
//! These types cross module boundaries: the orchestrator builds them, the
//! cache layer serializes them, and callers receive them. Everything here is
//! plain data with `serde` derives; behavior lives in the owning modules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How rendered resources are stamped with the identity of the application
/// that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackingMethod {
    /// Identity carried in a label under the configured label key.
    #[default]
    Label,
    /// Identity carried in a tracking annotation.
    Annotation,
    /// Both the label and the annotation are applied.
    AnnotationAndLabel,
}

/// The identity tuple of the application a request renders for.
///
/// Threaded through cache keys (different applications must never share
/// rendered entries) and into the tracking stamp applied to each resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppIdentity {
    /// Application name. Also seeds the render environment and the template
    /// release name.
    pub app_name: String,
    /// Destination namespace.
    pub namespace: String,
    /// Project the application belongs to.
    pub project: String,
    /// Label key used when tracking by label.
    pub app_label_key: String,
    /// Tracking method for the identity stamp.
    pub tracking_method: TrackingMethod,
    /// Installation identifier, present when several control planes share a
    /// cluster.
    pub installation_id: String,
}

/// The result of a successful manifest generation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManifestResponse {
    /// Serialized resource documents in discovery order.
    pub manifests: Vec<String>,
    /// Which strategy produced the manifests.
    pub source_type: String,
    /// The rendering commands executed, for display purposes. Paths inside
    /// are already redacted.
    pub commands: Vec<String>,
    /// The concrete revision the manifests were generated from.
    pub revision: String,
    /// Output of signature verification, empty when verification was not
    /// requested.
    pub verify_result: String,
}

/// Branches and tags advertised by a remote repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteRefs {
    /// Branch names without the `refs/heads/` prefix.
    pub branches: Vec<String>,
    /// Tag names without the `refs/tags/` prefix.
    pub tags: Vec<String>,
}

/// Commit metadata for a resolved revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RevisionMetadata {
    /// Author in `Name <email>` form.
    pub author: String,
    /// Author date.
    pub date: Option<DateTime<Utc>>,
    /// Tags pointing at the commit.
    pub tags: Vec<String>,
    /// Full commit message.
    pub message: String,
    /// Symbolic references (branches) containing the commit.
    pub references: Vec<String>,
}

/// Descriptor fields of a chart at an exact version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChartDetail {
    /// Free-form chart description.
    pub description: String,
    /// Project home page.
    pub home: String,
    /// Declared maintainers.
    pub maintainers: Vec<String>,
}

/// Candidate application directories discovered at a revision, keyed by
/// path relative to the repository root, valued by detected strategy name.
pub type AppList = HashMap<String, String>;

/// Directory roster at a revision, relative to the repository root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryListing {
    /// Directory paths in walk order.
    pub paths: Vec<String>,
}

/// Contents of files matching a listing request, keyed by repo-relative path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileBundle {
    /// File contents keyed by path.
    pub files: HashMap<String, Vec<u8>>,
}

/// Shortens a revision string for display and environment seeding.
///
/// Returns the input unchanged when it is already short enough.
#[must_use]
pub fn shorten_revision(revision: &str, length: usize) -> &str {
    if revision.len() > length {
        &revision[..length]
    } else {
        revision
    }
}
