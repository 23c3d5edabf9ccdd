//! Deterministic cache-key fingerprints.
//!
//! A manifest cache key must change whenever any input that can influence the
//! rendered output changes: the resolved revision, the revisions of every
//! cross-referenced repository, the application path, the normalized render
//! options, and the application identity tuple. Equal inputs must produce
//! byte-identical keys across processes, so the fingerprint is a SHA-256 over
//! a canonical JSON serialization with all map-shaped data in sorted
//! (`BTreeMap`) form.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::models::AppIdentity;
use crate::source::SourceRef;

/// The assembled identity of one rendered-manifest cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestCacheKey {
    /// Application name, kept alongside the fingerprint so stores may
    /// segregate entries by application.
    pub app_name: String,
    /// Hex SHA-256 fingerprint over every render-influencing input.
    pub fingerprint: String,
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    revision: &'a str,
    cross_refs: &'a BTreeMap<String, String>,
    path: &'a str,
    chart: &'a str,
    render_options: &'a crate::source::RenderOptions,
    app: &'a AppIdentity,
}

impl ManifestCacheKey {
    /// Builds the cache key for a request.
    ///
    /// `cross_refs` maps each referenced repository's canonical URL to its
    /// resolved revision; an empty map is valid and participates in the
    /// fingerprint like any other value.
    #[must_use]
    pub fn new(
        source: &SourceRef,
        revision: &str,
        cross_refs: &BTreeMap<String, String>,
        app: &AppIdentity,
    ) -> Self {
        let material = KeyMaterial {
            revision,
            cross_refs,
            path: &source.path,
            chart: &source.chart,
            render_options: &source.render_options,
            app,
        };
        let canonical =
            serde_json::to_vec(&material).expect("key material serialization cannot fail");
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Self { app_name: app.app_name.clone(), fingerprint: hex::encode(hasher.finalize()) }
    }

    /// The store key string for this entry.
    #[must_use]
    pub fn store_key(&self) -> String {
        format!("mfst|{}|{}", self.app_name, self.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TemplateOptions;

    fn fixture() -> (SourceRef, AppIdentity, BTreeMap<String, String>) {
        let source = SourceRef {
            url: "https://github.com/example/deploys.git".to_string(),
            path: "apps/guestbook".to_string(),
            target_revision: "main".to_string(),
            render_options: crate::source::RenderOptions {
                template: Some(TemplateOptions {
                    value_files: vec!["values.yaml".to_string()],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let app = AppIdentity {
            app_name: "guestbook".to_string(),
            namespace: "default".to_string(),
            app_label_key: "app.kubernetes.io/instance".to_string(),
            ..Default::default()
        };
        let mut cross_refs = BTreeMap::new();
        cross_refs.insert(
            "https://github.com/example/values".to_string(),
            "1111111111111111111111111111111111111111".to_string(),
        );
        (source, app, cross_refs)
    }

    #[test]
    fn test_equal_inputs_equal_keys() {
        let (source, app, cross_refs) = fixture();
        let a = ManifestCacheKey::new(&source, "abc123", &cross_refs, &app);
        let b = ManifestCacheKey::new(&source.clone(), "abc123", &cross_refs.clone(), &app.clone());
        assert_eq!(a.store_key(), b.store_key());
    }

    #[test]
    fn test_revision_changes_key() {
        let (source, app, cross_refs) = fixture();
        let a = ManifestCacheKey::new(&source, "abc123", &cross_refs, &app);
        let b = ManifestCacheKey::new(&source, "def456", &cross_refs, &app);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_cross_ref_revision_changes_key() {
        let (source, app, cross_refs) = fixture();
        let a = ManifestCacheKey::new(&source, "abc123", &cross_refs, &app);

        let mut changed = cross_refs.clone();
        changed.insert(
            "https://github.com/example/values".to_string(),
            "2222222222222222222222222222222222222222".to_string(),
        );
        let b = ManifestCacheKey::new(&source, "abc123", &changed, &app);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_render_options_change_key() {
        let (mut source, app, cross_refs) = fixture();
        let a = ManifestCacheKey::new(&source, "abc123", &cross_refs, &app);
        source.render_options.template.as_mut().unwrap().value_files =
            vec!["values-prod.yaml".to_string()];
        let b = ManifestCacheKey::new(&source, "abc123", &cross_refs, &app);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_app_identity_changes_key() {
        let (source, mut app, cross_refs) = fixture();
        let a = ManifestCacheKey::new(&source, "abc123", &cross_refs, &app);
        app.installation_id = "secondary".to_string();
        let b = ManifestCacheKey::new(&source, "abc123", &cross_refs, &app);
        assert_ne!(a.fingerprint, b.fingerprint);
    }
}
