//! Overlay strategy: delegate to the overlay engine and split its output.

use anyhow::Result;
use serde_json::Value;
use std::path::Path;

use crate::core::RenderError;
use crate::render::{split_yaml_or_json, Env, OverlayEngine, OverlayInvocation, RenderStrategy};
use crate::source::OverlayOptions;

/// Renders the overlay strategy. Returns the parsed resources, the image
/// list (consumed by the detail endpoint only), and the display command.
pub async fn render_overlay(
    engine: &dyn OverlayEngine,
    app_path: &Path,
    options: Option<&OverlayOptions>,
    kube_version: &str,
    api_versions: &[String],
    env: &Env,
) -> Result<(Vec<Value>, Vec<String>, String)> {
    let options = options.cloned().unwrap_or_default();
    let invocation = OverlayInvocation {
        app_path: app_path.to_path_buf(),
        kube_version: if options.kube_version.is_empty() {
            kube_version.to_string()
        } else {
            options.kube_version.clone()
        },
        api_versions: if options.api_versions.is_empty() {
            api_versions.to_vec()
        } else {
            options.api_versions.clone()
        },
        options,
        env: env.vars().to_vec(),
    };

    let output = engine.build(&invocation).await.map_err(|err| RenderError::RenderFailure {
        strategy: RenderStrategy::Overlay,
        detail: err.to_string(),
    })?;

    let resources = split_yaml_or_json(&output.manifests)?;
    Ok((resources, output.images, output.command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{EngineError, OverlayOutput};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedOverlay {
        seen: Mutex<Option<OverlayInvocation>>,
    }

    #[async_trait]
    impl OverlayEngine for FixedOverlay {
        async fn build(&self, invocation: &OverlayInvocation) -> Result<OverlayOutput, EngineError> {
            *self.seen.lock().unwrap() = Some(invocation.clone());
            Ok(OverlayOutput {
                manifests: "kind: Deployment\n---\nkind: Service\n".to_string(),
                images: vec!["nginx:1.27".to_string()],
                command: "build .".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_overlay_splits_output_and_forwards_versions() {
        let engine = FixedOverlay { seen: Mutex::new(None) };
        let (resources, images, command) = render_overlay(
            &engine,
            Path::new("/tree/overlay"),
            None,
            "1.31",
            &["apps/v1".to_string()],
            &Env::default(),
        )
        .await
        .unwrap();

        assert_eq!(resources.len(), 2);
        assert_eq!(images, vec!["nginx:1.27".to_string()]);
        assert_eq!(command, "build .");

        let seen = engine.seen.lock().unwrap();
        let invocation = seen.as_ref().unwrap();
        assert_eq!(invocation.kube_version, "1.31");
        assert_eq!(invocation.api_versions, vec!["apps/v1".to_string()]);
    }

    #[tokio::test]
    async fn test_source_options_override_request_versions() {
        let engine = FixedOverlay { seen: Mutex::new(None) };
        let options = OverlayOptions { kube_version: "1.29".to_string(), ..Default::default() };
        render_overlay(
            &engine,
            Path::new("/tree/overlay"),
            Some(&options),
            "1.31",
            &[],
            &Env::default(),
        )
        .await
        .unwrap();

        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen.as_ref().unwrap().kube_version, "1.29");
    }
}
