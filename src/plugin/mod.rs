//! Plugin streaming protocol.
//!
//! The plugin strategy hands rendering to an external sidecar process. The
//! working tree (or the narrowest directory covering the application's
//! declared manifest-generation paths) is packed into a compressed archive,
//! streamed over a bidirectional connection, and the rendered reply is
//! awaited. The moment the final archive byte is accepted, a signal fires on
//! the caller-supplied channel; that signal is the orchestrator's trigger
//! to release the working-tree lock, *before* the plugin finishes rendering.
//!
//! Plugins are discovered by enumerating a well-known directory for local
//! sockets; the socket basename (minus `.sock`) is the plugin name. The
//! connection transport itself is a collaborator behind [`PluginClient`];
//! the protocol phases and their failure taxonomy live here.

use anyhow::Result;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use walkdir::WalkDir;

use crate::acquire::paths::normalize_lexically;
use crate::constants::{
    DEFAULT_PLUGIN_SOCK_DIR, PLUGIN_SOCK_DIR_ENV, PLUGIN_SOCK_SUFFIX, PLUGIN_STREAM_CHUNK_SIZE,
};
use crate::core::RenderError;

/// What a plugin declared about itself during the configuration phase.
#[derive(Debug, Clone, Default)]
pub struct PluginConfigResponse {
    /// The plugin wants repository credentials forwarded in its
    /// environment.
    pub needs_repo_credentials: bool,
}

/// The plugin's rendered reply: manifest strings, each possibly holding
/// several documents.
#[derive(Debug, Clone, Default)]
pub struct PluginManifestResponse {
    /// Rendered manifest documents.
    pub manifests: Vec<String>,
}

/// One open generate-manifest stream.
#[async_trait]
pub trait PluginGenerateStream: Send {
    /// Sends the stream preamble: the application path relative to the
    /// archive root and the render environment.
    async fn send_metadata(&mut self, app_rel_path: &str, env: &[(String, String)]) -> Result<()>;

    /// Sends one archive chunk.
    async fn send_chunk(&mut self, chunk: Vec<u8>) -> Result<()>;

    /// Closes the upload side and awaits the rendered reply.
    async fn close_and_recv(self: Box<Self>) -> Result<PluginManifestResponse>;
}

/// Connection to one plugin process.
#[async_trait]
pub trait PluginClient: Send + Sync {
    /// The configuration phase of the protocol.
    async fn check_configuration(&self) -> Result<PluginConfigResponse>;

    /// Opens a bidirectional generate-manifest stream.
    async fn open_generate_stream(&self) -> Result<Box<dyn PluginGenerateStream>>;
}

/// Discovery and connection to the co-located plugin processes.
#[async_trait]
pub trait PluginRegistry: Send + Sync {
    /// Names of the available plugins.
    fn list(&self) -> Result<Vec<String>>;

    /// Connects to a plugin by name.
    async fn connect(&self, name: &str) -> Result<Arc<dyn PluginClient>>;

    /// Asks each plugin whether it accepts the tree; the first match wins.
    async fn find_matching(&self, app_path: &Path) -> Result<Option<(String, Arc<dyn PluginClient>)>>;
}

/// The directory scanned for plugin sockets.
#[must_use]
pub fn plugin_socket_dir() -> PathBuf {
    std::env::var(PLUGIN_SOCK_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PLUGIN_SOCK_DIR))
}

/// Enumerates plugin names from socket files in a directory.
pub fn discover_plugin_sockets(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|err| anyhow::anyhow!("failed to get plugins from dir {}: {err}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        #[cfg(unix)]
        let is_socket = {
            use std::os::unix::fs::FileTypeExt;
            file_type.is_socket()
        };
        #[cfg(not(unix))]
        let is_socket = false;
        if !is_socket {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(plugin) = name.strip_suffix(PLUGIN_SOCK_SUFFIX) {
            names.push(plugin.to_string());
        }
    }
    names.sort_unstable();
    Ok(names)
}

/// Computes the archive root for a request honoring the
/// manifest-generate-paths annotation.
///
/// Each annotation entry is resolved against the repository root (`/foo`
/// form) or the application path (`./foo` and bare forms); the result is the
/// narrowest common ancestor of all resolved paths, clamped to the
/// repository root. Without an annotation the application path is used.
#[must_use]
pub fn application_root_path(annotation: Option<&str>, app_path: &Path, repo_root: &Path) -> PathBuf {
    let Some(annotation) = annotation.map(str::trim).filter(|a| !a.is_empty()) else {
        return app_path.to_path_buf();
    };

    let mut resolved: Vec<PathBuf> = Vec::new();
    for raw in annotation.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let candidate = if let Some(rest) = raw.strip_prefix('/') {
            normalize_lexically(&repo_root.join(rest))
        } else {
            normalize_lexically(&app_path.join(raw))
        };
        if candidate.starts_with(repo_root) {
            resolved.push(candidate);
        }
    }
    if resolved.is_empty() {
        return app_path.to_path_buf();
    }

    let mut ancestor = resolved[0].clone();
    for path in &resolved[1..] {
        ancestor = common_ancestor(&ancestor, path);
    }
    if ancestor.starts_with(repo_root) {
        ancestor
    } else {
        repo_root.to_path_buf()
    }
}

fn common_ancestor(a: &Path, b: &Path) -> PathBuf {
    let mut ancestor = PathBuf::new();
    for (left, right) in a.components().zip(b.components()) {
        if left == right {
            ancestor.push(left);
        } else {
            break;
        }
    }
    ancestor
}

fn rel_component_matches(globs: &[String], rel: &Path) -> bool {
    globs.iter().any(|pattern| {
        glob::Pattern::new(pattern).is_ok_and(|p| {
            p.matches_path(rel)
                || rel.components().any(|c| match c {
                    Component::Normal(part) => p.matches(&part.to_string_lossy()),
                    _ => false,
                })
        })
    })
}

/// Packs `root` into a gzip-compressed tar archive, dropping entries that
/// match any excluded glob.
pub fn build_filtered_archive(root: &Path, excluded_globs: &[String]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        if rel_component_matches(excluded_globs, rel) {
            continue;
        }
        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else if entry.file_type().is_file() || entry.path_is_symlink() {
            builder.append_path_with_name(entry.path(), rel)?;
        }
    }

    Ok(builder.into_inner()?.finish()?)
}

/// Drives the generate-manifest stream for one request.
///
/// `tar_done` fires immediately after the final archive chunk is accepted;
/// the orchestrator releases the working-tree lock on that signal and then
/// awaits the reply. Failures carry the protocol phase they occurred in.
pub async fn generate_manifests_via_plugin(
    client: Arc<dyn PluginClient>,
    archive_root: &Path,
    app_path: &Path,
    env: Vec<(String, String)>,
    excluded_globs: &[String],
    tar_done: oneshot::Sender<()>,
) -> Result<PluginManifestResponse> {
    let phase_err = |phase: &str, err: anyhow::Error| -> anyhow::Error {
        RenderError::PluginFailure { phase: phase.to_string(), message: format!("{err:#}") }.into()
    };

    let mut stream =
        client.open_generate_stream().await.map_err(|err| phase_err("connect", err))?;

    let app_rel = app_path
        .strip_prefix(archive_root)
        .unwrap_or_else(|_| Path::new(""))
        .display()
        .to_string();
    stream
        .send_metadata(&app_rel, &env)
        .await
        .map_err(|err| phase_err("stream", err))?;

    let root = archive_root.to_path_buf();
    let globs = excluded_globs.to_vec();
    let archive = tokio::task::spawn_blocking(move || build_filtered_archive(&root, &globs))
        .await
        .map_err(|err| phase_err("stream", err.into()))?
        .map_err(|err| phase_err("stream", err))?;

    tracing::debug!(
        target: "repogen::plugin",
        "streaming {} byte archive rooted at {}",
        archive.len(),
        archive_root.display()
    );
    for chunk in archive.chunks(PLUGIN_STREAM_CHUNK_SIZE) {
        stream.send_chunk(chunk.to_vec()).await.map_err(|err| phase_err("stream", err))?;
    }

    // Upload complete: the working tree is no longer needed. The receiver
    // may already be gone if the caller gave up; that is its problem.
    let _ = tar_done.send(());

    stream.close_and_recv().await.map_err(|err| phase_err("response", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_application_root_path_defaults_to_app_path() {
        let repo = Path::new("/tree");
        let app = Path::new("/tree/apps/guestbook");
        assert_eq!(application_root_path(None, app, repo), app);
        assert_eq!(application_root_path(Some(""), app, repo), app);
    }

    #[test]
    fn test_application_root_path_common_ancestor() {
        let repo = Path::new("/tree");
        let app = Path::new("/tree/apps/guestbook");
        // Absolute-to-repo and relative-to-app forms combine.
        let root = application_root_path(Some("/apps/shared;./overlays"), app, repo);
        assert_eq!(root, Path::new("/tree/apps"));
    }

    #[test]
    fn test_application_root_path_clamps_to_repo() {
        let repo = Path::new("/tree");
        let app = Path::new("/tree/apps/guestbook");
        let root = application_root_path(Some("/..;/apps"), app, repo);
        assert!(root.starts_with(repo));
    }

    #[test]
    fn test_build_filtered_archive_excludes_globs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("deploy.yaml"), "kind: A\n").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "secret").unwrap();

        let archive =
            build_filtered_archive(dir.path(), &[".git".to_string()]).unwrap();

        let mut names = Vec::new();
        let mut reader = tar::Archive::new(GzDecoder::new(&archive[..]));
        for entry in reader.entries().unwrap() {
            names.push(entry.unwrap().path().unwrap().display().to_string());
        }
        assert!(names.contains(&"deploy.yaml".to_string()));
        assert!(!names.iter().any(|n| n.contains(".git")));
    }

    struct ScriptedStream {
        chunks: Arc<Mutex<usize>>,
        reply: PluginManifestResponse,
    }

    #[async_trait]
    impl PluginGenerateStream for ScriptedStream {
        async fn send_metadata(&mut self, _app_rel_path: &str, _env: &[(String, String)]) -> Result<()> {
            Ok(())
        }

        async fn send_chunk(&mut self, _chunk: Vec<u8>) -> Result<()> {
            *self.chunks.lock().unwrap() += 1;
            Ok(())
        }

        async fn close_and_recv(self: Box<Self>) -> Result<PluginManifestResponse> {
            Ok(self.reply)
        }
    }

    struct ScriptedClient {
        chunks: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl PluginClient for ScriptedClient {
        async fn check_configuration(&self) -> Result<PluginConfigResponse> {
            Ok(PluginConfigResponse::default())
        }

        async fn open_generate_stream(&self) -> Result<Box<dyn PluginGenerateStream>> {
            Ok(Box::new(ScriptedStream {
                chunks: self.chunks.clone(),
                reply: PluginManifestResponse { manifests: vec!["kind: ConfigMap".to_string()] },
            }))
        }
    }

    #[tokio::test]
    async fn test_stream_signals_tar_done_before_reply() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.yaml"), "kind: A\n").unwrap();

        let chunks = Arc::new(Mutex::new(0));
        let client = Arc::new(ScriptedClient { chunks: chunks.clone() });
        let (tar_done_tx, tar_done_rx) = oneshot::channel();

        let response = generate_manifests_via_plugin(
            client,
            dir.path(),
            dir.path(),
            Vec::new(),
            &[],
            tar_done_tx,
        )
        .await
        .unwrap();

        assert_eq!(response.manifests.len(), 1);
        assert!(*chunks.lock().unwrap() >= 1);
        tar_done_rx.await.expect("tar-done must have fired");
    }
}
