//! Global constants used throughout the repogen codebase.
//!
//! This module contains marker-file names, cache prefixes, timeout durations
//! and other constants that are used across multiple modules. Defining them
//! centrally improves maintainability and makes magic values discoverable.

use std::time::Duration;

/// Prefix attached to errors served from a memoized failure entry.
///
/// The prefix lets callers (and their operators) distinguish a freshly
/// generated failure from one replayed out of the cache.
pub const CACHED_MANIFEST_ERROR_PREFIX: &str = "Manifest generation error (cached)";

/// Marker file proving that a dependency build has already run inside a
/// working tree for the currently checked-out revision. Removed whenever the
/// tree switches revisions.
pub const DEP_BUILD_MARKER_FILE: &str = ".argocd-helm-dep-up";

/// In-tree source override applied to every application rooted at a path.
pub const SOURCE_OVERRIDE_FILE: &str = ".argocd-source.yaml";

/// In-tree source override applied to a single named application. The `{}`
/// placeholder is substituted with the application name.
pub const APP_SOURCE_OVERRIDE_FILE: &str = ".argocd-source-{}.yaml";

/// Files containing this literal substring anywhere in their contents are
/// skipped by the raw-directory renderer.
pub const SKIP_FILE_RENDERING_MARKER: &str = "+argocd:skip-file-rendering";

/// Annotation naming the paths that affect manifest generation for an
/// application. Used to narrow the archive streamed to render plugins.
pub const MANIFEST_GENERATE_PATHS_ANNOTATION: &str = "argocd.argoproj.io/manifest-generate-paths";

/// Environment variable pointing at the directory holding plugin sockets.
pub const PLUGIN_SOCK_DIR_ENV: &str = "REPOGEN_PLUGIN_SOCK_DIR";

/// Default directory scanned for plugin sockets when the environment
/// variable is unset.
pub const DEFAULT_PLUGIN_SOCK_DIR: &str = "/home/repogen/plugins";

/// Suffix identifying plugin socket files; the basename minus this suffix is
/// the plugin name.
pub const PLUGIN_SOCK_SUFFIX: &str = ".sock";

/// Chunk size for streaming a compressed working tree to a render plugin.
pub const PLUGIN_STREAM_CHUNK_SIZE: usize = 32 * 1024;

/// Default timeout for a single git subprocess invocation.
pub const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Placeholder substituted for randomized working-tree path segments in
/// user-visible error messages.
pub const PATH_SANITIZER_PLACEHOLDER: &str = "<path to cached source>";

/// Maximum length of a release name handed to the template engine.
pub const MAX_RELEASE_NAME_LEN: usize = 53;
