//! Service configuration for the manifest generation core.
//!
//! All tunables that influence resource consumption and failure memoization
//! live here. The outer server deserializes this struct from whatever
//! configuration source it uses and hands it to
//! [`GenerationService`](crate::service::GenerationService) at construction
//! time; nothing in this crate reads configuration files itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::render::RenderStrategy;

/// Tunables for the manifest generation core.
///
/// The defaults are intentionally conservative: extraction caps on, symlink
/// escapes rejected, failure memoization off (enable it by setting
/// [`pause_after_failures`](Self::pause_after_failures) above zero).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GenerationConfig {
    /// Scratch root under which randomized per-repository working trees and
    /// per-request extraction directories are created.
    pub root_dir: PathBuf,

    /// Upper bound on concurrently running render operations. Zero disables
    /// throttling.
    pub parallelism_limit: usize,

    /// Number of consecutive render failures after which generation for a
    /// cache key is paused and the memoized error is served instead. Zero
    /// disables failure memoization entirely.
    pub pause_after_failures: u32,

    /// Minutes after the first failure at which a paused key becomes
    /// eligible for a real render again. Zero disables the temporal exit.
    pub pause_minutes: u32,

    /// Number of memoized error responses after which a paused key becomes
    /// eligible for a real render again. Zero disables the counted exit.
    pub pause_requests: u32,

    /// Whether checkouts populate submodules.
    pub submodules_enabled: bool,

    /// Combined byte budget for non-script manifest files discovered by the
    /// raw-directory strategy. Zero means unlimited.
    pub max_combined_directory_manifests_bytes: u64,

    /// Byte cap on uncompressed chart extraction.
    pub chart_max_extracted_bytes: u64,

    /// Disables [`chart_max_extracted_bytes`](Self::chart_max_extracted_bytes).
    pub disable_chart_extraction_cap: bool,

    /// Byte cap on uncompressed archive extraction.
    pub archive_max_extracted_bytes: u64,

    /// Disables [`archive_max_extracted_bytes`](Self::archive_max_extracted_bytes).
    pub disable_archive_extraction_cap: bool,

    /// Permits symlinks whose targets escape the acquired tree root. Off by
    /// default; enabling this is a deliberate operator decision.
    pub allow_out_of_bounds_symlinks: bool,

    /// Globs filtered out of the archive streamed to render plugins.
    pub plugin_tar_excluded_globs: Vec<String>,

    /// When set, the archive streamed to a plugin is rooted at the narrowest
    /// common ancestor of the application's declared manifest-generation
    /// paths instead of the whole tree.
    pub plugin_use_manifest_generate_paths: bool,

    /// Whether directory listings include hidden directories.
    pub include_hidden_directories: bool,

    /// Whether globs passed to file listings are matched with the stricter
    /// new-style semantics (no implicit `**` prefix).
    pub strict_file_globbing: bool,

    /// Per-strategy enablement. A strategy absent from the map is enabled;
    /// an explicitly disabled strategy demotes the source to raw-directory
    /// rendering.
    pub enabled_strategies: HashMap<String, bool>,

    /// URL schemes permitted for remote value files. Anything else is
    /// rejected during value-file resolution.
    pub allowed_value_file_schemes: Vec<String>,

    /// TTL in seconds for resolved-revision cache entries.
    pub revision_cache_ttl_secs: u64,

    /// TTL in seconds for rendered-manifest cache entries. Zero means the
    /// store's default.
    pub manifest_cache_ttl_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("_repogen"),
            parallelism_limit: 0,
            pause_after_failures: 0,
            pause_minutes: 0,
            pause_requests: 0,
            submodules_enabled: false,
            max_combined_directory_manifests_bytes: 10 * 1024 * 1024,
            chart_max_extracted_bytes: 1024 * 1024 * 1024,
            disable_chart_extraction_cap: false,
            archive_max_extracted_bytes: 1024 * 1024 * 1024,
            disable_archive_extraction_cap: false,
            allow_out_of_bounds_symlinks: false,
            plugin_tar_excluded_globs: Vec::new(),
            plugin_use_manifest_generate_paths: false,
            include_hidden_directories: false,
            strict_file_globbing: false,
            enabled_strategies: HashMap::new(),
            allowed_value_file_schemes: vec!["https".to_string()],
            revision_cache_ttl_secs: 3 * 60,
            manifest_cache_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl GenerationConfig {
    /// Whether manifest generation is enabled for the given strategy.
    #[must_use]
    pub fn strategy_enabled(&self, strategy: &RenderStrategy) -> bool {
        *self.enabled_strategies.get(strategy.kind_name()).unwrap_or(&true)
    }

    /// Effective chart extraction cap, `None` when disabled.
    #[must_use]
    pub fn chart_extraction_cap(&self) -> Option<u64> {
        if self.disable_chart_extraction_cap {
            None
        } else {
            Some(self.chart_max_extracted_bytes)
        }
    }

    /// Effective archive extraction cap, `None` when disabled.
    #[must_use]
    pub fn archive_extraction_cap(&self) -> Option<u64> {
        if self.disable_archive_extraction_cap {
            None
        } else {
            Some(self.archive_max_extracted_bytes)
        }
    }
}
