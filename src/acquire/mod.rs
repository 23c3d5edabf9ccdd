//! Source acquisition: producing a local on-disk tree for a resolved
//! revision.
//!
//! For repositories this means init/fetch/checkout into the repository's
//! randomized working tree, with an explicit-ref + `FETCH_HEAD` fallback for
//! refs the default refspec misses. For charts and archives it means a
//! bounded extraction into a per-request directory. In every case the
//! acquired tree is walked for out-of-bounds symlinks before any renderer
//! sees it, unless the operator explicitly allowed them.
//!
//! The scratch root carries a restrictive permission lifecycle: `0o300`
//! (write+execute, no read) while serving, briefly `0o700` during the
//! startup scan, restored to `0o300` afterwards. Per-request paths are
//! randomized, so denying directory listing denies out-of-band enumeration
//! of other tenants' trees.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::core::RenderError;
use crate::git::GitClient;

pub mod extract;
pub mod paths;

pub use extract::extract_tar_gz_capped;
pub use paths::RandomizedTempPaths;

/// Initializes a tree if needed, fetches only when the target revision is
/// absent, then checks the revision out.
///
/// When the checkout fails because the ref was not covered by the default
/// refspec, the ref is fetched explicitly and `FETCH_HEAD` is checked out
/// instead.
pub async fn checkout_revision(client: &dyn GitClient, revision: &str, submodules: bool) -> Result<()> {
    client.init().await.context("failed to initialize working tree")?;

    let present = client.is_revision_present(revision).await;
    tracing::debug!(
        target: "repogen::acquire",
        skip_fetch = present,
        "checking out revision {revision}"
    );
    if !present {
        // Fetch the default refspec rather than the revision itself;
        // single-revision fetches bloat the repository over time.
        client.fetch(None).await.context("failed to fetch default refspec")?;
    }

    if let Err(checkout_err) = client.checkout(revision, submodules).await {
        tracing::info!(
            target: "repogen::acquire",
            "checkout of {revision} failed ({checkout_err:#}); fetching the ref explicitly"
        );
        client
            .fetch(Some(revision))
            .await
            .with_context(|| format!("failed to fetch revision {revision}"))?;
        client
            .checkout("FETCH_HEAD", submodules)
            .await
            .with_context(|| format!("failed to checkout revision {revision}"))?;
    }
    Ok(())
}

/// Ensures every revision in `revisions` is present locally, fetching the
/// default refspec first and falling back to explicit per-ref fetches.
pub async fn fetch_revisions(client: &dyn GitClient, revisions: &[String]) -> Result<()> {
    let mut all_present = true;
    for revision in revisions {
        if !client.is_revision_present(revision).await {
            all_present = false;
            break;
        }
    }
    if all_present {
        return Ok(());
    }

    client.fetch(None).await.context("failed to fetch default refspec")?;
    for revision in revisions {
        if !client.is_revision_present(revision).await {
            client
                .fetch(Some(revision))
                .await
                .with_context(|| format!("failed to fetch revision {revision}"))?;
        }
    }
    Ok(())
}

/// Walks a tree and fails with [`RenderError::OutOfBoundsSymlink`] if any
/// symlink's resolved target escapes the tree root.
///
/// Symlink chains are resolved through the filesystem where the target
/// exists; dangling links are judged lexically, which is conservative in the
/// right direction.
pub fn check_out_of_bounds_symlinks(root: &Path) -> Result<()> {
    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("canonicalizing tree root {}", root.display()))?;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.context("walking tree for symlink validation")?;
        if !entry.path_is_symlink() {
            continue;
        }
        let link_path = entry.path();
        let resolved = match link_path.canonicalize() {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Dangling target: judge the literal target lexically.
                let target = std::fs::read_link(link_path)
                    .with_context(|| format!("reading symlink {}", link_path.display()))?;
                let absolute = if target.is_absolute() {
                    target
                } else {
                    link_path.parent().unwrap_or(root).join(target)
                };
                paths::normalize_lexically(&absolute)
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("resolving symlink {}", link_path.display()));
            }
        };

        if !resolved.starts_with(&canonical_root) {
            let file = link_path
                .strip_prefix(root)
                .unwrap_or(link_path)
                .display()
                .to_string();
            tracing::warn!(
                target: "repogen::acquire",
                security = "high",
                file = %file,
                "tree contains out-of-bounds symlink"
            );
            return Err(RenderError::OutOfBoundsSymlink { file }.into());
        }
    }
    Ok(())
}

/// Creates the scratch root with listing denied (`0o300`).
pub fn prepare_scratch_root(root: &Path) -> Result<()> {
    if !root.exists() {
        std::fs::create_dir_all(root)
            .with_context(|| format!("creating scratch root {}", root.display()))?;
    }
    set_mode(root, 0o300)
}

/// Temporarily grants read permission on the scratch root for the startup
/// scan; listing is denied again on drop.
pub struct ScratchScanPermit {
    root: PathBuf,
}

impl ScratchScanPermit {
    /// Opens the scratch root for reading.
    pub fn open(root: &Path) -> Result<Self> {
        set_mode(root, 0o700)?;
        Ok(Self { root: root.to_path_buf() })
    }
}

impl Drop for ScratchScanPermit {
    fn drop(&mut self) {
        if let Err(err) = set_mode(&self.root, 0o300) {
            tracing::warn!(
                target: "repogen::acquire",
                "failed to restore scratch root permissions on {}: {err:#}",
                self.root.display()
            );
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn symlink(target: &Path, link: &Path) {
        std::os::unix::fs::symlink(target, link).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_in_bounds_symlink_passes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("real.yaml"), "kind: ConfigMap\n").unwrap();
        symlink(&dir.path().join("real.yaml"), &dir.path().join("link.yaml"));
        check_out_of_bounds_symlinks(dir.path()).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_escaping_symlink_fails() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "shh").unwrap();

        let dir = TempDir::new().unwrap();
        symlink(&outside.path().join("secret"), &dir.path().join("leak.yaml"));

        let err = check_out_of_bounds_symlinks(dir.path()).unwrap_err();
        let render_err = err.downcast_ref::<RenderError>().unwrap();
        assert!(matches!(render_err, RenderError::OutOfBoundsSymlink { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn test_dangling_relative_escape_fails() {
        let dir = TempDir::new().unwrap();
        symlink(Path::new("../../outside/secret"), &dir.path().join("dangling.yaml"));

        let err = check_out_of_bounds_symlinks(dir.path()).unwrap_err();
        assert!(err.to_string().contains("out-of-bounds"));
    }

    #[test]
    #[cfg(unix)]
    fn test_dangling_in_bounds_symlink_passes() {
        let dir = TempDir::new().unwrap();
        symlink(Path::new("missing-but-inside.yaml"), &dir.path().join("dangling.yaml"));
        check_out_of_bounds_symlinks(dir.path()).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_scratch_root_permission_lifecycle() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let root = dir.path().join("scratch");
        prepare_scratch_root(&root).unwrap();
        let mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o300);

        {
            let _permit = ScratchScanPermit::open(&root).unwrap();
            let mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
        let mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o300);

        // Restore access so the tempdir can be removed.
        set_mode(&root, 0o700).unwrap();
    }
}
