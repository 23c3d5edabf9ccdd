//! Bounded archive extraction.
//!
//! Charts and archives are extracted into per-request directories with a cap
//! on the uncompressed size, so an adversarial archive cannot fill the disk.
//! On any failure the partially extracted directory is removed before the
//! error is returned.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tar::Archive;

use crate::core::RenderError;

/// Extracts a gzip-compressed tarball into `dest`, enforcing `max_bytes` on
/// the uncompressed contents when set.
///
/// Entry paths are confined to `dest` (the archive cannot write outside the
/// destination). Partial extractions are cleaned up on every error path.
pub fn extract_tar_gz_capped(archive_path: &Path, dest: &Path, max_bytes: Option<u64>) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("creating extraction directory {}", dest.display()))?;

    let result = extract_inner(archive_path, dest, max_bytes);
    if result.is_err() {
        if let Err(cleanup_err) = std::fs::remove_dir_all(dest) {
            tracing::warn!(
                target: "repogen::acquire",
                "failed to clean up partial extraction at {}: {}",
                dest.display(),
                cleanup_err
            );
        }
    }
    result
}

fn extract_inner(archive_path: &Path, dest: &Path, max_bytes: Option<u64>) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut archive = Archive::new(decoder);
    archive.set_overwrite(true);

    let mut extracted: u64 = 0;
    for entry in archive.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        extracted = extracted.saturating_add(entry.header().size().unwrap_or(0));
        if let Some(limit) = max_bytes {
            if extracted > limit {
                return Err(RenderError::ExtractionSizeExceeded { limit }.into());
            }
        }
        // unpack_in refuses entries that would escape the destination.
        let unpacked = entry.unpack_in(dest).context("unpacking archive entry")?;
        if !unpacked {
            tracing::debug!(
                target: "repogen::acquire",
                "skipped archive entry outside destination: {:?}",
                entry.path().unwrap_or_default()
            );
        }
    }
    Ok(())
}
