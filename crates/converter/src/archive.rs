use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::ConvertConfig;
use crate::lifecycle::unique_destination;
use crate::oracle::MediaProbe;

/// Outcome of archiving one source directory
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveSummary {
    /// Archive paths of the files that were moved
    pub moved: Vec<PathBuf>,
    /// Target-codec files left in place because they carry alpha
    pub alpha_skipped: Vec<PathBuf>,
    /// Candidates in another codec, or that could not be probed
    pub non_target: usize,
    pub errors: Vec<String>,
}

impl ArchiveSummary {
    /// True when the source directory held no candidate files at all
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.alpha_skipped.is_empty() && self.non_target == 0 && self.errors.is_empty()
    }
}

/// Move every target-codec file without alpha from `source` into `archive`.
///
/// Only the top level of `source` is considered. Names already taken in the
/// archive get a numeric suffix.
pub async fn archive_sources(
    source: &Path,
    archive: &Path,
    cfg: &ConvertConfig,
    probe: &dyn MediaProbe,
) -> Result<ArchiveSummary> {
    let mut candidates: Vec<PathBuf> = fs::read_dir(source)
        .with_context(|| format!("Failed to read source directory: {}", source.display()))?
        .filter_map(|entry| match entry {
            Ok(e) => Some(e.path()),
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                None
            }
        })
        .filter(|p| p.is_file() && cfg.matches_extension(p))
        .collect();
    candidates.sort();

    let mut summary = ArchiveSummary::default();
    if candidates.is_empty() {
        return Ok(summary);
    }

    fs::create_dir_all(archive)
        .with_context(|| format!("Failed to create archive directory: {}", archive.display()))?;
    info!("Archiving {} candidate(s) from {} to {}", candidates.len(), source.display(), archive.display());

    for path in candidates {
        let classification = match probe.classify(&path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Could not probe {}: {}", path.display(), e);
                summary.non_target += 1;
                continue;
            }
        };

        if !classification.is_target_codec {
            debug!("Not a {} file: {}", cfg.target_codec, path.display());
            summary.non_target += 1;
            continue;
        }
        if classification.has_alpha {
            summary.alpha_skipped.push(path);
            continue;
        }

        let Some(name) = path.file_name() else { continue };
        let dest = unique_destination(archive, name);
        match move_file(&path, &dest) {
            Ok(()) => {
                debug!("Archived {} -> {}", path.display(), dest.display());
                summary.moved.push(dest);
            }
            Err(e) => {
                let message = format!("Error moving {}: {:#}", name.to_string_lossy(), e);
                warn!("{}", message);
                summary.errors.push(message);
            }
        }
    }

    info!(
        "Archive complete: {} moved, {} with alpha, {} other codec, {} error(s)",
        summary.moved.len(),
        summary.alpha_skipped.len(),
        summary.non_target,
        summary.errors.len()
    );
    Ok(summary)
}

/// Rename, falling back to copy and delete when the archive is on another filesystem
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).with_context(|| format!("Failed to copy to {}", to.display()))?;
    if let Err(e) = fs::remove_file(from) {
        // Keep exactly one copy: drop the archived duplicate again
        let _ = fs::remove_file(to);
        return Err(e).with_context(|| format!("Failed to remove {}", from.display()));
    }
    Ok(())
}
