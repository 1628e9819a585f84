use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::asset::Asset;
use crate::config::ConvertConfig;
use crate::lifecycle::ReservedFolders;
use crate::oracle::MediaProbe;

/// Collect files under `root` with a configured extension, never entering reserved folders
pub fn find_candidates(root: &Path, cfg: &ConvertConfig) -> Result<Vec<(PathBuf, u64)>> {
    if !root.is_dir() {
        anyhow::bail!("Scan root is not a directory: {}", root.display());
    }

    info!("Scanning directory: {}", root.display());
    let reserved: &ReservedFolders = &cfg.reserved;
    let mut candidates = Vec::new();
    let mut entry_count = 0;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        // Prune the whole subtree below a reserved folder, not just its files
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && reserved.contains(e.file_name())));

    for entry in walker {
        entry_count += 1;

        // Log progress every 1000 entries
        if entry_count % 1000 == 0 {
            info!("Scanned {} entries so far in {}...", entry_count, root.display());
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !cfg.matches_extension(entry.path()) {
            continue;
        }

        let meta = entry.metadata().map_err(io::Error::from);
        if let Some(size) = candidate_size(entry.path(), meta) {
            candidates.push((entry.path().to_path_buf(), size));
        }
    }

    info!(
        "Finished scanning {}: {} entries, {} candidate files",
        root.display(),
        entry_count,
        candidates.len()
    );
    Ok(candidates)
}

/// Size of a listed candidate, or None (with a warning) if it can no longer be stat'ed
fn candidate_size(path: &Path, meta: io::Result<Metadata>) -> Option<u64> {
    match meta {
        Ok(meta) => {
            debug!("Found media file: {} ({} bytes)", path.display(), meta.len());
            Some(meta.len())
        }
        Err(e) => {
            warn!("Skipping {}: failed to stat file: {}", path.display(), e);
            None
        }
    }
}

/// Walk `root` and classify every candidate file.
///
/// Classification runs concurrently (bounded by `probe_concurrency`) and is
/// collected in completion order. A file that fails to probe is skipped, and
/// files not in the target codec are dropped. The result is sorted by path.
pub async fn discover(root: &Path, cfg: &ConvertConfig, probe: Arc<dyn MediaProbe>) -> Result<Vec<Asset>> {
    let candidates = {
        let root = root.to_path_buf();
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || find_candidates(&root, &cfg))
            .await
            .context("Directory scan task failed")??
    };

    let limit = Arc::new(Semaphore::new(cfg.probe_concurrency));
    let mut probes = JoinSet::new();

    for (path, size) in candidates {
        let probe = Arc::clone(&probe);
        let limit = Arc::clone(&limit);
        probes.spawn(async move {
            let _permit = limit.acquire_owned().await;
            let result = probe.classify(&path).await;
            (path, size, result)
        });
    }

    let mut assets = Vec::new();
    let mut failed = 0;
    let mut other_codec = 0;

    while let Some(joined) = probes.join_next().await {
        let (path, size, result) = match joined {
            Ok(r) => r,
            Err(e) => {
                warn!("Classification task failed: {}", e);
                failed += 1;
                continue;
            }
        };

        match result {
            Ok(c) if c.is_target_codec => {
                debug!("Classified {}: alpha={}", path.display(), c.has_alpha);
                assets.push(Asset::new(path, true, c.has_alpha, size));
            }
            Ok(_) => {
                other_codec += 1;
                debug!("Not a {} file: {}", cfg.target_codec, path.display());
            }
            Err(e) => {
                failed += 1;
                warn!("Skipping {}: {}", path.display(), e);
            }
        }
    }

    assets.sort_by(|a, b| a.path.cmp(&b.path));
    info!(
        "Discovery complete: {} {} file(s) ({} with alpha), {} other codec, {} unreadable",
        assets.len(),
        cfg.target_codec,
        assets.iter().filter(|a| a.has_alpha).count(),
        other_codec,
        failed
    );
    Ok(assets)
}
