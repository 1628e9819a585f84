use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::asset::LifecycleState;
use crate::error::ClaimError;

/// Names of the per-directory state folders.
///
/// Any directory carrying one of these names is never scanned again, so they
/// double as the discovery exclusion list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservedFolders {
    pub processing: String,
    pub source: String,
    pub failed: String,
    pub alpha: String,
}

impl Default for ReservedFolders {
    fn default() -> Self {
        Self {
            processing: "_PROCESSING".to_string(),
            source: "_SOURCE".to_string(),
            failed: "_FAILED".to_string(),
            alpha: "_ALPHA".to_string(),
        }
    }
}

impl ReservedFolders {
    pub fn names(&self) -> [&str; 4] {
        [
            self.processing.as_str(),
            self.source.as_str(),
            self.failed.as_str(),
            self.alpha.as_str(),
        ]
    }

    /// True when `name` is one of the reserved folder names
    pub fn contains(&self, name: &OsStr) -> bool {
        name.to_str()
            .map(|n| self.names().contains(&n))
            .unwrap_or(false)
    }

    /// Folder name holding files in `state`, None for the original location
    pub fn folder_for(&self, state: LifecycleState) -> Option<&str> {
        match state {
            LifecycleState::Discovered => None,
            LifecycleState::Claimed => Some(self.processing.as_str()),
            LifecycleState::Committed => Some(self.source.as_str()),
            LifecycleState::Quarantined => Some(self.failed.as_str()),
            LifecycleState::AlphaQuarantined => Some(self.alpha.as_str()),
        }
    }
}

/// Exclusive ownership of a file sitting in its processing folder.
///
/// Not `Clone`: a claim is released exactly once, by `commit` or `quarantine`.
#[derive(Debug)]
pub struct Claim {
    original: PathBuf,
    claimed: PathBuf,
}

impl Claim {
    /// Path the asset was discovered at, and where the encoded output goes
    pub fn original(&self) -> &Path {
        &self.original
    }

    /// Current location of the untouched source file
    pub fn claimed(&self) -> &Path {
        &self.claimed
    }
}

/// A release that failed; the claim is handed back so the caller can try another route
#[derive(Debug, Error)]
#[error("could not move {} out of processing: {source}", .claim.claimed.display())]
pub struct ReleaseError {
    pub claim: Claim,
    #[source]
    pub source: io::Error,
}

/// Moves files between the original location and the reserved folders.
#[derive(Debug, Clone)]
pub struct StateStore {
    folders: ReservedFolders,
}

impl StateStore {
    pub fn new(folders: ReservedFolders) -> Self {
        Self { folders }
    }

    pub fn folders(&self) -> &ReservedFolders {
        &self.folders
    }

    /// `<parent>/<reserved>` for the given state, created if missing
    fn ensure_state_dir(&self, original: &Path, state: LifecycleState) -> io::Result<PathBuf> {
        let parent = original.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{} has no parent directory", original.display()))
        })?;
        let folder = self.folders.folder_for(state).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("{:?} has no state folder", state))
        })?;
        let dir = parent.join(folder);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Move `original` into `<parent>/_PROCESSING/<name>`.
    ///
    /// On error nothing has been moved.
    pub fn claim(&self, original: &Path) -> Result<Claim, ClaimError> {
        let file_name = original.file_name().ok_or_else(|| ClaimError::Io {
            path: original.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
        })?;
        let dir = self
            .ensure_state_dir(original, LifecycleState::Claimed)
            .map_err(|source| ClaimError::Io { path: original.to_path_buf(), source })?;
        let claimed = dir.join(file_name);

        // A file already in processing belongs to someone else (or to a crashed run)
        if claimed.exists() {
            return Err(ClaimError::AlreadyClaimed(claimed));
        }

        match fs::rename(original, &claimed) {
            Ok(()) => {
                debug!("Claimed {} -> {}", original.display(), claimed.display());
                Ok(Claim { original: original.to_path_buf(), claimed })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !original.exists() => {
                Err(ClaimError::Missing(original.to_path_buf()))
            }
            Err(source) => Err(ClaimError::Io { path: original.to_path_buf(), source }),
        }
    }

    /// Archive the claimed source into `_SOURCE`; the encoded output keeps the original path
    pub fn commit(&self, claim: Claim) -> Result<PathBuf, ReleaseError> {
        self.release(claim, LifecycleState::Committed)
    }

    /// Move the claimed source into `_FAILED`
    pub fn quarantine(&self, claim: Claim) -> Result<PathBuf, ReleaseError> {
        self.release(claim, LifecycleState::Quarantined)
    }

    fn release(&self, claim: Claim, state: LifecycleState) -> Result<PathBuf, ReleaseError> {
        let result = self
            .ensure_state_dir(&claim.original, state)
            .and_then(|dir| {
                let dest = unique_destination(&dir, claim.claimed.file_name().unwrap_or_default());
                fs::rename(&claim.claimed, &dest).map(|()| dest)
            });

        match result {
            Ok(dest) => {
                debug!("{:?}: {} -> {}", state, claim.claimed.display(), dest.display());
                Ok(dest)
            }
            Err(source) => Err(ReleaseError { claim, source }),
        }
    }

    /// Move an alpha-bearing file straight into `_ALPHA`; it is never claimed
    pub fn quarantine_alpha(&self, original: &Path) -> io::Result<PathBuf> {
        let dir = self.ensure_state_dir(original, LifecycleState::AlphaQuarantined)?;
        let dest = unique_destination(&dir, original.file_name().unwrap_or_default());
        fs::rename(original, &dest)?;
        Ok(dest)
    }

    /// Processing slot for `original`; claims never take a suffixed name
    pub fn claimed_path(&self, original: &Path) -> Option<PathBuf> {
        let parent = original.parent()?;
        Some(parent.join(&self.folders.processing).join(original.file_name()?))
    }

    /// Lifecycle state implied by the folder `path` sits in.
    ///
    /// Only meaningful for a path returned by a transition. Terminal folders
    /// collect every earlier archive of the same name, so the presence of a
    /// name there says nothing about the current asset.
    pub fn state_of(&self, path: &Path) -> LifecycleState {
        let folder = path.parent().and_then(Path::file_name);
        [
            LifecycleState::Claimed,
            LifecycleState::Committed,
            LifecycleState::Quarantined,
            LifecycleState::AlphaQuarantined,
        ]
        .into_iter()
        .find(|state| folder == self.folders.folder_for(*state).map(OsStr::new))
        .unwrap_or(LifecycleState::Discovered)
    }

    /// Restore files stranded in processing folders by a killed run.
    ///
    /// Each stranded file goes back to its original path so the next discovery
    /// picks it up again. A partial encode occupying that path is kept as
    /// `_FAILED/<name>.partial`. Returns the restored original paths.
    pub fn reconcile(&self, root: &Path) -> Result<Vec<PathBuf>> {
        if !root.is_dir() {
            anyhow::bail!("Reconcile root is not a directory: {}", root.display());
        }
        let mut restored = Vec::new();
        let processing = OsStr::new(&self.folders.processing);

        let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
            // Only descend into processing folders among the reserved ones
            e.depth() == 0 || !self.folders.contains(e.file_name()) || e.file_name() == processing
        });

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let claimed = entry.path();
            let claim_dir = match claimed.parent() {
                Some(dir) if dir.file_name() == Some(processing) => dir,
                _ => continue,
            };
            let Some(asset_dir) = claim_dir.parent() else { continue };
            let Some(name) = claimed.file_name() else { continue };
            let original = asset_dir.join(name);

            // One stuck file must not hold back the rest of the tree
            match self.restore(claimed, &original) {
                Ok(()) => restored.push(original),
                Err(e) => warn!("Leaving {} in place: {:#}", claimed.display(), e),
            }
        }

        Ok(restored)
    }

    /// Move one stranded file back to `original`, first setting aside whatever occupies it
    fn restore(&self, claimed: &Path, original: &Path) -> Result<()> {
        if original.exists() {
            let failed_dir = self
                .ensure_state_dir(original, LifecycleState::Quarantined)
                .with_context(|| format!("Failed to create failed folder for: {}", original.display()))?;
            let mut partial_name = original.file_name().unwrap_or_default().to_os_string();
            partial_name.push(".partial");
            let dest = unique_destination(&failed_dir, &partial_name);
            fs::rename(original, &dest)
                .with_context(|| format!("Failed to preserve partial output: {}", original.display()))?;
            warn!("Preserved partial output {} as {}", original.display(), dest.display());
        }

        fs::rename(claimed, original)
            .with_context(|| format!("Failed to restore stranded file: {}", claimed.display()))?;
        info!("🔄 Restored stranded file {} -> {}", claimed.display(), original.display());
        Ok(())
    }
}

/// `dir/name`, or `dir/<stem>.<n>.<ext>` with the first free `n` if taken
pub(crate) fn unique_destination(dir: &Path, name: &OsStr) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let name_path = Path::new(name);
    let stem = name_path.file_stem().unwrap_or(name).to_string_lossy();
    let ext = name_path.extension().map(|e| e.to_string_lossy());

    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{}.{}.{}", stem, n, ext)),
            None => dir.join(format!("{}.{}", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn setup(name: &str, contents: &[u8]) -> (TempDir, StateStore, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let shoot = dir.path().join("day1");
        fs::create_dir_all(&shoot).unwrap();
        let file = shoot.join(name);
        fs::write(&file, contents).unwrap();
        (dir, StateStore::new(ReservedFolders::default()), file)
    }

    #[test]
    fn test_claim_moves_into_processing() {
        let (_dir, store, file) = setup("A001.mov", b"prores");
        let claim = store.claim(&file).unwrap();

        assert!(!file.exists());
        assert_eq!(claim.claimed(), file.parent().unwrap().join("_PROCESSING/A001.mov"));
        assert_eq!(claim.original(), file);
        assert_eq!(store.claimed_path(&file).as_deref(), Some(claim.claimed()));
        assert_eq!(store.state_of(claim.claimed()), LifecycleState::Claimed);
    }

    #[test]
    fn test_second_claim_is_rejected() {
        let (_dir, store, file) = setup("A001.mov", b"prores");
        let _claim = store.claim(&file).unwrap();

        // Same name shows up again at the original path
        fs::write(&file, b"other").unwrap();
        match store.claim(&file) {
            Err(ClaimError::AlreadyClaimed(p)) => assert!(p.ends_with("_PROCESSING/A001.mov")),
            other => panic!("expected AlreadyClaimed, got {:?}", other),
        }
        // Rejected claim leaves the file where it was
        assert_eq!(fs::read(&file).unwrap(), b"other");
    }

    #[test]
    fn test_claim_missing_file() {
        let (_dir, store, file) = setup("A001.mov", b"prores");
        fs::remove_file(&file).unwrap();
        assert!(matches!(store.claim(&file), Err(ClaimError::Missing(_))));
    }

    #[test]
    fn test_commit_archives_source() {
        let (_dir, store, file) = setup("A001.mov", b"prores");
        let claim = store.claim(&file).unwrap();
        fs::write(&file, b"h264").unwrap();

        let archived = store.commit(claim).unwrap();
        assert!(archived.ends_with("_SOURCE/A001.mov"));
        assert_eq!(fs::read(&archived).unwrap(), b"prores");
        assert_eq!(fs::read(&file).unwrap(), b"h264");
        assert_eq!(store.state_of(&archived), LifecycleState::Committed);
        assert_eq!(store.state_of(&file), LifecycleState::Discovered);
    }

    #[test]
    fn test_quarantine_keeps_single_copy() {
        let (_dir, store, file) = setup("A001.mov", b"prores");
        let claim = store.claim(&file).unwrap();
        let claimed = claim.claimed().to_path_buf();

        let failed = store.quarantine(claim).unwrap();
        assert!(failed.ends_with("_FAILED/A001.mov"));
        assert!(!claimed.exists());
        assert!(!file.exists());
        assert_eq!(store.state_of(&failed), LifecycleState::Quarantined);
    }

    #[test]
    fn test_alpha_quarantine() {
        let (_dir, store, file) = setup("key.mov", b"prores4444");
        let dest = store.quarantine_alpha(&file).unwrap();
        assert!(dest.ends_with("_ALPHA/key.mov"));
        assert!(!file.exists());
        assert_eq!(store.state_of(&dest), LifecycleState::AlphaQuarantined);
        assert!(!file.parent().unwrap().join("_PROCESSING").exists());
    }

    #[test]
    fn test_terminal_collision_gets_suffix() {
        let (_dir, store, file) = setup("A001.mov", b"first");
        let source_dir = file.parent().unwrap().join("_SOURCE");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(source_dir.join("A001.mov"), b"older").unwrap();

        let claim = store.claim(&file).unwrap();
        let archived = store.commit(claim).unwrap();
        assert_eq!(archived, source_dir.join("A001.1.mov"));
        assert_eq!(store.state_of(&archived), LifecycleState::Committed);
        assert_eq!(fs::read(source_dir.join("A001.mov")).unwrap(), b"older");
    }

    #[test]
    fn test_quarantine_beside_older_archive() {
        let (_dir, store, file) = setup("A001.mov", b"new");
        let source_dir = file.parent().unwrap().join("_SOURCE");
        fs::create_dir_all(&source_dir).unwrap();
        fs::write(source_dir.join("A001.mov"), b"from an earlier run").unwrap();

        let claim = store.claim(&file).unwrap();
        let failed = store.quarantine(claim).unwrap();
        assert_eq!(failed, file.parent().unwrap().join("_FAILED/A001.mov"));
        assert_eq!(store.state_of(&failed), LifecycleState::Quarantined);
        assert_eq!(fs::read(&failed).unwrap(), b"new");
    }

    #[test]
    fn test_state_of_ignores_lookalike_names() {
        let store = StateStore::new(ReservedFolders::default());
        assert_eq!(store.state_of(Path::new("/a/_SOURCE_OLD/x.mov")), LifecycleState::Discovered);
        assert_eq!(store.state_of(Path::new("/a/_FAILED/x.1.mov")), LifecycleState::Quarantined);
        assert_eq!(store.state_of(Path::new("x.mov")), LifecycleState::Discovered);
    }

    #[test]
    fn test_reconcile_restores_stranded_files() {
        let (dir, store, file) = setup("A001.mov", b"prores");
        let other = file.parent().unwrap().join("A002.mov");
        fs::write(&other, b"prores2").unwrap();

        let _c1 = store.claim(&file).unwrap();
        let _c2 = store.claim(&other).unwrap();
        // Killed mid-encode: partial output sits at the original path
        fs::write(&other, b"partial").unwrap();

        let mut restored = store.reconcile(dir.path()).unwrap();
        restored.sort();
        assert_eq!(restored, vec![file.clone(), other.clone()]);
        assert_eq!(fs::read(&file).unwrap(), b"prores");
        assert_eq!(fs::read(&other).unwrap(), b"prores2");
        let partial = file.parent().unwrap().join("_FAILED/A002.mov.partial");
        assert_eq!(fs::read(partial).unwrap(), b"partial");

        // Nothing left to do the second time
        assert!(store.reconcile(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_continues_past_a_failed_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(ReservedFolders::default());
        let day1 = dir.path().join("day1");
        let day2 = dir.path().join("day2");
        fs::create_dir_all(day1.join("_PROCESSING")).unwrap();
        fs::create_dir_all(day2.join("_PROCESSING")).unwrap();

        // day1's partial output cannot be set aside: `_FAILED` is a plain file
        fs::write(day1.join("_PROCESSING/A001.mov"), b"prores").unwrap();
        fs::write(day1.join("A001.mov"), b"partial").unwrap();
        fs::write(day1.join("_FAILED"), b"not a folder").unwrap();
        fs::write(day2.join("_PROCESSING/B001.mov"), b"prores2").unwrap();

        let restored = store.reconcile(dir.path()).unwrap();
        assert_eq!(restored, vec![day2.join("B001.mov")]);
        assert_eq!(fs::read(day2.join("B001.mov")).unwrap(), b"prores2");

        // The stuck file and the partial output are both left untouched
        assert_eq!(fs::read(day1.join("_PROCESSING/A001.mov")).unwrap(), b"prores");
        assert_eq!(fs::read(day1.join("A001.mov")).unwrap(), b"partial");
    }

    #[test]
    fn test_reconcile_rejects_missing_root() {
        let store = StateStore::new(ReservedFolders::default());
        assert!(store.reconcile(Path::new("/nonexistent/reconcile/root")).is_err());
    }

    #[test]
    fn test_reserved_name_matching() {
        let folders = ReservedFolders::default();
        assert!(folders.contains(OsStr::new("_SOURCE")));
        assert!(folders.contains(OsStr::new("_ALPHA")));
        assert!(!folders.contains(OsStr::new("SOURCE")));
        assert!(!folders.contains(OsStr::new("_source")));
    }

    proptest! {
        // Claim followed by either release leaves exactly one copy of the source
        #[test]
        fn test_release_never_duplicates(commit in any::<bool>(), name in "[a-zA-Z0-9]{1,12}") {
            let (_dir, store, file) = setup(&format!("{}.mov", name), b"src");
            let claim = store.claim(&file).unwrap();
            let dest = if commit { store.commit(claim).unwrap() } else { store.quarantine(claim).unwrap() };

            let parent = file.parent().unwrap();
            let copies = WalkDir::new(parent)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .count();
            prop_assert_eq!(copies, 1);
            prop_assert!(dest.is_file());
            prop_assert!(!file.exists());
        }
    }
}
