use std::path::PathBuf;
use serde::Serialize;

/// Where an asset currently sits in its per-directory lifecycle.
///
/// The state is the folder holding the file: `Discovered` is the original
/// location, every other state is one of the reserved subfolders of the
/// asset's own parent directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovered,
    Claimed,
    Committed,
    Quarantined,
    AlphaQuarantined,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Committed | LifecycleState::Quarantined | LifecycleState::AlphaQuarantined
        )
    }
}

/// A classified file found during discovery. Identity is the path at discovery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub path: PathBuf,
    pub has_target_codec: bool,
    pub has_alpha: bool,
    pub size_bytes: u64,
    pub state: LifecycleState,
}

impl Asset {
    pub fn new(path: PathBuf, has_target_codec: bool, has_alpha: bool, size_bytes: u64) -> Self {
        Self {
            path,
            has_target_codec,
            has_alpha,
            size_bytes,
            state: LifecycleState::Discovered,
        }
    }

    /// File name for messages, falling back to the full path
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!LifecycleState::Discovered.is_terminal());
        assert!(!LifecycleState::Claimed.is_terminal());
        assert!(LifecycleState::Committed.is_terminal());
        assert!(LifecycleState::Quarantined.is_terminal());
        assert!(LifecycleState::AlphaQuarantined.is_terminal());
    }

    #[test]
    fn test_new_asset_is_discovered() {
        let asset = Asset::new(PathBuf::from("/shoot/day1/A001.mov"), true, false, 42);
        assert_eq!(asset.state, LifecycleState::Discovered);
        assert_eq!(asset.display_name(), "A001.mov");
    }
}
