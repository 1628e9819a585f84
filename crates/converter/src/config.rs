use std::collections::HashSet;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::lifecycle::ReservedFolders;

/// Configuration for a bulk ProRes conversion run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Path to the ffmpeg binary (looked up on PATH when relative)
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary (looked up on PATH when relative)
    pub ffprobe_bin: PathBuf,
    /// File extensions considered during discovery (case-insensitive, no dot)
    pub extensions: Vec<String>,
    /// Codec name that marks a file as a conversion candidate
    pub target_codec: String,
    /// Per-directory state folder names
    pub reserved: ReservedFolders,
    /// Number of assets converted in parallel
    pub workers: usize,
    /// Number of ffprobe classifications in flight during discovery
    pub probe_concurrency: usize,
    /// Extra attempts after the first one (2 = three attempts total)
    pub max_retries: u32,
    /// Hard limit for a single encode, in seconds
    pub encode_timeout_secs: u64,
    /// Which validation failures are eligible for retry
    pub validation_retry: ValidationRetryPolicy,
    /// Encoder argument template
    pub encode: EncodeSettings,
    /// Restore files stranded in processing folders before discovery
    pub reconcile_on_start: bool,
    /// Lowercase stderr fragments treated as resource contention
    pub transient_patterns: Vec<String>,
}

/// When a failed validation may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRetryPolicy {
    /// Validation failures always quarantine immediately
    Never,
    /// Only output validation failures (missing, zero-size, unreadable) are retried
    PostEncodeOnly,
    /// Input and output validation failures are both retried
    Always,
}

impl Default for ValidationRetryPolicy {
    fn default() -> Self {
        ValidationRetryPolicy::PostEncodeOnly
    }
}

/// Audio handling in the encode template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AudioMode {
    /// Pass audio streams through untouched
    Copy,
    /// Re-encode audio to AAC at a fixed bitrate
    Aac { bitrate_kbps: u32 },
}

/// Fixed ffmpeg argument template for the H.264 re-encode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    pub video_codec: String,
    pub crf: u8,
    pub preset: String,
    pub pixel_format: String,
    pub audio: AudioMode,
    /// Move the moov atom to the front so the output streams
    pub faststart: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            crf: 23,
            preset: "medium".to_string(),
            pixel_format: "yuv420p".to_string(),
            audio: AudioMode::Copy,
            faststart: true,
        }
    }
}

/// Stderr fragments that usually mean the machine was busy rather than the file being bad
pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    "resource temporarily unavailable",
    "device or resource busy",
    "cannot allocate memory",
    "too many open files",
    "connection reset",
];

impl Default for ConvertConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConvertConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            extensions: vec!["mov".to_string()],
            target_codec: "prores".to_string(),
            reserved: ReservedFolders::default(),
            workers: 4,
            probe_concurrency: 16,
            max_retries: 2,
            encode_timeout_secs: 300,
            validation_retry: ValidationRetryPolicy::default(),
            encode: EncodeSettings::default(),
            reconcile_on_start: true,
            transient_patterns: DEFAULT_TRANSIENT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.probe_concurrency == 0 {
            bail!("probe_concurrency must be at least 1");
        }
        if self.encode_timeout_secs == 0 {
            bail!("encode_timeout_secs must be greater than zero");
        }
        if self.extensions.is_empty() {
            bail!("at least one extension is required");
        }

        let names = self.reserved.names();
        let unique: HashSet<_> = names.iter().collect();
        if unique.len() != names.len() {
            bail!("reserved folder names must be distinct: {:?}", names);
        }
        for name in names {
            if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
                bail!("invalid reserved folder name: {:?}", name);
            }
        }

        Ok(())
    }

    /// True when `path` has one of the configured extensions
    pub fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ConvertConfig::default();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.encode_timeout_secs, 300);
        assert_eq!(cfg.reserved.processing, "_PROCESSING");
        assert_eq!(cfg.validation_retry, ValidationRetryPolicy::PostEncodeOnly);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = ConvertConfig::load_config(Some(Path::new("/nonexistent/prorescv.toml"))).unwrap();
        assert_eq!(cfg.target_codec, "prores");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        std::fs::write(
            &path,
            "workers = 8\nvalidation_retry = \"never\"\n\n[encode]\ncrf = 18\naudio = { mode = \"aac\", bitrate_kbps = 192 }\n",
        )
        .unwrap();

        let cfg = ConvertConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.validation_retry, ValidationRetryPolicy::Never);
        assert_eq!(cfg.encode.crf, 18);
        assert_eq!(cfg.encode.audio, AudioMode::Aac { bitrate_kbps: 192 });
        assert_eq!(cfg.encode.preset, "medium");
        assert_eq!(cfg.max_retries, 2);
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{"max_retries": 0, "extensions": ["mov", "MXF"]}"#).unwrap();

        let cfg = ConvertConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.max_retries, 0);
        assert!(cfg.matches_extension(Path::new("/a/b.mxf")));
        assert!(cfg.matches_extension(Path::new("/a/b.MOV")));
        assert!(!cfg.matches_extension(Path::new("/a/b.mp4")));
        assert!(!cfg.matches_extension(Path::new("/a/noext")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = ConvertConfig::default();
        cfg.workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ConvertConfig::default();
        cfg.reserved.failed = "_SOURCE".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = ConvertConfig::default();
        cfg.reserved.alpha = "a/b".to_string();
        assert!(cfg.validate().is_err());
    }
}
