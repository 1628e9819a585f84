//! Seams to the external tools.
//!
//! The pipeline only talks to ffprobe and ffmpeg through these traits, so the
//! whole state machine can run against the mocks in [`crate::testing`].

use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use log::info;

use crate::config::ConvertConfig;
use crate::error::{ProbeError, ToolError, TranscodeError};

/// Codec and alpha verdict for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub is_target_codec: bool,
    pub has_alpha: bool,
}

/// Structural validation result for a media file
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn valid() -> Self {
        Self { is_valid: true, issues: Vec::new() }
    }

    pub fn invalid(issue: impl Into<String>) -> Self {
        Self { is_valid: false, issues: vec![issue.into()] }
    }

    /// Issues joined for a result line
    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            "unknown validation failure".to_string()
        } else {
            self.issues.join("; ")
        }
    }
}

/// Read-only media queries. Implementations must never touch the filesystem.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Decide whether `path` is a target-codec asset and whether it carries alpha
    async fn classify(&self, path: &Path) -> Result<Classification, ProbeError>;

    /// Check that `path` is a readable media file with a video stream
    async fn validate(&self, path: &Path) -> Result<ValidationReport, ProbeError>;
}

/// Output of a finished encode
#[derive(Debug, Clone, Default)]
pub struct TranscodeOutput {
    pub stderr: String,
}

/// The opaque, long-running encode step
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encode `input` into `output`, giving up after `timeout`
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<TranscodeOutput, TranscodeError>;
}

/// Resolved locations of the external tools
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

/// Fail fast when ffprobe or ffmpeg cannot be found
pub fn preflight(cfg: &ConvertConfig) -> Result<ToolPaths, ToolError> {
    let ffprobe = which::which(&cfg.ffprobe_bin)
        .map_err(|_| ToolError::ProbeUnavailable(cfg.ffprobe_bin.clone()))?;
    let ffmpeg = which::which(&cfg.ffmpeg_bin)
        .map_err(|_| ToolError::TranscoderUnavailable(cfg.ffmpeg_bin.clone()))?;

    info!("Using ffprobe: {}", ffprobe.display());
    info!("Using ffmpeg: {}", ffmpeg.display());
    Ok(ToolPaths { ffmpeg, ffprobe })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preflight_missing_probe_is_fatal() {
        let cfg = ConvertConfig {
            ffprobe_bin: PathBuf::from("/nonexistent/ffprobe-missing"),
            ..Default::default()
        };
        assert!(matches!(preflight(&cfg), Err(ToolError::ProbeUnavailable(_))));
    }

    #[test]
    fn test_preflight_missing_transcoder_is_fatal() {
        // `sh` exists on any unix test host, so only ffmpeg is missing
        let cfg = ConvertConfig {
            ffprobe_bin: PathBuf::from("sh"),
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg-missing"),
            ..Default::default()
        };
        assert!(matches!(preflight(&cfg), Err(ToolError::TranscoderUnavailable(_))));
    }

    #[test]
    fn test_validation_report_summary() {
        assert_eq!(ValidationReport::invalid("no video stream").summary(), "no video stream");
        let report = ValidationReport {
            is_valid: false,
            issues: vec!["a".into(), "b".into()],
        };
        assert_eq!(report.summary(), "a; b");
    }
}
