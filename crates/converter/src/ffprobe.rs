use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::ProbeError;
use crate::oracle::{Classification, MediaProbe, ValidationReport};

/// Complete ffprobe output structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: Option<i32>,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub pix_fmt: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

impl FFProbeData {
    /// First video stream, if any
    pub fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Structural checks on a full probe
    pub fn validation_report(&self) -> ValidationReport {
        let mut issues = Vec::new();

        if self.video_stream().is_none() {
            issues.push("no video stream".to_string());
        }

        if let Some(duration) = self.format.as_ref().and_then(|f| f.duration.as_deref()) {
            match duration.parse::<f64>() {
                Ok(d) if d > 0.0 => {}
                Ok(d) => issues.push(format!("non-positive duration: {}", d)),
                Err(_) => issues.push(format!("unreadable duration: {}", duration)),
            }
        }

        ValidationReport {
            is_valid: issues.is_empty(),
            issues,
        }
    }
}

/// Pixel format prefixes that carry an alpha plane
const ALPHA_PIXEL_FORMATS: &[&str] = &[
    "yuva", "rgba", "bgra", "argb", "abgr", "gbrap", "ya8", "ya16", "ayuv", "rgba64", "bgra64",
];

/// True when the ffprobe pixel format name carries an alpha channel.
///
/// `gray`, `pal8` and friends contain the letter `a` but no alpha plane, so
/// this matches known alpha families by prefix.
pub fn pixel_format_has_alpha(pix_fmt: &str) -> bool {
    let fmt = pix_fmt.trim().to_lowercase();
    ALPHA_PIXEL_FORMATS.iter().any(|p| fmt.starts_with(p))
}

/// First video stream plus container size; enough to classify without a full probe
const CLASSIFY_ARGS: &[&str] = &[
    "-v", "error",
    "-select_streams", "v:0",
    "-show_entries", "stream=index,codec_type,codec_name,pix_fmt:format=size",
    "-print_format", "json",
];

/// ffprobe-backed classifier and validator
#[derive(Debug, Clone)]
pub struct FfprobeTool {
    ffprobe_bin: PathBuf,
    target_codec: String,
}

impl FfprobeTool {
    pub fn new(ffprobe_bin: impl Into<PathBuf>, target_codec: impl Into<String>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
            target_codec: target_codec.into().to_lowercase(),
        }
    }

    /// Run ffprobe with `args` followed by `file_path` and parse the JSON output
    async fn probe_json(&self, args: &[&str], file_path: &Path) -> Result<FFProbeData, ProbeError> {
        debug!("ffprobe {} {}", args.join(" "), file_path.display());

        let output = Command::new(&self.ffprobe_bin)
            .args(args)
            .arg(file_path)
            .output()
            .await
            .map_err(ProbeError::Spawn)?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Turn a video-stream probe into a classification
    pub fn classification_from(&self, data: &FFProbeData) -> Result<Classification, ProbeError> {
        let stream = data.video_stream().ok_or(ProbeError::NoVideoStream)?;
        let is_target_codec = stream
            .codec_name
            .as_deref()
            .map(|c| c.to_lowercase().contains(&self.target_codec))
            .unwrap_or(false);
        let has_alpha = stream
            .pix_fmt
            .as_deref()
            .map(pixel_format_has_alpha)
            .unwrap_or(false);

        Ok(Classification { is_target_codec, has_alpha })
    }
}

#[async_trait]
impl MediaProbe for FfprobeTool {
    async fn classify(&self, path: &Path) -> Result<Classification, ProbeError> {
        let data = self
            .probe_json(CLASSIFY_ARGS, path)
            .await?;
        self.classification_from(&data)
    }

    async fn validate(&self, path: &Path) -> Result<ValidationReport, ProbeError> {
        let data = match self
            .probe_json(
                &["-v", "error", "-print_format", "json", "-show_streams", "-show_format"],
                path,
            )
            .await
        {
            Ok(data) => data,
            // Unreadable media is a validation verdict, not a tool failure
            Err(ProbeError::Failed { stderr, .. }) => {
                return Ok(ValidationReport::invalid(format!("ffprobe rejected file: {}", stderr)));
            }
            Err(ProbeError::Parse(e)) => {
                return Ok(ValidationReport::invalid(format!("unparseable probe output: {}", e)));
            }
            Err(e) => return Err(e),
        };
        Ok(data.validation_report())
    }
}
