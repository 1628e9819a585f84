use std::path::PathBuf;
use serde::Serialize;
use thiserror::Error;

/// Missing external tools. These abort the whole run before anything is moved.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("ffprobe not found at {0:?}. Please install ffmpeg.")]
    ProbeUnavailable(PathBuf),

    #[error("ffmpeg not found at {0:?}. Please install ffmpeg.")]
    TranscoderUnavailable(PathBuf),
}

/// Failure to classify or validate a file with ffprobe
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run ffprobe: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ffprobe exited with code {exit_code:?}: {stderr}")]
    Failed { exit_code: Option<i32>, stderr: String },

    #[error("could not parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no video stream")]
    NoVideoStream,
}

/// Failure to move a file into the processing folder
#[derive(Debug, Error)]
pub enum ClaimError {
    /// The processing folder already holds a file with this name
    #[error("already claimed by another owner: {0}")]
    AlreadyClaimed(PathBuf),

    /// The file is no longer at its discovered location
    #[error("file vanished before it could be claimed: {0}")]
    Missing(PathBuf),

    #[error("could not claim {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of the external encode step
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ffmpeg timed out after {secs} seconds and was killed")]
    TimedOut { secs: u64 },

    /// `exit_code` is None when the process was terminated by a signal
    #[error("ffmpeg failed (exit code {exit_code:?}): {stderr}")]
    Failed { exit_code: Option<i32>, stderr: String },
}

/// Why a single conversion attempt failed
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error("input failed validation: {0}")]
    InputInvalid(String),

    #[error("zero size output")]
    ZeroSizeOutput,

    #[error("encoder produced no output file")]
    MissingOutput,

    #[error("output failed validation: {0}")]
    OutputInvalid(String),

    #[error("encode timed out after {secs} seconds")]
    TimedOut { secs: u64 },

    #[error("ffmpeg error (exit code {exit_code:?}): {stderr}")]
    ExternalTool { exit_code: Option<i32>, stderr: String },

    #[error("{0}")]
    Unexpected(String),
}

impl AttemptError {
    /// Coarse kind reported to the caller
    pub fn kind(&self) -> OutcomeKind {
        match self {
            AttemptError::Claim(_) => OutcomeKind::ClaimError,
            AttemptError::InputInvalid(_) | AttemptError::OutputInvalid(_) => {
                OutcomeKind::ValidationFailed
            }
            // Zero-size and missing outputs are the encoder's fault, not the file's
            AttemptError::ZeroSizeOutput | AttemptError::MissingOutput => {
                OutcomeKind::ExternalToolError
            }
            AttemptError::TimedOut { .. } => OutcomeKind::TimedOut,
            AttemptError::ExternalTool { .. } => OutcomeKind::ExternalToolError,
            AttemptError::Unexpected(_) => OutcomeKind::Unexpected,
        }
    }
}

impl From<TranscodeError> for AttemptError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::TimedOut { secs } => AttemptError::TimedOut { secs },
            TranscodeError::Failed { exit_code, stderr } => {
                AttemptError::ExternalTool { exit_code, stderr }
            }
            TranscodeError::Spawn(e) => AttemptError::Unexpected(format!("failed to spawn ffmpeg: {}", e)),
        }
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(err: std::io::Error) -> Self {
        AttemptError::Unexpected(err.to_string())
    }
}

/// Outcome of one attempt or of a whole asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    ClaimError,
    ValidationFailed,
    TimedOut,
    ExternalToolError,
    Unexpected,
}

impl OutcomeKind {
    pub fn is_success(&self) -> bool {
        *self == OutcomeKind::Success
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::ClaimError => "claim error",
            OutcomeKind::ValidationFailed => "validation failed",
            OutcomeKind::TimedOut => "timed out",
            OutcomeKind::ExternalToolError => "external tool error",
            OutcomeKind::Unexpected => "unexpected error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcode_error_mapping() {
        let e: AttemptError = TranscodeError::TimedOut { secs: 300 }.into();
        assert_eq!(e.kind(), OutcomeKind::TimedOut);

        let e: AttemptError = TranscodeError::Failed { exit_code: Some(1), stderr: "boom".into() }.into();
        assert_eq!(e.kind(), OutcomeKind::ExternalToolError);
        assert!(e.to_string().contains("boom"));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: AttemptError = TranscodeError::Spawn(io).into();
        assert_eq!(e.kind(), OutcomeKind::Unexpected);
    }

    #[test]
    fn test_zero_size_is_tool_error() {
        assert_eq!(AttemptError::ZeroSizeOutput.kind(), OutcomeKind::ExternalToolError);
        assert_eq!(AttemptError::ZeroSizeOutput.to_string(), "zero size output");
        assert_eq!(AttemptError::OutputInvalid("x".into()).kind(), OutcomeKind::ValidationFailed);
    }
}
