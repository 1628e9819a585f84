pub mod config;
pub mod error;
pub mod asset;
pub mod lifecycle;
pub mod oracle;
pub mod ffprobe;
pub mod ffmpeg;
pub mod retry;
pub mod scan;
pub mod worker;
pub mod pipeline;
pub mod archive;
pub mod testing;

pub use config::{AudioMode, ConvertConfig, EncodeSettings, ValidationRetryPolicy};
pub use error::{AttemptError, ClaimError, OutcomeKind, ProbeError, ToolError, TranscodeError};
pub use asset::{Asset, LifecycleState};
pub use lifecycle::{Claim, ReservedFolders, StateStore};
pub use oracle::{preflight, Classification, MediaProbe, Transcoder, ValidationReport};
pub use ffprobe::FfprobeTool;
pub use ffmpeg::FfmpegTool;
pub use retry::{RetryPolicy, Verdict};
pub use worker::{AssetReport, ConversionAttempt, ConversionWorker};
pub use archive::{archive_sources, ArchiveSummary};
pub use pipeline::{convert_tree, reconcile_tree, Pipeline, ProgressEvent, ProgressSnapshot, ProgressStream, RunSummary};
