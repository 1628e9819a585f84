//! Mock oracles for exercising the pipeline without ffmpeg.
//!
//! ```rust,ignore
//! use converter::testing::{MockProbe, MockTranscoder, TranscodeBehavior};
//!
//! let probe = MockProbe::new();
//! probe.set_alpha("key.mov");
//! let transcoder = MockTranscoder::new(TranscodeBehavior::ZeroSize);
//! // ... run the pipeline, then
//! assert_eq!(transcoder.calls(), 3);
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;

use crate::error::{ProbeError, TranscodeError};
use crate::oracle::{Classification, MediaProbe, TranscodeOutput, Transcoder, ValidationReport};

/// Bytes the mock transcoder writes as "encoded" output
pub const ENCODED_BYTES: &[u8] = b"h264 output";

/// How long `TranscodeBehavior::Hang` stalls; ignores the limit it is given
const HANG_DURATION: Duration = Duration::from_secs(3600);

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn in_processing_folder(path: &Path) -> bool {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|n| n == "_PROCESSING")
        .unwrap_or(false)
}

#[derive(Debug, Default)]
struct ProbeState {
    alpha: HashSet<String>,
    other_codec: HashSet<String>,
    unreadable: HashSet<String>,
    invalid_input: HashMap<String, String>,
    invalid_output: HashMap<String, String>,
    classified: Vec<PathBuf>,
}

/// Classifies by file name. Everything is a valid, alpha-free ProRes file unless told otherwise.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alpha(&self, name: &str) {
        self.state.lock().unwrap().alpha.insert(name.to_string());
    }

    pub fn set_other_codec(&self, name: &str) {
        self.state.lock().unwrap().other_codec.insert(name.to_string());
    }

    /// Classification of `name` fails like ffprobe on a non-media file
    pub fn set_unreadable(&self, name: &str) {
        self.state.lock().unwrap().unreadable.insert(name.to_string());
    }

    /// The claimed source named `name` fails pre-encode validation
    pub fn mark_invalid(&self, name: &str, issue: &str) {
        self.state.lock().unwrap().invalid_input.insert(name.to_string(), issue.to_string());
    }

    /// The encoded output named `name` fails post-encode validation
    pub fn mark_output_invalid(&self, name: &str, issue: &str) {
        self.state.lock().unwrap().invalid_output.insert(name.to_string(), issue.to_string());
    }

    /// Every path handed to `classify`, in call order
    pub fn classified(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().classified.clone()
    }
}

#[async_trait]
impl MediaProbe for MockProbe {
    async fn classify(&self, path: &Path) -> Result<Classification, ProbeError> {
        let name = name_of(path);
        let mut state = self.state.lock().unwrap();
        state.classified.push(path.to_path_buf());

        if state.unreadable.contains(&name) {
            return Err(ProbeError::Failed {
                exit_code: Some(1),
                stderr: "Invalid data found when processing input".to_string(),
            });
        }

        Ok(Classification {
            is_target_codec: !state.other_codec.contains(&name),
            has_alpha: state.alpha.contains(&name),
        })
    }

    async fn validate(&self, path: &Path) -> Result<ValidationReport, ProbeError> {
        let name = name_of(path);
        let state = self.state.lock().unwrap();
        let issues = if in_processing_folder(path) {
            &state.invalid_input
        } else {
            &state.invalid_output
        };

        Ok(match issues.get(&name) {
            Some(issue) => ValidationReport::invalid(issue.clone()),
            None => ValidationReport::valid(),
        })
    }
}

/// What the mock encoder does on each call
#[derive(Debug, Clone)]
pub enum TranscodeBehavior {
    /// Write `ENCODED_BYTES` to the output
    Succeed,
    /// Create an empty output file
    ZeroSize,
    /// Exit cleanly without writing anything
    NoOutput,
    /// Exit with an error, leaving a partial output behind
    Fail { exit_code: Option<i32>, stderr: String },
    /// Fail `failures` times with `stderr`, then succeed
    FailTimesThenSucceed { failures: u32, stderr: String },
    /// Write a partial output, then stall far past any encode limit
    Hang,
}

#[derive(Debug)]
struct TranscoderState {
    behavior: TranscodeBehavior,
    delay: Duration,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    inputs: Mutex<Vec<PathBuf>>,
}

/// Scriptable encoder that records calls and peak concurrency
#[derive(Debug, Clone)]
pub struct MockTranscoder {
    state: Arc<TranscoderState>,
}

impl MockTranscoder {
    pub fn new(behavior: TranscodeBehavior) -> Self {
        Self::with_delay(behavior, Duration::ZERO)
    }

    /// Each call takes at least `delay`
    pub fn with_delay(behavior: TranscodeBehavior, delay: Duration) -> Self {
        Self {
            state: Arc::new(TranscoderState {
                behavior,
                delay,
                calls: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                inputs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Highest number of encodes observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Input paths of every call, in call order
    pub fn inputs(&self) -> Vec<PathBuf> {
        self.state.inputs.lock().unwrap().clone()
    }

    async fn run(&self, output: &Path, call: u32) -> Result<TranscodeOutput, TranscodeError> {
        if !self.state.delay.is_zero() {
            tokio::time::sleep(self.state.delay).await;
        }

        let write = |bytes: &[u8]| {
            std::fs::write(output, bytes).map_err(TranscodeError::Spawn)
        };

        match &self.state.behavior {
            TranscodeBehavior::Succeed => write(ENCODED_BYTES)?,
            TranscodeBehavior::ZeroSize => write(b"")?,
            TranscodeBehavior::NoOutput => {}
            TranscodeBehavior::Fail { exit_code, stderr } => {
                write(b"partial")?;
                return Err(TranscodeError::Failed { exit_code: *exit_code, stderr: stderr.clone() });
            }
            TranscodeBehavior::FailTimesThenSucceed { failures, stderr } => {
                if call <= *failures {
                    write(b"partial")?;
                    return Err(TranscodeError::Failed { exit_code: Some(1), stderr: stderr.clone() });
                }
                write(ENCODED_BYTES)?;
            }
            TranscodeBehavior::Hang => {
                write(b"partial")?;
                tokio::time::sleep(HANG_DURATION).await;
            }
        }

        Ok(TranscodeOutput::default())
    }
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        _timeout: Duration,
    ) -> Result<TranscodeOutput, TranscodeError> {
        let call = self.state.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.inputs.lock().unwrap().push(input.to_path_buf());

        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.run(output, call).await;

        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
