use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::asset::{Asset, LifecycleState};
use crate::config::ConvertConfig;
use crate::error::{AttemptError, OutcomeKind};
use crate::lifecycle::{Claim, StateStore};
use crate::oracle::{MediaProbe, Transcoder};
use crate::retry::RetryPolicy;

/// One pass through validate → encode → validate
#[derive(Debug, Clone, Serialize)]
pub struct ConversionAttempt {
    pub attempt: u32,
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal result for one asset
#[derive(Debug, Clone, Serialize)]
pub struct AssetReport {
    pub path: PathBuf,
    pub outcome: OutcomeKind,
    pub final_state: LifecycleState,
    /// Where the source file ended up; None when it was never moved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    pub attempts: Vec<ConversionAttempt>,
    pub original_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<u64>,
    /// Human-readable result line
    pub message: String,
}

impl AssetReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Report for a worker that died before producing its own report
    pub fn unexpected(asset: &Asset, destination: Option<PathBuf>, final_state: LifecycleState, reason: &str) -> Self {
        Self {
            path: asset.path.clone(),
            outcome: OutcomeKind::Unexpected,
            final_state,
            destination,
            attempts: Vec::new(),
            original_bytes: asset.size_bytes,
            output_bytes: None,
            message: format!("Conversion failed for {}: {}", asset.display_name(), reason),
        }
    }
}

/// Runs the per-asset state machine: claim, validate, encode, validate, commit or quarantine.
///
/// Errors never escape `convert`; every asset ends with exactly one report.
pub struct ConversionWorker {
    store: StateStore,
    probe: Arc<dyn MediaProbe>,
    transcoder: Arc<dyn Transcoder>,
    retry: RetryPolicy,
    timeout: Duration,
    display_root: Option<PathBuf>,
}

impl ConversionWorker {
    pub fn new(
        cfg: &ConvertConfig,
        probe: Arc<dyn MediaProbe>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            store: StateStore::new(cfg.reserved.clone()),
            probe,
            transcoder,
            retry: RetryPolicy::from_config(cfg),
            timeout: Duration::from_secs(cfg.encode_timeout_secs),
            display_root: None,
        }
    }

    /// Override the per-attempt encode limit
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Show paths in result messages relative to `root`
    pub fn with_display_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.display_root = Some(root.into());
        self
    }

    /// `path` as it appears in result messages
    pub fn display_path(&self, path: &Path) -> String {
        self.display_root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path)
            .display()
            .to_string()
    }

    pub async fn convert(&self, asset: &Asset) -> AssetReport {
        let name = asset.display_name();
        info!("🎬 Converting {}", asset.path.display());

        let claim = match self.store.claim(&asset.path) {
            Ok(claim) => claim,
            Err(e) => {
                warn!("Could not claim {}: {}", asset.path.display(), e);
                let err = AttemptError::from(e);
                return AssetReport {
                    path: asset.path.clone(),
                    outcome: err.kind(),
                    // A rejected claim moves nothing
                    final_state: LifecycleState::Discovered,
                    destination: None,
                    attempts: vec![ConversionAttempt {
                        attempt: 1,
                        outcome: err.kind(),
                        error: Some(err.to_string()),
                    }],
                    original_bytes: asset.size_bytes,
                    output_bytes: None,
                    message: format!("Conversion failed for {}: {}", name, err),
                };
            }
        };

        let mut attempts = Vec::new();
        let mut attempt = 1;
        loop {
            match self.attempt(&claim).await {
                Ok(output_bytes) => {
                    attempts.push(ConversionAttempt {
                        attempt,
                        outcome: OutcomeKind::Success,
                        error: None,
                    });
                    return self.finish_success(asset, claim, attempts, output_bytes);
                }
                Err(err) => {
                    self.discard_output(claim.original());
                    attempts.push(ConversionAttempt {
                        attempt,
                        outcome: err.kind(),
                        error: Some(err.to_string()),
                    });

                    if self.retry.should_retry(attempt, &err) {
                        warn!(
                            "Attempt {}/{} for {} failed, retrying: {}",
                            attempt,
                            self.retry.max_attempts(),
                            name,
                            err
                        );
                        attempt += 1;
                        continue;
                    }
                    return self.finish_failure(asset, claim, attempts, err);
                }
            }
        }
    }

    /// One attempt on an already-claimed file. Returns the output size.
    async fn attempt(&self, claim: &Claim) -> Result<u64, AttemptError> {
        let input = self
            .probe
            .validate(claim.claimed())
            .await
            .map_err(|e| AttemptError::Unexpected(format!("validation probe failed: {}", e)))?;
        if !input.is_valid {
            return Err(AttemptError::InputInvalid(input.summary()));
        }

        // The transcoder gets the limit too, but the worker enforces it regardless
        let encode = self.transcoder.transcode(claim.claimed(), claim.original(), self.timeout);
        let encoded = match tokio::time::timeout(self.timeout, encode).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Encode of {} overran {:?}, abandoning it", claim.original().display(), self.timeout);
                return Err(AttemptError::TimedOut { secs: self.timeout.as_secs() });
            }
        };
        if !encoded.stderr.is_empty() {
            debug!("ffmpeg output for {}:\n{}", claim.original().display(), encoded.stderr);
        }

        let size = match fs::metadata(claim.original()) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(AttemptError::MissingOutput),
            Err(e) => return Err(e.into()),
        };
        if size == 0 {
            return Err(AttemptError::ZeroSizeOutput);
        }

        let output = self
            .probe
            .validate(claim.original())
            .await
            .map_err(|e| AttemptError::Unexpected(format!("validation probe failed: {}", e)))?;
        if !output.is_valid {
            return Err(AttemptError::OutputInvalid(output.summary()));
        }

        Ok(size)
    }

    /// Remove whatever a failed attempt left at the original path
    fn discard_output(&self, original: &Path) {
        match fs::remove_file(original) {
            Ok(()) => debug!("Removed partial output {}", original.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial output {}: {}", original.display(), e),
        }
    }

    fn finish_success(
        &self,
        asset: &Asset,
        claim: Claim,
        attempts: Vec<ConversionAttempt>,
        output_bytes: u64,
    ) -> AssetReport {
        let name = asset.display_name();
        match self.store.commit(claim) {
            Ok(archived) => {
                info!("✅ Converted {} (source archived at {})", asset.path.display(), archived.display());
                AssetReport {
                    path: asset.path.clone(),
                    outcome: OutcomeKind::Success,
                    final_state: LifecycleState::Committed,
                    destination: Some(archived),
                    attempts,
                    original_bytes: asset.size_bytes,
                    output_bytes: Some(output_bytes),
                    message: format!(
                        "Successfully converted: {} ({} -> {})",
                        self.display_path(&asset.path),
                        format_size(asset.size_bytes, DECIMAL),
                        format_size(output_bytes, DECIMAL)
                    ),
                }
            }
            Err(e) => {
                // The output is good, but the source is stuck in processing for reconcile to sort out
                error!("❌ {}", e);
                AssetReport {
                    path: asset.path.clone(),
                    outcome: OutcomeKind::Unexpected,
                    final_state: LifecycleState::Claimed,
                    destination: Some(e.claim.claimed().to_path_buf()),
                    attempts,
                    original_bytes: asset.size_bytes,
                    output_bytes: Some(output_bytes),
                    message: format!("Conversion failed for {}: encoded but could not archive source: {}", name, e.source),
                }
            }
        }
    }

    fn finish_failure(
        &self,
        asset: &Asset,
        claim: Claim,
        attempts: Vec<ConversionAttempt>,
        err: AttemptError,
    ) -> AssetReport {
        let name = asset.display_name();
        let tries = attempts.len();
        let mut message = match err {
            AttemptError::ZeroSizeOutput => {
                format!("Conversion failed (zero size output): {} [{} attempt(s)]", name, tries)
            }
            ref other => format!("Conversion failed for {}: {} [{} attempt(s)]", name, other, tries),
        };

        let (final_state, destination) = match self.store.quarantine(claim) {
            Ok(dest) => {
                error!("❌ Quarantined {} at {}: {}", asset.path.display(), dest.display(), err);
                (LifecycleState::Quarantined, dest)
            }
            Err(e) => {
                error!("❌ {}", e);
                message.push_str(&format!("; source left in {}", e.claim.claimed().display()));
                (LifecycleState::Claimed, e.claim.claimed().to_path_buf())
            }
        };

        AssetReport {
            path: asset.path.clone(),
            outcome: err.kind(),
            final_state,
            destination: Some(destination),
            attempts,
            original_bytes: asset.size_bytes,
            output_bytes: None,
            message,
        }
    }
}
