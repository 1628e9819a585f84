use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::asset::{Asset, LifecycleState};
use crate::config::ConvertConfig;
use crate::error::OutcomeKind;
use crate::lifecycle::StateStore;
use crate::oracle::{MediaProbe, Transcoder};
use crate::scan;
use crate::worker::{AssetReport, ConversionWorker};

/// Events buffered between the coordinator and a slow consumer
const EVENT_BUFFER: usize = 16;

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

fn serialize_opt_secs<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&d.as_secs_f64()),
        None => s.serialize_none(),
    }
}

/// `1h 2m 3s`
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    format!("{}h {}m {}s", total / 3600, (total / 60) % 60, total % 60)
}

/// Running totals emitted after each finished asset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remaining: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// `elapsed / processed * remaining`
    #[serde(serialize_with = "serialize_opt_secs")]
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn new(processed: usize, succeeded: usize, failed: usize, remaining: usize, elapsed: Duration) -> Self {
        let eta = if processed == 0 {
            None
        } else {
            Some(elapsed.mul_f64(remaining as f64 / processed as f64))
        };
        Self { processed, succeeded, failed, remaining, elapsed, eta }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Progress: {}/{} processed ({} succeeded, {} failed, {} remaining) | elapsed {}",
            self.processed,
            self.processed + self.remaining,
            self.succeeded,
            self.failed,
            self.remaining,
            format_duration(self.elapsed)
        )?;
        if let Some(eta) = self.eta {
            write!(f, " | ETA {}", format_duration(eta))?;
        }
        Ok(())
    }
}

/// One non-success outcome, in completion order
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub path: PathBuf,
    pub kind: OutcomeKind,
    pub message: String,
}

/// Final tally of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub alpha_skipped: usize,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub errors: Vec<ErrorEntry>,
}

impl RunSummary {
    fn start(total: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            total,
            succeeded: 0,
            failed: 0,
            alpha_skipped: 0,
            elapsed: Duration::ZERO,
            errors: Vec::new(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Finished: {} total, {} succeeded, {} failed, {} moved to alpha in {}",
            self.total,
            self.succeeded,
            self.failed,
            self.alpha_skipped,
            format_duration(self.elapsed)
        )
    }
}

/// One entry of the progress stream.
///
/// `Display` gives the human-readable status line; `Serialize` gives the
/// JSON-lines schema (`{"event": "...", ...}`).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// An alpha-bearing asset was moved aside without being converted
    Alpha {
        path: PathBuf,
        destination: Option<PathBuf>,
        message: String,
    },
    Progress(ProgressSnapshot),
    Asset(AssetReport),
    /// Every non-success result line, once the pool has drained
    Errors { errors: Vec<String> },
    Finished(RunSummary),
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::Alpha { message, .. } => f.write_str(message),
            ProgressEvent::Progress(snapshot) => fmt::Display::fmt(snapshot, f),
            ProgressEvent::Asset(report) => f.write_str(&report.message),
            ProgressEvent::Errors { errors } => {
                write!(f, "{} file(s) failed:", errors.len())?;
                for e in errors {
                    write!(f, "\n  - {}", e)?;
                }
                Ok(())
            }
            ProgressEvent::Finished(summary) => fmt::Display::fmt(summary, f),
        }
    }
}

/// Single-pass stream of events from one run.
///
/// Dropping it stops new assets from being dispatched; encodes already in
/// flight run to completion (or to their timeout).
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Next event, or None once the run has finished
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// Splits assets into alpha and convertible, and drives a bounded pool of workers
pub struct Pipeline {
    workers: usize,
    store: StateStore,
    worker: Arc<ConversionWorker>,
}

impl Pipeline {
    pub fn new(cfg: &ConvertConfig, probe: Arc<dyn MediaProbe>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self::with_worker(cfg, ConversionWorker::new(cfg, probe, transcoder))
    }

    pub fn with_worker(cfg: &ConvertConfig, worker: ConversionWorker) -> Self {
        Self {
            workers: cfg.workers.max(1),
            store: StateStore::new(cfg.reserved.clone()),
            worker: Arc::new(worker),
        }
    }

    /// Start the run. Events arrive as work completes.
    pub fn run(&self, assets: Vec<Asset>) -> ProgressStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let coordinator = Coordinator {
            workers: self.workers,
            store: self.store.clone(),
            worker: Arc::clone(&self.worker),
            tx,
        };
        tokio::spawn(coordinator.run(assets));
        ProgressStream { rx }
    }
}

struct Coordinator {
    workers: usize,
    store: StateStore,
    worker: Arc<ConversionWorker>,
    tx: mpsc::Sender<ProgressEvent>,
}

impl Coordinator {
    /// False once the consumer has gone away
    async fn emit(&self, event: ProgressEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    async fn run(self, assets: Vec<Asset>) {
        let started = Instant::now();
        let mut summary = RunSummary::start(assets.len());
        let (alpha, convertible): (Vec<_>, Vec<_>) = assets.into_iter().partition(|a| a.has_alpha);
        let mut listening = true;

        info!(
            "Run {}: {} asset(s), {} with alpha, {} worker(s)",
            summary.run_id,
            summary.total,
            alpha.len(),
            self.workers
        );

        for asset in alpha {
            if !listening {
                break;
            }
            let folder = &self.store.folders().alpha;
            let event = match self.store.quarantine_alpha(&asset.path) {
                Ok(dest) => {
                    summary.alpha_skipped += 1;
                    info!("Moved alpha asset {} to {}", asset.path.display(), dest.display());
                    ProgressEvent::Alpha {
                        path: asset.path.clone(),
                        destination: Some(dest),
                        message: format!("Moved to {}: {}", folder, self.worker.display_path(&asset.path)),
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    let message = format!("Error moving {} to {}: {}", asset.display_name(), folder, e);
                    warn!("{}", message);
                    summary.errors.push(ErrorEntry {
                        path: asset.path.clone(),
                        kind: OutcomeKind::Unexpected,
                        message: message.clone(),
                    });
                    ProgressEvent::Alpha { path: asset.path.clone(), destination: None, message }
                }
            };
            listening = self.emit(event).await;
        }

        let dispatch_total = convertible.len();
        let mut queue = convertible.into_iter();
        let mut pool = JoinSet::new();
        let mut processed = 0;
        let mut succeeded = 0;
        let mut failed = 0;

        if listening {
            for asset in queue.by_ref().take(self.workers) {
                self.dispatch(&mut pool, asset);
            }
        }

        while let Some(joined) = pool.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    // dispatch() catches worker panics, so this is the coordinator's own task being cancelled
                    error!("Worker task failed: {}", e);
                    continue;
                }
            };

            processed += 1;
            if report.is_success() {
                succeeded += 1;
                summary.succeeded += 1;
            } else {
                failed += 1;
                summary.failed += 1;
                summary.errors.push(ErrorEntry {
                    path: report.path.clone(),
                    kind: report.outcome,
                    message: report.message.clone(),
                });
            }

            if listening {
                let snapshot = ProgressSnapshot::new(
                    processed,
                    succeeded,
                    failed,
                    dispatch_total - processed,
                    started.elapsed(),
                );
                listening = self.emit(ProgressEvent::Progress(snapshot)).await
                    && self.emit(ProgressEvent::Asset(report)).await;
                if !listening {
                    let skipped = queue.by_ref().count();
                    warn!("Progress consumer went away; {} asset(s) not dispatched", skipped);
                }
            }

            if listening {
                if let Some(asset) = queue.next() {
                    self.dispatch(&mut pool, asset);
                }
            }
        }

        summary.elapsed = started.elapsed();
        info!("{}", summary);

        if !summary.errors.is_empty() {
            let errors = summary.errors.iter().map(|e| e.message.clone()).collect();
            if !self.emit(ProgressEvent::Errors { errors }).await {
                return;
            }
        }
        self.emit(ProgressEvent::Finished(summary)).await;
    }

    fn dispatch(&self, pool: &mut JoinSet<AssetReport>, asset: Asset) {
        let worker = Arc::clone(&self.worker);
        let store = self.store.clone();
        pool.spawn(async move {
            let inner = {
                let asset = asset.clone();
                tokio::spawn(async move { worker.convert(&asset).await })
            };
            match inner.await {
                Ok(report) => report,
                Err(e) => {
                    error!("Worker for {} panicked: {}", asset.path.display(), e);
                    // Whatever the worker got to, a file still in processing is left for reconcile
                    let claimed = store.claimed_path(&asset.path).filter(|p| p.is_file());
                    let state = if claimed.is_some() { LifecycleState::Claimed } else { LifecycleState::Discovered };
                    AssetReport::unexpected(&asset, claimed, state, &format!("worker panicked: {}", e))
                }
            }
        });
    }
}

/// Reconcile (if enabled), discover and start converting everything under `root`
pub async fn convert_tree(
    root: &Path,
    cfg: &ConvertConfig,
    probe: Arc<dyn MediaProbe>,
    transcoder: Arc<dyn Transcoder>,
) -> Result<(Vec<Asset>, ProgressStream)> {
    if cfg.reconcile_on_start {
        let restored = reconcile_tree(root, cfg).await?;
        if !restored.is_empty() {
            info!("🔄 Restored {} stranded file(s) before discovery", restored.len());
        }
    }

    let assets = scan::discover(root, cfg, Arc::clone(&probe)).await?;
    let worker = ConversionWorker::new(cfg, probe, transcoder).with_display_root(root);
    let stream = Pipeline::with_worker(cfg, worker).run(assets.clone());
    Ok((assets, stream))
}

/// Run the crash-recovery pass off the async runtime
pub async fn reconcile_tree(root: &Path, cfg: &ConvertConfig) -> Result<Vec<PathBuf>> {
    let store = StateStore::new(cfg.reserved.clone());
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || store.reconcile(&root))
        .await
        .context("Reconcile task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_eta_from_rate() {
        let s = ProgressSnapshot::new(2, 2, 0, 6, Duration::from_secs(10));
        assert_eq!(s.eta, Some(Duration::from_secs(30)));
        assert!(s.to_string().contains("ETA 0h 0m 30s"), "{}", s);

        let none = ProgressSnapshot::new(0, 0, 0, 4, Duration::from_secs(1));
        assert_eq!(none.eta, None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_event_json_schema() {
        let event = ProgressEvent::Progress(ProgressSnapshot::new(1, 1, 0, 1, Duration::from_millis(1500)));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["processed"], 1);
        assert_eq!(json["elapsed"], 1.5);
        assert_eq!(json["eta"], 1.5);

        let errors = ProgressEvent::Errors { errors: vec!["x".into()] };
        let json = serde_json::to_value(&errors).unwrap();
        assert_eq!(json["event"], "errors");
        assert_eq!(json["errors"][0], "x");
    }

    proptest! {
        #[test]
        fn test_eta_is_proportional(processed in 1usize..100, remaining in 0usize..100, secs in 1u64..10_000) {
            let s = ProgressSnapshot::new(processed, processed, 0, remaining, Duration::from_secs(secs));
            let expected = secs as f64 / processed as f64 * remaining as f64;
            let eta = s.eta.unwrap().as_secs_f64();
            prop_assert!((eta - expected).abs() < 1e-6 * expected.max(1.0));
        }
    }
}
