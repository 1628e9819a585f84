use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use converter::{
    archive_sources, convert_tree, preflight, reconcile_tree, ConvertConfig, FfmpegTool, FfprobeTool,
    MediaProbe, ProgressEvent,
};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bulk ProRes to H.264 converter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert every ProRes file under a directory tree in place, archiving originals
    Convert {
        /// Directory tree to scan
        root: PathBuf,

        /// Number of videos to process in parallel
        #[arg(short, long)]
        workers: Option<usize>,

        /// Extra attempts for transient failures
        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-encode timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Skip restoring files left in processing folders by an earlier run
        #[arg(long)]
        no_reconcile: bool,

        /// Emit progress events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Check whether a single file is ProRes and whether it carries an alpha channel
    Verify {
        /// Video file to inspect
        file: PathBuf,
    },
    /// Move ProRes files without alpha from a directory into an archive directory
    Move {
        /// Directory holding the original files (not searched recursively)
        source: PathBuf,

        /// Directory to archive them into, created if missing
        archive: PathBuf,
    },
    /// Restore files stranded in processing folders after a crash
    Reconcile {
        /// Directory tree to repair
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = ConvertConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Commands::Convert { root, workers, max_retries, timeout, no_reconcile, json } => {
            if let Some(workers) = workers {
                cfg.workers = workers;
            }
            if let Some(max_retries) = max_retries {
                cfg.max_retries = max_retries;
            }
            if let Some(timeout) = timeout {
                cfg.encode_timeout_secs = timeout;
            }
            if no_reconcile {
                cfg.reconcile_on_start = false;
            }
            cfg.validate().context("Invalid configuration")?;
            run_convert(&cfg, &root, json).await
        }
        Commands::Verify { file } => run_verify(&cfg, &file).await,
        Commands::Move { source, archive } => run_move(&cfg, &source, &archive).await,
        Commands::Reconcile { root } => {
            let restored = reconcile_tree(&root, &cfg).await
                .with_context(|| format!("Failed to reconcile {}", root.display()))?;
            if restored.is_empty() {
                println!("Nothing to reconcile under {}", root.display());
            }
            for path in restored {
                println!("Restored: {}", display_relative(&path, &root));
            }
            Ok(())
        }
    }
}

async fn run_convert(cfg: &ConvertConfig, root: &Path, json: bool) -> Result<()> {
    let tools = preflight(cfg)?;

    info!("Configuration loaded:");
    info!("  Workers: {}", cfg.workers);
    info!("  Max retries: {}", cfg.max_retries);
    info!("  Encode timeout: {}s", cfg.encode_timeout_secs);
    info!("  Validation retry: {:?}", cfg.validation_retry);

    let probe = Arc::new(FfprobeTool::new(&tools.ffprobe, &cfg.target_codec));
    let transcoder = Arc::new(FfmpegTool::new(&tools.ffmpeg, cfg.encode.clone()));

    if !json {
        println!("Starting conversion in {}...", root.display());
    }

    let (assets, mut stream) = convert_tree(root, cfg, probe, transcoder)
        .await
        .with_context(|| format!("Failed to start conversion in {}", root.display()))?;

    if assets.is_empty() && !json {
        println!("No new ProRes .{} files found to convert.", cfg.extensions.join("/."));
    } else if assets.iter().all(|a| a.has_alpha) && !json {
        println!("No new suitable ProRes files (without alpha) found to convert.");
    }

    let mut failed = 0;
    while let Some(event) = stream.next().await {
        if let ProgressEvent::Finished(summary) = &event {
            failed = summary.failed;
        }
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            println!("{}", event);
        }
    }

    if failed > 0 {
        warn!("{} file(s) failed; see the {} folders", failed, cfg.reserved.failed);
    } else if !json {
        println!("Conversion process complete!");
    }
    Ok(())
}

async fn run_verify(cfg: &ConvertConfig, file: &Path) -> Result<()> {
    let tools = preflight(cfg)?;
    let probe = FfprobeTool::new(&tools.ffprobe, &cfg.target_codec);

    println!("Verifying file: {}", file.display());
    let classification = match probe.classify(file).await {
        Ok(c) => c,
        Err(e) => {
            println!("✗ Could not probe the file: {}", e);
            return Ok(());
        }
    };

    if !classification.is_target_codec {
        println!("✗ The file is not a {} video.", cfg.target_codec);
        return Ok(());
    }

    println!("✓ The file is a {} video.", cfg.target_codec);
    if classification.has_alpha {
        println!("  - It contains an alpha channel.");
    } else {
        println!("  - It does not contain an alpha channel.");
    }
    Ok(())
}

async fn run_move(cfg: &ConvertConfig, source: &Path, archive: &Path) -> Result<()> {
    let tools = preflight(cfg)?;
    let probe = FfprobeTool::new(&tools.ffprobe, &cfg.target_codec);

    println!("Archiving {} files from {} to {}...", cfg.target_codec, source.display(), archive.display());
    let summary = archive_sources(source, archive, cfg, &probe)
        .await
        .with_context(|| format!("Failed to archive {}", source.display()))?;

    if summary.is_empty() {
        println!("No .{} files found to process.", cfg.extensions.join("/."));
        return Ok(());
    }

    for path in &summary.alpha_skipped {
        println!("Skipped (has alpha channel): {}", display_relative(path, source));
    }
    for path in &summary.moved {
        println!("Moved: {}", display_relative(path, archive));
    }
    for error in &summary.errors {
        println!("{}", error);
    }

    println!("\nProcess complete. Moved {} file(s).", summary.moved.len());
    if !summary.alpha_skipped.is_empty() {
        println!("Skipped {} file(s) with alpha channels.", summary.alpha_skipped.len());
    }
    if summary.non_target > 0 {
        println!("Skipped {} non-{} file(s).", summary.non_target, cfg.target_codec);
    }
    Ok(())
}

fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
