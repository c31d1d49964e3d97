//! Batch merge runner
//!
//! Loads the latest warehouse snapshot, merges one or more batch files in
//! order, and writes a new snapshot.
//!
//! Usage:
//!   merge-batch --snapshot-dir ./warehouse batch-0001.json batch-0002.json
//!
//! Environment:
//!   MERGE_CONFIG - Engine configuration file (default: built-in markets config)
//!   MERGE_SNAPSHOT_DIR - Snapshot directory
//!   RUST_LOG - Log filter (default: info)

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use merge_engine::config::EngineConfig;
use merge_engine::pipeline::BatchProcessor;
use persistence::snapshot::{Snapshot, SnapshotCleanupPolicy, SnapshotLoader, SnapshotWriter};
use types::batch::IngestBatch;

#[derive(Parser, Debug)]
#[command(name = "merge-batch")]
#[command(about = "Merge ingestion batches into the bi-temporal warehouse")]
struct Args {
    /// Engine configuration (JSON)
    #[arg(long, env = "MERGE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding warehouse snapshots
    #[arg(long, env = "MERGE_SNAPSHOT_DIR", default_value = "./warehouse")]
    snapshot_dir: PathBuf,

    /// Compress the written snapshot with zstd
    #[arg(long)]
    compress: bool,

    /// Number of snapshots to keep
    #[arg(long, default_value = "5")]
    keep: usize,

    /// Process every batch twice and fail unless the second run is a no-op
    #[arg(long)]
    verify: bool,

    /// Batch files (JSON), processed in the order given
    #[arg(required = true)]
    batches: Vec<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let processor = BatchProcessor::new(config)?;

    let loader = SnapshotLoader::new(&args.snapshot_dir);
    let mut state = loader
        .load_latest_or_empty()
        .with_context(|| format!("loading snapshot from {}", args.snapshot_dir.display()))?;
    info!(
        dir = %args.snapshot_dir.display(),
        batches = state.batches.len(),
        hash = %state.compute_hash(),
        "Warehouse loaded"
    );

    for path in &args.batches {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading batch {}", path.display()))?;
        let batch: IngestBatch = serde_json::from_str(&json)
            .with_context(|| format!("parsing batch {}", path.display()))?;

        if args.verify {
            let report = processor.verify_idempotent(&state, &batch)?;
            anyhow::ensure!(
                report.is_match(),
                "batch {} is not idempotent: {}",
                path.display(),
                report.detail
            );
        }

        let report = processor
            .process(&mut state, &batch)
            .with_context(|| format!("processing batch {}", path.display()))?;
        info!(
            file = %path.display(),
            batch_id = %report.batch_id,
            inserted = report.rows_inserted,
            closed = report.rows_closed,
            changed = report.changed,
            "Batch merged"
        );
    }

    let snapshot = Snapshot::of(state, Utc::now());
    let path = SnapshotWriter::new(&args.snapshot_dir, args.compress).write(&snapshot)?;
    let removed = SnapshotCleanupPolicy::new(args.keep).cleanup(&args.snapshot_dir)?;
    info!(
        path = %path.display(),
        sequence = snapshot.sequence,
        removed = removed.len(),
        "Run complete"
    );
    Ok(())
}
