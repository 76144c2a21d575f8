//! bibmerge-ingest - corpus ingestion CLI
//!
//! Walks a corpus directory, merges every new file into the target database
//! and exits non-zero when any file failed.

use anyhow::{Context, Result};
use bibmerge_common::config::{IngestConfig, Overrides, TomlConfig};
use bibmerge_common::db::init_database;
use bibmerge_ingest::driver::{run_ingest, FileStatus, SourceVersion};
use bibmerge_ingest::venues::VenueTable;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bibmerge-ingest", version, about = "Merge bibliographic corpora into one SQLite store")]
struct Args {
    /// Directory holding the corpus files
    #[arg(long, env = "BIBMERGE_CORPUS_ROOT")]
    corpus_root: Option<PathBuf>,

    /// Target database file
    #[arg(long, env = "BIBMERGE_DATABASE")]
    database: Option<PathBuf>,

    /// Venue alias table (TOML)
    #[arg(long, env = "BIBMERGE_VENUES")]
    venues: Option<PathBuf>,

    /// Parallel shard workers; 1 ingests directly into the target
    #[arg(long, env = "BIBMERGE_JOBS")]
    jobs: Option<usize>,

    /// Bootstrap configuration file
    #[arg(long, env = "BIBMERGE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the unknown-venue report
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Directory for shard databases
    #[arg(long)]
    shard_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,

    /// Release date of an ingested corpus, e.g. `dblp=2024-03-01` (repeatable)
    #[arg(long = "source-version", value_name = "FAMILY=DATE")]
    source_versions: Vec<SourceVersion>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            database_path: self.database.clone(),
            corpus_root: self.corpus_root.clone(),
            venue_table: self.venues.clone(),
            report_dir: self.report_dir.clone(),
            shard_dir: self.shard_dir.clone(),
            jobs: self.jobs,
            log_level: self.log_level.clone(),
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = TomlConfig::load(args.config.as_deref())?;
    let config = IngestConfig::resolve(args.overrides(), file)?;
    init_tracing(&config.log_level);

    info!("Starting bibmerge-ingest");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Corpus root: {}", config.corpus_root.display());
    info!("Database: {}", config.database_path.display());

    let venue_path = config
        .venue_table
        .clone()
        .context("No venue table configured (--venues or BIBMERGE_VENUES)")?;
    let venues = VenueTable::load(&venue_path)?;

    let pool = init_database(&config.database_path)
        .await
        .context("Failed to open target database")?;

    let summary = run_ingest(&pool, &config, Arc::new(venues), &args.source_versions).await?;
    pool.close().await;

    let processed = summary
        .files
        .iter()
        .filter(|f| matches!(f.status, FileStatus::Processed { .. }))
        .count();
    let skipped = summary
        .files
        .iter()
        .filter(|f| f.status == FileStatus::Skipped)
        .count();
    info!(
        processed,
        skipped,
        created = summary.counts.created,
        updated = summary.counts.updated,
        rejected = summary.counts.rejected,
        "Ingestion finished"
    );
    if let Some(report) = &summary.unknown_venue_report {
        info!("Unknown venues written to {}", report.display());
    }

    if !summary.is_success() {
        for failure in summary.failures() {
            if let FileStatus::Failed(message) = &failure.status {
                error!(path = %failure.file.path.display(), "Failed: {}", message);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
