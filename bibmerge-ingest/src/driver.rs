//! Ingestion driver
//!
//! Discovers corpus files, gates them through the File-Dedup Tracker and
//! feeds every record through the Merge Engine, one transaction per record.
//! After ingestion it runs the citation pass over Semantic Scholar files, the
//! derived batch passes, writes the unknown-venue report and bumps the dataset
//! version once if anything changed.
//!
//! Adapter parsing is blocking work; it runs on the blocking pool and hands
//! records to the async merge loop through a bounded channel.

use crate::adapters::{self, IncomingRecord, SourceKind};
use crate::authors::link_authors;
use crate::citations::{link_citations, CitationReport};
use crate::derived::{run_derived_passes, DerivedReport};
use crate::error::AdapterResult;
use crate::file_tracker::{FileCheck, FileTracker};
use crate::merge::{MergeCounts, MergeEngine, MergeReport, MergeRun};
use crate::shards;
use crate::venues::{UnknownVenueSink, VenueHistogram, VenueResolver};
use bibmerge_common::config::IngestConfig;
use bibmerge_common::db::{set_source_version, SourceFamily};
use bibmerge_common::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Records buffered between a parser and the merge loop
const RECORD_BUFFER: usize = 256;

/// A corpus file the driver knows how to read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusFile {
    pub path: PathBuf,
    pub kind: SourceKind,
}

/// A corpus file whose content hash has not been processed yet
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub file: CorpusFile,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Processed { records: u64 },
    /// Identical bytes were processed by an earlier run
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FileSummary {
    pub file: CorpusFile,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub files: Vec<FileSummary>,
    pub counts: MergeCounts,
    pub citations: CitationReport,
    /// `None` when the run changed nothing and the passes were skipped
    pub derived: Option<DerivedReport>,
    pub unknown_venue_report: Option<PathBuf>,
}

impl RunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &FileSummary> {
        self.files
            .iter()
            .filter(|f| matches!(f.status, FileStatus::Failed(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Release date of a source corpus, given as `family=YYYY-MM-DD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceVersion {
    pub family: SourceFamily,
    pub released: DateTime<Utc>,
}

impl FromStr for SourceVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (family, date) = s
            .split_once('=')
            .ok_or_else(|| Error::InvalidInput(format!("Expected family=YYYY-MM-DD, got: {}", s)))?;
        let family = family.trim().parse::<SourceFamily>()?;
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
            .map_err(|e| Error::InvalidInput(format!("Invalid release date '{}': {}", date, e)))?;
        let released = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| Error::InvalidInput(format!("Invalid release date: {}", date)))?
            .and_utc();

        Ok(Self { family, released })
    }
}

// ===== Discovery =====

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Corpus files under `root`, DBLP first, then Aminer/MAG, then Semantic Scholar
pub fn discover_corpus(root: &Path) -> Result<Vec<CorpusFile>> {
    if !root.is_dir() {
        return Err(Error::InvalidInput(format!(
            "Corpus root is not a directory: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error accessing corpus entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match SourceKind::detect(entry.path()) {
            Some(kind) => files.push(CorpusFile {
                path: entry.path().to_path_buf(),
                kind,
            }),
            None => debug!(path = %entry.path().display(), "Ignoring unrecognized file"),
        }
    }

    files.sort_by(|a, b| {
        a.kind
            .phase()
            .cmp(&b.kind.phase())
            .then_with(|| a.path.cmp(&b.path))
    });

    info!(root = %root.display(), files = files.len(), "Discovered corpus files");
    Ok(files)
}

// ===== Per-record and per-file work =====

/// Parse `file` on the blocking pool, yielding records through a channel
///
/// A file-level failure arrives as the last item. Dropping the receiver stops
/// the parser at its next record.
fn spawn_reader(
    file: &CorpusFile,
) -> (mpsc::Receiver<AdapterResult<IncomingRecord>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(RECORD_BUFFER);
    let kind = file.kind;
    let path = file.path.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let records = match adapters::open_records(kind, &path) {
            Ok(records) => records,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        for item in records {
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });

    (rx, handle)
}

async fn join_reader(handle: JoinHandle<()>, file: &CorpusFile) -> Result<()> {
    handle.await.map_err(|e| {
        Error::Internal(format!("Reader for {} panicked: {}", file.path.display(), e))
    })
}

/// Merge one record with its authors and citations as a single transaction
pub async fn ingest_record(
    engine: &MergeEngine,
    pool: &SqlitePool,
    run: &mut MergeRun,
    record: &IncomingRecord,
) -> Result<MergeReport> {
    let mut tx = pool.begin().await?;

    let report = engine.merge_publication(&mut *tx, run, record).await?;

    if let Some(publication_id) = report.publication_id {
        if !record.authors.is_empty() {
            let links = link_authors(&mut *tx, publication_id, &record.authors).await?;
            if links.links_created > 0 {
                run.mark_modified();
            }
        }
    }

    if let Some(external_id) = record.external_id.as_deref() {
        if report.publication_id.is_some() && record.has_citations() {
            let edges = link_citations(
                &mut *tx,
                external_id,
                &record.in_citations,
                &record.out_citations,
            )
            .await?;
            if edges.edges_created > 0 {
                run.mark_modified();
            }
        }
    }

    tx.commit().await?;
    Ok(report)
}

/// Stream every record of `file` through [`ingest_record`]
///
/// Adapter failures become [`FileStatus::Failed`]; records committed before
/// the failure stay. Store errors are returned and abort the run.
pub async fn ingest_file(
    engine: &MergeEngine,
    pool: &SqlitePool,
    run: &mut MergeRun,
    file: &CorpusFile,
) -> Result<FileStatus> {
    info!(path = %file.path.display(), source = %file.kind, "Ingesting file");

    let (mut rx, handle) = spawn_reader(file);
    let mut records = 0u64;
    let mut failure = None;

    while let Some(item) = rx.recv().await {
        match item {
            Ok(record) => {
                ingest_record(engine, pool, run, &record).await?;
                records += 1;
            }
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }
    drop(rx);
    join_reader(handle, file).await?;

    match failure {
        Some(message) => {
            error!(path = %file.path.display(), records, error = %message, "File processing failed");
            Ok(FileStatus::Failed(message))
        }
        None => {
            info!(path = %file.path.display(), records, "File processing completed");
            Ok(FileStatus::Processed { records })
        }
    }
}

/// Re-stream Semantic Scholar files and link citations between known papers
///
/// Edges whose endpoint appears later in the corpus than the citing record
/// are only resolvable once every file has been merged.
pub async fn run_citation_pass(
    pool: &SqlitePool,
    run: &mut MergeRun,
    files: &[CorpusFile],
) -> Result<CitationReport> {
    let mut total = CitationReport::default();

    for file in files
        .iter()
        .filter(|f| f.kind == SourceKind::SemanticScholar)
    {
        let (mut rx, handle) = spawn_reader(file);
        while let Some(item) = rx.recv().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Citation pass stopped early");
                    break;
                }
            };
            let Some(external_id) = record.external_id.as_deref() else {
                continue;
            };
            if !record.has_citations() {
                continue;
            }

            let mut tx = pool.begin().await?;
            let report = link_citations(
                &mut *tx,
                external_id,
                &record.in_citations,
                &record.out_citations,
            )
            .await?;
            tx.commit().await?;

            total.edges_created += report.edges_created;
            total.unresolved += report.unresolved;
        }
        drop(rx);
        join_reader(handle, file).await?;
    }

    if total.edges_created > 0 {
        run.mark_modified();
    }
    info!(
        edges_created = total.edges_created,
        unresolved = total.unresolved,
        "Citation pass finished"
    );
    Ok(total)
}

// ===== Whole run =====

/// Ingest the corpus under `config.corpus_root` into `pool`
pub async fn run_ingest(
    pool: &SqlitePool,
    config: &IngestConfig,
    resolver: Arc<dyn VenueResolver>,
    source_versions: &[SourceVersion],
) -> Result<RunSummary> {
    let files = discover_corpus(&config.corpus_root)?;
    if !files.iter().any(|f| f.kind == SourceKind::Dblp) {
        warn!(root = %config.corpus_root.display(), "No DBLP file found; continuing without it");
    }

    let histogram = Arc::new(VenueHistogram::new());
    let sink: Arc<dyn UnknownVenueSink> = histogram.clone();
    let engine = MergeEngine::new(resolver.clone(), sink.clone());
    let tracker = FileTracker::new(pool.clone());
    let mut run = MergeRun::new();
    let mut summary = RunSummary::default();

    let mut pending = Vec::new();
    for file in files {
        match tracker.check(&file.path).await? {
            FileCheck::AlreadyProcessed { hash } => {
                info!(path = %file.path.display(), hash = %hash, "Skipping already processed file");
                summary.files.push(FileSummary {
                    file,
                    status: FileStatus::Skipped,
                });
            }
            FileCheck::Pending { hash } => pending.push(PendingFile { file, hash }),
        }
    }

    if config.jobs > 1 && pending.len() > 1 {
        let sharded = shards::ingest_sharded(
            pool,
            &engine,
            &mut run,
            pending,
            config,
            resolver,
            sink,
        )
        .await?;
        summary.files.extend(sharded);
    } else {
        for PendingFile { file, hash } in pending {
            let status = ingest_file(&engine, pool, &mut run, &file).await?;
            if matches!(status, FileStatus::Processed { .. }) {
                let path = file.path.display().to_string();
                tracker.mark_hash_processed(&hash, Some(&path)).await?;
            }
            summary.files.push(FileSummary { file, status });
        }
    }

    let processed: Vec<CorpusFile> = summary
        .files
        .iter()
        .filter(|f| matches!(f.status, FileStatus::Processed { .. }))
        .map(|f| f.file.clone())
        .collect();
    summary.citations = run_citation_pass(pool, &mut run, &processed).await?;

    if run.data_modified() {
        summary.derived = Some(run_derived_passes(pool).await?);
    } else {
        info!("No data changes; skipping derived passes");
    }

    if !histogram.sorted().is_empty() {
        summary.unknown_venue_report = Some(histogram.write_report(&config.report_dir)?);
    }

    for version in source_versions {
        let failed = summary
            .failures()
            .any(|f| f.file.kind.family() == version.family);
        if failed {
            warn!(source = %version.family, "Not recording source version; a file failed");
            continue;
        }
        set_source_version(pool, version.family, version.released).await?;
    }

    summary.counts = run.finish(pool).await?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::VenueTable;
    use bibmerge_common::db::init_memory_database;

    fn engine() -> MergeEngine {
        let table = VenueTable::from_toml_str("[venues]\nICPE = [\"Performance Engineering\"]\n").unwrap();
        MergeEngine::new(Arc::new(table), Arc::new(VenueHistogram::new()))
    }

    #[test]
    fn test_source_version_parse() {
        let version: SourceVersion = "dblp=2024-03-01".parse().unwrap();
        assert_eq!(version.family, SourceFamily::Dblp);
        assert_eq!(version.released.to_rfc3339(), "2024-03-01T00:00:00+00:00");

        assert!("dblp".parse::<SourceVersion>().is_err());
        assert!("crossref=2024-03-01".parse::<SourceVersion>().is_err());
        assert!("mag=2024-13-01".parse::<SourceVersion>().is_err());
    }

    #[test]
    fn test_discover_orders_by_phase() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["s2-corpus-000.gz", "aminer_papers_0.txt", "dblp.xml", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join(".cache")).unwrap();
        std::fs::write(dir.path().join(".cache").join("dblp.xml"), b"").unwrap();

        let files = discover_corpus(dir.path()).unwrap();
        let kinds: Vec<SourceKind> = files.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![SourceKind::Dblp, SourceKind::Aminer, SourceKind::SemanticScholar]
        );
    }

    #[test]
    fn test_discover_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_corpus(&dir.path().join("absent")).is_err());
    }

    #[tokio::test]
    async fn test_ingest_record_links_authors() {
        let pool = init_memory_database().await.unwrap();
        let engine = engine();
        let mut run = MergeRun::new();

        let mut record = IncomingRecord::new(SourceKind::Dblp, "conf/icpe/1", "Tracing at scale", "ICPE");
        record.year = Some(2021);
        record.authors = vec![
            adapters::AuthorRef { name: "Ada".into(), orcid: None, position: Some(1) },
            adapters::AuthorRef { name: "Grace".into(), orcid: None, position: Some(2) },
        ];

        let report = ingest_record(&engine, &pool, &mut run, &record).await.unwrap();
        let id = report.publication_id.unwrap();

        let positions: Vec<i64> = sqlx::query_scalar(
            "SELECT author_position FROM author_paper_pairs WHERE paper_id = ? ORDER BY author_position",
        )
        .bind(id)
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(positions, vec![1, 2]);
        assert!(run.data_modified());
    }

    #[tokio::test]
    async fn test_ingest_file_reports_adapter_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dblp.xml");
        std::fs::write(
            &path,
            "<dblp><inproceedings key=\"a\"><title>Kept</title><year>2020</year>\
             <booktitle>ICPE</booktitle></inproceedings><broken></dblp>",
        )
        .unwrap();

        let pool = init_memory_database().await.unwrap();
        let engine = engine();
        let mut run = MergeRun::new();
        let file = CorpusFile { path, kind: SourceKind::Dblp };

        let status = ingest_file(&engine, &pool, &mut run, &file).await.unwrap();
        assert!(matches!(status, FileStatus::Failed(_)));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM publications")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
