//! Shard ingestion and reconciliation
//!
//! With more than one worker, every pending file is ingested by its own tokio
//! task into a private shard database, so no two writers ever share a store.
//! The shards are then reconciled one at a time, in corpus order. Shard rows
//! were already sanitized and resolved to canonical venues, so they enter the
//! target through `MergeEngine::merge_stored`. Authors and citation edges are
//! then re-linked onto the resolved target ids.

use crate::adapters::{AuthorRef, SourceKind};
use crate::authors::{link_authors, UNKNOWN_POSITION};
use crate::citations::insert_edge;
use crate::driver::{ingest_file, FileStatus, FileSummary, PendingFile};
use crate::file_tracker::FileTracker;
use crate::merge::{MergeEngine, MergeRun};
use crate::venues::{UnknownVenueSink, VenueResolver};
use bibmerge_common::config::IngestConfig;
use bibmerge_common::db::{init_database, Publication, PUBLICATION_COLUMNS};
use bibmerge_common::{Error, Result};
use chrono::Local;
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one worker left behind
#[derive(Debug)]
struct ShardOutput {
    index: usize,
    pending: PendingFile,
    shard_path: PathBuf,
    status: FileStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub publications: u64,
    /// Rows the target could not pin to one publication
    pub unresolved: u64,
    pub links_created: u64,
    pub edges_created: u64,
    pub parsed_files: u64,
}

/// Ingest `pending` in parallel shards and reconcile them into `pool`
pub async fn ingest_sharded(
    pool: &SqlitePool,
    engine: &MergeEngine,
    run: &mut MergeRun,
    pending: Vec<PendingFile>,
    config: &IngestConfig,
    resolver: Arc<dyn VenueResolver>,
    sink: Arc<dyn UnknownVenueSink>,
) -> Result<Vec<FileSummary>> {
    let run_dir = config
        .shard_dir
        .join(format!("run-{}", Local::now().format("%Y%m%d_%H%M%S")));
    tokio::fs::create_dir_all(&run_dir).await?;

    info!(
        files = pending.len(),
        jobs = config.jobs,
        dir = %run_dir.display(),
        "Ingesting into shards"
    );

    let results: Vec<Result<ShardOutput>> = stream::iter(pending.into_iter().enumerate())
        .map(|(index, pending)| {
            let shard_path = run_dir.join(format!("shard-{:04}.db", index));
            let resolver = resolver.clone();
            let sink = sink.clone();
            tokio::spawn(ingest_shard(index, pending, shard_path, resolver, sink))
        })
        .buffer_unordered(config.jobs)
        .map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("Shard worker panicked: {}", e))),
        })
        .collect()
        .await;

    let mut outputs = results.into_iter().collect::<Result<Vec<_>>>()?;
    outputs.sort_by_key(|o| o.index);

    let mut summaries = Vec::with_capacity(outputs.len());
    for output in outputs {
        let report = reconcile_shard(pool, engine, run, &output.shard_path, output.pending.file.kind).await?;
        info!(
            path = %output.pending.file.path.display(),
            publications = report.publications,
            unresolved = report.unresolved,
            links = report.links_created,
            edges = report.edges_created,
            "Reconciled shard"
        );
        summaries.push(FileSummary {
            file: output.pending.file,
            status: output.status,
        });
    }

    if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
        warn!(dir = %run_dir.display(), error = %e, "Failed to remove shard directory");
    }

    Ok(summaries)
}

async fn ingest_shard(
    index: usize,
    pending: PendingFile,
    shard_path: PathBuf,
    resolver: Arc<dyn VenueResolver>,
    sink: Arc<dyn UnknownVenueSink>,
) -> Result<ShardOutput> {
    if tokio::fs::try_exists(&shard_path).await? {
        tokio::fs::remove_file(&shard_path).await?;
    }

    let shard = init_database(&shard_path).await?;
    let engine = MergeEngine::new(resolver, sink);
    let mut run = MergeRun::new();

    let status = ingest_file(&engine, &shard, &mut run, &pending.file).await?;
    if matches!(status, FileStatus::Processed { .. }) {
        let path = pending.file.path.display().to_string();
        FileTracker::new(shard.clone())
            .mark_hash_processed(&pending.hash, Some(&path))
            .await?;
    }

    let counts = run.counts();
    debug!(
        shard = index,
        created = counts.created,
        updated = counts.updated,
        rejected = counts.rejected,
        "Shard worker finished"
    );
    shard.close().await;

    Ok(ShardOutput {
        index,
        pending,
        shard_path,
        status,
    })
}

async fn relink_byline(
    pool: &SqlitePool,
    id_map: &HashMap<i64, i64>,
    shard_paper: i64,
    byline: Vec<AuthorRef>,
) -> Result<u64> {
    let Some(&target) = id_map.get(&shard_paper) else {
        return Ok(0);
    };
    let mut tx = pool.begin().await?;
    let links = link_authors(&mut *tx, target, &byline).await?;
    tx.commit().await?;
    Ok(links.links_created)
}

/// Merge one shard database into the target
pub async fn reconcile_shard(
    pool: &SqlitePool,
    engine: &MergeEngine,
    run: &mut MergeRun,
    shard_path: &Path,
    kind: SourceKind,
) -> Result<ReconcileReport> {
    let shard = init_database(shard_path).await?;
    let mut report = ReconcileReport::default();
    let mut id_map: HashMap<i64, i64> = HashMap::new();

    // Publications
    {
        let sql = format!("SELECT {} FROM publications ORDER BY id", PUBLICATION_COLUMNS);
        let mut rows = sqlx::query_as::<_, Publication>(&sql).fetch(&shard);
        while let Some(publication) = rows.try_next().await? {
            let mut tx = pool.begin().await?;
            let merged = engine.merge_stored(&mut *tx, run, kind, &publication).await?;
            tx.commit().await?;

            report.publications += 1;
            match merged.publication_id {
                Some(target) => {
                    id_map.insert(publication.id, target);
                }
                None => {
                    debug!(shard_id = publication.id, outcome = ?merged.outcome, "Shard row has no single target");
                    report.unresolved += 1;
                }
            }
        }
    }

    // Authorship, grouped per shard paper in byline order
    {
        let mut rows = sqlx::query_as::<_, (i64, Option<i64>, String, Option<String>)>(
            r#"
            SELECT app.paper_id, app.author_position, a.name, a.orcid
            FROM author_paper_pairs app
            JOIN authors a ON a.id = app.author_id
            ORDER BY app.paper_id, app.author_position
            "#,
        )
        .fetch(&shard);

        let mut current: Option<i64> = None;
        let mut byline = Vec::new();
        while let Some((paper_id, position, name, orcid)) = rows.try_next().await? {
            if let Some(previous) = current.filter(|p| *p != paper_id) {
                report.links_created +=
                    relink_byline(pool, &id_map, previous, std::mem::take(&mut byline)).await?;
            }
            current = Some(paper_id);
            byline.push(AuthorRef {
                name,
                orcid,
                position: position.filter(|p| *p != UNKNOWN_POSITION),
            });
        }
        if let Some(previous) = current {
            report.links_created += relink_byline(pool, &id_map, previous, byline).await?;
        }
    }

    // Citation edges between papers that both reconciled
    {
        let mut rows = sqlx::query_as::<_, (i64, i64)>("SELECT paper_id, cited_paper_id FROM cites")
            .fetch(&shard);
        let mut tx = pool.begin().await?;
        while let Some((citing, cited)) = rows.try_next().await? {
            if let (Some(&citing), Some(&cited)) = (id_map.get(&citing), id_map.get(&cited)) {
                if insert_edge(&mut *tx, citing, cited).await? {
                    report.edges_created += 1;
                }
            }
        }
        tx.commit().await?;
    }

    let parsed: Vec<(String, Option<String>)> = sqlx::query_as("SELECT hash, path FROM parsed_files")
        .fetch_all(&shard)
        .await?;
    let tracker = FileTracker::new(pool.clone());
    for (hash, path) in &parsed {
        tracker.mark_hash_processed(hash, path.as_deref()).await?;
    }
    report.parsed_files = parsed.len() as u64;

    shard.close().await;

    if report.links_created > 0 || report.edges_created > 0 {
        run.mark_modified();
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::IncomingRecord;
    use crate::driver::ingest_record;
    use crate::venues::{VenueHistogram, VenueTable};
    use bibmerge_common::db::init_memory_database;

    fn engine() -> MergeEngine {
        let table = VenueTable::from_toml_str("[venues]\nICPE = []\nICDCS = []\n").unwrap();
        MergeEngine::new(Arc::new(table), Arc::new(VenueHistogram::new()))
    }

    fn record(key: &str, title: &str, doi: Option<&str>) -> IncomingRecord {
        let mut record = IncomingRecord::new(SourceKind::Dblp, key, title, "ICPE");
        record.year = Some(2022);
        record.doi = doi.map(str::to_string);
        record.authors = vec![
            AuthorRef { name: "Ada".into(), orcid: None, position: Some(1) },
            AuthorRef { name: "Grace".into(), orcid: None, position: Some(2) },
        ];
        record
    }

    #[tokio::test]
    async fn test_reconcile_shard_into_target() {
        let dir = tempfile::tempdir().unwrap();
        let shard_path = dir.path().join("shard-0000.db");
        let engine = engine();

        {
            let shard = init_database(&shard_path).await.unwrap();
            let mut run = MergeRun::new();
            let a = ingest_record(&engine, &shard, &mut run, &record("a", "Shared paper", Some("10.1/a")))
                .await
                .unwrap();
            let b = ingest_record(&engine, &shard, &mut run, &record("b", "Shard only", None))
                .await
                .unwrap();
            sqlx::query("INSERT INTO cites (paper_id, cited_paper_id) VALUES (?, ?)")
                .bind(b.publication_id.unwrap())
                .bind(a.publication_id.unwrap())
                .execute(&shard)
                .await
                .unwrap();
            FileTracker::new(shard.clone())
                .mark_hash_processed("abc123", Some("dblp.xml"))
                .await
                .unwrap();
            shard.close().await;
        }

        let target = init_memory_database().await.unwrap();
        let mut run = MergeRun::new();
        // The target already knows the shared paper under its DOI
        let existing = ingest_record(&engine, &target, &mut run, &record("x", "Shared paper", Some("10.1/a")))
            .await
            .unwrap()
            .publication_id
            .unwrap();

        let report = reconcile_shard(&target, &engine, &mut run, &shard_path, SourceKind::Dblp)
            .await
            .unwrap();
        assert_eq!(report.publications, 2);
        assert_eq!(report.edges_created, 1);
        assert_eq!(report.parsed_files, 1);

        let publications: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM publications")
            .fetch_one(&target)
            .await
            .unwrap();
        assert_eq!(publications, 2);

        let authors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM authors")
            .fetch_one(&target)
            .await
            .unwrap();
        assert_eq!(authors, 2);

        let cited: i64 = sqlx::query_scalar("SELECT cited_paper_id FROM cites")
            .fetch_one(&target)
            .await
            .unwrap();
        assert_eq!(cited, existing);

        assert!(FileTracker::new(target.clone()).is_hash_processed("abc123").await.unwrap());
    }
}
