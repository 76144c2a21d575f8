//! Parallel shard ingestion against the sequential baseline

mod helpers;

use bibmerge_ingest::driver::{run_ingest, FileStatus};
use bibmerge_ingest::venues::VenueResolver;
use helpers::*;
use serde_json::json;
use std::sync::Arc;

fn populate(corpus: &CorpusDir) {
    corpus.write(
        "dblp.xml",
        &dblp_document(&[
            dblp_entry("inproceedings", "conf/icpe/1", "Tail Latency", 2020, "ICPE", None, &["Ada Lovelace", "Alan Turing"]),
            dblp_entry("inproceedings", "conf/icdcs/2", "Gossip Protocols", 2019, "ICDCS", None, &["Leslie Lamport"]),
        ]),
    );
    corpus.write(
        "aminer_papers_0.txt",
        &format!(
            "{}{}",
            json_line(json!({
                "id": "a1",
                "title": "Tail Latency",
                "venue": "International Conference on Performance Engineering",
                "year": 2020,
                "doi": "10.1145/tail",
                "abstract": "Latency matters",
                "n_citation": 12
            })),
            json_line(json!({"id": "a2", "title": "Fresh Result", "venue": "ICDCS", "year": 2021, "abstract": "New"})),
        ),
    );
    corpus.write(
        "s2-corpus-000",
        &json_line(json!({
            "id": "s1",
            "title": "Gossip Protocols",
            "venue": "ICDCS",
            "year": 2019,
            "paperAbstract": "Epidemics",
            "outCitations": ["missing"]
        })),
    );
}

async fn snapshot(pool: &sqlx::SqlitePool) -> Vec<(String, String, Option<String>, i64, Option<String>)> {
    sqlx::query_as("SELECT title, abstract, doi, n_citations, semantic_scholar_id FROM publications ORDER BY title")
        .fetch_all(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sharded_run_matches_sequential_run() {
    let sequential = create_test_workspace().await.unwrap();
    populate(&sequential.corpus);
    run_ingest(&sequential.pool, &sequential.config, Arc::new(test_venues()), &[])
        .await
        .unwrap();

    let mut sharded = create_test_workspace().await.unwrap();
    populate(&sharded.corpus);
    sharded.config.jobs = 3;
    let summary = run_ingest(&sharded.pool, &sharded.config, Arc::new(test_venues()), &[])
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.files.len(), 3);
    assert_eq!(snapshot(&sharded.pool).await, snapshot(&sequential.pool).await);
    for table in ["publications", "authors", "author_paper_pairs", "parsed_files"] {
        assert_eq!(
            count_rows(&sharded.pool, table).await,
            count_rows(&sequential.pool, table).await,
            "row count differs for {}",
            table
        );
    }

    // Shard databases are removed after reconciliation
    let leftovers: Vec<_> = std::fs::read_dir(&sharded.config.shard_dir)
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_sharded_rerun_skips_every_file() {
    let mut ws = create_test_workspace().await.unwrap();
    populate(&ws.corpus);
    ws.config.jobs = 2;
    let venues = Arc::new(test_venues());

    run_ingest(&ws.pool, &ws.config, venues.clone(), &[]).await.unwrap();
    let rerun = run_ingest(&ws.pool, &ws.config, venues, &[]).await.unwrap();

    assert!(rerun.files.iter().all(|f| f.status == FileStatus::Skipped));
    assert_eq!(rerun.counts.created, 0);
}

/// Knows only the long conference name, not the code it maps to
struct LongNameOnly;

impl VenueResolver for LongNameOnly {
    fn resolve(&self, raw: &str) -> Option<String> {
        (raw == "International Conference on Performance Engineering").then(|| "ICPE".to_string())
    }
}

#[tokio::test]
async fn test_sharded_run_keeps_escaped_markup_text() {
    let write = |corpus: &CorpusDir| {
        corpus.write(
            "aminer_papers_0.txt",
            &json_line(json!({
                "id": "g1",
                "title": "Generic Types &lt;T&gt; in Java",
                "venue": "ICPE",
                "year": 2018,
                "abstract": "We show that x &lt;b&gt; y holds"
            })),
        );
        corpus.write(
            "mag_papers_0.txt",
            &json_line(json!({
                "id": "g2",
                "title": "Generic Types &lt;T&gt; in Java",
                "venue": "ICPE",
                "year": 2018,
                "doi": "10.1/generic"
            })),
        );
    };

    let sequential = create_test_workspace().await.unwrap();
    write(&sequential.corpus);
    run_ingest(&sequential.pool, &sequential.config, Arc::new(test_venues()), &[])
        .await
        .unwrap();

    let mut sharded = create_test_workspace().await.unwrap();
    write(&sharded.corpus);
    sharded.config.jobs = 2;
    let summary = run_ingest(&sharded.pool, &sharded.config, Arc::new(test_venues()), &[])
        .await
        .unwrap();

    assert!(summary.is_success());
    let rows = snapshot(&sharded.pool).await;
    assert_eq!(rows, snapshot(&sequential.pool).await);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "Generic Types <T> in Java");
    assert_eq!(rows[0].1, "We show that x <b> y holds");
    assert_eq!(rows[0].2.as_deref(), Some("10.1/generic"));
}

#[tokio::test]
async fn test_sharded_run_with_resolver_that_skips_canonical_codes() {
    let write = |corpus: &CorpusDir| {
        for (file, id, title) in [
            ("aminer_papers_0.txt", "p1", "Queueing Models"),
            ("aminer_papers_1.txt", "p2", "Benchmark Drift"),
        ] {
            corpus.write(
                file,
                &json_line(json!({
                    "id": id,
                    "title": title,
                    "venue": "International Conference on Performance Engineering",
                    "year": 2022,
                    "abstract": "Measured"
                })),
            );
        }
    };

    let sequential = create_test_workspace().await.unwrap();
    write(&sequential.corpus);
    run_ingest(&sequential.pool, &sequential.config, Arc::new(LongNameOnly), &[])
        .await
        .unwrap();
    assert_eq!(count_rows(&sequential.pool, "publications").await, 2);

    let mut sharded = create_test_workspace().await.unwrap();
    write(&sharded.corpus);
    sharded.config.jobs = 2;
    let summary = run_ingest(&sharded.pool, &sharded.config, Arc::new(LongNameOnly), &[])
        .await
        .unwrap();

    assert!(summary.is_success());
    assert!(summary.unknown_venue_report.is_none());
    assert_eq!(summary.counts.rejected, 0);
    assert_eq!(count_rows(&sharded.pool, "publications").await, 2);
    assert_eq!(snapshot(&sharded.pool).await, snapshot(&sequential.pool).await);

    let venues: Vec<String> = sqlx::query_scalar("SELECT DISTINCT venue FROM publications")
        .fetch_all(&sharded.pool)
        .await
        .unwrap();
    assert_eq!(venues, vec!["ICPE".to_string()]);
}
