//! Database Test Utilities

use anyhow::Result;
use bibmerge_common::config::IngestConfig;
use bibmerge_common::db::init_database;
use bibmerge_ingest::venues::VenueTable;
use sqlx::SqlitePool;
use std::path::PathBuf;
use tempfile::TempDir;

use super::corpus::CorpusDir;

/// Temp directory holding a corpus, a target database and run outputs
///
/// `_dir` must be kept alive for the duration of the test
pub struct TestWorkspace {
    pub _dir: TempDir,
    pub corpus: CorpusDir,
    pub pool: SqlitePool,
    pub config: IngestConfig,
}

pub async fn create_test_workspace() -> Result<TestWorkspace> {
    let dir = TempDir::new()?;
    let corpus = CorpusDir::new(&dir.path().join("corpus"));
    let database_path = dir.path().join("bibmerge.db");
    let pool = init_database(&database_path).await?;

    let config = IngestConfig {
        database_path,
        corpus_root: corpus.path().to_path_buf(),
        venue_table: None,
        report_dir: dir.path().join("reports"),
        shard_dir: dir.path().join("shards"),
        jobs: 1,
        log_level: "debug".to_string(),
    };

    Ok(TestWorkspace {
        _dir: dir,
        corpus,
        pool,
        config,
    })
}

impl TestWorkspace {
    pub fn report_dir(&self) -> PathBuf {
        self.config.report_dir.clone()
    }
}

pub fn test_venues() -> VenueTable {
    VenueTable::from_toml_str(
        r#"
        [venues]
        ICPE = ["International Conference on Performance Engineering"]
        ICDCS = ["International Conference on Distributed Computing Systems"]
        TPDS = ["IEEE Trans. Parallel Distrib. Syst.", "IEEE Transactions on Parallel and Distributed Systems"]
        "#,
    )
    .unwrap()
}

pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {}", table);
    sqlx::query_scalar(&sql).fetch_one(pool).await.unwrap()
}
