//! Database schema migrations
//!
//! The applied level lives in `properties.db_schema_version`. Each step `N`
//! runs only while the stored level is below `N` and the new level is
//! persisted immediately after it, so an interrupted upgrade resumes from the
//! last completed step on the next start.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - databases in the field were built by them
//! 2. **Always add new migrations** - one function per schema change, then bump
//!    [`CURRENT_SCHEMA_VERSION`]
//! 3. **Forward only** - there are no down migrations
//! 4. **Guard twice** - the version check decides whether a step runs; steps
//!    still check for existing columns and use `IF NOT EXISTS`

use crate::{Error, Result};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
pub const CURRENT_SCHEMA_VERSION: i64 = 8;

/// Get current schema version from the properties row
///
/// Creates the row at version 1 when it is absent.
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT db_schema_version FROM properties WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    match version {
        Some(version) => Ok(version),
        None => {
            sqlx::query("INSERT INTO properties (id, db_schema_version, version) VALUES (1, 1, 0)")
                .execute(pool)
                .await?;
            info!("Created properties row at schema v1");
            Ok(1)
        }
    }
}

/// Persist schema version
pub async fn set_schema_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("UPDATE properties SET db_schema_version = ? WHERE id = 1")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        warn!("Leaving schema untouched");
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("✓ Migration v2 completed");
    }

    if current_version < 3 {
        migrate_v3(pool).await?;
        set_schema_version(pool, 3).await?;
        info!("✓ Migration v3 completed");
    }

    if current_version < 4 {
        migrate_v4(pool).await?;
        set_schema_version(pool, 4).await?;
        info!("✓ Migration v4 completed");
    }

    if current_version < 5 {
        migrate_v5(pool).await?;
        set_schema_version(pool, 5).await?;
        info!("✓ Migration v5 completed");
    }

    if current_version < 6 {
        migrate_v6(pool).await?;
        set_schema_version(pool, 6).await?;
        info!("✓ Migration v6 completed");
    }

    if current_version < 7 {
        migrate_v7(pool).await?;
        set_schema_version(pool, 7).await?;
        info!("✓ Migration v7 completed");
    }

    if current_version < 8 {
        migrate_v8(pool).await?;
        set_schema_version(pool, 8).await?;
        info!("✓ Migration v8 completed");
    }

    info!("All migrations completed successfully");
    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;

    Ok(count > 0)
}

/// `ALTER TABLE ADD COLUMN` unless the column is already there
async fn add_column(pool: &SqlitePool, table: &str, column: &str, definition: &str) -> Result<()> {
    if has_column(pool, table, column).await? {
        info!("  {}.{} already exists, skipping", table, column);
        return Ok(());
    }

    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition);
    sqlx::query(&sql).execute(pool).await?;
    info!("  Added {}.{}", table, column);
    Ok(())
}

async fn execute_all(pool: &SqlitePool, statements: &[&str]) -> Result<()> {
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Values of `table.column` held by more than one row, most repeated first
async fn duplicate_values(pool: &SqlitePool, table: &str, column: &str) -> Result<Vec<(String, i64)>> {
    let sql = format!(
        "SELECT {column}, COUNT(*) FROM {table} WHERE {column} IS NOT NULL \
         GROUP BY {column} HAVING COUNT(*) > 1 ORDER BY COUNT(*) DESC, {column} LIMIT 20"
    );
    let duplicates = sqlx::query_as(&sql).fetch_all(pool).await?;
    Ok(duplicates)
}

/// Migration v2: citation counts and the author tables
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    add_column(pool, "publications", "n_citations", "INTEGER NOT NULL DEFAULT -1").await?;

    execute_all(
        pool,
        &[
            r#"
            CREATE TABLE IF NOT EXISTS authors (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS author_paper_pairs (
                author_id INTEGER NOT NULL REFERENCES authors(id),
                paper_id INTEGER NOT NULL REFERENCES publications(id),
                PRIMARY KEY (author_id, paper_id)
            )
            "#,
        ],
    )
    .await
}

/// Migration v3: lookup indexes used by the merge engine
async fn migrate_v3(pool: &SqlitePool) -> Result<()> {
    execute_all(
        pool,
        &[
            "CREATE INDEX IF NOT EXISTS idx_publications_title ON publications(title)",
            "CREATE INDEX IF NOT EXISTS idx_publications_venue ON publications(venue)",
            "CREATE INDEX IF NOT EXISTS idx_publications_year ON publications(year)",
            "CREATE INDEX IF NOT EXISTS idx_authors_name ON authors(name)",
            "CREATE INDEX IF NOT EXISTS idx_author_paper_pairs_paper ON author_paper_pairs(paper_id)",
        ],
    )
    .await
}

/// Migration v4: file-dedup tracker table
async fn migrate_v4(pool: &SqlitePool) -> Result<()> {
    execute_all(
        pool,
        &[r#"
        CREATE TABLE IF NOT EXISTS parsed_files (
            hash TEXT NOT NULL UNIQUE,
            path TEXT,
            parsed_at TIMESTAMP
        )
        "#],
    )
    .await
}

/// Migration v5: external source ids and citation edges
async fn migrate_v5(pool: &SqlitePool) -> Result<()> {
    add_column(pool, "publications", "semantic_scholar_id", "TEXT").await?;

    execute_all(
        pool,
        &[
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_semantic_scholar_id
            ON publications(semantic_scholar_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cites (
                paper_id INTEGER NOT NULL REFERENCES publications(id),
                cited_paper_id INTEGER NOT NULL REFERENCES publications(id),
                PRIMARY KEY (paper_id, cited_paper_id)
            )
            "#,
        ],
    )
    .await
}

/// Migration v6: author positions, first publication year, keyword tables
async fn migrate_v6(pool: &SqlitePool) -> Result<()> {
    add_column(pool, "author_paper_pairs", "author_position", "INTEGER DEFAULT -1").await?;
    add_column(pool, "authors", "orcid", "TEXT").await?;
    add_column(pool, "authors", "first_publication_year", "INTEGER").await?;

    execute_all(
        pool,
        &[
            r#"
            CREATE TABLE IF NOT EXISTS words (
                word TEXT PRIMARY KEY,
                frequency INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS paper_word_pairs (
                paper_id INTEGER NOT NULL REFERENCES publications(id),
                word_id TEXT NOT NULL REFERENCES words(word),
                cnt INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (paper_id, word_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS publication_keyword_relation (
                paper_id INTEGER NOT NULL REFERENCES publications(id),
                word_id TEXT NOT NULL REFERENCES words(word),
                PRIMARY KEY (paper_id, word_id)
            )
            "#,
        ],
    )
    .await
}

/// Migration v7: dataset freshness columns and uniqueness of doi and orcid
async fn migrate_v7(pool: &SqlitePool) -> Result<()> {
    add_column(pool, "properties", "dblp_version", "TIMESTAMP").await?;
    add_column(pool, "properties", "semantic_scholar_version", "TIMESTAMP").await?;
    add_column(pool, "properties", "aminer_mag_version", "TIMESTAMP").await?;

    // Empty strings would collide under the unique indexes
    execute_all(
        pool,
        &[
            "UPDATE publications SET doi = NULL WHERE doi = ''",
            "UPDATE authors SET orcid = NULL WHERE orcid = ''",
        ],
    )
    .await?;

    let mut blocked = Vec::new();
    for (table, column) in [("publications", "doi"), ("authors", "orcid")] {
        let duplicates = duplicate_values(pool, table, column).await?;
        for (value, rows) in &duplicates {
            error!(table, column, value = %value, rows, "Duplicate value blocks unique index");
        }
        if !duplicates.is_empty() {
            let values: Vec<&str> = duplicates.iter().map(|(value, _)| value.as_str()).collect();
            blocked.push(format!("{}.{} [{}]", table, column, values.join(", ")));
        }
    }
    if !blocked.is_empty() {
        return Err(Error::SchemaDrift(format!(
            "cannot create unique indexes, duplicate values in {}",
            blocked.join("; ")
        )));
    }

    execute_all(
        pool,
        &[
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_doi ON publications(doi)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_authors_orcid ON authors(orcid)",
        ],
    )
    .await
}

/// Migration v8: secondary indexes for derived passes and downstream readers
async fn migrate_v8(pool: &SqlitePool) -> Result<()> {
    execute_all(
        pool,
        &[
            "CREATE INDEX IF NOT EXISTS idx_publications_volume ON publications(volume)",
            "CREATE INDEX IF NOT EXISTS idx_publications_n_citations ON publications(n_citations)",
            "CREATE INDEX IF NOT EXISTS idx_cites_cited ON cites(cited_paper_id)",
            "CREATE INDEX IF NOT EXISTS idx_paper_word_pairs_word ON paper_word_pairs(word_id)",
        ],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::{create_properties_table, create_publications_table};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_properties_table(&pool).await.unwrap();
        create_publications_table(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_get_schema_version_creates_row() {
        let pool = setup_test_db().await;

        assert_eq!(get_schema_version(&pool).await.unwrap(), 1);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM properties")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_set_and_get_schema_version() {
        let pool = setup_test_db().await;
        get_schema_version(&pool).await.unwrap();

        set_schema_version(&pool, 5).await.unwrap();
        assert_eq!(get_schema_version(&pool).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_run_migrations_complete_flow() {
        let pool = setup_test_db().await;

        run_migrations(&pool).await.unwrap();

        assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(has_column(&pool, "publications", "n_citations").await.unwrap());
        assert!(has_column(&pool, "publications", "semantic_scholar_id").await.unwrap());
        assert!(has_column(&pool, "author_paper_pairs", "author_position").await.unwrap());
        assert!(has_column(&pool, "properties", "dblp_version").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_migrations_idempotent() {
        let pool = setup_test_db().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_resume_after_partial_upgrade() {
        let pool = setup_test_db().await;
        get_schema_version(&pool).await.unwrap();

        // Simulate a crash after v2 ran but before the level was persisted
        migrate_v2(&pool).await.unwrap();

        run_migrations(&pool).await.unwrap();
        assert_eq!(get_schema_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_existing_data_survives_upgrade() {
        let pool = setup_test_db().await;
        sqlx::query("INSERT INTO publications (venue, year, title, doi) VALUES ('VLDB', 2001, 'Old paper', '')")
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();

        let (n_citations, doi): (i64, Option<String>) =
            sqlx::query_as("SELECT n_citations, doi FROM publications WHERE title = 'Old paper'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(n_citations, -1);
        assert_eq!(doi, None);
    }

    #[tokio::test]
    async fn test_duplicate_dois_stop_upgrade_with_their_values() {
        let pool = setup_test_db().await;
        for title in ["First copy", "Second copy"] {
            sqlx::query("INSERT INTO publications (venue, year, title, doi) VALUES ('VLDB', 2001, ?, '10.1/dup')")
                .bind(title)
                .execute(&pool)
                .await
                .unwrap();
        }

        let err = run_migrations(&pool).await.unwrap_err();

        let message = err.to_string();
        assert!(matches!(err, Error::SchemaDrift(_)));
        assert!(message.contains("publications.doi"));
        assert!(message.contains("10.1/dup"));
        // Every step before the blocked one is kept
        assert_eq!(get_schema_version(&pool).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_newer_database_left_alone() {
        let pool = setup_test_db().await;
        get_schema_version(&pool).await.unwrap();
        set_schema_version(&pool, CURRENT_SCHEMA_VERSION + 1).await.unwrap();

        run_migrations(&pool).await.unwrap();

        assert!(!has_column(&pool, "publications", "n_citations").await.unwrap());
    }
}
