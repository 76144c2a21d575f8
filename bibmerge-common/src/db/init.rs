//! Database initialization
//!
//! Opens (or creates) a merged-corpus database, applies connection pragmas,
//! creates the bootstrap tables, runs the Schema Migrator and finally checks
//! the persisted schema contract. Any failure here is fatal for the run.

use crate::db::{migrations::run_migrations, schema_contract::verify_contract};
use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open the database file and bring its schema up to date
///
/// The pool holds a single connection: every database file has exactly one
/// writer.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    prepare_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database with the full schema, used by tests and dry runs
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    // The database lives as long as its only connection
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    prepare_schema(&pool).await?;
    Ok(pool)
}

async fn prepare_schema(pool: &SqlitePool) -> Result<()> {
    create_properties_table(pool).await?;
    create_publications_table(pool).await?;

    run_migrations(pool).await?;
    verify_contract(pool).await?;
    Ok(())
}

/// Singleton properties row (id is always 1)
pub async fn create_properties_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS properties (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_modified TIMESTAMP,
            db_schema_version INTEGER NOT NULL DEFAULT 1,
            version INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Publications table in its first-generation shape
///
/// Later columns and indexes are added by the migrator.
pub async fn create_publications_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS publications (
            id INTEGER PRIMARY KEY,
            venue TEXT NOT NULL,
            year INTEGER,
            volume TEXT,
            title TEXT NOT NULL,
            doi TEXT,
            abstract TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
