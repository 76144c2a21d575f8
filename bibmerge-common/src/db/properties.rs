//! Singleton properties row
//!
//! Holds the applied schema level, a dataset `version` counter bumped when a
//! run modified data, and per-source release dates used for freshness checks.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Corpus families with their own release cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFamily {
    Dblp,
    SemanticScholar,
    /// Aminer and MAG are published together as the Open Academic Graph
    AminerMag,
}

impl SourceFamily {
    fn column(self) -> &'static str {
        match self {
            SourceFamily::Dblp => "dblp_version",
            SourceFamily::SemanticScholar => "semantic_scholar_version",
            SourceFamily::AminerMag => "aminer_mag_version",
        }
    }
}

impl fmt::Display for SourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceFamily::Dblp => "dblp",
            SourceFamily::SemanticScholar => "semantic-scholar",
            SourceFamily::AminerMag => "aminer-mag",
        };
        f.write_str(name)
    }
}

impl FromStr for SourceFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dblp" => Ok(SourceFamily::Dblp),
            "semantic-scholar" | "semantic_scholar" | "s2" => Ok(SourceFamily::SemanticScholar),
            "aminer-mag" | "aminer_mag" | "aminer" | "mag" | "oag" => Ok(SourceFamily::AminerMag),
            other => Err(Error::InvalidInput(format!("Unknown source family: {}", other))),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Properties {
    pub last_modified: Option<DateTime<Utc>>,
    pub db_schema_version: i64,
    pub version: i64,
    pub dblp_version: Option<DateTime<Utc>>,
    pub semantic_scholar_version: Option<DateTime<Utc>>,
    pub aminer_mag_version: Option<DateTime<Utc>>,
}

impl Properties {
    pub fn source_version(&self, source: SourceFamily) -> Option<DateTime<Utc>> {
        match source {
            SourceFamily::Dblp => self.dblp_version,
            SourceFamily::SemanticScholar => self.semantic_scholar_version,
            SourceFamily::AminerMag => self.aminer_mag_version,
        }
    }
}

pub async fn load_properties(pool: &SqlitePool) -> Result<Properties> {
    let properties = sqlx::query_as::<_, Properties>(
        r#"
        SELECT last_modified, db_schema_version, version,
               dblp_version, semantic_scholar_version, aminer_mag_version
        FROM properties WHERE id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    properties.ok_or_else(|| Error::Internal("properties row missing".to_string()))
}

/// Increment the dataset version and stamp `last_modified`
pub async fn bump_version(pool: &SqlitePool) -> Result<i64> {
    let version: i64 = sqlx::query_scalar(
        "UPDATE properties SET version = version + 1, last_modified = ? WHERE id = 1 RETURNING version",
    )
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    info!(version, "Dataset version bumped");
    Ok(version)
}

/// Record the release date of the corpus just ingested for `source`
pub async fn set_source_version(
    pool: &SqlitePool,
    source: SourceFamily,
    released: DateTime<Utc>,
) -> Result<()> {
    let sql = format!("UPDATE properties SET {} = ? WHERE id = 1", source.column());
    sqlx::query(&sql).bind(released).execute(pool).await?;

    info!(source = %source, released = %released, "Recorded source version");
    Ok(())
}

/// Whether the stored data for `source` is at least as new as `available`
pub async fn is_fresh(
    pool: &SqlitePool,
    source: SourceFamily,
    available: DateTime<Utc>,
) -> Result<bool> {
    let properties = load_properties(pool).await?;
    Ok(properties
        .source_version(source)
        .is_some_and(|stored| stored >= available))
}
