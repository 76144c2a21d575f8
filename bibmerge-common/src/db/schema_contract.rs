//! Persisted schema contract
//!
//! Downstream readers (ranking analytics, the HTTP API) bind directly to the
//! table and column names below and to the uniqueness constraints on doi,
//! semantic_scholar_id, orcid and the link tables. After migrations run, the
//! live schema is introspected and compared against these declarations. Any
//! drift is fatal.

use crate::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, error, info};

// ===== Declarations =====

/// Expected column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    pub primary_key: bool,
    pub unique: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            primary_key: false,
            unique: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Column must be covered by a single-column unique index
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A table whose shape is part of the external contract
pub trait TableSchema {
    fn table_name() -> &'static str;

    fn expected_columns() -> Vec<ColumnDefinition>;
}

pub struct PublicationsTable;

impl TableSchema for PublicationsTable {
    fn table_name() -> &'static str {
        "publications"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("venue", "TEXT").not_null(),
            ColumnDefinition::new("year", "INTEGER"),
            ColumnDefinition::new("volume", "TEXT"),
            ColumnDefinition::new("title", "TEXT").not_null(),
            ColumnDefinition::new("doi", "TEXT").unique(),
            ColumnDefinition::new("abstract", "TEXT").not_null(),
            ColumnDefinition::new("n_citations", "INTEGER").not_null(),
            ColumnDefinition::new("semantic_scholar_id", "TEXT").unique(),
        ]
    }
}

pub struct AuthorsTable;

impl TableSchema for AuthorsTable {
    fn table_name() -> &'static str {
        "authors"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("id", "INTEGER").primary_key(),
            ColumnDefinition::new("name", "TEXT").not_null(),
            ColumnDefinition::new("orcid", "TEXT").unique(),
            ColumnDefinition::new("first_publication_year", "INTEGER"),
        ]
    }
}

pub struct AuthorPaperPairsTable;

impl TableSchema for AuthorPaperPairsTable {
    fn table_name() -> &'static str {
        "author_paper_pairs"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("author_id", "INTEGER").primary_key(),
            ColumnDefinition::new("paper_id", "INTEGER").primary_key(),
            ColumnDefinition::new("author_position", "INTEGER"),
        ]
    }
}

pub struct CitesTable;

impl TableSchema for CitesTable {
    fn table_name() -> &'static str {
        "cites"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("paper_id", "INTEGER").primary_key(),
            ColumnDefinition::new("cited_paper_id", "INTEGER").primary_key(),
        ]
    }
}

pub struct WordsTable;

impl TableSchema for WordsTable {
    fn table_name() -> &'static str {
        "words"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("word", "TEXT").primary_key(),
            ColumnDefinition::new("frequency", "INTEGER"),
        ]
    }
}

pub struct PaperWordPairsTable;

impl TableSchema for PaperWordPairsTable {
    fn table_name() -> &'static str {
        "paper_word_pairs"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("paper_id", "INTEGER").primary_key(),
            ColumnDefinition::new("word_id", "TEXT").primary_key(),
            ColumnDefinition::new("cnt", "INTEGER"),
        ]
    }
}

pub struct PublicationKeywordRelationTable;

impl TableSchema for PublicationKeywordRelationTable {
    fn table_name() -> &'static str {
        "publication_keyword_relation"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("paper_id", "INTEGER").primary_key(),
            ColumnDefinition::new("word_id", "TEXT").primary_key(),
        ]
    }
}

pub struct PropertiesTable;

impl TableSchema for PropertiesTable {
    fn table_name() -> &'static str {
        "properties"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("last_modified", "TIMESTAMP"),
            ColumnDefinition::new("db_schema_version", "INTEGER").not_null(),
            ColumnDefinition::new("version", "INTEGER").not_null(),
            ColumnDefinition::new("dblp_version", "TIMESTAMP"),
            ColumnDefinition::new("semantic_scholar_version", "TIMESTAMP"),
            ColumnDefinition::new("aminer_mag_version", "TIMESTAMP"),
        ]
    }
}

pub struct ParsedFilesTable;

impl TableSchema for ParsedFilesTable {
    fn table_name() -> &'static str {
        "parsed_files"
    }

    fn expected_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::new("hash", "TEXT").not_null().unique(),
            ColumnDefinition::new("path", "TEXT"),
            ColumnDefinition::new("parsed_at", "TIMESTAMP"),
        ]
    }
}

// ===== Introspection =====

/// Column as reported by `PRAGMA table_info`
#[derive(Debug, Clone)]
pub struct ActualColumn {
    pub cid: i32,
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub pk: bool,
}

/// Difference between declared and live schema
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDrift {
    MissingTable {
        table: String,
    },
    MissingColumn {
        table: String,
        column: String,
    },
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
    ConstraintMismatch {
        table: String,
        column: String,
        constraint: String, // "NOT NULL", "UNIQUE", "PRIMARY KEY"
    },
}

impl std::fmt::Display for SchemaDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaDrift::MissingTable { table } => write!(f, "missing table {}", table),
            SchemaDrift::MissingColumn { table, column } => {
                write!(f, "missing column {}.{}", table, column)
            }
            SchemaDrift::TypeMismatch {
                table,
                column,
                expected,
                actual,
            } => write!(
                f,
                "{}.{} has type '{}', expected '{}'",
                table, column, actual, expected
            ),
            SchemaDrift::ConstraintMismatch {
                table,
                column,
                constraint,
            } => write!(f, "{}.{} lacks {}", table, column, constraint),
        }
    }
}

pub struct SchemaIntrospector;

impl SchemaIntrospector {
    pub async fn introspect_table(pool: &SqlitePool, table_name: &str) -> Result<Vec<ActualColumn>> {
        let query = format!("PRAGMA table_info({})", table_name);
        let rows = sqlx::query(&query).fetch_all(pool).await?;

        let mut columns: Vec<ActualColumn> = rows
            .iter()
            .map(|row| ActualColumn {
                cid: row.get("cid"),
                name: row.get("name"),
                type_name: row.get("type"),
                not_null: row.get::<i32, _>("notnull") != 0,
                pk: row.get::<i32, _>("pk") != 0,
            })
            .collect();

        columns.sort_by_key(|c| c.cid);
        Ok(columns)
    }

    pub async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM sqlite_master
                WHERE type='table' AND name = ?
            )
            "#,
        )
        .bind(table_name)
        .fetch_one(pool)
        .await?;

        Ok(exists)
    }

    /// Columns covered by a single-column unique index
    pub async fn unique_columns(pool: &SqlitePool, table_name: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT il.name AS index_name, ii.name AS column_name
            FROM pragma_index_list(?) AS il
            JOIN pragma_index_info(il.name) AS ii
            WHERE il."unique" = 1
            "#,
        )
        .bind(table_name)
        .fetch_all(pool)
        .await?;

        let mut by_index: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            let index: String = row.get("index_name");
            let column: Option<String> = row.get("column_name");
            if let Some(column) = column {
                by_index.entry(index).or_default().push(column);
            }
        }

        Ok(by_index
            .into_values()
            .filter(|cols| cols.len() == 1)
            .flatten()
            .collect())
    }
}

// ===== Comparison =====

pub struct SchemaDiff;

impl SchemaDiff {
    pub fn compare(
        table_name: &str,
        expected: &[ColumnDefinition],
        actual: &[ActualColumn],
        unique_columns: &[String],
    ) -> Vec<SchemaDrift> {
        let mut drift = Vec::new();

        for expected_col in expected {
            let Some(actual_col) = actual.iter().find(|c| c.name == expected_col.name) else {
                drift.push(SchemaDrift::MissingColumn {
                    table: table_name.to_string(),
                    column: expected_col.name.clone(),
                });
                continue;
            };

            if !Self::types_compatible(&expected_col.sql_type, &actual_col.type_name) {
                drift.push(SchemaDrift::TypeMismatch {
                    table: table_name.to_string(),
                    column: expected_col.name.clone(),
                    expected: expected_col.sql_type.clone(),
                    actual: actual_col.type_name.clone(),
                });
            }

            // INTEGER PRIMARY KEY is implicitly NOT NULL without reporting it
            if expected_col.not_null && !actual_col.not_null && !actual_col.pk {
                drift.push(Self::constraint(table_name, &expected_col.name, "NOT NULL"));
            }

            if expected_col.primary_key && !actual_col.pk {
                drift.push(Self::constraint(table_name, &expected_col.name, "PRIMARY KEY"));
            }

            if expected_col.unique && !unique_columns.contains(&expected_col.name) {
                drift.push(Self::constraint(table_name, &expected_col.name, "UNIQUE"));
            }
        }

        drift
    }

    fn constraint(table: &str, column: &str, constraint: &str) -> SchemaDrift {
        SchemaDrift::ConstraintMismatch {
            table: table.to_string(),
            column: column.to_string(),
            constraint: constraint.to_string(),
        }
    }

    /// Compare by SQLite type affinity
    fn types_compatible(expected: &str, actual: &str) -> bool {
        let exp = expected.to_uppercase();
        let act = actual.to_uppercase();

        if exp == act {
            return true;
        }

        if exp.contains("INT") && act.contains("INT") {
            return true;
        }

        let is_text = |t: &str| t.contains("TEXT") || t.contains("CHAR") || t.contains("CLOB");
        is_text(&exp) && is_text(&act)
    }
}

// ===== Verification =====

/// Drift for one contract table
pub async fn check_table<T: TableSchema>(pool: &SqlitePool) -> Result<Vec<SchemaDrift>> {
    let table_name = T::table_name();

    if !SchemaIntrospector::table_exists(pool, table_name).await? {
        return Ok(vec![SchemaDrift::MissingTable {
            table: table_name.to_string(),
        }]);
    }

    let actual = SchemaIntrospector::introspect_table(pool, table_name).await?;
    let unique = SchemaIntrospector::unique_columns(pool, table_name).await?;
    let drift = SchemaDiff::compare(table_name, &T::expected_columns(), &actual, &unique);

    if drift.is_empty() {
        debug!("  ✓ Schema contract holds for '{}'", table_name);
    }
    Ok(drift)
}

/// Check every contract table, failing on any drift
pub async fn verify_contract(pool: &SqlitePool) -> Result<()> {
    let mut drift = Vec::new();
    drift.extend(check_table::<PublicationsTable>(pool).await?);
    drift.extend(check_table::<AuthorsTable>(pool).await?);
    drift.extend(check_table::<AuthorPaperPairsTable>(pool).await?);
    drift.extend(check_table::<CitesTable>(pool).await?);
    drift.extend(check_table::<WordsTable>(pool).await?);
    drift.extend(check_table::<PaperWordPairsTable>(pool).await?);
    drift.extend(check_table::<PublicationKeywordRelationTable>(pool).await?);
    drift.extend(check_table::<PropertiesTable>(pool).await?);
    drift.extend(check_table::<ParsedFilesTable>(pool).await?);

    if drift.is_empty() {
        info!("Schema contract verified");
        return Ok(());
    }

    for change in &drift {
        error!("Schema drift: {}", change);
    }
    let summary: Vec<String> = drift.iter().map(ToString::to_string).collect();
    Err(Error::SchemaDrift(summary.join("; ")))
}
