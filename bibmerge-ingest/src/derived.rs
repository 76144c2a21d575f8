//! Derived batch passes
//!
//! Recomputed over the full tables after ingestion, never maintained during
//! merge. Each pass is one transaction: an interrupted pass leaves the
//! previous state and should simply be re-run.

use bibmerge_common::Result;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::info;

/// Longer tokens are discarded as noise
pub const MAX_WORD_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordIndexReport {
    pub words: u64,
    pub paper_word_pairs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivedReport {
    pub keywords: KeywordIndexReport,
    pub authors_updated: u64,
    pub publications_updated: u64,
}

/// Lower-cased words of an abstract
///
/// Only `a-z` and the separators space, `-` and `/` survive; everything else
/// is removed before splitting.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || matches!(c, ' ' | '-' | '/'))
        .collect();

    cleaned
        .split([' ', '-', '/'])
        .filter(|w| !w.is_empty() && w.len() <= MAX_WORD_CHARS)
        .map(str::to_string)
        .collect()
}

/// Rebuild `words` and `paper_word_pairs` from the abstracts
///
/// `publication_keyword_relation` is cleared as well; it references `words`
/// and is repopulated through [`replace_keyword_relations`].
pub async fn rebuild_keyword_index(pool: &SqlitePool) -> Result<KeywordIndexReport> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM publication_keyword_relation")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM paper_word_pairs").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM words").execute(&mut *tx).await?;

    let abstracts: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, abstract FROM publications WHERE abstract != ''")
            .fetch_all(&mut *tx)
            .await?;

    let mut frequency: HashMap<String, i64> = HashMap::new();
    let mut pairs: Vec<(i64, String, i64)> = Vec::new();
    for (paper_id, text) in &abstracts {
        let mut per_paper: HashMap<String, i64> = HashMap::new();
        for word in tokenize(text) {
            *per_paper.entry(word).or_insert(0) += 1;
        }
        for (word, cnt) in per_paper {
            *frequency.entry(word.clone()).or_insert(0) += cnt;
            pairs.push((*paper_id, word, cnt));
        }
    }

    for (word, count) in &frequency {
        sqlx::query("INSERT INTO words (word, frequency) VALUES (?, ?)")
            .bind(word)
            .bind(count)
            .execute(&mut *tx)
            .await?;
    }
    for (paper_id, word, cnt) in &pairs {
        sqlx::query("INSERT INTO paper_word_pairs (paper_id, word_id, cnt) VALUES (?, ?, ?)")
            .bind(paper_id)
            .bind(word)
            .bind(cnt)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    let report = KeywordIndexReport {
        words: frequency.len() as u64,
        paper_word_pairs: pairs.len() as u64,
    };
    info!(words = report.words, pairs = report.paper_word_pairs, "Rebuilt keyword index");
    Ok(report)
}

/// Replace the keyword relation with the output of a keyword extractor
///
/// Pairs naming an unknown word or paper are ignored.
pub async fn replace_keyword_relations(pool: &SqlitePool, relations: &[(i64, String)]) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM publication_keyword_relation")
        .execute(&mut *tx)
        .await?;

    let mut inserted = 0;
    for (paper_id, word) in relations {
        let result = sqlx::query(
            r#"
            INSERT INTO publication_keyword_relation (paper_id, word_id)
            SELECT p.id, w.word FROM publications p, words w
            WHERE p.id = ? AND w.word = ?
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(paper_id)
        .bind(word)
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected();
    }

    tx.commit().await?;
    info!(relations = inserted, "Replaced keyword relations");
    Ok(inserted)
}

/// Earliest year among each author's linked publications
pub async fn recompute_first_publication_years(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        r#"
        UPDATE authors
        SET first_publication_year = (
            SELECT MIN(p.year)
            FROM author_paper_pairs app
            JOIN publications p ON p.id = app.paper_id
            WHERE app.author_id = authors.id
        )
        WHERE EXISTS (SELECT 1 FROM author_paper_pairs app WHERE app.author_id = authors.id)
        "#,
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(authors = result.rows_affected(), "Recomputed first publication years");
    Ok(result.rows_affected())
}

/// Citation counts from the in-degree of each cited paper
///
/// Counts only grow: a larger count reported by a source is kept.
pub async fn recompute_citation_counts(pool: &SqlitePool) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        r#"
        UPDATE publications
        SET n_citations = MAX(
            n_citations,
            (SELECT COUNT(*) FROM cites WHERE cites.cited_paper_id = publications.id)
        )
        WHERE id IN (SELECT cited_paper_id FROM cites)
        "#,
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(publications = result.rows_affected(), "Recomputed citation counts");
    Ok(result.rows_affected())
}

/// All derived passes in dependency order
pub async fn run_derived_passes(pool: &SqlitePool) -> Result<DerivedReport> {
    let keywords = rebuild_keyword_index(pool).await?;
    let authors_updated = recompute_first_publication_years(pool).await?;
    let publications_updated = recompute_citation_counts(pool).await?;

    Ok(DerivedReport {
        keywords,
        authors_updated,
        publications_updated,
    })
}
