//! Citation Linker
//!
//! Citation graphs arrive as lists of external (Semantic Scholar) ids. Edges
//! are only created when both endpoints are known publications; ids that do
//! not resolve are dropped silently.

use bibmerge_common::Result;
use sqlx::SqliteConnection;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CitationReport {
    pub edges_created: u64,
    pub unresolved: u64,
}

async fn resolve_external_id(conn: &mut SqliteConnection, external_id: &str) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM publications WHERE semantic_scholar_id = ?")
        .bind(external_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

/// Insert a directed edge `citing -> cited`; existing edges are kept
pub async fn insert_edge(conn: &mut SqliteConnection, citing: i64, cited: i64) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO cites (paper_id, cited_paper_id) VALUES (?, ?) ON CONFLICT(paper_id, cited_paper_id) DO NOTHING",
    )
    .bind(citing)
    .bind(cited)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Link the paper known as `external_id` to its citing and cited papers
pub async fn link_citations(
    conn: &mut SqliteConnection,
    external_id: &str,
    in_citations: &[String],
    out_citations: &[String],
) -> Result<CitationReport> {
    let mut report = CitationReport::default();

    let Some(paper_id) = resolve_external_id(conn, external_id).await? else {
        report.unresolved = (in_citations.len() + out_citations.len()) as u64;
        return Ok(report);
    };

    for citing_external in in_citations {
        match resolve_external_id(conn, citing_external).await? {
            Some(citing) => {
                if insert_edge(conn, citing, paper_id).await? {
                    report.edges_created += 1;
                }
            }
            None => report.unresolved += 1,
        }
    }

    for cited_external in out_citations {
        match resolve_external_id(conn, cited_external).await? {
            Some(cited) => {
                if insert_edge(conn, paper_id, cited).await? {
                    report.edges_created += 1;
                }
            }
            None => report.unresolved += 1,
        }
    }

    if report.edges_created > 0 {
        debug!(external_id, edges = report.edges_created, "Linked citations");
    }
    Ok(report)
}
