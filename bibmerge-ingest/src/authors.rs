//! Author Linker
//!
//! Resolves each byline entry to an author row (valid ORCID first, then exact
//! name, else a new row) and links it to the publication with its byline
//! position. Author identities are never merged after creation: a row created
//! from a bare name stays separate even if a later sighting reveals an ORCID
//! that belongs to another row.

use crate::adapters::AuthorRef;
use bibmerge_common::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqliteConnection;
use tracing::debug;

static ORCID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{4}-\d{4}-\d{3}[\dX]$").expect("valid regex"));

const ORCID_URL_PREFIXES: &[&str] = &["https://orcid.org/", "http://orcid.org/", "orcid.org/"];

/// Position stored when the byline order is unknown
pub const UNKNOWN_POSITION: i64 = -1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub authors_created: u64,
    pub links_created: u64,
}

/// Canonical 16-digit ORCID, or `None` when the input is not one
pub fn normalize_orcid(raw: &str) -> Option<String> {
    let mut orcid = raw.trim();
    for prefix in ORCID_URL_PREFIXES {
        if let Some(rest) = orcid.strip_prefix(prefix) {
            orcid = rest;
            break;
        }
    }
    let orcid = orcid.to_ascii_uppercase();
    ORCID_RE.is_match(&orcid).then_some(orcid)
}

pub async fn link_authors(
    conn: &mut SqliteConnection,
    publication_id: i64,
    authors: &[AuthorRef],
) -> Result<LinkReport> {
    let mut report = LinkReport::default();

    for author in authors {
        let name = author.name.trim();
        if name.is_empty() {
            continue;
        }
        let orcid = author.orcid.as_deref().and_then(normalize_orcid);

        let (author_id, created) = resolve_author(conn, name, orcid.as_deref()).await?;
        if created {
            report.authors_created += 1;
        }

        let result = sqlx::query(
            r#"
            INSERT INTO author_paper_pairs (author_id, paper_id, author_position)
            VALUES (?, ?, ?)
            ON CONFLICT(author_id, paper_id) DO NOTHING
            "#,
        )
        .bind(author_id)
        .bind(publication_id)
        .bind(author.position.unwrap_or(UNKNOWN_POSITION))
        .execute(&mut *conn)
        .await?;
        report.links_created += result.rows_affected();
    }

    if report.links_created > 0 {
        debug!(
            publication_id,
            authors_created = report.authors_created,
            links_created = report.links_created,
            "Linked authors"
        );
    }
    Ok(report)
}

/// Existing author id, or a new row; the flag tells whether it was created
async fn resolve_author(
    conn: &mut SqliteConnection,
    name: &str,
    orcid: Option<&str>,
) -> Result<(i64, bool)> {
    if let Some(orcid) = orcid {
        let by_orcid: Option<i64> = sqlx::query_scalar("SELECT id FROM authors WHERE orcid = ?")
            .bind(orcid)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(id) = by_orcid {
            return Ok((id, false));
        }
    }

    let by_name: Option<i64> = sqlx::query_scalar("SELECT id FROM authors WHERE name = ? ORDER BY id LIMIT 1")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    if let Some(id) = by_name {
        return Ok((id, false));
    }

    let id: i64 = sqlx::query_scalar("INSERT INTO authors (name, orcid) VALUES (?, ?) RETURNING id")
        .bind(name)
        .bind(orcid)
        .fetch_one(&mut *conn)
        .await?;
    Ok((id, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibmerge_common::db::{init_memory_database, load_author, load_links_for_paper};
    use sqlx::SqlitePool;

    async fn paper(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("INSERT INTO publications (venue, year, title) VALUES ('ICPE', 2020, 'P') RETURNING id")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn author(name: &str, orcid: Option<&str>, position: i64) -> AuthorRef {
        AuthorRef {
            name: name.to_string(),
            orcid: orcid.map(str::to_string),
            position: Some(position),
        }
    }

    #[test]
    fn test_normalize_orcid() {
        assert_eq!(
            normalize_orcid("https://orcid.org/0000-0002-1825-009x"),
            Some("0000-0002-1825-009X".to_string())
        );
        assert_eq!(normalize_orcid("0000-0002-1825-0097"), Some("0000-0002-1825-0097".to_string()));
        assert_eq!(normalize_orcid("0000-0002-1825"), None);
        assert_eq!(normalize_orcid(""), None);
    }

    #[tokio::test]
    async fn test_link_creates_authors_with_positions() {
        let pool = init_memory_database().await.unwrap();
        let paper_id = paper(&pool).await;
        let mut conn = pool.acquire().await.unwrap();

        let report = link_authors(
            &mut conn,
            paper_id,
            &[author("Ada", None, 1), author("Grace", None, 2)],
        )
        .await
        .unwrap();
        assert_eq!(
            report,
            LinkReport {
                authors_created: 2,
                links_created: 2
            }
        );

        let positions: Vec<Option<i64>> = load_links_for_paper(&mut *conn, paper_id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.author_position)
            .collect();
        assert_eq!(positions, vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_relink_is_idempotent() {
        let pool = init_memory_database().await.unwrap();
        let paper_id = paper(&pool).await;
        let mut conn = pool.acquire().await.unwrap();
        let byline = [author("Ada", None, 1)];

        link_authors(&mut conn, paper_id, &byline).await.unwrap();
        let again = link_authors(&mut conn, paper_id, &byline).await.unwrap();

        assert_eq!(again, LinkReport::default());
    }

    #[tokio::test]
    async fn test_orcid_wins_over_name() {
        let pool = init_memory_database().await.unwrap();
        let paper_id = paper(&pool).await;
        let mut conn = pool.acquire().await.unwrap();

        link_authors(&mut conn, paper_id, &[author("A. Lovelace", Some("0000-0001-0000-0001"), 1)])
            .await
            .unwrap();
        let report = link_authors(&mut conn, paper_id, &[author("Ada Lovelace", Some("0000-0001-0000-0001"), 1)])
            .await
            .unwrap();

        assert_eq!(report.authors_created, 0);
        let first = load_author(&mut *conn, 1).await.unwrap().unwrap();
        assert_eq!(first.name, "A. Lovelace");
    }

    #[tokio::test]
    async fn test_name_match_does_not_merge_identities() {
        let pool = init_memory_database().await.unwrap();
        let paper_id = paper(&pool).await;
        let mut conn = pool.acquire().await.unwrap();

        // Name-only row first, then the same name with an ORCID
        link_authors(&mut conn, paper_id, &[author("Wei Zhang", None, 1)]).await.unwrap();
        link_authors(&mut conn, paper_id, &[author("Wei Zhang", Some("0000-0003-0000-0003"), 1)])
            .await
            .unwrap();

        let stored = load_author(&mut *conn, 1).await.unwrap().unwrap();
        assert_eq!(stored.orcid, None);
        let authors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM authors")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(authors, 1);
    }

    #[tokio::test]
    async fn test_invalid_orcid_treated_as_absent() {
        let pool = init_memory_database().await.unwrap();
        let paper_id = paper(&pool).await;
        let mut conn = pool.acquire().await.unwrap();

        link_authors(&mut conn, paper_id, &[author("Linus", Some("not-an-orcid"), 1)])
            .await
            .unwrap();

        let stored = load_author(&mut *conn, 1).await.unwrap().unwrap();
        assert_eq!(stored.orcid, None);
    }
}
