//! Row models for the merged corpus

use crate::Result;
use sqlx::{FromRow, SqliteExecutor};

/// One canonical row per real-world paper
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Publication {
    pub id: i64,
    pub venue: String,
    pub year: Option<i64>,
    pub volume: Option<String>,
    pub title: String,
    pub doi: Option<String>,
    #[sqlx(rename = "abstract")]
    pub abstract_text: String,
    /// -1 when unknown
    pub n_citations: i64,
    pub semantic_scholar_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub orcid: Option<String>,
    pub first_publication_year: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct AuthorshipLink {
    pub author_id: i64,
    pub paper_id: i64,
    /// Byline position, -1 when unknown
    pub author_position: Option<i64>,
}

/// Directed edge: `paper_id` cites `cited_paper_id`
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct CitationEdge {
    pub paper_id: i64,
    pub cited_paper_id: i64,
}

pub const PUBLICATION_COLUMNS: &str =
    "id, venue, year, volume, title, doi, abstract, n_citations, semantic_scholar_id";

pub async fn load_publication<'e, E>(executor: E, id: i64) -> Result<Option<Publication>>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("SELECT {} FROM publications WHERE id = ?", PUBLICATION_COLUMNS);
    let publication = sqlx::query_as::<_, Publication>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(publication)
}

pub async fn load_author<'e, E>(executor: E, id: i64) -> Result<Option<Author>>
where
    E: SqliteExecutor<'e>,
{
    let author = sqlx::query_as::<_, Author>(
        "SELECT id, name, orcid, first_publication_year FROM authors WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    Ok(author)
}

/// Authors of a paper in byline order
pub async fn load_links_for_paper<'e, E>(executor: E, paper_id: i64) -> Result<Vec<AuthorshipLink>>
where
    E: SqliteExecutor<'e>,
{
    let links = sqlx::query_as::<_, AuthorshipLink>(
        r#"
        SELECT author_id, paper_id, author_position
        FROM author_paper_pairs
        WHERE paper_id = ?
        ORDER BY author_position
        "#,
    )
    .bind(paper_id)
    .fetch_all(executor)
    .await?;

    Ok(links)
}
