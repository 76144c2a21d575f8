//! Identity Resolution & Merge Engine
//!
//! Reconciles one [`IncomingRecord`] with the publications already stored.
//! Steps, first success wins:
//!
//! 1. venue gate: unresolved venues are tallied and rejected
//! 2. sanitize title and abstract, reject empty or over-long titles
//! 3. match by DOI
//! 4. match by exact title, narrowed by venue, year and volume when ambiguous
//! 5. insert
//!
//! Every field update is derived from [`MERGE_POLICY`]. Lookups and writes
//! are not atomic against concurrent writers; callers hold the only
//! connection to the database file.

use crate::adapters::{IncomingRecord, SourceKind};
use crate::sanitize::plain_text;
use crate::venues::{UnknownVenueSink, VenueResolver};
use bibmerge_common::db::{bump_version, Publication, PUBLICATION_COLUMNS};
use bibmerge_common::Result;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sanitized titles longer than this are treated as parser garbage
pub const MAX_TITLE_CHARS: usize = 512;

// ===== Merge policy =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationField {
    Title,
    Venue,
    Year,
    Volume,
    Doi,
    Abstract,
    SemanticScholarId,
    NCitations,
}

impl PublicationField {
    pub fn column(self) -> &'static str {
        match self {
            PublicationField::Title => "title",
            PublicationField::Venue => "venue",
            PublicationField::Year => "year",
            PublicationField::Volume => "volume",
            PublicationField::Doi => "doi",
            PublicationField::Abstract => "abstract",
            PublicationField::SemanticScholarId => "semantic_scholar_id",
            PublicationField::NCitations => "n_citations",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Written only while the stored value is empty; first writer wins
    FillIfEmpty,
    /// Takes the larger of stored and incoming; never decreases
    MaxNumeric,
    /// Set on insert, never updated
    Immutable,
}

pub const MERGE_POLICY: &[(PublicationField, FieldPolicy)] = &[
    (PublicationField::Title, FieldPolicy::Immutable),
    (PublicationField::Venue, FieldPolicy::Immutable),
    (PublicationField::Year, FieldPolicy::Immutable),
    (PublicationField::Volume, FieldPolicy::Immutable),
    (PublicationField::Doi, FieldPolicy::FillIfEmpty),
    (PublicationField::Abstract, FieldPolicy::FillIfEmpty),
    (PublicationField::SemanticScholarId, FieldPolicy::FillIfEmpty),
    (PublicationField::NCitations, FieldPolicy::MaxNumeric),
];

pub fn policy_for(field: PublicationField) -> FieldPolicy {
    MERGE_POLICY
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, policy)| *policy)
        .unwrap_or(FieldPolicy::Immutable)
}

#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Text(String),
    Int(i64),
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &FieldValue) -> SqliteQuery<'q> {
    match value {
        FieldValue::Text(text) => query.bind(text.clone()),
        FieldValue::Int(number) => query.bind(*number),
    }
}

// ===== Outcomes =====

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UnknownVenue,
    EmptyTitle,
    TitleTooLong { chars: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Updated,
    Unchanged,
    Rejected(RejectReason),
}

impl MergeOutcome {
    pub fn modified_data(&self) -> bool {
        matches!(self, MergeOutcome::Created | MergeOutcome::Updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Every narrowed row already had the incoming values
    NothingToFill,
    /// The constrained update failed and was skipped
    StoreError { statement: String, message: String },
}

/// Result of the best-effort update over duplicate-titled rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialUpdateResult {
    pub applied: bool,
    pub rows: u64,
    pub skipped_reason: Option<SkipReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub outcome: MergeOutcome,
    /// Row the record resolved to, when it resolved to exactly one
    pub publication_id: Option<i64>,
    pub partial: Option<PartialUpdateResult>,
}

impl MergeReport {
    fn resolved(outcome: MergeOutcome, publication_id: i64) -> Self {
        Self {
            outcome,
            publication_id: Some(publication_id),
            partial: None,
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            outcome: MergeOutcome::Rejected(reason),
            publication_id: None,
            partial: None,
        }
    }
}

// ===== Per-run context =====

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub rejected: u64,
    pub partial_skipped: u64,
}

/// Tracks one ingestion run against one database
///
/// The dataset version is bumped at most once, in [`MergeRun::finish`], and
/// only when some record modified data.
#[derive(Debug, Default)]
pub struct MergeRun {
    counts: MergeCounts,
    modified: bool,
}

impl MergeRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, report: &MergeReport) {
        match &report.outcome {
            MergeOutcome::Created => self.counts.created += 1,
            MergeOutcome::Updated => self.counts.updated += 1,
            MergeOutcome::Unchanged => self.counts.unchanged += 1,
            MergeOutcome::Rejected(_) => self.counts.rejected += 1,
        }
        if matches!(
            &report.partial,
            Some(PartialUpdateResult {
                skipped_reason: Some(SkipReason::StoreError { .. }),
                ..
            })
        ) {
            self.counts.partial_skipped += 1;
        }
        self.modified |= report.outcome.modified_data();
    }

    /// Note a modification made outside the merge engine (reconciled links)
    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    pub fn counts(&self) -> MergeCounts {
        self.counts
    }

    pub fn data_modified(&self) -> bool {
        self.modified
    }

    /// Bump the dataset version if anything changed
    pub async fn finish(self, pool: &SqlitePool) -> Result<MergeCounts> {
        let counts = self.counts;
        info!(
            created = counts.created,
            updated = counts.updated,
            unchanged = counts.unchanged,
            rejected = counts.rejected,
            partial_skipped = counts.partial_skipped,
            "Merge run finished"
        );
        if self.modified {
            bump_version(pool).await?;
        }
        Ok(counts)
    }
}

// ===== Engine =====

/// Sanitized view of an incoming record
#[derive(Debug, Clone)]
struct Candidate {
    title: String,
    abstract_text: String,
    venue: String,
    year: Option<i64>,
    volume: Option<String>,
    doi: Option<String>,
    external_id: Option<String>,
    citation_count: Option<i64>,
}

impl Candidate {
    fn value(&self, field: PublicationField) -> Option<FieldValue> {
        let text = |value: &Option<String>| value.clone().map(FieldValue::Text);
        match field {
            PublicationField::Title => Some(FieldValue::Text(self.title.clone())),
            PublicationField::Venue => Some(FieldValue::Text(self.venue.clone())),
            PublicationField::Year => self.year.map(FieldValue::Int),
            PublicationField::Volume => text(&self.volume),
            PublicationField::Doi => text(&self.doi),
            PublicationField::Abstract => {
                (!self.abstract_text.is_empty()).then(|| FieldValue::Text(self.abstract_text.clone()))
            }
            PublicationField::SemanticScholarId => text(&self.external_id),
            PublicationField::NCitations => self.citation_count.map(FieldValue::Int),
        }
    }
}

fn stored_value(publication: &Publication, field: PublicationField) -> Option<FieldValue> {
    let text = |value: &Option<String>| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| FieldValue::Text(v.to_string()))
    };
    match field {
        PublicationField::Title => Some(FieldValue::Text(publication.title.clone())),
        PublicationField::Venue => Some(FieldValue::Text(publication.venue.clone())),
        PublicationField::Year => publication.year.map(FieldValue::Int),
        PublicationField::Volume => text(&publication.volume),
        PublicationField::Doi => text(&publication.doi),
        PublicationField::Abstract => (!publication.abstract_text.is_empty())
            .then(|| FieldValue::Text(publication.abstract_text.clone())),
        PublicationField::SemanticScholarId => text(&publication.semantic_scholar_id),
        PublicationField::NCitations => Some(FieldValue::Int(publication.n_citations)),
    }
}

/// Field changes the policy allows for `existing` given `candidate`
fn plan_patch(existing: &Publication, candidate: &Candidate) -> Vec<(PublicationField, FieldValue)> {
    let mut patch = Vec::new();
    for (field, policy) in MERGE_POLICY {
        let Some(incoming) = candidate.value(*field) else {
            continue;
        };
        let stored = stored_value(existing, *field);
        let apply = match policy {
            FieldPolicy::Immutable => false,
            FieldPolicy::FillIfEmpty => stored.is_none(),
            FieldPolicy::MaxNumeric => match (&stored, &incoming) {
                (Some(FieldValue::Int(old)), FieldValue::Int(new)) => new > old,
                (None, _) => true,
                _ => false,
            },
        };
        if apply {
            patch.push((*field, incoming));
        }
    }
    patch
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub struct MergeEngine {
    resolver: Arc<dyn VenueResolver>,
    unknown_venues: Arc<dyn UnknownVenueSink>,
}

impl MergeEngine {
    pub fn new(resolver: Arc<dyn VenueResolver>, unknown_venues: Arc<dyn UnknownVenueSink>) -> Self {
        Self {
            resolver,
            unknown_venues,
        }
    }

    /// Update-or-insert one record; the outcome is also tallied on `run`
    pub async fn merge_publication(
        &self,
        conn: &mut SqliteConnection,
        run: &mut MergeRun,
        record: &IncomingRecord,
    ) -> Result<MergeReport> {
        let report = self.merge_inner(conn, record).await?;
        debug!(
            source = %record.source,
            key = %record.source_key,
            outcome = ?report.outcome,
            publication_id = ?report.publication_id,
            "Merged record"
        );
        run.record(&report);
        Ok(report)
    }

    async fn merge_inner(&self, conn: &mut SqliteConnection, record: &IncomingRecord) -> Result<MergeReport> {
        let raw_venue = record.raw_venue.trim();
        let Some(venue) = self.resolver.resolve(raw_venue) else {
            self.unknown_venues.record(raw_venue);
            return Ok(MergeReport::rejected(RejectReason::UnknownVenue));
        };

        let title = plain_text(&record.title).trim().to_string();
        let chars = title.chars().count();
        if chars == 0 {
            warn!(source = %record.source, key = %record.source_key, "Rejecting record with empty title");
            return Ok(MergeReport::rejected(RejectReason::EmptyTitle));
        }
        if chars > MAX_TITLE_CHARS {
            warn!(source = %record.source, key = %record.source_key, chars, "Rejecting record with oversized title");
            return Ok(MergeReport::rejected(RejectReason::TitleTooLong { chars }));
        }

        let candidate = Candidate {
            title,
            abstract_text: plain_text(&record.abstract_text).trim().to_string(),
            venue,
            year: record.year,
            volume: non_empty(record.volume.as_deref()),
            doi: non_empty(record.doi.as_deref()),
            external_id: non_empty(record.external_id.as_deref()),
            citation_count: record.citation_count,
        };
        self.merge_candidate(conn, candidate).await
    }

    /// Merge a row another store already accepted
    ///
    /// The row's text is plain and its venue is canonical, so neither the
    /// sanitizer nor the venue gate runs again.
    pub async fn merge_stored(
        &self,
        conn: &mut SqliteConnection,
        run: &mut MergeRun,
        source: SourceKind,
        publication: &Publication,
    ) -> Result<MergeReport> {
        let candidate = Candidate {
            title: publication.title.clone(),
            abstract_text: publication.abstract_text.clone(),
            venue: publication.venue.clone(),
            year: publication.year,
            volume: non_empty(publication.volume.as_deref()),
            doi: non_empty(publication.doi.as_deref()),
            external_id: non_empty(publication.semantic_scholar_id.as_deref()),
            citation_count: (publication.n_citations >= 0).then_some(publication.n_citations),
        };
        let report = self.merge_candidate(conn, candidate).await?;
        debug!(
            source = %source,
            shard_id = publication.id,
            outcome = ?report.outcome,
            publication_id = ?report.publication_id,
            "Merged stored row"
        );
        run.record(&report);
        Ok(report)
    }

    async fn merge_candidate(&self, conn: &mut SqliteConnection, candidate: Candidate) -> Result<MergeReport> {
        if let Some(doi) = candidate.doi.as_deref() {
            if let Some(existing) = find_by_doi(conn, doi).await? {
                return self.patch_existing(conn, &existing, &candidate).await;
            }
        }

        if candidate.abstract_text.is_empty() && candidate.doi.is_none() {
            // Nothing to fill in; only the exact same sighting may be reused
            if let Some(id) = find_exact(conn, &candidate).await? {
                return Ok(MergeReport::resolved(MergeOutcome::Unchanged, id));
            }
            return insert(conn, candidate).await;
        }

        let matches = find_by_title(conn, &candidate.title).await?;
        match matches.as_slice() {
            [] => insert(conn, candidate).await,
            [existing] => {
                if is_distinct_volume(existing, &candidate) {
                    return insert(conn, candidate).await;
                }
                if stored_value(existing, PublicationField::Abstract).is_some()
                    && stored_value(existing, PublicationField::Doi).is_some()
                {
                    return Ok(MergeReport::resolved(MergeOutcome::Unchanged, existing.id));
                }
                self.patch_existing(conn, existing, &candidate).await
            }
            _ => constrained_update(conn, candidate).await,
        }
    }

    async fn patch_existing(
        &self,
        conn: &mut SqliteConnection,
        existing: &Publication,
        candidate: &Candidate,
    ) -> Result<MergeReport> {
        let mut patch = plan_patch(existing, candidate);

        // The external id is unique; a row elsewhere may already carry it
        if let Some(pos) = patch
            .iter()
            .position(|(field, _)| *field == PublicationField::SemanticScholarId)
        {
            if let Some(external_id) = candidate.external_id.as_deref() {
                if external_id_owner(conn, external_id).await?.is_some_and(|id| id != existing.id) {
                    debug!(external_id, publication_id = existing.id, "External id already assigned elsewhere");
                    patch.remove(pos);
                }
            }
        }

        if patch.is_empty() {
            return Ok(MergeReport::resolved(MergeOutcome::Unchanged, existing.id));
        }

        let assignments: Vec<String> = patch
            .iter()
            .map(|(field, _)| format!("{} = ?", field.column()))
            .collect();
        let sql = format!("UPDATE publications SET {} WHERE id = ?", assignments.join(", "));

        let mut query = sqlx::query(&sql);
        for (_, value) in &patch {
            query = bind_value(query, value);
        }
        query.bind(existing.id).execute(&mut *conn).await?;

        Ok(MergeReport::resolved(MergeOutcome::Updated, existing.id))
    }
}

/// Same title, venue and year but a different, known volume
fn is_distinct_volume(existing: &Publication, candidate: &Candidate) -> bool {
    let stored = existing.volume.as_deref().filter(|v| !v.is_empty());
    match (stored, candidate.volume.as_deref()) {
        (Some(stored), Some(incoming)) => {
            existing.venue == candidate.venue && existing.year == candidate.year && stored != incoming
        }
        _ => false,
    }
}

// ===== Store access =====

async fn find_by_doi(conn: &mut SqliteConnection, doi: &str) -> Result<Option<Publication>> {
    let sql = format!("SELECT {} FROM publications WHERE doi = ?", PUBLICATION_COLUMNS);
    let publication = sqlx::query_as::<_, Publication>(&sql)
        .bind(doi)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(publication)
}

/// At most two rows: enough to tell "one" from "several"
async fn find_by_title(conn: &mut SqliteConnection, title: &str) -> Result<Vec<Publication>> {
    let sql = format!(
        "SELECT {} FROM publications WHERE title = ? ORDER BY id LIMIT 2",
        PUBLICATION_COLUMNS
    );
    let publications = sqlx::query_as::<_, Publication>(&sql)
        .bind(title)
        .fetch_all(&mut *conn)
        .await?;
    Ok(publications)
}

async fn find_exact(conn: &mut SqliteConnection, candidate: &Candidate) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM publications
        WHERE title = ? AND venue = ? AND year IS ? AND volume IS ?
        ORDER BY id LIMIT 1
        "#,
    )
    .bind(&candidate.title)
    .bind(&candidate.venue)
    .bind(candidate.year)
    .bind(candidate.volume.as_deref())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

async fn external_id_owner(conn: &mut SqliteConnection, external_id: &str) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM publications WHERE semantic_scholar_id = ?")
        .bind(external_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

async fn insert(conn: &mut SqliteConnection, mut candidate: Candidate) -> Result<MergeReport> {
    if let Some(external_id) = candidate.external_id.as_deref() {
        if external_id_owner(conn, external_id).await?.is_some() {
            debug!(external_id, "External id already assigned, inserting without it");
            candidate.external_id = None;
        }
    }

    let id: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO publications
            (venue, year, volume, title, doi, abstract, n_citations, semantic_scholar_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&candidate.venue)
    .bind(candidate.year)
    .bind(candidate.volume.as_deref())
    .bind(&candidate.title)
    .bind(candidate.doi.as_deref())
    .bind(&candidate.abstract_text)
    .bind(candidate.citation_count.unwrap_or(-1))
    .bind(candidate.external_id.as_deref())
    .fetch_optional(&mut *conn)
    .await?;

    match id {
        Some(id) => Ok(MergeReport::resolved(MergeOutcome::Created, id)),
        None => {
            warn!(title = %candidate.title, "Insert hit a uniqueness conflict, record left unchanged");
            Ok(MergeReport {
                outcome: MergeOutcome::Unchanged,
                publication_id: None,
                partial: None,
            })
        }
    }
}

/// Best-effort update of every row sharing title, venue, year and volume
///
/// Distinct short pieces with the same title in one issue ("Preface",
/// "Editorial") are conflated here; that is a known limitation.
async fn constrained_update(conn: &mut SqliteConnection, candidate: Candidate) -> Result<MergeReport> {
    let narrowed: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM publications
        WHERE title = ? AND venue = ? AND year IS ? AND volume IS ?
        ORDER BY id LIMIT 2
        "#,
    )
    .bind(&candidate.title)
    .bind(&candidate.venue)
    .bind(candidate.year)
    .bind(candidate.volume.as_deref())
    .fetch_all(&mut *conn)
    .await?;

    if narrowed.is_empty() {
        return insert(conn, candidate).await;
    }
    let publication_id = (narrowed.len() == 1).then(|| narrowed[0]);

    let mut assignments = Vec::new();
    let mut values = Vec::new();
    let mut needs_change = Vec::new();
    let mut needs_change_values = Vec::new();
    for (field, policy) in MERGE_POLICY {
        // The external id is only ever set on a single resolved row
        if *field == PublicationField::SemanticScholarId {
            continue;
        }
        let Some(value) = candidate.value(*field) else {
            continue;
        };
        let column = field.column();
        match policy {
            FieldPolicy::Immutable => continue,
            FieldPolicy::FillIfEmpty => {
                assignments.push(format!(
                    "{column} = CASE WHEN {column} IS NULL OR {column} = '' THEN ? ELSE {column} END"
                ));
                needs_change.push(format!("({column} IS NULL OR {column} = '')"));
            }
            FieldPolicy::MaxNumeric => {
                assignments.push(format!("{column} = MAX({column}, ?)"));
                needs_change.push(format!("{column} < ?"));
                needs_change_values.push(value.clone());
            }
        }
        values.push(value);
    }

    if assignments.is_empty() {
        return Ok(partial_report(publication_id, 0, Some(SkipReason::NothingToFill)));
    }

    let statement = format!(
        "UPDATE publications SET {} WHERE title = ? AND venue = ? AND year IS ? AND volume IS ? AND ({})",
        assignments.join(", "),
        needs_change.join(" OR ")
    );

    let mut query = sqlx::query(&statement);
    for value in &values {
        query = bind_value(query, value);
    }
    query = query
        .bind(candidate.title.clone())
        .bind(candidate.venue.clone())
        .bind(candidate.year)
        .bind(candidate.volume.clone());
    for value in &needs_change_values {
        query = bind_value(query, value);
    }

    match query.execute(&mut *conn).await {
        Ok(result) if result.rows_affected() > 0 => {
            Ok(partial_report(publication_id, result.rows_affected(), None))
        }
        Ok(_) => Ok(partial_report(publication_id, 0, Some(SkipReason::NothingToFill))),
        Err(e) => {
            warn!(
                statement = %statement,
                title = %candidate.title,
                venue = %candidate.venue,
                year = ?candidate.year,
                volume = ?candidate.volume,
                error = %e,
                "Constrained update over duplicate titles failed, skipping"
            );
            Ok(partial_report(
                publication_id,
                0,
                Some(SkipReason::StoreError {
                    statement,
                    message: e.to_string(),
                }),
            ))
        }
    }
}

fn partial_report(publication_id: Option<i64>, rows: u64, skipped_reason: Option<SkipReason>) -> MergeReport {
    let applied = rows > 0;
    MergeReport {
        outcome: if applied {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        },
        publication_id,
        partial: Some(PartialUpdateResult {
            applied,
            rows,
            skipped_reason,
        }),
    }
}
