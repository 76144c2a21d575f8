//! Format Adapters
//!
//! Each adapter lazily turns one corpus file into a stream of
//! [`IncomingRecord`]s. Streams are finite and not restartable; a restart
//! re-opens the file from the top. Malformed entries are logged and skipped
//! inside the adapter. An `Err` item means the whole file failed and ends the
//! stream.

pub mod aminer;
pub mod dblp;
pub mod jsonl;
pub mod semantic_scholar;

use crate::error::AdapterResult;
use bibmerge_common::db::SourceFamily;
use flate2::read::GzDecoder;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Read buffer for corpus files
const READ_BUFFER: usize = 1024 * 1024;

/// Corpus file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Dblp,
    Aminer,
    Mag,
    SemanticScholar,
}

impl SourceKind {
    /// Classify a corpus file by its name
    ///
    /// Archives (`.zip`, `.tar`) left next to the extracted files are ignored.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();

        if name.ends_with(".zip") || name.ends_with(".tar") || name.ends_with(".tar.gz") {
            return None;
        }

        if name.starts_with("dblp") && (name.ends_with(".xml") || name.ends_with(".xml.gz")) {
            Some(SourceKind::Dblp)
        } else if name.contains("aminer_papers") {
            Some(SourceKind::Aminer)
        } else if name.contains("mag_papers") {
            Some(SourceKind::Mag)
        } else if name.contains("s2-corpus") {
            Some(SourceKind::SemanticScholar)
        } else {
            None
        }
    }

    pub fn family(self) -> SourceFamily {
        match self {
            SourceKind::Dblp => SourceFamily::Dblp,
            SourceKind::Aminer | SourceKind::Mag => SourceFamily::AminerMag,
            SourceKind::SemanticScholar => SourceFamily::SemanticScholar,
        }
    }

    /// Ingestion phase: DBLP first (authors, stable keys), then the
    /// complementary JSON corpora, Semantic Scholar last
    pub fn phase(self) -> u8 {
        match self {
            SourceKind::Dblp => 0,
            SourceKind::Aminer | SourceKind::Mag => 1,
            SourceKind::SemanticScholar => 2,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Dblp => "dblp",
            SourceKind::Aminer => "aminer",
            SourceKind::Mag => "mag",
            SourceKind::SemanticScholar => "semantic-scholar",
        };
        f.write_str(name)
    }
}

/// Author as listed on a byline
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorRef {
    pub name: String,
    pub orcid: Option<String>,
    /// 1-based byline position when known
    pub position: Option<i64>,
}

/// Source-independent shape of one publication sighting
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRecord {
    pub source: SourceKind,
    /// Natural key within the source (DBLP key, Aminer id, ...)
    pub source_key: String,
    /// Stable external id persisted on the publication (Semantic Scholar id)
    pub external_id: Option<String>,
    /// Raw title, may contain markup
    pub title: String,
    /// Raw abstract, may contain markup; empty when unknown
    pub abstract_text: String,
    pub raw_venue: String,
    pub year: Option<i64>,
    pub volume: Option<String>,
    pub doi: Option<String>,
    /// Concrete count only from sources that publish one
    pub citation_count: Option<i64>,
    pub authors: Vec<AuthorRef>,
    /// External ids of papers citing this one
    pub in_citations: Vec<String>,
    /// External ids of papers this one cites
    pub out_citations: Vec<String>,
}

impl IncomingRecord {
    pub fn new(
        source: SourceKind,
        source_key: impl Into<String>,
        title: impl Into<String>,
        raw_venue: impl Into<String>,
    ) -> Self {
        Self {
            source,
            source_key: source_key.into(),
            external_id: None,
            title: title.into(),
            abstract_text: String::new(),
            raw_venue: raw_venue.into(),
            year: None,
            volume: None,
            doi: None,
            citation_count: None,
            authors: Vec::new(),
            in_citations: Vec::new(),
            out_citations: Vec::new(),
        }
    }

    pub fn has_citations(&self) -> bool {
        !self.in_citations.is_empty() || !self.out_citations.is_empty()
    }
}

pub type RecordStream = Box<dyn Iterator<Item = AdapterResult<IncomingRecord>> + Send>;

/// Open the adapter for `kind` over `path`
pub fn open_records(kind: SourceKind, path: &Path) -> AdapterResult<RecordStream> {
    let reader = open_reader(path)?;
    let label = path.display().to_string();

    let stream: RecordStream = match kind {
        SourceKind::Dblp => Box::new(dblp::DblpRecords::new(reader, label)),
        SourceKind::Aminer => Box::new(aminer::AminerRecords::new(reader, label, kind)),
        SourceKind::Mag => Box::new(aminer::AminerRecords::new(reader, label, kind)),
        SourceKind::SemanticScholar => {
            Box::new(semantic_scholar::SemanticScholarRecords::new(reader, label))
        }
    };
    Ok(stream)
}

/// Buffered reader, transparently gunzipping `.gz` files
pub fn open_reader(path: &Path) -> AdapterResult<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    let gzipped = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"));

    if gzipped {
        let decoder = GzDecoder::new(BufReader::with_capacity(READ_BUFFER, file));
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER, decoder)))
    } else {
        Ok(Box::new(BufReader::with_capacity(READ_BUFFER, file)))
    }
}

/// DOI part of a `doi.org` resolver URL
pub fn doi_from_url(url: &str) -> Option<String> {
    let marker = "doi.org/";
    let start = url.find(marker)? + marker.len();
    non_empty(&url[start..])
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
