//! Semantic Scholar adapter
//!
//! Contributes the external paper id, abstracts and the citation graph
//! (`inCitations`/`outCitations`, both lists of Semantic Scholar ids).

use super::jsonl::{int_field, str_field, str_list, JsonLines};
use super::{doi_from_url, IncomingRecord, SourceKind};
use crate::error::AdapterResult;
use serde_json::Value;
use std::io::BufRead;
use tracing::warn;

pub struct SemanticScholarRecords {
    lines: JsonLines,
}

impl SemanticScholarRecords {
    pub fn new(reader: Box<dyn BufRead + Send>, label: String) -> Self {
        Self {
            lines: JsonLines::new(reader, label),
        }
    }
}

impl Iterator for SemanticScholarRecords {
    type Item = AdapterResult<IncomingRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line, value) = match self.lines.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };

            match convert(&value) {
                Ok(record) => return Some(Ok(record)),
                Err(reason) => {
                    warn!(file = %self.lines.label(), line, reason, "Skipping Semantic Scholar entry");
                }
            }
        }
    }
}

fn convert(value: &Value) -> Result<IncomingRecord, &'static str> {
    let raw_venue = str_field(value, "venue").ok_or("missing venue")?;
    let title = str_field(value, "title").ok_or("missing title")?;
    let id = str_field(value, "id").ok_or("missing id")?;

    let mut record = IncomingRecord::new(SourceKind::SemanticScholar, id.clone(), title, raw_venue);
    record.external_id = Some(id);
    record.abstract_text = str_field(value, "paperAbstract").unwrap_or_default();
    record.year = int_field(value, "year");
    // Empty for conference papers
    record.volume = str_field(value, "journalVolume").map(|v| v.replace(' ', "_"));
    record.doi = str_field(value, "doi")
        .or_else(|| str_field(value, "doiUrl").and_then(|url| doi_from_url(&url)));
    record.in_citations = str_list(value, "inCitations");
    record.out_citations = str_list(value, "outCitations");

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(input: &str) -> Vec<IncomingRecord> {
        let reader = Box::new(Cursor::new(input.as_bytes().to_vec()));
        SemanticScholarRecords::new(reader, "test".to_string())
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_semantic_scholar_record_fields() {
        let input = concat!(
            r#"{"id": "d9b9", "title": "Grid Computing", "venue": "Concurrency and Computation", "#,
            r#""paperAbstract": "Grids", "year": 2009, "journalVolume": "21 (3)", "doi": "", "#,
            r#""doiUrl": "https://doi.org/10.1002/cpe.1", "inCitations": ["c1"], "outCitations": ["r1", "r2"]}"#,
        );
        let records = parse(input);
        let record = &records[0];

        assert_eq!(record.external_id.as_deref(), Some("d9b9"));
        assert_eq!(record.abstract_text, "Grids");
        assert_eq!(record.volume.as_deref(), Some("21_(3)"));
        assert_eq!(record.doi.as_deref(), Some("10.1002/cpe.1"));
        assert_eq!(record.in_citations, vec!["c1".to_string()]);
        assert_eq!(record.out_citations.len(), 2);
        assert_eq!(record.citation_count, None);
    }

    #[test]
    fn test_empty_venue_skipped() {
        let input = r#"{"id": "x", "title": "T", "venue": ""}"#;
        assert!(parse(input).is_empty());
    }
}
