//! Aminer and MAG adapter
//!
//! Both corpora of the Open Academic Graph share one line format. Aminer
//! publishes `n_citation`; MAG counts are left to the derived citation pass.

use super::jsonl::{int_field, str_field, str_list, text_field, JsonLines};
use super::{doi_from_url, IncomingRecord, SourceKind};
use crate::error::AdapterResult;
use crate::sanitize::strip_trailing_period;
use serde_json::Value;
use std::io::BufRead;
use tracing::warn;

pub struct AminerRecords {
    lines: JsonLines,
    kind: SourceKind,
}

impl AminerRecords {
    pub fn new(reader: Box<dyn BufRead + Send>, label: String, kind: SourceKind) -> Self {
        Self {
            lines: JsonLines::new(reader, label),
            kind,
        }
    }
}

impl Iterator for AminerRecords {
    type Item = AdapterResult<IncomingRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line, value) = match self.lines.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };

            match convert(&value, self.kind, line) {
                Ok(record) => return Some(Ok(record)),
                Err(reason) => {
                    warn!(file = %self.lines.label(), line, reason, "Skipping {} entry", self.kind);
                }
            }
        }
    }
}

/// Raw venue is a string or an object carrying it under `raw`
fn venue(value: &Value) -> Option<String> {
    match value.get("venue")? {
        Value::String(s) => super::non_empty(s),
        Value::Object(map) => map.get("raw").and_then(Value::as_str).and_then(super::non_empty),
        _ => None,
    }
}

fn convert(value: &Value, kind: SourceKind, line: u64) -> Result<IncomingRecord, &'static str> {
    let raw_venue = venue(value).ok_or("missing venue")?;
    let title = str_field(value, "title").ok_or("missing title")?;
    let source_key = str_field(value, "id").unwrap_or_else(|| format!("line{}", line));

    let mut record = IncomingRecord::new(kind, source_key, strip_trailing_period(&title), raw_venue);
    record.abstract_text = str_field(value, "abstract").unwrap_or_default();
    record.year = int_field(value, "year");
    record.volume = text_field(value, "volume");
    record.doi = str_field(value, "doi")
        .or_else(|| str_list(value, "url").iter().find_map(|url| doi_from_url(url)));

    if kind == SourceKind::Aminer {
        record.citation_count = int_field(value, "n_citation");
    }

    Ok(record)
}
