//! DBLP XML adapter
//!
//! Streams `article`, `inproceedings` and `proceedings` elements out of a
//! DBLP dump (plain or gzipped). DBLP declares its character entities in the
//! DTD; text is handed on undecoded and resolved by the sanitizer.
//!
//! An entry needs a title, a year and a venue (`booktitle`, else `journal`).
//! XML syntax errors, or a root element other than `<dblp>`, fail the
//! whole file.

use super::{doi_from_url, AuthorRef, IncomingRecord, SourceKind};
use crate::error::{AdapterError, AdapterResult};
use crate::sanitize::{plain_text, strip_trailing_period};
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::io::BufRead;
use tracing::warn;

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Author,
    Title,
    Year,
    Volume,
    BookTitle,
    Journal,
    Ee,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tag {
    Record,
    Field(Field),
    Other,
}

fn classify(name: &[u8]) -> Tag {
    match name {
        b"article" | b"inproceedings" | b"proceedings" => Tag::Record,
        b"author" => Tag::Field(Field::Author),
        b"title" => Tag::Field(Field::Title),
        b"year" => Tag::Field(Field::Year),
        b"volume" => Tag::Field(Field::Volume),
        b"booktitle" => Tag::Field(Field::BookTitle),
        b"journal" => Tag::Field(Field::Journal),
        b"ee" => Tag::Field(Field::Ee),
        _ => Tag::Other,
    }
}

/// Owned form of one parser event
enum Step {
    Start {
        tag: Tag,
        key: Option<String>,
        orcid: Option<String>,
    },
    Text(String),
    End(Tag),
    Eof,
    Skip,
}

/// Fields collected for the element being parsed
#[derive(Debug, Default)]
struct Entry {
    key: String,
    title: Option<String>,
    year: Option<String>,
    volume: Option<String>,
    booktitle: Option<String>,
    journal: Option<String>,
    ees: Vec<String>,
    authors: Vec<(String, Option<String>)>,
}

pub struct DblpRecords {
    reader: Reader<Box<dyn BufRead + Send>>,
    buf: Vec<u8>,
    label: String,
    synthetic_keys: u64,
    entry: Option<Entry>,
    field: Option<Field>,
    text: String,
    author_orcid: Option<String>,
    root_seen: bool,
    done: bool,
}

impl DblpRecords {
    pub fn new(reader: Box<dyn BufRead + Send>, label: String) -> Self {
        Self {
            reader: Reader::from_reader(reader),
            buf: Vec::new(),
            label,
            synthetic_keys: 0,
            entry: None,
            field: None,
            text: String::new(),
            author_orcid: None,
            root_seen: false,
            done: false,
        }
    }

    fn read_step(&mut self) -> AdapterResult<Step> {
        self.buf.clear();
        let event = self
            .reader
            .read_event_into(&mut self.buf)
            .map_err(|source| AdapterError::Xml {
                position: self.reader.buffer_position() as u64,
                source,
            })?;

        let step = match event {
            Event::Start(e) => {
                if !self.root_seen {
                    self.root_seen = true;
                    if e.name().as_ref() != b"dblp" {
                        return Err(AdapterError::Malformed(format!(
                            "{}: root element is <{}>, expected <dblp>",
                            self.label,
                            String::from_utf8_lossy(e.name().as_ref())
                        )));
                    }
                }
                let tag = classify(e.name().as_ref());
                let wanted: &[u8] = match tag {
                    Tag::Record => b"key",
                    Tag::Field(Field::Author) => b"orcid",
                    _ => b"",
                };
                let attr = if wanted.is_empty() {
                    None
                } else {
                    e.attributes()
                        .filter_map(|a| a.ok())
                        .find(|a| a.key.as_ref() == wanted)
                        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
                };
                match tag {
                    Tag::Record => Step::Start {
                        tag,
                        key: attr,
                        orcid: None,
                    },
                    _ => Step::Start {
                        tag,
                        key: None,
                        orcid: attr,
                    },
                }
            }
            Event::Text(e) => Step::Text(String::from_utf8_lossy(e.as_ref()).into_owned()),
            Event::CData(e) => Step::Text(String::from_utf8_lossy(e.as_ref()).into_owned()),
            Event::End(e) => Step::End(classify(e.name().as_ref())),
            Event::Eof => Step::Eof,
            _ => Step::Skip,
        };
        Ok(step)
    }

    fn start(&mut self, tag: Tag, key: Option<String>, orcid: Option<String>) {
        match tag {
            Tag::Record => {
                let key = key.unwrap_or_else(|| {
                    let synthetic = format!("id{}", self.synthetic_keys);
                    self.synthetic_keys += 1;
                    synthetic
                });
                self.entry = Some(Entry {
                    key,
                    ..Default::default()
                });
                self.field = None;
            }
            Tag::Field(field) if self.entry.is_some() && self.field.is_none() => {
                self.field = Some(field);
                self.text.clear();
                self.author_orcid = orcid;
            }
            _ => {}
        }
    }

    fn end_field(&mut self, field: Field) {
        if self.field != Some(field) {
            return;
        }
        self.field = None;

        let Some(entry) = self.entry.as_mut() else {
            return;
        };
        let value = self.text.trim().to_string();
        if value.is_empty() {
            return;
        }

        match field {
            Field::Author => entry.authors.push((value, self.author_orcid.take())),
            Field::Title => entry.title = Some(value),
            Field::Year => entry.year = Some(value),
            Field::Volume => entry.volume = Some(value),
            Field::BookTitle => entry.booktitle = Some(value),
            Field::Journal => {
                if entry.journal.is_none() {
                    entry.journal = Some(value);
                }
            }
            Field::Ee => entry.ees.push(value),
        }
    }
}

impl Iterator for DblpRecords {
    type Item = AdapterResult<IncomingRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let step = match self.read_step() {
                Ok(step) => step,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            match step {
                Step::Start { tag, key, orcid } => self.start(tag, key, orcid),
                Step::Text(text) => {
                    if self.field.is_some() {
                        self.text.push_str(&text);
                    }
                }
                Step::End(Tag::Field(field)) => self.end_field(field),
                Step::End(Tag::Record) => {
                    let Some(entry) = self.entry.take() else {
                        continue;
                    };
                    match into_record(entry) {
                        Ok(record) => return Some(Ok(record)),
                        Err((key, reason)) => {
                            warn!(file = %self.label, key = %key, reason, "Skipping DBLP entry");
                        }
                    }
                }
                Step::Eof => self.done = true,
                Step::End(Tag::Other) | Step::Skip => {}
            }
        }
        None
    }
}

/// Full year from the first digit run; two-digit years are widened
pub fn normalize_year(raw: &str) -> Option<i64> {
    let year: i64 = YEAR_RE.find(raw)?.as_str().parse().ok()?;
    Some(match year {
        0..=19 => year + 2000,
        20..=99 => year + 1900,
        _ => year,
    })
}

fn into_record(entry: Entry) -> Result<IncomingRecord, (String, &'static str)> {
    let Entry {
        key,
        title,
        year,
        volume,
        booktitle,
        journal,
        ees,
        authors,
    } = entry;

    let Some(title) = title else {
        return Err((key, "missing title"));
    };
    let Some(year) = year.as_deref().and_then(normalize_year) else {
        return Err((key, "missing year"));
    };
    let Some(venue) = booktitle.or(journal) else {
        return Err((key, "missing venue"));
    };

    let mut record = IncomingRecord::new(
        SourceKind::Dblp,
        key,
        strip_trailing_period(&title),
        plain_text(&venue),
    );
    record.year = Some(year);
    record.volume = volume;
    record.doi = ees
        .iter()
        .filter(|ee| ee.contains("doi.org/"))
        .find_map(|ee| doi_from_url(ee));
    record.authors = authors
        .into_iter()
        .enumerate()
        .map(|(index, (name, orcid))| AuthorRef {
            name: plain_text(&name),
            orcid,
            position: Some(index as i64 + 1),
        })
        .collect();

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(xml: &str) -> Vec<AdapterResult<IncomingRecord>> {
        let reader = Box::new(Cursor::new(xml.as_bytes().to_vec()));
        DblpRecords::new(reader, "test.xml".to_string()).collect()
    }

    #[test]
    fn test_inproceedings_fields() {
        let xml = r#"<?xml version="1.0" encoding="ISO-8859-1"?>
<!DOCTYPE dblp SYSTEM "dblp.dtd">
<dblp>
<inproceedings key="conf/icpe/Versluis20" mdate="2020-04-01">
<author orcid="0000-0001-7058-6277">Laurens Versluis</author>
<author>J&ouml;rg M&uuml;ller</author>
<title>The <i>Workflow</i> Trace Archive.</title>
<pages>1-12</pages>
<year>2020</year>
<booktitle>ICPE</booktitle>
<ee>https://example.org/pdf</ee>
<ee>https://doi.org/10.1145/3358960.3379123</ee>
</inproceedings>
</dblp>"#;
        let records: Vec<IncomingRecord> = parse(xml).into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.source_key, "conf/icpe/Versluis20");
        assert_eq!(record.title, "The Workflow Trace Archive");
        assert_eq!(record.year, Some(2020));
        assert_eq!(record.raw_venue, "ICPE");
        assert_eq!(record.doi.as_deref(), Some("10.1145/3358960.3379123"));
        assert_eq!(
            record.authors,
            vec![
                AuthorRef {
                    name: "Laurens Versluis".to_string(),
                    orcid: Some("0000-0001-7058-6277".to_string()),
                    position: Some(1),
                },
                AuthorRef {
                    name: "Jörg Müller".to_string(),
                    orcid: None,
                    position: Some(2),
                },
            ]
        );
    }

    #[test]
    fn test_journal_venue_and_synthetic_keys() {
        let xml = r#"<dblp>
<article><title>First</title><year>2001</year><journal>TPDS</journal><volume>12</volume></article>
<article><title>Second</title><year>2002</year><journal>TPDS</journal></article>
</dblp>"#;
        let records: Vec<IncomingRecord> = parse(xml).into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(records[0].source_key, "id0");
        assert_eq!(records[1].source_key, "id1");
        assert_eq!(records[0].raw_venue, "TPDS");
        assert_eq!(records[0].volume.as_deref(), Some("12"));
    }

    #[test]
    fn test_entries_missing_fields_skipped() {
        let xml = r#"<dblp>
<www key="homepages/x"><author>Someone</author><title>Home Page</title></www>
<article key="a"><title>No year</title><journal>TPDS</journal></article>
<article key="b"><title>No venue</title><year>2001</year></article>
<article key="c"><title>Kept</title><year>2001</year><journal>TPDS</journal></article>
</dblp>"#;
        let records: Vec<IncomingRecord> = parse(xml).into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_key, "c");
    }

    #[test]
    fn test_malformed_xml_fails_file() {
        let xml = "<dblp><article key=\"a\"><title>Broken</journal></article></dblp>";
        let results = parse(xml);

        assert!(results.iter().any(|r| matches!(r, Err(AdapterError::Xml { .. }))));
    }

    #[test]
    fn test_foreign_root_element_fails_file() {
        let xml = "<rss><article key=\"a\"><title>Feed item</title><year>2020</year><journal>TPDS</journal></article></rss>";
        let results = parse(xml);

        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(AdapterError::Malformed(message)) => assert!(message.contains("<rss>")),
            other => panic!("expected a malformed-input error, got {:?}", other.as_ref().map(|r| &r.source_key)),
        }
    }

    #[test]
    fn test_normalize_year() {
        assert_eq!(normalize_year("1998"), Some(1998));
        assert_eq!(normalize_year("92-93"), Some(1992));
        assert_eq!(normalize_year("'12"), Some(2012));
        assert_eq!(normalize_year("20"), Some(1920));
        assert_eq!(normalize_year("n/a"), None);
    }
}
