//! Corpus file builders

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory of corpus files under a temp root
pub struct CorpusDir {
    root: PathBuf,
}

impl CorpusDir {
    pub fn new(root: &Path) -> Self {
        std::fs::create_dir_all(root).unwrap();
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn write_gz(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.join(name);
        let mut encoder = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap();
        path
    }
}

/// One DBLP record element
pub fn dblp_entry(
    element: &str,
    key: &str,
    title: &str,
    year: i64,
    venue: &str,
    volume: Option<&str>,
    authors: &[&str],
) -> String {
    let venue_tag = if element == "article" { "journal" } else { "booktitle" };
    let mut xml = format!("<{} key=\"{}\">", element, key);
    for author in authors {
        xml.push_str(&format!("<author>{}</author>", author));
    }
    xml.push_str(&format!("<title>{}</title><year>{}</year>", title, year));
    if let Some(volume) = volume {
        xml.push_str(&format!("<volume>{}</volume>", volume));
    }
    xml.push_str(&format!("<{0}>{1}</{0}></{2}>", venue_tag, venue, element));
    xml
}

pub fn dblp_document(entries: &[String]) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<dblp>\n{}\n</dblp>\n", entries.join("\n"))
}

pub fn json_line(value: Value) -> String {
    format!("{}\n", value)
}
