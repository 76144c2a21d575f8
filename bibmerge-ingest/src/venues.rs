//! Venue Resolver seam and the unknown-venue sink
//!
//! Venue normalization itself is an external concern. The merge engine only
//! sees [`VenueResolver`]; the bundled [`VenueTable`] is a TOML alias table:
//!
//! ```toml
//! [venues]
//! ICSE = ["International Conference on Software Engineering", "ICSE (1)"]
//! VLDB = ["Very Large Data Bases", "PVLDB", "Proc. VLDB Endow."]
//! ```
//!
//! Raw strings that do not resolve are reported to an [`UnknownVenueSink`].

use bibmerge_common::{Error, Result};
use chrono::Local;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Maps a raw venue string to a canonical short code
pub trait VenueResolver: Send + Sync {
    fn resolve(&self, raw: &str) -> Option<String>;
}

/// Receives raw venue strings that did not resolve
pub trait UnknownVenueSink: Send + Sync {
    fn record(&self, raw: &str);
}

// ===== Alias table =====

#[derive(Debug, Deserialize)]
struct VenueFile {
    #[serde(default)]
    venues: BTreeMap<String, Vec<String>>,
}

/// Alias table keyed by normalized raw text
#[derive(Debug, Clone, Default)]
pub struct VenueTable {
    aliases: HashMap<String, String>,
}

impl VenueTable {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: VenueFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse venue table failed: {}", e)))?;

        let mut table = Self::default();
        for (code, aliases) in file.venues {
            table.insert(&code, &code);
            for alias in &aliases {
                table.insert(alias, &code);
            }
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Read venue table {} failed: {}", path.display(), e))
        })?;
        let table = Self::from_toml_str(&content)?;
        info!(path = %path.display(), aliases = table.len(), "Loaded venue table");
        Ok(table)
    }

    /// Register `alias` for `code`; a canonical code always resolves to itself
    pub fn insert(&mut self, alias: &str, code: &str) {
        self.aliases.insert(normalize(alias), code.to_string());
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

impl VenueResolver for VenueTable {
    fn resolve(&self, raw: &str) -> Option<String> {
        self.aliases.get(&normalize(raw)).cloned()
    }
}

/// Case-insensitive, whitespace-collapsed
fn normalize(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ===== Histogram =====

/// In-memory occurrence counts of unresolved venue strings
#[derive(Debug, Default)]
pub struct VenueHistogram {
    counts: Mutex<HashMap<String, u64>>,
}

impl VenueHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, raw: &str) -> u64 {
        self.lock().get(raw).copied().unwrap_or(0)
    }

    /// Entries sorted by count descending, then by text
    pub fn sorted(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> =
            self.lock().iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    /// Write `unknown_venues_<timestamp>` into `dir`, one `raw, count` per line
    pub fn write_report(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "unknown_venues_{}",
            Local::now().format("%Y%m%d_%H%M%S")
        ));

        let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        let entries = self.sorted();
        for (raw, count) in &entries {
            writeln!(file, "{}, {}", raw, count)?;
        }
        file.flush()?;

        info!(path = %path.display(), distinct = entries.len(), "Wrote unknown-venue report");
        Ok(path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl UnknownVenueSink for VenueHistogram {
    fn record(&self, raw: &str) {
        *self.lock().entry(raw.to_string()).or_insert(0) += 1;
    }
}
