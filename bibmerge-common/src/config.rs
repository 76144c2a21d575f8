//! Configuration loading and resolution
//!
//! Settings are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (parsed together with the command line)
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default name of the merged database file inside the data folder
pub const DEFAULT_DATABASE_FILE: &str = "bibmerge.db";

/// Bootstrap configuration loaded from TOML file
///
/// Every field is optional. Missing values fall back to compiled defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Path to the merged SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Root directory of the corpus files
    #[serde(default)]
    pub corpus_root: Option<PathBuf>,

    /// TOML table of canonical venue codes and their raw aliases
    #[serde(default)]
    pub venue_table: Option<PathBuf>,

    /// Directory receiving the unknown-venue report
    #[serde(default)]
    pub report_dir: Option<PathBuf>,

    /// Directory holding per-worker shard databases
    #[serde(default)]
    pub shard_dir: Option<PathBuf>,

    /// Number of parallel shard workers (1 = sequential ingestion)
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Load configuration file
    ///
    /// An explicitly requested file must exist. Without one, the platform
    /// default location is tried and an absent file yields empty defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("No config file found, using compiled defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        info!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&content)
    }
}

/// Values supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub corpus_root: Option<PathBuf>,
    pub venue_table: Option<PathBuf>,
    pub report_dir: Option<PathBuf>,
    pub shard_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub log_level: Option<String>,
}

/// Fully resolved run configuration
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub database_path: PathBuf,
    pub corpus_root: PathBuf,
    pub venue_table: Option<PathBuf>,
    pub report_dir: PathBuf,
    pub shard_dir: PathBuf,
    pub jobs: usize,
    pub log_level: String,
}

impl IngestConfig {
    /// Merge overrides on top of the TOML file and compiled defaults
    pub fn resolve(overrides: Overrides, file: TomlConfig) -> Result<Self> {
        let corpus_root = overrides
            .corpus_root
            .or(file.corpus_root)
            .ok_or_else(|| Error::Config("No corpus root configured".to_string()))?;

        let data_dir = default_data_dir();
        let database_path = overrides
            .database_path
            .or(file.database_path)
            .unwrap_or_else(|| data_dir.join(DEFAULT_DATABASE_FILE));

        let jobs = overrides.jobs.or(file.jobs).unwrap_or(1);
        if jobs == 0 {
            return Err(Error::Config("jobs must be at least 1".to_string()));
        }

        Ok(Self {
            shard_dir: overrides
                .shard_dir
                .or(file.shard_dir)
                .unwrap_or_else(|| data_dir.join("shards")),
            report_dir: overrides
                .report_dir
                .or(file.report_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            venue_table: overrides.venue_table.or(file.venue_table),
            log_level: overrides.log_level.unwrap_or(file.logging.level),
            database_path,
            corpus_root,
            jobs,
        })
    }
}

/// Platform default configuration file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bibmerge").join("config.toml"))
}

/// Get OS-dependent default data folder
fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("bibmerge"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/bibmerge"))
    } else {
        dirs::data_dir()
            .map(|d| d.join("bibmerge"))
            .unwrap_or_else(|| PathBuf::from("./bibmerge_data"))
    }
}
