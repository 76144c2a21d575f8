//! bibmerge-ingest library interface
//!
//! Reads bibliographic corpus dumps (DBLP XML, Aminer/MAG and Semantic
//! Scholar JSON lines) and merges them into one deduplicated SQLite store.
//! Exposed as a library for integration testing; the `bibmerge-ingest`
//! binary is a thin CLI over [`driver::run_ingest`].

pub mod adapters;
pub mod authors;
pub mod citations;
pub mod derived;
pub mod driver;
pub mod error;
pub mod file_tracker;
pub mod merge;
pub mod sanitize;
pub mod shards;
pub mod venues;

pub use crate::error::{AdapterError, AdapterResult};
pub use crate::merge::{MergeEngine, MergeOutcome, MergeReport, MergeRun};
