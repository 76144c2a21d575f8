//! # bibmerge common library
//!
//! Shared code for the bibmerge ingestion tools:
//! - Error and result types
//! - Bootstrap configuration loading
//! - SQLite initialization, versioned schema migrations and the
//!   persisted schema contract
//! - Row models read back by the merge engine and its consumers

pub mod config;
pub mod db;
pub mod error;

pub use error::{Error, Result};
