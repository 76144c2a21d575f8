//! File-level adapter errors
//!
//! Individual bad records never surface here; adapters log and skip them.
//! An `AdapterError` means the whole file failed.

use thiserror::Error;

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },

    #[error("Malformed input: {0}")]
    Malformed(String),
}
