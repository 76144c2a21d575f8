//! Test Helper Utilities
//!
//! Shared utilities for the ingestion integration tests

#![allow(dead_code)]

pub mod corpus;
pub mod db_utils;

pub use corpus::{dblp_document, dblp_entry, json_line, CorpusDir};
pub use db_utils::{count_rows, create_test_workspace, test_venues, TestWorkspace};
