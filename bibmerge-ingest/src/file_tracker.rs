//! File-Dedup Tracker
//!
//! A corpus file is identified by the SHA-256 of its raw bytes. Hashes of
//! fully processed files live in `parsed_files`; a file whose hash is already
//! there is skipped, so re-running over an unchanged directory costs only the
//! hashing. Hash collisions are not mitigated.

use bibmerge_common::{Error, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::debug;

/// Hashing read size
const HASH_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum FileCheck {
    /// Same bytes were fully processed before
    AlreadyProcessed { hash: String },
    /// Not seen yet; record `hash` once processing succeeds
    Pending { hash: String },
}

impl FileCheck {
    pub fn hash(&self) -> &str {
        match self {
            FileCheck::AlreadyProcessed { hash } | FileCheck::Pending { hash } => hash,
        }
    }
}

pub struct FileTracker {
    db: SqlitePool,
}

impl FileTracker {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// SHA-256 of the file contents, hex encoded
    pub async fn calculate_hash(file_path: &Path) -> Result<String> {
        let path_buf = file_path.to_path_buf();
        debug!(path = %path_buf.display(), "Calculating SHA-256 hash");

        // Hashing is CPU and IO bound; keep it off the async workers
        let hash = tokio::task::spawn_blocking(move || -> Result<String> {
            use std::fs::File;
            use std::io::Read;

            let mut file = File::open(&path_buf).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to open {} for hashing: {}", path_buf.display(), e),
                ))
            })?;

            let mut hasher = Sha256::new();
            let mut buffer = vec![0u8; HASH_CHUNK];

            loop {
                let bytes_read = file.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                hasher.update(&buffer[..bytes_read]);
            }

            Ok(format!("{:x}", hasher.finalize()))
        })
        .await
        .map_err(|e| Error::Internal(format!("Hash calculation task failed: {}", e)))??;

        Ok(hash)
    }

    pub async fn is_hash_processed(&self, hash: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM parsed_files WHERE hash = ?)")
                .bind(hash)
                .fetch_one(&self.db)
                .await?;

        Ok(exists)
    }

    pub async fn check(&self, file_path: &Path) -> Result<FileCheck> {
        let hash = Self::calculate_hash(file_path).await?;

        if self.is_hash_processed(&hash).await? {
            debug!(path = %file_path.display(), hash = %hash, "File already processed");
            Ok(FileCheck::AlreadyProcessed { hash })
        } else {
            Ok(FileCheck::Pending { hash })
        }
    }

    pub async fn should_process(&self, file_path: &Path) -> Result<bool> {
        Ok(matches!(self.check(file_path).await?, FileCheck::Pending { .. }))
    }

    /// Hash the file and record it as processed
    pub async fn mark_processed(&self, file_path: &Path) -> Result<String> {
        let hash = Self::calculate_hash(file_path).await?;
        let path = file_path.display().to_string();
        self.mark_hash_processed(&hash, Some(&path)).await?;
        Ok(hash)
    }

    /// Record a hash computed earlier; recording twice is a no-op
    pub async fn mark_hash_processed(&self, hash: &str, path: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO parsed_files (hash, path, parsed_at) VALUES (?, ?, ?) ON CONFLICT(hash) DO NOTHING",
        )
        .bind(hash)
        .bind(path)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        debug!(hash = %hash, "Recorded processed file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibmerge_common::db::init_memory_database;

    #[tokio::test]
    async fn test_calculate_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aminer_papers_0.txt");
        std::fs::write(&path, b"test content").unwrap();

        let hash = FileTracker::calculate_hash(&path).await.unwrap();

        assert_eq!(hash, format!("{:x}", Sha256::digest(b"test content")));
    }

    #[tokio::test]
    async fn test_check_then_mark() {
        let pool = init_memory_database().await.unwrap();
        let tracker = FileTracker::new(pool);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s2-corpus-000");
        std::fs::write(&path, b"{}\n").unwrap();

        let check = tracker.check(&path).await.unwrap();
        assert!(matches!(check, FileCheck::Pending { .. }));

        tracker.mark_hash_processed(check.hash(), None).await.unwrap();
        assert!(!tracker.should_process(&path).await.unwrap());

        // Recording the same hash again is harmless
        tracker.mark_processed(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_identical_bytes_under_new_name_are_skipped() {
        let pool = init_memory_database().await.unwrap();
        let tracker = FileTracker::new(pool);
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("mag_papers_0.txt");
        let copy = dir.path().join("mag_papers_0_copy.txt");
        std::fs::write(&first, b"same bytes").unwrap();
        std::fs::write(&copy, b"same bytes").unwrap();

        tracker.mark_processed(&first).await.unwrap();

        assert!(!tracker.should_process(&copy).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let pool = init_memory_database().await.unwrap();
        let tracker = FileTracker::new(pool);

        let result = tracker.check(Path::new("/nonexistent/dblp.xml")).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
