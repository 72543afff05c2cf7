//! SQLite connection setup.
//!
//! Writers go through [`connect`], which creates the file (and its parent
//! directory) on first use. Readers go through [`open_existing`], which never
//! creates anything: a missing or unreadable file is
//! [`KbError::IndexUnavailable`], the signal to rebuild.
//!
//! Both run in WAL mode, so readers keep seeing the last committed snapshot
//! while a writer's transaction is open.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{KbError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KbError::IndexUnavailable(format!(
                    "cannot create index directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let options = options_for(db_path)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

pub async fn open_existing(db_path: &Path) -> Result<SqlitePool> {
    if !db_path.exists() {
        return Err(KbError::IndexUnavailable(format!(
            "no index at {}; run `kedro-rag rebuild` or ingest a source first",
            db_path.display()
        )));
    }

    let options = options_for(db_path)?
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| {
            KbError::IndexUnavailable(format!(
                "cannot open index at {}: {}",
                db_path.display(),
                e
            ))
        })
}

/// Remove the database file and its WAL/SHM side files.
pub fn remove_index_files(db_path: &Path) -> Result<()> {
    let mut candidates = vec![db_path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        candidates.push(name.into());
    }
    for path in candidates {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(KbError::IndexUnavailable(format!(
                    "cannot remove {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
    Ok(())
}

fn options_for(db_path: &Path) -> Result<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(|e| KbError::Configuration(format!("invalid index.path: {}", e)))?;
    Ok(options.busy_timeout(BUSY_TIMEOUT).foreign_keys(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_existing_requires_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing.sqlite");
        let err = open_existing(&path).await.unwrap_err();
        assert_eq!(err.kind(), "index_unavailable");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_connect_creates_parent_and_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/dir/kb.sqlite");
        let pool = connect(&path).await.unwrap();
        pool.close().await;
        assert!(path.exists());

        remove_index_files(&path).unwrap();
        assert!(!path.exists());
        // Idempotent.
        remove_index_files(&path).unwrap();
    }
}
