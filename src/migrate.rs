//! Schema creation for the knowledge-base index.
//!
//! All statements are idempotent; running them against an existing index is
//! a no-op. The schema version is stored in `kb_meta` and checked by readers.

use sqlx::SqlitePool;

use crate::error::{KbError, Result};

pub const SCHEMA_VERSION: i64 = 1;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kb_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per upstream document (doc section, chat thread).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            source TEXT NOT NULL,
            origin TEXT NOT NULL,
            title TEXT,
            author TEXT,
            timestamp INTEGER NOT NULL,
            body TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            content_hash TEXT NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(document_id, seq),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Filter columns are copied from documents; ranking reads only this table.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            origin TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_runs (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL,
            report_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS writer_lease (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Batches committed by a running ingestion land here and are moved into
    // the live tables by one publish transaction at the end of the run.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staged_documents (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            source TEXT NOT NULL,
            origin TEXT NOT NULL,
            title TEXT,
            author TEXT,
            timestamp INTEGER NOT NULL,
            body TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            content_hash TEXT NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staged_chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staged_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            origin TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_staged_chunks_document_id ON staged_chunks(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_staged_vectors_document_id ON staged_vectors(document_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document_id ON chunk_vectors(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_filter ON chunk_vectors(kind, origin)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ingest_runs_started ON ingest_runs(started_at DESC)",
    )
    .execute(pool)
    .await?;

    let existing: Option<String> =
        sqlx::query_scalar("SELECT value FROM kb_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;

    match existing {
        None => {
            sqlx::query("INSERT INTO kb_meta (key, value) VALUES ('schema_version', ?)")
                .bind(SCHEMA_VERSION.to_string())
                .execute(pool)
                .await?;
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(KbError::IndexUnavailable(format!(
                "index schema version {} is not supported (expected {}); rebuild the index",
                v, SCHEMA_VERSION
            )))
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("kb.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let version: String =
            sqlx::query_scalar("SELECT value FROM kb_meta WHERE key = 'schema_version'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(version, "1");
        pool.close().await;
    }

    #[tokio::test]
    async fn test_unknown_schema_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("kb.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        sqlx::query("UPDATE kb_meta SET value = '99' WHERE key = 'schema_version'")
            .execute(&pool)
            .await
            .unwrap();
        let err = run_migrations(&pool).await.unwrap_err();
        assert_eq!(err.kind(), "index_unavailable");
        pool.close().await;
    }
}
