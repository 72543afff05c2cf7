//! SQLite-backed knowledge store.
//!
//! [`KnowledgeStore`] owns every statement that touches the index file:
//! document hashes for change detection, batch commits, the writer lease,
//! the `Absent → Building → Ready` state, ingestion run records, purge, and
//! document retrieval. Ranking lives in [`crate::search`].
//!
//! A batch commit is one transaction into the staging tables, so progress
//! survives a failed run without being visible to readers. [`publish`]
//! then swaps every staged document into the live tables in one
//! transaction: readers see the index as it was before the run until the
//! run ends, and never a mix of old and new chunks for one document.
//!
//! [`publish`]: KnowledgeStore::publish

use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::db;
use crate::embedding::vec_to_blob;
use crate::error::{is_corruption, KbError, Result};
use crate::migrate::{self, SCHEMA_VERSION};
use crate::models::{format_ts_iso, Chunk, DocumentRecord, IngestionReport};

/// Lifecycle of the persisted index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Absent,
    Building,
    Ready,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Absent => "absent",
            IndexState::Building => "building",
            IndexState::Ready => "ready",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "building" => IndexState::Building,
            "ready" => IndexState::Ready,
            _ => IndexState::Absent,
        }
    }
}

/// A changed document with its chunks already embedded, ready to commit.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub record: DocumentRecord,
    pub content_hash: String,
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub seq: i64,
    pub text: String,
}

/// A stored document with its chunks, as returned by `get`.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub id: String,
    pub kind: String,
    pub source: String,
    pub origin: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub timestamp: String,
    pub ingested_at: String,
    pub content_hash: String,
    pub metadata: serde_json::Value,
    pub body: String,
    pub chunks: Vec<ChunkView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub source: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub report: Option<serde_json::Value>,
}

pub struct KnowledgeStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl KnowledgeStore {
    /// Open for writing, creating the file and schema when absent.
    pub async fn open_writer(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        if let Err(e) = migrate::run_migrations(&pool).await {
            pool.close().await;
            return Err(match e {
                KbError::IndexUnavailable(_) => e,
                other => KbError::IndexUnavailable(format!(
                    "index at {} is unusable: {}",
                    path.display(),
                    other
                )),
            });
        }
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing index for reading and verify its schema version.
    pub async fn open_reader(path: &Path) -> Result<Self> {
        let pool = db::open_existing(path).await?;
        let version: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT value FROM kb_meta WHERE key = 'schema_version'")
                .fetch_optional(&pool)
                .await;

        let problem = match version {
            Ok(Some(v)) if v == SCHEMA_VERSION.to_string() => None,
            Ok(Some(v)) => Some(format!("schema version {} is not supported", v)),
            Ok(None) => Some("schema version is missing".to_string()),
            Err(e) => Some(format!("unreadable ({})", e)),
        };

        if let Some(problem) = problem {
            pool.close().await;
            return Err(KbError::IndexUnavailable(format!(
                "index at {} is {}; rebuild it with `kedro-rag rebuild`",
                path.display(),
                problem
            )));
        }

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    // ============ Metadata ============

    async fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM kb_meta WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kb_meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn state(&self) -> Result<IndexState> {
        Ok(self
            .meta("state")
            .await?
            .map(|s| IndexState::parse(&s))
            .unwrap_or(IndexState::Absent))
    }

    pub async fn set_state(&self, state: IndexState) -> Result<()> {
        self.set_meta("state", state.as_str()).await
    }

    /// Model name and dimensionality the stored vectors were built with.
    pub async fn embedding_fingerprint(&self) -> Result<Option<(String, usize)>> {
        let model = self.meta("embedding_model").await?;
        let dims = self.meta("embedding_dims").await?;
        Ok(match (model, dims) {
            (Some(m), Some(d)) => Some((m, d.parse().unwrap_or(0))),
            _ => None,
        })
    }

    /// Fail unless the index is empty or was built with `model`/`dims`.
    pub async fn check_embedding(&self, model: &str, dims: usize) -> Result<()> {
        if let Some((stored_model, stored_dims)) = self.embedding_fingerprint().await? {
            if stored_model != model || stored_dims != dims {
                return Err(KbError::IndexUnavailable(format!(
                    "index was built with embedding model {} ({} dims) but {} ({} dims) is configured; \
                     rebuild the index",
                    stored_model, stored_dims, model, dims
                )));
            }
        }
        Ok(())
    }

    /// Like [`check_embedding`](Self::check_embedding), recording the
    /// fingerprint when the index has none yet.
    pub async fn ensure_embedding(&self, model: &str, dims: usize) -> Result<()> {
        self.check_embedding(model, dims).await?;
        if self.embedding_fingerprint().await?.is_none() {
            self.set_meta("embedding_model", model).await?;
            self.set_meta("embedding_dims", &dims.to_string()).await?;
        }
        Ok(())
    }

    // ============ Writer lease ============

    /// Take the single-writer lease or fail with `IngestionInProgress`.
    ///
    /// An expired lease (crashed writer) is taken over.
    pub async fn acquire_lease(&self, holder: &str, ttl_secs: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM writer_lease WHERE expires_at < ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            "INSERT INTO writer_lease (id, holder, acquired_at, expires_at) VALUES (1, ?, ?, ?) \
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(holder)
        .bind(now)
        .bind(now + ttl_secs as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            return Ok(());
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT holder FROM writer_lease WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await?;
        tx.rollback().await?;
        Err(KbError::IngestionInProgress {
            holder: current.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Extend a held lease. Fails if another writer took it over.
    pub async fn renew_lease(&self, holder: &str, ttl_secs: u64) -> Result<()> {
        let expires = chrono::Utc::now().timestamp() + ttl_secs as i64;
        let updated = sqlx::query("UPDATE writer_lease SET expires_at = ? WHERE id = 1 AND holder = ?")
            .bind(expires)
            .bind(holder)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 1 {
            Ok(())
        } else {
            Err(KbError::IngestionInProgress {
                holder: "another writer (lease expired)".to_string(),
            })
        }
    }

    pub async fn release_lease(&self, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM writer_lease WHERE id = 1 AND holder = ?")
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============ Documents ============

    /// Content hashes for the given document ids; a staged version wins.
    pub async fn document_hashes(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let mut hashes = HashMap::with_capacity(ids.len());
        if ids.is_empty() {
            return Ok(hashes);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        // Later tables win, so a staged hash shadows the published one.
        for table in ["documents", "staged_documents"] {
            let sql = format!(
                "SELECT id, content_hash FROM {} WHERE id IN ({})",
                table, placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                hashes.insert(row.get("id"), row.get("content_hash"));
            }
        }
        Ok(hashes)
    }

    /// Stage every document in `docs` in one transaction.
    ///
    /// Staged documents are durable but invisible to readers until
    /// [`publish`](Self::publish). Returns the number of chunks written.
    pub async fn commit_batch(&self, source: &str, docs: &[PreparedDocument]) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let mut written = 0u64;
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            let record = &doc.record;
            if doc.chunks.len() != doc.vectors.len() {
                return Err(KbError::EmbeddingFailed(format!(
                    "{}: {} chunks but {} vectors",
                    record.id,
                    doc.chunks.len(),
                    doc.vectors.len()
                )));
            }

            sqlx::query("DELETE FROM staged_vectors WHERE document_id = ?")
                .bind(&record.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM staged_chunks WHERE document_id = ?")
                .bind(&record.id)
                .execute(&mut *tx)
                .await?;

            let metadata_json =
                serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".to_string());
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO staged_documents (id, kind, source, origin, title, author,
                                                         timestamp, body, metadata_json,
                                                         content_hash, ingested_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.id)
            .bind(record.kind.as_str())
            .bind(source)
            .bind(&record.origin)
            .bind(&record.title)
            .bind(&record.author)
            .bind(record.timestamp.timestamp())
            .bind(&record.text)
            .bind(&metadata_json)
            .bind(&doc.content_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            for (chunk, vector) in doc.chunks.iter().zip(&doc.vectors) {
                sqlx::query(
                    "INSERT INTO staged_chunks (id, document_id, seq, text, hash) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(chunk.seq)
                .bind(&chunk.text)
                .bind(&chunk.hash)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO staged_vectors (chunk_id, document_id, kind, origin, timestamp, embedding)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&chunk.id)
                .bind(&record.id)
                .bind(record.kind.as_str())
                .bind(&record.origin)
                .bind(record.timestamp.timestamp())
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;

                written += 1;
            }
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Move every staged document into the live tables in one transaction.
    ///
    /// Each staged document replaces its published version and chunks.
    /// Returns the number of documents published.
    pub async fn publish(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let staged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staged_documents")
            .fetch_one(&mut *tx)
            .await?;
        if staged == 0 {
            return Ok(0);
        }

        for sql in [
            "DELETE FROM chunk_vectors WHERE document_id IN (SELECT id FROM staged_documents)",
            "DELETE FROM chunks WHERE document_id IN (SELECT id FROM staged_documents)",
            "DELETE FROM documents WHERE id IN (SELECT id FROM staged_documents)",
            "INSERT INTO documents (id, kind, source, origin, title, author, timestamp, body, \
             metadata_json, content_hash, ingested_at) \
             SELECT id, kind, source, origin, title, author, timestamp, body, \
             metadata_json, content_hash, ingested_at FROM staged_documents",
            "INSERT INTO chunks (id, document_id, seq, text, hash) \
             SELECT id, document_id, seq, text, hash FROM staged_chunks",
            "INSERT INTO chunk_vectors (chunk_id, document_id, kind, origin, timestamp, embedding) \
             SELECT chunk_id, document_id, kind, origin, timestamp, embedding FROM staged_vectors",
            "DELETE FROM staged_vectors",
            "DELETE FROM staged_chunks",
            "DELETE FROM staged_documents",
        ] {
            sqlx::query(sql).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(staged as u64)
    }

    /// Number of documents committed but not yet published.
    pub async fn staged_count(&self) -> Result<u64> {
        let staged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staged_documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(staged as u64)
    }

    /// Delete every document of `source` (all sources when `None`).
    ///
    /// Returns the number of documents removed.
    pub async fn purge(&self, source: Option<&str>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = match source {
            Some(source) => {
                sqlx::query(
                    "DELETE FROM chunk_vectors WHERE document_id IN \
                     (SELECT id FROM documents WHERE source = ?)",
                )
                .bind(source)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "DELETE FROM chunks WHERE document_id IN \
                     (SELECT id FROM documents WHERE source = ?)",
                )
                .bind(source)
                .execute(&mut *tx)
                .await?;
                for sql in [
                    "DELETE FROM staged_vectors WHERE document_id IN \
                     (SELECT id FROM staged_documents WHERE source = ?)",
                    "DELETE FROM staged_chunks WHERE document_id IN \
                     (SELECT id FROM staged_documents WHERE source = ?)",
                    "DELETE FROM staged_documents WHERE source = ?",
                ] {
                    sqlx::query(sql).bind(source).execute(&mut *tx).await?;
                }
                sqlx::query("DELETE FROM documents WHERE source = ?")
                    .bind(source)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
            None => {
                sqlx::query("DELETE FROM chunk_vectors")
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
                for sql in [
                    "DELETE FROM staged_vectors",
                    "DELETE FROM staged_chunks",
                    "DELETE FROM staged_documents",
                ] {
                    sqlx::query(sql).execute(&mut *tx).await?;
                }
                sqlx::query("DELETE FROM documents")
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
        };
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<DocumentView>> {
        let row = sqlx::query(
            "SELECT id, kind, source, origin, title, author, timestamp, ingested_at, \
             content_hash, metadata_json, body FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let metadata_json: String = row.get("metadata_json");
        let metadata = serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({}));

        let chunks = sqlx::query("SELECT seq, text FROM chunks WHERE document_id = ? ORDER BY seq ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| ChunkView {
                seq: r.get("seq"),
                text: r.get("text"),
            })
            .collect();

        Ok(Some(DocumentView {
            id: row.get("id"),
            kind: row.get("kind"),
            source: row.get("source"),
            origin: row.get("origin"),
            title: row.get("title"),
            author: row.get("author"),
            timestamp: format_ts_iso(row.get("timestamp")),
            ingested_at: format_ts_iso(row.get("ingested_at")),
            content_hash: row.get("content_hash"),
            metadata,
            body: row.get("body"),
            chunks,
        }))
    }

    // ============ Ingestion runs ============

    pub async fn start_run(&self, source: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO ingest_runs (id, source, started_at, status) VALUES (?, ?, ?, 'running')",
        )
        .bind(&id)
        .bind(source)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn finish_run(&self, id: &str, status: &str, report: &IngestionReport) -> Result<()> {
        let report_json = serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string());
        sqlx::query(
            "UPDATE ingest_runs SET finished_at = ?, status = ?, report_json = ? WHERE id = ?",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(status)
        .bind(report_json)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent run, optionally for one source.
    pub async fn last_run(&self, source: Option<&str>) -> Result<Option<RunSummary>> {
        let row = match source {
            Some(s) => {
                sqlx::query(
                    "SELECT id, source, status, started_at, finished_at, report_json \
                     FROM ingest_runs WHERE source = ? ORDER BY started_at DESC, rowid DESC LIMIT 1",
                )
                .bind(s)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, source, status, started_at, finished_at, report_json \
                     FROM ingest_runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row.map(|r| {
            let finished: Option<i64> = r.get("finished_at");
            let report_json: Option<String> = r.get("report_json");
            RunSummary {
                id: r.get("id"),
                source: r.get("source"),
                status: r.get("status"),
                started_at: format_ts_iso(r.get("started_at")),
                finished_at: finished.map(format_ts_iso),
                report: report_json.and_then(|j| serde_json::from_str(&j).ok()),
            }
        }))
    }

    /// `PRAGMA quick_check`.
    ///
    /// `Ok(false)` means the file is damaged: the pragma reported problems
    /// or SQLite refused the file as corrupt or not a database. Any other
    /// failure to run the check is returned as an error.
    pub async fn quick_check(&self) -> Result<bool> {
        match sqlx::query_scalar::<_, String>("PRAGMA quick_check")
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => Ok(rows.len() == 1 && rows[0] == "ok"),
            Err(e) if is_corruption(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::models::SourceKind;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn prepared(id: &str, text: &str) -> PreparedDocument {
        let record = DocumentRecord {
            id: id.to_string(),
            kind: SourceKind::Documentation,
            origin: "Intro".to_string(),
            title: Some("Intro".to_string()),
            text: text.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            author: None,
            metadata: serde_json::json!({}),
        };
        let chunks = chunk_text(id, text, 8, 0);
        let vectors = chunks.iter().map(|_| vec![1.0, 0.0]).collect();
        PreparedDocument {
            content_hash: record.content_hash(),
            record,
            chunks,
            vectors,
        }
    }

    #[tokio::test]
    async fn test_commit_replaces_chunks() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();

        let long = "one two three four five six.\n\nseven eight nine ten eleven.\n\ntwelve.";
        let written = store.commit_batch("docs", &[prepared("docs:intro", long)]).await.unwrap();
        assert!(written > 1);
        store.publish().await.unwrap();

        store
            .commit_batch("docs", &[prepared("docs:intro", "short")])
            .await
            .unwrap();
        store.publish().await.unwrap();
        let doc = store.get_document("docs:intro").await.unwrap().unwrap();
        assert_eq!(doc.chunks.len(), 1);
        assert_eq!(doc.body, "short");

        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(vectors, 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_staged_batches_are_hidden_until_published() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        store.commit_batch("docs", &[prepared("docs:intro", "old text")]).await.unwrap();
        store.publish().await.unwrap();

        let changed = prepared("docs:intro", "new text");
        let new_hash = changed.content_hash.clone();
        store.commit_batch("docs", &[changed]).await.unwrap();
        store.commit_batch("docs", &[prepared("docs:extra", "more")]).await.unwrap();
        assert_eq!(store.staged_count().await.unwrap(), 2);

        // Readers still see the published version.
        let doc = store.get_document("docs:intro").await.unwrap().unwrap();
        assert_eq!(doc.body, "old text");
        assert!(store.get_document("docs:extra").await.unwrap().is_none());

        // Change detection sees the staged one.
        let hashes = store
            .document_hashes(&["docs:intro".to_string(), "docs:extra".to_string()])
            .await
            .unwrap();
        assert_eq!(hashes["docs:intro"], new_hash);
        assert!(hashes.contains_key("docs:extra"));

        assert_eq!(store.publish().await.unwrap(), 2);
        assert_eq!(store.staged_count().await.unwrap(), 0);
        let doc = store.get_document("docs:intro").await.unwrap().unwrap();
        assert_eq!(doc.body, "new text");
        assert_eq!(doc.chunks.len(), 1);
        assert!(store.get_document("docs:extra").await.unwrap().is_some());
        assert_eq!(store.publish().await.unwrap(), 0);
        store.close().await;
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();

        store.acquire_lease("run-a", 60).await.unwrap();
        let err = store.acquire_lease("run-b", 60).await.unwrap_err();
        match err {
            KbError::IngestionInProgress { holder } => assert_eq!(holder, "run-a"),
            other => panic!("unexpected {:?}", other),
        }
        store.renew_lease("run-a", 60).await.unwrap();
        assert!(store.renew_lease("run-b", 60).await.is_err());

        store.release_lease("run-a").await.unwrap();
        store.acquire_lease("run-b", 60).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO writer_lease (id, holder, acquired_at, expires_at) VALUES (1, 'crashed', 0, 1)",
        )
        .execute(store.pool())
        .await
        .unwrap();
        store.acquire_lease("fresh", 60).await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_embedding_fingerprint_mismatch() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        store.ensure_embedding("feature-hash-v1", 384).await.unwrap();
        store.ensure_embedding("feature-hash-v1", 384).await.unwrap();
        let err = store.check_embedding("text-embedding-3-small", 1536).await.unwrap_err();
        assert_eq!(err.kind(), "index_unavailable");
        store.close().await;
    }

    #[tokio::test]
    async fn test_purge_by_source() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        store.commit_batch("docs", &[prepared("docs:a", "alpha")]).await.unwrap();
        store.commit_batch("slack", &[prepared("chat:b", "beta")]).await.unwrap();
        store.publish().await.unwrap();
        store.commit_batch("docs", &[prepared("docs:c", "gamma")]).await.unwrap();

        assert_eq!(store.purge(Some("docs")).await.unwrap(), 1);
        assert_eq!(store.staged_count().await.unwrap(), 0);
        assert!(store.get_document("docs:a").await.unwrap().is_none());
        assert!(store.get_document("chat:b").await.unwrap().is_some());
        assert_eq!(store.purge(None).await.unwrap(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_state_and_runs() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        assert_eq!(store.state().await.unwrap(), IndexState::Absent);
        store.set_state(IndexState::Building).await.unwrap();
        assert_eq!(store.state().await.unwrap(), IndexState::Building);

        let run = store.start_run("docs").await.unwrap();
        let mut report = IngestionReport::new("docs");
        report.added = 3;
        store.finish_run(&run, "completed", &report).await.unwrap();
        let last = store.last_run(Some("docs")).await.unwrap().unwrap();
        assert_eq!(last.status, "completed");
        assert_eq!(last.report.unwrap()["added"], 3);
        assert!(store.quick_check().await.unwrap());
        store.close().await;
    }

    #[tokio::test]
    async fn test_quick_check_surfaces_errors_it_cannot_classify() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        assert!(store.quick_check().await.unwrap());

        // A closed pool says nothing about the file, so it is not damage.
        store.pool().close().await;
        let err = store.quick_check().await.unwrap_err();
        assert_eq!(err.kind(), "index_unavailable");
    }

    #[tokio::test]
    async fn test_reader_rejects_garbage_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kb.sqlite");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();
        let err = match KnowledgeStore::open_reader(&path).await {
            Err(e) => e,
            Ok(_) => panic!("garbage file opened"),
        };
        assert_eq!(err.kind(), "index_unavailable");
    }
}
