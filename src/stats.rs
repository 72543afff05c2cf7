//! Index statistics and health overview.
//!
//! A quick summary of what's indexed: document and chunk counts per source,
//! the embedding model the vectors were built with, the lifecycle state, the
//! last ingestion run, and a few sample chunks. Used by `kedro-rag stats`
//! and the `kb_stats` tool.

use serde::Serialize;
use sqlx::Row;
use std::path::Path;

use crate::config::Config;
use crate::error::Result;
use crate::kb::KnowledgeBase;
use crate::store::{IndexState, KnowledgeStore, RunSummary};

const SAMPLE_CHUNKS: i64 = 3;
const SAMPLE_CHARS: usize = 160;

#[derive(Debug, Clone, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub kind: String,
    pub documents: i64,
    pub chunks: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSample {
    pub chunk_id: String,
    pub origin: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KbStats {
    pub state: IndexState,
    pub path: String,
    pub size_bytes: u64,
    pub embedding_model: Option<String>,
    pub embedding_dims: Option<usize>,
    pub documents: i64,
    pub chunks: i64,
    pub sources: Vec<SourceCount>,
    pub last_run: Option<RunSummary>,
    pub samples: Vec<ChunkSample>,
}

impl KbStats {
    /// Stats for an index that does not exist yet.
    pub fn absent(path: &Path) -> Self {
        Self {
            state: IndexState::Absent,
            path: path.display().to_string(),
            size_bytes: 0,
            embedding_model: None,
            embedding_dims: None,
            documents: 0,
            chunks: 0,
            sources: Vec::new(),
            last_run: None,
            samples: Vec::new(),
        }
    }
}

pub async fn collect_stats(store: &KnowledgeStore) -> Result<KbStats> {
    let pool = store.pool();

    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;

    let sources = sqlx::query(
        r#"
        SELECT d.source, d.kind,
               COUNT(DISTINCT d.id) AS doc_count,
               COUNT(c.id) AS chunk_count
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        GROUP BY d.source, d.kind
        ORDER BY doc_count DESC, d.source ASC
        "#,
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| SourceCount {
        source: row.get("source"),
        kind: row.get("kind"),
        documents: row.get("doc_count"),
        chunks: row.get("chunk_count"),
    })
    .collect();

    let samples = sqlx::query(
        "SELECT c.id, d.origin, c.text FROM chunks c JOIN documents d ON d.id = c.document_id \
         ORDER BY d.ingested_at DESC, c.id ASC LIMIT ?",
    )
    .bind(SAMPLE_CHUNKS)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| {
        let text: String = row.get("text");
        ChunkSample {
            chunk_id: row.get("id"),
            origin: row.get("origin"),
            text: text.chars().take(SAMPLE_CHARS).collect(),
        }
    })
    .collect();

    let fingerprint = store.embedding_fingerprint().await?;
    let size_bytes = std::fs::metadata(store.path()).map(|m| m.len()).unwrap_or(0);

    Ok(KbStats {
        state: store.state().await?,
        path: store.path().display().to_string(),
        size_bytes,
        embedding_model: fingerprint.as_ref().map(|(m, _)| m.clone()),
        embedding_dims: fingerprint.map(|(_, d)| d),
        documents,
        chunks,
        sources,
        last_run: store.last_run(None).await?,
        samples,
    })
}

/// CLI entry point for `kedro-rag stats`.
pub async fn run_stats(config: &Config) -> anyhow::Result<()> {
    let kb = KnowledgeBase::new(config.clone())?;
    let stats = kb.stats().await?;
    kb.shutdown().await;

    println!("Kedro RAG Knowledge Base Stats");
    println!("================================");
    println!();
    println!("  Index:       {}", stats.path);
    println!("  State:       {}", stats.state.as_str());
    println!("  Size:        {}", format_bytes(stats.size_bytes));
    if let (Some(model), Some(dims)) = (&stats.embedding_model, stats.embedding_dims) {
        println!("  Embeddings:  {} ({} dims)", model, dims);
    }
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);

    if !stats.sources.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<12} {:<14} {:>6} {:>8}",
            "SOURCE", "KIND", "DOCS", "CHUNKS"
        );
        println!("  {}", "-".repeat(44));
        for s in &stats.sources {
            println!(
                "  {:<12} {:<14} {:>6} {:>8}",
                s.source, s.kind, s.documents, s.chunks
            );
        }
    }

    if let Some(run) = &stats.last_run {
        println!();
        println!(
            "  Last run:    {} {} ({})",
            run.source, run.status, run.started_at
        );
    }

    if !stats.samples.is_empty() {
        println!();
        println!("  Samples:");
        for s in &stats.samples {
            println!("    [{}] {}", s.origin, s.text.replace('\n', " "));
        }
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn test_stats_on_empty_index() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::open_writer(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        let stats = collect_stats(&store).await.unwrap();
        assert_eq!(stats.state, IndexState::Absent);
        assert_eq!(stats.documents, 0);
        assert!(stats.sources.is_empty());
        assert!(stats.last_run.is_none());
        store.close().await;
    }
}
