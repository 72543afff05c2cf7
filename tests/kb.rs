//! End-to-end tests of the knowledge-base operations against a temporary
//! index, using the deterministic hashing embedder.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

use kedro_rag::chunk::chunk_text;
use kedro_rag::config::Config;
use kedro_rag::embedding::{EmbeddingProvider, HashingProvider};
use kedro_rag::error::{KbError, Result};
use kedro_rag::kb::KnowledgeBase;
use kedro_rag::models::{DocumentRecord, Query, SourceKind};
use kedro_rag::store::{KnowledgeStore, PreparedDocument};
use kedro_rag::traits::{ConnectorRegistry, FetchOptions, RecordStream};

const MODEL: &str = "feature-hash-v1";
const DIMS: usize = 128;

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.index.path = dir.join("kb.sqlite");
    config.embedding.dims = Some(DIMS);
    config.embedding.max_retries = 2;
    config.embedding.retry_base_ms = 1;
    config
}

fn kb_with(dir: &Path, embedder: Arc<dyn EmbeddingProvider>) -> KnowledgeBase {
    KnowledgeBase::with_parts(test_config(dir), embedder, ConnectorRegistry::new())
}

fn hashing() -> Arc<dyn EmbeddingProvider> {
    Arc::new(HashingProvider::new(MODEL, DIMS))
}

fn doc(origin: &str, text: &str) -> DocumentRecord {
    DocumentRecord {
        id: format!("docs:{}", origin.to_lowercase().replace(" > ", "--").replace(' ', "-")),
        kind: SourceKind::Documentation,
        origin: origin.to_string(),
        title: origin.rsplit(" > ").next().map(str::to_string),
        text: text.to_string(),
        timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        author: None,
        metadata: serde_json::json!({}),
    }
}

fn chat(channel: &str, ts: i64, author: &str, text: &str) -> DocumentRecord {
    DocumentRecord {
        id: format!("chat:{}:{}.000100", channel, ts),
        kind: SourceKind::Chat,
        origin: channel.to_string(),
        title: Some(text.chars().take(40).collect()),
        text: format!("{}: {}", author, text),
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
        author: Some(author.to_string()),
        metadata: serde_json::json!({ "channel": "kedro-help" }),
    }
}

fn docs_corpus() -> Vec<DocumentRecord> {
    vec![
        doc(
            "Data Catalog",
            "The data catalog registers datasets in catalog.yml so nodes can load and save them.",
        ),
        doc(
            "Nodes",
            "A node wraps a pure Python function with named inputs and outputs.",
        ),
        doc(
            "Nodes > Tags",
            "Tag nodes to run a subset of a pipeline with kedro run --tags.",
        ),
        doc(
            "Node Runners",
            "Runners decide how nodes execute: sequentially, in parallel or with threads.",
        ),
        doc(
            "Deployment",
            "Package a project with kedro package and deploy it to Airflow or Databricks.",
        ),
    ]
}

fn chat_corpus() -> Vec<DocumentRecord> {
    vec![
        chat(
            "C0HELP0001",
            1_700_000_100,
            "Ada",
            "How do I load a dataset from the data catalog inside a notebook?",
        ),
        chat(
            "C0HELP0001",
            1_700_000_200,
            "Grace",
            "My pipeline fails with a missing catalog dataset error",
        ),
    ]
}

fn feed(records: Vec<DocumentRecord>) -> RecordStream<'static> {
    stream::iter(records.into_iter().map(Ok)).boxed()
}

async fn seeded(dir: &Path) -> KnowledgeBase {
    let kb = kb_with(dir, hashing());
    kb.ingest("docs", feed(docs_corpus()), false).await.unwrap();
    kb.ingest("slack", feed(chat_corpus()), false).await.unwrap();
    kb
}

// ============ Incremental ingestion ============

#[tokio::test]
async fn test_reingesting_unchanged_source_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), hashing());

    let first = kb.ingest("docs", feed(docs_corpus()), false).await.unwrap();
    assert_eq!(first.added, 5);
    assert!(first.chunks_written >= 5);

    let second = kb.ingest("docs", feed(docs_corpus()), false).await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 5);
    assert_eq!(second.chunks_written, 0);

    let stats = kb.stats().await.unwrap();
    assert_eq!(stats.documents, 5);
    assert_eq!(stats.state.as_str(), "ready");
}

#[tokio::test]
async fn test_changed_document_replaces_its_chunks() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), hashing());
    kb.ingest("docs", feed(docs_corpus()), false).await.unwrap();

    let mut changed = docs_corpus();
    changed[4].text = "Deploy with Kubernetes using the kedro-docker plugin.".to_string();
    let report = kb.ingest("docs", feed(changed), false).await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 4);

    let view = kb.get_document("docs:deployment").await.unwrap();
    assert!(view.body.contains("Kubernetes"));
    assert!(view.chunks.iter().all(|c| !c.text.contains("Airflow")));

    let hits = kb.query(&Query::new("airflow databricks")).await.unwrap();
    assert!(hits.iter().all(|h| !h.text.contains("Airflow")));
}

#[tokio::test]
async fn test_dry_run_on_absent_index_creates_nothing() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), hashing());

    let report = kb.ingest("docs", feed(docs_corpus()), true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.added, 5);
    assert!(!kb.config().index.path.exists());

    let stats = kb.stats().await.unwrap();
    assert_eq!(stats.state.as_str(), "absent");
    assert_eq!(stats.documents, 0);
}

// ============ Retrieval ============

#[tokio::test]
async fn test_query_ranks_relevant_passage_first() {
    let tmp = TempDir::new().unwrap();
    let kb = seeded(tmp.path()).await;

    let hits = kb
        .query(&Query::new("tag nodes to run a subset of the pipeline"))
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.len() <= 5);
    assert_eq!(hits[0].provenance.document_id, "docs:nodes--tags");
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn test_kind_filter_returns_only_that_kind() {
    let tmp = TempDir::new().unwrap();
    let kb = seeded(tmp.path()).await;

    let hits = kb
        .query(&Query::new("data catalog dataset").with_kind(SourceKind::Chat))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    for hit in &hits {
        assert_eq!(hit.provenance.kind, SourceKind::Chat);
        assert_eq!(hit.provenance.origin, "C0HELP0001");
        assert!(hit.provenance.author.is_some());
    }

    let docs_only = kb
        .query(&Query::new("data catalog dataset").with_kind(SourceKind::Documentation))
        .await
        .unwrap();
    assert!(docs_only
        .iter()
        .all(|h| h.provenance.kind == SourceKind::Documentation));
}

#[tokio::test]
async fn test_origin_filter_matches_whole_path_segments() {
    let tmp = TempDir::new().unwrap();
    let kb = seeded(tmp.path()).await;

    let hits = kb
        .query(&Query::new("nodes").with_origin("Nodes").with_k(50))
        .await
        .unwrap();
    let mut origins: Vec<&str> = hits.iter().map(|h| h.provenance.origin.as_str()).collect();
    origins.sort();
    origins.dedup();
    assert_eq!(origins, vec!["Nodes", "Nodes > Tags"]);

    let none = kb
        .query(&Query::new("nodes").with_origin("Node"))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_query_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    let kb = seeded(tmp.path()).await;
    let q = Query::new("pipeline dataset").with_k(10);

    let a = kb.query(&q).await.unwrap();
    let b = kb.query(&q).await.unwrap();
    let ids = |hits: &[kedro_rag::models::QueryHit]| {
        hits.iter().map(|h| h.chunk_id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&a), ids(&b));
}

#[tokio::test]
async fn test_empty_candidate_set_is_not_an_error() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), hashing());
    kb.ingest("docs", feed(docs_corpus()), false).await.unwrap();

    let hits = kb
        .query(&Query::new("catalog").with_kind(SourceKind::Chat))
        .await
        .unwrap();
    assert!(hits.is_empty());

    let blank = kb.query(&Query::new("   ")).await.unwrap();
    assert!(blank.is_empty());
}

#[tokio::test]
async fn test_k_is_clamped() {
    let tmp = TempDir::new().unwrap();
    let kb = seeded(tmp.path()).await;

    let one = kb.query(&Query::new("kedro").with_k(0)).await.unwrap();
    assert_eq!(one.len(), 1);
    let all = kb.query(&Query::new("kedro").with_k(500)).await.unwrap();
    assert!(all.len() <= kb.config().retrieval.max_k);
}

// ============ Failures ============

/// Hashing embedder that fails on marked texts.
struct FlakyEmbedder {
    inner: HashingProvider,
    transient_left: AtomicUsize,
}

impl FlakyEmbedder {
    fn new(transient_failures: usize) -> Self {
        Self {
            inner: HashingProvider::new(MODEL, DIMS),
            transient_left: AtomicUsize::new(transient_failures),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("OUTAGE")) {
            return Err(KbError::EmbeddingFailed("model returned 500".into()));
        }
        if texts.iter().any(|t| t.contains("FLAKY"))
            && self
                .transient_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(KbError::SourceUnavailable("connection reset".into()));
        }
        self.inner.embed_batch(texts).await
    }
}

#[tokio::test]
async fn test_embedding_outage_is_counted_and_keeps_previous_version() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), Arc::new(FlakyEmbedder::new(0)));
    kb.ingest("docs", feed(docs_corpus()), false).await.unwrap();

    let mut changed = docs_corpus();
    changed[0].text = "OUTAGE while re-embedding the catalog section".to_string();
    changed.push(doc("Hooks", "OUTAGE hooks extend the run lifecycle"));
    let report = kb.ingest("docs", feed(changed), false).await.unwrap();

    assert_eq!(report.embedding_failed(), 2);
    assert_eq!(report.skipped, 4);
    assert_eq!(report.added + report.updated, 0);

    let view = kb.get_document("docs:data-catalog").await.unwrap();
    assert!(view.body.contains("catalog.yml"));
    assert_eq!(
        kb.get_document("docs:hooks").await.unwrap_err().kind(),
        "not_found"
    );
}

#[tokio::test]
async fn test_transient_embedding_failure_is_retried() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), Arc::new(FlakyEmbedder::new(1)));

    let report = kb
        .ingest("docs", feed(vec![doc("Flaky", "FLAKY network section")]), false)
        .await
        .unwrap();
    assert_eq!(report.added, 1);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_source_error_commits_received_batches() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), hashing());

    let items: Vec<Result<DocumentRecord>> = vec![
        Ok(chat_corpus().remove(0)),
        Err(KbError::RateLimited {
            message: "conversations.history: HTTP 429".into(),
            retry_after: Some(30),
        }),
    ];
    let err = kb
        .ingest("slack", stream::iter(items).boxed(), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "rate_limited");

    let stats = kb.stats().await.unwrap();
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.state.as_str(), "ready");
    let run = stats.last_run.expect("run recorded");
    assert_eq!(run.status, "aborted");
}

#[tokio::test]
async fn test_missing_index_is_unavailable() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), hashing());

    let err = kb.query(&Query::new("catalog")).await.unwrap_err();
    assert_eq!(err.kind(), "index_unavailable");
    assert_eq!(
        kb.get_document("docs:nodes").await.unwrap_err().kind(),
        "index_unavailable"
    );
    assert!(kb.list_sources().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_corrupt_index_is_unavailable_until_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    std::fs::write(&config.index.path, b"this is not a sqlite database at all").unwrap();
    let kb = kb_with(tmp.path(), hashing());

    let err = kb.query(&Query::new("catalog")).await.unwrap_err();
    assert_eq!(err.kind(), "index_unavailable");
    assert_eq!(kb.stats().await.unwrap_err().kind(), "index_unavailable");

    let reports = kb.rebuild().await.unwrap();
    assert!(reports.is_empty());

    kb.ingest("docs", feed(docs_corpus()), false).await.unwrap();
    assert!(!kb.query(&Query::new("catalog")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_embedding_model_change_requires_rebuild() {
    let tmp = TempDir::new().unwrap();
    {
        let kb = seeded(tmp.path()).await;
        kb.shutdown().await;
    }

    let other: Arc<dyn EmbeddingProvider> = Arc::new(HashingProvider::new("other-model", 64));
    let kb = kb_with(tmp.path(), other);
    let err = kb.query(&Query::new("catalog")).await.unwrap_err();
    assert_eq!(err.kind(), "index_unavailable");

    let err = kb
        .ingest("docs", feed(docs_corpus()), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "index_unavailable");
}

#[tokio::test]
async fn test_unknown_source_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let kb = kb_with(tmp.path(), hashing());
    let err = kb
        .ingest_source("confluence", FetchOptions::default(), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(err.to_string().contains("confluence"));
}

#[tokio::test]
async fn test_purge_removes_one_source() {
    let tmp = TempDir::new().unwrap();
    let kb = seeded(tmp.path()).await;

    let purged = kb.purge(Some("slack")).await.unwrap();
    assert_eq!(purged.documents_removed, 2);

    let hits = kb
        .query(&Query::new("catalog dataset").with_kind(SourceKind::Chat))
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert_eq!(kb.stats().await.unwrap().documents, 5);

    let all = kb.purge(None).await.unwrap();
    assert_eq!(all.documents_removed, 5);
    assert_eq!(kb.stats().await.unwrap().chunks, 0);
}

// ============ Concurrency ============

/// Blocks the first embedding of a text marked `GATE` until released.
struct GateEmbedder {
    inner: HashingProvider,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl EmbeddingProvider for GateEmbedder {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains("GATE")) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.embed_batch(texts).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queries_see_pre_ingestion_snapshot_during_ingestion() {
    let tmp = TempDir::new().unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let embedder = Arc::new(GateEmbedder {
        inner: HashingProvider::new(MODEL, DIMS),
        entered: entered.clone(),
        release: release.clone(),
    });

    let mut config = test_config(tmp.path());
    config.ingest.batch_size = 1;
    let kb = Arc::new(KnowledgeBase::with_parts(
        config,
        embedder,
        ConnectorRegistry::new(),
    ));
    kb.ingest("docs", feed(docs_corpus()), false).await.unwrap();

    let writer = {
        let kb = kb.clone();
        tokio::spawn(async move {
            let records = vec![
                doc("Hooks", "Hooks extend the kedro run lifecycle with plugins."),
                doc(
                    "Deployment",
                    "Package a project with kedro package and deploy it to Kubernetes.",
                ),
                doc("Slow Section", "GATE this section embeds slowly."),
            ];
            kb.ingest("docs", feed(records), false).await
        })
    };
    // Two batches are committed by the time the third one blocks.
    entered.notified().await;

    let hits = kb
        .query(&Query::new("hooks lifecycle plugins").with_k(50))
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.provenance.document_id != "docs:hooks"));
    assert!(matches!(
        kb.get_document("docs:hooks").await,
        Err(KbError::NotFound(_))
    ));
    let deployment = kb.get_document("docs:deployment").await.unwrap();
    assert!(deployment.body.contains("Airflow"));
    let stats = kb.stats().await.unwrap();
    assert_eq!(stats.state.as_str(), "building");
    assert_eq!(stats.documents, 5);

    let err = kb
        .ingest("docs", feed(docs_corpus()), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ingestion_in_progress");

    release.notify_one();
    let report = writer.await.unwrap().unwrap();
    assert_eq!(report.added, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.batches_committed, 3);

    let stats = kb.stats().await.unwrap();
    assert_eq!(stats.state.as_str(), "ready");
    assert_eq!(stats.documents, 7);
    let hits = kb
        .query(&Query::new("hooks lifecycle plugins").with_k(1))
        .await
        .unwrap();
    assert_eq!(hits[0].provenance.document_id, "docs:hooks");
    let deployment = kb.get_document("docs:deployment").await.unwrap();
    assert!(deployment.body.contains("Kubernetes"));
    assert!(!deployment.body.contains("Airflow"));
}

#[tokio::test]
async fn test_interrupted_run_is_published_by_next_writer() {
    let tmp = TempDir::new().unwrap();
    let kb = seeded(tmp.path()).await;

    // A writer that died after committing one batch.
    {
        let path = test_config(tmp.path()).index.path;
        let store = KnowledgeStore::open_writer(&path).await.unwrap();
        let record = doc("Hooks", "Hooks extend the kedro run lifecycle with plugins.");
        let chunks = chunk_text(&record.id, &record.text, 256, 32);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = HashingProvider::new(MODEL, DIMS)
            .embed_batch(&texts)
            .await
            .unwrap();
        let prepared = PreparedDocument {
            content_hash: record.content_hash(),
            record,
            chunks,
            vectors,
        };
        store.commit_batch("docs", &[prepared]).await.unwrap();
        store.close().await;
    }
    assert!(kb.get_document("docs:hooks").await.is_err());

    let report = kb.ingest("slack", feed(chat_corpus()), false).await.unwrap();
    assert_eq!(report.skipped, 2);
    let hooks = kb.get_document("docs:hooks").await.unwrap();
    assert_eq!(hooks.source, "docs");
    assert_eq!(kb.stats().await.unwrap().documents, 8);
}
