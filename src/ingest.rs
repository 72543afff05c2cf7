//! Incremental indexing.
//!
//! Records from a connector stream are processed in batches of
//! `ingest.batch_size`:
//!
//! 1. Duplicate ids within the batch collapse to the last occurrence.
//! 2. Each record's content hash is compared with the stored one:
//!    unchanged → `skipped`, unknown → `added`, different → `updated`.
//! 3. Changed records are chunked and embedded. Embedding is retried on
//!    transient failures; a record whose embedding still fails is reported
//!    as `embedding_failed` and keeps its previous version in the index.
//! 4. The batch is committed in one transaction to the staging tables.
//!
//! The writer lease, when one is held, is renewed after every batch. When
//! the stream ends, every staged batch is published to readers at once.
//!
//! A connector error ends the run after the records already received are
//! committed and published; earlier batches are never rolled back.

use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config, EmbeddingConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, Result};
use crate::kb::KnowledgeBase;
use crate::models::{Chunk, DocumentFailure, DocumentRecord, IngestionReport};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{KnowledgeStore, PreparedDocument};
use crate::traits::{FetchOptions, RecordStream};

/// Result of running a stream through the indexer.
#[derive(Debug)]
pub struct Ingested {
    pub report: IngestionReport,
    /// The connector error that ended the stream early, if any.
    pub source_error: Option<KbError>,
}

/// Writer lease held for the duration of a run.
#[derive(Debug, Clone, Copy)]
pub struct Lease<'a> {
    pub holder: &'a str,
    pub ttl_secs: u64,
}

pub struct Indexer<'a> {
    /// `None` only for a dry run against an index that does not exist yet.
    store: Option<&'a KnowledgeStore>,
    embedder: &'a dyn EmbeddingProvider,
    chunking: &'a ChunkingConfig,
    embedding: &'a EmbeddingConfig,
    batch_size: usize,
    lease: Option<Lease<'a>>,
    dry_run: bool,
}

impl<'a> Indexer<'a> {
    pub fn new(
        store: &'a KnowledgeStore,
        embedder: &'a dyn EmbeddingProvider,
        config: &'a Config,
    ) -> Self {
        Self {
            store: Some(store),
            embedder,
            chunking: &config.chunking,
            embedding: &config.embedding,
            batch_size: config.ingest.batch_size.max(1),
            lease: None,
            dry_run: false,
        }
    }

    /// Count what would change without embedding or writing anything.
    pub fn dry_run(
        store: Option<&'a KnowledgeStore>,
        embedder: &'a dyn EmbeddingProvider,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            embedder,
            chunking: &config.chunking,
            embedding: &config.embedding,
            batch_size: config.ingest.batch_size.max(1),
            lease: None,
            dry_run: true,
        }
    }

    pub fn with_lease(mut self, lease: Lease<'a>) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Consume `records`, updating the index batch by batch.
    ///
    /// Errors are store failures only; connector errors come back in
    /// [`Ingested::source_error`] with the partial report.
    pub async fn ingest(&self, source: &str, records: RecordStream<'_>) -> Result<Ingested> {
        let mut report = IngestionReport::new(source);
        report.dry_run = self.dry_run;
        let mut source_error = None;

        let mut batches = records.chunks(self.batch_size);
        while let Some(batch) = batches.next().await {
            let mut received = Vec::with_capacity(batch.len());
            for item in batch {
                match item {
                    Ok(record) => received.push(record),
                    Err(e) => {
                        source_error = Some(e);
                        break;
                    }
                }
            }

            report.fetched += received.len() as u64;
            self.process_batch(source, received, &mut report).await?;
            if let (Some(store), Some(lease)) = (self.store, self.lease) {
                store.renew_lease(lease.holder, lease.ttl_secs).await?;
            }

            if let Some(e) = &source_error {
                warn!(
                    source,
                    error = %e,
                    batches_committed = report.batches_committed,
                    "source failed, keeping committed batches"
                );
                report.aborted = Some(e.to_string());
                break;
            }
        }

        if let (Some(store), false) = (self.store, self.dry_run) {
            let published = store.publish().await?;
            debug!(source, published, "published staged documents");
        }

        info!(
            source,
            fetched = report.fetched,
            added = report.added,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed.len(),
            chunks = report.chunks_written,
            dry_run = self.dry_run,
            "ingestion finished"
        );

        Ok(Ingested {
            report,
            source_error,
        })
    }

    async fn process_batch(
        &self,
        source: &str,
        batch: Vec<DocumentRecord>,
        report: &mut IngestionReport,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch = dedupe(batch);
        let ids: Vec<String> = batch.iter().map(|r| r.id.clone()).collect();
        let stored = match self.store {
            Some(store) => store.document_hashes(&ids).await?,
            None => HashMap::new(),
        };

        let mut prepared = Vec::new();
        let mut updates = 0u64;

        for record in batch {
            let content_hash = record.content_hash();
            let previous = stored.get(&record.id);
            if previous == Some(&content_hash) {
                report.skipped += 1;
                continue;
            }
            let is_update = previous.is_some();

            if self.dry_run {
                if is_update {
                    report.updated += 1;
                } else {
                    report.added += 1;
                }
                continue;
            }

            let chunks = chunk_text(
                &record.id,
                &record.text,
                self.chunking.max_tokens,
                self.chunking.overlap_tokens,
            );
            match self.embed_chunks(&chunks).await {
                Ok(vectors) => {
                    if is_update {
                        updates += 1;
                    }
                    prepared.push(PreparedDocument {
                        record,
                        content_hash,
                        chunks,
                        vectors,
                    });
                }
                Err(e) => {
                    warn!(document = %record.id, error = %e, "embedding failed, keeping previous version");
                    report.failed.push(DocumentFailure {
                        document_id: record.id,
                        kind: "embedding_failed".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let Some(store) = self.store.filter(|_| !prepared.is_empty()) else {
            return Ok(());
        };

        let written = store.commit_batch(source, &prepared).await?;
        report.updated += updates;
        report.added += prepared.len() as u64 - updates;
        report.chunks_written += written;
        report.batches_committed += 1;
        debug!(source, documents = prepared.len(), chunks = written, "batch committed");
        Ok(())
    }

    /// Embed every chunk of one document, in provider-sized batches.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let policy = RetryPolicy::new(self.embedding.max_retries, self.embedding.retry_base_ms);
        let mut vectors = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.embedding.batch_size.max(1)) {
            let embedded = with_retry(policy, "embed", || self.embedder.embed_batch(batch))
                .await
                .map_err(|e| match e {
                    KbError::EmbeddingFailed(_) => e,
                    other => KbError::EmbeddingFailed(other.to_string()),
                })?;
            if embedded.len() != batch.len() {
                return Err(KbError::EmbeddingFailed(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    embedded.len()
                )));
            }
            if let Some(v) = embedded.iter().find(|v| v.len() != self.embedder.dims()) {
                return Err(KbError::EmbeddingFailed(format!(
                    "expected {} dimensions, got {}",
                    self.embedder.dims(),
                    v.len()
                )));
            }
            vectors.extend(embedded);
        }
        Ok(vectors)
    }
}

/// Keep the last occurrence of each id, in order of those occurrences.
fn dedupe(batch: Vec<DocumentRecord>) -> Vec<DocumentRecord> {
    let mut last: HashMap<String, usize> = HashMap::with_capacity(batch.len());
    for (i, record) in batch.iter().enumerate() {
        last.insert(record.id.clone(), i);
    }
    batch
        .into_iter()
        .enumerate()
        .filter(|(i, r)| last.get(&r.id) == Some(i))
        .map(|(_, r)| r)
        .collect()
}

/// CLI entry point for `kedro-rag sync`.
pub async fn run_sync(
    config: &Config,
    source: &str,
    dry_run: bool,
    days_back: Option<u32>,
    channels: Vec<String>,
) -> anyhow::Result<()> {
    let kb = KnowledgeBase::new(config.clone())?;
    let options = FetchOptions {
        days_back,
        channels: if channels.is_empty() {
            None
        } else {
            Some(channels)
        },
    };

    let names: Vec<String> = if source == "all" {
        kb.connectors()
            .connectors()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    } else {
        vec![source.to_string()]
    };
    if names.is_empty() {
        anyhow::bail!("no sources are configured; add [sources.docs] or [sources.slack] to the settings file");
    }

    for name in names {
        let report = kb.ingest_source(&name, options.clone(), dry_run).await?;
        print_report(&report, &config.index.path);
    }

    kb.shutdown().await;
    Ok(())
}

fn print_report(report: &IngestionReport, index: &Path) {
    if report.dry_run {
        println!("sync {} (dry-run)", report.source);
    } else {
        println!("sync {}", report.source);
    }
    println!("  fetched: {}", report.fetched);
    println!("  added:   {}", report.added);
    println!("  updated: {}", report.updated);
    println!("  skipped: {}", report.skipped);
    if !report.dry_run {
        println!("  chunks written: {}", report.chunks_written);
        println!("  batches committed: {}", report.batches_committed);
    }
    if !report.failed.is_empty() {
        println!("  failed: {}", report.failed.len());
        for f in &report.failed {
            println!("    {} ({}): {}", f.document_id, f.kind, f.message);
        }
    }
    println!("  index: {}", index.display());
    println!("ok");
}
