//! The knowledge-base context object.
//!
//! [`KnowledgeBase`] is built once at startup from the validated [`Config`]
//! and shared (behind an `Arc`) by the CLI, the MCP bridge and the HTTP
//! server. It owns the embedding provider, the connector registry, and a
//! lazily opened read handle on the index.
//!
//! # Lifecycle
//!
//! ```text
//! Absent ──ingest──▶ Building ──ok──▶ Ready ──ingest──▶ Building ...
//!                        │
//!                        └─ fatal error + corrupt file ─▶ Absent
//! ```
//!
//! Only one ingestion writes at a time, across processes: the writer lease
//! in the index file is taken before the state moves to `Building`, and a
//! second ingestion fails with `ingestion_in_progress`. Queries keep using
//! the read handle and see the index as it was before the run: batches are
//! staged as they commit and published together when the run ends,
//! including a run aborted by its source.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connector_slack::{ChannelInfo, SlackConnector};
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{KbError, Result};
use crate::ingest::{Indexer, Lease};
use crate::models::{IngestionReport, Query, QueryHit};
use crate::search;
use crate::sources::{get_sources, SourceStatus};
use crate::stats::{collect_stats, KbStats};
use crate::store::{DocumentView, IndexState, KnowledgeStore};
use crate::traits::{ConnectorRegistry, FetchOptions, RecordStream};

pub struct KnowledgeBase {
    config: Arc<Config>,
    embedder: Arc<dyn EmbeddingProvider>,
    connectors: ConnectorRegistry,
    reader: RwLock<Option<Arc<KnowledgeStore>>>,
}

/// Outcome of `purge`.
#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub source: Option<String>,
    pub documents_removed: u64,
}

impl KnowledgeBase {
    /// Build from configuration: embedding provider and configured sources.
    pub fn new(config: Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let connectors = ConnectorRegistry::from_config(&config)?;
        Ok(Self::with_parts(config, embedder, connectors))
    }

    /// Build from explicit parts.
    pub fn with_parts(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        connectors: ConnectorRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            embedder,
            connectors,
            reader: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    /// Shared read handle, opened on first use.
    async fn reader(&self) -> Result<Arc<KnowledgeStore>> {
        if let Some(store) = self.reader.read().await.as_ref() {
            return Ok(store.clone());
        }

        let mut slot = self.reader.write().await;
        if let Some(store) = slot.as_ref() {
            return Ok(store.clone());
        }
        let store = KnowledgeStore::open_reader(&self.config.index.path).await?;
        store
            .check_embedding(self.embedder.model_name(), self.embedder.dims())
            .await?;
        let store = Arc::new(store);
        *slot = Some(store.clone());
        Ok(store)
    }

    /// Drop the read handle so the next query reopens the file.
    async fn reset_reader(&self) {
        if let Some(store) = self.reader.write().await.take() {
            store.pool().close().await;
        }
    }

    // ============ Operations ============

    /// Configured sources with per-source index counts.
    pub async fn list_sources(&self) -> Result<Vec<SourceStatus>> {
        let store = match self.reader().await {
            Ok(store) => Some(store),
            Err(KbError::IndexUnavailable(_)) => None,
            Err(e) => return Err(e),
        };
        get_sources(&self.connectors, store.as_deref()).await
    }

    /// Fetch one configured source and update the index.
    pub async fn ingest_source(
        &self,
        name: &str,
        options: FetchOptions,
        dry_run: bool,
    ) -> Result<IngestionReport> {
        let connector = self.connectors.find(name).ok_or_else(|| {
            let known: Vec<&str> = self.connectors.connectors().iter().map(|c| c.name()).collect();
            KbError::NotFound(format!(
                "unknown source '{}' (configured: {})",
                name,
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })?;
        info!(source = name, target = %connector.target(), dry_run, "ingesting source");
        self.ingest(name, connector.fetch(options), dry_run).await
    }

    /// Run an arbitrary record stream through the indexer under `source`.
    pub async fn ingest(
        &self,
        source: &str,
        records: RecordStream<'_>,
        dry_run: bool,
    ) -> Result<IngestionReport> {
        if dry_run {
            return self.ingest_dry_run(source, records).await;
        }

        let path = &self.config.index.path;
        let store = KnowledgeStore::open_writer(path).await?;
        let holder = format!("{}:{}", source, uuid::Uuid::new_v4());
        let ttl = self.config.ingest.lease_secs;

        if let Err(e) = store.acquire_lease(&holder, ttl).await {
            store.close().await;
            return Err(e);
        }

        let result = self.ingest_locked(&store, source, records, &holder).await;

        match &result {
            Ok(_) => {
                if let Err(e) = store.release_lease(&holder).await {
                    warn!(error = %e, "failed to release writer lease");
                }
                store.close().await;
            }
            Err(e) => {
                error!(source, error = %e, "ingestion failed");
                let damaged = match store.quick_check().await {
                    Ok(ok) => !ok,
                    Err(check) => {
                        warn!(error = %check, "integrity check could not run, keeping index");
                        false
                    }
                };
                if !damaged {
                    match store.publish().await {
                        Ok(published) if published > 0 => {
                            info!(source, published, "published batches committed before the failure")
                        }
                        Ok(_) => {}
                        Err(publish) => warn!(error = %publish, "failed to publish staged batches"),
                    }
                    if matches!(store.state().await, Ok(IndexState::Building)) {
                        let _ = store.set_state(IndexState::Ready).await;
                    }
                    let _ = store.release_lease(&holder).await;
                    store.close().await;
                } else {
                    warn!(path = %path.display(), "index is corrupt, discarding it");
                    store.close().await;
                    self.reset_reader().await;
                    db::remove_index_files(path)?;
                }
            }
        }
        result
    }

    async fn ingest_locked(
        &self,
        store: &KnowledgeStore,
        source: &str,
        records: RecordStream<'_>,
        holder: &str,
    ) -> Result<IngestionReport> {
        store
            .ensure_embedding(self.embedder.model_name(), self.embedder.dims())
            .await?;
        store.set_state(IndexState::Building).await?;
        let recovered = store.publish().await?;
        if recovered > 0 {
            info!(recovered, "published batches left staged by an interrupted run");
        }
        let run_id = store.start_run(source).await?;

        let lease = Lease {
            holder,
            ttl_secs: self.config.ingest.lease_secs,
        };
        let outcome = Indexer::new(store, self.embedder.as_ref(), &self.config)
            .with_lease(lease)
            .ingest(source, records)
            .await;

        let ingested = match outcome {
            Ok(ingested) => ingested,
            Err(e) => {
                let mut report = IngestionReport::new(source);
                report.aborted = Some(e.to_string());
                let _ = store.finish_run(&run_id, "failed", &report).await;
                return Err(e);
            }
        };

        let status = if ingested.source_error.is_some() {
            "aborted"
        } else {
            "completed"
        };
        store.finish_run(&run_id, status, &ingested.report).await?;
        store.set_state(IndexState::Ready).await?;

        match ingested.source_error {
            Some(e) => Err(e),
            None => Ok(ingested.report),
        }
    }

    async fn ingest_dry_run(&self, source: &str, records: RecordStream<'_>) -> Result<IngestionReport> {
        let store = match self.reader().await {
            Ok(store) => Some(store),
            Err(KbError::IndexUnavailable(_)) if !self.config.index.path.exists() => None,
            Err(e) => return Err(e),
        };
        let ingested = Indexer::dry_run(store.as_deref(), self.embedder.as_ref(), &self.config)
            .ingest(source, records)
            .await?;
        match ingested.source_error {
            Some(e) => Err(e),
            None => Ok(ingested.report),
        }
    }

    /// Ranked passages for `query`.
    pub async fn query(&self, query: &Query) -> Result<Vec<QueryHit>> {
        if query.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let store = self.reader().await?;
        search::query(
            &store,
            self.embedder.as_ref(),
            &self.config.retrieval,
            &self.config.embedding,
            query,
        )
        .await
    }

    pub async fn stats(&self) -> Result<KbStats> {
        match self.reader().await {
            Ok(store) => collect_stats(&store).await,
            Err(KbError::IndexUnavailable(_)) if !self.config.index.path.exists() => {
                Ok(KbStats::absent(&self.config.index.path))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_document(&self, id: &str) -> Result<DocumentView> {
        let store = self.reader().await?;
        store
            .get_document(id)
            .await?
            .ok_or_else(|| KbError::NotFound(format!("document {}", id)))
    }

    /// Remove every document of `source`, or everything when `None`.
    pub async fn purge(&self, source: Option<&str>) -> Result<PurgeReport> {
        let store = KnowledgeStore::open_writer(&self.config.index.path).await?;
        let holder = format!("purge:{}", uuid::Uuid::new_v4());
        if let Err(e) = store.acquire_lease(&holder, self.config.ingest.lease_secs).await {
            store.close().await;
            return Err(e);
        }

        let removed = store.purge(source).await;
        let _ = store.release_lease(&holder).await;
        store.close().await;
        let removed = removed?;

        info!(source = source.unwrap_or("all"), documents = removed, "purged");
        Ok(PurgeReport {
            source: source.map(str::to_string),
            documents_removed: removed,
        })
    }

    /// Discard the index file and re-ingest every configured source.
    ///
    /// Refuses while another writer holds a live lease on a readable index.
    pub async fn rebuild(&self) -> Result<Vec<IngestionReport>> {
        let path = &self.config.index.path;
        if path.exists() {
            if let Ok(store) = KnowledgeStore::open_writer(path).await {
                let holder = format!("rebuild:{}", uuid::Uuid::new_v4());
                let locked = store.acquire_lease(&holder, self.config.ingest.lease_secs).await;
                store.close().await;
                locked?;
            }
        }

        self.reset_reader().await;
        db::remove_index_files(path)?;
        info!(path = %path.display(), "index discarded, rebuilding");

        let mut reports = Vec::new();
        for connector in self.connectors.connectors() {
            let report = self
                .ingest(connector.name(), connector.fetch(FetchOptions::default()), false)
                .await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Channels visible to the chat bot.
    pub async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let slack = self.config.sources.slack.clone().ok_or_else(|| {
            KbError::Configuration(
                "no chat source is configured (set SLACK_BOT_TOKEN or add [sources.slack])".into(),
            )
        })?;
        SlackConnector::new(slack)?.list_channels().await
    }

    /// Close the read handle.
    pub async fn shutdown(&self) {
        self.reset_reader().await;
    }
}
