//! Configured sources and how much of each is indexed.

use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::error::Result;
use crate::kb::KnowledgeBase;
use crate::store::{KnowledgeStore, RunSummary};
use crate::traits::ConnectorRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub kind: String,
    pub description: String,
    pub target: String,
    pub documents: i64,
    pub chunks: i64,
    pub last_run: Option<RunSummary>,
}

/// One entry per registered connector. Counts are zero without an index.
pub async fn get_sources(
    connectors: &ConnectorRegistry,
    store: Option<&KnowledgeStore>,
) -> Result<Vec<SourceStatus>> {
    let mut out = Vec::with_capacity(connectors.len());

    for c in connectors.connectors() {
        let (documents, chunks, last_run) = match store {
            Some(store) => {
                let row = sqlx::query(
                    "SELECT COUNT(DISTINCT d.id) AS docs, COUNT(c.id) AS chunks \
                     FROM documents d LEFT JOIN chunks c ON c.document_id = d.id \
                     WHERE d.source = ?",
                )
                .bind(c.name())
                .fetch_one(store.pool())
                .await?;
                (
                    row.get::<i64, _>("docs"),
                    row.get::<i64, _>("chunks"),
                    store.last_run(Some(c.name())).await?,
                )
            }
            None => (0, 0, None),
        };

        out.push(SourceStatus {
            name: c.name().to_string(),
            kind: c.kind().to_string(),
            description: c.description().to_string(),
            target: c.target(),
            documents,
            chunks,
            last_run,
        });
    }

    Ok(out)
}

/// CLI entry point for `kedro-rag sources`.
pub async fn list_sources(config: &Config) -> anyhow::Result<()> {
    let kb = KnowledgeBase::new(config.clone())?;
    let sources = kb.list_sources().await?;
    kb.shutdown().await;

    if sources.is_empty() {
        println!("No sources configured. Set KEDRO_RAG_DOCS_URL and/or SLACK_BOT_TOKEN.");
        return Ok(());
    }

    println!(
        "{:<8} {:<14} {:>6} {:>8}  {:<10} TARGET",
        "SOURCE", "KIND", "DOCS", "CHUNKS", "LAST RUN"
    );
    for s in &sources {
        let last = s
            .last_run
            .as_ref()
            .map(|r| r.status.as_str())
            .unwrap_or("never");
        println!(
            "{:<8} {:<14} {:>6} {:>8}  {:<10} {}",
            s.name, s.kind, s.documents, s.chunks, last, s.target
        );
    }
    Ok(())
}
