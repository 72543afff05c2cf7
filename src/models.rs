//! Core data models used throughout the knowledge base.
//!
//! These types represent the records, chunks, reports, and query results
//! that flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which kind of producer a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Documentation,
    Chat,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Documentation => "documentation",
            SourceKind::Chat => "chat",
        }
    }

    /// Parse `documentation`/`docs` or `chat`/`slack`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "documentation" | "docs" | "doc" => Some(SourceKind::Documentation),
            "chat" | "slack" => Some(SourceKind::Chat),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized record produced by a connector.
///
/// `id` is stable across fetches of the same upstream item (section path,
/// channel + thread timestamp), which is what makes re-ingestion replace
/// rather than append.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub kind: SourceKind,
    /// Section path for documentation, channel id for chat.
    pub origin: String,
    pub title: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub author: Option<String>,
    pub metadata: serde_json::Value,
}

impl DocumentRecord {
    /// SHA-256 over the fields that define the content.
    ///
    /// The timestamp is left out: documentation sections carry the fetch
    /// time, which changes on every run even when the text does not.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.origin.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.title.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(self.author.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A chunk of a record's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `{document_id}#{seq}`; unique because `(document_id, seq)` is.
    pub id: String,
    pub document_id: String,
    pub seq: i64,
    pub text: String,
    pub hash: String,
}

/// Where a retrieved chunk came from.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Provenance {
    pub kind: SourceKind,
    /// Connector label (`docs`, `slack`).
    pub source: String,
    pub origin: String,
    pub document_id: String,
    pub seq: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    /// ISO 8601.
    pub timestamp: String,
}

/// Restricts the candidate set before ranking.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub kind: Option<SourceKind>,
    #[serde(default)]
    pub origin: Option<String>,
}

/// A retrieval request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Query {
    pub text: String,
    #[serde(default)]
    pub filter: QueryFilter,
    #[serde(default)]
    pub k: Option<usize>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.filter.kind = Some(kind);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.filter.origin = Some(origin.into());
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }
}

/// One ranked passage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryHit {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
    pub provenance: Provenance,
}

/// A document that could not be indexed in this run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentFailure {
    pub document_id: String,
    /// [`KbError::kind`](crate::error::KbError::kind) of the failure.
    pub kind: String,
    pub message: String,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct IngestionReport {
    pub source: String,
    pub fetched: u64,
    pub added: u64,
    pub updated: u64,
    pub skipped: u64,
    pub chunks_written: u64,
    pub batches_committed: u64,
    pub failed: Vec<DocumentFailure>,
    /// Set when the run stopped early; documents committed before it stay.
    pub aborted: Option<String>,
    pub dry_run: bool,
}

impl IngestionReport {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Number of documents that failed with `embedding_failed`.
    pub fn embedding_failed(&self) -> usize {
        self.failed
            .iter()
            .filter(|f| f.kind == "embedding_failed")
            .count()
    }
}

/// Format a Unix timestamp as ISO 8601.
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
