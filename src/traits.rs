//! Source adapter and tool contracts.
//!
//! Two registries sit between the knowledge base and the outside world:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      ConnectorRegistry       │
//! │  ┌──────────┐ ┌───────────┐  │
//! │  │   docs   │ │   slack   │  │
//! │  └──────────┘ └───────────┘  │
//! └──────────────┬───────────────┘
//!                ▼
//!     fetch() → Indexer::ingest()
//! ```
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │               ToolRegistry                │
//! │ list_sources  ingest_source  query        │
//! │ get_context   kb_stats       list_channels│
//! └──────────────┬────────────────────────────┘
//!                ▼
//!     MCP (stdio) / HTTP dispatch
//! ```
//!
//! Dispatch is a lookup by name. Every tool declares an input and an output
//! JSON Schema; inputs are deserialized into typed structs before the
//! knowledge base is touched, and malformed input is `invalid_request`.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::Config;
use crate::connector_docs::DocsConnector;
use crate::connector_slack::SlackConnector;
use crate::error::KbError;
use crate::kb::KnowledgeBase;
use crate::models::{DocumentRecord, Query, QueryFilter, SourceKind};

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// Per-call narrowing of what a connector fetches.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Chat: only messages from the last `days_back` days.
    pub days_back: Option<u32>,
    /// Chat: channel ids or names, replacing the configured list.
    pub channels: Option<Vec<String>>,
}

/// Lazy, finite sequence of records produced by a connector.
pub type RecordStream<'a> = BoxStream<'a, crate::error::Result<DocumentRecord>>;

/// A source adapter.
///
/// `fetch` must not perform I/O before the stream is polled, and a failure
/// ends the stream: the error is its last item.
pub trait Connector: Send + Sync {
    /// Source name used by `ingest_source` and stored with each document.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Human-readable location (URL, channel list).
    fn target(&self) -> String;

    fn fetch(&self, options: FetchOptions) -> RecordStream<'_>;
}

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// An operation the calling assistant can discover and invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores; the dispatch key.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema of the input object.
    fn parameters_schema(&self) -> Value;

    /// JSON Schema of the result object.
    fn output_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    /// Errors that are [`KbError`]s keep their kind when reported.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Handle tools use to reach the knowledge base.
#[derive(Clone)]
pub struct ToolContext {
    kb: Arc<KnowledgeBase>,
}

impl ToolContext {
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        Self { kb }
    }

    pub fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(tool: &str, params: Value) -> Result<T, KbError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params)
        .map_err(|e| KbError::InvalidRequest(format!("{}: {}", tool, e)))
}

fn provenance_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "kind": { "type": "string", "enum": ["documentation", "chat"] },
            "source": { "type": "string" },
            "origin": { "type": "string" },
            "document_id": { "type": "string" },
            "seq": { "type": "integer" },
            "title": { "type": ["string", "null"] },
            "author": { "type": ["string", "null"] },
            "timestamp": { "type": "string", "format": "date-time" }
        },
        "required": ["kind", "source", "origin", "document_id", "seq", "timestamp"]
    })
}

fn filter_properties() -> Value {
    json!({
        "kind": {
            "type": "string",
            "enum": ["documentation", "chat"],
            "description": "Only return passages from this kind of source"
        },
        "origin": {
            "type": "string",
            "description": "Doc section path (matches the section and its subsections) or chat channel id"
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tool Implementations
// ═══════════════════════════════════════════════════════════════════════

/// `list_sources`: configured sources with their index status.
pub struct ListSourcesTool;

#[async_trait]
impl Tool for ListSourcesTool {
    fn name(&self) -> &str {
        "list_sources"
    }

    fn description(&self) -> &str {
        "List the configured knowledge sources and how much of each is indexed"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sources": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "kind": { "type": "string" },
                            "description": { "type": "string" },
                            "target": { "type": "string" },
                            "documents": { "type": "integer" },
                            "chunks": { "type": "integer" },
                            "last_run": { "type": ["object", "null"] }
                        },
                        "required": ["name", "kind", "target", "documents", "chunks"]
                    }
                }
            },
            "required": ["sources"]
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let sources = ctx.kb().list_sources().await?;
        Ok(json!({ "sources": sources }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IngestParams {
    source: String,
    #[serde(default)]
    days_back: Option<u32>,
    #[serde(default)]
    channels: Option<Vec<String>>,
    #[serde(default)]
    dry_run: bool,
}

/// `ingest_source`: fetch one source and update the index.
pub struct IngestSourceTool;

#[async_trait]
impl Tool for IngestSourceTool {
    fn name(&self) -> &str {
        "ingest_source"
    }

    fn description(&self) -> &str {
        "Fetch a source and incrementally update the knowledge base; returns counts of added, updated and skipped documents"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string", "description": "Source name from list_sources (docs, slack)" },
                "days_back": { "type": "integer", "minimum": 1, "description": "Chat: only the last N days" },
                "channels": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Chat: channel ids or names instead of the configured ones"
                },
                "dry_run": { "type": "boolean", "default": false }
            },
            "required": ["source"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string" },
                "fetched": { "type": "integer" },
                "added": { "type": "integer" },
                "updated": { "type": "integer" },
                "skipped": { "type": "integer" },
                "chunks_written": { "type": "integer" },
                "batches_committed": { "type": "integer" },
                "failed": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "document_id": { "type": "string" },
                            "kind": { "type": "string" },
                            "message": { "type": "string" }
                        }
                    }
                },
                "aborted": { "type": ["string", "null"] },
                "dry_run": { "type": "boolean" }
            },
            "required": ["source", "added", "updated", "skipped", "failed"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let p: IngestParams = parse_params(self.name(), params)?;
        let options = FetchOptions {
            days_back: p.days_back,
            channels: p.channels,
        };
        let report = ctx.kb().ingest_source(&p.source, options, p.dry_run).await?;
        Ok(serde_json::to_value(report)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueryParams {
    text: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    k: Option<usize>,
}

impl QueryParams {
    fn into_query(self, tool: &str) -> Result<Query, KbError> {
        let kind = match self.kind.as_deref() {
            None => None,
            Some(k) => Some(SourceKind::parse(k).ok_or_else(|| {
                KbError::InvalidRequest(format!(
                    "{}: unknown kind '{}' (expected documentation or chat)",
                    tool, k
                ))
            })?),
        };
        Ok(Query {
            text: self.text,
            filter: QueryFilter {
                kind,
                origin: self.origin.filter(|o| !o.trim().is_empty()),
            },
            k: self.k,
        })
    }
}

/// `query`: ranked passages with provenance.
pub struct QueryTool;

#[async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &str {
        "query"
    }

    fn description(&self) -> &str {
        "Search the Kedro knowledge base (documentation and community chat) and return ranked passages with provenance"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut properties = json!({
            "text": { "type": "string", "description": "What to search for" },
            "k": { "type": "integer", "minimum": 1, "description": "Number of results" }
        });
        if let (Some(props), Value::Object(filters)) =
            (properties.as_object_mut(), filter_properties())
        {
            props.extend(filters);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": ["text"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "chunk_id": { "type": "string" },
                            "text": { "type": "string" },
                            "score": { "type": "number" },
                            "provenance": provenance_schema()
                        },
                        "required": ["chunk_id", "text", "score", "provenance"]
                    }
                }
            },
            "required": ["results"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = parse_params::<QueryParams>(self.name(), params)?.into_query(self.name())?;
        let results = ctx.kb().query(&query).await?;
        Ok(json!({ "results": results }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContextParams {
    topic: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    k: Option<usize>,
}

/// `get_context`: the top passages for a topic as one grounding string.
pub struct GetContextTool;

#[async_trait]
impl Tool for GetContextTool {
    fn name(&self) -> &str {
        "get_context"
    }

    fn description(&self) -> &str {
        "Gather the most relevant Kedro passages for a topic into a single context block with numbered sources"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut properties = json!({
            "topic": { "type": "string", "description": "Topic or question to gather context for" },
            "k": { "type": "integer", "minimum": 1, "description": "Number of passages" }
        });
        if let (Some(props), Value::Object(filters)) =
            (properties.as_object_mut(), filter_properties())
        {
            props.extend(filters);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": ["topic"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "context": { "type": "string" },
                "sources": { "type": "array", "items": provenance_schema() }
            },
            "required": ["context", "sources"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let p: ContextParams = parse_params(self.name(), params)?;
        let query = QueryParams {
            text: p.topic,
            kind: p.kind,
            origin: p.origin,
            k: p.k,
        }
        .into_query(self.name())?;

        let hits = ctx.kb().query(&query).await?;
        let context = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| {
                let p = &hit.provenance;
                let label = match p.kind {
                    SourceKind::Documentation => format!("docs: {}", p.origin),
                    SourceKind::Chat => format!(
                        "chat: {} ({})",
                        p.author.as_deref().unwrap_or("Unknown User"),
                        p.timestamp
                    ),
                };
                format!("[{}] {}\n{}", i + 1, label, hit.text)
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        let sources: Vec<_> = hits.into_iter().map(|h| h.provenance).collect();

        Ok(json!({ "context": context, "sources": sources }))
    }
}

/// `kb_stats`: index totals and health.
pub struct KbStatsTool;

#[async_trait]
impl Tool for KbStatsTool {
    fn name(&self) -> &str {
        "kb_stats"
    }

    fn description(&self) -> &str {
        "Report knowledge-base state, document and chunk counts per source, the embedding model, and the last ingestion run"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "state": { "type": "string", "enum": ["absent", "building", "ready"] },
                "path": { "type": "string" },
                "embedding_model": { "type": ["string", "null"] },
                "embedding_dims": { "type": ["integer", "null"] },
                "documents": { "type": "integer" },
                "chunks": { "type": "integer" },
                "sources": { "type": "array", "items": { "type": "object" } },
                "last_run": { "type": ["object", "null"] },
                "samples": { "type": "array", "items": { "type": "object" } }
            },
            "required": ["state", "documents", "chunks", "sources"]
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let stats = ctx.kb().stats().await?;
        Ok(serde_json::to_value(stats)?)
    }
}

/// `list_channels`: chat channels visible to the bot.
pub struct ListChannelsTool;

#[async_trait]
impl Tool for ListChannelsTool {
    fn name(&self) -> &str {
        "list_channels"
    }

    fn description(&self) -> &str {
        "List the Slack channels visible to the bot and whether it is a member (only member channels can be ingested)"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "channels": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "name": { "type": "string" },
                            "is_member": { "type": "boolean" },
                            "is_private": { "type": "boolean" },
                            "num_members": { "type": ["integer", "null"] },
                            "topic": { "type": ["string", "null"] }
                        },
                        "required": ["id", "name", "is_member"]
                    }
                }
            },
            "required": ["channels"]
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let channels = ctx.kb().list_channels().await?;
        Ok(json!({ "channels": channels }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registries
// ═══════════════════════════════════════════════════════════════════════

/// Connectors keyed by name.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Every source configured under `[sources]`.
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let mut registry = Self::new();
        if let Some(docs) = &config.sources.docs {
            registry.register(Box::new(DocsConnector::new(docs.clone())?));
        }
        if let Some(slack) = &config.sources.slack {
            registry.register(Box::new(SlackConnector::new(slack.clone())?));
        }
        Ok(registry)
    }

    /// Register a connector, replacing one with the same name.
    pub fn register(&mut self, connector: Box<dyn Connector>) {
        self.connectors.retain(|c| c.name() != connector.name());
        self.connectors.push(connector);
    }

    pub fn connectors(&self) -> &[Box<dyn Connector>] {
        &self.connectors
    }

    pub fn find(&self, name: &str) -> Option<&dyn Connector> {
        self.connectors
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Tools keyed by name.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with the six built-in operations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ListSourcesTool));
        registry.register(Box::new(IngestSourceTool));
        registry.register(Box::new(QueryTool));
        registry.register(Box::new(GetContextTool));
        registry.register(Box::new(KbStatsTool));
        registry.register(Box::new(ListChannelsTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
