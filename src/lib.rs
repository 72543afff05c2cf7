//! # Kedro RAG
//!
//! An incremental knowledge base over the Kedro documentation and community
//! Slack history, served to AI assistants over MCP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Connectors  │──▶│   Indexer    │──▶│  SQLite  │
//! │ docs/slack  │   │ chunk+embed  │   │ + vectors│
//! └─────────────┘   └──────────────┘   └────┬─────┘
//!                                           │ query
//!                       ┌───────────────────┤
//!                       ▼                   ▼
//!                  ┌──────────┐       ┌───────────┐
//!                  │   CLI    │       │ MCP/HTTP  │
//!                  └──────────┘       └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export KEDRO_RAG_DOCS_URL=https://docs.kedro.org/en/stable/llms-full.txt
//! export SLACK_BOT_TOKEN=xoxb-...
//! kedro-rag sync all
//! kedro-rag search "pipeline error" --kind chat
//! kedro-rag serve mcp
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Settings file, environment overrides, validation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Records, chunks, queries, reports |
//! | [`connector_docs`] | Documentation export connector |
//! | [`connector_slack`] | Slack history connector |
//! | [`chunk`] | Paragraph chunking with overlap |
//! | [`embedding`] | Embedding providers and vector helpers |
//! | [`ingest`] | Incremental indexer |
//! | [`search`] | Similarity retrieval |
//! | [`store`] | Index persistence, writer lease, lifecycle state |
//! | [`kb`] | The shared knowledge-base context |
//! | [`traits`] | Connector and tool contracts, registries, built-in tools |
//! | [`mcp`] | MCP bridge |
//! | [`server`] | HTTP server |

pub mod chunk;
pub mod config;
pub mod connector_docs;
pub mod connector_slack;
pub mod db;
pub mod embedding;
pub mod error;
pub mod get;
pub mod ingest;
pub mod kb;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod retry;
pub mod search;
pub mod server;
pub mod sources;
pub mod stats;
pub mod store;
pub mod traits;
