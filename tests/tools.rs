//! The built-in tools and the HTTP surface, driven against a temporary
//! index and a `file://` documentation export.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use kedro_rag::config::{Config, DocsSourceConfig};
use kedro_rag::connector_docs::DocsConnector;
use kedro_rag::embedding::HashingProvider;
use kedro_rag::error::error_body;
use kedro_rag::kb::KnowledgeBase;
use kedro_rag::server::router;
use kedro_rag::traits::{ConnectorRegistry, ToolContext, ToolRegistry};

const EXPORT: &str = "\
# Kedro documentation

Kedro is an open-source Python framework for data science code.

## Data Catalog
The data catalog registers datasets in catalog.yml so nodes can load and save them.

## Nodes
A node wraps a pure Python function with named inputs and outputs.

### Tags
Tag nodes to run a subset of a pipeline with kedro run --tags.

## Deployment
Package a project with kedro package and deploy it to Airflow or Databricks.
";

fn knowledge_base(dir: &Path) -> Arc<KnowledgeBase> {
    let export = dir.join("llms-full.txt");
    std::fs::write(&export, EXPORT).unwrap();

    let mut config = Config::default();
    config.index.path = dir.join("kb.sqlite");
    config.embedding.dims = Some(128);

    let mut connectors = ConnectorRegistry::new();
    let docs = DocsSourceConfig::with_url(format!("file://{}", export.display()));
    connectors.register(Box::new(DocsConnector::new(docs).unwrap()));

    Arc::new(KnowledgeBase::with_parts(
        config,
        Arc::new(HashingProvider::new("feature-hash-v1", 128)),
        connectors,
    ))
}

async fn call(
    tools: &ToolRegistry,
    kb: &Arc<KnowledgeBase>,
    name: &str,
    params: Value,
) -> anyhow::Result<Value> {
    let tool = tools.find(name).unwrap();
    tool.execute(params, &ToolContext::new(kb.clone())).await
}

async fn serve(kb: Arc<KnowledgeBase>) -> SocketAddr {
    let app = router(kb, Arc::new(ToolRegistry::with_builtins()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ============ Registry ============

#[tokio::test]
async fn test_ingest_then_query_through_registry() {
    let tmp = TempDir::new().unwrap();
    let kb = knowledge_base(tmp.path());
    let tools = ToolRegistry::with_builtins();

    let report = call(&tools, &kb, "ingest_source", json!({ "source": "docs" }))
        .await
        .unwrap();
    assert_eq!(report["source"], "docs");
    assert_eq!(report["added"], 5);
    assert_eq!(report["failed"], json!([]));

    let again = call(&tools, &kb, "ingest_source", json!({ "source": "docs" }))
        .await
        .unwrap();
    assert_eq!(again["added"], 0);
    assert_eq!(again["skipped"], 5);

    let out = call(
        &tools,
        &kb,
        "query",
        json!({ "text": "tag nodes to run a subset", "k": 2 }),
    )
    .await
    .unwrap();
    let results = out["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0]["provenance"]["origin"],
        "Kedro documentation > Nodes > Tags"
    );
    assert_eq!(results[0]["provenance"]["kind"], "documentation");

    let chat = call(&tools, &kb, "query", json!({ "text": "catalog", "kind": "chat" }))
        .await
        .unwrap();
    assert_eq!(chat["results"], json!([]));
}

#[tokio::test]
async fn test_tool_errors_keep_their_kind() {
    let tmp = TempDir::new().unwrap();
    let kb = knowledge_base(tmp.path());
    let tools = ToolRegistry::with_builtins();

    let err = call(&tools, &kb, "query", json!({ "text": "catalog" }))
        .await
        .unwrap_err();
    assert_eq!(error_body(&err).kind, "index_unavailable");

    let err = call(
        &tools,
        &kb,
        "ingest_source",
        json!({ "source": "docs", "since": "yesterday" }),
    )
    .await
    .unwrap_err();
    assert_eq!(error_body(&err).kind, "invalid_request");

    let err = call(&tools, &kb, "ingest_source", json!({ "source": "confluence" }))
        .await
        .unwrap_err();
    assert_eq!(error_body(&err).kind, "not_found");

    let dry = call(
        &tools,
        &kb,
        "ingest_source",
        json!({ "source": "docs", "dry_run": true }),
    )
    .await
    .unwrap();
    assert_eq!(dry["dry_run"], true);
    assert_eq!(dry["added"], 5);
    assert!(!tmp.path().join("kb.sqlite").exists());
}

// ============ HTTP ============

#[tokio::test]
async fn test_query_on_absent_index_is_503() {
    let tmp = TempDir::new().unwrap();
    let addr = serve(knowledge_base(tmp.path())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/tools/query", addr))
        .json(&json!({ "text": "catalog" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "index_unavailable");
    assert!(!body["error"]["message"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_tool_and_bad_body() {
    let tmp = TempDir::new().unwrap();
    let addr = serve(knowledge_base(tmp.path())).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/tools/answer", addr))
        .json(&json!({ "text": "catalog" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("http://{}/tools/query", addr))
        .json(&json!(["catalog"]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_request");

    let resp = client
        .post(format!("http://{}/tools/query", addr))
        .json(&json!({ "text": "catalog", "kind": "email" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_http_ingest_query_and_list() {
    let tmp = TempDir::new().unwrap();
    let addr = serve(knowledge_base(tmp.path())).await;
    let client = reqwest::Client::new();

    let list: Value = client
        .get(format!("http://{}/tools/list", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = list["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec!["list_sources", "ingest_source", "query", "get_context", "kb_stats", "list_channels"]
    );

    let resp = client
        .post(format!("http://{}/tools/ingest_source", addr))
        .json(&json!({ "source": "docs" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["added"], 5);

    let body: Value = client
        .post(format!("http://{}/tools/query", addr))
        .json(&json!({ "text": "deploy to Airflow", "k": 1 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let results = body["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0]["provenance"]["document_id"],
        "docs:kedro-documentation--deployment"
    );

    let health: Value = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["index"], "ready");
}
