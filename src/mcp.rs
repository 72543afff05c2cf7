//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] to the Model Context Protocol so an assistant
//! host can discover and call the knowledge-base operations. The same bridge
//! is served over stdio (`kedro-rag serve mcp`) and mounted as a Streamable
//! HTTP endpoint at `/mcp` by `kedro-rag serve http`.
//!
//! Successful calls return the tool's JSON result as structured content.
//! Failed calls return `isError: true` with `{ "error": { "kind", "message" } }`.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};
use tracing::{info, warn};

use crate::error::error_body;
use crate::kb::KnowledgeBase;
use crate::traits::{ToolContext, ToolRegistry};

/// Each MCP session gets a clone; everything is behind `Arc`.
#[derive(Clone)]
pub struct McpBridge {
    kb: Arc<KnowledgeBase>,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(kb: Arc<KnowledgeBase>, tools: Arc<ToolRegistry>) -> Self {
        Self { kb, tools }
    }

    fn to_mcp_tool(tool: &dyn crate::traits::Tool) -> Tool {
        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema: schema_object(tool.parameters_schema()),
            output_schema: Some(schema_object(tool.output_schema())),
            annotations: Some(ToolAnnotations::new().read_only(tool.name() != "ingest_source")),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

fn schema_object(schema: serde_json::Value) -> Arc<serde_json::Map<String, serde_json::Value>> {
    match schema {
        serde_json::Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "kedro-rag".to_string(),
                title: Some("Kedro RAG".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Kedro knowledge base built from the Kedro documentation and community Slack. \
                 Use query or get_context to find relevant passages (filter with kind = \
                 documentation or chat), list_sources and kb_stats to see what is indexed, \
                 and ingest_source to refresh a source."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self.tools.find(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        let ctx = ToolContext::new(self.kb.clone());
        match tool.execute(params, &ctx).await {
            Ok(result) => Ok(CallToolResult::structured(result)),
            Err(e) => {
                let body = error_body(&e);
                warn!(tool = %request.name, kind = %body.kind, "tool call failed: {}", body.message);
                let text = serde_json::json!({ "error": body }).to_string();
                Ok(CallToolResult::error(vec![Content::text(text)]))
            }
        }
    }
}

/// Serve the bridge on stdin/stdout until the client disconnects.
pub async fn run_stdio(kb: Arc<KnowledgeBase>) -> anyhow::Result<()> {
    let bridge = McpBridge::new(kb.clone(), Arc::new(ToolRegistry::with_builtins()));
    info!("MCP server ready on stdio");
    let service = bridge.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    info!("MCP session ended");
    kb.shutdown().await;
    Ok(())
}
