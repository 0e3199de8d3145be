//! MCP server implementation using rmcp.
//!
//! Exposes the execution engine as MCP tools. Every tool answers with a JSON
//! document; failed executions are flagged as tool errors so clients notice.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::dispatcher::{AsyncSubmission, Dispatcher, Submission};
use crate::envelope::ResultEnvelope;
use crate::registry::ResultLookup;

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer {
    dispatcher: Arc<Dispatcher>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute and execute_async tools.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// Language to run (e.g., "python", "cpp", "java").
    #[schemars(description = "Language id, e.g. 'python', 'c', 'cpp', 'java', 'go', 'rust'")]
    pub language_id: String,

    /// Complete program source.
    #[schemars(description = "Complete program source code")]
    pub source: String,

    /// Standard input fed to the program.
    #[schemars(description = "Standard input for the program (optional)")]
    #[serde(default)]
    pub stdin: Option<String>,

    /// Wall budget in seconds, capped by the language's own limit.
    #[schemars(description = "Wall-clock budget in seconds; capped by the language limit (optional)")]
    #[serde(default)]
    pub wall_budget_seconds: Option<u64>,

    /// Caller-chosen execution id.
    #[schemars(description = "Execution id to use instead of a generated one (optional)")]
    #[serde(default)]
    pub execution_id: Option<String>,
}

impl From<ExecuteParams> for Submission {
    fn from(params: ExecuteParams) -> Self {
        Self {
            execution_id: params.execution_id,
            language_id: params.language_id,
            source: params.source,
            stdin: params.stdin.unwrap_or_default(),
            wall_budget_seconds: params.wall_budget_seconds,
        }
    }
}

/// Parameters for tools addressing one execution.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecutionParams {
    #[schemars(description = "Execution id returned by execute_async")]
    pub execution_id: String,
}

fn json_content<T: Serialize>(value: &T) -> Result<Content, McpError> {
    serde_json::to_string_pretty(value)
        .map(Content::text)
        .map_err(|e| McpError::internal_error(format!("Failed to encode response: {e}"), None))
}

fn envelope_result(envelope: &ResultEnvelope) -> Result<CallToolResult, McpError> {
    let content = vec![json_content(envelope)?];
    if envelope.ok {
        Ok(CallToolResult::success(content))
    } else {
        Ok(CallToolResult::error(content))
    }
}

fn unknown_execution(execution_id: &str) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![json_content(&json!({
        "execution_id": execution_id,
        "phase": "unknown",
    }))?]))
}

#[tool_router]
impl SandboxServer {
    /// Create a new sandbox server.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Compile and run code in an isolated sandbox and wait for the result")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(language = %params.language_id, source_len = params.source.len(), "Executing code");

        match self.dispatcher.submit_sync(params.into()).await {
            Ok(envelope) => envelope_result(&envelope),
            Err(e) => {
                warn!(error = %e, "Execution ended without a result");
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
        }
    }

    #[tool(description = "Queue code for execution and return its execution id immediately")]
    async fn execute_async(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.dispatcher.submit_async(params.into()).await {
            AsyncSubmission::Accepted { execution_id } => Ok(CallToolResult::success(vec![
                json_content(&json!({ "execution_id": execution_id }))?,
            ])),
            AsyncSubmission::Rejected(envelope) => envelope_result(&envelope),
        }
    }

    #[tool(description = "Report the phase of an execution")]
    async fn status(
        &self,
        Parameters(params): Parameters<ExecutionParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.dispatcher.status_of(&params.execution_id).await {
            Some(status) => Ok(CallToolResult::success(vec![json_content(&status)?])),
            None => unknown_execution(&params.execution_id),
        }
    }

    #[tool(description = "Fetch the result of an execution started with execute_async")]
    async fn result(
        &self,
        Parameters(params): Parameters<ExecutionParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.dispatcher.result_of(&params.execution_id).await {
            ResultLookup::Ready(envelope) => envelope_result(&envelope),
            ResultLookup::NotReady(status) => {
                Ok(CallToolResult::success(vec![json_content(&status)?]))
            }
            ResultLookup::Unknown => unknown_execution(&params.execution_id),
        }
    }

    #[tool(description = "Cancel a queued or running execution")]
    async fn cancel(
        &self,
        Parameters(params): Parameters<ExecutionParams>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = self.dispatcher.cancel(&params.execution_id).await;
        Ok(CallToolResult::success(vec![json_content(&json!({
            "execution_id": params.execution_id,
            "outcome": outcome,
        }))?]))
    }

    #[tool(description = "List supported languages and whether their toolchains are available")]
    async fn languages(&self) -> Result<CallToolResult, McpError> {
        let languages = self.dispatcher.languages().await;
        Ok(CallToolResult::success(vec![json_content(&languages)?]))
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let languages: Vec<_> = self
            .dispatcher
            .registered_languages()
            .into_iter()
            .map(|l| l.language_id)
            .collect();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "exec-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Compile and run untrusted code in isolated sandboxes.\n\
                 Languages: {languages:?}\n\
                 \n\
                 Use 'execute' to run and wait, or 'execute_async' followed by\n\
                 'status' / 'result' polling. 'cancel' stops a running execution."
            )),
        }
    }
}

/// Serve the sandbox server over stdio until the client disconnects.
pub async fn serve_stdio(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let server = SandboxServer::new(dispatcher);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
