//! Test doubles shared by session and orchestrator tests.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{RequestFromClient, ServerMessage};
use rust_mcp_schema::{CallToolResult, ContentBlock, InitializeRequestParams, InitializeResult, Tool};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::mcp::error::McpError;
use crate::mcp::transport::McpTransport;

/// Builds a `Tool` fixture from plain JSON, the same wire shape servers send.
pub(crate) fn tool_fixture(name: &str, description: &str, input_schema: serde_json::Value) -> Tool {
    serde_json::from_value(json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    }))
    .expect("tool fixture should deserialize")
}

/// Extracts the joined text content of a tool result.
pub(crate) fn text_of(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::TextContent(text) => Some(text.text.clone()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn response_with_result(result: serde_json::Value) -> ServerMessage {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": 0,
        "result": result,
    }))
    .expect("server message fixture should deserialize")
}

/// Scripted transport double: serves a fixed tool listing and a queue of
/// call outcomes, counting tools/call requests so tests can assert on
/// retry and access-control behavior.
pub(crate) struct FakeTransport {
    tools: Vec<Tool>,
    fail_initialize: bool,
    call_script: Mutex<VecDeque<Result<serde_json::Value, McpError>>>,
    calls: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn with_tools(tools: Vec<Tool>) -> Self {
        Self {
            tools,
            fail_initialize: false,
            call_script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_initialize() -> Self {
        Self {
            tools: Vec::new(),
            fail_initialize: true,
            call_script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queues a successful text result for the next tools/call request.
    pub(crate) async fn push_call_text(&self, text: &str) {
        self.call_script.lock().await.push_back(Ok(json!({
            "content": [{"type": "text", "text": text}],
        })));
    }

    /// Queues a raw result value (arbitrary content array / isError flag).
    pub(crate) async fn push_call_result(&self, result: serde_json::Value) {
        self.call_script.lock().await.push_back(Ok(result));
    }

    /// Queues a failure for the next tools/call request.
    pub(crate) async fn push_call_failure(&self, err: McpError) {
        self.call_script.lock().await.push_back(Err(err));
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpTransport for FakeTransport {
    async fn initialize(
        &self,
        _params: InitializeRequestParams,
    ) -> Result<InitializeResult, McpError> {
        if self.fail_initialize {
            return Err(McpError::Connection("connection refused".to_string()));
        }
        serde_json::from_value(json!({
            "capabilities": {"tools": {}},
            "protocolVersion": "2025-11-25",
            "serverInfo": {"name": "fake", "version": "0.0.0"},
        }))
        .map_err(|err| McpError::Protocol(err.to_string()))
    }

    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        match request {
            RequestFromClient::ListToolsRequest(_) => {
                let tools = serde_json::to_value(&self.tools)
                    .map_err(|err| McpError::Protocol(err.to_string()))?;
                Ok(response_with_result(json!({ "tools": tools })))
            }
            RequestFromClient::CallToolRequest(_) => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let scripted = self.call_script.lock().await.pop_front();
                match scripted {
                    Some(Ok(result)) => Ok(response_with_result(result)),
                    Some(Err(err)) => Err(err),
                    None => Ok(response_with_result(json!({
                        "content": [{"type": "text", "text": "ok"}],
                    }))),
                }
            }
            other => Err(McpError::Protocol(format!(
                "unexpected request in fake transport: {other:?}"
            ))),
        }
    }

    async fn close(&self) {}
}
