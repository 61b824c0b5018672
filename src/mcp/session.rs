//! Lifecycle and invocation handling for one configured MCP server.

use rust_mcp_schema::schema_utils::RequestFromClient;
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeRequestParams, InitializeResult, PaginatedRequestParams, Tool,
    LATEST_PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::config::data::ServerConfig;
use crate::mcp::error::McpError;
use crate::mcp::transport::{self, McpTransport};

/// Handshake deadline. A server that cannot negotiate within this window is
/// marked failed; the rest of the system keeps running without it.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before the single retry of a failed tool call.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

const MAX_TOOL_LIST: usize = 100;

/// Connection lifecycle of a [`ServerSession`].
///
/// `Failed` is terminal: retrying a whole server means constructing a fresh
/// session object, never silently reviving a dead one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Connecting,
    Ready,
    Failed,
    Stopped,
}

/// One configured server: owns the transport, the initialize handshake, tool
/// discovery, and per-call invocation with a single bounded retry.
///
/// Sessions are shared as `Arc<ServerSession>` and safe for concurrent tool
/// calls; the transports multiplex or serialize internally.
pub struct ServerSession {
    config: ServerConfig,
    state: RwLock<SessionState>,
    transport: RwLock<Option<Arc<dyn McpTransport>>>,
    server_info: RwLock<Option<InitializeResult>>,
    seed_transport: Option<Arc<dyn McpTransport>>,
}

impl ServerSession {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(SessionState::Unstarted),
            transport: RwLock::new(None),
            server_info: RwLock::new(None),
            seed_transport: None,
        }
    }

    /// Builds a session around an already-constructed transport. Used by
    /// tests to substitute doubles for real subprocesses and HTTP endpoints.
    pub fn with_transport(config: ServerConfig, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            config,
            state: RwLock::new(SessionState::Unstarted),
            transport: RwLock::new(None),
            server_info: RwLock::new(None),
            seed_transport: Some(transport),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.read().await.clone()
    }

    /// Connects and performs the protocol handshake under [`HANDSHAKE_TIMEOUT`].
    ///
    /// Any failure leaves the session `Failed` and is reported to the caller;
    /// it must not prevent other servers from being brought up.
    pub async fn start(&self) -> Result<(), McpError> {
        {
            let mut state = self.state.write().await;
            if *state != SessionState::Unstarted {
                return Err(McpError::NotReady);
            }
            *state = SessionState::Connecting;
        }

        let transport = match &self.seed_transport {
            Some(transport) => transport.clone(),
            None => match transport::connect(&self.config) {
                Ok(transport) => transport,
                Err(err) => {
                    *self.state.write().await = SessionState::Failed;
                    return Err(err);
                }
            },
        };

        let handshake =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.initialize(client_details())).await;
        match handshake {
            Ok(Ok(info)) => {
                debug!(
                    server = %self.config.name,
                    protocol_version = %info.protocol_version,
                    "server session ready"
                );
                *self.server_info.write().await = Some(info);
                *self.transport.write().await = Some(transport);
                *self.state.write().await = SessionState::Ready;
                Ok(())
            }
            Ok(Err(err)) => {
                transport.close().await;
                *self.state.write().await = SessionState::Failed;
                Err(err)
            }
            Err(_) => {
                transport.close().await;
                *self.state.write().await = SessionState::Failed;
                Err(McpError::Timeout("initialize handshake".to_string()))
            }
        }
    }

    /// Lists the server's full tool set, following cursor pagination.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        let transport = self.ready_transport().await?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.take().map(|cursor| PaginatedRequestParams {
                cursor: Some(cursor),
                meta: None,
            });
            let response = transport
                .request(RequestFromClient::ListToolsRequest(params))
                .await?;
            if transport::is_method_not_found(&response) {
                break;
            }
            let list = transport::parse_list_tools(response)?;
            tools.extend(list.tools);
            if tools.len() >= MAX_TOOL_LIST {
                tools.truncate(MAX_TOOL_LIST);
                break;
            }
            match list.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(tools)
    }

    /// Invokes one tool. A transient failure is retried exactly once after
    /// [`RETRY_BACKOFF`]; the second failure propagates unmodified. Rejections
    /// local to argument validation are never retried.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, McpError> {
        let transport = self.ready_transport().await?;
        match Self::invoke(&transport, name, arguments.clone()).await {
            Ok(result) => Ok(result),
            Err(err) if err.is_transient() => {
                warn!(
                    server = %self.config.name,
                    tool = name,
                    error = %err,
                    "retrying tool call after transient failure"
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
                Self::invoke(&transport, name, arguments).await
            }
            Err(err) => Err(err),
        }
    }

    async fn invoke(
        transport: &Arc<dyn McpTransport>,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, McpError> {
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let response = transport
            .request(RequestFromClient::CallToolRequest(params))
            .await?;
        transport::parse_call_tool(response)
    }

    /// Releases transport resources. Safe to call repeatedly and on a session
    /// that never started; teardown errors are swallowed by the transports.
    pub async fn stop(&self) {
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        *self.state.write().await = SessionState::Stopped;
    }

    async fn ready_transport(&self) -> Result<Arc<dyn McpTransport>, McpError> {
        if self.state().await != SessionState::Ready {
            return Err(McpError::NotReady);
        }
        self.transport
            .read()
            .await
            .clone()
            .ok_or(McpError::NotReady)
    }
}

fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "concierge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Concierge MCP Client".to_string()),
            description: None,
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}
