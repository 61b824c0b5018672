//! Transport abstractions for MCP tool servers.
//!
//! Implementations normalize protocol differences between stdio subprocesses
//! and streamable HTTP so session code can preserve common state invariants.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{RequestFromClient, ServerMessage};
use rust_mcp_schema::{InitializeRequestParams, InitializeResult};
use std::sync::Arc;

use crate::core::config::data::ServerConfig;
use crate::mcp::error::McpError;

pub mod http;
mod protocol;
pub mod stdio;

pub(crate) use protocol::{parse_call_tool, parse_list_tools};

/// JSON-RPC code used by servers to reject calls with invalid arguments.
pub const JSONRPC_INVALID_PARAMS: i64 = -32602;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP/SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    StreamableHttp,
    Stdio,
}

impl McpTransportKind {
    /// Resolves the transport type from config.
    ///
    /// An explicit `transport` string wins; otherwise the kind is inferred
    /// from which endpoint parameters are present.
    pub fn from_config(config: &ServerConfig) -> Result<Self, McpError> {
        if let Some(transport) = config.transport.as_deref() {
            return match transport.to_ascii_lowercase().as_str() {
                "streamable-http" | "streamable_http" | "http" => {
                    Ok(McpTransportKind::StreamableHttp)
                }
                "stdio" => Ok(McpTransportKind::Stdio),
                other => Err(McpError::Connection(format!(
                    "unsupported MCP transport: {other}"
                ))),
            };
        }
        if config.base_url.is_some() {
            Ok(McpTransportKind::StreamableHttp)
        } else if config.command.is_some() {
            Ok(McpTransportKind::Stdio)
        } else {
            Err(McpError::Connection(
                "server config needs either a base_url or a command".to_string(),
            ))
        }
    }
}

/// Connection contract to one MCP tool server.
///
/// `initialize` performs the protocol handshake (including the initialized
/// notification), `request` sends one JSON-RPC request and waits for its
/// response, and `close` releases resources. `close` must be idempotent.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn initialize(
        &self,
        params: InitializeRequestParams,
    ) -> Result<InitializeResult, McpError>;

    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError>;

    async fn close(&self);
}

/// Builds the transport described by a server config.
///
/// The stdio variant spawns the child process immediately; the handshake is
/// left to [`McpTransport::initialize`] so the caller controls its deadline.
pub fn connect(config: &ServerConfig) -> Result<Arc<dyn McpTransport>, McpError> {
    match McpTransportKind::from_config(config)? {
        McpTransportKind::Stdio => Ok(stdio::StdioTransport::spawn(config)?),
        McpTransportKind::StreamableHttp => Ok(http::StreamableHttpTransport::new(config)?),
    }
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == JSONRPC_METHOD_NOT_FOUND
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(
        transport: Option<&str>,
        base_url: Option<&str>,
        command: Option<&str>,
    ) -> ServerConfig {
        ServerConfig {
            name: "alpha".to_string(),
            transport: transport.map(str::to_string),
            base_url: base_url.map(str::to_string),
            command: command.map(str::to_string),
            args: None,
            env: None,
            allowed_tools: Vec::new(),
            tool_hints: Default::default(),
        }
    }

    #[test]
    fn explicit_transport_string_is_honored() {
        let config = config_with(Some("stdio"), Some("https://unused.example"), None);
        assert_eq!(
            McpTransportKind::from_config(&config).expect("kind"),
            McpTransportKind::Stdio
        );
    }

    #[test]
    fn transport_kind_is_inferred_from_endpoint_parameters() {
        let http = config_with(None, Some("https://mcp.example.com/mcp"), None);
        assert_eq!(
            McpTransportKind::from_config(&http).expect("kind"),
            McpTransportKind::StreamableHttp
        );

        let stdio = config_with(None, None, Some("npx"));
        assert_eq!(
            McpTransportKind::from_config(&stdio).expect("kind"),
            McpTransportKind::Stdio
        );
    }

    #[test]
    fn missing_endpoint_parameters_are_rejected() {
        let config = config_with(None, None, None);
        assert!(McpTransportKind::from_config(&config).is_err());
    }
}
