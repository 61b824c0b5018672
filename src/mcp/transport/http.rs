//! Streamable HTTP transport: JSON-RPC over POST with JSON or SSE responses.

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{InitializeRequestParams, InitializeResult, RequestId};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::protocol;
use crate::core::config::data::ServerConfig;
use crate::mcp::error::McpError;

const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const HTTP_PROBE_TIMEOUT_SECONDS: u64 = 3;
const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Transport over streamable HTTP. Each request is an independent POST; the
/// negotiated session id and protocol version are carried in headers.
pub struct StreamableHttpTransport {
    server_name: String,
    base_url: String,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    negotiated_protocol_version: RwLock<Option<String>>,
    next_request_id: AtomicI64,
}

impl StreamableHttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Arc<Self>, McpError> {
        let base_url = config.base_url.clone().ok_or_else(|| {
            McpError::Connection("base_url is required for HTTP transports".to_string())
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| McpError::Connection(format!("failed to build HTTP client: {err}")))?;
        Ok(Arc::new(Self {
            server_name: config.name.clone(),
            base_url,
            client,
            session_id: RwLock::new(None),
            negotiated_protocol_version: RwLock::new(None),
            next_request_id: AtomicI64::new(0),
        }))
    }

    /// Cheap reachability check against the URL's origin. A hard-down server
    /// fails here in a few seconds instead of hanging the handshake machinery.
    async fn probe(&self) -> Result<(), McpError> {
        let origin = url_origin(&self.base_url).unwrap_or_else(|| self.base_url.clone());
        debug!(server = %self.server_name, url = %origin, "probing HTTP server");
        self.client
            .get(&origin)
            .timeout(Duration::from_secs(HTTP_PROBE_TIMEOUT_SECONDS))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Ok(())
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn post(&self, message: &ClientMessage) -> Result<reqwest::Response, McpError> {
        let payload =
            serde_json::to_string(message).map_err(|err| McpError::Protocol(err.to_string()))?;
        let mut request = self
            .client
            .post(&self.base_url)
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", JSON_AND_SSE_ACCEPT)
            .body(payload);
        if let Some(version) = self.negotiated_protocol_version.read().await.as_deref() {
            if !version.trim().is_empty() {
                request = request.header(PROTOCOL_VERSION_HEADER, version);
            }
        }
        if let Some(session_id) = self.session_id.read().await.as_deref() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Err(McpError::Protocol(format!(
                "HTTP error: {}",
                response.status()
            )));
        }
        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.write().await = Some(session_id.to_string());
        }
        Ok(response)
    }

    async fn post_and_read(&self, message: &ClientMessage) -> Result<ServerMessage, McpError> {
        let response = self.post(message).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            next_sse_server_message(response).await
        } else {
            let body = response.bytes().await.map_err(map_reqwest_error)?;
            serde_json::from_slice::<ServerMessage>(&body)
                .map_err(|err| McpError::Protocol(err.to_string()))
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message =
            ClientMessage::from_message(MessageFromClient::NotificationFromClient(notification), None)
                .map_err(|err| McpError::Protocol(err.to_string()))?;
        self.post(&message).await?;
        Ok(())
    }
}

#[async_trait]
impl super::McpTransport for StreamableHttpTransport {
    async fn initialize(
        &self,
        params: InitializeRequestParams,
    ) -> Result<InitializeResult, McpError> {
        self.probe().await?;
        let response = self
            .request(RequestFromClient::InitializeRequest(params))
            .await?;
        let result = protocol::parse_initialize_result(response)?;
        *self.negotiated_protocol_version.write().await = Some(result.protocol_version.clone());
        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(result)
    }

    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let request_id = self.next_request_id();
        debug!(server = %self.server_name, request_id = ?request_id, url = %self.base_url, "sending HTTP request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id),
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;
        self.post_and_read(&message).await
    }

    async fn close(&self) {
        *self.session_id.write().await = None;
        *self.negotiated_protocol_version.write().await = None;
    }
}

fn map_reqwest_error(err: reqwest::Error) -> McpError {
    if err.is_timeout() {
        McpError::Timeout("HTTP request".to_string())
    } else {
        McpError::Connection(err.to_string())
    }
}

/// Derives `scheme://authority` from a URL without pulling in a URL parser.
fn url_origin(url: &str) -> Option<String> {
    let scheme_end = url.find("://")?;
    let rest = &url[scheme_end + 3..];
    match rest.find('/') {
        Some(path_start) => Some(url[..scheme_end + 3 + path_start].to_string()),
        None => Some(url.to_string()),
    }
}

pub(crate) fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub(crate) fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Reads SSE frames until the first response or error message arrives.
/// Server-initiated requests and notifications on the stream are skipped.
async fn next_sse_server_message(response: reqwest::Response) -> Result<ServerMessage, McpError> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest_error)?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                if matches!(
                    message,
                    ServerMessage::Response(_) | ServerMessage::Error(_)
                ) {
                    return Ok(message);
                }
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            if matches!(
                message,
                ServerMessage::Response(_) | ServerMessage::Error(_)
            ) {
                return Ok(message);
            }
        }
    }

    Err(McpError::Protocol("empty event-stream response".to_string()))
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, McpError> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<ServerMessage>(payload)
        .map(Some)
        .map_err(|err| McpError::Protocol(err.to_string()))
}

#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub(crate) fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            if let Ok(text) = std::str::from_utf8(line_bytes) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}
