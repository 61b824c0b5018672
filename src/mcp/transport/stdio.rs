//! Stdio transport: a locally spawned MCP server speaking newline-delimited
//! JSON-RPC over its pipes.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{InitializeRequestParams, InitializeResult, RequestId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use super::protocol;
use crate::core::config::data::ServerConfig;
use crate::mcp::error::McpError;

const STDIO_REQUEST_TIMEOUT_SECONDS: u64 = 30;
const STDIO_WRITE_TIMEOUT_SECONDS: u64 = 10;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

/// Transport over a spawned subprocess. Requests are multiplexed through a
/// pending-response map keyed by request id, so concurrent callers are safe.
pub struct StdioTransport {
    server_name: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    next_request_id: AtomicI64,
}

impl StdioTransport {
    /// Spawns the configured command with piped stdio and starts the reader
    /// task. The protocol handshake is performed separately by `initialize`.
    pub fn spawn(config: &ServerConfig) -> Result<Arc<Self>, McpError> {
        let command = config
            .command
            .clone()
            .ok_or_else(|| McpError::Connection("command is required for stdio transport".to_string()))?;
        let args = config.args.clone().unwrap_or_default();
        debug!(command = %command, args = ?args, "starting MCP stdio server");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(env) = config.env.clone() {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| McpError::Connection(err.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Connection("unable to retrieve stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Connection("unable to retrieve stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Connection("unable to retrieve stderr".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let transport = Arc::new(Self {
            server_name: config.name.clone(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending: pending.clone(),
            next_request_id: AtomicI64::new(0),
        });

        Self::spawn_stdout_reader(pending, stdout, config.name.clone());
        Self::spawn_stderr_drain(stderr);

        Ok(transport)
    }

    fn spawn_stdout_reader(
        pending: PendingMap,
        stdout: tokio::process::ChildStdout,
        server_name: String,
    ) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let value = match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if let Some(items) = value.as_array() {
                    for item in items {
                        if let Ok(message) = serde_json::from_value::<ServerMessage>(item.clone()) {
                            Self::dispatch_message(&pending, message, &server_name).await;
                        }
                    }
                } else if let Ok(message) = serde_json::from_value::<ServerMessage>(value) {
                    Self::dispatch_message(&pending, message, &server_name).await;
                }
            }
            // Process exited or closed its stdout; wake every waiter.
            pending.lock().await.clear();
        });
    }

    fn spawn_stderr_drain(stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(_)) = reader.next_line().await {}
        });
    }

    async fn dispatch_message(pending: &PendingMap, message: ServerMessage, server_name: &str) {
        match &message {
            ServerMessage::Response(response) => {
                debug!(server = %server_name, response_id = ?response.id, "received stdio response");
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                debug!(
                    server = %server_name,
                    error_id = ?error.id,
                    error_code = error.error.code,
                    "received stdio error"
                );
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                debug!(
                    server = %server_name,
                    method = %request.method(),
                    "ignoring unsupported server-initiated request"
                );
            }
            ServerMessage::Notification(_) => {
                debug!(server = %server_name, "received stdio notification");
            }
        }
    }

    fn next_request_id(&self) -> RequestId {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        RequestId::Integer(id)
    }

    async fn write_payload(&self, payload: &str, what: &str) -> Result<(), McpError> {
        let lock_timeout = tokio::time::Duration::from_secs(STDIO_WRITE_TIMEOUT_SECONDS);
        let write_timeout = tokio::time::Duration::from_secs(STDIO_WRITE_TIMEOUT_SECONDS);

        let mut stdin = tokio::time::timeout(lock_timeout, self.stdin.lock())
            .await
            .map_err(|_| McpError::Timeout(format!("stdin lock for {what}")))?;
        tokio::time::timeout(write_timeout, stdin.write_all(payload.as_bytes()))
            .await
            .map_err(|_| McpError::Timeout(format!("writing {what}")))?
            .map_err(|err| McpError::Connection(err.to_string()))?;
        tokio::time::timeout(write_timeout, stdin.write_all(b"\n"))
            .await
            .map_err(|_| McpError::Timeout(format!("writing {what}")))?
            .map_err(|err| McpError::Connection(err.to_string()))?;
        tokio::time::timeout(write_timeout, stdin.flush())
            .await
            .map_err(|_| McpError::Timeout(format!("flushing {what}")))?
            .map_err(|err| McpError::Connection(err.to_string()))?;
        Ok(())
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message =
            ClientMessage::from_message(MessageFromClient::NotificationFromClient(notification), None)
                .map_err(|err| McpError::Protocol(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| McpError::Protocol(err.to_string()))?;
        self.write_payload(&payload, "stdio notification").await
    }
}

#[async_trait]
impl super::McpTransport for StdioTransport {
    async fn initialize(
        &self,
        params: InitializeRequestParams,
    ) -> Result<InitializeResult, McpError> {
        let response = self
            .request(RequestFromClient::InitializeRequest(params))
            .await?;
        let result = protocol::parse_initialize_result(response)?;
        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(result)
    }

    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let request_id = self.next_request_id();
        debug!(server = %self.server_name, request_id = ?request_id, "sending stdio request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(request_id.clone(), tx);
        }

        let payload =
            serde_json::to_string(&message).map_err(|err| McpError::Protocol(err.to_string()))?;
        if let Err(err) = self.write_payload(&payload, "stdio request").await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        let response_timeout = tokio::time::Duration::from_secs(STDIO_REQUEST_TIMEOUT_SECONDS);
        match tokio::time::timeout(response_timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(McpError::Connection(
                "stdio server closed before responding".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(McpError::Timeout("stdio request".to_string()))
            }
        }
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut child) = child.take() {
            if let Err(err) = child.kill().await {
                debug!(server = %self.server_name, error = %err, "stdio child kill failed");
            }
        }
        self.pending.lock().await.clear();
    }
}
