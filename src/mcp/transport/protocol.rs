use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{CallToolResult, InitializeResult, ListToolsResult, RpcError};
use serde_json::Value;

use crate::mcp::error::McpError;

pub(crate) fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, McpError> {
    let value = parse_response_value(message)?;
    let result = serde_json::from_value::<InitializeResult>(value)
        .map_err(|err| McpError::Protocol(err.to_string()))?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::Protocol(
            "unexpected initialize response".to_string(),
        ));
    }
    Ok(result)
}

pub(crate) fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, McpError> {
    parse_response(message)
}

pub(crate) fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, McpError> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(message: ServerMessage) -> Result<T, McpError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| McpError::Protocol(err.to_string()))
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, McpError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| McpError::Protocol(err.to_string())),
        ServerMessage::Error(error) => Err(rejection(&error.error)),
        other => Err(McpError::Protocol(format!(
            "unexpected MCP server message: {other:?}"
        ))),
    }
}

fn rejection(error: &RpcError) -> McpError {
    let mut message = error.message.clone();
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()));
        if let Some(details) = details {
            if !details.is_empty() {
                message.push_str(": ");
                message.push_str(&details);
            }
        }
    }
    McpError::Rejected {
        code: error.code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::JSONRPC_INVALID_PARAMS;

    #[test]
    fn parse_initialize_rejects_blank_protocol_version() {
        let message = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "capabilities": {},
                "protocolVersion": " ",
                "serverInfo": {"name": "x", "version": "1.0.0"}
            }
        }))
        .expect("message should parse");

        assert!(parse_initialize_result(message).is_err());
    }

    #[test]
    fn error_responses_become_rejections_with_details() {
        let message: ServerMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {
                "code": JSONRPC_INVALID_PARAMS,
                "message": "invalid arguments",
                "data": {"details": "symbol is required"}
            }
        }))
        .expect("message should parse");

        match parse_response_value(message) {
            Err(McpError::Rejected { code, message }) => {
                assert_eq!(code, JSONRPC_INVALID_PARAMS);
                assert!(message.contains("symbol is required"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn call_tool_result_parses_from_response() {
        let message: ServerMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": {
                "content": [{"type": "text", "text": "42.5"}]
            }
        }))
        .expect("message should parse");

        let result = parse_call_tool(message).expect("call tool result");
        assert_eq!(result.content.len(), 1);
    }
}
