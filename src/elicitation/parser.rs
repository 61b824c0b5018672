//! Tolerant parsing of the oracle's marker-formatted replies.
//!
//! The oracle is untrusted: replies may wrap the markers in commentary, emit
//! malformed JSON, or name tools that do not exist. Every failure mode here
//! collapses to a safe variant; nothing in this module panics or errors.

use serde_json::{Map, Value};

use crate::mcp::catalog::ToolCatalog;

/// What the oracle's reply actually said, after validation against the
/// allowed catalog.
#[derive(Debug)]
pub(crate) enum ParsedReply {
    Greeting,
    Conversational,
    Clarify {
        tool: Option<String>,
        question: String,
    },
    Invoke {
        tool: String,
        arguments: Map<String, Value>,
    },
    /// The oracle named a tool that is not in the allowed catalog.
    UnknownTool { tool: String },
    /// Markers missing or malformed (unbalanced braces, invalid JSON, empty
    /// question).
    Unparseable,
}

pub(crate) fn parse_reply(reply: &str, catalog: &ToolCatalog) -> ParsedReply {
    if marker_is_true(reply, "GREETING:") {
        return ParsedReply::Greeting;
    }
    if marker_is_true(reply, "CONVERSATIONAL:") {
        return ParsedReply::Conversational;
    }

    if let Some(question) = marker_value(reply, "CLARIFY:") {
        if question.is_empty() {
            return ParsedReply::Unparseable;
        }
        // A tool named alongside the question narrows the pending context,
        // but only if it is actually in the allowed catalog.
        let tool = marker_value(reply, "TOOL:").filter(|tool| catalog.is_allowed(tool));
        return ParsedReply::Clarify {
            tool,
            question: question.to_string(),
        };
    }

    if let Some(tool) = marker_value(reply, "TOOL:") {
        if tool.is_empty() {
            return ParsedReply::Unparseable;
        }
        if !catalog.is_allowed(&tool) {
            return ParsedReply::UnknownTool {
                tool: tool.to_string(),
            };
        }

        let Some(args_at) = reply.find("ARGS:") else {
            // Tools without parameters are invoked with an empty object.
            return ParsedReply::Invoke {
                tool: tool.to_string(),
                arguments: Map::new(),
            };
        };
        let tail = &reply[args_at + "ARGS:".len()..];
        let Some(object_text) = extract_json_object(tail) else {
            return ParsedReply::Unparseable;
        };
        match serde_json::from_str::<Value>(object_text) {
            Ok(Value::Object(arguments)) => ParsedReply::Invoke {
                tool: tool.to_string(),
                arguments,
            },
            _ => ParsedReply::Unparseable,
        }
    } else {
        ParsedReply::Unparseable
    }
}

fn marker_is_true(reply: &str, marker: &str) -> bool {
    marker_value(reply, marker)
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("true"))
}

/// Finds the first line starting with `marker` and returns the trimmed rest.
fn marker_value(reply: &str, marker: &str) -> Option<String> {
    reply
        .lines()
        .map(str::trim_start)
        .find_map(|line| line.strip_prefix(marker))
        .map(|value| value.trim().to_string())
}

/// Locates the first `{` and scans to its matching `}` with depth counting,
/// skipping braces inside string literals. Returns `None` when the object
/// never closes. The reply may surround the object with arbitrary text.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::tool_fixture;
    use serde_json::json;
    use std::collections::HashMap;

    fn catalog() -> ToolCatalog {
        let mut catalog = ToolCatalog::default();
        catalog.refresh_server(
            "exchange",
            &[],
            &HashMap::new(),
            &[tool_fixture(
                "get_price",
                "Get the latest price",
                json!({
                    "type": "object",
                    "properties": {"symbol": {"type": "string", "description": "Trading pair"}},
                    "required": ["symbol"]
                }),
            )],
        );
        catalog
    }

    #[test]
    fn parses_a_plain_invocation() {
        let reply = "TOOL: get_price\nARGS: {\"symbol\": \"BTCUSDT\"}";
        match parse_reply(reply, &catalog()) {
            ParsedReply::Invoke { tool, arguments } => {
                assert_eq!(tool, "get_price");
                assert_eq!(arguments.get("symbol").and_then(Value::as_str), Some("BTCUSDT"));
            }
            other => panic!("expected invoke, got {other:?}"),
        }
    }

    #[test]
    fn tolerates_commentary_around_the_markers() {
        let reply = "Sure, I can do that.\nTOOL: get_price\nARGS: here you go {\"symbol\": \"ETHUSDT\"} hope that helps";
        match parse_reply(reply, &catalog()) {
            ParsedReply::Invoke { arguments, .. } => {
                assert_eq!(arguments.get("symbol").and_then(Value::as_str), Some("ETHUSDT"));
            }
            other => panic!("expected invoke, got {other:?}"),
        }
    }

    #[test]
    fn unbalanced_braces_are_unparseable_not_a_panic() {
        let reply = "TOOL: get_price\nARGS: {\"symbol\": \"BTCUSDT\"";
        assert!(matches!(
            parse_reply(reply, &catalog()),
            ParsedReply::Unparseable
        ));
    }

    #[test]
    fn invalid_json_inside_balanced_braces_is_unparseable() {
        let reply = "TOOL: get_price\nARGS: {symbol: BTCUSDT}";
        assert!(matches!(
            parse_reply(reply, &catalog()),
            ParsedReply::Unparseable
        ));
    }

    #[test]
    fn unknown_tools_are_flagged_not_invoked() {
        let reply = "TOOL: delete_everything\nARGS: {}";
        match parse_reply(reply, &catalog()) {
            ParsedReply::UnknownTool { tool } => assert_eq!(tool, "delete_everything"),
            other => panic!("expected unknown tool, got {other:?}"),
        }
    }

    #[test]
    fn greeting_and_conversational_markers_are_detected() {
        assert!(matches!(
            parse_reply("GREETING: true", &catalog()),
            ParsedReply::Greeting
        ));
        assert!(matches!(
            parse_reply("CONVERSATIONAL: true", &catalog()),
            ParsedReply::Conversational
        ));
    }

    #[test]
    fn clarify_keeps_the_tool_only_when_it_is_allowed() {
        let reply = "TOOL: get_price\nCLARIFY: What symbol do you want?";
        match parse_reply(reply, &catalog()) {
            ParsedReply::Clarify { tool, question } => {
                assert_eq!(tool.as_deref(), Some("get_price"));
                assert_eq!(question, "What symbol do you want?");
            }
            other => panic!("expected clarify, got {other:?}"),
        }

        let reply = "TOOL: not_a_tool\nCLARIFY: Which one?";
        match parse_reply(reply, &catalog()) {
            ParsedReply::Clarify { tool, .. } => assert!(tool.is_none()),
            other => panic!("expected clarify, got {other:?}"),
        }
    }

    #[test]
    fn tool_without_args_marker_invokes_with_empty_arguments() {
        let reply = "TOOL: get_price";
        match parse_reply(reply, &catalog()) {
            ParsedReply::Invoke { arguments, .. } => assert!(arguments.is_empty()),
            other => panic!("expected invoke, got {other:?}"),
        }
    }

    #[test]
    fn free_text_with_no_markers_is_unparseable() {
        assert!(matches!(
            parse_reply("The price of bitcoin is high today.", &catalog()),
            ParsedReply::Unparseable
        ));
    }

    #[test]
    fn json_extraction_skips_braces_inside_strings() {
        let text = " {\"note\": \"a } inside\", \"n\": 1} trailing";
        let object = extract_json_object(text).expect("object");
        assert_eq!(object, "{\"note\": \"a } inside\", \"n\": 1}");
    }

    #[test]
    fn nested_objects_are_captured_whole() {
        let text = "{\"outer\": {\"inner\": 2}}";
        assert_eq!(extract_json_object(text), Some(text));
    }
}
