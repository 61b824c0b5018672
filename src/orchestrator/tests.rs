use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map};

use super::*;
use crate::core::config::data::ServerConfig;
use crate::mcp::session::ServerSession;
use crate::mcp::testing::{tool_fixture, FakeTransport};
use crate::oracle::testing::ScriptedOracle;

fn server_config(name: &str, allowed: &[&str]) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        transport: Some("streamable-http".to_string()),
        base_url: Some("http://localhost:8000/mcp".to_string()),
        command: None,
        args: None,
        env: None,
        allowed_tools: allowed.iter().map(|tool| tool.to_string()).collect(),
        tool_hints: HashMap::new(),
    }
}

fn price_tool() -> rust_mcp_schema::Tool {
    tool_fixture(
        "get_price",
        "Get the latest price for a trading pair. For crypto symbols use the full pair, e.g. BTCUSDT.",
        json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string", "description": "Trading pair, e.g. BTCUSDT"}
            },
            "required": ["symbol"]
        }),
    )
}

fn order_tool() -> rust_mcp_schema::Tool {
    tool_fixture(
        "place_order",
        "Place a live trading order.",
        json!({
            "type": "object",
            "properties": {
                "symbol": {"type": "string", "description": "Trading pair"}
            },
            "required": ["symbol"]
        }),
    )
}

fn event(channel: &str, user: &str, text: &str) -> InboundEvent {
    InboundEvent {
        channel: channel.to_string(),
        user: user.to_string(),
        text: text.to_string(),
        message_id: "1".to_string(),
    }
}

async fn started_orchestrator(
    transport: Arc<FakeTransport>,
    allowed: &[&str],
    oracle: Arc<ScriptedOracle>,
) -> Orchestrator {
    let session = Arc::new(ServerSession::with_transport(
        server_config("exchange", allowed),
        transport,
    ));
    let orchestrator = Orchestrator::with_sessions(vec![session], oracle);
    orchestrator.start_all().await;
    orchestrator
}

#[tokio::test]
async fn denied_tools_are_never_rendered_and_never_executed() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool(), order_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[]));
    let orchestrator = started_orchestrator(transport.clone(), &["get_price"], oracle).await;

    let catalog = orchestrator.catalog_snapshot().await;
    assert!(!catalog.describe_for_oracle().contains("place_order"));

    let mut arguments = Map::new();
    arguments.insert("symbol".to_string(), json!("BTCUSDT"));
    let reply = orchestrator
        .execute("place_order", arguments, "place an order")
        .await;

    assert!(reply.contains("not available or not allowed"));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn one_failed_server_does_not_prevent_the_others() {
    let broken = Arc::new(ServerSession::with_transport(
        server_config("broken", &[]),
        Arc::new(FakeTransport::failing_initialize()),
    ));
    let healthy = Arc::new(ServerSession::with_transport(
        server_config("exchange", &[]),
        Arc::new(FakeTransport::with_tools(vec![price_tool()])),
    ));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[]));
    let orchestrator = Orchestrator::with_sessions(vec![broken.clone(), healthy.clone()], oracle);

    orchestrator.start_all().await;

    assert_eq!(broken.state().await, SessionState::Failed);
    assert_eq!(healthy.state().await, SessionState::Ready);

    let catalog = orchestrator.catalog_snapshot().await;
    assert_eq!(catalog.allowed_len(), 1);
    assert!(catalog.is_allowed("get_price"));
}

#[tokio::test]
async fn pending_clarifications_do_not_leak_between_users() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[
        // alice's intent analysis: tool known, symbol missing
        "TOOL: get_price\nCLARIFY: What symbol do you want to look up?",
        // bob's message must go through fresh analysis, not resolution
        "GREETING: true",
    ]));
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle.clone()).await;

    let alice_reply = orchestrator
        .handle_event(&event("C1", "alice", "look up a price"))
        .await;
    assert!(alice_reply.contains("What symbol"));

    let bob_reply = orchestrator
        .handle_event(&event("C1", "bob", "hello there"))
        .await;
    assert!(bob_reply.starts_with("Hello"));

    // alice's pending clarification survived bob's turn
    oracle
        .push("TOOL: get_price\nARGS: {\"symbol\": \"AAPL\"}")
        .await;
    oracle.push("Apple is trading at 190 dollars.").await;
    transport.push_call_text("190.00").await;

    let alice_result = orchestrator
        .handle_event(&event("C1", "alice", "AAPL"))
        .await;
    assert_eq!(alice_result, "Apple is trading at 190 dollars.");
}

#[tokio::test]
async fn btc_price_scenario_runs_end_to_end() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[
        "TOOL: get_price\nCLARIFY: Which trading pair? For crypto use the full pair, e.g. BTCUSDT.",
        "TOOL: get_price\nARGS: {\"symbol\": \"BTCUSDT\"}",
        "Bitcoin is currently trading at 42,500 dollars.",
    ]));
    transport
        .push_call_result(json!({
            "content": [{"type": "text", "text": "{\"symbol\":\"BTCUSDT\",\"price\":\"42500.00\"}"}]
        }))
        .await;
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle).await;

    let first = orchestrator
        .handle_event(&event("C1", "alice", "What's BTC price?"))
        .await;
    assert!(first.contains("Which trading pair"));

    let second = orchestrator.handle_event(&event("C1", "alice", "BTC")).await;
    assert_eq!(second, "Bitcoin is currently trading at 42,500 dollars.");
    assert!(!second.contains('{'));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn unbalanced_oracle_reply_degrades_to_a_refusal() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[
        "TOOL: get_price\nARGS: {\"symbol\": \"BTCUSDT\"",
    ]));
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle).await;

    let reply = orchestrator
        .handle_event(&event("C1", "alice", "What's BTC price?"))
        .await;

    assert!(reply.contains("I can only help with"));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn unrelated_reply_drops_the_pending_clarification() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[
        "TOOL: get_price\nCLARIFY: What symbol do you want to look up?",
        "CONVERSATIONAL: true",
        // next turn must be fresh intent analysis again
        "GREETING: true",
    ]));
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle).await;

    let first = orchestrator
        .handle_event(&event("C1", "alice", "look up a price"))
        .await;
    assert!(first.contains("What symbol"));

    let second = orchestrator
        .handle_event(&event("C1", "alice", "tell me a joke"))
        .await;
    assert!(second.contains("I can only help with"));

    let third = orchestrator.handle_event(&event("C1", "alice", "hi")).await;
    assert!(third.starts_with("Hello"));
}

#[tokio::test]
async fn unparseable_clarification_reply_asks_for_a_rephrase() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[
        "TOOL: get_price\nCLARIFY: What symbol do you want to look up?",
        "I could not make sense of that reply at all.",
        "GREETING: true",
    ]));
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle).await;

    orchestrator
        .handle_event(&event("C1", "alice", "look up a price"))
        .await;
    let second = orchestrator
        .handle_event(&event("C1", "alice", "mumble mumble"))
        .await;
    assert_eq!(second, REPHRASE_MESSAGE);

    // pending was cleared: the next message is analyzed fresh
    let third = orchestrator.handle_event(&event("C1", "alice", "hi")).await;
    assert!(third.starts_with("Hello"));
}

#[tokio::test]
async fn missing_required_parameters_are_caught_without_the_oracle() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    // The oracle claims the call is ready but omits the required symbol.
    let oracle = Arc::new(ScriptedOracle::with_replies(&["TOOL: get_price\nARGS: {}"]));
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle).await;

    let reply = orchestrator
        .handle_event(&event("C1", "alice", "get me a price"))
        .await;

    assert!(reply.contains("I need the following information"));
    assert!(reply.contains("symbol"));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn empty_tool_results_are_reported_verbatim() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[
        "TOOL: get_price\nARGS: {\"symbol\": \"BTCUSDT\"}",
    ]));
    transport
        .push_call_result(json!({"content": [{"type": "text", "text": "   "}]}))
        .await;
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle).await;

    let reply = orchestrator
        .handle_event(&event("C1", "alice", "What's BTC price?"))
        .await;

    assert_eq!(reply, "The get_price tool executed but returned no data.");
}

#[tokio::test]
async fn tool_error_results_surface_as_a_generic_failure() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[
        "TOOL: get_price\nARGS: {\"symbol\": \"BTCUSDT\"}",
    ]));
    transport
        .push_call_result(json!({
            "content": [{"type": "text", "text": "exchange exploded"}],
            "isError": true
        }))
        .await;
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle).await;

    let reply = orchestrator
        .handle_event(&event("C1", "alice", "What's BTC price?"))
        .await;

    assert!(reply.contains("reported an error"));
    assert!(!reply.contains("exploded"));
}

#[tokio::test]
async fn oracle_outage_degrades_to_an_apology() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool()]));
    let oracle = Arc::new(ScriptedOracle::failing());
    let orchestrator = started_orchestrator(transport.clone(), &[], oracle).await;

    let reply = orchestrator
        .handle_event(&event("C1", "alice", "What's BTC price?"))
        .await;

    assert_eq!(reply, ORACLE_APOLOGY);
}

#[tokio::test]
async fn help_queries_list_the_allowed_tools() {
    let transport = Arc::new(FakeTransport::with_tools(vec![price_tool(), order_tool()]));
    let oracle = Arc::new(ScriptedOracle::with_replies(&["CONVERSATIONAL: true"]));
    let orchestrator = started_orchestrator(transport.clone(), &["get_price"], oracle).await;

    let reply = orchestrator
        .handle_event(&event("C1", "alice", "what tools do you have?"))
        .await;

    assert!(reply.contains("get_price"));
    assert!(!reply.contains("place_order"));
}

#[tokio::test]
async fn shutdown_stops_every_session() {
    let first = Arc::new(ServerSession::with_transport(
        server_config("one", &[]),
        Arc::new(FakeTransport::with_tools(Vec::new())),
    ));
    let second = Arc::new(ServerSession::with_transport(
        server_config("two", &[]),
        Arc::new(FakeTransport::with_tools(Vec::new())),
    ));
    let oracle = Arc::new(ScriptedOracle::with_replies(&[]));
    let orchestrator = Orchestrator::with_sessions(vec![first.clone(), second.clone()], oracle);

    orchestrator.start_all().await;
    orchestrator.shutdown().await;

    assert_eq!(first.state().await, SessionState::Stopped);
    assert_eq!(second.state().await, SessionState::Stopped);
}
