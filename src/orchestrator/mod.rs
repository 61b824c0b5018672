//! The orchestrator: receives inbound utterances, drives the elicitation
//! state machine, executes tools through the session registry, and renders
//! results back into natural language.
//!
//! The per-utterance handler is the last line of defense: every failure mode
//! below it maps to a user-visible string, never to a fault that could stop
//! message processing.

use futures_util::stream::{self, StreamExt};
use rust_mcp_schema::{CallToolResult, ContentBlock};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::api::ChatMessage;
use crate::conversation::{
    ConversationKey, ConversationState, ConversationStore, PendingClarification,
};
use crate::core::config::data::Config;
use crate::core::prompts::PromptLibrary;
use crate::elicitation::{missing_parameter_question, Decision, ElicitationEngine, Resolution};
use crate::mcp::catalog::{tool_allowed, ToolCatalog};
use crate::mcp::session::{ServerSession, SessionState};
use crate::oracle::{ChatOracle, ORACLE_APOLOGY};

#[cfg(test)]
mod tests;

/// One inbound chat event. Direct messages and mentions both funnel here;
/// the core does not care which platform produced it.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub channel: String,
    pub user: String,
    pub text: String,
    #[serde(default)]
    pub message_id: String,
}

const STARTUP_CONCURRENCY_LIMIT: usize = 3;
const REPHRASE_MESSAGE: &str = "Sorry, I didn't catch that. Could you rephrase your answer?";

pub struct Orchestrator {
    sessions: Vec<Arc<ServerSession>>,
    catalog: RwLock<ToolCatalog>,
    engine: ElicitationEngine,
    oracle: Arc<dyn ChatOracle>,
    prompts: Arc<PromptLibrary>,
    store: ConversationStore,
}

impl Orchestrator {
    pub fn from_config(config: &Config, oracle: Arc<dyn ChatOracle>) -> Self {
        let sessions = config
            .servers
            .iter()
            .cloned()
            .map(|server| Arc::new(ServerSession::new(server)))
            .collect();
        let prompts = Arc::new(PromptLibrary::from_config(&config.prompts, &config.limits));
        Self::assemble(sessions, oracle, prompts, config.limits.history_turns)
    }

    /// Wires an orchestrator around pre-built sessions. Tests use this with
    /// transport doubles injected via [`ServerSession::with_transport`].
    pub fn with_sessions(sessions: Vec<Arc<ServerSession>>, oracle: Arc<dyn ChatOracle>) -> Self {
        Self::assemble(sessions, oracle, Arc::new(PromptLibrary::default()), 10)
    }

    fn assemble(
        sessions: Vec<Arc<ServerSession>>,
        oracle: Arc<dyn ChatOracle>,
        prompts: Arc<PromptLibrary>,
        history_turns: usize,
    ) -> Self {
        let engine = ElicitationEngine::new(oracle.clone(), prompts.clone());
        Self {
            sessions,
            catalog: RwLock::new(ToolCatalog::default()),
            engine,
            oracle,
            prompts,
            store: ConversationStore::new(history_turns),
        }
    }

    /// Brings up every configured server concurrently. Failures are isolated:
    /// a server that cannot connect is logged and skipped, and the catalog is
    /// built from the ones that reached `Ready`.
    pub async fn start_all(&self) {
        stream::iter(self.sessions.clone())
            .for_each_concurrent(STARTUP_CONCURRENCY_LIMIT, |session| async move {
                match session.start().await {
                    Ok(()) => info!(server = %session.name(), "server session ready"),
                    Err(err) => warn!(
                        server = %session.name(),
                        error = %err,
                        "server failed to start; continuing without it"
                    ),
                }
            })
            .await;
        self.refresh_catalog().await;

        let catalog = self.catalog.read().await;
        info!(tools = catalog.allowed_len(), "tool catalog ready");
    }

    /// Rebuilds the catalog from every `Ready` session, re-deriving the
    /// allow flags from current configuration.
    pub async fn refresh_catalog(&self) {
        for session in &self.sessions {
            if session.state().await != SessionState::Ready {
                continue;
            }
            match session.list_tools().await {
                Ok(tools) => {
                    let config = session.config();
                    let mut catalog = self.catalog.write().await;
                    catalog.refresh_server(
                        session.name(),
                        &config.allowed_tools,
                        &config.tool_hints,
                        &tools,
                    );
                    info!(server = %session.name(), tools = tools.len(), "catalog refreshed");
                }
                Err(err) => {
                    warn!(server = %session.name(), error = %err, "tool discovery failed");
                }
            }
        }
    }

    pub async fn catalog_snapshot(&self) -> ToolCatalog {
        self.catalog.read().await.clone()
    }

    /// Processes one utterance and produces the outgoing text. Holding the
    /// conversation lock for the whole turn serializes near-simultaneous
    /// messages from the same (channel, user) pair; other pairs proceed in
    /// parallel.
    pub async fn handle_event(&self, event: &InboundEvent) -> String {
        let key = ConversationKey::new(&event.channel, &event.user);
        let text = event.text.trim().to_string();
        if text.is_empty() {
            return "How can I help?".to_string();
        }

        let entry = self.store.entry(&key).await;
        let mut convo = entry.lock().await;

        if let Some(pending) = convo.pending().cloned() {
            self.handle_clarification_reply(&mut convo, &pending, &text)
                .await
        } else {
            self.handle_fresh_utterance(&mut convo, &text).await
        }
    }

    async fn handle_fresh_utterance(&self, convo: &mut ConversationState, text: &str) -> String {
        let catalog = self.catalog.read().await.clone();
        let history = convo.recent(6);

        let decision = match self.engine.analyze_intent(text, &catalog, &history).await {
            Ok(decision) => decision,
            Err(err) => {
                error!(error = %err, "oracle unavailable during intent analysis");
                convo.push_user(text);
                return ORACLE_APOLOGY.to_string();
            }
        };
        convo.push_user(text);

        match decision {
            Decision::Greeting => {
                let reply = greeting_response(&catalog);
                convo.push_assistant(&reply);
                reply
            }
            Decision::Clarify { tool, question } => {
                convo.set_pending(PendingClarification::new(tool, question.as_str(), text));
                question
            }
            Decision::Execute { tool, arguments } => {
                if let Some(question) = unmet_requirements(&catalog, &tool, &arguments) {
                    convo.set_pending(PendingClarification::new(
                        Some(tool),
                        question.as_str(),
                        text,
                    ));
                    return question;
                }
                let reply = self
                    .execute_with_catalog(&catalog, &tool, arguments, text)
                    .await;
                convo.push_assistant(&reply);
                reply
            }
            Decision::Refuse => {
                let reply = self.refusal_or_meta(&catalog, text);
                convo.push_assistant(&reply);
                reply
            }
        }
    }

    async fn handle_clarification_reply(
        &self,
        convo: &mut ConversationState,
        pending: &PendingClarification,
        text: &str,
    ) -> String {
        let catalog = self.catalog.read().await.clone();
        let history = convo.recent(6);

        let resolution = match self
            .engine
            .resolve_clarification(pending, text, &catalog, &history)
            .await
        {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(error = %err, "oracle unavailable during clarification resolution");
                convo.clear_pending();
                convo.push_user(text);
                return ORACLE_APOLOGY.to_string();
            }
        };
        convo.push_user(text);

        match resolution {
            Resolution::Unrelated => {
                convo.clear_pending();
                let reply = refusal_response(&catalog);
                convo.push_assistant(&reply);
                reply
            }
            Resolution::Decided(Decision::Clarify { tool, question }) => {
                // Still ambiguous: stay in the waiting state with the updated
                // question and the same tool context.
                let tool = tool.or_else(|| pending.tool.clone());
                convo.set_pending(PendingClarification::new(
                    tool,
                    question.as_str(),
                    pending.original_utterance.as_str(),
                ));
                question
            }
            Resolution::Decided(Decision::Execute { tool, arguments }) => {
                convo.clear_pending();
                if let Some(question) = unmet_requirements(&catalog, &tool, &arguments) {
                    convo.set_pending(PendingClarification::new(
                        Some(tool),
                        question.as_str(),
                        pending.original_utterance.as_str(),
                    ));
                    return question;
                }
                let reply = self
                    .execute_with_catalog(&catalog, &tool, arguments, &pending.original_utterance)
                    .await;
                convo.push_assistant(&reply);
                reply
            }
            Resolution::Decided(Decision::Greeting) => {
                convo.clear_pending();
                let reply = greeting_response(&catalog);
                convo.push_assistant(&reply);
                reply
            }
            Resolution::Decided(Decision::Refuse) => {
                convo.clear_pending();
                convo.push_assistant(REPHRASE_MESSAGE);
                REPHRASE_MESSAGE.to_string()
            }
        }
    }

    /// Executes a tool by name against the current catalog snapshot.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
        original_query: &str,
    ) -> String {
        let catalog = self.catalog.read().await.clone();
        self.execute_with_catalog(&catalog, tool_name, arguments, original_query)
            .await
    }

    async fn execute_with_catalog(
        &self,
        catalog: &ToolCatalog,
        tool_name: &str,
        arguments: Map<String, Value>,
        original_query: &str,
    ) -> String {
        // Allow-list re-check at call time, against both the catalog snapshot
        // and the owning server's live configuration. The catalog may be
        // stale; the config cannot be.
        let Some(descriptor) = catalog.find_allowed(tool_name) else {
            warn!(tool = tool_name, "refusing to execute tool outside the allowed catalog");
            return format!("Sorry, the tool '{tool_name}' is not available or not allowed.");
        };
        let Some(session) = self
            .sessions
            .iter()
            .find(|session| session.name() == descriptor.server)
        else {
            error!(tool = tool_name, server = %descriptor.server, "no session for catalog entry");
            return format!("Sorry, couldn't find tool: {tool_name}");
        };
        if !tool_allowed(&session.config().allowed_tools, tool_name) {
            warn!(
                tool = tool_name,
                server = %session.name(),
                "allow-list re-check rejected execution"
            );
            return format!("Sorry, the tool '{tool_name}' is not available or not allowed.");
        }

        info!(tool = tool_name, server = %session.name(), "executing tool");
        let result = match session.call_tool(tool_name, Some(arguments)).await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    tool = tool_name,
                    server = %session.name(),
                    error = %err,
                    "tool execution failed"
                );
                return "Sorry, there was an error executing the tool.".to_string();
            }
        };

        if result.is_error == Some(true) {
            warn!(
                tool = tool_name,
                result = %tool_result_text(&result),
                "tool reported an error"
            );
            return format!("Sorry, the {tool_name} tool reported an error.");
        }

        let result_text = tool_result_text(&result);
        if result_text.trim().is_empty() {
            // Nothing for the oracle to interpret; report it as-is.
            return format!("The {tool_name} tool executed but returned no data.");
        }

        let is_large = self.prompts.is_large(&result_text);
        if is_large {
            info!(
                tool = tool_name,
                chars = result_text.chars().count(),
                "large tool result; asking the oracle to extract"
            );
        }
        let messages = vec![
            ChatMessage::system(self.prompts.interpret_system(&descriptor.server, is_large)),
            ChatMessage::user(self.prompts.interpret_user(
                &descriptor.server,
                is_large,
                original_query,
                tool_name,
                &result_text,
            )),
        ];
        match self.oracle.get_response(&messages).await {
            Ok(interpretation) => interpretation,
            Err(err) => {
                error!(error = %err, "oracle unavailable during result interpretation");
                ORACLE_APOLOGY.to_string()
            }
        }
    }

    fn refusal_or_meta(&self, catalog: &ToolCatalog, text: &str) -> String {
        if is_help_query(text) || is_tool_list_query(text) {
            return match catalog.tool_listing() {
                Some(listing) => format!("I can help with these tools:\n\n{listing}"),
                None => "I don't have any tools available at the moment.".to_string(),
            };
        }
        refusal_response(catalog)
    }

    /// Stops every session, tolerating teardown failures so one misbehaving
    /// server cannot block the shutdown of the rest.
    pub async fn shutdown(&self) {
        for session in &self.sessions {
            session.stop().await;
        }
        info!("all server sessions stopped");
    }
}

/// Schema-driven required-parameter check; returns the clarification question
/// when something is missing.
fn unmet_requirements(
    catalog: &ToolCatalog,
    tool: &str,
    arguments: &Map<String, Value>,
) -> Option<String> {
    let descriptor = catalog.find_allowed(tool)?;
    missing_parameter_question(descriptor, arguments)
}

fn greeting_response(catalog: &ToolCatalog) -> String {
    match catalog.tool_listing() {
        Some(listing) => format!(
            "Hello! 👋 I'm here to help. Here's what I can do:\n\n{listing}"
        ),
        None => "Hi there! 👋 I'm here to help, but I don't have any tools available at the moment."
            .to_string(),
    }
}

fn refusal_response(catalog: &ToolCatalog) -> String {
    format!(
        "I don't have access to that information. I can only help with {}.",
        catalog.capability_summary()
    )
}

fn is_help_query(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("help") && lower.split_whitespace().count() <= 3
}

fn is_tool_list_query(text: &str) -> bool {
    const PATTERNS: [&str; 7] = [
        "what tools",
        "list tools",
        "what can you",
        "what do you",
        "your capabilities",
        "available tools",
        "show me what",
    ];
    let lower = text.to_lowercase();
    PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Joins every text block of a tool result; non-text blocks fall back to
/// their JSON form.
fn tool_result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::TextContent(text) => text.text.clone(),
            other => serde_json::to_string(other)
                .unwrap_or_else(|_| "Unsupported content.".to_string()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
