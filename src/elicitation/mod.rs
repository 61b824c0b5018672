//! Intent analysis and clarification resolution against the oracle.
//!
//! The engine is stateless: decisions are pure functions of the utterance,
//! the allowed-tool catalog, and the conversation history. All parsing
//! fragility is confined to [`parser`], which degrades every malformed reply
//! to a safe refusal.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api::ChatMessage;
use crate::conversation::{PendingClarification, Turn};
use crate::core::prompts::PromptLibrary;
use crate::mcp::catalog::{ToolCatalog, ToolDescriptor};
use crate::oracle::{ChatOracle, OracleError};

mod parser;

use parser::{parse_reply, ParsedReply};

/// Outcome of analyzing one utterance.
#[derive(Debug)]
pub enum Decision {
    /// A tool and a full argument object are ready to run.
    Execute {
        tool: String,
        arguments: Map<String, Value>,
    },
    /// Ask the user a question. `tool` is `None` when the ambiguity is about
    /// which tool rather than its parameters.
    Clarify {
        tool: Option<String>,
        question: String,
    },
    /// No available tool serves the request.
    Refuse,
    /// Respond with a capability summary.
    Greeting,
}

/// Outcome of resolving a pending clarification. An unrelated reply is
/// distinct from a still-ambiguous one: the pending state is dropped rather
/// than re-asked.
#[derive(Debug)]
pub enum Resolution {
    Decided(Decision),
    Unrelated,
}

/// How many history turns are shown to the oracle during intent analysis.
const HISTORY_CONTEXT_TURNS: usize = 3;

pub struct ElicitationEngine {
    oracle: Arc<dyn ChatOracle>,
    prompts: Arc<PromptLibrary>,
}

impl ElicitationEngine {
    pub fn new(oracle: Arc<dyn ChatOracle>, prompts: Arc<PromptLibrary>) -> Self {
        Self { oracle, prompts }
    }

    /// One oracle call deciding what to do with a fresh utterance.
    pub async fn analyze_intent(
        &self,
        utterance: &str,
        catalog: &ToolCatalog,
        history: &[Turn],
    ) -> Result<Decision, OracleError> {
        let system = self
            .prompts
            .intent_analysis_system(&catalog.describe_for_oracle());
        let mut messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(format!("User query: {utterance}")),
        ];

        let recent: Vec<String> = history
            .iter()
            .rev()
            .take(HISTORY_CONTEXT_TURNS)
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect();
        if !recent.is_empty() {
            let context: Vec<String> = recent.into_iter().rev().collect();
            messages.push(ChatMessage::user(format!(
                "Previous context:\n{}",
                context.join("\n")
            )));
        }

        let reply = self.oracle.get_response(&messages).await?;
        debug!(utterance, reply = %reply.chars().take(120).collect::<String>(), "intent analysis reply");

        Ok(match parse_reply(&reply, catalog) {
            ParsedReply::Greeting => Decision::Greeting,
            ParsedReply::Conversational => Decision::Refuse,
            ParsedReply::Clarify { tool, question } => Decision::Clarify { tool, question },
            ParsedReply::Invoke { tool, arguments } => Decision::Execute { tool, arguments },
            ParsedReply::UnknownTool { tool } => {
                warn!(tool = %tool, "oracle named a tool outside the allowed catalog");
                Decision::Refuse
            }
            ParsedReply::Unparseable => {
                warn!("intent reply did not match any expected shape");
                Decision::Refuse
            }
        })
    }

    /// Resolves the user's reply to a pending clarification question.
    ///
    /// When the pending tool was never identified (or has since vanished from
    /// the catalog), the reply goes through full intent analysis instead.
    pub async fn resolve_clarification(
        &self,
        pending: &PendingClarification,
        reply_text: &str,
        catalog: &ToolCatalog,
        history: &[Turn],
    ) -> Result<Resolution, OracleError> {
        let Some(tool_name) = pending.tool.as_deref() else {
            let decision = self.analyze_intent(reply_text, catalog, history).await?;
            return Ok(Resolution::Decided(decision));
        };
        let Some(descriptor) = catalog.find_allowed(tool_name) else {
            let decision = self.analyze_intent(reply_text, catalog, history).await?;
            return Ok(Resolution::Decided(decision));
        };

        let system = self.prompts.clarification_system(
            tool_name,
            &pending.question,
            &pending.original_utterance,
            &descriptor.parameter_info(),
        );
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(format!(
                "Original tool we're trying to use: {tool_name}\nUser's clarification reply: {reply_text}"
            )),
        ];

        let reply = self.oracle.get_response(&messages).await?;
        debug!(tool = tool_name, reply = %reply.chars().take(120).collect::<String>(), "clarification reply");

        Ok(match parse_reply(&reply, catalog) {
            ParsedReply::Conversational | ParsedReply::Greeting => Resolution::Unrelated,
            ParsedReply::Invoke { tool, arguments } => {
                Resolution::Decided(Decision::Execute { tool, arguments })
            }
            ParsedReply::Clarify { question, .. } => Resolution::Decided(Decision::Clarify {
                tool: Some(tool_name.to_string()),
                question,
            }),
            ParsedReply::UnknownTool { tool } => {
                warn!(tool = %tool, "clarification reply named a tool outside the allowed catalog");
                Resolution::Decided(Decision::Refuse)
            }
            ParsedReply::Unparseable => Resolution::Decided(Decision::Refuse),
        })
    }
}

/// Deterministic, schema-driven check that every required parameter is
/// present. This never consults the oracle: the required-key list and the
/// descriptions come straight from the tool's schema.
pub fn missing_parameter_question(
    descriptor: &ToolDescriptor,
    arguments: &Map<String, Value>,
) -> Option<String> {
    let missing: Vec<String> = descriptor
        .required_parameters()
        .into_iter()
        .filter(|parameter| !arguments.contains_key(parameter))
        .collect();
    if missing.is_empty() {
        return None;
    }

    let lines: Vec<String> = missing
        .iter()
        .map(|parameter| {
            format!(
                "- **{parameter}**: {}",
                descriptor.parameter_description(parameter)
            )
        })
        .collect();
    Some(format!(
        "To use the **{}** tool, I need the following information:\n\n{}",
        descriptor.name,
        lines.join("\n")
    ))
}
