//! Prompt templates for every oracle call the system makes: intent analysis,
//! clarification resolution, and result interpretation. Defaults are built in
//! and can be overridden globally or per server from configuration.

use std::collections::HashMap;

use crate::core::config::data::{LimitsConfig, PromptOverrides, ServerPromptOverrides};

const DEFAULT_INTENT_SYSTEM: &str = "\
You are an expert at analyzing user requests and deciding which tool, if any, can serve them.
Reply using EXACTLY one of these formats and nothing else:

If the user is only greeting you (hi, hello, good morning and similar):
GREETING: true

If one tool matches and every required parameter value can be determined from the request:
TOOL: <tool name>
ARGS: {\"parameter\": \"value\"}

If one tool matches but required information is missing or ambiguous:
TOOL: <tool name>
CLARIFY: <one short question asking for the missing information>

If you cannot tell which tool the user means:
CLARIFY: <one short question asking them to choose>

If no available tool serves the purpose of the request:
CONVERSATIONAL: true

Rules:
- Only name tools from the list below. Never invent a tool.
- ARGS must be a single JSON object using the exact parameter names from the tool's schema.
- Follow any formatting guidance given in a tool's description when filling in parameter values.
- Do not answer the user's question yourself.";

const DEFAULT_INTERPRET_SYSTEM: &str = "\
You are presenting the result of a tool call to the user. Analyze the data and
present the useful information clearly and conversationally. Do not show raw
JSON; answer in natural language.";

const DEFAULT_INTERPRET_LARGE_SYSTEM: &str = "\
You are presenting the result of a tool call to the user. The result is long,
so extract only the parts that answer the user's question and present them
clearly. Do not restate the whole payload and do not show raw JSON.";

const DEFAULT_INTERPRET_USER: &str = "\
User asked: \"{user_query}\"

The {tool_name} tool returned:
{result}

Present the key information in a helpful answer.";

const DEFAULT_INTERPRET_LARGE_USER: &str = "\
User asked: \"{user_query}\"

The {tool_name} tool returned a large result:
{result}

Extract and present only the information that answers the question.";

/// Templates plus the large-result threshold, with optional per-server
/// interpretation overrides.
pub struct PromptLibrary {
    intent_system: String,
    interpret_system: String,
    interpret_large_system: String,
    interpret_user: String,
    interpret_large_user: String,
    large_result_chars: usize,
    server_overrides: HashMap<String, ServerPromptOverrides>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self {
            intent_system: DEFAULT_INTENT_SYSTEM.to_string(),
            interpret_system: DEFAULT_INTERPRET_SYSTEM.to_string(),
            interpret_large_system: DEFAULT_INTERPRET_LARGE_SYSTEM.to_string(),
            interpret_user: DEFAULT_INTERPRET_USER.to_string(),
            interpret_large_user: DEFAULT_INTERPRET_LARGE_USER.to_string(),
            large_result_chars: 2000,
            server_overrides: HashMap::new(),
        }
    }
}

impl PromptLibrary {
    pub fn from_config(overrides: &PromptOverrides, limits: &LimitsConfig) -> Self {
        let defaults = Self::default();
        Self {
            intent_system: overrides
                .intent_system
                .clone()
                .unwrap_or(defaults.intent_system),
            interpret_system: overrides
                .interpret_system
                .clone()
                .unwrap_or(defaults.interpret_system),
            interpret_large_system: overrides
                .interpret_large_system
                .clone()
                .unwrap_or(defaults.interpret_large_system),
            interpret_user: overrides
                .interpret_user
                .clone()
                .unwrap_or(defaults.interpret_user),
            interpret_large_user: overrides
                .interpret_large_user
                .clone()
                .unwrap_or(defaults.interpret_large_user),
            large_result_chars: limits.large_result_chars,
            server_overrides: overrides.servers.clone(),
        }
    }

    pub fn is_large(&self, result: &str) -> bool {
        result.chars().count() > self.large_result_chars
    }

    /// Intent-analysis system prompt with the rendered allowed-tool catalog
    /// appended.
    pub fn intent_analysis_system(&self, rendered_catalog: &str) -> String {
        format!(
            "{}\n\nAvailable tools:\n{}",
            self.intent_system, rendered_catalog
        )
    }

    /// System prompt for resolving a pending clarification. Scopes the oracle
    /// to the question that was asked and the originally-attempted tool, and
    /// spells out how to treat short affirmatives and unrelated replies.
    pub fn clarification_system(
        &self,
        tool_name: &str,
        question: &str,
        original_utterance: &str,
        parameter_info: &str,
    ) -> String {
        format!(
            "You are extracting parameter values from a user's reply to a clarification question.\n\
\n\
CONTEXT:\n\
- The user's original request was: \"{original_utterance}\"\n\
- We asked the user: \"{question}\"\n\
- The user is now answering that specific question.\n\
- The user's original intent was to use the tool '{tool_name}'.\n\
\n\
Tool parameters needed:\n\
{parameter_info}\n\
\n\
IMPORTANT:\n\
- Extract parameter values from the user's natural-language reply.\n\
- Replies like \"yes\", \"ok\", \"sure\", or a bare value are VALID answers to the question.\n\
- If the user says \"yes\" or \"ok\" without more detail, use any default named in the question itself (for example \"(orders by default)\" means use \"orders\").\n\
- Use the exact parameter names and value formats the tool expects, including any formatting guidance from the tool's description.\n\
- ONLY mark the reply as CONVERSATIONAL when it is a completely different request (for example \"what time is it?\" when asked for a symbol).\n\
\n\
Reply using EXACTLY one of these formats:\n\
\n\
If you can extract every required parameter:\n\
TOOL: {tool_name}\n\
ARGS: {{\"parameter\": \"value\"}}\n\
\n\
If you still need information:\n\
CLARIFY: <what you still need>\n\
\n\
If the reply is unrelated to the question:\n\
CONVERSATIONAL: true\n\
\n\
EXAMPLES:\n\
\n\
Question: \"What symbol do you want to look up?\" Reply: \"AAPL\"\n\
TOOL: {tool_name}\n\
ARGS: {{\"symbol\": \"AAPL\"}}\n\
\n\
Question: \"Do you want the default topic? (orders by default)\" Reply: \"yes\"\n\
TOOL: {tool_name}\n\
ARGS: {{\"topic\": \"orders\"}}\n\
\n\
Question: \"What symbol do you want to look up?\" Reply: \"what time is it?\"\n\
CONVERSATIONAL: true"
        )
    }

    pub fn interpret_system(&self, server: &str, is_large: bool) -> &str {
        if let Some(overrides) = self.server_overrides.get(server) {
            if let Some(prompt) = overrides.interpret_system.as_deref() {
                return prompt;
            }
        }
        if is_large {
            &self.interpret_large_system
        } else {
            &self.interpret_system
        }
    }

    pub fn interpret_user(
        &self,
        server: &str,
        is_large: bool,
        user_query: &str,
        tool_name: &str,
        result: &str,
    ) -> String {
        let template = self
            .server_overrides
            .get(server)
            .and_then(|overrides| overrides.interpret_user.as_deref())
            .unwrap_or(if is_large {
                &self.interpret_large_user
            } else {
                &self.interpret_user
            });
        template
            .replace("{user_query}", user_query)
            .replace("{tool_name}", tool_name)
            .replace("{result}", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_threshold_is_a_strict_boundary() {
        let library = PromptLibrary::default();
        assert!(!library.is_large(&"x".repeat(2000)));
        assert!(library.is_large(&"x".repeat(2001)));
    }

    #[test]
    fn interpret_user_fills_the_template() {
        let library = PromptLibrary::default();
        let prompt = library.interpret_user("exchange", false, "BTC price?", "get_price", "42.5");
        assert!(prompt.contains("BTC price?"));
        assert!(prompt.contains("get_price"));
        assert!(prompt.contains("42.5"));
    }

    #[test]
    fn server_overrides_take_precedence() {
        let mut overrides = PromptOverrides::default();
        overrides.servers.insert(
            "exchange".to_string(),
            ServerPromptOverrides {
                interpret_system: Some("Talk like a trader.".to_string()),
                interpret_user: None,
            },
        );
        let library = PromptLibrary::from_config(&overrides, &LimitsConfig::default());

        assert_eq!(library.interpret_system("exchange", false), "Talk like a trader.");
        assert_ne!(library.interpret_system("other", false), "Talk like a trader.");
    }

    #[test]
    fn clarification_prompt_embeds_the_pending_context() {
        let library = PromptLibrary::default();
        let prompt = library.clarification_system(
            "get_price",
            "What symbol?",
            "what's the price?",
            "  • symbol (string) (REQUIRED): Trading pair",
        );
        assert!(prompt.contains("get_price"));
        assert!(prompt.contains("What symbol?"));
        assert!(prompt.contains("what's the price?"));
        assert!(prompt.contains("Trading pair"));
    }
}
