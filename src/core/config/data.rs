use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration, deserialized from `concierge.toml` at startup and
/// immutable thereafter.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub prompts: PromptOverrides,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Connection settings for the language-model oracle. Any OpenAI-compatible
/// chat-completions endpoint works; the default points at a local Ollama.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_base_url")]
    pub base_url: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    /// Name of the environment variable holding the API key, if one is needed.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub temperature: Option<f32>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: default_oracle_base_url(),
            model: default_oracle_model(),
            api_key_env: default_api_key_env(),
            temperature: None,
        }
    }
}

fn default_oracle_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_oracle_model() -> String {
    "llama3.2".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Tool results longer than this get the extraction prompt instead of the
    /// restating prompt.
    #[serde(default = "default_large_result_chars")]
    pub large_result_chars: usize,
    /// Conversation turns retained per (channel, user) pair.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            large_result_chars: default_large_result_chars(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_large_result_chars() -> usize {
    2000
}

fn default_history_turns() -> usize {
    10
}

/// One MCP tool server entry.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Unique key for this server.
    pub name: String,
    /// "stdio" or "streamable-http"; inferred from the endpoint fields when
    /// absent.
    pub transport: Option<String>,
    pub base_url: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    /// Allow-list of tool names. Empty means every tool is allowed.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Extra guidance appended to a tool's description before it is shown to
    /// the oracle, keyed by tool name (e.g. symbol normalization rules).
    #[serde(default)]
    pub tool_hints: HashMap<String, String>,
}

/// Optional overrides for the built-in prompt templates.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct PromptOverrides {
    pub intent_system: Option<String>,
    pub interpret_system: Option<String>,
    pub interpret_large_system: Option<String>,
    pub interpret_user: Option<String>,
    pub interpret_large_user: Option<String>,
    /// Per-server overrides for result interpretation.
    #[serde(default)]
    pub servers: HashMap<String, ServerPromptOverrides>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct ServerPromptOverrides {
    pub interpret_system: Option<String>,
    pub interpret_user: Option<String>,
}
