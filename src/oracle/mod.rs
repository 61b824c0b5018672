//! The language-model oracle: a black-box function from a message sequence to
//! a reply string. Everything that decides *what* to do with an utterance
//! goes through this interface, never through hard-coded pattern matching.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::api::{ChatMessage, ChatRequest, ChatResponse};
use crate::core::config::data::OracleConfig;

/// Shown to the user whenever the oracle itself cannot be reached. Oracle
/// outages degrade to this string, never to an unhandled fault.
pub const ORACLE_APOLOGY: &str =
    "Sorry, I'm having trouble thinking right now. Please try again in a moment.";

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("oracle returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("oracle reply was malformed: {0}")]
    Malformed(String),
}

/// The oracle contract: at most one call per intent-analysis step and one
/// per result-interpretation step.
#[async_trait]
pub trait ChatOracle: Send + Sync {
    async fn get_response(&self, messages: &[ChatMessage]) -> Result<String, OracleError>;
}

const ORACLE_REQUEST_TIMEOUT_SECONDS: u64 = 60;

/// Default oracle: an OpenAI-compatible chat-completions endpoint.
pub struct HttpOracle {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
}

impl HttpOracle {
    pub fn new(config: &OracleConfig) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ORACLE_REQUEST_TIMEOUT_SECONDS))
            .build()?;
        let api_key = std::env::var(&config.api_key_env).ok().filter(|key| !key.is_empty());
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl ChatOracle for HttpOracle {
    async fn get_response(&self, messages: &[ChatMessage]) -> Result<String, OracleError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            stream: false,
            temperature: self.temperature,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, messages = messages.len(), "querying oracle");
        let mut builder = self.client.post(&url).json(&request);
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(OracleError::Status(response.status()));
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| OracleError::Malformed("empty completion".to_string()))
    }
}
