//! The LLM completer is an out-of-scope external collaborator (spec
//! §1): both the default agent solver and the judge engine consume it
//! through a single turn-based `TurnCompleter` trait with a retry/
//! timeout policy the core does not need to know the internals of.
//! This crate fixes that trait and ships a real HTTP-backed completer
//! plus the deterministic test doubles the judge's `dummy`/`random`
//! scaffolds (§4.E) are built on.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One turn in a conversation sent to the completer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionReply {
    pub content: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completer request failed: {0}")]
    Request(String),
    #[error("completer reply could not be parsed: {0}")]
    Unparseable(String),
    #[error("completer call timed out after {0:?}")]
    Timeout(Duration),
}

/// Serializable identity of a completer configuration, safe to embed
/// verbatim in `grader_output.json`'s `completer_config` field — never
/// includes the API key itself, only which environment variable it was
/// sourced from, so grading artifacts never leak credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleterConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env_var: String,
    pub reasoning_effort: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for CompleterConfig {
    fn default() -> Self {
        Self {
            model: "o3-mini".to_string(),
            base_url: None,
            api_key_env_var: "GRADER_OPENAI_API_KEY".to_string(),
            reasoning_effort: Some("high".to_string()),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

#[async_trait]
pub trait TurnCompleter: Send + Sync {
    fn config(&self) -> CompleterConfig;

    async fn complete_once(&self, turns: &[ChatTurn]) -> Result<CompletionReply, CompletionError>;

    /// Calls `complete_once` under the configured timeout with bounded
    /// retry on transport failures, matching the retry/timeout policy
    /// §1 attributes to the completer rather than to its callers.
    async fn complete(&self, turns: &[ChatTurn]) -> Result<CompletionReply, CompletionError> {
        let config = self.config();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let timeout = Duration::from_secs(config.timeout_secs);
            match tokio::time::timeout(timeout, self.complete_once(turns)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(err)) if attempt >= config.max_retries => return Err(err),
                Ok(Err(err)) => {
                    tracing::warn!(attempt, error = %err, "completer call failed, retrying");
                }
                Err(_) if attempt >= config.max_retries => return Err(CompletionError::Timeout(timeout)),
                Err(_) => {
                    tracing::warn!(attempt, "completer call timed out, retrying");
                }
            }
        }
    }
}

/// Minimal real completer: POSTs an OpenAI-compatible chat-completions
/// request. Credentials are read from the environment variable named in
/// `CompleterConfig::api_key_env_var` at call time and never logged.
pub struct HttpTurnCompleter {
    config: CompleterConfig,
    client: reqwest::Client,
}

impl HttpTurnCompleter {
    pub fn new(config: CompleterConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Result<String, CompletionError> {
        std::env::var(&self.config.api_key_env_var)
            .map_err(|_| CompletionError::Request(format!("{} not set", self.config.api_key_env_var)))
    }
}

#[async_trait]
impl TurnCompleter for HttpTurnCompleter {
    fn config(&self) -> CompleterConfig {
        self.config.clone()
    }

    async fn complete_once(&self, turns: &[ChatTurn]) -> Result<CompletionReply, CompletionError> {
        let api_key = self.api_key()?;
        let url = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": turns,
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Unparseable(e.to_string()))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| CompletionError::Unparseable("missing choices[0].message.content".to_string()))?
            .to_string();

        let usage = TokenUsage {
            prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: payload["usage"]["total_tokens"].as_u64().unwrap_or(0),
        };

        Ok(CompletionReply { content, usage })
    }
}

/// Deterministic test double: always returns the same fixed reply.
/// Backs the judge's `dummy` scaffold and the agent solver's `dummy`
/// solver (§4.E, §10.4) without any network dependency.
pub struct FixedTurnCompleter {
    reply: String,
}

impl FixedTurnCompleter {
    pub fn new(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }
}

#[async_trait]
impl TurnCompleter for FixedTurnCompleter {
    fn config(&self) -> CompleterConfig {
        CompleterConfig {
            model: "dummy".to_string(),
            ..Default::default()
        }
    }

    async fn complete_once(&self, _turns: &[ChatTurn]) -> Result<CompletionReply, CompletionError> {
        Ok(CompletionReply {
            content: self.reply.clone(),
            usage: TokenUsage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_completer_returns_configured_reply() {
        let completer = FixedTurnCompleter::new("hello");
        let reply = completer.complete(&[]).await.unwrap();
        assert_eq!(reply.content, "hello");
    }
}
