//! LLM client abstraction and hosted API implementations.
//!
//! This module provides a generic [`LlmClient`] trait for interacting with
//! language models, along with concrete implementations:
//!
//! - [`GroqClient`]: Groq's OpenAI-compatible chat completions API
//! - [`AnthropicClient`]: Anthropic's Messages API
//! - [`MockLlmClient`]: test double for unit tests
//!
//! Used by the query translator for filter generation and by the reasoning
//! agent for each observe/act step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Neither GROQ_API_KEY nor ANTHROPIC_API_KEY is set.
    #[error("GROQ_API_KEY or ANTHROPIC_API_KEY environment variable not set")]
    MissingApiKey,

    /// HTTP or network error occurred.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Failed to parse the API response.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Model returned no text content.
    #[error("Model returned empty response")]
    EmptyResponse,
}

// ============================================================================
// Completion Type
// ============================================================================

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
}

// ============================================================================
// LlmClient Trait
// ============================================================================

/// A hosted or mocked text model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One completion for a system prompt and a user message.
    async fn complete(&self, system: &str, user: &str) -> Result<Completion, LlmError>;
}

/// Pick a hosted client from the environment.
///
/// Prefers `GROQ_API_KEY` (the Llama 3 setup the project started with), then
/// `ANTHROPIC_API_KEY`.
pub fn client_from_env() -> Result<Box<dyn LlmClient>, LlmError> {
    if let Ok(client) = GroqClient::from_env() {
        return Ok(Box::new(client));
    }
    Ok(Box::new(AnthropicClient::from_env()?))
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

/// Model name, token limit and HTTP client shared by the hosted clients.
struct Hosted {
    api_key: String,
    model: String,
    max_tokens: u32,
    http: reqwest::Client,
}

impl Hosted {
    fn from_env(var: &str, model: &str) -> Result<Self, LlmError> {
        let api_key = std::env::var(var).map_err(|_| LlmError::MissingApiKey)?;
        Ok(Self::new(api_key, model))
    }

    fn new(api_key: String, model: &str) -> Self {
        Self {
            api_key,
            model: model.to_string(),
            max_tokens: 2048,
            http: reqwest::Client::new(),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        body: &B,
    ) -> Result<R, LlmError> {
        request
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| LlmError::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))
    }
}

// ============================================================================
// Groq API Implementation
// ============================================================================

const GROQ_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

/// Client for Groq's OpenAI-compatible chat completions endpoint.
///
/// Defaults to `llama3-8b-8192` at temperature 0.
pub struct GroqClient(Hosted);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl GroqClient {
    /// Read `GROQ_API_KEY` from the environment.
    pub fn from_env() -> Result<Self, LlmError> {
        Hosted::from_env("GROQ_API_KEY", "llama3-8b-8192").map(Self)
    }

    pub fn new(api_key: String) -> Self {
        Self(Hosted::new(api_key, "llama3-8b-8192"))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.0.model = model.into();
        self
    }
}

#[async_trait]
impl LlmClient for GroqClient {
    async fn complete(&self, system: &str, user: &str) -> Result<Completion, LlmError> {
        let body = ChatRequest {
            model: &self.0.model,
            max_tokens: self.0.max_tokens,
            temperature: 0.0,
            messages: vec![
                Message {
                    role: "system",
                    content: system.to_string(),
                },
                Message {
                    role: "user",
                    content: user.to_string(),
                },
            ],
        };

        let request = self.0.http.post(GROQ_URL).bearer_auth(&self.0.api_key);
        let response: ChatResponse = self.0.post(request, &body).await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::EmptyResponse)?;
        Ok(Completion { text })
    }
}

// ============================================================================
// Anthropic API Implementation
// ============================================================================

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";

/// Client for the Anthropic Messages API. Defaults to `claude-haiku-4-5`.
pub struct AnthropicClient(Hosted);

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    /// Read `ANTHROPIC_API_KEY` from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::MissingApiKey`] if the variable is not set.
    pub fn from_env() -> Result<Self, LlmError> {
        Hosted::from_env("ANTHROPIC_API_KEY", "claude-haiku-4-5").map(Self)
    }

    pub fn new(api_key: String) -> Self {
        Self(Hosted::new(api_key, "claude-haiku-4-5"))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.0.model = model.into();
        self
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, system: &str, user: &str) -> Result<Completion, LlmError> {
        let body = AnthropicRequest {
            model: &self.0.model,
            max_tokens: self.0.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: user.to_string(),
            }],
        };

        let request = self
            .0
            .http
            .post(ANTHROPIC_URL)
            .header("x-api-key", &self.0.api_key)
            .header("anthropic-version", "2023-06-01");
        let response: AnthropicResponse = self.0.post(request, &body).await?;

        let text = response
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or(LlmError::EmptyResponse)?;
        Ok(Completion { text })
    }
}

/// Remove a surrounding markdown code fence (with or without a language tag).
pub fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = rest.split_once('\n').map_or(rest, |(_, body)| body);
    match body.rfind("```") {
        Some(end) => body[..end].trim().to_string(),
        None => trimmed.to_string(),
    }
}

// ============================================================================
// Mock Implementation (Test Only)
// ============================================================================

/// Mock LLM client for testing. Returns pre-programmed responses in FIFO order
/// and records every user prompt it was given.
#[cfg(test)]
pub struct MockLlmClient {
    /// Pre-programmed responses to return in FIFO order.
    pub responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    /// User prompts received, in call order.
    pub prompts: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MockLlmClient {
    /// Create a new mock client with a sequence of responses.
    ///
    /// # Panics
    ///
    /// [`complete`](LlmClient::complete) panics if called more times than
    /// there are responses.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into()),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Number of completions requested so far.
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _system: &str, user: &str) -> Result<Completion, LlmError> {
        self.prompts.lock().unwrap().push(user.to_string());
        let text = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("MockLlmClient: no more responses available");

        Ok(Completion { text })
    }
}

// ============================================================================
// Tests
// ============================================================================
