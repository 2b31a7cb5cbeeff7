//! [`LlmDriver`] – OpenAI-compatible LLM interface.
//!
//! Communicates with any server exposing `/v1/chat/completions`: OpenAI,
//! a local [Ollama](https://ollama.com) (`http://localhost:11434`),
//! llama.cpp, vLLM.
//!
//! The driver implements two capabilities:
//!
//! * [`CompletionModel`] – plain conversational replies.
//! * [`Planner`] – task decomposition. The
//!   [`PlanSteps`] JSON Schema is injected via `response_format` so the model
//!   returns a strictly typed step list; if the server ignores the schema the
//!   reply is parsed as a numbered list instead.
//!
//! # Example
//!
//! ```rust,no_run
//! use kindred_runtime::llm_driver::{CompletionModel, LlmDriver};
//!
//! # async fn demo() {
//! let driver = LlmDriver::new("http://localhost:11434", "llama3");
//! // Requires a running model server.
//! let reply = driver.complete("You are Kindred.", &[], "Hello!").await;
//! # }
//! ```

use async_trait::async_trait;
use kindred_types::{CapabilityError, Role as TurnRole, Turn};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extensions::{Planner, parse_plan_steps};

// ─────────────────────────────────────────────────────────────────────────────
// Capability
// ─────────────────────────────────────────────────────────────────────────────

/// Conversational completion capability.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Reply to `new_message` given a system context and the prior turns.
    async fn complete(
        &self,
        system_context: &str,
        history: &[Turn],
        new_message: &str,
    ) -> Result<String, CapabilityError>;
}

/// Prompt used to ask a model for a step-by-step plan.
pub fn plan_prompt(task: &str) -> String {
    format!(
        "You are a logical reasoning assistant. Break the task below into a short \
         sequence of concrete steps and produce a concise plan using numbered steps.\n\n\
         Task: {task}\n\nPlan:"
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<LlmError> for CapabilityError {
    fn from(e: LlmError) -> Self {
        CapabilityError::Unavailable(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Structured plan the model is asked to return.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanSteps {
    /// Ordered, self-contained steps.
    pub steps: Vec<String>,
}

/// System message, then the prior turns, then the new user message.
///
/// Ambient event turns are passed as system notes so the model knows they
/// happened without mistaking them for something the user said.
pub fn build_messages(system_context: &str, history: &[Turn], new_message: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if !system_context.is_empty() {
        messages.push(ChatMessage::new(Role::System, system_context));
    }
    for turn in history {
        let msg = match turn.role {
            TurnRole::User => ChatMessage::new(Role::User, turn.text.as_str()),
            TurnRole::Assistant => ChatMessage::new(Role::Assistant, turn.text.as_str()),
            TurnRole::Event => ChatMessage::new(Role::System, format!("[event] {}", turn.text)),
        };
        messages.push(msg);
    }
    messages.push(ChatMessage::new(Role::User, new_message));
    messages
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// `response_format` field that enforces structured JSON Schema output.
#[derive(Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once and share behind an `Arc`.
pub struct LlmDriver {
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    client: reqwest::Client,
}

impl LlmDriver {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            temperature: DEFAULT_TEMPERATURE,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    /// Send `messages` and return the first choice's text.
    ///
    /// # Errors
    ///
    /// [`LlmError::Http`] if the request fails or the status is not 2xx,
    /// [`LlmError::BadResponse`] if there is no choice.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        response_format: Option<ResponseFormat>,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            temperature: self.temperature,
            response_format,
        };

        let response: ChatResponse = self
            .post("/v1/chat/completions")
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }

    /// Model ids advertised by `GET /v1/models`.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let mut req = self.client.get(format!("{}/v1/models", self.base_url));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let list: ModelList = req.send().await?.error_for_status()?.json().await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

/// `response_format` requesting output that matches [`PlanSteps`].
fn plan_response_format() -> Option<ResponseFormat> {
    let schema = serde_json::to_value(schema_for!(PlanSteps)).ok()?;
    Some(ResponseFormat {
        kind: "json_schema",
        json_schema: serde_json::json!({ "name": "plan_steps", "schema": schema }),
    })
}

/// Steps from a structured reply, or from a numbered list as a fallback.
fn parse_plan_reply(raw: &str) -> Vec<String> {
    match serde_json::from_str::<PlanSteps>(raw.trim()) {
        Ok(plan) => plan
            .steps
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => parse_plan_steps(raw),
    }
}

#[async_trait]
impl CompletionModel for LlmDriver {
    async fn complete(
        &self,
        system_context: &str,
        history: &[Turn],
        new_message: &str,
    ) -> Result<String, CapabilityError> {
        let messages = build_messages(system_context, history, new_message);
        Ok(self.chat(&messages, None).await?)
    }
}

#[async_trait]
impl Planner for LlmDriver {
    async fn plan(&self, task: &str) -> Result<Vec<String>, CapabilityError> {
        let messages = [ChatMessage::new(Role::User, plan_prompt(task))];
        let raw = self.chat(&messages, plan_response_format()).await?;
        Ok(parse_plan_reply(&raw))
    }
}
