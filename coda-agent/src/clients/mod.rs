pub mod anthropic;
pub mod openai;
pub mod providers;
pub mod sse;
pub mod unavailable;

use crate::config::LLMConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub use anthropic::AnthropicClient;
pub use openai::{OpenAIClient, StreamAccumulator};
pub use unavailable::UnavailableClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// One entry of the conversation.
///
/// Tool-role messages always carry `tool_call_id` and `name`; assistant
/// messages carry text, tool calls, or both. Use the constructors below
/// rather than building the struct by hand.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Message {
    fn with_role(role: MessageRole, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, Some(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, Some(content.into()))
    }

    /// Assistant turn that may request tools. Empty text is dropped only
    /// when there are calls, so the message always carries one of the two.
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        if tool_calls.is_empty() {
            return Self::assistant(content.unwrap_or_default());
        }
        let mut message =
            Self::with_role(MessageRole::Assistant, content.filter(|c| !c.is_empty()));
        message.tool_calls = Some(tool_calls);
        message
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON text exactly as the model produced it.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProperty {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<String>>,
}

impl ToolProperty {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            enum_values: None,
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::new("string", description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::new("integer", description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::new("boolean", description)
    }
}

/// JSON-schema object describing a tool's arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: BTreeMap<String, ToolProperty>,
    pub required: Vec<String>,
}

impl Default for ToolParameters {
    fn default() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl ToolParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property(mut self, name: &str, property: ToolProperty, required: bool) -> Self {
        self.properties.insert(name.to_string(), property);
        if required && !self.required.iter().any(|r| r == name) {
            self.required.push(name.to_string());
        }
        self
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_tools: bool,
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("Failed to connect to LLM provider '{provider}': {message}")]
    ConnectionFailed { provider: String, message: String },
    #[error("LLM request failed (status {status}): {message}")]
    RequestFailed { status: u16, message: String },
    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),
    #[error("LLM request timed out after {0} seconds")]
    Timeout(u64),
    #[error("Rate limited. {}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<u64> },
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!("Retry after {} seconds", secs),
        None => "Retry later".to_string(),
    }
}

impl LLMError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LLMError::ConnectionFailed { .. } | LLMError::Timeout(_) | LLMError::RateLimited { .. }
        )
    }
}

/// Callback receiving streamed text fragments in arrival order.
pub type TokenSink<'a> = dyn FnMut(&str) + Send + 'a;

#[async_trait]
pub trait LLMClient: Send + Sync {
    /// One blocking round-trip; returns the assistant message.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Message, LLMError>;

    /// One streamed round-trip. `on_token` sees every text fragment as it
    /// arrives; the assembled message is returned once the stream ends.
    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        on_token: &mut TokenSink<'_>,
    ) -> Result<Message, LLMError>;

    fn model_info(&self) -> ModelInfo;
}

pub(crate) fn build_http_client(timeout_seconds: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

pub(crate) fn transport_error(provider: &str, timeout_seconds: u64, error: reqwest::Error) -> LLMError {
    if error.is_timeout() {
        LLMError::Timeout(timeout_seconds)
    } else {
        LLMError::ConnectionFailed {
            provider: provider.to_string(),
            message: error.to_string(),
        }
    }
}

/// Maps non-success HTTP statuses to errors, passing successful responses through.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LLMError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        return Err(LLMError::RateLimited { retry_after });
    }

    let body = response.text().await.unwrap_or_default();
    Err(LLMError::RequestFailed {
        status: status.as_u16(),
        message: error_message_from_body(&body),
    })
}

/// Pulls `error.message` out of a JSON error body, falling back to the raw text.
pub(crate) fn error_message_from_body(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                "Request failed".to_string()
            } else {
                body.trim().to_string()
            }
        })
}

/// Builds the client for `config.provider`. Unknown providers get the
/// OpenAI-compatible client; nothing is validated until the first request.
pub fn create_llm_client(config: &LLMConfig) -> Box<dyn LLMClient> {
    match config.provider.to_lowercase().as_str() {
        "anthropic" => {
            info!(model = %config.model, "Creating Anthropic LLM client");
            Box::new(AnthropicClient::new(config.clone()))
        }
        "apple" => {
            info!("Creating Apple platform model client");
            Box::new(UnavailableClient::new(config.clone()))
        }
        "openai" | "ollama" | "openai-compatible" => {
            info!(provider = %config.provider, model = %config.model, "Creating OpenAI-compatible LLM client");
            Box::new(OpenAIClient::new(config.clone()))
        }
        other => {
            warn!(provider = other, "Unknown provider, using generic OpenAI-compatible client");
            Box::new(OpenAIClient::new(config.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_tool_result_message_links_call() {
        let msg = Message::tool_result("call_1", "read_file", "contents");
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("read_file"));
    }

    #[test]
    fn test_assistant_with_tools_keeps_content_or_calls() {
        let msg = Message::assistant_with_tools(Some(String::new()), vec![]);
        assert_eq!(msg.content.as_deref(), Some(""));
        assert!(msg.tool_calls.is_none());
        assert!(!msg.has_tool_calls());

        let msg = Message::assistant_with_tools(None, vec![]);
        assert_eq!(msg.content.as_deref(), Some(""));

        let msg = Message::assistant_with_tools(Some(String::new()), vec![ToolCall::new("a", "b", "{}")]);
        assert!(msg.content.is_none());
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn test_message_serialization_skips_none() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_tool_parameters_schema_shape() {
        let params = ToolParameters::new()
            .property("path", ToolProperty::string("Path"), true)
            .property("limit", ToolProperty::integer("Limit"), false);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["type"], "object");
        assert_eq!(json["properties"]["path"]["type"], "string");
        assert!(json["properties"]["limit"].get("enum").is_none());
        assert_eq!(json["required"], serde_json::json!(["path"]));
    }

    #[test]
    fn test_error_message_from_body() {
        assert_eq!(
            error_message_from_body(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(error_message_from_body("plain failure"), "plain failure");
        assert_eq!(error_message_from_body(""), "Request failed");
    }

    #[test]
    fn test_rate_limited_display() {
        let err = LLMError::RateLimited { retry_after: Some(7) };
        assert_eq!(err.to_string(), "Rate limited. Retry after 7 seconds");
        let err = LLMError::RateLimited { retry_after: None };
        assert_eq!(err.to_string(), "Rate limited. Retry later");
    }

    #[rstest]
    #[case("openai", "openai")]
    #[case("OLLAMA", "OLLAMA")]
    #[case("anthropic", "anthropic")]
    #[case("apple", "apple")]
    #[case("mystery", "mystery")]
    fn test_factory_never_fails(#[case] provider: &str, #[case] expected: &str) {
        let config = LLMConfig {
            provider: provider.to_string(),
            ..LLMConfig::default()
        };
        let client = create_llm_client(&config);
        assert_eq!(client.model_info().provider, expected);
    }

    #[test]
    fn test_factory_selects_variant_capabilities() {
        let anthropic = create_llm_client(&LLMConfig {
            provider: "anthropic".to_string(),
            ..LLMConfig::default()
        });
        assert!(!anthropic.model_info().supports_tools);

        let openai = create_llm_client(&LLMConfig {
            provider: "openai".to_string(),
            ..LLMConfig::default()
        });
        assert!(openai.model_info().supports_tools);
    }
}
