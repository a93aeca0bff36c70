use super::{
    LLMClient, LLMError, Message, MessageRole, ModelInfo, TokenSink, ToolDefinition,
    build_http_client, check_status, sse, transport_error,
};
use crate::config::LLMConfig;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client. Text only: tool definitions are not sent
/// and responses never carry tool calls.
pub struct AnthropicClient {
    config: LLMConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn new(config: LLMConfig) -> Self {
        let client = build_http_client(config.timeout_seconds);
        Self { config, client }
    }

    /// Lifts system messages out of the list; they travel in the top-level
    /// `system` field.
    fn extract_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut non_system: Vec<&Message> = Vec::new();

        for msg in messages {
            match msg.role {
                MessageRole::System => system_parts.push(msg.text()),
                _ => non_system.push(msg),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, non_system)
    }

    fn to_api_messages(messages: &[&Message]) -> Vec<AnthropicMessage> {
        messages
            .iter()
            .filter_map(|msg| match msg.role {
                MessageRole::User => Some(AnthropicMessage {
                    role: "user",
                    content: msg.text().to_string(),
                }),
                MessageRole::Assistant => {
                    let mut text = msg.text().to_string();
                    for call in msg.tool_calls.iter().flatten() {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&format!("[Called tool {} with {}]", call.name, call.arguments));
                    }
                    (!text.is_empty()).then_some(AnthropicMessage {
                        role: "assistant",
                        content: text,
                    })
                }
                MessageRole::Tool => Some(AnthropicMessage {
                    role: "user",
                    content: format!(
                        "Tool result ({}):\n{}",
                        msg.name.as_deref().unwrap_or("tool"),
                        msg.text()
                    ),
                }),
                MessageRole::System => None,
            })
            .collect()
    }

    fn build_request(&self, messages: &[Message], stream: bool) -> Value {
        let (system, rest) = Self::extract_system(messages);
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": Self::to_api_messages(&rest),
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, LLMError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body);
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.header("x-api-key", key);
        }

        debug!(model = %self.config.model, "Sending Anthropic request");
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.config.provider, self.config.timeout_seconds, e))?;
        check_status(response).await
    }
}

fn parse_response(body: &str) -> Result<Message, LLMError> {
    let response: AnthropicResponse = serde_json::from_str(body)
        .map_err(|e| LLMError::InvalidResponse(format!("Failed to decode response: {}", e)))?;
    let text: String = response
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect();
    Ok(Message::assistant(text))
}

/// Text fragment carried by a streaming event, if any. Only `delta.text` is
/// looked at; other event kinds pass through untouched.
fn stream_text(data: &str) -> Result<Option<String>, LLMError> {
    let json: Value = match serde_json::from_str(data) {
        Ok(json) => json,
        Err(e) => {
            trace!(error = %e, "Skipping undecodable Anthropic event");
            return Ok(None);
        }
    };

    if json.get("type").and_then(|t| t.as_str()) == Some("error") {
        let message = json
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .unwrap_or("Stream error");
        return Err(LLMError::InvalidResponse(message.to_string()));
    }

    Ok(json
        .pointer("/delta/text")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string))
}

#[async_trait]
impl LLMClient for AnthropicClient {
    async fn chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<Message, LLMError> {
        let body = self.build_request(messages, false);
        let response = self.send(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| LLMError::InvalidResponse(format!("Failed to read response body: {}", e)))?;
        parse_response(&text)
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        on_token: &mut TokenSink<'_>,
    ) -> Result<Message, LLMError> {
        let body = self.build_request(messages, true);
        let response = self.send(&body).await?;

        let events = sse::data_events(response, self.config.provider.clone());
        futures::pin_mut!(events);

        let mut content = String::new();
        while let Some(event) = events.next().await {
            if let Some(token) = stream_text(&event?)? {
                on_token(&token);
                content.push_str(&token);
            }
        }
        Ok(Message::assistant(content))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: self.config.provider.clone(),
            name: self.config.model.clone(),
            endpoint: self.config.endpoint.clone(),
            max_tokens: Some(self.config.max_tokens),
            supports_streaming: true,
            supports_tools: false,
        }
    }
}
