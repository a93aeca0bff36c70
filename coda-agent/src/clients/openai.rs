use super::{
    LLMClient, LLMError, Message, MessageRole, ModelInfo, TokenSink, ToolCall, ToolDefinition,
    build_http_client, check_status, sse, transport_error,
};
use crate::config::LLMConfig;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

/// Client for OpenAI-compatible chat-completion endpoints (OpenAI, Ollama,
/// and anything else speaking the same wire format).
pub struct OpenAIClient {
    config: LLMConfig,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(config: LLMConfig) -> Self {
        let client = build_http_client(config.timeout_seconds);
        Self { config, client }
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolDefinition], stream: bool) -> Value {
        let messages_json: Vec<Value> = messages
            .iter()
            .map(|msg| {
                let mut map = serde_json::Map::new();
                map.insert("role".to_string(), Value::String(msg.role.as_str().to_string()));
                map.insert(
                    "content".to_string(),
                    msg.content.clone().map(Value::String).unwrap_or(Value::Null),
                );

                if let Some(tool_calls) = &msg.tool_calls {
                    let tool_calls_json: Vec<Value> = tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments
                                }
                            })
                        })
                        .collect();
                    map.insert("tool_calls".to_string(), Value::Array(tool_calls_json));
                }

                if msg.role == MessageRole::Tool {
                    if let Some(id) = &msg.tool_call_id {
                        map.insert("tool_call_id".to_string(), Value::String(id.clone()));
                    }
                    if let Some(name) = &msg.name {
                        map.insert("name".to_string(), Value::String(name.clone()));
                    }
                }

                Value::Object(map)
            })
            .collect();

        let mut request = serde_json::Map::new();
        request.insert("model".to_string(), Value::String(self.config.model.clone()));
        request.insert("messages".to_string(), Value::Array(messages_json));
        request.insert("temperature".to_string(), serde_json::json!(self.config.temperature));
        request.insert("max_tokens".to_string(), serde_json::json!(self.config.max_tokens));
        request.insert("stream".to_string(), Value::Bool(stream));

        if !tools.is_empty() {
            let tools_json: Vec<Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect();
            request.insert("tools".to_string(), Value::Array(tools_json));
        }

        Value::Object(request)
    }

    async fn send(&self, body: &Value, streaming: bool) -> Result<reqwest::Response, LLMError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json")
            .json(body);
        if streaming {
            request = request.header("Accept", "text/event-stream");
        }
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        debug!(provider = %self.config.provider, model = %self.config.model, streaming, "Sending chat request");
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.config.provider, self.config.timeout_seconds, e))?;
        check_status(response).await
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_completion(body: &str) -> Result<Message, LLMError> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| LLMError::InvalidResponse(format!("Failed to decode response: {}", e)))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LLMError::InvalidResponse("Response contained no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
        .collect();
    Ok(Message::assistant_with_tools(choice.message.content, tool_calls))
}

/// Folds streamed completion deltas into one assistant message.
///
/// A delta carrying both an id and a function name opens a new tool call and
/// closes the previous one; argument fragments are appended to whichever call
/// was opened last.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: Vec<ToolCall>,
    current: Option<ToolCall>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one SSE data payload. Returns the text fragment it carried, if any.
    /// Payloads that are not valid JSON are skipped.
    pub fn apply(&mut self, data: &str) -> Option<String> {
        let json: Value = match serde_json::from_str(data) {
            Ok(json) => json,
            Err(e) => {
                trace!(error = %e, "Skipping undecodable stream chunk");
                return None;
            }
        };

        let delta = json.pointer("/choices/0/delta")?;
        let mut token = None;

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                self.content.push_str(text);
                token = Some(text.to_string());
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
            for call in calls {
                let id = call.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
                let name = call
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty());

                if let (Some(id), Some(name)) = (id, name) {
                    if let Some(previous) = self.current.take() {
                        self.tool_calls.push(previous);
                    }
                    self.current = Some(ToolCall::new(id, name, String::new()));
                }

                if let Some(args) = call.pointer("/function/arguments").and_then(|v| v.as_str()) {
                    if let Some(current) = self.current.as_mut() {
                        current.arguments.push_str(args);
                    }
                }
            }
        }

        token
    }

    pub fn finish(mut self) -> Message {
        if let Some(last) = self.current.take() {
            self.tool_calls.push(last);
        }
        Message::assistant_with_tools(Some(self.content), self.tool_calls)
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Message, LLMError> {
        let body = self.build_request(messages, tools, false);
        let response = self.send(&body, false).await?;
        let text = response
            .text()
            .await
            .map_err(|e| LLMError::InvalidResponse(format!("Failed to read response body: {}", e)))?;
        parse_completion(&text)
    }

    async fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        on_token: &mut TokenSink<'_>,
    ) -> Result<Message, LLMError> {
        let body = self.build_request(messages, tools, true);
        let response = self.send(&body, true).await?;

        let events = sse::data_events(response, self.config.provider.clone());
        futures::pin_mut!(events);

        let mut accumulator = StreamAccumulator::new();
        while let Some(event) = events.next().await {
            if let Some(token) = accumulator.apply(&event?) {
                on_token(&token);
            }
        }
        Ok(accumulator.finish())
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: self.config.provider.clone(),
            name: self.config.model.clone(),
            endpoint: self.config.endpoint.clone(),
            max_tokens: Some(self.config.max_tokens),
            supports_streaming: true,
            supports_tools: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ToolParameters, ToolProperty};

    fn client() -> OpenAIClient {
        OpenAIClient::new(LLMConfig {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            ..LLMConfig::default()
        })
    }

    #[test]
    fn test_arguments_split_over_three_deltas() {
        let mut acc = StreamAccumulator::new();
        acc.apply(r#"{"choices":[{"delta":{"role":"assistant","tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"read_file","arguments":""}}]}}]}"#);
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"pa"}}]}}]}"#);
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"a."}}]}}]}"#);
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"txt\"}"}}]}}]}"#);

        let message = acc.finish();
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments, r#"{"path":"a.txt"}"#);
        assert!(message.content.is_none());
    }

    #[test]
    fn test_multiple_tool_calls_in_one_stream() {
        let mut acc = StreamAccumulator::new();
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"id":"a","function":{"name":"list_files","arguments":"{}"}}]}}]}"#);
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"id":"b","function":{"name":"read_file","arguments":"{\"path\""}}]}}]}"#);
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"function":{"arguments":":\"x\"}"}}]}}]}"#);

        let calls = acc.finish().tool_calls.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "list_files");
        assert_eq!(calls[0].arguments, "{}");
        assert_eq!(calls[1].arguments, r#"{"path":"x"}"#);
    }

    #[test]
    fn test_text_tokens_returned_in_order() {
        let mut acc = StreamAccumulator::new();
        let mut tokens = Vec::new();
        for data in [
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            "not json",
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
        ] {
            if let Some(token) = acc.apply(data) {
                tokens.push(token);
            }
        }
        assert_eq!(tokens, vec!["Hel", "lo"]);
        let message = acc.finish();
        assert_eq!(message.text(), "Hello");
        assert!(message.tool_calls.is_none());
    }

    #[test]
    fn test_empty_stream_yields_sendable_message() {
        let mut acc = StreamAccumulator::new();
        assert!(acc.apply(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).is_none());
        let message = acc.finish();
        assert_eq!(message.content.as_deref(), Some(""));
        assert!(message.tool_calls.is_none());

        let body = client().build_request(&[Message::user("hi"), message], &[], false);
        assert_eq!(body["messages"][1], serde_json::json!({"role": "assistant", "content": ""}));
    }

    #[test]
    fn test_arguments_without_open_call_are_dropped() {
        let mut acc = StreamAccumulator::new();
        acc.apply(r#"{"choices":[{"delta":{"tool_calls":[{"function":{"arguments":"{}"}}]}}]}"#);
        assert!(acc.finish().tool_calls.is_none());
    }

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null,"tool_calls":[{"id":"c1","type":"function","function":{"name":"run_shell","arguments":"{\"command\":\"ls\"}"}}]}}]}"#;
        let message = parse_completion(body).unwrap();
        assert_eq!(message.role, MessageRole::Assistant);
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls[0].name, "run_shell");
    }

    #[test]
    fn test_parse_completion_rejects_empty_choices() {
        assert!(matches!(
            parse_completion(r#"{"choices":[]}"#),
            Err(LLMError::InvalidResponse(_))
        ));
        assert!(matches!(parse_completion("<html>"), Err(LLMError::InvalidResponse(_))));
    }

    #[test]
    fn test_build_request_shape() {
        let tools = vec![ToolDefinition {
            name: "read_file".to_string(),
            description: "Read".to_string(),
            parameters: ToolParameters::new().property("path", ToolProperty::string("p"), true),
        }];
        let messages = vec![
            Message::system("sys"),
            Message::assistant_with_tools(None, vec![ToolCall::new("c1", "read_file", "{}")]),
            Message::tool_result("c1", "read_file", "data"),
        ];
        let request = client().build_request(&messages, &tools, true);

        assert_eq!(request["model"], "gpt-4o-mini");
        assert_eq!(request["stream"], true);
        assert_eq!(request["tools"][0]["type"], "function");
        assert_eq!(request["tools"][0]["function"]["parameters"]["required"][0], "path");
        assert_eq!(request["messages"][1]["content"], Value::Null);
        assert_eq!(request["messages"][1]["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(request["messages"][2]["tool_call_id"], "c1");
        assert_eq!(request["messages"][2]["role"], "tool");
    }

    #[test]
    fn test_build_request_omits_empty_tools() {
        let request = client().build_request(&[Message::user("hi")], &[], false);
        assert!(request.get("tools").is_none());
        assert_eq!(request["stream"], false);
    }
}
