use super::{LLMClient, LLMError, Message, ModelInfo, TokenSink, ToolDefinition, providers};
use crate::config::LLMConfig;
use async_trait::async_trait;

/// Stand-in for the on-device platform model. This build has no binding to
/// it, so every request fails with a message pointing at usable providers.
pub struct UnavailableClient {
    config: LLMConfig,
}

impl UnavailableClient {
    pub fn new(config: LLMConfig) -> Self {
        Self { config }
    }

    fn unavailable(&self) -> LLMError {
        let alternatives: Vec<&str> = providers::PROVIDERS
            .iter()
            .map(|p| p.name)
            .filter(|name| *name != self.config.provider)
            .collect();
        LLMError::ConnectionFailed {
            provider: self.config.provider.clone(),
            message: format!(
                "The platform foundation model is not available in this build. Use /provider to switch to one of: {}",
                alternatives.join(", ")
            ),
        }
    }
}

#[async_trait]
impl LLMClient for UnavailableClient {
    async fn chat(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<Message, LLMError> {
        Err(self.unavailable())
    }

    async fn stream_chat(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _on_token: &mut TokenSink<'_>,
    ) -> Result<Message, LLMError> {
        Err(self.unavailable())
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: self.config.provider.clone(),
            name: self.config.model.clone(),
            endpoint: self.config.endpoint.clone(),
            max_tokens: None,
            supports_streaming: false,
            supports_tools: false,
        }
    }
}
