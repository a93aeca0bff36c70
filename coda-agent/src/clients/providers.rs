//! Static table of supported providers: defaults used when switching and
//! prices used for cost estimates.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub requires_api_key: bool,
    pub default_endpoint: &'static str,
    pub default_model: &'static str,
    /// Environment variable consulted for the API key.
    pub api_key_env: Option<&'static str>,
    /// USD per million input tokens.
    pub input_price: f64,
    /// USD per million output tokens.
    pub output_price: f64,
}

impl ProviderInfo {
    pub fn is_local(&self) -> bool {
        self.input_price == 0.0 && self.output_price == 0.0
    }
}

pub const PROVIDERS: &[ProviderInfo] = &[
    ProviderInfo {
        name: "ollama",
        description: "Local models served by Ollama",
        requires_api_key: false,
        default_endpoint: "http://localhost:11434/v1/chat/completions",
        default_model: "qwen2.5:14b",
        api_key_env: None,
        input_price: 0.0,
        output_price: 0.0,
    },
    ProviderInfo {
        name: "openai",
        description: "OpenAI chat completions",
        requires_api_key: true,
        default_endpoint: "https://api.openai.com/v1/chat/completions",
        default_model: "gpt-4o-mini",
        api_key_env: Some("OPENAI_API_KEY"),
        input_price: 2.50,
        output_price: 10.00,
    },
    ProviderInfo {
        name: "anthropic",
        description: "Anthropic Claude models",
        requires_api_key: true,
        default_endpoint: "https://api.anthropic.com/v1/messages",
        default_model: "claude-3-5-sonnet-20241022",
        api_key_env: Some("ANTHROPIC_API_KEY"),
        input_price: 3.00,
        output_price: 15.00,
    },
    ProviderInfo {
        name: "apple",
        description: "On-device platform foundation model",
        requires_api_key: false,
        default_endpoint: "",
        default_model: "foundation",
        api_key_env: None,
        input_price: 0.0,
        output_price: 0.0,
    },
];

/// Case-insensitive lookup.
pub fn lookup(name: &str) -> Option<&'static ProviderInfo> {
    PROVIDERS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Estimated cost in USD. Unknown providers cost nothing.
pub fn estimate_cost(provider: &str, input_tokens: usize, output_tokens: usize) -> f64 {
    lookup(provider)
        .map(|p| {
            (input_tokens as f64 / 1_000_000.0) * p.input_price
                + (output_tokens as f64 / 1_000_000.0) * p.output_price
        })
        .unwrap_or(0.0)
}
