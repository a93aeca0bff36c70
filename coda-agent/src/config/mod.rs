use crate::clients::providers;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Invalid config format in {path}: {detail}")]
    InvalidFormat { path: PathBuf, detail: String },
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Connection settings for one LLM backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "qwen2.5:14b".to_string(),
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 4096,
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_messages: usize,
    pub max_tool_output_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            max_tool_output_chars: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_tool_rounds: usize,
    pub retry_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            retry_attempts: 3,
            retry_backoff_base_ms: 1000,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub sandbox_enabled: bool,
    pub sandbox_allowed_paths: Vec<String>,
    pub sandbox_blocked_paths: Vec<String>,
    pub blocked_commands: Vec<String>,
    pub shell_timeout_seconds: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            sandbox_enabled: false,
            sandbox_allowed_paths: vec!["./".to_string()],
            sandbox_blocked_paths: vec!["~/.ssh".to_string(), "~/.aws".to_string()],
            blocked_commands: vec![
                "rm -rf /".to_string(),
                "sudo".to_string(),
                "chmod 777".to_string(),
            ],
            shell_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Directories scanned for external tool executables.
    pub search_paths: Vec<String>,
    pub external_timeout_seconds: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_paths: vec!["~/.coda/tools".to_string(), "./tools".to_string()],
            external_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub color: bool,
    /// One of `none`, `error`, `warn`, `info`, `debug`.
    pub console_log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            color: true,
            console_log_level: "warn".to_string(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LLMConfig,
    pub context: ContextConfig,
    pub agent: AgentConfig,
    pub safety: SafetyConfig,
    pub tools: ToolsConfig,
    pub ui: UiConfig,
}

/// Standard lookup order; later entries win.
pub fn standard_config_paths() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    vec![
        PathBuf::from("/etc/coda/config.json"),
        home.join(".config").join("coda").join("config.json"),
        home.join(".coda.json"),
        PathBuf::from(".coda.json"),
    ]
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::InvalidFormat {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }
        }
    })?;
    let value: Value = serde_json::from_str(&contents).map_err(|e| ConfigError::InvalidFormat {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    if !value.is_object() {
        return Err(ConfigError::InvalidFormat {
            path: path.to_path_buf(),
            detail: "top-level value must be an object".to_string(),
        });
    }
    Ok(value)
}

/// Recursively overlays `overlay` onto `base`; objects merge key by key,
/// everything else is replaced.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn from_value(path: &Path, value: Value) -> Result<Config, ConfigError> {
    serde_json::from_value(value).map_err(|e| ConfigError::InvalidFormat {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Result of [`Config::load_layered`].
#[derive(Debug)]
pub struct LayeredConfig {
    pub config: Config,
    /// Files that existed but could not be used.
    pub skipped: Vec<ConfigError>,
}

impl LayeredConfig {
    /// Logs every skipped file at warn level.
    pub fn log_skipped(&self) {
        for e in &self.skipped {
            warn!("{}. Skipping this file.", e);
        }
    }
}

impl Config {
    /// Loads a single file. The file must exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let value = read_json(path)?;
        from_value(path, value)
    }

    /// Overlays every readable file in `paths`, in order, on top of the
    /// defaults. Missing files are skipped silently; unreadable or invalid
    /// ones are skipped and reported in [`LayeredConfig::skipped`] so the
    /// caller can log them once a subscriber is installed.
    pub fn load_layered(paths: &[PathBuf]) -> LayeredConfig {
        let mut merged = Value::Object(serde_json::Map::new());
        let mut last_good = Self::default();
        let mut skipped = Vec::new();

        for path in paths {
            match read_json(path) {
                Ok(layer) => {
                    let mut candidate = merged.clone();
                    merge_json(&mut candidate, layer);
                    match from_value(path, candidate.clone()) {
                        Ok(config) => {
                            debug!(path = %path.display(), "Loaded config layer");
                            merged = candidate;
                            last_good = config;
                        }
                        Err(e) => skipped.push(e),
                    }
                }
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => skipped.push(e),
            }
        }

        LayeredConfig {
            config: last_good,
            skipped,
        }
    }

    /// Fills `llm.api_key` from the provider's environment variable when unset.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.llm.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
            return;
        }
        let Some(var) = providers::lookup(&self.llm.provider).and_then(|p| p.api_key_env) else {
            return;
        };
        if let Some(key) = lookup(var).filter(|k| !k.is_empty()) {
            debug!(provider = %self.llm.provider, "Using API key from {}", var);
            self.llm.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.max_messages == 0 {
            return Err(ConfigError::Validation(
                "context.max_messages must be greater than 0".to_string(),
            ));
        }
        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::Validation(
                "agent.max_tool_rounds must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Validation(format!(
                "llm.temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            )));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
        }
        Ok(())
    }
}
