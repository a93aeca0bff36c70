pub mod clients;
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod memory;
pub mod prompts;
pub mod tools;

pub use clients::{LLMClient, LLMError, Message, MessageRole, ToolCall, ToolDefinition, create_llm_client};
pub use config::Config;
pub use core::{AgentLoop, RoundOutcome, Session};
pub use memory::ConversationContext;
pub use prompts::build_system_prompt;
pub use tools::{ToolManager, ToolTrait, default_tools};
