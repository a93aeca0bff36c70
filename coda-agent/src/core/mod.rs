use crate::clients::{LLMClient, LLMError, Message, ToolCall, ToolDefinition, create_llm_client};
use crate::commands::{CommandOutcome, MetaCommandHandler, ShellInjection};
use crate::config::{Config, LLMConfig};
use crate::memory::ConversationContext;
use crate::tools::{RunShellTool, ToolDiscovery, ToolManager, Workspace, default_tools};
use colored::Colorize;
use futures::{Stream, StreamExt};
use std::io::{self, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Builds an LLM client from connection settings. Swapped out in tests.
pub type ClientFactory = Box<dyn Fn(&LLMConfig) -> Box<dyn LLMClient> + Send + Sync>;

pub fn default_client_factory() -> ClientFactory {
    Box::new(create_llm_client)
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// How a tool-round cycle ended.
#[derive(Debug)]
pub enum RoundOutcome {
    Completed { rounds: usize },
    MaxRoundsReached { rounds: usize },
    Failed(LLMError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

/// Everything a session owns that meta-commands may inspect or replace.
pub struct Session {
    pub config: Config,
    pub context: ConversationContext,
    pub tools: ToolManager,
    workspace: Workspace,
    discovery: ToolDiscovery,
    client: Box<dyn LLMClient>,
    factory: ClientFactory,
}

impl Session {
    pub fn new(config: Config, workspace: Workspace, factory: ClientFactory) -> Self {
        let client = factory(&config.llm);
        let context = ConversationContext::new(
            config.context.max_messages,
            &config.llm.provider,
            &config.llm.model,
        );
        let tools = default_tools(workspace.clone(), config.safety.shell_timeout_seconds);
        let discovery = ToolDiscovery::new(
            config.tools.search_paths.clone(),
            Duration::from_secs(config.tools.external_timeout_seconds),
        );

        Self {
            config,
            context,
            tools,
            workspace,
            discovery,
            client,
            factory,
        }
    }

    pub fn client(&self) -> &dyn LLMClient {
        self.client.as_ref()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn discovery(&self) -> &ToolDiscovery {
        &self.discovery
    }

    /// Installs new LLM settings together with a client built from them.
    pub fn switch_llm(&mut self, llm: LLMConfig) {
        let client = (self.factory)(&llm);
        info!(provider = %llm.provider, model = %llm.model, "Switched LLM client");
        self.context.update_provider(&llm.provider, &llm.model);
        self.config.llm = llm;
        self.client = client;
    }

    /// Registers discovered external tools on top of the current set.
    pub async fn load_external_tools(&mut self) -> usize {
        self.tools.load_external_tools(&self.discovery).await
    }

    /// Rebuilds the tool set from the built-ins and a fresh discovery scan.
    pub async fn reload_tools(&mut self) -> usize {
        self.tools = default_tools(self.workspace.clone(), self.config.safety.shell_timeout_seconds);
        self.load_external_tools().await
    }
}

const QUIT_WORDS: &[&str] = &["quit", "exit", "/quit", "/exit"];

fn is_quit(input: &str) -> bool {
    QUIT_WORDS.iter().any(|w| input.eq_ignore_ascii_case(w))
}

fn backoff_delay(error: &LLMError, base_ms: u64, attempt: u32) -> Duration {
    if let LLMError::RateLimited {
        retry_after: Some(secs),
    } = error
    {
        return Duration::from_secs(*secs);
    }
    Duration::from_millis(base_ms.saturating_mul(2u64.saturating_pow(attempt)))
}

pub struct AgentLoop {
    session: Session,
    commands: MetaCommandHandler,
    shell: ShellInjection,
}

impl AgentLoop {
    /// Starts a conversation whose first message is `system_prompt`.
    pub fn new(mut session: Session, system_prompt: impl Into<String>) -> Self {
        session.context.add_message(Message::system(system_prompt));
        let shell = ShellInjection::new(
            session.config.context.max_tool_output_chars,
            RunShellTool::new(session.workspace().clone(), session.config.safety.shell_timeout_seconds),
        );
        Self {
            session,
            commands: MetaCommandHandler::new(),
            shell,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Interactive loop over input lines until a quit word or end of input.
    pub async fn run<S>(&mut self, mut input: S) -> Result<(), AgentError>
    where
        S: Stream<Item = io::Result<String>> + Unpin + Send,
    {
        info!(session = %self.session.context.session_id(), "Agent loop starting");
        println!("{}", welcome_banner());

        loop {
            print!("\n{} ", "You:".green().bold());
            io::stdout().flush()?;

            let Some(line) = input.next().await else {
                println!("{}", self.goodbye());
                return Ok(());
            };
            if self.handle_line(&line?).await == LoopControl::Exit {
                return Ok(());
            }
        }
    }

    /// Dispatches one line of input: quit words, meta-commands, shell
    /// injection, or a chat turn.
    pub async fn handle_line(&mut self, line: &str) -> LoopControl {
        let input = line.trim();
        if input.is_empty() {
            return LoopControl::Continue;
        }
        if is_quit(input) {
            println!("{}", self.goodbye());
            return LoopControl::Exit;
        }

        match self.commands.handle(input, &mut self.session).await {
            CommandOutcome::Handled(text) => {
                println!("{}", text);
                return LoopControl::Continue;
            }
            CommandOutcome::Rejected(text) => {
                println!("{}", text.red());
                return LoopControl::Continue;
            }
            CommandOutcome::NotACommand => {}
        }

        if let Some(command) = input.strip_prefix('!') {
            if let Some(message) = self.shell.run(command).await {
                self.session.context.add_message(Message::user(message));
                self.process_with_tools().await;
            }
            return LoopControl::Continue;
        }

        self.chat(input).await;
        LoopControl::Continue
    }

    /// One-shot mode: a single chat turn.
    pub async fn run_task(&mut self, task: &str) -> Result<RoundOutcome, AgentError> {
        let task = task.trim();
        if task.is_empty() {
            return Err(AgentError::InvalidInput("task must not be empty".to_string()));
        }
        Ok(self.chat(task).await)
    }

    pub async fn chat(&mut self, text: &str) -> RoundOutcome {
        self.session.context.add_message(Message::user(text));
        self.process_with_tools().await
    }

    /// Alternates LLM requests and tool execution until the model answers
    /// without tool calls or the round cap is hit.
    pub async fn process_with_tools(&mut self) -> RoundOutcome {
        let max_rounds = self.session.config.agent.max_tool_rounds;
        let mut rounds = 0;

        while rounds < max_rounds {
            rounds += 1;
            let tools = self.session.tools.definitions();

            print!("\n{} ", "AI:".cyan().bold());
            let _ = io::stdout().flush();

            let response = match self.request_with_retry(&tools).await {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, round = rounds, "Failed to get response");
                    println!("\n{} {}", "Error:".red().bold(), e);
                    return RoundOutcome::Failed(e);
                }
            };
            println!();

            let calls = response.tool_calls.clone().unwrap_or_default();
            self.session.context.add_message(response);
            if calls.is_empty() {
                return RoundOutcome::Completed { rounds };
            }
            self.execute_tool_calls(&calls).await;
        }

        warn!(rounds, "Max tool rounds reached");
        println!("\n{}", "Maximum tool execution rounds reached".yellow());
        RoundOutcome::MaxRoundsReached { rounds }
    }

    async fn execute_tool_calls(&mut self, calls: &[ToolCall]) {
        for call in calls {
            info!(tool = %call.name, id = %call.id, "Executing tool");
            println!("{} {}", "Using tool:".blue(), call.name);

            let content = match self.session.tools.execute(&call.name, &call.arguments).await {
                Ok(result) => {
                    match result.error() {
                        None => println!("   {}", "Success".green()),
                        Some(e) => println!("   {} {}", "Error:".red(), e),
                    }
                    result.to_message_content()
                }
                Err(e) => {
                    error!(tool = %call.name, error = %e, "Tool execution failed");
                    println!("   {} {}", "Error:".red(), e);
                    format!("Error: {}", e)
                }
            };

            self.session
                .context
                .add_message(Message::tool_result(call.id.as_str(), call.name.as_str(), content));
        }
    }

    /// Streams one response, retrying transient failures that happened
    /// before any text reached the terminal.
    async fn request_with_retry(&self, tools: &[ToolDefinition]) -> Result<Message, LLMError> {
        let agent = &self.session.config.agent;
        let mut attempt: u32 = 0;

        loop {
            let mut emitted = false;
            let result = {
                let mut on_token = |token: &str| {
                    emitted = true;
                    print!("{}", token);
                    let _ = io::stdout().flush();
                };
                self.session
                    .client()
                    .stream_chat(self.session.context.messages(), tools, &mut on_token)
                    .await
            };

            match result {
                Ok(message) => return Ok(message),
                Err(e) if e.is_retryable() && !emitted && attempt < agent.retry_attempts => {
                    let delay = backoff_delay(&e, agent.retry_backoff_base_ms, attempt);
                    attempt += 1;
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying LLM request");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn goodbye(&self) -> String {
        let (messages, user, assistant) = self.session.context.stats();
        format!(
            "\n\n{}\n\nSession summary:\n  • Messages: {}\n  • User turns: {}\n  • Assistant turns: {}\n",
            "Goodbye!".bold(),
            messages,
            user,
            assistant
        )
    }
}

fn welcome_banner() -> String {
    r#"
╔═══════════════════════════════════════════════════════════════╗
║  coda - interactive coding agent                              ║
║                                                               ║
║  Commands:                                                    ║
║    /help             - Show available commands                ║
║    /tools            - List available tools                   ║
║    /stats            - Show conversation statistics           ║
║    !<command>        - Run a shell command, share the output  ║
║    quit or exit      - Exit application                       ║
╚═══════════════════════════════════════════════════════════════╝"#
        .to_string()
}
