//! Input handled before it reaches the model: `/` meta-commands and `!`
//! shell injection.

use crate::clients::providers::{self, PROVIDERS};
use crate::config::LLMConfig;
use crate::core::Session;
use crate::tools::{RunShellTool, ShellReport, ToolManager, ToolTrait};
use colored::Colorize;
use tracing::{info, warn};

const RULE_WIDTH: usize = 54;

fn rule() -> String {
    "━".repeat(RULE_WIDTH)
}

/// Result of offering a line to the meta-command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Not a `/` command; the caller keeps processing the line.
    NotACommand,
    /// Command ran; the text is shown to the user.
    Handled(String),
    /// Command was consumed but refused (unknown name, bad argument).
    Rejected(String),
}

#[derive(Debug, Default)]
pub struct MetaCommandHandler;

impl MetaCommandHandler {
    pub fn new() -> Self {
        Self
    }

    pub async fn handle(&self, input: &str, session: &mut Session) -> CommandOutcome {
        let Some(rest) = input.strip_prefix('/') else {
            return CommandOutcome::NotACommand;
        };
        let mut parts = rest.split_whitespace();
        let Some(command) = parts.next().map(str::to_lowercase) else {
            return CommandOutcome::NotACommand;
        };
        let args: Vec<&str> = parts.collect();

        match command.as_str() {
            "reload-tools" | "rescan-tools" => CommandOutcome::Handled(reload_tools(session).await),
            _ => self.handle_sync(&command, &args, session),
        }
    }

    fn handle_sync(&self, command: &str, args: &[&str], session: &mut Session) -> CommandOutcome {
        match command {
            "help" => CommandOutcome::Handled(help_text(session.config.safety.shell_timeout_seconds)),
            "tools" => CommandOutcome::Handled(tools_text(&session.tools)),
            "stats" => CommandOutcome::Handled(format!("\n{}", session.context.detailed_stats())),
            "context" => context_command(args, session),
            "provider" => provider_command(args, session),
            "model" => model_command(args, session),
            "config" => CommandOutcome::Handled(config_text(session)),
            other => {
                warn!(command = %other, "Unknown command");
                CommandOutcome::Rejected(format!(
                    "\nUnknown command: /{}\nType /help for available commands\n",
                    other
                ))
            }
        }
    }
}

async fn reload_tools(session: &mut Session) -> String {
    let paths = session.discovery().search_paths().join(", ");
    session.reload_tools().await;

    let total = session.tools.len();
    let external = session.tools.external_count();
    let mut out = format!(
        "\nRescanning for external tools...\nPaths: {}\n\nTool reload complete!\n   Built-in tools: {}\n   External tools: {}\n   Total: {} tools available\n",
        paths,
        total - external,
        external,
        total
    );

    if external > 0 {
        out.push_str("\nExternal tools loaded:\n");
        for definition in session.tools.definitions() {
            let is_external = session.tools.get(&definition.name).is_some_and(|t| t.is_external());
            if is_external {
                out.push_str(&format!("  • {}: {}\n", definition.name, definition.description));
            }
        }
    }
    out
}

fn help_text(shell_timeout: u64) -> String {
    format!(
        r#"
Available Commands:
{rule}

Meta Commands:
  /help                Show this help message
  /tools               List available tools with descriptions
  /stats               Show conversation statistics and cost estimate
  /context <limit>     Adjust context limit (number of messages)
  /reload-tools        Rescan and reload external tools
  /provider [name]     Show or switch LLM provider
  /model [name]        Show or switch LLM model
  /config              Show current configuration
  /quit or /exit       Exit the application

Shell Injection:
  !<command>           Run shell command and inject output into context

Examples:
  /context 100         Set context limit to 100 messages
  /provider anthropic  Switch to Anthropic Claude
  /model gpt-4o        Switch to GPT-4o model
  !git status          Show git status, then let the AI respond

Security:
  Shell commands honour the sandbox and blocked-command settings
  and time out after {shell_timeout} seconds.

Note: Commands starting with / are NOT sent to the LLM.
      Commands starting with ! are executed, then output sent to the LLM.
"#,
        rule = rule(),
        shell_timeout = shell_timeout
    )
}

fn tools_text(tools: &ToolManager) -> String {
    let definitions = tools.definitions();
    let mut out = format!("\nAvailable Tools:\n{}\n\n", rule());
    if definitions.is_empty() {
        out.push_str("  No tools available\n");
        return out;
    }

    for definition in &definitions {
        out.push_str(&format!("  {}\n    {}\n", definition.name, definition.description));
        let params = &definition.parameters;
        if !params.properties.is_empty() {
            out.push_str("    Parameters:\n");
            for (name, property) in &params.properties {
                let mark = if params.is_required(name) { "*" } else { "" };
                out.push_str(&format!("      - {}{}: {}\n", name, mark, property.description));
            }
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "Total: {} tools available\n(*) = required parameter\n",
        definitions.len()
    ));
    out
}

fn context_command(args: &[&str], session: &mut Session) -> CommandOutcome {
    const USAGE: &str = "Usage: /context <limit>\nExample: /context 100\n";

    let Some(raw) = args.first() else {
        return CommandOutcome::Handled(format!(
            "\nCurrent context status:\n   Messages in context: {}\n   Context limit: {}\n\n{}",
            session.context.len(),
            session.context.max_messages(),
            USAGE
        ));
    };

    let limit = match raw.parse::<usize>() {
        Ok(limit) if limit > 0 => limit,
        _ => {
            return CommandOutcome::Rejected(format!(
                "\nInvalid limit. Must be a positive number.\n{}",
                USAGE
            ));
        }
    };

    let change = session.context.set_context_limit(limit);
    session.config.context.max_messages = limit;

    let mut out = format!(
        "\nContext limit changed: {} → {} messages\n",
        change.old_limit, change.new_limit
    );
    if change.pruned() > 0 {
        out.push_str(&format!(
            "   Pruned {} messages ({} → {})\n",
            change.pruned(),
            change.before,
            change.after
        ));
    }
    CommandOutcome::Handled(out)
}

fn provider_command(args: &[&str], session: &mut Session) -> CommandOutcome {
    let current = session.config.llm.provider.to_lowercase();
    let Some(raw) = args.first() else {
        let mut out = format!("\nCurrent provider: {}\n\nAvailable providers:\n", current);
        for provider in PROVIDERS {
            let marker = if provider.name == current { " ← current" } else { "" };
            out.push_str(&format!("  • {}: {}{}\n", provider.name, provider.description, marker));
        }
        out.push_str("\nUsage: /provider <name>\nExample: /provider anthropic\n");
        return CommandOutcome::Handled(out);
    };

    let Some(info) = providers::lookup(raw) else {
        let names: Vec<&str> = PROVIDERS.iter().map(|p| p.name).collect();
        return CommandOutcome::Rejected(format!(
            "\nUnknown provider: {}\nAvailable providers: {}\n",
            raw.to_lowercase(),
            names.join(", ")
        ));
    };

    let env_key = info
        .api_key_env
        .and_then(|var| std::env::var(var).ok())
        .filter(|key| !key.is_empty());
    let api_key = env_key.or_else(|| session.config.llm.api_key.clone());
    if info.requires_api_key && api_key.is_none() {
        return CommandOutcome::Rejected(format!(
            "\nProvider '{}' requires an API key\nPlease set an API key in the config file or {}\n",
            info.name,
            info.api_key_env.unwrap_or("the environment")
        ));
    }

    let llm = LLMConfig {
        provider: info.name.to_string(),
        endpoint: info.default_endpoint.to_string(),
        model: info.default_model.to_string(),
        api_key,
        ..session.config.llm.clone()
    };
    session.switch_llm(llm);
    info!(provider = %info.name, "Switched LLM provider");

    CommandOutcome::Handled(format!(
        "\n{} {}\n   Endpoint: {}\n   Model: {}\n",
        "Switched to provider:".green(),
        info.name,
        session.config.llm.endpoint,
        session.config.llm.model
    ))
}

fn model_command(args: &[&str], session: &mut Session) -> CommandOutcome {
    let Some(model) = args.first() else {
        return CommandOutcome::Handled(format!(
            "\nCurrent configuration:\n   Provider: {}\n   Model: {}\n\nUsage: /model <model-name>\nExample: /model gpt-4o\n",
            session.config.llm.provider, session.config.llm.model
        ));
    };

    let llm = LLMConfig {
        model: model.to_string(),
        ..session.config.llm.clone()
    };
    session.switch_llm(llm);

    CommandOutcome::Handled(format!(
        "\n{} {}\n   Provider: {}\n",
        "Switched to model:".green(),
        model,
        session.config.llm.provider
    ))
}

fn config_text(session: &Session) -> String {
    let config = &session.config;
    let key_state = if config.llm.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
        "Set"
    } else {
        "Not set"
    };

    format!(
        "\nCurrent Configuration:\n{rule}\n\nLLM:\n  Provider: {}\n  Model: {}\n  Endpoint: {}\n  Temperature: {}\n  Max tokens: {}\n  API key: {}\n\nContext:\n  Max messages: {}\n  Max tool output: {} chars\n\nAgent:\n  Max tool rounds: {}\n  Retry attempts: {}\n\nSafety:\n  Sandbox enabled: {}\n  Blocked commands: {}\n\nTools:\n  Registered: {} tools\n  Search paths: {}\n",
        config.llm.provider,
        config.llm.model,
        config.llm.endpoint,
        config.llm.temperature,
        config.llm.max_tokens,
        key_state,
        config.context.max_messages,
        config.context.max_tool_output_chars,
        config.agent.max_tool_rounds,
        config.agent.retry_attempts,
        config.safety.sandbox_enabled,
        config.safety.blocked_commands.join(", "),
        session.tools.len(),
        config.tools.search_paths.join(", "),
        rule = rule()
    )
}

/// Runs `!command` lines through the `run_shell` tool and formats the
/// result as a user message for the model.
#[derive(Debug, Clone)]
pub struct ShellInjection {
    max_output_chars: usize,
    shell: RunShellTool,
}

impl ShellInjection {
    pub fn new(max_output_chars: usize, shell: RunShellTool) -> Self {
        Self {
            max_output_chars,
            shell,
        }
    }

    /// Returns the message to inject, or `None` when there is nothing to run.
    /// Commands that never ran (blocked, timed out) are reported as stderr
    /// with exit code 1.
    pub async fn run(&self, command: &str) -> Option<String> {
        let command = command.trim();
        if command.is_empty() {
            println!("\n{}\nUsage: !<command>\nExample: !ls -la\n", "Error: No command specified".red());
            return None;
        }

        println!("\nRunning: {}\n{}", command, rule());
        let report = match self.shell.run_command(command, None, None).await {
            Ok(report) => report,
            Err(e) => {
                warn!(command = %command, error = %e, "Shell injection did not run");
                ShellReport {
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit_code: 1,
                }
            }
        };

        if !report.stdout.is_empty() {
            println!("{}", report.stdout.trim_end_matches('\n'));
        }
        if !report.stderr.is_empty() {
            println!("stderr: {}", report.stderr.trim_end_matches('\n'));
        }
        println!("{}\nExit code: {}\n", rule(), report.exit_code);
        info!(command = %command, exit_code = report.exit_code, "Shell injection");
        Some(self.context_message(command, &report))
    }

    pub fn context_message(&self, command: &str, report: &ShellReport) -> String {
        let (stdout, stdout_cut) = self.truncate(&report.stdout);
        let (stderr, stderr_cut) = self.truncate(&report.stderr);

        let mut message = format!(
            "[Shell command output]\nCommand: {}\nExit code: {}",
            command, report.exit_code
        );
        if !stdout.is_empty() {
            message.push_str(&format!("\n\nOutput:\n{}", stdout));
        }
        if !stderr.is_empty() {
            message.push_str(&format!("\n\nStderr:\n{}", stderr));
        }
        if stdout.is_empty() && stderr.is_empty() {
            message.push_str("\n\n(No output)");
        }
        if stdout_cut || stderr_cut {
            message.push_str("\n\nNote: Output was truncated due to length.");
        }
        message
    }

    fn truncate(&self, text: &str) -> (String, bool) {
        let total = text.chars().count();
        if total <= self.max_output_chars {
            return (text.to_string(), false);
        }
        let kept: String = text.chars().take(self.max_output_chars).collect();
        (
            format!("{}\n\n... (output truncated, {} total characters)", kept, total),
            true,
        )
    }
}
