use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coda_agent::clients::providers;
use coda_agent::config::{Config, LayeredConfig, standard_config_paths};
use coda_agent::core::{AgentLoop, RoundOutcome, Session, default_client_factory};
use coda_agent::logging::{self, Verbosity};
use coda_agent::prompts::build_system_prompt;
use coda_agent::tools::{SafetyPolicy, ToolTrait, Workspace};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "coda")]
#[command(version)]
#[command(about = "Interactive AI coding agent", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, global = true, help = "Config file to use instead of the standard locations")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    provider: Option<String>,

    #[arg(short, long, global = true)]
    model: Option<String>,

    #[arg(long, global = true, help = "Chat endpoint URL")]
    endpoint: Option<String>,

    #[arg(long, global = true)]
    api_key: Option<String>,

    #[arg(short, long, global = true, help = "Directory tools operate in (default: current directory)")]
    workdir: Option<PathBuf>,

    #[arg(long, global = true)]
    max_tool_rounds: Option<usize>,

    #[arg(long, global = true)]
    no_color: bool,

    #[arg(long, global = true, help = "Disable the file sandbox")]
    no_sandbox: bool,

    #[arg(short, long, global = true, conflicts_with = "verbose", help = "Only log errors")]
    quiet: bool,

    #[arg(short, long, global = true, help = "Log debug output to stderr")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run a single task and exit")]
    Run {
        #[arg(short, long, help = "Task description")]
        task: String,
    },

    #[command(about = "Interactive chat (default)")]
    Interactive,

    #[command(about = "List built-in and discovered external tools")]
    CheckTools,
}

/// Config files that were skipped are returned alongside the config; they are
/// logged once the subscriber is up.
fn load_config(args: &Args) -> Result<LayeredConfig> {
    let LayeredConfig { mut config, skipped } = match &args.config {
        Some(path) => LayeredConfig {
            config: Config::load_from(path)?,
            skipped: Vec::new(),
        },
        None => Config::load_layered(&standard_config_paths()),
    };

    if let Some(provider) = &args.provider {
        let provider = provider.to_lowercase();
        if provider != config.llm.provider.to_lowercase() {
            if let Some(info) = providers::lookup(&provider) {
                config.llm.endpoint = info.default_endpoint.to_string();
                config.llm.model = info.default_model.to_string();
            }
            config.llm.api_key = None;
        }
        config.llm.provider = provider;
    }
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if let Some(endpoint) = &args.endpoint {
        config.llm.endpoint = endpoint.clone();
    }
    if let Some(api_key) = &args.api_key {
        config.llm.api_key = Some(api_key.clone());
    }
    if let Some(rounds) = args.max_tool_rounds {
        config.agent.max_tool_rounds = rounds;
    }
    if args.no_sandbox {
        config.safety.sandbox_enabled = false;
    }
    if args.no_color {
        config.ui.color = false;
    }

    config.apply_env();
    config.validate()?;
    Ok(LayeredConfig { config, skipped })
}

fn verbosity(args: &Args) -> Verbosity {
    if args.quiet {
        Verbosity::Quiet
    } else if args.verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let layered = load_config(&args)?;
    let _logging = logging::init(&layered.config.ui, verbosity(&args));
    layered.log_skipped();
    let config = layered.config;
    if !config.ui.color {
        colored::control::set_override(false);
    }

    let workdir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Cannot determine the current directory")?,
    };
    let workdir = workdir
        .canonicalize()
        .with_context(|| format!("Working directory not found: {}", workdir.display()))?;

    let policy = SafetyPolicy::from_config(&config.safety, &workdir);
    let mut session = Session::new(config, Workspace::new(workdir.clone(), policy), default_client_factory());
    let loaded = session.load_external_tools().await;
    info!(
        provider = %session.config.llm.provider,
        model = %session.config.llm.model,
        external_tools = loaded,
        workdir = %workdir.display(),
        "Session ready"
    );

    match args.command.unwrap_or(Commands::Interactive) {
        Commands::CheckTools => {
            println!("Tool search paths: {}", session.discovery().search_paths().join(", "));
            for definition in session.tools.definitions() {
                let kind = match session.tools.get(&definition.name) {
                    Some(tool) if tool.is_external() => "external",
                    _ => "built-in",
                };
                println!("  {} ({}): {}", definition.name, kind, definition.description);
            }
            println!(
                "Total: {} tools ({} external)",
                session.tools.len(),
                session.tools.external_count()
            );
        }

        Commands::Run { task } => {
            let prompt = build_system_prompt(
                &session.tools.definitions(),
                &workdir,
                session.config.agent.system_prompt.as_deref(),
            );
            let mut agent = AgentLoop::new(session, prompt);
            match agent.run_task(&task).await? {
                RoundOutcome::Completed { rounds } => info!(rounds, "Task finished"),
                RoundOutcome::MaxRoundsReached { rounds } => warn!(rounds, "Task stopped at the tool round limit"),
                RoundOutcome::Failed(e) => return Err(e.into()),
            }
        }

        Commands::Interactive => {
            let prompt = build_system_prompt(
                &session.tools.definitions(),
                &workdir,
                session.config.agent.system_prompt.as_deref(),
            );
            let mut agent = AgentLoop::new(session, prompt);
            let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
            agent.run(lines).await?;
        }
    }

    Ok(())
}
