use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_agent::{AgentEvent, Engine, ToolEventState, TurnContext, TurnOutcome};
use parley_core::config::{Config, ConfigHandle, data_dir};
use parley_core::types::{ChatMessage, ToolState};
use parley_providers::OpenAiProvider;
use parley_store::{DbPool, connect_with_settings, migrations::run_pending};

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Organization chat assistant: agent engine, token quotas, and a WebSocket gateway",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run migrations and start the gateway server
    Serve {
        /// Port to listen on (default: gateway.port or 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Apply pending database migrations
    Migrate,

    /// Run one chat turn in the terminal
    Chat {
        #[arg(long)]
        user: Uuid,

        #[arg(long)]
        org: Uuid,

        /// Continue an existing chat instead of starting a new one
        #[arg(long)]
        chat: Option<Uuid>,

        /// Message to send
        #[arg(short, long)]
        message: String,
    },

    /// Show today's token usage for a user
    Usage {
        #[arg(long)]
        user: Uuid,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for errors
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            let handle = ConfigHandle::new(config);
            let pool = open_pool(&handle.snapshot()).await?;
            run_pending(&pool).await?;

            let engine = Arc::new(build_engine(pool, &handle));
            let state = Arc::new(parley_gateway::GatewayState::new(handle.clone(), engine.clone()));

            // The watcher must outlive the server.
            let _watcher = match parley_gateway::ConfigWatcher::start(
                config_path.clone(),
                handle,
                engine.agents().clone(),
            ) {
                Ok((watcher, changes)) => {
                    parley_gateway::announce_changes(state.clone(), changes);
                    Some(watcher)
                }
                Err(e) => {
                    tracing::warn!(%e, path = %config_path.display(), "Config hot reload disabled");
                    None
                }
            };

            tracing::info!("Starting Parley gateway on port {port}");
            parley_gateway::start_gateway(state, port).await?;
        }
        Commands::Migrate => {
            let pool = open_pool(&config).await?;
            run_pending(&pool).await?;
            println!("Migrations applied to {}", config.database_url());
        }
        Commands::Chat {
            user,
            org,
            chat,
            message,
        } => {
            let handle = ConfigHandle::new(config);
            let pool = open_pool(&handle.snapshot()).await?;
            run_pending(&pool).await?;
            let engine = build_engine(pool, &handle);
            run_chat(&engine, user, org, chat, &message).await?;
        }
        Commands::Usage { user } => {
            let handle = ConfigHandle::new(config);
            let pool = open_pool(&handle.snapshot()).await?;
            run_pending(&pool).await?;
            let engine = build_engine(pool, &handle);
            let usage = engine.usage(user).await?;
            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise the configured level and per-crate filters.
fn init_tracing(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    let directives = std::iter::once(level)
        .chain(logging.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",");

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&directives))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format == "json", logging.output == "stdout") {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

async fn open_pool(config: &Config) -> anyhow::Result<DbPool> {
    let url = config.database_url();
    if url.contains(&*data_dir().to_string_lossy()) {
        std::fs::create_dir_all(data_dir())?;
    }
    let pool = connect_with_settings(
        &url,
        config.database_max_connections(),
        config.database_acquire_timeout_secs(),
    )
    .await?;
    Ok(pool)
}

fn build_engine(pool: DbPool, handle: &ConfigHandle) -> Engine {
    let provider = Arc::new(OpenAiProvider::from_config(&handle.snapshot()));
    Engine::from_pool(pool, provider, handle.clone())
}

enum Step {
    Send { chat: Option<Uuid>, content: String },
    Decide { chat: Uuid, tool_call_id: String, approve: bool },
}

async fn run_chat(
    engine: &Engine,
    user: Uuid,
    org: Uuid,
    chat: Option<Uuid>,
    message: &str,
) -> anyhow::Result<()> {
    let mut step = Step::Send {
        chat,
        content: message.to_string(),
    };
    loop {
        let outcome = run_step(engine, user, org, step).await?;
        let snapshot = outcome.snapshot();
        let TurnOutcome::AwaitingConfirmation(_) = &outcome else {
            println!("\n[chat {}]", snapshot.chat.id);
            return Ok(());
        };

        let Some(proposal) = pending_proposal(&snapshot.messages) else {
            anyhow::bail!("turn is awaiting confirmation but no proposal was found");
        };
        let tool_call_id = proposal.tool_call_id.clone().unwrap_or_default();
        let prompt = format!(
            "Run {} with {}?",
            proposal.tool_name.as_deref().unwrap_or("tool"),
            proposal.tool_arguments.clone().unwrap_or_default()
        );
        let approve = Confirm::new().with_prompt(prompt).default(false).interact()?;
        step = Step::Decide {
            chat: snapshot.chat.id,
            tool_call_id,
            approve,
        };
    }
}

fn pending_proposal(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages.iter().rev().find(|m| m.tool_state == ToolState::Proposed)
}

/// Run one engine call while printing its events; Ctrl-C stops the turn.
async fn run_step(engine: &Engine, user: Uuid, org: Uuid, step: Step) -> anyhow::Result<TurnOutcome> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = TurnContext::new(user, org, tx);
    let stop = ctx.stop.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.cancel();
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let result = match step {
        Step::Send { chat, content } => engine.send_message(&ctx, chat, &content).await,
        Step::Decide {
            chat,
            tool_call_id,
            approve,
        } => engine.decide_tool_call(&ctx, chat, &tool_call_id, approve).await,
    };
    drop(ctx);
    let _ = printer.await;
    ctrl_c.abort();
    Ok(result?)
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::ContentDelta { delta, .. } => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::Tool {
            state,
            tool_name,
            error,
            ..
        } => match (state, error) {
            (ToolEventState::Invoking, _) => eprintln!("\n[tool] {tool_name} ..."),
            (ToolEventState::Completed, _) => eprintln!("[tool] {tool_name} done"),
            (ToolEventState::Error, Some(e)) => eprintln!("[tool] {tool_name} failed: {e}"),
            (ToolEventState::Error, None) => eprintln!("[tool] {tool_name} failed"),
        },
        AgentEvent::Usage { total_tokens, .. } => tracing::debug!(total_tokens, "Model call usage"),
        AgentEvent::Error { code, message } => eprintln!("\n[error] {code}: {message}"),
        AgentEvent::Status { .. } | AgentEvent::Final { .. } => {}
    }
}
