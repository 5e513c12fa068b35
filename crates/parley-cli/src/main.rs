use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use parley_config::{find_config_path, load_config, resolve_api_key, resolve_path, save_config};
use parley_core::agent::{Agent, LoopSettings, RigModel};
use parley_core::session::{SessionKey, SessionStore, SqliteStorage};
use parley_core::tools::builtin_tools;
use parley_core::AgentError;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::providers::{anthropic, gemini, ollama, openai};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Render markdown text to the terminal using termimad.
fn render_markdown(text: &str) {
    let skin = termimad::MadSkin::default();
    skin.print_text(text);
}

#[derive(Parser)]
#[command(name = "parley", about = "Stateful tool-calling chat agent", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat within a persistent session
    Chat {
        /// User the session belongs to (defaults to $USER)
        #[arg(short, long)]
        user: Option<String>,

        /// Explicit session token; omit to use the user's default session
        #[arg(short, long)]
        session: Option<String>,

        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Answer one prompt without a session
    Ask {
        /// The prompt to answer
        prompt: String,
    },
    /// Discard a session's history
    Reset {
        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long)]
        session: Option<String>,
    },
    /// List stored sessions
    Sessions,
    /// Remove sessions idle past the configured timeout
    Sweep,
    /// Create a config file
    Onboard {
        /// Skip interactive prompts and write defaults
        #[arg(long)]
        non_interactive: bool,
    },
    /// Show configuration and storage status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},parley_core::agent=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(find_config_path);

    match cli.command {
        Commands::Onboard { non_interactive } => {
            run_onboard(cli.config, non_interactive)?;
        }
        Commands::Status => {
            run_status(&config_path).await?;
        }
        Commands::Chat {
            user,
            session,
            message,
        } => {
            let config = load_config(&config_path)?;
            let key = session_key(user, session);
            let agent = build_agent(&config)?;
            if let Some(msg) = message {
                run_single_message(&agent, &key, &msg).await?;
            } else {
                let sweeper = agent
                    .sessions()
                    .spawn_sweeper(Duration::from_secs(config.sessions.sweep_interval_secs));
                let result = run_interactive(&agent, &key).await;
                sweeper.abort();
                result?;
            }
        }
        Commands::Ask { prompt } => {
            let agent = build_agent(&load_config(&config_path)?)?;
            match agent.ask(&prompt).await {
                Ok(reply) => render_markdown(&reply),
                Err(e) => report_error(&e),
            }
        }
        Commands::Reset { user, session } => {
            let key = session_key(user, session);
            open_store(&load_config(&config_path)?)?.reset(&key).await?;
            println!("Session {key} reset.");
        }
        Commands::Sessions => {
            run_sessions(&*open_store(&load_config(&config_path)?)?).await?;
        }
        Commands::Sweep => {
            let removed = open_store(&load_config(&config_path)?)?.evict_idle().await?;
            println!("Removed {removed} idle session(s).");
        }
    }

    Ok(())
}

fn session_key(user: Option<String>, session: Option<String>) -> SessionKey {
    let user = user
        .or_else(|| std::env::var("USER").ok())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "local".to_string());
    match session {
        Some(token) => SessionKey::with_token(user, token),
        None => SessionKey::for_user(user),
    }
}

fn open_store(config: &parley_config::Config) -> Result<Arc<SessionStore>> {
    let db_path = resolve_path(&config.sessions.database);
    let storage = SqliteStorage::open(&db_path)?;
    Ok(Arc::new(SessionStore::new(
        Arc::new(storage),
        Duration::from_secs(config.sessions.idle_timeout_secs),
    )))
}

fn build_agent(config: &parley_config::Config) -> Result<Agent> {
    let agent_cfg = &config.agent;
    let handle = create_model_for(&agent_cfg.provider, &agent_cfg.model, config)?;
    let model = RigModel::new(handle, format!("{}/{}", agent_cfg.provider, agent_cfg.model))
        .with_system_instruction(agent_cfg.system_instruction.clone())
        .with_sampling(agent_cfg.temperature, agent_cfg.max_output_tokens);

    let tools = builtin_tools()?;
    tracing::info!("Registered {} tool(s)", tools.len());

    Ok(Agent::new(
        Arc::new(model),
        tools,
        open_store(config)?,
        LoopSettings::from_config(config),
    )
    .with_token_limit(config.sessions.max_tokens_per_session))
}

/// Create a completion model for a specific provider + model combination.
///
/// Errors clearly if provider is unknown or has no API key.
#[allow(deprecated)]
fn create_model_for(
    provider: &str,
    model_name: &str,
    config: &parley_config::Config,
) -> Result<CompletionModelHandle<'static>> {
    if provider.is_empty() {
        anyhow::bail!(
            "No provider configured.\nValid providers: gemini, openai, anthropic, ollama"
        );
    }

    if model_name.is_empty() {
        anyhow::bail!("No model configured for provider '{provider}'.");
    }

    match provider {
        "gemini" => {
            let key =
                resolve_api_key(&config.providers.gemini, "GEMINI_API_KEY").ok_or_else(|| {
                    anyhow::anyhow!(
                        "Gemini provider selected but no API key found. \
                     Set providers.gemini.apiKey in config.json or GEMINI_API_KEY env var."
                    )
                })?;
            let client: gemini::Client = gemini::Client::new(key)
                .map_err(|e| anyhow::anyhow!("Failed to create Gemini client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Gemini provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "openai" => {
            let key =
                resolve_api_key(&config.providers.openai, "OPENAI_API_KEY").ok_or_else(|| {
                    anyhow::anyhow!(
                        "OpenAI provider selected but no API key found. \
                     Set providers.openai.apiKey in config.json or OPENAI_API_KEY env var."
                    )
                })?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(ref base) = config
                .providers
                .openai
                .as_ref()
                .and_then(|c| c.api_base.clone())
                .filter(|b| !b.is_empty())
            {
                builder = builder.base_url(base);
                tracing::info!("Using OpenAI provider with custom base: {base}");
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "anthropic" => {
            let key = resolve_api_key(&config.providers.anthropic, "ANTHROPIC_API_KEY")
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Anthropic provider selected but no API key found. \
                     Set providers.anthropic.apiKey in config.json or ANTHROPIC_API_KEY env var."
                    )
                })?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Anthropic provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(ref base) = config
                .providers
                .ollama
                .as_ref()
                .and_then(|c| c.api_base.clone())
                .filter(|b| !b.is_empty())
            {
                builder = builder.base_url(base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }

        other => {
            anyhow::bail!(
                "Unknown provider '{other}'. Valid providers: gemini, openai, anthropic, ollama"
            );
        }
    }
}

/// Print an agent error the way a user should see it: classification first,
/// then whatever partial answer the model produced.
fn report_error(err: &AgentError) {
    eprintln!("Error [{}]: {err}", err.kind());
    match err {
        AgentError::LoopBudgetExceeded {
            partial: Some(partial),
            ..
        } => {
            println!();
            render_markdown(partial);
        }
        AgentError::TokenLimitExceeded { .. } => {
            eprintln!("Reset the session (/reset or `parley reset`) to continue.");
        }
        _ => {}
    }
}

async fn run_single_message(agent: &Agent, key: &SessionKey, message: &str) -> Result<()> {
    match agent.handle_prompt(key, message).await {
        Ok(reply) => render_markdown(&reply),
        Err(e) => report_error(&e),
    }
    Ok(())
}

async fn run_interactive(agent: &Agent, key: &SessionKey) -> Result<()> {
    let history_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
        .join("history");
    std::fs::create_dir_all(&history_dir)?;
    let history_path = history_dir.join("cli_history");

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("parley chat as {key} (type /help for commands, Ctrl-D to quit)");
    println!();

    let result = loop {
        let readline = rl.readline("you> ");
        match readline {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(input);

                if matches!(input, "exit" | "quit" | "/exit" | "/quit" | ":q") {
                    break Ok(());
                }

                match input {
                    "/help" => {
                        println!("Commands:");
                        println!("  /reset - Forget this conversation and start over");
                        println!("  /info  - Show session size and token usage");
                        println!("  /help  - Show this help");
                        println!("  /quit  - Exit");
                        println!();
                        continue;
                    }
                    "/reset" => {
                        match agent.reset_session(key).await {
                            Ok(()) => println!("Session reset."),
                            Err(e) => report_error(&e),
                        }
                        println!();
                        continue;
                    }
                    "/info" => {
                        match agent.sessions().get_existing(key).await {
                            Ok(session) => println!(
                                "{} turn(s), {} token(s), started {}",
                                session.turns().len(),
                                session.token_count,
                                session
                                    .created_at
                                    .with_timezone(&chrono::Local)
                                    .format("%Y-%m-%d %H:%M")
                            ),
                            Err(e) => println!("No active session ({})", e.kind()),
                        }
                        println!();
                        continue;
                    }
                    _ => {}
                }

                match agent.handle_prompt(key, input).await {
                    Ok(reply) => {
                        println!();
                        render_markdown(&reply);
                        println!();
                    }
                    Err(e) => {
                        report_error(&e);
                        println!();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break Ok(());
            }
            Err(err) => {
                eprintln!("Error: {err}");
                break Ok(());
            }
        }
    };

    let _ = rl.save_history(&history_path);
    result
}

async fn run_sessions(store: &SessionStore) -> Result<()> {
    let sessions = store.list().await?;
    if sessions.is_empty() {
        println!("No stored sessions.");
        return Ok(());
    }
    println!(
        "{:<32} {:<16} {:>6} {:>8}  LAST ACTIVE",
        "SESSION", "USER", "TURNS", "TOKENS"
    );
    for s in sessions {
        println!(
            "{:<32} {:<16} {:>6} {:>8}  {}",
            s.id,
            s.user,
            s.turn_count,
            s.token_count,
            s.last_active
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn prompt_with_default(prompt: &str, default: &str) -> Result<String> {
    use std::io::{self, Write};
    print!("{prompt} [{default}]: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let trimmed = input.trim();
    if trimmed.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Write a config file with defaults, optionally asking for the essentials.
fn run_onboard(config_arg: Option<PathBuf>, non_interactive: bool) -> Result<()> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let config_path = config_arg.unwrap_or_else(|| home.join(".parley").join("config.json"));
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `parley onboard` again.");
        return Ok(());
    }

    let mut cfg = parley_config::Config::default();
    if !non_interactive {
        println!("Interactive setup");
        cfg.agent.provider = prompt_with_default(
            "Provider (gemini/openai/anthropic/ollama)",
            &cfg.agent.provider,
        )?;
        cfg.agent.model = prompt_with_default("Model", &cfg.agent.model)?;
        let timeout = prompt_with_default(
            "Session idle timeout in seconds",
            &cfg.sessions.idle_timeout_secs.to_string(),
        )?;
        cfg.sessions.idle_timeout_secs = timeout
            .parse()
            .map_err(|_| anyhow::anyhow!("'{timeout}' is not a number of seconds"))?;
    }
    cfg.validate()?;

    save_config(&config_path, &cfg)?;
    println!("Created config: {}", config_path.display());
    println!();
    println!("Setup complete! Next steps:");
    println!(
        "  1. Add an API key for '{}' to {} (or set it in the environment)",
        cfg.agent.provider,
        config_path.display()
    );
    println!("  2. Run `parley chat` to start chatting");
    println!();
    Ok(())
}

/// Show configuration summary and session storage state.
async fn run_status(config_path: &Path) -> Result<()> {
    println!("parley status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!(
            "  Config:    {} (not found, using defaults; run `parley onboard`)",
            config_path.display()
        );
    }

    let config = load_config(config_path)?;
    let agent = &config.agent;
    println!("  Provider:  {}", agent.provider);
    println!("  Model:     {}", agent.model);
    let key_env = match agent.provider.as_str() {
        "gemini" => Some((&config.providers.gemini, "GEMINI_API_KEY")),
        "openai" => Some((&config.providers.openai, "OPENAI_API_KEY")),
        "anthropic" => Some((&config.providers.anthropic, "ANTHROPIC_API_KEY")),
        _ => None,
    };
    if let Some((provider_cfg, env_var)) = key_env {
        println!(
            "  API key:   {}",
            if resolve_api_key(provider_cfg, env_var).is_some() {
                "configured"
            } else {
                "missing"
            }
        );
    }
    println!(
        "  Loop:      {} tool round trip(s), {} retr(ies), {}s call timeout",
        agent.max_tool_iterations, config.retry.max_retries, config.retry.call_timeout_secs
    );
    println!();

    let db_path = resolve_path(&config.sessions.database);
    println!("  Sessions:");
    println!(
        "    Idle timeout: {}s (sweep every {}s)",
        config.sessions.idle_timeout_secs, config.sessions.sweep_interval_secs
    );
    match config.sessions.max_tokens_per_session {
        0 => println!("    Token limit: none"),
        limit => println!("    Token limit: {limit} per session"),
    }
    if db_path.exists() {
        let store = open_store(&config)?;
        let stored = store.list().await?;
        println!("    Database: {} ({} stored)", db_path.display(), stored.len());
    } else {
        println!("    Database: {} (not created yet)", db_path.display());
    }

    Ok(())
}
