use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use engine::{DailyRange, Engine};
use pagination::{MessageFilter, PageRequest};

mod aggregate_cache;
mod config;
mod derived_cache;
mod discovery;
mod engine;
mod error;
mod logging;
mod pagination;
mod pricing;
mod query;
mod source_cache;
mod status;
mod types;
mod utils;

#[derive(Parser)]
#[command(name = "session-tracer")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pretty-print JSON instead of a single line
    #[arg(long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List projects with their totals, most recently active first
    Projects,
    /// List the sessions of a project
    Sessions {
        /// Project directory name
        project: String,
    },
    /// Summary of one session
    Session(SessionArgs),
    /// Page through the messages of a session
    Messages(MessagesArgs),
    /// Tool usage counts for a session
    Tools(SessionArgs),
    /// Token, cost and activity metrics for a session
    Metrics(SessionArgs),
    /// Values the messages of a session can be filtered by
    Filters(SessionArgs),
    /// Subagents launched by a session
    Subagents(SessionArgs),
    /// Skills invoked in a session
    Skills(SessionArgs),
    /// Files created and edited in a session
    Changes(SessionArgs),
    /// Failed tool calls in a session
    Errors(SessionArgs),
    /// Typed prompts of a session, with steps, tools and interruptions per prompt
    Commands(SessionArgs),
    /// Project totals, split between cached and live sessions
    ProjectMetrics {
        /// Project directory name
        project: String,
    },
    /// Tool usage summed over every session of a project
    ProjectTools {
        /// Project directory name
        project: String,
    },
    /// Billed usage of a project per UTC day
    Daily(DailyArgs),
    /// Totals over every project
    Totals,
    /// One subagent, looked up by agent id
    Subagent(AgentArgs),
    /// Tool usage of one subagent
    SubagentTools(AgentArgs),
    /// Keep the index fresh in the background until Ctrl-C
    Watch,
    /// Inspect or reset the caches
    Cache(CacheArgs),
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct SessionArgs {
    /// Project directory name
    project: String,
    /// Session id
    session: String,
}

#[derive(Args)]
struct AgentArgs {
    /// Project directory name
    project: String,
    /// Agent id, as in `agent-<id>.jsonl`
    agent: String,
}

#[derive(Args)]
struct DailyArgs {
    /// Project directory name
    project: String,

    /// How many days back from the end to cover (1-365)
    #[arg(long, default_value_t = engine::reports::DEFAULT_DAYS)]
    days: u32,

    /// First day to include (YYYY-MM-DD)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day to include (YYYY-MM-DD); today when omitted
    #[arg(long)]
    end: Option<NaiveDate>,
}

#[derive(Args)]
struct MessagesArgs {
    #[command(flatten)]
    target: SessionArgs,

    /// Continue after this cursor
    #[arg(long, conflicts_with = "page")]
    cursor: Option<String>,

    /// Page number (starting at 1); switches to offset pagination
    #[arg(long)]
    page: Option<usize>,

    #[arg(long)]
    per_page: Option<usize>,

    /// Only `user` or `assistant` messages
    #[arg(long = "type", value_parser = ["user", "assistant"])]
    message_type: Option<String>,

    /// Only messages from this model
    #[arg(long)]
    model: Option<String>,

    /// Only messages that call this tool
    #[arg(long)]
    tool: Option<String>,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    subcommand: CacheSubcommands,
}

#[derive(Subcommand)]
enum CacheSubcommands {
    /// Show cache sizes
    Stats,
    /// Drop every cached result, including persisted aggregates
    Clear,
    /// Drop expired query sources
    Sweep,
    /// Forget the cached aggregates of a project or one of its sessions
    Invalidate {
        /// Project directory name
        project: String,
        /// Session id; the whole project when omitted
        session: Option<String>,
    },
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key (projects-dir, cache-file, scan-interval, source-ttl,
        /// derived-capacity, max-source-bytes, default-per-page, max-per-page, log-level)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::Config::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Ignoring unreadable configuration: {e:#}");
            config::Config::default()
        }
    };

    if let Err(e) = logging::init(&config.logging.level) {
        eprintln!("Error setting up logging: {e:#}");
    }

    if let Err(e) = run(cli.command, config, cli.pretty).await {
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code(&e));
    }
}

/// 2 for malformed input, 3 for unknown projects or sessions, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<error::EngineError>() {
        Some(err) if err.is_bad_request() => 2,
        Some(err) if err.is_not_found() => 3,
        _ => 1,
    }
}

async fn run(command: Commands, config: config::Config, pretty: bool) -> Result<()> {
    // Configuration commands never touch the projects directory or the caches.
    let command = match command {
        Commands::Config(config_args) => {
            handle_config_subcommand(config_args);
            return Ok(());
        }
        command => command,
    };

    let scan_interval = config.scan_interval();
    let engine = Engine::from_config(config).context("Failed to set up the engine")?;

    match command {
        Commands::Projects => print_json(&engine.list_projects().await?, pretty)?,
        Commands::Sessions { project } => {
            print_json(&engine.list_sessions(&project).await?, pretty)?
        }
        Commands::Session(args) => print_json(
            &engine.session_summary(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::Messages(args) => {
            let request = PageRequest {
                cursor: args.cursor,
                page: args.page,
                per_page: args.per_page,
                filter: MessageFilter {
                    message_type: args.message_type,
                    model: args.model,
                    tool: args.tool,
                },
            };
            let page = engine
                .list_messages(&args.target.project, &args.target.session, request)
                .await?;
            print_json(&page, pretty)?
        }
        Commands::Tools(args) => print_json(
            &engine.get_tool_usage(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::Metrics(args) => print_json(
            &engine.get_metrics(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::Filters(args) => print_json(
            &engine.get_filter_options(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::Subagents(args) => print_json(
            &engine.get_subagents(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::Skills(args) => print_json(
            &engine.get_skills(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::Changes(args) => print_json(
            &engine.get_code_changes(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::Errors(args) => print_json(
            &engine.get_errors(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::Commands(args) => print_json(
            &engine.get_commands(&args.project, &args.session).await?,
            pretty,
        )?,
        Commands::ProjectMetrics { project } => {
            print_json(&engine.project_metrics(&project).await?, pretty)?
        }
        Commands::ProjectTools { project } => {
            print_json(&engine.project_tool_usage(&project).await?, pretty)?
        }
        Commands::Daily(args) => {
            let range = DailyRange {
                days: Some(args.days),
                start: args.start,
                end: args.end,
            };
            print_json(&engine.daily_metrics(&args.project, range).await?, pretty)?
        }
        Commands::Totals => print_json(&engine.all_projects_metrics().await?, pretty)?,
        Commands::Subagent(args) => print_json(
            &engine.subagent_detail(&args.project, &args.agent).await?,
            pretty,
        )?,
        Commands::SubagentTools(args) => print_json(
            &engine.subagent_tools(&args.project, &args.agent).await?,
            pretty,
        )?,
        Commands::Watch => run_watch(&engine, scan_interval).await?,
        Commands::Cache(args) => match args.subcommand {
            CacheSubcommands::Stats => print_json(&engine.cache_stats(), pretty)?,
            CacheSubcommands::Clear => {
                engine.clear_caches();
                println!("Caches cleared.");
            }
            CacheSubcommands::Sweep => {
                println!("Dropped {} expired query sources.", engine.sweep());
            }
            CacheSubcommands::Invalidate { project, session } => {
                if engine.invalidate(&project, session.as_deref()) {
                    println!("Cached aggregates dropped.");
                } else {
                    println!("Nothing cached for that target.");
                }
            }
        },
        Commands::Config(config_args) => handle_config_subcommand(config_args),
    }

    // Aggregates computed while answering are worth keeping.
    engine
        .save_durable_cache()
        .await
        .context("Failed to save the aggregate cache")?;
    Ok(())
}

/// Run the background scanner until Ctrl-C, refreshing project totals on every tick.
async fn run_watch(engine: &Engine, interval: Duration) -> Result<()> {
    engine.start_background_scanner().await;
    eprintln!("Watching for session changes. Press Ctrl-C to stop.");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                engine.sweep();
                match engine.list_projects().await {
                    Ok(projects) => {
                        let sessions: u64 = projects.iter().map(|p| p.session_count).sum();
                        tracing::info!(projects = projects.len(), sessions, "project totals refreshed");
                    }
                    Err(err) => tracing::warn!("failed to refresh project totals: {err}"),
                }
                if let Err(err) = engine.save_durable_cache().await {
                    tracing::warn!("failed to save aggregate cache: {err:#}");
                }
            }
        }
    }

    engine.stop_background_scanner().await;
    if let Some(catalog) = engine.index().snapshot() {
        tracing::info!(projects = catalog.projects.len(), "final index snapshot");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        simd_json::to_string_pretty(value)?
    } else {
        simd_json::to_string(value)?
    };
    println!("{json}");
    Ok(())
}

fn handle_config_subcommand(config_args: ConfigArgs) {
    match config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            if let Err(e) = config::create_default_config(overwrite) {
                eprintln!("Error creating config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Show => {
            if let Err(e) = config::show_config() {
                eprintln!("Error showing config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Set { key, value } => {
            if let Err(e) = config::set_config_value(&key, &value) {
                eprintln!("Error setting config: {e}");
                std::process::exit(1);
            }
        }
    }
}
