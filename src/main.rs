use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ctxforge_core::config::AppConfig;
use ctxforge_core::event::EventBus;
use ctxforge_core::graph::Graph;
use ctxforge_core::traits::{GraphLookup, RunStore};
use ctxforge_core::types::{ComparisonRun, MemberOutcome, SessionId, SessionStatus};

use ctxforge_engine::{order_graph, ComparisonCoordinator, RunLogger, RuntimeContext, SessionRunner};
use ctxforge_gateway::{AppState, GatewayServer};
use ctxforge_memory::{ChainedLookup, GraphDirectory, SqliteStore, StaticGraphs};

#[derive(Parser)]
#[command(name = "ctxforge", version, about = "Run and compare LLM context pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ctxforge.toml")]
    config: PathBuf,

    /// Replace provider calls with deterministic synthetic responses
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one graph and print the session
    Run {
        /// Graph JSON file, or the id of a saved graph
        graph: String,
        /// Input text (read from stdin when omitted)
        #[arg(short, long)]
        input: Option<String>,
        /// Parse the input as JSON instead of plain text
        #[arg(long)]
        json_input: bool,
        /// Session id to run under
        #[arg(short, long)]
        session: Option<String>,
        /// Print only the final output
        #[arg(short, long)]
        quiet: bool,
    },
    /// Execute several graphs against the same input
    Compare {
        /// Graph JSON files or saved graph ids
        #[arg(required = true, num_args = 1..)]
        graphs: Vec<String>,
        /// Input text (read from stdin when omitted)
        #[arg(short, long)]
        input: Option<String>,
        /// Parse the input as JSON instead of plain text
        #[arg(long)]
        json_input: bool,
        /// Print the full comparison as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the execution order of a graph
    Order {
        /// Graph JSON file or saved graph id
        graph: String,
    },
    /// Start the HTTP/WebSocket gateway
    Serve,
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries results
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ctxforge=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "ctxforge", &mut io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;
    if cli.mock {
        config.engine.mock_mode = true;
    }

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Order { graph } => {
            let files = Arc::new(StaticGraphs::new());
            let id = register_graph_arg(&files, &graph)?;
            let lookup = graph_lookup(&config, files, None);
            let graph = lookup.resolve_graph(&id).await?;
            let order = order_graph(&graph)?;
            for (position, node_id) in order.iter().enumerate() {
                let variant = graph
                    .node(node_id)
                    .map(|n| n.variant.display_name())
                    .unwrap_or("?");
                println!("{:>3}. {} ({})", position + 1, node_id, variant);
            }
        }
        Commands::Run {
            graph,
            input,
            json_input,
            session,
            quiet,
        } => {
            let app = App::build(&config).await?;
            let id = register_graph_arg(&app.files, &graph)?;
            let graph = app.lookup.resolve_graph(&id).await?;
            let input = read_input(input, json_input)?;
            let session_id = session
                .map(|s| SessionId::from_string(&s))
                .unwrap_or_default();

            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());
            let logger = app.spawn_run_log(&config, &session_id.0);

            let result = app
                .runner
                .run_with(&graph, input, session_id, cancel.child_token())
                .await;
            finish_run_log(logger, result.is_err()).await;
            let session = result?;

            if quiet {
                match &session.final_output {
                    Some(Value::String(text)) => println!("{}", text),
                    Some(other) => println!("{}", serde_json::to_string_pretty(other)?),
                    None => {}
                }
            } else {
                println!("{}", serde_json::to_string_pretty(&session)?);
            }

            if session.status == SessionStatus::Failed {
                let failure = session.error.as_ref().map(|e| e.message.as_str());
                anyhow::bail!("session failed: {}", failure.unwrap_or("unknown error"));
            }
        }
        Commands::Compare {
            graphs,
            input,
            json_input,
            json,
        } => {
            let app = App::build(&config).await?;
            let ids = graphs
                .iter()
                .map(|g| register_graph_arg(&app.files, g))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let input = read_input(input, json_input)?;

            let coordinator = ComparisonCoordinator::new(app.runner.clone(), app.lookup.clone())
                .with_limit(config.engine.max_comparison_graphs);
            let run = coordinator.compare(&ids, input).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_comparison(&run);
            }
        }
        Commands::Serve => {
            let app = App::build(&config).await?;
            let coordinator = ComparisonCoordinator::new(app.runner.clone(), app.lookup.clone())
                .with_limit(config.engine.max_comparison_graphs);
            let run_log = config
                .log_dir()
                .map(|dir| (dir, config.log.as_ref().map(|l| l.level).unwrap_or(2)));

            info!(bind = %config.gateway.bind, "Starting gateway");
            let server = GatewayServer::new(AppState {
                config: config.gateway.clone(),
                runner: app.runner.clone(),
                comparisons: Arc::new(coordinator),
                event_bus: app.event_bus.clone(),
                graphs: app.lookup.clone(),
                store: app.store.clone(),
                run_log,
                shutdown: CancellationToken::new(),
                active_runs: Default::default(),
            });

            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());
            server.run(cancel).await?;
        }
        // Handled above
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Everything a run needs, wired from config.
struct App {
    event_bus: Arc<EventBus>,
    store: Arc<dyn RunStore>,
    files: Arc<StaticGraphs>,
    lookup: Arc<dyn GraphLookup>,
    runner: Arc<SessionRunner>,
}

impl App {
    async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));

        let sqlite = match config.store_path() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                info!(path = %path.display(), "Opening store");
                Arc::new(SqliteStore::open(&path)?)
            }
            None => Arc::new(SqliteStore::in_memory()?),
        };

        let files = Arc::new(StaticGraphs::new());
        let lookup = graph_lookup(config, files.clone(), Some(sqlite.clone()));

        let ctx = RuntimeContext::from_config(config)
            .await
            .context("failed to build runtime context")?;
        let runner = SessionRunner::new(ctx, event_bus.clone()).with_store(sqlite.clone());

        Ok(Self {
            event_bus,
            store: sqlite,
            files,
            lookup,
            runner: Arc::new(runner),
        })
    }

    fn spawn_run_log(
        &self,
        config: &AppConfig,
        channel: &str,
    ) -> Option<(tokio::task::JoinHandle<Option<PathBuf>>, CancellationToken)> {
        let dir = config.log_dir()?;
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        let rx = self.event_bus.subscribe_channel(channel);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(RunLogger::new(dir, level).run(rx, channel.to_string(), cancel.clone()));
        Some((handle, cancel))
    }
}

/// Wait for the logger to see the terminal event, or stop it if none is coming.
async fn finish_run_log(
    logger: Option<(tokio::task::JoinHandle<Option<PathBuf>>, CancellationToken)>,
    rejected: bool,
) {
    let Some((handle, cancel)) = logger else {
        return;
    };
    if rejected {
        cancel.cancel();
    }
    if let Ok(Some(path)) = handle.await {
        info!(path = %path.display(), "Run log written");
    }
}

/// Files named on the command line first, then the graphs directory, then the store.
fn graph_lookup(
    config: &AppConfig,
    files: Arc<StaticGraphs>,
    store: Option<Arc<SqliteStore>>,
) -> Arc<dyn GraphLookup> {
    let mut chain = ChainedLookup::new().then(files);
    if let Some(dir) = config.graphs_dir() {
        chain = chain.then(Arc::new(GraphDirectory::new(dir)));
    }
    if let Some(store) = store {
        chain = chain.then(store);
    }
    Arc::new(chain)
}

/// A `.json` path is loaded and registered under its file stem; anything else is an id.
fn register_graph_arg(files: &StaticGraphs, arg: &str) -> anyhow::Result<String> {
    let path = Path::new(arg);
    let is_file = path.extension().and_then(|e| e.to_str()) == Some("json") && path.is_file();
    if !is_file {
        return Ok(arg.to_string());
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let graph: Graph = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse graph {}", path.display()))?;
    let id = graph.id.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(arg)
            .to_string()
    });
    files.insert(id.clone(), graph);
    Ok(id)
}

fn read_input(input: Option<String>, json: bool) -> anyhow::Result<Value> {
    let text = match input {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf.trim_end().to_string()
        }
    };
    if json {
        Ok(serde_json::from_str(&text).context("input is not valid JSON")?)
    } else {
        Ok(Value::String(text))
    }
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Interrupted, shutting down...");
        cancel.cancel();
    });
}

fn print_comparison(run: &ComparisonRun) {
    println!(
        "{:<24} {:<10} {:>8} {:>12} {:>10}",
        "graph", "status", "tokens", "cost_usd", "time_ms"
    );
    for member in &run.members {
        let label = member.graph_name.as_deref().unwrap_or(&member.graph_id);
        match &member.outcome {
            MemberOutcome::Session(session) => {
                let status = match session.status {
                    SessionStatus::Completed => "completed",
                    SessionStatus::Failed => "failed",
                    SessionStatus::Running => "running",
                };
                println!(
                    "{:<24} {:<10} {:>8} {:>12.6} {:>10}",
                    label,
                    status,
                    session.total_metrics.total_tokens,
                    session.total_metrics.total_cost,
                    session.total_metrics.total_time_ms
                );
            }
            MemberOutcome::Rejected { .. } => {
                println!("{:<24} {:<10} {:>8} {:>12} {:>10}", label, "rejected", "-", "-", "-");
            }
        }
        if let Some(error) = member.error() {
            println!("    error: {}", error);
        }
    }
    println!();
    println!(
        "{} of {} succeeded, mean {:.1} ms, total ${:.6}",
        run.summary.succeeded_count,
        run.summary.graph_count,
        run.summary.mean_execution_time_ms,
        run.summary.total_cost_usd
    );
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    // Check for config in common locations
    if let Some(home_config) = dirs_home().map(|h| h.join(".ctxforge").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }

    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
