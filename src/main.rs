//! Agent Dispatch Server
//!
//! A web control plane that queues tasks, runs one agent CLI process per
//! task inside an isolated git worktree, and streams progress to observers.

use std::fs::OpenOptions;
use std::sync::Arc;

use agent_dispatch::api::{self, AppState};
use agent_dispatch::config::Config;
use agent_dispatch::db::Database;
use agent_dispatch::executor::TaskExecutor;
use agent_dispatch::hub::EventHub;
use agent_dispatch::scheduler::Scheduler;
use agent_dispatch::workspace::WorkspaceManager;
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Agent Dispatch Server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the task database (overrides config)
    #[arg(short, long)]
    database: Option<String>,

    /// Bind address, e.g. 127.0.0.1:8420 (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2")]
    log: String,
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    match args.log.as_str() {
        "0" | "off" => {}
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            let file = OpenOptions::new().create(true).append(true).open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::load_or_default()
    };
    if let Some(db_path) = &args.database {
        config.db_path = db_path.into();
    }
    if let Some(bind) = &args.bind {
        config.bind_addr = bind.clone();
    }
    config.ensure_dirs()?;

    info!("Starting Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    info!("Database: {:?}", config.db_path);
    info!("Base repository: {:?}", config.base_repo);
    info!("Max concurrent tasks: {}", config.max_concurrent);

    let db = Database::open(&config.db_path)?;

    // No task may survive a restart as in_progress; its process is gone.
    let repaired = db.recover()?;
    if repaired > 0 {
        info!("recovered {} stuck task(s) back to pending", repaired);
    }

    let hub = EventHub::new();
    let workspaces = WorkspaceManager::new(
        config.base_repo.clone(),
        config.worktrees_base.clone(),
    );
    let executor = Arc::new(TaskExecutor::new(
        workspaces,
        config.log_dir.clone(),
        config.agent_cmd.clone(),
    ));

    let scheduler = Scheduler::new(
        db.clone(),
        Arc::clone(&executor),
        hub.clone(),
        config.max_concurrent,
        config.poll_interval(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    let config = Arc::new(config);
    let state = AppState {
        db,
        executor,
        hub,
        config: Arc::clone(&config),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("Server ready, listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    scheduler_task.abort();

    Ok(())
}
