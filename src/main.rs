use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use index_supervisor::config::Config;
use index_supervisor::dataset;
use index_supervisor::orchestrator::{Orchestrator, EXIT_FAILURE};
use index_supervisor::process::{self, pidfile, ProcessSupervisor};
use index_supervisor::shutdown;
use index_supervisor::storage::TokenStore;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "index-supervisor",
    version,
    about = "Supervises a search-index server and hot-swaps its dataset",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); INDEX_SUPERVISOR_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server and keep its dataset up to date
    Run {
        /// Arguments passed verbatim to the server
        #[arg(last = true)]
        server_args: Vec<OsString>,
    },

    /// Show dataset, token and server state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop a server recorded in the pid file
    Stop {
        /// Seconds to wait before SIGKILL (defaults to server.stop_grace_secs)
        #[arg(long)]
        grace: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let code = match try_main().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

async fn try_main() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(format, &config.logging.level, cli.verbose);

    match cli.command {
        Commands::Run { server_args } => run(config, server_args).await,
        Commands::Status { json } => {
            status(&config, json)?;
            Ok(0)
        }
        Commands::Stop { grace } => stop(&config, grace).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env().context("Invalid environment configuration")?;
    Ok(config)
}

fn setup_tracing(format: &str, level: &str, verbose: bool) {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("index_supervisor=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("index_supervisor={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

async fn run(config: Config, server_args: Vec<OsString>) -> Result<i32> {
    config.validate()?;

    if let Err(e) = index_supervisor::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    tracing::info!(
        data_root = %config.paths.data_root.display(),
        archive_url = %config.remote.archive_url,
        server = %config.server.program.display(),
        "index-supervisor starting"
    );

    let orchestrator = Orchestrator::new(config, server_args)?;
    Ok(orchestrator.run(shutdown::wait_for_signal()).await)
}

#[derive(Serialize)]
struct StatusReport {
    checked_at: DateTime<Utc>,
    data_root: PathBuf,
    live_dir: PathBuf,
    dataset_valid: bool,
    latest_token: Option<String>,
    started_token: Option<String>,
    server_pid: Option<i32>,
    server_running: bool,
    tmp_present: bool,
    backups: Vec<PathBuf>,
}

impl StatusReport {
    fn collect(config: &Config) -> Self {
        let layout = config.layout();
        let tokens = TokenStore::new(layout.latest_token_file(), layout.started_token_file());
        let live = layout.live_node_dir();
        let server_pid = pidfile::read_pid(&layout.pid_file());

        Self {
            checked_at: Utc::now(),
            data_root: layout.root().to_path_buf(),
            dataset_valid: dataset::is_valid_dataset(&live),
            latest_token: tokens.latest().map(|t| t.to_string()),
            started_token: tokens.started().map(|t| t.to_string()),
            server_running: server_pid.is_some_and(process::is_running),
            server_pid,
            tmp_present: layout.tmp_dir().exists(),
            backups: dataset::list_backups(&live).unwrap_or_default(),
            live_dir: live,
        }
    }
}

fn status(config: &Config, json: bool) -> Result<()> {
    let report = StatusReport::collect(config);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Data root:      {}", report.data_root.display());
    println!(
        "Dataset:        {} ({})",
        report.live_dir.display(),
        if report.dataset_valid { "valid" } else { "missing or empty" }
    );
    println!("Latest token:   {}", report.latest_token.as_deref().unwrap_or("-"));
    println!("Started token:  {}", report.started_token.as_deref().unwrap_or("-"));
    match (report.server_pid, report.server_running) {
        (Some(pid), true) => println!("Server:         running (pid {pid})"),
        (Some(pid), false) => println!("Server:         not running (stale pid {pid})"),
        (None, _) => println!("Server:         not running"),
    }
    if report.tmp_present {
        println!("Temp dir:       present");
    }
    for backup in &report.backups {
        println!("Backup:         {}", backup.display());
    }
    Ok(())
}

async fn stop(config: &Config, grace: Option<u64>) -> Result<i32> {
    let mut supervisor = ProcessSupervisor::from_config(config, Vec::new());
    let grace = grace.map_or_else(|| config.stop_grace(), std::time::Duration::from_secs);

    supervisor
        .stop(grace)
        .await
        .context("Failed to stop server")?;
    println!("Server stopped");
    Ok(0)
}
