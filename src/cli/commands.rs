//! CLI command definitions for activity-decoder.
//!
//! `serve` runs the scheduler behind the unix socket; `submit`, `status`
//! and `metrics` talk to a running server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::Client;
use crate::config::{AppConfig, DEFAULT_SOCKET_PATH};
use crate::scheduler::Scheduler;
use crate::server::Server;
use crate::session::{ProcessSessionFactory, SessionFactory};

/// Interval between `get` polls of `submit --wait`.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Activity decoding service driving a pool of GUI automation sessions.
#[derive(Parser)]
#[command(name = "activity-decoder")]
#[command(about = "Decode activity files on a pool of restartable automation sessions")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler and serve requests on the unix socket.
    Serve(ServeArgs),

    /// Submit an activity file for decoding.
    Submit(SubmitArgs),

    /// Show the outcome of a submitted task.
    Status(StatusArgs),

    /// Print the scheduler metrics.
    Metrics(MetricsArgs),
}

/// Arguments for `activity-decoder serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// YAML configuration file.
    #[arg(short, long, env = "ACTIVITY_DECODER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Socket path, overriding the configuration file.
    #[arg(short, long, env = "ACTIVITY_DECODER_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Number of workers.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Queue capacity.
    #[arg(long)]
    pub queue_size: Option<usize>,

    /// Per-task read timeout in seconds.
    #[arg(long, value_parser = parse_secs)]
    pub read_file_timeout: Option<Duration>,

    /// Ceiling in seconds for the per-task network stabilization delay.
    #[arg(long, value_parser = parse_secs)]
    pub max_net_stabilization_delay: Option<Duration>,

    /// Outcome time-to-live in seconds.
    #[arg(long, value_parser = parse_secs)]
    pub result_ttl: Option<Duration>,

    /// Tasks a session processes before it is replaced.
    #[arg(long)]
    pub tasks_before_restart: Option<u32>,

    /// Run helpers on the current display instead of a virtual one.
    #[arg(long)]
    pub no_virtual_display: bool,

    /// Helper program, overriding the configuration file.
    #[arg(long, env = "ACTIVITY_DECODER_HELPER")]
    pub helper: Option<String>,
}

impl ServeArgs {
    /// Applies the command-line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(workers) = self.workers {
            config.scheduler.workers_num = workers;
        }
        if let Some(queue_size) = self.queue_size {
            config.scheduler.queue_size = queue_size;
        }
        if let Some(timeout) = self.read_file_timeout {
            config.scheduler.read_file_timeout = timeout;
        }
        if let Some(delay) = self.max_net_stabilization_delay {
            config.scheduler.max_net_stabilization_delay = delay;
        }
        if let Some(ttl) = self.result_ttl {
            config.scheduler.result_ttl = ttl;
        }
        if let Some(tasks) = self.tasks_before_restart {
            config.scheduler.tasks_before_session_restart = tasks;
        }
        if self.no_virtual_display {
            config.scheduler.virtual_display = false;
        }
        if let Some(helper) = &self.helper {
            config.session.program = helper.clone();
        }
    }
}

/// Arguments for `activity-decoder submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Activity file to decode.
    pub file: PathBuf,

    /// Password protecting the activity file.
    #[arg(short, long)]
    pub password: Option<String>,

    /// Seconds the session waits for the network to settle.
    #[arg(short, long, default_value = "0", value_parser = parse_secs)]
    pub delay: Duration,

    /// Wait for the outcome and print it instead of the task id.
    #[arg(short, long)]
    pub wait: bool,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value = "300", value_parser = parse_secs)]
    pub wait_timeout: Duration,

    /// Server socket.
    #[arg(short, long, env = "ACTIVITY_DECODER_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,
}

/// Arguments for `activity-decoder status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Task id returned by `submit`.
    pub task_id: Uuid,

    /// Server socket.
    #[arg(short, long, env = "ACTIVITY_DECODER_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,
}

/// Arguments for `activity-decoder metrics`.
#[derive(Parser, Debug)]
pub struct MetricsArgs {
    /// Print the counter snapshot as JSON instead of the Prometheus text format.
    #[arg(long)]
    pub json: bool,

    /// Server socket.
    #[arg(short, long, env = "ACTIVITY_DECODER_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Metrics(args) => run_metrics_command(args).await,
    }
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    info!(
        socket = %config.socket_path.display(),
        helper = %config.session.program,
        "Starting activity decoder"
    );

    let factory: Arc<dyn SessionFactory> =
        Arc::new(ProcessSessionFactory::new(config.session.clone()));
    let socket_path = config.socket_path.clone();

    Scheduler::scope(config.scheduler, factory, |scheduler| async move {
        let server = Server::bind(&socket_path, scheduler)?;
        server.run_until(shutdown_signal()).await?;
        anyhow::Ok(())
    })
    .await??;

    info!("Activity decoder stopped");
    Ok(())
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let activity = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read activity file {}", args.file.display()))?;

    let client = Client::new(&args.socket);
    let task_id = client.put(&activity, args.password, args.delay).await?;

    if !args.wait {
        println!("{}", task_id);
        return Ok(());
    }

    let outcome = client
        .wait(task_id, WAIT_POLL_INTERVAL, args.wait_timeout)
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    if !outcome.is_success() {
        anyhow::bail!("Task {} failed", task_id);
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let outcome = Client::new(&args.socket).get(args.task_id).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn run_metrics_command(args: MetricsArgs) -> anyhow::Result<()> {
    let (metrics, stats) = Client::new(&args.socket).metrics().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", metrics);
    }
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
