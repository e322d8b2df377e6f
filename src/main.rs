//! Delivery Bot - cart controller
//!
//! # Usage
//!
//! ```bash
//! # Run against the configured link bridge and reader bridge
//! ./delivery-bot --config /etc/delivery-bot/bot_config.toml
//!
//! # Bench run: type card UIDs on stdin
//! ./delivery-bot --stdin
//!
//! # Emulate the motor controller (replies ACK to every line)
//! ./delivery-bot responder --address 127.0.0.1:7000
//! ```
//!
//! # Environment Variables
//!
//! - `DELIVERY_BOT_CONFIG`: config file path (overridden by `--config`)
//! - `RUST_LOG`: logging level (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use delivery_bot::config::{defaults, BotConfig, ConfigStore, FileConfigStore};
use delivery_bot::link::{self, CommandLink};
use delivery_bot::orchestrator::{Orchestrator, RestartHandle};
use delivery_bot::reader::{CardSource, LineCardSource, TagReader, TcpCardSource};
use delivery_bot::reconnect::ReconnectPolicy;
use delivery_bot::server;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "delivery-bot")]
#[command(about = "Delivery cart controller: RFID order matching and motor dispatch")]
#[command(version)]
struct CliArgs {
    /// Config file (default: $DELIVERY_BOT_CONFIG, then ./bot_config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the control server address (default: server.bind:server.port)
    #[arg(short, long)]
    addr: Option<String>,

    /// Read card UIDs (hex, one per line) from stdin instead of the reader bridge
    #[arg(long)]
    stdin: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "DELIVERY_BOT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Act as the motor controller: acknowledge every received line
    Responder {
        /// Listen for the cart's TCP bridge connection on HOST:PORT
        #[arg(long, value_name = "HOST:PORT", conflicts_with = "device")]
        address: Option<String>,
        /// Serial device to answer on (needs the `serial` feature)
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value_t = 9600)]
        baud_rate: u32,
    },
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    TagLoop,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::TagLoop => write!(f, "TagLoop"),
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

fn spawn_tag_loop(
    task_set: &mut JoinSet<Result<TaskName>>,
    orchestrator: Arc<Orchestrator>,
    source: Box<dyn CardSource>,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[TagLoop] Task starting");
        orchestrator
            .run_tag_loop(TagReader::new(source), cancel_token)
            .await?;
        Ok(TaskName::TagLoop)
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
///
/// Returns only after every task has ended, so the listener and link are
/// free for the next generation.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("[Supervisor] All tasks spawned, monitoring...");
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("[Supervisor] Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("[Supervisor] Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("[Supervisor] Task failed with error: {}", e);
                        cancel_token.cancel();
                        outcome = Err(e);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("[Supervisor] Task panicked: {}", e);
                        cancel_token.cancel();
                        outcome = Err(anyhow::anyhow!("Task panicked: {}", e));
                        break;
                    }
                    None => {
                        info!("[Supervisor] All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Let cancelled tasks finish so the listener and link are released.
    while let Some(result) = task_set.join_next().await {
        if let Ok(Err(e)) = result {
            warn!("[Supervisor] Task ended with error during shutdown: {}", e);
        }
    }

    outcome
}

// ============================================================================
// Runtime Generation
// ============================================================================

/// What ended a generation.
enum Exit {
    Restart,
    Shutdown,
}

/// Load config, start every task, and run until shutdown or restart.
async fn run_generation(
    args: &CliArgs,
    config_path: &std::path::Path,
    shutdown: &CancellationToken,
) -> Result<Exit> {
    let store = Arc::new(FileConfigStore::new(config_path));
    let config = Arc::new(store.load_or_default());
    let server_addr = args.addr.clone().unwrap_or_else(|| config.server_addr());

    info!(
        "Backend: {} | Stand: {} | Link: {:?} {}",
        config.backend_base_url(),
        config.stand_base_url(),
        config.link.transport,
        config.link.address
    );

    let generation = shutdown.child_token();
    let restart = RestartHandle::new(generation.clone());

    let link = link::open(&config.link)
        .await
        .context("Failed to open command link")?;

    let orchestrator = Orchestrator::new(config.clone(), link, store, restart.clone())
        .context("Failed to build backend client")?;

    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", server_addr))?;
    info!("[HttpServer] Listening on {}", server_addr);

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task 1: HTTP Server
    let app = server::router(orchestrator.handlers());
    spawn_http_server(&mut task_set, listener, app, generation.clone());

    // Task 2: Tag loop
    if config.reader.use_rfid {
        let source: Box<dyn CardSource> = if args.stdin {
            Box::new(LineCardSource::stdin())
        } else {
            let policy = ReconnectPolicy::from(&config.reader);
            Box::new(
                TcpCardSource::connect(&config.reader.address, policy)
                    .await
                    .with_context(|| {
                        format!("Failed to connect to reader at {}", config.reader.address)
                    })?,
            )
        };
        spawn_tag_loop(&mut task_set, orchestrator.clone(), source, generation.clone());
    } else {
        info!("[TagLoop] Reader disabled (use_rfid = false)");
    }

    run_supervisor(&mut task_set, generation).await?;

    if restart.is_requested() && !shutdown.is_cancelled() {
        Ok(Exit::Restart)
    } else {
        Ok(Exit::Shutdown)
    }
}

// ============================================================================
// Responder
// ============================================================================

async fn serve_responder(mut link: CommandLink, shutdown: &CancellationToken) -> Result<()> {
    info!("[Responder] Answering on {}", link.name());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            open = link.wait_for_line() => {
                if !open {
                    info!("[Responder] Peer closed {}", link.name());
                    return Ok(());
                }
                link.wait_and_ack()?;
            }
        }
    }
}

async fn run_responder(
    address: Option<String>,
    device: Option<String>,
    baud_rate: u32,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Some(device) = device {
        let link = link::open_serial(&device, baud_rate)?;
        return serve_responder(link, &shutdown).await;
    }

    let address = address.unwrap_or_else(|| BotConfig::default().link.address);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind responder to {}", address))?;
    info!("[Responder] Waiting for the cart on {}", address);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        info!("[Responder] Cart connected from {}", peer);
        let link = link::from_tcp_stream(stream.into_std()?, &peer.to_string())?;
        serve_responder(link, &shutdown).await?;
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    if let Some(SubCommand::Responder {
        address,
        device,
        baud_rate,
    }) = &args.command
    {
        return run_responder(address.clone(), device.clone(), *baud_rate, cancel_token).await;
    }

    let config_path = BotConfig::resolve_path(args.config.as_deref());
    info!("Delivery Bot starting, config: {}", config_path.display());

    let mut generation = 1u32;
    let mut failures = 0u32;
    loop {
        match run_generation(&args, &config_path, &cancel_token).await {
            Ok(Exit::Restart) => {
                failures = 0;
                generation += 1;
                info!("Starting runtime generation {}", generation);
            }
            Ok(Exit::Shutdown) => break,
            Err(e) if cancel_token.is_cancelled() => return Err(e),
            Err(e) => {
                failures += 1;
                if failures >= defaults::MAX_GENERATION_FAILURES {
                    error!(
                        "Generation {} failed, giving up after {} failures: {:#}",
                        generation, failures, e
                    );
                    return Err(e);
                }
                error!(
                    "Generation {} failed ({}/{}): {:#}, restarting",
                    generation,
                    failures,
                    defaults::MAX_GENERATION_FAILURES,
                    e
                );
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(defaults::RESTART_DELAY_MS)) => {}
                }
                generation += 1;
            }
        }
    }

    info!("Delivery Bot stopped");
    Ok(())
}
