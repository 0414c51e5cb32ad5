//! Multitidal - live-coding sessions on paired Docker sandboxes.
//!
//! Usage:
//!   multitidal serve [--port 3001]     # Start the session server
//!   multitidal ping                    # Check that the container engine responds

mod config;
mod controller;
mod engine;
mod error;
mod health;
mod http_server;
mod pool;
mod protocol;
mod sandbox;
mod session;
mod state;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{ReadinessPolicy, SandboxConfig, ServerConfig, DEFAULT_PORT, DEFAULT_WORKERS};
use crate::controller::SessionsController;
use crate::engine::{DockerEngine, Engine, SimulatedEngine};
use crate::error::EngineResult;
use crate::pool::WorkerPool;
use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "multitidal")]
#[command(about = "Live-coding sessions on paired Docker sandboxes")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Container engine to provision sandboxes with
    #[arg(long, value_enum, default_value = "docker", env = "MULTITIDAL_ENGINE", global = true)]
    engine: EngineKind,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the session server
    Serve(ServeArgs),
    /// Check that the container engine responds
    Ping,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum EngineKind {
    Docker,
    /// In-memory engine, for working on clients without Docker
    Simulated,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0", env = "MULTITIDAL_BIND")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT, env = "MULTITIDAL_PORT")]
    port: u16,

    /// Hostname put in client-facing URLs (default: the request's Host header)
    #[arg(long, env = "MULTITIDAL_PUBLIC_HOST")]
    public_host: Option<String>,

    /// Maximum number of sandbox start/stop jobs running at once
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "MULTITIDAL_WORKERS")]
    workers: usize,

    /// Image of the primary live-coding workload
    #[arg(long, env = "MULTITIDAL_TIDEBOX_IMAGE")]
    tidebox_image: Option<String>,

    /// Image of the web terminal gateway
    #[arg(long, env = "MULTITIDAL_WEBSSH_IMAGE")]
    webssh_image: Option<String>,

    /// Gateway configuration file, mounted read-only into the gateway
    #[arg(long, default_value = "resources/webssh_config.json", env = "MULTITIDAL_WEBSSH_CONFIG")]
    webssh_config: PathBuf,

    /// Readiness probe attempts per workload
    #[arg(long, default_value_t = 30, env = "MULTITIDAL_READINESS_ATTEMPTS")]
    readiness_attempts: u32,

    /// Delay between readiness probe attempts in milliseconds
    #[arg(long, default_value_t = 500, env = "MULTITIDAL_READINESS_INTERVAL_MS")]
    readiness_interval_ms: u64,
}

impl ServeArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
            public_host: self.public_host.clone(),
            workers: self.workers,
        }
    }

    fn sandbox_config(&self, webssh_config: PathBuf) -> SandboxConfig {
        let defaults = SandboxConfig::default();
        SandboxConfig {
            tidebox_image: self.tidebox_image.clone().unwrap_or(defaults.tidebox_image),
            webssh_image: self.webssh_image.clone().unwrap_or(defaults.webssh_image),
            webssh_config,
            readiness: ReadinessPolicy {
                attempts: self.readiness_attempts,
                interval: Duration::from_millis(self.readiness_interval_ms),
            },
            ..defaults
        }
    }
}

fn connect_engine(kind: EngineKind, config: &SandboxConfig) -> EngineResult<Arc<dyn Engine>> {
    let engine: Arc<dyn Engine> = match kind {
        EngineKind::Docker => Arc::new(DockerEngine::connect()?),
        EngineKind::Simulated => {
            warn!("Using the simulated engine; no containers will be started");
            Arc::new(SimulatedEngine::ready_for(config))
        }
    };
    Ok(engine)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let (sandbox, server) = match &args.command {
        Commands::Serve(serve) => {
            // Docker needs an absolute path for bind mounts.
            let webssh_config = match std::fs::canonicalize(&serve.webssh_config) {
                Ok(path) => path,
                Err(e) if args.engine == EngineKind::Simulated => {
                    warn!(path = %serve.webssh_config.display(), error = %e, "Gateway config not found");
                    serve.webssh_config.clone()
                }
                Err(e) => {
                    eprintln!("Error: gateway config {}: {}", serve.webssh_config.display(), e);
                    exit(1);
                }
            };
            (serve.sandbox_config(webssh_config), Some(serve.server_config()))
        }
        Commands::Ping => (SandboxConfig::default(), None),
    };

    let engine = match connect_engine(args.engine, &sandbox) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: cannot connect to the container engine: {}", e);
            exit(1);
        }
    };
    if let Err(e) = engine.ping().await {
        error!(error = %e, "Docker not responding");
        eprintln!("Docker not responding");
        exit(1);
    }

    let Some(server) = server else {
        println!("OK");
        return;
    };
    if let Err(e) = serve(engine, sandbox, server).await {
        eprintln!("Error: {}", e);
        exit(1);
    }
}

async fn serve(
    engine: Arc<dyn Engine>,
    sandbox: SandboxConfig,
    server: ServerConfig,
) -> std::io::Result<()> {
    let pool = WorkerPool::new(server.workers);
    info!(workers = pool.size(), "Sandbox worker pool ready");
    let controller = SessionsController::new(engine, sandbox, pool);
    let state = AppState::new(controller.clone(), server.public_host.clone());

    let listener = TcpListener::bind(server.addr()).await?;
    http_server::run_server(listener, state, shutdown_signal()).await?;

    controller.stop().await;
    info!("All sessions stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
