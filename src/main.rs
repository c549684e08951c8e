//! docbridge - command bridge between automation clients and device plugins
//!
//! Clients connect on `/ws/client` (or POST to `/resources/{id}/commands`),
//! devices connect on `/ws/device?resource=<id>`, and commands are routed by
//! resource id.

use clap::{Parser as ClapParser, Subcommand};
use docbridge::{
    api,
    bridge::Bridge,
    config::{self, BridgeConfig, ConfigError},
    dispatch::CommandRegistry,
    shutdown::ShutdownCoordinator,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// docbridge - command bridge between automation clients and device plugins
#[derive(ClapParser, Debug)]
#[command(name = "docbridge", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(clap::Args, Debug, Clone)]
struct ServeArgs {
    /// Address to bind the HTTP/WebSocket server (overrides config)
    #[arg(long, env = "DOCBRIDGE_BIND")]
    bind: Option<SocketAddr>,

    /// Path to the TOML config file
    #[arg(long, env = "DOCBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Default command timeout in milliseconds (overrides config)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Allowed CORS origin; may be repeated
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge server (the default)
    Serve(ServeArgs),

    /// Print the effective configuration as TOML
    Config(ServeArgs),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), BridgeError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Some(Commands::Serve(args)) => run_server(args).await,
        Some(Commands::Config(args)) => print_config(args),
        None => run_server(cli.serve).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "docbridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file (explicit path, else the default location) and
/// apply command-line overrides.
fn effective_config(args: &ServeArgs) -> Result<BridgeConfig, ConfigError> {
    let path = args.config.clone().or_else(config::default_config_path);
    let mut cfg = match path {
        Some(ref p) => match BridgeConfig::load(p)? {
            Some(cfg) => {
                tracing::debug!(path = %p.display(), "loaded config");
                cfg
            }
            None if args.config.is_some() => {
                tracing::warn!(path = %p.display(), "config file not found, using defaults");
                BridgeConfig::default()
            }
            None => BridgeConfig::default(),
        },
        None => BridgeConfig::default(),
    };

    if let Some(bind) = args.bind {
        cfg.server.bind = bind;
    }
    if let Some(ms) = args.timeout_ms {
        cfg.commands.default_timeout_ms = ms;
        cfg.commands.max_timeout_ms = cfg.commands.max_timeout_ms.max(ms);
    }
    cfg.validate()?;
    Ok(cfg)
}

fn print_config(args: ServeArgs) -> Result<(), BridgeError> {
    let cfg = effective_config(&args)?;
    print!("{}", cfg.to_toml()?);
    Ok(())
}

async fn run_server(args: ServeArgs) -> Result<(), BridgeError> {
    let cfg = effective_config(&args)?;
    tracing::info!("docbridge starting");

    let bridge = Bridge::new(
        cfg.bridge_settings(),
        CommandRegistry::with_builtins(cfg.commands.passthrough),
    );
    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState {
        bridge: bridge.clone(),
        shutdown: shutdown.clone(),
        ping_interval: cfg.ping_interval(),
    };
    let app = api::router(
        state,
        api::RouterConfig {
            cors_origins: args.cors_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(cfg.server.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP/WS server listening");

    // Oneshot channel for server shutdown (Ctrl+C)
    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    // Signal WebSocket handlers to send close frames, then tear down the
    // bridge so any waiting command fails instead of hanging.
    shutdown.shutdown();
    bridge.shutdown();
    if !shutdown.wait_for_all_closed(Duration::from_secs(2)).await {
        tracing::warn!(
            remaining = shutdown.active_connections(),
            "connections still open after grace period"
        );
    }

    let _ = server_shutdown_tx.send(());
    http_handle.await??;

    tracing::info!("docbridge exiting");
    Ok(())
}
