//! `devtunneld`
//!
//! Keeps one tunnel helper running per attached device that needs one and
//! serves the resulting endpoints over HTTP.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use devtunnel_core::config::{Config, load_config};
use devtunnel_daemon::Daemon;
use devtunnel_daemon::client::TunneldClient;
use devtunnel_daemon::directory::UsbmuxDirectory;
use devtunnel_daemon::helper::HelperCommand;
use devtunnel_daemon::privilege::ensure_privileged;
use devtunnel_daemon::reconciler::ReconcilerSettings;
use devtunnel_daemon::tunnel::TunnelLauncher;

#[derive(Parser, Debug)]
#[command(name = "devtunneld")]
#[command(version, about = "Device tunnel daemon - one tunnel helper per attached device")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon (requires root)
    Run(RunArgs),
    /// Print the tunnel table of a running daemon as JSON
    Status(RemoteArgs),
    /// Ask a running daemon to shut down
    Stop(RemoteArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Config file path (defaults to the global devtunnel/config.toml)
    #[arg(long, env = "DEVTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Address the control interface binds to
    #[arg(long, env = "DEVTUNNEL_BIND")]
    bind: Option<IpAddr>,

    /// Listen port
    #[arg(long, env = "DEVTUNNEL_PORT")]
    port: Option<u16>,

    /// Start tunnels for network devices too
    #[arg(long, env = "DEVTUNNEL_WIFI")]
    wifi: bool,

    /// Tunnel helper executable (searched on PATH when omitted)
    #[arg(long, env = "DEVTUNNEL_HELPER_PATH")]
    helper_path: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "DEVTUNNEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "DEVTUNNEL_LOG_JSON")]
    log_json: bool,
}

#[derive(Args, Debug)]
struct RemoteArgs {
    /// Daemon base URL (discovered on localhost when omitted)
    #[arg(long, env = "DEVTUNNEL_URL")]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Status(args) => status(args).await,
        Command::Stop(args) => stop(args).await,
    }
}

fn resolve_config(args: &RunArgs) -> anyhow::Result<Config> {
    let mut config =
        load_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.daemon.bind = bind.to_string();
    }
    if let Some(port) = args.port {
        config.daemon.port = port;
    }
    if args.wifi {
        config.daemon.wifi = true;
    }
    if let Some(path) = &args.helper_path {
        config.daemon.helper_path = Some(path.clone());
    }
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }
    Ok(config)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;

    let log_filter = format!("devtunnel_daemon={}", config.daemon.log_level);
    devtunnel_core::tracing_init::init_tracing(&log_filter, args.log_json);

    if let Err(e) = ensure_privileged() {
        error!("{e}");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.daemon.bind,
        port = config.daemon.port,
        wifi = config.daemon.wifi,
        "Starting devtunneld"
    );

    let helper = HelperCommand::resolve(config.daemon.helper_path.as_deref());
    let directory = Arc::new(UsbmuxDirectory::new(helper.clone()));
    let launcher = Arc::new(TunnelLauncher::new(
        helper,
        config.supervisor.lockdown_os_version()?,
    ));
    let settings = ReconcilerSettings::from_config(&config)?;

    let daemon = Daemon::new(directory, launcher, settings);
    let addr = (config.daemon.bind.as_str(), config.daemon.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}:{}", addr.0, addr.1))?;

    tokio::spawn(cancel_on_signal(daemon.shutdown_token()));

    // Notify systemd that the daemon is ready to serve (unix only).
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        tracing::debug!(error = %e, "systemd notify failed");
    }

    daemon.serve(listener).await?;
    info!("Daemon stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                None
            }
        };

    #[cfg(unix)]
    let sigterm_future = async {
        match sigterm.as_mut() {
            Some(signal) => {
                signal.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm_future => info!("Received SIGTERM shutdown signal"),
        () = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

async fn client_for(args: RemoteArgs) -> anyhow::Result<TunneldClient> {
    devtunnel_core::tracing_init::init_tracing("devtunnel_daemon=warn", false);
    Ok(match args.url {
        Some(url) => TunneldClient::new(url)?,
        None => TunneldClient::discover().await?,
    })
}

#[allow(clippy::print_stdout)]
async fn status(args: RemoteArgs) -> anyhow::Result<()> {
    let client = client_for(args).await?;
    let tunnels = client.tunnels().await?;
    println!("{}", serde_json::to_string_pretty(&tunnels)?);
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn stop(args: RemoteArgs) -> anyhow::Result<()> {
    let client = client_for(args).await?;
    let message = client.shutdown().await?;
    println!("{message}");
    Ok(())
}
