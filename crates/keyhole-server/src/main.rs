//! keyhole-server binary: runs the tunnel ingress for a storage overlay
//! node.

use clap::Parser;
use keyhole_server::{ServerConfig, TunnelServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// keyhole-server — NAT-traversal tunnel ingress
#[derive(Parser, Debug)]
#[command(name = "keyhole-server", version, about = "NAT-traversal tunnel ingress")]
struct Cli {
    /// Listen port for the /tun endpoint
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "keyhole.toml")]
    config: PathBuf,

    /// Maximum concurrent gateways
    #[arg(long)]
    max_tunnels: Option<usize>,

    /// Lower bound of the gateway port range (inclusive)
    #[arg(long)]
    gateway_port_min: Option<u16>,

    /// Upper bound of the gateway port range (inclusive)
    #[arg(long)]
    gateway_port_max: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match ServerConfig::load(
        Some(&cli.config),
        cli.port,
        cli.max_tunnels,
        cli.gateway_port_min,
        cli.gateway_port_max,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        max_tunnels = config.max_tunnels,
        "starting keyhole-server"
    );

    let server = Arc::new(TunnelServer::new(config));

    // Log lock pressure so operators see when the cap is the bottleneck.
    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "tunnel server event");
        }
    });

    let runner = server.clone();
    tokio::select! {
        result = runner.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            server.shutdown();
        }
    }

    info!("keyhole-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
