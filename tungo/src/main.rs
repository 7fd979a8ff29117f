#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tungo_lib::tun::{TunDevice, UdpBridgeTun};
use tungo_lib::{load_from_path, run_client, run_server, Config};

#[derive(Parser, Debug)]
#[command(author, version, about = "TunGo point-to-multipoint VPN")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept tunnel clients
    #[command(visible_alias = "s")]
    Server {
        /// Path to configuration TOML file
        #[arg(short, long, value_name = "FILE", default_value = "server.toml")]
        config: PathBuf,
    },
    /// Connect to a tunnel server
    #[command(visible_alias = "c")]
    Client {
        /// Path to configuration TOML file
        #[arg(short, long, value_name = "FILE", default_value = "client.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let (is_server, config_path) = match cli.command {
        Command::Server { config } => (true, config),
        Command::Client { config } => (false, config),
    };

    let cfg = match load_from_path(&config_path) {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(protocol = ?cfg.protocol, "configuration loaded");

    let tun = match build_tun(&cfg).await {
        Ok(tun) => Arc::new(tun),
        Err(err) => {
            error!(%err, "failed to open tun bridge");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = if is_server {
        run_server(cfg, tun, cancel).await
    } else {
        run_client(cfg, tun, cancel).await
    };
    if let Err(err) = result {
        error!(%err, "tunnel exited with error");
        std::process::exit(1);
    }
}

async fn build_tun(cfg: &Config) -> std::io::Result<TunDevice> {
    let bridge = UdpBridgeTun::bind(cfg.tun.bridge_listen, cfg.tun.bridge_peer).await?;
    Ok(TunDevice::UdpBridge(bridge))
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
