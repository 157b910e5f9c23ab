//! tunl
//!
//! A CLI tool that gives local services a public address.
//!
//! The client connects to a tunl relay, which allocates a public address
//! and forwards every connection made to it back through the tunnel:
//! - `tunl http <url>` exposes a local HTTP service
//! - `tunl tcp <addr>` exposes a raw TCP service

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use tunl::config::Config;
use tunl::forward;
use tunl::{Tunnel, TunnelOptions, TunnelType};

#[derive(Parser, Debug)]
#[command(name = "tunl")]
#[command(author, version, about = "Public addresses for local services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay host URL
    #[arg(long, global = true, env = "TUNL_HOST", hide = true)]
    host: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Expose a HTTP service via a public address
    Http {
        /// Local URL, e.g. `8080`, `:8080` or `http://localhost:8080`
        target: String,
    },

    /// Expose a TCP service via a public address
    Tcp {
        /// Local address, e.g. `5432` or `db.internal:5432`
        target: String,
    },

    /// Print the client version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load().unwrap_or_default();
    let host = config.host(cli.host);

    match cli.command {
        Commands::Http { target } => {
            let target = forward::normalize_http_target(&target);
            let addr = forward::http_target_addr(&target)
                .with_context(|| format!("Invalid <url> argument value: {}", target))?;
            run_tunnel(TunnelType::Http, &host, &addr, &target, &config).await
        }
        Commands::Tcp { target } => {
            let addr = forward::normalize_tcp_target(&target);
            run_tunnel(TunnelType::Tcp, &host, &addr, &addr, &config).await
        }
        Commands::Version => {
            println!("tunl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_tunnel(
    kind: TunnelType,
    host: &str,
    addr: &str,
    display: &str,
    config: &Config,
) -> Result<()> {
    let host_url =
        Url::parse(host).with_context(|| format!("Host value invalid: {}", host))?;

    let options = TunnelOptions {
        policy: config.reconnect.policy(),
        ..Default::default()
    };
    let tunnel = tunl::open_with(&CancellationToken::new(), &host_url, kind, options)
        .await
        .context("tunl server connection failed")?;

    print_tunnel(&tunnel.address(), display);
    spawn_observers(&tunnel);

    let closer = tunnel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            closer.close();
        }
    });

    forward::serve(&tunnel, addr)
        .await
        .map_err(|e| anyhow::anyhow!("fatal error: {}", e))
}

fn spawn_observers(tunnel: &Tunnel) {
    let changes = tunnel.state_changes();
    tokio::spawn(async move {
        while let Some(status) = changes.recv().await {
            eprintln!("tunnel {}", status);
        }
    });

    let versions = tunnel.new_versions();
    tokio::spawn(async move {
        while let Some(version) = versions.recv().await {
            if let Ok(current) = semver::Version::parse(env!("CARGO_PKG_VERSION")) {
                if version > current {
                    eprintln!("A newer tunl version is available: {}", version);
                    continue;
                }
            }
            info!("Relay protocol version {}", version);
        }
    });
}

fn print_tunnel(address: &str, target: &str) {
    println!();
    println!("=== Tunnel Active ===");
    println!();
    println!("  {} -> {}", address, target);
    println!();
    println!("Press Ctrl+C to stop the tunnel.");
    println!();
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
