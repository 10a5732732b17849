//! Hatch CLI - run a relay or expose a local service through one

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hatch_client::{ClientConfig, TunnelClient, TunnelKind};
use hatch_server_http::{RelayConfig, RelayServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// Hatch - expose local services through a public relay
#[derive(Parser, Debug)]
#[command(name = "hatch")]
#[command(about = "Hatch - expose local services through a public relay")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info", env = "HATCH_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the public relay. Tunnel owners connect to it over WebSocket, and the
public traffic it receives is routed to them by subdomain.

EXAMPLES:
  # Relay for *.hatch.dev behind a TLS-terminating proxy
  hatch relay --bind 0.0.0.0:8080 --public-host hatch.dev --public-scheme https

  # Settings from a file, with the bind address overridden
  hatch relay --config relay.yaml --bind 127.0.0.1:9000

ENVIRONMENT VARIABLES:
  HATCH_BIND           Listen address
  HATCH_PUBLIC_HOST    Public host tunnels are served under
  HATCH_CONFIG         YAML configuration file
    "#)]
    Relay {
        /// YAML configuration file
        #[arg(long, env = "HATCH_CONFIG")]
        config: Option<PathBuf>,

        /// Listen address (default 0.0.0.0:8080)
        #[arg(long, env = "HATCH_BIND")]
        bind: Option<SocketAddr>,

        /// Public host tunnels are served under, e.g. hatch.dev
        #[arg(long, env = "HATCH_PUBLIC_HOST")]
        public_host: Option<String>,

        /// Scheme of the advertised tunnel URLs
        #[arg(long, env = "HATCH_PUBLIC_SCHEME")]
        public_scheme: Option<String>,

        /// Seconds an HTTP exchange may take before the caller gets 504
        #[arg(long)]
        http_timeout: Option<u64>,
    },

    /// Expose a local HTTP server under a subdomain
    Http {
        /// Relay base URL, e.g. https://hatch.dev
        #[arg(long, env = "HATCH_RELAY")]
        relay: String,

        /// Local server, e.g. http://localhost:3000
        #[arg(long, env = "HATCH_LOCAL_URL")]
        local_url: String,

        /// Preferred subdomain
        #[arg(long, env = "HATCH_SUBDOMAIN")]
        subdomain: Option<String>,

        /// Owner identity (generated if not specified)
        #[arg(long, env = "HATCH_OWNER_ID")]
        owner_id: Option<Uuid>,

        /// Seconds between failed connect or register attempts
        #[arg(long, default_value = "5")]
        retry_delay: u64,
    },

    /// Expose a local TCP service on a public port
    Tcp {
        /// Relay base URL, e.g. https://hatch.dev
        #[arg(long, env = "HATCH_RELAY")]
        relay: String,

        /// Local service, e.g. localhost:5432
        #[arg(long, env = "HATCH_LOCAL_ADDR")]
        local_addr: String,

        /// Preferred public port
        #[arg(long, env = "HATCH_PORT")]
        port: Option<u16>,

        /// Owner identity (generated if not specified)
        #[arg(long, env = "HATCH_OWNER_ID")]
        owner_id: Option<Uuid>,

        /// Seconds between failed connect or register attempts
        #[arg(long, default_value = "5")]
        retry_delay: u64,
    },
}

/// Setup logging; RUST_LOG wins over the CLI level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Relay {
            config,
            bind,
            public_host,
            public_scheme,
            http_timeout,
        } => {
            let mut relay_config = match config {
                Some(path) => {
                    let yaml = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    RelayConfig::from_yaml(&yaml)
                        .with_context(|| format!("Invalid configuration in {}", path.display()))?
                }
                None => RelayConfig::default(),
            };
            if let Some(bind) = bind {
                relay_config.bind = bind;
            }
            if let Some(public_host) = public_host {
                relay_config.public_host = public_host;
            }
            if let Some(public_scheme) = public_scheme {
                relay_config.public_scheme = public_scheme;
            }
            if let Some(secs) = http_timeout {
                relay_config.http_timeout = Duration::from_secs(secs);
            }
            run_relay(relay_config).await
        }
        Commands::Http {
            relay,
            local_url,
            subdomain,
            owner_id,
            retry_delay,
        } => {
            let config = client_config(relay, local_url, owner_id, retry_delay)
                .subdomain(subdomain)
                .build()
                .context("Invalid tunnel configuration")?;
            let client = TunnelClient::http(config).context("Failed to create tunnel")?;
            run_tunnel(client).await
        }
        Commands::Tcp {
            relay,
            local_addr,
            port,
            owner_id,
            retry_delay,
        } => {
            let config = client_config(relay, local_addr, owner_id, retry_delay)
                .public_port(port)
                .build()
                .context("Invalid tunnel configuration")?;
            let client = TunnelClient::tcp(config).context("Failed to create tunnel")?;
            run_tunnel(client).await
        }
    }
}

fn client_config(
    relay: String,
    local: String,
    owner_id: Option<Uuid>,
    retry_delay: u64,
) -> hatch_client::ClientConfigBuilder {
    let builder = ClientConfig::builder()
        .relay_url(relay)
        .local_url(local)
        .retry_delay(Duration::from_secs(retry_delay));
    match owner_id {
        Some(owner_id) => builder.owner_id(owner_id),
        None => builder,
    }
}

async fn run_relay(config: RelayConfig) -> Result<()> {
    info!(
        "Starting relay on {} for *.{}",
        config.bind, config.public_host
    );
    let server = RelayServer::new(config);
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down relay...");
        })
        .await
        .context("Relay failed")
}

async fn run_tunnel<K: TunnelKind>(client: TunnelClient<K>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down tunnel...");
        }
        signal.cancel();
    });

    let mut state = client.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            if let Some(url) = state.borrow().tunnel_url() {
                info!("Forwarding {}", url);
            }
        }
    });

    if let Err(e) = client.run(shutdown).await {
        error!("Tunnel stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}
