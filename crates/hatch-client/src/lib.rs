//! Hatch tunnel client
//!
//! Keeps a control connection to a relay, registers a public name for a local server and
//! serves the exchanges the relay hands out. HTTP tunnels carry plain HTTP, WebSocket and
//! server-sent event traffic; TCP tunnels carry raw byte streams on a public port.
//!
//! ```no_run
//! use hatch_client::{ClientConfig, TunnelClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), hatch_client::ClientError> {
//! let config = ClientConfig::builder()
//!     .relay_url("https://relay.example.com")
//!     .local_url("http://localhost:3000")
//!     .subdomain(Some("myapp".to_string()))
//!     .build()?;
//!
//! TunnelClient::http(config)?.run(CancellationToken::new()).await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod forward;
pub mod session;
pub mod state;
pub mod tunnel;

pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::ClientError;
pub use state::{wait_active, TunnelState};
pub use tunnel::{HttpTunnel, TcpTunnel, TunnelClient, TunnelKind};
