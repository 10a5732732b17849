//! Public HTTP surface of the relay
//!
//! One axum router serves both the relay's own endpoints and the tunneled traffic:
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /tunnel` | register a subdomain |
//! | `GET/POST/DELETE /relay/exchange/{id}` | owner pulls, answers or aborts an HTTP exchange |
//! | `GET /control/http`, `GET /control/tcp` | owner control channels (WebSocket) |
//! | `GET /health` | liveness |
//! | anything else | tunneled to the owner resolved from the Host header |

pub mod config;
pub mod control;
pub mod error;
pub mod exchange;
pub mod registration;
pub mod sse;
pub mod state;
pub mod tunnel;
pub mod websocket;

pub use config::RelayConfig;
pub use error::RelayError;
pub use state::RelayState;

use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the relay router over shared state.
pub fn build_router(state: RelayState) -> Router {
    let exchange_route = format!("{}/{{id}}", hatch_proto::EXCHANGE_PATH_PREFIX);

    Router::new()
        .route(hatch_proto::REGISTER_PATH, post(registration::register))
        .route(
            &exchange_route,
            get(exchange::pull)
                .post(exchange::push)
                .delete(exchange::abort),
        )
        .route(hatch_proto::HTTP_CONTROL_PATH, get(control::http_channel))
        .route(hatch_proto::TCP_CONTROL_PATH, get(control::tcp_channel))
        .route("/health", get(health))
        .fallback(tunnel::handle_public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// The relay process: public listener plus everything behind it
pub struct RelayServer {
    state: RelayState,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: RelayState::new(config),
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.state.config.bind).await?;
        serve(listener, self.state, shutdown).await
    }
}

/// Serve the relay on an already bound listener.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "Relay listening on {} (tunnels under {}://*.{})",
        listener.local_addr()?,
        state.config.public_scheme,
        state.config.public_host
    );
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
