//! Shared relay state

use crate::config::RelayConfig;
use crate::exchange::HttpExchange;
use hatch_control::{ControlChannel, CorrelationQueue};
use hatch_proto::TunnelMessage;
use hatch_router::{TcpTunnelRegistry, TunnelRegistry};
use hatch_server_tcp_proxy::TcpProxyManager;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Carrier of a parked WebSocket or SSE exchange. The caller's socket or response body
/// lives in the task serving it; the queue only tracks ownership and completion.
#[derive(Debug)]
pub struct StreamCarrier {
    pub kind: &'static str,
    pub target: String,
}

/// Everything the relay handlers share, built once at startup.
#[derive(Clone)]
pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<TunnelRegistry<ControlChannel>>,
    pub tcp: TcpProxyManager,
    pub http_exchanges: CorrelationQueue<HttpExchange>,
    pub stream_exchanges: CorrelationQueue<StreamCarrier>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(TunnelRegistry::new(config.registry_settings()));
        let tcp = TcpProxyManager::new(
            config.tcp_proxy_config(),
            Arc::new(TcpTunnelRegistry::new()),
        );
        Self {
            config: Arc::new(config),
            registry,
            tcp,
            http_exchanges: CorrelationQueue::new(),
            stream_exchanges: CorrelationQueue::new(),
        }
    }

    /// Bind a new HTTP-family control channel to its owner.
    ///
    /// A channel it supersedes is told to disconnect and closed, and every exchange that
    /// channel was serving is failed right away instead of being left to time out.
    pub fn attach_http(&self, channel: ControlChannel) {
        let Some(previous) = self.registry.connect(
            channel.owner_id(),
            channel.connection_id(),
            channel.clone(),
        ) else {
            return;
        };
        if previous.connection_id == channel.connection_id() {
            return;
        }

        info!(
            "Owner {} reconnected, closing previous channel {}",
            channel.owner_id(),
            previous.connection_id
        );
        let _ = previous.handle.try_send(TunnelMessage::Disconnect {
            reason: "superseded by a newer connection".to_string(),
        });
        previous.handle.close();
        self.fail_connection(previous.connection_id);
    }

    /// Reclaim everything tied to a lost HTTP-family channel.
    pub fn on_http_disconnect(&self, owner_id: Uuid, connection_id: Uuid) {
        if self.registry.on_disconnect(&owner_id, connection_id) {
            info!("Owner {} disconnected, tunnel removed", owner_id);
        }
        self.fail_connection(connection_id);
    }

    fn fail_connection(&self, connection_id: Uuid) {
        let failed = self.http_exchanges.cancel_connection(connection_id)
            + self.stream_exchanges.cancel_connection(connection_id);
        if failed > 0 {
            debug!(
                "Failed {} in-flight exchanges of connection {}",
                failed, connection_id
            );
        }
    }
}
