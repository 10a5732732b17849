//! Tunnel kinds and the reconnect loop
//!
//! ```text
//! Disconnected -> Connecting -> Registering -> Active
//!       ^______________|______________|__________|   (channel loss, after jitter)
//! ```
//!
//! Connect and register failures are retried after a fixed delay, forever. Losing an
//! active channel waits a random fraction of the jitter bound before reconnecting, and
//! the new registration asks for the subdomain or port the tunnel had before.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::forward::{self, control_url, Forwarder};
use crate::session::Session;
use crate::state::{StatePublisher, TunnelState};
use async_trait::async_trait;
use hatch_control::ControlChannel;
use hatch_proto::{ExchangeStart, RegisterTunnelRequest, RegisterTunnelResponse, TunnelMessage};
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// How long a TCP registration may take before the connection is considered dead
const TCP_REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// What a tunnel registers and how it serves exchanges
#[async_trait]
pub trait TunnelKind: Send + Sync + 'static {
    /// Control endpoint on the relay
    fn control_path(&self) -> &'static str;

    /// Register over a freshly opened session and return the public URL.
    async fn register(&mut self, session: &mut Session) -> Result<String, ClientError>;

    /// Drop the preferred subdomain or port after the relay refused it. Returns whether
    /// there was one to drop.
    fn forget_preference(&mut self) -> bool;

    /// Start serving one exchange. Must not block.
    fn handle_exchange(&self, channel: &ControlChannel, start: ExchangeStart);
}

/// HTTP-family tunnel: plain HTTP, WebSocket and server-sent events
pub struct HttpTunnel {
    owner_id: Uuid,
    local_url: String,
    subdomain: Option<String>,
    forwarder: Forwarder,
}

impl HttpTunnel {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            owner_id: config.owner_id,
            local_url: config.local_url.clone(),
            subdomain: config.subdomain.clone(),
            forwarder: Forwarder::new(config.relay_base()?)?,
        })
    }

    pub fn subdomain(&self) -> Option<&str> {
        self.subdomain.as_deref()
    }
}

#[async_trait]
impl TunnelKind for HttpTunnel {
    fn control_path(&self) -> &'static str {
        hatch_proto::HTTP_CONTROL_PATH
    }

    async fn register(&mut self, _session: &mut Session) -> Result<String, ClientError> {
        let url = self.forwarder.relay_base().join(hatch_proto::REGISTER_PATH)?;
        let response = self
            .forwarder
            .relay_client()
            .post(url)
            .json(&RegisterTunnelRequest {
                subdomain: self.subdomain.clone(),
                owner_id: Some(self.owner_id),
                local_url: Some(self.local_url.clone()),
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let registered: RegisterTunnelResponse = response.json().await?;
            self.subdomain = Some(registered.subdomain);
            return Ok(registered.tunnel_url);
        }

        let message = match response.json::<hatch_proto::ErrorResponse>().await {
            Ok(body) => body.message,
            Err(_) => status.to_string(),
        };
        if status == reqwest::StatusCode::BAD_REQUEST {
            Err(ClientError::Rejected(message))
        } else {
            Err(ClientError::Registration {
                status: status.as_u16(),
                message,
            })
        }
    }

    fn forget_preference(&mut self) -> bool {
        self.subdomain.take().is_some()
    }

    fn handle_exchange(&self, channel: &ControlChannel, start: ExchangeStart) {
        debug!("Exchange {} ({})", start.correlation_id(), start.kind());
        match start {
            ExchangeStart::Http {
                correlation_id,
                method,
                target_path,
                ..
            } => {
                tokio::spawn(forward::http::forward(
                    self.forwarder.clone(),
                    correlation_id,
                    method,
                    target_path,
                ));
            }
            ExchangeStart::Ws {
                correlation_id,
                target_path,
            } => {
                let stream = channel.open_stream(correlation_id);
                tokio::spawn(forward::ws::forward(channel.clone(), stream, target_path));
            }
            ExchangeStart::Sse {
                correlation_id,
                target_path,
                method,
                content_type,
                initial_body,
            } => {
                let stream = channel.open_stream(correlation_id);
                tokio::spawn(forward::sse::forward(
                    self.forwarder.clone(),
                    stream,
                    forward::sse::SseRequest {
                        target_path,
                        method,
                        content_type,
                        initial_body,
                    },
                ));
            }
            ExchangeStart::Tcp { correlation_id } => {
                warn!("Ignoring TCP exchange {} on an HTTP tunnel", correlation_id);
                let _ = channel.try_send(TunnelMessage::StreamCancel { correlation_id });
            }
        }
    }
}

/// Raw TCP tunnel on a relay-assigned public port
pub struct TcpTunnel {
    local_addr: String,
    public_port: Option<u16>,
}

impl TcpTunnel {
    pub fn new(config: &ClientConfig) -> Self {
        let local_addr = config
            .local_url
            .trim()
            .trim_start_matches("tcp://")
            .trim_end_matches('/')
            .to_string();
        Self {
            local_addr,
            public_port: config.public_port,
        }
    }

    pub fn public_port(&self) -> Option<u16> {
        self.public_port
    }
}

#[async_trait]
impl TunnelKind for TcpTunnel {
    fn control_path(&self) -> &'static str {
        hatch_proto::TCP_CONTROL_PATH
    }

    async fn register(&mut self, session: &mut Session) -> Result<String, ClientError> {
        session
            .send(TunnelMessage::RegisterTcpTunnel {
                public_port: self.public_port,
            })
            .await?;

        let deadline = tokio::time::Instant::now() + TCP_REGISTER_TIMEOUT;
        loop {
            let msg = tokio::time::timeout_at(deadline, session.next_message())
                .await
                .map_err(|_| ClientError::Timeout)?
                .ok_or(ClientError::ChannelClosed)?;
            match msg {
                TunnelMessage::TcpTunnelRegistered { tunnel_url, port } => {
                    self.public_port = Some(port);
                    return Ok(tunnel_url);
                }
                TunnelMessage::TcpTunnelRejected { reason } => {
                    return Err(ClientError::Rejected(reason));
                }
                TunnelMessage::NewExchange(start) => {
                    self.handle_exchange(session.channel(), start);
                }
                TunnelMessage::Disconnect { reason } => {
                    debug!("Relay disconnected during registration: {}", reason);
                    return Err(ClientError::ChannelClosed);
                }
                other => debug!("Ignoring {:?} during registration", other),
            }
        }
    }

    fn forget_preference(&mut self) -> bool {
        self.public_port.take().is_some()
    }

    fn handle_exchange(&self, channel: &ControlChannel, start: ExchangeStart) {
        match start {
            ExchangeStart::Tcp { correlation_id } => {
                let stream = channel.open_stream(correlation_id);
                tokio::spawn(forward::tcp::forward(
                    channel.clone(),
                    stream,
                    self.local_addr.clone(),
                ));
            }
            other => {
                let correlation_id = other.correlation_id();
                warn!(
                    "Ignoring {} exchange {} on a TCP tunnel",
                    other.kind(),
                    correlation_id
                );
                let _ = channel.try_send(TunnelMessage::StreamCancel { correlation_id });
            }
        }
    }
}

/// Why an active session ended
enum SessionEnd {
    Lost,
    Shutdown,
}

/// A tunnel kept alive across relay restarts and network loss
pub struct TunnelClient<K: TunnelKind> {
    config: ClientConfig,
    relay_base: Url,
    kind: K,
    state: StatePublisher,
}

impl TunnelClient<HttpTunnel> {
    pub fn http(config: ClientConfig) -> Result<Self, ClientError> {
        let kind = HttpTunnel::new(&config)?;
        Self::new(config, kind)
    }
}

impl TunnelClient<TcpTunnel> {
    pub fn tcp(config: ClientConfig) -> Result<Self, ClientError> {
        let kind = TcpTunnel::new(&config);
        Self::new(config, kind)
    }
}

impl<K: TunnelKind> TunnelClient<K> {
    pub fn new(config: ClientConfig, kind: K) -> Result<Self, ClientError> {
        let relay_base = config.relay_base()?;
        Ok(Self {
            config,
            relay_base,
            kind,
            state: StatePublisher::new(),
        })
    }

    /// Observe lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    /// Keep the tunnel up until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let control_url = control_url(
            &self.relay_base,
            self.kind.control_path(),
            self.config.owner_id,
        )?;

        loop {
            self.state.set(TunnelState::Connecting);
            let Some(mut session) = self.connect(&control_url, &shutdown).await else {
                break;
            };

            self.state.set(TunnelState::Registering);
            let Some(tunnel_url) = self.register(&mut session, &shutdown).await else {
                if shutdown.is_cancelled() {
                    break;
                }
                self.state.set(TunnelState::Disconnected);
                continue;
            };

            info!("Tunnel active at {}", tunnel_url);
            self.state.set(TunnelState::Active { tunnel_url });

            let end = self.serve(&mut session, &shutdown).await;
            drop(session);
            self.state.set(TunnelState::Disconnected);
            if matches!(end, SessionEnd::Shutdown) {
                break;
            }

            let delay = jitter(self.config.reconnect_jitter);
            warn!("Control channel lost, reconnecting in {:?}", delay);
            if !sleep_or_shutdown(delay, &shutdown).await {
                break;
            }
        }

        self.state.set(TunnelState::Disconnected);
        info!("Tunnel stopped");
        Ok(())
    }

    /// Open a control session, retrying forever. `None` on shutdown.
    async fn connect(&self, url: &Url, shutdown: &CancellationToken) -> Option<Session> {
        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return None,
                attempt = Session::open(url, self.config.owner_id, self.config.channel_capacity) => attempt,
            };
            match attempt {
                Ok(session) => return Some(session),
                Err(e) => {
                    warn!(
                        "Could not reach relay at {}: {} (retrying in {:?})",
                        self.relay_base, e, self.config.retry_delay
                    );
                    if !sleep_or_shutdown(self.config.retry_delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Register over `session`, retrying until it works. `None` when the session was
    /// lost or on shutdown.
    async fn register(
        &mut self,
        session: &mut Session,
        shutdown: &CancellationToken,
    ) -> Option<String> {
        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return None,
                attempt = self.kind.register(session) => attempt,
            };
            match attempt {
                Ok(tunnel_url) => return Some(tunnel_url),
                Err(e) if e.is_channel_loss() => {
                    warn!("Control channel lost during registration");
                    return None;
                }
                Err(e) if e.is_rejection() && self.kind.forget_preference() => {
                    warn!("{}; registering without the previous name", e);
                    continue;
                }
                Err(e) => {
                    warn!(
                        "Registration failed: {} (retrying in {:?})",
                        e, self.config.retry_delay
                    );
                    if session.channel().is_closed() {
                        return None;
                    }
                    if !sleep_or_shutdown(self.config.retry_delay, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Serve exchanges until the session ends.
    async fn serve(&mut self, session: &mut Session, shutdown: &CancellationToken) -> SessionEnd {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = session.channel().try_send(TunnelMessage::Disconnect {
                        reason: "client shutdown".to_string(),
                    });
                    return SessionEnd::Shutdown;
                }
                msg = session.next_message() => msg,
            };

            match msg {
                Some(TunnelMessage::NewExchange(start)) => {
                    self.kind.handle_exchange(session.channel(), start);
                }
                Some(TunnelMessage::TcpTunnelClosed { reason }) => {
                    warn!("Relay closed the tunnel: {}", reason);
                    self.state.set(TunnelState::Registering);
                    match self.register(session, shutdown).await {
                        Some(tunnel_url) => {
                            info!("Tunnel active at {}", tunnel_url);
                            self.state.set(TunnelState::Active { tunnel_url });
                        }
                        None if shutdown.is_cancelled() => return SessionEnd::Shutdown,
                        None => return SessionEnd::Lost,
                    }
                }
                Some(TunnelMessage::Disconnect { reason }) => {
                    info!("Relay disconnected us: {}", reason);
                    return SessionEnd::Lost;
                }
                Some(other) => debug!("Ignoring control message {:?}", other),
                None => return SessionEnd::Lost,
            }
        }
    }
}

fn jitter(bound: Duration) -> Duration {
    let bound = bound.as_millis() as u64;
    if bound == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
}

/// Sleep for `delay`. Returns `false` if shutdown was requested meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
