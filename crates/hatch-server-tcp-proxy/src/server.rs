//! TCP proxy manager implementation
//!
//! Owns one [`TcpListenerContext`] per owner. A context is torn down by cancelling its
//! token: the accept loop stops and drops the listener, and every relayed connection of
//! that owner observes the same cancellation through a child token and closes its socket.

use dashmap::DashMap;
use hatch_control::{ControlChannel, StreamEvent};
use hatch_proto::{ChunkKind, ExchangeStart, TunnelMessage};
use hatch_router::TcpTunnelRegistry;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 32 * 1024;
const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TcpProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Owner {0} has no control channel")]
    NotConnected(Uuid),
}

#[derive(Debug, Clone)]
pub struct TcpProxyConfig {
    /// Address the per-owner listeners bind to
    pub bind_ip: IpAddr,
    /// Host reported in `tcp://host:port` tunnel URLs
    pub public_host: String,
}

impl Default for TcpProxyConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRegistration {
    pub port: u16,
    pub tunnel_url: String,
}

struct TcpListenerContext {
    port: u16,
    cancellation: CancellationToken,
    accept_loop: JoinHandle<()>,
}

/// A public connection currently relayed for an owner
struct RelayedConnection {
    owner_id: Uuid,
    peer_addr: SocketAddr,
    cancellation: CancellationToken,
}

struct ManagerInner {
    config: TcpProxyConfig,
    registry: Arc<TcpTunnelRegistry<ControlChannel>>,
    listeners: DashMap<Uuid, TcpListenerContext>,
    connections: DashMap<Uuid, RelayedConnection>,
}

#[derive(Clone)]
pub struct TcpProxyManager {
    inner: Arc<ManagerInner>,
}

impl TcpProxyManager {
    pub fn new(config: TcpProxyConfig, registry: Arc<TcpTunnelRegistry<ControlChannel>>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                listeners: DashMap::new(),
                connections: DashMap::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TcpTunnelRegistry<ControlChannel>> {
        &self.inner.registry
    }

    /// Bind a freshly connected control channel to its owner and close the one it
    /// supersedes. The owner's listener, if any, keeps running and serves the new channel.
    pub fn attach(&self, channel: ControlChannel) {
        let superseded = self.inner.registry.connect(
            channel.owner_id(),
            channel.connection_id(),
            channel.clone(),
        );
        if let Some(previous) = superseded {
            if previous.connection_id != channel.connection_id() {
                info!(
                    "TCP owner {} reconnected, closing previous channel {}",
                    channel.owner_id(),
                    previous.connection_id
                );
                let _ = previous.handle.try_send(TunnelMessage::Disconnect {
                    reason: "superseded by a newer connection".to_string(),
                });
                previous.handle.close();
            }
        }
    }

    /// Handle loss of an owner's control channel. Tears the owner's listener down unless
    /// the channel was already superseded.
    pub fn on_disconnect(&self, owner_id: Uuid, connection_id: Uuid) -> bool {
        if !self.inner.registry.on_disconnect(&owner_id, connection_id) {
            return false;
        }
        self.teardown(owner_id);
        true
    }

    /// Open (or reopen) the owner's public listener.
    ///
    /// A previously assigned port is reused when it can be bound again; otherwise the OS
    /// picks one.
    pub async fn register(
        &self,
        owner_id: Uuid,
        requested_port: Option<u16>,
    ) -> Result<TcpRegistration, TcpProxyError> {
        if self.inner.registry.channel(&owner_id).is_none() {
            return Err(TcpProxyError::NotConnected(owner_id));
        }

        // Release our own socket first so a sticky port can be rebound.
        self.teardown(owner_id);

        let listener = match requested_port {
            Some(port) if port != 0 => match self.bind_with_retry(port).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(
                        "Could not reuse port {} for owner {} ({}), allocating a new one",
                        port, owner_id, e
                    );
                    self.bind_with_retry(0).await?
                }
            },
            _ => self.bind_with_retry(0).await?,
        };
        let port = listener.local_addr()?.port();

        let cancellation = CancellationToken::new();
        let accept_loop = tokio::spawn(self.clone().accept_loop(
            owner_id,
            port,
            listener,
            cancellation.clone(),
        ));

        if let Some(replaced) = self.inner.listeners.insert(
            owner_id,
            TcpListenerContext {
                port,
                cancellation,
                accept_loop,
            },
        ) {
            // A concurrent registration raced us; the last one wins.
            replaced.cancellation.cancel();
            replaced.accept_loop.abort();
        }
        self.inner.registry.set_port(owner_id, port);

        let tunnel_url = format!("tcp://{}:{}", self.inner.config.public_host, port);
        info!("TCP tunnel for owner {} listening on {}", owner_id, tunnel_url);
        Ok(TcpRegistration { port, tunnel_url })
    }

    /// Close the owner's listener and every connection relayed through it.
    pub fn teardown(&self, owner_id: Uuid) -> bool {
        let Some((_, context)) = self.inner.listeners.remove(&owner_id) else {
            return false;
        };
        context.cancellation.cancel();
        context.accept_loop.abort();
        self.inner.registry.clear_port(&owner_id);
        debug!(
            "Closed TCP listener on port {} for owner {}",
            context.port, owner_id
        );
        true
    }

    pub fn port(&self, owner_id: &Uuid) -> Option<u16> {
        self.inner.listeners.get(owner_id).map(|ctx| ctx.port)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Number of relayed connections of one owner
    pub fn connections_of(&self, owner_id: &Uuid) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.owner_id == *owner_id)
            .count()
    }

    /// Close one relayed connection.
    pub fn disconnect(&self, correlation_id: &Uuid) -> bool {
        match self.inner.connections.remove(correlation_id) {
            Some((_, connection)) => {
                connection.cancellation.cancel();
                true
            }
            None => false,
        }
    }

    async fn bind_with_retry(&self, port: u16) -> Result<TcpListener, TcpProxyError> {
        let addr = SocketAddr::new(self.inner.config.bind_ip, port);
        for attempt in 1..=BIND_ATTEMPTS {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Bound to {} on attempt {}/{}",
                            addr, attempt, BIND_ATTEMPTS
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    debug!(
                        "Port {} is in use (attempt {}/{}), retrying",
                        port, attempt, BIND_ATTEMPTS
                    );
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(TcpProxyError::BindError {
                        address: addr.ip().to_string(),
                        port,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(TcpProxyError::BindError {
            address: addr.ip().to_string(),
            port,
            reason: format!("address in use after {} attempts", BIND_ATTEMPTS),
        })
    }

    async fn accept_loop(
        self,
        owner_id: Uuid,
        port: u16,
        listener: TcpListener,
        cancellation: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancellation.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    let Some(slot) = self.inner.registry.channel(&owner_id) else {
                        debug!(
                            "Dropping connection from {} on port {}: owner {} is not connected",
                            peer_addr, port, owner_id
                        );
                        continue;
                    };

                    let correlation_id = Uuid::new_v4();
                    let connection_token = cancellation.child_token();
                    self.inner.connections.insert(
                        correlation_id,
                        RelayedConnection {
                            owner_id,
                            peer_addr,
                            cancellation: connection_token.clone(),
                        },
                    );
                    debug!(
                        "Accepted {} on port {} as exchange {}",
                        peer_addr, port, correlation_id
                    );

                    let manager = self.clone();
                    tokio::spawn(async move {
                        relay_connection(slot.handle, correlation_id, socket, connection_token)
                            .await;
                        if let Some((_, connection)) =
                            manager.inner.connections.remove(&correlation_id)
                        {
                            trace!(
                                "Connection {} from {} closed",
                                correlation_id,
                                connection.peer_addr
                            );
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    debug!("Transient accept error on port {}: {}", port, e);
                }
                Err(e) => {
                    error!("TCP listener on port {} failed: {}", port, e);
                    self.close_after_failure(owner_id, port, e.to_string()).await;
                    break;
                }
            }
        }
        trace!("Accept loop for port {} stopped", port);
    }

    async fn close_after_failure(&self, owner_id: Uuid, port: u16, reason: String) {
        if let Some((_, context)) = self
            .inner
            .listeners
            .remove_if(&owner_id, |_, ctx| ctx.port == port)
        {
            context.cancellation.cancel();
            self.inner.registry.clear_port(&owner_id);
        }

        if let Some(slot) = self.inner.registry.channel(&owner_id) {
            if let Err(e) = slot
                .handle
                .send(TunnelMessage::TcpTunnelClosed { reason })
                .await
            {
                debug!("Could not notify owner {} of closed tunnel: {}", owner_id, e);
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

/// Relay one accepted socket over the owner's channel until both directions are done.
async fn relay_connection(
    channel: ControlChannel,
    correlation_id: Uuid,
    socket: TcpStream,
    cancellation: CancellationToken,
) {
    let mut stream = channel.open_stream(correlation_id);
    let sender = stream.sender();

    if let Err(e) = channel
        .send(TunnelMessage::NewExchange(ExchangeStart::Tcp { correlation_id }))
        .await
    {
        debug!("Could not announce connection {}: {}", correlation_id, e);
        return;
    }

    // The owner acknowledges once its local connection is up.
    let accepted = tokio::select! {
        _ = cancellation.cancelled() => false,
        event = stream.next_event() => matches!(event, Some(StreamEvent::Requested)),
    };
    if !accepted {
        debug!("Connection {} was refused by the owner", correlation_id);
        return;
    }

    let (mut reader, mut writer) = socket.into_split();

    let (clean, owner_finished) = {
        let upstream = async {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    sender.finish().await.map_err(std::io::Error::other)?;
                    return Ok::<(), std::io::Error>(());
                }
                sender
                    .send_chunk(ChunkKind::Raw, buf[..n].to_vec())
                    .await
                    .map_err(std::io::Error::other)?;
            }
        };

        let downstream = async {
            loop {
                match stream.next_event().await {
                    Some(StreamEvent::Chunk { data, .. }) => writer.write_all(&data).await?,
                    Some(StreamEvent::Requested) => {}
                    Some(StreamEvent::End) => {
                        let _ = writer.shutdown().await;
                        return Ok::<(), std::io::Error>(());
                    }
                    Some(StreamEvent::Cancelled) | None => {
                        return Err(ErrorKind::ConnectionAborted.into());
                    }
                }
            }
        };

        tokio::pin!(upstream);
        tokio::pin!(downstream);
        let mut upstream_done = false;
        let mut downstream_done = false;

        // Either side may half-close; the connection is over once both directions are.
        let clean = loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    debug!("Connection {} closed by listener teardown", correlation_id);
                    break false;
                }
                result = &mut upstream, if !upstream_done => {
                    upstream_done = true;
                    if let Err(e) = result {
                        debug!("Connection {} read side ended: {}", correlation_id, e);
                        break false;
                    }
                }
                result = &mut downstream, if !downstream_done => match result {
                    Ok(()) => downstream_done = true,
                    Err(e) => {
                        debug!("Connection {} write side ended: {}", correlation_id, e);
                        break false;
                    }
                },
            }
            if upstream_done && downstream_done {
                break true;
            }
        };
        (clean, downstream_done)
    };

    if clean {
        stream.detach();
    } else if owner_finished {
        // The owner already ended its direction, so dropping the stream would not tell it
        // that ours is abandoned.
        let _ = channel.try_send(TunnelMessage::StreamCancel { correlation_id });
    }
    debug!("Connection {} closed", correlation_id);
}
