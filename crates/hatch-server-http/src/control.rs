//! Control channel endpoints
//!
//! Owners dial `GET /control/http?ownerId=` or `GET /control/tcp?ownerId=` and keep the
//! WebSocket open for the lifetime of their tunnel. Every binary frame carries one
//! encoded [`TunnelMessage`].

use crate::error::RelayError;
use crate::state::RelayState;
use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hatch_control::ControlChannel;
use hatch_proto::{decode, encode, TunnelMessage};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ControlQuery {
    #[serde(rename = "ownerId")]
    pub owner_id: Option<Uuid>,
}

/// Which registry a control channel is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFamily {
    Http,
    Tcp,
}

impl ChannelFamily {
    fn as_str(self) -> &'static str {
        match self {
            ChannelFamily::Http => "http",
            ChannelFamily::Tcp => "tcp",
        }
    }
}

/// `GET /control/http`
pub async fn http_channel(
    State(state): State<RelayState>,
    query: Result<Query<ControlQuery>, QueryRejection>,
    upgrade: WebSocketUpgrade,
) -> Response {
    accept(state, query, upgrade, ChannelFamily::Http)
}

/// `GET /control/tcp`
pub async fn tcp_channel(
    State(state): State<RelayState>,
    query: Result<Query<ControlQuery>, QueryRejection>,
    upgrade: WebSocketUpgrade,
) -> Response {
    accept(state, query, upgrade, ChannelFamily::Tcp)
}

fn accept(
    state: RelayState,
    query: Result<Query<ControlQuery>, QueryRejection>,
    upgrade: WebSocketUpgrade,
    family: ChannelFamily,
) -> Response {
    let owner_id = match query {
        Ok(Query(ControlQuery {
            owner_id: Some(owner_id),
        })) => owner_id,
        Ok(_) => {
            return RelayError::InvalidRequest("ownerId is required".to_string()).into_response()
        }
        Err(rejection) => {
            return RelayError::InvalidRequest(rejection.body_text()).into_response();
        }
    };

    upgrade
        .max_message_size(hatch_proto::MAX_FRAME_SIZE)
        .on_upgrade(move |socket| serve_channel(state, owner_id, family, socket))
}

/// Drive one control connection until either side goes away, then reclaim everything
/// bound to it.
async fn serve_channel(
    state: RelayState,
    owner_id: Uuid,
    family: ChannelFamily,
    socket: WebSocket,
) {
    let (channel, outgoing) = ControlChannel::new(owner_id, state.config.channel_capacity);
    let connection_id = channel.connection_id();
    info!(
        "Owner {} connected {} control channel {}",
        owner_id,
        family.as_str(),
        connection_id
    );

    match family {
        ChannelFamily::Http => state.attach_http(channel.clone()),
        ChannelFamily::Tcp => state.tcp.attach(channel.clone()),
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(
        channel.clone(),
        ws_tx,
        outgoing,
        state.config.heartbeat_interval,
    ));

    tokio::select! {
        _ = read_loop(&state, &channel, family, &mut ws_rx) => {}
        _ = channel.closed() => {}
    }
    channel.close();
    let _ = writer.await;

    match family {
        ChannelFamily::Http => state.on_http_disconnect(owner_id, connection_id),
        ChannelFamily::Tcp => {
            if state.tcp.on_disconnect(owner_id, connection_id) {
                info!("TCP owner {} disconnected, listener closed", owner_id);
            }
        }
    }
    debug!("Control channel {} finished", connection_id);
}

async fn read_loop(
    state: &RelayState,
    channel: &ControlChannel,
    family: ChannelFamily,
    ws_rx: &mut SplitStream<WebSocket>,
) {
    while let Some(frame) = ws_rx.next().await {
        let bytes = match frame {
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => return,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Text(_)) => {
                warn!("Ignoring text frame on control channel {}", channel.connection_id());
                continue;
            }
            Err(e) => {
                debug!("Control channel {} read error: {}", channel.connection_id(), e);
                return;
            }
        };

        let msg = match decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "Undecodable frame on control channel {}: {}",
                    channel.connection_id(),
                    e
                );
                continue;
            }
        };

        let Some(msg) = channel.dispatch(msg).await else {
            continue;
        };
        match msg {
            TunnelMessage::Ping { timestamp } => {
                let _ = channel.send(TunnelMessage::Pong { timestamp }).await;
            }
            TunnelMessage::Disconnect { reason } => {
                info!("Owner {} disconnecting: {}", channel.owner_id(), reason);
                return;
            }
            TunnelMessage::RegisterTcpTunnel { public_port } => match family {
                ChannelFamily::Tcp => {
                    tokio::spawn(register_tcp(state.clone(), channel.clone(), public_port));
                }
                ChannelFamily::Http => {
                    let _ = channel
                        .send(TunnelMessage::TcpTunnelRejected {
                            reason: "TCP tunnels register on the TCP control channel".to_string(),
                        })
                        .await;
                }
            },
            other => {
                debug!(
                    "Unexpected message on control channel {}: {:?}",
                    channel.connection_id(),
                    other
                );
            }
        }
    }
}

async fn register_tcp(state: RelayState, channel: ControlChannel, public_port: Option<u16>) {
    let reply = match state.tcp.register(channel.owner_id(), public_port).await {
        Ok(registration) => TunnelMessage::TcpTunnelRegistered {
            tunnel_url: registration.tunnel_url,
            port: registration.port,
        },
        Err(e) => {
            warn!("TCP registration for owner {} failed: {}", channel.owner_id(), e);
            TunnelMessage::TcpTunnelRejected {
                reason: e.to_string(),
            }
        }
    };
    let _ = channel.send(reply).await;
}

/// Write queued messages and heartbeats to the owner. Once the channel closes, whatever
/// is still queued (a final `Disconnect`, say) is flushed before the socket is closed.
async fn write_loop(
    channel: ControlChannel,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outgoing: mpsc::Receiver<TunnelMessage>,
    heartbeat_interval: Duration,
) {
    let lifetime = channel.lifetime();
    let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let msg = tokio::select! {
            msg = outgoing.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = heartbeat.tick() => TunnelMessage::Ping { timestamp: unix_millis() },
            _ = lifetime.cancelled() => {
                while let Ok(msg) = outgoing.try_recv() {
                    if write_message(&mut ws_tx, &msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };

        if write_message(&mut ws_tx, &msg).await.is_err() {
            debug!("Control channel {} write failed", channel.connection_id());
            channel.close();
            break;
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = ws_tx.close().await;
}

async fn write_message(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &TunnelMessage,
) -> Result<(), axum::Error> {
    match encode(msg) {
        Ok(frame) => ws_tx.send(Message::Binary(frame.into())).await,
        Err(e) => {
            warn!("Dropping unencodable control message: {}", e);
            Ok(())
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
