//! WebSocket relay
//!
//! The public socket is accepted right away and parked without a timeout. Two loops then
//! run until either finishes: owner chunks are written to the public socket, and public
//! frames are sent to the owner as chunks.

use crate::state::{RelayState, StreamCarrier};
use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::Response;
use futures_util::{SinkExt, StreamExt};
use hatch_control::{ControlChannel, ExchangeStream, StreamEvent, StreamSender};
use hatch_proto::frames::{decode_close, encode_close, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR};
use hatch_proto::{target, ChunkKind, ExchangeStart, TunnelMessage};
use hatch_router::Resolved;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub fn relay(
    state: RelayState,
    resolved: Resolved<ControlChannel>,
    upgrade: WebSocketUpgrade,
    target_path: String,
) -> Response<Body> {
    upgrade.on_upgrade(move |socket| async move {
        let correlation_id = Uuid::new_v4();
        match target::to_websocket(&target_path) {
            Ok(target_path) => run(state, resolved, correlation_id, target_path, socket).await,
            Err(e) => {
                debug!("Invalid WebSocket target {}: {}", target_path, e);
                close_with(socket, CLOSE_INTERNAL_ERROR, "invalid tunnel target").await;
            }
        }
    })
}

async fn run(
    state: RelayState,
    resolved: Resolved<ControlChannel>,
    correlation_id: Uuid,
    target_path: String,
    socket: WebSocket,
) {
    let channel = resolved.channel;
    let mut stream = channel.open_stream(correlation_id);
    let mut parked = state.stream_exchanges.park(
        correlation_id,
        resolved.descriptor.owner_id,
        resolved.connection_id,
        Arc::new(StreamCarrier {
            kind: "ws",
            target: target_path.clone(),
        }),
        None,
    );

    debug!("WebSocket exchange {} -> {}", correlation_id, target_path);
    if channel
        .send(TunnelMessage::NewExchange(ExchangeStart::Ws {
            correlation_id,
            target_path,
        }))
        .await
        .is_err()
    {
        close_with(socket, CLOSE_GOING_AWAY, "client disconnected").await;
        return;
    }

    // Wait for the owner to reach its local socket.
    let accepted = tokio::select! {
        event = stream.next_event() => matches!(event, Some(StreamEvent::Requested)),
        _ = parked.wait() => false,
    };
    if !accepted {
        debug!("Owner refused WebSocket exchange {}", correlation_id);
        close_with(socket, CLOSE_INTERNAL_ERROR, "tunnel client refused").await;
        return;
    }

    let sender = stream.sender();
    let (mut public_tx, mut public_rx) = socket.split();

    let clean = tokio::select! {
        clean = owner_to_public(&mut stream, &mut public_tx) => clean,
        clean = public_to_owner(&mut public_rx, &sender) => clean,
        outcome = parked.wait() => {
            debug!("WebSocket exchange {} ended: {:?}", correlation_id, outcome);
            let _ = public_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "client disconnected".into(),
                })))
                .await;
            false
        }
    };

    let _ = public_tx.close().await;
    if clean {
        state.stream_exchanges.resolve(correlation_id);
    }
    debug!("WebSocket exchange {} closed", correlation_id);
}

/// Owner chunks → public socket. Returns whether the session ended cleanly.
async fn owner_to_public(
    stream: &mut ExchangeStream,
    public_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    loop {
        let message = match stream.next_event().await {
            Some(StreamEvent::Chunk { kind, data }) => match kind {
                ChunkKind::Text => {
                    Message::Text(String::from_utf8_lossy(&data).into_owned().into())
                }
                ChunkKind::Binary | ChunkKind::Raw => Message::Binary(data.into()),
                ChunkKind::Close => {
                    let frame = decode_close(&data).map(|(code, reason)| CloseFrame {
                        code,
                        reason: reason.into(),
                    });
                    let _ = public_tx.send(Message::Close(frame)).await;
                    return true;
                }
            },
            Some(StreamEvent::Requested) => continue,
            Some(StreamEvent::End) => {
                let _ = public_tx.send(Message::Close(None)).await;
                return true;
            }
            Some(StreamEvent::Cancelled) | None => {
                let _ = public_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "tunnel closed".into(),
                    })))
                    .await;
                return false;
            }
        };

        if public_tx.send(message).await.is_err() {
            return false;
        }
    }
}

/// Public frames → owner chunks. Returns whether the session ended cleanly.
async fn public_to_owner(
    public_rx: &mut futures_util::stream::SplitStream<WebSocket>,
    sender: &StreamSender,
) -> bool {
    while let Some(frame) = public_rx.next().await {
        let (kind, data): (ChunkKind, Vec<u8>) = match frame {
            Ok(Message::Text(text)) => (ChunkKind::Text, text.as_str().as_bytes().to_vec()),
            Ok(Message::Binary(bytes)) => (ChunkKind::Binary, bytes.to_vec()),
            Ok(Message::Close(frame)) => {
                let payload = frame
                    .map(|f| encode_close(f.code, f.reason.as_str()))
                    .unwrap_or_default();
                let _ = sender.send_chunk(ChunkKind::Close, payload).await;
                let _ = sender.finish().await;
                return true;
            }
            // Pings are answered by the socket itself.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Err(e) => {
                debug!("Public WebSocket error: {}", e);
                return false;
            }
        };
        if sender.send_chunk(kind, data).await.is_err() {
            return false;
        }
    }
    // Socket dropped without a close frame.
    let _ = sender.finish().await;
    false
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
