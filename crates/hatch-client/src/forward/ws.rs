//! WebSocket exchanges: bridge relay chunks and a local WebSocket connection

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hatch_control::{ControlChannel, ExchangeStream, StreamEvent, StreamSender};
use hatch_proto::frames::{decode_close, encode_close};
use hatch_proto::{ChunkKind, TunnelMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type LocalSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn forward(channel: ControlChannel, mut stream: ExchangeStream, target_path: String) {
    let correlation_id = stream.correlation_id();
    let local = match tokio_tungstenite::connect_async(target_path.as_str()).await {
        Ok((local, _)) => local,
        Err(e) => {
            debug!("Local WebSocket {} unavailable: {}", target_path, e);
            // Dropping the stream cancels the exchange.
            return;
        }
    };
    if channel
        .send(TunnelMessage::StreamRequest { correlation_id })
        .await
        .is_err()
    {
        return;
    }
    debug!("WebSocket exchange {} bridged to {}", correlation_id, target_path);

    let sender = stream.sender();
    let (mut local_tx, mut local_rx) = local.split();
    let clean = tokio::select! {
        clean = relay_to_local(&mut stream, &mut local_tx) => clean,
        clean = local_to_relay(&mut local_rx, &sender) => clean,
    };
    let _ = local_tx.close().await;

    if clean {
        stream.detach();
    }
    debug!("WebSocket exchange {} closed", correlation_id);
}

async fn relay_to_local(
    stream: &mut ExchangeStream,
    local_tx: &mut SplitSink<LocalSocket, Message>,
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
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    });
                    let _ = local_tx.send(Message::Close(frame)).await;
                    return true;
                }
            },
            Some(StreamEvent::Requested) => continue,
            Some(StreamEvent::End) => {
                let _ = local_tx.send(Message::Close(None)).await;
                return true;
            }
            Some(StreamEvent::Cancelled) | None => return false,
        };
        if local_tx.send(message).await.is_err() {
            return false;
        }
    }
}

async fn local_to_relay(local_rx: &mut SplitStream<LocalSocket>, sender: &StreamSender) -> bool {
    while let Some(frame) = local_rx.next().await {
        let (kind, data): (ChunkKind, Vec<u8>) = match frame {
            Ok(Message::Text(text)) => (ChunkKind::Text, text.as_str().as_bytes().to_vec()),
            Ok(Message::Binary(bytes)) => (ChunkKind::Binary, bytes.to_vec()),
            Ok(Message::Close(frame)) => {
                let payload = frame
                    .map(|f| encode_close(u16::from(f.code), f.reason.as_str()))
                    .unwrap_or_default();
                let _ = sender.send_chunk(ChunkKind::Close, payload).await;
                let _ = sender.finish().await;
                return true;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Err(e) => {
                debug!("Local WebSocket error: {}", e);
                return false;
            }
        };
        if sender.send_chunk(kind, data).await.is_err() {
            return false;
        }
    }
    let _ = sender.finish().await;
    false
}
