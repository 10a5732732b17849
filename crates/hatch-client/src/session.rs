//! One control connection to the relay
//!
//! The WebSocket is driven by a background task: queued messages are written as binary
//! frames, and incoming frames are decoded and fed to [`ControlChannel::dispatch`].
//! Stream messages go to their exchanges, pings are answered, and everything else is
//! handed to the tunnel loop through [`Session::next_message`].

use crate::error::ClientError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hatch_control::ControlChannel;
use hatch_proto::{decode, encode, TunnelMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Session {
    channel: ControlChannel,
    events: mpsc::Receiver<TunnelMessage>,
}

impl Session {
    /// Dial the relay's control endpoint.
    pub async fn open(url: &Url, owner_id: Uuid, capacity: usize) -> Result<Self, ClientError> {
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (channel, outgoing) = ControlChannel::new(owner_id, capacity);
        let (events_tx, events) = mpsc::channel(capacity);
        debug!("Control channel {} open to {}", channel.connection_id(), url);

        tokio::spawn(drive(socket, channel.clone(), outgoing, events_tx));
        Ok(Self { channel, events })
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    pub async fn send(&self, msg: TunnelMessage) -> Result<(), ClientError> {
        Ok(self.channel.send(msg).await?)
    }

    /// Next control message for the tunnel loop. `None` once the connection is gone.
    pub async fn next_message(&mut self) -> Option<TunnelMessage> {
        self.events.recv().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.channel.close();
    }
}

async fn drive(
    socket: Socket,
    channel: ControlChannel,
    outgoing: mpsc::Receiver<TunnelMessage>,
    events: mpsc::Sender<TunnelMessage>,
) {
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(channel.clone(), sink, outgoing));

    tokio::select! {
        _ = read_loop(&channel, &mut stream, &events) => {}
        _ = channel.closed() => {}
    }
    channel.close();
    let _ = writer.await;
    debug!("Control channel {} closed", channel.connection_id());
}

async fn read_loop(
    channel: &ControlChannel,
    stream: &mut SplitStream<Socket>,
    events: &mpsc::Sender<TunnelMessage>,
) {
    while let Some(frame) = stream.next().await {
        let bytes = match frame {
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => {
                debug!("Relay closed the control channel: {:?}", frame);
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("Control channel read error: {}", e);
                return;
            }
        };

        let msg = match decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Undecodable frame from relay: {}", e);
                continue;
            }
        };

        match channel.dispatch(msg).await {
            Some(TunnelMessage::Ping { timestamp }) => {
                trace!("Ping from relay ({})", timestamp);
                let _ = channel.send(TunnelMessage::Pong { timestamp }).await;
            }
            Some(other) => {
                if events.send(other).await.is_err() {
                    return;
                }
            }
            None => {}
        }
    }
}

async fn write_loop(
    channel: ControlChannel,
    mut sink: SplitSink<Socket, Message>,
    mut outgoing: mpsc::Receiver<TunnelMessage>,
) {
    let lifetime = channel.lifetime();
    loop {
        let msg = tokio::select! {
            msg = outgoing.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = lifetime.cancelled() => {
                while let Ok(msg) = outgoing.try_recv() {
                    if write_message(&mut sink, &msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        if write_message(&mut sink, &msg).await.is_err() {
            channel.close();
            break;
        }
    }
    let _ = sink.close().await;
}

async fn write_message(
    sink: &mut SplitSink<Socket, Message>,
    msg: &TunnelMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match encode(msg) {
        Ok(frame) => sink.send(Message::Binary(frame.into())).await,
        Err(e) => {
            warn!("Dropping unencodable control message: {}", e);
            Ok(())
        }
    }
}
