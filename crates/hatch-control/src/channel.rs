//! Handle on one control connection
//!
//! Both ends use it. The transport (a WebSocket on either side) drains [`ControlChannel`]'s
//! outgoing queue and feeds every decoded incoming message to [`ControlChannel::dispatch`]. Stream messages
//! are routed to the [`ExchangeStream`] opened for their correlation id; everything else
//! is handed back to the caller.
//!
//! Each stream carries its own credit window. A [`StreamSender`] may have at most
//! [`STREAM_WINDOW`] chunks outstanding; the receiving [`ExchangeStream`] hands credit back
//! as it consumes them. The reader therefore never waits on one stream, and a peer that
//! overruns a window only loses that stream.

use dashmap::DashMap;
use hatch_proto::{ChunkKind, TunnelMessage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Chunks a sender may have in flight on one stream before it needs credit
pub const STREAM_WINDOW: usize = 64;

/// Room for the non-chunk events (request, end, cancel) on top of a full window
pub const STREAM_BUFFER: usize = STREAM_WINDOW + 4;

/// Consumed chunks acknowledged per credit message
const CREDIT_BATCH: u32 = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("control channel closed")]
    Closed,

    #[error("control channel queue full")]
    Full,
}

/// Event delivered to the local end of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The owner accepted the exchange and wants the relay's direction to start
    Requested,
    Chunk { kind: ChunkKind, data: Vec<u8> },
    /// The peer finished its direction
    End,
    /// The peer aborted the exchange
    Cancelled,
}

struct StreamSlot {
    events: mpsc::Sender<StreamEvent>,
    /// Send credit of the local sender on this stream
    credit: Arc<Semaphore>,
}

struct ChannelInner {
    owner_id: Uuid,
    connection_id: Uuid,
    outgoing: mpsc::Sender<TunnelMessage>,
    streams: DashMap<Uuid, StreamSlot>,
    closed: CancellationToken,
}

impl ChannelInner {
    fn remove_stream(&self, correlation_id: &Uuid) {
        if let Some((_, slot)) = self.streams.remove(correlation_id) {
            slot.credit.close();
        }
    }
}

/// Cloneable handle on one physical control connection.
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("owner_id", &self.inner.owner_id)
            .field("connection_id", &self.inner.connection_id)
            .field("streams", &self.inner.streams.len())
            .finish()
    }
}

impl ControlChannel {
    /// Create a channel for a freshly accepted connection. The receiver yields the
    /// messages the transport must write to the owner.
    pub fn new(owner_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<TunnelMessage>) {
        let (outgoing, rx) = mpsc::channel(capacity);
        let channel = Self {
            inner: Arc::new(ChannelInner {
                owner_id,
                connection_id: Uuid::new_v4(),
                outgoing,
                streams: DashMap::new(),
                closed: CancellationToken::new(),
            }),
        };
        (channel, rx)
    }

    pub fn owner_id(&self) -> Uuid {
        self.inner.owner_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    /// Queue a message for the owner, waiting for room in the queue.
    pub async fn send(&self, msg: TunnelMessage) -> Result<(), ChannelError> {
        if self.inner.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(ChannelError::Closed),
            result = self.inner.outgoing.send(msg) => result.map_err(|_| ChannelError::Closed),
        }
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, msg: TunnelMessage) -> Result<(), ChannelError> {
        if self.inner.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.inner.outgoing.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    /// Start receiving stream messages for an exchange.
    ///
    /// Must be called before the exchange-start message is sent, so no early chunk from
    /// the owner is lost.
    pub fn open_stream(&self, correlation_id: Uuid) -> ExchangeStream {
        let (tx, events) = mpsc::channel(STREAM_BUFFER);
        let credit = Arc::new(Semaphore::new(STREAM_WINDOW));
        let slot = StreamSlot {
            events: tx,
            credit: credit.clone(),
        };
        if let Some(previous) = self.inner.streams.insert(correlation_id, slot) {
            previous.credit.close();
        }
        ExchangeStream {
            correlation_id,
            channel: self.clone(),
            events,
            credit,
            consumed: 0,
            peer_done: false,
        }
    }

    /// Route one message received from the owner.
    ///
    /// Stream messages are consumed. Any other message is returned for the caller to
    /// handle. Never waits on a stream: one whose peer overruns its window is cancelled.
    pub async fn dispatch(&self, msg: TunnelMessage) -> Option<TunnelMessage> {
        let (correlation_id, event) = match msg {
            TunnelMessage::StreamRequest { correlation_id } => {
                (correlation_id, StreamEvent::Requested)
            }
            TunnelMessage::StreamChunk {
                correlation_id,
                kind,
                data,
            } => (correlation_id, StreamEvent::Chunk { kind, data }),
            TunnelMessage::StreamEnd { correlation_id } => (correlation_id, StreamEvent::End),
            TunnelMessage::StreamCancel { correlation_id } => {
                (correlation_id, StreamEvent::Cancelled)
            }
            TunnelMessage::StreamCredit {
                correlation_id,
                credit,
            } => {
                self.grant(correlation_id, credit);
                return None;
            }
            TunnelMessage::Pong { timestamp } => {
                trace!("Pong from owner {} ({})", self.inner.owner_id, timestamp);
                return None;
            }
            other => return Some(other),
        };

        let terminal = event == StreamEvent::Cancelled;
        // The map guard is released before any removal below.
        let delivered = self
            .inner
            .streams
            .get(&correlation_id)
            .map(|slot| slot.events.try_send(event));

        match delivered {
            None => {
                if !terminal {
                    trace!("Message for unknown stream {}, cancelling", correlation_id);
                    let _ = self.try_send(TunnelMessage::StreamCancel { correlation_id });
                }
            }
            Some(Ok(())) => {
                if terminal {
                    self.inner.remove_stream(&correlation_id);
                }
            }
            Some(Err(mpsc::error::TrySendError::Closed(_))) => {
                self.inner.remove_stream(&correlation_id);
            }
            Some(Err(mpsc::error::TrySendError::Full(_))) => {
                warn!(
                    "Stream {} of owner {} overran its window, cancelling it",
                    correlation_id, self.inner.owner_id
                );
                self.inner.remove_stream(&correlation_id);
                let _ = self.try_send(TunnelMessage::StreamCancel { correlation_id });
            }
        }
        None
    }

    fn grant(&self, correlation_id: Uuid, credit: u32) {
        let Some(slot) = self.inner.streams.get(&correlation_id) else {
            trace!("Credit for unknown stream {}", correlation_id);
            return;
        };
        let room = STREAM_WINDOW.saturating_sub(slot.credit.available_permits());
        slot.credit.add_permits((credit as usize).min(room));
    }

    /// Close the channel. Every open stream observes the end of its event sequence.
    pub fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        for slot in self.inner.streams.iter() {
            slot.credit.close();
        }
        self.inner.streams.clear();
        debug!(
            "Closed control channel {} of owner {}",
            self.inner.connection_id, self.inner.owner_id
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Token cancelled when the channel closes, for tying child tasks to its lifetime.
    pub fn lifetime(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub fn open_streams(&self) -> usize {
        self.inner.streams.len()
    }
}

/// Local end of one streamed exchange.
///
/// Dropping it stops routing and, unless the peer already ended or cancelled the
/// exchange, tells the peer to abandon it.
pub struct ExchangeStream {
    correlation_id: Uuid,
    channel: ControlChannel,
    events: mpsc::Receiver<StreamEvent>,
    credit: Arc<Semaphore>,
    /// Chunks consumed since the last credit handed back
    consumed: u32,
    peer_done: bool,
}

impl ExchangeStream {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Next event from the peer. `None` means the control channel is gone or the peer
    /// overran the stream's window; the caller must treat it like
    /// [`StreamEvent::Cancelled`]. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.consumed >= CREDIT_BATCH && !self.peer_done {
            let credit = TunnelMessage::StreamCredit {
                correlation_id: self.correlation_id,
                credit: self.consumed,
            };
            if self.channel.send(credit).await.is_ok() {
                self.consumed = 0;
            }
        }

        let event = self.events.recv().await;
        match event {
            Some(StreamEvent::Chunk { .. }) => self.consumed += 1,
            None | Some(StreamEvent::End) | Some(StreamEvent::Cancelled) => self.peer_done = true,
            Some(StreamEvent::Requested) => {}
        }
        event
    }

    /// Stop routing without asking the peer to abandon the exchange, for exchanges
    /// that already ended cleanly from this side.
    pub fn detach(mut self) {
        self.peer_done = true;
    }

    /// Handle for the outgoing direction
    pub fn sender(&self) -> StreamSender {
        StreamSender {
            correlation_id: self.correlation_id,
            channel: self.channel.clone(),
            credit: self.credit.clone(),
        }
    }
}

impl Drop for ExchangeStream {
    fn drop(&mut self) {
        self.channel.inner.streams.remove(&self.correlation_id);
        self.credit.close();
        if !self.peer_done && !self.channel.is_closed() {
            let _ = self.channel.try_send(TunnelMessage::StreamCancel {
                correlation_id: self.correlation_id,
            });
        }
    }
}

/// Sends the outgoing direction of an exchange
#[derive(Clone)]
pub struct StreamSender {
    correlation_id: Uuid,
    channel: ControlChannel,
    credit: Arc<Semaphore>,
}

impl StreamSender {
    /// Send one chunk, waiting for credit when the peer's window is full. Fails once
    /// the stream is gone.
    pub async fn send_chunk(
        &self,
        kind: ChunkKind,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), ChannelError> {
        let permit = tokio::select! {
            _ = self.channel.inner.closed.cancelled() => return Err(ChannelError::Closed),
            permit = self.credit.acquire() => permit.map_err(|_| ChannelError::Closed)?,
        };
        permit.forget();
        self.channel
            .send(TunnelMessage::chunk(self.correlation_id, kind, data))
            .await
    }

    pub async fn finish(&self) -> Result<(), ChannelError> {
        self.channel
            .send(TunnelMessage::StreamEnd {
                correlation_id: self.correlation_id,
            })
            .await
    }

    pub async fn cancel(&self) -> Result<(), ChannelError> {
        self.channel
            .send(TunnelMessage::StreamCancel {
                correlation_id: self.correlation_id,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_proto::ExchangeStart;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_reaches_transport() {
        let (channel, mut rx) = ControlChannel::new(Uuid::new_v4(), 8);
        channel
            .send(TunnelMessage::Ping { timestamp: 42 })
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(TunnelMessage::Ping { timestamp: 42 }));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (channel, _rx) = ControlChannel::new(Uuid::new_v4(), 8);
        channel.close();
        assert_eq!(
            channel.send(TunnelMessage::Ping { timestamp: 1 }).await,
            Err(ChannelError::Closed)
        );
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_stream_messages_are_routed_in_order() {
        let (channel, _rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let id = Uuid::new_v4();
        let mut stream = channel.open_stream(id);

        assert!(channel
            .dispatch(TunnelMessage::StreamRequest { correlation_id: id })
            .await
            .is_none());
        for i in 0..3u8 {
            channel
                .dispatch(TunnelMessage::chunk(id, ChunkKind::Raw, vec![i]))
                .await;
        }
        channel
            .dispatch(TunnelMessage::StreamEnd { correlation_id: id })
            .await;

        assert_eq!(stream.next_event().await, Some(StreamEvent::Requested));
        for i in 0..3u8 {
            assert_eq!(
                stream.next_event().await,
                Some(StreamEvent::Chunk {
                    kind: ChunkKind::Raw,
                    data: vec![i]
                })
            );
        }
        assert_eq!(stream.next_event().await, Some(StreamEvent::End));
    }

    #[tokio::test]
    async fn test_non_stream_messages_are_returned() {
        let (channel, _rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let msg = TunnelMessage::RegisterTcpTunnel { public_port: None };
        assert_eq!(channel.dispatch(msg.clone()).await, Some(msg));
        assert!(channel
            .dispatch(TunnelMessage::Pong { timestamp: 1 })
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_stream_is_cancelled_back() {
        let (channel, mut rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let id = Uuid::new_v4();
        channel
            .dispatch(TunnelMessage::chunk(id, ChunkKind::Text, b"hi".to_vec()))
            .await;
        assert_eq!(
            rx.recv().await,
            Some(TunnelMessage::StreamCancel { correlation_id: id })
        );
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_on_owner_side() {
        let (channel, mut rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let id = Uuid::new_v4();
        let stream = channel.open_stream(id);
        assert_eq!(channel.open_streams(), 1);

        drop(stream);
        assert_eq!(channel.open_streams(), 0);
        assert_eq!(
            rx.recv().await,
            Some(TunnelMessage::StreamCancel { correlation_id: id })
        );
    }

    #[tokio::test]
    async fn test_dropping_finished_stream_is_quiet() {
        let (channel, mut rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let id = Uuid::new_v4();
        let mut stream = channel.open_stream(id);

        channel
            .dispatch(TunnelMessage::StreamEnd { correlation_id: id })
            .await;
        assert_eq!(stream.next_event().await, Some(StreamEvent::End));
        drop(stream);

        channel
            .send(TunnelMessage::Ping { timestamp: 7 })
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(TunnelMessage::Ping { timestamp: 7 }));
    }

    #[tokio::test]
    async fn test_close_ends_every_stream() {
        let (channel, _rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let mut a = channel.open_stream(Uuid::new_v4());
        let mut b = channel.open_stream(Uuid::new_v4());

        channel.close();
        assert_eq!(a.next_event().await, None);
        assert_eq!(b.next_event().await, None);
    }

    #[tokio::test]
    async fn test_cancel_of_one_stream_leaves_others() {
        let (channel, _rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut a = channel.open_stream(first);
        let mut b = channel.open_stream(second);

        channel
            .dispatch(TunnelMessage::StreamCancel {
                correlation_id: first,
            })
            .await;
        channel
            .dispatch(TunnelMessage::chunk(second, ChunkKind::Raw, b"x".to_vec()))
            .await;

        assert_eq!(a.next_event().await, Some(StreamEvent::Cancelled));
        assert_eq!(
            b.next_event().await,
            Some(StreamEvent::Chunk {
                kind: ChunkKind::Raw,
                data: b"x".to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_sender_waits_for_credit() {
        let (channel, mut rx) = ControlChannel::new(Uuid::new_v4(), STREAM_WINDOW * 2);
        let id = Uuid::new_v4();
        let stream = channel.open_stream(id);
        let sender = stream.sender();

        for _ in 0..STREAM_WINDOW {
            sender.send_chunk(ChunkKind::Raw, vec![0]).await.unwrap();
        }
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            sender.send_chunk(ChunkKind::Raw, vec![1]),
        )
        .await;
        assert!(blocked.is_err(), "sender ignored the window");

        channel
            .dispatch(TunnelMessage::StreamCredit {
                correlation_id: id,
                credit: 1,
            })
            .await;
        tokio::time::timeout(
            Duration::from_secs(1),
            sender.send_chunk(ChunkKind::Raw, vec![2]),
        )
        .await
        .expect("credit did not release the sender")
        .unwrap();

        let mut sent = 0;
        while rx.try_recv().is_ok() {
            sent += 1;
        }
        assert_eq!(sent, STREAM_WINDOW + 1);
    }

    #[tokio::test]
    async fn test_credit_is_capped_at_window() {
        let (channel, _rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let id = Uuid::new_v4();
        let stream = channel.open_stream(id);

        channel
            .dispatch(TunnelMessage::StreamCredit {
                correlation_id: id,
                credit: 1_000,
            })
            .await;
        assert_eq!(stream.credit.available_permits(), STREAM_WINDOW);
    }

    #[tokio::test]
    async fn test_consumer_hands_back_credit() {
        let (channel, mut rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let id = Uuid::new_v4();
        let mut stream = channel.open_stream(id);

        for i in 0..=CREDIT_BATCH {
            channel
                .dispatch(TunnelMessage::chunk(id, ChunkKind::Raw, vec![i as u8]))
                .await;
        }
        for _ in 0..CREDIT_BATCH {
            assert!(matches!(
                stream.next_event().await,
                Some(StreamEvent::Chunk { .. })
            ));
        }
        assert!(rx.try_recv().is_err());

        assert!(matches!(
            stream.next_event().await,
            Some(StreamEvent::Chunk { .. })
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            TunnelMessage::StreamCredit {
                correlation_id: id,
                credit: CREDIT_BATCH,
            }
        );
    }

    #[tokio::test]
    async fn test_sender_fails_once_stream_is_cancelled() {
        let (channel, _rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let id = Uuid::new_v4();
        let stream = channel.open_stream(id);
        let sender = stream.sender();

        channel
            .dispatch(TunnelMessage::StreamCancel { correlation_id: id })
            .await;
        assert_eq!(
            sender.send_chunk(ChunkKind::Raw, vec![0]).await,
            Err(ChannelError::Closed)
        );
    }

    #[tokio::test]
    async fn test_sender_wraps_stream_messages() {
        let (channel, mut rx) = ControlChannel::new(Uuid::new_v4(), 8);
        let id = Uuid::new_v4();
        let stream = channel.open_stream(id);
        let sender = stream.sender();

        channel
            .send(TunnelMessage::NewExchange(ExchangeStart::Tcp {
                correlation_id: id,
            }))
            .await
            .unwrap();
        sender.send_chunk(ChunkKind::Raw, b"abc".to_vec()).await.unwrap();
        sender.finish().await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(TunnelMessage::NewExchange(ExchangeStart::Tcp { .. }))
        ));
        assert_eq!(
            rx.recv().await,
            Some(TunnelMessage::chunk(id, ChunkKind::Raw, b"abc".to_vec()))
        );
        assert_eq!(
            rx.recv().await,
            Some(TunnelMessage::StreamEnd { correlation_id: id })
        );
    }
}
