//! Control channel message types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a streamed chunk.
///
/// WebSocket exchanges carry `Text`, `Binary` and `Close`; SSE and TCP exchanges carry
/// opaque `Raw` bytes and signal closure with [`TunnelMessage::StreamEnd`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkKind {
    Text,
    Binary,
    Close,
    Raw,
}

/// First message of every exchange, pushed by the relay to the tunnel owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ExchangeStart {
    /// Plain request/response. The owner pulls the request from
    /// `GET /relay/exchange/{id}` and pushes the response to `POST /relay/exchange/{id}`.
    Http {
        correlation_id: Uuid,
        method: String,
        content_type: Option<String>,
        /// Absolute URL on the owner's local server
        target_path: String,
    },
    /// Full-duplex WebSocket session; `target_path` already uses the ws/wss scheme.
    Ws {
        correlation_id: Uuid,
        target_path: String,
    },
    /// Server-sent events; only the owner→relay direction carries chunks.
    Sse {
        correlation_id: Uuid,
        target_path: String,
        method: String,
        content_type: Option<String>,
        #[serde(with = "serde_bytes")]
        initial_body: Vec<u8>,
    },
    /// Raw TCP connection accepted on the owner's public port.
    Tcp { correlation_id: Uuid },
}

impl ExchangeStart {
    pub fn correlation_id(&self) -> Uuid {
        match self {
            ExchangeStart::Http { correlation_id, .. }
            | ExchangeStart::Ws { correlation_id, .. }
            | ExchangeStart::Sse { correlation_id, .. }
            | ExchangeStart::Tcp { correlation_id } => *correlation_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeStart::Http { .. } => "http",
            ExchangeStart::Ws { .. } => "ws",
            ExchangeStart::Sse { .. } => "sse",
            ExchangeStart::Tcp { .. } => "tcp",
        }
    }
}

/// Main control channel message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TunnelMessage {
    // Keepalive
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },

    /// Relay is dropping this channel, e.g. because the owner reconnected elsewhere.
    Disconnect {
        reason: String,
    },

    NewExchange(ExchangeStart),

    // TCP tunnel lifecycle
    RegisterTcpTunnel {
        /// Port assigned on a previous registration, reused when still free
        public_port: Option<u16>,
    },
    TcpTunnelRegistered {
        tunnel_url: String,
        port: u16,
    },
    TcpTunnelRejected {
        reason: String,
    },
    TcpTunnelClosed {
        reason: String,
    },

    // Per-exchange streams
    /// Sent by the owner once it accepted an exchange; opens the relay→owner direction.
    StreamRequest {
        correlation_id: Uuid,
    },
    StreamChunk {
        correlation_id: Uuid,
        kind: ChunkKind,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Clean end of one direction.
    StreamEnd {
        correlation_id: Uuid,
    },
    /// Aborts the whole exchange.
    StreamCancel {
        correlation_id: Uuid,
    },
    /// The receiver consumed `credit` more chunks; the sender may send that many more.
    StreamCredit {
        correlation_id: Uuid,
        credit: u32,
    },
}

impl TunnelMessage {
    /// Correlation id of stream-level messages, `None` for channel-level ones.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            TunnelMessage::NewExchange(start) => Some(start.correlation_id()),
            TunnelMessage::StreamRequest { correlation_id }
            | TunnelMessage::StreamChunk { correlation_id, .. }
            | TunnelMessage::StreamEnd { correlation_id }
            | TunnelMessage::StreamCancel { correlation_id }
            | TunnelMessage::StreamCredit { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }

    pub fn chunk(correlation_id: Uuid, kind: ChunkKind, data: impl Into<Vec<u8>>) -> Self {
        TunnelMessage::StreamChunk {
            correlation_id,
            kind,
            data: data.into(),
        }
    }
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
