//! Client errors

use hatch_control::ChannelError;
use hatch_proto::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Control channel connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Relay rejected the registration: {0}")]
    Rejected(String),

    #[error("Registration failed with status {status}: {message}")]
    Registration { status: u16, message: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Timed out waiting for the relay")]
    Timeout,
}

impl ClientError {
    /// The relay refused what we asked for; asking again unchanged will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::Rejected(_))
    }

    /// The control connection is gone and must be re-established.
    pub fn is_channel_loss(&self) -> bool {
        matches!(self, ClientError::ChannelClosed)
    }
}

impl From<ChannelError> for ClientError {
    fn from(_: ChannelError) -> Self {
        ClientError::ChannelClosed
    }
}
