//! Binary codec for control channel messages
//!
//! Each control channel frame carries exactly one bincode-encoded [`TunnelMessage`].

use crate::messages::TunnelMessage;
use crate::MAX_FRAME_SIZE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub fn encode(msg: &TunnelMessage) -> Result<Vec<u8>, CodecError> {
    let bytes = bincode::serialize(msg)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode(frame: &[u8]) -> Result<TunnelMessage, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(frame.len()));
    }
    Ok(bincode::deserialize(frame)?)
}
