//! WebSocket close frames carried as `ChunkKind::Close` payloads
//!
//! The payload mirrors the WebSocket wire format: a big-endian status code followed by
//! an optional UTF-8 reason. An empty payload means "closed without status".

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// The peer went away, e.g. the tunnel owner disconnected
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Unexpected condition on the relaying side
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub fn encode_close(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

pub fn decode_close(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_payload() {
        let payload = encode_close(CLOSE_GOING_AWAY, "owner left");
        assert_eq!(&payload[..2], &[0x03, 0xe9]);
        assert_eq!(
            decode_close(&payload),
            Some((CLOSE_GOING_AWAY, "owner left".to_string()))
        );
    }

    #[test]
    fn test_empty_close_payload() {
        assert_eq!(decode_close(&[]), None);
        assert_eq!(decode_close(&encode_close(CLOSE_NORMAL, "")), Some((1000, String::new())));
    }
}
