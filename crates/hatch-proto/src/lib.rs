//! Hatch protocol definitions
//!
//! Message types exchanged over the control channel, the binary codec that frames them,
//! the header conventions used by the HTTP pull/push side-channel, and the JSON bodies of
//! the registration endpoint.

pub mod api;
pub mod codec;
pub mod frames;
pub mod headers;
pub mod messages;
pub mod target;

pub use api::{ErrorResponse, RegisterTunnelRequest, RegisterTunnelResponse};
pub use codec::{decode, encode, CodecError};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded message size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Path of the HTTP-family control channel (HTTP, WebSocket and SSE exchanges)
pub const HTTP_CONTROL_PATH: &str = "/control/http";

/// Path of the TCP control channel
pub const TCP_CONTROL_PATH: &str = "/control/tcp";

/// Path of the tunnel registration endpoint
pub const REGISTER_PATH: &str = "/tunnel";

/// Prefix of the HTTP exchange side-channel; the correlation id is appended
pub const EXCHANGE_PATH_PREFIX: &str = "/relay/exchange";

/// Query parameter carrying the owner id on control channel upgrades
pub const OWNER_ID_PARAM: &str = "ownerId";
