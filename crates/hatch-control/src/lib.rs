//! Control plane shared by the relay and the tunnel client
//!
//! - [`CorrelationQueue`] parks public callers until their exchange is completed by the
//!   tunnel owner, times out, or is abandoned. Relay only.
//! - [`ControlChannel`] is either end's handle on one control connection: it queues
//!   outgoing messages and demultiplexes incoming stream messages to per-exchange
//!   receivers.

pub mod channel;
pub mod correlation;

pub use channel::{ChannelError, ControlChannel, ExchangeStream, StreamEvent, StreamSender};
pub use correlation::{CorrelationQueue, ExchangeOutcome, Parked};
