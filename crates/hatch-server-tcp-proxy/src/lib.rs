//! Per-owner public TCP listeners
//!
//! Every TCP tunnel owner gets one listening socket. Each accepted connection becomes a
//! streamed exchange on the owner's control channel.

pub mod server;

pub use server::{TcpProxyConfig, TcpProxyError, TcpProxyManager, TcpRegistration};
