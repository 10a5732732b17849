//! Tunnel registries
//!
//! Maps public names (subdomains for the HTTP family, owners for TCP) to tunnel owners and
//! to the control channel currently serving each owner. Both registries are generic over
//! the channel handle so they can be exercised without a live connection.

pub mod host;
pub mod registry;
pub mod tcp;

pub use host::{first_label, generate_subdomain, strip_port, validate_subdomain};
pub use registry::{
    Registration, RegistryError, RegistrySettings, Resolved, TunnelDescriptor, TunnelRegistry,
};
pub use tcp::TcpTunnelRegistry;

use uuid::Uuid;

/// A control channel bound to one physical connection.
#[derive(Debug, Clone)]
pub struct ChannelSlot<H> {
    pub connection_id: Uuid,
    pub handle: H,
}
