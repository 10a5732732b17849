//! Registry of TCP tunnel owners
//!
//! Tracks which control channel serves each TCP owner and which public port the owner
//! was last given. The listening sockets themselves are owned by the TCP proxy.

use crate::ChannelSlot;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

pub struct TcpTunnelRegistry<H> {
    channels: Arc<DashMap<Uuid, ChannelSlot<H>>>,
    ports: Arc<DashMap<Uuid, u16>>,
}

impl<H: Clone> TcpTunnelRegistry<H> {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            ports: Arc::new(DashMap::new()),
        }
    }

    /// Bind the owner's live control channel. Returns the handle it replaces, if any.
    pub fn connect(
        &self,
        owner_id: Uuid,
        connection_id: Uuid,
        handle: H,
    ) -> Option<ChannelSlot<H>> {
        trace!("TCP owner {} connected on {}", owner_id, connection_id);
        self.channels.insert(
            owner_id,
            ChannelSlot {
                connection_id,
                handle,
            },
        )
    }

    pub fn channel(&self, owner_id: &Uuid) -> Option<ChannelSlot<H>> {
        self.channels.get(owner_id).map(|slot| slot.value().clone())
    }

    pub fn set_port(&self, owner_id: Uuid, port: u16) {
        self.ports.insert(owner_id, port);
    }

    pub fn port(&self, owner_id: &Uuid) -> Option<u16> {
        self.ports.get(owner_id).map(|p| *p)
    }

    pub fn clear_port(&self, owner_id: &Uuid) -> Option<u16> {
        self.ports.remove(owner_id).map(|(_, port)| port)
    }

    /// Forget the owner if `connection_id` is still its live connection.
    pub fn on_disconnect(&self, owner_id: &Uuid, connection_id: Uuid) -> bool {
        if self
            .channels
            .remove_if(owner_id, |_, slot| slot.connection_id == connection_id)
            .is_none()
        {
            return false;
        }
        self.ports.remove(owner_id);
        true
    }

    pub fn owner_count(&self) -> usize {
        self.channels.len()
    }
}

impl<H: Clone> Default for TcpTunnelRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
