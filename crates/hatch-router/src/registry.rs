//! Subdomain registry for HTTP, WebSocket and SSE tunnels
//!
//! Three concurrent maps back the registry:
//! - subdomain → [`TunnelDescriptor`]
//! - owner → subdomain (reverse index, one live subdomain per owner)
//! - owner → control channel currently serving that owner
//!
//! A lookup only succeeds when both the descriptor and a live channel exist. Disconnect
//! removes the channel first, so a concurrent lookup either sees a complete tunnel or
//! nothing at all.

use crate::host::{
    first_label, generate_subdomain, strip_port, validate_subdomain, SUBDOMAIN_LENGTH,
};
use crate::ChannelSlot;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hatch_proto::target::normalize_base;
use hatch_proto::RegisterTunnelRequest;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

/// A registered subdomain and the local server behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescriptor {
    pub subdomain: String,
    pub owner_id: Uuid,
    /// Local server base URL, without trailing slash
    pub local_base_url: String,
}

/// Outcome of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub subdomain: String,
    pub tunnel_url: String,
}

/// A tunnel together with the channel that currently serves it
#[derive(Debug, Clone)]
pub struct Resolved<H> {
    pub descriptor: TunnelDescriptor,
    pub connection_id: Uuid,
    pub channel: H,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Subdomain {0} is owned by another client")]
    SubdomainTaken(String),
}

/// Naming rules and public URL shape
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Scheme of public tunnel URLs (`http` or `https`)
    pub public_scheme: String,
    /// Public host name of the relay, optionally with port
    pub public_host: String,
    /// Host names that address the relay itself rather than a tunnel
    pub bare_hosts: Vec<String>,
    /// Names never handed out; requests for them get a random subdomain instead
    pub reserved: Vec<String>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            public_scheme: "http".to_string(),
            public_host: "localhost:8080".to_string(),
            bare_hosts: vec!["localhost".to_string()],
            reserved: vec![
                "localhost".to_string(),
                "hatch".to_string(),
                "webhooks".to_string(),
            ],
        }
    }
}

impl RegistrySettings {
    fn is_bare_host(&self, host: &str) -> bool {
        let host = strip_port(host.trim());
        self.bare_hosts
            .iter()
            .any(|bare| bare.eq_ignore_ascii_case(host))
    }

    fn is_reserved(&self, label: &str) -> bool {
        self.reserved.iter().any(|r| r.eq_ignore_ascii_case(label))
    }

    /// Public URL of a subdomain.
    ///
    /// When the relay itself is addressed by a bare host name (local testing), subdomains
    /// cannot be resolved by DNS and the relay URL is returned as is.
    pub fn tunnel_url(&self, subdomain: &str) -> String {
        if self.is_bare_host(&self.public_host) {
            format!("{}://{}", self.public_scheme, self.public_host)
        } else {
            format!("{}://{}.{}", self.public_scheme, subdomain, self.public_host)
        }
    }
}

/// Registry of HTTP-family tunnels, generic over the control channel handle `H`.
pub struct TunnelRegistry<H> {
    tunnels: Arc<DashMap<String, TunnelDescriptor>>,
    owners: Arc<DashMap<Uuid, String>>,
    channels: Arc<DashMap<Uuid, ChannelSlot<H>>>,
    settings: RegistrySettings,
}

impl<H: Clone> TunnelRegistry<H> {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
            owners: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Register (or re-register) a tunnel for an owner.
    ///
    /// Re-registering with the owner's own subdomain overwrites it in place. Asking for a
    /// subdomain held by another owner fails and leaves that owner's tunnel untouched.
    /// A previous subdomain of the same owner is released.
    pub fn register(&self, request: RegisterTunnelRequest) -> Result<Registration, RegistryError> {
        let owner_id = request
            .owner_id
            .ok_or_else(|| RegistryError::InvalidRequest("ownerId is required".to_string()))?;

        let local_base_url = request
            .local_url
            .as_deref()
            .map(normalize_base)
            .unwrap_or_default();
        if local_base_url.is_empty() {
            return Err(RegistryError::InvalidRequest(
                "localUrl is required".to_string(),
            ));
        }

        let requested = match request.subdomain.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let label = validate_subdomain(raw).ok_or_else(|| {
                    RegistryError::InvalidRequest(format!("invalid subdomain: {}", raw))
                })?;
                if self.settings.is_reserved(&label) {
                    debug!("Subdomain {} is reserved, generating a random one", label);
                    None
                } else {
                    Some(label)
                }
            }
        };

        let subdomain = match requested {
            Some(label) => {
                let descriptor = TunnelDescriptor {
                    subdomain: label.clone(),
                    owner_id,
                    local_base_url,
                };
                match self.tunnels.entry(label.clone()) {
                    Entry::Occupied(mut entry) => {
                        if entry.get().owner_id != owner_id {
                            return Err(RegistryError::SubdomainTaken(label));
                        }
                        entry.insert(descriptor);
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(descriptor);
                    }
                }
                label
            }
            None => self.insert_random(owner_id, local_base_url),
        };

        if let Some(previous) = self.owners.insert(owner_id, subdomain.clone()) {
            if previous != subdomain {
                self.tunnels
                    .remove_if(&previous, |_, tunnel| tunnel.owner_id == owner_id);
                trace!("Owner {} released subdomain {}", owner_id, previous);
            }
        }

        debug!("Registered tunnel {} for owner {}", subdomain, owner_id);
        Ok(Registration {
            tunnel_url: self.settings.tunnel_url(&subdomain),
            subdomain,
        })
    }

    fn insert_random(&self, owner_id: Uuid, local_base_url: String) -> String {
        loop {
            let candidate = generate_subdomain(SUBDOMAIN_LENGTH);
            if self.settings.is_reserved(&candidate) {
                continue;
            }
            if let Entry::Vacant(entry) = self.tunnels.entry(candidate.clone()) {
                entry.insert(TunnelDescriptor {
                    subdomain: candidate.clone(),
                    owner_id,
                    local_base_url,
                });
                return candidate;
            }
        }
    }

    /// Bind the owner's live control channel. Returns the handle it replaces, if any.
    pub fn connect(
        &self,
        owner_id: Uuid,
        connection_id: Uuid,
        handle: H,
    ) -> Option<ChannelSlot<H>> {
        trace!("Owner {} connected on {}", owner_id, connection_id);
        self.channels.insert(
            owner_id,
            ChannelSlot {
                connection_id,
                handle,
            },
        )
    }

    /// Resolve a Host header value to a served tunnel.
    ///
    /// The first DNS label is matched exactly. A request on a bare relay host name falls
    /// back to the only registered tunnel, if there is exactly one.
    pub fn resolve(&self, host: &str) -> Option<Resolved<H>> {
        let descriptor = if self.settings.is_bare_host(host) {
            self.sole_tunnel()
        } else {
            self.tunnels
                .get(&first_label(host))
                .map(|entry| entry.value().clone())
        }?;

        let slot = self.channels.get(&descriptor.owner_id)?;
        Some(Resolved {
            connection_id: slot.connection_id,
            channel: slot.handle.clone(),
            descriptor,
        })
    }

    fn sole_tunnel(&self) -> Option<TunnelDescriptor> {
        if self.tunnels.len() != 1 {
            return None;
        }
        self.tunnels.iter().next().map(|entry| entry.value().clone())
    }

    /// Current channel of an owner
    pub fn channel(&self, owner_id: &Uuid) -> Option<ChannelSlot<H>> {
        self.channels.get(owner_id).map(|slot| slot.value().clone())
    }

    pub fn descriptor(&self, subdomain: &str) -> Option<TunnelDescriptor> {
        self.tunnels.get(subdomain).map(|entry| entry.value().clone())
    }

    pub fn subdomain_of(&self, owner_id: &Uuid) -> Option<String> {
        self.owners.get(owner_id).map(|entry| entry.value().clone())
    }

    /// Evict everything the owner holds, provided `connection_id` is still its live
    /// connection. A stale connection's disconnect is a no-op and returns `false`.
    pub fn on_disconnect(&self, owner_id: &Uuid, connection_id: Uuid) -> bool {
        if self
            .channels
            .remove_if(owner_id, |_, slot| slot.connection_id == connection_id)
            .is_none()
        {
            trace!(
                "Ignoring disconnect of superseded connection {} for owner {}",
                connection_id,
                owner_id
            );
            return false;
        }
        self.evict(owner_id);
        true
    }

    /// Drop the owner's tunnel once its channel is gone. The owner may have reconnected
    /// and registered again since; that registration belongs to the new connection.
    fn evict(&self, owner_id: &Uuid) {
        let reconnected = || self.channels.contains_key(owner_id);
        if let Some((_, subdomain)) = self.owners.remove_if(owner_id, |_, _| !reconnected()) {
            self.tunnels.remove_if(&subdomain, |_, tunnel| {
                tunnel.owner_id == *owner_id && !reconnected()
            });
            debug!("Removed tunnel {} of owner {}", subdomain, owner_id);
        } else {
            trace!("Owner {} reconnected, keeping its tunnel", owner_id);
        }
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }
}
