//! Relay configuration

use hatch_router::RegistrySettings;
use hatch_server_tcp_proxy::TcpProxyConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the public HTTP listener binds to
    pub bind: SocketAddr,
    /// Public host name (optionally with port) tunnels are served under
    pub public_host: String,
    /// Scheme of public tunnel URLs
    pub public_scheme: String,
    /// Host names addressing the relay itself
    pub bare_hosts: Vec<String>,
    /// Subdomains never handed out to owners
    pub reserved_subdomains: Vec<String>,
    /// How long a public HTTP caller waits for the owner to start responding
    #[serde(with = "duration_secs")]
    pub http_timeout: Duration,
    /// Ping interval on control channels
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// Largest request body forwarded as the initial body of an SSE exchange
    pub sse_body_limit: usize,
    /// Address per-owner TCP listeners bind to
    pub tcp_bind_ip: IpAddr,
    /// Host reported in TCP tunnel URLs; defaults to `public_host` without port
    pub tcp_public_host: Option<String>,
    /// Outgoing message queue per control channel
    pub channel_capacity: usize,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let registry = RegistrySettings::default();
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            public_host: registry.public_host,
            public_scheme: registry.public_scheme,
            bare_hosts: registry.bare_hosts,
            reserved_subdomains: registry.reserved,
            http_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            sse_body_limit: 1024 * 1024,
            tcp_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_public_host: None,
            channel_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            public_scheme: self.public_scheme.clone(),
            public_host: self.public_host.clone(),
            bare_hosts: self.bare_hosts.clone(),
            reserved: self.reserved_subdomains.clone(),
        }
    }

    pub fn tcp_proxy_config(&self) -> TcpProxyConfig {
        let public_host = self
            .tcp_public_host
            .clone()
            .unwrap_or_else(|| hatch_router::strip_port(&self.public_host).to_string());
        TcpProxyConfig {
            bind_ip: self.tcp_bind_ip,
            public_host,
        }
    }
}
