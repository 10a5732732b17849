//! Client configuration

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Tunnel client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the relay, e.g. `https://relay.example.com`
    pub relay_url: String,
    /// Identity of this owner towards the relay
    pub owner_id: Uuid,
    /// Local server: a URL for HTTP tunnels, `host:port` for TCP tunnels
    pub local_url: String,
    /// Preferred subdomain (HTTP tunnels)
    pub subdomain: Option<String>,
    /// Preferred public port (TCP tunnels)
    pub public_port: Option<u16>,
    /// Pause between failed connect or register attempts
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Upper bound of the random pause before reconnecting after channel loss
    #[serde(with = "duration_millis")]
    pub reconnect_jitter: Duration,
    /// Outgoing message queue of the control channel
    pub channel_capacity: usize,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: String::new(),
            owner_id: Uuid::new_v4(),
            local_url: String::new(),
            subdomain: None,
            public_port: None,
            retry_delay: Duration::from_secs(5),
            reconnect_jitter: Duration::from_secs(5),
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Parsed relay base URL
    pub fn relay_base(&self) -> Result<Url, ClientError> {
        let url = Url::parse(&self.relay_url)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ClientError::Config(format!(
                "relay URL must be http or https, got {}",
                other
            ))),
        }
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.config.relay_url = url.into();
        self
    }

    pub fn owner_id(mut self, owner_id: Uuid) -> Self {
        self.config.owner_id = owner_id;
        self
    }

    pub fn local_url(mut self, url: impl Into<String>) -> Self {
        self.config.local_url = url.into();
        self
    }

    pub fn subdomain(mut self, subdomain: Option<String>) -> Self {
        self.config.subdomain = subdomain;
        self
    }

    pub fn public_port(mut self, port: Option<u16>) -> Self {
        self.config.public_port = port;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.config.reconnect_jitter = jitter;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ClientError> {
        if self.config.relay_url.is_empty() {
            return Err(ClientError::Config("relay URL is required".to_string()));
        }
        if self.config.local_url.is_empty() {
            return Err(ClientError::Config("local URL is required".to_string()));
        }
        self.config.relay_base()?;
        Ok(self.config)
    }
}
