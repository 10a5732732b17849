//! Local forwarding of relayed exchanges
//!
//! Each exchange runs in its own task. A failing exchange is reported to the relay and
//! logged; it never affects the control connection.

pub mod http;
pub mod sse;
pub mod tcp;
pub mod ws;

use crate::error::ClientError;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP clients shared by all exchanges of a tunnel
#[derive(Debug, Clone)]
pub struct Forwarder {
    relay_base: Url,
    relay: reqwest::Client,
    local: reqwest::Client,
}

impl Forwarder {
    pub fn new(relay_base: Url) -> Result<Self, ClientError> {
        let relay = reqwest::Client::builder()
            .connect_timeout(RELAY_CONNECT_TIMEOUT)
            .build()?;
        // Self-signed local certificates are accepted; redirects go back to the caller.
        let local = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            relay_base,
            relay,
            local,
        })
    }

    pub fn relay_base(&self) -> &Url {
        &self.relay_base
    }

    pub fn relay_client(&self) -> &reqwest::Client {
        &self.relay
    }

    pub fn local_client(&self) -> &reqwest::Client {
        &self.local
    }

    /// `{relay}/relay/exchange/{id}`
    pub fn exchange_url(&self, correlation_id: Uuid) -> Result<Url, ClientError> {
        Ok(self.relay_base.join(&format!(
            "{}/{}",
            hatch_proto::EXCHANGE_PATH_PREFIX,
            correlation_id
        ))?)
    }
}

/// WebSocket URL of a control endpoint on the relay
pub fn control_url(relay_base: &Url, path: &str, owner_id: Uuid) -> Result<Url, ClientError> {
    let mut url = Url::parse(&hatch_proto::target::to_websocket(relay_base.as_str())?)?;
    url.set_path(path);
    url.query_pairs_mut()
        .clear()
        .append_pair(hatch_proto::OWNER_ID_PARAM, &owner_id.to_string());
    Ok(url)
}
