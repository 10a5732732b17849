//! JSON bodies of the registration endpoint

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `POST /tunnel` request body
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTunnelRequest {
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    #[serde(default)]
    pub local_url: Option<String>,
}

/// `POST /tunnel` success body (201)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTunnelResponse {
    pub tunnel_url: String,
    pub subdomain: String,
}

/// Error body returned by the relay's REST surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
