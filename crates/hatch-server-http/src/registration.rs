//! `POST /tunnel`

use crate::error::RelayError;
use crate::state::RelayState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use hatch_proto::{RegisterTunnelRequest, RegisterTunnelResponse};
use tracing::info;

/// Claim (or re-claim) a subdomain for an owner.
pub async fn register(
    State(state): State<RelayState>,
    request: Result<Json<RegisterTunnelRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterTunnelResponse>), RelayError> {
    let Json(request) = request.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;
    let owner_id = request.owner_id;

    let registration = state.registry.register(request)?;
    if let Some(owner_id) = owner_id {
        info!("Owner {} registered {}", owner_id, registration.tunnel_url);
    }

    Ok((
        StatusCode::CREATED,
        Json(RegisterTunnelResponse {
            tunnel_url: registration.tunnel_url,
            subdomain: registration.subdomain,
        }),
    ))
}
