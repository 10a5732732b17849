//! Public entry point for tunneled traffic
//!
//! Every request that does not hit one of the relay's own routes lands here. The tunnel
//! is resolved from the Host header, then the request is relayed as a WebSocket session,
//! a server-sent-events stream or a plain HTTP exchange.

use crate::error::RelayError;
use crate::exchange::{ExchangeState, HttpExchange};
use crate::state::RelayState;
use crate::{sse, websocket};
use axum::body::Body;
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::{header, request::Parts, HeaderMap, Response};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use hatch_control::{ControlChannel, ExchangeOutcome, Parked};
use hatch_proto::{target, ExchangeStart, TunnelMessage};
use hatch_router::Resolved;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Fallback handler for all tunneled traffic.
pub async fn handle_public(State(state): State<RelayState>, request: Request) -> Response<Body> {
    let (mut parts, body) = request.into_parts();

    let Some(host) = request_host(&parts) else {
        return RelayError::InvalidRequest("missing Host header".to_string()).into_response();
    };
    let Some(resolved) = state.registry.resolve(&host) else {
        debug!("No live tunnel for host {}", host);
        return RelayError::client_disconnected().into_response();
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let target_path = target::join(&resolved.descriptor.local_base_url, &path_and_query);

    if is_websocket_upgrade(&parts.headers) {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => websocket::relay(state, resolved, upgrade, target_path),
            Err(rejection) => rejection.into_response(),
        };
    }

    if accepts_event_stream(&parts.headers) {
        return sse::relay(state, resolved, parts, body, target_path)
            .await
            .into_response();
    }

    relay_http(state, resolved, parts, body, target_path)
        .await
        .into_response()
}

/// Relay one plain HTTP request: park it, notify the owner, and wait for the pushed
/// response, the owner's abort, or the timeout.
async fn relay_http(
    state: RelayState,
    resolved: Resolved<ControlChannel>,
    parts: Parts,
    body: Body,
    target_path: String,
) -> Result<Response<Body>, RelayError> {
    let correlation_id = Uuid::new_v4();
    let method = parts.method.clone();
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (exchange, mut response_rx) = HttpExchange::new(parts.method, parts.headers, body);
    let exchange = Arc::new(exchange);
    let mut parked = state.http_exchanges.park(
        correlation_id,
        resolved.descriptor.owner_id,
        resolved.connection_id,
        exchange.clone(),
        Some(state.config.http_timeout),
    );

    debug!(
        "Exchange {}: {} {} via {}",
        correlation_id, method, target_path, resolved.descriptor.subdomain
    );
    resolved
        .channel
        .send(TunnelMessage::NewExchange(ExchangeStart::Http {
            correlation_id,
            method: method.to_string(),
            content_type,
            target_path,
        }))
        .await
        .map_err(|_| RelayError::client_disconnected())?;
    exchange.advance(ExchangeState::Pushed);

    let outcome = tokio::select! {
        biased;
        response = &mut response_rx => match response {
            Ok(response) => return Ok(hold_until_consumed(response, parked, exchange)),
            Err(_) => parked.wait().await,
        },
        outcome = parked.wait() => outcome,
    };

    match outcome {
        ExchangeOutcome::TimedOut => {
            exchange.advance(ExchangeState::TimedOut);
            Err(RelayError::Timeout)
        }
        ExchangeOutcome::Failed => {
            exchange.advance(ExchangeState::Errored);
            Err(RelayError::UpstreamForwardingFailure(
                "tunnel client could not complete the request".to_string(),
            ))
        }
        // Either nobody is listening any more, or the owner finished without a response.
        ExchangeOutcome::Cancelled | ExchangeOutcome::Completed => {
            exchange.advance(ExchangeState::Errored);
            Err(RelayError::UpstreamForwardingFailure(
                "tunnel client sent no response".to_string(),
            ))
        }
    }
}

/// Keep the exchange parked for as long as the caller is reading the response body,
/// so a caller that goes away before the owner's push completed cancels it.
fn hold_until_consumed(
    response: Response<Body>,
    parked: Parked<HttpExchange>,
    exchange: Arc<HttpExchange>,
) -> Response<Body> {
    let guard = CallerGuard { parked, exchange };
    let (parts, body) = response.into_parts();
    let guarded = body.into_data_stream().map(move |frame| {
        let _guard = &guard;
        frame
    });
    Response::from_parts(parts, Body::from_stream(guarded))
}

struct CallerGuard {
    parked: Parked<HttpExchange>,
    exchange: Arc<HttpExchange>,
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        if !self.parked.is_settled() {
            self.exchange.advance(ExchangeState::Errored);
        }
    }
}

/// Host the caller addressed: the Host header, or the URI authority for HTTP/2.
pub(crate) fn request_host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
}

pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    upgrade && connection
}

pub(crate) fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("text/event-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(
            header::CONNECTION,
            HeaderValue::from_static("keep-alive, Upgrade"),
        );
        assert!(is_websocket_upgrade(&headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn test_event_stream_detection() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_event_stream(&headers));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
        assert!(accepts_event_stream(&headers));
    }
}
