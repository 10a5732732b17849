//! Plain HTTP exchanges: pull the request from the relay, call the local server, push the
//! response back. Bodies are streamed in both directions.

use super::Forwarder;
use crate::error::ClientError;
use hatch_proto::headers;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::{Body, Method};
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub async fn forward(
    forwarder: Forwarder,
    correlation_id: Uuid,
    method: String,
    target_path: String,
) {
    match exchange(&forwarder, correlation_id, &method, &target_path).await {
        Ok(status) => trace!(
            "{} {} -> {} (exchange {})",
            method,
            target_path,
            status,
            correlation_id
        ),
        Err(e) => {
            warn!("{} {} failed: {}", method, target_path, e);
            abort(&forwarder, correlation_id).await;
        }
    }
}

async fn exchange(
    forwarder: &Forwarder,
    correlation_id: Uuid,
    announced_method: &str,
    target_path: &str,
) -> Result<u16, ClientError> {
    let exchange_url = forwarder.exchange_url(correlation_id)?;

    let pulled = forwarder
        .relay_client()
        .get(exchange_url.clone())
        .send()
        .await?
        .error_for_status()?;

    let method = pulled
        .headers()
        .get(headers::METHOD_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(announced_method);
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| ClientError::Protocol(format!("invalid method {}", method)))?;

    let mut request_headers = unwrap_headers(pulled.headers());
    let body = match pulled.content_length() {
        Some(0) => None,
        Some(len) => {
            request_headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            Some(Body::wrap_stream(pulled.bytes_stream()))
        }
        None => Some(Body::wrap_stream(pulled.bytes_stream())),
    };

    let mut local_request = forwarder
        .local_client()
        .request(method, target_path)
        .headers(request_headers);
    if let Some(body) = body {
        local_request = local_request.body(body);
    }
    let local_response = local_request.send().await?;
    let status = local_response.status().as_u16();

    let mut response_headers = wrap_headers(local_response.headers());
    response_headers.insert(
        HeaderName::from_static(headers::STATUS_HEADER),
        HeaderValue::from(status),
    );

    forwarder
        .relay_client()
        .post(exchange_url)
        .headers(response_headers)
        .body(Body::wrap_stream(local_response.bytes_stream()))
        .send()
        .await?
        .error_for_status()?;
    Ok(status)
}

async fn abort(forwarder: &Forwarder, correlation_id: Uuid) {
    let Ok(url) = forwarder.exchange_url(correlation_id) else {
        return;
    };
    if let Err(e) = forwarder.relay_client().delete(url).send().await {
        debug!("Could not abort exchange {}: {}", correlation_id, e);
    }
}

/// Original headers of a pulled request
fn unwrap_headers(pulled: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in pulled.iter() {
        let Some(original) = headers::unwrap(name.as_str()) else {
            continue;
        };
        if let Ok(original) = HeaderName::from_bytes(original.as_bytes()) {
            out.append(original, value.clone());
        }
    }
    out
}

/// Side-channel form of a local response's headers
fn wrap_headers(local: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in local.iter() {
        let Some(wrapped) = headers::wrap(name.as_str()) else {
            continue;
        };
        if let Ok(wrapped) = HeaderName::from_bytes(wrapped.as_bytes()) {
            out.append(wrapped, value.clone());
        }
    }
    out
}
