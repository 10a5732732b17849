//! Server-sent events relay
//!
//! Push-only half of the streamed exchange: the request body is read once and handed
//! to the owner with the exchange start, after which every owner chunk becomes one
//! frame of the public response body. Hyper writes each frame out as soon as it is
//! produced.

use crate::error::RelayError;
use crate::state::{RelayState, StreamCarrier};
use axum::body::Body;
use axum::http::{header, request::Parts, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use futures_util::stream;
use hatch_control::{ControlChannel, CorrelationQueue, ExchangeStream, Parked, StreamEvent};
use hatch_proto::{ExchangeStart, TunnelMessage};
use hatch_router::Resolved;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub async fn relay(
    state: RelayState,
    resolved: Resolved<ControlChannel>,
    parts: Parts,
    body: Body,
    target_path: String,
) -> Result<Response<Body>, RelayError> {
    let initial_body = axum::body::to_bytes(body, state.config.sse_body_limit)
        .await
        .map_err(|e| RelayError::InvalidRequest(format!("unreadable request body: {}", e)))?;

    let correlation_id = Uuid::new_v4();
    let channel = resolved.channel;
    let stream = channel.open_stream(correlation_id);
    let parked = state.stream_exchanges.park(
        correlation_id,
        resolved.descriptor.owner_id,
        resolved.connection_id,
        Arc::new(StreamCarrier {
            kind: "sse",
            target: target_path.clone(),
        }),
        None,
    );

    debug!("SSE exchange {} -> {}", correlation_id, target_path);
    channel
        .send(TunnelMessage::NewExchange(ExchangeStart::Sse {
            correlation_id,
            target_path,
            method: parts.method.to_string(),
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            initial_body: initial_body.to_vec(),
        }))
        .await
        .map_err(|_| RelayError::client_disconnected())?;

    let events = EventPump {
        stream,
        parked,
        queue: state.stream_exchanges.clone(),
    };
    let body = stream::unfold(events, |mut pump| async move {
        let chunk = pump.next_chunk().await?;
        Some((Ok::<Bytes, std::io::Error>(chunk), pump))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(header::CONNECTION, HeaderValue::from_static("keep-alive"))
        .body(Body::from_stream(body))
        .map_err(|e| RelayError::Internal(e.to_string()))
}

/// Owns the exchange for as long as the public response body is being read. Dropping
/// it (caller went away) cancels the exchange on both sides.
struct EventPump {
    stream: ExchangeStream,
    parked: Parked<StreamCarrier>,
    queue: CorrelationQueue<StreamCarrier>,
}

impl EventPump {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            match self.stream.next_event().await {
                Some(StreamEvent::Chunk { data, .. }) => return Some(Bytes::from(data)),
                Some(StreamEvent::Requested) => continue,
                Some(StreamEvent::End) => {
                    self.queue.resolve(self.parked.correlation_id());
                    return None;
                }
                Some(StreamEvent::Cancelled) | None => {
                    debug!(
                        "SSE exchange {} ended by the tunnel",
                        self.parked.correlation_id()
                    );
                    return None;
                }
            }
        }
    }
}
