//! HTTP exchanges and the pull/push side-channel
//!
//! A public HTTP request is parked as an [`HttpExchange`]. The owner pulls it with
//! `GET /relay/exchange/{id}`, calls its local server, and pushes the result with
//! `POST /relay/exchange/{id}`, or reports failure with `DELETE`.
//!
//! ```text
//! New -> Pushed -> BodyPulled -> Responded -> Done
//!   \________\__________\______> TimedOut | Errored
//! ```

use crate::error::RelayError;
use crate::state::RelayState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, Method, Response, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use hatch_proto::headers;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};
use uuid::Uuid;

/// Buffered frames between the owner's push and the caller's response body
const RESPONSE_BODY_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    New,
    Pushed,
    BodyPulled,
    Responded,
    Done,
    TimedOut,
    Errored,
}

impl ExchangeState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeState::Done | ExchangeState::TimedOut | ExchangeState::Errored
        )
    }
}

/// The public request, held until the owner pulls it
struct PendingRequest {
    method: Method,
    headers: HeaderMap,
    body: Body,
}

/// Carrier of one parked HTTP exchange
pub struct HttpExchange {
    state: Mutex<ExchangeState>,
    request: Mutex<Option<PendingRequest>>,
    responder: Mutex<Option<oneshot::Sender<Response<Body>>>>,
}

impl HttpExchange {
    /// Wrap a public request. The receiver yields the response once the owner pushes it.
    pub fn new(
        method: Method,
        headers: HeaderMap,
        body: Body,
    ) -> (Self, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        let exchange = Self {
            state: Mutex::new(ExchangeState::New),
            request: Mutex::new(Some(PendingRequest {
                method,
                headers,
                body,
            })),
            responder: Mutex::new(Some(tx)),
        };
        (exchange, rx)
    }

    pub fn state(&self) -> ExchangeState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Move to `next` unless the exchange already reached a terminal state.
    pub fn advance(&self, next: ExchangeState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    fn take_request(&self) -> Option<PendingRequest> {
        self.request.lock().ok().and_then(|mut request| request.take())
    }

    fn take_responder(&self) -> Option<oneshot::Sender<Response<Body>>> {
        self.responder
            .lock()
            .ok()
            .and_then(|mut responder| responder.take())
    }
}

/// `GET /relay/exchange/{id}`: hand the parked request to the owner.
pub async fn pull(
    State(state): State<RelayState>,
    Path(id): Path<Uuid>,
) -> Result<Response<Body>, RelayError> {
    let exchange = state
        .http_exchanges
        .carrier(&id)
        .ok_or_else(RelayError::unknown_exchange)?;
    let request = exchange.take_request().ok_or(RelayError::AlreadyPulled)?;
    if !exchange.advance(ExchangeState::BodyPulled) {
        return Err(RelayError::unknown_exchange());
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(headers::METHOD_HEADER, request.method.as_str());
    for (name, value) in request.headers.iter() {
        if let Some(wrapped) = headers::wrap(name.as_str()) {
            builder = builder.header(wrapped, value.clone());
        }
    }
    if let Some(content_type) = request.headers.get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type.clone());
    }

    trace!("Exchange {} pulled ({})", id, request.method);
    builder
        .body(request.body)
        .map_err(|e| RelayError::Internal(e.to_string()))
}

/// `POST /relay/exchange/{id}`: stream the owner's response into the parked caller.
///
/// The exchange is only resolved once the whole body has been handed to the caller's
/// response stream.
pub async fn push(
    State(state): State<RelayState>,
    Path(id): Path<Uuid>,
    pushed_headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, RelayError> {
    let queue = &state.http_exchanges;
    let exchange = queue.carrier(&id).ok_or_else(RelayError::unknown_exchange)?;

    let status = pushed_headers
        .get(headers::STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            RelayError::InvalidRequest(format!("missing or invalid {}", headers::STATUS_HEADER))
        })?;

    // From here on the response may take as long as its body needs.
    queue.disarm_timeout(&id);
    if !queue.contains(&id) || !exchange.advance(ExchangeState::Responded) {
        return Err(RelayError::unknown_exchange());
    }
    let responder = exchange.take_responder().ok_or(RelayError::AlreadyPulled)?;

    let mut builder = Response::builder().status(status);
    for (name, value) in pushed_headers.iter() {
        let Some(original) = headers::unwrap(name.as_str()) else {
            continue;
        };
        if let Ok(original) = HeaderName::from_bytes(original.as_bytes()) {
            builder = builder.header(original, value.clone());
        }
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(RESPONSE_BODY_BUFFER);
    let response = builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;

    if responder.send(response).is_err() {
        queue.force_cancel(id);
        return Err(RelayError::unknown_exchange());
    }

    let mut frames = body.into_data_stream();
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    debug!("Caller of exchange {} stopped reading", id);
                    exchange.advance(ExchangeState::Errored);
                    queue.force_cancel(id);
                    return Ok(StatusCode::OK);
                }
            }
            Err(e) => {
                debug!("Owner's body for exchange {} broke off: {}", id, e);
                let _ = tx
                    .send(Err(std::io::Error::other("tunnel response interrupted")))
                    .await;
                exchange.advance(ExchangeState::Errored);
                queue.fail(id);
                return Err(RelayError::UpstreamForwardingFailure(e.to_string()));
            }
        }
    }
    // Resolved while the body is still open, so the caller's end of body never sees
    // an unsettled exchange.
    exchange.advance(ExchangeState::Done);
    queue.resolve(id);
    drop(tx);
    trace!("Exchange {} responded with {}", id, status);
    Ok(StatusCode::OK)
}

/// `DELETE /relay/exchange/{id}`: the owner could not reach its local server.
pub async fn abort(
    State(state): State<RelayState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, RelayError> {
    let exchange = state
        .http_exchanges
        .carrier(&id)
        .ok_or_else(RelayError::unknown_exchange)?;
    exchange.advance(ExchangeState::Errored);
    if !state.http_exchanges.fail(id) {
        return Err(RelayError::unknown_exchange());
    }
    debug!("Owner aborted exchange {}", id);
    Ok(StatusCode::OK)
}
