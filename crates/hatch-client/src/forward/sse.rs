//! Server-sent event exchanges: replay the request locally and stream the response body
//! back as raw chunks.

use super::Forwarder;
use futures_util::StreamExt;
use hatch_control::{ExchangeStream, StreamEvent};
use hatch_proto::ChunkKind;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use tracing::debug;

pub struct SseRequest {
    pub target_path: String,
    pub method: String,
    pub content_type: Option<String>,
    pub initial_body: Vec<u8>,
}

pub async fn forward(forwarder: Forwarder, mut stream: ExchangeStream, request: SseRequest) {
    let correlation_id = stream.correlation_id();
    let Ok(method) = Method::from_bytes(request.method.as_bytes()) else {
        debug!("SSE exchange {} has invalid method {}", correlation_id, request.method);
        return;
    };

    let mut local_request = forwarder
        .local_client()
        .request(method, &request.target_path)
        .header(ACCEPT, "text/event-stream");
    if let Some(content_type) = &request.content_type {
        local_request = local_request.header(CONTENT_TYPE, content_type.as_str());
    }
    if !request.initial_body.is_empty() {
        local_request = local_request.body(request.initial_body);
    }

    let response = match local_request.send().await {
        Ok(response) => response,
        Err(e) => {
            debug!("Local SSE source {} unavailable: {}", request.target_path, e);
            return;
        }
    };

    let sender = stream.sender();
    let mut body = response.bytes_stream();
    loop {
        tokio::select! {
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    if sender.send_chunk(ChunkKind::Raw, bytes.to_vec()).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    debug!("SSE source {} broke off: {}", request.target_path, e);
                    return;
                }
                None => {
                    let _ = sender.finish().await;
                    stream.detach();
                    return;
                }
            },
            event = stream.next_event() => {
                if matches!(event, Some(StreamEvent::Cancelled) | None) {
                    debug!("SSE exchange {} abandoned by the caller", correlation_id);
                    return;
                }
            }
        }
    }
}
