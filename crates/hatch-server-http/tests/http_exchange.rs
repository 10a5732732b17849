//! Registration and the HTTP pull/push exchange, driven through the router

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use hatch_control::ControlChannel;
use hatch_proto::{ExchangeStart, RegisterTunnelResponse, TunnelMessage};
use hatch_server_http::exchange::ExchangeState;
use hatch_server_http::{build_router, RelayConfig, RelayState};
use http_body_util::BodyExt;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn relay(http_timeout: Duration) -> (RelayState, Router) {
    init_tracing();
    let state = RelayState::new(RelayConfig {
        public_host: "relay.test".to_string(),
        http_timeout,
        ..Default::default()
    });
    let router = build_router(state.clone());
    (state, router)
}

async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn register(router: &Router, owner: Uuid, subdomain: &str) -> Response<Body> {
    let body = json!({
        "subdomain": subdomain,
        "ownerId": owner,
        "localUrl": "http://localhost:5000/",
    });
    router
        .clone()
        .oneshot(
            Request::post("/tunnel")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

/// Register `subdomain` and attach a control channel the test reads directly.
async fn connect_owner(
    state: &RelayState,
    router: &Router,
    subdomain: &str,
) -> (Uuid, ControlChannel, mpsc::Receiver<TunnelMessage>) {
    let owner = Uuid::new_v4();
    assert_eq!(
        register(router, owner, subdomain).await.status(),
        StatusCode::CREATED
    );
    let (channel, rx) = ControlChannel::new(owner, 64);
    state.attach_http(channel.clone());
    (owner, channel, rx)
}

fn public_request(host: &str, path: &str) -> Request<Body> {
    Request::post(path)
        .header(header::HOST, host)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-request-id", "abc")
        .body(Body::from(r#"{"name":"widget"}"#))
        .unwrap()
}

async fn next_http_exchange(rx: &mut mpsc::Receiver<TunnelMessage>) -> (Uuid, String, String) {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(TunnelMessage::NewExchange(ExchangeStart::Http {
            correlation_id,
            method,
            target_path,
            ..
        }))) => (correlation_id, method, target_path),
        other => panic!("expected an HTTP exchange, got {:?}", other),
    }
}

#[tokio::test]
async fn test_registration_returns_tunnel_url() {
    let (state, router) = relay(Duration::from_secs(30));
    let owner = Uuid::new_v4();

    let response = register(&router, owner, "demo").await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: RegisterTunnelResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body.subdomain, "demo");
    assert_eq!(body.tunnel_url, "http://demo.relay.test");

    let descriptor = state.registry.descriptor("demo").unwrap();
    assert_eq!(descriptor.local_base_url, "http://localhost:5000");
}

#[tokio::test]
async fn test_registration_rejects_bad_requests() {
    let (state, router) = relay(Duration::from_secs(30));
    let owner = Uuid::new_v4();
    assert_eq!(
        register(&router, owner, "demo").await.status(),
        StatusCode::CREATED
    );

    // Another owner asking for the same name
    let response = register(&router, Uuid::new_v4(), "demo").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.registry.descriptor("demo").unwrap().owner_id, owner);

    // Missing localUrl
    let response = router
        .clone()
        .oneshot(
            Request::post("/tunnel")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "ownerId": owner }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"], "invalid_request");

    // Not JSON at all
    let response = router
        .clone()
        .oneshot(
            Request::post("/tunnel")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("nope"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_disconnected_owner_gets_not_found() {
    let (_state, router) = relay(Duration::from_secs(30));
    assert_eq!(
        register(&router, Uuid::new_v4(), "demo").await.status(),
        StatusCode::CREATED
    );

    let response = router
        .clone()
        .oneshot(
            Request::get("/items")
                .header(header::HOST, "demo.relay.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["message"], "client disconnected");
}

#[tokio::test]
async fn test_pull_push_round_trip() {
    let (state, router) = relay(Duration::from_secs(30));
    let (_owner, _channel, mut rx) = connect_owner(&state, &router, "demo").await;

    let public = tokio::spawn(
        router
            .clone()
            .oneshot(public_request("demo.relay.test", "/items?page=2")),
    );

    let (id, method, target_path) = next_http_exchange(&mut rx).await;
    assert_eq!(method, "POST");
    assert_eq!(target_path, "http://localhost:5000/items?page=2");

    // Pull
    let pulled = router
        .clone()
        .oneshot(
            Request::get(format!("/relay/exchange/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(pulled.status(), StatusCode::OK);
    assert_eq!(pulled.headers()["x-t-method"], "POST");
    assert_eq!(pulled.headers()["x-tr-x-request-id"], "abc");
    assert_eq!(pulled.headers()["x-tc-content-type"], "application/json");
    assert!(pulled.headers().get("x-tr-host").is_none());
    assert_eq!(body_bytes(pulled).await, br#"{"name":"widget"}"#);

    // A second pull is a conflict
    let again = router
        .clone()
        .oneshot(
            Request::get(format!("/relay/exchange/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);

    let exchange = state.http_exchanges.carrier(&id).unwrap();

    // Push
    let pushed = router
        .clone()
        .oneshot(
            Request::post(format!("/relay/exchange/{}", id))
                .header("x-t-status", "201")
                .header("x-tc-content-type", "text/plain; charset=utf-8")
                .header("x-tr-x-served-by", "local")
                .header("x-tr-connection", "close")
                .body(Body::from("created widget"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(pushed.status(), StatusCode::OK);

    let response = public.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    assert_eq!(response.headers()["x-served-by"], "local");
    assert!(response.headers().get(header::CONNECTION).is_none());
    assert_eq!(body_bytes(response).await, b"created widget");
    assert!(state.http_exchanges.is_empty());
    // Reading the body to its end is a completed exchange, not a caller that left.
    assert_eq!(exchange.state(), ExchangeState::Done);
}

#[tokio::test]
async fn test_push_requires_status() {
    let (state, router) = relay(Duration::from_secs(30));
    let (_owner, _channel, mut rx) = connect_owner(&state, &router, "demo").await;
    let _public = tokio::spawn(
        router
            .clone()
            .oneshot(public_request("demo.relay.test", "/")),
    );
    let (id, _, _) = next_http_exchange(&mut rx).await;

    let pushed = router
        .clone()
        .oneshot(
            Request::post(format!("/relay/exchange/{}", id))
                .body(Body::from("no status"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(pushed.status(), StatusCode::BAD_REQUEST);
    assert!(state.http_exchanges.contains(&id));
}

#[tokio::test]
async fn test_unknown_exchange_is_not_found() {
    let (_state, router) = relay(Duration::from_secs(30));
    let id = Uuid::new_v4();

    for request in [
        Request::get(format!("/relay/exchange/{}", id)).body(Body::empty()),
        Request::post(format!("/relay/exchange/{}", id))
            .header("x-t-status", "200")
            .body(Body::empty()),
        Request::delete(format!("/relay/exchange/{}", id)).body(Body::empty()),
    ] {
        let response = router.clone().oneshot(request.unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_owner_abort_is_bad_gateway() {
    let (state, router) = relay(Duration::from_secs(30));
    let (_owner, _channel, mut rx) = connect_owner(&state, &router, "demo").await;
    let public = tokio::spawn(
        router
            .clone()
            .oneshot(public_request("demo.relay.test", "/")),
    );
    let (id, _, _) = next_http_exchange(&mut rx).await;

    let aborted = router
        .clone()
        .oneshot(
            Request::delete(format!("/relay/exchange/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(aborted.status(), StatusCode::OK);

    let response = public.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!state.http_exchanges.fail(id));
}

#[tokio::test]
async fn test_timeout_is_gateway_timeout() {
    let (state, router) = relay(Duration::from_millis(200));
    let (_owner, _channel, mut rx) = connect_owner(&state, &router, "demo").await;
    let public = tokio::spawn(
        router
            .clone()
            .oneshot(public_request("demo.relay.test", "/slow")),
    );
    let (id, _, _) = next_http_exchange(&mut rx).await;

    let response = public.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    // Completing it late is a no-op
    assert!(!state.http_exchanges.resolve(id));
    let late = router
        .clone()
        .oneshot(
            Request::post(format!("/relay/exchange/{}", id))
                .header("x-t-status", "200")
                .body(Body::from("too late"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(late.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_channel_loss_fails_parked_callers() {
    let (state, router) = relay(Duration::from_secs(30));
    let (owner, channel, mut rx) = connect_owner(&state, &router, "demo").await;
    let public = tokio::spawn(
        router
            .clone()
            .oneshot(public_request("demo.relay.test", "/")),
    );
    next_http_exchange(&mut rx).await;

    channel.close();
    state.on_http_disconnect(owner, channel.connection_id());

    let response = public.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(state.http_exchanges.is_empty());
    assert!(state.registry.descriptor("demo").is_none());
}

#[tokio::test]
async fn test_superseded_channel_is_closed() {
    let (state, router) = relay(Duration::from_secs(30));
    let (owner, first, mut first_rx) = connect_owner(&state, &router, "demo").await;
    let public = tokio::spawn(
        router
            .clone()
            .oneshot(public_request("demo.relay.test", "/")),
    );
    next_http_exchange(&mut first_rx).await;

    let (second, mut second_rx) = ControlChannel::new(owner, 64);
    state.attach_http(second.clone());

    assert!(first.is_closed());
    assert!(matches!(
        first_rx.recv().await,
        Some(TunnelMessage::Disconnect { .. })
    ));
    assert_eq!(
        public.await.unwrap().unwrap().status(),
        StatusCode::BAD_GATEWAY
    );

    // The stale connection's cleanup leaves the new one in place.
    state.on_http_disconnect(owner, first.connection_id());
    let _public = tokio::spawn(
        router
            .clone()
            .oneshot(public_request("demo.relay.test", "/")),
    );
    next_http_exchange(&mut second_rx).await;
}

#[tokio::test]
async fn test_health() {
    let (_state, router) = relay(Duration::from_secs(30));
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"ok");
}
