//! End-to-end: public caller -> relay -> tunnel client -> local server

use axum::extract::ws::{Message as LocalMessage, WebSocket, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use hatch_client::{wait_active, ClientConfig, TunnelClient};
use hatch_server_http::{serve, RelayConfig, RelayState};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const HOST: &str = "e2e.relay.test";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn echo(headers: HeaderMap, body: String) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/plain")
        .to_string();
    (
        StatusCode::CREATED,
        [
            (header::CONTENT_TYPE, content_type),
            (header::HeaderName::from_static("x-backend"), "local".to_string()),
        ],
        format!("echo: {}", body),
    )
}

async fn events() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        "data: one\n\ndata: two\n\n",
    )
}

async fn ws_echo(upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(|mut socket: WebSocket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, LocalMessage::Close(_)) {
                break;
            }
            if socket.send(msg).await.is_err() {
                break;
            }
        }
    })
}

async fn spawn_backend() -> SocketAddr {
    let app = Router::new()
        .route("/echo", post(echo))
        .route("/events", get(events))
        .route("/ws", get(ws_echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn spawn_relay() -> (RelayState, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = RelayState::new(RelayConfig {
        public_host: "relay.test".to_string(),
        tcp_bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..Default::default()
    });
    tokio::spawn(serve(listener, state.clone(), std::future::pending()));
    (state, addr)
}

struct Harness {
    relay: SocketAddr,
    shutdown: CancellationToken,
}

impl Harness {
    async fn http() -> Self {
        init_tracing();
        let backend = spawn_backend().await;
        let (_state, relay) = spawn_relay().await;

        let config = ClientConfig::builder()
            .relay_url(format!("http://{}", relay))
            .local_url(format!("http://{}", backend))
            .subdomain(Some("e2e".to_string()))
            .retry_delay(Duration::from_millis(50))
            .build()
            .unwrap();
        let client = TunnelClient::http(config).unwrap();
        let mut rx = client.state();
        let shutdown = CancellationToken::new();
        tokio::spawn(client.run(shutdown.clone()));

        let url = tokio::time::timeout(Duration::from_secs(10), wait_active(&mut rx))
            .await
            .expect("tunnel never became active");
        assert_eq!(url.as_deref(), Some("http://e2e.relay.test"));
        Self { relay, shutdown }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.relay, path)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_http_round_trip() {
    let harness = Harness::http().await;

    let response = reqwest::Client::new()
        .post(harness.url("/echo"))
        .header(header::HOST.as_str(), HOST)
        .header(header::CONTENT_TYPE.as_str(), "application/json")
        .body(r#"{"hello":"world"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.headers()["x-backend"], "local");
    assert_eq!(response.text().await.unwrap(), r#"echo: {"hello":"world"}"#);
}

#[tokio::test]
async fn test_unknown_host_is_not_found() {
    let harness = Harness::http().await;

    let response = reqwest::Client::new()
        .get(harness.url("/echo"))
        .header(header::HOST.as_str(), "nobody.relay.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_sse_stream() {
    let harness = Harness::http().await;

    let response = reqwest::Client::new()
        .get(harness.url("/events"))
        .header(header::HOST.as_str(), HOST)
        .header(header::ACCEPT.as_str(), "text/event-stream")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let body = tokio::time::timeout(Duration::from_secs(5), response.text())
        .await
        .expect("event stream never ended")
        .unwrap();
    assert_eq!(body, "data: one\n\ndata: two\n\n");
}

#[tokio::test]
async fn test_websocket_echo() {
    let harness = Harness::http().await;

    let mut request = format!("ws://{}/ws", harness.relay)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(header::HOST, HOST.parse().unwrap());
    let (mut public, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    public.send(Message::text("ping")).await.unwrap();
    public
        .send(Message::binary(vec![1u8, 2, 3]))
        .await
        .unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        let msg = tokio::time::timeout(Duration::from_secs(5), public.next())
            .await
            .expect("no echo")
            .unwrap()
            .unwrap();
        received.push(msg);
    }
    assert_eq!(received[0], Message::text("ping"));
    assert_eq!(received[1], Message::binary(vec![1u8, 2, 3]));

    public.close(None).await.unwrap();
}

#[tokio::test]
async fn test_tcp_echo() {
    init_tracing();
    let (state, relay) = spawn_relay().await;

    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = local.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    let config = ClientConfig::builder()
        .relay_url(format!("http://{}", relay))
        .local_url(local_addr.to_string())
        .build()
        .unwrap();
    let owner = config.owner_id;
    let client = TunnelClient::tcp(config).unwrap();
    let mut rx = client.state();
    let shutdown = CancellationToken::new();
    tokio::spawn(client.run(shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(10), wait_active(&mut rx))
        .await
        .expect("tunnel never became active")
        .unwrap();
    let port = state.tcp.port(&owner).unwrap();

    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    public.write_all(b"SELECT 1;").await.unwrap();
    let mut buf = [0u8; 9];
    tokio::time::timeout(Duration::from_secs(5), public.read_exact(&mut buf))
        .await
        .expect("no echo")
        .unwrap();
    assert_eq!(&buf, b"SELECT 1;");

    // Closing the public side ends the exchange once the echo finishes too.
    public.shutdown().await.unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), public.read_to_end(&mut rest))
        .await
        .expect("public connection never closed")
        .unwrap();
    assert!(rest.is_empty());

    shutdown.cancel();
}
