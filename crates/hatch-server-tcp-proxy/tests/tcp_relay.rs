//! Public TCP listener behavior against a simulated tunnel owner

use hatch_control::{ControlChannel, ExchangeStream, StreamEvent};
use hatch_proto::{ChunkKind, ExchangeStart, TunnelMessage};
use hatch_router::TcpTunnelRegistry;
use hatch_server_tcp_proxy::{TcpProxyConfig, TcpProxyError, TcpProxyManager};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn manager() -> TcpProxyManager {
    TcpProxyManager::new(
        TcpProxyConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            public_host: "relay.test".to_string(),
        },
        Arc::new(TcpTunnelRegistry::new()),
    )
}

#[derive(Clone)]
enum OwnerBehavior {
    /// Accept every connection and echo bytes back upper-cased
    Uppercase,
    /// Refuse every connection, as if the local server were down
    Refuse,
    /// Send a greeting and end the owner's direction at once, then report what the
    /// public side sends: each chunk, then `None` for its end
    Greet(mpsc::UnboundedSender<Option<Vec<u8>>>),
}

/// Plays the owner: a second control channel wired back to back with the relay's, so
/// both directions run under the same credit rules as a real client.
fn spawn_owner(
    relay: ControlChannel,
    mut rx: mpsc::Receiver<TunnelMessage>,
    behavior: OwnerBehavior,
) -> tokio::task::JoinHandle<()> {
    let (owner, mut owner_rx) = ControlChannel::new(relay.owner_id(), 256);
    tokio::spawn(async move {
        while let Some(msg) = owner_rx.recv().await {
            relay.dispatch(msg).await;
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Some(TunnelMessage::NewExchange(ExchangeStart::Tcp { correlation_id })) =
                owner.dispatch(msg).await
            else {
                continue;
            };
            if matches!(behavior, OwnerBehavior::Refuse) {
                let _ = owner
                    .send(TunnelMessage::StreamCancel { correlation_id })
                    .await;
                continue;
            }
            let stream = owner.open_stream(correlation_id);
            let _ = owner
                .send(TunnelMessage::StreamRequest { correlation_id })
                .await;
            match &behavior {
                OwnerBehavior::Greet(seen) => {
                    tokio::spawn(greet(stream, seen.clone()));
                }
                _ => {
                    tokio::spawn(uppercase(stream));
                }
            }
        }
    })
}

async fn uppercase(mut stream: ExchangeStream) {
    let sender = stream.sender();
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::Chunk { data, .. } => {
                if sender
                    .send_chunk(ChunkKind::Raw, data.to_ascii_uppercase())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            StreamEvent::End => {
                let _ = sender.finish().await;
                stream.detach();
                return;
            }
            StreamEvent::Requested => {}
            StreamEvent::Cancelled => return,
        }
    }
}

async fn greet(mut stream: ExchangeStream, seen: mpsc::UnboundedSender<Option<Vec<u8>>>) {
    let sender = stream.sender();
    if sender.send_chunk(ChunkKind::Raw, b"banner".to_vec()).await.is_err()
        || sender.finish().await.is_err()
    {
        return;
    }
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::Chunk { data, .. } => {
                let _ = seen.send(Some(data));
            }
            StreamEvent::End => {
                let _ = seen.send(None);
                stream.detach();
                return;
            }
            StreamEvent::Requested => {}
            StreamEvent::Cancelled => return,
        }
    }
}

fn connect_owner(manager: &TcpProxyManager, behavior: OwnerBehavior) -> (Uuid, ControlChannel) {
    let owner = Uuid::new_v4();
    let (channel, rx) = ControlChannel::new(owner, 256);
    manager.attach(channel.clone());
    spawn_owner(channel.clone(), rx, behavior);
    (owner, channel)
}

#[tokio::test]
async fn test_bytes_round_trip_in_order() {
    init_tracing();
    let manager = manager();
    let (owner, _channel) = connect_owner(&manager, OwnerBehavior::Uppercase);

    let registration = manager.register(owner, None).await.unwrap();
    assert_eq!(
        registration.tunnel_url,
        format!("tcp://relay.test:{}", registration.port)
    );

    let mut client = TcpStream::connect(("127.0.0.1", registration.port))
        .await
        .unwrap();
    client.write_all(b"hello tunnel").await.unwrap();
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"HELLO TUNNEL");

    // A payload far larger than one read buffer arrives unmodified and in order.
    let payload: Vec<u8> = (0..200_000).map(|i| b'a' + (i % 26) as u8).collect();
    let expected = payload.to_ascii_uppercase();
    let (mut read_half, mut write_half) = client.into_split();
    let writer = tokio::spawn(async move {
        write_half.write_all(&payload).await.unwrap();
        write_half.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), read_half.read_to_end(&mut received))
        .await
        .expect("relay stalled")
        .unwrap();
    writer.await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_public_side_keeps_sending_after_owner_finishes() {
    init_tracing();
    let manager = manager();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let (owner, _channel) = connect_owner(&manager, OwnerBehavior::Greet(seen_tx));
    let registration = manager.register(owner, None).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", registration.port))
        .await
        .unwrap();
    let mut banner = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut banner))
        .await
        .expect("owner's end never reached the public side")
        .unwrap();
    assert_eq!(banner, b"banner");

    // Only the owner's direction is closed; the public side can still talk.
    client.write_all(b"after").await.unwrap();
    client.shutdown().await.unwrap();

    let mut received = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("owner stopped hearing from the public side")
            .expect("exchange was cancelled");
        match next {
            Some(data) => received.extend(data),
            None => break,
        }
    }
    assert_eq!(received, b"after");

    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("finished connection was never released");
}

#[tokio::test]
async fn test_register_requires_channel() {
    let manager = manager();
    let err = manager.register(Uuid::new_v4(), None).await.unwrap_err();
    assert!(matches!(err, TcpProxyError::NotConnected(_)));
}

#[tokio::test]
async fn test_sticky_port_is_reused() {
    init_tracing();
    let manager = manager();
    let (owner, _channel) = connect_owner(&manager, OwnerBehavior::Uppercase);

    let first = manager.register(owner, None).await.unwrap();
    let second = manager.register(owner, Some(first.port)).await.unwrap();
    assert_eq!(first.port, second.port);
    assert_eq!(manager.listener_count(), 1);
    assert_eq!(manager.registry().port(&owner), Some(first.port));
}

#[tokio::test]
async fn test_connection_dropped_without_channel() {
    init_tracing();
    let manager = manager();
    let (owner, channel) = connect_owner(&manager, OwnerBehavior::Uppercase);
    let registration = manager.register(owner, None).await.unwrap();

    // Channel gone but listener still up: accepted sockets are dropped.
    manager
        .registry()
        .on_disconnect(&owner, channel.connection_id());

    let mut client = TcpStream::connect(("127.0.0.1", registration.port))
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("socket was not dropped");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(manager.connection_count(), 0);
}

#[tokio::test]
async fn test_refused_connection_is_closed() {
    init_tracing();
    let manager = manager();
    let (owner, _channel) = connect_owner(&manager, OwnerBehavior::Refuse);
    let registration = manager.register(owner, None).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", registration.port))
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("refused socket stayed open");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_disconnect_tears_down_listener_and_sockets() {
    init_tracing();
    let manager = manager();
    let (owner, channel) = connect_owner(&manager, OwnerBehavior::Uppercase);
    let registration = manager.register(owner, None).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", registration.port))
        .await
        .unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(manager.connections_of(&owner), 1);

    channel.close();
    assert!(manager.on_disconnect(owner, channel.connection_id()));
    assert_eq!(manager.listener_count(), 0);
    assert_eq!(manager.registry().port(&owner), None);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("relayed socket stayed open");
    assert!(matches!(read, Ok(0) | Err(_)));

    // The listening socket goes away once the aborted accept loop is dropped.
    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", registration.port))
            .await
            .is_err()
        {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "listener still accepting after teardown");
}

#[tokio::test]
async fn test_stale_disconnect_keeps_listener() {
    init_tracing();
    let manager = manager();
    let owner = Uuid::new_v4();

    let (old, old_rx) = ControlChannel::new(owner, 256);
    manager.attach(old.clone());
    spawn_owner(old.clone(), old_rx, OwnerBehavior::Uppercase);
    let registration = manager.register(owner, None).await.unwrap();

    let (new, new_rx) = ControlChannel::new(owner, 256);
    manager.attach(new.clone());
    spawn_owner(new.clone(), new_rx, OwnerBehavior::Uppercase);
    assert!(old.is_closed());

    assert!(!manager.on_disconnect(owner, old.connection_id()));
    assert_eq!(manager.port(&owner), Some(registration.port));

    let mut client = TcpStream::connect(("127.0.0.1", registration.port))
        .await
        .unwrap();
    client.write_all(b"again").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"AGAIN");
}
