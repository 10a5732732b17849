//! Raw TCP exchanges: one local connection per public connection

use hatch_control::{ControlChannel, ExchangeStream, StreamEvent};
use hatch_proto::{ChunkKind, TunnelMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 32 * 1024;

pub async fn forward(channel: ControlChannel, mut stream: ExchangeStream, local_addr: String) {
    let correlation_id = stream.correlation_id();
    let socket = match TcpStream::connect(&local_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("Local service {} unavailable: {}", local_addr, e);
            return;
        }
    };
    if channel
        .send(TunnelMessage::StreamRequest { correlation_id })
        .await
        .is_err()
    {
        return;
    }

    let sender = stream.sender();
    let (mut reader, mut writer) = socket.into_split();

    let clean = {
        let upstream = async {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    sender.finish().await.map_err(std::io::Error::other)?;
                    return Ok::<(), std::io::Error>(());
                }
                sender
                    .send_chunk(ChunkKind::Raw, buf[..n].to_vec())
                    .await
                    .map_err(std::io::Error::other)?;
            }
        };

        let downstream = async {
            loop {
                match stream.next_event().await {
                    Some(StreamEvent::Chunk { data, .. }) => writer.write_all(&data).await?,
                    Some(StreamEvent::Requested) => {}
                    Some(StreamEvent::End) => {
                        let _ = writer.shutdown().await;
                        return Ok::<(), std::io::Error>(());
                    }
                    Some(StreamEvent::Cancelled) | None => {
                        return Err(std::io::ErrorKind::ConnectionAborted.into());
                    }
                }
            }
        };

        tokio::pin!(upstream);
        tokio::pin!(downstream);
        let mut upstream_done = false;
        let mut downstream_done = false;

        // Each direction may finish on its own; the exchange is over once both have.
        loop {
            tokio::select! {
                result = &mut upstream, if !upstream_done => {
                    upstream_done = true;
                    if let Err(e) = result {
                        debug!("Exchange {} local read ended: {}", correlation_id, e);
                        break false;
                    }
                }
                result = &mut downstream, if !downstream_done => {
                    downstream_done = true;
                    if let Err(e) = result {
                        debug!("Exchange {} relay side ended: {}", correlation_id, e);
                        break false;
                    }
                }
            }
            if upstream_done && downstream_done {
                break true;
            }
        }
    };

    if clean {
        stream.detach();
    }
    debug!("TCP exchange {} to {} closed", correlation_id, local_addr);
}
