//! Owns the danmaku TCP connection lifecycle: endpoint selection, auth
//! handshake, heartbeats, the read loop and reconnection.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::LiveEndpoint;
use crate::settings::{HEARTBEAT_INTERVAL, READ_YIELD, RECONNECT_DELAY};

use super::codec::{encode_frame, read_messages};
use super::{AuthPayload, Event, OP_AUTH, OP_HEARTBEAT, TYPE_UNCOMPRESSED_NORMAL};

pub struct Stream {
    pub room_id: i64,
    uid: i64,
    token: String,
    endpoints: Vec<LiveEndpoint>,
    /// Round-robin cursor, advanced on every (re)connect.
    next_endpoint: usize,
}

impl Stream {
    pub fn new(room_id: i64, uid: i64, token: String, endpoints: Vec<LiveEndpoint>) -> Self {
        assert!(!endpoints.is_empty(), "endpoint list must not be empty");

        Self {
            room_id,
            uid,
            token,
            endpoints,
            next_endpoint: 0,
        }
    }

    /// Run the connection state machine until `cancel` fires, forwarding
    /// decoded events into `events`. Transient failures close the connection,
    /// wait 5 seconds and move to the next endpoint.
    pub async fn run(mut self, cancel: CancellationToken, events: mpsc::Sender<Event>) {
        loop {
            if cancel.is_cancelled() {
                info!("leaving danmaku stream");
                return;
            }

            let endpoint = self.endpoints[self.next_endpoint].clone();
            self.next_endpoint = (self.next_endpoint + 1) % self.endpoints.len();

            let conn = match TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(
                        error = %e,
                        host = %endpoint.host,
                        port = endpoint.port,
                        "failed to connect to danmaku server, retrying another in 5s"
                    );
                    if sleep_or_cancel(&cancel, RECONNECT_DELAY).await {
                        return;
                    }
                    continue;
                }
            };
            info!(host = %endpoint.host, port = endpoint.port, "connected to danmaku server");

            match self.drive_connection(&cancel, conn, &events).await {
                Ok(()) => {
                    // Only cancellation ends a healthy connection.
                    info!("leaving danmaku stream");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "danmaku connection failed, retrying another in 5s");
                }
            }

            if sleep_or_cancel(&cancel, RECONNECT_DELAY).await {
                return;
            }
        }
    }

    /// Drive one established connection until cancellation or failure.
    async fn drive_connection(
        &self,
        cancel: &CancellationToken,
        conn: TcpStream,
        events: &mpsc::Sender<Event>,
    ) -> Result<()> {
        let (mut read_half, write_half) = conn.into_split();

        // The writer task dies with the connection.
        let conn_cancel = cancel.child_token();
        let auth = AuthPayload::new(self.uid, self.room_id, self.token.clone());
        let heartbeat = tokio::spawn(auth_and_heartbeat(write_half, auth, conn_cancel.clone()));

        let result = async {
            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }

                let messages = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    result = read_messages(&mut read_half) => result?,
                };
                for message in messages {
                    // The receiver only drops on shutdown.
                    if events.send(message).await.is_err() {
                        return Ok(());
                    }
                }

                // Brief yield so cancellation is observed promptly.
                if sleep_or_cancel(cancel, READ_YIELD).await {
                    return Ok(());
                }
            }
        }
        .await;

        conn_cancel.cancel();
        heartbeat.abort();

        result
    }
}

/// Send the auth frame, then a header-only heartbeat every 20 seconds with a
/// monotonically increasing sequence id. Ends on cancellation or write error.
async fn auth_and_heartbeat(
    mut conn: tokio::net::tcp::OwnedWriteHalf,
    auth: AuthPayload,
    cancel: CancellationToken,
) {
    if let Err(e) = run_heartbeat(&mut conn, auth, cancel).await {
        warn!(error = %e, "heartbeat task exited");
    }
}

async fn run_heartbeat(
    conn: &mut tokio::net::tcp::OwnedWriteHalf,
    auth: AuthPayload,
    cancel: CancellationToken,
) -> Result<()> {
    let auth_bytes = serde_json::to_vec(&auth).context("failed to encode auth payload")?;
    conn.write_all(&encode_frame(TYPE_UNCOMPRESSED_NORMAL, OP_AUTH, 0, &auth_bytes))
        .await
        .context("failed to send auth frame")?;

    let mut sequence_id: u32 = 0;
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The interval's first tick completes immediately; consume it so the
    // beats are actually 20s apart.
    ticker.tick().await;

    loop {
        // First beat goes out right after auth.
        sequence_id += 1;
        conn.write_all(&encode_frame(
            TYPE_UNCOMPRESSED_NORMAL,
            OP_HEARTBEAT,
            sequence_id,
            &[],
        ))
        .await
        .context("failed to send heartbeat frame")?;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
    }
}

/// Sleep for `duration`, returning true if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::super::codec::read_messages as read_frames;
    use super::super::{FrameHeader, HEADER_LEN, OP_NORMAL};
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn read_one_frame(
        conn: &mut (impl tokio::io::AsyncRead + Unpin),
    ) -> (FrameHeader, Vec<u8>) {
        let mut header_buf = [0u8; HEADER_LEN as usize];
        conn.read_exact(&mut header_buf).await.unwrap();
        let header = FrameHeader::decode(&header_buf);

        let mut payload = vec![0u8; (header.total_length - HEADER_LEN as u32) as usize];
        conn.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    #[tokio::test]
    async fn test_connects_authenticates_and_forwards_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();

            // Expect the auth frame first.
            let (header, payload) = read_one_frame(&mut conn).await;
            assert_eq!(header.op, OP_AUTH);
            let auth: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            assert_eq!(auth["roomid"], 1000);
            assert_eq!(auth["protover"], 3);
            assert_eq!(auth["key"], "token");

            // Then the first heartbeat.
            let (header, _) = read_one_frame(&mut conn).await;
            assert_eq!(header.op, OP_HEARTBEAT);

            // Push one gift event at the client.
            let gift = serde_json::json!({
                "cmd": "SEND_GIFT",
                "data": {
                    "giftId": 1, "giftName": "盒", "num": 1, "price": 500,
                    "uid": 42, "uname": "v",
                    "blind_gift": {
                        "original_gift_id": 10,
                        "original_gift_name": "盲盒A",
                        "original_gift_price": 100,
                    }
                }
            })
            .to_string();
            conn.write_all(&encode_frame(
                TYPE_UNCOMPRESSED_NORMAL,
                OP_NORMAL,
                0,
                gift.as_bytes(),
            ))
            .await
            .unwrap();

            // Keep the socket open until the client goes away.
            let mut buf = [0u8; 1024];
            while conn.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
        });

        let endpoints = vec![LiveEndpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            wss_port: 0,
            ws_port: 0,
        }];
        let stream = Stream::new(1000, 42, "token".to_string(), endpoints);

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let driver = tokio::spawn(stream.run(cancel.clone(), tx));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        match event {
            Event::SendGift(gift) => assert_eq!(gift.uid, 42),
            other => panic!("unexpected event: {:?}", other),
        }

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), driver).await;
        server.abort();
    }

    #[tokio::test]
    async fn test_round_robin_advances_past_dead_endpoint() {
        // First endpoint refuses connections; second one works.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let (header, _) = read_one_frame(&mut conn).await;
            header.op
        });

        let endpoints = vec![
            LiveEndpoint {
                host: dead_addr.ip().to_string(),
                port: dead_addr.port(),
                wss_port: 0,
                ws_port: 0,
            },
            LiveEndpoint {
                host: addr.ip().to_string(),
                port: addr.port(),
                wss_port: 0,
                ws_port: 0,
            },
        ];
        let stream = Stream::new(1000, 42, "token".to_string(), endpoints);

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(16);
        let driver = tokio::spawn(stream.run(cancel.clone(), tx));

        // Within the 5s retry delay plus handshake time the driver must have
        // authenticated against the healthy endpoint.
        let op = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("driver never reached the second endpoint")
            .unwrap();
        assert_eq!(op, OP_AUTH);

        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), driver).await;
    }

    // Exercised indirectly above, but the codec sees the exact frames the
    // driver writes.
    #[tokio::test]
    async fn test_heartbeat_frame_is_header_only() {
        let frame = encode_frame(TYPE_UNCOMPRESSED_NORMAL, OP_HEARTBEAT, 3, &[]);
        assert_eq!(frame.len(), HEADER_LEN as usize);

        let mut bytes: &[u8] = &frame;
        // Header-only heartbeat decodes to no events and no error.
        assert!(read_frames(&mut bytes).await.unwrap().is_empty());
    }
}
