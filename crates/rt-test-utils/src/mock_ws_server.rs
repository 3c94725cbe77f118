//! mock_ws_server: a mock RTU server for integration-testing `rtu-client`.
//!
//! Unlike a fixed-protocol mock (request in, canned reply out), the RTU
//! wire protocol needs per-scenario scripting: auth succeeds here, is
//! rejected there, a `delta_rejected` fires mid-test, an
//! `inconsistent_state_event` arrives unprompted. So this accepts
//! connections and hands each one to the test as a [`MockRtuConnection`]
//! the test drives directly — read the next frame, assert on it, write
//! back whatever the scenario calls for.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use rt_protocol::RtuFrame;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

type WsStream = WebSocketStream<TcpStream>;

/// A mock RTU server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port. Each
/// accepted connection is handed to the test as a [`MockRtuConnection`];
/// the accept loop itself applies no protocol logic.
pub struct MockRtuServer {
    addr: SocketAddr,
    conn_rx: mpsc::UnboundedReceiver<MockRtuConnection>,
    _accept_task: tokio::task::JoinHandle<()>,
}

impl MockRtuServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (write, read) = ws.split();
                if conn_tx.send(MockRtuConnection { write, read }).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            addr,
            conn_rx,
            _accept_task: accept_task,
        })
    }

    /// Return the address the server is listening on, as `ws://{addr}`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for and return the next accepted connection.
    pub async fn accept(&mut self) -> MockRtuConnection {
        self.conn_rx
            .recv()
            .await
            .expect("accept task dropped its sender")
    }
}

/// One accepted connection, driven directly by the test.
pub struct MockRtuConnection {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockRtuConnection {
    pub async fn send_frame(
        &mut self,
        frame: &RtuFrame,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let json = serde_json::to_string(frame).expect("RtuFrame always serializes");
        self.write.send(Message::Text(json.into())).await
    }

    /// Build and send a reply frame correlated to `transaction_id`.
    pub async fn reply(
        &mut self,
        transaction_id: Uuid,
        channel: impl Into<String>,
        event: impl Into<String>,
        data: Value,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let frame = RtuFrame {
            transaction_id,
            channel: channel.into(),
            event: event.into(),
            data,
            msg_id: Some(Uuid::new_v4()),
            processed_timestamp: Some(chrono::Utc::now()),
        };
        self.send_frame(&frame).await
    }

    /// Build and send a broadcast/event frame with a fresh transaction id
    /// (events the server initiates, not in reply to a specific request).
    pub async fn broadcast(
        &mut self,
        channel: impl Into<String>,
        event: impl Into<String>,
        data: Value,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        self.reply(Uuid::new_v4(), channel, event, data).await
    }

    /// Read the next frame from the client, skipping ping/pong control frames.
    pub async fn recv_frame(&mut self) -> Option<RtuFrame> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => {
                    return serde_json::from_str(&text).ok();
                }
                Ok(Message::Ping(data)) => {
                    let _ = self.write.send(Message::Pong(data)).await;
                    continue;
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Read frames until one matching `event` arrives (drops anything else).
    pub async fn recv_event(&mut self, event: &str) -> RtuFrame {
        loop {
            let frame = self
                .recv_frame()
                .await
                .unwrap_or_else(|| panic!("connection closed before seeing {event:?}"));
            if frame.event == event {
                return frame;
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}
