//! Persistent WebSocket transport (C1): FIFO outbound buffer drained by a
//! single writer task, a single reader task handing frames to the
//! [`Router`], and automatic reconnection with capped exponential backoff.
//!
//! Grounded on the teacher's `UplinkSession` (`services/forwarder/src/uplink.rs`):
//! same `connect`/bearer-header/`send`/`recv` shape, generalized from a
//! fixed hello/heartbeat handshake to the RTU frame protocol, and extended
//! with the reconnect-with-backoff and authenticated-gate behavior the
//! teacher's uplink (a single dedicated process, restarted by its
//! supervisor rather than self-healing) does not need.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rt_protocol::RtuFrame;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::router::SharedRouter;

/// Events the transport reports to its owner (the RTU Client), which drives
/// its own startup/resync state machine off of them.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A fresh TCP/TLS/WS connection was established. The client must
    /// restart its own authenticate/subscribe sequence from scratch — the
    /// transport never reauthenticates on its own.
    Connected,
    /// The connection was lost; reconnection (with backoff) is already
    /// underway.
    Disconnected,
    /// The connect attempt failed in a way retrying cannot fix (e.g. a 401
    /// on the upgrade). The transport has given up.
    PermanentFailure(String),
}

/// Backoff formula: `delay = min(base * 2^(attempt - 1), cap)`, attempt
/// counter resets to zero on a successful connect.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(factor).min(cap_ms);
    Duration::from_millis(delay_ms)
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A persistent connection to the RTU endpoint. Cheaply cloneable; clones
/// share the same outbound queues and background tasks.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    outbound_tx: mpsc::UnboundedSender<RtuFrame>,
    priority_tx: mpsc::UnboundedSender<RtuFrame>,
    gate_tx: watch::Sender<bool>,
    events_tx: tokio::sync::broadcast::Sender<TransportEvent>,
    reconnect_attempt: AtomicU32,
    supervisor: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Transport {
    /// Spawns the supervisor task and returns immediately; the connection
    /// is established in the background. `url` must already carry any
    /// query-string auth the server expects in addition to the bearer
    /// header set here.
    pub fn spawn(
        url: String,
        authorization_token: String,
        router: SharedRouter,
        backoff_base_ms: u64,
        backoff_cap_ms: u64,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(false);
        let (events_tx, _) = tokio::sync::broadcast::channel(32);

        let inner = Arc::new(TransportInner {
            outbound_tx,
            priority_tx,
            gate_tx,
            events_tx,
            reconnect_attempt: AtomicU32::new(0),
            supervisor: StdMutex::new(None),
        });

        let transport = Transport { inner };
        let supervisor = transport.clone();
        let handle = tokio::spawn(async move {
            supervisor
                .run_supervisor(url, authorization_token, router, outbound_rx, priority_rx, gate_rx, backoff_base_ms, backoff_cap_ms)
                .await;
        });
        *transport.inner.supervisor.lock().unwrap() = Some(handle);
        transport
    }

    /// Tears down the background supervisor task. With `now == false`, waits
    /// a brief grace period first so any frame already handed to the writer
    /// has a chance to reach the wire; `now == true` aborts immediately.
    pub async fn shutdown(&self, now: bool) {
        if !now {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if let Some(handle) = self.inner.supervisor.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Non-blocking enqueue onto the FIFO outbound buffer. Drained by the
    /// writer task once the authenticated gate is open.
    pub fn send(&self, frame: RtuFrame) -> Result<(), TransportError> {
        self.inner
            .outbound_tx
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }

    /// Enqueue a frame that bypasses the authenticated gate — used for the
    /// `authenticate_request` frame itself, which must reach the wire
    /// before the gate it unlocks.
    pub fn send_priority(&self, frame: RtuFrame) -> Result<(), TransportError> {
        self.inner
            .priority_tx
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }

    /// Opens the authenticated gate, releasing any buffered outbound
    /// frames. Called by the RTU Client once `authenticate_reply` arrives.
    pub fn open_gate(&self) {
        let _ = self.inner.gate_tx.send(true);
    }

    /// Closes the gate. Called whenever a fresh connection is established,
    /// since the new connection is unauthenticated until the client redrives
    /// the handshake.
    fn close_gate(&self) {
        let _ = self.inner.gate_tx.send(false);
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_supervisor(
        &self,
        url: String,
        token: String,
        router: SharedRouter,
        mut outbound_rx: mpsc::UnboundedReceiver<RtuFrame>,
        mut priority_rx: mpsc::UnboundedReceiver<RtuFrame>,
        mut gate_rx: watch::Receiver<bool>,
        backoff_base_ms: u64,
        backoff_cap_ms: u64,
    ) {
        loop {
            let attempt = self.inner.reconnect_attempt.load(Ordering::SeqCst);
            if attempt > 0 {
                let delay = backoff_delay(attempt, backoff_base_ms, backoff_cap_ms);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::time::sleep(delay).await;
            }

            match connect(&url, &token).await {
                Ok(ws) => {
                    self.inner.reconnect_attempt.store(0, Ordering::SeqCst);
                    self.close_gate();
                    let _ = self.inner.events_tx.send(TransportEvent::Connected);
                    info!(url = %url, "rtu transport connected");

                    self.run_connection(ws, &router, &mut outbound_rx, &mut priority_rx, &mut gate_rx)
                        .await;

                    let _ = self.inner.events_tx.send(TransportEvent::Disconnected);
                    warn!("rtu transport disconnected, will reconnect");
                    self.inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
                }
                Err(TransportError::Permanent(reason)) => {
                    let _ = self
                        .inner
                        .events_tx
                        .send(TransportEvent::PermanentFailure(reason.clone()));
                    warn!(reason = %reason, "rtu transport connect failed permanently, giving up");
                    return;
                }
                Err(err) => {
                    debug!(error = %err, "rtu transport connect attempt failed, will retry");
                    self.inner.reconnect_attempt.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    async fn run_connection(
        &self,
        ws: WsStream,
        router: &SharedRouter,
        outbound_rx: &mut mpsc::UnboundedReceiver<RtuFrame>,
        priority_rx: &mut mpsc::UnboundedReceiver<RtuFrame>,
        gate_rx: &mut watch::Receiver<bool>,
    ) {
        let (mut sink, mut stream) = ws.split();

        let writer = async {
            loop {
                let gate_open = *gate_rx.borrow();
                tokio::select! {
                    biased;
                    Some(frame) = priority_rx.recv() => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            return;
                        }
                    }
                    Some(frame) = outbound_rx.recv(), if gate_open => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            return;
                        }
                    }
                    changed = gate_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        };

        let reader = async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RtuFrame>(&text) {
                        Ok(frame) => router.dispatch(frame).await,
                        Err(err) => warn!(error = %err, "could not decode inbound frame"),
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket read error");
                        return;
                    }
                }
            }
        };

        tokio::select! {
            () = writer => {}
            () = reader => {}
        }
    }
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<WsStream, Message>,
    frame: &RtuFrame,
) -> Result<(), TransportError> {
    let json = serde_json::to_string(frame).map_err(|e| TransportError::Permanent(e.to_string()))?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn connect(url: &str, token: &str) -> Result<WsStream, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::Permanent(format!("invalid url '{url}': {e}")))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}")
            .parse()
            .map_err(|_| TransportError::Permanent("invalid bearer token".to_owned()))?,
    );

    match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _response)) => Ok(ws),
        Err(tokio_tungstenite::tungstenite::Error::Http(resp))
            if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 =>
        {
            Err(TransportError::Permanent(format!(
                "authentication rejected on upgrade: {}",
                resp.status()
            )))
        }
        Err(err) => Err(TransportError::Ws(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_zero_on_first_attempt() {
        assert_eq!(backoff_delay(0, 500, 30_000), Duration::ZERO);
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        assert_eq!(backoff_delay(1, 500, 30_000), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, 500, 30_000), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(3, 500, 30_000), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(4, 500, 30_000), Duration::from_millis(4_000));
    }

    #[tokio::test]
    async fn shutdown_aborts_the_supervisor_task() {
        let router: SharedRouter = Arc::new(crate::router::Router::new());
        let transport = Transport::spawn("ws://127.0.0.1:1".to_owned(), "token".to_owned(), router, 500, 30_000);

        let handle = transport.inner.supervisor.lock().unwrap().take();
        let handle = handle.expect("spawn always stores a supervisor handle");
        *transport.inner.supervisor.lock().unwrap() = Some(handle);

        transport.shutdown(true).await;
        assert!(transport.inner.supervisor.lock().unwrap().is_none());
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(10, 500, 30_000), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(63, 500, 30_000), Duration::from_millis(30_000));
    }
}
