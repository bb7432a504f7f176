//! Peerbook directory connection
//!
//! A persistent WebSocket to the peerbook broker, shared by every session
//! that signals through it. The socket is owned by a background task that
//! re-dials with exponential backoff whenever it drops; messages sent while
//! the socket is down wait in an [`OutboundQueue`] and are flushed in order
//! once it opens again.

use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use t7_core::config::PeerbookConfig;
use t7_core::TransportError;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::queue::OutboundQueue;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Subscribers that fall this far behind start losing messages
const INBOUND_BROADCAST_CAPACITY: usize = 64;

/// Build the registration URL for `config`
pub fn peerbook_url(config: &PeerbookConfig, fingerprint: &str) -> Result<String, TransportError> {
    let base = format!("{}://{}/ws", config.ws_scheme(), config.host);
    let email = config.email.as_deref().unwrap_or_default();
    let url = reqwest::Url::parse_with_params(
        &base,
        &[
            ("fp", fingerprint),
            ("name", config.peer_name.as_str()),
            ("kind", "terminal7"),
            ("email", email),
        ],
    )
    .map_err(|e| TransportError::WebSocket(format!("Invalid peerbook URL {}: {}", base, e)))?;
    Ok(url.to_string())
}

struct Shared {
    outbound: mpsc::UnboundedSender<Value>,
    inbound: broadcast::Sender<Value>,
    open: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to the peerbook socket
///
/// Cheap to clone; the socket task stops when [`close`](Self::close) is
/// called or the last handle is dropped.
#[derive(Clone)]
pub struct PeerbookConnection {
    shared: Arc<Shared>,
}

impl PeerbookConnection {
    /// Start dialing the broker
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &PeerbookConfig,
        fingerprint: &str,
        queue_capacity: usize,
    ) -> Result<Self, TransportError> {
        let url = peerbook_url(config, fingerprint)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, _) = broadcast::channel(INBOUND_BROADCAST_CAPACITY);
        let (open_tx, open_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let socket = SocketTask {
            url,
            backoff: ExponentialBackoff::from_config(&config.backoff),
            queue: OutboundQueue::new(queue_capacity),
            outbound: outbound_rx,
            inbound: inbound_tx.clone(),
            open: open_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(socket.run());

        Ok(Self {
            shared: Arc::new(Shared {
                outbound: outbound_tx,
                inbound: inbound_tx,
                open: open_rx,
                cancel,
            }),
        })
    }

    /// Wait until the socket is open
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut open = self.shared.open.clone();
        open.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    /// Whether the socket is currently open
    pub fn is_open(&self) -> bool {
        *self.shared.open.borrow()
    }

    /// Send a JSON message, queueing it while the socket is down
    pub fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.shared.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// Receive every message the broker sends from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.shared.inbound.subscribe()
    }

    /// Stop the socket task
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for PeerbookConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerbookConnection")
            .field("open", &self.is_open())
            .finish()
    }
}

struct SocketTask {
    url: String,
    backoff: ExponentialBackoff,
    queue: OutboundQueue<Value>,
    outbound: mpsc::UnboundedReceiver<Value>,
    inbound: broadcast::Sender<Value>,
    open: watch::Sender<bool>,
    cancel: CancellationToken,
}

/// Why a connected socket stopped being served
enum Served {
    Lost,
    Finished,
}

impl SocketTask {
    async fn run(mut self) {
        loop {
            tracing::debug!("Dialing peerbook at {}", self.url);
            let dialed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                dialed = connect_async(self.url.as_str()) => dialed,
            };

            match dialed {
                Ok((ws, _)) => {
                    tracing::info!("Connected to peerbook");
                    self.backoff.reset();
                    self.open.send_replace(true);
                    let served = self.serve(ws).await;
                    self.open.send_replace(false);
                    if let Served::Finished = served {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Peerbook connection failed: {}", e),
            }

            let delay = self.backoff.next_delay();
            tracing::info!("Re-dialing peerbook in {:?}", delay);
            if !self.wait(delay).await {
                break;
            }
        }
        tracing::debug!("Peerbook socket task stopped");
    }

    /// Sleep for `delay`, queueing outbound messages meanwhile
    ///
    /// Returns false when the task should stop.
    async fn wait(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                message = self.outbound.recv() => match message {
                    Some(message) => self.enqueue(message),
                    None => return false,
                },
            }
        }
    }

    fn enqueue(&mut self, message: Value) {
        if self.queue.push(message).is_err() {
            tracing::warn!(
                "Peerbook outbound queue full ({}), dropping message",
                self.queue.capacity()
            );
        }
    }

    async fn serve(&mut self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Served {
        let (mut write, mut read) = ws.split();

        if self.flush(&mut write).await.is_err() {
            return Served::Lost;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Served::Finished;
                }
                message = self.outbound.recv() => match message {
                    Some(message) => {
                        self.enqueue(message);
                        if self.flush(&mut write).await.is_err() {
                            return Served::Lost;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Served::Finished;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Peerbook closed the connection");
                        return Served::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Peerbook socket error: {}", e);
                        return Served::Lost;
                    }
                },
            }
        }
    }

    /// Write every queued message in order
    ///
    /// A message whose write fails goes back to the head of the queue.
    async fn flush(&mut self, write: &mut WsSink) -> Result<(), ()> {
        while let Some(message) = self.queue.pop_front() {
            let text = message.to_string();
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::warn!("Failed to send to peerbook: {}", e);
                self.queue.requeue_front(message);
                return Err(());
            }
        }
        Ok(())
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                tracing::trace!("Peerbook message: {}", text);
                // No subscribers is fine; nobody is signaling right now
                let _ = self.inbound.send(value);
            }
            Err(e) => tracing::warn!("Dropping unparsable peerbook message: {}", e),
        }
    }
}
