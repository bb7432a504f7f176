//! Signaling tunneled through an SSH exec channel
//!
//! A hybrid session spawns the remote signaling helper over SSH and talks
//! to it through the channel's terminal. The helper announces itself with a
//! `READY` line and then speaks newline-terminated JSON. Because the remote
//! terminal echoes our own writes back, every payload we send is recorded
//! in a [`SentLog`] and identical lines coming back are dropped.
//!
//! Payloads may be wrapped over several lines. Any line starting with `{`
//! can begin a payload, so a stray unterminated `{` line does not swallow
//! the payloads after it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use t7_core::SessionError;
use t7_protocol::{IceCandidate, ProtocolError, SessionDescription, SignalPayload};
use tokio::sync::mpsc;

use super::{SignalMessage, Signaling};
use crate::transport::DataStream;

/// Bytes of unparsed payload text kept while waiting for the rest of a line
const MAX_PENDING: usize = 64 * 1024;

/// Payloads written to the helper, for echo suppression
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<String>>>);

impl SentLog {
    pub fn record(&self, payload: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.into());
    }

    pub fn contains(&self, payload: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|sent| sent == payload)
    }
}

/// What a chunk of helper output amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The helper is up and will accept payloads
    Ready,
    /// The helper binary does not exist on the remote host
    HelperMissing,
    /// A signaling payload from the remote side
    Payload(SignalPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    AwaitingHelper,
    AwaitingPayloads,
}

/// Line scanner for the helper's output
#[derive(Debug)]
pub struct TunnelParser {
    phase: TunnelPhase,
    partial: String,
    pending: Vec<String>,
    sent: SentLog,
}

impl TunnelParser {
    pub fn new(sent: SentLog) -> Self {
        Self {
            phase: TunnelPhase::AwaitingHelper,
            partial: String::new(),
            pending: Vec::new(),
            sent,
        }
    }

    pub fn phase(&self) -> TunnelPhase {
        self.phase
    }

    /// Consume raw output, returning the events of every completed line
    pub fn feed(&mut self, data: &[u8]) -> Vec<TunnelEvent> {
        self.partial.push_str(&String::from_utf8_lossy(data));
        let mut events = Vec::new();
        while let Some(end) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=end).collect();
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        events
    }

    fn line(&mut self, line: &str) -> Option<TunnelEvent> {
        if line.is_empty() {
            return None;
        }
        tracing::trace!("Tunnel line: {}", line);
        if line.contains("READY") {
            self.phase = TunnelPhase::AwaitingPayloads;
            self.pending.clear();
            return Some(TunnelEvent::Ready);
        }
        if line.contains("such file or") {
            return Some(TunnelEvent::HelperMissing);
        }

        if self.pending.is_empty() && !line.starts_with('{') {
            return None;
        }
        self.pending.push(line.to_owned());

        let mut value = None;
        for start in 0..self.pending.len() {
            if !self.pending[start].starts_with('{') {
                continue;
            }
            let text = self.pending[start..].concat();
            if self.sent.contains(&text) {
                self.pending.clear();
                return None;
            }
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                if start > 0 {
                    tracing::debug!("Dropping {} unterminated tunnel line(s)", start);
                }
                value = Some(parsed);
                break;
            }
        }
        let Some(value) = value else {
            self.trim_pending();
            return None;
        };
        self.pending.clear();

        if self.phase == TunnelPhase::AwaitingHelper {
            tracing::debug!("Discarding payload received before READY");
            return None;
        }
        match SignalPayload::from_value(value) {
            Ok(payload) => Some(TunnelEvent::Payload(payload)),
            Err(e) => {
                tracing::debug!("Ignoring tunnel line: {}", e);
                None
            }
        }
    }

    fn trim_pending(&mut self) {
        let mut size: usize = self.pending.iter().map(String::len).sum();
        while size > MAX_PENDING && !self.pending.is_empty() {
            size -= self.pending.remove(0).len();
        }
    }
}

/// Writes setup data to the helper's stdin
///
/// The owner of the helper stream feeds its output through a
/// [`TunnelParser`] and hands the payloads to [`deliver`](Self::deliver).
/// Every [`open`](Signaling::open) starts a fresh inbound channel, so the
/// same helper serves each connection attempt of the session on top.
pub struct TunnelSignaling {
    stream: Arc<dyn DataStream>,
    sent: SentLog,
    inbound: Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>,
}

impl TunnelSignaling {
    pub fn new(stream: Arc<dyn DataStream>, sent: SentLog) -> Self {
        Self {
            stream,
            sent,
            inbound: Mutex::new(None),
        }
    }

    /// Pass a payload from the helper to the current connection attempt
    ///
    /// Payloads arriving while no attempt listens are dropped.
    pub fn deliver(&self, message: SignalMessage) {
        let inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        match inbound.as_ref() {
            Some(tx) if tx.send(message).is_ok() => {}
            _ => tracing::debug!("No connection attempt listening, dropping tunnel payload"),
        }
    }

    async fn write(&self, payload: String) -> Result<(), SessionError> {
        tracing::debug!("Tunnel send: {}", payload);
        let line = Bytes::from(format!("{}\n", payload));
        self.sent.record(payload);
        self.stream.send(line).await?;
        Ok(())
    }
}

#[async_trait]
impl Signaling for TunnelSignaling {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        Ok(rx)
    }

    async fn send_offer(&self, offer: &SessionDescription) -> Result<(), SessionError> {
        let payload = serde_json::to_string(offer).map_err(ProtocolError::from)?;
        self.write(payload).await
    }

    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        let payload = serde_json::to_string(candidate).map_err(ProtocolError::from)?;
        self.write(payload).await
    }
}
