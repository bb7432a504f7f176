//! Signaling relayed by the peerbook broker

use async_trait::async_trait;
use serde_json::Value;
use t7_core::SessionError;
use t7_protocol::{BrokerEnvelope, IceCandidate, ProtocolError, SessionDescription};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

use super::{SignalMessage, Signaling};
use crate::peerbook::PeerbookConnection;

/// Routes setup data to one peer, identified by its fingerprint
#[derive(Debug, Clone)]
pub struct BrokerSignaling {
    peerbook: PeerbookConnection,
    target: String,
}

impl BrokerSignaling {
    pub fn new(peerbook: PeerbookConnection, target: impl Into<String>) -> Self {
        Self {
            peerbook,
            target: target.into(),
        }
    }

    /// Fingerprint of the remote peer
    pub fn target(&self) -> &str {
        &self.target
    }

    fn post(&self, envelope: BrokerEnvelope) -> Result<(), SessionError> {
        let value = serde_json::to_value(&envelope).map_err(ProtocolError::from)?;
        self.peerbook.send(value)?;
        Ok(())
    }
}

#[async_trait]
impl Signaling for BrokerSignaling {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SessionError> {
        let inbound = self.peerbook.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay(inbound, self.target.clone(), tx));
        Ok(rx)
    }

    async fn send_offer(&self, offer: &SessionDescription) -> Result<(), SessionError> {
        tracing::debug!("Sending offer to {} via peerbook", self.target);
        self.post(BrokerEnvelope::offer(&self.target, offer)?)
    }

    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.post(BrokerEnvelope::candidate(&self.target, candidate)?)
    }
}

/// Forward envelopes from `target` until the receiving side goes away
async fn relay(
    mut inbound: broadcast::Receiver<Value>,
    target: String,
    tx: mpsc::UnboundedSender<SignalMessage>,
) {
    loop {
        let value = tokio::select! {
            _ = tx.closed() => break,
            value = inbound.recv() => value,
        };
        let value = match value {
            Ok(value) => value,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Signaling relay for {} skipped {} messages", target, skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        // Presence updates and other broker traffic share the socket
        let Ok(envelope) = serde_json::from_value::<BrokerEnvelope>(value) else {
            continue;
        };
        if !envelope.is_from(&target) {
            continue;
        }
        match envelope.payload() {
            Ok(Some(payload)) => {
                if tx.send(payload.into()).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Bad signaling envelope from {}: {}", target, e),
        }
    }
    tracing::debug!("Signaling relay for {} stopped", target);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_relay_filters_by_source() {
        let (pb_tx, pb_rx) = broadcast::channel(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(relay(pb_rx, "peer-a".to_string(), tx));

        let answer = SessionDescription::answer("v=0");
        pb_tx
            .send(json!({"source_fp": "peer-b", "answer": answer.to_base64().unwrap()}))
            .unwrap();
        pb_tx.send(json!({"peers": []})).unwrap();
        pb_tx
            .send(json!({"source_fp": "peer-a", "answer": {"type": "answer", "sdp": "v=0"}}))
            .unwrap();
        pb_tx
            .send(json!({"source_fp": "peer-a", "candidate": {"candidate": "candidate:1"}}))
            .unwrap();

        assert_eq!(rx.recv().await, Some(SignalMessage::Description(answer)));
        match rx.recv().await {
            Some(SignalMessage::Candidate(c)) => assert_eq!(c.candidate, "candidate:1"),
            other => panic!("Expected a candidate, got {:?}", other),
        }

        drop(rx);
        pb_tx.send(json!({})).ok();
        task.await.unwrap();
    }
}
