//! Signaling over a single HTTP exchange
//!
//! The offer is POSTed to `/connect` on the target host; the response body
//! is the base64 answer. There is no trickle: candidates are gathered into
//! the offer by the remote side's own means and local ones are dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use t7_core::{Failure, FingerprintProvider, SessionContext, SessionError};
use t7_protocol::{HttpConnectRequest, IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use super::{SignalMessage, Signaling};

/// `POST <scheme>://<address>/connect` signaling
pub struct HttpSignaling {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    fingerprint: Arc<dyn FingerprintProvider>,
    inbound: Mutex<Option<mpsc::UnboundedSender<SignalMessage>>>,
}

impl HttpSignaling {
    /// Signal to the host at `address` (`host:port`)
    pub fn new(address: &str, ctx: &SessionContext) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}://{}/connect", ctx.net.http_scheme, address),
            timeout: ctx.net.connect_timeout,
            fingerprint: ctx.fingerprint.clone(),
            inbound: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for HttpSignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSignaling")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<SignalMessage>, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        Ok(rx)
    }

    async fn send_offer(&self, offer: &SessionDescription) -> Result<(), SessionError> {
        let body = HttpConnectRequest::new(offer, &self.fingerprint.fingerprint())?;
        let tx = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SessionError::Gone)?;

        let request = self.client.post(&self.url).json(&body).timeout(self.timeout);
        let url = self.url.clone();
        tokio::spawn(async move {
            tracing::debug!("Posting offer to {}", url);
            let outcome = exchange(request).await;
            let _ = tx.send(outcome);
        });
        Ok(())
    }

    async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        tracing::trace!("Not trickling candidate over HTTP: {}", candidate.candidate);
        Ok(())
    }
}

async fn exchange(request: reqwest::RequestBuilder) -> SignalMessage {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("HTTP signaling failed: {}", e);
            return SignalMessage::Failed(Failure::FailedToConnect);
        }
    };

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        tracing::warn!("HTTP signaling unauthorized");
        return SignalMessage::Failed(Failure::Unauthorized);
    }
    if !status.is_success() {
        tracing::warn!("HTTP signaling returned {}", status);
        return SignalMessage::Failed(Failure::FailedToConnect);
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Failed to read HTTP signaling answer: {}", e);
            return SignalMessage::Failed(Failure::FailedToConnect);
        }
    };
    match HttpConnectRequest::decode_answer(&body) {
        Ok(answer) => SignalMessage::Description(answer),
        Err(e) => {
            tracing::warn!("Bad answer from HTTP signaling: {}", e);
            SignalMessage::Failed(Failure::BadRemoteDescription)
        }
    }
}
