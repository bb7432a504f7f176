//! Signaling payloads
//!
//! Connection-setup data (one offer, one answer and any number of ICE
//! candidates) travels in three different envelopes depending on the
//! signaling strategy: broker envelopes relayed by peerbook, newline
//! terminated JSON lines on an SSH tunnel, and a single HTTP exchange.
//! The payload types are shared by all three.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Version sent in HTTP connect requests
pub const HTTP_API_VERSION: u32 = 0;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP offer or answer in its browser JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Base64 of the JSON form, as carried by broker and HTTP signaling
    pub fn to_base64(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(self)?;
        Ok(STANDARD.encode(json))
    }

    /// Inverse of [`SessionDescription::to_base64`]
    pub fn from_base64(encoded: &str) -> Result<Self, ProtocolError> {
        let bytes = STANDARD.decode(encoded.trim())?;
        let json = String::from_utf8(bytes)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// An ICE candidate in its browser JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// A signaling payload received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    /// Classify a JSON object by the presence of a `candidate` or `sdp` key
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        if value.get("candidate").is_some() {
            Ok(Self::Candidate(serde_json::from_value(value)?))
        } else if value.get("sdp").is_some() {
            Ok(Self::Description(serde_json::from_value(value)?))
        } else {
            Err(ProtocolError::UnexpectedMessage(value.to_string()))
        }
    }

    /// Parse and classify JSON text
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// JSON text of the payload
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(match self {
            Self::Description(d) => serde_json::to_string(d)?,
            Self::Candidate(c) => serde_json::to_string(c)?,
        })
    }
}

/// Message routed through the peerbook broker
///
/// Outbound envelopes name a `target` fingerprint; the broker stamps
/// inbound ones with the sender's `source_fp`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
}

impl BrokerEnvelope {
    /// Envelope carrying a local offer to `target`
    pub fn offer(target: &str, offer: &SessionDescription) -> Result<Self, ProtocolError> {
        Ok(Self {
            target: Some(target.to_string()),
            offer: Some(offer.to_base64()?),
            ..Default::default()
        })
    }

    /// Envelope carrying a local ICE candidate to `target`
    pub fn candidate(target: &str, candidate: &IceCandidate) -> Result<Self, ProtocolError> {
        Ok(Self {
            target: Some(target.to_string()),
            candidate: Some(serde_json::to_value(candidate)?),
            ..Default::default()
        })
    }

    /// Whether this envelope was sent by the peer with fingerprint `fp`
    pub fn is_from(&self, fp: &str) -> bool {
        self.source_fp.as_deref() == Some(fp)
    }

    /// Extract the signaling payload, if the envelope carries one
    ///
    /// An `answer` may be base64 of the description JSON or the
    /// description object itself.
    pub fn payload(&self) -> Result<Option<SignalPayload>, ProtocolError> {
        if let Some(candidate) = &self.candidate {
            let candidate = serde_json::from_value(candidate.clone())?;
            return Ok(Some(SignalPayload::Candidate(candidate)));
        }
        match &self.answer {
            Some(Value::String(encoded)) => Ok(Some(SignalPayload::Description(
                SessionDescription::from_base64(encoded)?,
            ))),
            Some(other) => Ok(Some(SignalPayload::Description(serde_json::from_value(
                other.clone(),
            )?))),
            None => Ok(None),
        }
    }
}

/// Body of the HTTP signaling `POST /connect` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConnectRequest {
    pub api_version: u32,
    /// Base64 of the offer JSON
    pub offer: String,
    /// Fingerprint of the local client
    pub fingerprint: String,
}

impl HttpConnectRequest {
    pub fn new(offer: &SessionDescription, fingerprint: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            api_version: HTTP_API_VERSION,
            offer: offer.to_base64()?,
            fingerprint: fingerprint.to_string(),
        })
    }

    /// Decode the base64 answer returned in the response body
    pub fn decode_answer(body: &str) -> Result<SessionDescription, ProtocolError> {
        SessionDescription::from_base64(body)
    }
}
