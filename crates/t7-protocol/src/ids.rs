//! Identifier types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

/// Identifier of a control message, unique within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Create a new message ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a channel, assigned by the remote peer and stable across reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Create a new channel ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

impl From<u32> for ChannelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Resumption marker issued by the remote peer in reply to `mark`
///
/// Opaque to this side: it is stored after a disconnect and handed back
/// in a `restore` request on the next connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Marker(pub i64);

impl Marker {
    /// Create a new marker
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw marker value
    pub fn value(&self) -> i64 {
        self.0
    }

    /// Parse a marker out of an acknowledgement body
    ///
    /// Peers send the marker either as a JSON number or as a numeric string.
    pub fn from_body(body: &serde_json::Value) -> Result<Self, ProtocolError> {
        match body {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self)
                .ok_or_else(|| ProtocolError::InvalidMarker(body.to_string())),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Self)
                .map_err(|_| ProtocolError::InvalidMarker(body.to_string())),
            _ => Err(ProtocolError::InvalidMarker(body.to_string())),
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
