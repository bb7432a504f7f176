//! Control channel messages
//!
//! Every session reserves one multiplexed stream (labelled `%`) for
//! session-management traffic. Requests are JSON objects:
//!
//! ```json
//! {"type": "add_pane", "args": {...}, "message_id": 3, "time": 1700000000000}
//! ```
//!
//! The peer answers every request with an acknowledgement or a negative
//! acknowledgement referencing the request's `message_id`:
//!
//! ```json
//! {"type": "ack", "args": {"ref": 3, "body": ...}}
//! ```
//!
//! # Request Types
//!
//! - `add_pane`: spawn a new process and open a stream for it
//! - `reconnect_pane`: open a fresh stream for a process that survived a disconnect
//! - `resize`: change a pane's terminal geometry
//! - `mark`: close the logical session and return a resumption marker
//! - `restore`: resume from a previously issued marker
//! - `get_payload` / `set_payload`: round-trip the caller's layout blob

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::ids::{ChannelId, Marker, MessageId};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Default terminal size (24x80)
    pub fn default_size() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// A session-management request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Spawn a new process, optionally as a child of `parent`
    AddPane {
        /// Command line to run
        command: Vec<String>,
        /// Initial geometry
        size: TerminalSize,
        /// Parent pane, `None` for a top level pane
        parent: Option<ChannelId>,
    },
    /// Re-attach to a process that survived a disconnect
    ReconnectPane {
        /// Pane to re-attach
        id: ChannelId,
    },
    /// Change a pane's terminal geometry
    Resize {
        /// Pane to resize
        pane_id: ChannelId,
        /// New geometry
        size: TerminalSize,
    },
    /// Ask for a resumption marker, closing the logical session remotely
    Mark,
    /// Resume from a marker issued by an earlier `mark`
    Restore {
        /// Marker to resume from
        marker: Marker,
    },
    /// Fetch the stored layout payload
    GetPayload,
    /// Store a layout payload
    SetPayload {
        /// Opaque payload
        payload: String,
    },
}

impl ControlRequest {
    /// Wire name of this request
    pub fn kind(&self) -> &'static str {
        match self {
            ControlRequest::AddPane { .. } => "add_pane",
            ControlRequest::ReconnectPane { .. } => "reconnect_pane",
            ControlRequest::Resize { .. } => "resize",
            ControlRequest::Mark => "mark",
            ControlRequest::Restore { .. } => "restore",
            ControlRequest::GetPayload => "get_payload",
            ControlRequest::SetPayload { .. } => "set_payload",
        }
    }

    /// Wire arguments of this request
    pub fn args(&self) -> Value {
        match self {
            ControlRequest::AddPane {
                command,
                size,
                parent,
            } => json!({
                "command": command,
                "rows": size.rows,
                "cols": size.cols,
                "parent": parent.map(|p| p.as_u32()).unwrap_or(0),
            }),
            ControlRequest::ReconnectPane { id } => json!({ "id": id }),
            ControlRequest::Resize { pane_id, size } => json!({
                "pane_id": pane_id,
                "sx": size.cols,
                "sy": size.rows,
            }),
            ControlRequest::Mark => Value::Null,
            ControlRequest::Restore { marker } => json!({ "marker": marker }),
            ControlRequest::GetPayload => json!({}),
            ControlRequest::SetPayload { payload } => json!({ "Payload": payload }),
        }
    }
}

/// A request as it travels on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Request type
    #[serde(rename = "type")]
    pub kind: String,
    /// Request arguments
    pub args: Value,
    /// Session-unique, strictly increasing identifier
    pub message_id: MessageId,
    /// Creation time in milliseconds since the Unix epoch
    pub time: u64,
}

impl ControlMessage {
    /// Wrap a request with its identifier and creation time
    pub fn new(message_id: MessageId, request: &ControlRequest, time: u64) -> Self {
        Self {
            kind: request.kind().to_string(),
            args: request.args(),
            message_id,
            time,
        }
    }

    /// Serialize to the JSON text sent on the wire
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Body of an acknowledgement or negative acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    /// Identifier of the request being answered
    #[serde(rename = "ref")]
    pub reference: MessageId,
    /// Success payload (ack) or error payload (nack)
    #[serde(default)]
    pub body: Value,
}

/// A message received on the control channel
#[derive(Debug, Clone, PartialEq)]
pub enum InboundControl {
    /// Positive acknowledgement
    Ack(ControlReply),
    /// Negative acknowledgement
    Nack(ControlReply),
    /// A request initiated by the peer
    Request {
        /// Request type
        kind: String,
        /// Request arguments
        args: Value,
    },
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Value,
}

impl InboundControl {
    /// Parse a control channel frame
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let raw: RawInbound = serde_json::from_slice(data)?;
        match raw.kind.as_str() {
            "ack" => Ok(Self::Ack(serde_json::from_value(raw.args)?)),
            "nack" => Ok(Self::Nack(serde_json::from_value(raw.args)?)),
            "" => Err(ProtocolError::UnexpectedMessage(
                String::from_utf8_lossy(data).into_owned(),
            )),
            _ => Ok(Self::Request {
                kind: raw.kind,
                args: raw.args,
            }),
        }
    }

    /// Serialize a reply the way a peer sends it
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = match self {
            Self::Ack(reply) => json!({ "type": "ack", "args": reply }),
            Self::Nack(reply) => json!({ "type": "nack", "args": reply }),
            Self::Request { kind, args } => json!({ "type": kind, "args": args }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Extract a layout payload from an acknowledgement or inbound request body
///
/// Strings are passed through, `null` means no payload, and any other JSON
/// value is handed back in its serialized form.
pub fn payload_from_body(body: &Value) -> Option<String> {
    match body {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) if map.contains_key("Payload") || map.contains_key("payload") => map
            .get("Payload")
            .or_else(|| map.get("payload"))
            .and_then(payload_from_body),
        other => Some(other.to_string()),
    }
}
