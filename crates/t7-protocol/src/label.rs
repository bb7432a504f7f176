//! Data stream labels
//!
//! The remote peer opens one data stream per channel and encodes the
//! stream's identity in its label as `<message-id>:<channel-id>`. The
//! message id names the `add_pane`/`reconnect_pane` request the stream
//! answers; the channel id is the stable identity of the remote process.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::ids::{ChannelId, MessageId};

/// Label of the reserved control stream
pub const CONTROL_LABEL: &str = "%";

/// Parsed `<message-id>:<channel-id>` label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelLabel {
    /// Request that caused the stream to be opened
    pub request: MessageId,
    /// Channel carried by the stream
    pub channel: ChannelId,
}

impl ChannelLabel {
    /// Create a new label
    pub fn new(request: MessageId, channel: ChannelId) -> Self {
        Self { request, channel }
    }

    /// Parse a stream label
    pub fn parse(label: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidLabel(label.to_string());
        let (request, channel) = label.split_once(':').ok_or_else(invalid)?;
        let request = request.trim().parse::<u64>().map_err(|_| invalid())?;
        let channel = channel.trim().parse::<u32>().map_err(|_| invalid())?;
        Ok(Self {
            request: MessageId::new(request),
            channel: ChannelId::new(channel),
        })
    }
}

impl FromStr for ChannelLabel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.request.as_u64(), self.channel.as_u32())
    }
}
