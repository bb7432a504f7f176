//! Network settings shared by all sessions

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;

/// Timeouts and transport tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Watchdog for control messages and channel opens
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,

    /// Watchdog for boarding a transport
    #[serde(rename = "connect_timeout_ms", with = "duration_millis")]
    pub connect_timeout: Duration,

    /// STUN server always handed to peer connections
    pub ice_server: String,

    /// Capacity of the outbound queues used before a stream opens
    pub queue_capacity: usize,

    /// Scheme used for HTTP signaling and TURN lookups (`http` or `https`)
    pub http_scheme: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(10000),
            ice_server: "stun:stun.l.google.com:19302".to_string(),
            queue_capacity: 256,
            http_scheme: "http".to_string(),
        }
    }
}
