//! Peerbook directory settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Connection to the peerbook broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerbookConfig {
    /// Broker host, optionally with a port
    pub host: String,

    /// Use plain `ws`/`http` instead of `wss`/`https`
    pub insecure: bool,

    /// Account email sent when registering
    pub email: Option<String>,

    /// Name this client registers under
    pub peer_name: String,

    /// Local fingerprint; peerbook sessions need one
    pub fingerprint: Option<String>,

    /// Re-dial policy after the socket drops
    pub backoff: BackoffConfig,
}

impl Default for PeerbookConfig {
    fn default() -> Self {
        Self {
            host: "api.peerbook.io".to_string(),
            insecure: false,
            email: None,
            peer_name: "t7".to_string(),
            fingerprint: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl PeerbookConfig {
    /// `ws` or `wss`
    pub fn ws_scheme(&self) -> &'static str {
        if self.insecure {
            "ws"
        } else {
            "wss"
        }
    }

    /// `http` or `https`
    pub fn http_scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
