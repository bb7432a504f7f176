//! SSH session settings

use serde::{Deserialize, Serialize};

/// SSH and hybrid session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Port used when the target has none
    pub port: u16,

    /// Login name; defaults to the local user in the CLI
    pub username: Option<String>,

    /// Remote command that bootstraps WebRTC signaling for hybrid sessions
    pub accept_command: String,

    /// `TERM` requested for every PTY
    pub term: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: 22,
            username: None,
            accept_command: "/usr/local/bin/webexec accept".to_string(),
            term: "xterm-256color".to_string(),
        }
    }
}
