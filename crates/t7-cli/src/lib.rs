//! t7-cli: Command-line interface for t7
//!
//! Provides the `t7` binary, which boards a session to a remote host over
//! peerbook, HTTP, SSH or the SSH/WebRTC hybrid and attaches the local
//! terminal to a pane.

pub mod commands;
pub mod output;
pub mod terminal;
