//! SSH transport
//!
//! Opens one russh client connection per session and runs every remote
//! command on its own PTY-backed exec channel. Each channel is owned by a
//! task that serves write/resize/close commands and forwards output as
//! [`StreamEvent`]s.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use t7_core::{Credentials, Failure, ReadyState, SessionState, TransportError};
use t7_protocol::TerminalSize;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{DataStream, StreamEvent};

/// Why an SSH connection could not be established
#[derive(Debug, Error)]
pub enum SshConnectError {
    /// The host could not be resolved or refused the connection
    #[error("Cannot reach {0}")]
    WrongAddress(String),

    /// The server rejected the password
    #[error("Password rejected")]
    PasswordRejected,

    /// The server rejected the key
    #[error("Key rejected")]
    KeyRejected,

    /// The server offers no authentication method we can use
    #[error("No usable authentication method")]
    NoAuthMethod,

    /// No credentials were supplied
    #[error("No credentials supplied")]
    MissingCredentials,

    /// Any other SSH or I/O failure
    #[error("SSH connection failed: {0}")]
    Failed(String),
}

impl SshConnectError {
    /// Session state and failure this error is surfaced as
    pub fn outcome(&self) -> (SessionState, Failure) {
        match self {
            SshConnectError::WrongAddress(_) => (SessionState::Failed, Failure::WrongAddress),
            SshConnectError::PasswordRejected => {
                (SessionState::WrongPassword, Failure::WrongPassword)
            }
            SshConnectError::KeyRejected => (SessionState::Failed, Failure::KeyRejected),
            SshConnectError::NoAuthMethod | SshConnectError::MissingCredentials => {
                (SessionState::Failed, Failure::NotImplemented)
            }
            SshConnectError::Failed(_) => (SessionState::Failed, Failure::FailedToConnect),
        }
    }
}

fn classify_auth_error(e: russh::Error) -> SshConnectError {
    match e {
        russh::Error::NoAuthMethod => SshConnectError::NoAuthMethod,
        other => SshConnectError::Failed(other.to_string()),
    }
}

fn ssh_error(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Ssh(format!("{}: {}", context, e))
}

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl SshTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An authenticated SSH connection
#[derive(Clone)]
pub struct SshTransport {
    handle: Arc<Handle<ClientHandler>>,
    term: String,
}

impl SshTransport {
    /// Connect and authenticate
    ///
    /// Has no timeout of its own; callers race it against their boarding
    /// watchdog.
    pub async fn connect(
        target: &SshTarget,
        credentials: Option<&Credentials>,
        term: &str,
    ) -> Result<Self, SshConnectError> {
        let credentials = credentials.ok_or(SshConnectError::MissingCredentials)?;
        let address = target.address();

        let addrs: Vec<_> = tokio::net::lookup_host(&address)
            .await
            .map_err(|_| SshConnectError::WrongAddress(address.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(SshConnectError::WrongAddress(address));
        }

        tracing::debug!("Connecting to {}", address);
        let config = Arc::new(Config::default());
        let mut handle = client::connect(config, &addrs[..], ClientHandler::default())
            .await
            .map_err(|e| match e.downcast_ref::<russh::Error>() {
                Some(russh::Error::IO(io)) if is_unreachable(io) => {
                    SshConnectError::WrongAddress(address.clone())
                }
                _ => SshConnectError::Failed(e.to_string()),
            })?;

        tracing::debug!("Authenticating as user '{}'", target.username);
        match credentials {
            Credentials::Password(password) => {
                let ok = handle
                    .authenticate_password(&target.username, password)
                    .await
                    .map_err(classify_auth_error)?;
                if !ok {
                    return Err(SshConnectError::PasswordRejected);
                }
            }
            Credentials::Key {
                private_key,
                passphrase,
            } => {
                let key = russh_keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| SshConnectError::Failed(format!("Invalid private key: {}", e)))?;
                let ok = handle
                    .authenticate_publickey(&target.username, Arc::new(key))
                    .await
                    .map_err(classify_auth_error)?;
                if !ok {
                    return Err(SshConnectError::KeyRejected);
                }
            }
        }

        tracing::info!("SSH connection to {} established", address);
        Ok(Self {
            handle: Arc::new(handle),
            term: term.to_string(),
        })
    }

    /// Run `command` on a new PTY of the given size
    pub async fn open_exec(
        &self,
        command: &str,
        size: TerminalSize,
    ) -> Result<(Arc<SshStream>, mpsc::UnboundedReceiver<StreamEvent>), TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("Failed to open session channel", e))?;
        channel
            .request_pty(
                false,
                &self.term,
                size.cols as u32,
                size.rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| ssh_error("Failed to request PTY", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_error("Failed to exec", e))?;

        tracing::debug!("Started {:?} on channel {:?}", command, channel.id());
        Ok(SshStream::spawn(command.to_string(), channel))
    }

    /// Whether the underlying connection is gone
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Close the connection
    pub async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("Error while disconnecting SSH: {}", e);
        }
    }
}

fn is_unreachable(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::NotFound
    )
}

enum StreamCommand {
    Data(Bytes),
    Resize(TerminalSize),
    Close,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One exec channel
pub struct SshStream {
    label: String,
    state: Arc<AtomicU8>,
    commands: mpsc::UnboundedSender<StreamCommand>,
}

impl SshStream {
    fn spawn(
        label: String,
        mut channel: Channel<Msg>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (commands_tx, mut commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(STATE_OPEN));

        let task_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = commands.recv() => match cmd {
                        Some(StreamCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                tracing::warn!("SSH write failed: {}", e);
                                break;
                            }
                        }
                        Some(StreamCommand::Resize(size)) => {
                            if let Err(e) = channel
                                .window_change(size.cols as u32, size.rows as u32, 0, 0)
                                .await
                            {
                                tracing::warn!("SSH window change failed: {}", e);
                            }
                        }
                        Some(StreamCommand::Close) | None => {
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                            let _ = events_tx.send(StreamEvent::Message(Bytes::copy_from_slice(&data)));
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            tracing::debug!("Remote command exited with {}", exit_status);
                        }
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }
            task_state.store(STATE_CLOSED, Ordering::SeqCst);
            let _ = events_tx.send(StreamEvent::Closed);
        });

        let stream = Arc::new(Self {
            label,
            state,
            commands: commands_tx,
        });
        (stream, events_rx)
    }

    /// Change the PTY size
    pub fn resize(&self, size: TerminalSize) -> Result<(), TransportError> {
        self.commands
            .send(StreamCommand::Resize(size))
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl DataStream for SshStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => ReadyState::Open,
            STATE_CLOSING => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.commands
            .send(StreamCommand::Data(data))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.commands.send(StreamCommand::Close);
    }
}

/// SSH client handler
///
/// The client has no known-hosts store; server keys are accepted and their
/// fingerprints logged.
#[derive(Default)]
pub(crate) struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Server host key: {}", server_public_key.fingerprint());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_outcomes() {
        assert_eq!(
            SshConnectError::PasswordRejected.outcome(),
            (SessionState::WrongPassword, Failure::WrongPassword)
        );
        assert_eq!(
            SshConnectError::KeyRejected.outcome(),
            (SessionState::Failed, Failure::KeyRejected)
        );
        assert_eq!(
            SshConnectError::NoAuthMethod.outcome(),
            (SessionState::Failed, Failure::NotImplemented)
        );
        assert_eq!(
            SshConnectError::WrongAddress("x:22".to_string()).outcome(),
            (SessionState::Failed, Failure::WrongAddress)
        );
    }

    #[test]
    fn test_target_address() {
        let target = SshTarget {
            host: "example.com".to_string(),
            port: 2222,
            username: "me".to_string(),
        };
        assert_eq!(target.address(), "example.com:2222");
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_wrong_address() {
        let target = SshTarget {
            host: "host.invalid".to_string(),
            port: 22,
            username: "me".to_string(),
        };
        let creds = Credentials::Password("pw".to_string());
        let err = SshTransport::connect(&target, Some(&creds), "xterm")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SshConnectError::WrongAddress(_)));
    }

    #[tokio::test]
    async fn test_refused_port_is_wrong_address() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = SshTarget {
            host: "127.0.0.1".to_string(),
            port,
            username: "me".to_string(),
        };
        let creds = Credentials::Password("pw".to_string());
        let err = SshTransport::connect(&target, Some(&creds), "xterm")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SshConnectError::WrongAddress(_)));
    }
}
