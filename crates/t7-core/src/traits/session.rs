//! Session trait

use async_trait::async_trait;
use std::sync::Arc;
use t7_protocol::Marker;
use tokio::sync::mpsc;

use super::Channel;
use crate::error::SessionError;
use crate::types::{ChannelTarget, Credentials, Failure, SessionState};

/// Notification emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session changed state; `failure` accompanies the failure states
    StateChanged {
        state: SessionState,
        failure: Option<Failure>,
    },
    /// The peer pushed a new layout payload
    PayloadUpdated(String),
}

impl SessionEvent {
    /// Shorthand for a state change without a failure
    pub fn state(state: SessionState) -> Self {
        SessionEvent::StateChanged {
            state,
            failure: None,
        }
    }

    /// Shorthand for a state change with a failure
    pub fn failed(state: SessionState, failure: Failure) -> Self {
        SessionEvent::StateChanged {
            state,
            failure: Some(failure),
        }
    }
}

/// Receiving side of a session's notifications
///
/// Returned alongside every session at construction.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    /// Create a linked sender and event stream
    pub fn channel() -> (mpsc::UnboundedSender<SessionEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next event, or `None` once the session is dropped
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the outcome of a boarding attempt
    ///
    /// Skips `connecting` and payload updates and returns the first state
    /// that ends the attempt, together with its failure.
    pub async fn wait_for_outcome(&mut self) -> Option<(SessionState, Option<Failure>)> {
        while let Some(event) = self.rx.recv().await {
            if let SessionEvent::StateChanged { state, failure } = event {
                match state {
                    SessionState::New | SessionState::Connecting => continue,
                    _ => return Some((state, failure)),
                }
            }
        }
        None
    }
}

/// A logical, resumable connection to one remote host
///
/// Boarding outcomes are reported through [`SessionEvents`]; the async
/// operations only fail for reasons local to the call.
#[async_trait]
pub trait Session: Send + Sync {
    /// Whether the session is (currently) backed by plain SSH
    fn is_ssh(&self) -> bool;

    /// Last state reported to the caller
    fn state(&self) -> SessionState;

    /// Most recent resumption marker, if any
    fn marker(&self) -> Option<Marker>;

    /// Start boarding, restoring from `marker` when given
    async fn connect(
        &self,
        marker: Option<Marker>,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError>;

    /// Board again, by default from the stored marker
    async fn reconnect(
        &self,
        marker: Option<Marker>,
        credentials: Option<Credentials>,
    ) -> Result<(), SessionError>;

    /// Open a channel to a new or surviving remote process
    async fn open_channel(&self, target: ChannelTarget) -> Result<Arc<dyn Channel>, SessionError>;

    /// Fetch the stored layout payload
    async fn get_payload(&self) -> Result<Option<String>, SessionError>;

    /// Store a layout payload
    async fn set_payload(&self, payload: String) -> Result<(), SessionError>;

    /// Detach every channel and obtain a resumption marker
    ///
    /// Resolves immediately with the current marker when no transport is
    /// active.
    async fn disconnect(&self) -> Result<Option<Marker>, SessionError>;

    /// Release the transport without obtaining a marker or reporting an
    /// event; a connected session reads as disconnected afterwards
    async fn close(&self);

    /// Force the session into the failed state
    fn fail(&self, failure: Option<Failure>);
}
