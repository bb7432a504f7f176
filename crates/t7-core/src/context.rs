//! Explicit session context
//!
//! Everything a session needs from its surroundings is handed to it at
//! construction: network timeouts, where to get ICE servers, the local
//! fingerprint, and how to tell the user about non-fatal problems.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::NetConfig;
use crate::types::IceServer;

/// Source of the ICE servers handed to each new peer connection
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    /// Current ICE servers, possibly cached
    async fn ice_servers(&self) -> Vec<IceServer>;

    /// Drop any cached servers so the next call fetches fresh ones
    async fn refresh(&self) {}
}

/// A fixed list of ICE servers
#[derive(Debug, Clone, Default)]
pub struct StaticIceServers(pub Vec<IceServer>);

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn ice_servers(&self) -> Vec<IceServer> {
        self.0.clone()
    }
}

/// Source of the local client's public key fingerprint
pub trait FingerprintProvider: Send + Sync {
    fn fingerprint(&self) -> String;
}

/// A fingerprint known up front
#[derive(Debug, Clone, Default)]
pub struct StaticFingerprint(pub String);

impl FingerprintProvider for StaticFingerprint {
    fn fingerprint(&self) -> String {
        self.0.clone()
    }
}

/// User-facing notification sink
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Notifier that writes to the `t7::notify` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str) {
        tracing::info!(target: "t7::notify", "{}", message);
    }
}

/// Capabilities and settings shared by the sessions of one client
#[derive(Clone)]
pub struct SessionContext {
    pub net: NetConfig,
    pub ice: Arc<dyn IceServerProvider>,
    pub fingerprint: Arc<dyn FingerprintProvider>,
    pub notifier: Arc<dyn Notifier>,
}

impl SessionContext {
    /// Context using the configured ICE server and a tracing notifier
    pub fn new(net: NetConfig) -> Self {
        let ice = StaticIceServers(vec![IceServer::new(net.ice_server.clone())]);
        Self {
            net,
            ice: Arc::new(ice),
            fingerprint: Arc::new(StaticFingerprint::default()),
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_ice_provider(mut self, ice: Arc<dyn IceServerProvider>) -> Self {
        self.ice = ice;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: Arc<dyn FingerprintProvider>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Tell the user about a non-fatal problem
    pub fn notify(&self, message: &str) {
        self.notifier.notify(message);
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("net", &self.net)
            .field("fingerprint", &self.fingerprint.fingerprint())
            .finish_non_exhaustive()
    }
}
