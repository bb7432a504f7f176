//! ICE servers from peerbook
//!
//! Peerbook hands out short-lived TURN credentials at `/turn`. The
//! configured STUN server always comes first; whatever peerbook returns is
//! appended. When the lookup fails for any reason the configured server is
//! used alone.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use t7_core::config::{NetConfig, PeerbookConfig};
use t7_core::{IceServer, IceServerProvider};
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
struct TurnResponse {
    #[serde(default)]
    ice_servers: Vec<IceServer>,
}

/// Caching [`IceServerProvider`] backed by peerbook's `/turn` endpoint
#[derive(Debug)]
pub struct PeerbookIceServers {
    client: reqwest::Client,
    turn_url: Option<String>,
    fallback: IceServer,
    timeout: Duration,
    cache: Mutex<Option<Vec<IceServer>>>,
}

impl PeerbookIceServers {
    /// Provider for the configured peerbook
    ///
    /// No lookup is made for an insecure peerbook or one without a host.
    pub fn new(peerbook: &PeerbookConfig, net: &NetConfig) -> Self {
        let turn_url = if peerbook.insecure || peerbook.host.is_empty() {
            None
        } else {
            Some(format!("{}://{}/turn", peerbook.http_scheme(), peerbook.host))
        };
        Self::with_url(turn_url, net)
    }

    /// Provider querying an explicit `/turn` URL
    pub fn with_url(turn_url: Option<String>, net: &NetConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            turn_url,
            fallback: IceServer::new(net.ice_server.clone()),
            timeout: net.timeout,
            cache: Mutex::new(None),
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<IceServer>, reqwest::Error> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        let body: TurnResponse = response.json().await?;
        Ok(body.ice_servers)
    }
}

#[async_trait]
impl IceServerProvider for PeerbookIceServers {
    async fn ice_servers(&self) -> Vec<IceServer> {
        let mut cache = self.cache.lock().await;
        if let Some(servers) = cache.as_ref() {
            return servers.clone();
        }

        let mut servers = vec![self.fallback.clone()];
        if let Some(url) = &self.turn_url {
            match self.fetch(url).await {
                Ok(fetched) => {
                    tracing::debug!("Got {} ICE servers from peerbook", fetched.len());
                    servers.extend(fetched);
                }
                Err(e) => tracing::warn!("Failed to get ICE servers from {}: {}", url, e),
            }
        }
        *cache = Some(servers.clone());
        servers
    }

    async fn refresh(&self) {
        tracing::debug!("Dropping cached ICE servers");
        self.cache.lock().await.take();
    }
}
