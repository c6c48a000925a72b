//! HTTP client for a running tunnel daemon.
//!
//! Used by the `status` and `stop` subcommands and by anything else that
//! needs the tunnel endpoint of a device.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::address::Endpoint;

/// Port used by the stock `tunneld` service; preferred when it is listening.
pub const STOCK_TUNNELD_PORT: u16 = 49151;

/// Default port of this daemon.
pub const DEFAULT_PORT: u16 = 5555;

/// Errors from talking to a tunnel daemon.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Tunnel daemon unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Tunnel daemon returned an error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tunnel daemon not ready for device {0}")]
    NotReady(String),
}

/// Client for the daemon's control surface.
#[derive(Debug, Clone)]
pub struct TunneldClient {
    base_url: String,
    http: reqwest::Client,
}

impl TunneldClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Connect to whichever daemon is running locally: the stock port when
    /// something listens on it, this daemon's default port otherwise.
    pub async fn discover() -> Result<Self, ClientError> {
        let stock = SocketAddr::from(([127, 0, 0, 1], STOCK_TUNNELD_PORT));
        let port = if is_port_open(stock).await {
            STOCK_TUNNELD_PORT
        } else {
            DEFAULT_PORT
        };
        debug!(port, "Discovered tunnel daemon port");
        Self::new(format!("http://localhost:{port}"))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the full `{udid: endpoint}` table.
    pub async fn tunnels(&self) -> Result<BTreeMap<String, Endpoint>, ClientError> {
        let url = format!("{}/", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ClientError::Unreachable { url, source })?;
        Ok(resp.error_for_status()?.json().await?)
    }

    /// Endpoint for one device.
    pub async fn endpoint_for(&self, udid: &str) -> Result<Endpoint, ClientError> {
        self.tunnels()
            .await?
            .remove(udid)
            .ok_or_else(|| ClientError::NotReady(udid.to_string()))
    }

    /// Ask the daemon to shut down.
    pub async fn shutdown(&self) -> Result<String, ClientError> {
        let url = format!("{}/shutdown", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ClientError::Unreachable { url, source })?;
        Ok(resp.error_for_status()?.text().await?)
    }
}

async fn is_port_open(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect(addr)
        )
        .await,
        Ok(Ok(_))
    )
}
