//! Network uplink: connectivity checks and snapshot transmission.

use std::future::Future;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::UplinkConfig;

/// Pause between probes while reconnecting.
const RECONNECT_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Send failed below the HTTP layer, or the payload could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransmissionError {
    #[error("HTTP client setup failed: {0}")]
    Client(String),
    #[error("Failed to encode payload: {0}")]
    Encode(String),
    #[error("Network error: {0}")]
    Network(String),
}

/// Outcome of a completed send, whatever the status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub status: u16,
    pub body: String,
}

impl SendReport {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network reachability of the collector.
pub trait Connectivity {
    /// Last known connectivity state.
    fn is_connected(&self) -> bool;

    /// Try to (re)establish connectivity, giving up after `timeout`.
    fn connect(&mut self, timeout: Duration) -> impl Future<Output = bool> + Send;
}

/// Delivers encoded snapshots to the collector.
pub trait Transmitter {
    fn send(
        &mut self,
        payload: Vec<u8>,
        content_type: &'static str,
    ) -> impl Future<Output = Result<SendReport, TransmissionError>> + Send;
}

/// HTTP(S) POST uplink.
///
/// Connectivity is probed with a TCP connect to the endpoint's host and
/// port; the cached state is also updated by every send.
pub struct HttpUplink {
    client: reqwest::Client,
    endpoint: Url,
    connected: bool,
}

impl HttpUplink {
    /// Build the uplink from configuration.
    pub fn new(config: &UplinkConfig) -> Result<Self, TransmissionError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| TransmissionError::Client(format!("Invalid endpoint: {}", e)))?;

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_millis(config.request_timeout_ms));
        if !config.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| TransmissionError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            connected: false,
        })
    }

    /// The collector URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn probe_target(&self) -> Option<(String, u16)> {
        let host = self.endpoint.host_str()?.to_string();
        let port = self.endpoint.port_or_known_default()?;
        Some((host, port))
    }
}

impl Connectivity for HttpUplink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self, timeout: Duration) -> bool {
        let Some((host, port)) = self.probe_target() else {
            warn!(endpoint = %self.endpoint, "Endpoint has no host to probe");
            self.connected = false;
            return false;
        };

        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, TcpStream::connect((host.as_str(), port))).await
            {
                Ok(Ok(_stream)) => {
                    info!(host = %host, port, attempts, "Uplink reachable");
                    self.connected = true;
                    return true;
                }
                Ok(Err(e)) => debug!(host = %host, port, error = %e, "Uplink probe failed"),
                Err(_) => debug!(host = %host, port, "Uplink probe timed out"),
            }

            if Instant::now() + RECONNECT_PROBE_INTERVAL >= deadline {
                break;
            }
            tokio::time::sleep(RECONNECT_PROBE_INTERVAL).await;
        }

        warn!(host = %host, port, attempts, "Uplink unreachable");
        self.connected = false;
        false
    }
}

impl Transmitter for HttpUplink {
    async fn send(
        &mut self,
        payload: Vec<u8>,
        content_type: &'static str,
    ) -> Result<SendReport, TransmissionError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, content_type)
            .body(payload)
            .send()
            .await;

        match response {
            Ok(response) => {
                self.connected = true;
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Ok(SendReport { status, body })
            }
            Err(e) => {
                self.connected = false;
                Err(TransmissionError::Network(e.to_string()))
            }
        }
    }
}
