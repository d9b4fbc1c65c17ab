//! HTTP probes through the local SOCKS listener

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ProcessError;

use super::config::LISTEN_ADDR;

/// Endpoint fetched by the connection test
pub const PROBE_URL: &str = "https://www.google.com";

/// Public address lookup service
pub const PUBLIC_IP_URL: &str = "https://api.ipify.org?format=json";

const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Outcome of a successful probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub status: u16,
    pub latency_ms: u64,
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Fetch the probe endpoint through the SOCKS listener on `socks_port`
    async fn probe(&self, socks_port: u16) -> Result<ProbeReport, ProcessError>;

    /// Look up the public address, through the listener when a port is given
    async fn public_ip(&self, socks_port: Option<u16>) -> Result<String, ProcessError>;
}

#[derive(Debug, Deserialize)]
struct IpResponse {
    ip: String,
}

/// [`Prober`] backed by `reqwest` with a `socks5h` proxy
#[derive(Debug, Clone)]
pub struct HttpProber {
    probe_url: String,
    ip_url: String,
    timeout: Duration,
}

impl Default for HttpProber {
    fn default() -> Self {
        Self {
            probe_url: PROBE_URL.to_string(),
            ip_url: PUBLIC_IP_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

impl HttpProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to override both endpoints
    pub fn with_urls(mut self, probe_url: impl Into<String>, ip_url: impl Into<String>) -> Self {
        self.probe_url = probe_url.into();
        self.ip_url = ip_url.into();
        self
    }

    /// Builder method to set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client(&self, socks_port: Option<u16>) -> Result<reqwest::Client, ProcessError> {
        let builder = reqwest::Client::builder().timeout(self.timeout);
        let builder = match socks_port {
            Some(port) => {
                let proxy = reqwest::Proxy::all(format!("socks5h://{LISTEN_ADDR}:{port}"))
                    .map_err(|e| ProcessError::Probe(e.to_string()))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };
        builder
            .build()
            .map_err(|e| ProcessError::Probe(e.to_string()))
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, socks_port: u16) -> Result<ProbeReport, ProcessError> {
        let client = self.client(Some(socks_port))?;
        let started = Instant::now();
        let response = client
            .get(&self.probe_url)
            .send()
            .await
            .map_err(|e| ProcessError::Probe(e.to_string()))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ProcessError::Probe(format!("HTTP {}", status.as_u16())));
        }
        tracing::info!(latency_ms, "connection test passed");
        Ok(ProbeReport {
            status: status.as_u16(),
            latency_ms,
        })
    }

    async fn public_ip(&self, socks_port: Option<u16>) -> Result<String, ProcessError> {
        let response = self
            .client(socks_port)?
            .get(&self.ip_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ProcessError::Probe(e.to_string()))?;
        let body: IpResponse = response
            .json()
            .await
            .map_err(|e| ProcessError::Probe(e.to_string()))?;
        Ok(body.ip)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Prober with a scripted outcome
    #[derive(Default)]
    pub struct FakeProber {
        pub fail: AtomicBool,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, _socks_port: u16) -> Result<ProbeReport, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProcessError::Probe("HTTP 502".to_string()));
            }
            Ok(ProbeReport {
                status: 200,
                latency_ms: 42,
            })
        }

        async fn public_ip(&self, socks_port: Option<u16>) -> Result<String, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match socks_port {
                Some(_) => "203.0.113.1".to_string(),
                None => "198.51.100.1".to_string(),
            })
        }
    }
}
