//! Blocking `reqwest` transport.
//!
//! One pooled `Client` is shared by every caller; reqwest keeps idle
//! keep-alive connections per host, so batch fetches reuse sockets.

use super::provider::{Transport, TransportError, TransportResponse};
use std::time::Duration;

/// HTTP transport backed by `reqwest::blocking::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a transport with a default request timeout and user agent.
    pub fn new(default_timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(default_timeout)
            .connect_timeout(default_timeout)
            .user_agent(user_agent)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn get(&self, url: &str, timeout: Duration) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(classify)?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().map_err(classify)?.to_vec();

        Ok(TransportResponse {
            status,
            body,
            content_type,
        })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
