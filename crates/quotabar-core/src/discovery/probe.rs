//! HTTP prober for local language-server ports.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::trace;

use super::{PortProber, Scheme};
use crate::error::Result;

/// Cheap diagnostic call used to recognize the API.
pub const PROBE_PATH: &str = "/exa.language_server_pb.LanguageServerService/GetUnleashData";

/// Per-attempt probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) const CSRF_HEADER: &str = "X-Codeium-Csrf-Token";
pub(crate) const CONNECT_PROTOCOL_HEADER: &str = "Connect-Protocol-Version";

/// Builds the headers every local API call carries.
pub(crate) fn api_headers(token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONNECT_PROTOCOL_HEADER, HeaderValue::from_static("1"));
    if let Some(value) = token.and_then(|t| HeaderValue::from_str(t).ok()) {
        headers.insert(CSRF_HEADER, value);
    }
    headers
}

/// Builds a client for loopback calls. The local server uses a self-signed
/// certificate, so validation is off; callers only ever target 127.0.0.1.
pub(crate) fn loopback_client(timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .no_proxy()
        .build()?;
    Ok(client)
}

/// Probes ports with a minimal POST to [`PROBE_PATH`].
#[derive(Debug, Clone)]
pub struct HttpPortProber {
    client: reqwest::Client,
}

impl HttpPortProber {
    /// Creates a prober with the default timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    /// Creates a prober with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: loopback_client(timeout)?,
        })
    }
}

#[async_trait]
impl PortProber for HttpPortProber {
    async fn probe(&self, port: u16, scheme: Scheme, token: Option<&str>) -> bool {
        let url = format!("{}://127.0.0.1:{}{}", scheme, port, PROBE_PATH);

        let response = match self
            .client
            .post(&url)
            .headers(api_headers(token))
            .json(&json!({ "wrapper_data": {} }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                trace!("Probe {} failed: {}", url, e);
                return false;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            trace!("Probe {} returned {}", url, response.status());
            return false;
        }

        match response.text().await {
            Ok(body) => serde_json::from_str::<Value>(&body).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn headers_include_token() {
        let headers = api_headers(Some("abc-123"));
        assert_eq!(headers.get(CSRF_HEADER).unwrap(), "abc-123");
        assert_eq!(headers.get(CONNECT_PROTOCOL_HEADER).unwrap(), "1");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn headers_without_token() {
        assert!(api_headers(None).get(CSRF_HEADER).is_none());
    }

    #[tokio::test]
    async fn closed_port_fails_both_schemes() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let prober = HttpPortProber::with_timeout(Duration::from_millis(500)).unwrap();
        assert!(!prober.probe(port, Scheme::Https, None).await);
        assert!(!prober.probe(port, Scheme::Http, None).await);
    }
}
