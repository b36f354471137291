//! Background usage polling.
//!
//! Each cycle replays every stored credential, reads Antigravity through
//! local discovery, and runs the responses through the extractor. A failure
//! for one provider never affects the others.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info, warn};

use quotabar_core::{
    extract, AlertSettings, CoreError, EndpointCredential, ExtractionResult, HighUsageAlerts,
    LocalStatusClient, LocalUsage, Provider, UsageLevel,
};
use quotabar_storage::{Database, Settings};

/// Timeout for one replayed usage request.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Time between polls for a refresh interval in minutes. Zero counts as one
/// minute, and huge values saturate instead of overflowing.
pub fn refresh_period(minutes: u64) -> Duration {
    Duration::from_secs(minutes.max(1).saturating_mul(60))
}

/// Captured headers that are never replayed.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "cookie",
    "accept-encoding",
    "connection",
];

/// What one provider reported in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The response was read. The result may be empty if nothing matched.
    Usage(ExtractionResult),
    /// No credential is stored.
    NotConfigured,
    /// The local application is not running or not answering.
    NotConnected(String),
    /// Transport or storage failure for this cycle.
    Failed(String),
}

/// One provider's line in a poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReport {
    /// Provider polled.
    pub provider: Provider,
    /// What happened.
    pub outcome: PollOutcome,
    /// Level of the primary percentage, if there is one.
    pub level: Option<UsageLevel>,
}

impl ProviderReport {
    /// Primary percentage, if usage was read.
    pub fn primary_percentage(&self) -> Option<i64> {
        match &self.outcome {
            PollOutcome::Usage(result) => result.primary_percentage,
            _ => None,
        }
    }
}

/// Polls every provider.
#[derive(Debug)]
pub struct Poller {
    db: Database,
    client: reqwest::Client,
    local: LocalStatusClient,
    alerts: HighUsageAlerts,
}

impl Poller {
    /// Creates a poller using system discovery for Antigravity.
    pub fn new(db: Database) -> quotabar_core::Result<Self> {
        Self::with_local(db, LocalStatusClient::system()?)
    }

    /// Creates a poller with a specific local status client.
    pub fn with_local(db: Database, local: LocalStatusClient) -> quotabar_core::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Quotabar/{}", env!("CARGO_PKG_VERSION")))
            .timeout(FETCH_TIMEOUT)
            .build()?;

        Ok(Self {
            db,
            client,
            local,
            alerts: HighUsageAlerts::new(),
        })
    }

    /// The high-usage alerter.
    pub fn alerts(&self) -> &HighUsageAlerts {
        &self.alerts
    }

    /// Runs one cycle over every provider concurrently.
    pub async fn poll_all(&self) -> Vec<ProviderReport> {
        let settings = self.db.settings().unwrap_or_else(|e| {
            warn!("Could not load settings, using defaults: {}", e);
            Settings::default()
        });
        self.alerts.set_settings(AlertSettings {
            enabled: settings.notifications_enabled,
            threshold: settings.high_usage_threshold,
        });

        let reports = join_all(
            Provider::all()
                .iter()
                .map(|provider| self.poll_provider(*provider, &settings)),
        )
        .await;

        info!(
            "Poll cycle finished: {} of {} providers reported usage",
            reports
                .iter()
                .filter(|r| r.primary_percentage().is_some())
                .count(),
            reports.len()
        );
        reports
    }

    /// Polls one provider and records its primary percentage.
    pub async fn poll_provider(&self, provider: Provider, settings: &Settings) -> ProviderReport {
        let outcome = self.fetch_usage(provider).await;

        let level = match &outcome {
            PollOutcome::Usage(result) => result.primary_percentage.map(|pct| {
                self.record(provider, pct);
                UsageLevel::from_percentage(
                    pct,
                    settings.warning_threshold,
                    settings.critical_threshold,
                )
            }),
            _ => None,
        };

        ProviderReport {
            provider,
            outcome,
            level,
        }
    }

    async fn fetch_usage(&self, provider: Provider) -> PollOutcome {
        if !provider.uses_capture() {
            return match self.local.fetch().await {
                LocalUsage::Connected(result) => PollOutcome::Usage(result),
                LocalUsage::NotConnected(reason) => {
                    debug!("{} not connected: {}", provider, reason);
                    PollOutcome::NotConnected(reason)
                }
            };
        }

        let credential = match self.db.get_credential(provider) {
            Ok(Some(credential)) => credential,
            Ok(None) => return PollOutcome::NotConfigured,
            Err(e) => {
                warn!("Could not read {} credential: {}", provider, e);
                return PollOutcome::Failed(e.to_string());
            }
        };

        match self.fetch_body(&credential).await {
            Ok(body) => {
                let result = extract(&body, provider);
                if result.is_empty() {
                    warn!("No usage found in {} response", provider);
                }
                PollOutcome::Usage(result)
            }
            Err(e) => {
                warn!("Fetch failed for {}: {}", provider, e);
                PollOutcome::Failed(format!("fetch failed: {}", e))
            }
        }
    }

    /// Replays a captured request and returns the body text.
    pub async fn fetch_body(&self, credential: &EndpointCredential) -> quotabar_core::Result<String> {
        let response = self
            .client
            .get(&credential.url)
            .headers(replay_headers(credential))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Status {
                status: status.as_u16(),
                url: credential.url.clone(),
            });
        }

        Ok(response.text().await?)
    }

    fn record(&self, provider: Provider, percentage: i64) {
        if let Err(e) = self.db.record_usage(provider, Utc::now(), percentage) {
            warn!("Could not record {} usage: {}", provider, e);
        }
        self.alerts.observe(provider, percentage);
    }
}

/// Headers to send when replaying a captured request.
///
/// Names or values that are not valid HTTP are dropped.
pub fn replay_headers(credential: &EndpointCredential) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &credential.headers {
        let lower = name.to_lowercase();
        if SKIPPED_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(lower.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!("Dropping unreplayable header {}", name),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use quotabar_core::discovery::{
        EndpointDiscovery, PortLister, PortProber, ProcessEntry, ProcessLister, Scheme,
        TargetProcess,
    };

    struct NoProcesses;

    #[async_trait]
    impl ProcessLister for NoProcesses {
        async fn list(&self, _executable: &str) -> quotabar_core::Result<Vec<ProcessEntry>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl PortLister for NoProcesses {
        async fn listening_ports(&self, _pid: u32) -> quotabar_core::Result<Vec<u16>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl PortProber for NoProcesses {
        async fn probe(&self, _port: u16, _scheme: Scheme, _token: Option<&str>) -> bool {
            false
        }
    }

    fn poller(db: Database) -> Poller {
        let discovery = EndpointDiscovery::new(
            TargetProcess::with_executable("language_server_test"),
            Arc::new(NoProcesses),
            Arc::new(NoProcesses),
            Arc::new(NoProcesses),
        );
        Poller::with_local(db, LocalStatusClient::new(discovery).unwrap()).unwrap()
    }

    /// Serves one HTTP response and hands back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/usage", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        (url, rx)
    }

    fn credential(url: &str) -> EndpointCredential {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), "Bearer abc".to_string());
        headers.insert("host".to_string(), "claude.ai".to_string());
        headers.insert("content-length".to_string(), "12".to_string());
        EndpointCredential::new(url, headers)
    }

    #[test]
    fn replay_headers_skips_transport_headers() {
        let mut cred = credential("https://x");
        cred.headers
            .insert("Cookie".to_string(), "s=1".to_string());
        cred.headers
            .insert(":authority".to_string(), "x".to_string());

        let headers = replay_headers(&cred);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["authorization"], "Bearer abc");
    }

    #[tokio::test]
    async fn poll_reads_and_records_usage() {
        let db = Database::in_memory().unwrap();
        let (url, request) =
            serve_once("200 OK", r#"{"five_hour":{"utilization":42}}"#).await;
        db.set_credential(Provider::Claude, &credential(&url)).unwrap();

        let report = poller(db.clone())
            .poll_provider(Provider::Claude, &Settings::default())
            .await;

        assert_eq!(report.primary_percentage(), Some(42));
        assert_eq!(report.level, Some(UsageLevel::Normal));

        let raw = request.await.unwrap().to_lowercase();
        assert!(raw.contains("authorization: bearer abc"));
        assert!(!raw.contains("host: claude.ai"));

        let samples = db
            .usage_since(Provider::Claude, Utc::now() - chrono::Duration::minutes(5))
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].percentage, 42);
    }

    #[tokio::test]
    async fn non_success_status_fails_the_cycle() {
        let db = Database::in_memory().unwrap();
        let (url, _request) = serve_once("401 Unauthorized", "{}").await;
        db.set_credential(Provider::Codex, &credential(&url)).unwrap();

        let report = poller(db.clone())
            .poll_provider(Provider::Codex, &Settings::default())
            .await;

        assert!(matches!(report.outcome, PollOutcome::Failed(ref reason) if reason.contains("401")));
        assert_eq!(report.level, None);
        assert!(db
            .usage_since(Provider::Codex, Utc::now() - chrono::Duration::minutes(5))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_credential_is_not_configured() {
        let report = poller(Database::in_memory().unwrap())
            .poll_provider(Provider::ZAi, &Settings::default())
            .await;
        assert_eq!(report.outcome, PollOutcome::NotConfigured);
    }

    #[tokio::test]
    async fn antigravity_uses_discovery() {
        let report = poller(Database::in_memory().unwrap())
            .poll_provider(Provider::Antigravity, &Settings::default())
            .await;
        assert!(matches!(report.outcome, PollOutcome::NotConnected(_)));
    }

    #[tokio::test]
    async fn level_follows_thresholds() {
        let db = Database::in_memory().unwrap();
        let (url, _request) = serve_once("200 OK", r#"{"usage_percent": 85}"#).await;
        db.set_credential(Provider::ZAi, &credential(&url)).unwrap();

        let report = poller(db)
            .poll_provider(Provider::ZAi, &Settings::default())
            .await;
        assert_eq!(report.level, Some(UsageLevel::Critical));
    }

    #[tokio::test]
    async fn poll_all_covers_every_provider() {
        let reports = poller(Database::in_memory().unwrap()).poll_all().await;
        let providers: Vec<Provider> = reports.iter().map(|r| r.provider).collect();
        assert_eq!(providers, Provider::all().to_vec());
    }

    #[test]
    fn refresh_period_saturates() {
        assert_eq!(refresh_period(15), Duration::from_secs(900));
        assert_eq!(refresh_period(0), Duration::from_secs(60));
        assert_eq!(refresh_period(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
