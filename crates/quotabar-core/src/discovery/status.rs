//! Quota status from the local language server.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::probe::{api_headers, loopback_client};
use super::{DiscoveredEndpoint, Discovery, EndpointDiscovery};
use crate::error::{CoreError, Result};
use crate::extractor::{finalize, parse_timestamp_str};
use crate::metric::{ExtractionResult, UsageMetric};

/// Status call returning per-model quota.
pub const STATUS_PATH: &str = "/exa.language_server_pb.LanguageServerService/GetUserStatus";

/// Status fetch timeout.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

const GEMINI_PRO: &str = "Gemini 3 Pro";
const GEMINI_FLASH: &str = "Gemini 3 Flash";
const EXTERNAL_MODELS: &str = "External Models";
const UNKNOWN_MODEL: &str = "Unknown Model";

/// Quota pool a model draws from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Pool {
    GeminiPro,
    GeminiFlash,
    Gemini(String),
    External,
}

impl Pool {
    fn for_model(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.contains("claude") || lower.contains("gpt") {
            Pool::External
        } else if lower.contains("gemini") && lower.contains("pro") {
            Pool::GeminiPro
        } else if lower.contains("gemini") && lower.contains("flash") {
            Pool::GeminiFlash
        } else if lower.contains("gemini") {
            Pool::Gemini(label.to_string())
        } else {
            Pool::External
        }
    }

    fn label(&self) -> &str {
        match self {
            Pool::GeminiPro => GEMINI_PRO,
            Pool::GeminiFlash => GEMINI_FLASH,
            Pool::Gemini(label) => label,
            Pool::External => EXTERNAL_MODELS,
        }
    }
}

#[derive(Debug, Default)]
struct PoolUsage {
    percentage: i64,
    reset: Option<DateTime<Utc>>,
}

/// Turns a `GetUserStatus` response into usage metrics.
///
/// Models sharing a quota pool report the pool's highest usage and its
/// earliest reset.
pub fn parse_user_status(status: &Value, now: DateTime<Utc>) -> ExtractionResult {
    let Some(configs) = status
        .pointer("/userStatus/cascadeModelConfigData/clientModelConfigs")
        .and_then(Value::as_array)
    else {
        return ExtractionResult::empty();
    };

    let mut pools: BTreeMap<Pool, PoolUsage> = BTreeMap::new();

    for config in configs {
        // Models without quota info are unmetered.
        let Some(quota) = config.get("quotaInfo").filter(|q| !q.is_null()) else {
            continue;
        };
        let label = config
            .get("label")
            .and_then(Value::as_str)
            .filter(|l| !l.is_empty())
            .unwrap_or(UNKNOWN_MODEL);
        let remaining = quota
            .get("remainingFraction")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        let percentage = ((1.0 - remaining) * 100.0).round() as i64;
        let reset = quota
            .get("resetTime")
            .and_then(Value::as_str)
            .and_then(parse_timestamp_str);

        let usage = pools.entry(Pool::for_model(label)).or_default();
        usage.percentage = usage.percentage.max(percentage);
        usage.reset = match (usage.reset, reset) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    let metrics = pools
        .into_iter()
        .map(|(pool, usage)| {
            UsageMetric::new(pool.label(), usage.percentage).with_reset(usage.reset, now)
        })
        .collect();

    finalize(metrics)
}

/// Outcome of one local status fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalUsage {
    /// Usage read from the local server.
    Connected(ExtractionResult),
    /// The local server could not be reached this cycle.
    NotConnected(String),
}

/// Reads quota from the local server, caching the discovered endpoint.
///
/// The endpoint is kept until a fetch fails; the next call then runs
/// discovery again from the start.
#[derive(Debug)]
pub struct LocalStatusClient {
    discovery: EndpointDiscovery,
    client: reqwest::Client,
    cached: Mutex<Option<DiscoveredEndpoint>>,
}

impl LocalStatusClient {
    /// Creates a client over the given discovery.
    pub fn new(discovery: EndpointDiscovery) -> Result<Self> {
        Ok(Self {
            discovery,
            client: loopback_client(STATUS_TIMEOUT)?,
            cached: Mutex::new(None),
        })
    }

    /// Creates a client backed by operating-system discovery.
    pub fn system() -> Result<Self> {
        Self::new(EndpointDiscovery::system()?)
    }

    /// Returns the cached endpoint, if any.
    pub async fn cached_endpoint(&self) -> Option<DiscoveredEndpoint> {
        self.cached.lock().await.clone()
    }

    /// Drops the cached endpoint.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    /// Fetches current usage.
    pub async fn fetch(&self) -> LocalUsage {
        let mut cached = self.cached.lock().await;

        let endpoint = match cached.clone() {
            Some(endpoint) => endpoint,
            None => match self.discovery.discover().await {
                Discovery::Connected(endpoint) => {
                    *cached = Some(endpoint.clone());
                    endpoint
                }
                Discovery::NotConnected(reason) => {
                    debug!("Local server not connected: {}", reason);
                    return LocalUsage::NotConnected(reason);
                }
            },
        };

        match self.fetch_status(&endpoint).await {
            Ok(status) => {
                let result = parse_user_status(&status, Utc::now());
                info!(
                    "Local status from {}: {} metrics",
                    endpoint.base_url(),
                    result.metrics.len()
                );
                LocalUsage::Connected(result)
            }
            Err(e) => {
                warn!("Local status fetch from {} failed: {}", endpoint.base_url(), e);
                *cached = None;
                LocalUsage::NotConnected(e.to_string())
            }
        }
    }

    async fn fetch_status(&self, endpoint: &DiscoveredEndpoint) -> Result<Value> {
        let url = endpoint.url(STATUS_PATH);
        let body = json!({
            "metadata": {
                "ideName": "antigravity",
                "extensionName": "antigravity",
                "locale": "en"
            }
        });

        let response = self
            .client
            .post(&url)
            .headers(api_headers(endpoint.token.as_deref()))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}
