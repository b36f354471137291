//! Durable endpoint credentials produced by capture.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::provider::Provider;

/// Header that must never be persisted or replayed.
pub const COOKIE_HEADER: &str = "cookie";

/// The `{url, headers}` pair needed to replay a usage request without a browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCredential {
    /// Usage endpoint URL.
    pub url: String,
    /// Request headers, names lower-cased, cookie removed.
    pub headers: BTreeMap<String, String>,
}

impl EndpointCredential {
    /// Creates a credential, dropping any cookie header.
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        Self {
            url: url.into(),
            headers,
        }
        .without_cookies()
    }

    /// Returns a copy with every cookie header removed (case-insensitive).
    pub fn without_cookies(mut self) -> Self {
        self.headers
            .retain(|name, _| !name.eq_ignore_ascii_case(COOKIE_HEADER));
        self
    }
}

/// Key/value credential storage keyed by provider.
///
/// Implementations must never hand back a cookie header, and must treat an
/// unreadable stored value as absent rather than failing.
pub trait CredentialStore: Send + Sync {
    /// Returns the stored credential, if any.
    fn get(&self, provider: Provider) -> Result<Option<EndpointCredential>>;

    /// Stores or replaces a credential.
    fn set(&self, provider: Provider, credential: &EndpointCredential) -> Result<()>;

    /// Removes a credential. Returns true if one existed.
    fn delete(&self, provider: Provider) -> Result<bool>;

    /// Returns true if a readable credential exists.
    fn has(&self, provider: Provider) -> Result<bool> {
        Ok(self.get(provider)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_strips_cookie_any_case() {
        let mut headers = BTreeMap::new();
        headers.insert("Cookie".to_string(), "session=abc".to_string());
        headers.insert("authorization".to_string(), "Bearer x".to_string());

        let credential = EndpointCredential::new("https://example.com/usage", headers);
        assert_eq!(credential.headers.len(), 1);
        assert!(credential.headers.contains_key("authorization"));
    }

    #[test]
    fn serde_shape() {
        let credential = EndpointCredential::new("https://example.com", BTreeMap::new());
        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["url"], "https://example.com");
        assert!(json["headers"].is_object());
    }
}
