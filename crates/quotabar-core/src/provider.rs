//! Tracked AI-assistant providers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// An external AI-assistant service whose quota is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Z.ai coding plan.
    #[serde(rename = "z_ai")]
    ZAi,
    /// Claude.ai subscription.
    Claude,
    /// ChatGPT Codex.
    Codex,
    /// Antigravity IDE (local language server, no web login).
    Antigravity,
}

impl Provider {
    /// All providers in display order.
    pub fn all() -> &'static [Provider] {
        &[
            Provider::ZAi,
            Provider::Claude,
            Provider::Codex,
            Provider::Antigravity,
        ]
    }

    /// Returns the storage identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::ZAi => "z_ai",
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Antigravity => "antigravity",
        }
    }

    /// Parses a provider identifier. Accepts a few common spellings.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "z_ai" | "zai" | "z.ai" | "z-ai" => Some(Provider::ZAi),
            "claude" => Some(Provider::Claude),
            "codex" | "chatgpt" => Some(Provider::Codex),
            "antigravity" | "gemini" => Some(Provider::Antigravity),
            _ => None,
        }
    }

    /// Human-friendly name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::ZAi => "Z.ai",
            Provider::Claude => "Claude",
            Provider::Codex => "ChatGPT Codex",
            Provider::Antigravity => "Antigravity",
        }
    }

    /// Whether this provider is connected through an interactive browser capture.
    ///
    /// Antigravity is reached through local endpoint discovery instead.
    pub fn uses_capture(&self) -> bool {
        !matches!(self, Provider::Antigravity)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::parse(s).ok_or_else(|| CoreError::UnknownProvider(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_identifiers() {
        for provider in Provider::all() {
            assert_eq!(Provider::parse(provider.as_str()), Some(*provider));
        }
    }

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!(Provider::parse("Z.AI"), Some(Provider::ZAi));
        assert_eq!(Provider::parse(" chatgpt "), Some(Provider::Codex));
        assert_eq!(Provider::parse("copilot"), None);
    }

    #[test]
    fn from_str_reports_unknown() {
        let err = "nope".parse::<Provider>().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn only_antigravity_skips_capture() {
        assert!(Provider::Claude.uses_capture());
        assert!(!Provider::Antigravity.uses_capture());
    }

    #[test]
    fn serde_uses_storage_identifier() {
        let json = serde_json::to_string(&Provider::ZAi).unwrap();
        assert_eq!(json, "\"z_ai\"");
    }
}
