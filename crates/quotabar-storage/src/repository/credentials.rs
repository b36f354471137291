//! Captured endpoint credentials.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quotabar_core::{EndpointCredential, Provider};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{format_timestamp, parse_timestamp};
use crate::error::Result;
use crate::models::CredentialSummary;

/// Repository for credential operations.
///
/// Cookie headers are stripped on write and again on read, so a row
/// written by an older build can never leak one.
pub struct CredentialsRepo;

impl CredentialsRepo {
    /// Get the credential for a provider.
    ///
    /// A row that cannot be decoded reads as absent.
    pub fn get(conn: &Connection, provider: Provider) -> Result<Option<EndpointCredential>> {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT url, headers FROM credentials WHERE provider = ?1",
                [provider.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((url, headers_json)) = row else {
            return Ok(None);
        };

        if url.trim().is_empty() {
            warn!("Stored {} credential has no URL, ignoring", provider);
            return Ok(None);
        }

        match serde_json::from_str::<BTreeMap<String, String>>(&headers_json) {
            Ok(headers) => Ok(Some(EndpointCredential::new(url, headers))),
            Err(e) => {
                warn!("Stored {} credential is unreadable: {}", provider, e);
                Ok(None)
            }
        }
    }

    /// Store or replace the credential for a provider.
    pub fn set(
        conn: &Connection,
        provider: Provider,
        credential: &EndpointCredential,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let credential = credential.clone().without_cookies();
        let headers_json = serde_json::to_string(&credential.headers)?;

        conn.execute(
            "INSERT INTO credentials (provider, url, headers, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(provider) DO UPDATE SET url = ?2, headers = ?3, updated_at = ?4",
            params![
                provider.as_str(),
                credential.url,
                headers_json,
                format_timestamp(now)
            ],
        )?;

        Ok(())
    }

    /// Delete the credential for a provider.
    pub fn delete(conn: &Connection, provider: Provider) -> Result<bool> {
        let deleted = conn.execute(
            "DELETE FROM credentials WHERE provider = ?1",
            [provider.as_str()],
        )?;
        Ok(deleted > 0)
    }

    /// Returns true if a readable credential exists.
    pub fn has(conn: &Connection, provider: Provider) -> Result<bool> {
        Ok(Self::get(conn, provider)?.is_some())
    }

    /// Lists readable credentials without exposing header values.
    pub fn list(conn: &Connection) -> Result<Vec<CredentialSummary>> {
        let mut stmt =
            conn.prepare("SELECT provider, updated_at FROM credentials ORDER BY provider")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let mut summaries = Vec::new();
        for (provider, updated_at) in rows {
            let Some(provider) = Provider::parse(&provider) else {
                warn!("Ignoring credential for unknown provider {}", provider);
                continue;
            };
            let Some(credential) = Self::get(conn, provider)? else {
                continue;
            };
            summaries.push(CredentialSummary {
                provider,
                url: credential.url,
                header_count: credential.headers.len(),
                updated_at: parse_timestamp(&updated_at).unwrap_or_else(Utc::now),
            });
        }
        Ok(summaries)
    }
}
