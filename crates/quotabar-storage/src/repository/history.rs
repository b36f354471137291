//! Usage history repository.

use chrono::{DateTime, NaiveDate, Utc};
use quotabar_core::Provider;
use rusqlite::{params, Connection};

use super::{format_timestamp, parse_timestamp};
use crate::error::Result;
use crate::models::{DailyPeak, UsageSample};

/// Longest span `daily_peaks` returns.
pub const MAX_PEAK_DAYS: i64 = 30;

/// Repository for usage history operations.
pub struct HistoryRepo;

impl HistoryRepo {
    /// Record a primary percentage.
    pub fn append(
        conn: &Connection,
        provider: Provider,
        recorded_at: DateTime<Utc>,
        percentage: i64,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO usage_history (provider, recorded_at, percentage) VALUES (?1, ?2, ?3)",
            params![provider.as_str(), format_timestamp(recorded_at), percentage],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Samples for a provider at or after `since`, oldest first.
    pub fn since(
        conn: &Connection,
        provider: Provider,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageSample>> {
        let mut stmt = conn.prepare(
            "SELECT id, recorded_at, percentage FROM usage_history
             WHERE provider = ?1 AND recorded_at >= ?2
             ORDER BY recorded_at ASC, id ASC",
        )?;

        let samples = stmt
            .query_map(params![provider.as_str(), format_timestamp(since)], |row| {
                let recorded_at: String = row.get(1)?;
                Ok((row.get::<_, i64>(0)?, recorded_at, row.get::<_, i64>(2)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, recorded_at, percentage)| {
                Some(UsageSample {
                    id,
                    provider,
                    recorded_at: parse_timestamp(&recorded_at)?,
                    percentage,
                })
            })
            .collect();

        Ok(samples)
    }

    /// Highest percentage per UTC day at or after `since`, oldest first,
    /// limited to the most recent [`MAX_PEAK_DAYS`] days.
    pub fn daily_peaks(
        conn: &Connection,
        provider: Provider,
        since: DateTime<Utc>,
    ) -> Result<Vec<DailyPeak>> {
        let mut stmt = conn.prepare(
            "SELECT substr(recorded_at, 1, 10) AS day, MAX(percentage) FROM usage_history
             WHERE provider = ?1 AND recorded_at >= ?2
             GROUP BY day ORDER BY day DESC LIMIT ?3",
        )?;

        let mut peaks: Vec<DailyPeak> = stmt
            .query_map(
                params![provider.as_str(), format_timestamp(since), MAX_PEAK_DAYS],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?
            .filter_map(|r| r.ok())
            .filter_map(|(day, percentage)| {
                Some(DailyPeak {
                    date: NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok()?,
                    percentage,
                })
            })
            .collect();

        peaks.reverse();
        Ok(peaks)
    }

    /// Delete samples recorded before `before`. Returns the number removed.
    pub fn prune_before(conn: &Connection, before: DateTime<Utc>) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM usage_history WHERE recorded_at < ?1",
            [format_timestamp(before)],
        )?;
        Ok(deleted)
    }
}
