//! Configuration repository.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Result;
use crate::models::Config;

/// Repository for configuration operations.
pub struct ConfigRepo;

impl ConfigRepo {
    /// Get a configuration entry.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Config>> {
        let config = conn
            .query_row(
                "SELECT key, value FROM config WHERE key = ?1",
                [key],
                row_to_config,
            )
            .optional()?;
        Ok(config)
    }

    /// Set a configuration value (insert or update).
    pub fn set(conn: &Connection, key: &str, value: &Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value_json],
        )?;

        Ok(())
    }

    /// Delete a configuration value.
    pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
        let deleted = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Get all configuration entries ordered by key.
    pub fn get_all(conn: &Connection) -> Result<Vec<Config>> {
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let configs = stmt
            .query_map([], row_to_config)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(configs)
    }

    /// Get a typed value, falling back to `default` when missing or mistyped.
    pub fn get_or_default<T: DeserializeOwned>(conn: &Connection, key: &str, default: T) -> Result<T> {
        match Self::get(conn, key)? {
            Some(config) => Ok(serde_json::from_value(config.value).unwrap_or(default)),
            None => Ok(default),
        }
    }
}

fn row_to_config(row: &Row<'_>) -> rusqlite::Result<Config> {
    let value_str: String = row.get(1)?;
    Ok(Config {
        key: row.get(0)?,
        value: serde_json::from_str(&value_str).unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use serde_json::json;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_upsert() {
        let conn = setup_db();

        ConfigRepo::set(&conn, "refresh_interval_minutes", &json!(15)).unwrap();
        ConfigRepo::set(&conn, "refresh_interval_minutes", &json!(5)).unwrap();

        let config = ConfigRepo::get(&conn, "refresh_interval_minutes").unwrap().unwrap();
        assert_eq!(config.value, json!(5));
        assert_eq!(ConfigRepo::get_all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_key() {
        let conn = setup_db();
        assert!(ConfigRepo::get(&conn, "browser").unwrap().is_none());
        assert!(!ConfigRepo::delete(&conn, "browser").unwrap());
    }

    #[test]
    fn test_delete() {
        let conn = setup_db();
        ConfigRepo::set(&conn, "browser", &json!("/usr/bin/chromium")).unwrap();
        assert!(ConfigRepo::delete(&conn, "browser").unwrap());
        assert!(ConfigRepo::get(&conn, "browser").unwrap().is_none());
    }

    #[test]
    fn test_get_all_is_sorted() {
        let conn = setup_db();
        ConfigRepo::set(&conn, "warning_threshold", &json!(50)).unwrap();
        ConfigRepo::set(&conn, "critical_threshold", &json!(80)).unwrap();

        let keys: Vec<String> = ConfigRepo::get_all(&conn)
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(keys, vec!["critical_threshold", "warning_threshold"]);
    }

    #[test]
    fn test_get_or_default_ignores_wrong_type() {
        let conn = setup_db();

        assert!(ConfigRepo::get_or_default(&conn, "notifications_enabled", true).unwrap());

        ConfigRepo::set(&conn, "notifications_enabled", &json!("yes")).unwrap();
        assert!(ConfigRepo::get_or_default(&conn, "notifications_enabled", true).unwrap());

        ConfigRepo::set(&conn, "notifications_enabled", &json!(false)).unwrap();
        assert!(!ConfigRepo::get_or_default(&conn, "notifications_enabled", true).unwrap());
    }

    #[test]
    fn test_corrupt_value_reads_as_null() {
        let conn = setup_db();
        conn.execute(
            "INSERT INTO config (key, value) VALUES ('browser', 'not json')",
            [],
        )
        .unwrap();
        let config = ConfigRepo::get(&conn, "browser").unwrap().unwrap();
        assert_eq!(config.value, Value::Null);
    }
}
