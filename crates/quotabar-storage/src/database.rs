//! High-level database interface.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use quotabar_core::{CoreError, CredentialStore, EndpointCredential, Provider};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::models::{Config, CredentialSummary, DailyPeak, UsageSample};
use crate::repository::{ConfigRepo, CredentialsRepo, HistoryRepo};
use crate::schema::run_migrations;
use crate::settings::Settings;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// High-level database interface for Quotabar.
///
/// Clones share one connection. The poller and a capture can both write,
/// so access is serialized behind a mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open the database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Open the database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let conn = Connection::open(&path)?;
        // WAL only applies to file databases.
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        let db = Self::open(conn)?;
        restrict_permissions(&path);

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(Connection::open_in_memory()?)
    }

    fn open(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Config("Database lock poisoned".to_string()))
    }

    /// App data directory.
    pub fn data_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "quotabar", "quotabar")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("quotabar.db"))
    }

    // === Credentials ===

    /// Get the stored credential for a provider.
    pub fn get_credential(&self, provider: Provider) -> Result<Option<EndpointCredential>> {
        let conn = self.conn()?;
        CredentialsRepo::get(&conn, provider)
    }

    /// Store or replace a credential.
    pub fn set_credential(&self, provider: Provider, credential: &EndpointCredential) -> Result<()> {
        let conn = self.conn()?;
        CredentialsRepo::set(&conn, provider, credential, Utc::now())
    }

    /// Delete a credential.
    pub fn delete_credential(&self, provider: Provider) -> Result<bool> {
        let conn = self.conn()?;
        CredentialsRepo::delete(&conn, provider)
    }

    /// List stored credentials without header values.
    pub fn list_credentials(&self) -> Result<Vec<CredentialSummary>> {
        let conn = self.conn()?;
        CredentialsRepo::list(&conn)
    }

    // === History ===

    /// Record a primary percentage sample.
    pub fn record_usage(
        &self,
        provider: Provider,
        recorded_at: DateTime<Utc>,
        percentage: i64,
    ) -> Result<i64> {
        let conn = self.conn()?;
        HistoryRepo::append(&conn, provider, recorded_at, percentage)
    }

    /// Samples since a cutoff, oldest first.
    pub fn usage_since(&self, provider: Provider, since: DateTime<Utc>) -> Result<Vec<UsageSample>> {
        let conn = self.conn()?;
        HistoryRepo::since(&conn, provider, since)
    }

    /// Daily peak percentages since a cutoff.
    pub fn daily_peaks(&self, provider: Provider, since: DateTime<Utc>) -> Result<Vec<DailyPeak>> {
        let conn = self.conn()?;
        HistoryRepo::daily_peaks(&conn, provider, since)
    }

    /// Delete samples older than a cutoff.
    pub fn prune_history(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        HistoryRepo::prune_before(&conn, before)
    }

    // === Config ===

    /// Get a configuration value.
    pub fn get_config(&self, key: &str) -> Result<Option<Config>> {
        let conn = self.conn()?;
        ConfigRepo::get(&conn, key)
    }

    /// Set a configuration value.
    pub fn set_config(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn()?;
        ConfigRepo::set(&conn, key, value)
    }

    /// Delete a configuration value.
    pub fn delete_config(&self, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        ConfigRepo::delete(&conn, key)
    }

    /// Get all configuration values.
    pub fn get_all_config(&self) -> Result<Vec<Config>> {
        let conn = self.conn()?;
        ConfigRepo::get_all(&conn)
    }

    /// Load typed settings.
    pub fn settings(&self) -> Result<Settings> {
        let conn = self.conn()?;
        Settings::load(&conn)
    }

    /// Validate and store a setting from command-line text.
    ///
    /// An empty value for an optional setting removes it.
    pub fn set_setting(&self, key: &str, raw: &str) -> Result<()> {
        match self.settings()?.validate(key, raw)? {
            Value::Null => {
                self.delete_config(key)?;
                Ok(())
            }
            value => self.set_config(key, &value),
        }
    }
}

impl CredentialStore for Database {
    fn get(&self, provider: Provider) -> quotabar_core::Result<Option<EndpointCredential>> {
        self.get_credential(provider).map_err(store_error)
    }

    fn set(&self, provider: Provider, credential: &EndpointCredential) -> quotabar_core::Result<()> {
        self.set_credential(provider, credential).map_err(store_error)
    }

    fn delete(&self, provider: Provider) -> quotabar_core::Result<bool> {
        self.delete_credential(provider).map_err(store_error)
    }
}

fn store_error(e: StorageError) -> CoreError {
    CoreError::Store(e.to_string())
}

/// Limits the database and its WAL side files to the owner.
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        files.push(PathBuf::from(side));
    }

    for file in files.iter().filter(|f| f.exists()) {
        if let Err(e) = std::fs::set_permissions(file, std::fs::Permissions::from_mode(0o600)) {
            warn!("Could not restrict permissions on {:?}: {}", file, e);
        }
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn credential() -> EndpointCredential {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), "Bearer t".to_string());
        headers.insert("cookie".to_string(), "s=1".to_string());
        EndpointCredential::new("https://chatgpt.com/backend-api/wham/usage", headers)
    }

    #[test]
    fn test_in_memory() {
        let db = Database::in_memory().unwrap();
        assert!(db.list_credentials().unwrap().is_empty());
    }

    #[test]
    fn test_clones_share_connection() {
        let db = Database::in_memory().unwrap();
        let other = db.clone();
        other.set_config("browser", &serde_json::json!("/opt/chrome")).unwrap();
        assert!(db.get_config("browser").unwrap().is_some());
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::with_path(dir.path().join("quotabar.db")).unwrap();

        let mode: String = db
            .conn()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_credential_store_impl() {
        let db = Database::in_memory().unwrap();
        let store: &dyn CredentialStore = &db;

        assert!(!store.has(Provider::Codex).unwrap());
        store.set(Provider::Codex, &credential()).unwrap();
        assert!(store.has(Provider::Codex).unwrap());

        let loaded = store.get(Provider::Codex).unwrap().unwrap();
        assert!(!loaded.headers.contains_key("cookie"));

        assert!(store.delete(Provider::Codex).unwrap());
        assert!(!store.has(Provider::Codex).unwrap());
    }

    #[test]
    fn test_list_credentials() {
        let db = Database::in_memory().unwrap();
        db.set_credential(Provider::Codex, &credential()).unwrap();

        let list = db.list_credentials().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].provider, Provider::Codex);
        assert_eq!(list[0].header_count, 1);
    }

    #[test]
    fn test_settings_round_trip() {
        let db = Database::in_memory().unwrap();
        db.set_setting("refresh_interval_minutes", "3").unwrap();
        db.set_setting("browser", "/opt/chrome").unwrap();
        assert_eq!(db.settings().unwrap().refresh_interval_minutes, 3);

        db.set_setting("browser", "").unwrap();
        assert_eq!(db.settings().unwrap().browser, None);
        assert!(db.set_setting("nope", "1").is_err());
    }

    #[test]
    fn test_critical_below_warning_rejected() {
        let db = Database::in_memory().unwrap();
        db.set_setting("warning_threshold", "70").unwrap();

        assert!(db.set_setting("critical_threshold", "60").is_err());
        assert_eq!(db.settings().unwrap().critical_threshold, 80);

        db.set_setting("critical_threshold", "70").unwrap();
        assert_eq!(db.settings().unwrap().critical_threshold, 70);
    }

    #[test]
    fn test_history() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        db.record_usage(Provider::Claude, now, 42).unwrap();

        let samples = db
            .usage_since(Provider::Claude, now - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].percentage, 42);
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("quotabar.db");

        {
            let db = Database::with_path(&path).unwrap();
            db.set_credential(Provider::Claude, &credential()).unwrap();
        }

        let db = Database::with_path(&path).unwrap();
        assert!(db.get_credential(Provider::Claude).unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("quotabar.db");
        let _db = Database::with_path(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
