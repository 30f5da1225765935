//! Layered runtime configuration.
//!
//! Resolution order, later layers winning: built-in defaults, `local_settings`
//! rows in the `sync` category, then `PREVENTA_*` environment variables. The
//! API token falls back to the OS keyring. A connection string in any layer
//! provisions URL, token and vendor id at once.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::agent::{AgentConfig, DEFAULT_DEFERRED_SYNC_TAG};
use crate::api::{normalize_api_url, parse_connection_string};
use crate::db::{self, DbState, StoreError};
use crate::sync::SyncConfig;

/// `local_settings` category holding sync overrides.
pub const SETTINGS_CATEGORY: &str = "sync";

pub const ENV_DATA_DIR: &str = "PREVENTA_DATA_DIR";

/// Environment variable -> setting key.
const ENV_KEYS: &[(&str, &str)] = &[
    ("PREVENTA_CONNECTION_STRING", "connection_string"),
    ("PREVENTA_API_URL", "api_url"),
    ("PREVENTA_API_TOKEN", "api_token"),
    ("PREVENTA_VENDOR_ID", "vendor_id"),
    ("PREVENTA_MAX_RETRIES", "max_retries"),
    ("PREVENTA_SUBMIT_TIMEOUT_SECS", "submit_timeout_secs"),
    ("PREVENTA_SYNC_INTERVAL_SECS", "sync_interval_secs"),
    ("PREVENTA_CACHE_VERSION", "cache_version"),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("API base URL is not configured (set PREVENTA_API_URL or a connection string)")]
    MissingApiUrl,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub api_url: String,
    pub api_token: Option<Zeroizing<String>>,
    pub vendor_id: Option<String>,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub submit_timeout: Duration,
    pub sync_interval: Duration,
    pub cache_version: String,
    pub deferred_sync_tag: String,
    pub api_prefix: String,
    pub auth_path: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("data_dir", &self.data_dir)
            .field("api_url", &self.api_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("vendor_id", &self.vendor_id)
            .field("max_retries", &self.max_retries)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_cap", &self.backoff_cap)
            .field("submit_timeout", &self.submit_timeout)
            .field("sync_interval", &self.sync_interval)
            .field("cache_version", &self.cache_version)
            .field("deferred_sync_tag", &self.deferred_sync_tag)
            .finish()
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse(key, value)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

/// Data directory: `PREVENTA_DATA_DIR`, or the per-user default.
pub fn resolve_data_dir() -> PathBuf {
    std::env::var(ENV_DATA_DIR)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(crate::diagnostics::default_data_dir)
}

impl AppConfig {
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            api_url: String::new(),
            api_token: None,
            vendor_id: None,
            max_retries: 6,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(30),
            sync_interval: Duration::from_secs(15),
            cache_version: env!("CARGO_PKG_VERSION").to_string(),
            deferred_sync_tag: DEFAULT_DEFERRED_SYNC_TAG.to_string(),
            api_prefix: "/api/".to_string(),
            auth_path: "/api/auth".to_string(),
        }
    }

    /// Full resolution: defaults, database settings, environment, keyring.
    pub fn load(data_dir: &Path, db: &DbState) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(data_dir);

        let settings = {
            let conn = db.lock()?;
            db::get_category_settings(&conn, SETTINGS_CATEGORY)?
        };
        config.apply_settings(&settings)?;
        config.apply_env()?;

        if config.api_token.is_none() {
            config.api_token = crate::storage::get_api_token();
        }
        if config.api_url.is_empty() {
            if let Some(url) = crate::storage::get_api_url() {
                config.api_url = normalize_api_url(&url);
            }
        }
        if config.vendor_id.is_none() {
            config.vendor_id = crate::storage::get_vendor_id();
        }

        config.validate()?;
        debug!(config = ?config, "Configuration resolved");
        Ok(config)
    }

    pub fn apply_settings(&mut self, settings: &[(String, String)]) -> Result<(), ConfigError> {
        // Connection strings first so explicit keys in the same layer win.
        let (bundles, rest): (Vec<_>, Vec<_>) = settings
            .iter()
            .partition(|(key, _)| key == "connection_string");
        for (key, value) in bundles.into_iter().chain(rest) {
            self.apply_value(key, value)?;
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for (env_name, key) in ENV_KEYS {
            if let Some(value) = lookup(env_name).filter(|v| !v.trim().is_empty()) {
                self.apply_value(key, &value)?;
            }
        }
        Ok(())
    }

    /// Apply one setting. Unknown keys are ignored with a warning.
    pub fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "connection_string" => {
                let connection =
                    parse_connection_string(value).ok_or_else(|| ConfigError::Invalid {
                        key: key.to_string(),
                        value: "<connection string>".to_string(),
                    })?;
                if let Some(url) = connection.url {
                    self.api_url = url;
                }
                if let Some(token) = connection.key {
                    self.api_token = Some(Zeroizing::new(token));
                }
                if connection.vendor_id.is_some() {
                    self.vendor_id = connection.vendor_id;
                }
            }
            "api_url" => self.api_url = normalize_api_url(value),
            "api_token" => self.api_token = Some(Zeroizing::new(value.trim().to_string())),
            "vendor_id" => self.vendor_id = Some(value.trim().to_string()),
            "max_retries" => self.max_retries = parse(key, value)?,
            "backoff_base_ms" => self.backoff_base = parse_millis(key, value)?,
            "backoff_cap_ms" => self.backoff_cap = parse_millis(key, value)?,
            "submit_timeout_secs" => self.submit_timeout = parse_secs(key, value)?,
            "sync_interval_secs" => self.sync_interval = parse_secs(key, value)?,
            "cache_version" => self.cache_version = value.trim().to_string(),
            "deferred_sync_tag" => self.deferred_sync_tag = value.trim().to_string(),
            "auth_path" => self.auth_path = value.trim().to_string(),
            other => warn!(key = other, "Ignoring unknown sync setting"),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.is_empty() {
            return Err(ConfigError::MissingApiUrl);
        }
        if self.backoff_cap < self.backoff_base {
            return Err(ConfigError::Invalid {
                key: "backoff_cap_ms".to_string(),
                value: self.backoff_cap.as_millis().to_string(),
            });
        }
        if self.cache_version.is_empty() {
            return Err(ConfigError::Invalid {
                key: "cache_version".to_string(),
                value: String::new(),
            });
        }
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            backoff_base: self.backoff_base,
            backoff_cap: self.backoff_cap,
            submit_timeout: self.submit_timeout,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            cache_version: self.cache_version.clone(),
            api_prefix: self.api_prefix.clone(),
            auth_path: self.auth_path.clone(),
            deferred_sync_tag: self.deferred_sync_tag.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_engine_contract() {
        let config = AppConfig::defaults(Path::new("/tmp/preventa"));
        assert_eq!(config.max_retries, 6);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_cap, Duration::from_secs(30));
        assert_eq!(config.sync_interval, Duration::from_secs(15));
        assert_eq!(config.deferred_sync_tag, "sync-pedidos");
        assert_eq!(config.cache_version, env!("CARGO_PKG_VERSION"));
        assert!(matches!(config.validate(), Err(ConfigError::MissingApiUrl)));
    }

    #[test]
    fn settings_override_defaults() {
        let mut config = AppConfig::defaults(Path::new("."));
        config
            .apply_settings(&settings(&[
                ("api_url", "ventas.example.com/api"),
                ("max_retries", "3"),
                ("backoff_cap_ms", "10000"),
                ("sync_interval_secs", "60"),
            ]))
            .unwrap();

        assert_eq!(config.api_url, "https://ventas.example.com");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.sync_config().backoff_cap, Duration::from_secs(10));
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn explicit_keys_beat_connection_string_in_same_layer() {
        let mut config = AppConfig::defaults(Path::new("."));
        config
            .apply_settings(&settings(&[
                ("api_url", "https://override.example.com"),
                (
                    "connection_string",
                    r#"{"url":"https://bundle.example.com","key":"tok","vid":"V-1"}"#,
                ),
            ]))
            .unwrap();

        assert_eq!(config.api_url, "https://override.example.com");
        assert_eq!(config.api_token.as_deref().map(String::as_str), Some("tok"));
        assert_eq!(config.vendor_id.as_deref(), Some("V-1"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = AppConfig::defaults(Path::new("."));
        assert!(matches!(
            config.apply_value("max_retries", "many"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(config.apply_value("sync_interval_secs", "0").is_err());
        assert!(config.apply_value("connection_string", "???").is_err());
        config.apply_value("unknown_key", "x").unwrap();
    }

    #[test]
    fn environment_layer_wins_over_settings() {
        let env: HashMap<&str, &str> = [
            ("PREVENTA_API_URL", "https://env.example.com"),
            ("PREVENTA_MAX_RETRIES", "2"),
            ("PREVENTA_CACHE_VERSION", "9"),
            ("PREVENTA_SUBMIT_TIMEOUT_SECS", " "),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::defaults(Path::new("."));
        config
            .apply_settings(&settings(&[
                ("api_url", "https://db.example.com"),
                ("max_retries", "4"),
            ]))
            .unwrap();
        config
            .apply_env_with(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.api_url, "https://env.example.com");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.agent_config().cache_version, "9");
        assert_eq!(config.submit_timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn load_reads_settings_and_process_environment() {
        let dir = tempfile::tempdir().unwrap();
        let state = db::init(dir.path()).unwrap();
        {
            let conn = state.lock().unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "api_url", "https://db.example.com").unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "max_retries", "5").unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "api_token", "db-token").unwrap();
            db::set_setting(&conn, SETTINGS_CATEGORY, "vendor_id", "V-02").unwrap();
        }

        std::env::set_var("PREVENTA_SYNC_INTERVAL_SECS", "45");
        let loaded = AppConfig::load(dir.path(), &state);
        std::env::remove_var("PREVENTA_SYNC_INTERVAL_SECS");
        let config = loaded.unwrap();

        assert_eq!(config.api_url, "https://db.example.com");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.sync_interval, Duration::from_secs(45));
        assert_eq!(config.api_token.as_deref().map(String::as_str), Some("db-token"));
        assert!(!format!("{config:?}").contains("db-token"));
    }

    #[test]
    #[serial]
    fn data_dir_comes_from_environment() {
        std::env::set_var(ENV_DATA_DIR, "/var/lib/preventa");
        let resolved = resolve_data_dir();
        std::env::remove_var(ENV_DATA_DIR);
        assert_eq!(resolved, PathBuf::from("/var/lib/preventa"));
        assert_ne!(resolve_data_dir(), PathBuf::from("/var/lib/preventa"));
    }
}
