//! Engine Configuration
//!
//! Values come from `CRAFTBOOK_*` environment variables (a `.env` file is
//! honored through dotenvy), falling back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_REMOTE_URL: &str = "https://api.craftbook.app/v1/";
const DEFAULT_PRIVATE_URL: &str = "https://api.craftbook.app/v1/private/";
const CACHE_FILE_NAME: &str = "craftbook-cache.db";

const MIN_PAGE_SIZE: u32 = 1;
const MAX_PAGE_SIZE: u32 = 400;

const MIN_STATUS_TTL_SECS: u64 = 1;
const MAX_STATUS_TTL_SECS: u64 = 24 * 60 * 60;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite file backing the local cache
    pub cache_path: PathBuf,

    /// Shared (public) record store
    pub remote_base_url: String,

    /// Per-user key-value store
    pub private_base_url: String,

    /// Bearer token for both stores
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    /// Records requested per catalog page
    pub page_size: u32,

    /// RPC timeout; a timeout is treated as a network failure
    pub request_timeout_secs: u64,

    /// Minimum interval between two report submissions
    pub submission_cooldown_secs: u64,

    /// Recent search history cap
    pub recent_search_limit: usize,

    /// How long a fetched report status is trusted before polling again
    pub report_status_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            remote_base_url: DEFAULT_REMOTE_URL.to_string(),
            private_base_url: DEFAULT_PRIVATE_URL.to_string(),
            api_token: None,
            page_size: 100,
            request_timeout_secs: 30,
            submission_cooldown_secs: 30,
            recent_search_limit: 10,
            report_status_ttl_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("CRAFTBOOK_CACHE_PATH") {
            config.cache_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("CRAFTBOOK_REMOTE_URL") {
            config.remote_base_url = validate_url("CRAFTBOOK_REMOTE_URL", url)?;
        }
        if let Some(url) = lookup("CRAFTBOOK_PRIVATE_URL") {
            config.private_base_url = validate_url("CRAFTBOOK_PRIVATE_URL", url)?;
        }
        config.api_token = lookup("CRAFTBOOK_API_TOKEN").filter(|t| !t.is_empty());

        if let Some(value) = lookup("CRAFTBOOK_PAGE_SIZE") {
            let size: u32 = parse_number("CRAFTBOOK_PAGE_SIZE", &value)?;
            config.page_size = size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
        }
        if let Some(value) = lookup("CRAFTBOOK_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_number("CRAFTBOOK_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("CRAFTBOOK_SUBMISSION_COOLDOWN_SECS") {
            config.submission_cooldown_secs =
                parse_number("CRAFTBOOK_SUBMISSION_COOLDOWN_SECS", &value)?;
        }
        if let Some(value) = lookup("CRAFTBOOK_RECENT_SEARCH_LIMIT") {
            config.recent_search_limit = parse_number("CRAFTBOOK_RECENT_SEARCH_LIMIT", &value)?;
        }
        if let Some(value) = lookup("CRAFTBOOK_REPORT_STATUS_TTL_SECS") {
            let ttl: u64 = parse_number("CRAFTBOOK_REPORT_STATUS_TTL_SECS", &value)?;
            config.report_status_ttl_secs = ttl.clamp(MIN_STATUS_TTL_SECS, MAX_STATUS_TTL_SECS);
        }

        Ok(config)
    }

    /// Report status TTL, kept within 1 second and 1 day however the config was built
    pub fn report_status_ttl(&self) -> Duration {
        Duration::from_secs(
            self.report_status_ttl_secs
                .clamp(MIN_STATUS_TTL_SECS, MAX_STATUS_TTL_SECS),
        )
    }
}

/// Default cache location inside the platform data directory
fn default_cache_path() -> PathBuf {
    match directories::ProjectDirs::from("com", "craftbook", "craftbook-sync") {
        Some(dirs) => dirs.data_dir().join(CACHE_FILE_NAME),
        None => {
            log::warn!("Failed to get app directories, using temp dir for cache");
            std::env::temp_dir().join(CACHE_FILE_NAME)
        }
    }
}

fn validate_url(key: &'static str, value: String) -> Result<String, ConfigError> {
    let url = Url::parse(&value).map_err(|e| ConfigError::InvalidValue {
        key,
        message: e.to_string(),
    })?;

    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidValue {
            key,
            message: format!("{} cannot be used as a base URL", value),
        });
    }

    Ok(value)
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.submission_cooldown_secs, 30);
        assert_eq!(config.recent_search_limit, 10);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.api_token.is_none());
        assert!(config.cache_path.ends_with(CACHE_FILE_NAME));
    }

    #[test]
    fn test_config_from_lookup_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("CRAFTBOOK_CACHE_PATH", "/tmp/test-cache.db"),
            ("CRAFTBOOK_REMOTE_URL", "http://localhost:8080/api/"),
            ("CRAFTBOOK_API_TOKEN", "secret"),
            ("CRAFTBOOK_PAGE_SIZE", "5000"),
            ("CRAFTBOOK_SUBMISSION_COOLDOWN_SECS", "45"),
        ]))
        .unwrap();

        assert_eq!(config.cache_path, PathBuf::from("/tmp/test-cache.db"));
        assert_eq!(config.remote_base_url, "http://localhost:8080/api/");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.page_size, MAX_PAGE_SIZE);
        assert_eq!(config.submission_cooldown_secs, 45);
        assert_eq!(config.private_base_url, DEFAULT_PRIVATE_URL);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let result = EngineConfig::from_lookup(lookup_from(&[("CRAFTBOOK_PAGE_SIZE", "lots")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key: "CRAFTBOOK_PAGE_SIZE", .. })
        ));

        let result = EngineConfig::from_lookup(lookup_from(&[("CRAFTBOOK_REMOTE_URL", "mailto:a@b.c")]));
        assert!(result.is_err());

        let result = EngineConfig::from_lookup(lookup_from(&[("CRAFTBOOK_PRIVATE_URL", "not a url")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_report_status_ttl_clamped() {
        let config = EngineConfig::from_lookup(lookup_from(&[(
            "CRAFTBOOK_REPORT_STATUS_TTL_SECS",
            "18446744073709551615",
        )]))
        .unwrap();
        assert_eq!(config.report_status_ttl_secs, MAX_STATUS_TTL_SECS);

        let config = EngineConfig::from_lookup(lookup_from(&[("CRAFTBOOK_REPORT_STATUS_TTL_SECS", "0")])).unwrap();
        assert_eq!(config.report_status_ttl(), Duration::from_secs(1));

        let config = EngineConfig {
            report_status_ttl_secs: u64::MAX,
            ..EngineConfig::default()
        };
        assert_eq!(config.report_status_ttl(), Duration::from_secs(MAX_STATUS_TTL_SECS));
    }

    #[test]
    fn test_empty_token_ignored() {
        let config = EngineConfig::from_lookup(lookup_from(&[("CRAFTBOOK_API_TOKEN", "")])).unwrap();
        assert!(config.api_token.is_none());
    }
}
