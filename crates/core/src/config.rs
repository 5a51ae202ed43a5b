//! Configuration for the history service.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Identity recorded on events the history service writes on its own behalf.
pub const DEFAULT_SYSTEM_IDENTITY: &str = "history-service";

/// Settings consumed by the reset subsystem and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryServiceConfig {
    /// Shard owning the workflows handled by this instance.
    #[serde(default)]
    pub shard_id: i32,

    /// Number of history batches requested per page read.
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,

    /// Maximum number of run contexts kept in the run cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// Identity stamped on synthetic decision failures and terminations.
    #[serde(default = "default_system_identity")]
    pub system_identity: String,
}

impl Default for HistoryServiceConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            history_page_size: default_history_page_size(),
            cache_capacity: default_cache_capacity(),
            system_identity: default_system_identity(),
        }
    }
}

impl HistoryServiceConfig {
    /// Create a config for the given shard with default settings.
    pub fn for_shard(shard_id: i32) -> Self {
        Self {
            shard_id,
            ..Default::default()
        }
    }

    /// Set the history page size.
    #[must_use]
    pub const fn history_page_size(mut self, page_size: usize) -> Self {
        self.history_page_size = page_size;
        self
    }

    /// Set the run cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the system identity.
    #[must_use]
    pub fn system_identity(mut self, identity: impl Into<String>) -> Self {
        self.system_identity = identity.into();
        self
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Load defaults overridden by `OYA_HISTORY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `OYA_HISTORY_*` overrides read through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("OYA_HISTORY_SHARD_ID") {
            self.shard_id = value
                .parse()
                .map_err(|_| Error::invalid_config("shard_id", format!("not an integer: {value}")))?;
        }

        if let Some(value) = lookup("OYA_HISTORY_PAGE_SIZE") {
            self.history_page_size = value.parse().map_err(|_| {
                Error::invalid_config("history_page_size", format!("not an integer: {value}"))
            })?;
        }

        if let Some(value) = lookup("OYA_HISTORY_CACHE_CAPACITY") {
            self.cache_capacity = value.parse().map_err(|_| {
                Error::invalid_config("cache_capacity", format!("not an integer: {value}"))
            })?;
        }

        if let Some(value) = lookup("OYA_HISTORY_IDENTITY") {
            self.system_identity = value;
        }

        self.validate()
    }

    /// Reject settings the service cannot run with.
    pub fn validate(self) -> Result<Self> {
        if self.history_page_size == 0 {
            return Err(Error::invalid_config("history_page_size", "must be positive"));
        }
        if self.cache_capacity == 0 {
            return Err(Error::invalid_config("cache_capacity", "must be positive"));
        }
        if self.system_identity.trim().is_empty() {
            return Err(Error::invalid_config("system_identity", "must not be empty"));
        }
        Ok(self)
    }
}

const fn default_history_page_size() -> usize {
    100
}

const fn default_cache_capacity() -> u64 {
    512
}

fn default_system_identity() -> String {
    DEFAULT_SYSTEM_IDENTITY.to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = HistoryServiceConfig::default();
        assert_eq!(config.shard_id, 0);
        assert_eq!(config.history_page_size, 100);
        assert_eq!(config.system_identity, DEFAULT_SYSTEM_IDENTITY);
    }

    #[test]
    fn test_config_builder() {
        let config = HistoryServiceConfig::for_shard(7)
            .history_page_size(10)
            .cache_capacity(4)
            .system_identity("reset-worker");

        assert_eq!(config.shard_id, 7);
        assert_eq!(config.history_page_size, 10);
        assert_eq!(config.cache_capacity, 4);
        assert_eq!(config.system_identity, "reset-worker");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = HistoryServiceConfig::from_toml_str("shard_id = 3\n").unwrap();
        assert_eq!(config.shard_id, 3);
        assert_eq!(config.history_page_size, 100);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = HistoryServiceConfig::from_toml_str("history_page_size = 0\n");
        assert!(matches!(err, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = HistoryServiceConfig::from_toml_str("shard_id = [");
        assert!(matches!(err, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn overrides_replace_fields() {
        let env: HashMap<&str, &str> = [
            ("OYA_HISTORY_SHARD_ID", "12"),
            ("OYA_HISTORY_PAGE_SIZE", "25"),
            ("OYA_HISTORY_IDENTITY", "ops"),
        ]
        .into_iter()
        .collect();

        let config = HistoryServiceConfig::default()
            .with_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.shard_id, 12);
        assert_eq!(config.history_page_size, 25);
        assert_eq!(config.system_identity, "ops");
    }

    #[test]
    fn non_numeric_override_is_rejected() {
        let err = HistoryServiceConfig::default().with_overrides(|key| {
            (key == "OYA_HISTORY_SHARD_ID").then(|| "seven".to_string())
        });
        assert!(matches!(err, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "shard_id = 5\nsystem_identity = \"resetter\"").unwrap();

        let config = HistoryServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.shard_id, 5);
        assert_eq!(config.system_identity, "resetter");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = HistoryServiceConfig::from_file(Path::new("/nonexistent/oya-history.toml"));
        assert!(matches!(err, Err(Error::FileReadFailed { .. })));
    }
}
