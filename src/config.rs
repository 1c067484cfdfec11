// src/config.rs

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Number of transfer attempts per segment before the unit is failed.
pub const RETRY_ATTEMPTS: u32 = 3;
/// Pause between two attempts at the same segment.
pub const RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_BASE_URL: &str = "https://everyayah.com/data";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A content variant (a reciter) and the directory its segments live under,
/// both remotely and on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantConfig {
    pub id: String,
    pub directory: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl VariantConfig {
    pub fn new(id: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            directory: directory.into(),
            name: None,
        }
    }
}

/// Settings for the download manager.
///
/// Every field has a default so a TOML file only needs the keys it wants to
/// override, typically `download_root` and `variants`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Remote root the segment URLs are built under.
    pub base_url: String,
    /// Local root; each variant gets its own subdirectory.
    pub download_root: PathBuf,
    /// Upper bound on units downloaded at the same time.
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Only transfer over unmetered connections.
    pub require_unmetered: bool,
    /// Rough size of one segment, used for the display-only byte estimate.
    pub segment_size_estimate: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub variants: Vec<VariantConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            download_root: PathBuf::from("offline_audio"),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            retry_attempts: RETRY_ATTEMPTS,
            retry_delay_ms: RETRY_DELAY_MS,
            require_unmetered: false,
            segment_size_estimate: 64 * 1024,
            request_timeout_secs: 30,
            user_agent: concat!("quran_offline/", env!("CARGO_PKG_VERSION")).to_string(),
            variants: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".into()));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.id.is_empty() || variant.directory.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "variant {:?} needs both an id and a directory",
                    variant.id
                )));
            }
            if variant.directory.contains("..") || variant.directory.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "variant directory {:?} must be a single path component",
                    variant.directory
                )));
            }
            if !seen.insert(variant.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate variant id {:?}", variant.id)));
            }
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ManagerConfig::from_toml_str(
            r#"
            download_root = "/data/audio"
            max_concurrent = 2

            [[variants]]
            id = "alafasy"
            directory = "Alafasy_128kbps"
            name = "Mishary Alafasy"
            "#,
        )
        .unwrap();

        assert_eq!(config.download_root, PathBuf::from("/data/audio"));
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.retry_attempts, RETRY_ATTEMPTS);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.variants.len(), 1);
        assert_eq!(config.variants[0].name.as_deref(), Some("Mishary Alafasy"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = ManagerConfig::from_toml_str("max_concurrent = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_duplicate_variants() {
        let mut config = ManagerConfig::default();
        config.variants.push(VariantConfig::new("a", "A"));
        config.variants.push(VariantConfig::new("a", "B"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_nested_variant_directory() {
        let mut config = ManagerConfig::default();
        config.variants.push(VariantConfig::new("a", "../etc"));
        assert!(config.validate().is_err());
    }
}
