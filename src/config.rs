//! Configuration file parser for ~/.config/podfeed/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde, though we log a warning when the file
//! contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::FetchOptions;

/// `User-Agent` sent to feed hosts unless configured otherwise.
pub const DEFAULT_USER_AGENT: &str = concat!("podfeed/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Pipeline configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file. `None` means `podfeed.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Due podcasts pulled per `update` run.
    pub batch_size: usize,

    /// Concurrent update workers.
    pub concurrency: usize,

    pub request_timeout_secs: u64,

    /// Largest feed body accepted, in bytes.
    pub max_feed_size: usize,

    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            batch_size: 360,
            concurrency: 8,
            request_timeout_secs: 30,
            max_feed_size: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 6] = [
        "database_path",
        "batch_size",
        "concurrency",
        "request_timeout_secs",
        "max_feed_size",
        "user_agent",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            batch_size = config.batch_size,
            concurrency = config.concurrency,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Per-request fetch limits.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            max_feed_size: self.max_feed_size,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("podfeed_config_test_{}", name));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database_path, None);
        assert_eq!(config.batch_size, 360);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.max_feed_size, 10 * 1024 * 1024);
        assert!(config.user_agent.starts_with("podfeed/"));
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/podfeed_test_nonexistent_config.toml");
        assert_eq!(Config::load(path).unwrap(), Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let path = write_config("whitespace", "   \n  \n  ");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
        cleanup(&path);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let path = write_config("partial", "concurrency = 2\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.batch_size, 360);
        cleanup(&path);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/podfeed/feeds.db"
batch_size = 1000
concurrency = 16
request_timeout_secs = 10
max_feed_size = 2048
user_agent = "TestBot/1.0"
"#;
        let path = write_config("full", content);
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/podfeed/feeds.db"))
        );
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.user_agent, "TestBot/1.0");

        let options = config.fetch_options();
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.max_feed_size, 2048);
        cleanup(&path);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let path = write_config("invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        cleanup(&path);
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let path = write_config("unknown", "concurrency = 3\ntheme = \"dark\"\n");
        assert_eq!(Config::load(&path).unwrap().concurrency, 3);
        cleanup(&path);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let path = write_config("wrongtype", "batch_size = \"lots\"\n");
        assert!(Config::load(&path).is_err());
        cleanup(&path);
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let path = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        cleanup(&path);
    }

    #[test]
    fn test_zero_timeout_is_raised() {
        let config = Config {
            request_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.fetch_options().timeout, Duration::from_secs(1));
    }
}
