//! Configuration file parser for `feed-archive.toml`.
//!
//! The config file is optional: a missing or empty file yields
//! `Config::default()`. Unknown keys are accepted by serde but logged as a
//! warning since they are usually typos. Relative paths resolve against the
//! working directory.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::archive::{Channel, MergeOptions, DEFAULT_PAGE_SIZE};
use crate::feed::FetchOptions;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// A value parsed but cannot be used.
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the persistent archive (pages, manifests, stats, rss.xml).
    pub archive_dir: PathBuf,

    /// Root of the per-cycle delta tree written by `fetch`.
    pub delta_dir: PathBuf,

    /// JSON subscriber registry.
    pub subscribers_path: PathBuf,

    /// Items per page. Must be at least 1.
    pub batch_size: usize,

    /// Feeds downloaded in parallel.
    pub fetch_concurrency: usize,

    /// Per-request timeout in seconds.
    pub fetch_timeout_secs: u64,

    /// Facet merges run in parallel.
    pub merge_concurrency: usize,

    /// Loopback hosts whose links are kept in merged output.
    pub loopback_allowlist: Vec<String>,

    /// Channel metadata of `all/rss.xml`.
    pub channel: Channel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("public"),
            delta_dir: PathBuf::from("dist"),
            subscribers_path: PathBuf::from("subscribers.json"),
            batch_size: DEFAULT_PAGE_SIZE,
            fetch_concurrency: 5,
            fetch_timeout_secs: 15,
            merge_concurrency: 4,
            loopback_allowlist: Vec::new(),
            channel: Channel::default(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "archive_dir",
        "delta_dir",
        "subscribers_path",
        "batch_size",
        "fetch_concurrency",
        "fetch_timeout_secs",
        "merge_concurrency",
        "loopback_allowlist",
        "channel",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero batch size or concurrency → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to bound memory use
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
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            archive = %config.archive_dir.display(),
            batch_size = config.batch_size,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("batch_size", self.batch_size),
            ("fetch_concurrency", self.fetch_concurrency),
            ("merge_concurrency", self.merge_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be at least 1")));
            }
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            page_size: self.batch_size,
            loopback_allowlist: self.loopback_allowlist.clone(),
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            concurrency: self.fetch_concurrency,
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            ..FetchOptions::default()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
