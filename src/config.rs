use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

pub const DEFAULT_CONFIG_FILE: &str = "artifact-retrieval.json";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_HOLD_OFF: Duration = Duration::from_secs(5);
pub const MAX_HOLD_OFF: Duration = Duration::from_secs(600);
pub const DEFAULT_CRC_CHECK_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024 * 1024;
pub const DEFAULT_CLOUD_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    hold_off: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, hold_off: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            hold_off: hold_off.min(MAX_HOLD_OFF),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn hold_off(&self) -> Duration {
        self.hold_off
    }

    pub fn with_attempts(self, max_attempts: u32) -> Self {
        Self::new(max_attempts, self.hold_off)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_HOLD_OFF)
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub reference_only: bool,
    pub unzip_on_retrieve: bool,
    pub search_cloud_archive: bool,
    pub search_long_term_archive: bool,
    pub retry: RetryPolicy,
    pub crc_check_threshold_bytes: u64,
    pub verify_hash_after_copy: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            reference_only: false,
            unzip_on_retrieve: true,
            search_cloud_archive: true,
            search_long_term_archive: true,
            retry: RetryPolicy::default(),
            crc_check_threshold_bytes: DEFAULT_CRC_CHECK_THRESHOLD_BYTES,
            verify_hash_after_copy: false,
        }
    }
}

impl From<&ResolvedConfig> for RetrievalOptions {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            reference_only: false,
            unzip_on_retrieve: true,
            search_cloud_archive: config.search_cloud_archive && config.cloud_index.is_some(),
            search_long_term_archive: config.search_long_term_archive,
            retry: config.retry,
            crc_check_threshold_bytes: config.crc_check_threshold_bytes,
            verify_hash_after_copy: config.verify_hash_after_copy,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub crc_check_threshold_bytes: Option<u64>,
    #[serde(default)]
    pub search_cloud_archive: Option<bool>,
    #[serde(default)]
    pub search_long_term_archive: Option<bool>,
    #[serde(default)]
    pub verify_hash_after_copy: Option<bool>,
    #[serde(default)]
    pub cloud_index: Option<CloudIndexEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub hold_off_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CloudIndexEntry {
    pub base_url: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudIndexConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub work_dir: Utf8PathBuf,
    pub retry: RetryPolicy,
    pub crc_check_threshold_bytes: u64,
    pub search_cloud_archive: bool,
    pub search_long_term_archive: bool,
    pub verify_hash_after_copy: bool,
    pub cloud_index: Option<CloudIndexConfig>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, RetrievalError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| RetrievalError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| RetrievalError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, RetrievalError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let work_dir = match config.work_dir {
            Some(dir) if !dir.trim().is_empty() => Utf8PathBuf::from(dir.trim()),
            _ => default_work_dir()?,
        };

        let retry = match config.retry {
            Some(entry) => RetryPolicy::new(
                entry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                entry
                    .hold_off_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_HOLD_OFF),
            ),
            None => RetryPolicy::default(),
        };

        let cloud_index = match config.cloud_index {
            Some(entry) => {
                let base_url = entry.base_url.trim().trim_end_matches('/').to_string();
                if base_url.is_empty() {
                    return Err(RetrievalError::ConfigParse(
                        "cloud_index.base_url must not be empty".to_string(),
                    ));
                }
                Some(CloudIndexConfig {
                    base_url,
                    timeout: Duration::from_secs(
                        entry.timeout_secs.unwrap_or(DEFAULT_CLOUD_TIMEOUT_SECS),
                    ),
                })
            }
            None => None,
        };

        Ok(ResolvedConfig {
            schema_version,
            work_dir,
            retry,
            crc_check_threshold_bytes: config
                .crc_check_threshold_bytes
                .unwrap_or(DEFAULT_CRC_CHECK_THRESHOLD_BYTES),
            search_cloud_archive: config.search_cloud_archive.unwrap_or(true),
            search_long_term_archive: config.search_long_term_archive.unwrap_or(true),
            verify_hash_after_copy: config.verify_hash_after_copy.unwrap_or(false),
            cloud_index,
        })
    }
}

fn default_work_dir() -> Result<Utf8PathBuf, RetrievalError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(
                dirs.home_dir()
                    .join(".cache")
                    .join("artifact-retrieval")
                    .join("work"),
            )
            .ok()
        })
        .ok_or_else(|| RetrievalError::Filesystem("unable to resolve work directory".to_string()))
}
