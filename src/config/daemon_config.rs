use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::duration::serde_duration;
use crate::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_CONFIG_PATH, DEFAULT_JSON_INPUT_PATH, DEFAULT_JSON_MAX_BYTES,
    DEFAULT_JSON_MAX_INTERVAL, DEFAULT_LOG_FILE, DEFAULT_LOG_LEVEL, DEFAULT_MAX_RETRIES,
    DEFAULT_POLL_INTERVAL, DEFAULT_QUEUE_DIR, DEFAULT_STAGING_SUFFIX, ENV_ACCESS_KEY,
    ENV_REGION, ENV_SECRET_KEY, ENV_SESSION_TOKEN,
};

/// Operating mode, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Ship every file dropped into the queue directory
    #[default]
    Parquet,
    /// Tail a single newline-delimited JSON file and ship it in gzip chunks
    Json,
}

impl FromStr for UploadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "parquet" => Ok(UploadMode::Parquet),
            "json" => Ok(UploadMode::Json),
            other => Err(anyhow!("upload.mode must be \"json\" or \"parquet\", got {:?}", other)),
        }
    }
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadMode::Parquet => write!(f, "parquet"),
            UploadMode::Json => write!(f, "json"),
        }
    }
}

impl<'de> Deserialize<'de> for UploadMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Shape of generated object keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyLayout {
    /// `[prefix/]hostname=<host>/date=<YYYYMMDD>/<file>`
    #[default]
    Partitioned,
    /// `[prefix/]<file>`
    Flat,
}

impl FromStr for KeyLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "partitioned" => Ok(KeyLayout::Partitioned),
            "flat" => Ok(KeyLayout::Flat),
            other => Err(anyhow!("upload.key_layout must be \"partitioned\" or \"flat\", got {:?}", other)),
        }
    }
}

impl<'de> Deserialize<'de> for KeyLayout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// S3 connection parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub profile: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub custom_url: Option<String>,
    pub use_path_style: bool,
    pub key_prefix: Option<String>,
}

/// Log destination and verbosity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

/// Upload tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub mode: UploadMode,
    /// Queue directory (parquet mode) or tailed file (json mode)
    pub queue: Option<PathBuf>,
    /// When set, shipped files are moved here instead of deleted
    pub archive_dir: Option<PathBuf>,
    pub concurrency: usize,
    #[serde(with = "serde_duration")]
    pub poll_interval: Duration,
    pub max_retries: usize,
    /// `None` means "use the default", `Some("")` disables claiming
    pub staging_suffix: Option<String>,
    pub json_max_bytes: u64,
    #[serde(with = "serde_duration")]
    pub json_max_interval: Duration,
    pub key_layout: KeyLayout,
    /// Re-ship rotated tail chunks left behind by failed uploads
    pub reship_orphans: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            mode: UploadMode::default(),
            queue: None,
            archive_dir: None,
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            staging_suffix: None,
            json_max_bytes: DEFAULT_JSON_MAX_BYTES,
            json_max_interval: DEFAULT_JSON_MAX_INTERVAL,
            key_layout: KeyLayout::default(),
            reship_orphans: false,
        }
    }
}

impl UploadConfig {
    /// Resolved queue path; only meaningful after defaults were applied
    pub fn queue_path(&self) -> PathBuf {
        self.queue
            .clone()
            .filter(|q| !q.as_os_str().is_empty())
            .unwrap_or_else(|| self.queue_path_default())
    }

    fn queue_path_default(&self) -> PathBuf {
        match self.mode {
            UploadMode::Json => PathBuf::from(DEFAULT_JSON_INPUT_PATH),
            UploadMode::Parquet => PathBuf::from(DEFAULT_QUEUE_DIR),
        }
    }

    /// Staging suffix in effect, `None` when claiming is disabled
    pub fn effective_staging_suffix(&self) -> Option<&str> {
        match self.staging_suffix.as_deref() {
            None => Some(DEFAULT_STAGING_SUFFIX),
            Some("") => None,
            Some(suffix) => Some(suffix),
        }
    }
}

/// Runtime configuration for the daemon, loaded from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(alias = "aws")]
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub upload: UploadConfig,
}

impl DaemonConfig {
    /// Load a YAML configuration file, apply defaults and validate it.
    ///
    /// When `path` is `None` the platform default location is used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_yaml_file(path)?;
        config.apply_defaults(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file without applying defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_yaml_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("Failed to parse config")
    }

    /// Fill unset values from the environment and from built-in defaults.
    ///
    /// `env` is a lookup function so tests do not depend on the process
    /// environment.
    pub fn apply_defaults<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let storage = &mut self.storage;
        fill_from_env(&mut storage.access_key, &env, ENV_ACCESS_KEY);
        fill_from_env(&mut storage.secret_key, &env, ENV_SECRET_KEY);
        fill_from_env(&mut storage.session_token, &env, ENV_SESSION_TOKEN);
        fill_from_env(&mut storage.region, &env, ENV_REGION);

        if self.upload.queue.as_ref().map_or(true, |q| q.as_os_str().is_empty()) {
            self.upload.queue = Some(self.upload.queue_path());
        }
        if self.logging.level.trim().is_empty() {
            self.logging.level = DEFAULT_LOG_LEVEL.to_string();
        }
        if self.logging.file.as_os_str().is_empty() {
            self.logging.file = PathBuf::from(DEFAULT_LOG_FILE);
        }
        if self.upload.concurrency == 0 {
            self.upload.concurrency = DEFAULT_CONCURRENCY;
        }
        if self.upload.max_retries == 0 {
            self.upload.max_retries = DEFAULT_MAX_RETRIES;
        }
    }

    /// Check the configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if is_blank(&self.storage.region) {
            errors.push("storage.region must be set");
        }
        if is_blank(&self.storage.bucket) {
            errors.push("storage.bucket must be set");
        }
        if self.upload.queue.as_ref().map_or(true, |q| q.as_os_str().is_empty()) {
            errors.push("upload.queue must be set");
        }
        if self.upload.poll_interval.is_zero() {
            errors.push("upload.poll_interval must be greater than 0");
        }
        if self.upload.json_max_bytes == 0 {
            errors.push("upload.json_max_bytes must be greater than 0");
        }
        if self.upload.json_max_interval.is_zero() {
            errors.push("upload.json_max_interval must be greater than 0");
        }
        if self.logging.file.as_os_str().is_empty() {
            errors.push("logging.file must be set");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(errors.join("; ")))
        }
    }
}

fn fill_from_env<F>(slot: &mut Option<String>, env: &F, name: &str)
where
    F: Fn(&str) -> Option<String>,
{
    if is_blank(slot) {
        *slot = env(name).filter(|v| !v.trim().is_empty());
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
