//! Application settings
//!
//! Settings are resolved in order of precedence (highest to lowest):
//! 1. Environment variables (`PRICEFETCH_<FIELD>`)
//! 2. Config file (`~/.config/pricefetch/config.toml` on Linux)
//! 3. Default values

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    FetchRequest, ItemId, PriceKind, DEFAULT_BATCH_SIZE_LIMIT, DEFAULT_INTERACTIVE_CONCURRENCY,
    DEFAULT_RETRY_LIMIT, DEFAULT_SCRIPT_CONCURRENCY,
};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "PRICEFETCH_";

/// Errors from loading settings
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid TOML for these settings
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Which kind of caller is driving a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Live progress display; higher concurrency
    Interactive,
    /// Blocking script-style caller
    Script,
}

/// All tunables, with the documented defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Base URL of the pricing service
    pub endpoint: String,
    pub default_region: String,
    pub interactive_concurrency: usize,
    pub script_concurrency: usize,
    pub batch_size_limit: usize,
    pub request_spacing_ms: u64,
    /// Attempts per call unit, including the first
    pub retry_limit: u32,
    pub retry_base_delay_ms: u64,
    pub ttl_secs: u64,
    /// TTL for lookups that failed after retries
    pub negative_ttl_secs: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub pricing_read_timeout_secs: u64,
    pub connection_pool_size: usize,
    /// Emit a progress event every N resolved items
    pub progress_every: usize,
    /// Upper bound on continuation pages per batch chunk
    pub max_pages: usize,
    pub cache_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: "https://pricing.us-east-1.amazonaws.com".to_string(),
            default_region: "us-east-1".to_string(),
            interactive_concurrency: DEFAULT_INTERACTIVE_CONCURRENCY,
            script_concurrency: DEFAULT_SCRIPT_CONCURRENCY,
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            request_spacing_ms: 50,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_base_delay_ms: 1000,
            ttl_secs: 4 * 60 * 60,
            negative_ttl_secs: 15 * 60,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            pricing_read_timeout_secs: 90,
            connection_pool_size: 50,
            progress_every: 10,
            max_pages: 100,
            cache_dir: None,
        }
    }
}

impl Settings {
    /// Default config file location
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pricefetch").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads the default config file (if any) and applies environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match Self::config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Reads settings from a TOML file; a missing file yields defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies `PRICEFETCH_<FIELD>` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| {
            let key = format!("{}{}", ENV_PREFIX, field.to_uppercase());
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = var("endpoint") {
            self.endpoint = value;
        }
        if let Some((_, value)) = var("default_region") {
            self.default_region = value;
        }
        if let Some((_, value)) = var("cache_dir") {
            self.cache_dir = Some(PathBuf::from(value));
        }

        override_number(&mut self.interactive_concurrency, var("interactive_concurrency"))?;
        override_number(&mut self.script_concurrency, var("script_concurrency"))?;
        override_number(&mut self.batch_size_limit, var("batch_size_limit"))?;
        override_number(&mut self.request_spacing_ms, var("request_spacing_ms"))?;
        override_number(&mut self.retry_limit, var("retry_limit"))?;
        override_number(&mut self.retry_base_delay_ms, var("retry_base_delay_ms"))?;
        override_number(&mut self.ttl_secs, var("ttl_secs"))?;
        override_number(&mut self.negative_ttl_secs, var("negative_ttl_secs"))?;
        override_number(&mut self.connect_timeout_secs, var("connect_timeout_secs"))?;
        override_number(&mut self.read_timeout_secs, var("read_timeout_secs"))?;
        override_number(&mut self.pricing_read_timeout_secs, var("pricing_read_timeout_secs"))?;
        override_number(&mut self.connection_pool_size, var("connection_pool_size"))?;
        override_number(&mut self.progress_every, var("progress_every"))?;
        override_number(&mut self.max_pages, var("max_pages"))?;
        Ok(())
    }

    pub fn concurrency_for(&self, mode: RunMode) -> usize {
        match mode {
            RunMode::Interactive => self.interactive_concurrency,
            RunMode::Script => self.script_concurrency,
        }
    }

    pub fn request_spacing(&self) -> Duration {
        Duration::from_millis(self.request_spacing_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn pricing_read_timeout(&self) -> Duration {
        Duration::from_secs(self.pricing_read_timeout_secs)
    }

    /// Builds a request with this configuration's limits for the given mode
    pub fn fetch_request<I, S>(
        &self,
        item_ids: I,
        region: impl Into<String>,
        price_kind: PriceKind,
        mode: RunMode,
    ) -> FetchRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        FetchRequest::new(item_ids, region, price_kind)
            .with_concurrency_limit(self.concurrency_for(mode))
            .with_batch_size_limit(self.batch_size_limit)
            .with_retry_limit(self.retry_limit)
            .with_request_spacing(self.request_spacing())
    }

    /// Commented config file template
    pub fn default_config_toml() -> &'static str {
        r#"# pricefetch configuration
# Place this file at ~/.config/pricefetch/config.toml
# Every setting can also be overridden with PRICEFETCH_<NAME>, e.g. PRICEFETCH_RETRY_LIMIT=5

# Pricing service
# endpoint = "https://pricing.us-east-1.amazonaws.com"
# default_region = "us-east-1"

# Timeouts (seconds)
# connect_timeout_secs = 10
# read_timeout_secs = 60
# pricing_read_timeout_secs = 90

# Concurrency and rate limiting
# interactive_concurrency = 10   # --watch mode concurrent requests
# script_concurrency = 5         # script mode concurrent requests
# request_spacing_ms = 50        # minimum gap between request starts
# batch_size_limit = 50          # items per batch call
# max_pages = 100                # continuation pages per batch chunk
# connection_pool_size = 50      # pooled HTTP connections

# Retries
# retry_limit = 3                # attempts per request, including the first
# retry_base_delay_ms = 1000     # attempt k waits base * 2^(k-1)

# Cache
# ttl_secs = 14400               # successful lookups and missing prices
# negative_ttl_secs = 900        # lookups that failed after retries
# cache_dir = "/tmp/pricefetch"

# Progress
# progress_every = 10            # progress event every N resolved items
"#
    }
}

fn override_number<T: std::str::FromStr>(
    field: &mut T,
    var: Option<(String, String)>,
) -> Result<(), ConfigError> {
    if let Some((key, value)) = var {
        *field = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value })?;
    }
    Ok(())
}
