//! Linker configuration.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional JSON file, `ENTITY_LINKER_*` environment variables, and finally
//! whatever the caller sets on the struct (the CLI applies its flags last).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://www.wikidata.org/w/api.php";
pub const DEFAULT_ENTITIES_PER_REQUEST: usize = 50;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_WORKERS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    /// Endpoint of the lookup API (`wbgetentities`).
    pub api_url: String,
    /// Site whose page titles are looked up.
    pub site: String,
    /// Language of returned descriptions.
    pub language: String,
    /// Hard cap on names per remote request.
    pub entities_per_request: usize,
    /// Attempts per request before giving up on a non-success status.
    pub max_attempts: u32,
    /// Delay before retry `n` is `n * retry_base_delay_ms`.
    pub retry_base_delay_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Number of dispatcher worker threads.
    pub workers: usize,
    /// Names claimed by a worker per iteration.
    pub chunk_size: usize,
    /// Retry names a batch left unresolved one at a time with normalization.
    pub single_fallback: bool,
    /// Description text marking a disambiguation page.
    pub disambiguation_marker: String,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            site: "enwiki".to_string(),
            language: "en".to_string(),
            entities_per_request: DEFAULT_ENTITIES_PER_REQUEST,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: 1000,
            timeout_secs: 30,
            user_agent: concat!("entity-linker/", env!("CARGO_PKG_VERSION")).to_string(),
            workers: DEFAULT_WORKERS,
            chunk_size: DEFAULT_ENTITIES_PER_REQUEST,
            single_fallback: true,
            disambiguation_marker: "disambiguation page".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid value for {key}: `{value}`")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl LinkerConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("ENTITY_LINKER_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = std::env::var("ENTITY_LINKER_SITE") {
            self.site = v;
        }
        if let Ok(v) = std::env::var("ENTITY_LINKER_LANGUAGE") {
            self.language = v;
        }
        if let Ok(v) = std::env::var("ENTITY_LINKER_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = parse_env("ENTITY_LINKER_ENTITIES_PER_REQUEST")? {
            self.entities_per_request = v;
        }
        if let Some(v) = parse_env("ENTITY_LINKER_MAX_ATTEMPTS")? {
            self.max_attempts = v;
        }
        if let Some(v) = parse_env("ENTITY_LINKER_RETRY_DELAY_MS")? {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = parse_env("ENTITY_LINKER_WORKERS")? {
            self.workers = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entities_per_request == 0 {
            return Err(ConfigError::Invalid(
                "entities_per_request must be > 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".to_string()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be > 0".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be > 0".to_string()));
        }
        if url::Url::parse(&self.api_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "api_url is not a valid url: {}",
                self.api_url
            )));
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        Err(_) => Ok(None),
    }
}
