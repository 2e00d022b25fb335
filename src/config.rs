use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use url::Url;
use crate::tus::{Result, TusError};
use crate::utils::RetryPolicy;

pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Client settings, fixed for the lifetime of a client instance.
#[derive(Deserialize, Debug, Clone)]
pub struct ClientConfig {
    /// Creation endpoint, also the base for relative `Location` headers
    pub endpoint: Url,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Queue state is kept in memory when unset
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".tunnel")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    pub fn new(endpoint: Url, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            endpoint,
            chunk_size: DEFAULT_CHUNK_SIZE,
            headers: HashMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            storage_dir: storage_dir.into(),
            state_file: None,
            log_level: default_log_level(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|err| {
            TusError::ConfigError(format!("can't read {}: {}", path.display(), err))
        })?;
        Self::from_toml(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TusError::ConfigError("chunk_size must be positive".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(TusError::ConfigError("timeout_secs must be positive".to_string()));
        }
        if !matches!(self.endpoint.scheme(), "http" | "https") {
            return Err(TusError::ConfigError(format!("unsupported endpoint {}", self.endpoint)));
        }
        Ok(())
    }

    pub fn chunk_size(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.chunk_size)
            .ok_or_else(|| TusError::ConfigError("chunk_size must be positive".to_string()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
