//! Configuration loading from TOML files

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use oaiharvest_agent::{AgentConfig, WritePolicy};
use oaiharvest_core::HttpConfig;
use oaiharvest_job::Repository;
use serde::Deserialize;

/// Global configuration for oaiharvest
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSection,
    pub http: HttpSection,
    pub output: OutputConfig,
    /// Known repositories; empty accepts any http(s) base URI
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub offer_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub workers: usize,
    pub write_policy: WritePolicy,
}

impl Default for AgentSection {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            queue_capacity: defaults.queue_capacity,
            batch_size: defaults.batch_size,
            offer_timeout_ms: defaults.offer_timeout.as_millis() as u64,
            poll_timeout_ms: defaults.poll_timeout.as_millis() as u64,
            workers: defaults.workers,
            write_policy: defaults.write_policy,
        }
    }
}

impl AgentSection {
    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            queue_capacity: self.queue_capacity,
            batch_size: self.batch_size,
            offer_timeout: Duration::from_millis(self.offer_timeout_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            workers: self.workers,
            write_policy: self.write_policy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    /// Seconds
    pub connect_timeout: u64,
    /// Seconds without body progress before a request is abandoned
    pub read_timeout: u64,
    /// Resubmissions of harvests that failed on a transient error
    pub max_retries: u32,
    /// Request headers; values may be `${VAR}` references
    #[serde(deserialize_with = "deserialize_headers")]
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        let defaults = HttpConfig::default();
        Self {
            connect_timeout: defaults.connect_timeout.as_secs(),
            read_timeout: defaults.read_timeout.as_secs(),
            max_retries: 3,
            headers: defaults.headers.into_iter().collect(),
        }
    }
}

impl HttpSection {
    pub fn to_http_config(&self, read_timeout: Option<u64>) -> HttpConfig {
        HttpConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            read_timeout: Duration::from_secs(read_timeout.unwrap_or(self.read_timeout)),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub default_dir: PathBuf,
    pub compression_level: i32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_dir: PathBuf::from("./data"),
            compression_level: 3,
        }
    }
}

/// Header values may reference environment variables; unresolved ones are dropped.
fn deserialize_headers<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(name, value)| match expand_env_var(&value) {
            Some(value) => Some((name, value)),
            None => {
                log::warn!("Header {name} dropped: {value} is not set");
                None
            }
        })
        .collect())
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Search order:
    /// 1. ./oaiharvest.toml
    /// 2. the user config directory, e.g. ~/.config/oaiharvest/config.toml
    ///
    /// Falls back to defaults.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("oaiharvest.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "oaiharvest") {
            let user_config = dirs.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
