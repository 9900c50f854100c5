//! Layered configuration built with the `config` crate: defaults, then a TOML
//! file, then `STATLAKE__*` environment variables (`__` separates sections,
//! e.g. `STATLAKE__CACHE__TTL_SECS=60`).
//!
//! Secrets never live in the file. The master key for encrypted preferences
//! is read from `STATLAKE_MASTER_KEY` only.

use crate::resilience::RateLimitRule;
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "STATLAKE";

/// Environment variable holding the preference-encryption master key.
pub const MASTER_KEY_ENV: &str = "STATLAKE_MASTER_KEY";

/// Rate-limit entry used for upstream dataset fetches.
pub const UPSTREAM_INTEGRATION: &str = "upstream";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatlakeConfig {
    pub upstream: UpstreamConfig,
    /// Integration name → rule. `upstream` governs dataset fetches.
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub fallback: FallbackConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub partitioning: PartitioningConfig,
    pub logging: LoggingConfig,
}

impl Default for StatlakeConfig {
    fn default() -> Self {
        let mut rate_limits = BTreeMap::new();
        rate_limits.insert(UPSTREAM_INTEGRATION.to_string(), RateLimitConfig::default());
        Self {
            upstream: UpstreamConfig::default(),
            rate_limits,
            circuit_breaker: CircuitBreakerConfig::default(),
            fallback: FallbackConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            partitioning: PartitioningConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_concurrency: usize,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sdmx.istat.it/SDMXWS/rest/data".into(),
            timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 500,
            max_concurrency: 4,
            user_agent: concat!("statlake/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn rule(&self) -> RateLimitRule {
        RateLimitRule::new(self.max_requests, Duration::from_secs(self.window_secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Directory of last good payloads. `None` disables the payload cache.
    pub cache_dir: Option<PathBuf>,
    /// Serve deterministic synthetic data when nothing else is available.
    pub synthetic: bool,
}

impl FallbackConfig {
    pub fn is_enabled(&self) -> bool {
        self.cache_dir.is_some() || self.synthetic
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub metadata_path: PathBuf,
    pub analytics_path: PathBuf,
    /// Reader connections per store.
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    /// SQLite busy timeout.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            metadata_path: PathBuf::from("data/metadata.sqlite"),
            analytics_path: PathBuf::from("data/analytics.duckdb"),
            pool_size: 4,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 1024,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// How observations are split into physical partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStrategy {
    #[default]
    Year,
    Territory,
    Hybrid,
}

impl PartitionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Territory => "territory",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "year" => Ok(Self::Year),
            "territory" => Ok(Self::Territory),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(ConfigError::Invalid(format!(
                "unknown partition strategy '{other}' (expected year, territory or hybrid)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitioningConfig {
    pub strategy: PartitionStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info,statlake_store=debug`. `RUST_LOG` wins when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
        }
    }
}

impl StatlakeConfig {
    /// Defaults, then `path` if given, then process environment; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::layered(path, environment())
    }

    fn layered(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing sections and keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reject values that would make a component misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let u = &self.upstream;
        if !(u.base_url.starts_with("http://") || u.base_url.starts_with("https://")) {
            return Err(invalid(format!(
                "upstream.base_url must be http(s), got '{}'",
                u.base_url
            )));
        }
        if u.timeout_secs == 0 {
            return Err(invalid("upstream.timeout_secs must be > 0"));
        }
        if u.max_attempts == 0 {
            return Err(invalid("upstream.max_attempts must be >= 1"));
        }
        if u.max_concurrency == 0 {
            return Err(invalid("upstream.max_concurrency must be >= 1"));
        }
        for (name, rule) in &self.rate_limits {
            if rule.max_requests == 0 || rule.window_secs == 0 {
                return Err(invalid(format!(
                    "rate_limits.{name}: max_requests and window_secs must be > 0"
                )));
            }
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be >= 1"));
        }
        if self.storage.pool_size == 0 {
            return Err(invalid("storage.pool_size must be >= 1"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be >= 1"));
        }
        Ok(())
    }

    /// Rule for `integration`, falling back to the upstream default.
    pub fn rate_limit(&self, integration: &str) -> RateLimitRule {
        self.rate_limits
            .get(integration)
            .copied()
            .unwrap_or_default()
            .rule()
    }
}

/// Master key from the environment, if set and non-empty.
pub fn master_key_from_env() -> Option<String> {
    std::env::var(MASTER_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
}

/// `STATLAKE__SECTION__KEY` overrides from the process environment.
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
