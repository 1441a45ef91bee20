//! Pipeline configuration: compiled-in defaults with `PARLEY_*` environment
//! overrides. A `.env` file in the working directory is honored.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Provider connection settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Scheme placed before the key in the `Authorization` header.
    pub auth_scheme: String,
    /// Per-request timeout enforced by the adapter.
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api-free.deepl.com".into(),
            api_key: String::new(),
            auth_scheme: "DeepL-Auth-Key".into(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Cache tier settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub general_ttl: Duration,
    pub priority_ttl: Duration,
    /// Upper bound on GENERAL entries; LRU-then-LFU eviction beyond it.
    pub general_capacity: usize,
    /// Striped per-key lock count.
    pub lock_stripes: usize,
    pub expiry_sweep_interval: Duration,
    /// SQLite file; `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            general_ttl: Duration::from_secs(24 * 3600),
            priority_ttl: Duration::from_secs(24 * 3600),
            general_capacity: 50_000,
            lock_stripes: 256,
            expiry_sweep_interval: Duration::from_secs(3600),
            database_path: None,
        }
    }
}

/// Behavior analyzer settings.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub interval: Duration,
    pub min_usage_threshold: u64,
    pub learning_window_days: u32,
    pub promotion_threshold: f64,
    /// Capacity of the fire-and-forget observation channel.
    pub observation_capacity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_usage_threshold: 10,
            learning_window_days: 7,
            promotion_threshold: 0.4,
            observation_capacity: 10_000,
        }
    }
}

/// Cache warmer settings.
#[derive(Debug, Clone)]
pub struct WarmerConfig {
    pub max_concurrent: usize,
    /// Pause between successive provider calls for the same target language.
    pub per_language_interval: Duration,
    /// Backoff before each re-queue; its length is the retry budget.
    pub retry_backoff: Vec<Duration>,
    pub queue_capacity: usize,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            per_language_interval: Duration::from_millis(100),
            retry_backoff: vec![Duration::from_millis(500), Duration::from_secs(2)],
            queue_capacity: 4096,
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Overall per-request deadline unless the request carries its own.
    pub deadline: Duration,
    /// Inputs above this size are rejected as `BAD_REQUEST`.
    pub max_text_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(15),
            max_text_bytes: 128 * 1024,
        }
    }
}

/// Telemetry queue settings.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub capacity: usize,
    /// Max events handed to sinks per drain.
    pub batch_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 256,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub analyzer: AnalyzerConfig,
    pub warmer: WarmerConfig,
    pub orchestrator: OrchestratorConfig,
    pub telemetry: TelemetryConfig,
}

impl PipelineConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(url) = env::var("PARLEY_PROVIDER_URL") {
            config.provider.base_url = url;
        }
        if let Ok(key) = env::var("PARLEY_PROVIDER_KEY") {
            config.provider.api_key = key;
        }
        if let Ok(scheme) = env::var("PARLEY_PROVIDER_AUTH_SCHEME") {
            config.provider.auth_scheme = scheme;
        }
        if let Some(ms) = parse_var::<u64>("PARLEY_PROVIDER_TIMEOUT_MS")? {
            config.provider.timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>("PARLEY_GENERAL_TTL_SECS")? {
            config.cache.general_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("PARLEY_PRIORITY_TTL_SECS")? {
            config.cache.priority_ttl = Duration::from_secs(secs);
        }
        if let Some(cap) = parse_var::<usize>("PARLEY_GENERAL_CAPACITY")? {
            config.cache.general_capacity = cap;
        }
        if let Ok(path) = env::var("PARLEY_CACHE_DB") {
            config.cache.database_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = parse_var::<u64>("PARLEY_ANALYZER_INTERVAL_SECS")? {
            config.analyzer.interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u64>("PARLEY_MIN_USAGE_THRESHOLD")? {
            config.analyzer.min_usage_threshold = n;
        }
        if let Some(days) = parse_var::<u32>("PARLEY_LEARNING_WINDOW_DAYS")? {
            config.analyzer.learning_window_days = days;
        }
        if let Some(n) = parse_var::<usize>("PARLEY_WARMER_CONCURRENCY")? {
            config.warmer.max_concurrent = n;
        }
        if let Some(ms) = parse_var::<u64>("PARLEY_DEADLINE_MS")? {
            config.orchestrator.deadline = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>("PARLEY_TELEMETRY_CAPACITY")? {
            config.telemetry.capacity = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component inert or panic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool, String); 6] = [
            (
                "PARLEY_GENERAL_CAPACITY",
                self.cache.general_capacity > 0,
                self.cache.general_capacity.to_string(),
            ),
            (
                "PARLEY_LEARNING_WINDOW_DAYS",
                self.analyzer.learning_window_days > 0,
                self.analyzer.learning_window_days.to_string(),
            ),
            (
                "PARLEY_WARMER_CONCURRENCY",
                self.warmer.max_concurrent > 0,
                self.warmer.max_concurrent.to_string(),
            ),
            (
                "PARLEY_TELEMETRY_CAPACITY",
                self.telemetry.capacity > 0,
                self.telemetry.capacity.to_string(),
            ),
            (
                "PARLEY_ANALYZER_INTERVAL_SECS",
                !self.analyzer.interval.is_zero(),
                format!("{:?}", self.analyzer.interval),
            ),
            (
                "PARLEY_GENERAL_TTL_SECS",
                !self.cache.general_ttl.is_zero() && !self.cache.priority_ttl.is_zero(),
                format!("{:?}", self.cache.general_ttl),
            ),
        ];
        for (key, ok, value) in checks {
            if !ok {
                return Err(ConfigError::Invalid { key, value });
            }
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.provider.timeout, Duration::from_secs(10));
        assert_eq!(config.orchestrator.deadline, Duration::from_secs(15));
        assert_eq!(config.cache.general_ttl, Duration::from_secs(86_400));
        assert_eq!(config.analyzer.min_usage_threshold, 10);
        assert_eq!(config.analyzer.learning_window_days, 7);
        assert_eq!(config.warmer.max_concurrent, 4);
        assert_eq!(config.warmer.retry_backoff.len(), 2);
        assert_eq!(config.telemetry.capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = PipelineConfig::default();
        config.cache.general_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("PARLEY_GENERAL_CAPACITY"));
    }

    #[test]
    fn malformed_variable_is_reported() {
        // Unique name so parallel tests don't race on the environment.
        env::set_var("PARLEY_TEST_MALFORMED_NUMBER", "twelve");
        let err = parse_var::<u64>("PARLEY_TEST_MALFORMED_NUMBER").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { value, .. } if value == "twelve"));
        assert_eq!(parse_var::<u64>("PARLEY_TEST_UNSET_NUMBER").unwrap(), None);
    }
}
