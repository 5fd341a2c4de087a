use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::engine::randomizer::Strategy;

/// Default time a cached payload counts as fresh (1 hour).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// How long stale payloads are kept around as a fallback (24 hours).
pub const DEFAULT_STALE_RETENTION_SECS: u64 = 24 * 3600;

/// Number of concurrent browsing sessions.
pub const DEFAULT_POOL_CAPACITY: usize = 3;

/// Sessions are rotated after this many checkouts.
pub const DEFAULT_MAX_REQUESTS_PER_SESSION: u32 = 20;

/// Sessions are rotated after this age (12 hours).
pub const DEFAULT_MAX_SESSION_AGE_SECS: u64 = 12 * 3600;

/// Cooldown imposed after a suspected detection (5 minutes).
pub const DEFAULT_COOLDOWN_SECS: u64 = 300;

/// Base scheduling interval per entity (12 hours).
pub const DEFAULT_BASE_INTERVAL_SECS: u64 = 12 * 3600;

/// User agent used when a profile has no explicit mapping.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Session pool sizing and rotation policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live sessions.
    pub capacity: usize,
    /// Checkouts before a session is retired.
    pub max_requests_per_session: u32,
    /// Age in seconds before a session is retired.
    pub max_session_age_secs: u64,
    /// Cooldown in seconds after a suspected detection.
    pub cooldown_secs: u64,
    /// Consecutive failed releases before a session is retired.
    pub max_consecutive_failures: u32,
    /// How long a caller may wait for a session, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Opaque profile references assigned round-robin to new sessions.
    pub profiles: Vec<String>,
}

impl PoolConfig {
    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            max_requests_per_session: DEFAULT_MAX_REQUESTS_PER_SESSION,
            max_session_age_secs: DEFAULT_MAX_SESSION_AGE_SECS,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            max_consecutive_failures: 3,
            acquire_timeout_ms: 30_000,
            profiles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub stale_retention_secs: u64,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.stale_retention_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            stale_retention_secs: DEFAULT_STALE_RETENTION_SECS,
            max_entries: 10_000,
        }
    }
}

/// Concurrency, retry and pacing for fetch pipelines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Maximum simultaneous fetch pipelines.
    pub parallelism: usize,
    /// Attempt ceiling per entity per cycle.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    /// Backoff is multiplied by a uniform factor in `[jitter_low, jitter_high]`.
    pub jitter_low: f64,
    pub jitter_high: f64,
    /// Inter-request delay bounds, in milliseconds.
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub delay_strategy: Strategy,
    /// Retries on a different session after a suspected detection.
    pub detection_retries: u32,
    /// Retries on a fresh session after a fatal session error.
    pub fatal_retries: u32,
    pub capture_timeout_ms: u64,
    /// Deadline for a single on-demand fetch (HTTP path).
    pub request_deadline_ms: u64,
    /// Deadline for a whole scheduled cycle.
    pub cycle_deadline_secs: u64,
}

impl FetchConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn delay_min(&self) -> Duration {
        Duration::from_millis(self.delay_min_ms)
    }

    pub fn delay_max(&self) -> Duration {
        Duration::from_millis(self.delay_max_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            parallelism: 5,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 30_000,
            jitter_low: 0.8,
            jitter_high: 1.2,
            delay_min_ms: 1000,
            delay_max_ms: 5000,
            delay_strategy: Strategy::Uniform,
            detection_retries: 1,
            fatal_retries: 1,
            capture_timeout_ms: 60_000,
            request_deadline_ms: 120_000,
            cycle_deadline_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RandomizerConfig {
    pub min_factor: f64,
    pub max_factor: f64,
    /// Lower clamp for poisson intervals, as a fraction of the base.
    pub poisson_min_factor: f64,
    /// Fixed seed; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for RandomizerConfig {
    fn default() -> Self {
        Self {
            min_factor: 0.7,
            max_factor: 1.3,
            poisson_min_factor: 0.5,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    pub base_interval_secs: u64,
    pub strategy: Strategy,
    /// Entities tracked at startup when not already in the persisted table.
    pub entities: Vec<String>,
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            base_interval_secs: DEFAULT_BASE_INTERVAL_SECS,
            strategy: Strategy::Poisson,
            entities: Vec::new(),
        }
    }
}

/// Settings for the reqwest-backed session provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Entity pages are fetched from `{base_url}/{entity_id}`.
    pub base_url: String,
    /// Extra headers sent with every capture.
    pub headers: HashMap<String, String>,
    /// Profile reference → user agent.
    pub user_agents: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.stubhub.com/event".to_string(),
            headers: HashMap::new(),
            user_agents: HashMap::new(),
        }
    }
}

/// Top-level configuration for the fetch service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// When set, every HTTP route requires a matching `X-API-Key` header.
    pub api_key: Option<String>,
    /// Directory holding the persisted schedule table and fetched payloads.
    pub state_dir: String,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub randomizer: RandomizerConfig,
    pub scheduler: SchedulerConfig,
    pub upstream: UpstreamConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key: None,
            state_dir: "state".to_string(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            fetch: FetchConfig::default(),
            randomizer: RandomizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = lookup("API_KEY") {
            self.api_key = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("STATE_DIR") {
            self.state_dir = v;
        }
        if let Some(v) = lookup("MAX_SESSIONS") {
            self.pool.capacity = parse_env("MAX_SESSIONS", &v)?;
        }
        if let Some(v) = lookup("MAX_REQUESTS_PER_SESSION") {
            self.pool.max_requests_per_session = parse_env("MAX_REQUESTS_PER_SESSION", &v)?;
        }
        if let Some(v) = lookup("CACHE_TTL_SECONDS") {
            self.cache.ttl_secs = parse_env("CACHE_TTL_SECONDS", &v)?;
        }
        if let Some(v) = lookup("CONCURRENCY_LIMIT") {
            self.fetch.parallelism = parse_env("CONCURRENCY_LIMIT", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_RANDOMIZATION_STRATEGY") {
            self.scheduler.strategy = parse_env("DEFAULT_RANDOMIZATION_STRATEGY", &v)?;
        }
        if let Some(v) = lookup("UPSTREAM_BASE_URL") {
            self.upstream.base_url = v;
        }
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            return Err(anyhow!("pool.capacity must be > 0"));
        }
        if self.pool.max_requests_per_session == 0 {
            return Err(anyhow!("pool.max_requests_per_session must be > 0"));
        }
        if self.fetch.parallelism == 0 {
            return Err(anyhow!("fetch.parallelism must be > 0"));
        }
        if self.fetch.max_attempts == 0 {
            return Err(anyhow!("fetch.max_attempts must be > 0"));
        }
        if self.fetch.delay_min_ms > self.fetch.delay_max_ms {
            return Err(anyhow!(
                "fetch.delay_min_ms {} > fetch.delay_max_ms {}",
                self.fetch.delay_min_ms,
                self.fetch.delay_max_ms
            ));
        }
        if !(self.fetch.jitter_low > 0.0 && self.fetch.jitter_low <= self.fetch.jitter_high) {
            return Err(anyhow!("fetch.jitter_low must be > 0 and <= fetch.jitter_high"));
        }
        if self.fetch.backoff_multiplier < 1.0 {
            return Err(anyhow!("fetch.backoff_multiplier must be >= 1.0"));
        }
        let r = &self.randomizer;
        if !(r.min_factor > 0.0 && r.min_factor <= r.max_factor) {
            return Err(anyhow!(
                "randomizer factors must satisfy 0 < min_factor <= max_factor (got {} / {})",
                r.min_factor,
                r.max_factor
            ));
        }
        if r.poisson_min_factor <= 0.0 {
            return Err(anyhow!("randomizer.poisson_min_factor must be > 0"));
        }
        if self.scheduler.base_interval_secs == 0 {
            return Err(anyhow!("scheduler.base_interval_secs must be > 0"));
        }
        if self.scheduler.tick_ms == 0 {
            return Err(anyhow!("scheduler.tick_ms must be > 0"));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow!("invalid value for {}: {:?} ({})", key, value, e))
}
