//! ymcrawl configuration loaded from `ymcrawl.toml`.
//!
//! [`CrawlConfig`] groups every tunable knob of the crawl engine into four
//! sections (`[api]`, `[congestion]`, `[retry]`, `[buffer]`) plus `[matching]`.
//! Keys missing from the file fall back to defaults. The environment variables
//! `YMGAL_CLIENT_ID` and `YMGAL_CLIENT_SECRET` take precedence over the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::CrawlError;

const DEFAULT_CONFIG_FILE: &str = "ymcrawl.toml";

/// Top-level configuration loaded from `ymcrawl.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub api: ApiConfig,
    pub congestion: CongestionConfig,
    pub retry: RetryConfig,
    pub buffer: BufferConfig,
    pub matching: MatchingConfig,
}

/// Archive API endpoint and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Per-request timeout; expiry is classified as a transient error.
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.ymgal.com".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Bounds and step sizes for the AIMD congestion window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub initial_concurrency: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub initial_delay_ms: u64,
    /// Multiplier applied to the pacing delay on a rate-limit signal.
    pub backoff_factor: f64,
    /// Lowest delay a rate-limit penalty may leave behind, so a zero delay
    /// still grows when the server starts throttling.
    pub rate_limit_delay_floor_ms: u64,
    /// Consecutive successes required before the window grows by one.
    pub success_threshold: u32,
    /// Fraction of the delay removed after a success streak.
    pub delay_decrease_ratio: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 16,
            initial_concurrency: 4,
            min_delay_ms: 50,
            max_delay_ms: 10_000,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            rate_limit_delay_floor_ms: 250,
            success_threshold: 5,
            delay_decrease_ratio: 0.1,
        }
    }
}

impl CongestionConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn rate_limit_delay_floor(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_floor_ms)
    }
}

/// Per-item retry budget and the global cooldown policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts (including the first) before an item is abandoned.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Size of the sliding window of recent dispatch outcomes.
    pub rate_limit_window: usize,
    /// Outcomes the window must hold before a cooldown can trip.
    pub rate_limit_min_samples: usize,
    /// Rate-limited fraction of the window that trips a cooldown.
    pub rate_limit_threshold: f64,
    pub cooldown_base_duration_ms: u64,
    pub cooldown_max_duration_ms: u64,
    /// Consecutive fatal outcomes that halt the whole run.
    pub max_consecutive_fatal: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            rate_limit_window: 20,
            rate_limit_min_samples: 5,
            rate_limit_threshold: 0.3,
            cooldown_base_duration_ms: 10_000,
            cooldown_max_duration_ms: 120_000,
            max_consecutive_fatal: 3,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for an item's next attempt.
    /// delay = retry_base_delay * 2^(attempt - 1), capped at retry_max_delay
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Cooldown length for the n-th consecutive trip, capped at the maximum.
    pub fn cooldown_for_trip(&self, trip: u32) -> Duration {
        let exp = trip.saturating_sub(1).min(20);
        let ms = self
            .cooldown_base_duration_ms
            .saturating_mul(1u64 << exp)
            .min(self.cooldown_max_duration_ms);
        Duration::from_millis(ms)
    }
}

/// Write pipeline thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Records per batch that trigger a flush.
    pub buffer_size_threshold: usize,
    pub buffer_flush_interval_ms: u64,
    /// Records the handoff channel holds before producers feel backpressure.
    pub buffer_capacity: usize,
    pub sink_max_attempts: u32,
    pub sink_retry_base_delay_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size_threshold: 30,
            buffer_flush_interval_ms: 3_000,
            buffer_capacity: 1_000,
            sink_max_attempts: 5,
            sink_retry_base_delay_ms: 500,
        }
    }
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_flush_interval_ms)
    }

    pub fn sink_retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.sink_retry_base_delay_ms.saturating_mul(1u64 << exp))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Candidates scoring below this are treated as no match.
    pub min_score: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { min_score: 0.0 }
    }
}

impl CrawlConfig {
    /// Loads `ymcrawl.toml` from the current directory, or the explicit path
    /// if one is given. A missing default file yields the defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str::<CrawlConfig>(&contents)?
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    let contents = std::fs::read_to_string(path)?;
                    toml::from_str::<CrawlConfig>(&contents)?
                } else {
                    Self::default()
                }
            }
        };

        // Credentials from the environment win over the file.
        if let Ok(id) = std::env::var("YMGAL_CLIENT_ID") {
            if !id.is_empty() {
                config.api.client_id = id;
            }
        }
        if let Ok(secret) = std::env::var("YMGAL_CLIENT_SECRET") {
            if !secret.is_empty() {
                config.api.client_secret = secret;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), CrawlError> {
        let c = &self.congestion;
        if c.min_concurrency == 0 {
            return Err(CrawlError::Config("min_concurrency must be at least 1".into()));
        }
        if c.min_concurrency > c.max_concurrency {
            return Err(CrawlError::Config(format!(
                "min_concurrency ({}) exceeds max_concurrency ({})",
                c.min_concurrency, c.max_concurrency
            )));
        }
        if c.min_delay_ms > c.max_delay_ms {
            return Err(CrawlError::Config(format!(
                "min_delay_ms ({}) exceeds max_delay_ms ({})",
                c.min_delay_ms, c.max_delay_ms
            )));
        }
        if !(c.backoff_factor >= 1.0) {
            return Err(CrawlError::Config("backoff_factor must be >= 1.0".into()));
        }
        if !(0.0..1.0).contains(&c.delay_decrease_ratio) {
            return Err(CrawlError::Config("delay_decrease_ratio must be in [0, 1)".into()));
        }
        if c.success_threshold == 0 {
            return Err(CrawlError::Config("success_threshold must be at least 1".into()));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(CrawlError::Config("max_attempts must be at least 1".into()));
        }
        if r.rate_limit_window == 0 {
            return Err(CrawlError::Config("rate_limit_window must be at least 1".into()));
        }
        // The sample window never holds more than rate_limit_window outcomes.
        if r.rate_limit_min_samples > r.rate_limit_window {
            return Err(CrawlError::Config(format!(
                "rate_limit_min_samples ({}) exceeds rate_limit_window ({}); no cooldown could ever trip",
                r.rate_limit_min_samples, r.rate_limit_window
            )));
        }
        if !(r.rate_limit_threshold > 0.0 && r.rate_limit_threshold <= 1.0) {
            return Err(CrawlError::Config("rate_limit_threshold must be in (0, 1]".into()));
        }
        if r.cooldown_base_duration_ms > r.cooldown_max_duration_ms {
            return Err(CrawlError::Config(
                "cooldown_base_duration_ms exceeds cooldown_max_duration_ms".into(),
            ));
        }

        let b = &self.buffer;
        if b.buffer_size_threshold == 0 || b.buffer_capacity == 0 {
            return Err(CrawlError::Config(
                "buffer_size_threshold and buffer_capacity must be at least 1".into(),
            ));
        }
        if b.sink_max_attempts == 0 {
            return Err(CrawlError::Config("sink_max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
