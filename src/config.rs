//! Configuration module for feedmon.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::{FeedmonError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/feedmon.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file. Empty logs to stdout only.
    #[serde(default = "default_log_file")]
    pub file: String,
    /// Output format ("text" or "json").
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/feedmon.log".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            format: default_log_format(),
        }
    }
}

/// Durable queue configuration.
///
/// Used for both the fetch-request queue and the failed-url queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue URL (identifies the queue inside the message store).
    #[serde(default)]
    pub url: String,
    /// Seconds a received message stays invisible before redelivery.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    /// Long-poll wait per receive, in seconds.
    #[serde(default = "default_wait_time")]
    pub wait_time_secs: u64,
    /// Maximum messages returned by one receive.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Receives after which an undeleted message is dead-lettered.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    /// Interval between store checks while long-polling, and the pause
    /// after a failed receive, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Region of a hosted queue. Accepted for compatibility; the SQLite
    /// store ignores it.
    #[serde(default)]
    pub region: Option<String>,
    /// Endpoint override of a hosted queue. Accepted and ignored, like
    /// `region`.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_visibility_timeout() -> u64 {
    300
}

fn default_wait_time() -> u64 {
    20
}

fn default_max_messages() -> usize {
    10
}

fn default_max_receive_count() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    500
}

impl QueueConfig {
    /// Create a queue configuration with defaults for the given URL.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            visibility_timeout_secs: default_visibility_timeout(),
            wait_time_secs: default_wait_time(),
            max_messages: default_max_messages(),
            max_receive_count: default_max_receive_count(),
            poll_interval_ms: default_poll_interval(),
            region: None,
            endpoint: None,
        }
    }

    /// Visibility timeout as a duration.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Long-poll wait as a duration.
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    /// Store check interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_request_queue() -> QueueConfig {
    QueueConfig::with_url("feed-fetch-requests")
}

fn default_failed_url_queue() -> QueueConfig {
    QueueConfig::with_url("feed-failed-urls")
}

/// HTTP fetch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Total request timeout in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// Maximum number of redirects.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Maximum response body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
    /// User agent sent with each request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Allow loopback and private network targets.
    #[serde(default)]
    pub allow_private_addresses: bool,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    5
}

fn default_max_body_bytes() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_user_agent() -> String {
    "feedmon/0.1 (feed fetcher)".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            timeout_secs: default_fetch_timeout(),
            max_redirects: default_max_redirects(),
            max_body_bytes: default_max_body_bytes(),
            user_agent: default_user_agent(),
            allow_private_addresses: false,
        }
    }
}

/// Schedule emitter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Emitter tick interval in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Refresh rate assigned to feeds created without one, in seconds.
    #[serde(default = "default_refresh_rate")]
    pub default_refresh_rate_secs: i64,
    /// Days of request/response history kept before pruning.
    #[serde(default = "default_history_retention")]
    pub history_retention_days: i64,
}

fn default_tick_interval() -> u64 {
    60
}

fn default_refresh_rate() -> i64 {
    600 // 10 minutes
}

fn default_history_retention() -> i64 {
    14
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            default_refresh_rate_secs: default_refresh_rate(),
            history_retention_days: default_history_retention(),
        }
    }
}

/// Failure escalation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FailureConfig {
    /// Continuous failure duration, in hours, after which a feed is disabled.
    #[serde(default = "default_threshold_hours")]
    pub threshold_hours: i64,
}

fn default_threshold_hours() -> i64 {
    36
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            threshold_hours: default_threshold_hours(),
        }
    }
}

impl FailureConfig {
    /// Threshold as a chrono duration.
    pub fn threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.threshold_hours)
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Fetch-request queue.
    #[serde(default = "default_request_queue")]
    pub request_queue: QueueConfig,
    /// Failed-url escalation queue.
    #[serde(default = "default_failed_url_queue")]
    pub failed_url_queue: QueueConfig,
    /// HTTP fetch configuration.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Schedule emitter configuration.
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Failure escalation configuration.
    #[serde(default)]
    pub failure: FailureConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            request_queue: default_request_queue(),
            failed_url_queue: default_failed_url_queue(),
            fetch: FetchConfig::default(),
            schedule: ScheduleConfig::default(),
            failure: FailureConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(FeedmonError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| FeedmonError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `FAILED_REQUEST_DURATION_THRESHOLD_HOURS`
    /// - `FEEDMON_REQUEST_QUEUE_URL`
    /// - `FEEDMON_FAILED_URL_QUEUE_URL`
    /// - `FEEDMON_DATABASE_PATH`
    /// - `FEEDMON_LOG_LEVEL`
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(hours) = non_empty_env("FAILED_REQUEST_DURATION_THRESHOLD_HOURS") {
            self.failure.threshold_hours = hours.parse().map_err(|_| {
                FeedmonError::Config(format!(
                    "FAILED_REQUEST_DURATION_THRESHOLD_HOURS is not an integer: {hours}"
                ))
            })?;
        }
        if let Some(url) = non_empty_env("FEEDMON_REQUEST_QUEUE_URL") {
            self.request_queue.url = url;
        }
        if let Some(url) = non_empty_env("FEEDMON_FAILED_URL_QUEUE_URL") {
            self.failed_url_queue.url = url;
        }
        if let Some(path) = non_empty_env("FEEDMON_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(level) = non_empty_env("FEEDMON_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.failure.threshold_hours <= 0 {
            return Err(FeedmonError::Validation(
                "failure.threshold_hours must be positive".to_string(),
            ));
        }
        if self.schedule.tick_interval_secs == 0 {
            return Err(FeedmonError::Validation(
                "schedule.tick_interval_secs must be positive".to_string(),
            ));
        }
        if self.schedule.default_refresh_rate_secs <= 0 {
            return Err(FeedmonError::Validation(
                "schedule.default_refresh_rate_secs must be positive".to_string(),
            ));
        }
        if self.schedule.history_retention_days * 24 <= self.failure.threshold_hours {
            return Err(FeedmonError::Validation(
                "schedule.history_retention_days must cover failure.threshold_hours".to_string(),
            ));
        }
        for (name, queue) in [
            ("request_queue", &self.request_queue),
            ("failed_url_queue", &self.failed_url_queue),
        ] {
            if queue.url.trim().is_empty() {
                return Err(FeedmonError::Validation(format!("{name}.url is not set")));
            }
            if queue.max_messages == 0 {
                return Err(FeedmonError::Validation(format!(
                    "{name}.max_messages must be positive"
                )));
            }
            if queue.visibility_timeout_secs == 0 {
                return Err(FeedmonError::Validation(format!(
                    "{name}.visibility_timeout_secs must be positive"
                )));
            }
            if queue.max_receive_count == 0 {
                return Err(FeedmonError::Validation(format!(
                    "{name}.max_receive_count must be positive"
                )));
            }
        }
        if self.request_queue.url == self.failed_url_queue.url {
            return Err(FeedmonError::Validation(
                "request_queue and failed_url_queue must use different urls".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
