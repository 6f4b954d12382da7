//! Configuration management for communal
//!
//! Environment-based configuration with defaults and validation. Every
//! scheduler and manager receives its configuration at construction; there
//! is no global mutable configuration state.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core_community::{
    CommunityOptions, FirstEventWins, LatestClockWins, PendingResolution, GRANT_EXPIRATION,
};
use crate::logging::{LogConfig, LogLevel};

mod error;

pub use error::ConfigError;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Background publication loops
    pub scheduler: SchedulerConfig,

    /// Grant issuance
    pub grants: GrantConfig,

    /// Membership estimation and pending event resolution
    pub membership: MembershipConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Publication loop tick
    #[serde(with = "humantime_serde")]
    pub publish_interval: Duration,

    /// Minimum time between two republish rounds of the same community
    #[serde(with = "humantime_serde")]
    pub advertise_min_interval: Duration,

    /// Maximum age of a distributed key before forced rotation
    #[serde(with = "humantime_serde")]
    pub rekey_interval: Duration,

    /// Rekey loop tick
    #[serde(with = "humantime_serde")]
    pub rekey_tick: Duration,

    /// Active member refresh tick
    #[serde(with = "humantime_serde")]
    pub active_members_tick: Duration,

    /// Minimum time between two active member refreshes of a community
    #[serde(with = "humantime_serde")]
    pub active_members_min_interval: Duration,

    /// Grant rebuild interval
    #[serde(with = "humantime_serde")]
    pub grant_refresh_interval: Duration,

    /// Delivery attempts per key recipient before giving up
    pub key_retry_attempts: u32,

    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Grant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantConfig {
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,
}

/// Policy for conflicting pending events targeting the same entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    #[default]
    FirstEventWins,
    LatestClockWins,
}

impl FromStr for ResolutionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_event_wins" => Ok(ResolutionPolicy::FirstEventWins),
            "latest_clock_wins" => Ok(ResolutionPolicy::LatestClockWins),
            other => Err(ConfigError::InvalidValue(format!(
                "Invalid resolution policy: {}",
                other
            ))),
        }
    }
}

/// Membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Target false-positive rate of channel membership filters
    pub bloom_false_positive_rate: f64,

    pub pending_resolution: ResolutionPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(5 * 60),
            advertise_min_interval: Duration::from_secs(5 * 60),
            rekey_interval: Duration::from_secs(48 * 60 * 60),
            rekey_tick: Duration::from_secs(5 * 60),
            active_members_tick: Duration::from_secs(5 * 60),
            active_members_min_interval: Duration::from_secs(24 * 60 * 60),
            grant_refresh_interval: Duration::from_secs(4 * 60 * 60),
            key_retry_attempts: 3,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Tick of the rekey loop
    ///
    /// A rekey interval shorter than the configured tick is checked ten
    /// times per interval instead.
    pub fn effective_rekey_tick(&self) -> Duration {
        if self.rekey_interval < self.rekey_tick {
            (self.rekey_interval / 10).max(Duration::from_millis(1))
        } else {
            self.rekey_tick
        }
    }
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            expiration: GRANT_EXPIRATION,
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            bloom_false_positive_rate: 0.001,
            pending_resolution: ResolutionPolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn env_parse<T>(key: &str, what: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", what, e))),
        Err(_) => Ok(None),
    }
}

fn env_duration(key: &str, what: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(value) => humantime_serde::re::humantime::parse_duration(&value)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(format!("Invalid {}: {}", what, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: COMMUNAL_<SECTION>_<KEY>
    /// Example: COMMUNAL_SCHEDULER_REKEY_INTERVAL=12h
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Scheduler config
        let scheduler = &mut config.scheduler;
        if let Some(v) = env_duration("COMMUNAL_SCHEDULER_PUBLISH_INTERVAL", "publish interval")? {
            scheduler.publish_interval = v;
        }
        if let Some(v) = env_duration("COMMUNAL_SCHEDULER_ADVERTISE_MIN_INTERVAL", "advertise interval")? {
            scheduler.advertise_min_interval = v;
        }
        if let Some(v) = env_duration("COMMUNAL_SCHEDULER_REKEY_INTERVAL", "rekey interval")? {
            scheduler.rekey_interval = v;
        }
        if let Some(v) = env_duration("COMMUNAL_SCHEDULER_REKEY_TICK", "rekey tick")? {
            scheduler.rekey_tick = v;
        }
        if let Some(v) = env_duration("COMMUNAL_SCHEDULER_ACTIVE_MEMBERS_TICK", "active members tick")? {
            scheduler.active_members_tick = v;
        }
        if let Some(v) = env_duration(
            "COMMUNAL_SCHEDULER_ACTIVE_MEMBERS_MIN_INTERVAL",
            "active members interval",
        )? {
            scheduler.active_members_min_interval = v;
        }
        if let Some(v) = env_duration("COMMUNAL_SCHEDULER_GRANT_REFRESH_INTERVAL", "grant refresh interval")? {
            scheduler.grant_refresh_interval = v;
        }
        if let Some(v) = env_parse("COMMUNAL_SCHEDULER_KEY_RETRY_ATTEMPTS", "key retry attempts")? {
            scheduler.key_retry_attempts = v;
        }

        // Grants config
        if let Some(v) = env_duration("COMMUNAL_GRANTS_EXPIRATION", "grant expiration")? {
            config.grants.expiration = v;
        }

        // Membership config
        if let Some(v) = env_parse(
            "COMMUNAL_MEMBERSHIP_BLOOM_FALSE_POSITIVE_RATE",
            "false positive rate",
        )? {
            config.membership.bloom_false_positive_rate = v;
        }
        if let Some(v) = env_parse("COMMUNAL_MEMBERSHIP_PENDING_RESOLUTION", "resolution policy")? {
            config.membership.pending_resolution = v;
        }

        // Logging config
        if let Ok(level) = env::var("COMMUNAL_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(v) = env_parse("COMMUNAL_LOG_JSON", "JSON flag")? {
            config.logging.json_format = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        let intervals = [
            ("publish_interval", s.publish_interval),
            ("advertise_min_interval", s.advertise_min_interval),
            ("rekey_interval", s.rekey_interval),
            ("rekey_tick", s.rekey_tick),
            ("active_members_tick", s.active_members_tick),
            ("grant_refresh_interval", s.grant_refresh_interval),
            ("grants.expiration", self.grants.expiration),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ValidationFailed(format!(
                "{} must be greater than 0",
                name
            )));
        }

        let rate = self.membership.bloom_false_positive_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(ConfigError::ValidationFailed(format!(
                "bloom_false_positive_rate must be in (0, 1), got {}",
                rate
            )));
        }

        if LogLevel::from_str(&self.logging.level).is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }

    /// Community options carrying the configured policies
    pub fn community_options(&self) -> CommunityOptions {
        let resolution: Arc<dyn PendingResolution> = match self.membership.pending_resolution {
            ResolutionPolicy::FirstEventWins => Arc::new(FirstEventWins),
            ResolutionPolicy::LatestClockWins => Arc::new(LatestClockWins),
        };
        let mut options = CommunityOptions::default().with_resolution(resolution);
        options.grant_expiration = self.grants.expiration;
        options.bloom_false_positive_rate = self.membership.bloom_false_positive_rate;
        options
    }

    /// Logging setup matching this configuration
    pub fn log_config(&self) -> Result<LogConfig, ConfigError> {
        let level = LogLevel::from_str(&self.logging.level)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        Ok(LogConfig::new(level)
            .with_timestamp(self.logging.with_timestamp)
            .with_target(self.logging.with_target)
            .json_format(self.logging.json_format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.rekey_interval, Duration::from_secs(48 * 3600));
        assert_eq!(config.grants.expiration, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.scheduler.publish_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.membership.bloom_false_positive_rate = 1.5;
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_rekey_tick() {
        let mut scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.effective_rekey_tick(), scheduler.rekey_tick);

        scheduler.rekey_interval = Duration::from_secs(10);
        assert_eq!(scheduler.effective_rekey_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("communal.toml");

        let mut config = Config::default();
        config.membership.pending_resolution = ResolutionPolicy::LatestClockWins;
        config.scheduler.key_retry_attempts = 7;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.membership.pending_resolution, ResolutionPolicy::LatestClockWins);
        assert_eq!(loaded.scheduler.key_retry_attempts, 7);
        assert_eq!(loaded.scheduler.publish_interval, config.scheduler.publish_interval);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[scheduler]\nrekey_interval = \"12h\"\n").unwrap();
        assert_eq!(config.scheduler.rekey_interval, Duration::from_secs(12 * 3600));
        assert_eq!(config.scheduler.publish_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_resolution_policy_parse() {
        assert_eq!(
            "latest_clock_wins".parse::<ResolutionPolicy>().unwrap(),
            ResolutionPolicy::LatestClockWins
        );
        assert!("newest".parse::<ResolutionPolicy>().is_err());
        assert_eq!(
            Config::default().community_options().resolution.name(),
            FirstEventWins.name()
        );
    }
}
