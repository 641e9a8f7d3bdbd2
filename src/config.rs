//! Configuration for the tender monitor
//!
//! Values come from the process environment (after `.env` is loaded), one
//! variable per field, e.g. `DATABASE_URL`, `SCAN_INTERVAL_HOURS`.

use chrono::Duration;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{MonitorError, Result};
use crate::matcher::MatchOperator;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Database
    #[serde(default = "default_database_url")]
    pub database_url: String,

    // Scheduling
    #[serde(default = "default_scan_interval_hours")]
    pub scan_interval_hours: u64,
    #[serde(default = "default_true")]
    pub scan_on_startup: bool,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,

    // Concurrency ceiling, applied on top of the storage backend's own limit
    pub max_concurrent_scans: Option<usize>,

    // Adapter HTTP behaviour
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    pub user_agent: Option<String>,

    // Matching
    #[serde(default = "default_match_operator")]
    pub match_operator: String,
    #[serde(default)]
    pub min_relevance_score: f64,

    // Alerts
    #[serde(default)]
    pub alerts_enabled: bool,
    pub alert_webhook_url: Option<String>,
    #[serde(default = "default_alert_max_records")]
    pub alert_max_records: usize,

    // Seeding
    #[serde(default = "default_sources_registry_file")]
    pub sources_registry_file: PathBuf,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default)]
    pub metrics_enabled: bool,
}

fn default_database_url() -> String {
    "sqlite://licitaciones.db?mode=rwc".to_string()
}

fn default_scan_interval_hours() -> u64 {
    4
}

fn default_true() -> bool {
    true
}

fn default_lookback_hours() -> i64 {
    48
}

fn default_api_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_delay_ms() -> u64 {
    2000
}

fn default_match_operator() -> String {
    "OR".to_string()
}

fn default_alert_max_records() -> usize {
    50
}

fn default_sources_registry_file() -> PathBuf {
    PathBuf::from("data/sources_registry.json")
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            scan_interval_hours: default_scan_interval_hours(),
            scan_on_startup: true,
            lookback_hours: default_lookback_hours(),
            max_concurrent_scans: None,
            api_timeout_secs: default_api_timeout_secs(),
            max_retries: default_max_retries(),
            request_delay_ms: default_request_delay_ms(),
            user_agent: None,
            match_operator: default_match_operator(),
            min_relevance_score: 0.0,
            alerts_enabled: false,
            alert_webhook_url: None,
            alert_max_records: default_alert_max_records(),
            sources_registry_file: default_sources_registry_file(),
            metrics_port: default_metrics_port(),
            metrics_enabled: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.scan_interval_hours == 0 {
            return Err(MonitorError::InvalidConfig(
                "scan_interval_hours must be at least 1".into(),
            ));
        }
        if self.lookback_hours <= 0 {
            return Err(MonitorError::InvalidConfig(
                "lookback_hours must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_relevance_score) {
            return Err(MonitorError::InvalidConfig(format!(
                "min_relevance_score {} outside [0, 1]",
                self.min_relevance_score
            )));
        }
        if self.max_concurrent_scans == Some(0) {
            return Err(MonitorError::InvalidConfig(
                "max_concurrent_scans must be at least 1 when set".into(),
            ));
        }
        if self.alerts_enabled && self.alert_webhook_url.is_none() {
            return Err(MonitorError::InvalidConfig(
                "alerts_enabled requires alert_webhook_url".into(),
            ));
        }
        if let Some(ref url) = self.alert_webhook_url {
            url::Url::parse(url)
                .map_err(|e| MonitorError::InvalidConfig(format!("alert_webhook_url: {e}")))?;
        }
        self.operator()?;
        Ok(())
    }

    /// Parsed keyword combination operator
    pub fn operator(&self) -> Result<MatchOperator> {
        self.match_operator.parse()
    }

    /// Default lookback window for runs without an explicit `since`
    pub fn lookback(&self) -> Duration {
        Duration::hours(self.lookback_hours)
    }

    pub fn scan_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scan_interval_hours * 3600)
    }
}

/// Parses a `--since` value such as "1h", "30m", "2d" or "3days 4h"
pub fn parse_since(since_str: &str) -> Result<Duration> {
    let since_str = since_str.trim().to_lowercase();

    if since_str.is_empty() {
        return Err(MonitorError::InvalidConfig("empty duration string".into()));
    }

    if let Ok(std_duration) = humantime::parse_duration(&since_str) {
        return Duration::from_std(std_duration)
            .map_err(|e| MonitorError::InvalidConfig(e.to_string()));
    }

    let (value_str, unit) = since_str.split_at(since_str.len() - 1);
    let value: i64 = value_str
        .parse()
        .map_err(|_| MonitorError::InvalidConfig(format!("invalid duration: {since_str}")))?;

    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        "w" => Ok(Duration::weeks(value)),
        _ => Err(MonitorError::InvalidConfig(format!(
            "unknown duration unit: {unit}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();

        assert_eq!(config.scan_interval_hours, 4);
        assert_eq!(config.lookback(), Duration::hours(48));
        assert_eq!(config.api_timeout_secs, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.operator().unwrap(), MatchOperator::Or);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            min_relevance_score: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            match_operator: "XOR".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            alerts_enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_concurrent_scans: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_since() {
        assert_eq!(parse_since("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_since("30m").unwrap(), Duration::minutes(30));
        assert_eq!(parse_since("2d").unwrap(), Duration::days(2));
        assert_eq!(parse_since("1w").unwrap(), Duration::weeks(1));
        assert_eq!(parse_since(" 60s ").unwrap(), Duration::seconds(60));
        assert!(parse_since("").is_err());
        assert!(parse_since("abc").is_err());
    }
}
