//! Source schema
//!
//! A source is one procurement portal or official bulletin. Besides its
//! identity and adapter wiring it carries health counters that are updated
//! only by the scan task that owns the source during a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use validator::Validate;

use super::{truncate_chars, MAX_OUTCOME_ERROR_CHARS};
use crate::error::MonitorError;

/// Consecutive failures after which a source is flagged as `error`
pub const ERROR_THRESHOLD: i64 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceLevel {
    #[serde(alias = "nacional")]
    National,
    Provincial,
    Municipal,
}

impl SourceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLevel::National => "national",
            SourceLevel::Provincial => "provincial",
            SourceLevel::Municipal => "municipal",
        }
    }

    /// Sort rank used when ordering sources for a run
    pub fn rank(&self) -> u8 {
        match self {
            SourceLevel::National => 0,
            SourceLevel::Provincial => 1,
            SourceLevel::Municipal => 2,
        }
    }
}

impl FromStr for SourceLevel {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "national" | "nacional" => Ok(SourceLevel::National),
            "provincial" => Ok(SourceLevel::Provincial),
            "municipal" => Ok(SourceLevel::Municipal),
            other => Err(MonitorError::StorageError(format!(
                "unknown source level: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Inactive,
    Error,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Inactive => "inactive",
            SourceStatus::Error => "error",
        }
    }
}

impl FromStr for SourceStatus {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SourceStatus::Active),
            "inactive" => Ok(SourceStatus::Inactive),
            "error" => Ok(SourceStatus::Error),
            other => Err(MonitorError::StorageError(format!(
                "unknown source status: {other}"
            ))),
        }
    }
}

/// Health fields written back after every scan attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub status: SourceStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_errors: i64,
}

impl Default for SourceHealth {
    fn default() -> Self {
        Self {
            status: SourceStatus::Active,
            last_checked_at: None,
            last_success_at: None,
            last_error: None,
            consecutive_errors: 0,
        }
    }
}

impl SourceHealth {
    /// Records a successful scan
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.last_checked_at = Some(now);
        self.last_success_at = Some(now);
        self.consecutive_errors = 0;
        self.status = SourceStatus::Active;
    }

    /// Records a failed scan; the source flips to `error` at the threshold
    pub fn record_failure(&mut self, now: DateTime<Utc>, error: &str) {
        self.last_checked_at = Some(now);
        self.last_error = Some(truncate_chars(error, MAX_OUTCOME_ERROR_CHARS));
        self.consecutive_errors += 1;
        if self.consecutive_errors >= ERROR_THRESHOLD {
            self.status = SourceStatus::Error;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: i64,
    pub name: String,
    /// Stable identifier, also part of every content hash
    pub short_name: String,
    pub url: String,
    pub level: SourceLevel,
    pub province: Option<String>,
    pub municipality: Option<String>,
    /// Key into the adapter registry
    pub adapter_key: String,
    /// Opaque adapter configuration
    pub adapter_config: serde_json::Value,
    pub is_enabled: bool,
    #[serde(flatten)]
    pub health: SourceHealth,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewSource {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 50))]
    pub short_name: String,
    #[validate(url)]
    pub url: String,
    pub level: SourceLevel,
    pub province: Option<String>,
    pub municipality: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub adapter_key: String,
    #[serde(default = "empty_config")]
    pub adapter_config: serde_json::Value,
    #[serde(default = "enabled_by_default")]
    pub is_enabled: bool,
}

fn empty_config() -> serde_json::Value {
    serde_json::json!({})
}

fn enabled_by_default() -> bool {
    true
}

impl NewSource {
    pub fn new(
        name: impl Into<String>,
        short_name: impl Into<String>,
        url: impl Into<String>,
        level: SourceLevel,
        adapter_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            short_name: short_name.into(),
            url: url.into(),
            level,
            province: None,
            municipality: None,
            adapter_key: adapter_key.into(),
            adapter_config: empty_config(),
            is_enabled: true,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.adapter_config = config;
        self
    }

    pub fn province(mut self, province: impl Into<String>) -> Self {
        self.province = Some(province.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }

    /// Materializes a stored source with fresh health fields
    pub fn into_source(self, id: i64, created_at: DateTime<Utc>) -> Source {
        Source {
            id,
            name: self.name,
            short_name: self.short_name,
            url: self.url,
            level: self.level,
            province: self.province,
            municipality: self.municipality,
            adapter_key: self.adapter_key,
            adapter_config: self.adapter_config,
            is_enabled: self.is_enabled,
            health: SourceHealth::default(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_reaches_error_at_threshold() {
        let mut health = SourceHealth::default();
        let now = Utc::now();

        for _ in 0..(ERROR_THRESHOLD - 1) {
            health.record_failure(now, "connection refused");
            assert_eq!(health.status, SourceStatus::Active);
        }

        health.record_failure(now, "connection refused");
        assert_eq!(health.consecutive_errors, ERROR_THRESHOLD);
        assert_eq!(health.status, SourceStatus::Error);
        assert_eq!(health.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_health_success_resets() {
        let mut health = SourceHealth::default();
        let now = Utc::now();
        for _ in 0..7 {
            health.record_failure(now, "boom");
        }

        health.record_success(now);
        assert_eq!(health.consecutive_errors, 0);
        assert_eq!(health.status, SourceStatus::Active);
        assert_eq!(health.last_success_at, Some(now));
    }

    #[test]
    fn test_health_error_is_truncated() {
        let mut health = SourceHealth::default();
        health.record_failure(Utc::now(), &"x".repeat(2000));
        assert_eq!(health.last_error.unwrap().chars().count(), MAX_OUTCOME_ERROR_CHARS);
    }

    #[test]
    fn test_level_parsing_and_rank() {
        assert_eq!("nacional".parse::<SourceLevel>().unwrap(), SourceLevel::National);
        assert_eq!("Municipal".parse::<SourceLevel>().unwrap(), SourceLevel::Municipal);
        assert!("federal".parse::<SourceLevel>().is_err());
        assert!(SourceLevel::National.rank() < SourceLevel::Provincial.rank());
    }

    #[test]
    fn test_new_source_validation() {
        let ok = NewSource::new("Boletín", "boletin", "https://example.org", SourceLevel::National, "rss_feed");
        assert!(ok.validate().is_ok());

        let bad = NewSource::new("Boletín", "", "not a url", SourceLevel::National, "rss_feed");
        let errors = bad.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("short_name"));
        assert!(errors.field_errors().contains_key("url"));
    }
}
