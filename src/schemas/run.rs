//! Run and per-source outcome schemas
//!
//! A `Run` is the audit record of one orchestration pass. It is created
//! `running` and always finishes in one of the terminal states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{truncate_chars, MAX_RUN_ERROR_CHARS};
use crate::error::MonitorError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Terminal status for a run that attempted `attempted` sources.
    ///
    /// Zero sources counts as a total failure.
    pub fn from_counts(attempted: usize, failed: usize) -> Self {
        if failed >= attempted {
            RunStatus::Failed
        } else if failed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        }
    }
}

impl FromStr for RunStatus {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(MonitorError::StorageError(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// Error summary attached to a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub error: String,
}

impl SourceError {
    pub fn for_source(source: &str, error: &str) -> Self {
        Self {
            source: Some(source.to_string()),
            error: truncate_chars(error, MAX_RUN_ERROR_CHARS),
        }
    }

    pub fn run_level(error: &str) -> Self {
        Self {
            source: None,
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: i64,
    pub status: RunStatus,
    /// Free-form label: "scheduler", "manual", "cli", ...
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub sources_scanned: i64,
    pub sources_failed: i64,
    pub records_found: i64,
    pub records_new: i64,
    pub keywords_used: Vec<String>,
    pub error_details: Vec<SourceError>,
}

impl Run {
    /// A fresh run; the id is assigned by storage
    pub fn start(trigger: &str) -> Self {
        Self {
            id: 0,
            status: RunStatus::Running,
            trigger: trigger.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            sources_scanned: 0,
            sources_failed: 0,
            records_found: 0,
            records_new: 0,
            keywords_used: Vec::new(),
            error_details: Vec::new(),
        }
    }

    /// Stamps the terminal status, finish time and duration
    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_secs = Some(elapsed_secs(self.started_at, now));
    }

    /// Marks the run failed with a run-level error
    pub fn fail(&mut self, error: &str) {
        self.error_details.push(SourceError::run_level(error));
        self.finish(RunStatus::Failed);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Pending,
    Success,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Pending => "pending",
            OutcomeStatus::Success => "success",
            OutcomeStatus::Error => "error",
        }
    }
}

impl FromStr for OutcomeStatus {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutcomeStatus::Pending),
            "success" => Ok(OutcomeStatus::Success),
            "error" => Ok(OutcomeStatus::Error),
            other => Err(MonitorError::StorageError(format!(
                "unknown outcome status: {other}"
            ))),
        }
    }
}

/// Result of scanning one source within one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceOutcome {
    pub id: i64,
    pub run_id: i64,
    pub source_id: i64,
    pub status: OutcomeStatus,
    pub records_found: i64,
    pub records_new: i64,
    pub duration_secs: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Final fields written onto an outcome row
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeUpdate {
    pub status: OutcomeStatus,
    pub records_found: i64,
    pub records_new: i64,
    pub duration_secs: f64,
    pub error_message: Option<String>,
}

pub fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(RunStatus::from_counts(3, 0), RunStatus::Success);
        assert_eq!(RunStatus::from_counts(3, 1), RunStatus::Partial);
        assert_eq!(RunStatus::from_counts(3, 3), RunStatus::Failed);
        assert_eq!(RunStatus::from_counts(0, 0), RunStatus::Failed);
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::start("manual");
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.status.is_terminal());

        run.finish(RunStatus::Partial);
        assert!(run.status.is_terminal());
        assert!(run.finished_at.is_some());
        assert!(run.duration_secs.unwrap() >= 0.0);
    }

    #[test]
    fn test_run_fail_records_error() {
        let mut run = Run::start("scheduler");
        run.fail("No active keywords configured");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_details.len(), 1);
        assert!(run.error_details[0].source.is_none());
    }

    #[test]
    fn test_source_error_truncation() {
        let err = SourceError::for_source("pbac", &"é".repeat(450));
        assert_eq!(err.error.chars().count(), MAX_RUN_ERROR_CHARS);
        assert_eq!(err.source.as_deref(), Some("pbac"));
    }
}
