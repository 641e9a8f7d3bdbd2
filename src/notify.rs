//! Run notifications
//!
//! After a run that produced new records, the run and the best unseen
//! records are handed to a `RunNotifier`. Notifiers only read; delivery
//! failures are logged and never affect the run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MonitorError, Result};
use crate::schemas::{Run, StoredRecord};
use crate::storage::Store;

/// Record fields included in a notification
#[derive(Debug, Clone, Serialize)]
pub struct RecordDigest {
    pub id: i64,
    pub source: String,
    pub title: String,
    pub organization: Option<String>,
    pub relevance_score: f64,
    pub matched_keywords: Vec<String>,
    pub detail_url: Option<String>,
    pub closes_at: Option<DateTime<Utc>>,
}

impl From<&StoredRecord> for RecordDigest {
    fn from(record: &StoredRecord) -> Self {
        Self {
            id: record.id,
            source: record.candidate.source_short_name.clone(),
            title: record.candidate.title.clone(),
            organization: record.candidate.organization.clone(),
            relevance_score: record.relevance_score,
            matched_keywords: record.matched_keywords.clone(),
            detail_url: record.candidate.detail_url.clone(),
            closes_at: record.candidate.closes_at,
        }
    }
}

/// Payload posted for a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub status: String,
    pub trigger: String,
    pub finished_at: Option<DateTime<Utc>>,
    pub sources_scanned: i64,
    pub sources_failed: i64,
    pub records_found: i64,
    pub records_new: i64,
    pub records: Vec<RecordDigest>,
}

impl RunSummary {
    pub fn new(run: &Run, records: &[StoredRecord]) -> Self {
        Self {
            run_id: run.id,
            status: run.status.as_str().to_string(),
            trigger: run.trigger.clone(),
            finished_at: run.finished_at,
            sources_scanned: run.sources_scanned,
            sources_failed: run.sources_failed,
            records_found: run.records_found,
            records_new: run.records_new,
            records: records.iter().map(RecordDigest::from).collect(),
        }
    }
}

#[async_trait]
pub trait RunNotifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, run: &Run, records: &[StoredRecord]) -> Result<()>;
}

/// Posts the run summary as JSON
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: url::Url,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| MonitorError::InvalidConfig(format!("alert webhook url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MonitorError::NotifyError(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl RunNotifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, run: &Run, records: &[StoredRecord]) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&RunSummary::new(run, records))
            .send()
            .await
            .map_err(|e| MonitorError::NotifyError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::NotifyError(format!(
                "webhook answered HTTP {status}"
            )));
        }
        Ok(())
    }
}

/// Notifier selected by configuration, if alerts are enabled
pub fn from_config(config: &Config) -> Result<Option<Box<dyn RunNotifier>>> {
    if !config.alerts_enabled {
        return Ok(None);
    }
    let url = config.alert_webhook_url.as_deref().ok_or_else(|| {
        MonitorError::InvalidConfig("alerts_enabled requires alert_webhook_url".into())
    })?;
    Ok(Some(Box::new(WebhookNotifier::new(
        url,
        Duration::from_secs(config.api_timeout_secs),
    )?)))
}

/// Notifies when the run produced new records. Returns whether a
/// notification was delivered.
pub async fn notify_if_new(
    store: &dyn Store,
    notifier: &dyn RunNotifier,
    run: &Run,
    max_records: usize,
) -> bool {
    if run.records_new <= 0 {
        debug!(run_id = run.id, "No new records, skipping notification");
        return false;
    }

    let records = match store.unseen_records(max_records).await {
        Ok(records) => records,
        Err(e) => {
            warn!(run_id = run.id, error = %e, "Could not load records for notification");
            return false;
        }
    };

    match notifier.notify(run, &records).await {
        Ok(()) => {
            info!(run_id = run.id, notifier = notifier.name(), records = records.len(), "Notification sent");
            true
        }
        Err(e) => {
            warn!(run_id = run.id, notifier = notifier.name(), error = %e, "Notification failed");
            false
        }
    }
}
