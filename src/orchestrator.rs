//! Run orchestration
//!
//! Loads the keyword snapshot and the enabled sources, fans out one
//! `ScanTask` per source under a concurrency bound, and folds the outcomes
//! into the run's audit record. A run is always persisted in a terminal
//! state, whatever happens inside it.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use validator::Validate;

use crate::config::Config;
use crate::error::{MonitorError, Result};
use crate::matcher::{KeywordMatcher, MatchOperator};
use crate::metrics;
use crate::scan_task::{ScanContext, ScanTask};
use crate::schemas::{NewSource, Run, RunStatus, Source, SourceError};
use crate::sources::AdapterRegistry;
use crate::storage::{ScanFailure, Store};

/// Run-independent orchestration settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub lookback: chrono::Duration,
    /// Optional ceiling below the backend's own writer limit
    pub max_concurrent_scans: Option<usize>,
    pub operator: MatchOperator,
    pub min_relevance_score: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lookback: chrono::Duration::hours(48),
            max_concurrent_scans: None,
            operator: MatchOperator::Or,
            min_relevance_score: 0.0,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            lookback: config.lookback(),
            max_concurrent_scans: config.max_concurrent_scans,
            operator: config.operator()?,
            min_relevance_score: config.min_relevance_score,
        })
    }
}

/// Parameters of one run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub trigger: String,
    /// Replaces the stored active keywords for this run
    pub keywords: Option<Vec<String>>,
    /// Restricts the run to these source ids
    pub source_ids: Option<Vec<i64>>,
    /// Lower time bound; defaults to now minus the lookback
    pub since: Option<DateTime<Utc>>,
}

impl RunRequest {
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
            ..Default::default()
        }
    }

    pub fn keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = Some(keywords);
        self
    }

    pub fn sources(mut self, ids: Vec<i64>) -> Self {
        self.source_ids = Some(ids);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    registry: Arc<AdapterRegistry>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<AdapterRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Scan tasks allowed to run at once
    pub fn concurrency_limit(&self) -> usize {
        let backend = self.store.max_concurrent_writers().max(1);
        self.settings
            .max_concurrent_scans
            .map_or(backend, |ceiling| ceiling.clamp(1, backend))
    }

    /// Validates and stores a new source. Unknown adapter keys are rejected.
    pub async fn register_source(&self, source: &NewSource) -> Result<Source> {
        source.validate()?;
        self.registry.validate(&source.adapter_key)?;
        let source = self.store.insert_source(source).await?;
        info!(source = %source.short_name, adapter = %source.adapter_key, "Source registered");
        Ok(source)
    }

    /// Executes one run to completion and returns it in a terminal state.
    /// Only a failure to create the run record is returned as an error.
    #[instrument(skip(self, request), fields(trigger = %request.trigger))]
    pub async fn run(&self, request: RunRequest) -> Result<Run> {
        let mut run = self.store.create_run(&Run::start(&request.trigger)).await?;
        info!(run_id = run.id, "Run started");

        if let Err(e) = self.execute(&mut run, &request).await {
            error!(run_id = run.id, error = %e, "Run failed");
            run.fail(&e.to_string());
        }

        if let Err(e) = self.store.save_run(&run).await {
            error!(run_id = run.id, error = %e, "Could not save run, retrying as failed");
            run.fail(&format!("run could not be saved: {e}"));
            if let Err(e) = self.store.save_run(&run).await {
                error!(run_id = run.id, error = %e, "Run left unsaved");
            }
        }
        metrics::record_run(run.status.as_str());
        info!(
            run_id = run.id,
            status = run.status.as_str(),
            sources_scanned = run.sources_scanned,
            sources_failed = run.sources_failed,
            records_found = run.records_found,
            records_new = run.records_new,
            duration_secs = run.duration_secs.unwrap_or_default(),
            "Run finished"
        );
        Ok(run)
    }

    async fn execute(&self, run: &mut Run, request: &RunRequest) -> Result<()> {
        let keywords: Vec<String> = match &request.keywords {
            Some(list) => list
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            None => self
                .store
                .active_keywords()
                .await?
                .into_iter()
                .map(|k| k.term)
                .collect(),
        };
        if keywords.is_empty() {
            return Err(MonitorError::NoActiveKeywords);
        }
        run.keywords_used = keywords.clone();

        let since = request
            .since
            .unwrap_or_else(|| Utc::now() - self.settings.lookback);
        let sources = self
            .store
            .enabled_sources(request.source_ids.as_deref())
            .await?;
        if sources.is_empty() {
            warn!(run_id = run.id, "No enabled sources to scan");
            run.error_details.push(SourceError::run_level("no enabled sources"));
        }

        let limit = self.concurrency_limit();
        info!(
            run_id = run.id,
            keywords = keywords.len(),
            sources = sources.len(),
            concurrency = limit,
            since = %since,
            "Scanning sources"
        );

        let context = Arc::new(ScanContext {
            run_id: run.id,
            matcher: KeywordMatcher::new(&keywords, self.settings.operator),
            keywords,
            since,
            min_score: self.settings.min_relevance_score,
        });

        let semaphore = Arc::new(Semaphore::new(limit));
        let handles: Vec<_> = sources
            .iter()
            .map(|source| {
                let task = ScanTask::new(
                    self.store.clone(),
                    self.registry.clone(),
                    source.clone(),
                    context.clone(),
                );
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| MonitorError::TaskAborted(e.to_string()))?;
                    task.run().await
                })
            })
            .collect();

        let results = join_all(handles).await;

        let mut failed = 0usize;
        for (source, result) in sources.iter().zip(results) {
            match result {
                Ok(Ok(report)) => {
                    run.records_found += report.found as i64;
                    run.records_new += report.new as i64;
                }
                Ok(Err(e)) => {
                    failed += 1;
                    run.error_details
                        .push(SourceError::for_source(&source.short_name, &e.to_string()));
                }
                Err(join_err) => {
                    failed += 1;
                    let message = format!("scan task aborted: {join_err}");
                    error!(run_id = run.id, source = %source.short_name, error = %message, "Scan task did not complete");
                    self.record_abort(run.id, source, &message).await;
                    run.error_details
                        .push(SourceError::for_source(&source.short_name, &message));
                }
            }
        }

        run.sources_scanned = sources.len() as i64;
        run.sources_failed = failed as i64;
        run.finish(RunStatus::from_counts(sources.len(), failed));
        Ok(())
    }

    /// A task that panicked never reached its own failure path
    async fn record_abort(&self, run_id: i64, source: &Source, message: &str) {
        let failure = ScanFailure {
            run_id,
            source_id: source.id,
            error: message.to_string(),
            duration_secs: 0.0,
            at: Utc::now(),
        };
        if let Err(e) = self.store.record_scan_failure(&failure).await {
            error!(source = %source.short_name, error = %e, "Could not record aborted scan");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::{NewKeyword, SourceLevel};
    use crate::sources::AdapterSettings;
    use crate::storage::MemoryStore;

    fn orchestrator(store: MemoryStore, settings: OrchestratorSettings) -> Orchestrator {
        Orchestrator::new(
            Arc::new(store),
            Arc::new(AdapterRegistry::builtin(AdapterSettings::default())),
            settings,
        )
    }

    #[test]
    fn test_concurrency_limit() {
        let store = MemoryStore::with_max_writers(4);
        assert_eq!(orchestrator(store.clone(), OrchestratorSettings::default()).concurrency_limit(), 4);

        let lowered = OrchestratorSettings {
            max_concurrent_scans: Some(2),
            ..Default::default()
        };
        assert_eq!(orchestrator(store.clone(), lowered).concurrency_limit(), 2);

        let raised = OrchestratorSettings {
            max_concurrent_scans: Some(16),
            ..Default::default()
        };
        assert_eq!(orchestrator(store, raised).concurrency_limit(), 4);
    }

    #[tokio::test]
    async fn test_register_source_rejects_unknown_adapter() {
        let orch = orchestrator(MemoryStore::new(), OrchestratorSettings::default());
        let err = orch
            .register_source(&NewSource::new(
                "Portal",
                "portal",
                "https://portal.example",
                SourceLevel::Municipal,
                "html_scraper",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::UnknownAdapter(_)));
        assert!(orch.store().list_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_without_keywords_fails() {
        let orch = orchestrator(MemoryStore::new(), OrchestratorSettings::default());
        let run = orch.run(RunRequest::new("test")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.sources_scanned, 0);
        assert!(run.error_details[0].error.contains("No active keywords"));
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_run_without_sources_fails() {
        let store = MemoryStore::new();
        store.insert_keyword(&NewKeyword::new("forense")).await.unwrap();
        let orch = orchestrator(store, OrchestratorSettings::default());

        let run = orch.run(RunRequest::new("test")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.keywords_used, vec!["forense".to_string()]);
        assert_eq!(run.sources_scanned, 0);
        assert_eq!(run.error_details.len(), 1);
        assert_eq!(run.error_details[0].source, None);
        assert_eq!(run.error_details[0].error, "no enabled sources");

        let stored = orch.store().get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_details, run.error_details);
    }

    #[tokio::test]
    async fn test_failed_save_is_retried_as_failed_run() {
        let store = MemoryStore::new();
        store.insert_keyword(&NewKeyword::new("forense")).await.unwrap();
        store.fail_next_run_saves(1);
        let orch = orchestrator(store, OrchestratorSettings::default());

        let run = orch.run(RunRequest::new("test")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run
            .error_details
            .iter()
            .any(|d| d.source.is_none() && d.error.contains("could not be saved")));

        let stored = orch.store().get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_unsaved_run_is_still_returned_terminal() {
        let store = MemoryStore::new();
        store.insert_keyword(&NewKeyword::new("forense")).await.unwrap();
        store.fail_next_run_saves(2);
        let orch = orchestrator(store.clone(), OrchestratorSettings::default());

        let run = orch.run(RunRequest::new("test")).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.finished_at.is_some());

        // the store recovers for the next run
        let next = orch.run(RunRequest::new("test")).await.unwrap();
        let stored = store.get_run(next.id).await.unwrap().unwrap();
        assert!(stored.status.is_terminal());
    }
}
