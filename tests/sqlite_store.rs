//! Scan engine against a real SQLite database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use licitaforense_monitor::error::AdapterError;
use licitaforense_monitor::orchestrator::{Orchestrator, OrchestratorSettings, RunRequest};
use licitaforense_monitor::schemas::{
    CandidateRecord, NewKeyword, NewSource, OutcomeStatus, RecordStatus, RunStatus, SourceLevel,
    SourceStatus,
};
use licitaforense_monitor::sources::{AdapterRegistry, AdapterSettings, SourceAdapter};
use licitaforense_monitor::storage::{Backend, SqliteStore, Store};

/// Returns whatever the test last put in the shared slot
struct SlotAdapter {
    slot: Arc<Mutex<Result<Vec<CandidateRecord>, String>>>,
}

#[async_trait]
impl SourceAdapter for SlotAdapter {
    fn key(&self) -> &'static str {
        "slot"
    }

    async fn fetch(
        &self,
        _keywords: &[String],
        _since: DateTime<Utc>,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        self.slot.lock().clone().map_err(AdapterError::Transport)
    }
}

async fn setup() -> (
    Arc<SqliteStore>,
    Orchestrator,
    Arc<Mutex<Result<Vec<CandidateRecord>, String>>>,
    i64,
) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let slot = Arc::new(Mutex::new(Ok(Vec::new())));

    let mut registry = AdapterRegistry::new(AdapterSettings::default());
    let adapter_slot = slot.clone();
    registry.register("slot", move |_, _| {
        Ok(Arc::new(SlotAdapter {
            slot: adapter_slot.clone(),
        }) as Arc<dyn SourceAdapter>)
    });

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(registry),
        OrchestratorSettings::default(),
    );

    store
        .insert_keyword(&NewKeyword::new("criminalistica").priority(10))
        .await
        .unwrap();
    store.insert_keyword(&NewKeyword::new("luminol")).await.unwrap();
    let source = orchestrator
        .register_source(
            &NewSource::new(
                "Compras Mendoza",
                "compras-mza",
                "https://comprar.mendoza.gov.ar",
                SourceLevel::Provincial,
                "slot",
            )
            .province("Mendoza"),
        )
        .await
        .unwrap();

    (store, orchestrator, slot, source.id)
}

fn candidate(title: &str, org: &str) -> CandidateRecord {
    let mut record = CandidateRecord::new(title, "");
    record.organization = Some(org.to_string());
    record.description = Some("Adquisición para el gabinete de criminalística".into());
    record.external_id = Some(format!("ext-{}", title.len()));
    record
}

#[tokio::test]
async fn test_sqlite_reports_single_writer() {
    let (store, orchestrator, _, _) = setup().await;
    assert_eq!(store.backend(), Backend::Sqlite);
    assert_eq!(orchestrator.concurrency_limit(), 1);
}

#[tokio::test]
async fn test_sqlite_run_persists_records_and_outcomes() {
    let (store, orchestrator, slot, source_id) = setup().await;
    *slot.lock() = Ok(vec![
        candidate("Reactivo luminol", "Ministerio de Seguridad"),
        candidate("Reactivo luminol", "Ministerio de Seguridad"),
        candidate("Lupas de criminalística", "Poder Judicial"),
    ]);

    let run = orchestrator.run(RunRequest::new("test")).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.records_found, 3);
    assert_eq!(run.records_new, 2);
    assert_eq!(
        run.keywords_used,
        vec!["criminalistica".to_string(), "luminol".to_string()]
    );

    let stored = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.records_new, 2);
    assert_eq!(stored.keywords_used, run.keywords_used);

    let records = store.records_for_source(source_id).await.unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.status, RecordStatus::New);
        assert!(record.is_new);
        assert!(record.relevance_score > 0.0);
        assert_eq!(record.candidate.source_short_name, "compras-mza");
    }

    let outcomes = store.run_outcomes(run.id).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, OutcomeStatus::Success);
    assert_eq!(outcomes[0].records_found, 3);
    assert_eq!(outcomes[0].records_new, 2);

    assert_eq!(store.unseen_records(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_sqlite_second_run_finds_no_new_records() {
    let (store, orchestrator, slot, source_id) = setup().await;
    *slot.lock() = Ok(vec![candidate("Reactivo luminol", "Gendarmería")]);

    let first = orchestrator.run(RunRequest::new("test")).await.unwrap();
    assert_eq!(first.records_new, 1);

    let mut again = candidate("Reactivo luminol", "Gendarmería");
    again.detail_url = Some("https://comprar.mendoza.gov.ar/otra".into());
    *slot.lock() = Ok(vec![again]);

    let second = orchestrator.run(RunRequest::new("test")).await.unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.records_new, 0);
    assert_eq!(store.count_records(Some(source_id)).await.unwrap(), 1);

    let runs = store.recent_runs(5).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, second.id);
}

#[tokio::test]
async fn test_sqlite_failure_is_recorded_outside_the_scan() {
    let (store, orchestrator, slot, source_id) = setup().await;
    *slot.lock() = Err("portal returned garbage".into());

    let run = orchestrator.run(RunRequest::new("test")).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(store.count_records(Some(source_id)).await.unwrap(), 0);

    let outcomes = store.run_outcomes(run.id).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, OutcomeStatus::Error);
    assert!(outcomes[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("portal returned garbage"));

    let source = store.get_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.health.consecutive_errors, 1);
    assert_eq!(source.health.status, SourceStatus::Active);
    assert!(source.health.last_checked_at.is_some());

    *slot.lock() = Ok(vec![candidate("Reactivo luminol", "Policía")]);
    let run = orchestrator.run(RunRequest::new("test")).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let source = store.get_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.health.consecutive_errors, 0);
}

#[tokio::test]
async fn test_sqlite_source_toggle() {
    let (store, orchestrator, _, source_id) = setup().await;
    store.set_source_enabled(source_id, false).await.unwrap();

    let run = orchestrator.run(RunRequest::new("test")).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.sources_scanned, 0);
    assert!(!store.get_source(source_id).await.unwrap().unwrap().is_enabled);
}
