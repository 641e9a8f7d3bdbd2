//! End-to-end run tests against the in-memory store with scripted adapters

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use licitaforense_monitor::error::AdapterError;
use licitaforense_monitor::matcher::MatchOperator;
use licitaforense_monitor::orchestrator::{Orchestrator, OrchestratorSettings, RunRequest};
use licitaforense_monitor::schemas::{
    CandidateRecord, NewKeyword, NewSource, OutcomeStatus, RunStatus, Source, SourceLevel,
    SourceStatus,
};
use licitaforense_monitor::sources::{AdapterRegistry, AdapterSettings, SourceAdapter};
use licitaforense_monitor::storage::{MemoryStore, Store};

const MOCK: &str = "mock";

#[derive(Clone)]
enum Behavior {
    Records(Vec<CandidateRecord>),
    Fail(&'static str),
    Panic,
}

/// Scripted adapter behaviour per source short name
#[derive(Clone, Default)]
struct Plan {
    behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
    last_keywords: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    delay: Arc<Mutex<Duration>>,
}

impl Plan {
    fn set(&self, short_name: &str, behavior: Behavior) {
        self.behaviors.lock().insert(short_name.to_string(), behavior);
    }
}

struct MockAdapter {
    short_name: String,
    plan: Plan,
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn key(&self) -> &'static str {
        MOCK
    }

    async fn fetch(
        &self,
        keywords: &[String],
        _since: DateTime<Utc>,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        *self.plan.last_keywords.lock() = keywords.to_vec();

        let current = self.plan.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.plan.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.plan.delay.lock();
        tokio::time::sleep(delay).await;
        self.plan.in_flight.fetch_sub(1, Ordering::SeqCst);

        let behavior = self.plan.behaviors.lock().get(&self.short_name).cloned();
        match behavior {
            Some(Behavior::Records(records)) => Ok(records),
            Some(Behavior::Fail(message)) => Err(AdapterError::Transport(message.to_string())),
            Some(Behavior::Panic) => panic!("adapter for {} blew up", self.short_name),
            None => Ok(Vec::new()),
        }
    }
}

struct Harness {
    store: MemoryStore,
    plan: Plan,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with(MemoryStore::new(), OrchestratorSettings::default())
    }

    fn with(store: MemoryStore, settings: OrchestratorSettings) -> Self {
        let plan = Plan::default();
        let mut registry = AdapterRegistry::builtin(AdapterSettings::default());
        let factory_plan = plan.clone();
        registry.register(MOCK, move |source: &Source, _: &AdapterSettings| {
            Ok(Arc::new(MockAdapter {
                short_name: source.short_name.clone(),
                plan: factory_plan.clone(),
            }) as Arc<dyn SourceAdapter>)
        });

        let orchestrator = Orchestrator::new(Arc::new(store.clone()), Arc::new(registry), settings);
        Self {
            store,
            plan,
            orchestrator,
        }
    }

    async fn keyword(&self, term: &str) {
        self.store.insert_keyword(&NewKeyword::new(term)).await.unwrap();
    }

    async fn source(&self, short_name: &str, level: SourceLevel) -> Source {
        self.orchestrator
            .register_source(&NewSource::new(
                format!("Portal {short_name}"),
                short_name,
                format!("https://{short_name}.example.gob.ar"),
                level,
                MOCK,
            ))
            .await
            .unwrap()
    }

    async fn run(&self) -> licitaforense_monitor::schemas::Run {
        self.orchestrator.run(RunRequest::new("test")).await.unwrap()
    }
}

fn record(title: &str) -> CandidateRecord {
    CandidateRecord::new(title, "ignored")
}

#[tokio::test]
async fn test_failing_source_is_isolated() {
    let h = Harness::new();
    h.keyword("forense").await;
    let a = h.source("a", SourceLevel::National).await;
    let b = h.source("b", SourceLevel::National).await;
    let c = h.source("c", SourceLevel::National).await;

    h.plan.set("a", Behavior::Records(vec![record("Kit forense"), record("Guantes de nitrilo")]));
    h.plan.set("b", Behavior::Fail("connection reset"));
    h.plan.set("c", Behavior::Records(vec![record("Laboratorio forense móvil")]));

    let run = h.run().await;
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.sources_scanned, 3);
    assert_eq!(run.sources_failed, 1);
    assert_eq!(run.records_found, 3);
    assert_eq!(run.records_new, 3);
    assert_eq!(run.error_details.len(), 1);
    assert_eq!(run.error_details[0].source.as_deref(), Some("b"));
    assert!(run.error_details[0].error.contains("connection reset"));

    assert_eq!(h.store.count_records(Some(a.id)).await.unwrap(), 2);
    assert_eq!(h.store.count_records(Some(b.id)).await.unwrap(), 0);
    assert_eq!(h.store.count_records(Some(c.id)).await.unwrap(), 1);

    let outcomes = h.store.run_outcomes(run.id).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    let failed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Error)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].source_id, b.id);
    assert!(failed[0].error_message.as_deref().unwrap().contains("connection reset"));

    let stored = h.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored, run);
}

#[tokio::test]
async fn test_all_sources_failing_fails_the_run() {
    let h = Harness::new();
    h.keyword("forense").await;
    for name in ["a", "b", "c"] {
        h.source(name, SourceLevel::Municipal).await;
        h.plan.set(name, Behavior::Fail("timeout"));
    }

    let run = h.run().await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.sources_failed, 3);
    assert_eq!(run.error_details.len(), 3);
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn test_ingestion_is_idempotent_across_runs() {
    let h = Harness::new();
    h.keyword("balistica").await;
    let a = h.source("a", SourceLevel::National).await;

    h.plan.set(
        "a",
        Behavior::Records(vec![record("Equipo de balística"), record("Software de balística")]),
    );
    let first = h.run().await;
    assert_eq!(first.records_new, 2);

    // same records with different URLs and payloads
    let mut moved = record("Equipo de balística");
    moved.detail_url = Some("https://a.example.gob.ar/nuevo?ref=2".into());
    moved.raw = Some(serde_json::json!({"page": 3}));
    h.plan.set("a", Behavior::Records(vec![moved, record("  EQUIPO DE BALÍSTICA ")]));

    let second = h.run().await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.records_found, 2);
    assert_eq!(second.records_new, 0);
    assert_eq!(h.store.count_records(Some(a.id)).await.unwrap(), 2);
}

#[tokio::test]
async fn test_padded_external_id_dedups_across_runs() {
    let h = Harness::new();
    h.keyword("forense").await;
    let a = h.source("a", SourceLevel::National).await;

    let mut original = record("Kit forense");
    original.external_id = Some(" EXP-9 ".into());
    h.plan.set("a", Behavior::Records(vec![original]));
    assert_eq!(h.run().await.records_new, 1);

    let stored = h.store.records_for_source(a.id).await.unwrap();
    assert_eq!(stored[0].candidate.external_id.as_deref(), Some("EXP-9"));

    // retitled notice, same expediente
    let mut extended = record("Kit forense (prórroga)");
    extended.external_id = Some("EXP-9  ".into());
    h.plan.set("a", Behavior::Records(vec![extended]));

    let second = h.run().await;
    assert_eq!(second.records_found, 1);
    assert_eq!(second.records_new, 0);
    assert_eq!(h.store.count_records(Some(a.id)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_organization_distinguishes_records() {
    let h = Harness::new();
    h.keyword("luminol").await;
    h.source("a", SourceLevel::National).await;

    let mut first = record("Compra de luminol");
    first.organization = Some("Policía Federal".into());
    let mut second = record("Compra de luminol");
    second.organization = Some("Poder Judicial".into());
    h.plan.set("a", Behavior::Records(vec![first, second]));

    assert_eq!(h.run().await.records_new, 2);
}

#[tokio::test]
async fn test_health_reaches_error_and_resets() {
    let h = Harness::new();
    h.keyword("forense").await;
    let a = h.source("a", SourceLevel::National).await;
    h.plan.set("a", Behavior::Fail("portal down"));

    for expected in 1..=4 {
        h.run().await;
        let source = h.store.get_source(a.id).await.unwrap().unwrap();
        assert_eq!(source.health.consecutive_errors, expected);
        assert_eq!(source.health.status, SourceStatus::Active);
    }

    h.run().await;
    let source = h.store.get_source(a.id).await.unwrap().unwrap();
    assert_eq!(source.health.consecutive_errors, 5);
    assert_eq!(source.health.status, SourceStatus::Error);
    assert!(source.health.last_error.as_deref().unwrap().contains("portal down"));

    h.plan.set("a", Behavior::Records(vec![]));
    let run = h.run().await;
    assert_eq!(run.status, RunStatus::Success);
    let source = h.store.get_source(a.id).await.unwrap().unwrap();
    assert_eq!(source.health.consecutive_errors, 0);
    assert_eq!(source.health.status, SourceStatus::Active);
    assert!(source.health.last_success_at.is_some());
}

#[tokio::test]
async fn test_commit_failure_rolls_back_the_scan() {
    let h = Harness::new();
    h.keyword("forense").await;
    let a = h.source("a", SourceLevel::National).await;
    let b = h.source("b", SourceLevel::National).await;
    h.plan.set("a", Behavior::Records(vec![record("Kit forense")]));
    h.plan.set("b", Behavior::Records(vec![record("Microscopio forense")]));
    h.store.fail_commits_for(a.id);

    let run = h.run().await;
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.records_new, 1);
    assert_eq!(h.store.count_records(Some(a.id)).await.unwrap(), 0);
    assert_eq!(h.store.count_records(Some(b.id)).await.unwrap(), 1);

    let outcomes = h.store.run_outcomes(run.id).await.unwrap();
    let for_a: Vec<_> = outcomes.iter().filter(|o| o.source_id == a.id).collect();
    assert_eq!(for_a.len(), 1);
    assert_eq!(for_a[0].status, OutcomeStatus::Error);

    // retried next run once storage recovers
    h.store.clear_commit_failures();
    let run = h.run().await;
    assert_eq!(run.records_new, 1);
    assert_eq!(h.store.count_records(Some(a.id)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_panicking_adapter_counts_as_failure() {
    let h = Harness::new();
    h.keyword("forense").await;
    let a = h.source("a", SourceLevel::National).await;
    h.source("b", SourceLevel::National).await;
    h.plan.set("a", Behavior::Panic);
    h.plan.set("b", Behavior::Records(vec![record("Kit forense")]));

    let run = h.run().await;
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.sources_failed, 1);
    assert!(run.error_details[0].error.contains("aborted"));

    let outcomes = h.store.run_outcomes(run.id).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    let for_a = outcomes.iter().find(|o| o.source_id == a.id).unwrap();
    assert_eq!(for_a.status, OutcomeStatus::Error);
}

#[tokio::test]
async fn test_concurrency_is_bounded_by_backend() {
    let h = Harness::with(MemoryStore::with_max_writers(2), OrchestratorSettings::default());
    h.keyword("forense").await;
    *h.plan.delay.lock() = Duration::from_millis(50);
    for name in ["a", "b", "c", "d", "e"] {
        h.source(name, SourceLevel::Provincial).await;
    }

    let run = h.run().await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.sources_scanned, 5);
    assert!(h.plan.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_configured_ceiling_serializes_scans() {
    let settings = OrchestratorSettings {
        max_concurrent_scans: Some(1),
        ..Default::default()
    };
    let h = Harness::with(MemoryStore::with_max_writers(4), settings);
    h.keyword("forense").await;
    *h.plan.delay.lock() = Duration::from_millis(20);
    for name in ["a", "b", "c"] {
        h.source(name, SourceLevel::National).await;
    }

    h.run().await;
    assert_eq!(h.plan.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_keyword_override_replaces_stored_keywords() {
    let h = Harness::new();
    h.keyword("forense").await;
    h.source("a", SourceLevel::National).await;

    let run = h
        .orchestrator
        .run(RunRequest::new("cli").keywords(vec!["ADN".into(), "  ".into()]))
        .await
        .unwrap();
    assert_eq!(run.keywords_used, vec!["ADN".to_string()]);
    assert_eq!(*h.plan.last_keywords.lock(), vec!["ADN".to_string()]);
}

#[tokio::test]
async fn test_keywords_loaded_by_priority() {
    let h = Harness::new();
    h.store
        .insert_keyword(&NewKeyword::new("luminol").priority(3))
        .await
        .unwrap();
    h.store
        .insert_keyword(&NewKeyword::new("criminalistica").priority(10))
        .await
        .unwrap();
    h.store
        .insert_keyword(&NewKeyword::new("pericias").inactive())
        .await
        .unwrap();
    h.source("a", SourceLevel::National).await;

    let run = h.run().await;
    assert_eq!(
        run.keywords_used,
        vec!["criminalistica".to_string(), "luminol".to_string()]
    );
}

#[tokio::test]
async fn test_source_filter_limits_the_run() {
    let h = Harness::new();
    h.keyword("forense").await;
    let a = h.source("a", SourceLevel::National).await;
    h.source("b", SourceLevel::National).await;

    let run = h
        .orchestrator
        .run(RunRequest::new("cli").sources(vec![a.id]))
        .await
        .unwrap();
    assert_eq!(run.sources_scanned, 1);
    assert_eq!(h.store.run_outcomes(run.id).await.unwrap()[0].source_id, a.id);
}

#[tokio::test]
async fn test_disabled_sources_are_skipped() {
    let h = Harness::new();
    h.keyword("forense").await;
    let a = h.source("a", SourceLevel::National).await;
    h.store.set_source_enabled(a.id, false).await.unwrap();

    let run = h.run().await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.sources_scanned, 0);
}

#[tokio::test]
async fn test_scores_are_deterministic() {
    let mut scores = Vec::new();
    for _ in 0..2 {
        let h = Harness::new();
        h.keyword("forense").await;
        h.keyword("ADN").await;
        let a = h.source("a", SourceLevel::National).await;
        let mut candidate = record("Secuenciador de ADN forense");
        candidate.description = Some("Equipo para laboratorio de genética forense".into());
        h.plan.set("a", Behavior::Records(vec![candidate, record("Resmas de papel")]));
        h.run().await;

        let mut records = h.store.records_for_source(a.id).await.unwrap();
        records.sort_by(|x, y| x.candidate.title.cmp(&y.candidate.title));
        scores.push(
            records
                .into_iter()
                .map(|r| (r.candidate.title, r.relevance_score, r.matched_keywords))
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(scores[0], scores[1]);
    assert_eq!(scores[0][0].1, 0.0);
    assert!(scores[0][1].1 > 0.9);
}

#[tokio::test]
async fn test_and_operator_filters_partial_matches() {
    let settings = OrchestratorSettings {
        operator: MatchOperator::And,
        ..Default::default()
    };
    let h = Harness::with(MemoryStore::new(), settings);
    h.source("a", SourceLevel::National).await;
    h.plan.set(
        "a",
        Behavior::Records(vec![record("Kit forense"), record("Kit forense para ADN")]),
    );

    let run = h
        .orchestrator
        .run(RunRequest::new("cli").keywords(vec!["forense".into(), "ADN".into()]))
        .await
        .unwrap();
    assert_eq!(run.records_found, 2);
    assert_eq!(run.records_new, 1);
}

#[tokio::test]
async fn test_stored_source_with_unknown_adapter_fails_its_scan() {
    let h = Harness::new();
    h.keyword("forense").await;
    h.store
        .insert_source(&NewSource::new(
            "Legacy",
            "legacy",
            "https://legacy.example.gob.ar",
            SourceLevel::Municipal,
            "selenium_scraper",
        ))
        .await
        .unwrap();

    let run = h.run().await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_details[0].error.contains("selenium_scraper"));
}
