//! In-memory storage backend
//!
//! Scan sessions stage their writes locally and apply them under a single
//! write lock on commit, enforcing the (source, content hash) uniqueness a
//! SQL backend would. Used by tests and `--dry-run` style invocations.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Backend, ScanFailure, ScanSession, Store};
use crate::error::{MonitorError, Result};
use crate::schemas::{
    Keyword, NewKeyword, NewRecord, NewSource, OutcomeStatus, OutcomeUpdate, Run, Source,
    SourceHealth, SourceOutcome, StoredRecord,
};

const DEFAULT_MAX_WRITERS: usize = 4;

#[derive(Default)]
struct MemoryState {
    keywords: Vec<Keyword>,
    sources: Vec<Source>,
    records: Vec<StoredRecord>,
    runs: Vec<Run>,
    outcomes: Vec<SourceOutcome>,
}

impl MemoryState {
    fn has_hash(&self, source_id: i64, content_hash: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.source_id == source_id && r.content_hash == content_hash)
    }
}

/// Thread-safe in-memory store
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    next_id: Arc<AtomicI64>,
    max_writers: usize,
    /// Sources whose scan commits are forced to fail
    failing_commits: Arc<Mutex<HashSet<i64>>>,
    /// Number of upcoming `save_run` calls forced to fail
    failing_run_saves: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_writers(DEFAULT_MAX_WRITERS)
    }

    pub fn with_max_writers(max_writers: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            next_id: Arc::new(AtomicI64::new(1)),
            max_writers: max_writers.max(1),
            failing_commits: Arc::new(Mutex::new(HashSet::new())),
            failing_run_saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes every scan commit for `source_id` fail until cleared
    pub fn fail_commits_for(&self, source_id: i64) {
        self.failing_commits.lock().insert(source_id);
    }

    pub fn clear_commit_failures(&self) {
        self.failing_commits.lock().clear();
    }

    /// Makes the next `count` calls to `save_run` fail
    pub fn fail_next_run_saves(&self, count: usize) {
        self.failing_run_saves.store(count, Ordering::SeqCst);
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

fn sort_sources(sources: &mut [Source]) {
    sources.sort_by(|a, b| {
        a.level
            .rank()
            .cmp(&b.level.rank())
            .then_with(|| a.name.cmp(&b.name))
    });
}

fn sort_by_priority(keywords: &mut [Keyword]) {
    keywords.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn max_concurrent_writers(&self) -> usize {
        self.max_writers
    }

    async fn active_keywords(&self) -> Result<Vec<Keyword>> {
        let mut keywords: Vec<Keyword> = self
            .state
            .read()
            .keywords
            .iter()
            .filter(|k| k.is_active)
            .cloned()
            .collect();
        sort_by_priority(&mut keywords);
        Ok(keywords)
    }

    async fn list_keywords(&self) -> Result<Vec<Keyword>> {
        let mut keywords = self.state.read().keywords.clone();
        sort_by_priority(&mut keywords);
        Ok(keywords)
    }

    async fn insert_keyword(&self, keyword: &NewKeyword) -> Result<Keyword> {
        let mut state = self.state.write();
        if state.keywords.iter().any(|k| k.term == keyword.term) {
            return Err(MonitorError::StorageError(format!(
                "keyword already exists: {}",
                keyword.term
            )));
        }
        let stored = Keyword {
            id: self.allocate_id(),
            term: keyword.term.clone(),
            category: keyword.category.clone(),
            priority: keyword.priority,
            is_active: keyword.is_active,
            created_at: Utc::now(),
        };
        state.keywords.push(stored.clone());
        Ok(stored)
    }

    async fn enabled_sources(&self, ids: Option<&[i64]>) -> Result<Vec<Source>> {
        let mut sources: Vec<Source> = self
            .state
            .read()
            .sources
            .iter()
            .filter(|s| s.is_enabled)
            .filter(|s| ids.map_or(true, |ids| ids.contains(&s.id)))
            .cloned()
            .collect();
        sort_sources(&mut sources);
        Ok(sources)
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let mut sources = self.state.read().sources.clone();
        sort_sources(&mut sources);
        Ok(sources)
    }

    async fn get_source(&self, id: i64) -> Result<Option<Source>> {
        Ok(self.state.read().sources.iter().find(|s| s.id == id).cloned())
    }

    async fn insert_source(&self, source: &NewSource) -> Result<Source> {
        let mut state = self.state.write();
        if state.sources.iter().any(|s| s.short_name == source.short_name) {
            return Err(MonitorError::StorageError(format!(
                "source already exists: {}",
                source.short_name
            )));
        }
        let stored = source.clone().into_source(self.allocate_id(), Utc::now());
        state.sources.push(stored.clone());
        Ok(stored)
    }

    async fn set_source_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let mut state = self.state.write();
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| MonitorError::SourceNotFound(id.to_string()))?;
        source.is_enabled = enabled;
        Ok(())
    }

    async fn create_run(&self, run: &Run) -> Result<Run> {
        let mut stored = run.clone();
        stored.id = self.allocate_id();
        self.state.write().runs.push(stored.clone());
        Ok(stored)
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        if self
            .failing_run_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MonitorError::StorageError(format!("save of run {} rejected", run.id)));
        }

        let mut state = self.state.write();
        let slot = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| MonitorError::StorageError(format!("run {} not found", run.id)))?;
        *slot = run.clone();
        Ok(())
    }

    async fn get_run(&self, id: i64) -> Result<Option<Run>> {
        Ok(self.state.read().runs.iter().find(|r| r.id == id).cloned())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let state = self.state.read();
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn run_outcomes(&self, run_id: i64) -> Result<Vec<SourceOutcome>> {
        Ok(self
            .state
            .read()
            .outcomes
            .iter()
            .filter(|o| o.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn begin_scan(&self) -> Result<Box<dyn ScanSession>> {
        Ok(Box::new(MemoryScanSession {
            store: self.clone(),
            source_id: None,
            outcomes: Vec::new(),
            records: Vec::new(),
            health: Vec::new(),
        }))
    }

    async fn record_scan_failure(&self, failure: &ScanFailure) -> Result<()> {
        let mut state = self.state.write();
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == failure.source_id)
            .ok_or_else(|| MonitorError::SourceNotFound(failure.source_id.to_string()))?;
        source.health.record_failure(failure.at, &failure.error);

        let outcome = SourceOutcome {
            id: self.allocate_id(),
            run_id: failure.run_id,
            source_id: failure.source_id,
            status: OutcomeStatus::Error,
            records_found: 0,
            records_new: 0,
            duration_secs: Some(failure.duration_secs),
            error_message: Some(crate::schemas::truncate_chars(
                &failure.error,
                crate::schemas::MAX_OUTCOME_ERROR_CHARS,
            )),
            created_at: failure.at,
        };
        state.outcomes.push(outcome);
        Ok(())
    }

    async fn count_records(&self, source_id: Option<i64>) -> Result<i64> {
        let state = self.state.read();
        let count = state
            .records
            .iter()
            .filter(|r| source_id.map_or(true, |id| r.source_id == id))
            .count();
        Ok(count as i64)
    }

    async fn records_for_source(&self, source_id: i64) -> Result<Vec<StoredRecord>> {
        Ok(self
            .state
            .read()
            .records
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn unseen_records(&self, limit: usize) -> Result<Vec<StoredRecord>> {
        let mut records: Vec<StoredRecord> = self
            .state
            .read()
            .records
            .iter()
            .filter(|r| r.is_new)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        records.truncate(limit);
        Ok(records)
    }
}

/// Staged writes of one scan, applied atomically on commit
pub struct MemoryScanSession {
    store: MemoryStore,
    source_id: Option<i64>,
    outcomes: Vec<SourceOutcome>,
    records: Vec<StoredRecord>,
    health: Vec<(i64, SourceHealth)>,
}

impl MemoryScanSession {
    fn staged_hash(&self, source_id: i64, content_hash: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.source_id == source_id && r.content_hash == content_hash)
    }
}

#[async_trait]
impl ScanSession for MemoryScanSession {
    async fn insert_outcome(&mut self, run_id: i64, source_id: i64) -> Result<i64> {
        let id = self.store.allocate_id();
        self.source_id = Some(source_id);
        self.outcomes.push(SourceOutcome {
            id,
            run_id,
            source_id,
            status: OutcomeStatus::Pending,
            records_found: 0,
            records_new: 0,
            duration_secs: None,
            error_message: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn content_hashes(&mut self, source_id: i64) -> Result<Vec<String>> {
        let state = self.store.state.read();
        Ok(state
            .records
            .iter()
            .chain(self.records.iter())
            .filter(|r| r.source_id == source_id)
            .map(|r| r.content_hash.clone())
            .collect())
    }

    async fn hash_exists(&mut self, source_id: i64, content_hash: &str) -> Result<bool> {
        Ok(self.staged_hash(source_id, content_hash)
            || self.store.state.read().has_hash(source_id, content_hash))
    }

    async fn external_id_exists(&mut self, source_id: i64, external_id: &str) -> Result<bool> {
        let state = self.store.state.read();
        Ok(state
            .records
            .iter()
            .chain(self.records.iter())
            .any(|r| {
                r.source_id == source_id && r.candidate.external_id.as_deref() == Some(external_id)
            }))
    }

    async fn insert_record(&mut self, record: &NewRecord) -> Result<i64> {
        if self.staged_hash(record.source_id, &record.content_hash) {
            return Err(MonitorError::DuplicateRecord {
                source_id: record.source_id,
                content_hash: record.content_hash.clone(),
            });
        }
        let id = self.store.allocate_id();
        self.source_id.get_or_insert(record.source_id);
        self.records.push(record.clone().into_stored(id, Utc::now()));
        Ok(id)
    }

    async fn source_health(&mut self, source_id: i64) -> Result<SourceHealth> {
        if let Some((_, health)) = self.health.iter().rev().find(|(id, _)| *id == source_id) {
            return Ok(health.clone());
        }
        self.store
            .state
            .read()
            .sources
            .iter()
            .find(|s| s.id == source_id)
            .map(|s| s.health.clone())
            .ok_or_else(|| MonitorError::SourceNotFound(source_id.to_string()))
    }

    async fn save_source_health(&mut self, source_id: i64, health: &SourceHealth) -> Result<()> {
        self.health.push((source_id, health.clone()));
        Ok(())
    }

    async fn finish_outcome(&mut self, outcome_id: i64, update: &OutcomeUpdate) -> Result<()> {
        let outcome = self
            .outcomes
            .iter_mut()
            .find(|o| o.id == outcome_id)
            .ok_or_else(|| MonitorError::StorageError(format!("outcome {outcome_id} not staged")))?;
        outcome.status = update.status;
        outcome.records_found = update.records_found;
        outcome.records_new = update.records_new;
        outcome.duration_secs = Some(update.duration_secs);
        outcome.error_message = update.error_message.clone();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if let Some(source_id) = self.source_id {
            if self.store.failing_commits.lock().contains(&source_id) {
                return Err(MonitorError::StorageError(format!(
                    "commit rejected for source {source_id}"
                )));
            }
        }

        let session = *self;
        let mut state = session.store.state.write();

        if let Some(dup) = session
            .records
            .iter()
            .find(|r| state.has_hash(r.source_id, &r.content_hash))
        {
            return Err(MonitorError::DuplicateRecord {
                source_id: dup.source_id,
                content_hash: dup.content_hash.clone(),
            });
        }

        for (source_id, health) in session.health {
            if let Some(source) = state.sources.iter_mut().find(|s| s.id == source_id) {
                source.health = health;
            }
        }
        state.records.extend(session.records);
        state.outcomes.extend(session.outcomes);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
