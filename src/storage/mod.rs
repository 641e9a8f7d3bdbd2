//! Storage layer
//!
//! `Store` is the long-lived handle shared by the orchestrator. Every scan
//! task opens its own `ScanSession`, an isolated unit of work whose writes
//! become visible only on `commit`.
//!
//! Backends:
//! - `memory` for tests and dry runs
//! - `sqlite:` for single-host deployments (one writer at a time)
//! - `postgres://` for concurrent scans

pub mod memory;
pub mod postgres;
mod rows;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::error::{MonitorError, Result};
use crate::schemas::{
    Keyword, NewKeyword, NewRecord, NewSource, OutcomeUpdate, Run, Source, SourceHealth,
    SourceOutcome, StoredRecord,
};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
        }
    }
}

/// Everything the failure path needs to record a failed scan
#[derive(Debug, Clone)]
pub struct ScanFailure {
    pub run_id: i64,
    pub source_id: i64,
    pub error: String,
    pub duration_secs: f64,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    fn backend(&self) -> Backend;

    /// How many scan sessions may write concurrently without contention
    fn max_concurrent_writers(&self) -> usize;

    /// Active keywords, highest priority first
    async fn active_keywords(&self) -> Result<Vec<Keyword>>;

    async fn list_keywords(&self) -> Result<Vec<Keyword>>;

    async fn insert_keyword(&self, keyword: &NewKeyword) -> Result<Keyword>;

    /// Enabled sources ordered by level then name, optionally restricted to ids
    async fn enabled_sources(&self, ids: Option<&[i64]>) -> Result<Vec<Source>>;

    async fn list_sources(&self) -> Result<Vec<Source>>;

    async fn get_source(&self, id: i64) -> Result<Option<Source>>;

    async fn insert_source(&self, source: &NewSource) -> Result<Source>;

    async fn set_source_enabled(&self, id: i64, enabled: bool) -> Result<()>;

    /// Persists a new run and returns it with its id
    async fn create_run(&self, run: &Run) -> Result<Run>;

    async fn save_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, id: i64) -> Result<Option<Run>>;

    /// Most recent runs first
    async fn recent_runs(&self, limit: usize) -> Result<Vec<Run>>;

    async fn run_outcomes(&self, run_id: i64) -> Result<Vec<SourceOutcome>>;

    /// Opens an isolated unit of work for one scan
    async fn begin_scan(&self) -> Result<Box<dyn ScanSession>>;

    /// Writes an error outcome and bumps source health in a fresh unit of work
    async fn record_scan_failure(&self, failure: &ScanFailure) -> Result<()>;

    async fn count_records(&self, source_id: Option<i64>) -> Result<i64>;

    async fn records_for_source(&self, source_id: i64) -> Result<Vec<StoredRecord>>;

    /// Records still flagged as new, best score first
    async fn unseen_records(&self, limit: usize) -> Result<Vec<StoredRecord>>;
}

/// One scan's transaction
#[async_trait]
pub trait ScanSession: Send {
    /// Inserts a pending outcome row and returns its id
    async fn insert_outcome(&mut self, run_id: i64, source_id: i64) -> Result<i64>;

    async fn content_hashes(&mut self, source_id: i64) -> Result<Vec<String>>;

    async fn hash_exists(&mut self, source_id: i64, content_hash: &str) -> Result<bool>;

    async fn external_id_exists(&mut self, source_id: i64, external_id: &str) -> Result<bool>;

    async fn insert_record(&mut self, record: &NewRecord) -> Result<i64>;

    async fn source_health(&mut self, source_id: i64) -> Result<SourceHealth>;

    async fn save_source_health(&mut self, source_id: i64, health: &SourceHealth) -> Result<()>;

    async fn finish_outcome(&mut self, outcome_id: i64, update: &OutcomeUpdate) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens the backend named by the URL scheme and applies its schema
pub async fn connect(database_url: &str) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = if database_url == "memory" || database_url.starts_with("memory:") {
        Arc::new(MemoryStore::new())
    } else if database_url.starts_with("sqlite:") {
        Arc::new(SqliteStore::new(database_url).await?)
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        Arc::new(PostgresStore::new(database_url).await?)
    } else {
        return Err(MonitorError::InvalidConfig(format!(
            "unsupported database url: {database_url}"
        )));
    };

    info!(
        backend = store.backend().as_str(),
        max_writers = store.max_concurrent_writers(),
        "Storage initialized"
    );
    Ok(store)
}
