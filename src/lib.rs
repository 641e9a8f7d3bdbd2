//! LicitaForense tender monitor
//!
//! Periodically scans public procurement portals and official bulletins for
//! records matching a keyword set, deduplicates them against everything
//! already stored, scores their relevance and keeps an audit trail per run.
//!
//! Features:
//! - Bounded concurrent fan-out of per-source scans with failure isolation
//! - Content-hash deduplication with an in-scan cache
//! - Synonym-aware keyword scoring (AND / OR)
//! - Transactional per-source persistence (memory, SQLite, Postgres)
//! - Source health tracking
//! - Webhook alerts for runs with new records
//! - Prometheus metrics

pub mod config;
pub mod dedup;
pub mod error;
pub mod http_client;
pub mod matcher;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod scan_task;
pub mod scheduler;
pub mod schemas;
pub mod seed;
pub mod sources;
pub mod storage;

pub use config::Config;
pub use error::{AdapterError, MonitorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunRequest};
