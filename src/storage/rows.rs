//! Row types shared by the SQL backends
//!
//! Column names are identical in the SQLite and Postgres schemas, so the
//! derived `FromRow` impls work for both.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use crate::error::Result;
use crate::schemas::{
    CandidateRecord, Keyword, Run, Source, SourceError, SourceHealth, SourceOutcome,
    StoredRecord,
};

#[derive(Debug, FromRow)]
pub(crate) struct KeywordRow {
    id: i64,
    term: String,
    category: Option<String>,
    priority: i64,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<KeywordRow> for Keyword {
    fn from(row: KeywordRow) -> Self {
        Keyword {
            id: row.id,
            term: row.term,
            category: row.category,
            priority: row.priority,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SourceRow {
    id: i64,
    name: String,
    short_name: String,
    url: String,
    level: String,
    province: Option<String>,
    municipality: Option<String>,
    adapter_key: String,
    adapter_config: Json<serde_json::Value>,
    is_enabled: bool,
    status: String,
    last_checked_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_errors: i64,
    created_at: DateTime<Utc>,
}

impl SourceRow {
    pub(crate) fn into_source(self) -> Result<Source> {
        Ok(Source {
            id: self.id,
            name: self.name,
            short_name: self.short_name,
            url: self.url,
            level: self.level.parse()?,
            province: self.province,
            municipality: self.municipality,
            adapter_key: self.adapter_key,
            adapter_config: self.adapter_config.0,
            is_enabled: self.is_enabled,
            health: SourceHealth {
                status: self.status.parse()?,
                last_checked_at: self.last_checked_at,
                last_success_at: self.last_success_at,
                last_error: self.last_error,
                consecutive_errors: self.consecutive_errors,
            },
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct HealthRow {
    status: String,
    last_checked_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_errors: i64,
}

impl HealthRow {
    pub(crate) fn into_health(self) -> Result<SourceHealth> {
        Ok(SourceHealth {
            status: self.status.parse()?,
            last_checked_at: self.last_checked_at,
            last_success_at: self.last_success_at,
            last_error: self.last_error,
            consecutive_errors: self.consecutive_errors,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RunRow {
    id: i64,
    status: String,
    trigger_label: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    duration_secs: Option<f64>,
    sources_scanned: i64,
    sources_failed: i64,
    records_found: i64,
    records_new: i64,
    keywords_used: Json<Vec<String>>,
    error_details: Json<Vec<SourceError>>,
}

impl RunRow {
    pub(crate) fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            status: self.status.parse()?,
            trigger: self.trigger_label,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_secs: self.duration_secs,
            sources_scanned: self.sources_scanned,
            sources_failed: self.sources_failed,
            records_found: self.records_found,
            records_new: self.records_new,
            keywords_used: self.keywords_used.0,
            error_details: self.error_details.0,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct OutcomeRow {
    id: i64,
    run_id: i64,
    source_id: i64,
    status: String,
    records_found: i64,
    records_new: i64,
    duration_secs: Option<f64>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl OutcomeRow {
    pub(crate) fn into_outcome(self) -> Result<SourceOutcome> {
        Ok(SourceOutcome {
            id: self.id,
            run_id: self.run_id,
            source_id: self.source_id,
            status: self.status.parse()?,
            records_found: self.records_found,
            records_new: self.records_new,
            duration_secs: self.duration_secs,
            error_message: self.error_message,
            created_at: self.created_at,
        })
    }
}

/// Record columns joined with the owning source's short name
#[derive(Debug, FromRow)]
pub(crate) struct RecordRow {
    id: i64,
    source_id: i64,
    source_short_name: String,
    content_hash: String,
    title: String,
    description: Option<String>,
    organization: Option<String>,
    external_id: Option<String>,
    record_number: Option<String>,
    file_number: Option<String>,
    contract_type: Option<String>,
    published_at: Option<DateTime<Utc>>,
    opens_at: Option<DateTime<Utc>>,
    closes_at: Option<DateTime<Utc>>,
    estimated_amount: Option<f64>,
    currency: Option<String>,
    detail_url: Option<String>,
    document_url: Option<String>,
    matched_keywords: Json<Vec<String>>,
    relevance_score: f64,
    status: String,
    is_new: bool,
    raw_data: Option<Json<serde_json::Value>>,
    created_at: DateTime<Utc>,
}

impl RecordRow {
    pub(crate) fn into_record(self) -> Result<StoredRecord> {
        Ok(StoredRecord {
            id: self.id,
            source_id: self.source_id,
            content_hash: self.content_hash,
            candidate: CandidateRecord {
                title: self.title,
                description: self.description,
                organization: self.organization,
                external_id: self.external_id,
                record_number: self.record_number,
                file_number: self.file_number,
                contract_type: self.contract_type,
                published_at: self.published_at,
                opens_at: self.opens_at,
                closes_at: self.closes_at,
                estimated_amount: self.estimated_amount,
                currency: self.currency,
                detail_url: self.detail_url,
                document_url: self.document_url,
                suggested_keywords: Vec::new(),
                raw: self.raw_data.map(|j| j.0),
                source_short_name: self.source_short_name,
            },
            matched_keywords: self.matched_keywords.0,
            relevance_score: self.relevance_score,
            status: self.status.parse()?,
            is_new: self.is_new,
            created_at: self.created_at,
        })
    }
}

/// Column list matching `RecordRow`, for `records r JOIN sources s`
pub(crate) const RECORD_COLUMNS: &str = r#"
    r.id, r.source_id, s.short_name AS source_short_name, r.content_hash,
    r.title, r.description, r.organization, r.external_id, r.record_number,
    r.file_number, r.contract_type, r.published_at, r.opens_at, r.closes_at,
    r.estimated_amount, r.currency, r.detail_url, r.document_url,
    r.matched_keywords, r.relevance_score, r.status, r.is_new, r.raw_data,
    r.created_at
"#;

pub(crate) const SOURCE_COLUMNS: &str = r#"
    id, name, short_name, url, level, province, municipality, adapter_key,
    adapter_config, is_enabled, status, last_checked_at, last_success_at,
    last_error, consecutive_errors, created_at
"#;

pub(crate) const RUN_COLUMNS: &str = r#"
    id, status, trigger_label, started_at, finished_at, duration_secs,
    sources_scanned, sources_failed, records_found, records_new,
    keywords_used, error_details
"#;

pub(crate) const OUTCOME_COLUMNS: &str = r#"
    id, run_id, source_id, status, records_found, records_new,
    duration_secs, error_message, created_at
"#;
