//! PostgreSQL storage backend
//!
//! Row-level locking lets several scan transactions write at once; the
//! backend advertises a fixed writer budget that the orchestrator honours.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use super::rows::{
    HealthRow, KeywordRow, OutcomeRow, RecordRow, RunRow, SourceRow, OUTCOME_COLUMNS,
    RECORD_COLUMNS, RUN_COLUMNS, SOURCE_COLUMNS,
};
use super::{Backend, ScanFailure, ScanSession, Store};
use crate::error::{MonitorError, Result};
use crate::schemas::{
    truncate_chars, Keyword, NewKeyword, NewRecord, NewSource, OutcomeStatus, OutcomeUpdate, Run,
    Source, SourceHealth, SourceOutcome, StoredRecord, MAX_OUTCOME_ERROR_CHARS,
};

pub struct PostgresStore {
    pool: PgPool,
}

/// Concurrent scan transactions this backend accepts
const MAX_WRITERS: usize = 3;

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_WRITERS as u32 + 2)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn load_health(tx: &mut Transaction<'static, Postgres>, source_id: i64) -> Result<SourceHealth> {
    let row: Option<HealthRow> = sqlx::query_as(
        r#"
        SELECT status, last_checked_at, last_success_at, last_error, consecutive_errors
        FROM sources WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(source_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.ok_or_else(|| MonitorError::SourceNotFound(source_id.to_string()))?
        .into_health()
}

async fn write_health(
    tx: &mut Transaction<'static, Postgres>,
    source_id: i64,
    health: &SourceHealth,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sources
        SET status = $1, last_checked_at = $2, last_success_at = $3,
            last_error = $4, consecutive_errors = $5
        WHERE id = $6
        "#,
    )
    .bind(health.status.as_str())
    .bind(health.last_checked_at)
    .bind(health.last_success_at)
    .bind(&health.last_error)
    .bind(health.consecutive_errors)
    .bind(source_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn max_concurrent_writers(&self) -> usize {
        MAX_WRITERS
    }

    async fn active_keywords(&self) -> Result<Vec<Keyword>> {
        let rows: Vec<KeywordRow> = sqlx::query_as(
            r#"
            SELECT id, term, category, priority, is_active, created_at
            FROM keywords WHERE is_active = TRUE
            ORDER BY priority DESC, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Keyword::from).collect())
    }

    async fn list_keywords(&self) -> Result<Vec<Keyword>> {
        let rows: Vec<KeywordRow> = sqlx::query_as(
            "SELECT id, term, category, priority, is_active, created_at FROM keywords ORDER BY priority DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Keyword::from).collect())
    }

    async fn insert_keyword(&self, keyword: &NewKeyword) -> Result<Keyword> {
        let row: KeywordRow = sqlx::query_as(
            r#"
            INSERT INTO keywords (term, category, priority, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, term, category, priority, is_active, created_at
            "#,
        )
        .bind(&keyword.term)
        .bind(&keyword.category)
        .bind(keyword.priority)
        .bind(keyword.is_active)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn enabled_sources(&self, ids: Option<&[i64]>) -> Result<Vec<Source>> {
        let sql = format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM sources
            WHERE is_enabled = TRUE
            ORDER BY CASE level WHEN 'national' THEN 0 WHEN 'provincial' THEN 1 ELSE 2 END, name
            "#
        );
        let rows: Vec<SourceRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(SourceRow::into_source)
            .filter(|s| match (s, ids) {
                (Ok(source), Some(ids)) => ids.contains(&source.id),
                _ => true,
            })
            .collect()
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let sql = format!(
            r#"
            SELECT {SOURCE_COLUMNS} FROM sources
            ORDER BY CASE level WHEN 'national' THEN 0 WHEN 'provincial' THEN 1 ELSE 2 END, name
            "#
        );
        let rows: Vec<SourceRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(SourceRow::into_source).collect()
    }

    async fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1");
        let row: Option<SourceRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SourceRow::into_source).transpose()
    }

    async fn insert_source(&self, source: &NewSource) -> Result<Source> {
        let sql = format!(
            r#"
            INSERT INTO sources (name, short_name, url, level, province, municipality,
                                 adapter_key, adapter_config, is_enabled, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'active', $10)
            RETURNING {SOURCE_COLUMNS}
            "#
        );
        let row: SourceRow = sqlx::query_as(&sql)
            .bind(&source.name)
            .bind(&source.short_name)
            .bind(&source.url)
            .bind(source.level.as_str())
            .bind(&source.province)
            .bind(&source.municipality)
            .bind(&source.adapter_key)
            .bind(Json(&source.adapter_config))
            .bind(source.is_enabled)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        row.into_source()
    }

    async fn set_source_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET is_enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MonitorError::SourceNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create_run(&self, run: &Run) -> Result<Run> {
        let sql = format!(
            r#"
            INSERT INTO runs (status, trigger_label, started_at, keywords_used, error_details)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row: RunRow = sqlx::query_as(&sql)
            .bind(run.status.as_str())
            .bind(&run.trigger)
            .bind(run.started_at)
            .bind(Json(&run.keywords_used))
            .bind(Json(&run.error_details))
            .fetch_one(&self.pool)
            .await?;
        row.into_run()
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = $1, finished_at = $2, duration_secs = $3, sources_scanned = $4,
                sources_failed = $5, records_found = $6, records_new = $7,
                keywords_used = $8, error_details = $9
            WHERE id = $10
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.finished_at)
        .bind(run.duration_secs)
        .bind(run.sources_scanned)
        .bind(run.sources_failed)
        .bind(run.records_found)
        .bind(run.records_new)
        .bind(Json(&run.keywords_used))
        .bind(Json(&run.error_details))
        .bind(run.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY started_at DESC, id DESC LIMIT $1");
        let rows: Vec<RunRow> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn run_outcomes(&self, run_id: i64) -> Result<Vec<SourceOutcome>> {
        let sql = format!("SELECT {OUTCOME_COLUMNS} FROM source_outcomes WHERE run_id = $1 ORDER BY id");
        let rows: Vec<OutcomeRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OutcomeRow::into_outcome).collect()
    }

    async fn begin_scan(&self) -> Result<Box<dyn ScanSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresScanSession { tx }))
    }

    async fn record_scan_failure(&self, failure: &ScanFailure) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO source_outcomes
                (run_id, source_id, status, records_found, records_new, duration_secs, error_message, created_at)
            VALUES ($1, $2, $3, 0, 0, $4, $5, $6)
            "#,
        )
        .bind(failure.run_id)
        .bind(failure.source_id)
        .bind(OutcomeStatus::Error.as_str())
        .bind(failure.duration_secs)
        .bind(truncate_chars(&failure.error, MAX_OUTCOME_ERROR_CHARS))
        .bind(failure.at)
        .execute(&mut *tx)
        .await?;

        let mut health = load_health(&mut tx, failure.source_id).await?;
        health.record_failure(failure.at, &failure.error);
        write_health(&mut tx, failure.source_id, &health).await?;

        tx.commit().await?;
        debug!(source_id = failure.source_id, "Recorded scan failure");
        Ok(())
    }

    async fn count_records(&self, source_id: Option<i64>) -> Result<i64> {
        let count: i64 = match source_id {
            Some(id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE source_id = $1")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM records")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    async fn records_for_source(&self, source_id: i64) -> Result<Vec<StoredRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records r JOIN sources s ON s.id = r.source_id WHERE r.source_id = $1 ORDER BY r.id"
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    async fn unseen_records(&self, limit: usize) -> Result<Vec<StoredRecord>> {
        let sql = format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM records r JOIN sources s ON s.id = r.source_id
            WHERE r.is_new = TRUE
            ORDER BY r.relevance_score DESC, r.created_at DESC
            LIMIT $1
            "#
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }
}

pub struct PostgresScanSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ScanSession for PostgresScanSession {
    async fn insert_outcome(&mut self, run_id: i64, source_id: i64) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO source_outcomes (run_id, source_id, status, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(source_id)
        .bind(OutcomeStatus::Pending.as_str())
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn content_hashes(&mut self, source_id: i64) -> Result<Vec<String>> {
        let hashes: Vec<String> =
            sqlx::query_scalar("SELECT content_hash FROM records WHERE source_id = $1")
                .bind(source_id)
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(hashes)
    }

    async fn hash_exists(&mut self, source_id: i64, content_hash: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM records WHERE source_id = $1 AND content_hash = $2 LIMIT 1",
        )
        .bind(source_id)
        .bind(content_hash)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(found.is_some())
    }

    async fn external_id_exists(&mut self, source_id: i64, external_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM records WHERE source_id = $1 AND external_id = $2 LIMIT 1",
        )
        .bind(source_id)
        .bind(external_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(found.is_some())
    }

    async fn insert_record(&mut self, record: &NewRecord) -> Result<i64> {
        let c = &record.candidate;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO records (
                source_id, content_hash, title, description, organization, external_id,
                record_number, file_number, contract_type, published_at, opens_at, closes_at,
                estimated_amount, currency, detail_url, document_url, matched_keywords,
                relevance_score, status, is_new, raw_data, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22)
            RETURNING id
            "#,
        )
        .bind(record.source_id)
        .bind(&record.content_hash)
        .bind(&c.title)
        .bind(&c.description)
        .bind(&c.organization)
        .bind(&c.external_id)
        .bind(&c.record_number)
        .bind(&c.file_number)
        .bind(&c.contract_type)
        .bind(c.published_at)
        .bind(c.opens_at)
        .bind(c.closes_at)
        .bind(c.estimated_amount)
        .bind(&c.currency)
        .bind(&c.detail_url)
        .bind(&c.document_url)
        .bind(Json(&record.matched_keywords))
        .bind(record.relevance_score)
        .bind(record.status.as_str())
        .bind(record.is_new)
        .bind(c.raw.as_ref().map(Json))
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn source_health(&mut self, source_id: i64) -> Result<SourceHealth> {
        load_health(&mut self.tx, source_id).await
    }

    async fn save_source_health(&mut self, source_id: i64, health: &SourceHealth) -> Result<()> {
        write_health(&mut self.tx, source_id, health).await
    }

    async fn finish_outcome(&mut self, outcome_id: i64, update: &OutcomeUpdate) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE source_outcomes
            SET status = $1, records_found = $2, records_new = $3, duration_secs = $4, error_message = $5
            WHERE id = $6
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.records_found)
        .bind(update.records_new)
        .bind(update.duration_secs)
        .bind(&update.error_message)
        .bind(outcome_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
