//! Scan Task
//!
//! One source, one isolated unit of work:
//!
//! open session -> pending outcome -> preload dedup -> adapter fetch ->
//! dedup / score / insert per candidate -> health success -> outcome success
//! -> commit
//!
//! Any failure rolls the session back and records an error outcome plus the
//! health update in a fresh unit of work. Nothing is retried here.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::dedup::{content_hash, Deduplicator};
use crate::error::Result;
use crate::matcher::{KeywordMatcher, MatchOperator, MatchResult};
use crate::metrics;
use crate::schemas::{NewRecord, OutcomeStatus, OutcomeUpdate, RecordStatus, Source};
use crate::sources::{fetch_candidates, AdapterRegistry};
use crate::storage::{ScanFailure, ScanSession, Store};

/// Lifecycle of a scan task, traced on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Counts reported by a successful scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Candidates returned by the adapter
    pub found: usize,
    /// Records persisted as new
    pub new: usize,
    pub duplicates: usize,
    /// Candidates left out by the AND operator or the minimum score
    pub filtered: usize,
}

/// Run-wide inputs shared by every task of a run
#[derive(Debug)]
pub struct ScanContext {
    pub run_id: i64,
    pub keywords: Vec<String>,
    pub matcher: KeywordMatcher,
    pub since: DateTime<Utc>,
    pub min_score: f64,
}

impl ScanContext {
    /// Under OR every candidate is kept, since the adapter already searched
    /// by keyword. Under AND the text must contain every keyword.
    pub fn accepts(&self, result: &MatchResult) -> bool {
        let operator_ok = match self.matcher.operator() {
            MatchOperator::And => result.matched,
            MatchOperator::Or => true,
        };
        operator_ok && result.score >= self.min_score
    }
}

pub struct ScanTask {
    store: Arc<dyn Store>,
    registry: Arc<AdapterRegistry>,
    source: Source,
    context: Arc<ScanContext>,
    phase: ScanPhase,
}

impl ScanTask {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<AdapterRegistry>,
        source: Source,
        context: Arc<ScanContext>,
    ) -> Self {
        Self {
            store,
            registry,
            source,
            context,
            phase: ScanPhase::Pending,
        }
    }

    fn transition(&mut self, next: ScanPhase) {
        debug!(source = %self.source.short_name, from = ?self.phase, to = ?next, "Scan phase");
        self.phase = next;
    }

    /// Runs the scan to completion. On error the failure has already been
    /// recorded (best effort) by the time this returns.
    #[instrument(skip(self), fields(run_id = self.context.run_id, source = %self.source.short_name))]
    pub async fn run(mut self) -> Result<ScanReport> {
        self.transition(ScanPhase::Running);
        let clock = Instant::now();
        let mut session = None;

        let result = self.execute(&mut session, clock).await;
        let duration_secs = clock.elapsed().as_secs_f64();

        match result {
            Ok(report) => {
                self.transition(ScanPhase::Succeeded);
                metrics::record_scan(&self.source.short_name, metrics::SCAN_SUCCESS, duration_secs);
                info!(
                    found = report.found,
                    new = report.new,
                    duplicates = report.duplicates,
                    duration_secs,
                    "Source scan succeeded"
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(ScanPhase::Failed);
                if let Some(session) = session.take() {
                    if let Err(rollback_err) = session.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                    }
                }

                let failure = ScanFailure {
                    run_id: self.context.run_id,
                    source_id: self.source.id,
                    error: e.to_string(),
                    duration_secs,
                    at: Utc::now(),
                };
                if let Err(fallback_err) = self.store.record_scan_failure(&failure).await {
                    error!(error = %fallback_err, scan_error = %e, "Could not record scan failure");
                }

                metrics::record_scan(&self.source.short_name, metrics::SCAN_ERROR, duration_secs);
                warn!(error = %e, duration_secs, "Source scan failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        slot: &mut Option<Box<dyn ScanSession>>,
        clock: Instant,
    ) -> Result<ScanReport> {
        let ctx = &self.context;
        let source_id = self.source.id;
        let short_name = self.source.short_name.as_str();

        let session = slot.insert(self.store.begin_scan().await?);
        let outcome_id = session.insert_outcome(ctx.run_id, source_id).await?;

        let mut dedup = Deduplicator::new(source_id);
        dedup.preload(session.as_mut()).await?;

        let adapter = self.registry.build(&self.source)?;
        let candidates =
            fetch_candidates(adapter.as_ref(), &self.source, &ctx.keywords, ctx.since).await?;

        let mut report = ScanReport {
            found: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let hash = content_hash(&candidate);
            if dedup.is_duplicate(session.as_mut(), &candidate, &hash).await? {
                continue;
            }

            let result = ctx.matcher.evaluate_candidate(&candidate);
            if !ctx.accepts(&result) {
                report.filtered += 1;
                continue;
            }

            let matched_keywords = if result.keywords_found.is_empty() {
                candidate.suggested_keywords.clone()
            } else {
                result.keywords_found
            };

            let record = NewRecord {
                source_id,
                content_hash: hash,
                matched_keywords,
                relevance_score: result.score,
                status: RecordStatus::New,
                is_new: true,
                candidate,
            };
            session.insert_record(&record).await?;
            dedup.mark_seen(&record.content_hash);
            report.new += 1;
        }
        report.duplicates = dedup.hits();

        let mut health = session.source_health(source_id).await?;
        health.record_success(Utc::now());
        session.save_source_health(source_id, &health).await?;

        session
            .finish_outcome(
                outcome_id,
                &OutcomeUpdate {
                    status: OutcomeStatus::Success,
                    records_found: report.found as i64,
                    records_new: report.new as i64,
                    duration_secs: clock.elapsed().as_secs_f64(),
                    error_message: None,
                },
            )
            .await?;

        if let Some(session) = slot.take() {
            session.commit().await?;
        }

        metrics::record_found(short_name, report.found as u64);
        metrics::record_new(short_name, report.new as u64);
        metrics::record_dedup_hits(short_name, report.duplicates as u64);
        Ok(report)
    }
}
