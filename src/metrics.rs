//! Prometheus Metrics for Scan Runs
//!
//! Metrics include:
//! - runs by terminal status
//! - per-source scans by outcome
//! - records found / new per source
//! - dedup hits per source
//! - scan latency (histogram)
//! - adapter errors by kind

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramOpts, HistogramVec,
    IntCounterVec, TextEncoder,
};
use tracing::{error, info};

// ============================================
// METRIC DEFINITIONS
// ============================================

pub const SCAN_SUCCESS: &str = "success";
pub const SCAN_ERROR: &str = "error";

static RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "monitor_runs_total",
        "Total number of completed runs by terminal status",
        &["status"]
    )
    .expect("Failed to create runs_total metric")
});

static SOURCE_SCANS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "monitor_source_scans_total",
        "Total number of source scans by outcome",
        &["source", "status"]
    )
    .expect("Failed to create source_scans metric")
});

static RECORDS_FOUND: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "monitor_records_found_total",
        "Candidates returned by source adapters",
        &["source"]
    )
    .expect("Failed to create records_found metric")
});

static RECORDS_NEW: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "monitor_records_new_total",
        "Records persisted as new",
        &["source"]
    )
    .expect("Failed to create records_new metric")
});

static DEDUP_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "monitor_dedup_hits_total",
        "Candidates skipped as already seen",
        &["source"]
    )
    .expect("Failed to create dedup_hits metric")
});

static SCAN_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "monitor_scan_duration_seconds",
            "Wall time of one source scan in seconds"
        )
        .buckets(buckets),
        &["source"]
    )
    .expect("Failed to create scan_duration metric")
});

static ADAPTER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "monitor_adapter_errors_total",
        "Adapter failures by kind",
        &["kind"]
    )
    .expect("Failed to create adapter_errors metric")
});

// ============================================
// RECORDING HELPERS
// ============================================

pub fn record_run(status: &str) {
    RUNS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_scan(source: &str, status: &str, duration_secs: f64) {
    SOURCE_SCANS.with_label_values(&[source, status]).inc();
    SCAN_DURATION.with_label_values(&[source]).observe(duration_secs);
}

pub fn record_found(source: &str, count: u64) {
    RECORDS_FOUND.with_label_values(&[source]).inc_by(count);
}

pub fn record_new(source: &str, count: u64) {
    RECORDS_NEW.with_label_values(&[source]).inc_by(count);
}

pub fn record_dedup_hits(source: &str, count: u64) {
    DEDUP_HITS.with_label_values(&[source]).inc_by(count);
}

pub fn record_adapter_error(kind: &str) {
    ADAPTER_ERRORS.with_label_values(&[kind]).inc();
}

// ============================================
// METRICS COLLECTION
// ============================================

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

// ============================================
// METRICS SERVER
// ============================================

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

async fn handle_metrics(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" {
        let mut not_found = Response::new(Full::new(Bytes::from_static(b"not found")));
        *not_found.status_mut() = StatusCode::NOT_FOUND;
        return Ok(not_found);
    }
    Ok(Response::new(Full::new(Bytes::from(gather_metrics()))))
}

/// Starts the metrics HTTP server
pub async fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }
}
