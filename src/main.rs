//! LicitaForense Monitor
//! Public tender monitoring for forensic-science procurement
//!
//! Features:
//! - One-off searches and a scheduled daemon
//! - Bounded concurrent scans with per-source failure isolation
//! - Content-hash deduplication across runs
//! - Keyword relevance scoring with domain synonyms
//! - Source health tracking and run audit trail
//! - Webhook alerts and Prometheus metrics
//! - Graceful shutdown with SIGTERM handling

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use licitaforense_monitor::config::{parse_since, Config};
use licitaforense_monitor::metrics;
use licitaforense_monitor::notify::{self, notify_if_new};
use licitaforense_monitor::orchestrator::{Orchestrator, OrchestratorSettings, RunRequest};
use licitaforense_monitor::scheduler::Scheduler;
use licitaforense_monitor::schemas::{NewKeyword, NewSource, Run, SourceLevel};
use licitaforense_monitor::seed;
use licitaforense_monitor::sources::{AdapterRegistry, AdapterSettings};
use licitaforense_monitor::storage;

/// LicitaForense Monitor - public tender scanning
#[derive(Parser, Debug)]
#[command(name = "licitaforense-monitor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Scans public procurement portals for forensic-science tenders")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single scan now
    Search {
        /// Keywords to use instead of the stored active set (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        keywords: Vec<String>,

        /// Look back this many days
        #[arg(long, default_value = "2")]
        days: i64,

        /// Look back this duration instead (e.g. "12h", "3d")
        #[arg(long)]
        since: Option<String>,

        /// Restrict the scan to these source ids (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        sources: Vec<i64>,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        output: String,
    },

    /// Start the scheduler and scan periodically
    Daemon,

    /// Manage sources
    Sources {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Manage keywords
    Keywords {
        #[command(subcommand)]
        action: KeywordAction,
    },

    /// Show recent runs
    Runs {
        /// Number of runs to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        /// Show per-source outcomes of this run
        #[arg(long)]
        run: Option<i64>,
    },

    /// Insert the default keywords and sources
    Seed,
}

#[derive(Subcommand, Debug)]
enum SourceAction {
    /// List all sources with their health
    List,

    /// Register a new source
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        short_name: String,
        #[arg(long)]
        url: String,
        /// national, provincial or municipal
        #[arg(long, default_value = "national")]
        level: String,
        #[arg(long)]
        adapter: String,
        #[arg(long)]
        province: Option<String>,
        /// Adapter configuration as a JSON object
        #[arg(long)]
        config: Option<String>,
        /// Register the source disabled
        #[arg(long, default_value = "false")]
        disabled: bool,
    },
}

#[derive(Subcommand, Debug)]
enum KeywordAction {
    /// List all keywords
    List,

    /// Add a keyword
    Add {
        term: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value = "5")]
        priority: i64,
    },
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Handles graceful shutdown on SIGTERM/SIGINT
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current run before exit...");
        }
        _ = terminate => {
            info!("Received SIGTERM, finishing current run before exit...");
        }
    }

    let _ = shutdown_tx.send(());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting LicitaForense Monitor");

    let config = Config::load()?;
    config.validate()?;

    info!(
        database = %redact(&config.database_url),
        scan_interval_hours = config.scan_interval_hours,
        lookback_hours = config.lookback_hours,
        match_operator = %config.match_operator,
        "Configuration loaded"
    );

    let orchestrator = build_orchestrator(&config).await?;

    match cli.command {
        Commands::Search {
            keywords,
            days,
            since,
            sources,
            output,
        } => {
            search(&config, &orchestrator, keywords, days, since, sources, &output).await?;
        }

        Commands::Daemon => {
            run_daemon(config, orchestrator).await?;
        }

        Commands::Sources { action } => match action {
            SourceAction::List => list_sources(&orchestrator).await?,
            SourceAction::Add {
                name,
                short_name,
                url,
                level,
                adapter,
                province,
                config: adapter_config,
                disabled,
            } => {
                let level: SourceLevel = level.parse()?;
                let mut source = NewSource::new(name, short_name, url, level, adapter);
                if let Some(province) = province {
                    source = source.province(province);
                }
                if let Some(raw) = adapter_config {
                    let value: serde_json::Value =
                        serde_json::from_str(&raw).context("--config must be a JSON object")?;
                    source = source.with_config(value);
                }
                if disabled {
                    source = source.disabled();
                }
                let source = orchestrator.register_source(&source).await?;
                println!("Source {} registered with id {}", source.short_name, source.id);
            }
        },

        Commands::Keywords { action } => match action {
            KeywordAction::List => list_keywords(&orchestrator).await?,
            KeywordAction::Add {
                term,
                category,
                priority,
            } => {
                let mut keyword = NewKeyword::new(term).priority(priority);
                if let Some(category) = category {
                    keyword = keyword.category(category);
                }
                validator::Validate::validate(&keyword)?;
                let keyword = orchestrator.store().insert_keyword(&keyword).await?;
                println!("Keyword '{}' added with id {}", keyword.term, keyword.id);
            }
        },

        Commands::Runs { limit, run } => show_runs(&orchestrator, limit, run).await?,

        Commands::Seed => {
            let report = seed::seed(&orchestrator, &config.sources_registry_file).await?;
            println!(
                "Seed complete: {} keywords, {} sources added",
                report.keywords_added, report.sources_added
            );
        }
    }

    Ok(())
}

async fn build_orchestrator(config: &Config) -> Result<Arc<Orchestrator>> {
    let store = storage::connect(&config.database_url).await?;
    let registry = AdapterRegistry::builtin(AdapterSettings::from_config(config));
    info!(adapters = ?registry.keys(), "Adapter registry ready");
    Ok(Arc::new(Orchestrator::new(
        store,
        Arc::new(registry),
        OrchestratorSettings::from_config(config)?,
    )))
}

/// Hides credentials in a database URL for logging
fn redact(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => database_url.to_string(),
    }
}

/// Runs the scheduler until shutdown
async fn run_daemon(config: Config, orchestrator: Arc<Orchestrator>) -> Result<()> {
    seed::seed(&orchestrator, &config.sources_registry_file).await?;

    if config.metrics_enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let mut scheduler = Scheduler::new(orchestrator, config.scan_interval())
        .run_on_startup(config.scan_on_startup);
    if let Some(notifier) = notify::from_config(&config)? {
        scheduler = scheduler.with_notifier(Arc::from(notifier), config.alert_max_records);
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(shutdown_signal(shutdown_tx));

    let runs = scheduler.run(shutdown_rx).await;
    info!(runs, "LicitaForense Monitor stopped");
    Ok(())
}

/// Runs a single scan from the command line
async fn search(
    config: &Config,
    orchestrator: &Orchestrator,
    keywords: Vec<String>,
    days: i64,
    since: Option<String>,
    sources: Vec<i64>,
    output_format: &str,
) -> Result<()> {
    let lookback = match since {
        Some(since) => parse_since(&since)?,
        None => Duration::days(days),
    };

    let mut request = RunRequest::new("cli").since(Utc::now() - lookback);
    if !keywords.is_empty() {
        request = request.keywords(keywords);
    }
    if !sources.is_empty() {
        request = request.sources(sources);
    }

    let run = orchestrator.run(request).await?;

    if let Some(notifier) = notify::from_config(config)? {
        notify_if_new(
            orchestrator.store().as_ref(),
            notifier.as_ref(),
            &run,
            config.alert_max_records,
        )
        .await;
    }

    match output_format {
        "json" => println!("{}", serde_json::to_string_pretty(&run)?),
        _ => {
            print_run(&run);
            if run.records_new > 0 {
                let records = orchestrator.store().unseen_records(20).await?;
                println!("\nNew records:");
                for record in records {
                    println!(
                        "  [{:.2}] {} ({}){}",
                        record.relevance_score,
                        record.candidate.title,
                        record.candidate.source_short_name,
                        record
                            .candidate
                            .detail_url
                            .map(|u| format!("\n         {u}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_run(run: &Run) {
    println!("\nRun #{} ({})", run.id, run.trigger);
    println!("==================");
    println!("Status:   {}", run.status.as_str());
    println!("Sources:  {} scanned, {} failed", run.sources_scanned, run.sources_failed);
    println!("Records:  {} found, {} new", run.records_found, run.records_new);
    if let Some(duration) = run.duration_secs {
        println!("Duration: {duration:.1}s");
    }
    for detail in &run.error_details {
        println!(
            "  ! {}: {}",
            detail.source.as_deref().unwrap_or("run"),
            detail.error
        );
    }
}

async fn list_sources(orchestrator: &Orchestrator) -> Result<()> {
    let sources = orchestrator.store().list_sources().await?;
    println!(
        "\n{:<4} {:<20} {:<11} {:<18} {:<8} {:<7} {:<6}",
        "ID", "Short name", "Level", "Adapter", "Enabled", "Status", "Errors"
    );
    println!("{}", "-".repeat(80));
    for s in &sources {
        println!(
            "{:<4} {:<20} {:<11} {:<18} {:<8} {:<7} {:<6}",
            s.id,
            s.short_name,
            s.level.as_str(),
            s.adapter_key,
            if s.is_enabled { "yes" } else { "no" },
            s.health.status.as_str(),
            s.health.consecutive_errors
        );
    }
    println!("\nTotal: {} sources", sources.len());
    Ok(())
}

async fn list_keywords(orchestrator: &Orchestrator) -> Result<()> {
    let keywords = orchestrator.store().list_keywords().await?;
    println!("\n{:<4} {:<30} {:<18} {:<8} {:<6}", "ID", "Term", "Category", "Priority", "Active");
    println!("{}", "-".repeat(70));
    for k in &keywords {
        println!(
            "{:<4} {:<30} {:<18} {:<8} {:<6}",
            k.id,
            k.term,
            k.category.as_deref().unwrap_or("-"),
            k.priority,
            if k.is_active { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn show_runs(orchestrator: &Orchestrator, limit: usize, run_id: Option<i64>) -> Result<()> {
    let store = orchestrator.store();

    if let Some(run_id) = run_id {
        let run = store
            .get_run(run_id)
            .await?
            .with_context(|| format!("run {run_id} not found"))?;
        print_run(&run);
        println!("\nOutcomes:");
        for outcome in store.run_outcomes(run_id).await? {
            println!(
                "  source {:<4} {:<8} found {:<4} new {:<4} {}",
                outcome.source_id,
                outcome.status.as_str(),
                outcome.records_found,
                outcome.records_new,
                outcome.error_message.unwrap_or_default()
            );
        }
        return Ok(());
    }

    println!(
        "\n{:<6} {:<10} {:<9} {:<20} {:<8} {:<7} {:<6}",
        "ID", "Trigger", "Status", "Started", "Sources", "Failed", "New"
    );
    println!("{}", "-".repeat(72));
    for run in store.recent_runs(limit).await? {
        println!(
            "{:<6} {:<10} {:<9} {:<20} {:<8} {:<7} {:<6}",
            run.id,
            run.trigger,
            run.status.as_str(),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.sources_scanned,
            run.sources_failed,
            run.records_new
        );
    }
    Ok(())
}
