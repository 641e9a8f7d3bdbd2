//! Periodic trigger
//!
//! Fires a run every `interval`, optionally once at startup. Runs execute
//! inline in the loop, so two runs never overlap; a tick that comes due
//! while a run is in progress is skipped. Shutdown is observed between runs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::notify::{notify_if_new, RunNotifier};
use crate::orchestrator::{Orchestrator, RunRequest};

pub const SCHEDULER_TRIGGER: &str = "scheduler";

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    run_on_startup: bool,
    notifier: Option<Arc<dyn RunNotifier>>,
    alert_max_records: usize,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            run_on_startup: true,
            notifier: None,
            alert_max_records: 50,
        }
    }

    pub fn run_on_startup(mut self, enabled: bool) -> Self {
        self.run_on_startup = enabled;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RunNotifier>, max_records: usize) -> Self {
        self.notifier = Some(notifier);
        self.alert_max_records = max_records;
        self
    }

    /// Loops until `shutdown` fires. Returns the number of runs executed.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> usize {
        let first = if self.run_on_startup {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs(),
            run_on_startup = self.run_on_startup,
            "Scheduler started"
        );

        let mut runs = 0usize;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(runs, "Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    runs += 1;
                }
            }
        }
        runs
    }

    async fn tick(&self) {
        let run = match self
            .orchestrator
            .run(RunRequest::new(SCHEDULER_TRIGGER))
            .await
        {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, "Scheduled run could not be recorded");
                return;
            }
        };

        if let Some(notifier) = &self.notifier {
            notify_if_new(
                self.orchestrator.store().as_ref(),
                notifier.as_ref(),
                &run,
                self.alert_max_records,
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorSettings;
    use crate::sources::{AdapterRegistry, AdapterSettings};
    use crate::storage::{MemoryStore, Store};

    fn orchestrator(store: MemoryStore) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Arc::new(store),
            Arc::new(AdapterRegistry::builtin(AdapterSettings::default())),
            OrchestratorSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_runs_on_startup_then_stops() {
        let store = MemoryStore::new();
        let scheduler = Scheduler::new(orchestrator(store.clone()), Duration::from_secs(3600));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(()).unwrap();

        assert_eq!(handle.await.unwrap(), 1);
        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, SCHEDULER_TRIGGER);
    }

    #[tokio::test]
    async fn test_waits_for_first_interval_without_startup_run() {
        let store = MemoryStore::new();
        let scheduler = Scheduler::new(orchestrator(store.clone()), Duration::from_secs(3600))
            .run_on_startup(false);
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();

        assert_eq!(handle.await.unwrap(), 0);
        assert!(store.recent_runs(10).await.unwrap().is_empty());
    }
}
