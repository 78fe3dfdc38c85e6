//! Periodic dispatch of due jobs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use docklite_backup_core::should_run;
use docklite_backup_storage::BackupStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::orchestrator::{JobRunSummary, Orchestrator};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(30);

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn BackupStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    initial_delay: Duration,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

/// Tasks spawned by one tick. Each handle resolves to `None` if its job
/// panicked.
#[derive(Default)]
pub struct TickReport {
    pub handles: Vec<JoinHandle<Option<JobRunSummary>>>,
}

impl TickReport {
    pub fn dispatched(&self) -> usize {
        self.handles.len()
    }

    pub async fn join(self) -> Vec<JobRunSummary> {
        let mut summaries = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            if let Ok(Some(summary)) = handle.await {
                summaries.push(summary);
            }
        }
        summaries
    }
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let store = orchestrator.store().clone();
        let clock = orchestrator.clock().clone();
        Self {
            orchestrator,
            store,
            clock,
            interval: DEFAULT_INTERVAL,
            initial_delay: DEFAULT_INITIAL_DELAY,
            in_flight: Arc::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Evaluate every enabled job once and spawn the due ones. Does not wait
    /// for them to finish. A job whose previous run is still going is left
    /// for a later tick.
    pub async fn tick(&self) -> TickReport {
        let jobs = match self.store.get_enabled_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to load enabled jobs, skipping tick");
                return TickReport::default();
            }
        };

        let now = self.clock.now();
        let mut report = TickReport::default();
        for job in jobs.into_iter().filter(|job| should_run(job, now)) {
            let job_id = job.id;
            let Some(guard) = InFlight::claim(&self.in_flight, job_id) else {
                debug!(job_id, "previous run still in progress, not dispatching");
                continue;
            };
            let orchestrator = self.orchestrator.clone();
            let task = tokio::spawn(async move {
                let _guard = guard;
                orchestrator.execute_job(&job).await
            });
            report.handles.push(supervise(job_id, task));
        }
        debug!(dispatched = report.dispatched(), "scheduler tick");
        report
    }

    /// Tick after `initial_delay` and then every `interval` until `shutdown`
    /// turns true or its sender goes away. Jobs already dispatched keep running.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        info!(
            interval_secs = self.interval.as_secs(),
            initial_delay_secs = self.initial_delay.as_secs(),
            "backup scheduler started"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.initial_delay) => {}
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("backup scheduler stopped");
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
        info!("backup scheduler stopped");
    }
}

/// Marks a job as running until dropped, including when its task panics.
struct InFlight {
    jobs: Arc<Mutex<HashSet<i64>>>,
    job_id: i64,
}

impl InFlight {
    fn claim(jobs: &Arc<Mutex<HashSet<i64>>>, job_id: i64) -> Option<Self> {
        let claimed = jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id);
        claimed.then(|| Self {
            jobs: jobs.clone(),
            job_id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// A panicking job is logged here and never reaches the loop.
fn supervise(
    job_id: i64,
    task: JoinHandle<JobRunSummary>,
) -> JoinHandle<Option<JobRunSummary>> {
    tokio::spawn(async move {
        match task.await {
            Ok(summary) => Some(summary),
            Err(e) if e.is_panic() => {
                error!(job_id, "backup job panicked");
                None
            }
            Err(e) => {
                warn!(job_id, error = %e, "backup job task cancelled");
                None
            }
        }
    })
}

/// A scheduler running on its own task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn spawn(scheduler: Scheduler) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(scheduler.run(rx));
        Self { shutdown, task }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "scheduler task failed");
        }
    }
}
