//! Periodically fires wake commands for schedules the external store
//! reports as due, piggy-backing on the command router for dispatch so a
//! scheduled wake gets the same retry/timeout/idempotency handling as a
//! user-triggered one.
//!
//! Grounded on the teacher's background-reaper task in `main.rs` (a
//! `tokio::spawn` loop ticking a fixed interval, config-gated, logging and
//! moving on rather than panicking on a single failure).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use cnc_protocol::ScheduleWorkerConfig;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::router::CommandRouter;
use crate::stores::WakeScheduleStore;

pub struct WakeScheduleWorker {
    router: Arc<CommandRouter>,
    store: Arc<dyn WakeScheduleStore>,
    config: ScheduleWorkerConfig,
    ticking: AtomicBool,
}

impl WakeScheduleWorker {
    pub fn new(router: Arc<CommandRouter>, store: Arc<dyn WakeScheduleStore>, config: ScheduleWorkerConfig) -> Arc<Self> {
        Arc::new(Self { router, store, config, ticking: AtomicBool::new(false) })
    }

    /// Spawns the timer task if `schedule_worker.enabled` is set; otherwise
    /// returns `None` and the worker never runs.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("wake schedule worker disabled by configuration");
            return None;
        }

        let worker = Arc::clone(self);
        let poll_interval = std::time::Duration::from_millis(self.config.poll_interval_ms);
        Some(tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            loop {
                ticker.tick().await;
                worker.process_due_wake_schedules().await;
            }
        }))
    }

    /// Runs one batch of due schedules. Callable directly by tests to
    /// bypass the timer. Guards against overlapping ticks: if a previous
    /// tick is still running when the next one fires, the new tick is
    /// skipped rather than queued.
    pub async fn process_due_wake_schedules(&self) -> usize {
        if self.ticking.swap(true, Ordering::SeqCst) {
            tracing::debug!("wake schedule tick skipped: previous tick still in flight");
            return 0;
        }

        let attempted = self.run_batch().await;

        self.ticking.store(false, Ordering::SeqCst);
        attempted
    }

    async fn run_batch(&self) -> usize {
        let due = self.store.list_due(self.config.batch_size).await;
        let mut attempted = 0;

        for schedule in due {
            attempted += 1;
            let correlation_id = format!("wake-schedule:{}", schedule.id);

            let outcome = self.router.route_wake(&schedule.host_fqn, None, Some(correlation_id.clone())).await;
            // record_execution_attempt fires exactly once per schedule
            // regardless of outcome, so a schedule that keeps failing
            // doesn't get silently retried forever without a paper trail.
            self.store.record_execution_attempt(&schedule.id, SystemTime::now()).await;

            match outcome {
                Ok(result) if result.success => {
                    tracing::info!(%correlation_id, schedule_id = %schedule.id, "scheduled wake dispatched");
                }
                Ok(result) => {
                    tracing::warn!(%correlation_id, schedule_id = %schedule.id, error = ?result.error, "scheduled wake command failed");
                }
                Err(err) => {
                    tracing::warn!(%correlation_id, schedule_id = %schedule.id, error = %err, "scheduled wake could not be dispatched");
                }
            }
        }

        attempted
    }
}

/// Cancels `handle` and waits for the in-flight tick, if any, to finish.
pub async fn stop_wake_schedule_worker(worker: &WakeScheduleWorker, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
        let _ = handle.await;
    }
    while worker.ticking.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
