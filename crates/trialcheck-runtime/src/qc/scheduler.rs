//! Periodic QC scheduler
//!
//! A tokio task that ticks at a fixed interval and asks a `DueRunner` to
//! execute whatever is due. Ticks that land while a run is still going
//! are skipped.

use crate::error::{Result, RuntimeError};
use crate::result::QCRunRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Something that can run the rules due at a point in time
#[async_trait]
pub trait DueRunner: Send + Sync {
    async fn run_due(&self, now: DateTime<Utc>) -> Result<QCRunRecord>;
}

/// Handle to a running scheduler task
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop ticking and wait for an in-flight run to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("QC scheduler task ended abnormally: {}", e);
        }
    }
}

/// Interval scheduler
pub struct Scheduler;

impl Scheduler {
    pub fn start(runner: Arc<dyn DueRunner>, interval: Duration) -> SchedulerHandle {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("✓ QC scheduler started (every {:?})", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match runner.run_due(Utc::now()).await {
                            Ok(run) => debug!("Scheduled QC run {} ended: {}", run.id, run.status),
                            Err(RuntimeError::RunInProgress) => {
                                debug!("QC run still in progress, skipping tick")
                            }
                            Err(e) => error!("Scheduled QC run failed: {}", e),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("QC scheduler stopped");
        });

        SchedulerHandle { shutdown, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::RunTrigger;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DueRunner for CountingRunner {
        async fn run_due(&self, now: DateTime<Utc>) -> Result<QCRunRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(QCRunRecord::start(RunTrigger::Scheduled, now))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_until_shutdown() {
        let runner = Arc::new(CountingRunner {
            calls: AtomicUsize::new(0),
        });
        let handle = Scheduler::start(runner.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(150)).await;
        let ticks = runner.calls.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected at least two ticks, got {}", ticks);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), ticks);
    }
}
