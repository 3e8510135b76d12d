//! QC engine
//!
//! Executes batch plans against a data source, diffs each rule's
//! candidates against its active violations and persists the changes one
//! rule at a time. A rule that fails is recorded and skipped; a store that
//! cannot be written aborts the whole run.

use crate::datasource::DataSource;
use crate::error::{Result, RuntimeError};
use crate::result::{
    QCRunRecord, RuleFailure, RuleFailureKind, RunStatus, RunStore, RunTrigger, Violation,
    ViolationChanges, ViolationKey, ViolationStatus, ViolationStore,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use trialcheck_core::ir::BatchQuery;
use trialcheck_core::Schedule;
use uuid::Uuid;

/// QC configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Per-rule query ceiling in seconds
    pub rule_timeout_secs: u64,
    /// Resolve open violations whose candidate disappeared
    pub auto_resolve: bool,
    /// Scheduler tick interval in seconds
    pub tick_interval_secs: u64,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            rule_timeout_secs: 300,
            auto_resolve: false,
            tick_interval_secs: 60,
        }
    }
}

impl QcConfig {
    pub fn with_rule_timeout(mut self, timeout: Duration) -> Self {
        self.rule_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn rule_timeout(&self) -> Duration {
        Duration::from_secs(self.rule_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Engine run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Cooperative cancellation for one run
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A batch plan together with the schedule that decides when it is due
#[derive(Debug, Clone)]
pub struct ScheduledPlan {
    pub plan: Arc<BatchQuery>,
    pub schedule: Schedule,
}

/// Resets the engine to `Idle` however the run ends
struct RunGuard<'a> {
    state: &'a Mutex<EngineState>,
}

impl RunGuard<'_> {
    fn finish(&self, state: EngineState) {
        *self.state.lock() = state;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = EngineState::Idle;
    }
}

/// Outcome of one rule inside a run
enum RuleOutcome {
    Persisted { inserted: usize, resolved: usize },
    Failed(RuleFailure),
    Cancelled,
}

/// Batch QC engine
pub struct QcEngine {
    config: QcConfig,
    source: Arc<dyn DataSource>,
    violations: Arc<dyn ViolationStore>,
    runs: Arc<dyn RunStore>,
    state: Mutex<EngineState>,
}

impl QcEngine {
    pub fn new(
        source: Arc<dyn DataSource>,
        violations: Arc<dyn ViolationStore>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            config: QcConfig::default(),
            source,
            violations,
            runs,
            state: Mutex::new(EngineState::Idle),
        }
    }

    pub fn with_config(mut self, config: QcConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &QcConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn violation_store(&self) -> &Arc<dyn ViolationStore> {
        &self.violations
    }

    pub fn run_store(&self) -> &Arc<dyn RunStore> {
        &self.runs
    }

    fn begin(&self) -> Result<RunGuard<'_>> {
        let mut state = self.state.lock();
        if *state == EngineState::Running {
            return Err(RuntimeError::RunInProgress);
        }
        *state = EngineState::Running;
        Ok(RunGuard { state: &self.state })
    }

    /// Plans whose schedule is due at `now`
    pub async fn due_plans(&self, plans: &[ScheduledPlan], now: DateTime<Utc>) -> Result<Vec<Arc<BatchQuery>>> {
        let mut due = Vec::new();
        for scheduled in plans {
            let last = self
                .runs
                .last_executed(&scheduled.plan.rule_id)
                .await
                .map_err(|e| RuntimeError::SchedulerFailure(e.to_string()))?;
            if scheduled.schedule.is_due(last, now) {
                due.push(scheduled.plan.clone());
            }
        }
        Ok(due)
    }

    /// Execute plans in order.
    ///
    /// `pre_failures` are rules that never produced a plan (for example a
    /// rule that no longer compiles); they are recorded on the run as-is.
    pub async fn run(
        &self,
        plans: Vec<Arc<BatchQuery>>,
        pre_failures: Vec<RuleFailure>,
        trigger: RunTrigger,
        now: DateTime<Utc>,
        cancel: &CancelHandle,
    ) -> Result<QCRunRecord> {
        let guard = self.begin()?;
        let mut record = QCRunRecord::start(trigger, now);

        info!(
            "Starting QC run {} ({:?}, {} rules, source '{}')",
            record.id,
            trigger,
            plans.len() + pre_failures.len(),
            self.source.name()
        );

        if let Err(e) = self.runs.record_run(&record).await {
            guard.finish(EngineState::Failed);
            return Err(RuntimeError::SchedulerFailure(e.to_string()));
        }

        for failure in pre_failures {
            error!("Rule '{}' failed: {}", failure.rule_id, failure.message);
            record.rules_run += 1;
            record.rule_failures.push(failure);
        }

        let mut succeeded = 0usize;
        let mut cancelled = false;

        for plan in plans {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            record.rules_run += 1;

            match self.run_rule(&plan, record.id, now, cancel).await {
                Ok(RuleOutcome::Persisted { inserted, resolved }) => {
                    succeeded += 1;
                    record.violations_found += inserted;
                    record.violations_resolved += resolved;
                }
                Ok(RuleOutcome::Failed(failure)) => {
                    error!("Rule '{}' failed: {}", failure.rule_id, failure.message);
                    record.rule_failures.push(failure);
                }
                Ok(RuleOutcome::Cancelled) => {
                    record.rules_run -= 1;
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    error!("QC run {} aborted: {}", record.id, e);
                    record.error = Some(e.to_string());
                    record.finish(RunStatus::Failed, Utc::now());
                    if let Err(store_err) = self.runs.record_run(&record).await {
                        warn!("Could not record aborted run {}: {}", record.id, store_err);
                    }
                    guard.finish(EngineState::Failed);
                    return Err(RuntimeError::SchedulerFailure(e.to_string()));
                }
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if record.rule_failures.is_empty() {
            RunStatus::Success
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };
        if status == RunStatus::Failed {
            record.error = Some(format!("all {} rules failed", record.rule_failures.len()));
        }
        record.finish(status, Utc::now());

        if let Err(e) = self.runs.record_run(&record).await {
            guard.finish(EngineState::Failed);
            return Err(RuntimeError::SchedulerFailure(e.to_string()));
        }

        guard.finish(match status {
            RunStatus::Cancelled => EngineState::Cancelled,
            RunStatus::Failed => EngineState::Failed,
            _ => EngineState::Completed,
        });

        info!(
            "✓ QC run {} finished: {} ({} rules, {} new violations, {} resolved, {} failures)",
            record.id,
            record.status,
            record.rules_run,
            record.violations_found,
            record.violations_resolved,
            record.rule_failures.len()
        );
        Ok(record)
    }

    /// Execute and persist one rule. `Err` means a store failure.
    async fn run_rule(
        &self,
        plan: &BatchQuery,
        run_id: Uuid,
        now: DateTime<Utc>,
        cancel: &CancelHandle,
    ) -> Result<RuleOutcome> {
        let timeout = self.config.rule_timeout();
        let today = now.date_naive();

        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RuleOutcome::Cancelled),
            result = tokio::time::timeout(timeout, self.source.execute(plan, today)) => result,
        };

        let candidates = match executed {
            Err(_) => {
                let timeout_err = RuntimeError::Timeout {
                    rule_id: plan.rule_id.clone(),
                    seconds: timeout.as_secs(),
                };
                return Ok(RuleOutcome::Failed(RuleFailure::new(
                    &plan.rule_id,
                    RuleFailureKind::Timeout,
                    timeout_err.to_string(),
                )));
            }
            Ok(Err(e)) => {
                return Ok(RuleOutcome::Failed(RuleFailure::new(
                    &plan.rule_id,
                    RuleFailureKind::Query,
                    e.to_string(),
                )))
            }
            Ok(Ok(candidates)) => candidates,
        };
        debug!("Rule '{}' produced {} candidates", plan.rule_id, candidates.len());

        let active = self.violations.active_for_rule(&plan.rule_id).await?;
        let existing: HashSet<ViolationKey> = active.iter().map(Violation::key).collect();

        let mut seen = HashSet::new();
        let mut changes = ViolationChanges::default();
        for candidate in candidates {
            let key = candidate.key();
            if seen.insert(key.clone()) && !existing.contains(&key) {
                changes
                    .insert
                    .push(Violation::from_candidate(candidate, plan.severity, Some(run_id), now));
            }
        }
        if self.config.auto_resolve {
            changes.resolve = active
                .iter()
                .filter(|v| v.status == ViolationStatus::Open && !seen.contains(&v.key()))
                .map(|v| v.id)
                .collect();
        }

        let applied = self.violations.apply(&plan.rule_id, changes, now).await?;
        self.runs.mark_executed(&plan.rule_id, now).await?;

        debug!(
            "Rule '{}': {} inserted, {} resolved",
            plan.rule_id, applied.inserted, applied.resolved
        );
        Ok(RuleOutcome::Persisted {
            inserted: applied.inserted,
            resolved: applied.resolved,
        })
    }
}
