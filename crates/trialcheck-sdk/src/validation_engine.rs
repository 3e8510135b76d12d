//! ValidationEngine - the public entry point
//!
//! Ties the rule lifecycle together: authored rules are compiled against
//! the field catalog, real-time validators are served from the cache, and
//! batch plans are handed to the QC engine on demand or on schedule.
//!
//! Real-time validation never touches a store. The engine keeps an
//! in-memory registry of active rules and the catalog they compiled
//! against; stores are only read when building, saving or reloading.

use crate::config::EngineConfig;
use crate::error::{Result, SdkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use trialcheck_compiler::{CompileError, CompileResult, Compiler};
use trialcheck_core::ir::{BatchQuery, EvalContext, RealTimeValidator, Record, ValidationResult};
use trialcheck_core::{FieldCatalog, Rule, RuleContext, RuleScope, Schedule};
use trialcheck_repository::{FieldCatalogProvider, RecordProvider, RuleStore};
use trialcheck_runtime::{
    CacheStats, CancelHandle, DueRunner, EngineState, Executor, QCRunRecord, QcEngine, RuleCache,
    RuleFailure, RuleFailureKind, RunTrigger, RuntimeError, ScheduledPlan, Scheduler,
    SchedulerHandle, Violation, ViolationFilter, ViolationStatus,
};
use uuid::Uuid;

/// Id given to rules compiled through `compile_text`
const DRAFT_RULE_ID: &str = "draft";

struct BatchEntry {
    plan: Arc<BatchQuery>,
    schedule: Schedule,
}

/// Active rules and the catalog they were compiled against
#[derive(Default)]
struct Registry {
    catalog: Arc<FieldCatalog>,
    realtime: HashMap<String, Rule>,
    batch: HashMap<String, BatchEntry>,
    /// Batch rules that stopped compiling after a catalog reload
    broken: HashMap<String, String>,
}

impl Registry {
    fn remove(&mut self, rule_id: &str) {
        self.realtime.remove(rule_id);
        self.batch.remove(rule_id);
        self.broken.remove(rule_id);
    }
}

/// Clinical data validation engine
pub struct ValidationEngine {
    config: EngineConfig,
    compiler: Compiler,
    rules: Arc<dyn RuleStore>,
    catalog_provider: Arc<dyn FieldCatalogProvider>,
    records: Option<Arc<dyn RecordProvider>>,
    cache: RuleCache,
    qc: QcEngine,
    registry: RwLock<Registry>,
    active_run: Mutex<Option<CancelHandle>>,
    /// Rules dropped by synchronous validation, stored inactive on the next
    /// async call
    deactivations: Mutex<Vec<Rule>>,
}

impl ValidationEngine {
    pub(crate) async fn new(
        config: EngineConfig,
        rules: Arc<dyn RuleStore>,
        catalog_provider: Arc<dyn FieldCatalogProvider>,
        records: Option<Arc<dyn RecordProvider>>,
        qc: QcEngine,
    ) -> Result<Self> {
        let engine = Self {
            compiler: Compiler::with_options(config.compiler.clone()),
            cache: RuleCache::with_config(config.cache.clone()),
            config,
            rules,
            catalog_provider,
            records,
            qc,
            registry: RwLock::new(Registry::default()),
            active_run: Mutex::new(None),
            deactivations: Mutex::new(Vec::new()),
        };
        engine.reload().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Catalog the active rules were compiled against
    pub fn catalog(&self) -> Arc<FieldCatalog> {
        self.registry.read().catalog.clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// True if a compiled validator for this rule is cached
    pub fn is_cached(&self, rule_id: &str) -> bool {
        self.cache.contains(rule_id)
    }

    /// Ids of active rules, real-time and batch, sorted
    pub fn active_rule_ids(&self) -> Vec<String> {
        let registry = self.registry.read();
        let mut ids: Vec<String> = registry
            .realtime
            .keys()
            .chain(registry.batch.keys())
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// True if a batch rule takes part in scheduled runs
    pub fn is_scheduled(&self, rule_id: &str) -> bool {
        self.registry
            .read()
            .batch
            .get(rule_id)
            .is_some_and(|entry| entry.schedule != Schedule::Manual)
    }

    pub fn qc_state(&self) -> EngineState {
        self.qc.state()
    }

    /// Reload the catalog and every rule from the stores.
    ///
    /// Active rules that fail to compile are stored inactive, except batch
    /// rules that only broke because the catalog changed: those stay active
    /// and are reported as compile failures on each run until fixed.
    pub async fn reload(&self) -> Result<()> {
        self.flush_deactivations().await?;
        let catalog = Arc::new(self.catalog_provider.catalog().await?);
        let mut next = Registry {
            catalog: catalog.clone(),
            ..Registry::default()
        };
        let previous_batch: Vec<String> = self.registry.read().batch.keys().cloned().collect();

        for rule in self.rules.list_active().await? {
            match self.compiler.compile(&rule, &catalog) {
                Ok(compiled) => match compiled.batch {
                    Some(plan) => {
                        next.batch.insert(
                            rule.id.clone(),
                            BatchEntry {
                                plan: Arc::new(plan),
                                schedule: rule.schedule.unwrap_or(Schedule::Manual),
                            },
                        );
                    }
                    None => {
                        // Validators are compiled again lazily on first use
                        next.realtime.insert(rule.id.clone(), rule);
                    }
                },
                Err(e) if rule.context == RuleContext::Batch && previous_batch.contains(&rule.id) => {
                    warn!("Batch rule '{}' no longer compiles: {}", rule.id, e);
                    next.broken.insert(rule.id.clone(), e.to_string());
                }
                Err(e) => {
                    self.log_compile_failure(&rule, &e);
                    self.rules.save(&rule.clone().inactive()).await?;
                }
            }
        }

        let (realtime, batch, broken) = (next.realtime.len(), next.batch.len(), next.broken.len());
        *self.registry.write() = next;
        self.cache.clear();

        info!(
            "✓ Loaded {} real-time and {} batch rules (catalog v{}, {} broken)",
            realtime,
            batch,
            catalog.version(),
            broken
        );
        Ok(())
    }

    /// Store inactive every rule queued by `validate_field_with`
    async fn flush_deactivations(&self) -> Result<()> {
        let mut queued = std::mem::take(&mut *self.deactivations.lock());
        while let Some(rule) = queued.pop() {
            if let Err(e) = self.rules.save(&rule.clone().inactive()).await {
                queued.push(rule);
                self.deactivations.lock().extend(queued);
                return Err(e.into());
            }
            info!("Stored rule '{}' inactive", rule.id);
        }
        Ok(())
    }

    /// Ids of rules waiting to be stored inactive
    pub fn pending_deactivations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .deactivations
            .lock()
            .iter()
            .map(|rule| rule.id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn log_compile_failure(&self, rule: &Rule, err: &CompileError) {
        if err.is_author_error() {
            warn!("Rule '{}' rejected: {}", rule.id, err);
        } else {
            error!("Rule '{}' hit a compiler defect and is deactivated: {}", rule.id, err);
        }
    }

    fn realtime_validator(&self, rule: &Rule, catalog: &FieldCatalog) -> std::result::Result<RealTimeValidator, CompileError> {
        self.compiler.compile(rule, catalog)?.realtime.ok_or_else(|| {
            CompileError::Internal(format!("rule '{}' produced no real-time validator", rule.id))
        })
    }

    // ========== Real-time validation ==========

    /// Evaluate one real-time rule against the current form values
    pub fn validate_field(&self, rule_id: &str, record: &Record) -> Result<ValidationResult> {
        self.validate_field_with(rule_id, record, &EvalContext::now())
    }

    /// Evaluate one real-time rule with an explicit evaluation context
    pub fn validate_field_with(
        &self,
        rule_id: &str,
        record: &Record,
        ctx: &EvalContext,
    ) -> Result<ValidationResult> {
        let (rule, catalog) = {
            let registry = self.registry.read();
            match registry.realtime.get(rule_id) {
                Some(rule) => (rule.clone(), registry.catalog.clone()),
                None if registry.batch.contains_key(rule_id) => {
                    return Err(SdkError::WrongContext {
                        rule_id: rule_id.to_string(),
                        context: RuleContext::Batch,
                    })
                }
                None => return Err(SdkError::RuleNotFound(rule_id.to_string())),
            }
        };

        let hash = rule.content_hash(catalog.version());
        let validator = match self
            .cache
            .get_or_compile(&rule.id, &hash, || self.realtime_validator(&rule, &catalog))
        {
            Ok(validator) => validator,
            Err(e) => {
                // Fail open; an unusable rule must not block data entry
                self.log_compile_failure(&rule, &e);
                self.forget(&rule.id);
                self.deactivations.lock().push(rule.clone());
                return Ok(ValidationResult::error(&rule.id, &rule.field, e.to_string()));
            }
        };

        Ok(Executor::validate(&validator, record, ctx))
    }

    /// Run every active real-time rule on `field` against a form's current
    /// values, ordered by rule id
    pub async fn validate_form(&self, form_id: &str, field: &str) -> Result<Vec<ValidationResult>> {
        let records = self
            .records
            .as_ref()
            .ok_or(SdkError::NotConfigured("record provider"))?;
        let record = records.get_current_values(form_id).await?;

        let mut rule_ids: Vec<String> = self
            .registry
            .read()
            .realtime
            .values()
            .filter(|rule| rule.field == field)
            .map(|rule| rule.id.clone())
            .collect();
        rule_ids.sort();

        let ctx = EvalContext::now();
        let results = rule_ids
            .iter()
            .map(|id| self.validate_field_with(id, &record, &ctx))
            .collect::<Result<Vec<_>>>()?;
        self.flush_deactivations().await?;
        Ok(results)
    }

    // ========== Rule lifecycle ==========

    /// Compile a rule for author feedback without activating it
    pub fn compile_rule(&self, rule: &Rule) -> CompileResult {
        let catalog = self.catalog();
        CompileResult::from(&self.compiler.compile(rule, &catalog))
    }

    /// Compile bare rule text attached to `field`
    pub fn compile_text(&self, field: &str, text: &str, context: RuleContext) -> CompileResult {
        let rule = match context {
            RuleContext::RealTime => Rule::new(DRAFT_RULE_ID, field, text),
            RuleContext::Batch => Rule::new(DRAFT_RULE_ID, field, text).batch(RuleScope::Field),
        };
        self.compile_rule(&rule)
    }

    /// Store a rule, activating it only if it compiles.
    ///
    /// On success the cached validator or stored batch plan is replaced in
    /// one step. On failure the rule is stored inactive and dropped from the
    /// cache and the schedule.
    pub async fn save_rule(&self, rule: Rule) -> Result<CompileResult> {
        // A queued deactivation must not overwrite the version being saved
        self.deactivations.lock().retain(|queued| queued.id != rule.id);
        self.flush_deactivations().await?;
        let catalog = self.catalog();
        let compiled = self.compiler.compile(&rule, &catalog);
        let result = CompileResult::from(&compiled);

        let compiled = match compiled {
            Ok(compiled) if rule.active => compiled,
            Ok(_) => {
                self.rules.save(&rule).await?;
                self.forget(&rule.id);
                info!("Saved rule '{}' (inactive)", rule.id);
                return Ok(result);
            }
            Err(e) => {
                self.log_compile_failure(&rule, &e);
                self.rules.save(&rule.clone().inactive()).await?;
                self.forget(&rule.id);
                return Ok(result);
            }
        };

        self.rules.save(&rule).await?;

        let hash = rule.content_hash(catalog.version());
        let mut registry = self.registry.write();
        registry.remove(&rule.id);
        match (compiled.realtime, compiled.batch) {
            (Some(validator), _) => {
                self.cache.insert(&rule.id, &hash, validator);
                registry.realtime.insert(rule.id.clone(), rule.clone());
            }
            (None, Some(plan)) => {
                self.cache.invalidate(&rule.id);
                registry.batch.insert(
                    rule.id.clone(),
                    BatchEntry {
                        plan: Arc::new(plan),
                        schedule: rule.schedule.unwrap_or(Schedule::Manual),
                    },
                );
            }
            (None, None) => {}
        }
        drop(registry);

        info!("✓ Activated rule '{}' ({}, {})", rule.id, rule.context, rule.scope);
        Ok(result)
    }

    fn forget(&self, rule_id: &str) {
        self.registry.write().remove(rule_id);
        self.cache.invalidate(rule_id);
    }

    /// Stop evaluating a rule. Its violations are kept.
    pub async fn deactivate_rule(&self, rule_id: &str) -> Result<()> {
        self.flush_deactivations().await?;
        let rule = self.rules.get(rule_id).await?;
        if rule.active {
            self.rules.save(&rule.inactive()).await?;
        }
        self.forget(rule_id);
        info!("✓ Deactivated rule '{}'", rule_id);
        Ok(())
    }

    // ========== Batch QC ==========

    /// Run the named batch rules, or every active batch rule, now
    pub async fn run_qc_now(&self, rule_ids: Option<&[String]>) -> Result<QCRunRecord> {
        self.flush_deactivations().await?;
        let (plans, failures) = {
            let registry = self.registry.read();
            match rule_ids {
                Some(ids) => {
                    let mut plans = Vec::new();
                    let mut failures = Vec::new();
                    for id in ids {
                        if let Some(entry) = registry.batch.get(id) {
                            plans.push(entry.plan.clone());
                        } else if let Some(message) = registry.broken.get(id) {
                            failures.push(RuleFailure::new(id, RuleFailureKind::Compile, message));
                        } else if registry.realtime.contains_key(id) {
                            return Err(SdkError::WrongContext {
                                rule_id: id.clone(),
                                context: RuleContext::RealTime,
                            });
                        } else {
                            return Err(SdkError::RuleNotFound(id.clone()));
                        }
                    }
                    (plans, failures)
                }
                None => (Self::sorted_plans(&registry), Self::broken_failures(&registry)),
            }
        };

        Ok(self.run_plans(plans, failures, RunTrigger::Manual, Utc::now()).await?)
    }

    /// Run every active batch rule whose schedule is due at `now`
    pub async fn run_due_rules(&self, now: DateTime<Utc>) -> Result<QCRunRecord> {
        self.flush_deactivations().await?;
        Ok(self.run_due(now).await?)
    }

    async fn run_due_inner(&self, now: DateTime<Utc>) -> trialcheck_runtime::Result<QCRunRecord> {
        let (scheduled, failures) = {
            let registry = self.registry.read();
            let mut scheduled: Vec<ScheduledPlan> = registry
                .batch
                .values()
                .map(|entry| ScheduledPlan {
                    plan: entry.plan.clone(),
                    schedule: entry.schedule,
                })
                .collect();
            scheduled.sort_by(|a, b| a.plan.rule_id.cmp(&b.plan.rule_id));
            (scheduled, Self::broken_failures(&registry))
        };

        let due = self.qc.due_plans(&scheduled, now).await?;
        self.run_plans(due, failures, RunTrigger::Scheduled, now).await
    }

    fn sorted_plans(registry: &Registry) -> Vec<Arc<BatchQuery>> {
        let mut plans: Vec<Arc<BatchQuery>> =
            registry.batch.values().map(|entry| entry.plan.clone()).collect();
        plans.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        plans
    }

    fn broken_failures(registry: &Registry) -> Vec<RuleFailure> {
        let mut failures: Vec<RuleFailure> = registry
            .broken
            .iter()
            .map(|(id, message)| RuleFailure::new(id, RuleFailureKind::Compile, message))
            .collect();
        failures.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        failures
    }

    async fn run_plans(
        &self,
        plans: Vec<Arc<BatchQuery>>,
        failures: Vec<RuleFailure>,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> trialcheck_runtime::Result<QCRunRecord> {
        let cancel = {
            let mut active = self.active_run.lock();
            if active.is_some() {
                return Err(RuntimeError::RunInProgress);
            }
            let cancel = CancelHandle::new();
            *active = Some(cancel.clone());
            cancel
        };

        let result = self.qc.run(plans, failures, trigger, now, &cancel).await;
        *self.active_run.lock() = None;
        result
    }

    /// Cancel the QC run in progress. Returns false if nothing is running.
    pub fn cancel_qc_run(&self) -> bool {
        match self.active_run.lock().as_ref() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Start the periodic scheduler at the configured tick interval
    pub fn start_scheduler(self: &Arc<Self>) -> SchedulerHandle {
        let runner: Arc<dyn DueRunner> = self.clone();
        Scheduler::start(runner, self.config.qc.tick_interval())
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<QCRunRecord>> {
        Ok(self.qc.run_store().recent_runs(limit).await?)
    }

    // ========== Violations ==========

    pub async fn get_violations(&self, filter: &ViolationFilter) -> Result<Vec<Violation>> {
        Ok(self.qc.violation_store().query(filter).await?)
    }

    /// Review workflow transition
    pub async fn update_violation_status(&self, id: Uuid, status: ViolationStatus) -> Result<Violation> {
        let violation = self
            .qc
            .violation_store()
            .update_status(id, status, Utc::now())
            .await?;
        info!("Violation {} marked {}", id, status);
        Ok(violation)
    }
}

#[async_trait]
impl DueRunner for ValidationEngine {
    async fn run_due(&self, now: DateTime<Utc>) -> trialcheck_runtime::Result<QCRunRecord> {
        if let Err(e) = self.flush_deactivations().await {
            warn!("Queued rule deactivations not stored yet: {}", e);
        }
        self.run_due_inner(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValidationEngineBuilder;
    use chrono::NaiveDate;
    use trialcheck_core::ir::EvaluationStatus;
    use trialcheck_core::{FieldDefinition, FieldType, Value};
    use trialcheck_repository::MemoryRuleStore;

    fn catalog() -> FieldCatalog {
        FieldCatalog::new()
            .with_field(FieldDefinition::new("systolic_bp", FieldType::Numeric).in_table("vitals"))
    }

    /// Engine whose registry holds a real-time rule that no longer compiles
    async fn engine_with_defective_rule() -> (ValidationEngine, Arc<MemoryRuleStore>) {
        let store = Arc::new(MemoryRuleStore::new());
        let engine = ValidationEngineBuilder::new()
            .with_catalog(catalog())
            .with_rule_store(store.clone())
            .build()
            .await
            .unwrap();

        let rule = Rule::new("bp_ratio", "systolic_bp", "systolic_bp / heart_rate < 3");
        store.save(&rule).await.unwrap();
        engine
            .registry
            .write()
            .realtime
            .insert(rule.id.clone(), rule);
        (engine, store)
    }

    fn form() -> Record {
        [("systolic_bp".to_string(), Value::Number(120.0))]
            .into_iter()
            .collect()
    }

    fn ctx() -> EvalContext {
        EvalContext::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
    }

    #[tokio::test]
    async fn test_lazy_compile_failure_is_stored_inactive() {
        let (engine, store) = engine_with_defective_rule().await;

        let result = engine.validate_field_with("bp_ratio", &form(), &ctx()).unwrap();
        assert!(result.valid);
        assert_eq!(result.status, EvaluationStatus::Error);
        assert!(engine.active_rule_ids().is_empty());
        assert_eq!(engine.pending_deactivations(), vec!["bp_ratio"]);
        assert!(store.get("bp_ratio").await.unwrap().active);

        engine.run_qc_now(None).await.unwrap();
        assert!(engine.pending_deactivations().is_empty());
        assert!(!store.get("bp_ratio").await.unwrap().active);

        // Not picked up again on reload
        engine.reload().await.unwrap();
        assert!(engine.active_rule_ids().is_empty());
        assert!(matches!(
            engine.validate_field_with("bp_ratio", &form(), &ctx()),
            Err(SdkError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_saving_a_fix_cancels_queued_deactivation() {
        let (engine, store) = engine_with_defective_rule().await;
        engine.validate_field_with("bp_ratio", &form(), &ctx()).unwrap();

        let fixed = Rule::new("bp_ratio", "systolic_bp", "between 60 and 220");
        assert!(engine.save_rule(fixed).await.unwrap().success);

        assert!(engine.pending_deactivations().is_empty());
        assert!(store.get("bp_ratio").await.unwrap().active);
        let result = engine.validate_field_with("bp_ratio", &form(), &ctx()).unwrap();
        assert_eq!(result.status, EvaluationStatus::Passed);
    }
}
