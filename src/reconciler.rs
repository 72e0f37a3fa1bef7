//! Reconciler for converging infrastructure towards the document.
//!
//! This module ties the components together for one cycle: build the
//! desired graph, lock the state, optionally refresh it from the providers
//! (drift detection), plan, execute, record history and release the lock.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, InfraConfig, VariableValues};
use crate::error::{ReconcileError, Result, StateError};
use crate::executor::{ApplyReport, Executor};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{AttributeChange, Plan, Planner, diff_remote};
use crate::provider::{ProviderRegistry, RetryPolicy};
use crate::resource::{Attributes, ResourceId};
use crate::state::{
    HistoryEntry, HistoryOperation, HistorySummary, StateDocument, StateManager, generate_holder_id,
};

/// Drives plan/apply cycles for one document.
pub struct Reconciler<'a> {
    config: &'a InfraConfig,
    variables: &'a VariableValues,
    registry: &'a ProviderRegistry,
    state: Arc<StateManager>,
    hasher: ConfigHasher,
    holder: String,
    refresh: bool,
    cancel: Option<watch::Receiver<bool>>,
}

impl fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.config.project.name)
            .field("environment", &self.config.project.environment)
            .field("holder", &self.holder)
            .field("refresh", &self.refresh)
            .finish_non_exhaustive()
    }
}

/// Result of an apply or destroy cycle.
#[derive(Debug, Serialize)]
pub struct ReconciliationResult {
    /// The plan that was executed.
    pub plan: Plan,
    /// Drift found by the refresh that preceded planning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
    /// Execution report.
    pub report: ApplyReport,
}

impl ReconciliationResult {
    /// Returns true if every node was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

/// What a drift check found for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    /// Remote attributes differ from the recorded ones.
    Changed {
        /// Recorded (`before`) versus remote (`after`) values.
        changes: Vec<AttributeChange>,
    },
    /// The remote instance no longer exists.
    Missing,
    /// The provider could not be read.
    Unreadable {
        /// Error message.
        error: String,
    },
}

/// Drift of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEntry {
    /// Resource id.
    pub id: ResourceId,
    /// External id recorded in state.
    pub external_id: String,
    /// What was found.
    #[serde(flatten)]
    pub status: DriftStatus,
}

/// Report of drift detection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Number of resources checked.
    pub checked: usize,
    /// Resources that drifted or could not be read.
    pub drifted: Vec<DriftEntry>,
    /// Remote attributes of readable, existing resources.
    #[serde(skip)]
    remote: BTreeMap<ResourceId, Attributes>,
}

impl DriftReport {
    /// Returns true if any resource drifted.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }

    /// Returns true if state matches the remote side.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }

    /// Folds the findings into a state document: changed entries take the
    /// remote attributes and missing ones are removed.
    fn fold_into(&self, document: &mut StateDocument) {
        for entry in &self.drifted {
            match entry.status {
                DriftStatus::Changed { .. } => {
                    if let (Some(recorded), Some(remote)) =
                        (document.resources.get_mut(&entry.id), self.remote.get(&entry.id))
                    {
                        recorded.attributes.clone_from(remote);
                        recorded.updated_at = Utc::now();
                    }
                }
                DriftStatus::Missing => {
                    document.resources.remove(&entry.id);
                }
                DriftStatus::Unreadable { .. } => {}
            }
        }
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_drift() {
            return write!(f, "No drift detected ({} resources checked)", self.checked);
        }

        writeln!(f, "Drift detected in {} of {} resources:", self.drifted.len(), self.checked)?;
        for entry in &self.drifted {
            match &entry.status {
                DriftStatus::Changed { changes } => {
                    writeln!(f, "  ~ {} ({})", entry.id, entry.external_id)?;
                    for change in changes {
                        let before = change
                            .before
                            .as_ref()
                            .map_or_else(|| String::from("(none)"), ToString::to_string);
                        writeln!(f, "      {}: {before} -> {}", change.attribute, change.after)?;
                    }
                }
                DriftStatus::Missing => {
                    writeln!(f, "  - {} ({}) no longer exists", entry.id, entry.external_id)?;
                }
                DriftStatus::Unreadable { error } => {
                    writeln!(f, "  ? {} could not be read: {error}", entry.id)?;
                }
            }
        }
        Ok(())
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler for a resolved document.
    #[must_use]
    pub fn new(
        config: &'a InfraConfig,
        variables: &'a VariableValues,
        registry: &'a ProviderRegistry,
        state: Arc<StateManager>,
    ) -> Self {
        Self {
            config,
            variables,
            registry,
            state,
            hasher: ConfigHasher::new(),
            holder: generate_holder_id(),
            refresh: config.engine.refresh,
            cancel: None,
        }
    }

    /// Overrides whether state is refreshed before planning.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sets the lock holder id.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Stops dispatching changes once the receiver observes `true`.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The state manager in use.
    #[must_use]
    pub const fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Hash of the document and its variable values.
    #[must_use]
    pub fn config_hash(&self) -> String {
        self.hasher.hash_config(self.config, self.variables)
    }

    /// Builds the desired graph.
    ///
    /// # Errors
    ///
    /// Returns a graph error for cycles, unresolved references or
    /// duplicate resources.
    pub fn build_graph(&self) -> Result<ResourceGraph> {
        GraphBuilder::new(self.variables).build(self.config)
    }

    /// Plans without changing anything. When refresh is enabled the plan
    /// is computed against state as the providers currently report it.
    ///
    /// # Errors
    ///
    /// Returns graph and planning errors.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.build_graph()?;
        let mut document = self.state.snapshot().await;

        if self.refresh {
            let drift = self.detect_drift(&document).await;
            if drift.has_drift() {
                info!("{} resources drifted; planning against remote values", drift.drifted.len());
            }
            drift.fold_into(&mut document);
        }

        Planner::new(self.registry).plan(&graph, &document, &self.config_hash())
    }

    /// Plans the deletion of every tracked resource without changing anything.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PlanError::PreventDestroy`] for protected resources.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let document = self.state.snapshot().await;
        Planner::new(self.registry).plan_destroy(&document, &self.config_hash())
    }

    /// Compares recorded attributes with what the providers report.
    pub async fn check_drift(&self) -> DriftReport {
        info!(
            "Checking for drift in {}/{}",
            self.config.project.name, self.config.project.environment
        );
        let document = self.state.snapshot().await;
        self.detect_drift(&document).await
    }

    /// Writes the remote attributes of drifted resources into state and
    /// drops entries whose instance no longer exists.
    ///
    /// # Errors
    ///
    /// Returns lock and state errors.
    pub async fn refresh(&self) -> Result<DriftReport> {
        self.locked("refresh", async {
            let drift = self.refresh_state().await?;
            if drift.has_drift() {
                self.record(HistoryOperation::Refresh, HistorySummary::default(), true, None, None)
                    .await?;
            }
            Ok(drift)
        })
        .await
    }

    /// Runs a full cycle: refresh, plan and apply.
    ///
    /// # Errors
    ///
    /// Returns build, lock and planning errors. Failures of individual
    /// resources are reported in the result, not as an error.
    pub async fn apply(&self) -> Result<ReconciliationResult> {
        self.run_apply(None).await
    }

    /// Applies a plan that was reviewed before the lock was taken.
    ///
    /// The plan is recomputed under the lock and nothing is executed unless
    /// it performs the same changes as `confirmed`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::StalePlan`] if the state or the remote side
    /// changed since `confirmed` was computed, and everything
    /// [`Reconciler::apply`] returns.
    pub async fn apply_confirmed(&self, confirmed: &Plan) -> Result<ReconciliationResult> {
        self.run_apply(Some(confirmed)).await
    }

    async fn run_apply(&self, confirmed: Option<&Plan>) -> Result<ReconciliationResult> {
        info!(
            "Starting reconciliation for {}/{}",
            self.config.project.name, self.config.project.environment
        );

        let graph = self.build_graph()?;
        let config_hash = self.config_hash();

        self.locked("apply", async {
            let drift = if self.refresh {
                Some(self.refresh_state().await?)
            } else {
                None
            };

            let document = self.state.snapshot().await;
            let plan = Planner::new(self.registry).plan(&graph, &document, &config_hash)?;
            if let Some(confirmed) = confirmed {
                ensure_unchanged(confirmed, &plan)?;
            }
            info!("Plan {}: {}", plan.fingerprint, plan.summary());

            let report = self.execute(&plan, &graph).await;
            if plan.has_changes() || !report.is_success() {
                self.record_report(HistoryOperation::Apply, &report, Some(&config_hash))
                    .await?;
            } else {
                info!("No changes required; infrastructure is converged");
            }

            Ok(ReconciliationResult { plan, drift, report })
        })
        .await
    }

    /// Deletes every tracked resource.
    ///
    /// # Errors
    ///
    /// Returns lock and planning errors.
    pub async fn destroy(&self) -> Result<ReconciliationResult> {
        self.run_destroy(None).await
    }

    /// Destroys only if the deletions planned under the lock match `confirmed`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::StalePlan`] on mismatch, and everything
    /// [`Reconciler::destroy`] returns.
    pub async fn destroy_confirmed(&self, confirmed: &Plan) -> Result<ReconciliationResult> {
        self.run_destroy(Some(confirmed)).await
    }

    async fn run_destroy(&self, confirmed: Option<&Plan>) -> Result<ReconciliationResult> {
        info!(
            "Destroying {}/{}",
            self.config.project.name, self.config.project.environment
        );

        let config_hash = self.config_hash();
        self.locked("destroy", async {
            let document = self.state.snapshot().await;
            let plan = Planner::new(self.registry).plan_destroy(&document, &config_hash)?;
            if let Some(confirmed) = confirmed {
                ensure_unchanged(confirmed, &plan)?;
            }

            let report = self.execute(&plan, &ResourceGraph::empty()).await;
            if plan.has_changes() {
                self.record_report(HistoryOperation::Destroy, &report, None).await?;
            }

            Ok(ReconciliationResult {
                plan,
                drift: None,
                report,
            })
        })
        .await
    }

    /// Resolves every output against recorded state.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::OutputUnavailable`] if an output refers to
    /// a resource or attribute that is not in state.
    pub async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        let graph = self.build_graph()?;
        let document = self.state.snapshot().await;
        let known: BTreeMap<ResourceId, Attributes> = document
            .resources
            .iter()
            .map(|(id, entry)| (id.clone(), entry.attributes.clone()))
            .collect();

        graph
            .outputs()
            .iter()
            .map(|(name, expr)| {
                let value = expr.resolve_from(&known).map_err(|missing| {
                    let reason = if known.contains_key(&missing.target) {
                        format!("{} has no attribute '{}'", missing.target, missing.attribute)
                    } else {
                        format!("{} is not applied", missing.target)
                    };
                    ReconcileError::OutputUnavailable {
                        name: name.clone(),
                        reason,
                    }
                })?;
                Ok((name.clone(), value))
            })
            .collect()
    }

    /// Stops tracking a resource without touching its remote instance.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::EntryNotFound`] if the resource is not in
    /// state, or a lock or backend error.
    pub async fn forget(&self, id: &ResourceId) -> Result<()> {
        self.locked("state rm", async {
            if self.state.get(id).await.is_none() {
                return Err(StateError::EntryNotFound { id: id.to_string() }.into());
            }
            self.state.delete(id).await?;
            info!("Removed {id} from state");
            Ok(())
        })
        .await
    }

    async fn execute(&self, plan: &Plan, graph: &ResourceGraph) -> ApplyReport {
        let mut executor =
            Executor::new(self.registry, Arc::clone(&self.state)).with_engine(&self.config.engine);
        if let Some(cancel) = &self.cancel {
            executor = executor.with_cancellation(cancel.clone());
        }
        executor.apply(plan, graph).await
    }

    /// Runs `work` while holding the state lock, releasing it afterwards
    /// whatever the outcome.
    async fn locked<T, F>(&self, operation: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let lock = self.state.store().acquire_lock(&self.holder, operation).await?;
        debug!("Acquired state lock {} for {operation}", lock.lock_id);

        // pick up whatever the previous lock holder committed
        let result = match self.state.reload().await {
            Ok(()) => work.await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.state.store().release_lock(&lock.lock_id).await {
            error!("Failed to release state lock {}: {e}", lock.lock_id);
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    async fn detect_drift(&self, document: &StateDocument) -> DriftReport {
        let retry = RetryPolicy::from(&self.config.engine.retry);
        let mut report = DriftReport {
            checked: document.resources.len(),
            ..DriftReport::default()
        };

        for entry in document.resources.values() {
            let status = match self.registry.get(entry.id.kind) {
                Err(e) => Some(DriftStatus::Unreadable { error: e.to_string() }),
                Ok(provider) => {
                    let label = format!("read {}", entry.id);
                    let provider = provider.as_ref();
                    let external_id = entry.external_id.as_str();
                    let read = retry
                        .run(&label, move || provider.read(external_id))
                        .await;
                    match read.result {
                        Ok(Some(remote)) => {
                            let changes = diff_remote(&entry.attributes, &remote);
                            report.remote.insert(entry.id.clone(), remote);
                            (!changes.is_empty()).then_some(DriftStatus::Changed { changes })
                        }
                        Ok(None) => Some(DriftStatus::Missing),
                        Err(e) => {
                            warn!("Cannot read {}: {e}", entry.id);
                            Some(DriftStatus::Unreadable { error: e.to_string() })
                        }
                    }
                }
            };

            if let Some(status) = status {
                debug!("Drift in {}: {:?}", entry.id, status);
                report.drifted.push(DriftEntry {
                    id: entry.id.clone(),
                    external_id: entry.external_id.clone(),
                    status,
                });
            }
        }

        report
    }

    /// Detects drift and persists it, one entry at a time.
    async fn refresh_state(&self) -> Result<DriftReport> {
        let document = self.state.snapshot().await;
        let drift = self.detect_drift(&document).await;

        for entry in &drift.drifted {
            match entry.status {
                DriftStatus::Changed { .. } => {
                    if let (Some(mut recorded), Some(remote)) =
                        (document.get(&entry.id).cloned(), drift.remote.get(&entry.id))
                    {
                        recorded.attributes.clone_from(remote);
                        recorded.updated_at = Utc::now();
                        self.state.put(recorded).await?;
                    }
                }
                DriftStatus::Missing => {
                    warn!("{} no longer exists remotely; removing it from state", entry.id);
                    self.state.delete(&entry.id).await?;
                }
                DriftStatus::Unreadable { .. } => {}
            }
        }

        if drift.has_drift() {
            info!("Refreshed state: {} resources drifted", drift.drifted.len());
        }
        Ok(drift)
    }

    async fn record_report(
        &self,
        operation: HistoryOperation,
        report: &ApplyReport,
        config_hash: Option<&str>,
    ) -> Result<()> {
        if let Some(reason) = &report.aborted {
            // the state no longer belongs to this run
            warn!("Not recording history: {reason}");
            return Ok(());
        }

        let success = report.is_success();
        self.record(
            operation,
            report.summary(),
            success,
            report.first_error(),
            config_hash.filter(|_| success),
        )
        .await
    }

    async fn record(
        &self,
        operation: HistoryOperation,
        summary: HistorySummary,
        success: bool,
        error: Option<String>,
        config_hash: Option<&str>,
    ) -> Result<()> {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.map_or_else(|| self.config_hash(), String::from),
            serial: 0,
            summary,
            success,
            error,
        };
        self.state.record(entry, config_hash).await
    }
}

/// Refuses to execute a plan that differs from the one the user approved.
fn ensure_unchanged(confirmed: &Plan, current: &Plan) -> Result<()> {
    if current.same_changes(confirmed) {
        return Ok(());
    }
    warn!(
        "Plan {} no longer matches the state; recomputed plan is {} ({})",
        confirmed.fingerprint,
        current.fingerprint,
        current.summary()
    );
    Err(ReconcileError::StalePlan {
        confirmed: confirmed.fingerprint.clone(),
        current: current.fingerprint.clone(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{CairnError, PlanError};
    use crate::executor::NodeState;
    use crate::planner::ChangeAction;
    use crate::provider::{Fault, Operation, SandboxRemote};
    use crate::state::{MemoryStateStore, StateStore};
    use serde_json::json;

    const SITE: &str = r#"
project:
  name: site
engine:
  retry:
    max_attempts: 2
    initial_backoff_ms: 1
    max_backoff_ms: 2
resources:
  - type: bucket
    name: site
    attributes:
      bucket_name: site-content
  - type: access_policy
    name: read
    attributes:
      bucket: "${bucket.site.id}"
      principal: "*"
outputs:
  bucket_domain:
    value: "${bucket.site.domain_name}"
  policy:
    value: "${access_policy.read.id}"
"#;

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    struct Fixture {
        config: InfraConfig,
        variables: VariableValues,
        remote: SandboxRemote,
        registry: ProviderRegistry,
        store: Arc<dyn StateStore>,
        state: Arc<StateManager>,
    }

    impl Fixture {
        async fn new(yaml: &str) -> Self {
            let remote = SandboxRemote::in_memory();
            let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
            let state = Arc::new(
                StateManager::open(Arc::clone(&store), "site", "dev")
                    .await
                    .unwrap(),
            );
            Self {
                config: ConfigParser::new().parse_yaml(yaml, None).unwrap(),
                variables: VariableValues::new(),
                registry: ProviderRegistry::sandbox(&remote),
                remote,
                store,
                state,
            }
        }

        fn reconciler(&self) -> Reconciler<'_> {
            Reconciler::new(&self.config, &self.variables, &self.registry, Arc::clone(&self.state))
                .with_holder("test")
        }
    }

    #[tokio::test]
    async fn test_apply_then_converged() {
        let fx = Fixture::new(SITE).await;
        let result = fx.reconciler().apply().await.unwrap();

        assert!(result.is_success(), "{}", result.report);
        assert_eq!(result.plan.summary().create, 2);
        assert!(result.drift.unwrap().is_converged());

        let plan = fx.reconciler().plan().await.unwrap();
        assert!(!plan.has_changes(), "{plan}");

        let doc = fx.state.snapshot().await;
        assert_eq!(doc.history.len(), 1);
        assert!(doc.history[0].success);
        assert_eq!(doc.config_hash, fx.reconciler().config_hash());
        assert!(!fx.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_plan_does_not_mutate() {
        let fx = Fixture::new(SITE).await;
        let plan = fx.reconciler().plan().await.unwrap();

        assert_eq!(plan.summary().create, 2);
        assert!(fx.remote.calls().await.is_empty());
        assert!(fx.store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_apply_records_failure() {
        let fx = Fixture::new(SITE).await;
        fx.remote
            .inject(&id("bucket.site"), Operation::Create, Fault::permanent("denied"))
            .await;

        let result = fx.reconciler().apply().await.unwrap();

        assert!(!result.is_success());
        assert_eq!(result.report.state_of(&id("access_policy.read")), Some(NodeState::Blocked));

        let doc = fx.state.snapshot().await;
        assert!(!doc.history[0].success);
        assert_eq!(doc.history[0].summary.failed, 1);
        assert!(doc.config_hash.is_empty());
        assert!(!fx.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_drift_detected_and_repaired() {
        let fx = Fixture::new(SITE).await;
        fx.reconciler().apply().await.unwrap();

        fx.remote
            .tamper(&id("access_policy.read"), "principal", json!("everyone"))
            .await
            .unwrap();

        let drift = fx.reconciler().check_drift().await;
        assert!(drift.has_drift());
        assert_eq!(drift.drifted[0].id, id("access_policy.read"));
        assert!(matches!(drift.drifted[0].status, DriftStatus::Changed { .. }));

        // the next apply converges the remote back
        let result = fx.reconciler().apply().await.unwrap();
        assert!(result.is_success());
        assert_eq!(
            result.plan.get(&id("access_policy.read")).unwrap().action,
            ChangeAction::Update
        );
        assert!(fx.reconciler().check_drift().await.is_converged());
    }

    #[tokio::test]
    async fn test_confirmed_plan_refused_after_remote_change() {
        let fx = Fixture::new(SITE).await;
        fx.reconciler().apply().await.unwrap();
        fx.remote
            .tamper(&id("access_policy.read"), "principal", json!("everyone"))
            .await
            .unwrap();

        let confirmed = fx.reconciler().plan().await.unwrap();
        assert_eq!(
            confirmed.get(&id("access_policy.read")).unwrap().action,
            ChangeAction::Update
        );

        // changes again between the prompt and the lock
        fx.remote.remove(&id("access_policy.read")).await.unwrap();
        let before = fx.remote.calls().await.len();

        let err = fx.reconciler().apply_confirmed(&confirmed).await.unwrap_err();

        assert!(matches!(
            err,
            CairnError::Reconcile(ReconcileError::StalePlan { .. })
        ));
        let calls = fx.remote.calls().await;
        assert!(calls[before..].iter().all(|c| c.operation == Operation::Read));
        assert!(fx.remote.object_for(&id("access_policy.read")).await.is_none());
        assert_eq!(fx.state.snapshot().await.history.len(), 1);
        assert!(!fx.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_confirmed_plan_applies_when_unchanged() {
        let fx = Fixture::new(SITE).await;
        fx.reconciler().apply().await.unwrap();
        fx.remote
            .tamper(&id("access_policy.read"), "principal", json!("everyone"))
            .await
            .unwrap();

        let confirmed = fx.reconciler().plan().await.unwrap();
        let result = fx.reconciler().apply_confirmed(&confirmed).await.unwrap();

        assert!(result.is_success(), "{}", result.report);
        assert!(result.plan.same_changes(&confirmed));
        assert_eq!(result.report.summary().updated, 1);
        assert!(fx.reconciler().check_drift().await.is_converged());
    }

    #[tokio::test]
    async fn test_confirmed_destroy_refused_after_state_change() {
        let fx = Fixture::new(SITE).await;
        fx.reconciler().apply().await.unwrap();
        let confirmed = fx.reconciler().plan_destroy().await.unwrap();

        fx.reconciler().forget(&id("access_policy.read")).await.unwrap();
        let before = fx.remote.calls().await.len();

        let err = fx.reconciler().destroy_confirmed(&confirmed).await.unwrap_err();

        assert!(matches!(
            err,
            CairnError::Reconcile(ReconcileError::StalePlan { .. })
        ));
        assert_eq!(fx.remote.calls().await.len(), before);
        assert_eq!(fx.remote.objects().await.len(), 2);
        assert!(!fx.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_sees_state_committed_by_previous_holder() {
        let fx = Fixture::new(SITE).await;
        let other = Arc::new(
            StateManager::open(Arc::clone(&fx.store), "site", "dev")
                .await
                .unwrap(),
        );

        fx.reconciler().apply().await.unwrap();

        // opened before the first apply, so its cached state is empty
        let reconciler =
            Reconciler::new(&fx.config, &fx.variables, &fx.registry, Arc::clone(&other))
                .with_holder("other");
        let result = reconciler.apply().await.unwrap();

        assert!(result.is_success(), "{}", result.report);
        assert!(!result.plan.has_changes(), "{}", result.plan);
        assert_eq!(other.serial().await, fx.state.serial().await);
        assert_eq!(fx.remote.objects().await.len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_drops_missing_resource() {
        let fx = Fixture::new(SITE).await;
        fx.reconciler().apply().await.unwrap();
        fx.remote.remove(&id("access_policy.read")).await.unwrap();

        let drift = fx.reconciler().refresh().await.unwrap();

        assert_eq!(drift.drifted.len(), 1);
        assert_eq!(drift.drifted[0].status, DriftStatus::Missing);
        assert!(fx.state.get(&id("access_policy.read")).await.is_none());

        let plan = fx.reconciler().with_refresh(false).plan().await.unwrap();
        assert_eq!(
            plan.get(&id("access_policy.read")).unwrap().action,
            ChangeAction::Create
        );
    }

    #[tokio::test]
    async fn test_outputs() {
        let fx = Fixture::new(SITE).await;

        let err = fx.reconciler().outputs().await.unwrap_err();
        assert!(matches!(
            err,
            CairnError::Reconcile(ReconcileError::OutputUnavailable { .. })
        ));

        fx.reconciler().apply().await.unwrap();
        let outputs = fx.reconciler().outputs().await.unwrap();
        assert_eq!(outputs["bucket_domain"], json!("site-content.s3.sandbox.local"));
        assert!(outputs["policy"].as_str().unwrap().starts_with("pol-"));
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let fx = Fixture::new(SITE).await;
        fx.reconciler().apply().await.unwrap();

        let result = fx.reconciler().destroy().await.unwrap();

        assert!(result.is_success(), "{}", result.report);
        assert_eq!(result.report.summary().deleted, 2);
        assert!(fx.state.snapshot().await.is_empty());
        assert!(fx.remote.objects().await.is_empty());
    }

    #[tokio::test]
    async fn test_prevent_destroy_aborts_before_any_call() {
        let protected = SITE.replace(
            "    name: site\n    attributes:",
            "    name: site\n    lifecycle:\n      prevent_destroy: true\n    attributes:",
        );
        let fx = Fixture::new(&protected).await;
        fx.reconciler().apply().await.unwrap();
        let calls = fx.remote.calls().await.len();

        let err = fx.reconciler().destroy().await.unwrap_err();

        assert!(matches!(err, CairnError::Plan(PlanError::PreventDestroy { .. })));
        assert_eq!(fx.remote.calls().await.len(), calls);
        assert!(!fx.store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_state_refuses_apply() {
        let fx = Fixture::new(SITE).await;
        let lock = fx.store.acquire_lock("someone-else", "apply").await.unwrap();

        let err = fx.reconciler().apply().await.unwrap_err();
        assert!(matches!(err, CairnError::State(StateError::LockedByOther { .. })));
        assert!(fx.remote.calls().await.is_empty());

        fx.store.release_lock(&lock.lock_id).await.unwrap();
        assert!(fx.reconciler().apply().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_forget_keeps_remote_instance() {
        let fx = Fixture::new(SITE).await;
        fx.reconciler().apply().await.unwrap();

        fx.reconciler().forget(&id("access_policy.read")).await.unwrap();

        assert!(fx.state.get(&id("access_policy.read")).await.is_none());
        assert!(fx.remote.object_for(&id("access_policy.read")).await.is_some());
        assert_eq!(fx.reconciler().plan().await.unwrap().summary().create, 1);

        let err = fx.reconciler().forget(&id("access_policy.read")).await.unwrap_err();
        assert!(matches!(err, CairnError::State(StateError::EntryNotFound { .. })));
        assert!(!fx.store.is_locked().await.unwrap());
    }
}
