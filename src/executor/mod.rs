//! Plan executor.
//!
//! Executes a plan's changes concurrently while honouring its ordering:
//! a change is dispatched only once every change in its `after` set has
//! been applied, and at most `concurrency` changes are in flight. A failed
//! change blocks its transitive dependents but not unrelated branches.
//! Each resource's state entry is written as soon as its provider call
//! succeeds, so an interrupted run leaves state matching reality.

mod report;
mod task;

pub use report::{ApplyReport, Event, EventKind, NodeReport, NodeState, Timeline};

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::graph::ResourceGraph;
use crate::planner::{ChangeAction, Plan, ResourceChange};
use crate::provider::{ProviderRegistry, RetryPolicy};
use crate::resource::{Attributes, ResourceId};
use crate::state::{StateDocument, StateManager};

use task::{Failure, Job, Outcome, TaskContext};

/// Default number of provider calls in flight.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Applies plans through the provider registry.
#[derive(Debug)]
pub struct Executor<'a> {
    registry: &'a ProviderRegistry,
    state: Arc<StateManager>,
    concurrency: usize,
    retry: RetryPolicy,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> Executor<'a> {
    /// Creates an executor writing to `state`.
    #[must_use]
    pub fn new(registry: &'a ProviderRegistry, state: Arc<StateManager>) -> Self {
        Self {
            registry,
            state,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            cancel: None,
        }
    }

    /// Applies concurrency and retry settings from the engine config.
    #[must_use]
    pub fn with_engine(self, engine: &EngineConfig) -> Self {
        self.with_concurrency(engine.concurrency)
            .with_retry(RetryPolicy::from(&engine.retry))
    }

    /// Sets the maximum number of changes in flight (at least one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the retry policy for provider calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stops dispatching new changes once the receiver observes `true`.
    /// Changes already in flight run to completion.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Executes a plan against the graph it was built from.
    ///
    /// Never fails as a whole: provider errors are attached to their node,
    /// and a state write failure stops dispatch and is reported in
    /// [`ApplyReport::aborted`].
    pub async fn apply(&self, plan: &Plan, graph: &ResourceGraph) -> ApplyReport {
        let started_at = Utc::now();
        info!(
            "Executing plan {} ({} changes, concurrency {})",
            plan.fingerprint,
            plan.summary().total_changes(),
            self.concurrency
        );

        let recorded = self.state.snapshot().await;
        let mut known: BTreeMap<ResourceId, Attributes> = recorded
            .resources
            .iter()
            .map(|(id, entry)| (id.clone(), entry.attributes.clone()))
            .collect();

        let ctx = Arc::new(TaskContext {
            state: Arc::clone(&self.state),
            retry: self.retry.clone(),
            timeline: Timeline::default(),
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut progress = Progress::new(&plan.changes);
        let mut running: JoinSet<Outcome> = JoinSet::new();

        // keeps the fallback channel open when no cancellation was configured
        let (_idle, fallback) = watch::channel(false);
        let mut cancel = self.cancel.clone().unwrap_or(fallback);
        let mut watching = true;
        let mut cancelled = *cancel.borrow();
        let mut aborted: Option<String> = None;

        loop {
            if !cancelled && aborted.is_none() {
                while let Some(position) = progress.next_ready() {
                    if *cancel.borrow() {
                        cancelled = true;
                        break;
                    }

                    let change = &plan.changes[position];
                    if change.action == ChangeAction::NoOp {
                        progress.take(position);
                        progress.applied(position, 0);
                        ctx.timeline.record(&change.id, EventKind::Applied).await;
                        continue;
                    }

                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };
                    progress.take(position);

                    match self.prepare(position, change, graph, &known, &recorded) {
                        Ok(job) => {
                            progress.start(position);
                            running.spawn(task::run(Arc::clone(&ctx), job, permit));
                        }
                        Err(message) => {
                            drop(permit);
                            self.fail(&mut progress, &ctx.timeline, position, 0, message).await;
                        }
                    }
                }
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                joined = running.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => {
                            if let Some(fatal) = self.finish(&mut progress, &ctx.timeline, &mut known, plan, outcome).await {
                                aborted.get_or_insert(fatal);
                            }
                        }
                        Some(Err(e)) => {
                            error!("Executor task failed: {e}");
                            aborted.get_or_insert_with(|| format!("executor task failed: {e}"));
                        }
                        None => {}
                    }
                }
                changed = cancel.changed(), if watching => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            warn!("Cancellation requested; waiting for {} in-flight changes", running.len());
                            cancelled = true;
                        }
                        Ok(()) => {}
                        Err(_) => watching = false,
                    }
                }
            }
        }

        let reason = if cancelled {
            String::from("cancelled")
        } else if let Some(fatal) = &aborted {
            format!("apply aborted: {fatal}")
        } else {
            String::from("not dispatched")
        };
        for position in progress.abandon(&reason) {
            let id = &plan.changes[position].id;
            let kind = match progress.reports[position].state {
                NodeState::Failed => EventKind::Failed {
                    error: reason.clone(),
                },
                _ => EventKind::Blocked {
                    reason: reason.clone(),
                },
            };
            ctx.timeline.record(id, kind).await;
        }

        let report = ApplyReport {
            started_at,
            finished_at: Utc::now(),
            nodes: progress.reports,
            events: ctx.timeline.events().await,
            cancelled,
            aborted,
        };

        if report.is_success() {
            info!("Apply complete: {report}");
        } else {
            warn!("Apply finished with problems: {report}");
        }
        report
    }

    /// Resolves a change's inputs now that its predecessors are applied.
    fn prepare(
        &self,
        position: usize,
        change: &ResourceChange,
        graph: &ResourceGraph,
        known: &BTreeMap<ResourceId, Attributes>,
        recorded: &StateDocument,
    ) -> Result<Job, String> {
        let provider = self.registry.get(change.id.kind).map_err(|e| e.to_string())?;
        let entry = recorded.get(&change.id);

        let (desired, dependencies, lifecycle) = if change.action == ChangeAction::Delete {
            (
                Attributes::new(),
                entry.map(|e| e.dependencies.clone()).unwrap_or_default(),
                entry.map(|e| e.lifecycle.clone()).unwrap_or_default(),
            )
        } else {
            let node = graph
                .get(&change.id)
                .ok_or_else(|| format!("{} is not in the resource graph", change.id))?;
            let mut desired = node
                .resolve_attributes(known)
                .map_err(|missing| format!("cannot resolve {missing}"))?;

            // ignored attributes keep their recorded value on update
            if change.action == ChangeAction::Update
                && let Some(entry) = entry
            {
                for name in &node.lifecycle.ignore_changes {
                    if let Some(value) = entry.attributes.get(name) {
                        desired.insert(name.clone(), value.clone());
                    }
                }
            }

            (desired, node.dependencies.clone(), node.lifecycle.clone())
        };

        Ok(Job {
            position,
            change: change.clone(),
            provider,
            desired,
            dependencies,
            lifecycle,
            created_at: entry.map(|e| e.created_at),
        })
    }

    /// Records a finished task. Returns the fatal error, if any.
    async fn finish(
        &self,
        progress: &mut Progress,
        timeline: &Timeline,
        known: &mut BTreeMap<ResourceId, Attributes>,
        plan: &Plan,
        outcome: Outcome,
    ) -> Option<String> {
        let position = outcome.position;
        let change = &plan.changes[position];

        match outcome.result {
            Ok(attributes) => {
                match attributes {
                    Some(attributes) => {
                        known.insert(change.id.clone(), attributes);
                    }
                    None => {
                        known.remove(&change.id);
                    }
                }
                progress.applied(position, outcome.attempts);
                timeline.record(&change.id, EventKind::Applied).await;
                debug!("{} {} applied", change.action, change.id);
                None
            }
            Err(Failure::Provider(e)) => {
                self.fail(progress, timeline, position, outcome.attempts, e.to_string())
                    .await;
                None
            }
            Err(Failure::State(e)) => {
                error!("State write for {} failed, stopping: {e}", change.id);
                let message = e.to_string();
                self.fail(progress, timeline, position, outcome.attempts, message.clone())
                    .await;
                Some(message)
            }
        }
    }

    async fn fail(
        &self,
        progress: &mut Progress,
        timeline: &Timeline,
        position: usize,
        attempts: u32,
        message: String,
    ) {
        let id = progress.reports[position].id.clone();
        error!("{} of {id} failed: {message}", progress.reports[position].action);
        timeline
            .record(&id, EventKind::Failed {
                error: message.clone(),
            })
            .await;

        let reason = format!("dependency {id} failed");
        for blocked in progress.failed(position, attempts, message) {
            let blocked_id = &progress.reports[blocked].id;
            warn!("{blocked_id} blocked: {reason}");
            timeline
                .record(blocked_id, EventKind::Blocked {
                    reason: reason.clone(),
                })
                .await;
        }
    }
}

/// Dispatch bookkeeping, indexed by plan position.
#[derive(Debug)]
struct Progress {
    reports: Vec<NodeReport>,
    /// Unapplied predecessors per change.
    waiting: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    /// Changes whose predecessors are all applied, in plan order.
    ready: BTreeSet<usize>,
}

impl Progress {
    fn new(changes: &[ResourceChange]) -> Self {
        let index: BTreeMap<&ResourceId, usize> =
            changes.iter().enumerate().map(|(i, c)| (&c.id, i)).collect();

        let mut waiting = vec![0; changes.len()];
        let mut dependents = vec![Vec::new(); changes.len()];
        for (position, change) in changes.iter().enumerate() {
            for predecessor in change.after.iter().filter_map(|p| index.get(p)) {
                waiting[position] += 1;
                dependents[*predecessor].push(position);
            }
        }

        let ready = (0..changes.len()).filter(|p| waiting[*p] == 0).collect();
        let reports = changes
            .iter()
            .map(|c| NodeReport {
                id: c.id.clone(),
                action: c.action,
                state: NodeState::Pending,
                attempts: 0,
                error: None,
            })
            .collect();

        Self {
            reports,
            waiting,
            dependents,
            ready,
        }
    }

    fn next_ready(&self) -> Option<usize> {
        self.ready.first().copied()
    }

    fn take(&mut self, position: usize) {
        self.ready.remove(&position);
    }

    fn start(&mut self, position: usize) {
        self.reports[position].state = NodeState::InProgress;
    }

    fn applied(&mut self, position: usize, attempts: u32) {
        let report = &mut self.reports[position];
        report.state = NodeState::Applied;
        report.attempts = attempts;

        for dependent in self.dependents[position].clone() {
            self.waiting[dependent] -= 1;
            if self.waiting[dependent] == 0 && self.reports[dependent].state == NodeState::Pending {
                self.ready.insert(dependent);
            }
        }
    }

    /// Marks a change failed and blocks its transitive dependents.
    /// Returns the positions newly blocked.
    fn failed(&mut self, position: usize, attempts: u32, message: String) -> Vec<usize> {
        let report = &mut self.reports[position];
        report.state = NodeState::Failed;
        report.attempts = attempts;
        report.error = Some(message);

        let reason = format!("dependency {} failed", report.id);
        let mut blocked = Vec::new();
        let mut queue = self.dependents[position].clone();

        while let Some(next) = queue.pop() {
            if self.reports[next].state != NodeState::Pending {
                continue;
            }
            self.reports[next].state = NodeState::Blocked;
            self.reports[next].error = Some(reason.clone());
            self.ready.remove(&next);
            queue.extend(self.dependents[next].iter().copied());
            blocked.push(next);
        }

        blocked.sort_unstable();
        blocked
    }

    /// Settles everything still open when the run stops. Pending changes
    /// become blocked; changes whose task vanished become failed.
    fn abandon(&mut self, reason: &str) -> Vec<usize> {
        let mut settled = Vec::new();
        for (position, report) in self.reports.iter_mut().enumerate() {
            match report.state {
                NodeState::Pending => report.state = NodeState::Blocked,
                NodeState::InProgress => report.state = NodeState::Failed,
                _ => continue,
            }
            report.error = Some(reason.to_string());
            settled.push(position);
        }
        self.ready.clear();
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, VariableValues};
    use crate::graph::GraphBuilder;
    use crate::planner::Planner;
    use crate::provider::{
        Created, Fault, MockProvider, Operation, ResourceSchema, SandboxRemote,
    };
    use crate::resource::ResourceKind;
    use crate::state::{MemoryStateStore, StateEntry, StateStore};
    use serde_json::json;
    use std::time::Duration;

    const SITE: &str = r#"
project:
  name: site
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
"#;

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    fn buckets(names: &[&str]) -> String {
        if names.is_empty() {
            return String::from("project:\n  name: site\nresources: []\n");
        }
        let mut yaml = String::from("project:\n  name: site\nresources:\n");
        for name in names {
            yaml.push_str(&format!(
                "  - type: bucket\n    name: {name}\n    attributes:\n      bucket_name: {name}-bucket\n"
            ));
        }
        yaml
    }

    struct Fixture {
        remote: SandboxRemote,
        registry: ProviderRegistry,
        store: Arc<dyn StateStore>,
        state: Arc<StateManager>,
    }

    impl Fixture {
        async fn new(remote: SandboxRemote) -> Self {
            let registry = ProviderRegistry::sandbox(&remote);
            Self::with_registry(remote, registry).await
        }

        async fn with_registry(remote: SandboxRemote, registry: ProviderRegistry) -> Self {
            let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
            let state = Arc::new(
                StateManager::open(Arc::clone(&store), "site", "dev")
                    .await
                    .unwrap(),
            );
            Self {
                remote,
                registry,
                store,
                state,
            }
        }

        async fn plan(&self, yaml: &str) -> (Plan, ResourceGraph) {
            let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
            let graph = GraphBuilder::new(&VariableValues::new()).build(&config).unwrap();
            let snapshot = self.state.snapshot().await;
            let plan = Planner::new(&self.registry)
                .plan(&graph, &snapshot, "h")
                .unwrap();
            (plan, graph)
        }

        fn executor(&self) -> Executor<'_> {
            Executor::new(&self.registry, Arc::clone(&self.state)).with_retry(fast_retry(3))
        }

        async fn apply(&self, yaml: &str) -> ApplyReport {
            let (plan, graph) = self.plan(yaml).await;
            self.executor().apply(&plan, &graph).await
        }

        async fn calls_for(&self, resource: &str) -> Vec<Operation> {
            let resource = id(resource);
            self.remote
                .calls()
                .await
                .into_iter()
                .filter(|c| c.resource == resource)
                .map(|c| c.operation)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_creates_dependencies_first_and_records_state() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        let report = fx.apply(SITE).await;

        assert!(report.is_success(), "{report}");
        assert_eq!(report.summary().created, 2);

        let calls = fx.remote.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].resource, id("bucket.site"));
        assert_eq!(calls[1].resource, id("access_policy.read"));

        let policy = fx.state.get(&id("access_policy.read")).await.unwrap();
        assert_eq!(policy.attributes["bucket"], json!("site-content"));
        assert!(policy.dependencies.contains(&id("bucket.site")));
        assert!(policy.external_id.starts_with("pol-"));

        let persisted = fx.store.load().await.unwrap().unwrap();
        assert_eq!(persisted.resources.len(), 2);
    }

    #[tokio::test]
    async fn test_second_apply_is_noop() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        assert!(fx.apply(SITE).await.is_success());
        let serial = fx.state.serial().await;

        let (plan, graph) = fx.plan(SITE).await;
        assert!(!plan.has_changes(), "{plan}");

        let report = fx.executor().apply(&plan, &graph).await;
        assert!(report.is_success());
        assert_eq!(report.count(NodeState::Applied), 2);
        assert_eq!(fx.remote.calls().await.len(), 2);
        assert_eq!(fx.state.serial().await, serial);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        fx.remote
            .inject(&id("bucket.site"), Operation::Create, Fault::permanent("access denied"))
            .await;

        let report = fx.apply(SITE).await;

        assert_eq!(report.state_of(&id("bucket.site")), Some(NodeState::Failed));
        assert_eq!(report.state_of(&id("access_policy.read")), Some(NodeState::Blocked));
        assert!(report.first_error().unwrap().contains("access denied"));
        assert!(fx.calls_for("access_policy.read").await.is_empty());
        assert!(fx.state.snapshot().await.is_empty());

        let blocked = report.get(&id("access_policy.read")).unwrap();
        assert_eq!(blocked.error.as_deref(), Some("dependency bucket.site failed"));
    }

    #[tokio::test]
    async fn test_failure_blocks_whole_chain() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        fx.remote
            .inject(&id("bucket.site"), Operation::Create, Fault::permanent("access denied"))
            .await;

        let report = fx
            .apply(
                r#"
project:
  name: site
resources:
  - type: bucket
    name: site
    attributes:
      bucket_name: site-content
  - type: cdn_distribution
    name: site
    attributes:
      origin_domain: "${bucket.site.regional_domain_name}"
  - type: dns_record
    name: www
    attributes:
      zone: example.com
      name: www
      type: CNAME
      target: "${cdn_distribution.site.domain_name}"
  - type: certificate
    name: site
    attributes:
      domain_name: example.com
"#,
            )
            .await;

        assert_eq!(report.state_of(&id("bucket.site")), Some(NodeState::Failed));
        for blocked in ["cdn_distribution.site", "dns_record.www"] {
            let node = report.get(&id(blocked)).unwrap();
            assert_eq!(node.state, NodeState::Blocked, "{blocked}");
            assert_eq!(node.error.as_deref(), Some("dependency bucket.site failed"));
            assert!(fx.calls_for(blocked).await.is_empty());
        }
        assert_eq!(report.state_of(&id("certificate.site")), Some(NodeState::Applied));
        assert!(fx.state.get(&id("certificate.site")).await.is_some());
        assert_eq!(report.summary().blocked, 2);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_unrelated_branches() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        fx.remote
            .inject(&id("bucket.a"), Operation::Create, Fault::permanent("quota exceeded"))
            .await;

        let report = fx.apply(&buckets(&["a", "b", "c"])).await;

        assert_eq!(report.count(NodeState::Failed), 1);
        assert_eq!(report.count(NodeState::Applied), 2);
        assert!(fx.state.get(&id("bucket.b")).await.is_some());
        assert!(fx.state.get(&id("bucket.a")).await.is_none());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        fx.remote
            .inject(&id("bucket.site"), Operation::Create, Fault::transient("throttled", 2))
            .await;

        let report = fx.apply(SITE).await;

        assert!(report.is_success(), "{report}");
        assert_eq!(report.get(&id("bucket.site")).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        fx.remote
            .inject(&id("bucket.site"), Operation::Create, Fault::always_transient("throttled"))
            .await;

        let report = fx.apply(SITE).await;

        let bucket = report.get(&id("bucket.site")).unwrap();
        assert_eq!(bucket.state, NodeState::Failed);
        assert_eq!(bucket.attempts, 3);
        assert_eq!(fx.calls_for("bucket.site").await.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let remote = SandboxRemote::in_memory().with_latency(Duration::from_millis(20));
        let fx = Fixture::new(remote).await;
        let (plan, graph) = fx.plan(&buckets(&["a", "b", "c", "d", "e", "f"])).await;

        let report = fx.executor().with_concurrency(2).apply(&plan, &graph).await;

        assert!(report.is_success());
        assert!(fx.remote.peak_concurrency() <= 2);
        assert!(fx.remote.peak_concurrency() >= 1);
    }

    #[tokio::test]
    async fn test_replace_create_before_destroy() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        let yaml = r#"
project:
  name: site
resources:
  - type: certificate
    name: site
    lifecycle:
      create_before_destroy: true
    attributes:
      domain_name: example.com
"#;
        assert!(fx.apply(yaml).await.is_success());
        let old = fx.state.get(&id("certificate.site")).await.unwrap();

        let changed = yaml.replace("example.com", "example.org");
        let (plan, graph) = fx.plan(&changed).await;
        assert_eq!(plan.get(&id("certificate.site")).unwrap().action, ChangeAction::Replace);

        let report = fx.executor().apply(&plan, &graph).await;
        assert!(report.is_success(), "{report}");
        assert_eq!(
            fx.calls_for("certificate.site").await,
            vec![Operation::Create, Operation::Create, Operation::Delete]
        );

        let new = fx.state.get(&id("certificate.site")).await.unwrap();
        assert_ne!(new.external_id, old.external_id);
        assert_eq!(new.attributes["domain_name"], json!("example.org"));
        assert_eq!(fx.remote.objects().await.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_delete_first() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        let yaml = buckets(&["a"]);
        assert!(fx.apply(&yaml).await.is_success());

        let report = fx.apply(&yaml.replace("a-bucket", "a-renamed")).await;

        assert!(report.is_success(), "{report}");
        assert_eq!(report.summary().replaced, 1);
        assert_eq!(
            fx.calls_for("bucket.a").await,
            vec![Operation::Create, Operation::Delete, Operation::Create]
        );

        // the delete and the create each wrote state
        let events: Vec<&EventKind> = report.events_for(&id("bucket.a")).map(|e| &e.kind).collect();
        assert_eq!(
            events.iter().filter(|k| ***k == EventKind::StateWritten).count(),
            2
        );
        assert_eq!(fx.remote.objects().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_old_delete_keeps_new_instance() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        let yaml = r#"
project:
  name: site
resources:
  - type: certificate
    name: site
    lifecycle:
      create_before_destroy: true
    attributes:
      domain_name: example.com
"#;
        assert!(fx.apply(yaml).await.is_success());
        fx.remote
            .inject(&id("certificate.site"), Operation::Delete, Fault::permanent("in use"))
            .await;

        let report = fx.apply(&yaml.replace("example.com", "example.org")).await;

        assert_eq!(report.state_of(&id("certificate.site")), Some(NodeState::Failed));
        let entry = fx.state.get(&id("certificate.site")).await.unwrap();
        assert_eq!(entry.attributes["domain_name"], json!("example.org"));
        assert_eq!(fx.remote.objects().await.len(), 2);
    }

    #[tokio::test]
    async fn test_orphan_deleted_after_dependents() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        assert!(fx.apply(SITE).await.is_success());

        let report = fx.apply(&buckets(&[])).await;

        assert!(report.is_success(), "{report}");
        assert_eq!(report.summary().deleted, 2);
        let deletes: Vec<ResourceId> = fx
            .remote
            .calls()
            .await
            .into_iter()
            .filter(|c| c.operation == Operation::Delete)
            .map(|c| c.resource)
            .collect();
        assert_eq!(deletes, vec![id("access_policy.read"), id("bucket.site")]);
        assert!(fx.state.snapshot().await.is_empty());
        assert!(fx.remote.objects().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_apply_blocks_everything() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        let (plan, graph) = fx.plan(SITE).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = fx.executor().with_cancellation(rx).apply(&plan, &graph).await;

        assert!(report.cancelled);
        assert_eq!(report.count(NodeState::Blocked), 2);
        assert!(fx.remote.calls().await.is_empty());
        assert_eq!(
            report.get(&id("bucket.site")).unwrap().error.as_deref(),
            Some("cancelled")
        );
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_finish() {
        let remote = SandboxRemote::in_memory().with_latency(Duration::from_millis(100));
        let fx = Fixture::new(remote).await;
        let (plan, graph) = fx.plan(&buckets(&["a", "b", "c"])).await;
        let (tx, rx) = watch::channel(false);

        let executor = fx.executor().with_concurrency(1).with_cancellation(rx);
        let (report, ()) = tokio::join!(executor.apply(&plan, &graph), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
        });

        assert!(report.cancelled);
        assert_eq!(report.count(NodeState::Applied), 1);
        assert_eq!(report.count(NodeState::Blocked), 2);
        assert_eq!(fx.state.snapshot().await.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_state_conflict_stops_dispatch() {
        let fx = Fixture::new(SandboxRemote::in_memory()).await;
        let (plan, graph) = fx.plan(&buckets(&["a", "b"])).await;

        // another writer creates the state after this one opened it
        let other = StateManager::open(Arc::clone(&fx.store), "site", "dev")
            .await
            .unwrap();
        other
            .put(StateEntry::new(id("dns_record.www"), "rec-1", Attributes::new()))
            .await
            .unwrap();

        let report = fx.executor().with_concurrency(1).apply(&plan, &graph).await;

        assert!(report.aborted.is_some());
        assert_eq!(report.state_of(&id("bucket.a")), Some(NodeState::Failed));
        assert_eq!(report.state_of(&id("bucket.b")), Some(NodeState::Blocked));
        assert!(fx.calls_for("bucket.b").await.is_empty());

        // the other writer's state is untouched
        let persisted = fx.store.load().await.unwrap().unwrap();
        assert_eq!(persisted.serial, 1);
    }

    #[tokio::test]
    async fn test_missing_provider_fails_node() {
        let mut mock = MockProvider::new();
        mock.expect_kind().return_const(ResourceKind::Bucket);
        mock.expect_schema().return_const(ResourceSchema::new());
        mock.expect_create().times(1).returning(|resource, desired| {
            let mut attributes = desired.clone();
            attributes.insert(String::from("id"), json!(format!("mock-{}", resource.name)));
            Ok(Created {
                external_id: String::from("mock-1"),
                attributes,
            })
        });

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(mock));
        let fx = Fixture::with_registry(SandboxRemote::in_memory(), registry).await;

        let report = fx.apply(SITE).await;

        assert_eq!(report.state_of(&id("bucket.site")), Some(NodeState::Applied));
        let policy = report.get(&id("access_policy.read")).unwrap();
        assert_eq!(policy.state, NodeState::Failed);
        assert!(policy.error.as_deref().unwrap().contains("no provider"));
        assert_eq!(
            fx.state.get(&id("bucket.site")).await.unwrap().attributes["id"],
            json!("mock-site")
        );
    }
}
