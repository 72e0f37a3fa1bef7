//! Plan construction.
//!
//! Walks the desired graph in dependency order, resolving each node's
//! attribute expressions against what is known at plan time, and diffs
//! them against the recorded state. Values that depend on a resource being
//! created or replaced are "known after apply" and always count as a
//! change.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::config::ConfigHasher;
use crate::error::{GraphError, PlanError, Result};
use crate::graph::{Reference, ResourceGraph, ResourceNode};
use crate::provider::{ProviderRegistry, ResourceSchema};
use crate::resource::{Attributes, ResourceId};
use crate::state::StateDocument;

use super::diff::{PlannedValue, creation_changes, diff_attributes};
use super::plan::{ChangeAction, Plan, PlanMode, ResourceChange};

/// Length of the displayed plan fingerprint.
const FINGERPRINT_LEN: usize = 12;

/// What is known about already-planned nodes.
#[derive(Debug, Default)]
struct Knowledge {
    /// Attribute values available at plan time.
    known: BTreeMap<ResourceId, Attributes>,
    /// Nodes whose every attribute is unknown (create, replace).
    pending: BTreeSet<ResourceId>,
    /// Individual unknown attributes of updated nodes.
    unknown: BTreeMap<ResourceId, BTreeSet<String>>,
}

impl Knowledge {
    fn is_unknown(&self, reference: &Reference) -> bool {
        self.pending.contains(&reference.target)
            || self
                .unknown
                .get(&reference.target)
                .is_some_and(|attrs| attrs.contains(&reference.attribute))
    }
}

/// Produces plans from a desired graph and recorded state.
#[derive(Debug)]
pub struct Planner<'a> {
    registry: &'a ProviderRegistry,
    hasher: ConfigHasher,
}

impl<'a> Planner<'a> {
    /// Creates a planner that classifies changes with the registry's schemas.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            hasher: ConfigHasher::new(),
        }
    }

    /// Plans the changes that converge `state` towards `graph`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::PreventDestroy`] if a protected resource would
    /// be deleted or replaced, and [`PlanError::UnresolvedValue`] if a
    /// reference names an attribute an unchanged resource does not have.
    pub fn plan(&self, graph: &ResourceGraph, state: &StateDocument, config_hash: &str) -> Result<Plan> {
        let empty = ResourceSchema::default();
        let mut knowledge = Knowledge::default();
        let mut changes = Vec::new();

        for node in graph.nodes() {
            let schema = self.registry.schema(node.id.kind).unwrap_or_else(|| {
                warn!("No provider for {}; planning without attribute metadata", node.id.kind);
                &empty
            });

            let desired = plan_values(node, &knowledge)?;
            let entry = state.get(&node.id);

            let (action, attribute_changes) = match entry {
                None => (ChangeAction::Create, creation_changes(&desired)),
                Some(entry) => {
                    let diff = diff_attributes(
                        &desired,
                        &entry.attributes,
                        schema,
                        &node.lifecycle.ignore_changes,
                    );
                    let action = if diff.is_empty() {
                        ChangeAction::NoOp
                    } else if diff.iter().any(|c| c.forces_replacement) {
                        ChangeAction::Replace
                    } else {
                        ChangeAction::Update
                    };
                    (action, diff)
                }
            };

            if action == ChangeAction::Replace && node.lifecycle.prevent_destroy {
                return Err(PlanError::PreventDestroy {
                    resource: node.id.to_string(),
                    action: action.to_string(),
                }
                .into());
            }

            match (action, entry) {
                (ChangeAction::NoOp, Some(entry)) => {
                    knowledge.known.insert(node.id.clone(), entry.attributes.clone());
                }
                (ChangeAction::Update, Some(entry)) => {
                    let mut attrs = entry.attributes.clone();
                    let mut unknown = BTreeSet::new();
                    for change in &attribute_changes {
                        match &change.after {
                            PlannedValue::Known(value) => {
                                attrs.insert(change.attribute.clone(), value.clone());
                            }
                            PlannedValue::KnownAfterApply => {
                                unknown.insert(change.attribute.clone());
                            }
                            PlannedValue::Removed => {
                                attrs.remove(&change.attribute);
                            }
                        }
                    }
                    knowledge.known.insert(node.id.clone(), attrs);
                    knowledge.unknown.insert(node.id.clone(), unknown);
                }
                _ => {
                    knowledge.pending.insert(node.id.clone());
                }
            }

            debug!("Planned {} for {}", action, node.id);

            changes.push(ResourceChange {
                id: node.id.clone(),
                action,
                changes: attribute_changes,
                external_id: entry.map(|e| e.external_id.clone()),
                create_before_destroy: action == ChangeAction::Replace
                    && node.lifecycle.create_before_destroy,
                after: graph.dependencies(&node.id),
            });
        }

        for entry in state.resources.values().filter(|e| !graph.contains(&e.id)) {
            if entry.lifecycle.prevent_destroy {
                return Err(PlanError::PreventDestroy {
                    resource: entry.id.to_string(),
                    action: ChangeAction::Delete.to_string(),
                }
                .into());
            }

            debug!("Planned delete for orphan {}", entry.id);
            changes.push(ResourceChange {
                id: entry.id.clone(),
                action: ChangeAction::Delete,
                changes: Vec::new(),
                external_id: Some(entry.external_id.clone()),
                create_before_destroy: false,
                after: recorded_dependents(state, &entry.id),
            });
        }

        self.finish(PlanMode::Apply, changes, state, config_hash)
    }

    /// Plans the deletion of every tracked resource.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::PreventDestroy`] if any tracked resource is
    /// protected.
    pub fn plan_destroy(&self, state: &StateDocument, config_hash: &str) -> Result<Plan> {
        let mut changes = Vec::new();

        for entry in state.resources.values() {
            if entry.lifecycle.prevent_destroy {
                return Err(PlanError::PreventDestroy {
                    resource: entry.id.to_string(),
                    action: ChangeAction::Delete.to_string(),
                }
                .into());
            }

            changes.push(ResourceChange {
                id: entry.id.clone(),
                action: ChangeAction::Delete,
                changes: Vec::new(),
                external_id: Some(entry.external_id.clone()),
                create_before_destroy: false,
                after: recorded_dependents(state, &entry.id),
            });
        }

        self.finish(PlanMode::Destroy, changes, state, config_hash)
    }

    fn finish(
        &self,
        mode: PlanMode,
        changes: Vec<ResourceChange>,
        state: &StateDocument,
        config_hash: &str,
    ) -> Result<Plan> {
        let changes = execution_order(changes)?;
        let fingerprint = self.hasher.hash_value(&(config_hash, state.lineage, state.serial, mode));

        let plan = Plan {
            created_at: chrono::Utc::now(),
            mode,
            config_hash: config_hash.to_string(),
            state_serial: state.serial,
            fingerprint: fingerprint.chars().take(FINGERPRINT_LEN).collect(),
            changes,
        };

        debug!("Plan {}: {}", plan.fingerprint, plan.summary());
        Ok(plan)
    }
}

/// Resolves a node's attributes as far as possible at plan time.
fn plan_values(node: &ResourceNode, knowledge: &Knowledge) -> Result<BTreeMap<String, PlannedValue>> {
    let lookup = |r: &Reference| {
        if knowledge.is_unknown(r) {
            return None;
        }
        knowledge.known.get(&r.target).and_then(|attrs| r.extract(attrs))
    };

    let mut values = BTreeMap::new();
    for (name, expr) in &node.attributes {
        let planned = match expr.resolve(&lookup) {
            Ok(value) => PlannedValue::Known(value),
            Err(missing) if knowledge.is_unknown(&missing) => PlannedValue::KnownAfterApply,
            Err(missing) => {
                return Err(PlanError::UnresolvedValue {
                    resource: node.id.to_string(),
                    reference: missing.to_string(),
                }
                .into());
            }
        };
        values.insert(name.clone(), planned);
    }

    Ok(values)
}

/// Resources whose recorded dependencies include `id`.
fn recorded_dependents(state: &StateDocument, id: &ResourceId) -> BTreeSet<ResourceId> {
    state
        .resources
        .values()
        .filter(|e| e.id != *id && e.dependencies.contains(id))
        .map(|e| e.id.clone())
        .collect()
}

/// Orders changes so that each follows everything in its `after` set.
///
/// Ties are broken by resource id, so the order is deterministic.
fn execution_order(changes: Vec<ResourceChange>) -> Result<Vec<ResourceChange>> {
    let mut by_id: BTreeMap<ResourceId, ResourceChange> =
        changes.into_iter().map(|c| (c.id.clone(), c)).collect();

    // predecessors outside the plan cannot block anything
    let ids: BTreeSet<ResourceId> = by_id.keys().cloned().collect();
    for change in by_id.values_mut() {
        change.after.retain(|p| ids.contains(p));
    }

    let mut remaining: BTreeMap<ResourceId, usize> =
        by_id.iter().map(|(id, c)| (id.clone(), c.after.len())).collect();
    let mut ready: BTreeSet<ResourceId> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut order = Vec::with_capacity(by_id.len());

    while let Some(id) = ready.pop_first() {
        remaining.remove(&id);
        for (other, change) in &by_id {
            if change.after.contains(&id)
                && let Some(n) = remaining.get_mut(other)
            {
                *n -= 1;
                if *n == 0 {
                    ready.insert(other.clone());
                }
            }
        }
        order.push(id);
    }

    if !remaining.is_empty() {
        return Err(GraphError::Cycle {
            cycle: remaining.keys().map(ToString::to_string).collect(),
        }
        .into());
    }

    Ok(order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigParser, VariableValues};
    use crate::error::CairnError;
    use crate::graph::{GraphBuilder, Lifecycle};
    use crate::provider::SandboxRemote;
    use crate::state::StateEntry;
    use serde_json::{Value, json};

    const SITE: &str = r#"
project:
  name: site
resources:
  - type: bucket
    name: site
    attributes:
      bucket_name: site-content
  - type: certificate
    name: site
    lifecycle:
      create_before_destroy: true
    attributes:
      domain_name: example.com
  - type: cdn_distribution
    name: site
    attributes:
      origin_domain: "${bucket.site.domain_name}"
      certificate_arn: "${certificate.site.arn}"
  - type: access_policy
    name: read
    attributes:
      bucket: "${bucket.site.id}"
      principal: "${cdn_distribution.site.arn}"
"#;

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    fn graph(yaml: &str) -> ResourceGraph {
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new(&VariableValues::new()).build(&config).unwrap()
    }

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    fn entry(name: &str, attributes: Value, deps: &[&str]) -> StateEntry {
        StateEntry::new(id(name), format!("ext-{name}"), attrs(attributes))
            .with_dependencies(deps.iter().map(|d| id(d)).collect())
    }

    /// State as it would look after applying `SITE` once.
    fn applied_state() -> StateDocument {
        let mut state = StateDocument::new("site", "dev");
        for e in [
            entry(
                "bucket.site",
                json!({
                    "bucket_name": "site-content",
                    "id": "site-content",
                    "arn": "arn:sandbox:s3:::site-content",
                    "domain_name": "site-content.s3.sandbox.local",
                    "regional_domain_name": "site-content.s3.us-east-1.sandbox.local"
                }),
                &[],
            ),
            entry(
                "certificate.site",
                json!({"domain_name": "example.com", "arn": "arn:cert-1", "status": "ISSUED"}),
                &[],
            ),
            entry(
                "cdn_distribution.site",
                json!({
                    "origin_domain": "site-content.s3.sandbox.local",
                    "certificate_arn": "arn:cert-1",
                    "id": "DIST-1",
                    "arn": "arn:dist-1",
                    "domain_name": "dist-1.cdn.sandbox.local"
                }),
                &["bucket.site", "certificate.site"],
            ),
            entry(
                "access_policy.read",
                json!({"bucket": "site-content", "principal": "arn:dist-1", "id": "pol-1"}),
                &["bucket.site", "cdn_distribution.site"],
            ),
        ] {
            state.resources.insert(e.id.clone(), e);
        }
        state.seal();
        state
    }

    fn planner_fixture() -> ProviderRegistry {
        ProviderRegistry::sandbox(&SandboxRemote::in_memory())
    }

    #[test]
    fn test_empty_state_creates_in_dependency_order() {
        let registry = planner_fixture();
        let plan = Planner::new(&registry)
            .plan(&graph(SITE), &StateDocument::new("site", "dev"), "h")
            .unwrap();

        assert_eq!(plan.summary().create, 4);
        assert!(plan.has_changes());

        let pos = |s: &str| plan.position(&id(s)).unwrap();
        assert!(pos("bucket.site") < pos("cdn_distribution.site"));
        assert!(pos("certificate.site") < pos("cdn_distribution.site"));
        assert!(pos("cdn_distribution.site") < pos("access_policy.read"));

        let policy = plan.get(&id("access_policy.read")).unwrap();
        assert_eq!(
            policy.after,
            BTreeSet::from([id("bucket.site"), id("cdn_distribution.site")])
        );
        assert!(
            policy
                .changes
                .iter()
                .all(|c| c.after == PlannedValue::KnownAfterApply)
        );
    }

    #[test]
    fn test_applied_state_is_all_noop() {
        let registry = planner_fixture();
        let plan = Planner::new(&registry)
            .plan(&graph(SITE), &applied_state(), "h")
            .unwrap();

        assert!(!plan.has_changes(), "{plan}");
        assert_eq!(plan.summary().unchanged, 4);
    }

    #[test]
    fn test_force_new_replaces_and_propagates_unknown() {
        let registry = planner_fixture();
        let changed = SITE.replace("domain_name: example.com", "domain_name: example.org");
        let plan = Planner::new(&registry)
            .plan(&graph(&changed), &applied_state(), "h")
            .unwrap();

        let cert = plan.get(&id("certificate.site")).unwrap();
        assert_eq!(cert.action, ChangeAction::Replace);
        assert!(cert.create_before_destroy);
        assert_eq!(cert.replacement_reasons().collect::<Vec<_>>(), vec!["domain_name"]);

        // the distribution references the certificate arn
        let cdn = plan.get(&id("cdn_distribution.site")).unwrap();
        assert_eq!(cdn.action, ChangeAction::Update);
        assert_eq!(cdn.changes[0].attribute, "certificate_arn");
        assert_eq!(cdn.changes[0].after, PlannedValue::KnownAfterApply);

        // the policy only references the distribution arn, which is unchanged
        assert_eq!(
            plan.get(&id("access_policy.read")).unwrap().action,
            ChangeAction::NoOp
        );
    }

    #[test]
    fn test_in_place_update() {
        let registry = planner_fixture();
        let changed = SITE.replace(
            "      bucket_name: site-content\n",
            "      bucket_name: site-content\n      versioning: true\n",
        );
        let plan = Planner::new(&registry)
            .plan(&graph(&changed), &applied_state(), "h")
            .unwrap();

        let bucket = plan.get(&id("bucket.site")).unwrap();
        assert_eq!(bucket.action, ChangeAction::Update);
        assert_eq!(plan.summary().total_changes(), 1);
    }

    #[test]
    fn test_orphans_deleted_after_recorded_dependents() {
        let registry = planner_fixture();
        let only_cert = r#"
project:
  name: site
resources:
  - type: certificate
    name: site
    attributes:
      domain_name: example.com
"#;
        let plan = Planner::new(&registry)
            .plan(&graph(only_cert), &applied_state(), "h")
            .unwrap();

        assert_eq!(plan.summary().delete, 3);
        let pos = |s: &str| plan.position(&id(s)).unwrap();
        assert!(pos("access_policy.read") < pos("cdn_distribution.site"));
        assert!(pos("access_policy.read") < pos("bucket.site"));
        assert!(pos("cdn_distribution.site") < pos("bucket.site"));
    }

    #[test]
    fn test_prevent_destroy() {
        let registry = planner_fixture();
        let mut state = applied_state();
        if let Some(e) = state.resources.get_mut(&id("bucket.site")) {
            e.lifecycle = Lifecycle {
                prevent_destroy: true,
                ..Lifecycle::default()
            };
        }
        state.seal();

        let result = Planner::new(&registry).plan_destroy(&state, "h");
        assert!(matches!(
            result,
            Err(CairnError::Plan(PlanError::PreventDestroy { .. }))
        ));
    }

    #[test]
    fn test_ignore_changes() {
        let registry = planner_fixture();
        let changed = SITE.replace(
            "    name: site\n    attributes:\n      bucket_name: site-content\n",
            "    name: site\n    lifecycle:\n      ignore_changes: [bucket_name]\n    attributes:\n      bucket_name: other\n",
        );
        let plan = Planner::new(&registry)
            .plan(&graph(&changed), &applied_state(), "h")
            .unwrap();
        assert_eq!(plan.get(&id("bucket.site")).unwrap().action, ChangeAction::NoOp);
    }

    #[test]
    fn test_destroy_reverse_order_and_fingerprint() {
        let registry = planner_fixture();
        let state = applied_state();
        let planner = Planner::new(&registry);
        let plan = planner.plan_destroy(&state, "h").unwrap();

        assert_eq!(plan.mode, PlanMode::Destroy);
        assert_eq!(plan.summary().delete, 4);
        assert_eq!(plan.changes.first().unwrap().id, id("access_policy.read"));
        let pos = |s: &str| plan.position(&id(s)).unwrap();
        assert!(pos("cdn_distribution.site") < pos("bucket.site"));
        assert!(pos("cdn_distribution.site") < pos("certificate.site"));

        let again = planner.plan_destroy(&state, "h").unwrap();
        assert_eq!(plan.fingerprint, again.fingerprint);
        assert_ne!(plan.fingerprint, planner.plan_destroy(&state, "other").unwrap().fingerprint);
    }

    #[test]
    fn test_missing_attribute_of_unchanged_resource() {
        let registry = planner_fixture();
        let typo = SITE.replace("${bucket.site.domain_name}", "${bucket.site.domain}");
        let result = Planner::new(&registry).plan(&graph(&typo), &applied_state(), "h");
        assert!(matches!(
            result,
            Err(CairnError::Plan(PlanError::UnresolvedValue { .. }))
        ));
    }
}
