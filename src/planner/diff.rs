//! Attribute diffing between desired values and recorded state.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::provider::ResourceSchema;
use crate::resource::Attributes;

/// A desired attribute value as seen at plan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// Fully known value.
    Known(Value),
    /// Depends on a resource that is not applied yet.
    KnownAfterApply,
    /// The attribute is no longer declared.
    Removed,
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::KnownAfterApply => f.write_str("(known after apply)"),
            Self::Removed => f.write_str("(removed)"),
        }
    }
}

/// Change to a single attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Recorded value, if any.
    pub before: Option<Value>,
    /// Planned value.
    pub after: PlannedValue,
    /// Whether this change requires a new instance.
    pub forces_replacement: bool,
}

/// Computes attribute changes of an existing resource.
///
/// Only declared attributes are compared, minus `ignored`. A recorded
/// attribute that is neither declared, computed nor ignored is reported
/// as removed.
#[must_use]
pub fn diff_attributes(
    desired: &BTreeMap<String, PlannedValue>,
    recorded: &Attributes,
    schema: &ResourceSchema,
    ignored: &BTreeSet<String>,
) -> Vec<AttributeChange> {
    let mut changes = Vec::new();

    for (name, planned) in desired {
        if ignored.contains(name) {
            continue;
        }

        let before = recorded.get(name);
        let changed = match planned {
            PlannedValue::Known(value) => before != Some(value),
            PlannedValue::KnownAfterApply => true,
            PlannedValue::Removed => before.is_some(),
        };

        if changed {
            changes.push(AttributeChange {
                attribute: name.clone(),
                before: before.cloned(),
                after: planned.clone(),
                forces_replacement: schema.forces_replacement(name),
            });
        }
    }

    for (name, value) in recorded {
        if desired.contains_key(name) || ignored.contains(name) || schema.is_computed(name) {
            continue;
        }
        changes.push(AttributeChange {
            attribute: name.clone(),
            before: Some(value.clone()),
            after: PlannedValue::Removed,
            forces_replacement: schema.forces_replacement(name),
        });
    }

    changes
}

/// Attribute listing for a resource that does not exist yet.
#[must_use]
pub fn creation_changes(desired: &BTreeMap<String, PlannedValue>) -> Vec<AttributeChange> {
    desired
        .iter()
        .map(|(name, planned)| AttributeChange {
            attribute: name.clone(),
            before: None,
            after: planned.clone(),
            forces_replacement: false,
        })
        .collect()
}

/// Differences between recorded and remote attributes (drift).
#[must_use]
pub fn diff_remote(recorded: &Attributes, remote: &Attributes) -> Vec<AttributeChange> {
    let names: BTreeSet<&String> = recorded.keys().chain(remote.keys()).collect();

    names
        .into_iter()
        .filter(|name| recorded.get(*name) != remote.get(*name))
        .map(|name| AttributeChange {
            attribute: name.clone(),
            before: recorded.get(name).cloned(),
            after: remote
                .get(name)
                .map_or(PlannedValue::Removed, |v| PlannedValue::Known(v.clone())),
            forces_replacement: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn known(v: Value) -> PlannedValue {
        PlannedValue::Known(v)
    }

    fn schema() -> ResourceSchema {
        ResourceSchema::new()
            .force_new(["domain_name"])
            .computed(["arn", "status"])
    }

    fn recorded() -> Attributes {
        Attributes::from([
            (String::from("domain_name"), json!("example.com")),
            (String::from("tags"), json!({"team": "web"})),
            (String::from("arn"), json!("arn:sandbox:acm:certificate/cert-1")),
            (String::from("status"), json!("ISSUED")),
        ])
    }

    #[test]
    fn test_unchanged_ignores_computed() {
        let desired = BTreeMap::from([
            (String::from("domain_name"), known(json!("example.com"))),
            (String::from("tags"), known(json!({"team": "web"}))),
        ]);
        assert!(diff_attributes(&desired, &recorded(), &schema(), &BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_force_new_change() {
        let desired = BTreeMap::from([
            (String::from("domain_name"), known(json!("example.org"))),
            (String::from("tags"), known(json!({"team": "web"}))),
        ]);
        let changes = diff_attributes(&desired, &recorded(), &schema(), &BTreeSet::new());
        assert_eq!(changes.len(), 1);
        assert!(changes[0].forces_replacement);
        assert_eq!(changes[0].before, Some(json!("example.com")));
    }

    #[test]
    fn test_ignored_and_removed() {
        let desired = BTreeMap::from([(String::from("domain_name"), known(json!("example.org")))]);
        let ignored = BTreeSet::from([String::from("domain_name")]);

        let changes = diff_attributes(&desired, &recorded(), &schema(), &ignored);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].attribute, "tags");
        assert_eq!(changes[0].after, PlannedValue::Removed);
        assert!(!changes[0].forces_replacement);
    }

    #[test]
    fn test_unknown_counts_as_change() {
        let desired = BTreeMap::from([
            (String::from("domain_name"), known(json!("example.com"))),
            (String::from("tags"), PlannedValue::KnownAfterApply),
        ]);
        let changes = diff_attributes(&desired, &recorded(), &schema(), &BTreeSet::new());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].after.to_string(), "(known after apply)");
    }

    #[test]
    fn test_remote_drift() {
        let mut remote = recorded();
        remote.insert(String::from("status"), json!("REVOKED"));
        remote.remove("tags");

        let drift = diff_remote(&recorded(), &remote);
        let names: Vec<&str> = drift.iter().map(|c| c.attribute.as_str()).collect();
        assert_eq!(names, vec!["status", "tags"]);
        assert_eq!(drift[1].after, PlannedValue::Removed);
    }
}
