//! Plan types.
//!
//! A plan holds one [`ResourceChange`] per resource in execution order,
//! each naming the changes it must wait for.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::resource::ResourceId;

use super::diff::AttributeChange;

/// What a plan does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Converge state towards the document.
    Apply,
    /// Delete every tracked resource.
    Destroy,
}

/// The action planned for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Create a new instance.
    Create,
    /// Update the instance in place.
    Update,
    /// Delete the old instance and create a new one.
    Replace,
    /// Delete an instance no longer declared.
    Delete,
    /// Nothing to do.
    NoOp,
}

impl ChangeAction {
    /// Symbol used in plan listings.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        f.write_str(s)
    }
}

/// A planned change to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceChange {
    /// Resource id.
    pub id: ResourceId,
    /// Action to perform.
    pub action: ChangeAction,
    /// Attribute-level changes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
    /// External id of the existing instance, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// For replacements: create the new instance before deleting the old.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub create_before_destroy: bool,
    /// Changes that must be applied first.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub after: BTreeSet<ResourceId>,
}

impl ResourceChange {
    /// Returns true unless the action is a no-op.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.action != ChangeAction::NoOp
    }

    /// Attributes whose change forces replacement.
    pub fn replacement_reasons(&self) -> impl Iterator<Item = &str> {
        self.changes
            .iter()
            .filter(|c| c.forces_replacement)
            .map(|c| c.attribute.as_str())
    }
}

/// Counts of planned actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to delete.
    pub delete: usize,
    /// Unchanged resources.
    pub unchanged: usize,
}

impl PlanSummary {
    /// Number of resources that will change.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.delete
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.unchanged
        )
    }
}

/// A complete, ordered change list.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Apply or destroy.
    pub mode: PlanMode,
    /// Hash of the document the plan is based on.
    pub config_hash: String,
    /// State serial the plan is based on.
    pub state_serial: u64,
    /// Stable identifier of the (document, state) pair.
    pub fingerprint: String,
    /// Changes in execution order.
    pub changes: Vec<ResourceChange>,
}

impl Plan {
    /// Returns true if applying the plan would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(ResourceChange::is_change)
    }

    /// Number of entries, including no-ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if the plan covers no resources at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Gets the change for a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceChange> {
        self.changes.iter().find(|c| c.id == *id)
    }

    /// Counts actions by kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                ChangeAction::Create => summary.create += 1,
                ChangeAction::Update => summary.update += 1,
                ChangeAction::Replace => summary.replace += 1,
                ChangeAction::Delete => summary.delete += 1,
                ChangeAction::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Position of a resource in the execution order.
    #[must_use]
    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.changes.iter().position(|c| c.id == *id)
    }

    /// Returns true if both plans perform the same actions with the same
    /// attribute changes. No-ops and fingerprints are ignored.
    #[must_use]
    pub fn same_changes(&self, other: &Self) -> bool {
        self.mode == other.mode && self.effective().eq(other.effective())
    }

    fn effective(&self) -> impl Iterator<Item = (&ResourceId, ChangeAction, &[AttributeChange])> {
        self.changes
            .iter()
            .filter(|c| c.is_change())
            .map(|c| (&c.id, c.action, c.changes.as_slice()))
    }
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.action.symbol(), self.id, self.action)?;

        if self.action == ChangeAction::Replace {
            let reasons: Vec<&str> = self.replacement_reasons().collect();
            if !reasons.is_empty() {
                write!(f, " (forced by {})", reasons.join(", "))?;
            }
            if self.create_before_destroy {
                f.write_str(" [create before destroy]")?;
            }
        }

        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes. Infrastructure matches the document.");
        }

        writeln!(f, "Plan {} ({}):", self.fingerprint, self.summary())?;
        for change in self.changes.iter().filter(|c| c.is_change()) {
            writeln!(f, "  {change}")?;
            for attr in &change.changes {
                let before = attr
                    .before
                    .as_ref()
                    .map_or_else(|| String::from("(none)"), ToString::to_string);
                writeln!(f, "      {}: {before} -> {}", attr.attribute, attr.after)?;
            }
        }

        Ok(())
    }
}
