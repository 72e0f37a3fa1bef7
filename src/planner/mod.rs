//! Planning module.
//!
//! This module compares the desired graph with recorded state and
//! produces an ordered change list.

mod diff;
mod engine;
mod plan;

pub use diff::{AttributeChange, PlannedValue, diff_attributes, diff_remote};
pub use engine::Planner;
pub use plan::{ChangeAction, Plan, PlanMode, PlanSummary, ResourceChange};
