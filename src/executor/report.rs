//! Apply reports and the event timeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::planner::ChangeAction;
use crate::provider::Operation;
use crate::resource::ResourceId;
use crate::state::HistorySummary;

/// Per-node execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting for predecessors.
    Pending,
    /// Provider calls running.
    InProgress,
    /// Finished successfully.
    Applied,
    /// Finished with an error.
    Failed,
    /// Skipped because a predecessor failed or the run stopped.
    Blocked,
}

impl NodeState {
    /// Returns true for states a node never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Failed | Self::Blocked)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Outcome for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    /// Resource id.
    pub id: ResourceId,
    /// Planned action.
    pub action: ChangeAction,
    /// Final state.
    pub state: NodeState,
    /// Provider calls made, including retries.
    pub attempts: u32,
    /// First error, or the reason the node was blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What happened at a point of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// The node's action started.
    Started,
    /// A provider call finished.
    ProviderCall {
        /// Operation performed.
        operation: Operation,
        /// Attempts made.
        attempts: u32,
        /// Whether the call succeeded.
        success: bool,
    },
    /// The node's state entry was written or removed.
    StateWritten,
    /// The node reached `Applied`.
    Applied,
    /// The node reached `Failed`.
    Failed {
        /// Error message.
        error: String,
    },
    /// The node reached `Blocked`.
    Blocked {
        /// Why.
        reason: String,
    },
}

/// A timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Position in the timeline.
    pub seq: usize,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Resource concerned.
    pub resource: ResourceId,
    /// What happened.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Shared, append-only event log.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Timeline {
    /// Appends an event.
    pub async fn record(&self, resource: &ResourceId, kind: EventKind) {
        let mut events = self.events.lock().await;
        let seq = events.len();
        events.push(Event {
            seq,
            at: Utc::now(),
            resource: resource.clone(),
            kind,
        });
    }

    /// Returns the events recorded so far.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Per-node outcomes, in plan order.
    pub nodes: Vec<NodeReport>,
    /// Event timeline.
    pub events: Vec<Event>,
    /// Whether a cancellation signal stopped dispatch.
    pub cancelled: bool,
    /// Fatal error that stopped dispatch (state conflicts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl ApplyReport {
    /// Returns true if every node was applied and nothing aborted the run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.nodes.iter().all(|n| n.state == NodeState::Applied)
    }

    /// Gets the report for a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Final state of a resource.
    #[must_use]
    pub fn state_of(&self, id: &ResourceId) -> Option<NodeState> {
        self.get(id).map(|n| n.state)
    }

    /// Number of nodes in a state.
    #[must_use]
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }

    /// Nodes that failed, with their first error.
    pub fn failures(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.state == NodeState::Failed)
    }

    /// The first error of the run, if any.
    #[must_use]
    pub fn first_error(&self) -> Option<String> {
        self.aborted.clone().or_else(|| {
            self.failures()
                .next()
                .and_then(|n| n.error.as_ref().map(|e| format!("{}: {e}", n.id)))
        })
    }

    /// Events for one resource, in order.
    pub fn events_for<'a>(&'a self, id: &ResourceId) -> impl Iterator<Item = &'a Event> + use<'a> {
        let id = id.clone();
        self.events.iter().filter(move |e| e.resource == id)
    }

    /// Counts for the history log.
    #[must_use]
    pub fn summary(&self) -> HistorySummary {
        let mut summary = HistorySummary::default();
        for node in &self.nodes {
            match (node.state, node.action) {
                (NodeState::Applied, ChangeAction::Create) => summary.created += 1,
                (NodeState::Applied, ChangeAction::Update) => summary.updated += 1,
                (NodeState::Applied, ChangeAction::Replace) => summary.replaced += 1,
                (NodeState::Applied, ChangeAction::Delete) => summary.deleted += 1,
                (NodeState::Failed, _) => summary.failed += 1,
                (NodeState::Blocked, _) => summary.blocked += 1,
                _ => {}
            }
        }
        summary
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.summary();
        write!(
            f,
            "{} created, {} updated, {} replaced, {} deleted, {} failed, {} blocked",
            s.created, s.updated, s.replaced, s.deleted, s.failed, s.blocked
        )
    }
}
