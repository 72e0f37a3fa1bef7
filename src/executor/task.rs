//! Execution of a single planned change.
//!
//! A task owns everything it needs, holds one concurrency permit for its
//! whole lifetime and writes the resource's state entry as soon as a
//! provider call succeeds.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use crate::error::{CairnError, ProviderError};
use crate::graph::Lifecycle;
use crate::planner::{ChangeAction, ResourceChange};
use crate::provider::{Operation, Provider, ProviderResult, RetryPolicy};
use crate::resource::{Attributes, ResourceId};
use crate::state::{StateEntry, StateManager};

use super::report::{EventKind, Timeline};

/// Shared by every task of one apply.
pub(super) struct TaskContext {
    pub state: Arc<StateManager>,
    pub retry: RetryPolicy,
    pub timeline: Timeline,
}

/// A change ready to run, with its inputs resolved.
pub(super) struct Job {
    pub position: usize,
    pub change: ResourceChange,
    pub provider: Arc<dyn Provider>,
    /// Resolved desired attributes; empty for deletes.
    pub desired: Attributes,
    pub dependencies: BTreeSet<ResourceId>,
    pub lifecycle: Lifecycle,
    /// Creation time of the instance being updated.
    pub created_at: Option<DateTime<Utc>>,
}

/// Why a task failed.
#[derive(Debug)]
pub(super) enum Failure {
    /// The provider call failed; isolated to this node and its dependents.
    Provider(ProviderError),
    /// The state could not be written; stops the whole apply.
    State(CairnError),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "{e}"),
        }
    }
}

/// Result of a finished task.
pub(super) struct Outcome {
    pub position: usize,
    pub attempts: u32,
    /// Attributes after the change; `None` once the instance is gone.
    pub result: Result<Option<Attributes>, Failure>,
}

/// Runs a job to completion.
pub(super) async fn run(ctx: Arc<TaskContext>, job: Job, _permit: OwnedSemaphorePermit) -> Outcome {
    let mut attempts = 0;
    ctx.timeline.record(&job.change.id, EventKind::Started).await;
    debug!("Starting {} of {}", job.change.action, job.change.id);

    let result = execute(&ctx, &job, &mut attempts).await;

    Outcome {
        position: job.position,
        attempts,
        result,
    }
}

async fn execute(ctx: &TaskContext, job: &Job, attempts: &mut u32) -> Result<Option<Attributes>, Failure> {
    let id = &job.change.id;

    match job.change.action {
        ChangeAction::NoOp => Ok(ctx.state.get(id).await.map(|e| e.attributes)),
        ChangeAction::Create => create(ctx, job, attempts).await.map(Some),
        ChangeAction::Update => {
            let external_id = existing(job)?;
            let provider = job.provider.as_ref();
            let desired = &job.desired;
            let attributes = call(ctx, id, Operation::Update, attempts, move || {
                provider.update(external_id, desired)
            })
            .await?;

            let mut entry = entry_for(job, external_id, attributes.clone());
            if let Some(created_at) = job.created_at {
                entry.created_at = created_at;
            }
            write_entry(ctx, id, entry).await?;
            Ok(Some(attributes))
        }
        ChangeAction::Delete => {
            let external_id = existing(job)?;
            delete(ctx, job, external_id, attempts).await?;
            forget(ctx, id).await?;
            Ok(None)
        }
        ChangeAction::Replace if job.change.create_before_destroy => {
            let old = existing(job)?;
            let attributes = create(ctx, job, attempts).await?;
            // state already points at the new instance
            delete(ctx, job, old, attempts).await?;
            Ok(Some(attributes))
        }
        ChangeAction::Replace => {
            let old = existing(job)?;
            delete(ctx, job, old, attempts).await?;
            forget(ctx, id).await?;
            create(ctx, job, attempts).await.map(Some)
        }
    }
}

async fn create(ctx: &TaskContext, job: &Job, attempts: &mut u32) -> Result<Attributes, Failure> {
    let id = &job.change.id;
    let provider = job.provider.as_ref();
    let desired = &job.desired;

    let created = call(ctx, id, Operation::Create, attempts, move || provider.create(id, desired)).await?;
    info!("Created {id} ({})", created.external_id);

    let entry = entry_for(job, &created.external_id, created.attributes.clone());
    write_entry(ctx, id, entry).await?;
    Ok(created.attributes)
}

async fn delete(ctx: &TaskContext, job: &Job, external_id: &str, attempts: &mut u32) -> Result<(), Failure> {
    let id = &job.change.id;
    let provider = job.provider.as_ref();

    call(ctx, id, Operation::Delete, attempts, move || provider.delete(external_id)).await?;
    info!("Deleted {id} ({external_id})");
    Ok(())
}

/// Runs a provider call under the retry policy and records it.
async fn call<T, F, Fut>(
    ctx: &TaskContext,
    id: &ResourceId,
    operation: Operation,
    attempts: &mut u32,
    f: F,
) -> Result<T, Failure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let label = format!("{operation} {id}");
    let attempted = ctx.retry.run(&label, f).await;
    *attempts += attempted.attempts;

    ctx.timeline
        .record(
            id,
            EventKind::ProviderCall {
                operation,
                attempts: attempted.attempts,
                success: attempted.result.is_ok(),
            },
        )
        .await;

    attempted.result.map_err(|e| {
        warn!("{label} failed: {e}");
        Failure::Provider(e)
    })
}

async fn write_entry(ctx: &TaskContext, id: &ResourceId, entry: StateEntry) -> Result<(), Failure> {
    ctx.state.put(entry).await.map_err(Failure::State)?;
    ctx.timeline.record(id, EventKind::StateWritten).await;
    Ok(())
}

async fn forget(ctx: &TaskContext, id: &ResourceId) -> Result<(), Failure> {
    ctx.state.delete(id).await.map_err(Failure::State)?;
    ctx.timeline.record(id, EventKind::StateWritten).await;
    Ok(())
}

fn existing(job: &Job) -> Result<&str, Failure> {
    job.change.external_id.as_deref().ok_or_else(|| {
        Failure::Provider(ProviderError::permanent(format!(
            "{} of {} has no recorded instance",
            job.change.action, job.change.id
        )))
    })
}

fn entry_for(job: &Job, external_id: &str, attributes: Attributes) -> StateEntry {
    StateEntry::new(job.change.id.clone(), external_id, attributes)
        .with_dependencies(job.dependencies.clone())
        .with_lifecycle(job.lifecycle.clone())
}
