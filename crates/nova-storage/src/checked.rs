use nova_core::{is_valid, Metadata, Run, RunId, RunState, StateChange};
use thiserror::Error;

use crate::{Datastore, UpdateOutcome};

#[derive(Debug, Error)]
pub enum TransitionError {
    /// The caller asked for an edge that is not in the lifecycle graph. This is a bug
    /// in the caller, never a runtime condition to retry.
    #[error("invalid transition {from} -> {to} for run {run_id}")]
    Invalid { run_id: RunId, from: RunState, to: RunState },
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("run {run_id} moved concurrently: expected {expected}, found {actual}")]
    Conflict { run_id: RunId, expected: RunState, actual: RunState },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// State-machine checked state write.
///
/// Reads the current state, rejects edges outside the lifecycle graph, then
/// writes conditionally on the state it read so a concurrent writer cannot be
/// overwritten.
pub fn transition_run<D: Datastore + ?Sized>(
    store: &D,
    run_id: &RunId,
    to: RunState,
    reason: &str,
    metadata_patch: Metadata,
    now_unix: i64,
) -> Result<Run, TransitionError> {
    let run = store.get_run(run_id)?.ok_or_else(|| TransitionError::NotFound(run_id.clone()))?;
    let from = run.state;
    if !is_valid(from, to) {
        return Err(TransitionError::Invalid { run_id: run_id.clone(), from, to });
    }

    let change = StateChange::new(run_id, to, reason).expecting(from).with_metadata(metadata_patch);
    apply(store, change, now_unix)
}

/// Checked write that also bumps the retry counter (used when re-claiming).
pub fn retry_transition_run<D: Datastore + ?Sized>(
    store: &D,
    run_id: &RunId,
    to: RunState,
    reason: &str,
    now_unix: i64,
) -> Result<Run, TransitionError> {
    let run = store.get_run(run_id)?.ok_or_else(|| TransitionError::NotFound(run_id.clone()))?;
    let from = run.state;
    if !is_valid(from, to) {
        return Err(TransitionError::Invalid { run_id: run_id.clone(), from, to });
    }

    let change = StateChange::new(run_id, to, reason).expecting(from).bump_retry();
    apply(store, change, now_unix)
}

fn apply<D: Datastore + ?Sized>(store: &D, change: StateChange, now_unix: i64) -> Result<Run, TransitionError> {
    let run_id = change.run_id.clone();
    match store.update_run_state(&change, now_unix)? {
        UpdateOutcome::Updated { from } => {
            tracing::debug!(run_id = %run_id, %from, to = %change.to, reason = %change.reason, "run transitioned");
            store.get_run(&run_id)?.ok_or(TransitionError::NotFound(run_id))
        }
        UpdateOutcome::NotFound => Err(TransitionError::NotFound(run_id)),
        UpdateOutcome::StateMismatch { actual } => Err(TransitionError::Conflict {
            run_id,
            expected: change.expected.unwrap_or(actual),
            actual,
        }),
    }
}
