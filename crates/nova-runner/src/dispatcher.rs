use std::sync::Arc;

use nova_concurrency::{ConcurrencyError, ConcurrencyManager};
use nova_core::state_machine::{is_terminal, requires_human_approval};
use nova_core::{Metadata, Run, RunId, RunState, SubIssueStatus};
use nova_hitl::format_blocked_notice;
use nova_storage::{transition_run, Datastore, TransitionError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::{now_unix, Verdict, Worker};

/// Run metadata key holding how many sub-issues were recorded at dispatch start.
pub const SUB_ISSUE_COUNT_KEY: &str = "sub_issue_count";

/// Whether the dispatcher drives a run in `state` forward. PENDING waits for a
/// re-claim; VALIDATING and MERGING are picked up again if a previous process
/// stopped in the middle of a run.
pub fn is_driven(state: RunState) -> bool {
    state != RunState::Pending && !is_terminal(state) && !requires_human_approval(state)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The run was driven; `state` is where it stopped.
    Progressed { state: RunState },
    /// Resource busy; try again next cycle.
    Busy,
    /// Not in a driven state (BLOCKED, PENDING or terminal).
    Skipped { state: RunState },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("run {run_id} is {state}, not BLOCKED")]
    NotBlocked { run_id: RunId, state: RunState },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct Dispatcher<W> {
    store: Arc<dyn Datastore>,
    concurrency: Arc<ConcurrencyManager>,
    worker: Arc<W>,
}

impl<W> Clone for Dispatcher<W> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), concurrency: self.concurrency.clone(), worker: self.worker.clone() }
    }
}

impl<W: Worker> Dispatcher<W> {
    pub fn new(store: Arc<dyn Datastore>, concurrency: Arc<ConcurrencyManager>, worker: Arc<W>) -> Self {
        Self { store, concurrency, worker }
    }

    pub fn concurrency(&self) -> &ConcurrencyManager {
        &self.concurrency
    }

    /// Drives one run as far as it can go under the concurrency limits.
    pub async fn dispatch(&self, run_id: &RunId) -> Result<DispatchOutcome, DispatchError> {
        let run = self.store.get_run(run_id)?.ok_or_else(|| DispatchError::NotFound(run_id.clone()))?;
        if !is_driven(run.state) {
            return Ok(DispatchOutcome::Skipped { state: run.state });
        }

        let resource = run.target_resource.clone();
        match self.concurrency.run_under_limits(&resource, run_id, self.drive(run_id)).await {
            Ok(outcome) => outcome,
            Err(ConcurrencyError::ResourceBusy { .. }) => {
                tracing::debug!(run_id = %run_id, resource = %resource, "resource busy");
                Ok(DispatchOutcome::Busy)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Dispatches every driven run concurrently. Runs on a busy resource are
    /// left for the next cycle; one run's failure does not affect the others.
    pub async fn dispatch_ready(&self) -> anyhow::Result<Vec<(RunId, DispatchOutcome)>> {
        let mut runs = vec![];
        for state in RunState::ALL.into_iter().filter(|s| is_driven(*s)) {
            runs.extend(self.store.list_runs_by_state(state)?);
        }

        let mut set = JoinSet::new();
        for run in runs {
            if self.concurrency.is_busy(&run.target_resource) {
                tracing::debug!(run_id = %run.id, resource = %run.target_resource, "skipping busy resource");
                continue;
            }
            let this = self.clone();
            set.spawn(async move {
                let result = this.dispatch(&run.id).await;
                (run.id, result)
            });
        }

        let mut outcomes = vec![];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((run_id, Ok(outcome))) => {
                    tracing::info!(run_id = %run_id, ?outcome, "dispatched");
                    outcomes.push((run_id, outcome));
                }
                Ok((run_id, Err(err))) => tracing::warn!(run_id = %run_id, error = %err, "dispatch failed"),
                Err(err) => tracing::warn!(error = %err, "dispatch task aborted"),
            }
        }
        Ok(outcomes)
    }

    /// Human approval of a BLOCKED run.
    pub fn resolve_blocked(&self, run_id: &RunId, to: RunState, reason: &str) -> Result<Run, DispatchError> {
        let run = self.store.get_run(run_id)?.ok_or_else(|| DispatchError::NotFound(run_id.clone()))?;
        if run.state != RunState::Blocked {
            return Err(DispatchError::NotBlocked { run_id: run_id.clone(), state: run.state });
        }
        let mut patch = Metadata::new();
        patch.insert("resolution".into(), json!(reason));
        Ok(self.transition(run_id, to, reason, patch)?)
    }

    pub fn transition(&self, run_id: &RunId, to: RunState, reason: &str, patch: Metadata) -> Result<Run, TransitionError> {
        transition_run(self.store.as_ref(), run_id, to, reason, patch, now_unix())
    }

    async fn drive(&self, run_id: &RunId) -> Result<DispatchOutcome, DispatchError> {
        // re-read under the resource gate; the run may have moved while we waited
        let mut run = self.store.get_run(run_id)?.ok_or_else(|| DispatchError::NotFound(run_id.clone()))?;
        loop {
            let next = match run.state {
                RunState::Claimed => self.start(&run).await?,
                RunState::Working => match self.work(&run).await? {
                    Some(next) => next,
                    None => return Ok(DispatchOutcome::Progressed { state: RunState::Working }),
                },
                RunState::Validating => self.validate(&run).await?,
                RunState::Merging => self.merge(&run).await?,
                state => return Ok(DispatchOutcome::Progressed { state }),
            };
            run = next;
        }
    }

    /// Creates and records every sub-issue, then moves the run to WORKING with
    /// the recorded count. A run whose sub-issues were not all recorded fails
    /// instead of advancing on a partial set.
    async fn start(&self, run: &Run) -> Result<Run, DispatchError> {
        let subs = match self.worker.create_issues(run).await {
            Ok(subs) if subs.is_empty() => return self.fail(run, "worker created no sub-issues"),
            Ok(subs) => subs,
            Err(err) => return self.fail(run, &format!("create issues: {err:#}")),
        };
        let now = now_unix();
        for sub in &subs {
            if let Err(err) = self.store.upsert_sub_issue(&run.id, sub, now) {
                return self.fail(run, &format!("record sub-issue {}: {err:#}", sub.worker_type));
            }
        }
        tracing::info!(run_id = %run.id, sub_issues = subs.len(), "sub-issues created");

        let mut patch = Metadata::new();
        patch.insert(SUB_ISSUE_COUNT_KEY.into(), json!(subs.len()));
        Ok(self.transition(&run.id, RunState::Working, "dispatch started", patch)?)
    }

    /// `None` while some sub-issue is still open.
    async fn work(&self, run: &Run) -> Result<Option<Run>, DispatchError> {
        let subs = self.store.list_sub_issues(&run.id)?;
        let expected = run.metadata.get(SUB_ISSUE_COUNT_KEY).and_then(|v| v.as_u64()).unwrap_or(0);
        if subs.is_empty() {
            return self.fail(run, "no sub-issues recorded").map(Some);
        }
        if (subs.len() as u64) < expected {
            return self.fail(run, &format!("only {} of {expected} sub-issues recorded", subs.len())).map(Some);
        }

        for sub in subs {
            if sub.status == SubIssueStatus::Closed {
                continue;
            }
            let report = match self.worker.dispatch(run, &sub).await {
                Ok(report) => report,
                Err(err) => return self.fail(run, &format!("dispatch {}: {err:#}", sub.worker_type)).map(Some),
            };
            self.store.update_sub_issue_status(
                &run.id,
                &sub.worker_type,
                report.status,
                report.merge_url.as_deref(),
                now_unix(),
            )?;
        }

        if !self.store.all_sub_issues_closed(&run.id)? {
            return Ok(None);
        }
        Ok(Some(self.transition(&run.id, RunState::Validating, "all sub-issues closed", Metadata::new())?))
    }

    async fn validate(&self, run: &Run) -> Result<Run, DispatchError> {
        let subs = self.store.list_sub_issues(&run.id)?;
        match self.worker.validate(run, &subs).await {
            Ok(Verdict::Pass) => Ok(self.transition(&run.id, RunState::Merging, "validation passed", Metadata::new())?),
            Ok(Verdict::Escalate { reason }) => self.block(run, &reason),
            Ok(Verdict::Fail { reason }) => self.fail(run, &reason),
            Err(err) => self.fail(run, &format!("validate: {err:#}")),
        }
    }

    async fn merge(&self, run: &Run) -> Result<Run, DispatchError> {
        match self.worker.merge(run).await {
            Ok(Verdict::Pass) => {
                let done = self.transition(&run.id, RunState::Done, "merged", Metadata::new())?;
                if let Err(err) = self.worker.notify(&done).await {
                    tracing::warn!(run_id = %done.id, error = %format!("{err:#}"), "notify failed");
                }
                Ok(done)
            }
            Ok(Verdict::Escalate { reason }) => self.block(run, &reason),
            Ok(Verdict::Fail { reason }) => self.fail(run, &reason),
            Err(err) => self.fail(run, &format!("merge: {err:#}")),
        }
    }

    fn block(&self, run: &Run, reason: &str) -> Result<Run, DispatchError> {
        let mut patch = Metadata::new();
        patch.insert("blocked_reason".into(), json!(reason));
        patch.insert("hitl_notice".into(), json!(format_blocked_notice(run, reason)));
        let run = self.transition(&run.id, RunState::Blocked, reason, patch)?;
        tracing::warn!(run_id = %run.id, reason, "run blocked; waiting for a human");
        Ok(run)
    }

    fn fail(&self, run: &Run, reason: &str) -> Result<Run, DispatchError> {
        let mut patch = Metadata::new();
        patch.insert("failure_reason".into(), json!(reason));
        let run = self.transition(&run.id, RunState::Failed, reason, patch)?;
        tracing::warn!(run_id = %run.id, reason, "run failed");
        Ok(run)
    }
}
