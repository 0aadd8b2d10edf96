use std::sync::Arc;

use anyhow::Result;
use nova_board::{BoardItem, TaskExtractors, TaskSource};
use nova_core::{ExternalRef, NewRun, Run, RunId, RunState, TaskDescriptor};
use nova_storage::{retry_transition_run, Datastore, InsertOutcome, TransitionError};

use crate::StaleReclaimer;

pub const CLAIM_REASON: &str = "claimed from board";
pub const RECLAIM_REASON: &str = "re-claimed after stale timeout";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The datastore row is ours. `marker_written` is false when the board
    /// refused the marker; the run stays CLAIMED and the reclaimer picks it up.
    Claimed { run_id: RunId, marker_written: bool },
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            ClaimOutcome::Claimed { run_id, .. } => Some(run_id),
            ClaimOutcome::AlreadyClaimed => None,
        }
    }
}

/// Double-write claim: datastore row first (the arbiter), board marker second.
pub struct ClaimProtocol {
    store: Arc<dyn Datastore>,
    board: Arc<dyn TaskSource>,
    extractors: TaskExtractors,
    reclaimer: StaleReclaimer,
}

impl ClaimProtocol {
    pub fn new(
        store: Arc<dyn Datastore>,
        board: Arc<dyn TaskSource>,
        extractors: TaskExtractors,
        reclaimer: StaleReclaimer,
    ) -> Self {
        Self { store, board, extractors, reclaimer }
    }

    pub fn reclaimer(&self) -> &StaleReclaimer {
        &self.reclaimer
    }

    /// Ready, unmarked board items as task descriptors. A board failure yields
    /// an empty list; the next cycle tries again.
    pub fn discover(&self) -> Vec<TaskDescriptor> {
        let items = match self.board.list_ready() {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "task discovery failed");
                return vec![];
            }
        };
        let schema = self.board.schema();
        items
            .iter()
            .filter(|item| item.claim_marker(schema).is_none())
            .map(|item| self.extractors.describe(item))
            .collect()
    }

    pub fn claim(&self, task: &TaskDescriptor, now_unix: i64) -> Result<ClaimOutcome> {
        let new_run = NewRun::from_task(task);
        match self.store.insert_run(&new_run, CLAIM_REASON, now_unix)? {
            InsertOutcome::Inserted => {
                tracing::info!(run_id = %new_run.id, external_ref = %task.external_ref, resource = %task.target_resource, "claimed task");
                let marker_written = self.write_marker(&task.external_ref, &new_run.id);
                Ok(ClaimOutcome::Claimed { run_id: new_run.id, marker_written })
            }
            InsertOutcome::DuplicateRejected => {
                let existing = self.store.get_run_by_external_ref(&task.external_ref)?;
                match existing {
                    Some(run) if run.state == RunState::Pending && self.board_still_ready(&run) => {
                        self.reclaim_run(&run, now_unix)
                    }
                    _ => {
                        tracing::debug!(external_ref = %task.external_ref, "already claimed");
                        Ok(ClaimOutcome::AlreadyClaimed)
                    }
                }
            }
        }
    }

    /// Re-claims PENDING runs in place. Their board items still carry the old
    /// marker, so `discover` never surfaces them again. A run is re-claimed only
    /// while its item is ready and unmarked or marked with this run's id; if the
    /// board can't be listed nothing is re-claimed this cycle.
    pub fn reclaim_pending(&self, now_unix: i64) -> Result<Vec<RunId>> {
        let pending = self.store.list_runs_by_state(RunState::Pending)?;
        if pending.is_empty() {
            return Ok(vec![]);
        }
        let ready = match self.board.list_ready() {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), pending = pending.len(), "board unavailable; re-claims deferred");
                return Ok(vec![]);
            }
        };

        let mut claimed = vec![];
        for run in pending {
            if !self.is_reclaimable(&ready, &run) {
                tracing::debug!(run_id = %run.id, external_ref = %run.external_ref, "board item not ready; left pending");
                continue;
            }
            match self.reclaim_run(&run, now_unix) {
                Ok(ClaimOutcome::Claimed { run_id, .. }) => claimed.push(run_id),
                Ok(ClaimOutcome::AlreadyClaimed) => {}
                Err(err) => tracing::warn!(run_id = %run.id, error = %format!("{err:#}"), "re-claim failed"),
            }
        }
        Ok(claimed)
    }

    /// Sweep, re-claim, discover, claim. Individual failures are logged and
    /// skipped; the returned ids are the runs that became CLAIMED this cycle.
    pub fn poll_cycle(&self, now_unix: i64) -> Vec<RunId> {
        if let Err(err) = self.reclaimer.sweep(self.store.as_ref(), now_unix) {
            tracing::warn!(error = %format!("{err:#}"), "stale sweep failed");
        }

        let mut claimed = match self.reclaim_pending(now_unix) {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "listing pending runs failed");
                vec![]
            }
        };

        let tasks = self.discover();
        let discovered = tasks.len();
        for task in &tasks {
            match self.claim(task, now_unix) {
                Ok(ClaimOutcome::Claimed { run_id, .. }) => claimed.push(run_id),
                Ok(ClaimOutcome::AlreadyClaimed) => {}
                Err(err) => {
                    tracing::warn!(external_ref = %task.external_ref, error = %format!("{err:#}"), "claim failed")
                }
            }
        }

        tracing::info!(discovered, claimed = claimed.len(), "poll cycle finished");
        claimed
    }

    fn is_reclaimable(&self, ready: &[BoardItem], run: &Run) -> bool {
        let schema = self.board.schema();
        ready
            .iter()
            .filter(|item| item.id == run.external_ref)
            .any(|item| item.claim_marker(schema).map_or(true, |marker| marker == run.id.as_str()))
    }

    fn board_still_ready(&self, run: &Run) -> bool {
        match self.board.list_ready() {
            Ok(ready) => self.is_reclaimable(&ready, run),
            Err(err) => {
                tracing::warn!(run_id = %run.id, error = %format!("{err:#}"), "board unavailable; re-claim deferred");
                false
            }
        }
    }

    fn reclaim_run(&self, run: &Run, now_unix: i64) -> Result<ClaimOutcome> {
        match retry_transition_run(self.store.as_ref(), &run.id, RunState::Claimed, RECLAIM_REASON, now_unix) {
            Ok(run) => {
                tracing::info!(run_id = %run.id, external_ref = %run.external_ref, retry_count = run.retry_count, "re-claimed run");
                let marker_written = self.write_marker(&run.external_ref, &run.id);
                Ok(ClaimOutcome::Claimed { run_id: run.id, marker_written })
            }
            // another caller re-claimed it first
            Err(TransitionError::Conflict { .. }) | Err(TransitionError::Invalid { .. }) => Ok(ClaimOutcome::AlreadyClaimed),
            Err(err) => Err(err.into()),
        }
    }

    fn write_marker(&self, external_ref: &ExternalRef, run_id: &RunId) -> bool {
        match self.board.attach_claim_marker(external_ref, run_id) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(run_id = %run_id, %external_ref, error = %format!("{err:#}"), "claim marker write failed; run left for stale reclaim");
                false
            }
        }
    }
}
