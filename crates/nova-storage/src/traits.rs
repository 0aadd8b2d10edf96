use nova_core::{sub_issues_all_closed, ExternalRef, NewRun, NewSubIssue, Run, RunId, RunState, StateChange, SubIssue, SubIssueStatus, TransitionRecord};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another caller already owns this external reference.
    DuplicateRejected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { from: RunState },
    NotFound,
    /// Conditional update refused: the run is no longer in the expected state.
    StateMismatch { actual: RunState },
}

/// Durable home of runs, sub-issues and the transition log.
///
/// Implementations must make `insert_run` atomic on the external reference and
/// must write every state change together with its transition record.
pub trait Datastore: Send + Sync {
    /// Insert a CLAIMED run plus its creation transition (`None -> CLAIMED`).
    fn insert_run(&self, new_run: &NewRun, reason: &str, now_unix: i64) -> anyhow::Result<InsertOutcome>;

    fn get_run(&self, run_id: &RunId) -> anyhow::Result<Option<Run>>;
    fn get_run_by_external_ref(&self, external_ref: &ExternalRef) -> anyhow::Result<Option<Run>>;

    /// Apply a state write. No transition legality is checked here; see `transition_run`.
    fn update_run_state(&self, change: &StateChange, now_unix: i64) -> anyhow::Result<UpdateOutcome>;

    /// Transition log of a run in commit order.
    fn list_transitions(&self, run_id: &RunId) -> anyhow::Result<Vec<TransitionRecord>>;

    /// Insert, or update an existing (run, worker_type) row and reset it to open.
    fn upsert_sub_issue(&self, run_id: &RunId, sub: &NewSubIssue, now_unix: i64) -> anyhow::Result<()>;

    /// Returns false when no such sub-issue exists.
    fn update_sub_issue_status(
        &self,
        run_id: &RunId,
        worker_type: &str,
        status: SubIssueStatus,
        merge_url: Option<&str>,
        now_unix: i64,
    ) -> anyhow::Result<bool>;

    fn list_sub_issues(&self, run_id: &RunId) -> anyhow::Result<Vec<SubIssue>>;

    fn all_sub_issues_closed(&self, run_id: &RunId) -> anyhow::Result<bool> {
        Ok(sub_issues_all_closed(&self.list_sub_issues(run_id)?))
    }

    fn list_runs_by_state(&self, state: RunState) -> anyhow::Result<Vec<Run>>;

    /// Runs in `state` whose claimed-at is strictly before `cutoff_unix`.
    fn list_runs_by_state_older_than(&self, state: RunState, cutoff_unix: i64) -> anyhow::Result<Vec<Run>>;
}
