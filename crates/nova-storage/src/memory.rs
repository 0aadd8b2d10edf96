use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use nova_core::{
    ExternalRef, NewRun, NewSubIssue, Run, RunId, RunState, StateChange, SubIssue, SubIssueStatus, TransitionRecord,
};

use crate::traits::{Datastore, InsertOutcome, UpdateOutcome};

/// In-memory datastore for tests. Not durable, but honours the same uniqueness and
/// atomicity guarantees as the SQLite store by doing every write under one lock.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Run>,
    by_external_ref: HashMap<String, RunId>,
    transitions: Vec<TransitionRecord>,
    // keyed by (run_id, worker_type); BTreeMap keeps listing order stable
    sub_issues: BTreeMap<(String, String), SubIssue>,
    next_seq: i64,
}

impl Inner {
    fn log(&mut self, run_id: &RunId, from: Option<RunState>, to: RunState, reason: &str, change: &StateChange, now_unix: i64) {
        self.next_seq += 1;
        self.transitions.push(TransitionRecord {
            seq: self.next_seq,
            run_id: run_id.clone(),
            from_state: from,
            to_state: to,
            reason: reason.to_string(),
            metadata: change.metadata_patch.clone(),
            created_at_unix: now_unix,
        });
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Datastore for InMemoryStorage {
    fn insert_run(&self, new_run: &NewRun, reason: &str, now_unix: i64) -> anyhow::Result<InsertOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_external_ref.contains_key(new_run.external_ref.as_str()) || inner.runs.contains_key(new_run.id.as_str()) {
            return Ok(InsertOutcome::DuplicateRejected);
        }
        let run = Run {
            id: new_run.id.clone(),
            external_ref: new_run.external_ref.clone(),
            state: RunState::Claimed,
            title: new_run.title.clone(),
            description: new_run.description.clone(),
            target_resource: new_run.target_resource.clone(),
            claimed_at_unix: now_unix,
            updated_at_unix: now_unix,
            completed_at_unix: None,
            retry_count: 0,
            metadata: Default::default(),
        };
        inner.by_external_ref.insert(new_run.external_ref.0.clone(), new_run.id.clone());
        inner.runs.insert(new_run.id.0.clone(), run);
        let creation = StateChange::new(&new_run.id, RunState::Claimed, reason);
        inner.log(&new_run.id, None, RunState::Claimed, reason, &creation, now_unix);
        Ok(InsertOutcome::Inserted)
    }

    fn get_run(&self, run_id: &RunId) -> anyhow::Result<Option<Run>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.runs.get(run_id.as_str()).cloned())
    }

    fn get_run_by_external_ref(&self, external_ref: &ExternalRef) -> anyhow::Result<Option<Run>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_external_ref
            .get(external_ref.as_str())
            .and_then(|id| inner.runs.get(id.as_str()))
            .cloned())
    }

    fn update_run_state(&self, change: &StateChange, now_unix: i64) -> anyhow::Result<UpdateOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(run) = inner.runs.get_mut(change.run_id.as_str()) else {
            return Ok(UpdateOutcome::NotFound);
        };
        let from = run.state;
        if let Some(expected) = change.expected {
            if expected != from {
                return Ok(UpdateOutcome::StateMismatch { actual: from });
            }
        }

        run.state = change.to;
        run.updated_at_unix = now_unix;
        if change.to == RunState::Done {
            run.completed_at_unix = Some(now_unix);
        }
        if change.to == RunState::Claimed {
            run.claimed_at_unix = now_unix;
        }
        if change.bump_retry {
            run.retry_count += 1;
        }
        for (k, v) in &change.metadata_patch {
            run.metadata.insert(k.clone(), v.clone());
        }

        let run_id = change.run_id.clone();
        inner.log(&run_id, Some(from), change.to, &change.reason, change, now_unix);
        Ok(UpdateOutcome::Updated { from })
    }

    fn list_transitions(&self, run_id: &RunId) -> anyhow::Result<Vec<TransitionRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.transitions.iter().filter(|t| &t.run_id == run_id).cloned().collect())
    }

    fn upsert_sub_issue(&self, run_id: &RunId, sub: &NewSubIssue, now_unix: i64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.runs.contains_key(run_id.as_str()) {
            anyhow::bail!("upsert sub-issue {}/{}: run not found", run_id, sub.worker_type);
        }
        let key = (run_id.0.clone(), sub.worker_type.clone());
        match inner.sub_issues.get_mut(&key) {
            Some(existing) => {
                existing.issue_number = sub.issue_number;
                existing.issue_url = sub.issue_url.clone();
                existing.title = sub.title.clone();
                existing.description = sub.description.clone();
                existing.status = SubIssueStatus::Open;
                existing.updated_at_unix = now_unix;
            }
            None => {
                inner.sub_issues.insert(key, SubIssue {
                    run_id: run_id.clone(),
                    worker_type: sub.worker_type.clone(),
                    issue_number: sub.issue_number,
                    issue_url: sub.issue_url.clone(),
                    title: sub.title.clone(),
                    description: sub.description.clone(),
                    status: SubIssueStatus::Open,
                    merge_url: None,
                    created_at_unix: now_unix,
                    updated_at_unix: now_unix,
                });
            }
        }
        Ok(())
    }

    fn update_sub_issue_status(
        &self,
        run_id: &RunId,
        worker_type: &str,
        status: SubIssueStatus,
        merge_url: Option<&str>,
        now_unix: i64,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(sub) = inner.sub_issues.get_mut(&(run_id.0.clone(), worker_type.to_string())) else {
            return Ok(false);
        };
        sub.status = status;
        sub.updated_at_unix = now_unix;
        if let Some(url) = merge_url {
            sub.merge_url = Some(url.to_string());
        }
        Ok(true)
    }

    fn list_sub_issues(&self, run_id: &RunId) -> anyhow::Result<Vec<SubIssue>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sub_issues.values().filter(|s| &s.run_id == run_id).cloned().collect())
    }

    fn list_runs_by_state(&self, state: RunState) -> anyhow::Result<Vec<Run>> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<Run> = inner.runs.values().filter(|r| r.state == state).cloned().collect();
        runs.sort_by_key(|r| r.claimed_at_unix);
        Ok(runs)
    }

    fn list_runs_by_state_older_than(&self, state: RunState, cutoff_unix: i64) -> anyhow::Result<Vec<Run>> {
        Ok(self
            .list_runs_by_state(state)?
            .into_iter()
            .filter(|r| r.claimed_at_unix < cutoff_unix)
            .collect())
    }
}
