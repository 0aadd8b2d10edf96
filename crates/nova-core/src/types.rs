use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*};

/// Free-form run metadata. Updates merge keys into the existing object.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A task as discovered on the board, before it is claimed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub external_ref: ExternalRef,
    pub title: String,
    pub description: String,
    pub target_resource: String,
    pub created_time: String,
}

/// Row written by a successful claim.
#[derive(Clone, Debug)]
pub struct NewRun {
    pub id: RunId,
    pub external_ref: ExternalRef,
    pub title: String,
    pub description: String,
    pub target_resource: String,
}

impl NewRun {
    pub fn from_task(task: &TaskDescriptor) -> Self {
        Self {
            id: RunId::new(),
            external_ref: task.external_ref.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            target_resource: task.target_resource.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub external_ref: ExternalRef,
    pub state: RunState,
    pub title: String,
    pub description: String,
    pub target_resource: String,
    pub claimed_at_unix: i64,
    pub updated_at_unix: i64,
    pub completed_at_unix: Option<i64>,
    pub retry_count: u32,
    pub metadata: Metadata,
}

/// Append-only audit entry. `from_state` is `None` only for the creation record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: i64,
    pub run_id: RunId,
    pub from_state: Option<RunState>,
    pub to_state: RunState,
    pub reason: String,
    pub metadata: Metadata,
    pub created_at_unix: i64,
}

/// A requested state write.
///
/// `expected` turns the write into a conditional update: it is only applied
/// while the run is still in that state.
#[derive(Clone, Debug)]
pub struct StateChange {
    pub run_id: RunId,
    pub expected: Option<RunState>,
    pub to: RunState,
    pub reason: String,
    pub metadata_patch: Metadata,
    pub bump_retry: bool,
}

impl StateChange {
    pub fn new(run_id: &RunId, to: RunState, reason: impl Into<String>) -> Self {
        Self {
            run_id: run_id.clone(),
            expected: None,
            to,
            reason: reason.into(),
            metadata_patch: Metadata::new(),
            bump_retry: false,
        }
    }

    pub fn expecting(mut self, from: RunState) -> Self {
        self.expected = Some(from);
        self
    }

    pub fn with_metadata(mut self, patch: Metadata) -> Self {
        self.metadata_patch = patch;
        self
    }

    pub fn bump_retry(mut self) -> Self {
        self.bump_retry = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubIssue {
    pub worker_type: String,
    pub issue_number: i64,
    pub issue_url: String,
    pub title: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubIssue {
    pub run_id: RunId,
    pub worker_type: String,
    pub issue_number: i64,
    pub issue_url: String,
    pub title: String,
    pub description: String,
    pub status: SubIssueStatus,
    pub merge_url: Option<String>,
    pub created_at_unix: i64,
    pub updated_at_unix: i64,
}

/// A run is ready for validation only when it has sub-issues and all are closed.
pub fn sub_issues_all_closed(issues: &[SubIssue]) -> bool {
    !issues.is_empty() && issues.iter().all(|i| i.status == SubIssueStatus::Closed)
}
