use std::future::Future;

use anyhow::Result;
use nova_core::{NewSubIssue, Run, SubIssue, SubIssueStatus};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    /// Needs a human; the run goes to BLOCKED.
    Escalate { reason: String },
    Fail { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubIssueReport {
    pub status: SubIssueStatus,
    pub merge_url: Option<String>,
}

/// The work performed on a dispatched run, one method per lifecycle stage.
///
/// Errors are treated as a failed run; the dispatcher records them and moves on.
pub trait Worker: Send + Sync + 'static {
    fn create_issues(&self, run: &Run) -> impl Future<Output = Result<Vec<NewSubIssue>>> + Send;

    fn dispatch(&self, run: &Run, sub_issue: &SubIssue) -> impl Future<Output = Result<SubIssueReport>> + Send;

    fn validate(&self, run: &Run, sub_issues: &[SubIssue]) -> impl Future<Output = Result<Verdict>> + Send;

    fn merge(&self, run: &Run) -> impl Future<Output = Result<Verdict>> + Send;

    fn notify(&self, run: &Run) -> impl Future<Output = Result<()>> + Send;
}

/// Hands each run to someone outside the process.
///
/// One sub-issue per run; it stays as-is until closed externally (`nova
/// sub-issue`). Validation always escalates so a human signs off before merge.
#[derive(Clone, Debug, Default)]
pub struct HandoffWorker;

pub const HANDOFF_WORKER_TYPE: &str = "handoff";

impl Worker for HandoffWorker {
    async fn create_issues(&self, run: &Run) -> Result<Vec<NewSubIssue>> {
        Ok(vec![NewSubIssue {
            worker_type: HANDOFF_WORKER_TYPE.to_string(),
            issue_number: 0,
            issue_url: String::new(),
            title: run.title.clone(),
            description: run.description.clone(),
        }])
    }

    async fn dispatch(&self, _run: &Run, sub_issue: &SubIssue) -> Result<SubIssueReport> {
        Ok(SubIssueReport { status: sub_issue.status, merge_url: sub_issue.merge_url.clone() })
    }

    async fn validate(&self, _run: &Run, _sub_issues: &[SubIssue]) -> Result<Verdict> {
        Ok(Verdict::Escalate { reason: "review the handed-off work before merge".to_string() })
    }

    async fn merge(&self, _run: &Run) -> Result<Verdict> {
        Ok(Verdict::Pass)
    }

    async fn notify(&self, run: &Run) -> Result<()> {
        tracing::info!(run_id = %run.id, external_ref = %run.external_ref, "run done");
        Ok(())
    }
}
