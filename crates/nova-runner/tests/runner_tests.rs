use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use nova_board::{InMemoryBoard, TaskSource};
use nova_core::{
    ExternalRef, Metadata, NewRun, NewSubIssue, Run, RunId, RunState, StateChange, SubIssue, SubIssueStatus,
    TransitionRecord,
};
use nova_runner::{
    Config, DispatchError, DispatchOutcome, HandoffWorker, Runner, SubIssueReport, Verdict, Worker, HANDOFF_WORKER_TYPE,
    SUB_ISSUE_COUNT_KEY,
};
use nova_storage::{Datastore, InMemoryStorage, InsertOutcome, TransitionError, UpdateOutcome};
use serde_json::json;
use tempfile::tempdir;

#[derive(Default)]
struct ScriptedWorker {
    fail_create: bool,
    validate: Option<Verdict>,
    merge: Option<Verdict>,
    delay_ms: u64,
    notified: AtomicUsize,
}

impl Worker for ScriptedWorker {
    async fn create_issues(&self, run: &Run) -> Result<Vec<NewSubIssue>> {
        if self.fail_create {
            bail!("tracker unavailable");
        }
        Ok(["frontend", "backend"]
            .iter()
            .enumerate()
            .map(|(i, w)| NewSubIssue {
                worker_type: w.to_string(),
                issue_number: i as i64 + 1,
                issue_url: format!("https://tracker.example/{}", i + 1),
                title: format!("{} ({w})", run.title),
                description: String::new(),
            })
            .collect())
    }

    async fn dispatch(&self, _run: &Run, sub_issue: &SubIssue) -> Result<SubIssueReport> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(SubIssueReport {
            status: SubIssueStatus::Closed,
            merge_url: Some(format!("https://vcs.example/pr/{}", sub_issue.issue_number)),
        })
    }

    async fn validate(&self, _run: &Run, sub_issues: &[SubIssue]) -> Result<Verdict> {
        assert!(sub_issues.iter().all(|s| s.status == SubIssueStatus::Closed));
        Ok(self.validate.clone().unwrap_or(Verdict::Pass))
    }

    async fn merge(&self, _run: &Run) -> Result<Verdict> {
        Ok(self.merge.clone().unwrap_or(Verdict::Pass))
    }

    async fn notify(&self, _run: &Run) -> Result<()> {
        self.notified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn runner<W: Worker>(worker: W) -> (Arc<InMemoryStorage>, Arc<InMemoryBoard>, Runner<W>) {
    let store = Arc::new(InMemoryStorage::new());
    let board = Arc::new(InMemoryBoard::new());
    let runner = Runner::from_parts(PathBuf::from("."), Config::default(), store.clone(), board.clone(), worker);
    (store, board, runner)
}

fn states(store: &InMemoryStorage, run: &nova_core::RunId) -> Vec<RunState> {
    store.list_transitions(run).unwrap().iter().map(|t| t.to_state).collect()
}

#[tokio::test]
async fn claimed_run_is_driven_to_done() {
    let (store, board, runner) = runner(ScriptedWorker::default());
    board.add_ready("ext-42", "Fix login", "repo-a");

    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.claimed.len(), 1);
    let run_id = report.claimed[0].clone();
    assert_eq!(report.dispatched, vec![(run_id.clone(), DispatchOutcome::Progressed { state: RunState::Done })]);

    assert_eq!(
        states(&store, &run_id),
        vec![RunState::Claimed, RunState::Working, RunState::Validating, RunState::Merging, RunState::Done]
    );
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert!(run.completed_at_unix.is_some());
    let subs = store.list_sub_issues(&run_id).unwrap();
    assert_eq!(subs.len(), 2);
    assert!(subs.iter().all(|s| s.merge_url.is_some()));

    // terminal runs are left alone
    assert!(runner.poll_once().await.unwrap().dispatched.is_empty());
    assert_eq!(runner.dispatcher.dispatch(&run_id).await.unwrap(), DispatchOutcome::Skipped { state: RunState::Done });
}

#[tokio::test]
async fn distinct_resources_all_complete() {
    let (store, board, runner) = runner(ScriptedWorker::default());
    board.add_ready("ext-1", "one", "repo-a");
    board.add_ready("ext-2", "two", "repo-b");

    runner.poll_once().await.unwrap();
    assert_eq!(store.list_runs_by_state(RunState::Done).unwrap().len(), 2);
    let status = runner.status().unwrap();
    assert_eq!(status.runs_by_state[&RunState::Done], 2);
    assert_eq!(status.concurrency.global_available, 3);
}

#[tokio::test]
async fn escalation_blocks_until_a_human_resolves() {
    let worker = ScriptedWorker {
        validate: Some(Verdict::Escalate { reason: "tests flaky".into() }),
        ..Default::default()
    };
    let (store, board, runner) = runner(worker);
    board.add_ready("ext-1", "one", "repo-a");

    let run_id = runner.poll_once().await.unwrap().claimed.remove(0);
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Blocked);
    assert_eq!(run.metadata["blocked_reason"], "tests flaky");
    assert!(run.metadata["hitl_notice"].as_str().unwrap().contains("tests flaky"));

    // blocked runs are not driven
    assert_eq!(runner.dispatcher.dispatch(&run_id).await.unwrap(), DispatchOutcome::Skipped { state: RunState::Blocked });

    let err = runner.transition(&run_id, RunState::Done, "ship it").unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Transition(TransitionError::Invalid { from: RunState::Blocked, to: RunState::Done, .. })
    ));

    runner.transition(&run_id, RunState::Merging, "approved").unwrap();
    assert_eq!(
        runner.dispatcher.dispatch(&run_id).await.unwrap(),
        DispatchOutcome::Progressed { state: RunState::Done }
    );
    assert_eq!(store.get_run(&run_id).unwrap().unwrap().metadata["resolution"], "approved");
}

#[tokio::test]
async fn worker_errors_fail_the_run() {
    let worker = ScriptedWorker { fail_create: true, ..Default::default() };
    let (store, board, runner) = runner(worker);
    board.add_ready("ext-1", "one", "repo-a");

    let run_id = runner.poll_once().await.unwrap().claimed.remove(0);
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.metadata["failure_reason"].as_str().unwrap().contains("tracker unavailable"));
    assert_eq!(states(&store, &run_id), vec![RunState::Claimed, RunState::Failed]);
}

/// In-memory store whose n-th sub-issue upsert fails.
struct FailingUpsert {
    inner: InMemoryStorage,
    fail_on: usize,
    upserts: AtomicUsize,
}

impl Datastore for FailingUpsert {
    fn insert_run(&self, new_run: &NewRun, reason: &str, now_unix: i64) -> Result<InsertOutcome> {
        self.inner.insert_run(new_run, reason, now_unix)
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.inner.get_run(run_id)
    }

    fn get_run_by_external_ref(&self, external_ref: &ExternalRef) -> Result<Option<Run>> {
        self.inner.get_run_by_external_ref(external_ref)
    }

    fn update_run_state(&self, change: &StateChange, now_unix: i64) -> Result<UpdateOutcome> {
        self.inner.update_run_state(change, now_unix)
    }

    fn list_transitions(&self, run_id: &RunId) -> Result<Vec<TransitionRecord>> {
        self.inner.list_transitions(run_id)
    }

    fn upsert_sub_issue(&self, run_id: &RunId, sub: &NewSubIssue, now_unix: i64) -> Result<()> {
        if self.upserts.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            bail!("disk full");
        }
        self.inner.upsert_sub_issue(run_id, sub, now_unix)
    }

    fn update_sub_issue_status(
        &self,
        run_id: &RunId,
        worker_type: &str,
        status: SubIssueStatus,
        merge_url: Option<&str>,
        now_unix: i64,
    ) -> Result<bool> {
        self.inner.update_sub_issue_status(run_id, worker_type, status, merge_url, now_unix)
    }

    fn list_sub_issues(&self, run_id: &RunId) -> Result<Vec<SubIssue>> {
        self.inner.list_sub_issues(run_id)
    }

    fn list_runs_by_state(&self, state: RunState) -> Result<Vec<Run>> {
        self.inner.list_runs_by_state(state)
    }

    fn list_runs_by_state_older_than(&self, state: RunState, cutoff_unix: i64) -> Result<Vec<Run>> {
        self.inner.list_runs_by_state_older_than(state, cutoff_unix)
    }
}

#[tokio::test]
async fn partially_recorded_sub_issues_fail_the_run() {
    let store = Arc::new(FailingUpsert { inner: InMemoryStorage::new(), fail_on: 2, upserts: AtomicUsize::new(0) });
    let board = Arc::new(InMemoryBoard::new());
    let runner = Runner::from_parts(PathBuf::from("."), Config::default(), store.clone(), board.clone(), ScriptedWorker::default());
    board.add_ready("ext-1", "one", "repo-a");

    let report = runner.poll_once().await.unwrap();
    let run_id = report.claimed[0].clone();
    assert_eq!(report.dispatched, vec![(run_id.clone(), DispatchOutcome::Progressed { state: RunState::Failed })]);

    let run = store.get_run(&run_id).unwrap().unwrap();
    assert!(run.metadata["failure_reason"].as_str().unwrap().contains("disk full"));
    let to: Vec<_> = store.list_transitions(&run_id).unwrap().iter().map(|t| t.to_state).collect();
    assert_eq!(to, vec![RunState::Claimed, RunState::Failed]);

    // nothing moves it on later
    runner.poll_once().await.unwrap();
    assert_eq!(store.get_run(&run_id).unwrap().unwrap().state, RunState::Failed);
}

#[tokio::test]
async fn working_run_without_sub_issues_is_failed() {
    let (store, board, runner) = runner(ScriptedWorker::default());
    board.add_ready("ext-1", "one", "repo-a");
    let run_id = runner.claims.poll_cycle(nova_runner::now_unix()).remove(0);

    // operator pushes it past sub-issue creation
    runner.transition(&run_id, RunState::Working, "manual start").unwrap();
    assert_eq!(
        runner.dispatcher.dispatch(&run_id).await.unwrap(),
        DispatchOutcome::Progressed { state: RunState::Failed }
    );
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.metadata["failure_reason"], "no sub-issues recorded");
}

#[tokio::test]
async fn working_run_missing_a_sub_issue_does_not_validate() {
    let (store, board, runner) = runner(ScriptedWorker::default());
    board.add_ready("ext-1", "one", "repo-a");
    let run_id = runner.claims.poll_cycle(nova_runner::now_unix()).remove(0);

    let mut patch = Metadata::new();
    patch.insert(SUB_ISSUE_COUNT_KEY.into(), json!(2));
    runner.dispatcher.transition(&run_id, RunState::Working, "dispatch started", patch).unwrap();
    let only = NewSubIssue {
        worker_type: "frontend".into(),
        issue_number: 1,
        issue_url: String::new(),
        title: "one (frontend)".into(),
        description: String::new(),
    };
    store.upsert_sub_issue(&run_id, &only, 100).unwrap();
    store.update_sub_issue_status(&run_id, "frontend", SubIssueStatus::Closed, None, 101).unwrap();

    runner.dispatcher.dispatch(&run_id).await.unwrap();
    let run = store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.metadata["failure_reason"], "only 1 of 2 sub-issues recorded");
    assert!(!states(&store, &run_id).contains(&RunState::Validating));
}

#[tokio::test]
async fn merge_failure_is_recorded() {
    let worker = ScriptedWorker { merge: Some(Verdict::Fail { reason: "conflict".into() }), ..Default::default() };
    let (store, board, runner) = runner(worker);
    board.add_ready("ext-1", "one", "repo-a");

    let run_id = runner.poll_once().await.unwrap().claimed.remove(0);
    let transitions = store.list_transitions(&run_id).unwrap();
    let last = transitions.last().unwrap();
    assert_eq!(last.from_state, Some(RunState::Merging));
    assert_eq!(last.to_state, RunState::Failed);
    assert_eq!(last.reason, "conflict");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_resource_one_run_at_a_time() {
    let worker = ScriptedWorker { delay_ms: 100, ..Default::default() };
    let (store, board, runner) = runner(worker);
    board.add_ready("ext-1", "one", "repo-a");
    board.add_ready("ext-2", "two", "repo-a");

    let report = runner.poll_once().await.unwrap();
    assert_eq!(report.claimed.len(), 2);
    let busy = report.dispatched.iter().filter(|(_, o)| *o == DispatchOutcome::Busy).count();
    assert_eq!(busy, 1);
    assert_eq!(store.list_runs_by_state(RunState::Done).unwrap().len(), 1);
    assert_eq!(store.list_runs_by_state(RunState::Claimed).unwrap().len(), 1);

    // the busy run goes through on the next cycle
    runner.poll_once().await.unwrap();
    assert_eq!(store.list_runs_by_state(RunState::Done).unwrap().len(), 2);
}

#[tokio::test]
async fn handoff_waits_for_external_close() {
    let (store, board, runner) = runner(HandoffWorker);
    board.add_ready("ext-1", "one", "repo-a");

    let run_id = runner.poll_once().await.unwrap().claimed.remove(0);
    assert_eq!(store.get_run(&run_id).unwrap().unwrap().state, RunState::Working);
    runner.poll_once().await.unwrap();
    assert_eq!(store.get_run(&run_id).unwrap().unwrap().state, RunState::Working);

    runner
        .set_sub_issue_status(&run_id, HANDOFF_WORKER_TYPE, SubIssueStatus::Closed, Some("https://vcs.example/pr/9"))
        .unwrap();
    assert!(runner.set_sub_issue_status(&run_id, "nope", SubIssueStatus::Closed, None).is_err());

    runner.poll_once().await.unwrap();
    assert_eq!(store.get_run(&run_id).unwrap().unwrap().state, RunState::Blocked);

    let details = runner.show(&run_id).unwrap();
    assert_eq!(details.sub_issues[0].merge_url.as_deref(), Some("https://vcs.example/pr/9"));
    assert_eq!(details.transitions.len(), 4);
}

#[tokio::test]
async fn opens_sqlite_and_json_board_from_config() {
    let dir = tempdir().unwrap();
    Runner::<HandoffWorker>::init_repo(dir.path()).unwrap();
    let cfg = Config::load_from(&Config::config_path(dir.path())).unwrap();
    std::fs::write(
        cfg.board_path(dir.path()),
        r#"[{"id":"ext-5","properties":{
              "Status":{"type":"status","value":"Agent's Turn"},
              "Name":{"type":"title","value":"From file"}}}]"#,
    )
    .unwrap();

    let runner = Runner::open(dir.path().to_path_buf(), HandoffWorker).unwrap();
    let run_id = runner.poll_once().await.unwrap().claimed.remove(0);
    let run = runner.store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(run.target_resource, "papkot-ai");
    assert_eq!(run.title, "From file");

    // marker landed in the file, so a second runner discovers nothing new
    drop(runner);
    let again = Runner::open(dir.path().to_path_buf(), HandoffWorker).unwrap();
    assert!(again.claims.discover().is_empty());
    assert_eq!(again.sweep().unwrap(), 0);
    let board = nova_board::JsonFileBoard::open(&cfg.board_path(dir.path()), cfg.board.schema.clone());
    assert!(board.list_ready().unwrap()[0].claim_marker(board.schema()).is_some());
}
