use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nova_board::{JsonFileBoard, TaskExtractors, TaskSource};
use nova_claim::{ClaimProtocol, StaleReclaimer};
use nova_concurrency::{ConcurrencyManager, ConcurrencyStatus};
use nova_core::{Metadata, Run, RunId, RunState, SubIssue, SubIssueStatus, TransitionRecord};
use nova_storage::Datastore;
use nova_storage_sqlite::SqliteStorage;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};

use crate::{now_unix, Config, DispatchError, DispatchOutcome, Dispatcher, Worker};

#[derive(Clone, Debug, Serialize)]
pub struct PollReport {
    pub claimed: Vec<RunId>,
    pub dispatched: Vec<(RunId, DispatchOutcome)>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub runs_by_state: BTreeMap<RunState, usize>,
    pub concurrency: ConcurrencyStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunDetails {
    pub run: Run,
    pub sub_issues: Vec<SubIssue>,
    pub transitions: Vec<TransitionRecord>,
}

pub struct Runner<W> {
    pub root: PathBuf,
    pub cfg: Config,
    pub store: Arc<dyn Datastore>,
    pub claims: ClaimProtocol,
    pub dispatcher: Dispatcher<W>,
}

impl<W: Worker> Runner<W> {
    /// Opens the SQLite datastore and JSON board configured under `root`.
    pub fn open(root: PathBuf, worker: W) -> Result<Self> {
        let cfg_path = Config::config_path(&root);
        let mut cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let cfg = Config::default();
            cfg.save_to(&cfg_path)?;
            cfg
        };
        cfg.apply_env();
        cfg.validate()?;

        let store: Arc<dyn Datastore> = Arc::new(SqliteStorage::open(&cfg.db_path(&root))?);
        let board: Arc<dyn TaskSource> = Arc::new(JsonFileBoard::open(&cfg.board_path(&root), cfg.board.schema.clone()));
        tracing::debug!(root = %root.display(), "runner opened");
        Ok(Self::from_parts(root, cfg, store, board, worker))
    }

    /// Wires already-open boundaries; `cfg` is assumed validated.
    pub fn from_parts(root: PathBuf, cfg: Config, store: Arc<dyn Datastore>, board: Arc<dyn TaskSource>, worker: W) -> Self {
        let claims = ClaimProtocol::new(
            store.clone(),
            board,
            TaskExtractors::with_default_resource(&cfg.board.default_resource),
            StaleReclaimer::new(cfg.stale_timeout_secs()),
        );
        let concurrency = Arc::new(ConcurrencyManager::new(cfg.concurrency.clone()));
        let dispatcher = Dispatcher::new(store.clone(), concurrency, Arc::new(worker));
        Self { root, cfg, store, claims, dispatcher }
    }

    pub fn init_repo(root: &Path) -> Result<()> {
        let cfg_path = Config::config_path(root);
        if !cfg_path.exists() {
            Config::default().save_to(&cfg_path)?;
        }
        let mut cfg = Config::load_from(&cfg_path)?;
        cfg.apply_env();
        cfg.validate()?;
        // create db
        let _ = SqliteStorage::open(&cfg.db_path(root))?;
        JsonFileBoard::init(&cfg.board_path(root))?;
        Ok(())
    }

    /// One claim cycle followed by one dispatch round.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let claimed = self.claims.poll_cycle(now_unix());
        let dispatched = self.dispatcher.dispatch_ready().await.context("dispatch ready runs")?;
        Ok(PollReport { claimed, dispatched })
    }

    /// Polls every `poller.interval_seconds` until ctrl-c.
    pub async fn serve(&self) -> Result<()> {
        let mut tick = interval(Duration::from_secs(self.cfg.poller.interval_seconds));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_seconds = self.cfg.poller.interval_seconds, "serving");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.poll_once().await {
                        Ok(report) => tracing::info!(claimed = report.claimed.len(), dispatched = report.dispatched.len(), "poll done"),
                        Err(e) => tracing::warn!("poll error: {e:?}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub fn status(&self) -> Result<StatusReport> {
        let mut runs_by_state = BTreeMap::new();
        for state in RunState::ALL {
            runs_by_state.insert(state, self.store.list_runs_by_state(state)?.len());
        }
        Ok(StatusReport { runs_by_state, concurrency: self.dispatcher.concurrency().status() })
    }

    pub fn show(&self, run_id: &RunId) -> Result<RunDetails> {
        let run = self.store.get_run(run_id)?.ok_or_else(|| anyhow!("run {run_id} not found"))?;
        Ok(RunDetails {
            sub_issues: self.store.list_sub_issues(run_id)?,
            transitions: self.store.list_transitions(run_id)?,
            run,
        })
    }

    /// Operator transition. BLOCKED runs go through human approval; everything
    /// else is a plain checked transition.
    pub fn transition(&self, run_id: &RunId, to: RunState, reason: &str) -> Result<Run, DispatchError> {
        let run = self.store.get_run(run_id)?.ok_or_else(|| DispatchError::NotFound(run_id.clone()))?;
        if run.state == RunState::Blocked {
            return self.dispatcher.resolve_blocked(run_id, to, reason);
        }
        Ok(self.dispatcher.transition(run_id, to, reason, Metadata::new())?)
    }

    /// Records the outcome of a sub-issue worked outside the process.
    pub fn set_sub_issue_status(
        &self,
        run_id: &RunId,
        worker_type: &str,
        status: SubIssueStatus,
        merge_url: Option<&str>,
    ) -> Result<()> {
        if !self.store.update_sub_issue_status(run_id, worker_type, status, merge_url, now_unix())? {
            return Err(anyhow!("no {worker_type} sub-issue for run {run_id}"));
        }
        Ok(())
    }

    pub fn sweep(&self) -> Result<usize> {
        self.claims.reclaimer().sweep(self.store.as_ref(), now_unix())
    }
}
