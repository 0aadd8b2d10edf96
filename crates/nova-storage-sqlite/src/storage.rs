use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use nova_core::{
    ExternalRef, Metadata, NewRun, NewSubIssue, Run, RunId, RunState, StateChange, SubIssue, SubIssueStatus, TransitionRecord,
};
use nova_storage::{Datastore, InsertOutcome, UpdateOutcome};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

const RUN_COLUMNS: &str =
    "id, external_ref, state, title, description, target_resource, claimed_at, updated_at, completed_at, retry_count, metadata_json";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("apply schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn row_to_run(r: &Row<'_>) -> rusqlite::Result<Run> {
        Ok(Run {
            id: RunId::from_str(r.get::<_, String>(0)?),
            external_ref: ExternalRef::from_str(r.get::<_, String>(1)?),
            state: parse_col(r, 2)?,
            title: r.get(3)?,
            description: r.get(4)?,
            target_resource: r.get(5)?,
            claimed_at_unix: r.get(6)?,
            updated_at_unix: r.get(7)?,
            completed_at_unix: r.get(8)?,
            retry_count: u32_col(r, 9)?,
            metadata: metadata_col(r, 10)?,
        })
    }

    fn row_to_sub_issue(r: &Row<'_>) -> rusqlite::Result<SubIssue> {
        Ok(SubIssue {
            run_id: RunId::from_str(r.get::<_, String>(0)?),
            worker_type: r.get(1)?,
            issue_number: r.get(2)?,
            issue_url: r.get(3)?,
            title: r.get(4)?,
            description: r.get(5)?,
            status: parse_col(r, 6)?,
            merge_url: r.get(7)?,
            created_at_unix: r.get(8)?,
            updated_at_unix: r.get(9)?,
        })
    }

    fn query_runs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::row_to_run)?;
        let mut runs = vec![];
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}

fn parse_col<T>(r: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = r.get(idx)?;
    s.parse::<T>().map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn metadata_col(r: &Row<'_>, idx: usize) -> rusqlite::Result<Metadata> {
    let s: String = r.get(idx)?;
    serde_json::from_str(&s).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn u32_col(r: &Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let v: i64 = r.get(idx)?;
    u32::try_from(v).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

impl Datastore for SqliteStorage {
    fn insert_run(&self, new_run: &NewRun, reason: &str, now_unix: i64) -> Result<InsertOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // unique constraint on external_ref makes this the claim
        let res = tx.execute(
            "INSERT INTO runs(id, external_ref, state, title, description, target_resource, claimed_at, updated_at, retry_count, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0, '{}')",
            params![
                new_run.id.0,
                new_run.external_ref.0,
                RunState::Claimed.as_str(),
                new_run.title,
                new_run.description,
                new_run.target_resource,
                now_unix
            ],
        );
        match res {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                tracing::debug!(external_ref = %new_run.external_ref, "insert rejected by unique constraint");
                return Ok(InsertOutcome::DuplicateRejected);
            }
            Err(e) => return Err(e).with_context(|| format!("insert run for {}", new_run.external_ref)),
        }

        tx.execute(
            "INSERT INTO run_transitions(run_id, from_state, to_state, reason, metadata_json, created_at)
             VALUES (?1, NULL, ?2, ?3, '{}', ?4)",
            params![new_run.id.0, RunState::Claimed.as_str(), reason, now_unix],
        )?;
        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id=?1"), params![run_id.0], Self::row_to_run)
            .optional()?;
        Ok(run)
    }

    fn get_run_by_external_ref(&self, external_ref: &ExternalRef) -> Result<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE external_ref=?1"),
                params![external_ref.0],
                Self::row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn update_run_state(&self, change: &StateChange, now_unix: i64) -> Result<UpdateOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT state, metadata_json FROM runs WHERE id=?1",
                params![change.run_id.0],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((state, metadata_json)) = current else {
            return Ok(UpdateOutcome::NotFound);
        };
        let from: RunState = state.parse()?;
        if let Some(expected) = change.expected {
            if expected != from {
                return Ok(UpdateOutcome::StateMismatch { actual: from });
            }
        }

        let mut metadata: Metadata = serde_json::from_str(&metadata_json)
            .with_context(|| format!("parse stored metadata of run {}", change.run_id))?;
        for (k, v) in &change.metadata_patch {
            metadata.insert(k.clone(), v.clone());
        }
        let to = change.to.as_str();

        tx.execute(
            "UPDATE runs SET
               state=?1,
               updated_at=?2,
               completed_at=CASE WHEN ?1='DONE' THEN ?2 ELSE completed_at END,
               claimed_at=CASE WHEN ?1='CLAIMED' THEN ?2 ELSE claimed_at END,
               retry_count=retry_count + ?3,
               metadata_json=?4
             WHERE id=?5",
            params![to, now_unix, change.bump_retry as i64, serde_json::to_string(&metadata)?, change.run_id.0],
        )?;
        tx.execute(
            "INSERT INTO run_transitions(run_id, from_state, to_state, reason, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                change.run_id.0,
                from.as_str(),
                to,
                change.reason,
                serde_json::to_string(&change.metadata_patch)?,
                now_unix
            ],
        )?;
        tx.commit()?;
        Ok(UpdateOutcome::Updated { from })
    }

    fn list_transitions(&self, run_id: &RunId) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, run_id, from_state, to_state, reason, metadata_json, created_at
             FROM run_transitions WHERE run_id=?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run_id.0], |r| {
            let from_state: Option<String> = r.get(2)?;
            let from_state = match from_state {
                Some(s) => Some(
                    s.parse::<RunState>()
                        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
                ),
                None => None,
            };
            Ok(TransitionRecord {
                seq: r.get(0)?,
                run_id: RunId::from_str(r.get::<_, String>(1)?),
                from_state,
                to_state: parse_col(r, 3)?,
                reason: r.get(4)?,
                metadata: metadata_col(r, 5)?,
                created_at_unix: r.get(6)?,
            })
        })?;
        let mut out = vec![];
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn upsert_sub_issue(&self, run_id: &RunId, sub: &NewSubIssue, now_unix: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO run_sub_issues(run_id, worker_type, issue_number, issue_url, title, description, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?7)
             ON CONFLICT(run_id, worker_type) DO UPDATE SET
               issue_number=excluded.issue_number,
               issue_url=excluded.issue_url,
               title=excluded.title,
               description=excluded.description,
               status='open',
               updated_at=excluded.updated_at",
            params![run_id.0, sub.worker_type, sub.issue_number, sub.issue_url, sub.title, sub.description, now_unix],
        )
        .with_context(|| format!("upsert sub-issue {}/{}", run_id, sub.worker_type))?;
        Ok(())
    }

    fn update_sub_issue_status(
        &self,
        run_id: &RunId,
        worker_type: &str,
        status: SubIssueStatus,
        merge_url: Option<&str>,
        now_unix: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE run_sub_issues SET status=?1, merge_url=COALESCE(?2, merge_url), updated_at=?3
             WHERE run_id=?4 AND worker_type=?5",
            params![status.as_str(), merge_url, now_unix, run_id.0, worker_type],
        )?;
        Ok(n > 0)
    }

    fn list_sub_issues(&self, run_id: &RunId) -> Result<Vec<SubIssue>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, worker_type, issue_number, issue_url, title, description, status, merge_url, created_at, updated_at
             FROM run_sub_issues WHERE run_id=?1 ORDER BY worker_type",
        )?;
        let rows = stmt.query_map(params![run_id.0], Self::row_to_sub_issue)?;
        let mut out = vec![];
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn list_runs_by_state(&self, state: RunState) -> Result<Vec<Run>> {
        self.query_runs(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE state=?1 ORDER BY claimed_at"),
            params![state.as_str()],
        )
    }

    fn list_runs_by_state_older_than(&self, state: RunState, cutoff_unix: i64) -> Result<Vec<Run>> {
        self.query_runs(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE state=?1 AND claimed_at < ?2 ORDER BY claimed_at"),
            params![state.as_str(), cutoff_unix],
        )
    }
}
