use nova_core::{is_reclaim_edge, RunState, StateChange};
use nova_storage::{Datastore, UpdateOutcome};

pub const STALE_REASON: &str = "stale claim timeout";

/// Returns runs that sat in CLAIMED past the timeout to the unclaimed pool.
///
/// CLAIMED -> PENDING is a recovery edge outside the lifecycle graph, so it is
/// written directly rather than through `transition_run`. The write is still
/// conditional on CLAIMED; a run that moved on in the meantime is left alone.
#[derive(Clone, Debug)]
pub struct StaleReclaimer {
    timeout_secs: i64,
}

impl StaleReclaimer {
    /// Negative timeouts are treated as zero.
    pub fn new(timeout_secs: i64) -> Self {
        Self { timeout_secs: timeout_secs.max(0) }
    }

    /// Saturates at `i64::MAX` seconds, i.e. claims never go stale.
    pub fn from_minutes(minutes: u64) -> Self {
        Self::new(i64::try_from(minutes).ok().and_then(|m| m.checked_mul(60)).unwrap_or(i64::MAX))
    }

    pub fn timeout_secs(&self) -> i64 {
        self.timeout_secs
    }

    pub fn sweep(&self, store: &dyn Datastore, now_unix: i64) -> anyhow::Result<usize> {
        let cutoff = now_unix.saturating_sub(self.timeout_secs);
        let stale = store.list_runs_by_state_older_than(RunState::Claimed, cutoff)?;

        let mut released = 0;
        for run in stale {
            if !is_reclaim_edge(run.state, RunState::Pending) {
                continue;
            }
            let change = StateChange::new(&run.id, RunState::Pending, STALE_REASON).expecting(RunState::Claimed);
            match store.update_run_state(&change, now_unix)? {
                UpdateOutcome::Updated { .. } => {
                    tracing::info!(run_id = %run.id, external_ref = %run.external_ref, claimed_at = run.claimed_at_unix, "released stale claim");
                    released += 1;
                }
                UpdateOutcome::StateMismatch { actual } => {
                    tracing::debug!(run_id = %run.id, %actual, "run progressed before reclaim; skipped");
                }
                UpdateOutcome::NotFound => {}
            }
        }
        if released > 0 {
            tracing::info!(released, "stale sweep finished");
        }
        Ok(released)
    }
}

impl Default for StaleReclaimer {
    fn default() -> Self {
        Self::from_minutes(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_core::{ExternalRef, Metadata, NewRun, RunId};
    use nova_storage::{transition_run, InMemoryStorage};

    const T0: i64 = 1_700_000_000;

    fn insert(store: &InMemoryStorage, id: &str, ext: &str, at: i64) -> RunId {
        let new_run = NewRun {
            id: RunId::from_str(id),
            external_ref: ExternalRef::from_str(ext),
            title: "t".into(),
            description: String::new(),
            target_resource: "repo-a".into(),
        };
        store.insert_run(&new_run, "claimed", at).unwrap();
        new_run.id
    }

    #[test]
    fn releases_only_claims_past_the_timeout() {
        let store = InMemoryStorage::new();
        let old = insert(&store, "r1", "ext-1", T0);
        let fresh = insert(&store, "r2", "ext-2", T0 + 29 * 60);

        let released = StaleReclaimer::default().sweep(&store, T0 + 31 * 60).unwrap();
        assert_eq!(released, 1);

        let run = store.get_run(&old).unwrap().unwrap();
        assert_eq!(run.state, RunState::Pending);
        let last = store.list_transitions(&old).unwrap().pop().unwrap();
        assert_eq!(last.from_state, Some(RunState::Claimed));
        assert_eq!(last.to_state, RunState::Pending);
        assert_eq!(last.reason, STALE_REASON);

        assert_eq!(store.get_run(&fresh).unwrap().unwrap().state, RunState::Claimed);
    }

    #[test]
    fn progressed_runs_are_untouched() {
        let store = InMemoryStorage::new();
        let run_id = insert(&store, "r1", "ext-1", T0);
        transition_run(&store, &run_id, RunState::Working, "started", Metadata::new(), T0 + 60).unwrap();

        assert_eq!(StaleReclaimer::default().sweep(&store, T0 + 31 * 60).unwrap(), 0);
        assert_eq!(store.get_run(&run_id).unwrap().unwrap().state, RunState::Working);
        assert_eq!(store.list_transitions(&run_id).unwrap().len(), 2);
    }

    #[test]
    fn oversized_timeout_saturates_instead_of_wrapping() {
        let store = InMemoryStorage::new();
        let run_id = insert(&store, "r1", "ext-1", T0);

        let reclaimer = StaleReclaimer::from_minutes(u64::MAX);
        assert_eq!(reclaimer.timeout_secs(), i64::MAX);
        assert_eq!(reclaimer.sweep(&store, T0 + 365 * 24 * 3600).unwrap(), 0);
        let huge = StaleReclaimer::from_minutes(i64::MAX as u64 / 60 + 1);
        assert_eq!(huge.timeout_secs(), i64::MAX);
        assert_eq!(huge.sweep(&store, T0 + 60).unwrap(), 0);

        assert_eq!(StaleReclaimer::new(-5).timeout_secs(), 0);
        assert_eq!(store.get_run(&run_id).unwrap().unwrap().state, RunState::Claimed);
    }

    #[test]
    fn second_sweep_finds_nothing() {
        let store = InMemoryStorage::new();
        insert(&store, "r1", "ext-1", T0);
        let reclaimer = StaleReclaimer::new(60);
        assert_eq!(reclaimer.sweep(&store, T0 + 120).unwrap(), 1);
        assert_eq!(reclaimer.sweep(&store, T0 + 240).unwrap(), 0);
    }
}
