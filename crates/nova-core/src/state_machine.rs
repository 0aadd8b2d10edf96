use crate::RunState;

/// Legal out-edges of the run lifecycle graph.
///
/// PENDING -> CLAIMED -> WORKING -> VALIDATING -> MERGING -> DONE, with FAILED
/// and BLOCKED reachable from every non-terminal working state. BLOCKED resumes
/// into WORKING or MERGING.
pub fn allowed_next(state: RunState) -> &'static [RunState] {
    use RunState::{Blocked, Claimed, Done, Failed, Merging, Pending, Validating, Working};
    match state {
        Pending => &[Claimed],
        Claimed => &[Working, Failed, Blocked],
        Working => &[Validating, Failed, Blocked],
        Validating => &[Merging, Blocked, Failed],
        Merging => &[Done, Failed, Blocked],
        Blocked => &[Working, Merging, Failed],
        Done | Failed => &[],
    }
}

pub fn is_valid(from: RunState, to: RunState) -> bool {
    allowed_next(from).contains(&to)
}

pub fn is_terminal(state: RunState) -> bool {
    matches!(state, RunState::Done | RunState::Failed)
}

/// BLOCKED runs are held for a human decision and never advanced automatically.
pub fn requires_human_approval(state: RunState) -> bool {
    state == RunState::Blocked
}

/// Recovery edge used by the stale-claim sweep. Deliberately outside `allowed_next`.
pub fn is_reclaim_edge(from: RunState, to: RunState) -> bool {
    from == RunState::Claimed && to == RunState::Pending
}
