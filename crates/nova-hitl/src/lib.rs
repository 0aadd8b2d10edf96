use nova_core::{allowed_next, Run, RunState};

/// Markdown notice for a run that was escalated to BLOCKED and waits on a human.
pub fn format_blocked_notice(run: &Run, reason: &str) -> String {
    let mut s = String::new();
    s.push_str(&format!("# BLOCKED: {} ({})\n\n", run.title, run.id));
    s.push_str(&format!("**Task:** {}\n", run.external_ref));
    s.push_str(&format!("**Resource:** {}\n\n", run.target_resource));
    s.push_str(&format!("**Decision needed:** {}\n\n", reason));
    s.push_str("## Options\n");
    for (i, next) in allowed_next(RunState::Blocked).iter().enumerate() {
        s.push_str(&format!("- [{}] {}: {}\n", i + 1, next, option_hint(*next)));
    }
    s.push_str(&format!("\n**Resolve with:** nova transition --run {} --to <STATE> --reason <why>\n", run.id));
    s
}

fn option_hint(state: RunState) -> &'static str {
    match state {
        RunState::Working => "resume work on the sub-issues",
        RunState::Merging => "accept as validated and merge",
        RunState::Failed => "abandon the run",
        _ => "",
    }
}
