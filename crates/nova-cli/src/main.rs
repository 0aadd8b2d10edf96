use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nova_core::{RunId, RunState, SubIssueStatus};
use nova_runner::{HandoffWorker, Runner, HANDOFF_WORKER_TYPE};

#[derive(Parser)]
#[command(name = "nova", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize novaos in the current directory (creates .nova/, config, db, board)
    Init,

    /// Run one poll cycle: sweep, claim, dispatch
    Poll,

    /// Poll periodically until ctrl-c
    Serve,

    /// Runs per state and the concurrency snapshot
    Status,

    /// Show a run with its sub-issues and transition log
    Show {
        #[arg(long)]
        run: String,
    },

    /// Move a run along a lifecycle edge (BLOCKED runs: human approval)
    Transition {
        #[arg(long)]
        run: String,
        #[arg(long)]
        to: RunState,
        #[arg(long)]
        reason: String,
    },

    /// Record the status of a sub-issue worked outside novaos
    SubIssue {
        #[arg(long)]
        run: String,
        #[arg(long, default_value = HANDOFF_WORKER_TYPE)]
        worker_type: String,
        #[arg(long, default_value = "closed")]
        status: SubIssueStatus,
        #[arg(long)]
        merge_url: Option<String>,
    },

    /// Release stale claims now
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let root = std::env::current_dir()?;

    match cli.cmd {
        Command::Init => {
            Runner::<HandoffWorker>::init_repo(&root)?;
            println!("Initialized novaos in {}", root.display());
        }
        Command::Poll => {
            let r = Runner::open(root, HandoffWorker)?;
            let report = r.poll_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Serve => {
            let r = Runner::open(root, HandoffWorker)?;
            r.serve().await?;
        }
        Command::Status => {
            let r = Runner::open(root, HandoffWorker)?;
            let status = r.status()?;
            for (state, count) in &status.runs_by_state {
                println!("{:<11} {}", state, count);
            }
            println!(
                "Workers: {}/{} free, per-resource limit {}",
                status.concurrency.global_available, status.concurrency.global_limit, status.concurrency.per_resource_limit
            );
        }
        Command::Show { run } => {
            let r = Runner::open(root, HandoffWorker)?;
            let details = r.show(&RunId::from_str(run))?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        Command::Transition { run, to, reason } => {
            let r = Runner::open(root, HandoffWorker)?;
            let run = r.transition(&RunId::from_str(run), to, &reason)?;
            println!("{} -> {}", run.id, run.state);
        }
        Command::SubIssue { run, worker_type, status, merge_url } => {
            let r = Runner::open(root, HandoffWorker)?;
            r.set_sub_issue_status(&RunId::from_str(run.clone()), &worker_type, status, merge_url.as_deref())?;
            println!("{} {} -> {}", run, worker_type, status.as_str());
        }
        Command::Sweep => {
            let r = Runner::open(root, HandoffWorker)?;
            let released = r.sweep()?;
            println!("Released {} stale claim(s)", released);
        }
    }

    Ok(())
}
