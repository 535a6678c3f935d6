use std::{
    error::Error,
    fs::File,
    io::{self, BufReader, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use escrow_ledger::{
    host::Host,
    ledger::{JobId, MilestoneId},
    logging, EscrowBook, HostConfig, SettlementPlan,
};

#[derive(Parser)]
#[command(name = "escrow-ledger", version, about = "Replay and inspect a freelance escrow ledger")]
struct Cli {
    /// JSON config file; built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Snapshot file, overrides `state_path` from the config.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply JSONL transactions ("-" for stdin) and print one receipt per line.
    Replay {
        input: PathBuf,
        /// Do not write the resulting snapshot.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show a job with its milestones and accounting summary.
    Job { job_id: JobId },
    Milestone {
        job_id: JobId,
        milestone_id: MilestoneId,
    },
    /// List jobs, optionally only those involving an account.
    Jobs {
        #[arg(long)]
        account: Option<String>,
    },
    Events {
        #[arg(long)]
        job: Option<JobId>,
    },
    /// Print the fund transfers implied by the ledger and the resulting balances.
    Settlement {
        #[arg(long)]
        job: Option<JobId>,
    },
    /// Print block height and state root.
    Root,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    if let Some(state) = cli.state {
        config.state_path = state;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.log_json |= cli.log_json;
    config.validate()?;
    logging::init_tracing(&config.log_level, config.log_json)?;

    let mut host = Host::load(&config.state_path, config.limits)?;

    match cli.command {
        Command::Replay { input, dry_run } => {
            let receipts = if input.as_os_str() == "-" {
                host.replay(io::stdin().lock())?
            } else {
                let file = File::open(&input)
                    .map_err(|e| format!("cannot open {}: {e}", input.display()))?;
                host.replay(BufReader::new(file))?
            };
            let mut out = io::stdout().lock();
            for receipt in &receipts {
                writeln!(out, "{}", serde_json::to_string(receipt)?)?;
            }
            if !dry_run {
                host.save(&config.state_path)?;
            }
        }
        Command::Job { job_id } => {
            let ledger = host.ledger();
            print_json(&json!({
                "job": ledger.get_job(job_id)?,
                "milestones": ledger.milestones(job_id)?,
                "summary": ledger.summary(job_id)?,
            }))?;
        }
        Command::Milestone {
            job_id,
            milestone_id,
        } => print_json(host.ledger().get_milestone(job_id, milestone_id)?)?,
        Command::Jobs { account } => {
            let ledger = host.ledger();
            let jobs: Vec<_> = match &account {
                Some(account) => ledger.jobs_for(account),
                None => ledger.jobs().collect(),
            };
            print_json(&jobs)?;
        }
        Command::Events { job } => {
            let events: Vec<_> = host
                .ledger()
                .events()
                .iter()
                .filter(|e| job.map_or(true, |id| e.job_id() == id))
                .collect();
            print_json(&events)?;
        }
        Command::Settlement { job } => {
            let events = host.ledger().events();
            let plan = match job {
                Some(job_id) => SettlementPlan::for_job(events, job_id),
                None => SettlementPlan::from_events(events),
            };
            let mut book = EscrowBook::new();
            book.apply(&plan)?;
            print_json(&json!({ "plan": plan, "book": book }))?;
        }
        Command::Root => print_json(&json!({
            "height": host.meta().height,
            "previous_tx": host.meta().previous_tx,
            "state_root": host.state_root(),
        }))?,
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Box<dyn Error>> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}
