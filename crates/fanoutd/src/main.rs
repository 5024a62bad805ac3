//! fanoutd CLI: the supervisor entry point plus developer utilities.
//!
//! `run-job <job_id>` is what `spawn_detached` re-executes; it runs
//! one job's supervisor loop in this (detached) process. `reset` wipes
//! the development store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use fanout_agents::runner::ClaudeCliWorker;
use fanout_core::config::Config;
use fanout_core::types::JobId;
use fanoutd::executor::JobExecutor;
use fanoutd::persistence::SqliteStore;
use fanoutd::signal::install_stop_handlers;

const EXIT_CONFIG: u8 = 1;
const EXIT_CORRUPT_STORE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    RunJob { job_id: String, db: Option<PathBuf> },
    Reset { db: Option<PathBuf> },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fanoutd: configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match command {
        Command::RunJob { job_id, db } => run_job(&job_id, db, config),
        Command::Reset { db } => reset(db, config),
    }
}

const USAGE: &str = "usage:
  fanoutd run-job <job_id> [--db PATH]   run the supervisor for one job
  fanoutd reset [--db PATH]              delete the development store";

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut iter = args.iter();
    let command = iter
        .next()
        .ok_or_else(|| "missing command".to_string())?;

    match command.as_str() {
        "run-job" => {
            let mut job_id = None;
            let mut db = None;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--db" => {
                        db = Some(PathBuf::from(iter.next().ok_or("--db requires a path")?));
                    }
                    other if job_id.is_none() && !other.starts_with("--") => {
                        job_id = Some(other.to_string());
                    }
                    other => return Err(format!("unexpected argument: {other}")),
                }
            }
            Ok(Command::RunJob {
                job_id: job_id.ok_or("run-job requires a job id")?,
                db,
            })
        }
        "reset" => {
            let mut db = None;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--db" => {
                        db = Some(PathBuf::from(iter.next().ok_or("--db requires a path")?));
                    }
                    other => return Err(format!("unexpected argument: {other}")),
                }
            }
            Ok(Command::Reset { db })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

fn run_job(job_id: &str, db: Option<PathBuf>, config: Config) -> ExitCode {
    let db_path = db.unwrap_or_else(|| config.storage_path.clone());
    let store = match SqliteStore::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(err) if err.is_corruption() => {
            eprintln!("fanoutd: store at {} is corrupt: {err}", db_path.display());
            return ExitCode::from(EXIT_CORRUPT_STORE);
        }
        Err(err) => {
            eprintln!("fanoutd: cannot open store at {}: {err}", db_path.display());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let stop = install_stop_handlers();
    let worker = Arc::new(ClaudeCliWorker::with_file_access());
    let executor = JobExecutor::new(
        JobId::new(job_id),
        store,
        worker,
        Duration::from_secs(config.worker_timeout_secs),
        stop,
    );

    match executor.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("supervisor for job {job_id} failed: {err}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn reset(db: Option<PathBuf>, config: Config) -> ExitCode {
    let db_path = db.unwrap_or_else(|| config.storage_path.clone());
    let mut removed = 0usize;
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.clone().into_os_string();
        path.push(suffix);
        let path = PathBuf::from(path);
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                eprintln!("fanoutd: cannot remove {}: {err}", path.display());
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }
    println!(
        "removed {removed} store file(s) at {}",
        db_path.display()
    );
    ExitCode::SUCCESS
}
