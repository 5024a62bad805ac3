//! fanout-web CLI.
//!
//! `serve` runs the full read/command API; `dashboard` runs the same
//! router in read-only mode for observation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use fanout_core::config::Config;
use fanout_web::{router, ApiState};
use fanoutd::persistence::SqliteStore;

const EXIT_CONFIG: u8 = 1;
const EXIT_CORRUPT_STORE: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    read_only: bool,
    port: Option<u16>,
    db: Option<PathBuf>,
}

const USAGE: &str = "usage:
  fanout-web serve [--port PORT] [--db PATH]       read/command API
  fanout-web dashboard [--port PORT] [--db PATH]   read-only dashboard API";

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut iter = args.iter();
    let read_only = match iter.next().map(String::as_str) {
        Some("serve") => false,
        Some("dashboard") => true,
        Some(other) => return Err(format!("unknown command: {other}")),
        None => return Err("missing command".to_string()),
    };

    let mut port = None;
    let mut db = None;
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--port" => {
                let raw = iter.next().ok_or("--port requires a value")?;
                port = Some(
                    raw.parse::<u16>()
                        .map_err(|err| format!("invalid port '{raw}': {err}"))?,
                );
            }
            "--db" => {
                db = Some(PathBuf::from(iter.next().ok_or("--db requires a path")?));
            }
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    Ok(CliArgs {
        read_only,
        port,
        db,
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw_args) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("{USAGE}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fanout-web: configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let db_path = args.db.unwrap_or_else(|| config.storage_path.clone());
    let port = args.port.unwrap_or(config.dashboard_port);

    let store = match SqliteStore::open(&db_path) {
        Ok(store) => Arc::new(store),
        Err(err) if err.is_corruption() => {
            eprintln!(
                "fanout-web: store at {} is corrupt: {err}",
                db_path.display()
            );
            return ExitCode::from(EXIT_CORRUPT_STORE);
        }
        Err(err) => {
            eprintln!(
                "fanout-web: cannot open store at {}: {err}",
                db_path.display()
            );
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let state = ApiState::new(store, db_path, args.read_only);
    match serve(state, port) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fanout-web: server error: {err}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn serve(state: ApiState, port: u16) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let mode = if state.read_only {
            "dashboard (read-only)"
        } else {
            "serve"
        };
        tracing::info!("fanout-web {mode} listening on http://{addr}");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_args(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn serve_and_dashboard_set_read_only_flag() {
        let serve = parse_args(&to_args(&["serve"])).expect("parse serve");
        assert!(!serve.read_only);

        let dashboard =
            parse_args(&to_args(&["dashboard", "--port", "4000", "--db", "/tmp/x.db"]))
                .expect("parse dashboard");
        assert!(dashboard.read_only);
        assert_eq!(dashboard.port, Some(4000));
        assert_eq!(dashboard.db, Some(PathBuf::from("/tmp/x.db")));
    }

    #[test]
    fn rejects_unknown_commands_and_bad_ports() {
        assert!(parse_args(&to_args(&[])).is_err());
        assert!(parse_args(&to_args(&["frob"])).is_err());
        assert!(parse_args(&to_args(&["serve", "--port", "not-a-port"])).is_err());
    }
}
