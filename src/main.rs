//! `tidemark`: bring the metadata cache of every configured storage up to date.
//!
//! Usage:
//!   tidemark scan [PATH] [--shallow]
//!   tidemark background-scan [PATH] [--limit N]
//!
//! `PATH` is a logical path and defaults to `/`. Logging goes to stderr and is
//! controlled by `RUST_LOG`, or by `-v` when that is unset.

mod error;
mod mounts;

use clap::{ArgAction, Parser, Subcommand};
use exn::ResultExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tidemark_cache::{Cache, Database};
use tidemark_config::Config;
use tidemark_scanner::error::ErrorKind as ScanErrorKind;
use tidemark_scanner::{ScanSummary, Scanner};
use tidemark_storage::Depth;
use tracing_subscriber::EnvFilter;

use crate::error::{ErrorKind, Result};

#[derive(Parser, Debug)]
#[command(name = "tidemark", version, about = "Keep a metadata cache of mounted storages in sync")]
struct Cli {
    /// Configuration file (default: the user's config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More output; repeat for more detail
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan every storage mounted beneath PATH
    Scan {
        #[arg(default_value = "/")]
        path: PathBuf,

        /// Only look at PATH and its direct children
        #[arg(long)]
        shallow: bool,
    },
    /// Complete directories left incomplete by earlier shallow scans
    BackgroundScan {
        #[arg(default_value = "/")]
        path: PathBuf,

        /// Directories to complete per storage (overrides the configuration)
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    let mounts = Arc::new(mounts::build(&config)?);
    if mounts.is_empty() {
        tracing::warn!("Nothing is mounted; check the `mounts` section of the configuration");
    }

    if let Some(parent) = config.database.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Database)?;
    }
    let db = Database::connect(&config.database).await.or_raise(|| ErrorKind::Database)?;
    let scanner = Scanner::new(mounts, Cache::from(&db));

    let result = match cli.command {
        Command::Scan { path, shallow } => {
            let depth = if shallow { Depth::Shallow } else { Depth::Recursive };
            scanner.with_depth(depth).scan(&path).await
        },
        Command::BackgroundScan { path, limit } => {
            let limit = limit.or(config.scan.background_limit);
            scanner.with_background_limit(limit).background_scan(&path).await
        },
    };
    db.close().await;

    match result {
        Ok(summary) => {
            report(&summary);
            Ok(())
        },
        Err(err) => {
            if let ScanErrorKind::Forbidden(mount) = &*err {
                eprintln!(
                    "hint: {} belongs to another user; run tidemark as the owner of that storage",
                    mount.display()
                );
            }
            Err(err).or_raise(|| ErrorKind::Scan)
        },
    }
}

fn report(summary: &ScanSummary) {
    if summary.is_unchanged() {
        println!("{} mount(s) scanned, nothing changed", summary.mounts);
        return;
    }
    println!(
        "{} mount(s) scanned, {} change(s), {} parent(s) updated",
        summary.mounts,
        summary.changes.len(),
        summary.propagated.len()
    );
    for path in &summary.changes {
        tracing::info!(path = %path.display(), "Changed");
    }
}
