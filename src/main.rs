//! bfs-walker - Parallel breadth-first filesystem walker
//!
//! Entry point for the CLI application: prints every visited path, reports
//! per-entry errors on stderr, and exits non-zero if any occurred.

use anyhow::{Context, Result};
use bfs_walker::config::{self, CliArgs};
use bfs_walker::{walk, VisitPhase, WalkControl};
use clap::Parser;
use std::io::Write;
use std::process::ExitCode;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("bfs-walker: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;

    let quiet = args.quiet;
    let post_order_output = args.post_order;
    let options = args.into_options().context("Invalid configuration")?;

    // Grow the descriptor budget before the cache capacity is derived
    // from it.
    match config::raise_fd_limit() {
        Ok(limit) => debug!(limit, "file descriptor limit"),
        Err(e) => warn!(error = %e, "could not raise file descriptor limit"),
    }

    // Buffer stdout; a walk can print millions of lines.
    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());

    let summary = walk(&options, |visit| {
        if let Some(err) = visit.error() {
            eprintln!("bfs-walker: '{}': {}", visit.path().display(), err);
            return WalkControl::Continue;
        }

        // With --post-order, directories print after their contents, the
        // way find -depth does; otherwise everything prints pre-order.
        let printable = if post_order_output {
            visit.phase() == VisitPhase::Post
                || visit.file_type().map_or(true, |t| !t.is_dir())
        } else {
            visit.phase() == VisitPhase::Pre
        };
        if printable && writeln!(out, "{}", visit.path().display()).is_err() {
            // Downstream pipe closed; stop quietly like find does.
            return WalkControl::Stop;
        }
        WalkControl::Continue
    })?;
    out.flush().ok();

    if !quiet {
        eprintln!(
            "{} entries ({} directories), {} errors in {:.2?}",
            summary.visits, summary.directories, summary.errors, summary.duration
        );
    }

    Ok(summary.is_clean())
}

/// Configure tracing output
///
/// Defaults to warnings only; `-v` turns on debug for this crate.
/// `RUST_LOG` overrides both.
fn setup_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "bfs_walker=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
