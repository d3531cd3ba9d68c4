//! Parallel breadth-first traversal
//!
//! This module implements the traversal core: a single consumer thread that
//! preserves search order, fed by a pool of I/O workers executing directory
//! opens and stats.
//!
//! # Architecture
//!
//! ```text
//!                  ┌───────────────────────────┐
//!                  │        Consumer           │
//!                  │  - visit queue (ordered)  │
//!                  │  - readdir + callback     │
//!                  │  - fd cache (LRU, pinned) │
//!                  └─────────────┬─────────────┘
//!                                │ submit open/stat/close
//!        ┌───────────────────────┼───────────────────────┐
//!        │                       │                       │
//!  ┌─────▼─────┐           ┌─────▼─────┐           ┌─────▼─────┐
//!  │ ioq wrk 1 │           │ ioq wrk 2 │    ...    │ ioq wrk N │
//!  │  openat   │           │  fstatat  │           │   close   │
//!  └─────┬─────┘           └─────┬─────┘           └─────┬─────┘
//!        └───────────────────────┼───────────────────────┘
//!                                │ completions (seq ordered)
//!                  ┌─────────────▼─────────────┐
//!                  │      visit callback       │
//!                  │   Continue / Prune / Stop │
//!                  └───────────────────────────┘
//! ```
//!
//! The callback always runs on the calling thread; worker threads never see
//! traversal state beyond the submission and completion rings.

mod engine;
mod visit;

pub use visit::{Visit, VisitPhase, WalkControl, WalkSummary};

use crate::config::{Strategy, WalkOptions};
use crate::error::{Result, WalkerError};
use crate::ioq::{Backend, Ioq};
use engine::{Engine, PassBounds};
use std::time::Instant;
use tracing::debug;

/// Walk the configured roots, delivering every entry to `callback`
///
/// Fails only for fatal setup problems (invalid options, queue allocation);
/// per-entry errors are attached to visits and the traversal continues
/// unless the callback says [`WalkControl::Stop`].
pub fn walk<F>(options: &WalkOptions, callback: F) -> Result<WalkSummary>
where
    F: FnMut(&Visit) -> WalkControl,
{
    options.validate().map_err(WalkerError::Config)?;

    let start = Instant::now();
    let nthreads = options.effective_threads();
    let backend = pick_backend(options);
    let ioq = Ioq::with_backend(options.effective_queue_capacity(), nthreads, backend)?;

    debug!(
        roots = options.paths.len(),
        strategy = ?options.strategy,
        threads = nthreads,
        "starting walk"
    );

    let mut engine = Engine::new(options, ioq, nthreads, callback);
    match options.strategy {
        Strategy::Bfs | Strategy::Dfs => {
            engine.run_pass(PassBounds { lo: 0, hi: u32::MAX })?;
        }
        Strategy::Ids | Strategy::Eds => {
            let mut lo = 0u32;
            let mut hi = 0u32;
            loop {
                let truncated = engine.run_pass(PassBounds { lo, hi })?;
                if engine.stopped || !truncated {
                    break;
                }
                lo = hi.saturating_add(1);
                hi = match options.strategy {
                    Strategy::Ids => hi.saturating_add(1),
                    _ => hi.saturating_mul(2).max(1),
                };
            }
        }
    }

    Ok(engine.finish(start.elapsed()))
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
fn pick_backend(options: &WalkOptions) -> Backend {
    if options.ring {
        Backend::Ring
    } else {
        Backend::Threads
    }
}

#[cfg(not(all(target_os = "linux", feature = "io-uring")))]
fn pick_backend(options: &WalkOptions) -> Backend {
    if options.ring {
        debug!("ring backend requested but not compiled in; using threads");
    }
    Backend::Threads
}
