//! bfs-walker - Parallel Breadth-First Filesystem Walker
//!
//! A `find(1)`-style traversal engine whose distinguishing feature is a
//! parallel, breadth-first directory walk. A single consumer thread owns the
//! traversal order and the user callback while a pool of I/O workers
//! executes `openat`/`fstatat`/`close` concurrently, connected by a bounded
//! submission/completion pipeline.
//!
//! # Features
//!
//! - **Strict search order**: breadth-first, depth-first, and iterative /
//!   exponential deepening strategies, with well-defined ordering despite
//!   out-of-order I/O completion.
//!
//! - **Bounded descriptors**: open directory handles live in a pinned LRU
//!   cache sized from `RLIMIT_NOFILE`; eviction and `openat`-chain reopening
//!   keep deep and wide trees within budget, and paths beyond `PATH_MAX`
//!   work without truncation.
//!
//! - **Backpressure and cancellation**: directory opens are pipelined up to
//!   `2 × workers + 1`; the callback can prune subtrees or stop the whole
//!   walk without leaking a descriptor.
//!
//! - **Optional kernel I/O ring**: with the `io-uring` feature, workers
//!   batch submissions through a kernel ring instead of issuing one
//!   blocking syscall each.
//!
//! # Example
//!
//! ```no_run
//! use bfs_walker::{walk, WalkControl, WalkOptions};
//!
//! let options = WalkOptions::new(["/etc"]);
//! let summary = walk(&options, |visit| {
//!     println!("{}", visit.path().display());
//!     WalkControl::Continue
//! })?;
//! eprintln!("{} entries", summary.visits);
//! # Ok::<(), bfs_walker::WalkerError>(())
//! ```

pub mod config;
pub mod dirent;
pub mod error;
pub mod fdcache;
pub mod ioq;
pub mod paths;
pub mod stat;
pub mod walker;

pub use config::{CliArgs, FollowPolicy, MountPolicy, Strategy, WalkOptions};
pub use error::{Result, WalkerError};
pub use stat::{FileStat, FileType};
pub use walker::{walk, Visit, VisitPhase, WalkControl, WalkSummary};
