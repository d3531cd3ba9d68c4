//! Configuration types for bfs-walker
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime walk options with validation
//! - File descriptor budget helpers (`RLIMIT_NOFILE`)

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use std::io;
use std::path::PathBuf;

/// Maximum reasonable worker count
const MAX_THREADS: usize = 512;

/// Minimum I/O queue capacity
const MIN_QUEUE_CAPACITY: usize = 2;

/// Minimum descriptor cache capacity
const MIN_CACHE_CAPACITY: usize = 4;

/// Descriptors reserved for the rest of the process (stdio, logging, the
/// getdents buffers' owner, whatever the callback opens)
const FD_RESERVE: u64 = 16;

/// Search strategy, selected with `-S`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Strategy {
    /// Strict breadth-first: depth d is exhausted before depth d+1
    #[default]
    Bfs,
    /// Strict depth-first preorder
    Dfs,
    /// Iterative deepening: depth-limited passes, bound +1 each time
    Ids,
    /// Exponential deepening: like ids, but the bound doubles
    Eds,
}

/// What to do at mount points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MountPolicy {
    /// Descend across mount points
    #[default]
    Crossing,
    /// Do not descend into a different filesystem; the mount point itself
    /// is still visited
    NoCross,
    /// Only descend within the filesystem each root started on
    SameFs,
}

/// Symlink handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FollowPolicy {
    /// Never follow symlinks
    #[default]
    Physical,
    /// Follow symlinks given as roots only
    CommandLine,
    /// Follow all symlinks; cycles are detected and reported
    Logical,
}

/// Runtime options for [`walk`](crate::walker::walk)
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Root paths, visited in order
    pub paths: Vec<PathBuf>,

    /// Search strategy
    pub strategy: Strategy,

    /// I/O worker threads (0 = one per core, capped)
    pub threads: usize,

    /// Outstanding request capacity of the I/O queue (0 = default)
    pub queue_capacity: usize,

    /// Descriptor cache capacity (0 = derive from `RLIMIT_NOFILE`)
    pub cache_capacity: usize,

    /// Suppress visits shallower than this depth (still traversed)
    pub min_depth: u32,

    /// Do not emit or descend past this depth
    pub max_depth: u32,

    /// Mount point policy
    pub mount: MountPolicy,

    /// Symlink policy
    pub follow: FollowPolicy,

    /// Deliver post-order visits for directories
    pub post_order: bool,

    /// Honor [`WalkControl::Prune`](crate::walker::WalkControl::Prune)
    pub honor_prune: bool,

    /// On a mid-stream readdir error, keep the children read so far instead
    /// of discarding the partial directory
    pub recover: bool,

    /// Stat every entry through the I/O queue instead of lazily
    pub eager_stat: bool,

    /// Sort each directory's children by name before emission
    pub sort: bool,

    /// Use the kernel I/O ring backend when available
    pub ring: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        WalkOptions {
            paths: Vec::new(),
            strategy: Strategy::default(),
            threads: 0,
            queue_capacity: 0,
            cache_capacity: 0,
            min_depth: 0,
            max_depth: u32::MAX,
            mount: MountPolicy::default(),
            follow: FollowPolicy::default(),
            post_order: false,
            honor_prune: true,
            recover: false,
            eager_stat: false,
            sort: false,
            ring: false,
        }
    }
}

impl WalkOptions {
    /// Options for the given roots, everything else default
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> WalkOptions {
        WalkOptions {
            paths: paths.into_iter().map(Into::into).collect(),
            ..WalkOptions::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.paths.is_empty() {
            return Err(ConfigError::NoPaths);
        }
        for path in &self.paths {
            if path.as_os_str().is_empty()
                || path.as_os_str().as_encoded_bytes().contains(&0)
            {
                return Err(ConfigError::InvalidPath { path: path.clone() });
            }
        }
        if self.threads > MAX_THREADS {
            return Err(ConfigError::InvalidThreadCount {
                count: self.threads,
                max: MAX_THREADS,
            });
        }
        if self.queue_capacity != 0 && self.queue_capacity < MIN_QUEUE_CAPACITY {
            return Err(ConfigError::InvalidQueueCapacity {
                capacity: self.queue_capacity,
                min: MIN_QUEUE_CAPACITY,
            });
        }
        if self.cache_capacity != 0 && self.cache_capacity < MIN_CACHE_CAPACITY {
            return Err(ConfigError::InvalidCacheCapacity {
                capacity: self.cache_capacity,
                min: MIN_CACHE_CAPACITY,
            });
        }
        if self.min_depth > self.max_depth {
            return Err(ConfigError::InvalidDepthRange {
                min: self.min_depth,
                max: self.max_depth,
            });
        }
        Ok(())
    }

    /// Worker thread count after defaulting
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            default_threads()
        }
    }

    /// I/O queue capacity after defaulting
    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            self.queue_capacity
        } else {
            crate::ioq::DEFAULT_CAPACITY
        }
    }

    /// Descriptor cache capacity after defaulting
    pub fn effective_cache_capacity(&self) -> usize {
        if self.cache_capacity > 0 {
            self.cache_capacity
        } else {
            derive_cache_capacity()
        }
    }
}

/// Default worker count: one per core, capped
fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

/// Raise the soft `RLIMIT_NOFILE` to the hard limit
///
/// A caller concern, not the engine's: the binary calls this once at
/// startup. Returns the resulting soft limit.
pub fn raise_fd_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if limit.rlim_cur < limit.rlim_max {
        limit.rlim_cur = limit.rlim_max;
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(limit.rlim_cur as u64)
}

/// Descriptor cache capacity derived from the current soft `RLIMIT_NOFILE`,
/// minus a reserve for the rest of the process
pub fn derive_cache_capacity() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let soft = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur as u64
    } else {
        256
    };
    soft.saturating_sub(FD_RESERVE).clamp(MIN_CACHE_CAPACITY as u64, 4096) as usize
}

/// Parallel breadth-first `find`-style walker
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bfs-walker",
    version,
    about = "Parallel breadth-first filesystem walker",
    long_about = "Walks one or more directory trees with a parallel, breadth-first \
                  traversal engine and prints every path found.\n\n\
                  Directory opens and stats are executed by a pool of I/O workers \
                  while a single consumer thread preserves strict search order.",
    after_help = "EXAMPLES:\n    \
        bfs-walker /srv/data\n    \
        bfs-walker -S dfs -j 8 /srv/data\n    \
        bfs-walker --max-depth 3 --post-order /etc /var\n    \
        bfs-walker -S ids --mount no-cross /"
)]
pub struct CliArgs {
    /// Root paths to walk
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,

    /// Search strategy
    #[arg(short = 'S', long, value_enum, default_value_t = Strategy::Bfs)]
    pub strategy: Strategy,

    /// Number of I/O worker threads (default: one per core, capped)
    #[arg(short = 'j', long, default_value = "0", value_name = "NUM")]
    pub threads: usize,

    /// Suppress output above this depth (still traversed)
    #[arg(long, default_value = "0", value_name = "NUM")]
    pub min_depth: u32,

    /// Do not descend past this depth
    #[arg(short = 'd', long, value_name = "NUM")]
    pub max_depth: Option<u32>,

    /// Mount point policy
    #[arg(long, value_enum, default_value_t = MountPolicy::Crossing)]
    pub mount: MountPolicy,

    /// Follow symlinks given as roots (like find -H)
    #[arg(short = 'H', conflicts_with = "logical")]
    pub comfollow: bool,

    /// Follow all symlinks (like find -L)
    #[arg(short = 'L', long)]
    pub logical: bool,

    /// Visit directories again after their contents (like find -depth)
    #[arg(long)]
    pub post_order: bool,

    /// Keep partial directory listings when readdir fails mid-stream
    #[arg(long)]
    pub recover: bool,

    /// Sort each directory's children by name
    #[arg(short = 's', long)]
    pub sort: bool,

    /// Use the kernel I/O ring backend when available
    #[arg(long)]
    pub ring: bool,

    /// Quiet mode - suppress the summary line
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl CliArgs {
    /// Convert parsed arguments into validated walk options
    pub fn into_options(self) -> Result<WalkOptions, ConfigError> {
        let follow = if self.logical {
            FollowPolicy::Logical
        } else if self.comfollow {
            FollowPolicy::CommandLine
        } else {
            FollowPolicy::Physical
        };

        let options = WalkOptions {
            paths: self.paths,
            strategy: self.strategy,
            threads: self.threads,
            min_depth: self.min_depth,
            max_depth: self.max_depth.unwrap_or(u32::MAX),
            mount: self.mount,
            follow,
            post_order: self.post_order,
            recover: self.recover,
            sort: self.sort,
            ring: self.ring,
            ..WalkOptions::default()
        };
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_invalid_without_paths() {
        let options = WalkOptions::default();
        assert!(matches!(options.validate(), Err(ConfigError::NoPaths)));
    }

    #[test]
    fn test_new_with_paths_validates() {
        let options = WalkOptions::new(["/tmp"]);
        options.validate().unwrap();
        assert_eq!(options.strategy, Strategy::Bfs);
        assert!(options.effective_threads() >= 1);
        assert!(options.effective_queue_capacity() >= MIN_QUEUE_CAPACITY);
        assert!(options.effective_cache_capacity() >= MIN_CACHE_CAPACITY);
    }

    #[test]
    fn test_depth_range_validation() {
        let mut options = WalkOptions::new(["/tmp"]);
        options.min_depth = 5;
        options.max_depth = 2;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidDepthRange { min: 5, max: 2 })
        ));
    }

    #[test]
    fn test_cli_follow_flags() {
        let args = CliArgs::parse_from(["bfs-walker", "-L", "/tmp"]);
        let options = args.into_options().unwrap();
        assert_eq!(options.follow, FollowPolicy::Logical);

        let args = CliArgs::parse_from(["bfs-walker", "-H", "/tmp"]);
        let options = args.into_options().unwrap();
        assert_eq!(options.follow, FollowPolicy::CommandLine);
    }

    #[test]
    fn test_cli_strategy_parses() {
        let args = CliArgs::parse_from(["bfs-walker", "-S", "eds", "/tmp"]);
        assert_eq!(args.strategy, Strategy::Eds);
    }

    #[test]
    fn test_derive_cache_capacity_sane() {
        let capacity = derive_cache_capacity();
        assert!(capacity >= MIN_CACHE_CAPACITY);
        assert!(capacity <= 4096);
    }
}
