//! Visit-facing types
//!
//! A [`Visit`] is what the traversal hands to the user callback: the
//! rendered path, identity and depth, a type hint, any discovery error, and
//! lazy access to a stat buffer. The callback steers the walk with a
//! [`WalkControl`].

use crate::stat::{self, FileStat, FileType};
use std::cell::Cell;
use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

/// Which side of a directory a visit is on
///
/// Non-directories only ever get [`VisitPhase::Pre`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitPhase {
    /// Before the directory's children (or the only visit of a leaf)
    Pre,
    /// After the directory's entire subtree has finished
    Post,
}

/// Callback verdict controlling the traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep going
    Continue,
    /// Skip this directory's children; the directory itself stays visited
    Prune,
    /// Graceful shutdown: no further visits, resources reclaimed
    Stop,
}

/// Where a lazy stat should look
#[derive(Debug, Clone, Copy)]
pub(crate) enum StatSource<'a> {
    /// `fstatat` relative to a cached parent descriptor
    At { dirfd: RawFd, name: &'a OsStr },
    /// `fstatat` on the full path from the working directory
    FullPath,
}

/// One file delivered to the visit callback
///
/// Borrowed from the engine for the duration of the callback; nothing here
/// escapes the call.
#[derive(Debug)]
pub struct Visit<'a> {
    pub(crate) path: &'a Path,
    pub(crate) name: &'a OsStr,
    pub(crate) depth: u32,
    pub(crate) phase: VisitPhase,
    pub(crate) file_type: Option<FileType>,
    pub(crate) error: Option<&'a io::Error>,
    pub(crate) stat_cache: Cell<Option<Result<FileStat, i32>>>,
    pub(crate) stat_source: StatSource<'a>,
    pub(crate) follow: bool,
}

impl<'a> Visit<'a> {
    /// Full path of the entry
    pub fn path(&self) -> &Path {
        self.path
    }

    /// Base name of the entry (for roots, the path as given)
    pub fn name(&self) -> &OsStr {
        self.name
    }

    /// Depth below the root; roots are 0
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Pre- or post-order
    pub fn phase(&self) -> VisitPhase {
        self.phase
    }

    /// Type hint, if discovery produced one
    ///
    /// `None` means the directory stream gave no `d_type`; call
    /// [`Visit::stat`] for an authoritative answer.
    pub fn file_type(&self) -> Option<FileType> {
        self.file_type
    }

    /// The discovery error attached to this entry, if any
    ///
    /// Entries with an error have no children.
    pub fn error(&self) -> Option<&io::Error> {
        self.error
    }

    /// The entry's stat buffer, materialized on first use
    ///
    /// Uses the parent directory descriptor as an `openat` anchor when it is
    /// still cached, falling back to the full path. Symlink following obeys
    /// the walk's follow policy. The result is cached for the duration of
    /// the visit.
    pub fn stat(&self) -> io::Result<FileStat> {
        if let Some(res) = self.stat_cache.get() {
            return res.map_err(io::Error::from_raw_os_error);
        }

        let res = match self.stat_source {
            StatSource::At { dirfd, name } => CString::new(name.as_bytes())
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
                .and_then(|name| stat::fstatat(dirfd, &name, self.follow)),
            StatSource::FullPath => CString::new(self.path.as_os_str().as_bytes())
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
                .and_then(|path| stat::fstatat(libc::AT_FDCWD, &path, self.follow)),
        };

        let cached = match &res {
            Ok(st) => Ok(*st),
            Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
        };
        self.stat_cache.set(Some(cached));
        res
    }
}

/// Final tally of a finished walk
#[derive(Debug, Clone)]
pub struct WalkSummary {
    /// Callback invocations, pre and post
    pub visits: u64,

    /// Directories visited pre-order
    pub directories: u64,

    /// Entries delivered with an error attached
    pub errors: u64,

    /// True when the callback ended the walk with [`WalkControl::Stop`]
    pub stopped: bool,

    /// Wall-clock duration of the walk
    pub duration: Duration,
}

impl WalkSummary {
    /// True when every entry was delivered error-free
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}
