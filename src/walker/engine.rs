//! The traversal engine
//!
//! A single consumer thread owns all traversal state and runs the user
//! callback; the I/O queue workers only ever execute `openat`/`fstatat`/
//! `close` on its behalf. The engine is a state machine over three pieces:
//!
//! - the *visit queue*: entries discovered but not yet delivered, in
//!   emission order (FIFO for breadth-first, LIFO insertion for
//!   depth-first);
//! - the *in-flight set*: submitted opens and stats, keyed by token;
//! - the *subtree table*: refcounted bookkeeping for directories whose
//!   streams have been read, driving post-order visits and descriptor
//!   lifetimes.
//!
//! Directory opens are pipelined ahead of the visit front (capped at
//! `2 * workers + 1`), but visits themselves always happen in queue order,
//! so breadth-first output is strict by level and one directory's entries
//! are never interleaved with another's.

use crate::config::{FollowPolicy, MountPolicy, Strategy, WalkOptions};
use crate::dirent::{openat_dir, DirEntryRecord, DirReader};
use crate::error::WalkerError;
use crate::fdcache::{FdCache, SlotId};
use crate::ioq::{Completion, Ioq, Op, Payload, SubmitError};
use crate::paths::{PathNode, PathScratch};
use crate::stat::{fstat, FileStat, FileType};
use crate::walker::visit::{StatSource, Visit, VisitPhase, WalkControl, WalkSummary};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Depth window of one traversal pass
///
/// Single-pass strategies use `[0, u32::MAX]`. Deepening strategies emit
/// only depths in `[lo, hi]` per pass and descend no further than `hi`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassBounds {
    pub lo: u32,
    pub hi: u32,
}

/// Bookkeeping for a directory whose stream is being (or has been) read
///
/// `live` counts unfinished children plus one for the unsealed stream;
/// when it reaches zero the subtree is complete: the post-order visit fires
/// and the parent's count drops, cascading upward. Parent links are the only
/// edges, so the reference graph is acyclic.
struct Subtree {
    node: Arc<PathNode>,
    parent: Option<Rc<Subtree>>,
    stat: FileStat,
    root_dev: u64,
    slot: Cell<Option<SlotId>>,
    live: Cell<usize>,
    // Deepening passes: descent below this subtree was cut by the pass
    // bound, so its post-order visit belongs to a later pass.
    truncated: Cell<bool>,
    max_seen: Cell<u32>,
}

/// Lifecycle of a queued entry
enum EntryState {
    /// Visitable as a non-directory (or a directory we will not descend)
    LeafReady,
    /// Eager stat not yet submitted
    StatUnissued,
    /// Eager stat in flight
    StatPending,
    /// Directory candidate, open not yet submitted
    OpenUnissued,
    /// Open in flight
    OpenPending,
    /// Open succeeded; ready to visit and descend
    DirReady { fd: OwnedFd },
    /// Open failed on something we still believe is a directory
    DirError,
}

/// One discovered entry waiting in the visit queue
struct PendingEntry {
    node: Arc<PathNode>,
    parent: Option<Rc<Subtree>>,
    type_hint: Option<FileType>,
    state: EntryState,
    error: Option<io::Error>,
    prestat: Option<Result<FileStat, i32>>,
    pinned_parent: Option<SlotId>,
    retried: bool,
}

type EntryRef = Rc<RefCell<PendingEntry>>;

pub(crate) struct Engine<'o, F> {
    opts: &'o WalkOptions,
    callback: F,
    ioq: Ioq,
    cache: FdCache,
    scratch: PathScratch,

    queue: VecDeque<EntryRef>,
    inflight: HashMap<u64, EntryRef>,
    inflight_opens: usize,
    next_token: u64,

    // Deepening passes re-enter directories whose visits are suppressed, so
    // prune decisions from earlier passes are remembered by identity.
    pruned: HashSet<(u64, u64)>,

    bounds: PassBounds,
    pass_truncated: bool,
    nthreads: usize,

    pub(crate) stopped: bool,
    visits: u64,
    directories: u64,
    errors: u64,
}

impl<'o, F> Engine<'o, F>
where
    F: FnMut(&Visit) -> WalkControl,
{
    pub(crate) fn new(opts: &'o WalkOptions, ioq: Ioq, nthreads: usize, callback: F) -> Self {
        Engine {
            opts,
            callback,
            ioq,
            cache: FdCache::new(opts.effective_cache_capacity()),
            scratch: PathScratch::new(),
            queue: VecDeque::new(),
            inflight: HashMap::new(),
            inflight_opens: 0,
            next_token: 0,
            pruned: HashSet::new(),
            bounds: PassBounds { lo: 0, hi: u32::MAX },
            pass_truncated: false,
            nthreads,
            stopped: false,
            visits: 0,
            directories: 0,
            errors: 0,
        }
    }

    pub(crate) fn finish(self, duration: Duration) -> WalkSummary {
        WalkSummary {
            visits: self.visits,
            directories: self.directories,
            errors: self.errors,
            stopped: self.stopped,
            duration,
        }
    }

    /// Cap on pipelined directory opens
    fn open_cap(&self) -> usize {
        (2 * self.nthreads + 1).min(self.ioq.capacity())
    }

    fn follow_for(&self, depth: u32) -> bool {
        match self.opts.follow {
            FollowPolicy::Logical => true,
            FollowPolicy::CommandLine => depth == 0,
            FollowPolicy::Physical => false,
        }
    }

    fn emit_allowed(&self, depth: u32) -> bool {
        depth >= self.bounds.lo.max(self.opts.min_depth)
    }

    fn post_allowed(&self, depth: u32, max_seen: u32, truncated: bool) -> bool {
        self.opts.post_order
            && !truncated
            && !self.stopped
            && depth >= self.opts.min_depth
            && max_seen >= self.bounds.lo
    }

    /// Should this entry be opened as a directory candidate?
    ///
    /// Callers only ask about depths inside the current pass window, so the
    /// only depth gate here is the configured limit.
    fn is_dir_candidate(&self, hint: Option<FileType>, depth: u32) -> bool {
        if depth >= self.opts.max_depth {
            return false;
        }
        match hint {
            None => true,
            Some(FileType::Directory) => true,
            Some(FileType::Symlink) => self.follow_for(depth),
            Some(_) => false,
        }
    }

    /// Run one traversal pass over the given depth window
    ///
    /// Returns whether any descent was cut off by `bounds.hi`, which tells
    /// deepening strategies whether another pass is needed.
    pub(crate) fn run_pass(&mut self, bounds: PassBounds) -> Result<bool, WalkerError> {
        self.bounds = bounds;
        self.pass_truncated = false;
        debug_assert!(self.queue.is_empty() && self.inflight.is_empty());

        self.seed_roots();

        while !self.stopped {
            while let Some(completion) = self.ioq.poll() {
                self.handle_completion(completion);
            }
            self.pump_requests();

            if self.front_ready() {
                self.visit_front();
                continue;
            }

            if self.ioq.pending() > 0 {
                let completion = self.ioq.wait()?;
                self.handle_completion(completion);
                continue;
            }

            if self.queue.is_empty() {
                break;
            }

            // Front not ready with nothing in flight only happens when the
            // submission ring is transiently full of close requests; give
            // the workers a beat and retry.
            debug_assert!(self.inflight_opens == 0);
            std::thread::yield_now();
        }

        if self.stopped {
            self.shutdown_drain();
        }
        Ok(self.pass_truncated)
    }

    fn seed_roots(&mut self) {
        for path in &self.opts.paths {
            let node = PathNode::root(path.as_os_str().to_os_string());
            let state = if self.is_dir_candidate(None, 0) {
                EntryState::OpenUnissued
            } else if self.opts.eager_stat && self.emit_allowed(0) {
                EntryState::StatUnissued
            } else {
                EntryState::LeafReady
            };
            self.queue.push_back(Rc::new(RefCell::new(PendingEntry {
                node,
                parent: None,
                type_hint: None,
                state,
                error: None,
                prestat: None,
                pinned_parent: None,
                retried: false,
            })));
        }
    }

    fn front_ready(&self) -> bool {
        self.queue.front().is_some_and(|rc| {
            matches!(
                rc.borrow().state,
                EntryState::LeafReady | EntryState::DirReady { .. } | EntryState::DirError
            )
        })
    }

    /// Submit requests for the front of the queue and a bounded lookahead
    fn pump_requests(&mut self) {
        let cap = self.open_cap();
        let lookahead = 2 * cap + 8;
        let mut idx = 0;
        while idx < self.queue.len().min(lookahead) {
            let rc = Rc::clone(&self.queue[idx]);
            let wants_open = {
                let e = rc.borrow();
                match e.state {
                    EntryState::OpenUnissued => Some(true),
                    EntryState::StatUnissued => Some(false),
                    _ => None,
                }
            };
            match wants_open {
                Some(true) => {
                    if self.inflight_opens >= cap {
                        break;
                    }
                    if !self.issue_open(&rc) {
                        break;
                    }
                }
                Some(false) => {
                    if !self.issue_stat(&rc) {
                        break;
                    }
                }
                None => {}
            }
            idx += 1;
        }
    }

    /// Submit the open for a directory candidate; false when the queue is
    /// full and issuing should pause
    fn issue_open(&mut self, rc: &EntryRef) -> bool {
        let (node, parent) = {
            let e = rc.borrow();
            (Arc::clone(&e.node), e.parent.clone())
        };
        let follow = self.follow_for(node.depth());

        let (dirfd, pin, name) = match &parent {
            Some(p) => match self.acquire_subtree_fd(p) {
                Ok((fd, slot)) => match CString::new(node.name().as_bytes()) {
                    Ok(name) => (fd, Some(slot), name),
                    Err(_) => {
                        self.cache.release(slot);
                        self.fail_entry(rc, io::Error::from_raw_os_error(libc::EINVAL));
                        return true;
                    }
                },
                Err(err) => {
                    self.fail_entry(rc, err);
                    return true;
                }
            },
            None => match CString::new(node.name().as_bytes()) {
                Ok(name) => (libc::AT_FDCWD, None, name),
                Err(_) => {
                    self.fail_entry(rc, io::Error::from_raw_os_error(libc::EINVAL));
                    return true;
                }
            },
        };

        let token = self.next_token;
        match self.ioq.submit(token, Op::Open { dirfd, name, follow }) {
            Ok(_) => {
                self.next_token += 1;
                self.inflight_opens += 1;
                {
                    let mut e = rc.borrow_mut();
                    e.state = EntryState::OpenPending;
                    e.pinned_parent = pin;
                }
                self.inflight.insert(token, Rc::clone(rc));
                true
            }
            Err(SubmitError::Full(_)) => {
                if let Some(slot) = pin {
                    self.cache.release(slot);
                }
                false
            }
            Err(SubmitError::Cancelled(_)) => {
                if let Some(slot) = pin {
                    self.cache.release(slot);
                }
                self.fail_entry(rc, io::Error::from_raw_os_error(libc::ECANCELED));
                true
            }
        }
    }

    /// Submit an eager stat for a leaf
    fn issue_stat(&mut self, rc: &EntryRef) -> bool {
        let (node, parent) = {
            let e = rc.borrow();
            (Arc::clone(&e.node), e.parent.clone())
        };
        let follow = self.follow_for(node.depth());

        let (dirfd, pin, name) = match &parent {
            Some(p) => match self.acquire_subtree_fd(p) {
                Ok((fd, slot)) => match CString::new(node.name().as_bytes()) {
                    Ok(name) => (fd, Some(slot), name),
                    Err(_) => {
                        self.cache.release(slot);
                        rc.borrow_mut().state = EntryState::LeafReady;
                        return true;
                    }
                },
                Err(err) => {
                    let mut e = rc.borrow_mut();
                    e.prestat = Some(Err(err.raw_os_error().unwrap_or(libc::EIO)));
                    e.error = Some(err);
                    e.state = EntryState::LeafReady;
                    return true;
                }
            },
            None => match CString::new(node.name().as_bytes()) {
                Ok(name) => (libc::AT_FDCWD, None, name),
                Err(_) => {
                    rc.borrow_mut().state = EntryState::LeafReady;
                    return true;
                }
            },
        };

        let token = self.next_token;
        match self.ioq.submit(token, Op::Stat { dirfd, name, follow }) {
            Ok(_) => {
                self.next_token += 1;
                {
                    let mut e = rc.borrow_mut();
                    e.state = EntryState::StatPending;
                    e.pinned_parent = pin;
                }
                self.inflight.insert(token, Rc::clone(rc));
                true
            }
            Err(SubmitError::Full(_)) => {
                if let Some(slot) = pin {
                    self.cache.release(slot);
                }
                false
            }
            Err(SubmitError::Cancelled(_)) => {
                if let Some(slot) = pin {
                    self.cache.release(slot);
                }
                rc.borrow_mut().state = EntryState::LeafReady;
                true
            }
        }
    }

    /// Route a completion back to its entry
    fn handle_completion(&mut self, completion: Completion) {
        let Some(rc) = self.inflight.remove(&completion.token) else {
            // Late arrival for an entry dropped during shutdown; reclaim the
            // descriptor and move on.
            if let Payload::Open(Ok(fd)) = completion.payload {
                drop(fd);
            }
            return;
        };

        if let Some(slot) = rc.borrow_mut().pinned_parent.take() {
            self.cache.release(slot);
        }

        match completion.payload {
            Payload::Open(result) => {
                self.inflight_opens -= 1;
                match result {
                    Ok(fd) => match fstat(fd.as_raw_fd()) {
                        Ok(st) => {
                            let mut e = rc.borrow_mut();
                            e.prestat = Some(Ok(st));
                            e.type_hint = Some(FileType::Directory);
                            e.state = EntryState::DirReady { fd };
                        }
                        Err(err) => {
                            drop(fd);
                            self.classify_open_failure(&rc, err);
                        }
                    },
                    Err(err) => self.classify_open_failure(&rc, err),
                }
            }
            Payload::Stat(result) => {
                let mut e = rc.borrow_mut();
                match result {
                    Ok(st) => {
                        e.prestat = Some(Ok(st));
                        if e.type_hint.is_none() {
                            e.type_hint = Some(st.file_type());
                        }
                    }
                    Err(err) => {
                        e.prestat = Some(Err(err.raw_os_error().unwrap_or(libc::EIO)));
                        e.error = Some(err);
                    }
                }
                e.state = EntryState::LeafReady;
            }
            Payload::Nop => {}
        }
    }

    /// Decide what a failed directory open means for the entry
    fn classify_open_failure(&mut self, rc: &EntryRef, err: io::Error) {
        let errno = err.raw_os_error().unwrap_or(0);

        // Descriptor exhaustion: force an eviction and retry once.
        if (errno == libc::EMFILE || errno == libc::ENFILE) && !rc.borrow().retried {
            if let Some(victim) = self.cache.evict_one() {
                drop(victim);
                let mut e = rc.borrow_mut();
                e.retried = true;
                e.state = EntryState::OpenUnissued;
                return;
            }
        }

        let follow = self.follow_for(rc.borrow().node.depth());
        match errno {
            // Not a directory after all; a clean leaf, not an error.
            libc::ENOTDIR => {
                let mut e = rc.borrow_mut();
                if e.type_hint == Some(FileType::Directory) {
                    e.type_hint = None;
                }
                e.error = None;
                e.state = EntryState::LeafReady;
            }
            // O_NOFOLLOW hit a symlink: classify, don't complain.
            libc::ELOOP | libc::EMLINK if !follow => {
                let mut e = rc.borrow_mut();
                e.type_hint = Some(FileType::Symlink);
                e.error = None;
                e.state = EntryState::LeafReady;
            }
            _ => {
                // Probe the type so the error lands on the right kind of
                // visit (unreadable directories still get post-order).
                let (node, parent) = {
                    let e = rc.borrow();
                    (Arc::clone(&e.node), e.parent.clone())
                };
                let probe = self.probe_entry_type(parent.as_ref(), &node, follow);
                let mut e = rc.borrow_mut();
                let is_dir = match probe {
                    Some(st) => {
                        let dir = st.file_type().is_dir();
                        e.prestat = Some(Ok(st));
                        e.type_hint = Some(st.file_type());
                        dir
                    }
                    None => e.type_hint == Some(FileType::Directory),
                };
                e.error = Some(err);
                e.state = if is_dir {
                    EntryState::DirError
                } else {
                    EntryState::LeafReady
                };
            }
        }
    }

    /// Stat an entry relative to the nearest cached ancestor descriptor
    ///
    /// Anchoring on the (possibly reopened) parent keeps the probe working
    /// for entries whose full path exceeds `PATH_MAX`; roots stat by the
    /// path they were given.
    fn probe_entry_type(
        &mut self,
        parent: Option<&Rc<Subtree>>,
        node: &Arc<PathNode>,
        follow: bool,
    ) -> Option<FileStat> {
        let name = CString::new(node.name().as_bytes()).ok()?;
        match parent {
            Some(p) => {
                let (fd, slot) = self.acquire_subtree_fd(p).ok()?;
                let st = crate::stat::fstatat(fd, &name, follow);
                self.cache.release(slot);
                st.ok()
            }
            None => crate::stat::fstatat(libc::AT_FDCWD, &name, follow).ok(),
        }
    }

    fn fail_entry(&mut self, rc: &EntryRef, err: io::Error) {
        let mut e = rc.borrow_mut();
        let believed_dir = e.type_hint == Some(FileType::Directory);
        e.error = Some(err);
        e.state = if believed_dir {
            EntryState::DirError
        } else {
            EntryState::LeafReady
        };
    }

    /// Deliver the entry at the front of the visit queue
    fn visit_front(&mut self) {
        let Some(rc) = self.queue.pop_front() else {
            return;
        };

        let (node, parent, state, hint, error, prestat) = {
            let mut e = rc.borrow_mut();
            (
                Arc::clone(&e.node),
                e.parent.clone(),
                std::mem::replace(&mut e.state, EntryState::LeafReady),
                e.type_hint,
                e.error.take(),
                e.prestat,
            )
        };

        match state {
            EntryState::DirReady { fd } => {
                let st = match prestat {
                    Some(Ok(st)) => st,
                    // fstat runs at completion; reaching here without it
                    // would be a bug.
                    _ => {
                        drop(fd);
                        self.finish_child(parent, node.depth());
                        return;
                    }
                };
                self.visit_directory(node, parent, fd, st);
            }
            EntryState::DirError => {
                self.visit_terminal(node, parent, hint, error, prestat, true);
            }
            EntryState::LeafReady => {
                let dir_like = hint == Some(FileType::Directory);
                self.visit_terminal(node, parent, hint, error, prestat, dir_like);
            }
            other => {
                // The caller checked readiness; restore and retry.
                let mut e = rc.borrow_mut();
                e.state = other;
                e.error = error;
                drop(e);
                self.queue.push_front(rc);
            }
        }
    }

    /// Visit an entry that will not be descended: a file, an unreadable or
    /// depth-limited directory, or a detected cycle
    fn visit_terminal(
        &mut self,
        node: Arc<PathNode>,
        parent: Option<Rc<Subtree>>,
        hint: Option<FileType>,
        error: Option<io::Error>,
        prestat: Option<Result<FileStat, i32>>,
        dir_like: bool,
    ) {
        let depth = node.depth();

        if self.emit_allowed(depth) {
            let control =
                self.fire_visit(&node, VisitPhase::Pre, hint, error.as_ref(), prestat, parent.as_ref());
            if control == WalkControl::Stop {
                self.stopped = true;
                return;
            }
        }

        // A directory with no children to walk (unreadable, beyond the
        // depth limit, on another filesystem) is complete as it stands.
        if dir_like && self.post_allowed(depth, depth, false) {
            let control =
                self.fire_visit(&node, VisitPhase::Post, hint, None, prestat, parent.as_ref());
            if control == WalkControl::Stop {
                self.stopped = true;
                return;
            }
        }

        self.finish_child(parent, depth);
    }

    /// Pre-visit an opened directory and descend if permitted
    fn visit_directory(
        &mut self,
        node: Arc<PathNode>,
        parent: Option<Rc<Subtree>>,
        fd: OwnedFd,
        st: FileStat,
    ) {
        let depth = node.depth();

        // Cycle detection: an opened directory that is its own ancestor.
        if self.follow_for(depth) && ancestor_cycle(parent.as_ref(), st.dev, st.ino) {
            drop(fd);
            let err = io::Error::from_raw_os_error(libc::ELOOP);
            self.visit_terminal(
                node,
                parent,
                Some(FileType::Directory),
                Some(err),
                Some(Ok(st)),
                true,
            );
            return;
        }

        let pruned_before = self.pruned.contains(&(st.dev, st.ino));
        let mount_blocked = match self.opts.mount {
            MountPolicy::Crossing => false,
            MountPolicy::NoCross => parent.as_ref().is_some_and(|p| p.stat.dev != st.dev),
            MountPolicy::SameFs => parent.as_ref().is_some_and(|p| p.root_dev != st.dev),
        };

        let control = if self.emit_allowed(depth) {
            self.fire_visit(
                &node,
                VisitPhase::Pre,
                Some(FileType::Directory),
                None,
                Some(Ok(st)),
                parent.as_ref(),
            )
        } else {
            WalkControl::Continue
        };

        if control == WalkControl::Stop {
            self.stopped = true;
            drop(fd);
            return;
        }

        let pruned_now = control == WalkControl::Prune && self.opts.honor_prune;
        if pruned_now {
            self.pruned.insert((st.dev, st.ino));
        }

        if pruned_now || pruned_before || mount_blocked {
            // Visited, not descended.
            self.close_async(fd);
            if !pruned_before && self.post_allowed(depth, depth, false) {
                let control = self.fire_visit(
                    &node,
                    VisitPhase::Post,
                    Some(FileType::Directory),
                    None,
                    Some(Ok(st)),
                    parent.as_ref(),
                );
                if control == WalkControl::Stop {
                    self.stopped = true;
                    return;
                }
            }
            self.finish_child(parent, depth);
            return;
        }

        // Descend: the descriptor moves into the cache, the stream is read
        // on this thread, and the children join the visit queue.
        let root_dev = parent.as_ref().map_or(st.dev, |p| p.root_dev);
        let slot = self.cache.insert(fd);
        let subtree = Rc::new(Subtree {
            node,
            parent,
            stat: st,
            root_dev,
            slot: Cell::new(Some(slot)),
            live: Cell::new(1),
            truncated: Cell::new(false),
            max_seen: Cell::new(depth),
        });
        self.enforce_cache_capacity();

        let (records, stream_err) = self.read_stream(&subtree);
        if let Some(err) = stream_err {
            // Re-deliver the directory with the error attached; with
            // `recover`, the children read so far are still walked.
            if self.emit_allowed(depth) {
                let control = self.fire_visit(
                    &Arc::clone(&subtree.node),
                    VisitPhase::Pre,
                    Some(FileType::Directory),
                    Some(&err),
                    Some(Ok(st)),
                    subtree.parent.as_ref(),
                );
                if control == WalkControl::Stop {
                    self.stopped = true;
                    return;
                }
            }
        }

        self.spawn_children(&subtree, records);

        // Seal the stream; an empty directory completes on the spot.
        self.release_live(subtree);
    }

    /// Read a subtree's whole directory stream
    fn read_stream(&mut self, subtree: &Rc<Subtree>) -> (Vec<DirEntryRecord>, Option<io::Error>) {
        let fd = subtree
            .slot
            .get()
            .and_then(|slot| self.cache.acquire(slot));
        let Some(fd) = fd else {
            return (Vec::new(), Some(io::Error::from_raw_os_error(libc::EBADF)));
        };

        let mut records = Vec::new();
        let mut stream_err = None;
        let mut reader = DirReader::new(fd);
        loop {
            match reader.next_entry() {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(err) => {
                    stream_err = Some(err);
                    break;
                }
            }
        }
        drop(reader);
        if let Some(slot) = subtree.slot.get() {
            self.cache.release(slot);
        }

        if stream_err.is_some() && !self.opts.recover {
            records.clear();
        }
        (records, stream_err)
    }

    /// Turn a directory stream into queued child entries
    fn spawn_children(&mut self, subtree: &Rc<Subtree>, mut records: Vec<DirEntryRecord>) {
        if self.opts.sort {
            records.sort_by(|a, b| a.name_c().to_bytes().cmp(b.name_c().to_bytes()));
        }

        let child_depth = subtree.node.depth() + 1;
        let mut batch = Vec::with_capacity(records.len());
        for record in records {
            if child_depth > self.bounds.hi {
                // Out of this pass's window; a later pass picks it up.
                subtree.truncated.set(true);
                self.pass_truncated = true;
                continue;
            }

            let hint = record.type_hint();
            let node = subtree.node.child(record.name().to_os_string());
            let state = if self.is_dir_candidate(hint, child_depth) {
                EntryState::OpenUnissued
            } else if self.opts.eager_stat && self.emit_allowed(child_depth) {
                EntryState::StatUnissued
            } else {
                EntryState::LeafReady
            };

            subtree.live.set(subtree.live.get() + 1);
            batch.push(Rc::new(RefCell::new(PendingEntry {
                node,
                parent: Some(Rc::clone(subtree)),
                type_hint: hint,
                state,
                error: None,
                prestat: None,
                pinned_parent: None,
                retried: false,
            })));
        }

        trace!(children = batch.len(), "directory stream sealed");

        match self.opts.strategy {
            Strategy::Dfs => {
                for child in batch.into_iter().rev() {
                    self.queue.push_front(child);
                }
            }
            _ => self.queue.extend(batch),
        }
    }

    /// A queued child finished; update its parent's accounting
    fn finish_child(&mut self, parent: Option<Rc<Subtree>>, depth: u32) {
        if let Some(parent) = parent {
            parent.max_seen.set(parent.max_seen.get().max(depth));
            self.release_live(parent);
        }
    }

    /// Drop one reference on a subtree, completing and cascading at zero
    fn release_live(&mut self, subtree: Rc<Subtree>) {
        let mut cur = subtree;
        loop {
            let live = cur.live.get() - 1;
            cur.live.set(live);
            if live > 0 {
                break;
            }

            // Subtree complete: post-order fires with only this visit
            // outstanding, then the descriptor goes back to the kernel.
            if self.post_allowed(cur.node.depth(), cur.max_seen.get(), cur.truncated.get()) {
                let control = self.fire_visit(
                    &Arc::clone(&cur.node),
                    VisitPhase::Post,
                    Some(FileType::Directory),
                    None,
                    Some(Ok(cur.stat)),
                    cur.parent.as_ref(),
                );
                if control == WalkControl::Stop {
                    self.stopped = true;
                }
            }

            if let Some(slot) = cur.slot.take() {
                if let Some(fd) = self.cache.remove(slot) {
                    self.close_async(fd);
                }
            }

            let parent = match cur.parent.clone() {
                Some(parent) => parent,
                None => break,
            };
            if cur.truncated.get() {
                parent.truncated.set(true);
            }
            parent
                .max_seen
                .set(parent.max_seen.get().max(cur.max_seen.get()));

            if self.stopped {
                break;
            }
            cur = parent;
        }
    }

    /// Deliver one visit to the callback
    fn fire_visit(
        &mut self,
        node: &Arc<PathNode>,
        phase: VisitPhase,
        file_type: Option<FileType>,
        error: Option<&io::Error>,
        prestat: Option<Result<FileStat, i32>>,
        parent: Option<&Rc<Subtree>>,
    ) -> WalkControl {
        let depth = node.depth();
        let follow = self.follow_for(depth);

        // Prefer the parent descriptor as the stat anchor. When it was
        // evicted, fall back to the full path, reopening the ancestor chain
        // only if the path is too long for that to work.
        let mut release_after: Option<SlotId> = None;
        let mut dirfd: Option<RawFd> = match parent {
            None => Some(libc::AT_FDCWD),
            Some(p) => p.slot.get().and_then(|slot| self.cache.peek(slot)),
        };
        if dirfd.is_none() {
            let path_len = self.scratch.render(node).as_os_str().len();
            if path_len >= libc::PATH_MAX as usize {
                if let Some(p) = parent {
                    let p = Rc::clone(p);
                    if let Ok((fd, slot)) = self.acquire_subtree_fd(&p) {
                        release_after = Some(slot);
                        dirfd = Some(fd);
                    }
                }
            }
        }

        self.visits += 1;
        if phase == VisitPhase::Pre {
            if file_type == Some(FileType::Directory) {
                self.directories += 1;
            }
            if error.is_some() {
                self.errors += 1;
            }
        }

        let path = self.scratch.render(node);
        let visit = Visit {
            path,
            name: node.name(),
            depth,
            phase,
            file_type,
            error,
            stat_cache: Cell::new(prestat),
            stat_source: match dirfd {
                Some(fd) => StatSource::At {
                    dirfd: fd,
                    name: node.name(),
                },
                None => StatSource::FullPath,
            },
            follow,
        };

        let control = (self.callback)(&visit);
        drop(visit);

        if let Some(slot) = release_after {
            self.cache.release(slot);
        }
        control
    }

    /// Pin and return a subtree's descriptor, reopening evicted ancestors
    ///
    /// The caller owns one pin on the returned slot and must release it.
    /// Reopening walks up to the nearest still-cached ancestor, then opens
    /// one component at a time downward, so arbitrarily long paths work
    /// without ever materializing a full pathname.
    fn acquire_subtree_fd(&mut self, subtree: &Rc<Subtree>) -> io::Result<(RawFd, SlotId)> {
        if let Some(slot) = subtree.slot.get() {
            if let Some(fd) = self.cache.acquire(slot) {
                return Ok((fd, slot));
            }
            subtree.slot.set(None);
        }

        // Collect the evicted chain, deepest first.
        let mut chain = vec![Rc::clone(subtree)];
        let mut anchor: Option<(RawFd, SlotId)> = None;
        let mut cur = subtree.parent.clone();
        while let Some(p) = cur {
            if let Some(slot) = p.slot.get() {
                if let Some(fd) = self.cache.acquire(slot) {
                    anchor = Some((fd, slot));
                    break;
                }
                p.slot.set(None);
            }
            cur = p.parent.clone();
            chain.push(p);
        }

        // Reopen downward, holding at most two pins at a time.
        let mut held = anchor;
        for sub in chain.iter().rev() {
            let name = CString::new(sub.node.name().as_bytes())
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            let dirfd = held.map_or(libc::AT_FDCWD, |(fd, _)| fd);
            let follow = self.follow_for(sub.node.depth());

            let opened = self.open_with_evict(dirfd, &name, follow);
            if let Some((_, slot)) = held.take() {
                self.cache.release(slot);
            }
            let fd = opened?;
            let raw = fd.as_raw_fd();
            let slot = self.cache.insert(fd);
            sub.slot.set(Some(slot));
            let pinned = self.cache.acquire(slot).expect("slot inserted above");
            debug_assert_eq!(pinned, raw);
            held = Some((raw, slot));
            self.enforce_cache_capacity();
        }

        held.ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// `openat_dir` with a single eviction retry on descriptor exhaustion
    fn open_with_evict(
        &mut self,
        dirfd: RawFd,
        name: &CString,
        follow: bool,
    ) -> io::Result<OwnedFd> {
        match openat_dir(dirfd, name, follow) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) => {
                match self.cache.evict_one() {
                    Some(victim) => {
                        drop(victim);
                        openat_dir(dirfd, name, follow)
                    }
                    None => Err(e),
                }
            }
            result => result,
        }
    }

    /// Close a descriptor through the I/O queue without blocking
    fn close_async(&mut self, fd: OwnedFd) {
        let token = self.next_token;
        self.next_token += 1;
        // submit() falls back to a synchronous close when the ring is full,
        // so the descriptor is reclaimed either way.
        let _ = self.ioq.submit(token, Op::Close { fd });
    }

    /// Keep the cache at or below its soft capacity
    fn enforce_cache_capacity(&mut self) {
        while self.cache.is_over_capacity() {
            match self.cache.evict_one() {
                Some(fd) => self.close_async(fd),
                None => break,
            }
        }
    }

    /// Graceful shutdown after a Stop
    ///
    /// Stops issuing, drains outstanding completions while reclaiming any
    /// descriptors they carry, and cancels the queue. Workers are joined
    /// when the queue drops.
    fn shutdown_drain(&mut self) {
        debug!(pending = self.ioq.pending(), "draining after stop");
        self.queue.clear();
        self.inflight.clear();
        while self.ioq.pending() > 0 {
            match self.ioq.wait() {
                Ok(completion) => {
                    if let Payload::Open(Ok(fd)) = completion.payload {
                        drop(fd);
                    }
                }
                Err(_) => break,
            }
        }
        self.ioq.cancel();
    }
}

/// Does `(dev, ino)` appear on the ancestor chain?
fn ancestor_cycle(mut parent: Option<&Rc<Subtree>>, dev: u64, ino: u64) -> bool {
    while let Some(p) = parent {
        if p.stat.dev == dev && p.stat.ino == ino {
            return true;
        }
        parent = p.parent.as_ref();
    }
    false
}
