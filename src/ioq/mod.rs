//! Asynchronous I/O queue
//!
//! A bounded multi-producer/single-consumer pipeline that moves filesystem
//! syscalls off the traversal thread:
//!
//! ```text
//!                    submission ring
//!   consumer ──► (crossbeam bounded) ──► worker 1..N ── openat/fstatat/close
//!      ▲                                     │
//!      └──────── completion ring ◄───────────┘
//! ```
//!
//! The consumer submits [`Op`]s tagged with an opaque token, drains
//! [`Completion`]s in its own loop, and never blocks except in
//! [`Ioq::wait`]. Workers never allocate on the hot path; every request is
//! moved through the rings by value.
//!
//! Close requests are special: they carry no useful result, so they produce
//! no completion and never block the caller. If the submission ring is full
//! the descriptor is closed synchronously instead, so no descriptor is ever
//! dropped on the floor.
//!
//! [`Ioq::cancel`] stops new submissions and lets the workers drain: Open
//! and Stat requests still queued complete with `ECANCELED` without touching
//! the filesystem, while queued Close requests still execute. Dropping the
//! queue cancels it and joins every worker.

use crate::dirent;
use crate::error::QueueError;
use crate::stat::{self, FileStat};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::ffi::CString;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub mod uring;

/// Minimum queue capacity
pub const MIN_CAPACITY: usize = 2;

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 4096;

/// An I/O operation to execute on a worker
///
/// `dirfd` fields are borrowed descriptors: the submitter must keep them
/// open (pinned in the descriptor cache) until the matching completion has
/// been consumed.
#[derive(Debug)]
pub enum Op {
    /// No-op, for benchmarks and tests; `heavy` performs a throwaway syscall
    Nop { heavy: bool },

    /// `openat(dirfd, name, O_RDONLY | O_DIRECTORY | O_CLOEXEC [| O_NOFOLLOW])`
    Open {
        dirfd: RawFd,
        name: CString,
        follow: bool,
    },

    /// `fstatat(dirfd, name)`, following symlinks iff `follow`
    Stat {
        dirfd: RawFd,
        name: CString,
        follow: bool,
    },

    /// Close a descriptor; fire-and-forget, no completion
    Close { fd: OwnedFd },
}

/// A submitted request moving through the submission ring
#[derive(Debug)]
struct Request {
    seq: u64,
    token: u64,
    op: Op,
}

/// Result payload of a completed request
#[derive(Debug)]
pub enum Payload {
    Open(io::Result<OwnedFd>),
    Stat(io::Result<FileStat>),
    Nop,
}

/// A completed request, delivered back to the consumer
///
/// Sequence numbers are globally monotonic in submission order.
#[derive(Debug)]
pub struct Completion {
    pub seq: u64,
    pub token: u64,
    pub payload: Payload,
}

/// Why a submission was rejected
///
/// The operation is handed back so no work is lost.
#[derive(Debug)]
pub enum SubmitError {
    /// The queue is at capacity; drain completions and retry
    Full(Op),
    /// The queue was cancelled
    Cancelled(Op),
}

/// Queue backend selection, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// One blocking syscall per request per worker thread
    #[default]
    Threads,
    /// Batched submission through a kernel I/O ring on each worker
    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    Ring,
}

/// Bounded asynchronous I/O queue with a worker pool
pub struct Ioq {
    submit_tx: Mutex<Option<Sender<Request>>>,
    done_rx: Receiver<Completion>,
    workers: Vec<JoinHandle<()>>,
    cancelled: Arc<AtomicBool>,
    seq: AtomicUsize,
    inflight: AtomicUsize,
    capacity: usize,
}

impl Ioq {
    /// Create a queue with `nthreads` workers and room for `capacity`
    /// outstanding completion-bearing requests
    pub fn new(capacity: usize, nthreads: usize) -> Result<Ioq, QueueError> {
        Ioq::with_backend(capacity, nthreads, Backend::default())
    }

    /// Create a queue with an explicit backend
    pub fn with_backend(
        capacity: usize,
        nthreads: usize,
        backend: Backend,
    ) -> Result<Ioq, QueueError> {
        let capacity = capacity.max(MIN_CAPACITY);
        let nthreads = nthreads.max(1);

        let (submit_tx, submit_rx) = bounded::<Request>(capacity);
        let (done_tx, done_rx) = bounded::<Completion>(capacity);
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(nthreads);
        for id in 0..nthreads {
            let rx = submit_rx.clone();
            let tx = done_tx.clone();
            let flag = Arc::clone(&cancelled);
            let spawned = thread::Builder::new()
                .name(format!("ioq-{}", id))
                .spawn(move || match backend {
                    Backend::Threads => worker_loop(id, rx, tx, flag),
                    #[cfg(all(target_os = "linux", feature = "io-uring"))]
                    Backend::Ring => uring::worker_loop(id, rx, tx, flag),
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Tear down what we started before reporting failure.
                    drop(submit_tx);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(QueueError::SpawnFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(capacity, nthreads, ?backend, "I/O queue started");

        Ok(Ioq {
            submit_tx: Mutex::new(Some(submit_tx)),
            done_rx,
            workers,
            cancelled,
            seq: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Capacity for outstanding completion-bearing requests
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Completion-bearing requests submitted but not yet consumed
    pub fn pending(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Submit an operation
    ///
    /// Non-blocking. Returns the request's sequence number, or hands the
    /// operation back when the queue is full or cancelled. Close operations
    /// never fail and never block: if the ring has no room the descriptor is
    /// closed right here.
    pub fn submit(&self, token: u64, op: Op) -> Result<u64, SubmitError> {
        if self.cancelled.load(Ordering::Relaxed) && !matches!(op, Op::Close { .. }) {
            return Err(SubmitError::Cancelled(op));
        }

        let guard = self.submit_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SubmitError::Cancelled(op));
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) as u64;

        if matches!(op, Op::Close { .. }) {
            if let Err(e) = tx.try_send(Request { seq, token, op }) {
                // Ring full or torn down: close synchronously rather than
                // block or leak.
                match e {
                    TrySendError::Full(req) | TrySendError::Disconnected(req) => {
                        if let Op::Close { fd } = req.op {
                            drop(fd);
                        }
                    }
                }
            }
            return Ok(seq);
        }

        if self.inflight.load(Ordering::Relaxed) >= self.capacity {
            return Err(SubmitError::Full(op));
        }

        match tx.try_send(Request { seq, token, op }) {
            Ok(()) => {
                self.inflight.fetch_add(1, Ordering::Relaxed);
                Ok(seq)
            }
            Err(TrySendError::Full(req)) => Err(SubmitError::Full(req.op)),
            Err(TrySendError::Disconnected(req)) => Err(SubmitError::Cancelled(req.op)),
        }
    }

    /// Pop a completion without blocking
    pub fn poll(&self) -> Option<Completion> {
        match self.done_rx.try_recv() {
            Ok(c) => {
                self.inflight.fetch_sub(1, Ordering::Relaxed);
                Some(c)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Pop a completion, blocking until one arrives
    ///
    /// Errors with [`QueueError::Disconnected`] once every worker has exited
    /// and the completion ring is drained. Callers must not wait with zero
    /// requests outstanding.
    pub fn wait(&self) -> Result<Completion, QueueError> {
        match self.done_rx.recv() {
            Ok(c) => {
                self.inflight.fetch_sub(1, Ordering::Relaxed);
                Ok(c)
            }
            Err(_) => Err(QueueError::Disconnected),
        }
    }

    /// Cancel the queue
    ///
    /// New submissions are refused, and workers exit after draining the
    /// submission ring. Outstanding completions remain poppable; the caller
    /// drains them to reclaim any descriptors opened on its behalf.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Dropping the sender lets blocked workers finish the backlog and
        // exit once the ring is empty.
        self.submit_tx.lock().take();
    }
}

impl Drop for Ioq {
    fn drop(&mut self) {
        self.cancel();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("I/O worker panicked during shutdown");
            }
        }
    }
}

/// Blocking worker loop: one syscall per request
fn worker_loop(
    id: usize,
    rx: Receiver<Request>,
    tx: Sender<Completion>,
    cancelled: Arc<AtomicBool>,
) {
    debug!(worker = id, "I/O worker starting");

    // recv() keeps returning buffered requests after the sender is dropped,
    // which is exactly the drain-then-exit shutdown contract.
    while let Ok(req) = rx.recv() {
        let drop_work = cancelled.load(Ordering::Relaxed);
        if let Some(completion) = execute(req, drop_work) {
            if tx.send(completion).is_err() {
                break;
            }
        }
    }

    debug!(worker = id, "I/O worker exiting");
}

/// Execute one request
///
/// With `drop_work` set (queue cancelled), Open and Stat short-circuit with
/// `ECANCELED`; Close always runs so descriptors cannot leak.
fn execute(req: Request, drop_work: bool) -> Option<Completion> {
    let Request { seq, token, op } = req;
    let payload = match op {
        Op::Close { fd } => {
            drop(fd);
            return None;
        }
        Op::Nop { heavy } => {
            if heavy && !drop_work {
                // A syscall with no side effects, so heavy nops measure
                // real kernel round-trips.
                unsafe { libc::getpid() };
            }
            Payload::Nop
        }
        Op::Open { dirfd, name, follow } => {
            if drop_work {
                Payload::Open(Err(io::Error::from_raw_os_error(libc::ECANCELED)))
            } else {
                Payload::Open(dirent::openat_dir(dirfd, &name, follow))
            }
        }
        Op::Stat { dirfd, name, follow } => {
            if drop_work {
                Payload::Stat(Err(io::Error::from_raw_os_error(libc::ECANCELED)))
            } else {
                Payload::Stat(stat::fstatat(dirfd, &name, follow))
            }
        }
    };

    Some(Completion { seq, token, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn test_nop_round_trip() {
        let ioq = Ioq::new(8, 2).unwrap();
        for token in 0..8u64 {
            ioq.submit(token, Op::Nop { heavy: token % 2 == 0 }).unwrap();
        }

        let mut tokens = Vec::new();
        let mut seqs = Vec::new();
        for _ in 0..8 {
            let c = ioq.wait().unwrap();
            assert!(matches!(c.payload, Payload::Nop));
            tokens.push(c.token);
            seqs.push(c.seq);
        }
        tokens.sort_unstable();
        assert_eq!(tokens, (0..8).collect::<Vec<_>>());
        // Sequence numbers are unique and bounded by the submission count.
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 8);
        assert_eq!(ioq.pending(), 0);
    }

    #[test]
    fn test_open_and_stat_ops() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file"), b"hi").unwrap();

        let root = CString::new(dir.path().as_os_str().as_bytes()).unwrap();
        let parent = dirent::openat_dir(libc::AT_FDCWD, &root, true).unwrap();
        let parent_fd = {
            use std::os::fd::AsRawFd;
            parent.as_raw_fd()
        };

        let ioq = Ioq::new(8, 2).unwrap();
        ioq.submit(
            1,
            Op::Open {
                dirfd: parent_fd,
                name: CString::new("sub").unwrap(),
                follow: false,
            },
        )
        .unwrap();
        ioq.submit(
            2,
            Op::Stat {
                dirfd: parent_fd,
                name: CString::new("file").unwrap(),
                follow: false,
            },
        )
        .unwrap();
        ioq.submit(
            3,
            Op::Open {
                dirfd: parent_fd,
                name: CString::new("missing").unwrap(),
                follow: false,
            },
        )
        .unwrap();

        let mut opened = 0;
        let mut statted = 0;
        let mut failed = 0;
        for _ in 0..3 {
            match ioq.wait().unwrap() {
                Completion { token: 1, payload: Payload::Open(res), .. } => {
                    res.unwrap();
                    opened += 1;
                }
                Completion { token: 2, payload: Payload::Stat(res), .. } => {
                    assert_eq!(res.unwrap().size, 2);
                    statted += 1;
                }
                Completion { token: 3, payload: Payload::Open(res), .. } => {
                    assert_eq!(res.unwrap_err().raw_os_error(), Some(libc::ENOENT));
                    failed += 1;
                }
                other => panic!("unexpected completion: {:?}", other),
            }
        }
        assert_eq!((opened, statted, failed), (1, 1, 1));
    }

    #[test]
    fn test_close_produces_no_completion() {
        let root = CString::new("/").unwrap();
        let fd = dirent::openat_dir(libc::AT_FDCWD, &root, true).unwrap();

        let ioq = Ioq::new(4, 1).unwrap();
        ioq.submit(7, Op::Close { fd }).unwrap();
        ioq.submit(8, Op::Nop { heavy: false }).unwrap();

        // Only the nop completes; the close leaves no trace.
        let c = ioq.wait().unwrap();
        assert_eq!(c.token, 8);
        assert!(ioq.poll().is_none());
        assert_eq!(ioq.pending(), 0);
    }

    #[test]
    fn test_backpressure_full() {
        let ioq = Ioq::new(2, 1).unwrap();
        let mut accepted = 0;
        let mut rejected = 0;
        for token in 0..64u64 {
            match ioq.submit(token, Op::Nop { heavy: false }) {
                Ok(_) => accepted += 1,
                Err(SubmitError::Full(Op::Nop { .. })) => {
                    rejected += 1;
                    // Drain one and move on, like the engine does.
                    let _ = ioq.wait().unwrap();
                }
                Err(e) => panic!("unexpected submit error: {:?}", e),
            }
        }
        while ioq.pending() > 0 {
            ioq.wait().unwrap();
        }
        assert_eq!(accepted + rejected, 64);
        assert!(accepted >= 2);
    }

    #[test]
    fn test_cancel_refuses_and_drains() {
        let ioq = Ioq::new(16, 2).unwrap();
        for token in 0..4u64 {
            ioq.submit(token, Op::Nop { heavy: false }).unwrap();
        }
        ioq.cancel();

        assert!(matches!(
            ioq.submit(9, Op::Nop { heavy: false }),
            Err(SubmitError::Cancelled(_))
        ));

        // All pre-cancel submissions still surface.
        let mut drained = 0;
        while ioq.pending() > 0 {
            match ioq.wait() {
                Ok(_) => drained += 1,
                Err(_) => break,
            }
        }
        assert_eq!(drained, 4);
    }

    #[test]
    fn test_cancelled_open_reports_ecanceled() {
        let ioq = Ioq::new(16, 1).unwrap();
        // Stall the worker long enough to cancel with work queued, by
        // saturating it with heavy nops first.
        for token in 0..8u64 {
            ioq.submit(token, Op::Nop { heavy: true }).unwrap();
        }
        ioq.submit(
            100,
            Op::Open {
                dirfd: libc::AT_FDCWD,
                name: CString::new(".").unwrap(),
                follow: true,
            },
        )
        .unwrap();
        ioq.cancel();

        let mut saw_open = false;
        while ioq.pending() > 0 {
            let Ok(c) = ioq.wait() else { break };
            if c.token == 100 {
                saw_open = true;
                match c.payload {
                    // Either the worker got to it before cancel, or it was
                    // cancelled; both are legal, but the fd must not leak.
                    Payload::Open(Ok(fd)) => drop(fd),
                    Payload::Open(Err(e)) => {
                        assert_eq!(e.raw_os_error(), Some(libc::ECANCELED));
                    }
                    other => panic!("unexpected payload: {:?}", other),
                }
            }
        }
        assert!(saw_open);
    }
}
