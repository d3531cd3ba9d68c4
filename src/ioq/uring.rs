//! Kernel I/O ring backend for the I/O queue
//!
//! Each worker owns an `io_uring` instance and turns batches of queued Open
//! and Stat requests into one submission syscall instead of one blocking
//! syscall per request. From the consumer's point of view the semantics are
//! identical to the thread backend; only the syscall pattern changes.
//!
//! Batching: a worker gathers queued requests until the ring window is full
//! or the submission channel runs dry, flushes them with a single
//! `io_uring_enter`, then drains completions. Close and Nop requests have no
//! useful asynchronous result and are executed inline.
//!
//! Ring setup can fail on older kernels or restricted environments; the
//! worker then degrades to the thread backend loop.

use super::{Completion, Op, Payload, Request};
use crate::stat;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use io_uring::{opcode, types, IoUring};
use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Submission window per worker ring
const RING_DEPTH: u32 = 64;

/// An Open or Stat request parked in a ring slot until its CQE arrives
struct PendingOp {
    seq: u64,
    token: u64,
    // The name must stay alive until the kernel is done with the SQE.
    _name: CString,
    kind: PendingKind,
}

enum PendingKind {
    Open,
    Stat,
}

pub(super) fn worker_loop(
    id: usize,
    rx: Receiver<Request>,
    tx: Sender<Completion>,
    cancelled: Arc<AtomicBool>,
) {
    let mut ring = match IoUring::new(RING_DEPTH) {
        Ok(ring) => ring,
        Err(e) => {
            warn!(worker = id, error = %e, "io_uring unavailable, using thread backend");
            return super::worker_loop(id, rx, tx, cancelled);
        }
    };

    debug!(worker = id, depth = RING_DEPTH, "ring worker starting");

    let window = RING_DEPTH as usize;
    let mut slots: Vec<Option<PendingOp>> = (0..window).map(|_| None).collect();
    let mut statx_bufs: Vec<types::statx> =
        (0..window).map(|_| unsafe { std::mem::zeroed() }).collect();
    let mut free: Vec<usize> = (0..window).rev().collect();
    let mut inflight = 0usize;
    let mut disconnected = false;

    loop {
        // Gather a batch: block only when the ring is idle, otherwise take
        // whatever is queued without waiting.
        while !disconnected && !free.is_empty() {
            let req = if inflight == 0 && free.len() == window {
                match rx.recv() {
                    Ok(req) => req,
                    Err(_) => {
                        disconnected = true;
                        break;
                    }
                }
            } else {
                match rx.try_recv() {
                    Ok(req) => req,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            };

            let drop_work = cancelled.load(Ordering::Relaxed);
            match prepare(req, drop_work) {
                Prepared::Inline(Some(completion)) => {
                    if tx.send(completion).is_err() {
                        return;
                    }
                }
                Prepared::Inline(None) => {}
                Prepared::Ring { pending, dirfd, follow } => {
                    let slot = free.pop().expect("checked free slot above");
                    let sqe = match pending.kind {
                        PendingKind::Open => {
                            let mut flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;
                            if !follow {
                                flags |= libc::O_NOFOLLOW;
                            }
                            opcode::OpenAt::new(types::Fd(dirfd), pending._name.as_ptr())
                                .flags(flags)
                                .build()
                                .user_data(slot as u64)
                        }
                        PendingKind::Stat => {
                            let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
                            let buf: *mut types::statx = &mut statx_bufs[slot];
                            opcode::Statx::new(types::Fd(dirfd), pending._name.as_ptr(), buf)
                                .flags(flags)
                                .mask(libc::STATX_BASIC_STATS)
                                .build()
                                .user_data(slot as u64)
                        }
                    };
                    slots[slot] = Some(pending);

                    let pushed = unsafe { ring.submission().push(&sqe) }.is_ok() || {
                        let _ = ring.submit();
                        unsafe { ring.submission().push(&sqe) }.is_ok()
                    };
                    if pushed {
                        inflight += 1;
                    } else {
                        // SQ pressure even after a flush; fail the request
                        // rather than stall the whole worker.
                        let pending = slots[slot].take().expect("slot was just filled");
                        free.push(slot);
                        if tx.send(fail(pending, libc::EAGAIN)).is_err() {
                            return;
                        }
                    }
                }
            }
        }

        if inflight == 0 {
            if disconnected {
                break;
            }
            continue;
        }

        // One syscall flushes the whole batch and waits for progress.
        if let Err(e) = ring.submit_and_wait(1) {
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!(worker = id, error = %e, "ring submit failed");
        }

        for cqe in ring.completion() {
            let slot = cqe.user_data() as usize;
            let Some(pending) = slots.get_mut(slot).and_then(Option::take) else {
                continue;
            };
            free.push(slot);
            inflight -= 1;

            let res = cqe.result();
            let payload = match pending.kind {
                PendingKind::Open => Payload::Open(if res >= 0 {
                    Ok(unsafe { OwnedFd::from_raw_fd(res as RawFd) })
                } else {
                    Err(io::Error::from_raw_os_error(-res))
                }),
                PendingKind::Stat => Payload::Stat(if res >= 0 {
                    let stx = unsafe {
                        std::ptr::read_unaligned(
                            &statx_bufs[slot] as *const _ as *const libc::statx,
                        )
                    };
                    Ok(stat::from_statx(&stx))
                } else {
                    Err(io::Error::from_raw_os_error(-res))
                }),
            };

            let completion = Completion {
                seq: pending.seq,
                token: pending.token,
                payload,
            };
            if tx.send(completion).is_err() {
                return;
            }
        }
    }

    debug!(worker = id, "ring worker exiting");
}

enum Prepared {
    /// Executed on the spot; completion to forward, if any
    Inline(Option<Completion>),
    /// Needs a ring submission
    Ring {
        pending: PendingOp,
        dirfd: RawFd,
        follow: bool,
    },
}

/// Sort a request into inline execution or a ring slot
fn prepare(req: Request, drop_work: bool) -> Prepared {
    let Request { seq, token, op } = req;
    match op {
        Op::Close { fd } => {
            drop(fd);
            Prepared::Inline(None)
        }
        Op::Nop { heavy } => {
            if heavy && !drop_work {
                unsafe { libc::getpid() };
            }
            Prepared::Inline(Some(Completion {
                seq,
                token,
                payload: Payload::Nop,
            }))
        }
        Op::Open { dirfd, name, follow } => {
            if drop_work {
                Prepared::Inline(Some(Completion {
                    seq,
                    token,
                    payload: Payload::Open(Err(io::Error::from_raw_os_error(libc::ECANCELED))),
                }))
            } else {
                Prepared::Ring {
                    pending: PendingOp {
                        seq,
                        token,
                        _name: name,
                        kind: PendingKind::Open,
                    },
                    dirfd,
                    follow,
                }
            }
        }
        Op::Stat { dirfd, name, follow } => {
            if drop_work {
                Prepared::Inline(Some(Completion {
                    seq,
                    token,
                    payload: Payload::Stat(Err(io::Error::from_raw_os_error(libc::ECANCELED))),
                }))
            } else {
                Prepared::Ring {
                    pending: PendingOp {
                        seq,
                        token,
                        _name: name,
                        kind: PendingKind::Stat,
                    },
                    dirfd,
                    follow,
                }
            }
        }
    }
}

fn fail(pending: PendingOp, errno: i32) -> Completion {
    let payload = match pending.kind {
        PendingKind::Open => Payload::Open(Err(io::Error::from_raw_os_error(errno))),
        PendingKind::Stat => Payload::Stat(Err(io::Error::from_raw_os_error(errno))),
    };
    Completion {
        seq: pending.seq,
        token: pending.token,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Backend, Ioq, Op, Payload};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn test_ring_backend_open_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file"), b"abc").unwrap();
        let root = CString::new(dir.path().as_os_str().as_bytes()).unwrap();
        let parent = crate::dirent::openat_dir(libc::AT_FDCWD, &root, true).unwrap();
        let parent_fd = {
            use std::os::fd::AsRawFd;
            parent.as_raw_fd()
        };

        // Falls back to the thread backend when the kernel lacks io_uring,
        // so this test is meaningful either way.
        let ioq = Ioq::with_backend(8, 1, Backend::Ring).unwrap();
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

        for _ in 0..2 {
            match ioq.wait().unwrap() {
                super::super::Completion { token: 1, payload: Payload::Open(res), .. } => {
                    res.unwrap();
                }
                super::super::Completion { token: 2, payload: Payload::Stat(res), .. } => {
                    assert_eq!(res.unwrap().size, 3);
                }
                other => panic!("unexpected completion: {:?}", other),
            }
        }
    }
}
