//! Portable directory stream reader
//!
//! Wraps directory-handle iteration into a uniform interface. On Linux the
//! reader drives the raw `getdents64` syscall into a reusable 64 KiB buffer,
//! bypassing libc's buffered iteration; elsewhere it falls back to
//! `fdopendir`/`readdir` on a duplicated descriptor. Either way the reader
//! never takes ownership of the caller's descriptor.
//!
//! Entries carry a type hint from `d_type` when the filesystem provides one;
//! `DT_UNKNOWN` degrades to `None` and the walker resolves the type with a
//! later stat or open.

use crate::stat::FileType;
use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

/// Stream buffer size, sized to amortize getdents syscalls on wide
/// directories
const DIR_BUF_SIZE: usize = 64 << 10;

/// One name yielded by a directory stream
#[derive(Debug)]
pub struct DirEntryRecord {
    name: CString,
    type_hint: Option<FileType>,
}

impl DirEntryRecord {
    /// The entry's base name as a C string, ready for `openat`/`fstatat`
    pub fn name_c(&self) -> &CStr {
        &self.name
    }

    /// The entry's base name as an `OsStr`
    pub fn name(&self) -> &OsStr {
        OsStr::from_bytes(self.name.to_bytes())
    }

    /// Type hint from `d_type`, if the filesystem filled one in
    pub fn type_hint(&self) -> Option<FileType> {
        self.type_hint
    }

    /// Take ownership of the name
    pub fn into_name(self) -> CString {
        self.name
    }
}

/// Open a directory relative to `dirfd` (or the working directory for
/// `AT_FDCWD`)
///
/// Always `O_RDONLY | O_DIRECTORY | O_CLOEXEC`; `follow` controls
/// `O_NOFOLLOW`. A symlink under `O_NOFOLLOW` fails with `ELOOP` (`EMLINK`
/// on some BSDs), which callers use to classify the entry rather than treat
/// as an error.
pub fn openat_dir(dirfd: RawFd, path: &CStr, follow: bool) -> io::Result<OwnedFd> {
    let mut flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;
    if !follow {
        flags |= libc::O_NOFOLLOW;
    }
    let fd = unsafe { libc::openat(dirfd, path.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Skip ".", "..", and empty dirents
fn skip_name(name: &[u8]) -> bool {
    matches!(name, b"" | b"." | b"..")
}

#[cfg(target_os = "linux")]
pub use linux::DirReader;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    /// getdents64 syscall wrapper
    fn getdents64(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    // struct linux_dirent64 field offsets: d_ino 0, d_off 8, d_reclen 16,
    // d_type 18, d_name 19...
    const OFF_RECLEN: usize = 16;
    const OFF_TYPE: usize = 18;
    const OFF_NAME: usize = 19;

    /// Directory stream over a borrowed descriptor, batched via getdents64
    pub struct DirReader {
        fd: RawFd,
        buf: Vec<u8>,
        pos: usize,
        len: usize,
        eof: bool,
    }

    impl DirReader {
        /// Start reading the directory open at `fd`
        ///
        /// The descriptor stays owned by the caller and must outlive the
        /// reader. Reading starts from the descriptor's current offset.
        pub fn new(fd: RawFd) -> DirReader {
            DirReader {
                fd,
                buf: vec![0u8; DIR_BUF_SIZE],
                pos: 0,
                len: 0,
                eof: false,
            }
        }

        /// Refill the buffer; returns false at end of stream
        fn fill(&mut self) -> io::Result<bool> {
            if self.eof {
                return Ok(false);
            }

            let n = getdents64(self.fd, &mut self.buf)?;
            if n == 0 {
                self.eof = true;
                return Ok(false);
            }
            self.pos = 0;
            self.len = n;

            // getdents only reports EOF once a call returns zero. Probe the
            // remaining buffer space eagerly so the final next_entry() can
            // skip a syscall.
            let rest = self.buf.len() - n;
            if rest > OFF_NAME {
                let (_, tail) = self.buf.split_at_mut(n);
                match getdents64(self.fd, tail) {
                    Ok(0) => self.eof = true,
                    Ok(m) => self.len += m,
                    // Probe failures resurface on the next fill.
                    Err(_) => {}
                }
            }

            Ok(true)
        }

        /// Next entry, or `None` at end of stream
        ///
        /// ".", "..", and unparseable names are skipped.
        pub fn next_entry(&mut self) -> io::Result<Option<DirEntryRecord>> {
            loop {
                if self.pos >= self.len && !self.fill()? {
                    return Ok(None);
                }

                let rec = &self.buf[self.pos..self.len];
                if rec.len() < OFF_NAME {
                    // Truncated record; force a refill.
                    self.pos = self.len;
                    continue;
                }

                let reclen = u16::from_ne_bytes([rec[OFF_RECLEN], rec[OFF_RECLEN + 1]]) as usize;
                if reclen == 0 || reclen > rec.len() {
                    self.pos = self.len;
                    continue;
                }
                let d_type = rec[OFF_TYPE];
                let name_area = &rec[OFF_NAME..reclen];
                let name_len = name_area.iter().position(|&b| b == 0).unwrap_or(name_area.len());
                let name = &name_area[..name_len];
                self.pos += reclen;

                if skip_name(name) {
                    continue;
                }
                let Ok(name) = CString::new(name.to_vec()) else {
                    continue;
                };
                return Ok(Some(DirEntryRecord {
                    name,
                    type_hint: FileType::from_dirent_type(d_type),
                }));
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::DirReader;

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::*;

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe fn errno_ptr() -> *mut libc::c_int {
        libc::__error()
    }

    #[cfg(any(target_os = "netbsd", target_os = "openbsd", target_os = "android"))]
    unsafe fn errno_ptr() -> *mut libc::c_int {
        libc::__errno()
    }

    /// Directory stream over a borrowed descriptor via fdopendir/readdir
    ///
    /// The descriptor is duplicated first so closedir never touches the
    /// caller's fd.
    pub struct DirReader {
        dir: *mut libc::DIR,
        eof: bool,
    }

    impl DirReader {
        pub fn new(fd: RawFd) -> DirReader {
            let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
            let dir = if dup >= 0 {
                let dir = unsafe { libc::fdopendir(dup) };
                if dir.is_null() {
                    unsafe { libc::close(dup) };
                }
                dir
            } else {
                std::ptr::null_mut()
            };
            DirReader { dir, eof: false }
        }

        pub fn next_entry(&mut self) -> io::Result<Option<DirEntryRecord>> {
            if self.dir.is_null() {
                return Err(io::Error::last_os_error());
            }
            loop {
                if self.eof {
                    return Ok(None);
                }

                unsafe { *errno_ptr() = 0 };
                let de = unsafe { libc::readdir(self.dir) };
                if de.is_null() {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error().unwrap_or(0) == 0 {
                        self.eof = true;
                        return Ok(None);
                    }
                    return Err(err);
                }

                let name = unsafe { CStr::from_ptr((*de).d_name.as_ptr()) };
                if skip_name(name.to_bytes()) {
                    continue;
                }
                let d_type = unsafe { (*de).d_type };
                return Ok(Some(DirEntryRecord {
                    name: name.to_owned(),
                    type_hint: FileType::from_dirent_type(d_type),
                }));
            }
        }
    }

    impl Drop for DirReader {
        fn drop(&mut self) {
            if !self.dir.is_null() {
                unsafe { libc::closedir(self.dir) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::ffi::CString;
    use std::fs;
    use std::os::fd::AsRawFd;
    use tempfile::tempdir;

    fn open_tmp(path: &std::path::Path) -> OwnedFd {
        let c = CString::new(path.as_os_str().as_bytes()).unwrap();
        openat_dir(libc::AT_FDCWD, &c, true).unwrap()
    }

    #[test]
    fn test_reads_all_names() {
        let dir = tempdir().unwrap();
        for name in ["alpha", "beta", "gamma"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let fd = open_tmp(dir.path());
        let mut reader = DirReader::new(fd.as_raw_fd());
        let mut names = BTreeSet::new();
        let mut dirs = 0;
        while let Some(rec) = reader.next_entry().unwrap() {
            if rec.type_hint() == Some(FileType::Directory) {
                dirs += 1;
            }
            names.insert(rec.name().to_os_string());
        }

        let expect: BTreeSet<_> = ["alpha", "beta", "gamma", "subdir"]
            .iter()
            .map(|s| std::ffi::OsString::from(s))
            .collect();
        assert_eq!(names, expect);
        // d_type may legitimately be unknown, but never wrong.
        assert!(dirs <= 1);
    }

    #[test]
    fn test_empty_dir() {
        let dir = tempdir().unwrap();
        let fd = open_tmp(dir.path());
        let mut reader = DirReader::new(fd.as_raw_fd());
        assert!(reader.next_entry().unwrap().is_none());
        // EOF is sticky
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_openat_dir_enotdir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("plain"), b"x").unwrap();
        let fd = open_tmp(dir.path());
        let name = CString::new("plain").unwrap();
        let err = openat_dir(fd.as_raw_fd(), &name, false).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
    }

    #[test]
    fn test_openat_dir_nofollow_symlink() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("link")).unwrap();

        let fd = open_tmp(dir.path());
        let name = CString::new("link").unwrap();
        let err = openat_dir(fd.as_raw_fd(), &name, false).unwrap_err();
        let errno = err.raw_os_error().unwrap();
        assert!(errno == libc::ELOOP || errno == libc::EMLINK);

        // With follow the same name opens fine.
        assert!(openat_dir(fd.as_raw_fd(), &name, true).is_ok());
    }

    #[test]
    fn test_wide_directory_spans_buffers() {
        let dir = tempdir().unwrap();
        let count = 3000;
        for i in 0..count {
            fs::write(dir.path().join(format!("file-{i:05}")), b"").unwrap();
        }
        let fd = open_tmp(dir.path());
        let mut reader = DirReader::new(fd.as_raw_fd());
        let mut seen = 0;
        while let Some(_rec) = reader.next_entry().unwrap() {
            seen += 1;
        }
        assert_eq!(seen, count);
    }
}
