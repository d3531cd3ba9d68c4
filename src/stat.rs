//! File metadata lookups
//!
//! Thin wrappers over `fstatat(2)` that produce a portable [`FileStat`]
//! buffer. The traversal materializes these lazily: a visit only pays for a
//! stat when the callback (or a policy check) actually asks for one.

use std::ffi::CStr;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File types distinguishable by the walker
///
/// Populated from `d_type` when the directory stream provides it, otherwise
/// from the stat mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    BlockDevice,
    CharDevice,
    Directory,
    Fifo,
    Symlink,
    Regular,
    Socket,
    Unknown,
}

impl FileType {
    /// Returns true for [`FileType::Directory`]
    pub fn is_dir(self) -> bool {
        self == FileType::Directory
    }

    /// Returns true for [`FileType::Symlink`]
    pub fn is_symlink(self) -> bool {
        self == FileType::Symlink
    }

    /// Map a `d_type` byte from a directory stream
    ///
    /// `DT_UNKNOWN` (and whiteout/other exotic values) map to `None`, which
    /// forces the walker to resolve the type another way.
    pub fn from_dirent_type(d_type: u8) -> Option<FileType> {
        match d_type {
            libc::DT_BLK => Some(FileType::BlockDevice),
            libc::DT_CHR => Some(FileType::CharDevice),
            libc::DT_DIR => Some(FileType::Directory),
            libc::DT_FIFO => Some(FileType::Fifo),
            libc::DT_LNK => Some(FileType::Symlink),
            libc::DT_REG => Some(FileType::Regular),
            libc::DT_SOCK => Some(FileType::Socket),
            _ => None,
        }
    }

    /// Map the `S_IFMT` bits of a stat mode
    pub fn from_mode(mode: u32) -> FileType {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
            m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
            m if m == libc::S_IFDIR as u32 => FileType::Directory,
            m if m == libc::S_IFIFO as u32 => FileType::Fifo,
            m if m == libc::S_IFLNK as u32 => FileType::Symlink,
            m if m == libc::S_IFREG as u32 => FileType::Regular,
            m if m == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::Unknown,
        }
    }
}

/// A portable stat buffer
///
/// Field widths are normalized so the rest of the crate never touches the
/// platform `struct stat` directly.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

impl FileStat {
    /// The file type encoded in the mode bits
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// Modification time as a `SystemTime`
    pub fn modified(&self) -> SystemTime {
        if self.mtime_secs >= 0 {
            UNIX_EPOCH + Duration::new(self.mtime_secs as u64, self.mtime_nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.mtime_secs.unsigned_abs())
        }
    }

    fn from_raw(st: &libc::stat) -> FileStat {
        FileStat {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            size: st.st_size as u64,
            blocks: st.st_blocks as u64,
            mtime_secs: st.st_mtime as i64,
            mtime_nanos: mtime_nanos(st),
        }
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
))]
fn mtime_nanos(st: &libc::stat) -> u32 {
    st.st_mtime_nsec as u32
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn mtime_nanos(_st: &libc::stat) -> u32 {
    0
}

/// `fstatat(2)` relative to `dirfd`, or to the working directory when
/// `dirfd` is `AT_FDCWD`
///
/// `follow` controls `AT_SYMLINK_NOFOLLOW`.
pub fn fstatat(dirfd: RawFd, name: &CStr, follow: bool) -> io::Result<FileStat> {
    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstatat(dirfd, name.as_ptr(), st.as_mut_ptr(), flags) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let st = unsafe { st.assume_init() };
    Ok(FileStat::from_raw(&st))
}

/// `fstat(2)` an open descriptor
///
/// The engine uses this on freshly opened directories to learn their
/// `(dev, ino)` identity for mount and cycle checks.
pub fn fstat(fd: RawFd) -> io::Result<FileStat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let st = unsafe { st.assume_init() };
    Ok(FileStat::from_raw(&st))
}

/// Build a [`FileStat`] from a kernel `statx` buffer
#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub(crate) fn from_statx(stx: &libc::statx) -> FileStat {
    FileStat {
        dev: ((stx.stx_dev_major as u64) << 32) | stx.stx_dev_minor as u64,
        ino: stx.stx_ino,
        mode: stx.stx_mode as u32,
        nlink: stx.stx_nlink as u64,
        uid: stx.stx_uid,
        gid: stx.stx_gid,
        size: stx.stx_size,
        blocks: stx.stx_blocks,
        mtime_secs: stx.stx_mtime.tv_sec,
        mtime_nanos: stx.stx_mtime.tv_nsec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_dirent_type_mapping() {
        assert_eq!(
            FileType::from_dirent_type(libc::DT_DIR),
            Some(FileType::Directory)
        );
        assert_eq!(
            FileType::from_dirent_type(libc::DT_REG),
            Some(FileType::Regular)
        );
        assert_eq!(FileType::from_dirent_type(libc::DT_UNKNOWN), None);
    }

    #[test]
    fn test_stat_cwd() {
        let dot = CString::new(".").unwrap();
        let st = fstatat(libc::AT_FDCWD, &dot, true).unwrap();
        assert!(st.file_type().is_dir());
        assert!(st.nlink >= 1);
    }

    #[test]
    fn test_stat_missing() {
        let name = CString::new("definitely-not-here-bfs-walker").unwrap();
        let err = fstatat(libc::AT_FDCWD, &name, false).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
