//! Bounded cache of open directory descriptors
//!
//! Open directory handles are the scarce resource of the whole engine: every
//! in-progress subtree wants its parent's descriptor as an `openat` anchor,
//! but `RLIMIT_NOFILE` caps how many can exist. The cache keeps recently
//! used handles alive, pins the ones referenced by in-flight requests, and
//! evicts the least recently used unpinned handle under pressure. An evicted
//! subtree reopens its handle on demand by walking down from its nearest
//! cached ancestor.
//!
//! The cache is owned and touched by the consumer thread only, so it needs
//! no synchronization. Eviction hands the descriptor back to the caller,
//! which decides whether to close it synchronously or through the I/O queue.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Handle to a cache slot
///
/// Ids are generational: once a slot is evicted or removed, its old id stops
/// resolving even if the slot index is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId {
    index: u32,
    gen: u32,
}

struct Slot {
    fd: OwnedFd,
    pins: u32,
    stamp: u64,
}

struct SlotEntry {
    gen: u32,
    slot: Option<Slot>,
}

/// LRU cache of open directory descriptors with pinning
pub struct FdCache {
    slots: Vec<SlotEntry>,
    free: Vec<u32>,
    len: usize,
    capacity: usize,
    clock: u64,
}

impl FdCache {
    /// Create a cache with the given soft capacity
    ///
    /// The capacity is soft: [`FdCache::insert`] never fails, and the caller
    /// restores the bound by evicting after inserting.
    pub fn new(capacity: usize) -> FdCache {
        FdCache {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    /// Number of live descriptors
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no descriptors are cached
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The soft capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when the soft capacity is exceeded
    pub fn is_over_capacity(&self) -> bool {
        self.len > self.capacity
    }

    /// Insert an open descriptor, unpinned, most recently used
    pub fn insert(&mut self, fd: OwnedFd) -> SlotId {
        self.clock += 1;
        let slot = Slot {
            fd,
            pins: 0,
            stamp: self.clock,
        };

        let index = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.slots[index as usize];
                debug_assert!(entry.slot.is_none());
                entry.slot = Some(slot);
                index
            }
            None => {
                self.slots.push(SlotEntry { gen: 0, slot: Some(slot) });
                (self.slots.len() - 1) as u32
            }
        };

        self.len += 1;
        SlotId {
            index,
            gen: self.slots[index as usize].gen,
        }
    }

    fn entry(&self, id: SlotId) -> Option<&Slot> {
        let entry = self.slots.get(id.index as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        entry.slot.as_ref()
    }

    fn entry_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        let entry = self.slots.get_mut(id.index as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        entry.slot.as_mut()
    }

    /// True if the slot still holds a descriptor
    pub fn contains(&self, id: SlotId) -> bool {
        self.entry(id).is_some()
    }

    /// Pin a slot and return its descriptor
    ///
    /// Returns `None` if the slot was evicted; the caller must reopen and
    /// re-insert. Pinned slots are never evicted.
    pub fn acquire(&mut self, id: SlotId) -> Option<RawFd> {
        let slot = self.entry_mut(id)?;
        slot.pins += 1;
        Some(slot.fd.as_raw_fd())
    }

    /// Peek at a slot's descriptor without pinning
    pub fn peek(&self, id: SlotId) -> Option<RawFd> {
        self.entry(id).map(|s| s.fd.as_raw_fd())
    }

    /// Unpin a slot, marking it most recently used
    pub fn release(&mut self, id: SlotId) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(slot) = self.entry_mut(id) {
            debug_assert!(slot.pins > 0);
            slot.pins = slot.pins.saturating_sub(1);
            slot.stamp = clock;
        }
    }

    /// Evict the least recently used unpinned slot
    ///
    /// Returns the descriptor for the caller to close, or `None` when every
    /// slot is pinned (or the cache is empty).
    pub fn evict_one(&mut self) -> Option<OwnedFd> {
        let mut victim: Option<(usize, u64)> = None;
        for (index, entry) in self.slots.iter().enumerate() {
            if let Some(slot) = &entry.slot {
                if slot.pins == 0 && victim.map_or(true, |(_, stamp)| slot.stamp < stamp) {
                    victim = Some((index, slot.stamp));
                }
            }
        }

        let (index, _) = victim?;
        let entry = &mut self.slots[index];
        let slot = entry.slot.take();
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(index as u32);
        self.len -= 1;
        slot.map(|s| s.fd)
    }

    /// Remove a slot unconditionally, returning its descriptor
    ///
    /// Used when the owning subtree is destroyed. Pins are ignored; the
    /// caller asserts nothing references the descriptor anymore.
    pub fn remove(&mut self, id: SlotId) -> Option<OwnedFd> {
        let entry = self.slots.get_mut(id.index as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        let slot = entry.slot.take()?;
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(slot.fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn open_root() -> OwnedFd {
        let root = CString::new("/").unwrap();
        crate::dirent::openat_dir(libc::AT_FDCWD, &root, true).unwrap()
    }

    fn open_tmp(path: &std::path::Path) -> OwnedFd {
        let c = CString::new(path.as_os_str().as_bytes()).unwrap();
        crate::dirent::openat_dir(libc::AT_FDCWD, &c, true).unwrap()
    }

    #[test]
    fn test_insert_acquire_release() {
        let mut cache = FdCache::new(4);
        let id = cache.insert(open_root());
        assert_eq!(cache.len(), 1);

        let fd = cache.acquire(id).unwrap();
        assert!(fd >= 0);
        // Pinned slots survive eviction attempts.
        assert!(cache.evict_one().is_none());

        cache.release(id);
        assert!(cache.evict_one().is_some());
        assert_eq!(cache.len(), 0);
        assert!(!cache.contains(id));
    }

    #[test]
    fn test_lru_eviction_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FdCache::new(3);
        let a = cache.insert(open_tmp(dir.path()));
        let b = cache.insert(open_tmp(dir.path()));
        let c = cache.insert(open_tmp(dir.path()));

        // Touch a so b becomes the LRU.
        cache.acquire(a).unwrap();
        cache.release(a);

        let _ = cache.evict_one().unwrap();
        assert!(cache.contains(a));
        assert!(!cache.contains(b));
        assert!(cache.contains(c));
    }

    #[test]
    fn test_stale_id_after_reuse() {
        let mut cache = FdCache::new(2);
        let a = cache.insert(open_root());
        let fd = cache.remove(a).unwrap();
        drop(fd);

        // The freed index is reused, but the stale id must not resolve.
        let b = cache.insert(open_root());
        assert!(!cache.contains(a));
        assert!(cache.acquire(a).is_none());
        assert!(cache.contains(b));
    }

    #[test]
    fn test_over_capacity_flag() {
        let mut cache = FdCache::new(1);
        let _a = cache.insert(open_root());
        assert!(!cache.is_over_capacity());
        let _b = cache.insert(open_root());
        assert!(cache.is_over_capacity());
        let fd = cache.evict_one().unwrap();
        drop(fd);
        assert!(!cache.is_over_capacity());
    }
}
