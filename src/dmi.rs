use crate::range::Range;
use bitflags::bitflags;
use std::sync::{Arc, Mutex};
use std::time::Duration;

bitflags! {
    /// Access permissions of registers, memories and DMI windows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl Access {
    pub const RW: Access = Access::READ.union(Access::WRITE);

    /// Whether a grant of `self` satisfies a request for `requested`. A
    /// read-write grant dominates both directions; a read-only grant does
    /// not dominate a write request.
    pub fn dominates(self, requested: Access) -> bool {
        self.contains(requested)
    }
}

/// Maps an address range to host memory.
///
/// The host pointer corresponds to `range.start`; the descriptor promises
/// that `range.length()` bytes starting there are valid for the granted
/// access for as long as the descriptor has not been invalidated.
#[derive(Debug, Clone, Copy)]
pub struct DmiDescriptor {
    pub range: Range,
    pub ptr: *mut u8,
    pub access: Access,
    pub read_latency: Duration,
    pub write_latency: Duration,
}

// The raw pointer targets a mapping that outlives the descriptor; sharing it
// across threads is governed by the suspension protocol, not by this type.
unsafe impl Send for DmiDescriptor {}

impl DmiDescriptor {
    /// Host address of `addr`.
    ///
    /// # Panics
    /// If `addr` lies outside the descriptor.
    pub fn ptr_at(&self, addr: u64) -> *mut u8 {
        assert!(self.range.contains(addr), "{addr:#x} not in {}", self.range);

        unsafe { self.ptr.add((addr - self.range.start) as usize) }
    }

    pub fn latency(&self, access: Access) -> Duration {
        if access.contains(Access::WRITE) {
            self.write_latency
        } else {
            self.read_latency
        }
    }
}

/// Set of DMI descriptors owned by one initiator socket.
#[derive(Debug, Default)]
pub struct DmiCache {
    entries: Vec<DmiDescriptor>,
}

pub type SharedDmiCache = Arc<Mutex<DmiCache>>;

impl DmiCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches a descriptor. Existing descriptors overlapping the new range
    /// are evicted first so a lookup never sees two mappings for one
    /// address; the latest grant wins.
    pub fn insert(&mut self, desc: DmiDescriptor) {
        self.invalidate(desc.range);
        self.entries.push(desc);
    }

    /// First descriptor containing all of `addr` whose granted access
    /// dominates `access`.
    pub fn lookup(&self, addr: Range, access: Access) -> Option<&DmiDescriptor> {
        self.entries
            .iter()
            .find(|d| addr.inside(&d.range) && d.access.dominates(access))
    }

    /// Drops every descriptor touching `addr`, fully or in part.
    pub fn invalidate(&mut self, addr: Range) {
        self.entries.retain(|d| !d.range.overlaps(&addr));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Broadcasts DMI invalidations from a target to every initiator that may
/// have cached one of its windows.
#[derive(Default)]
pub struct DmiFanout {
    caches: Vec<SharedDmiCache>,
}

impl DmiFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, cache: SharedDmiCache) {
        self.caches.push(cache);
    }

    pub fn invalidate(&self, addr: Range) {
        for cache in &self.caches {
            cache.lock().unwrap().invalidate(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(start: u64, end: u64, access: Access) -> DmiDescriptor {
        DmiDescriptor {
            range: Range::new(start, end),
            ptr: std::ptr::null_mut(),
            access,
            read_latency: Duration::ZERO,
            write_latency: Duration::ZERO,
        }
    }

    #[test]
    fn lookup_dominates() {
        let mut cache = DmiCache::new();

        cache.insert(desc(0x0, 0xfff, Access::READ));
        cache.insert(desc(0x1000, 0x1fff, Access::RW));

        // A read may use an RW window, a write may not use a read-only one.
        assert!(cache.lookup(Range::new(0x10, 0x13), Access::READ).is_some());
        assert!(cache.lookup(Range::new(0x10, 0x13), Access::WRITE).is_none());
        assert!(cache
            .lookup(Range::new(0x1000, 0x1003), Access::WRITE)
            .is_some());

        // The request must be fully contained.
        assert!(cache.lookup(Range::new(0xffe, 0x1001), Access::READ).is_none());
    }

    #[test]
    fn insert_idempotent() {
        let mut cache = DmiCache::new();
        let d = desc(0x0, 0xfff, Access::RW);

        cache.insert(d);
        cache.insert(d);

        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(Range::new(0x0, 0x3), Access::RW).is_some());
    }

    #[test]
    fn insert_replaces_overlap() {
        let mut cache = DmiCache::new();

        cache.insert(desc(0x0, 0xfff, Access::RW));
        cache.insert(desc(0x800, 0x17ff, Access::READ));

        // The older overlapping window is gone entirely.
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(Range::new(0x0, 0x3), Access::READ).is_none());
        assert!(cache.lookup(Range::new(0x800, 0x803), Access::READ).is_some());
    }

    #[test]
    fn invalidate_overlapping() {
        let mut cache = DmiCache::new();

        cache.insert(desc(0x0, 0xfff, Access::RW));
        cache.insert(desc(0x2000, 0x2fff, Access::RW));

        cache.invalidate(Range::new(0xf00, 0x20ff));

        assert!(cache.is_empty());
    }

    #[test]
    fn fanout() {
        let a: SharedDmiCache = Arc::default();
        let b: SharedDmiCache = Arc::default();
        let mut fanout = DmiFanout::new();

        fanout.bind(a.clone());
        fanout.bind(b.clone());

        a.lock().unwrap().insert(desc(0x0, 0xfff, Access::RW));
        b.lock().unwrap().insert(desc(0x0, 0xfff, Access::RW));
        fanout.invalidate(Range::new(0x0, 0x0));

        assert!(a.lock().unwrap().is_empty());
        assert!(b.lock().unwrap().is_empty());
    }

    #[test]
    fn ptr_at() {
        let mut backing = [0u8; 16];
        let d = DmiDescriptor {
            range: Range::new(0x100, 0x10f),
            ptr: backing.as_mut_ptr(),
            access: Access::RW,
            read_latency: Duration::ZERO,
            write_latency: Duration::ZERO,
        };

        assert_eq!(d.ptr_at(0x100), backing.as_mut_ptr());
        assert_eq!(d.ptr_at(0x104), unsafe { backing.as_mut_ptr().add(4) });
    }
}
