use crate::dmi::Access;
use crate::range::Range;
use byteorder::{ByteOrder, NativeEndian};
use std::collections::HashMap;

/// Read callback: receives the current cell value, returns the value the
/// access observes and stores back.
pub type ReadFn<H> = fn(&mut H, u64) -> u64;

/// Write callback: receives the incoming cell value, returns the value to
/// store.
pub type WriteFn<H> = fn(&mut H, u64) -> u64;

/// Tagged variants additionally receive the register's tag word, or the
/// cell index for array registers.
pub type TaggedReadFn<H> = fn(&mut H, u64, u64) -> u64;
pub type TaggedWriteFn<H> = fn(&mut H, u64, u64) -> u64;

/// A memory-mapped register of a peripheral.
///
/// Storage is `count` cells of `width` bytes each (width 1, 2, 4 or 8);
/// values travel as `u64` regardless of width so one register type covers
/// all primitive widths. When banking is enabled and a transaction carries
/// a non-zero CPU identifier, accesses go to that CPU's private copy of the
/// storage, created on demand from the init value.
pub struct Register<H> {
    name: String,
    range: Range,
    width: usize,
    count: usize,
    access: Access,
    pub rsync: bool,
    pub wsync: bool,
    banked: bool,
    init: u64,
    store: Vec<u8>,
    banks: HashMap<u32, Vec<u8>>,
    pub read: Option<ReadFn<H>>,
    pub write: Option<WriteFn<H>>,
    pub tagged_read: Option<TaggedReadFn<H>>,
    pub tagged_write: Option<TaggedWriteFn<H>>,
    pub tag: u64,
}

fn width_mask(width: usize) -> u64 {
    if width == 8 {
        u64::MAX
    } else {
        (1 << (width * 8)) - 1
    }
}

impl<H> Register<H> {
    /// Single-cell register of `width` bytes mapped at `addr`.
    ///
    /// # Panics
    /// If `width` is not 1, 2, 4 or 8 or `init` does not fit it.
    pub fn new(name: impl Into<String>, addr: u64, width: usize, init: u64) -> Self {
        Self::array(name, addr, width, 1, init)
    }

    /// Register array of `count` cells, each initialized to `init`.
    pub fn array(name: impl Into<String>, addr: u64, width: usize, count: usize, init: u64) -> Self {
        let name = name.into();

        assert!(matches!(width, 1 | 2 | 4 | 8), "register {name}: bad width {width}");
        assert!(count > 0, "register {name}: empty array");
        assert!(
            init & !width_mask(width) == 0,
            "register {name}: init value does not fit {width} bytes"
        );

        let mut store = vec![0; width * count];

        for cell in store.chunks_mut(width) {
            NativeEndian::write_uint(cell, init, width);
        }

        Self {
            range: Range::with_size(addr, (width * count) as u64),
            name,
            width,
            count,
            access: Access::RW,
            rsync: false,
            wsync: false,
            banked: false,
            init,
            store,
            banks: HashMap::new(),
            read: None,
            write: None,
            tagged_read: None,
            tagged_write: None,
            tag: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_readable(&self) -> bool {
        self.access.contains(Access::READ)
    }

    pub fn is_writeable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    pub fn allow_read(&mut self) {
        self.access = Access::READ;
    }

    pub fn allow_write(&mut self) {
        self.access = Access::WRITE;
    }

    pub fn allow_read_write(&mut self) {
        self.access = Access::RW;
    }

    pub fn deny_access(&mut self) {
        self.access = Access::empty();
    }

    pub fn sync_on_read(&mut self) {
        self.rsync = true;
    }

    pub fn sync_on_write(&mut self) {
        self.wsync = true;
    }

    pub fn sync_always(&mut self) {
        self.rsync = true;
        self.wsync = true;
    }

    pub fn sync_never(&mut self) {
        self.rsync = false;
        self.wsync = false;
    }

    pub fn is_banked(&self) -> bool {
        self.banked
    }

    pub fn set_banked(&mut self) {
        self.banked = true;
    }

    /// Current value of cell 0 in the shared bank.
    pub fn get(&self) -> u64 {
        self.bank_get(0, 0)
    }

    pub fn set(&mut self, val: u64) {
        self.bank_set(0, 0, val);
    }

    /// Value of cell `idx` in `bank`. Reading a bank that was never written
    /// yields the init value without allocating it.
    pub fn bank_get(&self, bank: u32, idx: usize) -> u64 {
        assert!(idx < self.count, "register {}: index {idx} out of bounds", self.name);

        let store = if self.banked && bank != 0 {
            match self.banks.get(&bank) {
                Some(s) => s,
                None => return self.init,
            }
        } else {
            &self.store
        };

        NativeEndian::read_uint(&store[idx * self.width..], self.width)
    }

    pub fn bank_set(&mut self, bank: u32, idx: usize, val: u64) {
        assert!(idx < self.count, "register {}: index {idx} out of bounds", self.name);

        let width = self.width;
        let store = if self.banked && bank != 0 {
            let init = self.init;
            let count = self.count;

            self.banks.entry(bank).or_insert_with(|| {
                let mut s = vec![0; width * count];

                for cell in s.chunks_mut(width) {
                    NativeEndian::write_uint(cell, init, width);
                }

                s
            })
        } else {
            &mut self.store
        };

        NativeEndian::write_uint(
            &mut store[idx * width..(idx + 1) * width],
            val & width_mask(width),
            width,
        );
    }

    /// Restores every cell of the shared bank and of all allocated banks to
    /// the init value.
    pub fn reset(&mut self) {
        let width = self.width;
        let init = self.init;

        for cell in self.store.chunks_mut(width) {
            NativeEndian::write_uint(cell, init, width);
        }

        for bank in self.banks.values_mut() {
            for cell in bank.chunks_mut(width) {
                NativeEndian::write_uint(cell, init, width);
            }
        }
    }

    fn tag_for(&self, idx: usize) -> u64 {
        if self.count > 1 {
            idx as u64
        } else {
            self.tag
        }
    }

    /// Reads the cells covered by `addr` (which must lie inside the
    /// register) into `dest`, invoking the read callback once per touched
    /// cell.
    pub fn do_read(&mut self, host: &mut H, addr: Range, dest: &mut [u8], bank: u32) {
        debug_assert!(addr.inside(&self.range));
        debug_assert_eq!(addr.length() as usize, dest.len());

        let width = self.width;
        let mut pos = addr.start;
        let mut di = 0;

        while pos <= addr.end {
            let rel = (pos - self.range.start) as usize;
            let idx = rel / width;
            let off = rel % width;
            let n = ((addr.end - pos + 1) as usize).min(width - off);

            let mut val = self.bank_get(bank, idx);

            if let Some(f) = self.tagged_read {
                val = f(host, val, self.tag_for(idx));
            } else if let Some(f) = self.read {
                val = f(host, val);
            }

            self.bank_set(bank, idx, val);

            let mut img = [0; 8];

            NativeEndian::write_uint(&mut img[..width], val & width_mask(width), width);
            dest[di..di + n].copy_from_slice(&img[off..off + n]);

            pos += n as u64;
            di += n;
        }
    }

    /// Writes `src` into the cells covered by `addr`, invoking the write
    /// callback once per touched cell with the merged cell value.
    pub fn do_write(&mut self, host: &mut H, addr: Range, src: &[u8], bank: u32) {
        debug_assert!(addr.inside(&self.range));
        debug_assert_eq!(addr.length() as usize, src.len());

        let width = self.width;
        let mut pos = addr.start;
        let mut si = 0;

        while pos <= addr.end {
            let rel = (pos - self.range.start) as usize;
            let idx = rel / width;
            let off = rel % width;
            let n = ((addr.end - pos + 1) as usize).min(width - off);

            let mut img = [0; 8];

            NativeEndian::write_uint(&mut img[..width], self.bank_get(bank, idx), width);
            img[off..off + n].copy_from_slice(&src[si..si + n]);

            let mut val = NativeEndian::read_uint(&img[..width], width);

            if let Some(f) = self.tagged_write {
                val = f(host, val, self.tag_for(idx));
            } else if let Some(f) = self.write {
                val = f(host, val);
            }

            self.bank_set(bank, idx, val);

            pos += n as u64;
            si += n;
        }
    }
}
