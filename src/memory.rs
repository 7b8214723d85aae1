use crate::dmi::{Access, DmiDescriptor, DmiFanout, SharedDmiCache};
use crate::module::{AttrInfo, CommandInfo, Module};
use crate::payload::{Payload, Response};
use crate::peripheral::Peripheral;
use crate::property::{parse_int, Property};
use crate::range::Range;
use crate::sbi::Sbi;
use crate::target::TlmTarget;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{Error, Read};
use std::time::Duration;
use thiserror::Error;

/// A flat backing-store target.
///
/// The storage is an anonymous mapping aligned to a configurable power of
/// two so guest pages can be host-page aligned for DMI consumers. Reset
/// optionally poisons the contents and then loads the configured image
/// list.
pub struct Memory {
    periph: Peripheral<MemCore>,
    core: MemCore,
}

struct MemCore {
    name: String,
    base: *mut u8,
    map_len: usize,
    mem: *mut u8,
    size: Property<u64>,
    align: Property<u32>,
    readonly: Property<bool>,
    images: Property<String>,
    poison: Property<u8>,
    fanout: DmiFanout,
}

// The mapping lives until drop; concurrent access is governed by the
// suspension protocol.
unsafe impl Send for MemCore {}

impl Memory {
    /// Maps a `size`-byte memory called `name`. Properties may override the
    /// defaults given here before the mapping is created.
    pub fn new(name: impl Into<String>, size: u64, readonly: bool) -> Result<Self, NewError> {
        let name = name.into();
        let size = Property::new(format!("{name}.size"), size);
        let align = Property::new(format!("{name}.align"), 12u32);
        let readonly = Property::new(format!("{name}.readonly"), readonly);
        let images = Property::new(format!("{name}.images"), String::new());
        let poison = Property::new(format!("{name}.poison"), 0u8);

        if *size.get() == 0 {
            return Err(NewError::EmptySize);
        }

        if *align.get() >= 64 {
            return Err(NewError::AlignmentTooBig);
        }

        let extra = (1usize << *align.get()) - 1;
        let map_len = *size.get() as usize + extra;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                map_flags(),
                -1,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            return Err(NewError::MapFailed(Error::last_os_error()));
        }

        let base = base.cast::<u8>();
        let mem = ((base as usize + extra) & !extra) as *mut u8;
        let mut periph = Peripheral::new(name.clone());

        periph.fallback_read = Some(MemCore::read);
        periph.fallback_write = Some(MemCore::write);

        Ok(Self {
            periph,
            core: MemCore {
                name,
                base,
                map_len,
                mem,
                size,
                align,
                readonly,
                images,
                poison,
                fanout: DmiFanout::new(),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn size(&self) -> u64 {
        *self.core.size.get()
    }

    pub fn host_addr(&self) -> *const u8 {
        self.core.mem
    }

    pub fn set_latencies(&mut self, read: Duration, write: Duration) {
        self.periph.read_latency = read;
        self.periph.write_latency = write;
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.core.mem, self.size() as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.core.mem, *self.core.size.get() as usize) }
    }

    /// Applies the poison pattern and loads the configured images.
    pub fn reset(&mut self) {
        let poison = *self.core.poison.get();

        if poison > 0 {
            self.as_mut_slice().fill(poison);
        }

        for (file, offset) in parse_images(self.core.images.get()) {
            log::debug!("{}: loading '{file}' at {offset:#010x}", self.core.name);
            self.core.load(&file, offset);
        }
    }

    /// Copies an image file into the memory at `offset`, truncating with a
    /// warning if it does not fit.
    pub fn load(&mut self, path: &str, offset: u64) {
        self.core.load(path, offset);
    }
}

impl MemCore {
    fn slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mem, *self.size.get() as usize) }
    }

    fn read(core: &mut MemCore, addr: Range, data: &mut [u8], _info: Sbi) -> Response {
        if addr.end >= *core.size.get() {
            return Response::AddressError;
        }

        let at = addr.start as usize;

        data.copy_from_slice(&core.slice()[at..at + data.len()]);
        Response::Ok
    }

    fn write(core: &mut MemCore, addr: Range, data: &[u8], info: Sbi) -> Response {
        if addr.end >= *core.size.get() {
            return Response::AddressError;
        }

        // Debug writes ignore write protection.
        if *core.readonly.get() && !info.is_debug() {
            return Response::CommandError;
        }

        let at = addr.start as usize;

        core.slice()[at..at + data.len()].copy_from_slice(data);
        Response::Ok
    }

    fn load(&mut self, path: &str, offset: u64) {
        let size = *self.size.get();
        let mut file = match File::open(path) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{}: cannot open file '{path}': {e}", self.name);
                return;
            }
        };

        if offset >= size {
            log::warn!("{}: offset {offset} exceeds memory size {size}", self.name);
            return;
        }

        let mut nbytes = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                log::warn!("{}: cannot stat file '{path}': {e}", self.name);
                return;
            }
        };

        if nbytes > size - offset {
            nbytes = size - offset;
            log::warn!("{}: image file '{path}' too big, truncating after {nbytes} bytes", self.name);
        }

        let at = offset as usize;
        let dst = &mut self.slice()[at..at + nbytes as usize];

        if let Err(e) = file.read_exact(dst) {
            log::warn!("{}: cannot read file '{path}': {e}", self.name);
        }
    }

    fn access(&self) -> Access {
        if *self.readonly.get() {
            Access::READ
        } else {
            Access::RW
        }
    }
}

impl Drop for MemCore {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.base.cast(), self.map_len) } < 0 {
            panic!(
                "failed to unmap memory at {:p}: {}",
                self.base,
                Error::last_os_error()
            );
        }
    }
}

fn map_flags() -> libc::c_int {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    #[cfg(target_os = "linux")]
    let flags = flags | libc::MAP_NORESERVE;

    flags
}

/// Parses a `path[@offset];...` image list, whitespace stripped. Offsets
/// accept the usual integer prefixes.
fn parse_images(s: &str) -> Vec<(String, u64)> {
    let stripped: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let mut images = Vec::new();

    for entry in stripped.split(';') {
        if entry.is_empty() {
            continue;
        }

        let (file, offset) = match entry.split_once('@') {
            Some((f, o)) => (f, parse_int(o).unwrap_or(0)),
            None => (entry, 0),
        };

        if !file.is_empty() {
            images.push((file.to_owned(), offset));
        }
    }

    images
}

impl TlmTarget for Memory {
    fn b_transport(&mut self, tx: &mut Payload, offset: &mut Duration) {
        self.periph.transport(&mut self.core, tx, offset);

        if tx.response.is_ok() {
            tx.dmi_allowed = true;
        }
    }

    fn transport_dbg(&mut self, tx: &mut Payload) -> usize {
        let mut t = Duration::ZERO;

        self.periph.transport(&mut self.core, tx, &mut t)
    }

    fn get_direct_mem_ptr(&mut self, _tx: &Payload) -> Option<DmiDescriptor> {
        Some(DmiDescriptor {
            range: Range::with_size(0, *self.core.size.get()),
            ptr: self.core.mem,
            access: self.core.access(),
            read_latency: self.periph.read_latency,
            write_latency: self.periph.write_latency,
        })
    }

    fn bind_dmi_cache(&mut self, cache: SharedDmiCache) {
        self.core.fanout.bind(cache);
    }
}

impl Module for Memory {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kind(&self) -> &'static str {
        "vpfab::memory"
    }

    fn attributes(&self) -> Vec<AttrInfo> {
        let c = &self.core;

        [
            (c.size.basename(), c.size.type_name()),
            (c.align.basename(), c.align.type_name()),
            (c.readonly.basename(), c.readonly.type_name()),
            (c.images.basename(), c.images.type_name()),
            (c.poison.basename(), c.poison.type_name()),
        ]
        .into_iter()
        .map(|(name, ty)| AttrInfo {
            name: name.to_owned(),
            ty,
            count: 1,
        })
        .collect()
    }

    fn read_attr(&self, name: &str) -> Option<String> {
        let c = &self.core;

        match name {
            "size" => Some(c.size.str().to_owned()),
            "align" => Some(c.align.str().to_owned()),
            "readonly" => Some(c.readonly.str().to_owned()),
            "images" => Some(c.images.str().to_owned()),
            "poison" => Some(c.poison.str().to_owned()),
            _ => None,
        }
    }

    fn write_attr(&mut self, name: &str, value: &str) -> Result<(), String> {
        let c = &mut self.core;

        match name {
            "readonly" => {
                c.readonly.set_str(value)?;

                // Cached write permissions may now be stale.
                c.fanout.invalidate(Range::with_size(0, *c.size.get()));
                Ok(())
            }
            "images" => c.images.set_str(value),
            "poison" => c.poison.set_str(value),
            "size" | "align" => Err(format!("attribute '{name}' is fixed after construction")),
            _ => Err(format!("attribute '{name}' not found")),
        }
    }

    fn commands(&self) -> Vec<CommandInfo> {
        vec![
            CommandInfo {
                name: "load",
                argc: 1,
                desc: "load <binary> [offset]: load the contents of file <binary> to \
                       relative offset [offset] in memory (zero if unspecified)",
            },
            CommandInfo {
                name: "show",
                argc: 2,
                desc: "show <start> <end>: show memory contents between <start> and <end>",
            },
        ]
    }

    fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<String, String> {
        match cmd {
            "load" => {
                let path = args.first().ok_or("missing file argument")?;
                let offset = args.get(1).map(|a| parse_int(a)).unwrap_or(Some(0));

                self.core.load(path, offset.ok_or("invalid offset")?);
                Ok(String::new())
            }
            "show" => {
                let start = args.first().and_then(|a| parse_int(a)).ok_or("invalid start")?;
                let end = args.get(1).and_then(|a| parse_int(a)).ok_or("invalid end")?;

                if end <= start || end >= *self.core.size.get() {
                    return Err(format!("bad range {start:#x}..{end:#x}"));
                }

                Ok(self.show(start, end))
            }
            _ => Err(format!("command '{cmd}' not supported")),
        }
    }
}

impl Memory {
    fn show(&self, start: u64, end: u64) -> String {
        let mem = self.as_slice();
        let mut out = format!("showing range {:#010x} .. {:#010x}", start, end);
        let mut addr = start & !0xf;

        while addr < end {
            if addr % 16 == 0 {
                let _ = write!(out, "\n{addr:08x}:");
            }

            if addr % 4 == 0 {
                out.push(' ');
            }

            if addr >= start {
                let _ = write!(out, "{:02x} ", mem[addr as usize]);
            } else {
                out.push_str("   ");
            }

            addr += 1;
        }

        out
    }
}

/// Represents an error when [`Memory::new()`] fails.
#[derive(Debug, Error)]
pub enum NewError {
    #[error("memory size cannot be zero")]
    EmptySize,

    #[error("requested alignment too big")]
    AlignmentTooBig,

    #[error("couldn't map backing store")]
    MapFailed(#[source] std::io::Error),
}
