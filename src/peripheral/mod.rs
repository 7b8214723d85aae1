use crate::payload::{Command, Payload, Response};
use crate::range::Range;
use crate::sbi::Sbi;
use crate::sim::Kernel;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use self::reg::*;

pub mod reg;

/// Byte order of a peripheral's register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

pub fn host_endian() -> Endian {
    if cfg!(target_endian = "little") {
        Endian::Little
    } else {
        Endian::Big
    }
}

/// Handler for accesses that hit the peripheral's window but no register.
/// Memories use these to back their flat storage.
pub type FallbackRead<H> = fn(&mut H, Range, &mut [u8], Sbi) -> Response;
pub type FallbackWrite<H> = fn(&mut H, Range, &[u8], Sbi) -> Response;

/// Register file and transport engine of a memory-mapped device.
///
/// The device state lives in the host type `H`; the peripheral owns the
/// registers and routes each transaction to the registers it overlaps,
/// handing `H` to their callbacks. This keeps ownership one-directional:
/// hosts own peripherals own registers, and callbacks reach back through a
/// plain function pointer.
pub struct Peripheral<H> {
    name: String,
    pub endian: Endian,
    pub read_latency: Duration,
    pub write_latency: Duration,
    kernel: Option<Arc<Kernel>>,
    regs: Vec<Register<H>>,
    index: BTreeMap<u64, Vec<usize>>,
    pub fallback_read: Option<FallbackRead<H>>,
    pub fallback_write: Option<FallbackWrite<H>>,
}

impl<H> Peripheral<H> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endian: host_endian(),
            read_latency: Duration::ZERO,
            write_latency: Duration::ZERO,
            kernel: None,
            regs: Vec::new(),
            index: BTreeMap::new(),
            fallback_read: None,
            fallback_write: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches the kernel handle used for register-requested quantum
    /// synchronization.
    pub fn set_kernel(&mut self, kernel: Arc<Kernel>) {
        self.kernel = Some(kernel);
    }

    /// Adds a register and returns its handle for later access through
    /// [`Peripheral::reg`]/[`Peripheral::reg_mut`].
    pub fn add(&mut self, reg: Register<H>) -> usize {
        let id = self.regs.len();

        self.index.entry(reg.range().start).or_default().push(id);
        self.regs.push(reg);
        id
    }

    pub fn reg(&self, id: usize) -> &Register<H> {
        &self.regs[id]
    }

    pub fn reg_mut(&mut self, id: usize) -> &mut Register<H> {
        &mut self.regs[id]
    }

    pub fn regs(&self) -> impl Iterator<Item = &Register<H>> {
        self.regs.iter()
    }

    /// Restores every register to its init value.
    pub fn reset(&mut self) {
        for reg in &mut self.regs {
            reg.reset();
        }
    }

    /// Registers overlapping `window`, in ascending start order.
    fn lookup(&self, window: Range) -> Vec<usize> {
        let mut ids = Vec::new();

        for list in self.index.range(..=window.end).map(|(_, l)| l) {
            for &id in list {
                if self.regs[id].range().end >= window.start {
                    ids.push(id);
                }
            }
        }

        ids
    }

    /// Runs one transaction against the register file.
    ///
    /// Routes every streaming beat to each overlapping register, narrowed
    /// to the intersection. Disabled bytes are skipped and not counted.
    /// The access latency is charged to `t` once per transaction, never for
    /// debug accesses, and also when the transaction fails a permission
    /// check. Returns the number of bytes moved.
    pub fn transport(&mut self, host: &mut H, tx: &mut Payload, t: &mut Duration) -> usize {
        if let Some(rs) = tx.validate() {
            tx.response = rs;
            return 0;
        }

        let info = tx.sbi();
        let cmd = tx.command;

        if !info.is_debug() {
            *t += match cmd {
                Command::Read => self.read_latency,
                Command::Write => self.write_latency,
                Command::Ignore => Duration::ZERO,
            };
        }

        if cmd == Command::Ignore {
            tx.response = Response::Ok;
            return 0;
        }

        let len = tx.data().len();
        let width = tx.streaming_width();
        let window = match tx.address.checked_add(width as u64 - 1) {
            Some(end) => Range::new(tx.address, end),
            None => {
                tx.response = Response::AddressError;
                return 0;
            }
        };
        let foreign = self.endian != host_endian();
        let bank = info.get_cpuid();
        let kernel = self.kernel.clone();
        let mask = tx.byte_enable().map(<[u8]>::to_vec);

        let mut work = tx.data().to_vec();

        if foreign && cmd == Command::Write {
            for chunk in work.chunks_mut(width) {
                chunk.reverse();
            }
        }

        let ids = self.lookup(window);
        let mut moved = 0;
        let mut error = None;
        let mut runs = Vec::new();

        'beats: for beat in 0..len / width {
            let base = beat * width;

            if ids.is_empty() {
                enabled_runs(window, window.start, base, mask.as_deref(), &mut runs);

                for &(sub, at) in &runs {
                    let n = sub.length() as usize;
                    let rs = match cmd {
                        Command::Read => match self.fallback_read {
                            Some(f) => f(host, sub, &mut work[at..at + n], info),
                            None => Response::AddressError,
                        },
                        _ => match self.fallback_write {
                            Some(f) => f(host, sub, &work[at..at + n], info),
                            None => Response::AddressError,
                        },
                    };

                    if !rs.is_ok() {
                        error = Some(rs);
                        break 'beats;
                    }

                    moved += n;
                }

                continue;
            }

            for &id in &ids {
                let reg = &self.regs[id];
                let isect = reg.range().intersect(&window).unwrap();
                let denied = match cmd {
                    Command::Read => !reg.is_readable(),
                    _ => !reg.is_writeable(),
                };

                if denied {
                    log::debug!(
                        "{}: {:?} access to {} denied on register {}",
                        self.name,
                        cmd,
                        isect,
                        reg.name()
                    );
                    error = Some(Response::CommandError);
                    break 'beats;
                }

                let wants_sync = match cmd {
                    Command::Read => reg.rsync,
                    _ => reg.wsync,
                };

                if wants_sync && !info.is_debug() {
                    if let Some(kernel) = &kernel {
                        kernel.sync(t);
                    }
                }

                enabled_runs(isect, window.start, base, mask.as_deref(), &mut runs);

                let reg = &mut self.regs[id];

                for &(sub, at) in &runs {
                    let n = sub.length() as usize;

                    match cmd {
                        Command::Read => reg.do_read(host, sub, &mut work[at..at + n], bank),
                        _ => reg.do_write(host, sub, &work[at..at + n], bank),
                    }

                    moved += n;
                }
            }
        }

        if let Some(rs) = error {
            tx.response = rs;
            return 0;
        }

        if cmd == Command::Read {
            if foreign {
                for chunk in work.chunks_mut(width) {
                    chunk.reverse();
                }
            }

            tx.data_mut().copy_from_slice(&work);
        }

        tx.response = Response::Ok;
        moved
    }
}

/// Splits `isect` into maximal runs of enabled bytes. `runs` receives
/// `(address range, offset into the data buffer)` pairs. The byte-enable
/// mask repeats when shorter than the transaction.
fn enabled_runs(
    isect: Range,
    window_start: u64,
    data_base: usize,
    mask: Option<&[u8]>,
    runs: &mut Vec<(Range, usize)>,
) {
    runs.clear();

    let mask = match mask {
        Some(m) => m,
        None => {
            runs.push((isect, data_base + (isect.start - window_start) as usize));
            return;
        }
    };

    let mut run_start = None;

    for addr in isect.start..=isect.end {
        let idx = data_base + (addr - window_start) as usize;
        let enabled = mask[idx % mask.len()] != 0;

        match (enabled, run_start) {
            (true, None) => run_start = Some(addr),
            (false, Some(start)) => {
                runs.push((
                    Range::new(start, addr - 1),
                    data_base + (start - window_start) as usize,
                ));
                run_start = None;
            }
            _ => {}
        }
    }

    if let Some(start) = run_start {
        runs.push((
            Range::new(start, isect.end),
            data_base + (start - window_start) as usize,
        ));
    }
}
