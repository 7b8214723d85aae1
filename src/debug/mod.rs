use crate::dmi::Access;
use crate::range::Range;

pub use self::gdb::*;

pub mod gdb;
pub mod rsp;

/// Capability surface a CPU model exports to a debug server.
///
/// Register images cross this interface in little-endian byte order, the
/// order they travel on the remote-protocol wire. Memory accesses take
/// virtual addresses; servers resolve them page by page through
/// [`DebugStub::virt_to_phys`] when the model reports a page size.
pub trait DebugStub: Send {
    fn num_registers(&self) -> u64;

    /// Width of register `idx` in bytes, zero when the register is not
    /// exposed.
    fn register_width(&self, idx: u64) -> u64;

    fn read_reg(&mut self, idx: u64, buf: &mut [u8]) -> bool;

    fn write_reg(&mut self, idx: u64, buf: &[u8]) -> bool;

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> bool;

    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> bool;

    /// MMU page size, [`None`] when the model does not translate.
    fn page_size(&self) -> Option<u64> {
        None
    }

    /// Physical address of `vaddr`, [`None`] when the page is not mapped.
    fn virt_to_phys(&self, vaddr: u64) -> Option<u64> {
        Some(vaddr)
    }

    fn insert_breakpoint(&mut self, _addr: u64) -> bool {
        false
    }

    fn remove_breakpoint(&mut self, _addr: u64) -> bool {
        false
    }

    fn insert_watchpoint(&mut self, _mem: Range, _access: Access) -> bool {
        false
    }

    fn remove_watchpoint(&mut self, _mem: Range, _access: Access) -> bool {
        false
    }

    /// Handles a monitor command, returning its output.
    fn handle_rcmd(&mut self, _cmd: &str) -> String {
        String::new()
    }

    /// Advances the model by `cycles` cycles synchronously. Returns the
    /// trap signal when a breakpoint or watchpoint hit ended the run
    /// early.
    fn simulate(&mut self, cycles: u64) -> Option<i32>;
}
