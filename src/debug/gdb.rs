use super::rsp::{BindError, RspConnection, RspProtocol, RspServer, PACKET_SIZE};
use super::DebugStub;
use crate::dmi::Access;
use crate::module;
use crate::range::Range;
use crate::sim::Kernel;
use crate::suspend::{self, Suspender};
use std::fmt::Write;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// The trap signal reported for breakpoints and single steps.
pub const GDB_SIGTRAP: i32 = 5;

/// Largest memory transfer accepted in one packet.
const BUFFER_SIZE: usize = PACKET_SIZE / 2;

const ERR_COMMAND: &str = "E01";
const ERR_PARAM: &str = "E02";
const ERR_INTERNAL: &str = "E03";
const ERR_UNKNOWN: &str = "E04";

/// Run state of the debug session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GdbStatus {
    Stopped,
    Stepping,
    Running,
    Killed,
}

/// A GDB remote-serial-protocol server driving one [`DebugStub`].
///
/// The server thread owns the protocol; the kernel thread drives the CPU
/// through [`GdbServer::simulate`], which parks in the suspender registry
/// while the session is stopped. Connecting stops the target, disconnecting
/// restores the state the server was constructed with.
pub struct GdbServer {
    core: Arc<GdbCore>,
    server: RspServer,
}

struct GdbCore {
    name: String,
    kernel: Arc<Kernel>,
    stub: Mutex<Box<dyn DebugStub>>,
    status: Mutex<GdbStatus>,
    cv: Condvar,
    default_status: GdbStatus,
    sync: bool,
    signal: AtomicI32,
    suspender: Suspender,
}

impl GdbServer {
    /// Binds the server and starts its service thread. `status` is the
    /// initial run state and the state restored when a client disconnects;
    /// `sync` makes the simulation suspend while the session is stopped.
    pub fn new(
        name: impl Into<String>,
        port: u16,
        kernel: Arc<Kernel>,
        stub: Box<dyn DebugStub>,
        status: GdbStatus,
        sync: bool,
    ) -> Result<Self, BindError> {
        let name = name.into();
        let core = Arc::new(GdbCore {
            suspender: Suspender::new(name.clone()),
            kernel,
            stub: Mutex::new(stub),
            status: Mutex::new(status),
            cv: Condvar::new(),
            default_status: status,
            sync,
            signal: AtomicI32::new(GDB_SIGTRAP),
            name,
        });

        core.update_status(status);
        module::register_target(core.name.clone());

        let mut server = RspServer::bind(core.name.clone(), port)?;

        server.run_async(GdbProtocol { core: core.clone() });
        log::info!("{}: waiting for gdb on port {}", core.name, server.port());

        Ok(Self { core, server })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn status(&self) -> GdbStatus {
        *self.core.status.lock().unwrap()
    }

    /// Drives the CPU model from the kernel thread. Steps or runs according
    /// to the session state and parks in the suspender registry while the
    /// session is stopped.
    pub fn simulate(&self, mut cycles: u64) {
        while cycles > 0 {
            suspend::handle_requests();

            match *self.core.status.lock().unwrap() {
                GdbStatus::Stopped | GdbStatus::Killed => return,
                GdbStatus::Stepping => {
                    let trap = self.core.stub.lock().unwrap().simulate(1);

                    self.notify(trap.unwrap_or(GDB_SIGTRAP));
                    cycles -= 1;
                }
                GdbStatus::Running => {
                    if let Some(sig) = self.core.stub.lock().unwrap().simulate(cycles) {
                        self.notify(sig);
                    }

                    cycles = 0;
                }
            }
        }
    }

    /// Reports a trap to the session: the run state becomes stopped and a
    /// blocked step/continue handler replies `S<sig>` to the client.
    pub fn notify(&self, signal: i32) {
        self.core.notify(signal);
    }

    /// Stops the service thread. Also runs on drop.
    pub fn shutdown(&mut self) {
        self.server.shutdown();
        self.core.suspender.resume();
    }
}

impl GdbCore {
    fn update_status(&self, status: GdbStatus) {
        *self.status.lock().unwrap() = status;

        if self.sync && status == GdbStatus::Stopped {
            self.suspender.suspend();
        } else {
            self.suspender.resume();
        }

        self.cv.notify_all();
    }

    fn notify(&self, signal: i32) {
        self.signal.store(signal, Ordering::Relaxed);
        self.update_status(GdbStatus::Stopped);
    }

    /// Waits until the session leaves the given transient state. Returns
    /// false on timeout.
    fn wait_while(&self, status: GdbStatus, timeout: Duration) -> bool {
        let guard = self.status.lock().unwrap();
        let (guard, r) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| *s == status)
            .unwrap();

        drop(guard);
        !r.timed_out()
    }
}

struct GdbProtocol {
    core: Arc<GdbCore>,
}

impl RspProtocol for GdbProtocol {
    fn handle_command(&mut self, conn: &mut RspConnection, cmd: &[u8]) -> String {
        match cmd.first() {
            Some(b'q') => self.handle_query(cmd),
            // The stop-reason query always reports a trap; only the
            // step/continue replies carry the real stored signal.
            Some(b'?') => format!("S{GDB_SIGTRAP:02x}"),
            Some(b's') => self.handle_resume(conn, GdbStatus::Stepping),
            Some(b'c') => self.handle_resume(conn, GdbStatus::Running),
            Some(b'D') => {
                conn.close();
                String::new()
            }
            Some(b'k') => self.handle_kill(conn),
            Some(b'p') => self.handle_reg_read(cmd),
            Some(b'P') => self.handle_reg_write(cmd),
            Some(b'g') => self.handle_reg_read_all(),
            Some(b'G') => self.handle_reg_write_all(cmd),
            Some(b'm') => self.handle_mem_read(cmd),
            Some(b'M') => self.handle_mem_write(cmd),
            Some(b'X') => self.handle_mem_write_bin(cmd),
            Some(b'Z') => self.handle_breakpoint(cmd, true),
            Some(b'z') => self.handle_breakpoint(cmd, false),
            Some(b'H') => "OK".to_owned(),
            Some(b'v') => String::new(),
            // The empty reply tells the client the command is unsupported.
            _ => String::new(),
        }
    }

    fn handle_connect(&mut self, conn: &mut RspConnection) {
        log::debug!("{}: gdb connected to {}", self.core.name, conn.peer());
        self.core.update_status(GdbStatus::Stopped);
    }

    fn handle_disconnect(&mut self) {
        log::debug!("{}: gdb disconnected", self.core.name);
        self.core.update_status(self.core.default_status);
    }
}

impl GdbProtocol {
    /// Common path of `s` and `c`: release the target and block until a
    /// trap stops it again, polling the wire for an interrupt.
    fn handle_resume(&mut self, conn: &mut RspConnection, status: GdbStatus) -> String {
        self.core.update_status(status);

        loop {
            if self.core.wait_while(status, Duration::from_millis(50)) {
                break;
            }

            match conn.recv_signal(Duration::from_millis(10)) {
                Ok(Some(sig)) => {
                    log::debug!("{}: received signal {sig:#04x}", self.core.name);
                    self.core.notify(GDB_SIGTRAP);
                    self.wait_for_suspend();
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    log::debug!("{}: connection lost while running: {e}", self.core.name);
                    self.core.notify(GDB_SIGTRAP);
                    conn.close();
                    break;
                }
            }
        }

        format!("S{:02x}", self.core.signal.load(Ordering::Relaxed))
    }

    /// After an interrupt the client expects the target to be fully
    /// stopped; give the kernel thread a moment to park.
    fn wait_for_suspend(&self) {
        if !self.core.sync {
            return;
        }

        for _ in 0..100 {
            if suspend::simulation_suspended() || !self.core.kernel.is_running() {
                return;
            }

            std::thread::sleep(Duration::from_millis(10));
        }

        log::debug!("{}: simulation did not reach a suspend point", self.core.name);
    }

    fn handle_kill(&mut self, conn: &mut RspConnection) -> String {
        conn.close();
        self.core.update_status(GdbStatus::Killed);
        self.core.kernel.stop();
        String::new()
    }

    fn handle_query(&mut self, cmd: &[u8]) -> String {
        let cmd = String::from_utf8_lossy(cmd);

        if cmd.starts_with("qSupported") {
            format!("PacketSize={PACKET_SIZE:x}")
        } else if cmd.starts_with("qAttached") {
            "1".to_owned()
        } else if cmd.starts_with("qOffsets") {
            "Text=0;Data=0;Bss=0".to_owned()
        } else if let Some(rest) = cmd.strip_prefix("qRcmd,") {
            self.core.stub.lock().unwrap().handle_rcmd(rest)
        } else {
            String::new()
        }
    }

    fn handle_reg_read(&mut self, cmd: &[u8]) -> String {
        let idx = match parse_hex(&cmd[1..]) {
            Some(v) => v,
            None => return malformed(&self.core.name, cmd),
        };

        let mut stub = self.core.stub.lock().unwrap();
        let width = stub.register_width(idx) as usize;

        if width == 0 {
            // Contents unknown.
            return "xxxxxxxx".to_owned();
        }

        let mut buf = vec![0; width];

        if stub.read_reg(idx, &mut buf) {
            hex_encode(&buf)
        } else {
            "xx".repeat(width)
        }
    }

    fn handle_reg_write(&mut self, cmd: &[u8]) -> String {
        let cmd_str = String::from_utf8_lossy(cmd);
        let (idx, value) = match cmd_str[1..].split_once('=') {
            Some((idx, value)) => match parse_hex(idx.as_bytes()) {
                Some(idx) => (idx, value),
                None => return malformed(&self.core.name, cmd),
            },
            None => return malformed(&self.core.name, cmd),
        };

        let mut stub = self.core.stub.lock().unwrap();
        let width = stub.register_width(idx) as usize;

        if width == 0 {
            return "OK".to_owned();
        }

        let buf = match hex_decode(value.as_bytes()) {
            Some(v) if v.len() == width => v,
            _ => return malformed(&self.core.name, cmd),
        };

        if stub.write_reg(idx, &buf) {
            "OK".to_owned()
        } else {
            log::warn!("{}: gdb cannot write register {idx}", self.core.name);
            ERR_INTERNAL.to_owned()
        }
    }

    fn handle_reg_read_all(&mut self) -> String {
        let mut stub = self.core.stub.lock().unwrap();
        let mut out = String::new();

        for idx in 0..stub.num_registers() {
            let width = stub.register_width(idx) as usize;

            if width == 0 {
                continue;
            }

            let mut buf = vec![0; width];

            if stub.read_reg(idx, &mut buf) {
                out.push_str(&hex_encode(&buf));
            } else {
                out.push_str(&"xx".repeat(width));
            }
        }

        out
    }

    fn handle_reg_write_all(&mut self, cmd: &[u8]) -> String {
        let mut stub = self.core.stub.lock().unwrap();
        let expected: u64 = (0..stub.num_registers())
            .map(|idx| stub.register_width(idx) * 2)
            .sum();
        let data = &cmd[1..];

        if data.len() as u64 != expected {
            return malformed(&self.core.name, cmd);
        }

        let mut at = 0;

        for idx in 0..stub.num_registers() {
            let width = stub.register_width(idx) as usize;

            if width == 0 {
                continue;
            }

            let buf = match hex_decode(&data[at..at + width * 2]) {
                Some(v) => v,
                None => return malformed(&self.core.name, cmd),
            };

            if !stub.write_reg(idx, &buf) {
                log::warn!("{}: gdb cannot write register {idx}", self.core.name);
            }

            at += width * 2;
        }

        "OK".to_owned()
    }

    fn handle_mem_read(&mut self, cmd: &[u8]) -> String {
        let (addr, size) = match parse_addr_size(&cmd[1..], b',') {
            Some(v) => v,
            None => return malformed(&self.core.name, cmd),
        };

        if size as usize > BUFFER_SIZE {
            log::warn!("{}: too much data requested: {size} bytes", self.core.name);
            return ERR_PARAM.to_owned();
        }

        let mut buf = vec![0; size as usize];

        if !self.access_vmem(false, addr, &mut buf) {
            return ERR_UNKNOWN.to_owned();
        }

        hex_encode(&buf)
    }

    fn handle_mem_write(&mut self, cmd: &[u8]) -> String {
        let (head, data) = match split_at_byte(&cmd[1..], b':') {
            Some(v) => v,
            None => return malformed(&self.core.name, cmd),
        };
        let (addr, size) = match parse_addr_size(head, b',') {
            Some(v) => v,
            None => return malformed(&self.core.name, cmd),
        };

        if size as usize > BUFFER_SIZE {
            log::warn!("{}: too much data requested: {size} bytes", self.core.name);
            return ERR_PARAM.to_owned();
        }

        let mut buf = match hex_decode(data) {
            Some(v) if v.len() >= size as usize => v,
            _ => return malformed(&self.core.name, cmd),
        };

        buf.truncate(size as usize);

        if !self.access_vmem(true, addr, &mut buf) {
            return ERR_UNKNOWN.to_owned();
        }

        "OK".to_owned()
    }

    fn handle_mem_write_bin(&mut self, cmd: &[u8]) -> String {
        let (head, data) = match split_at_byte(&cmd[1..], b':') {
            Some(v) => v,
            None => return malformed(&self.core.name, cmd),
        };
        let (addr, size) = match parse_addr_size(head, b',') {
            Some(v) => v,
            None => return malformed(&self.core.name, cmd),
        };

        if size as usize > BUFFER_SIZE {
            log::warn!("{}: too much data requested: {size} bytes", self.core.name);
            return ERR_PARAM.to_owned();
        }

        // An empty load probes whether binary writes are supported.
        if size == 0 {
            return "OK".to_owned();
        }

        let mut buf = Vec::with_capacity(size as usize);
        let mut bytes = data.iter();

        while let Some(&b) = bytes.next() {
            // Escaped byte: the next one xor 0x20.
            if b == b'}' {
                match bytes.next() {
                    Some(&e) => buf.push(e ^ 0x20),
                    None => return malformed(&self.core.name, cmd),
                }
            } else {
                buf.push(b);
            }
        }

        if buf.len() < size as usize {
            return malformed(&self.core.name, cmd);
        }

        buf.truncate(size as usize);

        if !self.access_vmem(true, addr, &mut buf) {
            return ERR_UNKNOWN.to_owned();
        }

        "OK".to_owned()
    }

    fn handle_breakpoint(&mut self, cmd: &[u8], insert: bool) -> String {
        let fields: Vec<u64> = match String::from_utf8_lossy(&cmd[1..])
            .split(',')
            .map(|f| parse_hex(f.as_bytes()))
            .collect()
        {
            Some(v) => v,
            None => return malformed(&self.core.name, cmd),
        };

        let &[ty, addr, length] = fields.as_slice() else {
            return malformed(&self.core.name, cmd);
        };

        let mem = match addr.checked_add(length.max(1) - 1) {
            Some(end) => Range::new(addr, end),
            None => return malformed(&self.core.name, cmd),
        };
        let mut stub = self.core.stub.lock().unwrap();
        let ok = match (ty, insert) {
            (0 | 1, true) => stub.insert_breakpoint(addr),
            (0 | 1, false) => stub.remove_breakpoint(addr),
            (2, true) => stub.insert_watchpoint(mem, Access::WRITE),
            (2, false) => stub.remove_watchpoint(mem, Access::WRITE),
            (3, true) => stub.insert_watchpoint(mem, Access::READ),
            (3, false) => stub.remove_watchpoint(mem, Access::READ),
            (4, true) => stub.insert_watchpoint(mem, Access::RW),
            (4, false) => stub.remove_watchpoint(mem, Access::RW),
            _ => {
                log::warn!("{}: unknown breakpoint type {ty}", self.core.name);
                return ERR_COMMAND.to_owned();
            }
        };

        if ok {
            "OK".to_owned()
        } else {
            ERR_INTERNAL.to_owned()
        }
    }

    /// Resolves virtual addresses page by page. Unmapped pages read as
    /// `0xee` sentinels; writes to them are silently discarded.
    fn access_vmem(&mut self, iswr: bool, addr: u64, buf: &mut [u8]) -> bool {
        let mut stub = self.core.stub.lock().unwrap();
        let page = match stub.page_size() {
            Some(v) if v > 0 => v,
            _ => {
                return if iswr {
                    stub.write_mem(addr, buf)
                } else {
                    stub.read_mem(addr, buf)
                };
            }
        };

        let mut addr = addr;
        let mut pos = 0;

        while pos < buf.len() {
            let todo = ((buf.len() - pos) as u64).min(page - addr % page) as usize;
            let chunk = &mut buf[pos..pos + todo];

            match stub.virt_to_phys(addr) {
                Some(pa) => {
                    let ok = if iswr {
                        stub.write_mem(pa, chunk)
                    } else {
                        stub.read_mem(pa, chunk)
                    };

                    if !ok {
                        log::warn!(
                            "{}: gdb cannot access {todo} bytes at address {pa:#x}",
                            self.core.name
                        );
                    }
                }
                None if !iswr => chunk.fill(0xee),
                None => {}
            }

            addr = addr.wrapping_add(todo as u64);
            pos += todo;
        }

        true
    }
}

fn malformed(name: &str, cmd: &[u8]) -> String {
    log::warn!("{name}: malformed command '{}'", String::from_utf8_lossy(cmd));
    ERR_COMMAND.to_owned()
}

fn parse_hex(s: &[u8]) -> Option<u64> {
    let s = std::str::from_utf8(s).ok()?;

    u64::from_str_radix(s, 16).ok()
}

/// Splits `<hex>,<hex>`-shaped arguments.
fn parse_addr_size(s: &[u8], sep: u8) -> Option<(u64, u64)> {
    let (addr, size) = split_at_byte(s, sep)?;

    Some((parse_hex(addr)?, parse_hex(size)?))
}

fn split_at_byte(s: &[u8], b: u8) -> Option<(&[u8], &[u8])> {
    let pos = s.iter().position(|&c| c == b)?;

    Some((&s[..pos], &s[pos + 1..]))
}

fn hex_encode(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 2);

    for b in buf {
        let _ = write!(out, "{b:02x}");
    }

    out
}

fn hex_decode(s: &[u8]) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }

    s.chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;

            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}
