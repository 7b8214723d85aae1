//! End-to-end tests of the debug control plane: both protocol servers are
//! driven over loopback TCP by a minimal client speaking the packet
//! framing.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use vpfab::debug::rsp::checksum;
use vpfab::module::{self, AttrInfo, CommandInfo, Module};
use vpfab::property::Property;
use vpfab::{suspend, Access, DebugStub, GdbServer, GdbStatus, Kernel, Range, SessionServer};

/// Serializes the tests in this file; they all touch the process-wide
/// suspender and module registries.
static LOCK: Mutex<()> = Mutex::new(());

fn registries() -> MutexGuard<'static, ()> {
    let guard = LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    suspend::reset();
    module::reset();
    guard
}

/// Test client speaking the `$<payload>#<hh>` framing.
struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();

        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        Self { stream }
    }

    fn send_frame(&mut self, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 4);

        frame.push(b'$');
        frame.extend_from_slice(payload);
        frame.push(b'#');
        frame.extend_from_slice(format!("{:02x}", checksum(payload)).as_bytes());
        self.stream.write_all(&frame).unwrap();
    }

    fn recv_ack(&mut self) {
        let mut ack = [0u8; 1];

        self.stream.read_exact(&mut ack).unwrap();
        assert_eq!(ack[0], b'+', "server rejected the packet");
    }

    /// Reads one packet and acknowledges it.
    fn recv_frame(&mut self) -> String {
        let mut byte = [0u8; 1];

        loop {
            self.stream.read_exact(&mut byte).unwrap();

            if byte[0] == b'$' {
                break;
            }
        }

        let mut payload = Vec::new();

        loop {
            self.stream.read_exact(&mut byte).unwrap();

            if byte[0] == b'#' {
                break;
            }

            payload.push(byte[0]);
        }

        let mut sum = [0u8; 2];

        self.stream.read_exact(&mut sum).unwrap();
        assert_eq!(
            u8::from_str_radix(std::str::from_utf8(&sum).unwrap(), 16).unwrap(),
            checksum(&payload)
        );

        self.stream.write_all(b"+").unwrap();
        String::from_utf8(payload).unwrap()
    }

    /// One request/reply round trip.
    fn request(&mut self, payload: &str) -> String {
        self.request_bytes(payload.as_bytes())
    }

    fn request_bytes(&mut self, payload: &[u8]) -> String {
        self.send_frame(payload);
        self.recv_ack();
        self.recv_frame()
    }

    /// Sends a raw out-of-band signal byte.
    fn send_signal(&mut self, byte: u8) {
        self.stream.write_all(&[byte]).unwrap();
    }
}

/// CPU model stub: two 64-bit registers, 256 bytes of flat memory and a
/// cycle counter that traps with `trap_signal` once a threshold is
/// crossed.
struct TestCpu {
    state: Arc<CpuState>,
}

struct CpuState {
    regs: Mutex<[u64; 2]>,
    mem: Mutex<[u8; 256]>,
    breakpoints: Mutex<Vec<u64>>,
    watchpoints: Mutex<Vec<(Range, Access)>>,
    cycles: AtomicU64,
    trap_at: u64,
    trap_signal: i32,
}

impl TestCpu {
    fn new(trap_at: u64, trap_signal: i32) -> (Self, Arc<CpuState>) {
        let state = Arc::new(CpuState {
            regs: Mutex::new([0xdeadbeef, 0x1122334455667788]),
            mem: Mutex::new([0; 256]),
            breakpoints: Mutex::new(Vec::new()),
            watchpoints: Mutex::new(Vec::new()),
            cycles: AtomicU64::new(0),
            trap_at,
            trap_signal,
        });

        (Self { state: state.clone() }, state)
    }
}

impl DebugStub for TestCpu {
    fn num_registers(&self) -> u64 {
        3
    }

    fn register_width(&self, idx: u64) -> u64 {
        // Register 2 exists but is not exposed.
        if idx < 2 {
            8
        } else {
            0
        }
    }

    fn read_reg(&mut self, idx: u64, buf: &mut [u8]) -> bool {
        match self.state.regs.lock().unwrap().get(idx as usize) {
            Some(v) => {
                buf.copy_from_slice(&v.to_le_bytes());
                true
            }
            None => false,
        }
    }

    fn write_reg(&mut self, idx: u64, buf: &[u8]) -> bool {
        match self.state.regs.lock().unwrap().get_mut(idx as usize) {
            Some(v) => {
                *v = u64::from_le_bytes(buf.try_into().unwrap());
                true
            }
            None => false,
        }
    }

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> bool {
        let mem = self.state.mem.lock().unwrap();
        let at = addr as usize;

        match mem.get(at..at + buf.len()) {
            Some(src) => {
                buf.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> bool {
        let mut mem = self.state.mem.lock().unwrap();
        let at = addr as usize;

        match mem.get_mut(at..at + buf.len()) {
            Some(dst) => {
                dst.copy_from_slice(buf);
                true
            }
            None => false,
        }
    }

    fn insert_breakpoint(&mut self, addr: u64) -> bool {
        self.state.breakpoints.lock().unwrap().push(addr);
        true
    }

    fn remove_breakpoint(&mut self, addr: u64) -> bool {
        let mut bps = self.state.breakpoints.lock().unwrap();
        let before = bps.len();

        bps.retain(|&a| a != addr);
        bps.len() != before
    }

    fn insert_watchpoint(&mut self, mem: Range, access: Access) -> bool {
        self.state.watchpoints.lock().unwrap().push((mem, access));
        true
    }

    fn remove_watchpoint(&mut self, mem: Range, access: Access) -> bool {
        let mut wps = self.state.watchpoints.lock().unwrap();
        let before = wps.len();

        wps.retain(|&(m, a)| m != mem || a != access);
        wps.len() != before
    }

    fn handle_rcmd(&mut self, cmd: &str) -> String {
        format!("rcmd:{cmd}")
    }

    fn simulate(&mut self, cycles: u64) -> Option<i32> {
        let total = self.state.cycles.fetch_add(cycles, Ordering::SeqCst) + cycles;

        (total >= self.state.trap_at).then_some(self.state.trap_signal)
    }
}

#[test]
fn gdb_server_end_to_end() {
    let _guard = registries();

    let kernel = Kernel::new();

    // Trap after five cycles with a non-SIGTRAP signal (4) so the replies
    // below can tell the stored signal apart from the hardcoded one.
    let (cpu, state) = TestCpu::new(5, 4);

    state.mem.lock().unwrap()[..4].copy_from_slice(&[0xca, 0xfe, 0xba, 0xbe]);

    let gdb = Arc::new(
        GdbServer::new("cpu0", 0, kernel.clone(), Box::new(cpu), GdbStatus::Stopped, true)
            .unwrap(),
    );

    assert!(module::targets().contains(&"cpu0".to_owned()));

    // Kernel thread driving the CPU.
    let sim = std::thread::spawn({
        let gdb = gdb.clone();
        let kernel = kernel.clone();

        move || {
            kernel.register_kernel_thread();

            while kernel.is_running() && gdb.status() != GdbStatus::Killed {
                gdb.simulate(100);
            }
        }
    });

    let mut c = Client::connect(gdb.port());

    // Queries.
    assert_eq!(c.request("qSupported"), "PacketSize=1000");
    assert_eq!(c.request("qAttached"), "1");
    assert_eq!(c.request("qOffsets"), "Text=0;Data=0;Bss=0");
    assert_eq!(c.request("qRcmd,reset"), "rcmd:reset");
    assert_eq!(c.request("qUnknownThing"), "");
    assert_eq!(c.request("?"), "S05");
    assert_eq!(c.request("Hg0"), "OK");
    assert_eq!(c.request("vCont?"), "");
    assert_eq!(c.request("!"), "");

    // Registers.
    assert_eq!(c.request("p0"), "efbeadde00000000");
    assert_eq!(c.request("p1"), "8877665544332211");
    assert_eq!(c.request("p2"), "xxxxxxxx");
    assert_eq!(c.request("P0=0807060504030201"), "OK");
    assert_eq!(c.request("p0"), "0807060504030201");
    assert_eq!(state.regs.lock().unwrap()[0], 0x0102030405060708);
    assert_eq!(c.request("g"), "08070605040302018877665544332211");
    assert_eq!(c.request("G01020304050607080000000000000000"), "OK");
    assert_eq!(state.regs.lock().unwrap()[1], 0);

    // Unexposed registers write as no-ops, malformed packets error out.
    assert_eq!(c.request("P7=00"), "OK");
    assert_eq!(c.request("Pzz"), "E01");
    assert_eq!(c.request("m0,zz"), "E01");

    // Memory.
    assert_eq!(c.request("m0,4"), "cafebabe");
    assert_eq!(c.request("M10,4:11223344"), "OK");
    assert_eq!(c.request("m10,4"), "11223344");

    // Binary write with an escaped byte (0x7d == '}').
    let mut bin = b"X20,2:".to_vec();

    bin.extend_from_slice(&[b'}', 0x7d ^ 0x20, 0x03]);
    assert_eq!(c.request_bytes(&bin), "OK");
    assert_eq!(c.request("m20,2"), "7d03");

    // Breakpoints and watchpoints.
    assert_eq!(c.request("Z0,40,4"), "OK");
    assert_eq!(state.breakpoints.lock().unwrap().as_slice(), &[0x40]);
    assert_eq!(c.request("z0,40,4"), "OK");
    assert!(state.breakpoints.lock().unwrap().is_empty());
    assert_eq!(c.request("Z2,80,8"), "OK");
    assert_eq!(
        state.watchpoints.lock().unwrap().as_slice(),
        &[(Range::new(0x80, 0x87), Access::WRITE)]
    );
    assert_eq!(c.request("Z9,0,0"), "E01");

    // Step, then continue into the trap. The trap-less step reports
    // SIGTRAP; the continue reports the CPU's own signal.
    assert_eq!(c.request("s"), "S05");
    assert_eq!(state.cycles.load(Ordering::SeqCst), 1);
    assert_eq!(c.request("c"), "S04");
    assert!(state.cycles.load(Ordering::SeqCst) >= 5);

    // The stop-reason query stays SIGTRAP no matter what stopped us.
    assert_eq!(c.request("?"), "S05");

    // Kill: acknowledged but unanswered, the server is gone.
    c.send_frame(b"k");
    c.recv_ack();

    sim.join().unwrap();
    assert!(!kernel.is_running());

    suspend::reset();
}

/// Stub with an MMU: 16-byte pages, the page at 0x20 unmapped.
struct PagedCpu {
    mem: [u8; 256],
}

impl DebugStub for PagedCpu {
    fn num_registers(&self) -> u64 {
        0
    }

    fn register_width(&self, _idx: u64) -> u64 {
        0
    }

    fn read_reg(&mut self, _idx: u64, _buf: &mut [u8]) -> bool {
        false
    }

    fn write_reg(&mut self, _idx: u64, _buf: &[u8]) -> bool {
        false
    }

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> bool {
        let at = addr as usize;

        buf.copy_from_slice(&self.mem[at..at + buf.len()]);
        true
    }

    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> bool {
        let at = addr as usize;

        self.mem[at..at + buf.len()].copy_from_slice(buf);
        true
    }

    fn page_size(&self) -> Option<u64> {
        Some(0x10)
    }

    fn virt_to_phys(&self, vaddr: u64) -> Option<u64> {
        // One hole in the address space.
        (!(0x20..0x30).contains(&vaddr)).then_some(vaddr)
    }

    fn simulate(&mut self, _cycles: u64) -> Option<i32> {
        None
    }
}

#[test]
fn gdb_paged_memory_access() {
    let _guard = registries();

    let kernel = Kernel::new();
    let cpu = PagedCpu { mem: [0x55; 256] };
    let gdb = GdbServer::new(
        "cpu1",
        0,
        kernel,
        Box::new(cpu),
        GdbStatus::Stopped,
        false,
    )
    .unwrap();

    let mut c = Client::connect(gdb.port());

    // A read crossing the unmapped page is filled with 0xee sentinels.
    assert_eq!(
        c.request("m18,10"),
        format!("{}{}", "55".repeat(8), "ee".repeat(8))
    );

    // Writes to the unmapped page are silently discarded, the rest lands.
    assert_eq!(c.request("M1e,4:aabbccdd"), "OK");
    assert_eq!(c.request("m1c,4"), "5555aabb");
    assert_eq!(c.request("m30,2"), "5555");

    suspend::reset();
}

/// Module registered for the session tests: one broker-initialized
/// property and an echo command.
struct TestModule {
    prop: Property<u64>,
}

impl Module for TestModule {
    fn name(&self) -> &str {
        "test"
    }

    fn kind(&self) -> &'static str {
        "vpfab::test"
    }

    fn attributes(&self) -> Vec<AttrInfo> {
        vec![AttrInfo {
            name: self.prop.basename().to_owned(),
            ty: self.prop.type_name(),
            count: self.prop.count(),
        }]
    }

    fn read_attr(&self, name: &str) -> Option<String> {
        (name == "prop_u64").then(|| self.prop.str().to_owned())
    }

    fn write_attr(&mut self, name: &str, value: &str) -> Result<(), String> {
        if name != "prop_u64" {
            return Err(format!("attribute '{name}' not found"));
        }

        self.prop.set_str(value)
    }

    fn commands(&self) -> Vec<CommandInfo> {
        vec![CommandInfo {
            name: "echo",
            argc: 1,
            desc: "echo the arguments",
        }]
    }

    fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<String, String> {
        match cmd {
            "echo" => Ok(args.join(" ")),
            _ => Err(format!("command '{cmd}' not supported")),
        }
    }
}

#[test]
fn session_server_end_to_end() {
    let _guard = registries();

    // Environment broker initializes the property (hierarchy separator
    // becomes an underscore).
    std::env::set_var("test_prop_u64", "0x123456789ABCDEF0");

    module::register(Arc::new(Mutex::new(TestModule {
        prop: Property::new("test.prop_u64", 0),
    })));

    std::env::remove_var("test_prop_u64");

    let kernel = Kernel::new();

    kernel.set_quantum(Duration::from_micros(10));

    let session = Arc::new(SessionServer::new(0, kernel.clone()).unwrap());

    // Discovery file.
    let announce = session.announce_path();
    let content = std::fs::read_to_string(&announce).unwrap();

    assert!(content.starts_with(&format!("localhost:{}:", session.port())));
    assert_eq!(content.trim_end().split(':').count(), 4);

    let sim = std::thread::spawn({
        let session = session.clone();

        move || session.start()
    });

    let mut c = Client::connect(session.port());

    assert_eq!(c.request("n"), "");
    assert!(c.request("v").starts_with("OK,vpfab-sim-"));
    assert_eq!(c.request("t"), "OK,0,0");
    assert_eq!(c.request("q"), "OK,10000");
    assert_eq!(c.request("Q,5000"), "OK");
    assert_eq!(c.request("q"), "OK,5000");
    assert_eq!(kernel.quantum(), Duration::from_micros(5));

    // Step a fixed duration (seconds on the wire), then one quantum.
    assert_eq!(c.request("s,0.000001"), "OK");
    assert_eq!(kernel.time(), Duration::from_micros(1));
    assert_eq!(c.request("s"), "OK");
    assert_eq!(kernel.time(), Duration::from_micros(6));

    // Attributes, configured through the environment broker.
    assert_eq!(c.request("a,test.prop_u64"), "OK,0x123456789ABCDEF0");
    assert_eq!(c.request("A,test.prop_u64,42"), "OK");
    assert_eq!(c.request("a,test.prop_u64"), "OK,42");
    assert!(c.request("a,test.missing").starts_with("E,"));

    // Hierarchy listing.
    let list = c.request("l");

    assert!(list.starts_with("OK,<?xml version=\"1.0\" ?><hierarchy>"));
    assert!(list.contains("<object name=\"test\" kind=\"vpfab::test\">"));
    assert!(list.contains("<attribute name=\"prop_u64\" type=\"u64\" count=\"1\" />"));
    assert!(list.contains("<command name=\"echo\" argc=\"1\""));
    assert!(c.request("l,json").starts_with("E,unknown hierarchy format"));

    // Module commands.
    assert_eq!(c.request("e,test,echo,hello,world"), "OK,hello world");
    assert!(c.request("e,nosuch,echo").starts_with("E,"));
    assert!(c.request("e,test").starts_with("E,"));

    // Continue, poll the time mid-run, pause.
    c.send_frame(b"c");
    c.recv_ack();
    c.send_signal(b'u');

    let update = c.recv_frame();

    assert!(update.starts_with("OK,"));

    c.send_signal(b'a');
    assert_eq!(c.recv_frame(), "OK");

    // Time kept its pre-continue floor and the reply parses.
    let reply = c.request("t");
    let nanos: u64 = reply
        .strip_prefix("OK,")
        .unwrap()
        .split(',')
        .next()
        .unwrap()
        .parse()
        .unwrap();

    assert!(nanos >= 6000);

    // Quit for good.
    assert_eq!(c.request("x"), "OK");

    sim.join().unwrap();
    assert!(!kernel.is_running());

    session.shutdown();
    assert!(!announce.exists());

    suspend::reset();
}
