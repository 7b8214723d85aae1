use crate::dmi::{Access, DmiCache, SharedDmiCache};
use crate::host::Host;
use crate::payload::{BusError, Command, Payload, Response};
use crate::range::Range;
use crate::sbi::{Sbi, SBI_NONE};
use crate::target::SharedTarget;
use std::sync::{Arc, Mutex};

/// Initiator side of the transaction fabric.
///
/// Owns the DMI cache for its bound target and two reusable payloads (one
/// for normal traffic, one for debug traffic). All timing is accounted
/// against the local offset of the [`Host`] the socket belongs to.
pub struct InitiatorSocket {
    name: String,
    host: Arc<Host>,
    cache: SharedDmiCache,
    target: Option<SharedTarget>,
    tx: Payload,
    txd: Payload,
    default_sbi: Sbi,
}

impl InitiatorSocket {
    pub fn new(name: impl Into<String>, host: Arc<Host>) -> Self {
        Self {
            name: name.into(),
            host,
            cache: Arc::new(Mutex::new(DmiCache::new())),
            target: None,
            tx: Payload::new(),
            txd: Payload::new(),
            default_sbi: SBI_NONE,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Sideband ORed into every transaction sent through this socket.
    pub fn set_default_sbi(&mut self, sbi: Sbi) {
        self.default_sbi = sbi;
    }

    pub fn dmi_cache(&self) -> SharedDmiCache {
        self.cache.clone()
    }

    /// Binds the socket to a target and registers the DMI cache with it so
    /// the target can broadcast invalidations.
    pub fn bind(&mut self, target: SharedTarget) {
        target.lock().unwrap().bind_dmi_cache(self.cache.clone());
        self.target = Some(target);
    }

    /// Runs one transaction. For reads the result lands in `data`, for
    /// writes `data` supplies it. Returns the response status and the
    /// number of bytes moved (the full length on success, zero otherwise).
    ///
    /// # Panics
    /// If the socket is unbound, if a non-debug transaction is started
    /// outside the kernel thread, or if a target breaks the timing rules
    /// (debug transport advancing time, local time running backwards).
    pub fn access(&mut self, cmd: Command, addr: u64, data: &mut [u8], info: Sbi) -> (Response, usize) {
        let kernel = self.host.kernel().clone();

        if !info.is_debug() && !kernel.is_kernel_thread() {
            panic!("non-debug transaction outside the kernel thread");
        }

        let mut rs = Response::Incomplete;
        let mut bytes = data.len();

        // Fast path through the DMI cache first.
        if cmd != Command::Ignore && self.host.allow_dmi() {
            rs = self.access_dmi(cmd, addr, data, info);
        }

        // If DMI was not possible, send a regular transaction.
        if rs == Response::Incomplete {
            let target = self.target.clone().expect("socket is not bound");
            let tx = if info.is_debug() { &mut self.txd } else { &mut self.tx };

            match cmd {
                Command::Read => tx.setup_empty(cmd, addr, data.len()),
                _ => tx.setup(cmd, addr, data),
            }

            bytes = send(&self.host, &target, &self.cache, tx, self.default_sbi, info);
            rs = tx.response;

            if cmd == Command::Read {
                data.copy_from_slice(tx.data());
            }

            // The debug transport does not touch the response status.
            if rs == Response::Incomplete && info.is_debug() {
                rs = Response::Ok;
            }
        }

        if rs == Response::Incomplete {
            log::warn!(
                "{}: got incomplete response from target at {:#018x}",
                self.name,
                addr
            );
        }

        (rs, bytes)
    }

    fn access_dmi(&mut self, cmd: Command, addr: u64, data: &mut [u8], info: Sbi) -> Response {
        if info.is_nodmi() || info.is_excl() || data.is_empty() {
            return Response::Incomplete;
        }

        let acs = match cmd {
            Command::Read => Access::READ,
            Command::Write => Access::WRITE,
            Command::Ignore => return Response::Incomplete,
        };

        // Debug accesses may use any readable window.
        let elevate = if info.is_debug() { Access::READ } else { acs };
        let request = match addr.checked_add(data.len() as u64 - 1) {
            Some(end) => Range::new(addr, end),
            None => return Response::Incomplete,
        };
        let desc = {
            let cache = self.cache.lock().unwrap();

            match cache.lookup(request, elevate) {
                Some(d) => *d,
                None => return Response::Incomplete,
            }
        };

        if info.is_sync() && !info.is_debug() {
            self.host.sync();
        }

        let ptr = desc.ptr_at(addr);

        unsafe {
            match cmd {
                Command::Read => std::ptr::copy_nonoverlapping(ptr, data.as_mut_ptr(), data.len()),
                Command::Write => std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()),
                Command::Ignore => unreachable!(),
            }
        }

        if !info.is_debug() {
            self.host.advance_local(desc.latency(acs));

            if info.is_sync() {
                self.host.sync();
            }
        }

        Response::Ok
    }

    pub fn read(&mut self, addr: u64, data: &mut [u8], info: Sbi) -> (Response, usize) {
        self.access(Command::Read, addr, data, info)
    }

    pub fn write(&mut self, addr: u64, data: &mut [u8], info: Sbi) -> (Response, usize) {
        self.access(Command::Write, addr, data, info)
    }
}

macro_rules! typed_access {
    ($read:ident, $write:ident, $ty:ty) => {
        impl InitiatorSocket {
            pub fn $read(&mut self, addr: u64, info: Sbi) -> Result<$ty, BusError> {
                let mut buf = [0; size_of::<$ty>()];

                match self.access(Command::Read, addr, &mut buf, info) {
                    (rs, _) if rs.is_ok() => Ok(<$ty>::from_le_bytes(buf)),
                    (rs, _) => Err(rs.err().unwrap_or(BusError::Generic)),
                }
            }

            pub fn $write(&mut self, addr: u64, val: $ty, info: Sbi) -> Result<(), BusError> {
                let mut buf = val.to_le_bytes();

                match self.access(Command::Write, addr, &mut buf, info) {
                    (rs, _) if rs.is_ok() => Ok(()),
                    (rs, _) => Err(rs.err().unwrap_or(BusError::Generic)),
                }
            }
        }
    };
}

typed_access!(read_u8, write_u8, u8);
typed_access!(read_u16, write_u16, u16);
typed_access!(read_u32, write_u32, u32);
typed_access!(read_u64, write_u64, u64);

fn send(
    host: &Arc<Host>,
    target: &SharedTarget,
    cache: &SharedDmiCache,
    tx: &mut Payload,
    default_sbi: Sbi,
    info: Sbi,
) -> usize {
    if let Some(rs) = tx.validate() {
        tx.response = rs;
        return 0;
    }

    tx.response = Response::Incomplete;
    tx.dmi_allowed = false;
    tx.set_sbi(default_sbi | info);

    let kernel = host.kernel().clone();
    let mut bytes;

    if info.is_debug() {
        let t1 = kernel.time();

        bytes = target.lock().unwrap().transport_dbg(tx);

        let t2 = kernel.time();

        if kernel.is_kernel_thread() && t1 != t2 {
            panic!("time advanced during debug transport");
        }
    } else {
        if info.is_sync() || host.needs_sync() {
            host.sync();
        }

        // Synchronization must happen before the target lock is taken; a
        // suspended debug thread may need the same target.
        let before = kernel.time() + host.local_offset();
        let mut offset = host.local_offset();

        target.lock().unwrap().b_transport(tx, &mut offset);
        host.set_local_offset(offset);

        let now = kernel.time() + host.local_offset();

        if now < before {
            panic!("b_transport time went backwards");
        }

        if info.is_sync() || host.needs_sync() {
            host.sync();
        }

        bytes = if tx.response.is_ok() { tx.data().len() } else { 0 };
    }

    // A target that granted exclusivity echoes the flag back; losing it
    // means the exclusive access failed.
    if info.is_excl() && !tx.sbi().is_excl() {
        bytes = 0;
    }

    if host.allow_dmi() && tx.dmi_allowed {
        if let Some(desc) = target.lock().unwrap().get_direct_mem_ptr(tx) {
            cache.lock().unwrap().insert(desc);
        }
    }

    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmi::DmiDescriptor;
    use crate::sbi::{SBI_DEBUG, SBI_EXCL, SBI_NODMI};
    use crate::sim::Kernel;
    use crate::suspend;
    use crate::target::TlmTarget;
    use std::time::Duration;

    /// 256 bytes of backing store with a fixed transport latency that
    /// optionally hands out DMI for its whole range.
    struct TestMem {
        data: Box<[u8; 256]>,
        latency: Duration,
        grant_dmi: bool,
        confirm_excl: bool,
        transports: usize,
        debug_transports: usize,
    }

    impl TestMem {
        fn new() -> Self {
            Self {
                data: Box::new([0; 256]),
                latency: Duration::from_nanos(10),
                grant_dmi: false,
                confirm_excl: true,
                transports: 0,
                debug_transports: 0,
            }
        }

        fn copy(&mut self, tx: &mut Payload) -> usize {
            let addr = tx.address as usize;
            let len = tx.data().len();

            if addr + len > self.data.len() {
                tx.response = Response::AddressError;
                return 0;
            }

            match tx.command {
                Command::Read => tx.data_mut().copy_from_slice(&self.data[addr..addr + len]),
                Command::Write => self.data[addr..addr + len].copy_from_slice(tx.data()),
                Command::Ignore => return 0,
            }

            tx.response = Response::Ok;
            len
        }
    }

    impl TlmTarget for TestMem {
        fn b_transport(&mut self, tx: &mut Payload, offset: &mut Duration) {
            self.transports += 1;
            *offset += self.latency;

            if tx.sbi().is_excl() && !self.confirm_excl {
                tx.set_sbi(tx.sbi().without_excl());
            }

            self.copy(tx);
            tx.dmi_allowed = self.grant_dmi;
        }

        fn transport_dbg(&mut self, tx: &mut Payload) -> usize {
            self.debug_transports += 1;
            self.copy(tx)
        }

        fn get_direct_mem_ptr(&mut self, _tx: &Payload) -> Option<DmiDescriptor> {
            self.grant_dmi.then(|| DmiDescriptor {
                range: Range::new(0, 255),
                ptr: self.data.as_mut_ptr(),
                access: Access::RW,
                read_latency: Duration::from_nanos(1),
                write_latency: Duration::from_nanos(2),
            })
        }
    }

    fn setup() -> (Arc<Mutex<TestMem>>, InitiatorSocket) {
        let kernel = Kernel::new();
        let host = Host::new("cpu", kernel);
        let mem = Arc::new(Mutex::new(TestMem::new()));
        let mut socket = InitiatorSocket::new("out", host);

        socket.bind(mem.clone());
        (mem, socket)
    }

    #[test]
    fn write_then_read() {
        let _lock = crate::testutil::registry_lock();
        suspend::reset();

        let (mem, mut socket) = setup();
        let mut buf = [0x11, 0x22, 0x33, 0x44];

        let (rs, n) = socket.write(0x10, &mut buf, SBI_NONE);
        assert_eq!(rs, Response::Ok);
        assert_eq!(n, 4);

        let mut out = [0; 4];
        let (rs, n) = socket.read(0x10, &mut out, SBI_NONE);
        assert_eq!(rs, Response::Ok);
        assert_eq!(n, 4);
        assert_eq!(out, buf);

        // Both transactions went through the target and were timed.
        assert_eq!(mem.lock().unwrap().transports, 2);
        assert_eq!(socket.host().local_offset(), Duration::from_nanos(20));
    }

    #[test]
    fn empty_access_is_burst_error() {
        let _lock = crate::testutil::registry_lock();
        suspend::reset();

        let (_, mut socket) = setup();
        let (rs, n) = socket.read(0, &mut [], SBI_NONE);

        assert_eq!(rs, Response::BurstError);
        assert_eq!(n, 0);
    }

    #[test]
    fn debug_access_preserves_time() {
        let _lock = crate::testutil::registry_lock();
        suspend::reset();

        let (mem, mut socket) = setup();
        let mut buf = [0xaa; 2];

        let (rs, n) = socket.write(0x20, &mut buf, SBI_DEBUG);
        assert_eq!(rs, Response::Ok);
        assert_eq!(n, 2);
        assert_eq!(mem.lock().unwrap().debug_transports, 1);
        assert_eq!(socket.host().local_offset(), Duration::ZERO);
        assert_eq!(socket.host().kernel().time(), Duration::ZERO);
    }

    #[test]
    fn dmi_fast_path() {
        let _lock = crate::testutil::registry_lock();
        suspend::reset();

        let (mem, mut socket) = setup();

        mem.lock().unwrap().grant_dmi = true;

        // First access goes through the target and installs the mapping.
        socket.write_u32(0x40, 0xdeadbeef, SBI_NONE).unwrap();
        assert_eq!(mem.lock().unwrap().transports, 1);

        // Later accesses bypass it.
        assert_eq!(socket.read_u32(0x40, SBI_NONE).unwrap(), 0xdeadbeef);
        socket.write_u32(0x44, 0x1337, SBI_NONE).unwrap();
        assert_eq!(mem.lock().unwrap().transports, 1);

        // DMI latencies are still accounted: 10 (transport) + 1 (read)
        // + 2 (write).
        assert_eq!(socket.host().local_offset(), Duration::from_nanos(13));

        // Sideband can force the slow path.
        assert_eq!(socket.read_u32(0x40, SBI_NODMI).unwrap(), 0xdeadbeef);
        assert_eq!(mem.lock().unwrap().transports, 2);
    }

    #[test]
    fn dmi_invalidation_broadcast() {
        let _lock = crate::testutil::registry_lock();
        suspend::reset();

        let (mem, mut socket) = setup();

        mem.lock().unwrap().grant_dmi = true;
        socket.write_u32(0x40, 1, SBI_NONE).unwrap();
        assert!(!socket.dmi_cache().lock().unwrap().is_empty());

        socket
            .dmi_cache()
            .lock()
            .unwrap()
            .invalidate(Range::new(0, 255));
        socket.write_u32(0x40, 2, SBI_NONE).unwrap();
        assert_eq!(mem.lock().unwrap().transports, 2);
    }

    #[test]
    fn lost_exclusivity_moves_no_bytes() {
        let _lock = crate::testutil::registry_lock();
        suspend::reset();

        let (mem, mut socket) = setup();

        mem.lock().unwrap().confirm_excl = false;

        let mut buf = [1, 2, 3, 4];
        let (rs, n) = socket.write(0x10, &mut buf, SBI_EXCL);

        // The write itself succeeded but exclusivity was denied.
        assert_eq!(rs, Response::Ok);
        assert_eq!(n, 0);
    }

    #[test]
    fn address_error() {
        let _lock = crate::testutil::registry_lock();
        suspend::reset();

        let (_, mut socket) = setup();
        let err = socket.read_u32(0x1000, SBI_NONE).unwrap_err();

        assert_eq!(err, BusError::Address);
    }

    #[test]
    fn non_kernel_thread_access_panics() {
        let _lock = crate::testutil::registry_lock();
        suspend::reset();

        let (_, mut socket) = setup();

        socket.host().kernel().register_kernel_thread();

        let r = std::thread::spawn(move || socket.read_u32(0, SBI_NONE)).join();
        assert!(r.is_err());
    }
}
