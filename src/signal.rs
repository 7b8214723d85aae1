use crate::sim::Kernel;
use crate::suspend;
use std::io::Error;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Console character generated for an intercepted SIGTSTP (the usual
/// terminal suspend character).
pub const CONSOLE_SUSPEND: u8 = 0x1a;

static PIPE_WR: AtomicI64 = AtomicI64::new(-1);
static LAST_SIGINT_MS: AtomicI64 = AtomicI64::new(i64::MIN);
static CONSOLE_SIGNAL: AtomicU8 = AtomicU8::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);
static KERNEL: OnceLock<Mutex<Arc<Kernel>>> = OnceLock::new();

/// Installs the SIGINT/SIGTSTP handlers.
///
/// The first SIGINT stops the simulation cooperatively, releasing a
/// suspended kernel thread so it can wind down; a second SIGINT within one
/// second exits the process. SIGTSTP is intercepted and offered back as a
/// console character via [`take_console_signal`].
///
/// # Panics
/// If handlers are already installed; two owners of process signal
/// disposition cannot coexist.
pub fn install(kernel: Arc<Kernel>) {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        panic!("signal handlers already installed");
    }

    match KERNEL.get() {
        Some(slot) => *slot.lock().unwrap() = kernel,
        None => {
            KERNEL.set(Mutex::new(kernel)).ok().unwrap();
        }
    }

    // The handler only writes to a pipe; a watcher thread does the real
    // work outside async-signal context.
    let mut fds = [0; 2];

    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        panic!("failed to create signal pipe: {}", Error::last_os_error());
    }

    let (rd, wr) = (fds[0], fds[1]);

    PIPE_WR.store(wr.into(), Ordering::SeqCst);

    std::thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || watch(rd))
        .expect("failed to spawn signal watcher");

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();

        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) < 0 {
            panic!("failed to install SIGINT handler: {}", Error::last_os_error());
        }

        if libc::sigaction(libc::SIGTSTP, &action, std::ptr::null_mut()) < 0 {
            panic!("failed to install SIGTSTP handler: {}", Error::last_os_error());
        }
    }
}

/// Restores the default disposition. Intended for tests.
pub fn uninstall() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();

        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut());
        libc::sigaction(libc::SIGTSTP, &action, std::ptr::null_mut());
    }

    INSTALLED.store(false, Ordering::SeqCst);
}

/// Takes the pending console character generated by SIGTSTP, if any.
pub fn take_console_signal() -> Option<u8> {
    match CONSOLE_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        c => Some(c),
    }
}

fn monotonic_ms() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };

    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

extern "C" fn handler(sig: libc::c_int) {
    if sig == libc::SIGTSTP {
        CONSOLE_SIGNAL.store(CONSOLE_SUSPEND, Ordering::SeqCst);
        return;
    }

    // SIGINT. Everything here must be async-signal-safe: timestamps via
    // clock_gettime, escalation via _exit, the rest through the pipe.
    let now = monotonic_ms();
    let last = LAST_SIGINT_MS.swap(now, Ordering::SeqCst);

    if now.saturating_sub(last) < 1000 {
        unsafe { libc::_exit(libc::EXIT_FAILURE) };
    }

    let wr = PIPE_WR.load(Ordering::SeqCst) as libc::c_int;

    if wr >= 0 {
        let byte = b'i';

        unsafe { libc::write(wr, std::ptr::addr_of!(byte).cast(), 1) };
    }
}

fn watch(rd: libc::c_int) {
    loop {
        let mut byte = 0u8;
        let n = unsafe { libc::read(rd, std::ptr::addr_of_mut!(byte).cast(), 1) };

        if n <= 0 {
            if Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }

            return;
        }

        log::info!("interrupt received, stopping simulation");

        if let Some(kernel) = KERNEL.get() {
            kernel.lock().unwrap().stop();
        }

        if suspend::simulation_suspended() {
            suspend::force_resume();
        }
    }
}
