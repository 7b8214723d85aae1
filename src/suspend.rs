use std::collections::BTreeMap;
use std::sync::{Condvar, LazyLock, Mutex};

/// A named handle that can ask the kernel thread to pause at its next safe
/// point.
///
/// Handles live in a process-wide registry. The kernel thread calls
/// [`handle_requests`] between simulated intervals; while any handle is in
/// the requesting state the call blocks, so all requesters compose into a
/// single all-or-nothing barrier. Debug threads may only touch simulation
/// state while the kernel is parked here.
pub struct Suspender {
    id: u64,
    name: String,
}

struct Registry {
    inner: Mutex<Inner>,
    cv: Condvar,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    requests: BTreeMap<u64, String>,
    suspended: bool,
    quit: bool,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| Registry {
    inner: Mutex::new(Inner::default()),
    cv: Condvar::new(),
});

impl Suspender {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut inner = REGISTRY.inner.lock().unwrap();
        let id = inner.next_id;

        inner.next_id += 1;

        Self { id, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests a pause. The kernel thread will block in
    /// [`handle_requests`] until every requester has called
    /// [`Suspender::resume`].
    pub fn suspend(&self) {
        let mut inner = REGISTRY.inner.lock().unwrap();

        inner.requests.insert(self.id, self.name.clone());
        REGISTRY.cv.notify_all();
    }

    /// Withdraws this handle's pause request.
    pub fn resume(&self) {
        let mut inner = REGISTRY.inner.lock().unwrap();

        inner.requests.remove(&self.id);
        REGISTRY.cv.notify_all();
    }

    pub fn is_requesting(&self) -> bool {
        REGISTRY.inner.lock().unwrap().requests.contains_key(&self.id)
    }

    /// Whether the kernel is currently parked on behalf of this handle.
    pub fn is_suspending(&self) -> bool {
        let inner = REGISTRY.inner.lock().unwrap();

        inner.suspended && inner.requests.contains_key(&self.id)
    }
}

impl Drop for Suspender {
    fn drop(&mut self) {
        self.resume();
    }
}

/// Called by the kernel thread at safe points. Blocks while any suspender
/// requests a pause; returns once all requests are withdrawn (or the
/// registry has been shut down with [`quit`]).
pub fn handle_requests() {
    let mut inner = REGISTRY.inner.lock().unwrap();

    while !inner.requests.is_empty() && !inner.quit {
        inner.suspended = true;
        REGISTRY.cv.notify_all();
        inner = REGISTRY.cv.wait(inner).unwrap();
    }

    inner.suspended = false;
    REGISTRY.cv.notify_all();
}

/// Whether the kernel thread is currently parked in [`handle_requests`].
pub fn simulation_suspended() -> bool {
    REGISTRY.inner.lock().unwrap().suspended
}

/// Drops every outstanding request and releases the kernel thread. Used by
/// the SIGINT escalation path, which must not leave the kernel parked when
/// the simulation is being torn down.
pub fn force_resume() {
    let mut inner = REGISTRY.inner.lock().unwrap();

    inner.requests.clear();
    REGISTRY.cv.notify_all();
}

/// Shuts the registry down: pending and future [`handle_requests`] calls
/// return immediately.
pub fn quit() {
    let mut inner = REGISTRY.inner.lock().unwrap();

    inner.quit = true;
    REGISTRY.cv.notify_all();
}

/// Restores the registry to its initial state. Intended for tests, which
/// otherwise observe suspenders leaked by earlier tests in the same
/// process.
pub fn reset() {
    let mut inner = REGISTRY.inner.lock().unwrap();

    inner.requests.clear();
    inner.suspended = false;
    inner.quit = false;
    REGISTRY.cv.notify_all();
}
