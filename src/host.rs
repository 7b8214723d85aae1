use crate::sim::Kernel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-component context shared by the sockets of one initiator.
///
/// Carries the component's running local time offset against global
/// simulation time, its DMI permit, and the handle to the kernel. A CPU
/// model with separate instruction and data sockets hands the same `Host`
/// to both so they account time against one offset.
pub struct Host {
    name: String,
    kernel: Arc<Kernel>,
    state: Mutex<State>,
}

struct State {
    offset: Duration,
    allow_dmi: bool,
}

impl Host {
    pub fn new(name: impl Into<String>, kernel: Arc<Kernel>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            kernel,
            state: Mutex::new(State {
                offset: Duration::ZERO,
                allow_dmi: true,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn allow_dmi(&self) -> bool {
        self.state.lock().unwrap().allow_dmi
    }

    pub fn set_allow_dmi(&self, allow: bool) {
        self.state.lock().unwrap().allow_dmi = allow;
    }

    /// Local time accumulated ahead of global simulation time.
    pub fn local_offset(&self) -> Duration {
        self.state.lock().unwrap().offset
    }

    pub fn set_local_offset(&self, offset: Duration) {
        self.state.lock().unwrap().offset = offset;
    }

    pub fn advance_local(&self, d: Duration) {
        self.state.lock().unwrap().offset += d;
    }

    /// Current time from this component's point of view: global time plus
    /// the local offset.
    pub fn local_time(&self) -> Duration {
        self.kernel.time() + self.local_offset()
    }

    /// Whether the local offset has reached the global quantum, forcing a
    /// synchronization before the next transaction.
    pub fn needs_sync(&self) -> bool {
        self.local_offset() >= self.kernel.quantum()
    }

    /// Folds the local offset into global time and yields to the
    /// scheduler. Kernel thread only.
    pub fn sync(&self) {
        let mut offset = self.local_offset();

        self.kernel.sync(&mut offset);
        self.set_local_offset(offset);
    }
}
