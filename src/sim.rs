use crate::suspend;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

/// Version string of the kernel facade, reported by the session protocol
/// `v` command.
pub const VERSION: &str = "vpfab-sim-1.0";

/// Interface surface of the simulation scheduler.
///
/// The discrete-event kernel itself is an external collaborator; this type
/// carries the state the transaction fabric and the debug servers need from
/// it: global time, the global quantum, the delta count, the identity of
/// the kernel thread, and a cooperative run loop that polls the suspender
/// registry at every quantum boundary.
pub struct Kernel {
    state: Mutex<State>,
    running: AtomicBool,
    pause: AtomicBool,
}

struct State {
    time: Duration,
    delta: u64,
    quantum: Duration,
    events: BinaryHeap<Reverse<Duration>>,
    kernel_thread: Option<ThreadId>,
}

impl Kernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                time: Duration::ZERO,
                delta: 0,
                quantum: Duration::from_micros(1),
                events: BinaryHeap::new(),
                kernel_thread: None,
            }),
            running: AtomicBool::new(true),
            pause: AtomicBool::new(false),
        })
    }

    /// Declares the calling thread as the kernel thread. Non-debug fabric
    /// traffic is only legal from this thread.
    ///
    /// # Panics
    /// If a different thread already registered.
    pub fn register_kernel_thread(&self) {
        let mut state = self.state.lock().unwrap();
        let current = std::thread::current().id();

        match state.kernel_thread {
            Some(id) if id != current => panic!("kernel thread already registered"),
            _ => state.kernel_thread = Some(current),
        }
    }

    pub fn is_kernel_thread(&self) -> bool {
        let state = self.state.lock().unwrap();

        match state.kernel_thread {
            Some(id) => id == std::thread::current().id(),
            // Before registration every thread counts as the kernel thread
            // so single-threaded setups work without ceremony.
            None => true,
        }
    }

    pub fn time(&self) -> Duration {
        self.state.lock().unwrap().time
    }

    pub fn time_ns(&self) -> u64 {
        self.time().as_nanos() as u64
    }

    pub fn delta_count(&self) -> u64 {
        self.state.lock().unwrap().delta
    }

    pub fn quantum(&self) -> Duration {
        self.state.lock().unwrap().quantum
    }

    pub fn set_quantum(&self, quantum: Duration) {
        assert!(!quantum.is_zero(), "global quantum cannot be zero");

        self.state.lock().unwrap().quantum = quantum;
    }

    /// Schedules a wakeup at absolute time `at`, making it visible to
    /// [`Kernel::next_event_in`] and bounding the run slices.
    pub fn schedule(&self, at: Duration) {
        self.state.lock().unwrap().events.push(Reverse(at));
    }

    /// Time until the next scheduled event, [`None`] when the event list is
    /// empty.
    pub fn next_event_in(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        let Reverse(at) = *state.events.peek()?;

        Some(at.saturating_sub(state.time))
    }

    /// Folds a local time offset into global time and gives other
    /// requesters a chance to run. This is the quantum synchronization
    /// point of the fabric.
    ///
    /// # Panics
    /// If called from a thread other than the kernel thread.
    pub fn sync(&self, offset: &mut Duration) {
        assert!(self.is_kernel_thread(), "sync outside the kernel thread");

        {
            let mut state = self.state.lock().unwrap();

            state.time += *offset;
            state.delta += 1;
            *offset = Duration::ZERO;

            let now = state.time;
            while matches!(state.events.peek(), Some(&Reverse(at)) if at <= now) {
                state.events.pop();
            }
        }

        suspend::handle_requests();
    }

    /// Advances global time by `duration` in quantum-sized slices, polling
    /// the suspender registry before each slice. Returns early when the
    /// simulation is stopped or [`Kernel::pause`] is called.
    pub fn run(&self, duration: Duration) {
        assert!(self.is_kernel_thread(), "run outside the kernel thread");

        let deadline = self.time().checked_add(duration);

        while self.is_running() && !self.pause.swap(false, Ordering::Relaxed) {
            suspend::handle_requests();

            if !self.is_running() {
                break;
            }

            let mut state = self.state.lock().unwrap();
            let now = state.time;
            let mut slice = state.quantum;

            if let Some(deadline) = deadline {
                if now >= deadline {
                    break;
                }

                slice = slice.min(deadline - now);
            }

            if let Some(&Reverse(at)) = state.events.peek() {
                if at > now {
                    slice = slice.min(at - now);
                }
            }

            state.time = now + slice;
            state.delta += 1;

            let now = state.time;
            while matches!(state.events.peek(), Some(&Reverse(at)) if at <= now) {
                state.events.pop();
            }
        }
    }

    /// Asks the current (or next) run to return at its next slice boundary
    /// without stopping the simulation.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    /// Stops the simulation for good; [`Kernel::run`] returns and refuses
    /// further work.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        suspend::quit();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}
