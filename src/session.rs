use crate::debug::rsp::{BindError, RspConnection, RspProtocol, RspServer};
use crate::module;
use crate::sim::{self, Kernel};
use crate::suspend::{self, Suspender};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Once};
use std::time::Duration;
use thiserror::Error;

/// Library version reported by the session protocol `v` command.
pub const VERSION: &str = concat!("vpfab-", env!("CARGO_PKG_VERSION"));

/// A session-protocol server.
///
/// Exposes the running platform to interactive clients: stepping and
/// resuming the simulation, walking the object hierarchy, reading and
/// writing attributes and invoking module commands. The kernel thread
/// enters through [`SessionServer::start`], which owns the run/suspend
/// loop; the service thread handles the wire.
pub struct SessionServer {
    core: Arc<SessionCore>,
    server: Mutex<RspServer>,
    port: u16,
}

struct SessionCore {
    kernel: Arc<Kernel>,
    suspender: Suspender,
    duration: Mutex<Option<Duration>>,
    stop_flag: Arc<AtomicBool>,
}

impl SessionServer {
    /// Binds the server, writes the discovery file and starts the service
    /// thread.
    pub fn new(port: u16, kernel: Arc<Kernel>) -> Result<Self, NewError> {
        let mut server = RspServer::bind("session", port).map_err(NewError::Bind)?;
        let port = server.port();
        let core = Arc::new(SessionCore {
            kernel,
            suspender: Suspender::new("session"),
            duration: Mutex::new(None),
            stop_flag: server.stop_flag(),
        });

        announce(port).map_err(NewError::Announce)?;
        server.run_async(SessionProtocol { core: core.clone() });
        log::info!("session server waiting on port {port}");

        Ok(Self {
            core,
            server: Mutex::new(server),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path of the discovery file for this server's port.
    pub fn announce_path(&self) -> PathBuf {
        announce_path(self.port)
    }

    /// Kernel-thread entry point: runs the simulation in client-requested
    /// intervals, parking in the suspender registry in between. Returns
    /// when the simulation is stopped.
    pub fn start(&self) {
        self.core.kernel.register_kernel_thread();

        // Start paused; the first client command releases us.
        self.core.suspender.suspend();

        while self.core.kernel.is_running() {
            suspend::handle_requests();

            if !self.core.kernel.is_running() {
                break;
            }

            let duration = self.core.duration.lock().unwrap().take();

            self.core.kernel.run(duration.unwrap_or(Duration::MAX));

            if self.core.kernel.is_running() {
                self.core.suspender.suspend();
            }
        }
    }

    /// Stops the service thread and removes the discovery file.
    pub fn shutdown(&self) {
        self.server.lock().unwrap().shutdown();
        unannounce(self.port);
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SessionProtocol {
    core: Arc<SessionCore>,
}

impl RspProtocol for SessionProtocol {
    fn handle_command(&mut self, conn: &mut RspConnection, cmd: &[u8]) -> String {
        let cmd = String::from_utf8_lossy(cmd).into_owned();
        let args: Vec<&str> = cmd.split(',').collect();

        match args[0] {
            "n" => String::new(),
            "s" => self.handle_step(conn, &args),
            "c" => self.handle_cont(conn),
            "l" => self.handle_list(&args),
            "e" => self.handle_exec(&args),
            "t" => self.time_reply(),
            "q" => format!("OK,{}", self.core.kernel.quantum().as_nanos()),
            "Q" => self.handle_set_quantum(&args),
            "a" => self.handle_get_attr(&args),
            "A" => self.handle_set_attr(&args),
            "x" => {
                self.force_quit();
                "OK".to_owned()
            }
            "v" => format!("OK,{},{}", sim::VERSION, VERSION),
            other => {
                log::debug!("session: unknown command '{other}'");
                String::new()
            }
        }
    }

    fn handle_connect(&mut self, conn: &mut RspConnection) {
        log::info!("session connected to {}", conn.peer());
    }

    fn handle_disconnect(&mut self) {
        if self.core.kernel.is_running() {
            log::info!("session client disconnected");
        }
    }
}

impl SessionProtocol {
    fn time_reply(&self) -> String {
        format!(
            "OK,{},{}",
            self.core.kernel.time_ns(),
            self.core.kernel.delta_count()
        )
    }

    /// Runs the simulation for one step: the given number of seconds, else
    /// until the next scheduler event, else one global quantum.
    fn handle_step(&mut self, conn: &mut RspConnection, args: &[&str]) -> String {
        let duration = match args.get(1) {
            // Seconds on the wire; nanoseconds stay the canonical unit
            // everywhere else. f64 precision is accepted here.
            Some(arg) => match arg.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => Duration::from_secs_f64(secs),
                _ => return format!("E,invalid time '{}'", escape(arg)),
            },
            None => match self.core.kernel.next_event_in() {
                Some(d) => d,
                None => self.core.kernel.quantum(),
            },
        };

        self.resume_simulation(conn, duration);

        if conn.is_closed() {
            String::new()
        } else {
            "OK".to_owned()
        }
    }

    fn handle_cont(&mut self, conn: &mut RspConnection) -> String {
        self.resume_simulation(conn, Duration::MAX);

        if conn.is_closed() {
            String::new()
        } else {
            "OK".to_owned()
        }
    }

    /// Releases the kernel thread for `duration`, serving out-of-band
    /// signal bytes until the simulation suspends again.
    fn resume_simulation(&mut self, conn: &mut RspConnection, duration: Duration) {
        *self.core.duration.lock().unwrap() = Some(duration);
        self.core.suspender.resume();

        while !self.core.suspender.is_suspending() {
            if !self.core.kernel.is_running() {
                return;
            }

            match conn.recv_signal(Duration::from_millis(100)) {
                // Time update requested mid-run.
                Ok(Some(b'u')) => {
                    let reply = self.time_reply();

                    if conn.send_packet(&reply).is_err() {
                        self.pause_and_drop(conn);
                        return;
                    }
                }
                Ok(Some(b'a')) => self.core.kernel.pause(),
                Ok(Some(b'x')) => {
                    self.force_quit();
                    conn.close();
                    return;
                }
                Ok(Some(sig)) => log::debug!("session: received unknown signal {sig:#04x}"),
                Ok(None) => {}
                Err(_) => {
                    self.pause_and_drop(conn);
                    return;
                }
            }
        }
    }

    fn pause_and_drop(&self, conn: &mut RspConnection) {
        self.core.kernel.pause();
        conn.close();
    }

    fn handle_list(&self, args: &[&str]) -> String {
        let format = args.get(1).map(|f| f.to_lowercase());

        match format.as_deref() {
            None | Some("xml") => format!("OK,{}", module::list_xml()),
            Some(other) => format!("E,unknown hierarchy format '{}'", escape(other)),
        }
    }

    fn handle_exec(&self, args: &[&str]) -> String {
        if args.len() < 3 {
            return format!("E,insufficient arguments {}", args.len());
        }

        let name = args[1];
        let module = match module::find(name) {
            Some(m) => m,
            None => return format!("E,object '{}' not found", escape(name)),
        };

        let r = module.lock().unwrap().execute(args[2], &args[3..]);

        match r {
            Ok(out) => format!("OK,{}", escape(&out)),
            Err(e) => format!("E,{}", escape(&e)),
        }
    }

    fn handle_set_quantum(&self, args: &[&str]) -> String {
        let ns = match args.get(1).and_then(|a| a.parse::<u64>().ok()) {
            Some(v) if v > 0 => v,
            _ => return format!("E,insufficient arguments {}", args.len()),
        };

        self.core.kernel.set_quantum(Duration::from_nanos(ns));
        "OK".to_owned()
    }

    fn handle_get_attr(&self, args: &[&str]) -> String {
        let name = match args.get(1) {
            Some(v) => v,
            None => return format!("E,insufficient arguments {}", args.len()),
        };

        match module::find_attribute(name) {
            Some((module, attr)) => match module.lock().unwrap().read_attr(&attr) {
                Some(value) => format!("OK,{value}"),
                None => format!("E,attribute '{}' not found", escape(name)),
            },
            None => format!("E,attribute '{}' not found", escape(name)),
        }
    }

    fn handle_set_attr(&self, args: &[&str]) -> String {
        if args.len() < 3 {
            return format!("E,insufficient arguments {}", args.len());
        }

        let name = args[1];
        let value = args[2..].join(",");

        match module::find_attribute(name) {
            Some((module, attr)) => match module.lock().unwrap().write_attr(&attr, &value) {
                Ok(()) => "OK".to_owned(),
                Err(e) => format!("E,{}", escape(&e)),
            },
            None => format!("E,attribute '{}' not found", escape(name)),
        }
    }

    /// Stops the simulation and this server for good.
    fn force_quit(&self) {
        self.core.kernel.stop();
        self.core.stop_flag.store(true, Ordering::Relaxed);
    }
}

/// Escapes protocol delimiters in free-text reply fields.
fn escape(s: &str) -> String {
    s.replace(',', "\\,")
}

fn announce_path(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("vcml_session_{port}"))
}

static ANNOUNCED: LazyLock<Mutex<Vec<PathBuf>>> = LazyLock::new(Mutex::default);
static CLEANUP: Once = Once::new();

extern "C" fn cleanup_announced() {
    if let Ok(mut paths) = ANNOUNCED.lock() {
        for path in paths.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Writes the discovery file other tools use to find running sessions and
/// registers the exit hook that removes it.
fn announce(port: u16) -> std::io::Result<()> {
    let path = announce_path(port);
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_owned());
    let prog = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_owned());

    let mut file = std::fs::File::create(&path)?;

    writeln!(file, "localhost:{port}:{user}:{prog}")?;

    CLEANUP.call_once(|| unsafe {
        libc::atexit(cleanup_announced);
    });

    ANNOUNCED.lock().unwrap().push(path);
    Ok(())
}

fn unannounce(port: u16) {
    let path = announce_path(port);

    ANNOUNCED.lock().unwrap().retain(|p| *p != path);

    if path.exists() {
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("failed to remove '{}': {e}", path.display());
        }
    }
}

/// Represents an error when [`SessionServer::new()`] fails.
#[derive(Debug, Error)]
pub enum NewError {
    #[error("couldn't start the session server")]
    Bind(#[source] BindError),

    #[error("couldn't write the session discovery file")]
    Announce(#[source] std::io::Error),
}

// The session protocol is exercised end to end over a loopback socket in
// tests/servers.rs; the pieces without wire dependencies are covered here.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_commas() {
        assert_eq!(escape("a,b"), "a\\,b");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn announce_file_lifecycle() {
        let _lock = crate::testutil::registry_lock();

        announce(49999).unwrap();

        let path = announce_path(49999);
        let content = std::fs::read_to_string(&path).unwrap();

        assert!(content.starts_with("localhost:49999:"));
        assert!(content.ends_with('\n'));
        assert_eq!(content.trim_end().split(':').count(), 4);

        unannounce(49999);
        assert!(!path.exists());
    }
}
