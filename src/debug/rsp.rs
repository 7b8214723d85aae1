use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Maximum packet payload advertised to remote-protocol clients.
pub const PACKET_SIZE: usize = 0x1000;

const POLL: Duration = Duration::from_millis(100);

/// Mod-256 sum of the payload bytes, the checksum of the packet frame.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Behavior of a protocol served over the packet framing.
///
/// Handlers receive the connection so long-running commands (step,
/// continue) can poll for out-of-band signal bytes and push packets while
/// they run.
pub trait RspProtocol: Send + 'static {
    /// Handles one packet payload, returning the reply payload.
    fn handle_command(&mut self, conn: &mut RspConnection, cmd: &[u8]) -> String;

    fn handle_connect(&mut self, _conn: &mut RspConnection) {}

    fn handle_disconnect(&mut self) {}
}

/// One accepted client connection.
///
/// Packets are framed `$<payload>#<hh>` with a mod-256 checksum; good
/// packets are acknowledged with `+`, bad ones with `-` to request a
/// resend. Single bytes outside a frame are out-of-band signals.
pub struct RspConnection {
    stream: TcpStream,
    peer: String,
    closed: bool,
}

impl RspConnection {
    fn new(stream: TcpStream, peer: String) -> std::io::Result<Self> {
        stream.set_read_timeout(Some(POLL))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            peer,
            closed: false,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Marks the connection for teardown once the current command ends.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn recv_byte(&mut self) -> std::io::Result<Option<u8>> {
        let mut byte = 0;

        loop {
            return match self.stream.read(std::slice::from_mut(&mut byte)) {
                Ok(0) => Err(ErrorKind::UnexpectedEof.into()),
                Ok(_) => Ok(Some(byte)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    Ok(None)
                }
                Err(e) => Err(e),
            };
        }
    }

    /// Receives the next packet payload. Returns [`None`] when `stop` was
    /// raised while the line was idle.
    pub fn recv_packet(&mut self, stop: &AtomicBool) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            // Hunt for the start of a frame.
            loop {
                match self.recv_byte()? {
                    Some(b'$') => break,
                    Some(b) => log::debug!("{}: stray byte {b:#04x} outside packet", self.peer),
                    None if stop.load(Ordering::Relaxed) => return Ok(None),
                    None => {}
                }
            }

            let mut payload = Vec::new();

            loop {
                match self.recv_byte()? {
                    Some(b'#') => break,
                    Some(b) => payload.push(b),
                    None => {}
                }
            }

            let mut sum = [0u8; 2];

            for b in &mut sum {
                *b = loop {
                    if let Some(v) = self.recv_byte()? {
                        break v;
                    }
                };
            }

            let sum = std::str::from_utf8(&sum)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok());

            if sum == Some(checksum(&payload)) {
                self.stream.write_all(b"+")?;
                return Ok(Some(payload));
            }

            log::warn!("{}: packet checksum mismatch, requesting resend", self.peer);
            self.stream.write_all(b"-")?;
        }
    }

    /// Sends one packet and waits for the acknowledgement, resending on
    /// `-`.
    pub fn send_packet(&mut self, payload: &str) -> std::io::Result<()> {
        let frame = format!("${payload}#{:02x}", checksum(payload.as_bytes()));

        for _ in 0..5 {
            self.stream.write_all(frame.as_bytes())?;
            self.stream.flush()?;

            // Wait for the acknowledgement.
            for _ in 0..50 {
                match self.recv_byte()? {
                    Some(b'+') => return Ok(()),
                    Some(b'-') => break,
                    Some(b) => log::debug!("{}: stray byte {b:#04x} while awaiting ack", self.peer),
                    None => {}
                }
            }
        }

        Err(ErrorKind::TimedOut.into())
    }

    /// Polls for a single out-of-band byte for up to `timeout`.
    pub fn recv_signal(&mut self, timeout: Duration) -> std::io::Result<Option<u8>> {
        self.stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let r = self.recv_byte();

        self.stream.set_read_timeout(Some(POLL))?;
        r
    }
}

/// A TCP server speaking the packet framing, one client at a time.
///
/// The service thread accepts a connection, dispatches its packets to the
/// protocol object and goes back to accepting when the client leaves.
pub struct RspServer {
    name: String,
    listener: TcpListener,
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RspServer {
    /// Binds to the loopback interface. Port zero picks an ephemeral port;
    /// the effective one is available via [`RspServer::port`].
    pub fn bind(name: impl Into<String>, port: u16) -> Result<Self, BindError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).map_err(BindError::Bind)?;

        // Non-blocking accept so the service thread can be cancelled.
        listener.set_nonblocking(true).map_err(BindError::Configure)?;

        let port = listener.local_addr().map_err(BindError::Configure)?.port();

        Ok(Self {
            name: name.into(),
            listener,
            port,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Flag that cancels the service thread; protocol handlers raise it to
    /// shut their own server down without joining it.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Starts the service thread.
    pub fn run_async(&mut self, proto: impl RspProtocol) {
        let listener = self.listener.try_clone().expect("cannot clone listener");
        let stop = self.stop.clone();
        let name = self.name.clone();

        self.thread = Some(std::thread::spawn(move || serve(name, listener, stop, proto)));
    }

    /// Stops the service thread and waits for it.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for RspServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(name: String, listener: TcpListener, stop: Arc<AtomicBool>, mut proto: impl RspProtocol) {
    while !stop.load(Ordering::Relaxed) {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(POLL);
                continue;
            }
            Err(e) => {
                log::warn!("{name}: accept failed: {e}");
                std::thread::sleep(POLL);
                continue;
            }
        };

        let mut conn = match RspConnection::new(stream, peer.to_string()) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{name}: cannot configure connection: {e}");
                continue;
            }
        };

        log::debug!("{name}: connected to {peer}");
        proto.handle_connect(&mut conn);

        while !stop.load(Ordering::Relaxed) && !conn.is_closed() {
            let cmd = match conn.recv_packet(&stop) {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(e) => {
                    log::debug!("{name}: connection lost: {e}");
                    break;
                }
            };

            let reply = proto.handle_command(&mut conn, &cmd);

            if conn.is_closed() {
                break;
            }

            if let Err(e) = conn.send_packet(&reply) {
                log::debug!("{name}: cannot send reply: {e}");
                break;
            }
        }

        log::debug!("{name}: disconnected from {peer}");
        proto.handle_disconnect();
    }
}

/// Represents an error when a protocol server fails to come up.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("couldn't bind the server port")]
    Bind(#[source] std::io::Error),

    #[error("couldn't configure the listening socket")]
    Configure(#[source] std::io::Error),
}
