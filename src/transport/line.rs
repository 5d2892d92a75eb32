//! Line transport
//!
//! Newline-delimited JSON over plain TCP. One accept thread, then per
//! connection one reader thread and one writer thread:
//! - the reader does blocking reads into a `LineBuffer`, decodes each
//!   complete line as a packet and hands it to the broker
//! - the writer drains the connection's outbound queue, so nobody else
//!   ever writes to the socket. Writes carry the broker's write timeout: a
//!   peer that stops reading makes the write fail, the writer shuts the
//!   socket down and the reader cleans up.
//!
//! The read timeout only exists so readers notice shutdown. A timeout is not
//! an error and the read is simply retried. When a reader exits, for any
//! reason, the connection is unregistered, its socket closed and a
//! disconnect event emitted.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver};
use tracing::debug;

use crate::broker::Broker;
use crate::client::{Client, ConnectionId, TransportKind};
use crate::transport::packet;
use crate::utils::BrokerError;

const READ_CHUNK: usize = 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Reassembles `\n`-terminated lines from arbitrary read chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one read chunk.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete, non-empty line, decoded and trimmed. A trailing
    /// partial line stays buffered.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buf.iter().position(|b| *b == b'\n')?;
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = decode_line(&line[..pos]);
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
}

/// UTF-8 if possible, otherwise Latin-1 (each byte one code point), so
/// malformed input never aborts the reader.
pub fn decode_line(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.trim().to_string(),
        Err(_) => bytes
            .iter()
            .map(|&b| char::from(b))
            .collect::<String>()
            .trim()
            .to_string(),
    }
}

pub struct LineServer {
    broker: Arc<Broker>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    accept_thread: Option<JoinHandle<()>>,
}

impl LineServer {
    /// Binds `addr` and starts accepting. Bind failure is the only error;
    /// nothing is started in that case.
    pub fn start(
        broker: Arc<Broker>,
        addr: &str,
        read_poll: Duration,
    ) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(addr).map_err(|source| BrokerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        // a zero read timeout is rejected by the OS
        let read_poll = read_poll.max(Duration::from_millis(1));

        broker.open();
        let running = Arc::new(AtomicBool::new(true));

        let accept_thread = {
            let broker = broker.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("line-accept".to_string())
                .spawn(move || accept_loop(listener, broker, running, read_poll))?
        };

        broker
            .events()
            .info(format!("Line transport listening on {local_addr}"));

        Ok(Self {
            broker,
            running,
            local_addr,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops accepting, closes the listener and force-closes every
    /// connection. Readers notice on their next read and exit.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                self.broker.events().error("Line accept thread panicked");
            }
        }
        let closed = self.broker.close_all();
        self.broker
            .events()
            .info(format!("Line transport stopped ({closed} connections closed)"));
    }
}

impl Drop for LineServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    broker: Arc<Broker>,
    running: Arc<AtomicBool>,
    read_poll: Duration,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = spawn_connection(stream, peer, &broker, &running, read_poll) {
                    broker
                        .events()
                        .error(format!("Failed to set up connection from {peer}: {e}"));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                broker.events().error(format!("Accept error: {e}"));
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("line accept loop finished");
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: &Arc<Broker>,
    running: &Arc<AtomicBool>,
    read_poll: Duration,
) -> io::Result<()> {
    // accepted sockets may inherit the listener's non-blocking mode
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(read_poll))?;
    stream.set_nodelay(true)?;

    let writer_stream = stream.try_clone()?;
    writer_stream.set_write_timeout(Some(broker.write_timeout()))?;
    let (tx, rx) = mpsc::channel::<String>(broker.send_queue());
    let client = Client::new(peer, tx).with_socket(stream.try_clone()?);

    let id = match broker.register_client(client) {
        Ok(id) => id,
        Err(e) => {
            broker.events().error(format!("Rejected {peer}: {e}"));
            return Ok(());
        }
    };

    let spawned = thread::Builder::new()
        .name(format!("line-writer-{id}"))
        .spawn(move || write_loop(writer_stream, rx))
        .and_then(|_| {
            let broker = broker.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("line-reader-{id}"))
                .spawn(move || {
                    read_loop(&stream, id, peer, &broker, &running);
                    broker.cleanup_client(&id);
                    let _ = stream.shutdown(Shutdown::Both);
                    broker
                        .events()
                        .client_disconnect(id, TransportKind::Line, peer);
                })
        });

    if let Err(e) = spawned {
        broker.cleanup_client(&id);
        return Err(e);
    }
    Ok(())
}

fn write_loop(mut stream: TcpStream, mut rx: Receiver<String>) {
    while let Some(line) = rx.blocking_recv() {
        // a timeout here means the peer stopped reading
        if let Err(e) = stream.write_all(line.as_bytes()) {
            debug!("line write failed: {e}");
            break;
        }
    }
    // wakes the reader if the write side failed first
    let _ = stream.shutdown(Shutdown::Both);
}

fn read_loop(
    mut stream: &TcpStream,
    id: ConnectionId,
    peer: SocketAddr,
    broker: &Broker,
    running: &AtomicBool,
) {
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];

    while running.load(Ordering::SeqCst) {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend(&chunk[..n]);
                while let Some(text) = buffer.next_line() {
                    handle_line(broker, id, peer, &text);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                ) =>
            {
                break;
            }
            Err(e) => {
                broker
                    .events()
                    .error(format!("Client read error {peer}: {e}"));
                break;
            }
        }
    }
}

fn handle_line(broker: &Broker, id: ConnectionId, peer: SocketAddr, text: &str) {
    match packet::parse(text) {
        Ok((raw, packet)) => {
            broker.events().message_in(id, TransportKind::Line, &raw);
            broker.handle_packet(id, packet);
        }
        Err(e) => broker
            .events()
            .error(format!("Invalid JSON from {peer}: {text} ({e})")),
    }
}
