//! Connections: handles, the socket seam, and the corking write path
//!
//! Every connection lives in a generational slab and is referred to by a
//! [`ConnId`]. A handle whose slot was reused no longer resolves, so user code
//! holding an old id gets an error instead of someone else's socket.

use crate::parser::BodyDecoder;
use crate::response::ResponseState;
use crate::websocket::session::Session;
use bytes::{Buf, BytesMut};
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

/// Stable handle to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Handle to one HTTP exchange on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseId {
    pub(crate) conn: ConnId,
    pub(crate) seq: u64,
}

impl ResponseId {
    pub fn connection(&self) -> ConnId {
        self.conn
    }
}

/// Handle to a WebSocket session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) ConnId);

impl SocketId {
    pub fn connection(&self) -> ConnId {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Generational slab keyed by [`ConnId`]
pub(crate) struct Slab<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Slab<T> {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new(), free: Vec::new(), len: 0 }
    }

    pub(crate) fn insert(&mut self, value: T) -> ConnId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.entries[index as usize];
            let generation = match slot {
                Entry::Vacant { generation } => generation.wrapping_add(1),
                Entry::Occupied { generation, .. } => *generation,
            };
            *slot = Entry::Occupied { generation, value };
            return ConnId { index, generation };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied { generation: 0, value });
        ConnId { index, generation: 0 }
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<&T> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        match self.entries.get_mut(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn remove(&mut self, id: ConnId) -> Option<T> {
        let slot = self.entries.get_mut(id.index as usize)?;
        if !matches!(slot, Entry::Occupied { generation, .. } if *generation == id.generation) {
            return None;
        }
        let old = std::mem::replace(slot, Entry::Vacant { generation: id.generation });
        self.free.push(id.index);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    pub(crate) fn ids(&self) -> Vec<ConnId> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, .. } => {
                    Some(ConnId { index: index as u32, generation: *generation })
                }
                Entry::Vacant { .. } => None,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// Non-blocking byte sink supplied by the reactor
///
/// `write` returns how many bytes the socket took; anything less than the
/// full buffer (including `Ok(0)` or `WouldBlock`) is backpressure, and the
/// reactor reports `on_writable` once the socket drains. A short write can
/// happen outside the connection's own events (a publish, a deferred
/// response), so the socket itself must make its reactor start polling for
/// writability.
pub trait Socket {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Close both directions. Called once, when the engine drops the connection.
    fn shutdown(&mut self);

    /// Buffered input was consumed after [`App::inbound_room`](crate::App::inbound_room)
    /// reached zero; a reactor that stopped reading starts again.
    fn resume_reading(&mut self) {}
}

/// Opaque TLS session: a byte-stream transform in front of the socket
pub trait TlsSession {
    /// Feed ciphertext from the peer. Decrypted bytes go to `plaintext`,
    /// handshake records that must be sent go to `outgoing`.
    fn read(&mut self, incoming: &[u8], plaintext: &mut Vec<u8>, outgoing: &mut Vec<u8>) -> io::Result<()>;

    /// Encrypt application data into `outgoing`
    fn write(&mut self, plaintext: &[u8], outgoing: &mut Vec<u8>) -> io::Result<()>;

    /// Queue a close_notify alert into `outgoing`
    fn shutdown(&mut self, outgoing: &mut Vec<u8>);
}

#[derive(Debug, Default)]
struct MemoryState {
    output: Vec<u8>,
    /// Bytes still accepted before reporting backpressure; `None` is unlimited
    capacity: Option<usize>,
    shutdown: bool,
    writes: usize,
    resumed: usize,
}

/// In-memory socket for driving the engine without a network
///
/// Clones share one buffer, so a test keeps a clone to inspect what the
/// engine wrote.
#[derive(Debug, Clone, Default)]
pub struct MemorySocket {
    state: Rc<RefCell<MemoryState>>,
}

impl MemorySocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket that accepts `bytes` before applying backpressure
    pub fn with_capacity(bytes: usize) -> Self {
        let socket = Self::default();
        socket.state.borrow_mut().capacity = Some(bytes);
        socket
    }

    /// Let the socket accept `bytes` more
    pub fn grant(&self, bytes: usize) {
        let mut state = self.state.borrow_mut();
        if let Some(capacity) = state.capacity.as_mut() {
            *capacity += bytes;
        }
    }

    /// Remove the backpressure limit
    pub fn unlimited(&self) {
        self.state.borrow_mut().capacity = None;
    }

    /// Everything written since the last call
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().output)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.borrow().shutdown
    }

    /// Number of write calls that transferred at least one byte
    pub fn write_count(&self) -> usize {
        self.state.borrow().writes
    }

    /// Times the engine asked for reading to resume
    pub fn resume_count(&self) -> usize {
        self.state.borrow().resumed
    }
}

impl Socket for MemorySocket {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.shutdown {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let n = match state.capacity.as_mut() {
            Some(capacity) => {
                let n = (*capacity).min(data.len());
                *capacity -= n;
                n
            }
            None => data.len(),
        };
        if n > 0 {
            state.output.extend_from_slice(&data[..n]);
            state.writes += 1;
        }
        Ok(n)
    }

    fn shutdown(&mut self) {
        self.state.borrow_mut().shutdown = true;
    }

    fn resume_reading(&mut self) {
        self.state.borrow_mut().resumed += 1;
    }
}

/// Socket plus optional TLS, cork buffer and backpressure backlog
pub(crate) struct Transport {
    socket: Box<dyn Socket>,
    tls: Option<Box<dyn TlsSession>>,
    cork_depth: u32,
    cork_buf: BytesMut,
    cork_limit: usize,
    /// Bytes (ciphertext under TLS) the socket has not taken yet
    backlog: BytesMut,
    /// The last socket write came up short
    blocked: bool,
    broken: bool,
    shut: bool,
}

impl Transport {
    pub(crate) fn new(socket: Box<dyn Socket>, tls: Option<Box<dyn TlsSession>>, cork_limit: usize) -> Self {
        Self {
            socket,
            tls,
            cork_depth: 0,
            cork_buf: BytesMut::new(),
            cork_limit,
            backlog: BytesMut::new(),
            blocked: false,
            broken: false,
            shut: false,
        }
    }

    /// Buffered write: corked data is coalesced, everything else goes out now
    /// or lands in the backlog.
    pub(crate) fn write(&mut self, data: &[u8]) {
        if data.is_empty() || self.broken {
            return;
        }
        if self.cork_depth == 0 {
            self.send_plain(data);
            return;
        }
        if self.cork_buf.len() + data.len() > self.cork_limit {
            self.flush_cork();
        }
        if data.len() > self.cork_limit {
            self.send_plain(data);
        } else {
            self.cork_buf.extend_from_slice(data);
        }
    }

    /// Write without buffering the remainder; returns bytes accepted
    ///
    /// Under TLS the record layer cannot split a write, so everything is
    /// accepted (and possibly backlogged).
    pub(crate) fn write_optional(&mut self, data: &[u8]) -> usize {
        self.flush_cork();
        if self.broken {
            return 0;
        }
        if self.tls.is_some() {
            self.send_plain(data);
            return data.len();
        }
        if !self.backlog.is_empty() {
            return 0;
        }
        self.write_socket(data)
    }

    pub(crate) fn cork(&mut self) {
        self.cork_depth += 1;
    }

    pub(crate) fn uncork(&mut self) {
        self.cork_depth = self.cork_depth.saturating_sub(1);
        if self.cork_depth == 0 {
            self.flush_cork();
        }
    }

    pub(crate) fn is_corked(&self) -> bool {
        self.cork_depth > 0
    }

    fn flush_cork(&mut self) {
        if !self.cork_buf.is_empty() {
            let pending = self.cork_buf.split();
            self.send_plain(&pending);
        }
    }

    fn send_plain(&mut self, data: &[u8]) {
        match self.tls.as_mut() {
            Some(tls) => {
                let mut ciphertext = Vec::with_capacity(data.len() + 64);
                if let Err(e) = tls.write(data, &mut ciphertext) {
                    tracing::debug!(error = %e, "tls write failed");
                    self.broken = true;
                    return;
                }
                self.send_wire(&ciphertext);
            }
            None => self.send_wire(data),
        }
    }

    fn send_wire(&mut self, data: &[u8]) {
        if !self.backlog.is_empty() {
            self.backlog.extend_from_slice(data);
            return;
        }
        let n = self.write_socket(data);
        if n < data.len() {
            self.backlog.extend_from_slice(&data[n..]);
        }
    }

    fn write_socket(&mut self, data: &[u8]) -> usize {
        let mut written = 0;
        while written < data.len() && !self.broken {
            match self.socket.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "socket write failed");
                    self.broken = true;
                }
            }
        }
        self.blocked = written < data.len();
        written
    }

    /// Push backlog to the socket; true once nothing is left
    pub(crate) fn flush(&mut self) -> bool {
        self.blocked = false;
        if !self.backlog.is_empty() {
            let mut pending = self.backlog.split();
            let n = self.write_socket(&pending);
            pending.advance(n);
            self.backlog = pending;
        }
        self.backlog.is_empty()
    }

    /// Bytes accepted but not yet taken by the socket
    pub(crate) fn buffered_amount(&self) -> usize {
        self.backlog.len()
    }

    pub(crate) fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Socket refused bytes; the reactor should report `on_writable`
    pub(crate) fn wants_writable(&self) -> bool {
        self.blocked || !self.backlog.is_empty()
    }

    /// Nothing corked and nothing backlogged
    pub(crate) fn is_drained(&self) -> bool {
        self.cork_buf.is_empty() && self.backlog.is_empty()
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    /// Decrypt (under TLS) and append incoming bytes to `inbound`
    pub(crate) fn receive(&mut self, data: &[u8], inbound: &mut BytesMut) -> io::Result<()> {
        let Some(tls) = self.tls.as_mut() else {
            inbound.extend_from_slice(data);
            return Ok(());
        };
        let mut plaintext = Vec::new();
        let mut outgoing = Vec::new();
        let result = tls.read(data, &mut plaintext, &mut outgoing);
        // Alerts are sent even when the read failed
        if !outgoing.is_empty() {
            self.send_wire(&outgoing);
        }
        result?;
        inbound.extend_from_slice(&plaintext);
        Ok(())
    }

    pub(crate) fn resume_reading(&mut self) {
        if !self.shut {
            self.socket.resume_reading();
        }
    }

    /// Close the socket, sending close_notify first under TLS
    pub(crate) fn shutdown(&mut self) {
        if self.shut {
            return;
        }
        self.shut = true;
        if let Some(tls) = self.tls.as_mut() {
            let mut outgoing = Vec::new();
            tls.shutdown(&mut outgoing);
            if !outgoing.is_empty() && self.backlog.is_empty() && !self.broken {
                self.write_socket(&outgoing);
            }
        }
        self.tls = None;
        self.socket.shutdown();
    }
}

/// Per-connection HTTP state
pub(crate) struct HttpState {
    /// The exchange currently owned by application code
    pub(crate) response: Option<ResponseState>,
    /// Body of the current request still arriving
    pub(crate) body: Option<BodyDecoder>,
    pub(crate) paused: bool,
    pub(crate) next_seq: u64,
}

impl HttpState {
    pub(crate) fn new() -> Self {
        Self { response: None, body: None, paused: false, next_seq: 0 }
    }

    /// No request in flight and no body pending
    pub(crate) fn is_idle(&self) -> bool {
        self.response.is_none() && self.body.is_none()
    }
}

/// Protocol mode. HTTP to WebSocket is one-way.
pub(crate) enum Mode {
    Http(HttpState),
    WebSocket(Box<Session>),
    /// Waiting for queued bytes to flush before the socket is shut down
    Closing,
}

pub(crate) struct Connection {
    pub(crate) io: Transport,
    pub(crate) mode: Mode,
    /// Bytes received but not yet consumed by the protocol layer
    pub(crate) inbound: BytesMut,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) last_activity: Instant,
    /// Sitting in the engine's wakeup queue
    pub(crate) queued: bool,
}

impl Connection {
    pub(crate) fn new(io: Transport, remote: Option<SocketAddr>, now: Instant) -> Self {
        Self {
            io,
            mode: Mode::Http(HttpState::new()),
            inbound: BytesMut::new(),
            remote,
            last_activity: now,
            queued: false,
        }
    }
}

/// Binary address: 4 bytes for IPv4, 16 for IPv6, empty when unknown
pub(crate) fn address_bytes(remote: Option<SocketAddr>) -> Vec<u8> {
    match remote.map(|addr| addr.ip()) {
        Some(std::net::IpAddr::V4(ip)) => ip.octets().to_vec(),
        Some(std::net::IpAddr::V6(ip)) => ip.octets().to_vec(),
        None => Vec::new(),
    }
}

pub(crate) fn address_text(remote: Option<SocketAddr>) -> String {
    remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
}
