//! Native reactor
//!
//! Drives an [`App`] from a tokio current-thread runtime. Listen sockets are
//! created with socket2 so reuse flags can be set before `bind`; accepted
//! streams are polled for readiness and fed to the app's sans-IO entry
//! points. Everything runs on one thread inside a `LocalSet`.

use crate::app::App;
use crate::config::{ListenConfig, ListenOptions};
use crate::connection::{ResponseId, Socket as EngineSocket, SocketId, TlsSession};
use crate::engine::AppStats;
use crate::response::HttpResponse;
use crate::websocket::{Opcode, WebSocket};
use crate::{Error, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound listen socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenSocket {
    id: u32,
    local_addr: Option<SocketAddr>,
}

impl ListenSocket {
    /// Bound address; `None` for Unix domain sockets
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bound port, useful after listening on port 0
    pub fn port(&self) -> u16 {
        self.local_addr.map_or(0, |addr| addr.port())
    }
}

enum Bound {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

/// Listen sockets bound before `run`
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u32,
    bound: Vec<(ListenSocket, Bound)>,
}

impl Listeners {
    fn add(&mut self, listener: Bound, local_addr: Option<SocketAddr>) -> ListenSocket {
        let socket = ListenSocket { id: self.next_id, local_addr };
        self.next_id += 1;
        self.bound.push((socket, listener));
        socket
    }

    fn remove(&mut self, socket: ListenSocket) -> bool {
        let before = self.bound.len();
        self.bound.retain(|(s, _)| *s != socket);
        self.bound.len() != before
    }
}

/// Create a TCP listen socket with the reuse and latency flags applied
pub fn create_listen_socket(addr: &SocketAddr, options: ListenOptions) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;

    // SO_REUSEPORT lets several processes share the port
    #[cfg(unix)]
    if options == ListenOptions::Default {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = options;

    socket.set_nodelay(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(1024)?;
    Ok(socket)
}

fn resolve(config: &ListenConfig) -> Result<SocketAddr> {
    let host = config.host.as_deref().unwrap_or("0.0.0.0");
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, config.port));
    }
    (host, config.port)
        .to_socket_addrs()
        .map_err(|e| Error::InvalidListenConfig(format!("{host}: {e}")))?
        .next()
        .ok_or_else(|| Error::InvalidListenConfig(format!("{host}: no addresses")))
}

fn bind_tcp(config: &ListenConfig) -> Result<std::net::TcpListener> {
    let addr = resolve(config)?;
    let socket = create_listen_socket(&addr, config.options)?;
    Ok(socket.into())
}

impl App {
    /// Listen on every IPv4 interface
    pub fn listen(&mut self, port: u16) -> Option<ListenSocket> {
        self.listen_with(ListenConfig::new(port))
    }

    /// Bind a listen socket; `None` if the address could not be bound
    pub fn listen_with(&mut self, config: ListenConfig) -> Option<ListenSocket> {
        match bind_tcp(&config) {
            Ok(listener) => {
                let local_addr = listener.local_addr().ok();
                info!(addr = ?local_addr, tls = self.is_ssl(), "listening");
                Some(self.listeners.add(Bound::Tcp(listener), local_addr))
            }
            Err(e) => {
                warn!(host = ?config.host, port = config.port, error = %e, "listen failed");
                None
            }
        }
    }

    /// Listen on a Unix domain socket
    #[cfg(unix)]
    pub fn listen_unix(&mut self, path: impl AsRef<std::path::Path>) -> Option<ListenSocket> {
        let path = path.as_ref();
        match std::os::unix::net::UnixListener::bind(path) {
            Ok(listener) => {
                info!(path = %path.display(), "listening");
                Some(self.listeners.add(Bound::Unix(listener), None))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "listen failed");
                None
            }
        }
    }

    /// Close a listen socket that has not started accepting yet
    ///
    /// While running, use [`LoopHandle::close_listen_socket`].
    pub fn close_listen_socket(&mut self, socket: ListenSocket) -> bool {
        self.listeners.remove(socket)
    }

    /// Run until every listen socket is closed and no connection remains
    pub fn run(self) -> Result<()> {
        self.run_with(|_| {})
    }

    /// Like [`App::run`], calling `setup` once the loop is up
    ///
    /// `setup` runs inside the loop's `LocalSet`, so it may
    /// `tokio::task::spawn_local` tasks that keep a clone of the handle.
    pub fn run_with<F>(self, setup: F) -> Result<()>
    where
        F: FnOnce(&LoopHandle),
    {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, serve(self, setup))
    }

    #[cfg(feature = "tls")]
    fn is_ssl(&self) -> bool {
        self.tls.is_some()
    }

    #[cfg(not(feature = "tls"))]
    fn is_ssl(&self) -> bool {
        false
    }

    #[cfg(feature = "tls")]
    fn tls_session(&self) -> Result<Option<Box<dyn TlsSession>>> {
        self.tls.as_ref().map(|tls| tls.new_session()).transpose()
    }

    #[cfg(not(feature = "tls"))]
    fn tls_session(&self) -> Result<Option<Box<dyn TlsSession>>> {
        Ok(None)
    }
}

/// Access to a running app from tasks spawned on its loop
///
/// Every call borrows the app; calling from inside one of the app's own
/// callbacks fails with [`Error::AppBusy`].
#[derive(Clone)]
pub struct LoopHandle {
    app: Weak<RefCell<App>>,
    listeners: Rc<RefCell<HashMap<ListenSocket, Rc<Notify>>>>,
    stop: Rc<Notify>,
}

impl LoopHandle {
    fn with_app<R>(&self, f: impl FnOnce(&mut App) -> R) -> Result<R> {
        let app = self.app.upgrade().ok_or(Error::LoopStopped)?;
        let mut app = app.try_borrow_mut().map_err(|_| Error::AppBusy)?;
        Ok(f(&mut app))
    }

    pub fn cork<R>(&self, id: ResponseId, f: impl FnOnce(&mut HttpResponse<'_>) -> R) -> Result<R> {
        self.with_app(|app| app.cork(id, f))?
    }

    pub fn with_websocket<U: 'static, R>(
        &self,
        id: SocketId,
        f: impl FnOnce(&mut WebSocket<'_, U>) -> R,
    ) -> Result<R> {
        self.with_app(|app| app.with_websocket(id, f))?
    }

    pub fn publish(&self, topic: &str, message: &[u8], opcode: Opcode, compress: bool) -> Result<bool> {
        self.with_app(|app| app.publish(topic, message, opcode, compress))
    }

    pub fn num_subscribers(&self, topic: &str) -> Result<usize> {
        self.with_app(|app| app.num_subscribers(topic))
    }

    pub fn stats(&self) -> Result<AppStats> {
        self.with_app(|app| app.stats())
    }

    /// Stop accepting on `socket`; open connections are unaffected
    pub fn close_listen_socket(&self, socket: ListenSocket) -> bool {
        match self.listeners.borrow_mut().remove(&socket) {
            Some(stop) => {
                stop.notify_one();
                true
            }
            None => false,
        }
    }

    /// Close every listen socket and connection, then return from `run`
    pub fn shutdown(&self) {
        self.stop.notify_one();
    }
}

async fn serve<F>(mut app: App, setup: F) -> Result<()>
where
    F: FnOnce(&LoopHandle),
{
    let bound = std::mem::take(&mut app.listeners.bound);
    let granularity = app.limits().timer_granularity;
    let shared = Rc::new(RefCell::new(app));
    let listeners = Rc::new(RefCell::new(HashMap::new()));
    let stop = Rc::new(Notify::new());

    for (socket, listener) in bound {
        let signal = Rc::new(Notify::new());
        listeners.borrow_mut().insert(socket, signal.clone());
        match listener {
            Bound::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                let listener = tokio::net::TcpListener::from_std(listener)?;
                tokio::task::spawn_local(accept_loop(shared.clone(), listener, signal));
            }
            #[cfg(unix)]
            Bound::Unix(listener) => {
                listener.set_nonblocking(true)?;
                let listener = tokio::net::UnixListener::from_std(listener)?;
                tokio::task::spawn_local(accept_loop(shared.clone(), listener, signal));
            }
        }
    }

    let handle = LoopHandle {
        app: Rc::downgrade(&shared),
        listeners: listeners.clone(),
        stop: stop.clone(),
    };
    setup(&handle);

    let mut ticker = tokio::time::interval(granularity);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut app = shared.borrow_mut();
                app.on_timer(Instant::now());
                if listeners.borrow().is_empty() && app.connection_count() == 0 {
                    break;
                }
            }
            _ = stop.notified() => {
                for (_, signal) in listeners.borrow_mut().drain() {
                    signal.notify_one();
                }
                shared.borrow_mut().close_all();
                break;
            }
        }
    }
    info!("event loop finished");
    Ok(())
}

/// Readiness-based stream, so TCP and Unix sockets share one driver
trait Stream: 'static {
    async fn readable(&self) -> io::Result<()>;
    async fn writable(&self) -> io::Result<()>;
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
    fn shutdown(&self);
}

impl Stream for tokio::net::TcpStream {
    async fn readable(&self) -> io::Result<()> {
        tokio::net::TcpStream::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        tokio::net::TcpStream::writable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::TcpStream::try_write(self, buf)
    }

    fn shutdown(&self) {
        let _ = SockRef::from(self).shutdown(Shutdown::Both);
    }
}

#[cfg(unix)]
impl Stream for tokio::net::UnixStream {
    async fn readable(&self) -> io::Result<()> {
        tokio::net::UnixStream::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        tokio::net::UnixStream::writable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::UnixStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::UnixStream::try_write(self, buf)
    }

    fn shutdown(&self) {
        let _ = SockRef::from(self).shutdown(Shutdown::Both);
    }
}

trait Acceptor: 'static {
    type Stream: Stream;
    async fn accept_stream(&self) -> io::Result<(Self::Stream, Option<SocketAddr>)>;
}

impl Acceptor for tokio::net::TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept_stream(&self) -> io::Result<(Self::Stream, Option<SocketAddr>)> {
        let (stream, remote) = self.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, Some(remote)))
    }
}

#[cfg(unix)]
impl Acceptor for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept_stream(&self) -> io::Result<(Self::Stream, Option<SocketAddr>)> {
        let (stream, _) = self.accept().await?;
        Ok((stream, None))
    }
}

async fn accept_loop<L: Acceptor>(app: Rc<RefCell<App>>, listener: L, stop: Rc<Notify>) {
    loop {
        tokio::select! {
            accepted = listener.accept_stream() => match accepted {
                Ok((stream, remote)) => {
                    tokio::task::spawn_local(drive(app.clone(), stream, remote));
                }
                Err(e) => {
                    // EMFILE and friends; give the process a moment to free descriptors
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = stop.notified() => break,
        }
    }
    debug!("listen socket closed");
}

/// Engine-side view of an accepted stream
struct StreamSocket<S> {
    stream: Rc<S>,
    closed: Rc<Notify>,
    /// Tells the connection task to recompute its read and write interest
    interest: Rc<Notify>,
}

impl<S: Stream> EngineSocket for StreamSocket<S> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let result = self.stream.try_write(data);
        let short = match &result {
            Ok(n) => *n < data.len(),
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        };
        if short {
            self.interest.notify_one();
        }
        result
    }

    fn shutdown(&mut self) {
        self.stream.shutdown();
        self.closed.notify_one();
    }

    fn resume_reading(&mut self) {
        self.interest.notify_one();
    }
}

async fn drive<S: Stream>(app: Rc<RefCell<App>>, stream: S, remote: Option<SocketAddr>) {
    let stream = Rc::new(stream);
    let closed = Rc::new(Notify::new());
    let interest = Rc::new(Notify::new());
    let socket = StreamSocket {
        stream: stream.clone(),
        closed: closed.clone(),
        interest: interest.clone(),
    };

    let opened = {
        let mut app = app.borrow_mut();
        app.tls_session()
            .and_then(|tls| app.on_open(Box::new(socket), remote, tls))
    };
    let id = match opened {
        Ok(id) => id,
        Err(e) => {
            debug!(remote = ?remote, error = %e, "connection rejected");
            stream.shutdown();
            return;
        }
    };

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let (wants_write, room) = {
            let app = app.borrow();
            if !app.is_connected(id) {
                break;
            }
            (app.wants_writable(id), app.inbound_room(id))
        };

        tokio::select! {
            ready = stream.readable(), if room > 0 => {
                if ready.is_err() {
                    app.borrow_mut().on_close(id);
                    break;
                }
                let limit = room.min(buf.len());
                match stream.try_read(&mut buf[..limit]) {
                    Ok(0) => {
                        app.borrow_mut().on_close(id);
                        break;
                    }
                    Ok(n) => app.borrow_mut().on_data(id, &buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!(conn = %id, error = %e, "read failed");
                        app.borrow_mut().on_close(id);
                        break;
                    }
                }
            }
            ready = stream.writable(), if wants_write => {
                if ready.is_err() {
                    app.borrow_mut().on_close(id);
                    break;
                }
                app.borrow_mut().on_writable(id);
            }
            _ = interest.notified() => {}
            _ = closed.notified() => break,
        }
    }
}
