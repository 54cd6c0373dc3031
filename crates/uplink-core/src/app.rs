//! App: route table, dispatch and the reactor-facing entry points
//!
//! The app is sans-IO. A reactor (the tokio one in [`crate::server`], or a
//! test) reports socket events through `on_open`, `on_data`, `on_writable`,
//! `on_close` and `on_timer`; everything the engine wants to write goes
//! through the [`Socket`] handed over at `on_open`.

use crate::config::EngineLimits;
use crate::connection::{ConnId, Connection, Mode, ResponseId, Socket, SocketId, TlsSession};
use crate::engine::{AppStats, Engine};
use crate::parser::{parse_head, BodyKind, ParseResult, RequestHead};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::websocket::{handshake, Opcode, UpgradeContext, WebSocket, WebSocketBehavior};
use crate::{Error, Result};
use bytes::Buf;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, error, trace};
use uplink_router::{Router, ANY_METHOD};

/// HTTP route handler
pub type Handler = Rc<dyn Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()>>;

/// WebSocket route with its user data type erased
trait UpgradeRoute {
    fn upgrade(&self, res: &mut HttpResponse<'_>, req: &mut HttpRequest<'_>) -> Result<()>;
}

/// A registered WebSocket behavior and the user data the built-in
/// handshake starts sessions with
struct WebSocketRoute<U> {
    context: UpgradeContext<U>,
    initial: Option<fn() -> U>,
}

impl<U: 'static> UpgradeRoute for WebSocketRoute<U> {
    fn upgrade(&self, res: &mut HttpResponse<'_>, req: &mut HttpRequest<'_>) -> Result<()> {
        let initial = match (self.context.behavior().upgrade_handler(), self.initial) {
            (Some(custom), _) => return custom(res, req, &self.context),
            (None, Some(initial)) => initial,
            (None, None) => return Err(Error::MissingUpgradeHandler),
        };
        if !req.head().is_websocket_upgrade() {
            req.set_yield(true);
            return Ok(());
        }

        let key = req.header("sec-websocket-key");
        if let Err(err) = handshake::validate(key, req.header("sec-websocket-version")) {
            debug!(error = %err, "websocket handshake rejected");
            let status = handshake::rejection_status(&err);
            res.write_status(status)?;
            if status.starts_with("426") {
                res.write_header("Sec-WebSocket-Version", handshake::WEBSOCKET_VERSION)?;
            }
            return res.end_with(b"", true);
        }

        let protocol = handshake::first_protocol(req.header("sec-websocket-protocol"));
        res.upgrade(initial(), key, protocol, req.header("sec-websocket-extensions"), &self.context)?;
        Ok(())
    }
}

#[derive(Clone)]
enum Route {
    Http(Handler),
    WebSocket(Rc<dyn UpgradeRoute>),
}

/// HTTP and WebSocket server application
///
/// ```
/// use uplink_core::{App, MemorySocket};
///
/// let mut app = App::new();
/// app.get("/hello/:name", |res, req| {
///     let body = format!("hello {}", req.param("name").unwrap_or("?"));
///     res.end(body.as_bytes())
/// })
/// .unwrap();
///
/// let socket = MemorySocket::new();
/// let conn = app.on_open(Box::new(socket.clone()), None, None).unwrap();
/// app.on_data(conn, b"GET /hello/world HTTP/1.1\r\n\r\n");
/// let out = String::from_utf8(socket.take_output()).unwrap();
/// assert!(out.ends_with("hello world"));
/// ```
pub struct App {
    pub(crate) engine: Engine,
    router: Router,
    routes: Vec<Route>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<crate::tls::TlsContext>,
    #[cfg(feature = "native")]
    pub(crate) listeners: crate::server::Listeners,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self::with_limits(EngineLimits::default())
    }

    pub fn with_limits(limits: EngineLimits) -> Self {
        Self {
            engine: Engine::new(limits),
            router: Router::new(),
            routes: Vec::new(),
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(feature = "native")]
            listeners: crate::server::Listeners::default(),
        }
    }

    /// TLS-terminating app; otherwise identical to [`App::new`]
    #[cfg(feature = "tls")]
    pub fn ssl(options: crate::config::AppOptions) -> Result<Self> {
        let mut app = Self::new();
        app.tls = Some(crate::tls::TlsContext::new(&options)?);
        Ok(app)
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.engine.limits
    }

    fn add(&mut self, method: &str, pattern: &str, route: Route) -> Result<&mut Self> {
        let id = self.routes.len() as u32;
        self.router.insert(method, pattern, id)?;
        self.routes.push(route);
        debug!(method, pattern, "route registered");
        Ok(self)
    }

    fn add_handler<F>(&mut self, method: &str, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add(method, pattern, Route::Http(Rc::new(handler)))
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("GET", pattern, handler)
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("POST", pattern, handler)
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("PUT", pattern, handler)
    }

    pub fn del<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("DELETE", pattern, handler)
    }

    pub fn patch<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("PATCH", pattern, handler)
    }

    pub fn head<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("HEAD", pattern, handler)
    }

    pub fn options<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("OPTIONS", pattern, handler)
    }

    pub fn connect<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("CONNECT", pattern, handler)
    }

    pub fn trace<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler("TRACE", pattern, handler)
    }

    /// Fallback for every method, tried after method-specific routes
    pub fn any<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>) -> Result<()> + 'static,
    {
        self.add_handler(ANY_METHOD, pattern, handler)
    }

    /// WebSocket route. Plain GET requests on the pattern fall through to
    /// the next matching route.
    pub fn ws<U: Default + 'static>(&mut self, pattern: &str, behavior: WebSocketBehavior<U>) -> Result<&mut Self> {
        self.add_ws(pattern, behavior, Some(U::default as fn() -> U))
    }

    /// WebSocket route whose `upgrade` handler supplies the user data, so
    /// `U` needs no `Default`
    pub fn ws_with_upgrade<U: 'static>(
        &mut self,
        pattern: &str,
        behavior: WebSocketBehavior<U>,
    ) -> Result<&mut Self> {
        if behavior.upgrade_handler().is_none() {
            return Err(Error::MissingUpgradeHandler);
        }
        self.add_ws(pattern, behavior, None)
    }

    fn add_ws<U: 'static>(
        &mut self,
        pattern: &str,
        behavior: WebSocketBehavior<U>,
        initial: Option<fn() -> U>,
    ) -> Result<&mut Self> {
        let context = UpgradeContext::new(Rc::new(behavior));
        self.add("GET", pattern, Route::WebSocket(Rc::new(WebSocketRoute { context, initial })))
    }

    /// Connection opened (+1) or closed (-1)
    pub fn filter<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(ConnId, Option<SocketAddr>, i32) + 'static,
    {
        self.engine.filter = Some(Rc::new(f));
        self
    }

    /// Send to every subscriber of `topic`; true if any send was accepted
    pub fn publish(&mut self, topic: &str, message: &[u8], opcode: Opcode, compress: bool) -> bool {
        let delivered = self.engine.publish(topic, message, opcode, compress, None);
        self.drain();
        delivered
    }

    pub fn num_subscribers(&self, topic: &str) -> usize {
        self.engine.topics.count(topic)
    }

    /// Reach a response outside its handler; writes inside `f` are corked
    pub fn cork<R>(&mut self, id: ResponseId, f: impl FnOnce(&mut HttpResponse<'_>) -> R) -> Result<R> {
        self.engine.response_state(id)?;
        self.engine.cork(id.conn);
        let result = f(&mut HttpResponse::new(&mut self.engine, id));
        self.engine.uncork(id.conn);
        self.drain();
        Ok(result)
    }

    /// Reach a WebSocket session outside its callbacks
    pub fn with_websocket<U: 'static, R>(
        &mut self,
        id: SocketId,
        f: impl FnOnce(&mut WebSocket<'_, U>) -> R,
    ) -> Result<R> {
        let conn = id.connection();
        if !self.engine.session_open(conn) {
            return Err(Error::SessionClosed);
        }
        self.engine.cork(conn);
        let result = f(&mut WebSocket::new(&mut self.engine, conn));
        self.engine.uncork(conn);
        self.drain();
        Ok(result)
    }

    pub fn stats(&self) -> AppStats {
        self.engine.stats
    }

    /// Connection is still known to the engine
    pub fn is_connected(&self, id: ConnId) -> bool {
        self.engine.conns.contains(id)
    }

    pub fn connection_count(&self) -> usize {
        self.engine.conns.len()
    }

    /// Drop every connection, as if each peer had gone away
    pub fn close_all(&mut self) {
        for id in self.engine.conns.ids() {
            self.engine.close_connection(id);
        }
        self.drain();
    }

    /// Connection has bytes waiting for the socket to become writable
    pub fn wants_writable(&self, id: ConnId) -> bool {
        self.engine.conns.get(id).is_some_and(|c| c.io.wants_writable())
    }

    /// A socket was accepted
    pub fn on_open(
        &mut self,
        socket: Box<dyn Socket>,
        remote: Option<SocketAddr>,
        tls: Option<Box<dyn TlsSession>>,
    ) -> Result<ConnId> {
        let id = self.engine.open(socket, tls, remote)?;
        self.drain();
        Ok(id)
    }

    /// Bytes arrived from the peer
    pub fn on_data(&mut self, id: ConnId, data: &[u8]) {
        let Some(conn) = self.engine.conns.get_mut(id) else {
            return;
        };
        let Connection { io, inbound, .. } = conn;
        if let Err(e) = io.receive(data, inbound) {
            debug!(conn = %id, error = %e, "tls read failed");
            self.engine.close_connection(id);
        } else {
            self.engine.settle(id);
            self.engine.wake(id);
        }
        self.drain();
        self.engine.enforce_inbound_limit(id);
        self.drain();
    }

    /// Bytes the reactor may read for `id` before its unconsumed input hits
    /// `max_inbound_buffer`; zero means stop reading until
    /// [`Socket::resume_reading`]
    pub fn inbound_room(&self, id: ConnId) -> usize {
        self.engine.inbound_room(id)
    }

    /// The socket can take more bytes
    pub fn on_writable(&mut self, id: ConnId) {
        self.engine.cork(id);
        self.engine.writable(id);
        self.engine.uncork(id);
        self.drain();
    }

    /// The peer went away or the socket failed
    pub fn on_close(&mut self, id: ConnId) {
        self.engine.close_connection(id);
        self.drain();
    }

    /// Timer tick; call every `limits().timer_granularity`
    pub fn on_timer(&mut self, now: Instant) {
        self.engine.tick(now);
        self.drain();
    }

    /// Run every connection that has work queued
    fn drain(&mut self) {
        while let Some(id) = self.engine.next_wakeup() {
            self.process(id);
        }
    }

    fn process(&mut self, id: ConnId) {
        let was_full = self.engine.inbound_room(id) == 0;
        self.process_input(id);
        if was_full && self.engine.inbound_room(id) > 0 {
            if let Some(conn) = self.engine.conns.get_mut(id) {
                conn.io.resume_reading();
            }
        }
    }

    fn process_input(&mut self, id: ConnId) {
        self.engine.settle(id);
        loop {
            let Some(conn) = self.engine.conns.get_mut(id) else {
                return;
            };
            let http = match &conn.mode {
                Mode::Closing => {
                    conn.inbound.clear();
                    return;
                }
                Mode::WebSocket(_) => {
                    self.engine.cork(id);
                    self.engine.ws_process(id);
                    self.engine.uncork(id);
                    return;
                }
                Mode::Http(http) => http,
            };

            if http.body.is_some() {
                if !self.engine.deliver_body(id) {
                    return;
                }
                continue;
            }
            if http.response.is_some() || conn.inbound.is_empty() {
                return;
            }

            let limits = &self.engine.limits;
            match parse_head(&conn.inbound, limits.max_header_size, limits.max_headers) {
                ParseResult::Complete(head, consumed) => {
                    conn.inbound.advance(consumed);
                    self.dispatch(id, head);
                }
                ParseResult::Incomplete => return,
                ParseResult::Error(e) => {
                    self.engine.http_protocol_error(id, e);
                    return;
                }
            }
        }
    }

    /// Route one request, falling through on yield
    fn dispatch(&mut self, id: ConnId, head: RequestHead) {
        let Ok(rid) = self.engine.begin_response(id, &head) else {
            return;
        };
        trace!(conn = %id, method = %head.method, target = %head.target, "request");

        self.engine.cork(id);
        let mut handled = false;
        for candidate in self.router.candidates(&head.method, head.path()) {
            let Some(route) = self.routes.get(candidate.handler_id as usize).cloned() else {
                continue;
            };
            let mut req = HttpRequest::new(&head, &candidate.params);
            let mut res = HttpResponse::new(&mut self.engine, rid);
            let result = match &route {
                Route::Http(handler) => handler(&mut res, &mut req),
                Route::WebSocket(upgrade) => upgrade.upgrade(&mut res, &mut req),
            };
            if let Err(e) = result {
                self.engine.fail_response(rid, e);
                handled = true;
                break;
            }
            if !req.get_yield() {
                handled = true;
                break;
            }
        }
        if !handled {
            self.not_found(rid);
        }
        self.engine.uncork(id);

        let Ok(state) = self.engine.response_state(rid) else {
            return;
        };
        if !state.has_abort_handler() {
            error!(conn = %id, target = %head.target, error = %Error::MissingAbortHandler, "closing connection");
            self.engine.stats.missing_abort_handlers += 1;
            self.engine.close_connection(id);
        } else if head.body == BodyKind::None {
            self.engine.call_on_data(rid, &[], true);
        }
    }

    fn not_found(&mut self, rid: ResponseId) {
        let mut res = HttpResponse::new(&mut self.engine, rid);
        let sent = res.write_status("404 File Not Found").and_then(|res| res.end(b""));
        if sent.is_err() {
            self.engine.close_connection(rid.connection());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemorySocket;
    use crate::response::ResponseCallbacks;
    use std::cell::RefCell;

    fn open(app: &mut App) -> (ConnId, MemorySocket) {
        let socket = MemorySocket::new();
        let id = app.on_open(Box::new(socket.clone()), None, None).unwrap();
        (id, socket)
    }

    fn output(socket: &MemorySocket) -> String {
        String::from_utf8(socket.take_output()).unwrap()
    }

    #[test]
    fn test_duplicate_route() {
        let mut app = App::new();
        app.get("/a", |res, _| res.end(b"")).unwrap();
        let err = app.get("/a", |res, _| res.end(b"")).err().unwrap();
        assert!(matches!(err, Error::DuplicateRoute { .. }));
        assert!(app.post("/a", |res, _| res.end(b"")).is_ok());
    }

    #[test]
    fn test_not_found() {
        let mut app = App::new();
        let (id, socket) = open(&mut app);
        app.on_data(id, b"GET /missing HTTP/1.1\r\n\r\n");
        assert!(output(&socket).starts_with("HTTP/1.1 404 File Not Found\r\n"));
        assert!(app.is_connected(id));
    }

    #[test]
    fn test_yield_falls_through() {
        let mut app = App::new();
        app.get("/users/:id", |_, req| {
            req.set_yield(true);
            Ok(())
        })
        .unwrap();
        app.any("/users/*", |res, req| {
            let body = format!("any {}", req.parameter(0).unwrap_or(""));
            res.end(body.as_bytes())
        })
        .unwrap();

        let (id, socket) = open(&mut app);
        app.on_data(id, b"GET /users/42 HTTP/1.1\r\n\r\n");
        assert!(output(&socket).ends_with("any 42"));
    }

    #[test]
    fn test_handler_error_answers_500() {
        let mut app = App::new();
        app.get("/boom", |_, _| Err(Error::Handler("boom".to_string()))).unwrap();
        let (id, socket) = open(&mut app);
        app.on_data(id, b"GET /boom HTTP/1.1\r\n\r\n");
        let out = output(&socket);
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(!app.is_connected(id));
    }

    #[test]
    fn test_missing_abort_handler_closes() {
        let mut app = App::new();
        app.get("/forgot", |_, _| Ok(())).unwrap();
        let (id, socket) = open(&mut app);
        app.on_data(id, b"GET /forgot HTTP/1.1\r\n\r\n");
        assert!(!app.is_connected(id));
        assert!(socket.is_shutdown());
        assert_eq!(app.stats().missing_abort_handlers, 1);
    }

    #[test]
    fn test_deferred_response_via_cork() {
        let mut app = App::new();
        let pending = Rc::new(RefCell::new(None));
        let slot = pending.clone();
        app.get("/later", move |res, _| {
            res.attach(ResponseCallbacks::new().on_aborted(|| {}))?;
            *slot.borrow_mut() = Some(res.id());
            Ok(())
        })
        .unwrap();

        let (id, socket) = open(&mut app);
        app.on_data(id, b"GET /later HTTP/1.1\r\n\r\n");
        assert!(socket.take_output().is_empty());

        let rid = pending.borrow().unwrap();
        app.cork(rid, |res| res.end(b"done")).unwrap().unwrap();
        assert!(output(&socket).ends_with("done"));
        assert!(matches!(app.cork(rid, |_| ()), Err(Error::ResponseEnded)));
    }

    #[test]
    fn test_pipelined_requests() {
        let mut app = App::new();
        app.get("/:n", |res, req| {
            let body = req.param("n").unwrap_or("").to_string();
            res.end(body.as_bytes())
        })
        .unwrap();

        let (id, socket) = open(&mut app);
        app.on_data(id, b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n");
        let out = output(&socket);
        let first = out.find("\r\n\r\n1").unwrap();
        let second = out.find("\r\n\r\n2").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_malformed_request() {
        let mut app = App::new();
        let (id, socket) = open(&mut app);
        app.on_data(id, b"NOT A REQUEST\r\n\r\n");
        assert!(output(&socket).starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(!app.is_connected(id));
        assert_eq!(app.stats().protocol_errors, 1);
    }

    #[test]
    fn test_plain_get_on_ws_route_falls_through() {
        let mut app = App::new();
        app.ws("/chat", WebSocketBehavior::<()>::new()).unwrap();
        app.any("/*", |res, _| res.end(b"fallback")).unwrap();
        let (id, socket) = open(&mut app);
        app.on_data(id, b"GET /chat HTTP/1.1\r\n\r\n");
        assert!(output(&socket).ends_with("fallback"));
    }

    #[test]
    fn test_bad_websocket_version() {
        let mut app = App::new();
        app.ws("/chat", WebSocketBehavior::<()>::new()).unwrap();
        let (id, socket) = open(&mut app);
        app.on_data(
            id,
            b"GET /chat HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n",
        );
        let out = output(&socket);
        assert!(out.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
        assert!(out.contains("Sec-WebSocket-Version: 13\r\n"));
    }
}
