//! Connection engine: lifecycle, body delivery, writability and timers
//!
//! The engine owns every connection and the topic registry. It never blocks
//! and never touches the network directly; the reactor feeds it events
//! through [`App`](crate::App) and it writes through each connection's
//! [`Socket`].
//!
//! Closing comes in two flavours:
//! - forced ([`Engine::close_connection`]): the socket is shut down now, an
//!   in-flight response sees `on_aborted`, a live WebSocket sees `close(1006)`
//! - graceful ([`Engine::close_gracefully`]): the connection enters `Closing`
//!   and is shut down once its queued bytes have drained

use crate::config::EngineLimits;
use crate::connection::{Connection, ConnId, HttpState, Mode, ResponseId, Slab, Socket, TlsSession, Transport};
use crate::parser::{BodyDecoder, BodyKind, RequestHead};
use crate::pubsub::TopicRegistry;
use crate::response::{HttpResponse, ResponseState};
use crate::{Error, ProtocolError, Result};
use bytes::Buf;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, warn};

/// Connection open (+1) / close (-1) notification
pub type FilterHandler = Rc<dyn Fn(ConnId, Option<SocketAddr>, i32)>;

/// Counters exposed through `App::stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppStats {
    pub open_connections: usize,
    pub open_sessions: usize,
    /// Responses left neither ended nor guarded by `on_aborted`
    pub missing_abort_handlers: u64,
    pub protocol_errors: u64,
    /// WebSocket sends discarded over `max_backpressure`
    pub dropped_messages: u64,
}

pub(crate) struct Engine {
    pub(crate) conns: Slab<Connection>,
    pub(crate) topics: TopicRegistry,
    pub(crate) limits: EngineLimits,
    pub(crate) stats: AppStats,
    pub(crate) now: Instant,
    pub(crate) filter: Option<FilterHandler>,
    /// Connections with buffered input or state to re-examine
    pub(crate) wakeups: VecDeque<ConnId>,
}

impl Engine {
    pub(crate) fn new(limits: EngineLimits) -> Self {
        Self {
            conns: Slab::new(),
            topics: TopicRegistry::default(),
            limits,
            stats: AppStats::default(),
            now: Instant::now(),
            filter: None,
            wakeups: VecDeque::new(),
        }
    }

    pub(crate) fn open(
        &mut self,
        mut socket: Box<dyn Socket>,
        tls: Option<Box<dyn TlsSession>>,
        remote: Option<SocketAddr>,
    ) -> Result<ConnId> {
        if self.conns.len() >= self.limits.max_connections {
            socket.shutdown();
            warn!(limit = self.limits.max_connections, "connection refused, limit reached");
            return Err(Error::ResourceExhausted("connection limit reached".to_string()));
        }

        let io = Transport::new(socket, tls, self.limits.cork_buffer_size);
        let id = self.conns.insert(Connection::new(io, remote, self.now));
        self.stats.open_connections = self.conns.len();
        debug!(conn = %id, remote = ?remote, "connection opened");

        if let Some(filter) = self.filter.clone() {
            filter(id, remote, 1);
        }
        Ok(id)
    }

    pub(crate) fn wake(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if !conn.queued {
            conn.queued = true;
            self.wakeups.push_back(id);
        }
    }

    /// Next queued connection; ids of connections closed meanwhile are skipped
    pub(crate) fn next_wakeup(&mut self) -> Option<ConnId> {
        while let Some(id) = self.wakeups.pop_front() {
            if let Some(conn) = self.conns.get_mut(id) {
                conn.queued = false;
                return Some(id);
            }
        }
        None
    }

    pub(crate) fn cork(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(id) {
            conn.io.cork();
        }
    }

    pub(crate) fn uncork(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(id) {
            conn.io.uncork();
        }
        self.settle(id);
    }

    /// A write just happened outside a cork scope; look at the connection
    /// again once the current callback has returned.
    pub(crate) fn note_write(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(id) else {
            return;
        };
        if conn.io.is_broken() || matches!(conn.mode, Mode::Closing) {
            self.wake(id);
        }
    }

    /// Drop a connection whose socket broke, finish one that is closing
    pub(crate) fn settle(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(id) else {
            return;
        };
        if conn.io.is_broken() {
            debug!(conn = %id, "socket broken");
            self.close_connection(id);
        } else if matches!(conn.mode, Mode::Closing) && !conn.io.is_corked() && conn.io.is_drained() {
            self.finalize(id);
        }
    }

    /// Close now: aborts an in-flight response, reports 1006 to a live session
    pub(crate) fn close_connection(&mut self, id: ConnId) {
        let live_session = match self.conns.get(id).map(|c| &c.mode) {
            Some(Mode::WebSocket(session)) => !session.closed,
            Some(_) => false,
            None => return,
        };
        if live_session {
            self.ws_finish(id, 1006, b"");
        }
        self.finalize(id);
    }

    /// Room left under `max_inbound_buffer`; WebSocket input is bounded by
    /// `max_payload_length` instead
    pub(crate) fn inbound_room(&self, id: ConnId) -> usize {
        match self.conns.get(id) {
            Some(conn) if matches!(conn.mode, Mode::Http(_)) => {
                self.limits.max_inbound_buffer.saturating_sub(conn.inbound.len())
            }
            Some(_) => usize::MAX,
            None => 0,
        }
    }

    /// Close an HTTP connection whose unconsumed input grew past the limit
    pub(crate) fn enforce_inbound_limit(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(id) else {
            return;
        };
        let buffered = conn.inbound.len();
        if !matches!(conn.mode, Mode::Http(_)) || buffered <= self.limits.max_inbound_buffer {
            return;
        }
        warn!(conn = %id, buffered, limit = self.limits.max_inbound_buffer, "inbound buffer limit exceeded");
        self.close_connection(id);
    }

    /// Close after queued bytes are flushed
    pub(crate) fn close_gracefully(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        if let Mode::Http(http) = std::mem::replace(&mut conn.mode, Mode::Closing) {
            fire_abort(id, http);
        }
        conn.inbound.clear();
        conn.last_activity = self.now;
        self.settle(id);
    }

    fn finalize(&mut self, id: ConnId) {
        let Some(mut conn) = self.conns.remove(id) else {
            return;
        };
        conn.io.shutdown();
        self.stats.open_connections = self.conns.len();

        match std::mem::replace(&mut conn.mode, Mode::Closing) {
            Mode::Http(http) => fire_abort(id, http),
            Mode::WebSocket(session) if !session.closed => {
                // Sessions are finished before removal; keep the count honest anyway
                self.stats.open_sessions = self.stats.open_sessions.saturating_sub(1);
            }
            _ => {}
        }
        debug!(conn = %id, "connection closed");

        if let Some(filter) = self.filter.clone() {
            filter(id, conn.remote, -1);
        }
    }

    /// Start a new exchange for a parsed request head
    pub(crate) fn begin_response(&mut self, id: ConnId, head: &RequestHead) -> Result<ResponseId> {
        let conn = self.conns.get_mut(id).ok_or(Error::ResponseAborted)?;
        let Mode::Http(http) = &mut conn.mode else {
            return Err(Error::ResponseEnded);
        };
        let seq = http.next_seq;
        http.next_seq += 1;
        http.response = Some(ResponseState::new(seq, head));
        http.body = match head.body {
            BodyKind::None => None,
            BodyKind::Length(n) => Some(BodyDecoder::length(n)),
            BodyKind::Chunked => Some(BodyDecoder::chunked()),
        };
        conn.last_activity = self.now;
        Ok(ResponseId { conn: id, seq })
    }

    pub(crate) fn response_state(&self, id: ResponseId) -> Result<&ResponseState> {
        let conn = self.conns.get(id.conn).ok_or(Error::ResponseAborted)?;
        match &conn.mode {
            Mode::Http(HttpState { response: Some(state), .. }) if state.seq == id.seq => Ok(state),
            _ => Err(Error::ResponseEnded),
        }
    }

    fn response_state_mut(&mut self, id: ResponseId) -> Option<&mut ResponseState> {
        match &mut self.conns.get_mut(id.conn)?.mode {
            Mode::Http(HttpState { response: Some(state), .. }) if state.seq == id.seq => Some(state),
            _ => None,
        }
    }

    /// Id of the in-flight response on a connection
    pub(crate) fn current_response(&self, id: ConnId) -> Option<ResponseId> {
        match &self.conns.get(id)?.mode {
            Mode::Http(HttpState { response: Some(state), .. }) => Some(ResponseId { conn: id, seq: state.seq }),
            _ => None,
        }
    }

    /// Reject a request the parser could not accept
    pub(crate) fn http_protocol_error(&mut self, id: ConnId, err: ProtocolError) {
        self.stats.protocol_errors += 1;
        debug!(conn = %id, error = %err, "http protocol error");

        let in_flight = self.current_response(id).is_some();
        if in_flight {
            self.close_connection(id);
            return;
        }
        if let Some(conn) = self.conns.get_mut(id) {
            let reply = format!(
                "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
                err.status_line()
            );
            conn.io.write(reply.as_bytes());
        }
        self.close_gracefully(id);
    }

    /// Feed buffered body bytes to the current response
    ///
    /// Returns false when more input is needed (or the connection is gone).
    pub(crate) fn deliver_body(&mut self, id: ConnId) -> bool {
        let Some(conn) = self.conns.get_mut(id) else {
            return false;
        };
        let Mode::Http(http) = &mut conn.mode else {
            return false;
        };
        let (Some(decoder), false) = (http.body.as_mut(), http.paused) else {
            return false;
        };

        let mut chunk = Vec::new();
        let consumed = match decoder.decode(&conn.inbound, &mut chunk) {
            Ok(n) => n,
            Err(e) => {
                self.http_protocol_error(id, e);
                return false;
            }
        };
        conn.inbound.advance(consumed);
        let last = decoder.is_done();
        if last {
            http.body = None;
        }
        if chunk.is_empty() && !last {
            return false;
        }
        conn.last_activity = self.now;

        let seq = http.response.as_ref().map(|state| state.seq);
        if let Some(seq) = seq {
            self.call_on_data(ResponseId { conn: id, seq }, &chunk, last);
        }
        true
    }

    pub(crate) fn call_on_data(&mut self, id: ResponseId, chunk: &[u8], last: bool) {
        let Some(mut on_data) = self.response_state_mut(id).and_then(|s| s.callbacks.on_data.take()) else {
            return;
        };
        let result = on_data(&mut HttpResponse::new(self, id), chunk, last);
        if let Some(state) = self.response_state_mut(id) {
            if state.callbacks.on_data.is_none() {
                state.callbacks.on_data = Some(on_data);
            }
        }
        if let Err(e) = result {
            self.fail_response(id, e);
        }
    }

    /// A handler or callback failed: answer 500 if nothing was sent, else abort
    pub(crate) fn fail_response(&mut self, id: ResponseId, err: Error) {
        warn!(conn = %id.conn, error = %err, "handler failed");
        let untouched = match self.response_state(id) {
            Ok(state) => state.is_untouched(),
            Err(_) => return,
        };
        if untouched {
            let mut res = HttpResponse::new(self, id);
            if res.write_status("500 Internal Server Error").is_ok() && res.end_with(b"", true).is_ok() {
                return;
            }
        }
        self.close_connection(id.conn);
    }

    /// The socket can take more bytes
    pub(crate) fn writable(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else {
            return;
        };
        let drained = conn.io.flush();
        if conn.io.is_broken() {
            self.close_connection(id);
            return;
        }

        match &mut conn.mode {
            Mode::Closing => {}
            Mode::Http(http) => {
                let seq = http.response.as_ref().map(|state| state.seq);
                if let Some(seq) = seq {
                    self.call_on_writable(ResponseId { conn: id, seq });
                }
            }
            Mode::WebSocket(session) => {
                if drained && session.drain_pending {
                    session.drain_pending = false;
                    let handler = session.handler.clone();
                    handler.drain(self, id);
                }
            }
        }
        self.settle(id);
    }

    fn call_on_writable(&mut self, id: ResponseId) {
        let Some(state) = self.response_state_mut(id) else {
            return;
        };
        let offset = state.write_offset;
        let Some(mut on_writable) = state.callbacks.on_writable.take() else {
            return;
        };
        let result = on_writable(&mut HttpResponse::new(self, id), offset);
        if let Some(state) = self.response_state_mut(id) {
            if state.callbacks.on_writable.is_none() {
                state.callbacks.on_writable = Some(on_writable);
            }
        }
        if let Err(e) = result {
            self.fail_response(id, e);
        }
    }

    /// Periodic sweep: HTTP idle timeouts, WebSocket idle/lifetime, stragglers
    pub(crate) fn tick(&mut self, now: Instant) {
        self.now = now;
        let http_timeout = self.limits.http_idle_timeout;

        for id in self.conns.ids() {
            let Some(conn) = self.conns.get(id) else {
                continue;
            };
            let idle = now.saturating_duration_since(conn.last_activity);
            match &conn.mode {
                Mode::Http(http) => {
                    let waiting_on_peer = http.response.is_none() || http.body.is_some();
                    if waiting_on_peer && idle >= http_timeout {
                        debug!(conn = %id, "http idle timeout");
                        self.close_connection(id);
                    }
                }
                Mode::Closing => {
                    if idle >= http_timeout {
                        debug!(conn = %id, "closing connection did not drain");
                        self.finalize(id);
                    }
                }
                Mode::WebSocket(_) => self.ws_tick(id, now),
            }
        }
    }
}

fn fire_abort(id: ConnId, mut http: HttpState) {
    let Some(state) = http.response.as_mut() else {
        return;
    };
    if let Some(on_aborted) = state.callbacks.on_aborted.take() {
        debug!(conn = %id, "response aborted");
        on_aborted();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemorySocket;
    use std::cell::RefCell;
    use std::time::Duration;

    #[test]
    fn test_open_and_close_counts() {
        let mut engine = Engine::new(EngineLimits::default());
        let events = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();
        engine.filter = Some(Rc::new(move |_, _, delta| log.borrow_mut().push(delta)));

        let socket = MemorySocket::new();
        let id = engine.open(Box::new(socket.clone()), None, None).unwrap();
        assert_eq!(engine.stats.open_connections, 1);

        engine.close_connection(id);
        assert!(socket.is_shutdown());
        assert_eq!(engine.stats.open_connections, 0);
        assert_eq!(*events.borrow(), vec![1, -1]);

        // Stale handles are ignored
        engine.close_connection(id);
        assert_eq!(*events.borrow(), vec![1, -1]);
    }

    #[test]
    fn test_connection_limit() {
        let mut engine = Engine::new(EngineLimits::default().max_connections(1));
        engine.open(Box::new(MemorySocket::new()), None, None).unwrap();
        let refused = MemorySocket::new();
        let err = engine.open(Box::new(refused.clone()), None, None).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        assert!(refused.is_shutdown());
    }

    #[test]
    fn test_graceful_close_waits_for_drain() {
        let mut engine = Engine::new(EngineLimits::default());
        let socket = MemorySocket::with_capacity(2);
        let id = engine.open(Box::new(socket.clone()), None, None).unwrap();

        engine.conns.get_mut(id).unwrap().io.write(b"goodbye");
        engine.close_gracefully(id);
        assert!(!socket.is_shutdown());

        socket.grant(100);
        engine.writable(id);
        assert!(socket.is_shutdown());
        assert_eq!(socket.take_output(), b"goodbye");
        assert!(!engine.conns.contains(id));
    }

    #[test]
    fn test_http_idle_timeout() {
        let mut engine = Engine::new(EngineLimits::default());
        let socket = MemorySocket::new();
        let id = engine.open(Box::new(socket.clone()), None, None).unwrap();
        let start = engine.now;

        engine.tick(start + Duration::from_secs(4));
        assert!(engine.conns.contains(id));
        engine.tick(start + Duration::from_secs(12));
        assert!(!engine.conns.contains(id));
        assert!(socket.is_shutdown());
    }

    #[test]
    fn test_protocol_error_reply() {
        let mut engine = Engine::new(EngineLimits::default());
        let socket = MemorySocket::new();
        let id = engine.open(Box::new(socket.clone()), None, None).unwrap();
        engine.http_protocol_error(id, ProtocolError::HeadersTooLarge);

        let out = String::from_utf8(socket.take_output()).unwrap();
        assert!(out.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
        assert!(socket.is_shutdown());
        assert_eq!(engine.stats.protocol_errors, 1);
    }

    #[test]
    fn test_wake_queues_each_connection_once() {
        let mut engine = Engine::new(EngineLimits::default());
        let first = engine.open(Box::new(MemorySocket::new()), None, None).unwrap();
        let second = engine.open(Box::new(MemorySocket::new()), None, None).unwrap();

        engine.wake(first);
        engine.wake(second);
        engine.wake(first);
        assert_eq!(engine.wakeups.len(), 2);

        assert_eq!(engine.next_wakeup(), Some(first));
        engine.wake(first);
        assert_eq!(engine.next_wakeup(), Some(second));
        assert_eq!(engine.next_wakeup(), Some(first));
        assert_eq!(engine.next_wakeup(), None);

        // Closed connections leave their id behind; it is skipped
        engine.wake(second);
        engine.close_connection(second);
        assert_eq!(engine.next_wakeup(), None);
    }

    #[test]
    fn test_inbound_limit_applies_to_http() {
        let mut engine = Engine::new(EngineLimits::default().max_inbound_buffer(8));
        let socket = MemorySocket::new();
        let id = engine.open(Box::new(socket.clone()), None, None).unwrap();

        engine.conns.get_mut(id).unwrap().inbound.extend_from_slice(b"12345678");
        assert_eq!(engine.inbound_room(id), 0);
        engine.enforce_inbound_limit(id);
        assert!(engine.conns.contains(id));

        engine.conns.get_mut(id).unwrap().inbound.extend_from_slice(b"9");
        engine.enforce_inbound_limit(id);
        assert!(!engine.conns.contains(id));
        assert!(socket.is_shutdown());
        assert_eq!(engine.inbound_room(id), 0);
    }
}
