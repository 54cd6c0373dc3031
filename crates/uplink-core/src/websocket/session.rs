//! WebSocket sessions: inbound frame processing, sends, close and timers
//!
//! A session replaces the HTTP state of its connection after a successful
//! upgrade. Inbound bytes are parsed frame by frame; data frames are
//! reassembled and inflated into messages, control frames are answered
//! right away. Once the close callback has run the session is inert: sends
//! fail, subscriptions are gone and the connection only waits to drain.

use crate::connection::{address_bytes, address_text, ConnId, Connection, Mode, ResponseId, SocketId};
use crate::engine::Engine;
use crate::parser::ParseResult;
use crate::websocket::behavior::{SessionHandler, SessionOptions};
use crate::websocket::deflate::{self, PerMessageDeflate};
use crate::websocket::frame::{apply_mask, close_payload, encode_frame, parse_close_payload};
use crate::websocket::handshake;
use crate::websocket::{FrameHeader, Opcode};
use crate::{Error, ProtocolError, Result};
use bytes::Buf;
use std::any::Any;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Outcome of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SendStatus {
    /// Queued, but the socket did not take everything; wait for `drain`
    Backpressure = 0,
    /// Handed to the socket
    Success = 1,
    /// Discarded because buffered data was above `max_backpressure`
    Dropped = 2,
}

/// Partially received fragmented message
struct Fragments {
    opcode: Opcode,
    compressed: bool,
    data: Vec<u8>,
}

enum Event {
    Message(Opcode, Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(u16, Vec<u8>),
}

pub(crate) struct Session {
    pub(crate) handler: Rc<dyn SessionHandler>,
    pub(crate) options: SessionOptions,
    pub(crate) user_data: Box<dyn Any>,
    /// Mirror of this session's entries in the topic registry
    pub(crate) topics: BTreeSet<String>,
    deflate: Option<PerMessageDeflate>,
    fragments: Option<Fragments>,
    /// Close callback has fired
    pub(crate) closed: bool,
    /// Automatic ping sent, waiting for any traffic
    pub(crate) pinged: bool,
    /// A send reported backpressure; `drain` fires once the backlog empties
    pub(crate) drain_pending: bool,
    opened_at: Instant,
}

impl Session {
    fn new(
        handler: Rc<dyn SessionHandler>,
        options: SessionOptions,
        user_data: Box<dyn Any>,
        deflate: Option<PerMessageDeflate>,
        now: Instant,
    ) -> Self {
        Self {
            handler,
            options,
            user_data,
            topics: BTreeSet::new(),
            deflate,
            fragments: None,
            closed: false,
            pinged: false,
            drain_pending: false,
            opened_at: now,
        }
    }

    /// Reject a frame before its payload is buffered
    fn check_header(&self, header: &FrameHeader) -> std::result::Result<Opcode, ProtocolError> {
        if header.mask.is_none() {
            return Err(ProtocolError::UnmaskedFrame);
        }
        if header.rsv2 || header.rsv3 {
            return Err(ProtocolError::ReservedBits);
        }
        let opcode = header.opcode().ok_or(ProtocolError::InvalidOpcode(header.raw_opcode))?;
        if header.rsv1 && (opcode.is_control() || opcode == Opcode::Continuation || self.deflate.is_none()) {
            return Err(ProtocolError::ReservedBits);
        }
        if opcode.is_control() {
            if !header.fin || header.payload_len > 125 {
                return Err(ProtocolError::InvalidControlFrame);
            }
            return Ok(opcode);
        }

        let buffered = self.fragments.as_ref().map_or(0, |f| f.data.len() as u64);
        let max = self.options.max_payload_length as u64;
        if (max > 0 && buffered + header.payload_len > max) || header.payload_len > isize::MAX as u64 {
            return Err(ProtocolError::PayloadTooLarge);
        }
        Ok(opcode)
    }

    /// Fold one unmasked frame into the message state
    fn absorb(
        &mut self,
        header: &FrameHeader,
        opcode: Opcode,
        payload: &[u8],
    ) -> std::result::Result<Option<Event>, ProtocolError> {
        match opcode {
            Opcode::Text | Opcode::Binary => {
                if self.fragments.is_some() {
                    return Err(ProtocolError::UnexpectedFragment);
                }
                if header.fin {
                    return self.finish_message(opcode, header.rsv1, payload.to_vec()).map(Some);
                }
                self.fragments = Some(Fragments { opcode, compressed: header.rsv1, data: payload.to_vec() });
                Ok(None)
            }
            Opcode::Continuation => {
                let fragments = self.fragments.as_mut().ok_or(ProtocolError::UnexpectedFragment)?;
                fragments.data.extend_from_slice(payload);
                if !header.fin {
                    return Ok(None);
                }
                let Some(Fragments { opcode, compressed, data }) = self.fragments.take() else {
                    return Err(ProtocolError::UnexpectedFragment);
                };
                self.finish_message(opcode, compressed, data).map(Some)
            }
            Opcode::Ping => Ok(Some(Event::Ping(payload.to_vec()))),
            Opcode::Pong => Ok(Some(Event::Pong(payload.to_vec()))),
            Opcode::Close => {
                let (code, reason) = parse_close_payload(payload)?;
                Ok(Some(Event::Close(code, reason.to_vec())))
            }
        }
    }

    fn finish_message(
        &mut self,
        opcode: Opcode,
        compressed: bool,
        data: Vec<u8>,
    ) -> std::result::Result<Event, ProtocolError> {
        let data = if compressed {
            let deflate = self.deflate.as_mut().ok_or(ProtocolError::ReservedBits)?;
            deflate.decompress(&data, self.options.max_payload_length)?
        } else {
            data
        };
        if opcode == Opcode::Text && std::str::from_utf8(&data).is_err() {
            return Err(ProtocolError::InvalidUtf8);
        }
        Ok(Event::Message(opcode, data))
    }
}

enum TimerAction {
    Lifetime,
    Timeout,
    Ping,
}

/// How long before the idle deadline an automatic ping goes out
fn ping_grace(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).min(Duration::from_secs(16))
}

impl Engine {
    /// Session is upgraded and its close callback has not fired
    pub(crate) fn session_open(&self, id: ConnId) -> bool {
        matches!(self.conns.get(id).map(|c| &c.mode), Some(Mode::WebSocket(session)) if !session.closed)
    }

    fn session_handler(&self, id: ConnId) -> Option<Rc<dyn SessionHandler>> {
        match self.conns.get(id).map(|c| &c.mode) {
            Some(Mode::WebSocket(session)) => Some(session.handler.clone()),
            _ => None,
        }
    }

    /// Answer 101 and turn the connection into a WebSocket session
    pub(crate) fn ws_upgrade(
        &mut self,
        rid: ResponseId,
        handler: Rc<dyn SessionHandler>,
        user_data: Box<dyn Any>,
        key: &str,
        protocol: &str,
        extensions: &str,
    ) -> Result<SocketId> {
        let options = handler.options();
        let now = self.now;
        let compression = {
            let conn = self.conns.get_mut(rid.conn).ok_or(Error::ResponseAborted)?;
            let Mode::Http(http) = &conn.mode else {
                return Err(Error::ResponseEnded);
            };
            match &http.response {
                Some(state) if state.seq == rid.seq => {
                    if !state.is_untouched() {
                        return Err(Error::HeadersAlreadySent);
                    }
                }
                _ => return Err(Error::ResponseEnded),
            }

            let params = deflate::negotiate(extensions, options.compression);
            let accepted = params.map(|p| p.response_header());
            conn.io.write(&handshake::switching_protocols(key, protocol, accepted.as_deref()));

            let deflate = params.map(|p| PerMessageDeflate::new(p, options.compression));
            let session = Session::new(handler.clone(), options, user_data, deflate, now);
            conn.mode = Mode::WebSocket(Box::new(session));
            conn.last_activity = now;
            accepted
        };

        self.stats.open_sessions += 1;
        debug!(conn = %rid.conn, compression = ?compression, "websocket upgraded");
        handler.open(self, rid.conn);
        // Frames may have arrived together with the handshake
        self.wake(rid.conn);
        Ok(SocketId(rid.conn))
    }

    /// Consume every complete frame in the inbound buffer
    pub(crate) fn ws_process(&mut self, id: ConnId) {
        loop {
            let now = self.now;
            let Some(conn) = self.conns.get_mut(id) else {
                return;
            };
            let Connection { mode, inbound, last_activity, .. } = conn;
            let Mode::WebSocket(session) = mode else {
                return;
            };
            if session.closed {
                inbound.clear();
                return;
            }

            let header = match FrameHeader::parse(&inbound[..]) {
                ParseResult::Complete(header, _) => header,
                ParseResult::Incomplete => return,
                ParseResult::Error(e) => return self.ws_fail(id, e),
            };
            let opcode = match session.check_header(&header) {
                Ok(opcode) => opcode,
                Err(e) => return self.ws_fail(id, e),
            };
            let total = header.header_len + header.payload_len as usize;
            if inbound.len() < total {
                return;
            }

            let mut payload = inbound.split_to(total);
            payload.advance(header.header_len);
            if let Some(mask) = header.mask {
                apply_mask(&mut payload, mask);
            }
            *last_activity = now;
            session.pinged = false;

            match session.absorb(&header, opcode, &payload) {
                Ok(Some(event)) => self.ws_event(id, event),
                Ok(None) => {}
                Err(e) => return self.ws_fail(id, e),
            }
        }
    }

    fn ws_event(&mut self, id: ConnId, event: Event) {
        let Some(handler) = self.session_handler(id) else {
            return;
        };
        match event {
            Event::Message(opcode, data) => {
                trace!(conn = %id, ?opcode, len = data.len(), "websocket message");
                handler.message(self, id, &data, opcode);
            }
            Event::Ping(payload) => {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.io.write(&encode_frame(Opcode::Pong, &payload, true, false));
                }
                handler.ping(self, id, &payload);
            }
            Event::Pong(payload) => handler.pong(self, id, &payload),
            Event::Close(code, reason) => {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.io.write(&encode_frame(Opcode::Close, &close_payload(code, b""), true, false));
                }
                self.ws_finish(id, code, &reason);
                self.close_gracefully(id);
            }
        }
    }

    fn ws_fail(&mut self, id: ConnId, err: ProtocolError) {
        self.stats.protocol_errors += 1;
        debug!(conn = %id, error = %err, "websocket protocol error");
        let _ = self.ws_end(id, err.close_code(), b"");
    }

    /// Send one frame (a whole message when `fin`), honoring backpressure
    pub(crate) fn ws_send(
        &mut self,
        id: ConnId,
        payload: &[u8],
        opcode: Opcode,
        compress: bool,
        fin: bool,
    ) -> Result<SendStatus> {
        let now = self.now;
        let over_limit = {
            let conn = self.conns.get(id).ok_or(Error::SessionClosed)?;
            let Mode::WebSocket(session) = &conn.mode else {
                return Err(Error::SessionClosed);
            };
            if session.closed {
                return Err(Error::SessionClosed);
            }
            if opcode.is_control() && payload.len() > 125 {
                return Err(ProtocolError::InvalidControlFrame.into());
            }
            let limit = session.options.max_backpressure;
            let buffered = conn.io.buffered_amount();
            (limit > 0 && buffered > limit).then_some((buffered, session.options.close_on_backpressure_limit))
        };

        if let Some((buffered, close)) = over_limit {
            self.stats.dropped_messages += 1;
            debug!(conn = %id, buffered, "send dropped over max_backpressure");
            if close {
                self.close_connection(id);
            }
            return Ok(SendStatus::Dropped);
        }

        let status = {
            let Some(conn) = self.conns.get_mut(id) else {
                return Err(Error::SessionClosed);
            };
            let Connection { io, mode, last_activity, .. } = conn;
            let Mode::WebSocket(session) = mode else {
                return Err(Error::SessionClosed);
            };

            let wants_deflate = compress && fin && !payload.is_empty() && matches!(opcode, Opcode::Text | Opcode::Binary);
            let compressed = match session.deflate.as_mut() {
                Some(deflate) if wants_deflate && deflate.compresses() => deflate.compress(payload).ok(),
                _ => None,
            };
            match &compressed {
                Some(data) => io.write(&encode_frame(opcode, data, true, true)),
                None => io.write(&encode_frame(opcode, payload, fin, false)),
            }

            if session.options.reset_idle_timeout_on_send {
                *last_activity = now;
            }
            if io.has_backlog() {
                session.drain_pending = true;
                SendStatus::Backpressure
            } else {
                SendStatus::Success
            }
        };
        self.note_write(id);
        Ok(status)
    }

    /// Graceful close: send a close frame, fire `close`, shut down after drain
    pub(crate) fn ws_end(&mut self, id: ConnId, code: u16, reason: &[u8]) -> Result<()> {
        let Some(conn) = self.conns.get_mut(id) else {
            return Err(Error::SessionClosed);
        };
        match &conn.mode {
            Mode::WebSocket(session) if !session.closed => {}
            _ => return Err(Error::SessionClosed),
        }
        let payload = close_payload(code, reason);
        conn.io.write(&encode_frame(Opcode::Close, &payload, true, false));

        // What the peer will see
        let (code, reason) = match payload.len() {
            0 => (1005, &[][..]),
            _ => (code, &payload[2..]),
        };
        self.ws_finish(id, code, reason);
        self.close_gracefully(id);
        Ok(())
    }

    /// Abrupt close: no close frame, `close` fires with 1006
    pub(crate) fn ws_close(&mut self, id: ConnId) -> Result<()> {
        if !self.session_open(id) {
            return Err(Error::SessionClosed);
        }
        self.close_connection(id);
        Ok(())
    }

    /// Fire `close` exactly once, then drop every subscription
    pub(crate) fn ws_finish(&mut self, id: ConnId, code: u16, reason: &[u8]) {
        let handler = match self.conns.get_mut(id).map(|c| &mut c.mode) {
            Some(Mode::WebSocket(session)) if !session.closed => {
                session.closed = true;
                session.fragments = None;
                session.handler.clone()
            }
            _ => return,
        };
        self.stats.open_sessions = self.stats.open_sessions.saturating_sub(1);
        debug!(conn = %id, code, "websocket closed");
        handler.close(self, id, code, reason);

        let topics: Vec<String> = match self.conns.get(id).map(|c| &c.mode) {
            Some(Mode::WebSocket(session)) => session.topics.iter().cloned().collect(),
            _ => Vec::new(),
        };
        for topic in topics {
            self.unsubscribe(id, &topic);
        }
    }

    /// Idle timeout, automatic ping and lifetime limit of one session
    pub(crate) fn ws_tick(&mut self, id: ConnId, now: Instant) {
        let action = {
            let Some(conn) = self.conns.get(id) else {
                return;
            };
            let Mode::WebSocket(session) = &conn.mode else {
                return;
            };
            if session.closed {
                return;
            }
            let options = session.options;
            let idle = now.saturating_duration_since(conn.last_activity);
            let age = now.saturating_duration_since(session.opened_at);

            if !options.max_lifetime.is_zero() && age >= options.max_lifetime {
                Some(TimerAction::Lifetime)
            } else if options.idle_timeout.is_zero() {
                None
            } else if idle >= options.idle_timeout {
                Some(TimerAction::Timeout)
            } else if options.send_pings_automatically
                && !session.pinged
                && idle >= options.idle_timeout - ping_grace(options.idle_timeout)
            {
                Some(TimerAction::Ping)
            } else {
                None
            }
        };

        match action {
            Some(TimerAction::Lifetime) => {
                debug!(conn = %id, "websocket lifetime reached");
                let _ = self.ws_end(id, 1001, b"");
            }
            Some(TimerAction::Timeout) => {
                debug!(conn = %id, "websocket idle timeout");
                self.close_connection(id);
            }
            Some(TimerAction::Ping) => {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.io.write(&encode_frame(Opcode::Ping, b"", true, false));
                    if let Mode::WebSocket(session) = &mut conn.mode {
                        session.pinged = true;
                    }
                }
                self.note_write(id);
            }
            None => {}
        }
    }
}

/// A WebSocket session as seen from its callbacks
///
/// Like [`HttpResponse`](crate::HttpResponse) this is a short-lived view.
/// Keep the [`SocketId`] and reach the session again through
/// `App::with_websocket`.
pub struct WebSocket<'a, U> {
    engine: &'a mut Engine,
    id: ConnId,
    _user: PhantomData<fn() -> U>,
}

impl<'a, U: 'static> WebSocket<'a, U> {
    pub(crate) fn new(engine: &'a mut Engine, id: ConnId) -> Self {
        Self { engine, id, _user: PhantomData }
    }

    pub fn id(&self) -> SocketId {
        SocketId(self.id)
    }

    /// Close callback has not fired yet
    pub fn is_open(&self) -> bool {
        self.engine.session_open(self.id)
    }

    /// Send a whole message
    pub fn send(&mut self, message: &[u8], opcode: Opcode, compress: bool) -> Result<SendStatus> {
        self.engine.ws_send(self.id, message, opcode, compress, true)
    }

    /// Send one frame; `compress` only applies to a whole message (`fin` set)
    pub fn send_with(&mut self, payload: &[u8], opcode: Opcode, compress: bool, fin: bool) -> Result<SendStatus> {
        self.engine.ws_send(self.id, payload, opcode, compress, fin)
    }

    pub fn send_text(&mut self, message: &str) -> Result<SendStatus> {
        self.send(message.as_bytes(), Opcode::Text, false)
    }

    /// Start a fragmented message; never compressed
    pub fn send_first_fragment(&mut self, fragment: &[u8], opcode: Opcode) -> Result<SendStatus> {
        self.engine.ws_send(self.id, fragment, opcode, false, false)
    }

    pub fn send_fragment(&mut self, fragment: &[u8]) -> Result<SendStatus> {
        self.engine.ws_send(self.id, fragment, Opcode::Continuation, false, false)
    }

    pub fn send_last_fragment(&mut self, fragment: &[u8]) -> Result<SendStatus> {
        self.engine.ws_send(self.id, fragment, Opcode::Continuation, false, true)
    }

    pub fn ping(&mut self, payload: &[u8]) -> Result<SendStatus> {
        self.engine.ws_send(self.id, payload, Opcode::Ping, false, true)
    }

    /// Graceful close with a status code (0 sends an empty close frame)
    pub fn end(&mut self, code: u16, reason: &[u8]) -> Result<()> {
        self.engine.ws_end(self.id, code, reason)
    }

    /// Abrupt close without a close frame
    pub fn close(&mut self) -> Result<()> {
        self.engine.ws_close(self.id)
    }

    /// Returns false once the session is closed
    pub fn subscribe(&mut self, topic: &str) -> bool {
        self.engine.subscribe(self.id, topic)
    }

    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        self.engine.unsubscribe(self.id, topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.engine.topics.is_subscribed(topic, self.id)
    }

    /// Topics this session is subscribed to, sorted
    pub fn topics(&self) -> Vec<String> {
        match self.engine.conns.get(self.id).map(|c| &c.mode) {
            Some(Mode::WebSocket(session)) => session.topics.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Publish to every subscriber of `topic` except this session
    pub fn publish(&mut self, topic: &str, message: &[u8], opcode: Opcode, compress: bool) -> bool {
        if !self.is_open() {
            return false;
        }
        self.engine.publish(topic, message, opcode, compress, Some(self.id))
    }

    /// Bytes queued behind the socket
    pub fn buffered_amount(&self) -> usize {
        self.engine.conns.get(self.id).map_or(0, |c| c.io.buffered_amount())
    }

    pub fn remote_address(&self) -> Vec<u8> {
        address_bytes(self.engine.conns.get(self.id).and_then(|c| c.remote))
    }

    pub fn remote_address_as_text(&self) -> String {
        address_text(self.engine.conns.get(self.id).and_then(|c| c.remote))
    }

    /// Per-session data; still readable inside the close callback
    pub fn user_data(&self) -> Result<&U> {
        match self.engine.conns.get(self.id).map(|c| &c.mode) {
            Some(Mode::WebSocket(session)) => {
                session.user_data.downcast_ref::<U>().ok_or(Error::UserDataMismatch)
            }
            _ => Err(Error::SessionClosed),
        }
    }

    pub fn user_data_mut(&mut self) -> Result<&mut U> {
        match self.engine.conns.get_mut(self.id).map(|c| &mut c.mode) {
            Some(Mode::WebSocket(session)) => {
                session.user_data.downcast_mut::<U>().ok_or(Error::UserDataMismatch)
            }
            _ => Err(Error::SessionClosed),
        }
    }

    /// Coalesce every send made inside `f` into as few socket writes as possible
    pub fn cork<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.engine.cork(self.id);
        let result = f(self);
        self.engine.uncork(self.id);
        result
    }
}

impl<U> std::fmt::Debug for WebSocket<'_, U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket").field("id", &self.id).finish()
    }
}
