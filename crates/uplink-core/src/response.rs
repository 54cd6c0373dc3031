//! HTTP response state machine
//!
//! A response moves `Idle -> HeadersWritten -> BodyStreaming -> Ended`, and
//! can be aborted from any state when its connection goes away. Handlers only
//! ever hold an [`HttpResponse`], a short-lived view of `(engine, ResponseId)`;
//! every method re-resolves the id, so using a response after it ended or was
//! aborted reports an error instead of touching the wrong exchange.
//!
//! Framing is chosen when the body starts:
//! - `end` / `try_end` know the size and send `Content-Length`
//! - `write` streams with chunked transfer coding
//! - HTTP/1.0 streams raw and closes the connection afterwards
//!
//! A handler may set `Content-Length` itself, in which case body bytes are
//! written raw.

use crate::connection::{address_bytes, address_text, HttpState, Mode, ResponseId, SocketId, Transport};
use crate::engine::Engine;
use crate::parser::{RequestHead, Version};
use crate::websocket::UpgradeContext;
use crate::{Error, Result};

/// Fired once when the connection goes away before the response ended
pub type AbortHandler = Box<dyn FnOnce()>;

/// Fired when the socket drains; receives the current write offset
pub type WritableHandler = Box<dyn FnMut(&mut HttpResponse<'_>, u64) -> Result<bool>>;

/// Fired for each request body chunk; the flag marks the last one
pub type DataHandler = Box<dyn FnMut(&mut HttpResponse<'_>, &[u8], bool) -> Result<()>>;

/// Callback set attached once per response
#[derive(Default)]
pub struct ResponseCallbacks {
    pub(crate) on_aborted: Option<AbortHandler>,
    pub(crate) on_writable: Option<WritableHandler>,
    pub(crate) on_data: Option<DataHandler>,
}

impl ResponseCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_aborted<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        self.on_aborted = Some(Box::new(f));
        self
    }

    pub fn on_writable<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut HttpResponse<'_>, u64) -> Result<bool> + 'static,
    {
        self.on_writable = Some(Box::new(f));
        self
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut HttpResponse<'_>, &[u8], bool) -> Result<()> + 'static,
    {
        self.on_data = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ResponseCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCallbacks")
            .field("on_aborted", &self.on_aborted.is_some())
            .field("on_writable", &self.on_writable.is_some())
            .field("on_data", &self.on_data.is_some())
            .finish()
    }
}

/// Outcome of [`HttpResponse::try_end`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryEnd {
    /// The whole chunk was taken by the socket
    pub ok: bool,
    /// The response is complete
    pub has_responded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Idle,
    HeadersWritten,
    BodyStreaming,
}

/// Engine-side state of the one in-flight response on a connection
pub(crate) struct ResponseState {
    pub(crate) seq: u64,
    pub(crate) stage: Stage,
    status_written: bool,
    user_content_length: bool,
    chunked: bool,
    pub(crate) write_offset: u64,
    head_request: bool,
    ancient: bool,
    keep_alive: bool,
    close_after: bool,
    pub(crate) callbacks: ResponseCallbacks,
    callbacks_attached: bool,
}

impl ResponseState {
    pub(crate) fn new(seq: u64, head: &RequestHead) -> Self {
        Self {
            seq,
            stage: Stage::Idle,
            status_written: false,
            user_content_length: false,
            chunked: false,
            write_offset: 0,
            head_request: head.method == "HEAD",
            ancient: head.version == Version::Http10,
            keep_alive: head.keep_alive,
            close_after: false,
            callbacks: ResponseCallbacks::default(),
            callbacks_attached: false,
        }
    }

    /// Nothing has been written for this response yet
    pub(crate) fn is_untouched(&self) -> bool {
        self.stage == Stage::Idle && !self.status_written
    }

    pub(crate) fn has_abort_handler(&self) -> bool {
        self.callbacks.on_aborted.is_some()
    }

    fn ensure_status(&mut self, io: &mut Transport) {
        if !self.status_written {
            io.write(b"HTTP/1.1 200 OK\r\n");
            self.status_written = true;
        }
        if self.stage == Stage::Idle {
            self.stage = Stage::HeadersWritten;
        }
    }

    /// Terminate the head and pick body framing
    fn begin_body(&mut self, io: &mut Transport, length: Option<u64>) {
        if self.stage == Stage::BodyStreaming {
            return;
        }
        self.ensure_status(io);

        match length {
            _ if self.user_content_length => {}
            Some(n) => {
                io.write(format!("Content-Length: {}\r\n", n).as_bytes());
            }
            None if self.ancient => self.close_after = true,
            None => {
                io.write(b"Transfer-Encoding: chunked\r\n");
                self.chunked = true;
            }
        }
        if self.close_after || !self.keep_alive {
            io.write(b"Connection: close\r\n");
        }
        io.write(b"\r\n");
        self.stage = Stage::BodyStreaming;
    }

    fn write_chunk(&self, io: &mut Transport, data: &[u8]) {
        if self.head_request || data.is_empty() {
            return;
        }
        if self.chunked {
            io.write(format!("{:x}\r\n", data.len()).as_bytes());
            io.write(data);
            io.write(b"\r\n");
        } else {
            io.write(data);
        }
    }

    fn write_last_chunk(&self, io: &mut Transport) {
        if self.chunked && !self.head_request {
            io.write(b"0\r\n\r\n");
        }
    }
}

/// Response half of one HTTP exchange
pub struct HttpResponse<'a> {
    engine: &'a mut Engine,
    id: ResponseId,
}

impl<'a> HttpResponse<'a> {
    pub(crate) fn new(engine: &'a mut Engine, id: ResponseId) -> Self {
        Self { engine, id }
    }

    /// Handle for reaching this response later through `App::cork`
    pub fn id(&self) -> ResponseId {
        self.id
    }

    fn parts(&mut self) -> Result<(&mut Transport, &mut ResponseState)> {
        let conn = self.engine.conns.get_mut(self.id.conn).ok_or(Error::ResponseAborted)?;
        match &mut conn.mode {
            Mode::Http(HttpState { response: Some(state), .. }) if state.seq == self.id.seq => {
                Ok((&mut conn.io, state))
            }
            _ => Err(Error::ResponseEnded),
        }
    }

    fn state(&self) -> Result<&ResponseState> {
        self.engine.response_state(self.id)
    }

    /// Set the status line, e.g. `"404 Not Found"`
    ///
    /// Only the first call before any header or body write has an effect.
    pub fn write_status(&mut self, status: &str) -> Result<&mut Self> {
        let (io, state) = self.parts()?;
        if !state.status_written {
            io.write(b"HTTP/1.1 ");
            io.write(status.as_bytes());
            io.write(b"\r\n");
            state.status_written = true;
        }
        Ok(self)
    }

    /// Send `100 Continue` ahead of the real response
    pub fn write_continue(&mut self) -> Result<&mut Self> {
        let (io, state) = self.parts()?;
        if !state.status_written {
            io.write(b"HTTP/1.1 100 Continue\r\n\r\n");
        }
        Ok(self)
    }

    pub fn write_header(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        let (io, state) = self.parts()?;
        if state.stage == Stage::BodyStreaming {
            return Err(Error::HeadersAlreadySent);
        }
        state.ensure_status(io);
        if key.eq_ignore_ascii_case("content-length") {
            state.user_content_length = true;
        }
        io.write(key.as_bytes());
        io.write(b": ");
        io.write(value.as_bytes());
        io.write(b"\r\n");
        Ok(self)
    }

    pub fn write_header_int(&mut self, key: &str, value: u64) -> Result<&mut Self> {
        self.write_header(key, &value.to_string())
    }

    /// Stream a body chunk
    ///
    /// Returns `false` when the chunk had to be buffered behind backpressure;
    /// wait for `on_writable` before writing more.
    pub fn write(&mut self, chunk: &[u8]) -> Result<bool> {
        let (io, state) = self.parts()?;
        state.begin_body(io, None);
        state.write_chunk(io, chunk);
        state.write_offset += chunk.len() as u64;
        let flushed = !io.has_backlog();
        self.engine.note_write(self.id.conn);
        Ok(flushed)
    }

    /// Finish with `body`
    pub fn end(&mut self, body: &[u8]) -> Result<()> {
        self.end_with(body, false)
    }

    /// Finish with `body`, optionally closing the connection afterwards
    pub fn end_with(&mut self, body: &[u8], close_connection: bool) -> Result<()> {
        let (io, state) = self.parts()?;
        state.close_after |= close_connection;
        if state.stage != Stage::BodyStreaming {
            state.begin_body(io, Some(body.len() as u64));
        }
        state.write_chunk(io, body);
        state.write_last_chunk(io);
        state.write_offset += body.len() as u64;
        self.finish();
        Ok(())
    }

    /// Finish without a body
    ///
    /// `reported_length` is sent as `Content-Length` (e.g. for HEAD); with
    /// `None` no length header is written.
    pub fn end_without_body(&mut self, reported_length: Option<u64>, close_connection: bool) -> Result<()> {
        let (io, state) = self.parts()?;
        state.close_after |= close_connection;
        if state.stage == Stage::BodyStreaming {
            state.write_last_chunk(io);
        } else {
            state.ensure_status(io);
            if let Some(n) = reported_length.filter(|_| !state.user_content_length) {
                io.write(format!("Content-Length: {}\r\n", n).as_bytes());
            }
            if state.close_after || !state.keep_alive {
                io.write(b"Connection: close\r\n");
            }
            io.write(b"\r\n");
        }
        self.finish();
        Ok(())
    }

    /// Write part of a body of known `total_size` without buffering
    ///
    /// Whatever the socket does not take right now is left to the caller:
    /// resume from [`write_offset`](Self::write_offset) in `on_writable`.
    pub fn try_end(&mut self, chunk: &[u8], total_size: u64) -> Result<TryEnd> {
        let (io, state) = self.parts()?;
        if state.stage != Stage::BodyStreaming {
            state.begin_body(io, Some(total_size));
        }

        let written = if state.head_request {
            state.write_offset = total_size;
            chunk.len()
        } else if state.chunked {
            state.write_chunk(io, chunk);
            chunk.len()
        } else {
            io.write_optional(chunk)
        };
        if !state.head_request {
            state.write_offset += written as u64;
        }

        let done = state.write_offset >= total_size;
        if done {
            state.write_last_chunk(io);
            self.finish();
        } else {
            self.engine.note_write(self.id.conn);
        }
        Ok(TryEnd { ok: written == chunk.len(), has_responded: done })
    }

    /// Body bytes written so far
    pub fn write_offset(&self) -> Result<u64> {
        Ok(self.state()?.write_offset)
    }

    /// Replace the write offset, e.g. after writing body bytes out of band
    pub fn override_write_offset(&mut self, offset: u64) -> Result<()> {
        let (_, state) = self.parts()?;
        state.write_offset = offset;
        Ok(())
    }

    /// The response ended (or its connection is gone)
    pub fn has_responded(&self) -> bool {
        self.state().is_err()
    }

    /// Attach abort/writable/data callbacks; allowed once
    pub fn attach(&mut self, callbacks: ResponseCallbacks) -> Result<&mut Self> {
        let (_, state) = self.parts()?;
        if state.callbacks_attached {
            return Err(Error::CallbacksAlreadyAttached);
        }
        state.callbacks = callbacks;
        state.callbacks_attached = true;
        Ok(self)
    }

    /// Force-close the connection; `on_aborted` fires
    pub fn close(&mut self) -> Result<()> {
        self.parts()?;
        self.engine.close_connection(self.id.conn);
        Ok(())
    }

    /// Stop delivering request body data until [`resume`](Self::resume)
    pub fn pause(&mut self) -> Result<()> {
        self.set_paused(true)
    }

    pub fn resume(&mut self) -> Result<()> {
        self.set_paused(false)?;
        self.engine.wake(self.id.conn);
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.parts()?;
        if let Some(Mode::Http(http)) = self.engine.conns.get_mut(self.id.conn).map(|c| &mut c.mode) {
            http.paused = paused;
        }
        Ok(())
    }

    /// Run `f` with writes coalesced into one socket write
    pub fn cork<R>(&mut self, f: impl FnOnce(&mut HttpResponse<'_>) -> R) -> R {
        let conn = self.id.conn;
        self.engine.cork(conn);
        let result = f(self);
        self.engine.uncork(conn);
        result
    }

    /// Peer address: 4 bytes (IPv4), 16 bytes (IPv6) or empty
    pub fn remote_address(&self) -> Result<Vec<u8>> {
        let conn = self.engine.conns.get(self.id.conn).ok_or(Error::ResponseAborted)?;
        Ok(address_bytes(conn.remote))
    }

    pub fn remote_address_as_text(&self) -> Result<String> {
        let conn = self.engine.conns.get(self.id.conn).ok_or(Error::ResponseAborted)?;
        Ok(address_text(conn.remote))
    }

    /// Complete a WebSocket handshake and hand the connection to `context`
    ///
    /// `key` is the client's `Sec-WebSocket-Key`; `protocol` and
    /// `extensions` are the values offered by the client. `open` runs before
    /// this returns.
    pub fn upgrade<U: 'static>(
        &mut self,
        user_data: U,
        key: &str,
        protocol: &str,
        extensions: &str,
        context: &UpgradeContext<U>,
    ) -> Result<SocketId> {
        self.engine
            .ws_upgrade(self.id, context.handler(), Box::new(user_data), key, protocol, extensions)
    }

    /// Remove the finished state and decide what happens to the connection
    fn finish(&mut self) {
        let conn_id = self.id.conn;
        let now = self.engine.now;
        let Some(conn) = self.engine.conns.get_mut(conn_id) else {
            return;
        };
        let Mode::Http(http) = &mut conn.mode else {
            return;
        };
        let Some(state) = http.response.take() else {
            return;
        };
        conn.last_activity = now;

        if state.close_after || !state.keep_alive {
            self.engine.close_gracefully(conn_id);
        } else {
            self.engine.wake(conn_id);
        }
    }
}

impl std::fmt::Debug for HttpResponse<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse").field("id", &self.id).finish()
    }
}
