//! Per-route WebSocket configuration and callbacks

use crate::config::CompressOptions;
use crate::connection::ConnId;
use crate::engine::Engine;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::websocket::{Opcode, WebSocket};
use crate::Result;
use std::rc::Rc;
use std::time::Duration;

type UpgradeHandler<U> =
    Box<dyn Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>, &UpgradeContext<U>) -> Result<()>>;
type OpenHandler<U> = Box<dyn Fn(&mut WebSocket<'_, U>)>;
type MessageHandler<U> = Box<dyn Fn(&mut WebSocket<'_, U>, &[u8], Opcode)>;
type PayloadHandler<U> = Box<dyn Fn(&mut WebSocket<'_, U>, &[u8])>;
type CloseHandler<U> = Box<dyn Fn(&mut WebSocket<'_, U>, u16, &[u8])>;
type SubscriptionHandler<U> = Box<dyn Fn(&mut WebSocket<'_, U>, &str, i32, i32)>;

/// Session settings copied into every session at upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SessionOptions {
    pub(crate) compression: CompressOptions,
    pub(crate) max_payload_length: usize,
    pub(crate) idle_timeout: Duration,
    pub(crate) max_lifetime: Duration,
    pub(crate) max_backpressure: usize,
    pub(crate) close_on_backpressure_limit: bool,
    pub(crate) reset_idle_timeout_on_send: bool,
    pub(crate) send_pings_automatically: bool,
}

/// WebSocket route behavior, generic over the per-session user data `U`
///
/// ```
/// use uplink_core::{Opcode, WebSocketBehavior};
///
/// #[derive(Default)]
/// struct Session {
///     name: String,
/// }
///
/// let behavior = WebSocketBehavior::<Session>::new()
///     .idle_timeout(60)
///     .message(|ws, message, opcode| {
///         let _ = ws.send(message, opcode, false);
///     });
/// assert_eq!(behavior.idle_timeout, 60);
/// ```
pub struct WebSocketBehavior<U> {
    pub compression: CompressOptions,
    /// Largest accepted message in bytes, after reassembly and inflation (0 = unlimited)
    pub max_payload_length: usize,
    /// Seconds without traffic before the session is closed (0 = never)
    pub idle_timeout: u16,
    /// Minutes before the session is closed regardless of traffic (0 = never)
    pub max_lifetime: u16,
    /// Buffered bytes above which sends are dropped (0 = unlimited)
    pub max_backpressure: usize,
    pub close_on_backpressure_limit: bool,
    pub reset_idle_timeout_on_send: bool,
    pub send_pings_automatically: bool,
    upgrade: Option<UpgradeHandler<U>>,
    open: Option<OpenHandler<U>>,
    message: Option<MessageHandler<U>>,
    drain: Option<OpenHandler<U>>,
    ping: Option<PayloadHandler<U>>,
    pong: Option<PayloadHandler<U>>,
    close: Option<CloseHandler<U>>,
    subscription: Option<SubscriptionHandler<U>>,
}

impl<U> Default for WebSocketBehavior<U> {
    fn default() -> Self {
        Self {
            compression: CompressOptions::DISABLED,
            max_payload_length: 16 * 1024,
            idle_timeout: 120,
            max_lifetime: 0,
            max_backpressure: 64 * 1024,
            close_on_backpressure_limit: false,
            reset_idle_timeout_on_send: true,
            send_pings_automatically: true,
            upgrade: None,
            open: None,
            message: None,
            drain: None,
            ping: None,
            pong: None,
            close: None,
            subscription: None,
        }
    }
}

impl<U: 'static> WebSocketBehavior<U> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compression(mut self, compression: CompressOptions) -> Self {
        self.compression = compression;
        self
    }

    pub fn max_payload_length(mut self, bytes: usize) -> Self {
        self.max_payload_length = bytes;
        self
    }

    pub fn idle_timeout(mut self, seconds: u16) -> Self {
        self.idle_timeout = seconds;
        self
    }

    pub fn max_lifetime(mut self, minutes: u16) -> Self {
        self.max_lifetime = minutes;
        self
    }

    pub fn max_backpressure(mut self, bytes: usize) -> Self {
        self.max_backpressure = bytes;
        self
    }

    pub fn close_on_backpressure_limit(mut self, enabled: bool) -> Self {
        self.close_on_backpressure_limit = enabled;
        self
    }

    pub fn reset_idle_timeout_on_send(mut self, enabled: bool) -> Self {
        self.reset_idle_timeout_on_send = enabled;
        self
    }

    pub fn send_pings_automatically(mut self, enabled: bool) -> Self {
        self.send_pings_automatically = enabled;
        self
    }

    /// Custom handshake; may reject, or keep the response and upgrade later
    pub fn upgrade<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut HttpResponse<'_>, &mut HttpRequest<'_>, &UpgradeContext<U>) -> Result<()> + 'static,
    {
        self.upgrade = Some(Box::new(f));
        self
    }

    pub fn open<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket<'_, U>) + 'static,
    {
        self.open = Some(Box::new(f));
        self
    }

    pub fn message<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket<'_, U>, &[u8], Opcode) + 'static,
    {
        self.message = Some(Box::new(f));
        self
    }

    /// Buffered amount went back to zero after a send reported backpressure
    pub fn drain<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket<'_, U>) + 'static,
    {
        self.drain = Some(Box::new(f));
        self
    }

    /// Peer ping, after the automatic pong was queued
    pub fn ping<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket<'_, U>, &[u8]) + 'static,
    {
        self.ping = Some(Box::new(f));
        self
    }

    pub fn pong<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket<'_, U>, &[u8]) + 'static,
    {
        self.pong = Some(Box::new(f));
        self
    }

    /// Session ended: `(code, reason)`. The session is inert from here on.
    pub fn close<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket<'_, U>, u16, &[u8]) + 'static,
    {
        self.close = Some(Box::new(f));
        self
    }

    /// Topic membership changed: `(topic, new_count, old_count)`
    pub fn subscription<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut WebSocket<'_, U>, &str, i32, i32) + 'static,
    {
        self.subscription = Some(Box::new(f));
        self
    }

    pub(crate) fn upgrade_handler(&self) -> Option<&UpgradeHandler<U>> {
        self.upgrade.as_ref()
    }

    pub(crate) fn session_options(&self) -> SessionOptions {
        SessionOptions {
            compression: self.compression,
            max_payload_length: self.max_payload_length,
            idle_timeout: Duration::from_secs(self.idle_timeout as u64),
            max_lifetime: Duration::from_secs(self.max_lifetime as u64 * 60),
            max_backpressure: self.max_backpressure,
            close_on_backpressure_limit: self.close_on_backpressure_limit,
            reset_idle_timeout_on_send: self.reset_idle_timeout_on_send,
            send_pings_automatically: self.send_pings_automatically,
        }
    }
}

/// Handle to a route's behavior, needed to complete an upgrade
///
/// Cheap to clone; keep one to finish a deferred upgrade through `App::cork`.
pub struct UpgradeContext<U> {
    behavior: Rc<WebSocketBehavior<U>>,
}

impl<U> Clone for UpgradeContext<U> {
    fn clone(&self) -> Self {
        Self { behavior: self.behavior.clone() }
    }
}

impl<U: 'static> UpgradeContext<U> {
    pub(crate) fn new(behavior: Rc<WebSocketBehavior<U>>) -> Self {
        Self { behavior }
    }

    pub(crate) fn behavior(&self) -> &WebSocketBehavior<U> {
        &self.behavior
    }

    pub(crate) fn handler(&self) -> Rc<dyn SessionHandler> {
        self.behavior.clone()
    }
}

/// Type-erased session callbacks, so the engine can hold sessions of any `U`
pub(crate) trait SessionHandler {
    fn options(&self) -> SessionOptions;
    fn open(&self, engine: &mut Engine, id: ConnId);
    fn message(&self, engine: &mut Engine, id: ConnId, payload: &[u8], opcode: Opcode);
    fn drain(&self, engine: &mut Engine, id: ConnId);
    fn ping(&self, engine: &mut Engine, id: ConnId, payload: &[u8]);
    fn pong(&self, engine: &mut Engine, id: ConnId, payload: &[u8]);
    fn close(&self, engine: &mut Engine, id: ConnId, code: u16, reason: &[u8]);
    fn subscription(&self, engine: &mut Engine, id: ConnId, topic: &str, new_count: i32, old_count: i32);
}

impl<U: 'static> SessionHandler for WebSocketBehavior<U> {
    fn options(&self) -> SessionOptions {
        self.session_options()
    }

    fn open(&self, engine: &mut Engine, id: ConnId) {
        if let Some(f) = &self.open {
            f(&mut WebSocket::new(engine, id));
        }
    }

    fn message(&self, engine: &mut Engine, id: ConnId, payload: &[u8], opcode: Opcode) {
        if let Some(f) = &self.message {
            f(&mut WebSocket::new(engine, id), payload, opcode);
        }
    }

    fn drain(&self, engine: &mut Engine, id: ConnId) {
        if let Some(f) = &self.drain {
            f(&mut WebSocket::new(engine, id));
        }
    }

    fn ping(&self, engine: &mut Engine, id: ConnId, payload: &[u8]) {
        if let Some(f) = &self.ping {
            f(&mut WebSocket::new(engine, id), payload);
        }
    }

    fn pong(&self, engine: &mut Engine, id: ConnId, payload: &[u8]) {
        if let Some(f) = &self.pong {
            f(&mut WebSocket::new(engine, id), payload);
        }
    }

    fn close(&self, engine: &mut Engine, id: ConnId, code: u16, reason: &[u8]) {
        if let Some(f) = &self.close {
            f(&mut WebSocket::new(engine, id), code, reason);
        }
    }

    fn subscription(&self, engine: &mut Engine, id: ConnId, topic: &str, new_count: i32, old_count: i32) {
        if let Some(f) = &self.subscription {
            f(&mut WebSocket::new(engine, id), topic, new_count, old_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let behavior = WebSocketBehavior::<()>::default();
        assert_eq!(behavior.max_payload_length, 16 * 1024);
        assert_eq!(behavior.idle_timeout, 120);
        assert_eq!(behavior.max_backpressure, 64 * 1024);
        assert_eq!(behavior.max_lifetime, 0);
        assert!(!behavior.close_on_backpressure_limit);
        assert!(behavior.reset_idle_timeout_on_send);
        assert!(behavior.send_pings_automatically);
        assert!(behavior.compression.is_disabled());
    }

    #[test]
    fn test_session_options() {
        let options = WebSocketBehavior::<()>::new()
            .idle_timeout(30)
            .max_lifetime(2)
            .compression(CompressOptions::SHARED_COMPRESSOR)
            .session_options();
        assert_eq!(options.idle_timeout, Duration::from_secs(30));
        assert_eq!(options.max_lifetime, Duration::from_secs(120));
        assert!(options.compression.shared_compressor());
    }
}
