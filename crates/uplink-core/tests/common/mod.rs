#![allow(dead_code)]

use std::cell::RefCell;
use uplink_core::parser::ParseResult;
use uplink_core::{App, ConnId, Frame, MemorySocket};

pub const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
pub const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

/// One simulated peer
pub struct Client {
    pub id: ConnId,
    pub socket: MemorySocket,
    /// Server bytes already taken from the socket but not yet inspected
    unread: RefCell<Vec<u8>>,
}

impl Client {
    pub fn connect(app: &mut App) -> Self {
        Self::with_socket(app, MemorySocket::new())
    }

    pub fn with_socket(app: &mut App, socket: MemorySocket) -> Self {
        let id = app.on_open(Box::new(socket.clone()), None, None).unwrap();
        Self { id, socket, unread: RefCell::new(Vec::new()) }
    }

    pub fn send(&self, app: &mut App, bytes: &[u8]) {
        app.on_data(self.id, bytes);
    }

    fn take(&self) -> Vec<u8> {
        let mut out = std::mem::take(&mut *self.unread.borrow_mut());
        out.extend(self.socket.take_output());
        out
    }

    pub fn output(&self) -> String {
        String::from_utf8(self.take()).unwrap()
    }

    /// Open a WebSocket session on `path`; panics unless the server answers 101
    pub fn upgrade(app: &mut App, path: &str) -> Self {
        Self::upgrade_with(app, path, "").0
    }

    /// Like [`Client::upgrade`], also returning the 101 head
    pub fn upgrade_with(app: &mut App, path: &str, extra_headers: &str) -> (Self, String) {
        let client = Self::connect(app);
        client.send(app, upgrade_request(path, extra_headers).as_bytes());
        let head = client.head();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
        (client, head)
    }

    /// Consume the HTTP head the server wrote, keeping any frames after it
    pub fn head(&self) -> String {
        let out = self.take();
        let end = out
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(out.len(), |i| i + 4);
        *self.unread.borrow_mut() = out[end..].to_vec();
        String::from_utf8(out[..end].to_vec()).unwrap()
    }

    pub fn send_frame(&self, app: &mut App, frame: Frame) {
        app.on_data(self.id, &frame.masked(MASK).encode());
    }

    pub fn send_text(&self, app: &mut App, text: &str) {
        self.send_frame(app, Frame::text(text));
    }

    /// Every frame written since the last call
    pub fn frames(&self) -> Vec<Frame> {
        decode_all(&self.take())
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .map(|f| String::from_utf8(f.payload).unwrap())
            .collect()
    }
}

pub fn upgrade_request(path: &str, extra_headers: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n{extra_headers}\r\n"
    )
}

pub fn decode_all(mut data: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    while !data.is_empty() {
        match Frame::decode(data) {
            ParseResult::Complete(frame, used) => {
                frames.push(frame);
                data = &data[used..];
            }
            other => panic!("undecodable server output: {other:?}"),
        }
    }
    frames
}
