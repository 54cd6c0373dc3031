mod common;

use common::{Client, ACCEPT, KEY};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use uplink_core::{
    App, Error, Frame, MemorySocket, Opcode, ResponseCallbacks, ResponseId, SendStatus, SocketId,
    UpgradeContext, WebSocketBehavior,
};

type Log = Rc<RefCell<Vec<String>>>;

fn echo_behavior(log: &Log) -> WebSocketBehavior<()> {
    let (open, message, close) = (log.clone(), log.clone(), log.clone());
    WebSocketBehavior::new()
        .open(move |_| open.borrow_mut().push("open".to_string()))
        .message(move |ws, data, opcode| {
            let text = String::from_utf8_lossy(data).into_owned();
            message.borrow_mut().push(format!("message {text}"));
            if text == "quit" {
                ws.end(1000, b"bye").unwrap();
            } else {
                ws.send(data, opcode, false).unwrap();
            }
        })
        .close(move |_, code, reason| {
            close
                .borrow_mut()
                .push(format!("close {code} {}", String::from_utf8_lossy(reason)));
        })
}

fn echo_app(log: &Log) -> App {
    let mut app = App::new();
    app.ws("/ws", echo_behavior(log)).unwrap();
    app
}

#[test]
fn test_upgrade_and_echo() {
    let log = Log::default();
    let mut app = echo_app(&log);
    let (client, head) = Client::upgrade_with(&mut app, "/ws", "");
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n")));
    assert_eq!(app.stats().open_sessions, 1);

    client.send_text(&mut app, "hello");
    let frames = client.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].opcode, Opcode::Text);
    assert!(frames[0].fin);
    assert!(frames[0].mask.is_none());
    assert_eq!(frames[0].payload, b"hello");
    assert_eq!(*log.borrow(), vec!["open", "message hello"]);
}

#[test]
fn test_frames_in_handshake_packet() {
    let log = Log::default();
    let mut app = echo_app(&log);
    let client = Client::connect(&mut app);

    let mut bytes = common::upgrade_request("/ws", "").into_bytes();
    bytes.extend(Frame::text("early").masked(common::MASK).encode());
    client.send(&mut app, &bytes);

    assert!(client.head().starts_with("HTTP/1.1 101"));
    assert_eq!(client.texts(), vec!["early"]);
}

#[test]
fn test_subprotocol_echo() {
    let log = Log::default();
    let mut app = echo_app(&log);
    let (_, head) = Client::upgrade_with(&mut app, "/ws", "Sec-WebSocket-Protocol: chat, superchat\r\n");
    assert!(head.contains("Sec-WebSocket-Protocol: chat\r\n"));
}

#[derive(Default)]
struct Visitor {
    name: String,
}

fn greeting_behavior() -> WebSocketBehavior<Visitor> {
    WebSocketBehavior::<Visitor>::new().message(|ws, _, _| {
        let greeting = format!("hi {}", ws.user_data().unwrap().name);
        ws.send_text(&greeting).unwrap();
    })
}

#[test]
fn test_custom_upgrade_sets_user_data() {
    let mut app = App::new();
    let behavior = greeting_behavior().upgrade(|res, req, context| {
        let name = req.query_param("name").unwrap_or("anon").to_string();
        let key = req.header("sec-websocket-key");
        res.upgrade(Visitor { name }, key, "", "", context)?;
        Ok(())
    });
    app.ws("/ws", behavior).unwrap();

    let client = Client::upgrade(&mut app, "/ws?name=ada");
    client.send_text(&mut app, "?");
    assert_eq!(client.texts(), vec!["hi ada"]);
}

/// Session data with no sensible default
struct Member {
    id: u64,
}

#[test]
fn test_upgrade_handler_supplies_non_default_user_data() {
    let mut app = App::new();
    let behavior = WebSocketBehavior::<Member>::new()
        .upgrade(|res, req, context| {
            let Some(id) = req.query_param("id").and_then(|id| id.parse().ok()) else {
                res.write_status("400 Bad Request")?;
                return res.end(b"");
            };
            let key = req.header("sec-websocket-key");
            res.upgrade(Member { id }, key, "", "", context)?;
            Ok(())
        })
        .message(|ws, _, _| {
            let reply = format!("member {}", ws.user_data().unwrap().id);
            ws.send_text(&reply).unwrap();
        });
    app.ws_with_upgrade("/members", behavior).unwrap();

    let client = Client::upgrade(&mut app, "/members?id=42");
    client.send_text(&mut app, "whoami");
    assert_eq!(client.texts(), vec!["member 42"]);

    let anonymous = Client::connect(&mut app);
    anonymous.send(&mut app, common::upgrade_request("/members", "").as_bytes());
    assert!(anonymous.output().starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn test_upgrade_route_without_handler_is_refused() {
    let mut app = App::new();
    let result = app.ws_with_upgrade("/members", WebSocketBehavior::<Member>::new());
    assert!(matches!(result, Err(Error::MissingUpgradeHandler)));
}

#[test]
fn test_custom_upgrade_can_reject() {
    let mut app = App::new();
    let behavior = greeting_behavior().upgrade(|res, _, _| {
        res.write_status("401 Unauthorized")?;
        res.end(b"")
    });
    app.ws("/ws", behavior).unwrap();

    let client = Client::connect(&mut app);
    client.send(&mut app, common::upgrade_request("/ws", "").as_bytes());
    assert!(client.output().starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    assert_eq!(app.stats().open_sessions, 0);
}

#[test]
fn test_deferred_upgrade() {
    type Parked = Rc<RefCell<Option<(ResponseId, String, UpgradeContext<Visitor>)>>>;
    let parked: Parked = Rc::default();
    let slot = parked.clone();

    let mut app = App::new();
    let behavior = greeting_behavior().upgrade(move |res, req, context| {
        res.attach(ResponseCallbacks::new().on_aborted(|| {}))?;
        let key = req.header("sec-websocket-key").to_string();
        *slot.borrow_mut() = Some((res.id(), key, context.clone()));
        Ok(())
    });
    app.ws("/ws", behavior).unwrap();

    let client = Client::connect(&mut app);
    client.send(&mut app, common::upgrade_request("/ws", "").as_bytes());
    assert_eq!(client.output(), "");

    let (rid, key, context) = parked.borrow_mut().take().unwrap();
    assert_eq!(key, KEY);
    let visitor = Visitor { name: "later".to_string() };
    let socket = app
        .cork(rid, |res| res.upgrade(visitor, &key, "", "", &context))
        .unwrap()
        .unwrap();
    assert_eq!(socket.connection(), client.id);
    assert!(client.head().starts_with("HTTP/1.1 101"));

    client.send_text(&mut app, "?");
    assert_eq!(client.texts(), vec!["hi later"]);
}

#[test]
fn test_with_websocket_outside_callbacks() {
    let mut app = App::new();
    let opened = Rc::new(Cell::new(None::<SocketId>));
    let slot = opened.clone();
    app.ws("/ws", WebSocketBehavior::<()>::new().open(move |ws| slot.set(Some(ws.id()))))
        .unwrap();

    let client = Client::upgrade(&mut app, "/ws");
    let socket = opened.get().unwrap();
    let status = app.with_websocket::<(), _>(socket, |ws| ws.send_text("push")).unwrap();
    assert_eq!(status.unwrap(), SendStatus::Success);
    assert_eq!(client.texts(), vec!["push"]);

    let wrong_type = app.with_websocket::<Visitor, _>(socket, |ws| ws.user_data().is_ok()).unwrap();
    assert!(!wrong_type);

    app.on_close(client.id);
    let err = app.with_websocket::<(), _>(socket, |_| ()).unwrap_err();
    assert!(matches!(err, Error::SessionClosed));
}

#[test]
fn test_server_initiated_close() {
    let log = Log::default();
    let mut app = echo_app(&log);
    let client = Client::upgrade(&mut app, "/ws");

    client.send_text(&mut app, "quit");
    let frames = client.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].close_code(), Some((1000, "bye".to_string())));
    assert_eq!(log.borrow().last().unwrap(), "close 1000 bye");
    assert!(!app.is_connected(client.id));
    assert!(client.socket.is_shutdown());
    assert_eq!(app.stats().open_sessions, 0);
}

#[test]
fn test_peer_close_is_echoed() {
    let log = Log::default();
    let mut app = echo_app(&log);
    let client = Client::upgrade(&mut app, "/ws");

    client.send_frame(&mut app, Frame::close(1001, "going away"));
    let frames = client.frames();
    assert_eq!(frames[0].close_code(), Some((1001, String::new())));
    assert_eq!(log.borrow().last().unwrap(), "close 1001 going away");
    assert!(!app.is_connected(client.id));
}

#[test]
fn test_abrupt_close_reports_1006() {
    let log = Log::default();
    let mut app = echo_app(&log);
    let client = Client::upgrade(&mut app, "/ws");

    app.on_close(client.id);
    assert_eq!(log.borrow().last().unwrap(), "close 1006 ");
    assert!(client.frames().is_empty());
}

#[test]
fn test_invalid_utf8_closes_with_1007() {
    let log = Log::default();
    let mut app = echo_app(&log);
    let client = Client::upgrade(&mut app, "/ws");

    client.send_frame(&mut app, Frame::new(Opcode::Text, vec![0xC3, 0x28]));
    let frames = client.frames();
    assert_eq!(frames.last().and_then(Frame::close_code).map(|(code, _)| code), Some(1007));
    assert_eq!(log.borrow().last().unwrap(), "close 1007 ");
    assert_eq!(app.stats().protocol_errors, 1);
}

#[test]
fn test_ping_answered_with_pong() {
    let pings = Rc::new(RefCell::new(Vec::new()));
    let seen = pings.clone();
    let mut app = App::new();
    app.ws("/ws", WebSocketBehavior::<()>::new().ping(move |_, payload| seen.borrow_mut().push(payload.to_vec())))
        .unwrap();
    let client = Client::upgrade(&mut app, "/ws");

    client.send_frame(&mut app, Frame::ping(b"are you there".to_vec()));
    let frames = client.frames();
    assert_eq!(frames[0].opcode, Opcode::Pong);
    assert_eq!(frames[0].payload, b"are you there");
    assert_eq!(*pings.borrow(), vec![b"are you there".to_vec()]);
}

#[test]
fn test_backpressure_drop_and_drain() {
    let drained = Rc::new(Cell::new(0));
    let counter = drained.clone();
    let opened = Rc::new(Cell::new(None::<SocketId>));
    let slot = opened.clone();

    let mut app = App::new();
    let behavior = WebSocketBehavior::<()>::new()
        .max_backpressure(1024)
        .open(move |ws| slot.set(Some(ws.id())))
        .drain(move |_| counter.set(counter.get() + 1));
    app.ws("/ws", behavior).unwrap();

    // Room for the 101 head and a little more
    let client = Client::with_socket(&mut app, MemorySocket::with_capacity(300));
    client.send(&mut app, common::upgrade_request("/ws", "").as_bytes());
    assert!(client.head().starts_with("HTTP/1.1 101"));
    let socket = opened.get().unwrap();

    // Larger than the cork buffer, so it goes straight to the socket
    let big = vec![b'x'; 20_000];
    let first = app.with_websocket::<(), _>(socket, |ws| ws.send(&big, Opcode::Binary, false)).unwrap();
    assert_eq!(first.unwrap(), SendStatus::Backpressure);
    let buffered = app.with_websocket::<(), _>(socket, |ws| ws.buffered_amount()).unwrap();
    assert!(buffered > 1024);

    let second = app.with_websocket::<(), _>(socket, |ws| ws.send(b"late", Opcode::Binary, false)).unwrap();
    assert_eq!(second.unwrap(), SendStatus::Dropped);
    assert_eq!(app.stats().dropped_messages, 1);

    client.socket.unlimited();
    app.on_writable(client.id);
    assert_eq!(drained.get(), 1);
    let frames = client.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload.len(), 20_000);
}

#[cfg(feature = "compress")]
mod compression {
    use super::*;
    use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
    use uplink_core::CompressOptions;

    fn deflate(input: &[u8]) -> Vec<u8> {
        let mut compressor = Compress::new(Compression::default(), false);
        let mut out = Vec::with_capacity(input.len() + 64);
        compressor.compress_vec(input, &mut out, FlushCompress::Sync).unwrap();
        assert!(out.ends_with(&[0x00, 0x00, 0xFF, 0xFF]));
        out.truncate(out.len() - 4);
        out
    }

    fn inflate(payload: &[u8]) -> Vec<u8> {
        let mut data = payload.to_vec();
        data.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
        let mut decompressor = Decompress::new(false);
        let mut out = Vec::with_capacity(64 * 1024);
        decompressor.decompress_vec(&data, &mut out, FlushDecompress::Sync).unwrap();
        out
    }

    #[test]
    fn test_permessage_deflate_both_directions() {
        let mut app = App::new();
        let behavior = WebSocketBehavior::<()>::new()
            .compression(CompressOptions::SHARED_COMPRESSOR | CompressOptions::SHARED_DECOMPRESSOR)
            .message(|ws, data, opcode| {
                ws.send(data, opcode, true).unwrap();
            });
        app.ws("/ws", behavior).unwrap();

        let (client, head) =
            Client::upgrade_with(&mut app, "/ws", "Sec-WebSocket-Extensions: permessage-deflate\r\n");
        assert!(head.contains("Sec-WebSocket-Extensions: permessage-deflate"));

        let message = "compress me ".repeat(50);
        let mut frame = Frame::text(message.clone());
        frame.rsv1 = true;
        frame.payload = deflate(message.as_bytes());
        client.send_frame(&mut app, frame);

        let frames = client.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].rsv1);
        assert!(frames[0].payload.len() < message.len());
        assert_eq!(inflate(&frames[0].payload), message.as_bytes());
    }

    #[test]
    fn test_no_extension_without_offer() {
        let mut app = App::new();
        app.ws("/ws", WebSocketBehavior::<()>::new().compression(CompressOptions::SHARED_COMPRESSOR))
            .unwrap();
        let (_, head) = Client::upgrade_with(&mut app, "/ws", "");
        assert!(!head.contains("Sec-WebSocket-Extensions"));
    }
}
