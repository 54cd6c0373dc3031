mod common;

use common::Client;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};
use uplink_core::{App, EngineLimits, MemorySocket, ResponseCallbacks, ResponseId};

/// Handler that collects the request body and answers with it
fn echo_app() -> App {
    let mut app = App::new();
    app.post("/echo", |res, _| {
        let body = Rc::new(RefCell::new(Vec::new()));
        res.attach(ResponseCallbacks::new().on_aborted(|| {}).on_data(move |res, chunk, last| {
            body.borrow_mut().extend_from_slice(chunk);
            if last {
                res.end(&body.borrow())?;
            }
            Ok(())
        }))?;
        Ok(())
    })
    .unwrap();
    app
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let mut app = App::new();
    app.get("/", |res, _| res.end(b"root")).unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    assert_eq!(client.output(), "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nroot");
    client.send(&mut app, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    assert_eq!(client.output(), "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nroot");
    assert!(app.is_connected(client.id));
}

#[test]
fn test_connection_close_after_response() {
    let mut app = App::new();
    app.get("/", |res, _| res.end(b"bye")).unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
    let out = client.output();
    assert!(out.contains("Connection: close\r\n"));
    assert!(out.ends_with("bye"));
    assert!(client.socket.is_shutdown());
    assert!(!app.is_connected(client.id));
}

#[test]
fn test_http10_request() {
    let mut app = App::new();
    app.get("/", |res, req| {
        let body = if req.is_ancient() { "old" } else { "new" };
        res.end(body.as_bytes())
    })
    .unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"GET / HTTP/1.0\r\n\r\n");
    assert!(client.output().ends_with("old"));
    assert!(!app.is_connected(client.id));
}

#[test]
fn test_request_accessors() {
    let mut app = App::new();
    app.get("/users/:id/posts/:post", |res, req| {
        let body = format!(
            "{} {} {} {} {} {} {}",
            req.method(),
            req.url(),
            req.full_url(),
            req.param("id").unwrap_or("-"),
            req.parameter(1).unwrap_or("-"),
            req.query_param("q").unwrap_or("-"),
            req.header("x-token"),
        );
        res.end(body.as_bytes())
    })
    .unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"GET /users/7/posts/99?q=a%20b&flag HTTP/1.1\r\nX-Token: secret\r\n\r\n");
    assert!(client
        .output()
        .ends_with("get /users/7/posts/99 /users/7/posts/99?q=a%20b&flag 7 99 a b secret"));
}

#[test]
fn test_content_length_body_across_reads() {
    let mut app = echo_app();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"POST /echo HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello");
    assert_eq!(client.output(), "");
    client.send(&mut app, b" world");
    assert_eq!(client.output(), "HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world");
}

#[test]
fn test_chunked_body() {
    let mut app = echo_app();
    let client = Client::connect(&mut app);

    client.send(
        &mut app,
        b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );
    assert!(client.output().ends_with("\r\n\r\nhello world"));
}

#[test]
fn test_request_without_body_delivers_empty_last_chunk() {
    let mut app = App::new();
    let chunks = Rc::new(RefCell::new(Vec::new()));
    let seen = chunks.clone();
    app.get("/", move |res, _| {
        let seen = seen.clone();
        res.attach(ResponseCallbacks::new().on_aborted(|| {}).on_data(move |res, chunk, last| {
            seen.borrow_mut().push((chunk.len(), last));
            res.end(b"")
        }))?;
        Ok(())
    })
    .unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(*chunks.borrow(), vec![(0, true)]);
    assert!(client.output().starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_pause_buffers_body_until_resume() {
    let mut app = App::new();
    let pending: Rc<Cell<Option<ResponseId>>> = Rc::new(Cell::new(None));
    let received = Rc::new(RefCell::new(Vec::new()));
    let (slot, sink) = (pending.clone(), received.clone());
    app.post("/upload", move |res, _| {
        let sink = sink.clone();
        res.attach(ResponseCallbacks::new().on_aborted(|| {}).on_data(move |res, chunk, last| {
            sink.borrow_mut().extend_from_slice(chunk);
            if last {
                res.end(b"stored")?;
            }
            Ok(())
        }))?;
        res.pause()?;
        slot.set(Some(res.id()));
        Ok(())
    })
    .unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\ndata");
    assert!(received.borrow().is_empty());

    let rid = pending.get().unwrap();
    app.cork(rid, |res| res.resume()).unwrap().unwrap();
    assert_eq!(*received.borrow(), b"data");
    assert!(client.output().ends_with("stored"));
}

#[test]
fn test_try_end_resumes_on_writable() {
    const TOTAL: usize = 100_000;
    let mut app = App::new();
    let body: Rc<Vec<u8>> = Rc::new((0..TOTAL).map(|i| (i % 251) as u8).collect());
    let payload = body.clone();
    app.get("/big", move |res, _| {
        let data = payload.clone();
        res.attach(ResponseCallbacks::new().on_aborted(|| {}).on_writable(move |res, offset| {
            let result = res.try_end(&data[offset as usize..], TOTAL as u64)?;
            Ok(result.ok)
        }))?;
        let result = res.try_end(&payload, TOTAL as u64)?;
        assert!(!result.ok);
        assert!(!result.has_responded);
        Ok(())
    })
    .unwrap();

    let client = Client::with_socket(&mut app, MemorySocket::with_capacity(1000));
    client.send(&mut app, b"GET /big HTTP/1.1\r\n\r\n");
    assert!(app.wants_writable(client.id));
    let first = client.socket.take_output();
    assert_eq!(first.len(), 1000);

    client.socket.unlimited();
    app.on_writable(client.id);
    let mut out = first;
    out.extend(client.socket.take_output());

    let head = b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n";
    assert!(out.starts_with(head));
    assert_eq!(&out[head.len()..], &body[..]);
    assert!(!app.wants_writable(client.id));
}

#[test]
fn test_aborted_when_peer_leaves() {
    let mut app = App::new();
    let aborted = Rc::new(Cell::new(false));
    let flag = aborted.clone();
    app.get("/slow", move |res, _| {
        let flag = flag.clone();
        res.attach(ResponseCallbacks::new().on_aborted(move || flag.set(true)))?;
        Ok(())
    })
    .unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"GET /slow HTTP/1.1\r\n\r\n");
    assert!(!aborted.get());
    app.on_close(client.id);
    assert!(aborted.get());
}

#[test]
fn test_oversized_head_rejected() {
    let mut app = App::with_limits(EngineLimits::default().max_header_size(64));
    app.get("/", |res, _| res.end(b"")).unwrap();
    let client = Client::connect(&mut app);

    let request = format!("GET / HTTP/1.1\r\nX-Fill: {}\r\n\r\n", "a".repeat(100));
    client.send(&mut app, request.as_bytes());
    assert!(client.output().starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
    assert!(!app.is_connected(client.id));
}

#[test]
fn test_filter_reports_open_and_close() {
    let mut app = App::new();
    let events = Rc::new(RefCell::new(Vec::new()));
    let log = events.clone();
    app.filter(move |_, _, delta| log.borrow_mut().push(delta));

    let client = Client::connect(&mut app);
    app.on_close(client.id);
    assert_eq!(*events.borrow(), vec![1, -1]);
}

#[test]
fn test_remote_address() {
    let mut app = App::new();
    app.get("/", |res, _| {
        let text = res.remote_address_as_text()?;
        let raw = res.remote_address()?;
        res.end(format!("{text} {}", raw.len()).as_bytes())
    })
    .unwrap();

    let socket = MemorySocket::new();
    let id = app
        .on_open(Box::new(socket.clone()), Some("10.1.2.3:5555".parse().unwrap()), None)
        .unwrap();
    app.on_data(id, b"GET / HTTP/1.1\r\n\r\n");
    let out = String::from_utf8(socket.take_output()).unwrap();
    assert!(out.ends_with("10.1.2.3 4"));
}

#[test]
fn test_connection_limit() {
    let mut app = App::with_limits(EngineLimits::default().max_connections(1));
    let _first = Client::connect(&mut app);

    let refused = MemorySocket::new();
    assert!(app.on_open(Box::new(refused.clone()), None, None).is_err());
    assert!(refused.is_shutdown());
}

#[test]
fn test_idle_connection_times_out() {
    let mut app = App::new();
    let client = Client::connect(&mut app);

    app.on_timer(Instant::now() + Duration::from_secs(1));
    assert!(app.is_connected(client.id));
    app.on_timer(Instant::now() + Duration::from_secs(11));
    assert!(!app.is_connected(client.id));
}

#[test]
fn test_head_request_has_no_body() {
    let mut app = App::new();
    app.head("/", |res, _| res.end(b"ignored")).unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"HEAD / HTTP/1.1\r\n\r\n");
    assert_eq!(client.output(), "HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n");
}

#[test]
fn test_paused_body_fills_inbound_room() {
    let mut app = App::with_limits(EngineLimits::default().max_inbound_buffer(1024));
    let pending: Rc<Cell<Option<ResponseId>>> = Rc::new(Cell::new(None));
    let received = Rc::new(RefCell::new(Vec::new()));
    let (slot, sink) = (pending.clone(), received.clone());
    app.post("/upload", move |res, _| {
        let sink = sink.clone();
        res.attach(ResponseCallbacks::new().on_aborted(|| {}).on_data(move |_, chunk, _| {
            sink.borrow_mut().extend_from_slice(chunk);
            Ok(())
        }))?;
        res.pause()?;
        slot.set(Some(res.id()));
        Ok(())
    })
    .unwrap();
    let client = Client::connect(&mut app);

    let mut request = b"POST /upload HTTP/1.1\r\nContent-Length: 3000\r\n\r\n".to_vec();
    request.extend_from_slice(&[b'a'; 600]);
    client.send(&mut app, &request);
    assert_eq!(app.inbound_room(client.id), 424);

    client.send(&mut app, &[b'b'; 424]);
    assert_eq!(app.inbound_room(client.id), 0);
    assert!(app.is_connected(client.id));
    assert!(received.borrow().is_empty());

    let rid = pending.get().unwrap();
    app.cork(rid, |res| res.resume()).unwrap().unwrap();
    assert_eq!(received.borrow().len(), 1024);
    assert_eq!(app.inbound_room(client.id), 1024);
    assert_eq!(client.socket.resume_count(), 1);
}

#[test]
fn test_pipelining_past_inbound_limit_closes() {
    let mut app = App::with_limits(EngineLimits::default().max_inbound_buffer(1024));
    let aborted = Rc::new(Cell::new(false));
    let flag = aborted.clone();
    app.get("/later", move |res, _| {
        let flag = flag.clone();
        res.attach(ResponseCallbacks::new().on_aborted(move || flag.set(true)))?;
        Ok(())
    })
    .unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"GET /later HTTP/1.1\r\n\r\n");
    let flood = "GET /more HTTP/1.1\r\n\r\n".repeat(100);
    client.send(&mut app, flood.as_bytes());
    assert!(aborted.get());
    assert!(!app.is_connected(client.id));
    assert!(client.socket.is_shutdown());
}

#[test]
fn test_every_candidate_yields_is_not_found() {
    let mut app = App::new();
    let tried = Rc::new(RefCell::new(Vec::new()));
    let (first, second) = (tried.clone(), tried.clone());
    app.get("/items/:id", move |_, req| {
        first.borrow_mut().push("param");
        req.set_yield(true);
        Ok(())
    })
    .unwrap()
    .any("/*", move |_, req| {
        second.borrow_mut().push("any");
        req.set_yield(true);
        Ok(())
    })
    .unwrap();
    let client = Client::connect(&mut app);

    client.send(&mut app, b"GET /items/3 HTTP/1.1\r\n\r\n");
    assert!(client.output().starts_with("HTTP/1.1 404 File Not Found\r\n"));
    assert_eq!(*tried.borrow(), vec!["param", "any"]);
    assert!(app.is_connected(client.id));
}
