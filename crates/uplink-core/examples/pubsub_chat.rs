//! WebSocket chat room with a periodic server broadcast
//!
//! Every client joins "chat"; what one client sends, the others receive.
//! A task on the loop announces the room size every ten seconds.
//!
//! ```sh
//! cargo run --example pubsub_chat
//! websocat ws://localhost:9001/chat?name=ada
//! ```

use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uplink_core::{App, CompressOptions, Opcode, WebSocketBehavior};

#[derive(Default)]
struct Member {
    name: String,
}

fn main() -> uplink_core::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "uplink_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let behavior = WebSocketBehavior::<Member>::new()
        .compression(CompressOptions::SHARED_COMPRESSOR)
        .idle_timeout(60)
        .max_backpressure(64 * 1024)
        .upgrade(|res, req, context| {
            let name = req.query_param("name").unwrap_or("anonymous").to_string();
            let key = req.header("sec-websocket-key").to_string();
            let protocol = req.header("sec-websocket-protocol").to_string();
            let extensions = req.header("sec-websocket-extensions").to_string();
            res.upgrade(Member { name }, &key, &protocol, &extensions, context)?;
            Ok(())
        })
        .open(|ws| {
            ws.subscribe("chat");
            let joined = format!("{} joined", ws.user_data().map_or("?", |m| m.name.as_str()));
            ws.publish("chat", joined.as_bytes(), Opcode::Text, true);
        })
        .message(|ws, data, opcode| {
            let name = ws.user_data().map(|m| m.name.clone()).unwrap_or_default();
            let line = format!("{name}: {}", String::from_utf8_lossy(data));
            if !ws.publish("chat", line.as_bytes(), opcode, true) {
                tracing::debug!(%name, "nobody else in the room");
            }
        })
        .close(|ws, code, _| {
            let name = ws.user_data().map(|m| m.name.clone()).unwrap_or_default();
            tracing::info!(%name, code, "member left");
        });

    let mut app = App::new();
    app.ws("/chat", behavior)?;
    if app.listen(9001).is_none() {
        tracing::error!("could not listen on port 9001");
        return Ok(());
    }

    app.run_with(|handle| {
        let handle = handle.clone();
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                ticker.tick().await;
                let Ok(members) = handle.num_subscribers("chat") else {
                    break;
                };
                let notice = format!("{members} in the room");
                if handle.publish("chat", notice.as_bytes(), Opcode::Text, true).is_err() {
                    break;
                }
            }
        });
    })
}
