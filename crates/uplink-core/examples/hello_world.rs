//! Minimal HTTP server
//!
//! ```sh
//! RUST_LOG=uplink_core=debug cargo run --example hello_world
//! curl http://localhost:3000/hello/world
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uplink_core::App;

fn main() -> uplink_core::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "uplink_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut app = App::new();
    app.get("/hello/:name", |res, req| {
        let greeting = format!("Hello, {}!", req.param("name").unwrap_or("stranger"));
        res.write_header("Content-Type", "text/plain")?;
        res.end(greeting.as_bytes())
    })?
    .get("/*", |res, _| res.end(b"Hello World!"))?;

    if app.listen(3000).is_none() {
        tracing::error!("could not listen on port 3000");
        return Ok(());
    }
    app.run()
}
