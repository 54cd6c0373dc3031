//! uplink-core: single-threaded HTTP/1.1 and WebSocket server engine
//!
//! The engine is sans-IO: an [`App`] owns routes, connections and topics, and
//! a reactor feeds it socket events. The `native` feature supplies a tokio
//! reactor, so most programs only register routes and call [`App::run`].
//!
//! ## Features
//! - `native` - tokio current-thread reactor and socket2 listen sockets
//! - `tls` - TLS termination and SNI via rustls
//! - `compress` - WebSocket permessage-deflate via flate2

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod app;
pub mod config;
pub mod connection;
pub mod crypto;
mod engine;
pub mod error;
pub mod parser;
mod pubsub;
pub mod request;
pub mod response;
pub mod websocket;

#[cfg(feature = "native")]
pub mod server;

#[cfg(feature = "tls")]
pub mod tls;

// Re-exports
pub use app::{App, Handler};
pub use config::{AppOptions, CompressOptions, EngineLimits, ListenConfig, ListenOptions};
pub use connection::{ConnId, MemorySocket, ResponseId, Socket, SocketId, TlsSession};
pub use engine::{AppStats, FilterHandler};
pub use error::{Error, ProtocolError, Result};
pub use request::HttpRequest;
pub use response::{HttpResponse, ResponseCallbacks, TryEnd};
pub use websocket::{Frame, Opcode, SendStatus, UpgradeContext, WebSocket, WebSocketBehavior};

#[cfg(feature = "native")]
pub use server::{create_listen_socket, ListenSocket, LoopHandle};

#[cfg(feature = "tls")]
pub use tls::{load_certs, load_private_key, MissingServerNameHandler, ServerNames};
