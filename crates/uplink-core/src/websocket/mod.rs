//! WebSocket support (RFC 6455, RFC 7692)

mod behavior;
pub mod deflate;
pub mod frame;
pub mod handshake;
pub(crate) mod session;

pub use behavior::{UpgradeContext, WebSocketBehavior};
pub use frame::{apply_mask, Frame, FrameHeader, Opcode};
pub use session::{SendStatus, WebSocket};
