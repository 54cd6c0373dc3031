//! Error types for uplink-core

use thiserror::Error;
use uplink_router::RouteError;

/// Result type alias for uplink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol violations by a peer. These only ever close the offending connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Request line or header line does not parse
    #[error("Malformed request: {0}")]
    MalformedRequest(&'static str),

    /// Request head exceeds the configured limit
    #[error("Request head too large")]
    HeadersTooLarge,

    /// More header lines than the parser accepts
    #[error("Too many headers")]
    TooManyHeaders,

    /// Anything other than HTTP/1.0 or HTTP/1.1
    #[error("Unsupported HTTP version")]
    UnsupportedVersion,

    /// Content-Length combined with Transfer-Encoding, or conflicting lengths
    #[error("Conflicting message length")]
    ConflictingLength,

    /// Malformed chunked transfer coding
    #[error("Invalid chunked encoding")]
    InvalidChunk,

    /// Upgrade request missing or carrying invalid WebSocket headers
    #[error("Invalid WebSocket handshake: {0}")]
    InvalidHandshake(&'static str),

    /// Frame or reassembled message above maxPayloadLength
    #[error("Payload exceeds the configured maximum")]
    PayloadTooLarge,

    /// Client frames must be masked
    #[error("Unmasked client frame")]
    UnmaskedFrame,

    /// RSV bits set without a negotiated extension
    #[error("Reserved bits set")]
    ReservedBits,

    /// Opcode outside the defined set
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Control frame fragmented or larger than 125 bytes
    #[error("Invalid control frame")]
    InvalidControlFrame,

    /// Continuation without a started message, or a new message inside one
    #[error("Unexpected fragment")]
    UnexpectedFragment,

    /// Text message or close reason that is not UTF-8
    #[error("Invalid UTF-8 payload")]
    InvalidUtf8,

    /// Close frame with a malformed payload or reserved status code
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// permessage-deflate stream failed to inflate
    #[error("Compression error")]
    Compression,
}

impl ProtocolError {
    /// WebSocket close code used when this error terminates a session
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::PayloadTooLarge => 1009,
            ProtocolError::InvalidUtf8 => 1007,
            _ => 1002,
        }
    }

    /// HTTP status line used when this error terminates a request
    pub fn status_line(&self) -> &'static str {
        match self {
            ProtocolError::HeadersTooLarge | ProtocolError::TooManyHeaders => {
                "431 Request Header Fields Too Large"
            }
            ProtocolError::UnsupportedVersion => "505 HTTP Version Not Supported",
            _ => "400 Bad Request",
        }
    }
}

/// Error types for the uplink server engine
#[derive(Debug, Error)]
pub enum Error {
    /// Same method and pattern registered twice
    #[error("Duplicate route: {method} {pattern}")]
    DuplicateRoute { method: String, pattern: String },

    /// Route pattern that cannot be compiled
    #[error("Invalid route pattern: {0}")]
    InvalidPattern(String),

    /// Listen host or address that cannot be used
    #[error("Invalid listen config: {0}")]
    InvalidListenConfig(String),

    /// `App::ws_with_upgrade` needs a behavior with an `upgrade` handler
    #[error("WebSocket route has no upgrade handler")]
    MissingUpgradeHandler,

    /// TLS configuration or handshake setup failure
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(String),

    /// Peer violated HTTP or WebSocket framing
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The response's connection is gone
    #[error("Response was aborted")]
    ResponseAborted,

    /// The response already completed
    #[error("Response already ended")]
    ResponseEnded,

    /// Header or status written after the body started
    #[error("Headers already sent")]
    HeadersAlreadySent,

    /// Response callbacks can be attached once
    #[error("Response callbacks already attached")]
    CallbacksAlreadyAttached,

    /// Handler returned without ending the response or attaching an abort handler
    #[error("Response neither ended nor guarded by an abort handler")]
    MissingAbortHandler,

    /// Operation on a WebSocket after its close handler ran
    #[error("WebSocket session is closed")]
    SessionClosed,

    /// `WebSocket<U>` used with a session created for another user data type
    #[error("WebSocket user data has a different type")]
    UserDataMismatch,

    /// Event-loop handle used while the app is running a callback
    #[error("App is busy running a callback")]
    AppBusy,

    /// Event-loop handle used after the loop finished
    #[error("Event loop has stopped")]
    LoopStopped,

    /// Connection refused because a limit was reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by application handler code
    #[error("Handler error: {0}")]
    Handler(String),
}

impl From<RouteError> for Error {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::Duplicate { method, pattern } => Error::DuplicateRoute { method, pattern },
            other => Error::InvalidPattern(other.to_string()),
        }
    }
}
