//! Opening handshake (RFC 6455 section 4.2)

use crate::crypto::{accept_key, is_valid_client_key};
use crate::ProtocolError;

/// The only protocol version this server speaks
pub const WEBSOCKET_VERSION: &str = "13";

/// Check the client's key and version headers
///
/// A version mismatch is answered with `426 Upgrade Required`, any other
/// failure with `400 Bad Request`; see [`rejection_status`].
pub fn validate(key: &str, version: &str) -> Result<(), ProtocolError> {
    if version.trim() != WEBSOCKET_VERSION {
        return Err(ProtocolError::InvalidHandshake("unsupported version"));
    }
    if !is_valid_client_key(key.trim()) {
        return Err(ProtocolError::InvalidHandshake("invalid key"));
    }
    Ok(())
}

/// Status line for a rejected handshake
pub(crate) fn rejection_status(err: &ProtocolError) -> &'static str {
    match err {
        ProtocolError::InvalidHandshake("unsupported version") => "426 Upgrade Required",
        _ => "400 Bad Request",
    }
}

/// First entry of a `Sec-WebSocket-Protocol` offer, or ""
pub fn first_protocol(offer: &str) -> &str {
    offer.split(',').next().map(str::trim).unwrap_or("")
}

/// Complete `101 Switching Protocols` head
pub(crate) fn switching_protocols(key: &str, protocol: &str, extensions: Option<&str>) -> Vec<u8> {
    let mut head = String::with_capacity(192);
    head.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    head.push_str("Upgrade: websocket\r\n");
    head.push_str("Connection: Upgrade\r\n");
    head.push_str("Sec-WebSocket-Accept: ");
    head.push_str(&accept_key(key.trim()));
    head.push_str("\r\n");
    if !protocol.is_empty() {
        head.push_str("Sec-WebSocket-Protocol: ");
        head.push_str(protocol);
        head.push_str("\r\n");
    }
    if let Some(extensions) = extensions {
        head.push_str("Sec-WebSocket-Extensions: ");
        head.push_str(extensions);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn test_validate() {
        assert!(validate(KEY, "13").is_ok());
        let err = validate(KEY, "8").unwrap_err();
        assert_eq!(rejection_status(&err), "426 Upgrade Required");
        let err = validate("short", "13").unwrap_err();
        assert_eq!(rejection_status(&err), "400 Bad Request");
    }

    #[test]
    fn test_first_protocol() {
        assert_eq!(first_protocol("chat, superchat"), "chat");
        assert_eq!(first_protocol(""), "");
    }

    #[test]
    fn test_switching_protocols_head() {
        let head = String::from_utf8(switching_protocols(KEY, "chat", Some("permessage-deflate"))).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(head.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(head.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert!(head.ends_with("\r\n\r\n"));

        let head = String::from_utf8(switching_protocols(KEY, "", None)).unwrap();
        assert!(!head.contains("Sec-WebSocket-Protocol"));
        assert!(!head.contains("Sec-WebSocket-Extensions"));
    }
}
