//! WebSocket frame codec (RFC 6455 section 5)

use crate::parser::ParseResult;
use crate::ProtocolError;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte & 0x0F {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        (*self as u8) & 0x8 != 0
    }
}

/// Fixed part of a frame, parsed before the payload arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    /// Raw opcode nibble; see [`FrameHeader::opcode`]
    pub raw_opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Bytes before the payload
    pub header_len: usize,
}

impl FrameHeader {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.raw_opcode)
    }

    pub fn parse(data: &[u8]) -> ParseResult<FrameHeader> {
        if data.len() < 2 {
            return ParseResult::Incomplete;
        }

        let fin = data[0] & 0x80 != 0;
        let rsv1 = data[0] & 0x40 != 0;
        let rsv2 = data[0] & 0x20 != 0;
        let rsv3 = data[0] & 0x10 != 0;
        let raw_opcode = data[0] & 0x0F;
        let masked = data[1] & 0x80 != 0;
        let mut payload_len = (data[1] & 0x7F) as u64;
        let mut offset = 2;

        // Extended payload length
        if payload_len == 126 {
            if data.len() < 4 {
                return ParseResult::Incomplete;
            }
            payload_len = u16::from_be_bytes([data[2], data[3]]) as u64;
            offset = 4;
        } else if payload_len == 127 {
            if data.len() < 10 {
                return ParseResult::Incomplete;
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&data[2..10]);
            payload_len = u64::from_be_bytes(len);
            if payload_len >> 63 != 0 {
                return ParseResult::Error(ProtocolError::PayloadTooLarge);
            }
            offset = 10;
        }

        // Mask key
        let mask = if masked {
            if data.len() < offset + 4 {
                return ParseResult::Incomplete;
            }
            let mask = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
            offset += 4;
            Some(mask)
        } else {
            None
        };

        let header = FrameHeader {
            fin,
            rsv1,
            rsv2,
            rsv3,
            raw_opcode,
            mask,
            payload_len,
            header_len: offset,
        };
        ParseResult::Complete(header, offset)
    }
}

/// XOR `data` with the masking key
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encode an unmasked (server-to-client) frame
pub(crate) fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool, rsv1: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 10);
    write_header(&mut buf, opcode, payload.len(), fin, rsv1, false);
    buf.extend_from_slice(payload);
    buf
}

fn write_header(buf: &mut Vec<u8>, opcode: Opcode, len: usize, fin: bool, rsv1: bool, masked: bool) {
    // First byte: FIN + RSV1 + opcode
    let mut first = opcode as u8;
    if fin {
        first |= 0x80;
    }
    if rsv1 {
        first |= 0x40;
    }
    buf.push(first);

    // Second byte: MASK + payload length
    let mask_bit = if masked { 0x80 } else { 0x00 };
    if len < 126 {
        buf.push(mask_bit | len as u8);
    } else if len < 65536 {
        buf.push(mask_bit | 126);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(mask_bit | 127);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Close frame payload: status code plus reason, reason cut to fit 125 bytes
pub(crate) fn close_payload(code: u16, reason: &[u8]) -> Vec<u8> {
    if code == 0 || code == 1005 {
        return Vec::new();
    }
    let mut end = reason.len().min(123);
    // Never split a UTF-8 sequence
    while end > 0 && end < reason.len() && (reason[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason[..end]);
    payload
}

/// Decode a close frame payload into (code, reason)
///
/// An empty payload reports 1005 (no status received).
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<(u16, &[u8]), ProtocolError> {
    match payload.len() {
        0 => Ok((1005, &[])),
        1 => Err(ProtocolError::InvalidCloseFrame),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let valid = matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999);
            if !valid {
                return Err(ProtocolError::InvalidCloseFrame);
            }
            let reason = &payload[2..];
            if std::str::from_utf8(reason).is_err() {
                return Err(ProtocolError::InvalidUtf8);
            }
            Ok((code, reason))
        }
    }
}

/// A complete frame, as a client would send or receive it
///
/// The engine parses incrementally with [`FrameHeader`]; this type is the
/// convenient whole-frame form for clients and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a text frame
    pub fn text(data: impl Into<String>) -> Self {
        Self::new(Opcode::Text, data.into().into_bytes())
    }

    /// Create a binary frame
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    /// Create a ping frame
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, data)
    }

    /// Create a close frame
    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(Opcode::Close, close_payload(code, reason.as_bytes()))
    }

    /// Mark as a non-final fragment
    pub fn fragment(mut self) -> Self {
        self.fin = false;
        self
    }

    /// Mask with the given key, as clients must
    pub fn masked(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + 14);
        write_header(&mut buf, self.opcode, self.payload.len(), self.fin, self.rsv1, self.mask.is_some());

        match self.mask {
            Some(mask) => {
                buf.extend_from_slice(&mask);
                let start = buf.len();
                buf.extend_from_slice(&self.payload);
                apply_mask(&mut buf[start..], mask);
            }
            None => buf.extend_from_slice(&self.payload),
        }
        buf
    }

    /// Decode one frame from the front of `data`
    pub fn decode(data: &[u8]) -> ParseResult<Frame> {
        let header = match FrameHeader::parse(data) {
            ParseResult::Complete(header, _) => header,
            ParseResult::Incomplete => return ParseResult::Incomplete,
            ParseResult::Error(e) => return ParseResult::Error(e),
        };
        let Some(opcode) = header.opcode() else {
            return ParseResult::Error(ProtocolError::InvalidOpcode(header.raw_opcode));
        };

        let total = header.header_len as u64 + header.payload_len;
        if (data.len() as u64) < total {
            return ParseResult::Incomplete;
        }

        let mut payload = data[header.header_len..total as usize].to_vec();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        let frame = Frame {
            fin: header.fin,
            rsv1: header.rsv1,
            opcode,
            mask: header.mask,
            payload,
        };
        ParseResult::Complete(frame, total as usize)
    }

    /// Close code and reason of a close frame
    pub fn close_code(&self) -> Option<(u16, String)> {
        if self.opcode != Opcode::Close {
            return None;
        }
        let (code, reason) = parse_close_payload(&self.payload).ok()?;
        Some((code, String::from_utf8_lossy(reason).into_owned()))
    }
}
