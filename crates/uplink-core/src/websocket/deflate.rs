//! permessage-deflate (RFC 7692)
//!
//! Each session that negotiated the extension owns a [`PerMessageDeflate`].
//! A shared compressor is modelled as `server_no_context_takeover`: the
//! compression state is reset after every message, so no per-session window
//! outlives a send. Dedicated compressors keep their window across messages.

use crate::config::CompressOptions;
use crate::ProtocolError;

#[cfg(feature = "compress")]
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Trailer removed from every compressed message and restored before inflating
#[cfg(feature = "compress")]
const SYNC_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Parameters of the accepted offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

impl DeflateParams {
    /// Value for the `Sec-WebSocket-Extensions` response header
    pub fn response_header(&self) -> String {
        let mut header = String::from("permessage-deflate");
        if self.server_no_context_takeover {
            header.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            header.push_str("; client_no_context_takeover");
        }
        header
    }
}

/// Pick the first acceptable permessage-deflate offer
///
/// Offers asking for a server window below 15 bits are declined: the deflate
/// backend always uses a full window.
pub fn negotiate(offer: &str, options: CompressOptions) -> Option<DeflateParams> {
    if options.is_disabled() || !cfg!(feature = "compress") {
        return None;
    }

    'offers: for extension in offer.split(',') {
        let mut parts = extension.split(';').map(str::trim);
        if parts.next() != Some("permessage-deflate") {
            continue;
        }

        let mut params = DeflateParams {
            server_no_context_takeover: options.shared_compressor(),
            client_no_context_takeover: options.shared_decompressor(),
        };
        for param in parts.filter(|p| !p.is_empty()) {
            let (name, value) = match param.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (param, None),
            };
            match (name, value) {
                ("server_no_context_takeover", None) => params.server_no_context_takeover = true,
                ("client_no_context_takeover", None) => params.client_no_context_takeover = true,
                ("client_max_window_bits", _) => {}
                ("server_max_window_bits", Some("15")) => {}
                _ => continue 'offers,
            }
        }
        return Some(params);
    }
    None
}

/// Negotiated compression state of one session
#[cfg(feature = "compress")]
pub struct PerMessageDeflate {
    params: DeflateParams,
    compressor: Option<Compress>,
    decompressor: Decompress,
}

#[cfg(feature = "compress")]
impl PerMessageDeflate {
    pub fn new(params: DeflateParams, options: CompressOptions) -> Self {
        let compressor = options
            .compresses()
            .then(|| Compress::new(Compression::default(), false));
        Self {
            params,
            compressor,
            decompressor: Decompress::new(false),
        }
    }

    pub fn params(&self) -> DeflateParams {
        self.params
    }

    /// Outgoing messages may be compressed
    pub fn compresses(&self) -> bool {
        self.compressor.is_some()
    }

    /// Deflate one message; the sync trailer is stripped
    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let reset = self.params.server_no_context_takeover;
        let compressor = self.compressor.as_mut().ok_or(ProtocolError::Compression)?;

        let start = compressor.total_in();
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let consumed = (compressor.total_in() - start) as usize;
            compressor
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|_| ProtocolError::Compression)?;
            let consumed = (compressor.total_in() - start) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&SYNC_TRAILER) {
            out.truncate(out.len() - SYNC_TRAILER.len());
        }
        if reset {
            compressor.reset();
        }
        Ok(out)
    }

    /// Inflate one message, failing once the output passes `limit` (0 = none)
    pub fn decompress(&mut self, input: &[u8], limit: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut data = Vec::with_capacity(input.len() + SYNC_TRAILER.len());
        data.extend_from_slice(input);
        data.extend_from_slice(&SYNC_TRAILER);

        let decompressor = &mut self.decompressor;
        let start = decompressor.total_in();
        let mut out = Vec::with_capacity(input.len() * 2 + 64);
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let before_in = decompressor.total_in();
            let before_out = out.len();
            let consumed = (before_in - start) as usize;
            let status = decompressor
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|_| ProtocolError::Compression)?;
            if limit > 0 && out.len() > limit {
                return Err(ProtocolError::PayloadTooLarge);
            }

            let consumed = (decompressor.total_in() - start) as usize;
            let stalled = decompressor.total_in() == before_in && out.len() == before_out;
            let finished = consumed == data.len() && out.len() < out.capacity();
            if status == Status::StreamEnd || finished || stalled {
                break;
            }
        }

        if self.params.client_no_context_takeover {
            decompressor.reset(false);
        }
        Ok(out)
    }
}

/// Stand-in when the `compress` feature is off; never negotiated
#[cfg(not(feature = "compress"))]
pub struct PerMessageDeflate {
    params: DeflateParams,
}

#[cfg(not(feature = "compress"))]
impl PerMessageDeflate {
    pub fn new(params: DeflateParams, _options: CompressOptions) -> Self {
        Self { params }
    }

    pub fn params(&self) -> DeflateParams {
        self.params
    }

    pub fn compresses(&self) -> bool {
        false
    }

    pub fn compress(&mut self, _input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::Compression)
    }

    pub fn decompress(&mut self, _input: &[u8], _limit: usize) -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::Compression)
    }
}
