//! Configuration structs
//!
//! Plain data with `Default` impls and chaining builders. Nothing here touches
//! a socket; the values are consumed by the engine, the listen path and TLS.

use std::ops::BitOr;
use std::time::Duration;

/// Engine-wide limits
#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Largest request head (request line + headers) accepted
    pub max_header_size: usize,
    /// Most header lines accepted per request
    pub max_headers: usize,
    /// Size of the per-connection cork buffer
    pub cork_buffer_size: usize,
    /// HTTP connections with no request in flight close after this long
    pub http_idle_timeout: Duration,
    /// Timer tick used for idle and lifetime checks
    pub timer_granularity: Duration,
    /// Connections refused beyond this count
    pub max_connections: usize,
    /// Unconsumed request bytes held per HTTP connection, such as pipelined
    /// requests behind a deferred response or body behind `pause()`
    pub max_inbound_buffer: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_header_size: 8 * 1024,
            max_headers: 64,
            cork_buffer_size: 16 * 1024,
            http_idle_timeout: Duration::from_secs(10),
            timer_granularity: Duration::from_secs(4),
            max_connections: usize::MAX,
            max_inbound_buffer: 1024 * 1024,
        }
    }
}

impl EngineLimits {
    pub fn max_header_size(mut self, bytes: usize) -> Self {
        self.max_header_size = bytes;
        self
    }

    pub fn cork_buffer_size(mut self, bytes: usize) -> Self {
        self.cork_buffer_size = bytes;
        self
    }

    pub fn http_idle_timeout(mut self, timeout: Duration) -> Self {
        self.http_idle_timeout = timeout;
        self
    }

    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    pub fn max_inbound_buffer(mut self, bytes: usize) -> Self {
        self.max_inbound_buffer = bytes;
        self
    }
}

/// TLS material for `App::ssl` and SNI entries
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub key_file_name: Option<String>,
    pub cert_file_name: Option<String>,
    /// Encrypted keys are not supported; a non-empty passphrase is rejected
    pub passphrase: Option<String>,
    /// Ignored: only ECDHE key exchange is offered
    pub dh_params_file_name: Option<String>,
    /// Enables client certificate verification against this CA bundle
    pub ca_file_name: Option<String>,
    /// Colon-separated cipher suite names, e.g. `TLS13_AES_128_GCM_SHA256`
    pub ssl_ciphers: Option<String>,
    /// Disables the TLS session cache
    pub ssl_prefer_low_memory_usage: bool,
}

impl AppOptions {
    pub fn new(cert_file_name: impl Into<String>, key_file_name: impl Into<String>) -> Self {
        Self {
            cert_file_name: Some(cert_file_name.into()),
            key_file_name: Some(key_file_name.into()),
            ..Self::default()
        }
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn dh_params_file_name(mut self, path: impl Into<String>) -> Self {
        self.dh_params_file_name = Some(path.into());
        self
    }

    pub fn ca_file_name(mut self, path: impl Into<String>) -> Self {
        self.ca_file_name = Some(path.into());
        self
    }

    pub fn ssl_ciphers(mut self, ciphers: impl Into<String>) -> Self {
        self.ssl_ciphers = Some(ciphers.into());
        self
    }

    pub fn ssl_prefer_low_memory_usage(mut self, enabled: bool) -> Self {
        self.ssl_prefer_low_memory_usage = enabled;
        self
    }
}

/// Listen socket flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenOptions {
    /// SO_REUSEPORT on platforms that have it
    #[default]
    Default,
    /// Fail if another socket holds the port
    ExclusivePort,
}

/// Listen configuration
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Host to bind; `None` binds every IPv4 interface
    pub host: Option<String>,
    pub port: u16,
    pub options: ListenOptions,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 3000,
            options: ListenOptions::Default,
        }
    }
}

impl ListenConfig {
    pub fn new(port: u16) -> Self {
        Self { port, ..Self::default() }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn options(mut self, options: ListenOptions) -> Self {
        self.options = options;
        self
    }
}

/// permessage-deflate policy of a WebSocket route
///
/// Compressor settings live in the low byte (low nibble 1 = shared, otherwise
/// memory level with window bits in the high nibble), decompressor window bits
/// in bits 8-11 (1 = shared). Values combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CompressOptions(pub u32);

impl CompressOptions {
    const COMPRESSOR_MASK: u32 = 0x00FF;
    const DECOMPRESSOR_MASK: u32 = 0x0F00;

    pub const DISABLED: CompressOptions = CompressOptions(0);
    pub const SHARED_COMPRESSOR: CompressOptions = CompressOptions(1);
    pub const SHARED_DECOMPRESSOR: CompressOptions = CompressOptions(1 << 8);

    pub const DEDICATED_DECOMPRESSOR_32KB: CompressOptions = CompressOptions(15 << 8);
    pub const DEDICATED_DECOMPRESSOR_16KB: CompressOptions = CompressOptions(14 << 8);
    pub const DEDICATED_DECOMPRESSOR_8KB: CompressOptions = CompressOptions(13 << 8);
    pub const DEDICATED_DECOMPRESSOR_4KB: CompressOptions = CompressOptions(12 << 8);
    pub const DEDICATED_DECOMPRESSOR_2KB: CompressOptions = CompressOptions(11 << 8);
    pub const DEDICATED_DECOMPRESSOR_1KB: CompressOptions = CompressOptions(10 << 8);
    pub const DEDICATED_DECOMPRESSOR_512B: CompressOptions = CompressOptions(9 << 8);
    pub const DEDICATED_DECOMPRESSOR: CompressOptions = CompressOptions(15 << 8);

    pub const DEDICATED_COMPRESSOR_3KB: CompressOptions = CompressOptions(9 << 4 | 1);
    pub const DEDICATED_COMPRESSOR_4KB: CompressOptions = CompressOptions(9 << 4 | 2);
    pub const DEDICATED_COMPRESSOR_8KB: CompressOptions = CompressOptions(10 << 4 | 3);
    pub const DEDICATED_COMPRESSOR_16KB: CompressOptions = CompressOptions(11 << 4 | 4);
    pub const DEDICATED_COMPRESSOR_32KB: CompressOptions = CompressOptions(12 << 4 | 5);
    pub const DEDICATED_COMPRESSOR_64KB: CompressOptions = CompressOptions(13 << 4 | 6);
    pub const DEDICATED_COMPRESSOR_128KB: CompressOptions = CompressOptions(14 << 4 | 7);
    pub const DEDICATED_COMPRESSOR_256KB: CompressOptions = CompressOptions(15 << 4 | 8);
    pub const DEDICATED_COMPRESSOR: CompressOptions = CompressOptions(15 << 4 | 8);

    pub fn is_disabled(&self) -> bool {
        self.0 & (Self::COMPRESSOR_MASK | Self::DECOMPRESSOR_MASK) == 0
    }

    /// Any compressor configured (shared or dedicated)
    pub fn compresses(&self) -> bool {
        self.0 & Self::COMPRESSOR_MASK != 0
    }

    pub fn shared_compressor(&self) -> bool {
        self.0 & Self::COMPRESSOR_MASK == Self::SHARED_COMPRESSOR.0
    }

    /// Zlib memory level of a dedicated compressor
    pub fn compressor_mem_level(&self) -> u32 {
        self.0 & 0x0F
    }

    /// Window bits of a dedicated compressor
    pub fn compressor_window_bits(&self) -> u32 {
        (self.0 & 0xF0) >> 4
    }

    /// Whether inbound compressed messages are accepted
    pub fn decompresses(&self) -> bool {
        self.0 & Self::DECOMPRESSOR_MASK != 0 || self.compresses()
    }

    pub fn shared_decompressor(&self) -> bool {
        let bits = (self.0 & Self::DECOMPRESSOR_MASK) >> 8;
        bits == 1 || (bits == 0 && self.compresses())
    }

    /// Window bits of a dedicated decompressor
    pub fn decompressor_window_bits(&self) -> u32 {
        match (self.0 & Self::DECOMPRESSOR_MASK) >> 8 {
            0 | 1 => 15,
            bits => bits,
        }
    }
}

impl BitOr for CompressOptions {
    type Output = CompressOptions;

    fn bitor(self, rhs: Self) -> Self::Output {
        CompressOptions(self.0 | rhs.0)
    }
}
