//! TLS termination using rustls
//!
//! Provides:
//! - Certificate and key loading from PEM files
//! - SNI virtual hosting: exact and `*.suffix` server names, each with its
//!   own certificate, changeable while the app runs
//! - A [`TlsSession`] adapter so the engine sees TLS as a byte transform

use crate::app::App;
use crate::config::AppOptions;
use crate::connection::TlsSession;
use crate::{Error, Result};
use parking_lot::RwLock;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, NoServerSessionStorage, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, ServerConfig, ServerConnection};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Called with the requested hostname when no server name matches it
pub type MissingServerNameHandler = Arc<dyn Fn(&ServerNames, &str) + Send + Sync>;

/// Load certificates from PEM file
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(Path::new(path))
        .map_err(|e| Error::Tls(format!("Failed to open cert file {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certs: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificates found in {path}")));
    }
    Ok(certs)
}

/// Load private key from PEM file
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(Path::new(path))
        .map_err(|e| Error::Tls(format!("Failed to open key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| Error::Tls(format!("Failed to parse key: {e}")))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            None => break,
            _ => continue,
        }
    }

    Err(Error::Tls(format!("No private key found in {path}")))
}

/// ring provider, optionally narrowed to the colon-separated `ssl_ciphers`
fn crypto_provider(options: &AppOptions) -> Result<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(list) = options.ssl_ciphers.as_deref().filter(|l| !l.trim().is_empty()) {
        let wanted: Vec<&str> = list.split(':').map(str::trim).filter(|n| !n.is_empty()).collect();
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            wanted.iter().any(|w| w.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(Error::Tls(format!("No supported cipher suites in {list:?}")));
        }
    }
    Ok(Arc::new(provider))
}

fn certified_key(options: &AppOptions, provider: &CryptoProvider) -> Result<Arc<CertifiedKey>> {
    if options.passphrase.as_deref().is_some_and(|p| !p.is_empty()) {
        return Err(Error::Tls("Encrypted private keys are not supported".to_string()));
    }
    if options.dh_params_file_name.is_some() {
        debug!("dh params ignored, only ECDHE key exchange is offered");
    }
    let cert_path = options
        .cert_file_name
        .as_deref()
        .ok_or_else(|| Error::Tls("cert_file_name is required".to_string()))?;
    let key_path = options
        .key_file_name
        .as_deref()
        .ok_or_else(|| Error::Tls("key_file_name is required".to_string()))?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| Error::Tls(format!("Unsupported private key: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Exact match first, then a `*.parent` wildcard covering one label
fn find_server_name<'a, T>(table: &'a HashMap<String, T>, name: &str) -> Option<&'a T> {
    let name = name.to_ascii_lowercase();
    if let Some(found) = table.get(&name) {
        return Some(found);
    }
    let (_, parent) = name.split_once('.')?;
    table.get(&format!("*.{parent}"))
}

struct NameTable {
    provider: Arc<CryptoProvider>,
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    missing: RwLock<Option<MissingServerNameHandler>>,
}

/// SNI server name table, shared between the app and the TLS handshake
#[derive(Clone)]
pub struct ServerNames {
    inner: Arc<NameTable>,
}

impl ServerNames {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self {
            inner: Arc::new(NameTable {
                provider,
                certs: RwLock::new(HashMap::new()),
                missing: RwLock::new(None),
            }),
        }
    }

    /// Register `pattern` (a hostname or `*.suffix`) with its own certificate
    pub fn add(&self, pattern: &str, options: &AppOptions) -> Result<()> {
        let key = certified_key(options, &self.inner.provider)?;
        self.inner.certs.write().insert(pattern.to_ascii_lowercase(), key);
        debug!(server_name = pattern, "server name added");
        Ok(())
    }

    pub fn remove(&self, pattern: &str) -> bool {
        self.inner.certs.write().remove(&pattern.to_ascii_lowercase()).is_some()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.inner.certs.read().contains_key(&pattern.to_ascii_lowercase())
    }

    fn lookup(&self, name: &str) -> Option<Arc<CertifiedKey>> {
        find_server_name(&self.inner.certs.read(), name).cloned()
    }
}

impl fmt::Debug for ServerNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.inner.certs.read().keys().cloned().collect();
        f.debug_struct("ServerNames").field("names", &names).finish()
    }
}

struct SniResolver {
    default: Arc<CertifiedKey>,
    names: ServerNames,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").field("names", &self.names).finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            return Some(self.default.clone());
        };
        if let Some(key) = self.names.lookup(name) {
            return Some(key);
        }

        let missing = self.names.inner.missing.read().clone();
        if let Some(callback) = missing {
            callback(&self.names, name);
            if let Some(key) = self.names.lookup(name) {
                return Some(key);
            }
        }
        warn!(server_name = name, "no certificate for server name, using default");
        Some(self.default.clone())
    }
}

/// Server-wide TLS state held by an SSL app
pub(crate) struct TlsContext {
    config: Arc<ServerConfig>,
    names: ServerNames,
    options: AppOptions,
}

impl TlsContext {
    pub(crate) fn new(options: &AppOptions) -> Result<Self> {
        let provider = crypto_provider(options)?;
        let default = certified_key(options, &provider)?;
        let names = ServerNames::new(provider.clone());

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?;
        let builder = match options.ca_file_name.as_deref() {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots
                        .add(cert)
                        .map_err(|e| Error::Tls(format!("Invalid CA certificate: {e}")))?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| Error::Tls(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_cert_resolver(Arc::new(SniResolver { default, names: names.clone() }));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        if options.ssl_prefer_low_memory_usage {
            config.session_storage = Arc::new(NoServerSessionStorage {});
        }

        Ok(Self { config: Arc::new(config), names, options: options.clone() })
    }

    pub(crate) fn new_session(&self) -> Result<Box<dyn TlsSession>> {
        let mut conn = ServerConnection::new(self.config.clone()).map_err(|e| Error::Tls(e.to_string()))?;
        // Plaintext written before the handshake finishes must not be refused
        conn.set_buffer_limit(None);
        Ok(Box::new(RustlsSession { conn }))
    }
}

struct RustlsSession {
    conn: ServerConnection,
}

impl RustlsSession {
    fn flush_records(&mut self, outgoing: &mut Vec<u8>) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(outgoing)?;
        }
        Ok(())
    }
}

impl TlsSession for RustlsSession {
    fn read(&mut self, incoming: &[u8], plaintext: &mut Vec<u8>, outgoing: &mut Vec<u8>) -> io::Result<()> {
        let mut remaining = incoming;
        while !remaining.is_empty() {
            if self.conn.read_tls(&mut remaining)? == 0 {
                break;
            }
            let state = match self.conn.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    // Queue the alert before giving up on the connection
                    let _ = self.flush_records(outgoing);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            };
            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = plaintext.len();
                plaintext.resize(start + available, 0);
                self.conn.reader().read_exact(&mut plaintext[start..])?;
            }
        }
        self.flush_records(outgoing)
    }

    fn write(&mut self, plaintext: &[u8], outgoing: &mut Vec<u8>) -> io::Result<()> {
        self.conn.writer().write_all(plaintext)?;
        self.flush_records(outgoing)
    }

    fn shutdown(&mut self, outgoing: &mut Vec<u8>) {
        self.conn.send_close_notify();
        let _ = self.flush_records(outgoing);
    }
}

impl App {
    fn tls_context(&self) -> Result<&TlsContext> {
        self.tls
            .as_ref()
            .ok_or_else(|| Error::Tls("App was not created with App::ssl".to_string()))
    }

    /// Serve `pattern` with the app's own certificate
    pub fn add_server_name(&mut self, pattern: &str) -> Result<&mut Self> {
        let tls = self.tls_context()?;
        tls.names.add(pattern, &tls.options)?;
        Ok(self)
    }

    /// Serve `pattern` with its own certificate
    pub fn add_server_name_with(&mut self, pattern: &str, options: &AppOptions) -> Result<&mut Self> {
        self.tls_context()?.names.add(pattern, options)?;
        Ok(self)
    }

    pub fn remove_server_name(&mut self, pattern: &str) -> Result<&mut Self> {
        self.tls_context()?.names.remove(pattern);
        Ok(self)
    }

    /// Called during the handshake for an unknown hostname. It may register
    /// the name through the given table; the lookup is retried once.
    pub fn missing_server_name<F>(&mut self, f: F) -> Result<&mut Self>
    where
        F: Fn(&ServerNames, &str) + Send + Sync + 'static,
    {
        *self.tls_context()?.names.inner.missing.write() = Some(Arc::new(f));
        Ok(self)
    }

    /// SNI table, for registering names from outside the app
    pub fn server_names(&self) -> Option<ServerNames> {
        self.tls.as_ref().map(|tls| tls.names.clone())
    }
}
