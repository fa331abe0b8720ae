//! TLS support for secured endpoints and outbound connections.
//!
//! Certificate/key loading and rustls config construction live here,
//! plus [`TlsSession`], a non-blocking wrapper around a
//! [`rustls::Connection`] driven by readiness events. A session created
//! from protocol detection starts with a memory-backed prelude: the
//! ClientHello bytes already read off the socket are replayed into the
//! record layer before the live socket takes over.

use bytes::{Buf, Bytes};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// TLS-related errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read certificate file: {0}")]
    CertificateRead(#[from] std::io::Error),

    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),

    #[error("Failed to parse private key: {0}")]
    PrivateKeyParse(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(#[from] rustls::Error),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("No private keys found in key file")]
    NoPrivateKeys,

    #[error("No certificates found in certificate file")]
    NoCertificates,

    #[error("Client TLS requires a CA certificate path")]
    NoClientRoots,
}

/// Minimum TLS protocol version accepted on an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    #[default]
    V1_2,
    V1_3,
}

impl TlsVersion {
    fn supported(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        match self {
            TlsVersion::V1_2 => rustls::ALL_VERSIONS,
            TlsVersion::V1_3 => {
                static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] =
                    &[&rustls::version::TLS13];
                TLS13_ONLY
            }
        }
    }
}

/// TLS settings for a secured endpoint.
///
/// Cipher suites are rustls's vetted defaults and are not configurable;
/// encrypted (password-protected) private keys are not supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Path to the certificate chain file (PEM format)
    pub cert_path: String,

    /// Path to the private key file (PEM format)
    pub key_path: String,

    /// Whether to require client certificates (mutual TLS)
    #[serde(default)]
    pub require_client_certs: bool,

    /// Path to the CA certificate file for client verification (optional)
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    /// Protocol version floor; TLS 1.2 by default.
    #[serde(default)]
    pub min_version: TlsVersion,
}

impl TlsSettings {
    pub fn new<P: Into<String>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            require_client_certs: false,
            ca_cert_path: None,
            min_version: TlsVersion::default(),
        }
    }

    /// Enable mutual TLS with client certificate verification
    pub fn with_client_certs<P: Into<String>>(mut self, ca_cert_path: P) -> Self {
        self.require_client_certs = true;
        self.ca_cert_path = Some(ca_cert_path.into());
        self
    }

    /// Raise the protocol version floor.
    pub fn with_min_version(mut self, min_version: TlsVersion) -> Self {
        self.min_version = min_version;
        self
    }

    /// Build the rustls server config for this endpoint.
    pub fn build_server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let chain = load_certs(&self.cert_path)?;
        if chain.is_empty() {
            return Err(TlsError::NoCertificates);
        }
        let mut keys = load_private_keys(&self.key_path)?;
        if keys.is_empty() {
            return Err(TlsError::NoPrivateKeys);
        }

        let versions = self.min_version.supported();
        let config = if self.require_client_certs {
            let ca_path = self
                .ca_cert_path
                .as_deref()
                .ok_or(TlsError::NoClientRoots)?;
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::CertificateParse(e.to_string()))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TlsError::CertificateParse(e.to_string()))?;
            ServerConfig::builder_with_protocol_versions(versions)
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, keys.remove(0))?
        } else {
            ServerConfig::builder_with_protocol_versions(versions)
                .with_no_client_auth()
                .with_single_cert(chain, keys.remove(0))?
        };

        Ok(Arc::new(config))
    }
}

/// TLS settings for connections this process originates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTlsSettings {
    /// Path to the CA certificate file used to verify the peer
    pub ca_cert_path: String,

    /// Name presented for SNI and certificate validation
    pub server_name: String,
}

impl ClientTlsSettings {
    pub fn new<P: Into<String>>(ca_cert_path: P, server_name: P) -> Self {
        Self {
            ca_cert_path: ca_cert_path.into(),
            server_name: server_name.into(),
        }
    }

    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca_cert_path)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::CertificateParse(e.to_string()))?;
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Load certificates from a PEM file
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let cert_file = File::open(path)?;
    let mut reader = BufReader::new(cert_file);

    let chain: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParse(e.to_string()))?;

    debug!("Loaded {} certificates from {}", chain.len(), path);

    Ok(chain)
}

/// Load private keys from a PEM file, trying PKCS8 first and RSA second.
pub fn load_private_keys(path: &str) -> Result<Vec<PrivateKeyDer<'static>>, TlsError> {
    let key_file = File::open(path)?;
    let mut reader = BufReader::new(key_file);

    let keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::PrivateKeyParse(e.to_string()))?
        .into_iter()
        .map(|k| k.into())
        .collect();

    if keys.is_empty() {
        let key_file = File::open(path)?;
        let mut reader = BufReader::new(key_file);

        let rsa_keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::rsa_private_keys(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::PrivateKeyParse(e.to_string()))?
            .into_iter()
            .map(|k| k.into())
            .collect();

        debug!("Loaded {} RSA private keys from {}", rsa_keys.len(), path);
        Ok(rsa_keys)
    } else {
        debug!("Loaded {} PKCS8 private keys from {}", keys.len(), path);
        Ok(keys)
    }
}

/// Identity attributes extracted from a completed handshake.
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    /// DER-encoded certificate chain presented by the peer, leaf first.
    pub cert_chain: Vec<Vec<u8>>,

    /// Server name we validated against (client sessions only).
    pub server_name: Option<String>,
}

/// One TLS session multiplexed over a non-blocking socket.
///
/// The record layer is fed manually: readiness events call
/// [`read_records`](Self::read_records) / [`write_records`](Self::write_records)
/// and the worker inspects `wants_read`/`wants_write` to update interest
/// registration. No method blocks.
pub struct TlsSession {
    conn: rustls::Connection,
    /// Handshake bytes consumed before the session existed, replayed
    /// into the record layer ahead of the live socket.
    prelude: Bytes,
    server_name: Option<String>,
}

impl TlsSession {
    /// Server-side session. `prelude` holds bytes (typically the start
    /// of the ClientHello) already drained from the socket by protocol
    /// detection.
    pub fn server(config: Arc<ServerConfig>, prelude: Bytes) -> Result<Self, TlsError> {
        let conn = ServerConnection::new(config)?;
        Ok(Self {
            conn: rustls::Connection::Server(conn),
            prelude,
            server_name: None,
        })
    }

    /// Client-side session for an outbound connection.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            conn: rustls::Connection::Client(conn),
            prelude: Bytes::new(),
            server_name: Some(server_name.to_string()),
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Buffered handshake bytes not yet fed to the record layer.
    pub fn has_prelude(&self) -> bool {
        !self.prelude.is_empty()
    }

    pub fn wants_read(&self) -> bool {
        // While the prelude lasts, the record layer is fed from memory.
        self.prelude.is_empty() && self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Feed ciphertext into the record layer and decrypt it. Reads from
    /// the buffered prelude until it is exhausted, then from `sock`.
    /// Returns the number of ciphertext bytes consumed; `Ok(0)` means
    /// the peer closed cleanly (only possible once the prelude is gone).
    pub fn read_records<R: Read>(&mut self, sock: &mut R) -> io::Result<usize> {
        let n = if self.prelude.is_empty() {
            self.conn.read_tls(sock)?
        } else {
            let mut buffered: &[u8] = &self.prelude;
            let before = buffered.len();
            let n = self.conn.read_tls(&mut buffered)?;
            let consumed = before - buffered.len();
            self.prelude.advance(consumed);
            n
        };
        if n > 0 {
            self.conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        Ok(n)
    }

    /// Flush pending TLS records to the socket. Returns bytes written.
    pub fn write_records<W: Write>(&mut self, sock: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while self.conn.wants_write() {
            total += self.conn.write_tls(sock)?;
        }
        Ok(total)
    }

    /// Read decrypted plaintext. `WouldBlock` when none is available.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.reader().read(buf)
    }

    /// Queue plaintext for encryption; records are emitted on the next
    /// [`write_records`](Self::write_records).
    pub fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(buf)
    }

    /// Identity attributes of the peer after the handshake completes.
    pub fn peer_identity(&self) -> PeerIdentity {
        let cert_chain = self
            .conn
            .peer_certificates()
            .map(|chain| chain.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default();
        PeerIdentity {
            cert_chain,
            server_name: self.server_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_an_error() {
        let settings = TlsSettings::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(
            settings.build_server_config(),
            Err(TlsError::CertificateRead(_))
        ));
    }

    #[test]
    fn version_floor_builds_a_config() {
        let cert = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/cert.pem");
        let key = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs/key.pem");
        assert_eq!(TlsVersion::default(), TlsVersion::V1_2);
        let settings = TlsSettings::new(cert, key).with_min_version(TlsVersion::V1_3);
        assert!(settings.build_server_config().is_ok());
    }

    #[test]
    fn rejects_bad_server_name() {
        let settings = ClientTlsSettings::new("/nonexistent/ca.pem", "bad name!");
        assert!(matches!(
            settings.build_client_config(),
            Err(TlsError::CertificateRead(_))
        ));
        // Name validation happens at session creation.
        assert!(ServerName::try_from("bad name!".to_string()).is_err());
    }
}
