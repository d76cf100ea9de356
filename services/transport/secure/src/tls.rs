//! TLS engine backed by rustls, plus PEM-based configuration builders.
//!
//! The engine adapts a [`rustls::Connection`] to the [`SecureEngine`]
//! contract: `wrap` drains pending TLS records into the ciphertext buffer,
//! `unwrap` feeds ciphertext through the deframer and surfaces decrypted
//! plaintext, and handshake progress maps onto the status enum. rustls
//! never defers work, so no delegated tasks are ever reported.

use std::fmt;
use std::io::{Read as _, Write as _};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection,
};

use crate::engine::{
    ClientAuthPolicy, EngineFactory, EngineLimits, EngineReport, EngineStatus, HandshakeStatus,
    SecureEngine, SecureError,
};

// TLS records carry at most 16KiB of plaintext; the network side adds
// record framing overhead on top.
const APP_BUFFER: usize = 16 * 1024;
const NET_BUFFER: usize = APP_BUFFER + 2048;

/// [`SecureEngine`] implementation over a rustls client or server
/// connection.
pub struct TlsEngine {
    conn: Connection,
    reported_finished: bool,
    sent_close: bool,
}

impl fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .field("reported_finished", &self.reported_finished)
            .field("sent_close", &self.sent_close)
            .finish()
    }
}

impl TlsEngine {
    /// Builds a client-side engine that will verify the peer as
    /// `server_name`.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, SecureError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| SecureError::Config(format!("invalid server name: {server_name}")))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| SecureError::Config(e.to_string()))?;
        Ok(Self::wrap_connection(Connection::from(conn)))
    }

    /// Builds a server-side engine.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, SecureError> {
        let conn =
            ServerConnection::new(config).map_err(|e| SecureError::Config(e.to_string()))?;
        Ok(Self::wrap_connection(Connection::from(conn)))
    }

    fn wrap_connection(conn: Connection) -> Self {
        Self {
            conn,
            reported_finished: false,
            sent_close: false,
        }
    }

    fn status_now(&self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if !self.reported_finished {
            // the record that completes the handshake can queue one last
            // outbound flight (client Finished, session tickets); it must
            // drain before completion is reported
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::Finished
            }
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    // Completion appears in exactly one report; later reports say
    // NotHandshaking.
    fn report_status(&mut self) -> HandshakeStatus {
        let status = self.status_now();
        if status == HandshakeStatus::Finished {
            self.reported_finished = true;
        }
        status
    }
}

impl SecureEngine for TlsEngine {
    fn wrap(&mut self, plain: &[u8], cipher: &mut BytesMut) -> Result<EngineReport, SecureError> {
        let mut consumed = 0;
        if !self.conn.is_handshaking() && !self.sent_close && !plain.is_empty() {
            consumed = self.conn.writer().write(plain).map_err(SecureError::Io)?;
        }
        let mut produced = 0;
        let mut sink = (&mut *cipher).writer();
        while self.conn.wants_write() {
            produced += self.conn.write_tls(&mut sink).map_err(SecureError::Io)?;
        }
        let status = if self.sent_close && !self.conn.wants_write() && produced == 0 {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineReport {
            status,
            handshake: self.report_status(),
            consumed,
            produced,
        })
    }

    fn unwrap(&mut self, cipher: &[u8], plain: &mut BytesMut) -> Result<EngineReport, SecureError> {
        if cipher.is_empty() {
            return Ok(EngineReport {
                status: EngineStatus::BufferUnderflow,
                handshake: self.report_status(),
                consumed: 0,
                produced: 0,
            });
        }
        let mut input = cipher;
        let consumed = self.conn.read_tls(&mut input).map_err(SecureError::Io)?;
        let state = self
            .conn
            .process_new_packets()
            .map_err(|e| SecureError::Engine(Box::new(e)))?;

        let mut produced = 0;
        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let mut staged = vec![0u8; available];
            self.conn
                .reader()
                .read_exact(&mut staged)
                .map_err(SecureError::Io)?;
            plain.extend_from_slice(&staged);
            produced = available;
        }

        let status = if state.peer_has_closed() && produced == 0 {
            EngineStatus::Closed
        } else if consumed == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineReport {
            status,
            handshake: self.report_status(),
            consumed,
            produced,
        })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.status_now()
    }

    fn run_delegated_tasks(&mut self) -> Result<(), SecureError> {
        Ok(())
    }

    fn close_outbound(&mut self) {
        if !self.sent_close {
            self.sent_close = true;
            self.conn.send_close_notify();
        }
    }

    fn limits(&self) -> EngineLimits {
        EngineLimits {
            app_buffer: APP_BUFFER,
            net_buffer: NET_BUFFER,
        }
    }
}

/// Factory producing server-side TLS engines from one shared
/// configuration.
#[derive(Debug, Clone)]
pub struct TlsServerFactory {
    config: Arc<ServerConfig>,
}

impl TlsServerFactory {
    /// Wraps a ready server configuration.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl EngineFactory for TlsServerFactory {
    fn new_engine(&self) -> Result<Box<dyn SecureEngine>, SecureError> {
        Ok(Box::new(TlsEngine::server(Arc::clone(&self.config))?))
    }
}

/// Factory producing client-side TLS engines that all verify the same
/// server name.
#[derive(Debug, Clone)]
pub struct TlsClientFactory {
    config: Arc<ClientConfig>,
    server_name: String,
}

impl TlsClientFactory {
    /// Wraps a ready client configuration and the name to verify.
    pub fn new(config: Arc<ClientConfig>, server_name: impl Into<String>) -> Self {
        Self {
            config,
            server_name: server_name.into(),
        }
    }
}

impl EngineFactory for TlsClientFactory {
    fn new_engine(&self) -> Result<Box<dyn SecureEngine>, SecureError> {
        Ok(Box::new(TlsEngine::client(
            Arc::clone(&self.config),
            &self.server_name,
        )?))
    }
}

/// Builds a server configuration from PEM content.
///
/// `client_auth` other than [`ClientAuthPolicy::None`] requires `ca_pem`
/// naming the trust anchors that client certificates must chain to.
pub fn make_server_config(
    cert_chain_pem: &str,
    private_key_pem: &str,
    ca_pem: Option<&str>,
    client_auth: ClientAuthPolicy,
) -> Result<Arc<ServerConfig>, SecureError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = parse_certs(cert_chain_pem)?;
    let key = parse_key(private_key_pem)?;

    let builder = match client_auth {
        ClientAuthPolicy::None => ServerConfig::builder().with_no_client_auth(),
        ClientAuthPolicy::Optional | ClientAuthPolicy::Require => {
            let ca = ca_pem.ok_or_else(|| {
                SecureError::Config("client authentication requires a trust anchor".to_string())
            })?;
            let roots = parse_roots(ca)?;
            let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier_builder = if client_auth == ClientAuthPolicy::Optional {
                verifier_builder.allow_unauthenticated()
            } else {
                verifier_builder
            };
            let verifier = verifier_builder
                .build()
                .map_err(|e| SecureError::Config(e.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| SecureError::Config(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Builds a client configuration from PEM content: the trust anchors to
/// verify the server against, and optionally a certificate and key pair
/// to present for client authentication.
pub fn make_client_config(
    ca_pem: &str,
    identity: Option<(&str, &str)>,
) -> Result<Arc<ClientConfig>, SecureError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let roots = parse_roots(ca_pem)?;
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match identity {
        Some((cert_pem, key_pem)) => builder
            .with_client_auth_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)
            .map_err(|e| SecureError::Config(e.to_string()))?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, SecureError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(SecureError::Io)?;
    if certs.is_empty() {
        return Err(SecureError::Config(
            "no certificates in pem input".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, SecureError> {
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(SecureError::Io)?;
    if keys.is_empty() {
        return Err(SecureError::Config(
            "no pkcs8 private key in pem input".to_string(),
        ));
    }
    Ok(PrivateKeyDer::from(keys.remove(0)))
}

fn parse_roots(pem: &str) -> Result<RootCertStore, SecureError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem)? {
        roots
            .add(cert)
            .map_err(|e| SecureError::Config(e.to_string()))?;
    }
    Ok(roots)
}
