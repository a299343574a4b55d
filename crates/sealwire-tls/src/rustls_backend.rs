//! [`TlsProvider`] backed by rustls + ring.
//!
//! Enabled by the `tls-rustls` feature (on by default).
//!
//! rustls normally validates the server chain in the middle of the
//! handshake. Here the in-handshake verifier only checks handshake
//! signatures against the presented leaf; chain and name checks run
//! afterwards through [`TlsSession::verify_peer`], so the engine can report
//! them as a distinct step with a distinct error.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, Connection, DigitallySignedStruct,
    ProtocolVersion, RootCertStore, ServerConfig, ServerConnection, SignatureScheme,
    SupportedProtocolVersion,
};
use sealwire_types::config::{TlsConfig, TlsVersion, TrustStore};
use sealwire_types::error::{BackendError, Result, TlsError, VerifyFailure};

use crate::backend::{PeerIdentity, ReadOutcome, ServerIdentity, TlsProvider, TlsSession, Want};

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Session context built on rustls.
pub struct RustlsProvider {
    context: Context,
}

enum Context {
    Client {
        config: Arc<ClientConfig>,
        verifier: Arc<WebPkiServerVerifier>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

impl RustlsProvider {
    /// Build a client context trusting `config.trust`.
    pub fn client(config: &TlsConfig) -> Result<Self> {
        config.validate()?;
        let crypto = crypto_provider();

        let roots = root_store(&config.trust)?;
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&crypto))
            .build()
            .map_err(|e| TlsError::Configuration(format!("certificate verifier: {e}")))?;

        let deferred = DeferredVerifier {
            algorithms: crypto.signature_verification_algorithms,
        };
        let mut client = ClientConfig::builder_with_provider(crypto)
            .with_protocol_versions(protocol_versions(config))
            .map_err(|e| TlsError::Configuration(format!("protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(deferred))
            .with_no_client_auth();
        client.alpn_protocols = alpn_ids(config);

        Ok(Self {
            context: Context::Client {
                config: Arc::new(client),
                verifier,
            },
        })
    }

    /// Build a server context presenting `identity`. Client certificates are
    /// not requested.
    pub fn server(config: &TlsConfig, identity: ServerIdentity) -> Result<Self> {
        config.validate()?;
        if identity.cert_chain.is_empty() {
            return Err(TlsError::Configuration(
                "server certificate chain is empty".to_string(),
            ));
        }

        let mut server = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(protocol_versions(config))
            .map_err(|e| TlsError::Configuration(format!("protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(identity.cert_chain, identity.key)
            .map_err(|e| TlsError::Configuration(format!("server certificate: {e}")))?;
        server.alpn_protocols = alpn_ids(config);

        Ok(Self {
            context: Context::Server {
                config: Arc::new(server),
            },
        })
    }
}

impl TlsProvider for RustlsProvider {
    fn client_session(&self, identity: &PeerIdentity) -> Result<Box<dyn TlsSession>> {
        let Context::Client { config, verifier } = &self.context else {
            return Err(TlsError::Configuration(
                "server context cannot open client sessions".to_string(),
            ));
        };

        let name = match identity {
            PeerIdentity::Verified(name) | PeerIdentity::Unverified { sni: Some(name) } => {
                name.clone()
            },
            // An IP name suppresses SNI.
            PeerIdentity::Unverified { sni: None } => {
                ServerName::from(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            },
        };

        let conn = ClientConnection::new(Arc::clone(config), name)
            .map_err(|e| TlsError::Configuration(format!("TLS init: {e}")))?;

        Ok(Box::new(RustlsSession {
            conn: Connection::Client(conn),
            verifier: Some(Arc::clone(verifier)),
        }))
    }

    fn server_session(&self) -> Result<Box<dyn TlsSession>> {
        let Context::Server { config } = &self.context else {
            return Err(TlsError::Configuration(
                "client context has no server identity".to_string(),
            ));
        };

        let conn = ServerConnection::new(Arc::clone(config))
            .map_err(|e| TlsError::Configuration(format!("TLS init: {e}")))?;

        Ok(Box::new(RustlsSession {
            conn: Connection::Server(conn),
            verifier: None,
        }))
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// `validate` has already rejected `min_version > max_version`.
fn protocol_versions(config: &TlsConfig) -> &'static [&'static SupportedProtocolVersion] {
    match (config.min_version, config.max_version) {
        (TlsVersion::Tls13, _) => TLS13_ONLY,
        (TlsVersion::Tls12, TlsVersion::Tls12) => TLS12_ONLY,
        (TlsVersion::Tls12, TlsVersion::Tls13) => rustls::DEFAULT_VERSIONS,
    }
}

fn alpn_ids(config: &TlsConfig) -> Vec<Vec<u8>> {
    config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
}

fn root_store(trust: &TrustStore) -> Result<RootCertStore> {
    let roots = match trust {
        TrustStore::WebPkiRoots => {
            RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
        },
        TrustStore::Custom(certs) => {
            let mut roots = RootCertStore::empty();
            for der in certs {
                roots
                    .add(der.clone())
                    .map_err(|e| TlsError::Configuration(format!("trust anchor rejected: {e}")))?;
            }
            roots
        },
    };
    if roots.is_empty() {
        return Err(TlsError::Configuration("trust store is empty".to_string()));
    }
    Ok(roots)
}

// ---------------------------------------------------------------------------
// Deferred verifier: signatures now, trust later
// ---------------------------------------------------------------------------

/// Accepts any presented chain during the handshake while still checking
/// that the peer owns the leaf's key.
#[derive(Debug)]
struct DeferredVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A rustls connection driven by the engine.
struct RustlsSession {
    conn: Connection,
    /// Present for client sessions only.
    verifier: Option<Arc<WebPkiServerVerifier>>,
}

impl TlsSession for RustlsSession {
    fn handshake(&mut self) -> std::result::Result<Want, BackendError> {
        if self.conn.wants_write() {
            Ok(Want::Write)
        } else if self.conn.is_handshaking() {
            Ok(Want::Read)
        } else {
            Ok(Want::Nothing)
        }
    }

    /// One `read_tls` per call: rustls refuses further input while more
    /// than 16 KiB of decrypted plaintext is waiting to be read.
    fn feed(&mut self, mut ciphertext: &[u8]) -> std::result::Result<usize, BackendError> {
        debug_assert!(!ciphertext.is_empty(), "empty read_tls input means EOF");
        let n = self
            .conn
            .read_tls(&mut ciphertext)
            .map_err(|e| BackendError::new("read-tls", e.to_string()))?;
        self.conn.process_new_packets().map_err(|e| map_error(&e))?;
        log::trace!("fed {n} ciphertext bytes");
        Ok(n)
    }

    fn peer_closed(&mut self) {
        let mut empty: &[u8] = &[];
        if let Err(e) = self.conn.read_tls(&mut empty) {
            log::trace!("recording EOF: {e}");
        }
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn drain(&mut self, out: &mut Vec<u8>) -> std::result::Result<usize, BackendError> {
        let mut total = 0;
        while self.conn.wants_write() {
            match self.conn.write_tls(out) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => return Err(BackendError::new("write-tls", e.to_string())),
            }
        }
        Ok(total)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> std::result::Result<usize, BackendError> {
        self.conn
            .writer()
            .write(plaintext)
            .map_err(|e| BackendError::new("encrypt", e.to_string()))
    }

    fn decrypt(&mut self, buf: &mut [u8]) -> std::result::Result<ReadOutcome, BackendError> {
        match self.conn.reader().read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof { notified: true }),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WantRead),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Ok(ReadOutcome::Eof { notified: false })
            },
            Err(e) => Err(BackendError::new("decrypt", e.to_string())),
        }
    }

    fn verify_peer(&self, name: &ServerName<'static>) -> Result<()> {
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            TlsError::Configuration("server sessions do not verify peers".to_string())
        })?;
        let chain = self.conn.peer_certificates().unwrap_or_default();
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return Err(TlsError::verification(
                VerifyFailure::ChainInvalid,
                "peer presented no certificates",
            ));
        };

        verifier
            .verify_server_cert(end_entity, intermediates, name, &[], UnixTime::now())
            .map(|_| ())
            .map_err(|e| TlsError::verification(classify_verify_error(&e), e.to_string()))
    }

    fn shutdown(&mut self) {
        self.conn.send_close_notify();
    }

    fn protocol_version(&self) -> Option<TlsVersion> {
        match self.conn.protocol_version()? {
            ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
            ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
            _ => None,
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.conn.peer_certificates()
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Name-mismatch errors are only produced after the chain itself verified,
/// so everything else is a chain problem.
fn classify_verify_error(err: &rustls::Error) -> VerifyFailure {
    match err {
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
        ) => VerifyFailure::HostnameMismatch,
        _ => VerifyFailure::ChainInvalid,
    }
}

/// Map a rustls error onto a stable diagnostic code.
pub(crate) fn map_error(err: &rustls::Error) -> BackendError {
    use rustls::Error as E;

    let code = match err {
        E::InappropriateMessage { .. } | E::InappropriateHandshakeMessage { .. } => {
            "unexpected-message"
        },
        E::InvalidMessage(_) => "invalid-message",
        E::NoCertificatesPresented => "no-certificates",
        E::UnsupportedNameType => "unsupported-name-type",
        E::DecryptError => "decrypt-error",
        E::EncryptError => "encrypt-error",
        E::PeerIncompatible(_) => "peer-incompatible",
        E::PeerMisbehaved(_) => "peer-misbehaved",
        E::AlertReceived(_) => "alert-received",
        E::InvalidCertificate(_) => "invalid-certificate",
        E::InvalidCertRevocationList(_) => "invalid-crl",
        E::General(_) => "general",
        E::FailedToGetCurrentTime => "clock-unavailable",
        E::FailedToGetRandomBytes => "rng-unavailable",
        E::HandshakeNotComplete => "handshake-incomplete",
        E::PeerSentOversizedRecord => "oversized-record",
        E::NoApplicationProtocol => "no-application-protocol",
        E::BadMaxFragmentSize => "bad-fragment-size",
        _ => "backend",
    };
    BackendError::new(code, err.to_string())
}
