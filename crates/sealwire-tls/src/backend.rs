//! Crypto backend abstraction.
//!
//! A [`TlsProvider`] is the session context: protocol configuration and
//! trust store, created once per engine. It mints [`TlsSession`]s, one per
//! connection. The engine never talks to a TLS library directly, so a
//! platform can plug in whatever implementation it has (rustls on desktop,
//! something smaller on embedded targets).
//!
//! Sessions never touch the transport. They consume ciphertext the engine
//! feeds them and hand back ciphertext the engine must send, and every step
//! reports which direction it is blocked on through [`Want`].

use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use sealwire_types::config::TlsVersion;
use sealwire_types::error::{BackendError, Result};

/// Pending I/O direction reported by a handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// The step completed.
    Nothing,
    /// More ciphertext must be received from the peer.
    Read,
    /// Buffered ciphertext must be drained to the peer.
    Write,
}

/// Result of one decrypt step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n > 0` plaintext bytes were written into the caller's buffer.
    Data(usize),
    /// No plaintext is buffered; feed more ciphertext.
    WantRead,
    /// The stream ended. `notified` is false when the transport closed
    /// without a close-notify alert.
    Eof { notified: bool },
}

/// Who the client expects to be talking to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// Verify the chain against the trust store and the leaf against this name.
    Verified(ServerName<'static>),
    /// Skip chain and hostname verification. Insecure; only ever chosen
    /// explicitly. `sni` is still announced when present.
    Unverified { sni: Option<ServerName<'static>> },
}

impl PeerIdentity {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified(_))
    }
}

/// Certificate chain and private key presented by a server session.
#[derive(Debug)]
pub struct ServerIdentity {
    /// Leaf first, followed by any intermediates.
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerIdentity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }
}

/// Session context: creates per-connection sessions.
pub trait TlsProvider: Send {
    /// Create a client session that will authenticate `identity`.
    fn client_session(&self, identity: &PeerIdentity) -> Result<Box<dyn TlsSession>>;

    /// Create a server session. Providers without a server identity fail
    /// with a configuration error.
    fn server_session(&self) -> Result<Box<dyn TlsSession>>;
}

/// One TLS connection inside a backend.
pub trait TlsSession: Send {
    /// Advance the handshake as far as buffered input allows.
    ///
    /// Returns [`Want::Nothing`] once the cryptographic handshake is
    /// complete and all handshake output has been drained.
    fn handshake(&mut self) -> std::result::Result<Want, BackendError>;

    /// Hand received ciphertext to the session and process it.
    ///
    /// `ciphertext` must not be empty. Returns how many bytes were consumed;
    /// the rest must be offered again later. The engine only feeds when
    /// [`TlsSession::decrypt`] has no plaintext left to return, and a
    /// backend may consume less than offered to keep its own buffers bounded.
    fn feed(&mut self, ciphertext: &[u8]) -> std::result::Result<usize, BackendError>;

    /// Record that the transport reached end of stream.
    fn peer_closed(&mut self);

    /// Whether ciphertext is waiting to be sent.
    fn wants_write(&self) -> bool;

    /// Move pending ciphertext into `out`, returning the number of bytes added.
    fn drain(&mut self, out: &mut Vec<u8>) -> std::result::Result<usize, BackendError>;

    /// Encrypt a prefix of `plaintext`, returning how much was accepted.
    fn encrypt(&mut self, plaintext: &[u8]) -> std::result::Result<usize, BackendError>;

    /// Decrypt buffered records into `buf`, which must not be empty.
    fn decrypt(&mut self, buf: &mut [u8]) -> std::result::Result<ReadOutcome, BackendError>;

    /// Verify the peer's chain against the trust store and its leaf against
    /// `name`. Only meaningful after the handshake completes.
    fn verify_peer(&self, name: &ServerName<'static>) -> Result<()>;

    /// Queue a close-notify alert.
    fn shutdown(&mut self);

    fn protocol_version(&self) -> Option<TlsVersion>;

    fn alpn_protocol(&self) -> Option<&[u8]>;

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]>;
}
