//! Error types for sealwire.
//!
//! Every failure the engine can report maps onto one [`TlsError`] variant so
//! callers branch on the kind. Backend-specific detail travels alongside in
//! [`BackendError`] and is meant for diagnostics, not for matching.

use std::fmt;
use std::io;

/// Raw diagnostic from a crypto backend.
///
/// `code` is a short stable identifier chosen by the backend binding
/// (e.g. `"peer-incompatible"`); `message` is the backend's own text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub code: &'static str,
    pub message: String,
}

impl BackendError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Why the peer's certificate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyFailure {
    /// The chain does not lead to a trusted root, is expired, or is malformed.
    ChainInvalid,
    /// The chain is trusted but the leaf does not name the expected host.
    HostnameMismatch,
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChainInvalid => f.write_str("certificate chain invalid"),
            Self::HostnameMismatch => f.write_str("hostname mismatch"),
        }
    }
}

/// Errors produced by the TLS stream engine.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Trust store or session context setup failed before any network activity.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The cryptographic handshake failed for a reason other than trust.
    #[error("handshake error: {0}")]
    Handshake(BackendError),

    /// The handshake succeeded but the peer is not trusted.
    #[error("certificate verification failed: {reason} ({detail})")]
    CertificateVerification {
        reason: VerifyFailure,
        detail: String,
    },

    /// A record-layer failure after the session was established.
    #[error("protocol error: {0}")]
    Protocol(BackendError),

    /// The underlying transport reported a failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer closed the transport before the handshake completed.
    #[error("transport closed by peer during handshake")]
    TransportClosed,

    /// The stream was explicitly closed.
    #[error("stream is closed")]
    Closed,

    /// A caller-supplied `(offset, len)` does not fit the buffer.
    #[error("invalid range: offset {offset} + len {len} exceeds buffer of {buf_len}")]
    InvalidRange {
        offset: usize,
        len: usize,
        buf_len: usize,
    },
}

impl TlsError {
    /// Build a certificate verification error.
    pub fn verification(reason: VerifyFailure, detail: impl Into<String>) -> Self {
        Self::CertificateVerification {
            reason,
            detail: detail.into(),
        }
    }

    /// The backend diagnostic attached to this error, if any.
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            Self::Handshake(e) | Self::Protocol(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this error leaves the session unusable.
    ///
    /// Only [`TlsError::InvalidRange`] is recoverable: it is rejected before
    /// the session is touched.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidRange { .. })
    }
}

impl From<TlsError> for io::Error {
    fn from(e: TlsError) -> Self {
        match e {
            TlsError::Transport(inner) => inner,
            TlsError::TransportClosed => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            TlsError::InvalidRange { .. } => io::Error::new(io::ErrorKind::InvalidInput, e),
            TlsError::Closed => io::Error::new(io::ErrorKind::NotConnected, e),
            other => io::Error::other(other),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TlsError>;
