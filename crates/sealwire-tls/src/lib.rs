//! TLS stream engine: upgrades a connected byte transport into an encrypted
//! stream, with certificate verification and transparent I/O retries.
//!
//! ```no_run
//! use std::net::TcpStream;
//! use sealwire_tls::TlsStream;
//!
//! let mut tcp = TcpStream::connect("example.com:443")?;
//! let mut tls = TlsStream::connect(&mut tcp, "example.com")?;
//! tls.write_all(b"GET / HTTP/1.0\r\nHost: example.com\r\n\r\n")?;
//! let mut buf = [0u8; 1024];
//! let n = tls.read(&mut buf)?;
//! tls.close();
//! # let _ = n;
//! # Ok::<(), sealwire_tls::TlsError>(())
//! ```

pub mod backend;
mod engine;
#[cfg(feature = "tls-rustls")]
pub mod rustls_backend;
pub mod verify;

pub use backend::{PeerIdentity, ServerIdentity, TlsProvider, TlsSession};
pub use engine::{HandshakeState, TlsStream};
#[cfg(feature = "tls-rustls")]
pub use rustls_backend::RustlsProvider;
pub use sealwire_types::{Result, TlsConfig, TlsError, TlsVersion, TrustStore, VerifyFailure};

#[cfg(test)]
mod test_utils;
