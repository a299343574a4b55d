//! Foundation types for sealwire.
//!
//! Shared by the engine and its consumers: the error taxonomy, the
//! [`Transport`](transport::Transport) trait the engine drives, the
//! [`Stream`](stream::Stream) trait it exposes, and TLS configuration.

pub mod config;
pub mod error;
pub mod stream;
pub mod transport;

pub use config::{TlsConfig, TlsVersion, TrustStore};
pub use error::{BackendError, Result, TlsError, VerifyFailure};
pub use stream::{PlainStream, Stream};
pub use transport::Transport;
