//! TLS engine configuration.
//!
//! Usually built in code, but the scalar knobs can also come from a TOML
//! table:
//!
//! ```toml
//! verify = true
//! min_version = "1.2"
//! max_version = "1.3"
//! alpn = ["h2", "http/1.1"]
//! scratch_size = 8192
//! ```
//!
//! The trust store is never read from TOML; loading CA bundles from disk is
//! the caller's job. Pass the parsed certificates in [`TrustStore::Custom`].

use rustls_pki_types::CertificateDer;
use serde::Deserialize;

use crate::error::{Result, TlsError};

/// One full TLS record plus header/MAC overhead.
pub const DEFAULT_SCRATCH_SIZE: usize = 16384 + 256;

/// Smallest scratch buffer accepted by [`TlsConfig::validate`].
pub const MIN_SCRATCH_SIZE: usize = 512;

/// A negotiable protocol version, ordered oldest first.
///
/// SSLv3, TLS 1.0 and TLS 1.1 are not representable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// Certificate authorities trusted for chain verification.
#[derive(Debug, Clone, Default)]
pub enum TrustStore {
    /// Mozilla's root CA bundle, compiled in.
    #[default]
    WebPkiRoots,
    /// An explicit set of DER-encoded root certificates.
    Custom(Vec<CertificateDer<'static>>),
}

/// Settings applied when the session context is created.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Verify the peer chain and hostname. Turning this off is insecure.
    #[serde(default = "yes")]
    pub verify: bool,
    /// Lowest version offered or accepted.
    #[serde(default)]
    pub min_version: TlsVersion,
    /// Highest version offered or accepted.
    #[serde(default = "newest")]
    pub max_version: TlsVersion,
    /// ALPN protocol identifiers, in preference order.
    #[serde(default)]
    pub alpn: Vec<String>,
    /// Size of the ciphertext scratch buffer used per transport receive.
    #[serde(default = "default_scratch_size")]
    pub scratch_size: usize,
    #[serde(skip)]
    pub trust: TrustStore,
}

fn yes() -> bool {
    true
}

fn newest() -> TlsVersion {
    TlsVersion::Tls13
}

fn default_scratch_size() -> usize {
    DEFAULT_SCRATCH_SIZE
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            min_version: TlsVersion::default(),
            max_version: newest(),
            alpn: Vec::new(),
            scratch_size: DEFAULT_SCRATCH_SIZE,
            trust: TrustStore::default(),
        }
    }
}

impl TlsConfig {
    /// Parse and validate a TOML table.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| TlsError::Configuration(format!("tls.toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the trust store.
    pub fn with_trust(mut self, trust: TrustStore) -> Self {
        self.trust = trust;
        self
    }

    /// Trust exactly the given roots.
    pub fn with_roots(self, roots: impl IntoIterator<Item = CertificateDer<'static>>) -> Self {
        self.with_trust(TrustStore::Custom(roots.into_iter().collect()))
    }

    /// Reject settings no session could be built from.
    pub fn validate(&self) -> Result<()> {
        if self.scratch_size < MIN_SCRATCH_SIZE {
            return Err(TlsError::Configuration(format!(
                "scratch_size {} is below the minimum of {MIN_SCRATCH_SIZE}",
                self.scratch_size
            )));
        }
        if self.min_version > self.max_version {
            return Err(TlsError::Configuration(format!(
                "min_version {:?} is above max_version {:?}",
                self.min_version, self.max_version
            )));
        }
        if let Some(bad) = self.alpn.iter().find(|p| p.is_empty() || p.len() > 255) {
            return Err(TlsError::Configuration(format!(
                "ALPN protocol id must be 1..=255 bytes, got {:?}",
                bad
            )));
        }
        if let TrustStore::Custom(roots) = &self.trust {
            if roots.is_empty() {
                return Err(TlsError::Configuration("trust store is empty".to_string()));
            }
        }
        Ok(())
    }
}
