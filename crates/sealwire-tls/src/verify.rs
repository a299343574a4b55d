//! Peer certificate verification policy.
//!
//! Two inputs decide the policy: the hostname and the `verify` flag. An
//! empty hostname, or `verify = false`, selects the insecure mode where
//! neither the chain nor the name is checked. Nothing else ever downgrades
//! verification, and both insecure spellings are logged at `warn`.

use log::{debug, warn};
use rustls_pki_types::ServerName;
use sealwire_types::error::{Result, TlsError};

use crate::backend::{PeerIdentity, TlsSession};

/// Resolve the caller's hostname and verify flag into a [`PeerIdentity`].
pub fn peer_identity(hostname: &str, verify: bool) -> Result<PeerIdentity> {
    if hostname.is_empty() {
        warn!("empty hostname: peer certificate verification is DISABLED");
        return Ok(PeerIdentity::Unverified { sni: None });
    }

    let name = ServerName::try_from(hostname.to_owned())
        .map_err(|e| TlsError::Configuration(format!("invalid hostname {hostname:?}: {e}")))?;

    if !verify {
        warn!("verification turned off for {hostname}: peer certificate is NOT checked");
        return Ok(PeerIdentity::Unverified { sni: Some(name) });
    }
    Ok(PeerIdentity::Verified(name))
}

/// Run certificate verification for a session whose handshake just finished.
///
/// `identity` is `None` for server-side sessions, which do not authenticate
/// their clients.
pub(crate) fn verify_session(
    session: &dyn TlsSession,
    identity: Option<&PeerIdentity>,
) -> Result<()> {
    match identity {
        None => Ok(()),
        Some(PeerIdentity::Unverified { .. }) => {
            debug!("skipping peer certificate verification (insecure mode)");
            Ok(())
        },
        Some(PeerIdentity::Verified(name)) => {
            if let Err(e) = session.verify_peer(name) {
                warn!("peer certificate rejected for {name:?}: {e}");
                return Err(e);
            }
            debug!("peer certificate verified for {name:?}");
            Ok(())
        },
    }
}
