//! The TLS stream engine.
//!
//! [`TlsStream`] owns one backend session bound to one transport. The first
//! `read` or `write` runs the handshake; after that, reads and writes are
//! translated into decrypt/encrypt steps while the engine moves ciphertext
//! between the session and the transport.
//!
//! Everything here is synchronous: each call returns once the operation is
//! done, the stream has ended, or something failed hard. "Want read" and
//! "want write" never reach the caller.

use std::io;
use std::time::Duration;

use log::{debug, trace, warn};
use rustls_pki_types::CertificateDer;
use sealwire_types::config::{TlsConfig, TlsVersion};
use sealwire_types::error::{BackendError, Result, TlsError};
use sealwire_types::stream::Stream;
use sealwire_types::transport::{self, Transport};

use crate::backend::{PeerIdentity, ReadOutcome, TlsProvider, TlsSession, Want};
use crate::verify;

/// Back-off between retries when the transport reports `WouldBlock`.
const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(1);

/// Handshake progress of a [`TlsStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    InProgress,
    Established,
    /// A hard failure occurred; every later operation fails immediately.
    Failed,
    /// The stream was closed by its owner.
    Closed,
}

/// An encrypted stream over a [`Transport`].
///
/// The engine never closes the transport. Pass `&mut transport` to keep
/// ownership, or use [`TlsStream::get_mut`] once the stream is closed.
pub struct TlsStream<T: Transport> {
    // Field order is drop order: the session goes before its context.
    session: Option<Box<dyn TlsSession>>,
    /// Session context, held so it outlives the session.
    _context: Box<dyn TlsProvider>,
    transport: T,
    /// `None` for server-side streams.
    identity: Option<PeerIdentity>,
    state: HandshakeState,
    /// Description of the failure that moved the stream to `Failed`.
    failure: Option<String>,
    /// Ciphertext received from the transport; `inbound[pending..filled]`
    /// has not been accepted by the session yet.
    inbound: Vec<u8>,
    pending: usize,
    filled: usize,
    /// Ciphertext drained from the session, waiting to be sent.
    outbound: Vec<u8>,
    /// The transport reported end of stream.
    eof: bool,
}

#[cfg(feature = "tls-rustls")]
impl<T: Transport> TlsStream<T> {
    /// Client stream for `hostname` with default settings (verification on,
    /// Mozilla root store).
    ///
    /// An empty `hostname` turns verification OFF: neither the chain nor the
    /// name is checked. Only pass `""` when that is really what you want.
    pub fn connect(transport: T, hostname: &str) -> Result<Self> {
        Self::connect_with(transport, hostname, TlsConfig::default())
    }

    /// Client stream for `hostname` with explicit settings.
    pub fn connect_with(transport: T, hostname: &str, config: TlsConfig) -> Result<Self> {
        let identity = verify::peer_identity(hostname, config.verify)?;
        let provider = crate::rustls_backend::RustlsProvider::client(&config)?;
        Self::with_provider(transport, identity, Box::new(provider), config.scratch_size)
    }

    /// Server stream presenting `identity`.
    pub fn accept(
        transport: T,
        identity: crate::backend::ServerIdentity,
        config: TlsConfig,
    ) -> Result<Self> {
        let provider = crate::rustls_backend::RustlsProvider::server(&config, identity)?;
        Self::server_with_provider(transport, Box::new(provider), config.scratch_size)
    }
}

impl<T: Transport> TlsStream<T> {
    /// Client stream on an arbitrary backend.
    pub fn with_provider(
        transport: T,
        identity: PeerIdentity,
        provider: Box<dyn TlsProvider>,
        scratch_size: usize,
    ) -> Result<Self> {
        let session = provider.client_session(&identity)?;
        Ok(Self::from_parts(
            transport,
            provider,
            session,
            Some(identity),
            scratch_size,
        ))
    }

    /// Server stream on an arbitrary backend.
    pub fn server_with_provider(
        transport: T,
        provider: Box<dyn TlsProvider>,
        scratch_size: usize,
    ) -> Result<Self> {
        let session = provider.server_session()?;
        Ok(Self::from_parts(transport, provider, session, None, scratch_size))
    }

    fn from_parts(
        transport: T,
        provider: Box<dyn TlsProvider>,
        session: Box<dyn TlsSession>,
        identity: Option<PeerIdentity>,
        scratch_size: usize,
    ) -> Self {
        Self {
            session: Some(session),
            _context: provider,
            transport,
            identity,
            state: HandshakeState::NotStarted,
            failure: None,
            inbound: vec![0; scratch_size.max(1)],
            pending: 0,
            filled: 0,
            outbound: Vec::new(),
            eof: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Negotiated protocol version, once the handshake has progressed far
    /// enough to know it.
    pub fn protocol_version(&self) -> Option<TlsVersion> {
        self.session.as_ref()?.protocol_version()
    }

    /// ALPN protocol agreed with the peer, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.session.as_ref()?.alpn_protocol()
    }

    /// Certificates presented by the peer, leaf first.
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.session.as_ref()?.peer_certificates()
    }

    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Run the handshake now instead of on first use.
    pub fn handshake(&mut self) -> Result<()> {
        self.ensure_handshake()
    }

    /// Read decrypted bytes into `buf`.
    ///
    /// Blocks until at least one byte is available. Returns 0 only when the
    /// peer ended the stream (close-notify or clean transport close), and
    /// keeps returning 0 after that.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_handshake()?;
        if buf.is_empty() {
            return Ok(0);
        }
        match self.pump_read(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Encrypt and send all of `data`, or fail.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_handshake()?;
        match self.pump_write(data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Send close-notify (best effort) and release the session.
    ///
    /// Idempotent. The transport is left open for its owner to close.
    pub fn close(&mut self) {
        if self.state == HandshakeState::Closed {
            return;
        }
        if matches!(
            self.state,
            HandshakeState::Established | HandshakeState::InProgress
        ) {
            if let Some(session) = self.session.as_mut() {
                session.shutdown();
            }
            if let Err(e) = self.flush_outbound(TlsError::Protocol) {
                warn!("TLS close-notify not delivered: {e}");
            }
        }
        debug!("TLS stream closed (was {:?})", self.state);
        self.state = HandshakeState::Closed;
        self.session = None;
        self.outbound = Vec::new();
    }

    // -----------------------------------------------------------------------
    // Handshake state machine
    // -----------------------------------------------------------------------

    fn ensure_handshake(&mut self) -> Result<()> {
        match self.state {
            HandshakeState::Established => return Ok(()),
            HandshakeState::Failed => return Err(self.failed_error()),
            HandshakeState::Closed => return Err(TlsError::Closed),
            HandshakeState::NotStarted | HandshakeState::InProgress => {},
        }

        match self.drive_handshake() {
            Ok(()) => {
                self.state = HandshakeState::Established;
                debug!(
                    "TLS session established (version={:?}, alpn={:?})",
                    self.protocol_version(),
                    self.alpn_protocol().map(String::from_utf8_lossy),
                );
                Ok(())
            },
            Err(e) => Err(self.fail(e)),
        }
    }

    fn drive_handshake(&mut self) -> Result<()> {
        loop {
            let want = self.session_mut()?.handshake().map_err(TlsError::Handshake)?;
            if want != Want::Nothing && self.state == HandshakeState::NotStarted {
                trace!("handshake started");
                self.state = HandshakeState::InProgress;
            }
            match want {
                Want::Nothing => break,
                Want::Write => self.flush_outbound(TlsError::Handshake)?,
                Want::Read => {
                    if self.pending == self.filled && !self.receive_ciphertext()? {
                        return Err(TlsError::TransportClosed);
                    }
                    self.feed_once().map_err(TlsError::Handshake)?;
                },
            }
        }

        let session = self.session.as_deref().ok_or(TlsError::Closed)?;
        verify::verify_session(session, self.identity.as_ref())
    }

    /// Move the stream to `Failed`, best-effort flushing any alert the
    /// backend queued, and hand the error back.
    fn fail(&mut self, err: TlsError) -> TlsError {
        if !err.is_fatal() {
            return err;
        }
        debug!("TLS stream failed in state {:?}: {err}", self.state);
        if matches!(err, TlsError::Handshake(_) | TlsError::Protocol(_)) {
            if let Err(e) = self.flush_outbound(TlsError::Protocol) {
                trace!("alert not delivered: {e}");
            }
        }
        if self.state != HandshakeState::Closed {
            self.state = HandshakeState::Failed;
            self.failure = Some(err.to_string());
        }
        err
    }

    fn failed_error(&self) -> TlsError {
        TlsError::Handshake(BackendError::new(
            "session-failed",
            self.failure
                .clone()
                .unwrap_or_else(|| "session previously failed".to_string()),
        ))
    }

    // -----------------------------------------------------------------------
    // I/O retry pump
    // -----------------------------------------------------------------------

    fn pump_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.session_mut()?.decrypt(buf).map_err(TlsError::Protocol)? {
                ReadOutcome::Data(n) => return Ok(n),
                ReadOutcome::Eof { notified } => {
                    trace!("end of stream (close-notify: {notified})");
                    return Ok(0);
                },
                ReadOutcome::WantRead => {},
            }

            // Key updates and similar post-handshake messages queue output.
            if self.session_mut()?.wants_write() {
                self.flush_outbound(TlsError::Protocol)?;
            }

            // Only reached with no plaintext buffered, so one feed can never
            // overflow the session's plaintext buffer.
            if self.pending < self.filled {
                self.feed_once().map_err(TlsError::Protocol)?;
            } else if self.eof {
                return Ok(0);
            } else if self.receive_ciphertext()? {
                self.feed_once().map_err(TlsError::Protocol)?;
            } else {
                self.eof = true;
                self.session_mut()?.peer_closed();
            }
        }
    }

    fn pump_write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.session_mut()?.encrypt(data).map_err(TlsError::Protocol)?;
            data = &data[n..];
            if n == 0 && !self.session_mut()?.wants_write() {
                return Err(TlsError::Protocol(BackendError::new(
                    "write-stalled",
                    "session accepted no plaintext and has nothing to send",
                )));
            }
            self.flush_outbound(TlsError::Protocol)?;
        }
        Ok(())
    }

    /// Drain every pending ciphertext byte to the transport.
    fn flush_outbound(&mut self, wrap: fn(BackendError) -> TlsError) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        while session.wants_write() {
            self.outbound.clear();
            if session.drain(&mut self.outbound).map_err(wrap)? == 0 {
                break;
            }
            trace!("sending {} ciphertext bytes", self.outbound.len());
            transport::send_all(&mut self.transport, &self.outbound)?;
        }
        Ok(())
    }

    /// Receive one chunk of ciphertext into the scratch buffer.
    ///
    /// Returns `false` when the transport reports end of stream.
    fn receive_ciphertext(&mut self) -> Result<bool> {
        loop {
            match self.transport.receive(&mut self.inbound) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    trace!("received {n} ciphertext bytes");
                    self.pending = 0;
                    self.filled = n;
                    return Ok(true);
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(WOULD_BLOCK_BACKOFF);
                },
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(TlsError::Transport(e)),
            }
        }
    }

    /// Offer buffered ciphertext to the session once.
    ///
    /// The session may take only part of it; the rest stays buffered until
    /// the caller has drained whatever plaintext this step produced.
    fn feed_once(&mut self) -> std::result::Result<(), BackendError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let n = session.feed(&self.inbound[self.pending..self.filled])?;
        if n == 0 {
            return Err(BackendError::new(
                "feed-stalled",
                "session refused buffered ciphertext",
            ));
        }
        self.pending += n;
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn TlsSession>> {
        self.session.as_mut().ok_or(TlsError::Closed)
    }
}

impl<T: Transport> Drop for TlsStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> Stream for TlsStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        TlsStream::read(self, buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_all(data)
    }

    fn close(&mut self) -> Result<()> {
        TlsStream::close(self);
        Ok(())
    }
}

impl<T: Transport> io::Read for TlsStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TlsStream::read(self, buf).map_err(Into::into)
    }
}

impl<T: Transport> io::Write for TlsStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state {
            HandshakeState::Established => Ok(self.flush_outbound(TlsError::Protocol)?),
            HandshakeState::Failed => Err(self.failed_error().into()),
            HandshakeState::Closed => Err(TlsError::Closed.into()),
            HandshakeState::NotStarted | HandshakeState::InProgress => Ok(()),
        }
    }
}
