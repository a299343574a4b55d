//! Shared test fixtures: in-memory transports, a tiny PKI, and a scripted
//! backend for driving the state machine without real cryptography.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, date_time_ymd,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use sealwire_types::config::TlsVersion;
use sealwire_types::error::{BackendError, Result, TlsError, VerifyFailure};
use sealwire_types::transport::Transport;

use crate::backend::{PeerIdentity, ReadOutcome, ServerIdentity, TlsProvider, TlsSession, Want};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// In-memory duplex transport
// ---------------------------------------------------------------------------

/// One end of an in-memory byte pipe. `receive` blocks until the peer sends
/// or drops its end, then returns up to `max_chunk` bytes spanning as many
/// queued sends as fit.
pub(crate) struct PipeEnd {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    /// Largest chunk moved per `send`/`receive` call.
    max_chunk: usize,
    pub sent: Arc<AtomicUsize>,
    pub received: Arc<AtomicUsize>,
}

/// A connected pair of pipe ends moving at most `max_chunk` bytes per call.
pub(crate) fn duplex(max_chunk: usize) -> (PipeEnd, PipeEnd) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    let end = |tx, rx| PipeEnd {
        tx: Some(tx),
        rx,
        pending: VecDeque::new(),
        max_chunk,
        sent: Arc::new(AtomicUsize::new(0)),
        received: Arc::new(AtomicUsize::new(0)),
    };
    (end(a_tx, a_rx), end(b_tx, b_rx))
}

impl Transport for PipeEnd {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let n = data.len().min(self.max_chunk);
        tx.send(data[..n].to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        self.sent.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => return Ok(0),
            }
        }
        // Coalesce whatever else is already queued, like a TCP socket would.
        let want = buf.len().min(self.max_chunk);
        while self.pending.len() < want {
            match self.rx.try_recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(_) => break,
            }
        }
        let n = want.min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        self.received.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Transport replaying a fixed list of receive results and recording sends.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    pub replies: VecDeque<io::Result<Vec<u8>>>,
    pub sent: Vec<u8>,
    pub receives: usize,
    pub closes: usize,
}

impl ScriptedTransport {
    pub fn with_replies(replies: impl IntoIterator<Item = io::Result<Vec<u8>>>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            ..Self::default()
        }
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.sent.extend_from_slice(data);
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.receives += 1;
        match self.replies.pop_front() {
            None => Ok(0),
            Some(Err(e)) => Err(e),
            Some(Ok(mut chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.replies.push_front(Ok(chunk.split_off(n)));
                }
                Ok(n)
            },
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.closes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Certificate fixtures
// ---------------------------------------------------------------------------

/// A throwaway certificate authority.
pub(crate) struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn root(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Issue a server identity valid for `names`.
    pub fn issue(&self, names: &[&str]) -> ServerIdentity {
        self.issue_with(names, |_| {})
    }

    /// Issue a server identity that expired long ago.
    pub fn issue_expired(&self, names: &[&str]) -> ServerIdentity {
        self.issue_with(names, |params| {
            params.not_before = date_time_ymd(2000, 1, 1);
            params.not_after = date_time_ymd(2001, 1, 1);
        })
    }

    fn issue_with(
        &self,
        names: &[&str],
        tweak: impl FnOnce(&mut CertificateParams),
    ) -> ServerIdentity {
        let sans: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(sans).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, names.first().copied().unwrap_or("leaf"));
        tweak(&mut params);

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        ServerIdentity::new(
            vec![cert.der().clone(), self.root()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }
}

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// Call counters shared between a test and its scripted sessions.
#[derive(Default)]
pub(crate) struct Calls {
    pub handshakes: AtomicUsize,
    pub feeds: AtomicUsize,
    pub verifies: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// How a scripted session behaves.
#[derive(Clone, Default)]
pub(crate) struct Script {
    /// Bytes queued for sending when the handshake starts.
    pub hello: Vec<u8>,
    /// Number of `feed` calls the handshake needs before it completes.
    pub reads_needed: usize,
    /// Fail the handshake with this error once `reads_needed` is reached.
    pub handshake_error: Option<BackendError>,
    /// Result of peer verification.
    pub verify_failure: Option<VerifyFailure>,
}

pub(crate) struct ScriptedProvider {
    pub script: Script,
    pub calls: Arc<Calls>,
}

impl ScriptedProvider {
    pub fn new(script: Script) -> (Self, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        (
            Self {
                script,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    fn session(&self) -> Box<dyn TlsSession> {
        Box::new(ScriptedSession {
            outbound: self.script.hello.clone(),
            reads_left: self.script.reads_needed,
            script: self.script.clone(),
            calls: Arc::clone(&self.calls),
            plaintext: VecDeque::new(),
            handshake_done: false,
            closed: false,
        })
    }
}

impl TlsProvider for ScriptedProvider {
    fn client_session(&self, _identity: &PeerIdentity) -> Result<Box<dyn TlsSession>> {
        Ok(self.session())
    }

    fn server_session(&self) -> Result<Box<dyn TlsSession>> {
        Ok(self.session())
    }
}

/// After the handshake, every fed byte is echoed back as plaintext and
/// every encrypted byte is sent unchanged.
struct ScriptedSession {
    script: Script,
    calls: Arc<Calls>,
    outbound: Vec<u8>,
    reads_left: usize,
    plaintext: VecDeque<u8>,
    handshake_done: bool,
    closed: bool,
}

impl TlsSession for ScriptedSession {
    fn handshake(&mut self) -> std::result::Result<Want, BackendError> {
        self.calls.handshakes.fetch_add(1, Ordering::SeqCst);
        if !self.outbound.is_empty() {
            return Ok(Want::Write);
        }
        if self.reads_left > 0 {
            return Ok(Want::Read);
        }
        if let Some(e) = self.script.handshake_error.clone() {
            return Err(e);
        }
        self.handshake_done = true;
        Ok(Want::Nothing)
    }

    fn feed(&mut self, ciphertext: &[u8]) -> std::result::Result<usize, BackendError> {
        self.calls.feeds.fetch_add(1, Ordering::SeqCst);
        if self.handshake_done {
            self.plaintext.extend(ciphertext);
        } else {
            self.reads_left = self.reads_left.saturating_sub(1);
        }
        Ok(ciphertext.len())
    }

    fn peer_closed(&mut self) {
        self.closed = true;
    }

    fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn drain(&mut self, out: &mut Vec<u8>) -> std::result::Result<usize, BackendError> {
        let n = self.outbound.len();
        out.append(&mut self.outbound);
        Ok(n)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> std::result::Result<usize, BackendError> {
        self.outbound.extend_from_slice(plaintext);
        Ok(plaintext.len())
    }

    fn decrypt(&mut self, buf: &mut [u8]) -> std::result::Result<ReadOutcome, BackendError> {
        if self.plaintext.is_empty() {
            return Ok(if self.closed {
                ReadOutcome::Eof { notified: false }
            } else {
                ReadOutcome::WantRead
            });
        }
        let n = buf.len().min(self.plaintext.len());
        for (slot, byte) in buf.iter_mut().zip(self.plaintext.drain(..n)) {
            *slot = byte;
        }
        Ok(ReadOutcome::Data(n))
    }

    fn verify_peer(&self, _name: &ServerName<'static>) -> Result<()> {
        self.calls.verifies.fetch_add(1, Ordering::SeqCst);
        match self.script.verify_failure {
            None => Ok(()),
            Some(reason) => Err(TlsError::verification(reason, "scripted")),
        }
    }

    fn shutdown(&mut self) {
        self.calls.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.outbound.extend_from_slice(b"<close-notify>");
    }

    fn protocol_version(&self) -> Option<TlsVersion> {
        self.handshake_done.then_some(TlsVersion::Tls13)
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        None
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        None
    }
}

pub(crate) fn verified(host: &str) -> PeerIdentity {
    PeerIdentity::Verified(ServerName::try_from(host.to_owned()).unwrap())
}
