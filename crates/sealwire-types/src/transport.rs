//! Byte transport abstraction.
//!
//! A [`Transport`] is an already-connected, bidirectional socket that moves
//! opaque bytes. The TLS engine drives it; it never opens or closes one on
//! its own.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// A connected byte socket.
///
/// `receive` returning `Ok(0)` means the peer closed its side. Errors of kind
/// [`io::ErrorKind::WouldBlock`] and [`io::ErrorKind::Interrupted`] are
/// transient: the caller may retry the same call. Every other error is
/// terminal for the connection.
pub trait Transport: Send {
    /// Send some prefix of `data`, returning how many bytes were taken.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Receive into `buf`, returning the byte count (0 = peer closed).
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the socket. Only ever called by the owner of the transport.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).receive(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).receive(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Blocking TCP transport.
///
/// On Unix an expired `SO_RCVTIMEO`/`SO_SNDTIMEO` surfaces as `WouldBlock`,
/// which would otherwise look transient. When a timeout is configured the
/// error is rewritten to `TimedOut` so it stays terminal.
impl Transport for TcpStream {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        match Write::write(self, data) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && self.write_timeout()?.is_some() => {
                Err(io::Error::new(io::ErrorKind::TimedOut, e))
            },
            other => other,
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Read::read(self, buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && self.read_timeout()?.is_some() => {
                Err(io::Error::new(io::ErrorKind::TimedOut, e))
            },
            other => other,
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Whether a transport error may be retried without losing data.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Send all of `data`, absorbing partial sends and transient errors.
///
/// A transport that accepts zero bytes is reported as `WriteZero`.
pub fn send_all<T: Transport + ?Sized>(transport: &mut T, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match transport.send(data) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport accepted no bytes",
                ));
            },
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(1));
            },
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
