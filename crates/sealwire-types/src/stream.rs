//! Consumer-facing byte stream contract.
//!
//! Text codecs and protocol clients talk to a [`Stream`] and do not care
//! whether bytes are encrypted underneath. [`PlainStream`] is the
//! unencrypted implementation over any [`Transport`].

use std::ops::Range;

use crate::error::{Result, TlsError};
use crate::transport::{self, Transport};

/// A bidirectional byte stream.
pub trait Stream {
    /// Read into `buf`. Returns 0 only on orderly end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data`, or fail.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Close the stream. Calling this more than once is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Read into `buf[offset..offset + max_len]`.
    fn read_range(&mut self, buf: &mut [u8], offset: usize, max_len: usize) -> Result<usize> {
        let region = checked_region(buf.len(), offset, max_len)?;
        if region.is_empty() {
            return Ok(0);
        }
        self.read(&mut buf[region])
    }

    /// Write `buf[offset..offset + len]`.
    fn write_range(&mut self, buf: &[u8], offset: usize, len: usize) -> Result<()> {
        let region = checked_region(buf.len(), offset, len)?;
        self.write(&buf[region])
    }
}

/// Validate an `(offset, len)` pair against a buffer of `buf_len` bytes.
pub fn checked_region(buf_len: usize, offset: usize, len: usize) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= buf_len => Ok(offset..end),
        _ => Err(TlsError::InvalidRange {
            offset,
            len,
            buf_len,
        }),
    }
}

/// Unencrypted [`Stream`] over a transport.
pub struct PlainStream<T: Transport> {
    transport: T,
    closed: bool,
}

impl<T: Transport> PlainStream<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            closed: false,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> Stream for PlainStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(TlsError::Closed);
        }
        loop {
            match self.transport.receive(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if transport::is_transient(e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TlsError::Closed);
        }
        transport::send_all(&mut self.transport, data)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.transport.close()?;
        }
        Ok(())
    }
}
