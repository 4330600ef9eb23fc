//! Transport layer beneath the downlink protocol.
//!
//! The transport is a reliable, ordered byte stream. Writes are queued into a
//! bounded send buffer and pushed to the peer by [Transport::output]; callers check
//! [Transport::send_capacity] before writing. An output that cannot complete in time
//! fails with ``std::io::ErrorKind::WouldBlock`` or ``std::io::ErrorKind::TimedOut``.
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default send buffer size in bytes.
pub const SEND_BUFFER_SIZE: usize = 8192;

pub trait Transport {
    /// Bytes that can currently be queued with [Transport::write].
    fn send_capacity(&self) -> usize;

    /// Queue `data` for sending. Fails if `data` exceeds [Transport::send_capacity].
    ///
    /// # Errors
    /// Any transport error.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Push queued bytes to the peer, returning how many were handed off.
    ///
    /// # Errors
    /// Any transport error.
    fn output(&mut self) -> io::Result<usize>;

    /// Release the connection.
    ///
    /// # Errors
    /// Any transport error.
    fn close(&mut self) -> io::Result<()>;
}

fn no_room(len: usize, capacity: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::WouldBlock,
        format!("{len} bytes exceed send capacity of {capacity}"),
    )
}

/// [Transport] over a TCP stream.
pub struct TcpTransport {
    stream: TcpStream,
    pending: Vec<u8>,
    buffer_size: usize,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_buffer_size(stream, SEND_BUFFER_SIZE)
    }

    pub fn with_buffer_size(stream: TcpStream, buffer_size: usize) -> Self {
        TcpTransport {
            stream,
            pending: Vec::with_capacity(buffer_size),
            buffer_size,
        }
    }
}

impl Transport for TcpTransport {
    fn send_capacity(&self) -> usize {
        self.buffer_size - self.pending.len()
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > self.send_capacity() {
            return Err(no_room(data.len(), self.send_capacity()));
        }
        self.pending.extend_from_slice(data);
        Ok(())
    }

    fn output(&mut self) -> io::Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        self.stream.write_all(&self.pending)?;
        self.stream.flush()?;
        let num = self.pending.len();
        self.pending.clear();
        Ok(num)
    }

    fn close(&mut self) -> io::Result<()> {
        self.pending.clear();
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }
}

/// In-memory [Transport] recording everything sent.
///
/// Clones share state, so a test can keep one handle while a connection owns another.
#[derive(Clone, Default)]
pub struct MemTransport {
    inner: Arc<Mutex<MemTransportInner>>,
}

#[derive(Default)]
struct MemTransportInner {
    capacity: Option<usize>,
    pending: Vec<u8>,
    sent: Vec<u8>,
    stalled: bool,
    closed: bool,
}

impl MemTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemTransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Limit the send buffer to `capacity` bytes. Unlimited by default.
    pub fn set_capacity(&self, capacity: usize) {
        self.lock().capacity = Some(capacity);
    }

    /// While stalled, [Transport::output] fails with ``std::io::ErrorKind::TimedOut`` as
    /// a socket with a write timeout does when the peer stops reading.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// All bytes output so far.
    #[must_use]
    pub fn sent(&self) -> Vec<u8> {
        self.lock().sent.clone()
    }

    /// Take all bytes output so far.
    #[must_use]
    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().sent)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Transport for MemTransport {
    fn send_capacity(&self) -> usize {
        let inner = self.lock();
        match inner.capacity {
            Some(cap) => cap.saturating_sub(inner.pending.len()),
            None => usize::MAX,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let capacity = self.send_capacity();
        let mut inner = self.lock();
        if inner.closed {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if data.len() > capacity {
            return Err(no_room(data.len(), capacity));
        }
        inner.pending.extend_from_slice(data);
        Ok(())
    }

    fn output(&mut self) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.stalled && !inner.pending.is_empty() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let pending = std::mem::take(&mut inner.pending);
        inner.sent.extend_from_slice(&pending);
        Ok(pending.len())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut inner = self.lock();
        inner.pending.clear();
        inner.closed = true;
        Ok(())
    }
}
