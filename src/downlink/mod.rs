//! Downlink request/response protocol.
//!
//! A remote client drives the downlink with single-token requests written to a
//! reliable, ordered byte stream:
//!
//! | Request | Bytes | Response |
//! |---------|-------|----------|
//! | store   | `R` followed by a framed packet | `RDY` once the packet is queued |
//! | send    | `S` | the oldest queued packet, or nothing if the queue is empty |
//!
//! Requests may arrive split across reads or several to a read; each connection
//! buffers received bytes and takes complete requests off the front. A store whose
//! packet header is malformed or oversized is rejected and the buffered input is
//! discarded, but the connection stays open. Any other token is a protocol error and
//! closes the connection.
//!
//! Each connection is an explicit [Connection] value driven by [Event]s from an
//! event-dispatch loop, see [server::Server].
use std::fmt::Display;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::packet::{Header, Packet, MAX_PACKET_SIZE};
use crate::queue::SharedQueue;
use crate::{Error, Result};

pub mod client;
pub mod server;
pub mod transport;

pub use transport::Transport;

/// Store request token.
pub const TOKEN_STORE: u8 = b'R';
/// Send request token.
pub const TOKEN_SEND: u8 = b'S';
/// Store acknowledgment.
pub const ACK: &[u8; 3] = b"RDY";

/// Default time to wait for send buffer space.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Queue this packet.
    Store(Packet),
    Send,
}

impl Request {
    /// Take the first complete request off the front of `buf`, returning it and the
    /// number of bytes it occupies. Returns `None` if more bytes are needed.
    ///
    /// # Errors
    /// * [Error::Protocol] if the first byte is not a request token.
    /// * [Error::Malformed] if a store token is not followed by a packet header.
    /// * [Error::SizeViolation] if a store header declares more than [MAX_PACKET_SIZE]
    ///   bytes.
    ///
    /// # Example
    /// ```
    /// use downlink::downlink::Request;
    ///
    /// let buf = [b'R', 0x52, 0x00, 0x00, 0x01, 0xff, b'S'];
    /// let (request, used) = Request::parse(&buf).unwrap().unwrap();
    /// assert!(matches!(request, Request::Store(_)));
    /// assert_eq!(used, 6);
    /// assert_eq!(Request::parse(&buf[used..]).unwrap(), Some((Request::Send, 1)));
    /// ```
    pub fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>> {
        let Some(&token) = buf.first() else {
            return Ok(None);
        };
        match token {
            TOKEN_SEND => Ok(Some((Request::Send, 1))),
            TOKEN_STORE => {
                let rest = &buf[1..];
                if rest.len() < Header::LEN {
                    return Ok(None);
                }
                let Some(header) = Header::decode(rest) else {
                    return Err(Error::Malformed(format!(
                        "store token followed by {:#04x}, not a packet marker",
                        rest[0]
                    )));
                };
                let total = Header::LEN + header.len as usize;
                if total > MAX_PACKET_SIZE {
                    return Err(Error::SizeViolation {
                        len: total,
                        max: MAX_PACKET_SIZE,
                    });
                }
                if rest.len() < total {
                    return Ok(None);
                }
                let packet = Packet::from_bytes(rest[..total].to_vec())?;
                Ok(Some((Request::Store(packet), 1 + total)))
            }
            token => Err(Error::Protocol { token }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transport events delivered to a [Connection].
#[derive(Debug)]
pub enum Event {
    /// The transport connection is established.
    Connected,
    /// Bytes arrived from the peer.
    DataReceived(Vec<u8>),
    /// The transport confirmed delivery of this many bytes.
    Sent(usize),
    /// The peer closed the connection.
    Closed,
    Errored(io::Error),
}

/// Counters for one connection.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Packets accepted by store requests.
    pub stored: usize,
    /// Packets written in response to send requests, telemetry included.
    pub sent: usize,
    /// Send requests that found the queue empty.
    pub empty: usize,
    /// Bytes confirmed by the transport.
    pub confirmed: usize,
}

/// Protocol state for one downlink connection.
///
/// The connection owns no queue state; it holds a handle to the shared queue.
///
/// # Example
/// ```
/// use downlink::downlink::{Connection, Event, transport::MemTransport};
/// use downlink::queue::SharedQueue;
///
/// let queue = SharedQueue::new(8);
/// let transport = MemTransport::new();
/// let mut conn = Connection::new(1, transport.clone(), queue.clone());
/// conn.connect();
/// conn.handle(Event::Connected).unwrap();
///
/// conn.handle(Event::DataReceived(vec![b'R', 0x52, 0x00, 0x00, 0x01, 0xff])).unwrap();
/// assert_eq!(transport.take_sent(), b"RDY");
///
/// conn.handle(Event::DataReceived(b"S".to_vec())).unwrap();
/// assert_eq!(transport.take_sent(), vec![0x52, 0x00, 0x00, 0x01, 0xff]);
/// ```
pub struct Connection<T>
where
    T: Transport,
{
    id: u64,
    state: ConnectionState,
    transport: T,
    queue: SharedQueue,
    telemetry: Vec<Packet>,
    send_timeout: Duration,
    poll_interval: Duration,
    unconfirmed: usize,
    // received bytes not yet forming a complete request
    pending: Vec<u8>,
    stats: ConnectionStats,
}

impl<T> Connection<T>
where
    T: Transport,
{
    pub fn new(id: u64, transport: T, queue: SharedQueue) -> Self {
        Connection {
            id,
            state: ConnectionState::Disconnected,
            transport,
            queue,
            telemetry: Vec::new(),
            send_timeout: SEND_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            unconfirmed: 0,
            pending: Vec::with_capacity(MAX_PACKET_SIZE + 1),
            stats: ConnectionStats::default(),
        }
    }

    /// Packets transmitted, in order, as soon as the connection is established.
    #[must_use]
    pub fn with_telemetry<I>(mut self, packets: I) -> Self
    where
        I: IntoIterator<Item = Packet>,
    {
        self.telemetry = packets.into_iter().collect();
        self
    }

    /// Time to wait for send buffer space before failing a write.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    #[must_use]
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Bytes received but not yet forming a complete request.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Bytes written since the last [Event::Sent]; resets the count.
    pub fn take_unconfirmed(&mut self) -> usize {
        std::mem::take(&mut self.unconfirmed)
    }

    /// Begin establishing the connection.
    pub fn connect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
        }
    }

    /// Dispatch one transport event.
    ///
    /// Received bytes may hold several requests; all complete requests are handled.
    /// If more than one fails, the first error is returned.
    ///
    /// # Errors
    /// * [Error::QueueFull] if a store request finds the queue full; the connection stays
    ///   open and no acknowledgment is sent.
    /// * [Error::Malformed] or [Error::SizeViolation] for a store without a valid packet
    ///   header; buffered input is discarded and the connection stays open.
    /// * [Error::Protocol] for an unrecognized token; the connection is closed.
    /// * [Error::Transport] or [Error::Timeout] if a response cannot be written; the
    ///   connection is closed.
    pub fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Connected => self.on_connected(),
            Event::DataReceived(dat) => self.on_data(&dat),
            Event::Sent(num) => {
                trace!(conn = self.id, bytes = num, "sent");
                self.stats.confirmed += num;
                Ok(())
            }
            Event::Closed => {
                debug!(conn = self.id, "peer closed");
                self.close();
                Ok(())
            }
            Event::Errored(err) => {
                warn!(conn = self.id, "transport error: {err}");
                self.close();
                Err(Error::Transport(err))
            }
        }
    }

    fn on_connected(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Connected;
        debug!(conn = self.id, "connected");

        for packet in std::mem::take(&mut self.telemetry) {
            debug!(conn = self.id, %packet, "sending telemetry");
            self.respond(packet.as_bytes())?;
            self.stats.sent += 1;
        }
        Ok(())
    }

    fn on_data(&mut self, dat: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Connected {
            warn!(conn = self.id, state = %self.state, bytes = dat.len(), "data while not connected; dropping");
            return Ok(());
        }
        self.pending.extend_from_slice(dat);

        let mut first_err = None;
        while !self.is_closed() {
            let request = match Request::parse(&self.pending) {
                Ok(Some((request, used))) => {
                    self.pending.drain(..used);
                    request
                }
                Ok(None) => break,
                Err(Error::Protocol { token }) => {
                    warn!(conn = self.id, token, "unrecognized request token; closing");
                    self.pending.clear();
                    self.close();
                    return first_err.map_or(Err(Error::Protocol { token }), Err);
                }
                Err(err) => {
                    warn!(conn = self.id, discarded = self.pending.len(), "bad store request: {err}");
                    self.pending.clear();
                    first_err.get_or_insert(err);
                    break;
                }
            };

            let zult = match request {
                Request::Store(packet) => self.store(packet),
                Request::Send => self.send(),
            };
            if let Err(err) = zult {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn store(&mut self, packet: Packet) -> Result<()> {
        trace!(conn = self.id, %packet, "storing");
        self.queue.push(packet)?;
        self.stats.stored += 1;
        self.respond(ACK)
    }

    fn send(&mut self) -> Result<()> {
        match self.queue.try_pop() {
            Some(packet) => {
                trace!(conn = self.id, %packet, remaining = self.queue.len(), "sending");
                self.respond(packet.as_bytes())?;
                self.stats.sent += 1;
            }
            None => {
                debug!(conn = self.id, "send request with empty queue");
                self.stats.empty += 1;
            }
        }
        Ok(())
    }

    /// Flow-controlled write: wait for send buffer space for all of `dat`, then write
    /// and output it. Failures close the connection.
    fn respond(&mut self, dat: &[u8]) -> Result<()> {
        let zult = self.write_flow_controlled(dat);
        if let Err(ref err) = zult {
            warn!(conn = self.id, "write failed: {err}; closing");
            self.close();
        }
        zult
    }

    fn write_flow_controlled(&mut self, dat: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.send_timeout;
        while self.transport.send_capacity() < dat.len() {
            // queued bytes may be all that is holding the buffer
            self.output()?;
            if self.transport.send_capacity() >= dat.len() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(self.send_timeout));
            }
            thread::sleep(self.poll_interval);
        }
        self.transport.write(dat).map_err(Error::Transport)?;
        let num = self.output()?;
        self.unconfirmed += num;
        Ok(())
    }

    fn output(&mut self) -> Result<usize> {
        self.transport.output().map_err(|err| match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                Error::Timeout(self.send_timeout)
            }
            _ => Error::Transport(err),
        })
    }

    /// Close the connection and release the transport.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(err) = self.transport.close() {
            debug!(conn = self.id, "error closing transport: {err}");
        }
    }
}
