//! Ground-side downlink client.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use super::{ACK, TOKEN_SEND, TOKEN_STORE};
use crate::packet::Packet;
use crate::{Error, Result};

/// Default time to wait for a response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Connects to a downlink server and issues store and send requests.
///
/// The server may push telemetry packets as soon as the connection is accepted;
/// read them with [Client::receive] before issuing requests.
pub struct Client {
    stream: TcpStream,
    timeout: Duration,
}

impl Client {
    /// # Errors
    /// [Error::Io] if the connection cannot be established.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(RESPONSE_TIMEOUT))?;
        debug!(peer = ?stream.peer_addr().ok(), "connected");
        Ok(Client {
            stream,
            timeout: RESPONSE_TIMEOUT,
        })
    }

    /// Time to wait for a response before giving up.
    ///
    /// # Errors
    /// [Error::Io] if the socket timeout cannot be set.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.timeout = timeout;
        Ok(self)
    }

    /// # Errors
    /// [Error::Io] if the peer address cannot be read.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Ask the server to queue `packet` and wait for the acknowledgment.
    ///
    /// # Errors
    /// [Error::Timeout] if no acknowledgment arrives, [Error::Malformed] if the reply is
    /// not exactly `RDY`, [Error::Io] for any other socket error.
    pub fn store(&mut self, packet: &Packet) -> Result<()> {
        let mut msg = Vec::with_capacity(1 + packet.len());
        msg.push(TOKEN_STORE);
        msg.extend_from_slice(packet.as_bytes());
        self.stream.write_all(&msg)?;
        let mut ack = [0u8; ACK.len()];
        self.stream
            .read_exact(&mut ack)
            .map_err(|err| self.timeout_or(err))?;
        if &ack != ACK {
            return Err(Error::Malformed(format!("expected RDY, got {ack:02x?}")));
        }
        trace!(%packet, "stored");
        Ok(())
    }

    /// Request the oldest queued packet. Returns `None` if the server sent nothing
    /// before the timeout, which is how an empty queue is reported.
    ///
    /// # Errors
    /// See [Client::receive].
    pub fn request(&mut self) -> Result<Option<Packet>> {
        self.stream.write_all(&[TOKEN_SEND])?;
        self.receive()
    }

    /// Read one framed packet pushed by the server. Returns `None` if no bytes arrive
    /// before the timeout.
    ///
    /// # Errors
    /// [Error::Timeout] if the timeout expires part way through a packet; the stream is
    /// then out of step and the client should be dropped. [Error::Io] for other socket
    /// errors, including a reply that is not a framed packet.
    pub fn receive(&mut self) -> Result<Option<Packet>> {
        let mut first = [0u8; 1];
        loop {
            match self.stream.read(&mut first) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if is_timeout(&err) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }

        let zult = Packet::read((&first[..]).chain(&mut self.stream));
        let packet = zult.map_err(|err| self.timeout_or(err))?;
        trace!(%packet, "received");
        Ok(Some(packet))
    }

    fn timeout_or(&self, err: io::Error) -> Error {
        if is_timeout(&err) {
            Error::Timeout(self.timeout)
        } else {
            Error::Io(err)
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
