//! TCP downlink server.
//!
//! [Server] accepts connections on a listener and drives each one through a
//! [Connection] by translating socket reads into [Event]s. Connections are served one
//! at a time; a [crossbeam] channel signals shutdown. Socket reads and writes both
//! carry timeouts so a silent or non-reading peer cannot stall the loop.
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, TryRecvError};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, span, warn, Level};
use typed_builder::TypedBuilder;

use super::transport::{TcpTransport, SEND_BUFFER_SIZE};
use super::{Connection, ConnectionStats, Event, SEND_TIMEOUT};
use crate::packet::{Packet, MAX_PACKET_SIZE};
use crate::queue::SharedQueue;
use crate::{Error, Result};

/// Server tunables.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ServerOpts {
    /// Socket read timeout; bounds how long a shutdown signal can go unnoticed.
    #[builder(default = Duration::from_millis(100))]
    pub read_timeout: Duration,
    /// Time to wait for send buffer space, and the socket write timeout.
    #[builder(default = SEND_TIMEOUT)]
    pub send_timeout: Duration,
    /// Interval between accept polls.
    #[builder(default = Duration::from_millis(10))]
    pub poll_interval: Duration,
    /// Transport send buffer size in bytes.
    #[builder(default = SEND_BUFFER_SIZE)]
    pub send_buffer: usize,
}

impl Default for ServerOpts {
    fn default() -> Self {
        ServerOpts::builder().build()
    }
}

/// Summary of one served connection.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub id: u64,
    pub peer: Option<SocketAddr>,
    pub stats: ConnectionStats,
    /// Events that failed, including the one that closed the connection.
    pub errors: usize,
}

pub struct Server {
    listener: TcpListener,
    queue: SharedQueue,
    telemetry: Vec<Packet>,
    opts: ServerOpts,
    next_id: u64,
}

impl Server {
    /// Bind a listener at `addr`.
    ///
    /// # Errors
    /// [Error::Io] if the listener cannot be bound or configured.
    pub fn bind<A: ToSocketAddrs>(addr: A, queue: SharedQueue, opts: ServerOpts) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Server {
            listener,
            queue,
            telemetry: Vec::new(),
            opts,
            next_id: 0,
        })
    }

    /// Packets sent, in order, to every client as soon as it connects.
    #[must_use]
    pub fn with_telemetry<I>(mut self, packets: I) -> Self
    where
        I: IntoIterator<Item = Packet>,
    {
        self.set_telemetry(packets);
        self
    }

    /// Replace the telemetry packets sent to subsequent connections.
    pub fn set_telemetry<I>(&mut self, packets: I)
    where
        I: IntoIterator<Item = Packet>,
    {
        self.telemetry = packets.into_iter().collect();
    }

    /// # Errors
    /// [Error::Io] if the listener address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until a message arrives on `shutdown` or its
    /// sender is dropped. Returns a summary of every connection served.
    ///
    /// # Errors
    /// [Error::Io] if accepting fails for a reason other than no pending connection.
    pub fn serve(&mut self, shutdown: &Receiver<()>) -> Result<Vec<Served>> {
        info!(addr = ?self.listener.local_addr().ok(), "serving downlink");
        let mut served = Vec::new();
        loop {
            if shutdown_requested(shutdown) {
                debug!("shutdown requested");
                break;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let summary = self.serve_connection(stream, Some(peer), shutdown)?;
                    served.push(summary);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.opts.poll_interval);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(served)
    }

    /// Serve a single accepted connection until it closes or shutdown is requested.
    ///
    /// # Errors
    /// [Error::Io] if the socket cannot be configured. Request failures are logged and
    /// counted in the returned summary.
    pub fn serve_connection(
        &mut self,
        stream: TcpStream,
        peer: Option<SocketAddr>,
        shutdown: &Receiver<()>,
    ) -> Result<Served> {
        let id = self.next_id;
        self.next_id += 1;
        let span = span!(Level::TRACE, "connection", id, peer = ?peer);
        let _guard = span.enter();

        // accepted sockets may inherit the listener's non-blocking mode
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.opts.read_timeout))?;
        stream.set_write_timeout(Some(self.opts.send_timeout))?;
        let mut reader = stream.try_clone()?;
        let transport = TcpTransport::with_buffer_size(stream, self.opts.send_buffer);
        let mut conn = Connection::new(id, transport, self.queue.clone())
            .with_telemetry(self.telemetry.clone())
            .with_send_timeout(self.opts.send_timeout);

        let mut errors = 0;
        conn.connect();
        dispatch(&mut conn, Event::Connected, &mut errors);

        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        while !conn.is_closed() {
            if shutdown_requested(shutdown) {
                debug!("shutdown requested; closing connection");
                conn.close();
                break;
            }
            let event = match reader.read(&mut buf) {
                Ok(0) => Event::Closed,
                Ok(num) => Event::DataReceived(buf[..num].to_vec()),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(err) => Event::Errored(err),
            };
            dispatch(&mut conn, event, &mut errors);
        }

        let stats = conn.stats().clone();
        debug!(?stats, errors, "connection done");
        Ok(Served {
            id,
            peer,
            stats,
            errors,
        })
    }
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

fn dispatch(conn: &mut Connection<TcpTransport>, event: Event, errors: &mut usize) {
    if let Err(err) = conn.handle(event) {
        *errors += 1;
        match err {
            Error::QueueFull { capacity } => {
                error!(capacity, "packet queue exhausted; store dropped");
            }
            err if err.is_connection_fault() => warn!("connection fault: {err}"),
            err => warn!("request failed: {err}"),
        }
    }
    // TcpTransport output is a blocking write, so everything handed off is sent
    let num = conn.take_unconfirmed();
    if num > 0 && !conn.is_closed() {
        if let Err(err) = conn.handle(Event::Sent(num)) {
            warn!("sent event failed: {err}");
        }
    }
}
