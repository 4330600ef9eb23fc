//! Packet framing.
//!
//! Every packet placed on the downlink is self-describing:
//!
//! ```text
//! +--------+------+-------------+-----------------+
//! | marker | type | length (BE) | payload         |
//! | 0x52   | u8   | u16         | `length` bytes  |
//! +--------+------+-------------+-----------------+
//! ```
//!
//! The marker never varies. A whole packet never exceeds [MAX_PACKET_SIZE] bytes.
use std::fmt::Display;
use std::io::{Read, Result as IOResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Framing sentinel at the start of every packet.
pub const MARKER: u8 = 0x52;
/// Maximum size of a framed packet, header included.
pub const MAX_PACKET_SIZE: usize = 134;
/// Largest payload that fits in a packet.
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - Header::LEN;

/// Payload is big-endian transform coefficients.
pub const TYPE_COEFFICIENTS: u8 = 0;
/// Payload is the accelerator bandwidth in bytes per second.
pub const TYPE_BANDWIDTH: u8 = 1;
/// Payload is the compression ratio.
pub const TYPE_RATIO: u8 = 2;

/// Packet header.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub marker: u8,
    pub packet_type: u8,
    /// Number of payload bytes following the header.
    pub len: u16,
}

impl Header {
    /// Size of a ``Header``
    pub const LEN: usize = 4;

    /// Decode from bytes. Returns `None` if there are not enough bytes to construct the
    /// header or the first byte is not [MARKER].
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN || buf[0] != MARKER {
            return None;
        }
        Some(Header {
            marker: buf[0],
            packet_type: buf[1],
            len: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::LEN] {
        let len = self.len.to_be_bytes();
        [self.marker, self.packet_type, len[0], len[1]]
    }
}

/// A single framed packet.
///
/// `data` holds the complete wire bytes, header included, so a packet can be handed
/// to the transport without re-encoding.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub data: Vec<u8>,
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet{{type: {}, data:[len={}]}}",
            self.header.packet_type,
            self.data.len()
        )
    }
}

impl Packet {
    /// Payload bytes following the header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[Header::LEN..]
    }

    #[must_use]
    pub fn packet_type(&self) -> u8 {
        self.header.packet_type
    }

    /// Total framed size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Decode from bytes. Returns `None` if there are not enough bytes to construct the
    /// header or if there are not enough bytes to construct the [Packet] of the length
    /// indicated by the header. Extra trailing bytes are ignored.
    #[must_use]
    pub fn decode(dat: &[u8]) -> Option<Packet> {
        let header = Header::decode(dat)?;
        let total = Header::LEN + header.len as usize;
        if dat.len() < total {
            return None;
        }
        Some(Packet {
            header,
            data: dat[..total].to_vec(),
        })
    }

    /// Take ownership of a complete framed packet.
    ///
    /// # Errors
    /// [Error::SizeViolation] if the bytes exceed [MAX_PACKET_SIZE], [Error::Malformed]
    /// if the header is missing or its length does not match the trailing byte count.
    pub fn from_bytes(data: Vec<u8>) -> Result<Packet> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(Error::SizeViolation {
                len: data.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        let Some(header) = Header::decode(&data) else {
            return Err(Error::Malformed(format!(
                "no packet header in {} bytes",
                data.len()
            )));
        };
        if header.len as usize != data.len() - Header::LEN {
            return Err(Error::Malformed(format!(
                "header length {} but {} payload bytes",
                header.len,
                data.len() - Header::LEN
            )));
        }
        Ok(Packet { header, data })
    }

    /// Read a single [Packet].
    ///
    /// # Errors
    /// Any ``std::io::Error`` reading. A missing marker is reported as
    /// ``std::io::ErrorKind::InvalidData``.
    pub fn read<R>(mut r: R) -> IOResult<Packet>
    where
        R: Read,
    {
        let mut buf = [0u8; Header::LEN];
        r.read_exact(&mut buf)?;
        let Some(header) = Header::decode(&buf) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected marker {MARKER:#04x}, got {:#04x}", buf[0]),
            ));
        };
        let mut data = vec![0u8; Header::LEN + header.len as usize];
        data[..Header::LEN].copy_from_slice(&buf);
        r.read_exact(&mut data[Header::LEN..])?;

        Ok(Packet { header, data })
    }
}

/// Frame `payload` into a packet of `packet_type`.
///
/// # Errors
/// [Error::SizeViolation] if the framed packet would exceed [MAX_PACKET_SIZE].
///
/// # Example
/// ```
/// use downlink::packet::{assemble, TYPE_COEFFICIENTS};
///
/// let packet = assemble(&[0xab, 0xcd], TYPE_COEFFICIENTS).unwrap();
/// assert_eq!(packet.as_bytes(), &[0x52, 0x00, 0x00, 0x02, 0xab, 0xcd]);
/// ```
pub fn assemble(payload: &[u8], packet_type: u8) -> Result<Packet> {
    let total = Header::LEN + payload.len();
    if total > MAX_PACKET_SIZE {
        return Err(Error::SizeViolation {
            len: total,
            max: MAX_PACKET_SIZE,
        });
    }
    let header = Header {
        marker: MARKER,
        packet_type,
        // bounded by MAX_PAYLOAD above
        len: payload.len() as u16,
    };
    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(&header.encode());
    data.extend_from_slice(payload);

    Ok(Packet { header, data })
}

pub struct PacketReaderIter<R>
where
    R: Read,
{
    pub reader: R,
}

impl<R> Iterator for PacketReaderIter<R>
where
    R: Read,
{
    type Item = IOResult<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        match Packet::read(&mut self.reader) {
            Ok(p) => Some(Ok(p)),
            Err(err) => {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    return None;
                }
                Some(Err(err))
            }
        }
    }
}

/// Return an iterator providing [Packet]s read from a stream of back-to-back framed
/// packets, such as the bytes a downlink client receives.
///
/// # Examples
/// ```
/// use downlink::packet::read_packets;
///
/// let dat: &[u8] = &[
///     0x52, 0x00, 0x00, 0x02, 0xab, 0xcd,
///     0x52, 0x02, 0x00, 0x01, 0x07,
/// ];
/// let packets: Vec<_> = read_packets(dat).filter_map(Result::ok).collect();
/// assert_eq!(packets.len(), 2);
/// assert_eq!(packets[1].payload(), &[0x07]);
/// ```
pub fn read_packets<R>(reader: R) -> impl Iterator<Item = IOResult<Packet>>
where
    R: Read,
{
    PacketReaderIter { reader }
}
