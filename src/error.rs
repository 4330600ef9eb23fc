use std::time::Duration;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The accelerator status register did not read clear after an explicit clear.
    #[error("hardware fault: status register reads {status:#010x} after clear")]
    HardwareFault { status: u32 },

    /// No transmit-side vacancy for the word at this index.
    #[error("transmit backpressure at word {word}")]
    Backpressure { word: usize },

    /// Received coefficients would not fit in the destination.
    #[error("receive overflow: {needed} coefficients exceed capacity of {capacity}")]
    Overflow { needed: usize, capacity: usize },

    #[error("transfer of {len} bytes exceeds accelerator maximum of {max}")]
    TransferTooLarge { len: usize, max: usize },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,

    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("queue empty")]
    QueueEmpty,

    /// Packet would exceed the maximum framed size.
    #[error("packet of {len} bytes exceeds maximum of {max}")]
    SizeViolation { len: usize, max: usize },

    #[error("Not enough bytes")]
    NotEnoughData { actual: usize, minimum: usize },
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Unrecognized request token received on a downlink connection.
    #[error("protocol error: unrecognized token {token:#04x}")]
    Protocol { token: u8 },

    /// Error surfaced by the downlink transport.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for faults scoped to a single transform transfer. The offending block
    /// is skipped and the pipeline continues.
    #[must_use]
    pub fn is_transfer_fault(&self) -> bool {
        matches!(
            self,
            Error::Backpressure { .. }
                | Error::Overflow { .. }
                | Error::TransferTooLarge { .. }
                | Error::Timeout(_)
        )
    }

    /// True for faults that only concern one downlink connection.
    #[must_use]
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. } | Error::Transport(_) | Error::Malformed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
