//! Streaming transform session.
//!
//! The transform accelerator sits behind a pair of word-oriented stream FIFOs. A
//! [Session] drives one block through it:
//!
//! 1. [Session::init] resets the device and verifies its status register clears.
//! 2. [Session::transmit] packs sample pairs into stream words and signals the length.
//! 3. [Session::poll_done] (or the blocking [Session::wait_done]) waits for completion.
//! 4. [Session::receive] drains the receive FIFO and unpacks coefficients.
//!
//! Register access goes through the [Accelerator] trait so the session can run
//! against real hardware or the software stand-in in [soft].
use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use tracing::{debug, trace};

use crate::{Error, Result};

pub mod soft;

pub use soft::SoftAccelerator;

/// Maximum number of sample bytes accepted by one transfer.
pub const MAX_TRANSFER: usize = 512;
/// Maximum number of coefficients produced for one block.
pub const MAX_COEFFICIENTS: usize = 65;
/// Bytes per stream word.
pub const WORD_LEN: usize = 4;

/// Default interval between completion polls.
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Register-level primitives of a stream-attached accelerator.
///
/// Lengths are in bytes, vacancy and occupancy in words.
pub trait Accelerator {
    /// Reset the device, discarding the contents of both FIFOs.
    fn reset(&mut self);

    /// Interrupt status register.
    fn status(&self) -> u32;

    /// Clear the status bits set in `mask`.
    fn clear_status(&mut self, mask: u32);

    /// Free words in the transmit FIFO.
    fn tx_vacancy(&self) -> usize;

    fn tx_put_word(&mut self, word: u32);

    /// Signal the end of a transmit packet of `len` bytes.
    fn tx_set_len(&mut self, len: usize);

    /// True once the last signalled transmit packet has been consumed.
    fn tx_done(&mut self) -> bool;

    /// Words waiting in the receive FIFO.
    fn rx_occupancy(&self) -> usize;

    /// Byte length of the next receive packet.
    fn rx_len(&mut self) -> usize;

    fn rx_get_word(&mut self) -> u32;

    /// Largest transfer, in sample bytes, the device accepts.
    fn max_transfer(&self) -> usize {
        MAX_TRANSFER
    }
}

impl<A: Accelerator + ?Sized> Accelerator for Box<A> {
    fn reset(&mut self) {
        (**self).reset();
    }
    fn status(&self) -> u32 {
        (**self).status()
    }
    fn clear_status(&mut self, mask: u32) {
        (**self).clear_status(mask);
    }
    fn tx_vacancy(&self) -> usize {
        (**self).tx_vacancy()
    }
    fn tx_put_word(&mut self, word: u32) {
        (**self).tx_put_word(word);
    }
    fn tx_set_len(&mut self, len: usize) {
        (**self).tx_set_len(len);
    }
    fn tx_done(&mut self) -> bool {
        (**self).tx_done()
    }
    fn rx_occupancy(&self) -> usize {
        (**self).rx_occupancy()
    }
    fn rx_len(&mut self) -> usize {
        (**self).rx_len()
    }
    fn rx_get_word(&mut self) -> u32 {
        (**self).rx_get_word()
    }
    fn max_transfer(&self) -> usize {
        (**self).max_transfer()
    }
}

/// Pack a sample pair into a stream word, first sample in the low half.
#[must_use]
pub fn pack_samples(first: u8, second: u8) -> u32 {
    u32::from(u16::from_le_bytes([first, second]))
}

/// Unpack a stream word into two coefficients, low half first.
#[must_use]
pub fn unpack_coefficients(word: u32) -> (i16, i16) {
    ((word & 0xffff) as u16 as i16, (word >> 16) as u16 as i16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Transmitting,
    AwaitingCompletion,
    Draining,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Transmitting => "transmitting",
            SessionState::AwaitingCompletion => "awaiting-completion",
            SessionState::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Drives blocks through an [Accelerator].
///
/// # Example
/// ```
/// use std::time::Duration;
/// use downlink::transform::{Session, SoftAccelerator};
///
/// let mut session = Session::new(SoftAccelerator::default());
/// session.init().unwrap();
/// session.transmit(&[1, 0, 2, 0]).unwrap();
/// session.wait_done(Duration::from_millis(100), None).unwrap();
///
/// let mut coefficients = [0i16; 8];
/// let num = session.receive(&mut coefficients).unwrap();
/// assert_eq!(&coefficients[..num], &[1, 2]);
/// ```
pub struct Session<A>
where
    A: Accelerator,
{
    accelerator: A,
    state: SessionState,
    vacancy_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl<A> Session<A>
where
    A: Accelerator,
{
    pub fn new(accelerator: A) -> Self {
        Session {
            accelerator,
            state: SessionState::Idle,
            vacancy_timeout: None,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Wait up to `timeout` for transmit vacancy before failing a word with
    /// [Error::Backpressure]. By default a word fails immediately when the FIFO is full.
    #[must_use]
    pub fn with_vacancy_timeout(mut self, timeout: Duration) -> Self {
        self.vacancy_timeout = Some(timeout);
        self
    }

    /// Interval slept between polls while waiting on the device.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn accelerator(&self) -> &A {
        &self.accelerator
    }

    pub fn accelerator_mut(&mut self) -> &mut A {
        &mut self.accelerator
    }

    pub fn into_inner(self) -> A {
        self.accelerator
    }

    /// Reset the accelerator context and discard any stale receive data.
    ///
    /// # Errors
    /// [Error::HardwareFault] if the status register does not read clear after an
    /// explicit clear.
    pub fn init(&mut self) -> Result<()> {
        self.accelerator.reset();
        self.accelerator.clear_status(0xffff_ffff);
        let status = self.accelerator.status();
        if status != 0 {
            return Err(Error::HardwareFault { status });
        }

        let mut stale = 0;
        while self.accelerator.rx_occupancy() > 0 {
            self.accelerator.rx_get_word();
            stale += 1;
        }
        if stale > 0 {
            debug!(words = stale, "discarded stale receive data");
        }

        self.state = SessionState::Idle;
        Ok(())
    }

    /// Pack `samples` into stream words and start a transfer. A zero-length transfer
    /// is a no-op.
    ///
    /// # Errors
    /// [Error::TransferTooLarge] if `samples` exceeds the device's maximum transfer,
    /// [Error::Backpressure] for the first word that finds no transmit vacancy. The
    /// session returns to idle on error; call [Session::init] before reuse.
    pub fn transmit(&mut self, samples: &[u8]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let max = self.accelerator.max_transfer();
        if samples.len() > max {
            return Err(Error::TransferTooLarge {
                len: samples.len(),
                max,
            });
        }

        self.state = SessionState::Transmitting;
        let mut num_words = 0;
        for (idx, pair) in samples.chunks(2).enumerate() {
            let word = pack_samples(pair[0], pair.get(1).copied().unwrap_or(0));
            if let Err(err) = self.await_vacancy(idx) {
                self.state = SessionState::Idle;
                return Err(err);
            }
            self.accelerator.tx_put_word(word);
            num_words += 1;
        }
        self.accelerator.tx_set_len(num_words * WORD_LEN);
        trace!(samples = samples.len(), words = num_words, "transmitted");

        self.state = SessionState::AwaitingCompletion;
        Ok(())
    }

    fn await_vacancy(&self, word: usize) -> Result<()> {
        if self.accelerator.tx_vacancy() > 0 {
            return Ok(());
        }
        let Some(timeout) = self.vacancy_timeout else {
            return Err(Error::Backpressure { word });
        };
        let deadline = Instant::now() + timeout;
        while self.accelerator.tx_vacancy() == 0 {
            if Instant::now() >= deadline {
                return Err(Error::Backpressure { word });
            }
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Non-blocking completion check. Returns true when no transfer is outstanding.
    pub fn poll_done(&mut self) -> bool {
        match self.state {
            SessionState::AwaitingCompletion => {
                if self.accelerator.tx_done() {
                    self.state = SessionState::Draining;
                    true
                } else {
                    false
                }
            }
            SessionState::Transmitting => false,
            SessionState::Idle | SessionState::Draining => true,
        }
    }

    /// Block until the outstanding transfer completes.
    ///
    /// # Errors
    /// [Error::Timeout] if the transfer does not complete within `timeout`,
    /// [Error::Cancelled] if a message arrives on `cancel`.
    pub fn wait_done(&mut self, timeout: Duration, cancel: Option<&Receiver<()>>) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_done() {
                return Ok(());
            }
            if let Some(cancel) = cancel {
                if cancel.try_recv().is_ok() {
                    return Err(Error::Cancelled);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Drain the receive FIFO into `dest`, returning the number of coefficients
    /// written. Returns 0 if nothing has been received.
    ///
    /// # Errors
    /// [Error::Overflow] if the received coefficients would not fit in `dest`. Nothing
    /// past `dest.len()` is ever written.
    pub fn receive(&mut self, dest: &mut [i16]) -> Result<usize> {
        self.state = SessionState::Draining;
        let mut num = 0;
        while self.accelerator.rx_occupancy() > 0 {
            let count = self.accelerator.rx_len() / 2;
            if count == 0 {
                break;
            }
            if num + count > dest.len() {
                self.state = SessionState::Idle;
                return Err(Error::Overflow {
                    needed: num + count,
                    capacity: dest.len(),
                });
            }
            for idx in (0..count).step_by(2) {
                let (low, high) = unpack_coefficients(self.accelerator.rx_get_word());
                dest[num + idx] = low;
                if idx + 1 < count {
                    dest[num + idx + 1] = high;
                }
            }
            num += count;
        }
        trace!(coefficients = num, "received");

        self.state = SessionState::Idle;
        Ok(num)
    }
}
