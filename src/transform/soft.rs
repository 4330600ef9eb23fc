//! Software stand-in for the transform accelerator.
//!
//! [SoftAccelerator] implements the [Accelerator] register contract in memory. Its
//! transform passes each 16-bit input lane through as one coefficient, optionally
//! keeping only the first `n` coefficients the way a zig-zag truncating transform
//! would. Fault behavior (limited vacancy, stuck status, stalls, latency) is
//! configurable so sessions and pipelines can be exercised without hardware.
use std::collections::VecDeque;

use super::{Accelerator, WORD_LEN};

/// Default transmit FIFO depth in words.
pub const TX_FIFO_DEPTH: usize = 512;

#[derive(Debug, Clone)]
pub struct SoftAccelerator {
    tx: Vec<u32>,
    tx_capacity: usize,
    tx_pending: bool,
    rx: VecDeque<u32>,
    rx_lens: VecDeque<usize>,
    status: u32,
    stuck_status: u32,
    retain: Option<usize>,
    latency: u32,
    polls: u32,
    stall: bool,
    rx_survives_reset: bool,
    transfers: usize,
}

impl Default for SoftAccelerator {
    fn default() -> Self {
        SoftAccelerator {
            tx: Vec::new(),
            tx_capacity: TX_FIFO_DEPTH,
            tx_pending: false,
            rx: VecDeque::new(),
            rx_lens: VecDeque::new(),
            status: 0,
            stuck_status: 0,
            retain: None,
            latency: 0,
            polls: 0,
            stall: false,
            rx_survives_reset: false,
            transfers: 0,
        }
    }
}

impl SoftAccelerator {
    /// Keep only the first `num` coefficients of each transform.
    #[must_use]
    pub fn with_retained(mut self, num: usize) -> Self {
        self.retain = Some(num);
        self
    }

    /// Transmit FIFO depth in words.
    #[must_use]
    pub fn with_tx_capacity(mut self, words: usize) -> Self {
        self.tx_capacity = words;
        self
    }

    /// Status bits that cannot be cleared.
    #[must_use]
    pub fn with_stuck_status(mut self, bits: u32) -> Self {
        self.stuck_status = bits;
        self.status |= bits;
        self
    }

    /// Number of completion polls that report busy before a transfer completes.
    #[must_use]
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    /// Never complete a transfer.
    #[must_use]
    pub fn with_stall(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Keep receive FIFO contents across [Accelerator::reset].
    #[must_use]
    pub fn with_rx_survives_reset(mut self) -> Self {
        self.rx_survives_reset = true;
        self
    }

    /// Place words in the receive FIFO as one packet, as if left over from an
    /// earlier transfer.
    pub fn inject_rx(&mut self, words: &[u32]) {
        self.rx.extend(words);
        self.rx_lens.push_back(words.len() * WORD_LEN);
    }

    /// Number of transfers completed.
    #[must_use]
    pub fn transfers(&self) -> usize {
        self.transfers
    }

    fn complete(&mut self) {
        let mut coefficients: Vec<u16> = self.tx.drain(..).map(|w| (w & 0xffff) as u16).collect();
        if let Some(retain) = self.retain {
            coefficients.truncate(retain);
        }
        for pair in coefficients.chunks(2) {
            let high = pair.get(1).copied().unwrap_or(0);
            self.rx.push_back(u32::from(pair[0]) | u32::from(high) << 16);
        }
        if !coefficients.is_empty() {
            self.rx_lens.push_back(coefficients.len() * 2);
        }
        self.tx_pending = false;
        self.transfers += 1;
    }
}

impl Accelerator for SoftAccelerator {
    fn reset(&mut self) {
        self.tx.clear();
        self.tx_pending = false;
        self.polls = 0;
        if !self.rx_survives_reset {
            self.rx.clear();
            self.rx_lens.clear();
        }
    }

    fn status(&self) -> u32 {
        self.status
    }

    fn clear_status(&mut self, mask: u32) {
        self.status &= !mask;
        self.status |= self.stuck_status;
    }

    fn tx_vacancy(&self) -> usize {
        self.tx_capacity.saturating_sub(self.tx.len())
    }

    fn tx_put_word(&mut self, word: u32) {
        if self.tx.len() < self.tx_capacity {
            self.tx.push(word);
        }
    }

    fn tx_set_len(&mut self, _len: usize) {
        self.tx_pending = true;
        self.polls = 0;
    }

    fn tx_done(&mut self) -> bool {
        if !self.tx_pending {
            return true;
        }
        if self.stall {
            return false;
        }
        if self.polls < self.latency {
            self.polls += 1;
            return false;
        }
        self.complete();
        true
    }

    fn rx_occupancy(&self) -> usize {
        self.rx.len()
    }

    fn rx_len(&mut self) -> usize {
        match self.rx_lens.pop_front() {
            Some(len) => len,
            None => self.rx.len() * WORD_LEN,
        }
    }

    fn rx_get_word(&mut self) -> u32 {
        let word = self.rx.pop_front().unwrap_or(0);
        if self.rx.is_empty() {
            self.rx_lens.clear();
        }
        word
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transform::Session;

    #[test]
    fn test_retained_truncates_output() {
        let mut session = Session::new(SoftAccelerator::default().with_retained(5));
        session.init().unwrap();
        session.transmit(&[3u8; 64]).unwrap();
        session.wait_done(Duration::from_millis(100), None).unwrap();

        let mut dest = [0i16; 65];
        assert_eq!(session.receive(&mut dest).unwrap(), 5);
        assert_eq!(session.accelerator().transfers(), 1);
    }

    #[test]
    fn test_stale_rx_drained_when_reset_keeps_it() {
        let mut accel = SoftAccelerator::default().with_rx_survives_reset();
        accel.inject_rx(&[1, 2, 3]);
        let mut session = Session::new(accel);
        session.init().unwrap();
        assert_eq!(session.accelerator().rx_occupancy(), 0);

        let mut dest = [0i16; 8];
        assert_eq!(session.receive(&mut dest).unwrap(), 0);
    }

    #[test]
    fn test_clear_status() {
        let mut accel = SoftAccelerator::default().with_stuck_status(0x1);
        accel.clear_status(0xffff_ffff);
        assert_eq!(accel.status(), 0x1);

        let mut accel = SoftAccelerator::default();
        accel.clear_status(0xffff_ffff);
        assert_eq!(accel.status(), 0);
    }
}
