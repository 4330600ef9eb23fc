use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::packet::{assemble, Packet, TYPE_BANDWIDTH, TYPE_RATIO};
use crate::Result;

/// Tracks compression statistics across transform cycles.
///
/// # Example
/// ```
/// use downlink::telemetry::Telemetry;
///
/// let mut telemetry = Telemetry::default();
/// telemetry.add(448, 100);
/// assert_eq!(telemetry.ratio(), Some(4));
///
/// let packet = telemetry.ratio_packet().unwrap();
/// assert_eq!(packet.as_bytes(), &[0x52, 0x02, 0x00, 0x01, 0x04]);
/// ```
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Telemetry {
    /// Raw sample bytes fed to the accelerator.
    pub input_bytes: u64,
    /// Compressed payload bytes produced.
    pub output_bytes: u64,
    /// Blocks compressed.
    pub blocks: usize,
    /// Blocks skipped because of a transfer fault.
    pub skipped: usize,
    /// Time spent waiting on the accelerator.
    pub busy: Duration,
}

impl Telemetry {
    pub fn add(&mut self, input_bytes: usize, output_bytes: usize) {
        self.blocks += 1;
        self.input_bytes += input_bytes as u64;
        self.output_bytes += output_bytes as u64;
    }

    pub fn add_busy(&mut self, elapsed: Duration) {
        self.busy += elapsed;
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    /// `floor(input_bytes / output_bytes)`, or `None` if nothing has been output.
    #[must_use]
    pub fn ratio(&self) -> Option<u64> {
        self.input_bytes.checked_div(self.output_bytes)
    }

    /// Output bytes per second of accelerator time, or `None` if no time was recorded.
    #[must_use]
    pub fn bandwidth(&self) -> Option<u64> {
        let micros = self.busy.as_micros();
        if micros == 0 {
            return None;
        }
        u64::try_from(u128::from(self.output_bytes) * 1_000_000 / micros).ok()
    }

    /// Frame the compression ratio as a [TYPE_RATIO] packet. A ratio without output
    /// bytes is reported as 0.
    ///
    /// # Errors
    /// Only if framing fails, which cannot happen for an 8 byte payload.
    pub fn ratio_packet(&self) -> Result<Packet> {
        let ratio = self.ratio().unwrap_or_else(|| {
            warn!("no compressed output; reporting ratio 0");
            0
        });
        assemble(&encode_minimal(ratio), TYPE_RATIO)
    }

    /// Frame the bandwidth as a [TYPE_BANDWIDTH] packet. A bandwidth without recorded
    /// busy time is reported as 0.
    ///
    /// # Errors
    /// Only if framing fails, which cannot happen for an 8 byte payload.
    pub fn bandwidth_packet(&self) -> Result<Packet> {
        assemble(&encode_minimal(self.bandwidth().unwrap_or(0)), TYPE_BANDWIDTH)
    }
}

/// Minimal big-endian encoding of `value`, without leading zero bytes. Zero encodes
/// as a single zero byte.
#[must_use]
pub fn encode_minimal(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    bytes[skip..].to_vec()
}

/// Inverse of [encode_minimal]. Returns `None` for more than 8 bytes.
#[must_use]
pub fn decode_minimal(dat: &[u8]) -> Option<u64> {
    if dat.len() > 8 {
        return None;
    }
    Some(dat.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b)))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(0, &[0x00]; "zero")]
    #[test_case(4, &[0x04]; "one byte")]
    #[test_case(255, &[0xff]; "one byte max")]
    #[test_case(256, &[0x01, 0x00]; "two bytes")]
    #[test_case(0x0001_0203, &[0x01, 0x02, 0x03]; "three bytes")]
    #[test_case(u64::MAX, &[0xff; 8]; "eight bytes")]
    fn test_encode_minimal(value: u64, expected: &[u8]) {
        assert_eq!(encode_minimal(value), expected);
        assert_eq!(decode_minimal(expected), Some(value));
    }

    #[test]
    fn test_ratio_zero_divisor() {
        let telemetry = Telemetry::default();
        assert_eq!(telemetry.ratio(), None);
        let packet = telemetry.ratio_packet().unwrap();
        assert_eq!(packet.packet_type(), TYPE_RATIO);
        assert_eq!(packet.payload(), &[0x00]);
    }

    #[test]
    fn test_ratio_floors() {
        let mut telemetry = Telemetry::default();
        for _ in 0..7 {
            telemetry.add(64, 10);
        }
        // 448 / 70
        assert_eq!(telemetry.ratio(), Some(6));
        assert_eq!(telemetry.blocks, 7);
    }

    #[test]
    fn test_ratio_multi_byte() {
        let mut telemetry = Telemetry::default();
        telemetry.add(300_000, 1);
        let packet = telemetry.ratio_packet().unwrap();
        assert_eq!(packet.payload(), &[0x04, 0x93, 0xe0]);
        assert_eq!(packet.header.len, 3);
    }

    #[test]
    fn test_bandwidth() {
        let mut telemetry = Telemetry::default();
        assert_eq!(telemetry.bandwidth(), None);
        telemetry.add(64, 500);
        telemetry.add_busy(Duration::from_millis(500));
        assert_eq!(telemetry.bandwidth(), Some(1000));

        let packet = telemetry.bandwidth_packet().unwrap();
        assert_eq!(packet.packet_type(), TYPE_BANDWIDTH);
        assert_eq!(packet.payload(), &[0x03, 0xe8]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_round_trip() {
        let mut telemetry = Telemetry::default();
        telemetry.add(64, 16);
        telemetry.skip();
        let json = serde_json::to_string(&telemetry).unwrap();
        let got: Telemetry = serde_json::from_str(&json).unwrap();
        assert_eq!(got, telemetry);
    }
}
