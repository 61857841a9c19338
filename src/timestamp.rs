// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conversion of RTP timestamps to presentation time.
//!
//! RTP timestamps are 32-bit, wrapping, and dimensionless until paired with
//! the stream's clock rate. Presentation time is anchored twice: once at
//! stream start (the first packet's timestamp maps to 0 µs) and again at
//! every server-acknowledged seek (the announced timestamp maps to the
//! announced position). Every reader shares this logic via `TimeBase`.

use std::num::NonZeroU32;

/// Converts `rtp_timestamp` to presentation microseconds.
///
/// The subtraction is wraparound-correct: the difference is interpreted as a
/// signed 32-bit quantity, so a stream that wraps past 2^32 keeps advancing
/// and a slightly older timestamp yields a slightly earlier time rather than
/// a ~13-hour jump.
pub fn sample_time_us(
    rtp_timestamp: u32,
    first_timestamp: u32,
    start_offset_us: i64,
    clock_rate: NonZeroU32,
) -> i64 {
    let elapsed = i64::from(rtp_timestamp.wrapping_sub(first_timestamp) as i32);
    start_offset_us + elapsed * 1_000_000 / i64::from(clock_rate.get())
}

/// Per-stream rebasing state: the zero point established at stream start and
/// re-established by each seek.
#[derive(Debug)]
pub(crate) struct TimeBase {
    clock_rate: NonZeroU32,

    /// The RTP timestamp of the first packet observed since stream start or
    /// since the last seek. `None` until then.
    first_rtp_timestamp: Option<u32>,

    /// The presentation-time origin established by the last seek; 0 until
    /// the first seek.
    start_offset_us: i64,
}

impl TimeBase {
    pub(crate) fn new(clock_rate: NonZeroU32) -> Self {
        Self {
            clock_rate,
            first_rtp_timestamp: None,
            start_offset_us: 0,
        }
    }

    /// Notes the RTP timestamp of the stream's first packet.
    ///
    /// Calling this twice without an intervening [`TimeBase::seek`] is a
    /// caller bug; the first value wins.
    pub(crate) fn on_first_packet(&mut self, timestamp: u32) {
        debug_assert!(
            self.first_rtp_timestamp.is_none(),
            "on_first_packet called twice without seek"
        );
        self.first_rtp_timestamp.get_or_insert(timestamp);
    }

    /// Rebases: `next_rtp_timestamp` now maps to `time_us`.
    pub(crate) fn seek(&mut self, next_rtp_timestamp: u32, time_us: i64) {
        self.first_rtp_timestamp = Some(next_rtp_timestamp);
        self.start_offset_us = time_us;
    }

    /// Maps an RTP timestamp to presentation microseconds.
    ///
    /// If the transport layer never delivered `on_first_packet`, the first
    /// timestamp seen here becomes the zero point.
    pub(crate) fn sample_time_us(&mut self, rtp_timestamp: u32) -> i64 {
        let first = *self.first_rtp_timestamp.get_or_insert(rtp_timestamp);
        sample_time_us(rtp_timestamp, first, self.start_offset_us, self.clock_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(hz: u32) -> NonZeroU32 {
        NonZeroU32::new(hz).unwrap()
    }

    #[test]
    fn simple_mapping() {
        assert_eq!(sample_time_us(90_000, 0, 0, rate(90_000)), 1_000_000);
        assert_eq!(sample_time_us(48_000, 0, 0, rate(48_000)), 1_000_000);
        assert_eq!(sample_time_us(45_000, 0, 500, rate(90_000)), 500_500);
    }

    #[test]
    fn wraparound() {
        // 90 kHz timestamp crossing 2^32: the tick after the wrap maps one
        // tick (~11 µs) later than the tick before it.
        let t_before = sample_time_us(u32::MAX, 0xffff_0000, 0, rate(90_000));
        let t_after = sample_time_us(0, 0xffff_0000, 0, rate(90_000));
        assert!(t_after > t_before);
        assert_eq!(t_after - t_before, 11);
    }

    #[test]
    fn slightly_backward_timestamp() {
        // A timestamp just before the base must not be treated as a huge
        // forward jump.
        assert_eq!(sample_time_us(90_000 - 9, 90_000, 0, rate(90_000)), -100);
    }

    #[test]
    fn time_base_rebases_on_seek() {
        let mut tb = TimeBase::new(rate(90_000));
        tb.on_first_packet(1_000);
        assert_eq!(tb.sample_time_us(1_000), 0);
        assert_eq!(tb.sample_time_us(91_000), 1_000_000);

        tb.seek(500_000, 30_000_000);
        assert_eq!(tb.sample_time_us(500_000), 30_000_000);
        assert_eq!(tb.sample_time_us(590_000), 31_000_000);
    }

    #[test]
    fn time_base_defaults_to_first_consumed() {
        let mut tb = TimeBase::new(rate(8_000));
        assert_eq!(tb.sample_time_us(12_345), 0);
        assert_eq!(tb.sample_time_us(12_345 + 8_000), 1_000_000);
    }
}
