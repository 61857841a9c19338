// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-framing audio codecs as defined in
//! [RFC 3551 section 4.5](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5):
//! L8/L16 linear PCM, PCMA/PCMU companded PCM, and G.722.
//!
//! There is no payload framing at all; the entire payload is one access
//! unit.

use crate::error::{FormatError, PacketError};
use crate::format::{AudioFormat, Format, PayloadFormat};
use crate::rtp::PacketRef;
use crate::sink::{SampleMetadata, SampleSink};
use crate::timestamp::TimeBase;

use super::{clock_rate, warn_on_gap};

const CODEC: &str = "pcm";

#[derive(Debug)]
pub(crate) struct Reader {
    format: Format,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,
}

impl Reader {
    pub(super) fn new(format: &PayloadFormat) -> Result<Self, FormatError> {
        let clock_rate = clock_rate(format)?;
        Ok(Self {
            format: Format::Audio(
                AudioFormat::new(format.encoding_name(), clock_rate.get())
                    .with_channels(format.channels()),
            ),
            track_id: None,
            time: TimeBase::new(clock_rate),
            previous_sequence_number: None,
        })
    }

    pub(super) fn create_tracks(&mut self, sink: &mut dyn SampleSink, track_id: u32) {
        debug_assert!(self.track_id.is_none(), "create_tracks called twice");
        self.track_id = Some(track_id);
        sink.format(track_id, &self.format);
    }

    pub(super) fn on_first_packet(&mut self, timestamp: u32, sequence_number: u16) {
        self.time.on_first_packet(timestamp);
        self.previous_sequence_number = Some(sequence_number.wrapping_sub(1));
    }

    pub(super) fn seek(&mut self, next_rtp_timestamp: u32, time_us: i64) {
        self.time.seek(next_rtp_timestamp, time_us);
        self.previous_sequence_number = None;
    }

    pub(super) fn consume(
        &mut self,
        sink: &mut dyn SampleSink,
        pkt: PacketRef<'_>,
    ) -> Result<(), PacketError> {
        let track_id = self
            .track_id
            .ok_or(PacketError::ContractViolation("consume before create_tracks"))?;
        warn_on_gap(CODEC, self.previous_sequence_number, pkt.sequence_number);
        self.previous_sequence_number = Some(pkt.sequence_number);
        if pkt.payload.is_empty() {
            return Err(PacketError::Malformed {
                codec: CODEC,
                sequence_number: pkt.sequence_number,
                description: "empty payload".to_owned(),
            });
        }
        sink.sample_data(track_id, pkt.payload);
        sink.sample_metadata(
            track_id,
            SampleMetadata {
                time_us: self.time.sample_time_us(pkt.timestamp),
                is_key_frame: true,
                size: pkt.payload.len(),
                offset: 0,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::format::{MediaKind, PayloadFormat};
    use crate::rtp::PacketRef;
    use crate::testutil::RecordingSink;

    #[test]
    fn passthrough_with_rebasing() {
        let format = PayloadFormat::new(MediaKind::Audio, "pcmu", 8_000);
        let mut r = super::Reader::new(&format).unwrap();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 2);
        r.on_first_packet(1_234, 99);
        r.consume(
            &mut sink,
            PacketRef {
                payload: &[0x7f; 160],
                timestamp: 1_234,
                sequence_number: 99,
                mark: true,
            },
        )
        .unwrap();
        // 20 ms later; a gap in sequence numbers only warns.
        r.consume(
            &mut sink,
            PacketRef {
                payload: &[0x7f; 160],
                timestamp: 1_394,
                sequence_number: 103,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(2);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].1.size, 160);
        assert_eq!(samples[0].1.time_us, 0);
        assert_eq!(samples[1].1.time_us, 20_000);

        r.seek(8_000, 1_000_000);
        r.consume(
            &mut sink,
            PacketRef {
                payload: &[0x7f; 160],
                timestamp: 8_000,
                sequence_number: 104,
                mark: true,
            },
        )
        .unwrap();
        assert_eq!(sink.samples(2)[2].1.time_us, 1_000_000);
    }
}
