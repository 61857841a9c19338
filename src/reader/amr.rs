// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AMR and AMR-WB speech, with RTP encoding as in
//! [RFC 4867](https://tools.ietf.org/html/rfc4867).
//!
//! Only octet-aligned payloads holding exactly one speech frame are
//! accepted: a 1-byte payload header (CMR + reserved bits), one ToC entry,
//! and the frame data whose length follows from the ToC's frame type.
//! Compound (multi-frame) payloads fail fast.

use crate::error::{FormatError, PacketError};
use crate::format::{AudioFormat, Format, PayloadFormat};
use crate::rtp::PacketRef;
use crate::sink::{SampleMetadata, SampleSink};
use crate::timestamp::TimeBase;

use super::{fixed_clock_rate, warn_on_gap};

const CODEC: &str = "amr";

/// Frame sizes in bytes (one ToC byte plus speech data) per frame type,
/// narrow-band. Indices 9-15 are SID and reserved/no-data types.
#[rustfmt::skip]
const FRAME_SIZES_NB: [usize; 16] = [
    13, 14, 16, 18, 20, 21, 27, 32, // 4.75 .. 12.2 kbps (12.2 = GSM-EFR)
    6, 7, 6, 6, 1, 1, 1, 1,
];

/// Frame sizes in bytes per frame type, wide-band.
#[rustfmt::skip]
const FRAME_SIZES_WB: [usize; 16] = [
    18, 24, 33, 37, 41, 47, 51, 59, 61, // 6.6 .. 23.85 kbps
    6, 6, 1, 1, 1, 1, 1,
];

#[derive(Debug)]
pub(crate) struct Reader {
    format: Format,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,
    wide_band: bool,
}

impl Reader {
    pub(super) fn new(format: &PayloadFormat) -> Result<Self, FormatError> {
        let wide_band = format.encoding_name() == "amr-wb";
        let clock_rate = fixed_clock_rate(format, if wide_band { 16_000 } else { 8_000 })?;
        Ok(Self {
            format: Format::Audio(
                AudioFormat::new(format.encoding_name(), clock_rate.get())
                    .with_channels(format.channels()),
            ),
            track_id: None,
            time: TimeBase::new(clock_rate),
            previous_sequence_number: None,
            wide_band,
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
        let payload = pkt.payload;
        let seq = pkt.sequence_number;
        warn_on_gap(CODEC, self.previous_sequence_number, seq);
        self.previous_sequence_number = Some(seq);

        if payload.len() < 2 {
            return Err(PacketError::Malformed {
                codec: CODEC,
                sequence_number: seq,
                description: "too short for payload header and ToC".to_owned(),
            });
        }
        // The ToC entry is F(1) FT(4) Q(1) + 2 padding bits.
        let frame_type = usize::from((payload[1] >> 3) & 0x0f);
        let sizes = if self.wide_band {
            &FRAME_SIZES_WB
        } else {
            &FRAME_SIZES_NB
        };
        let frame_size = sizes[frame_type];
        // Exactly CMR byte + one frame; anything else is a compound or
        // truncated payload.
        if payload.len() != 1 + frame_size {
            return Err(PacketError::Unsupported {
                codec: CODEC,
                sequence_number: seq,
                description: format!(
                    "illegal or compound payload: frame type {frame_type} implies {} bytes, got {}",
                    1 + frame_size,
                    payload.len()
                ),
            });
        }
        let frame = &payload[1..];
        sink.sample_data(track_id, frame);
        sink.sample_metadata(
            track_id,
            SampleMetadata {
                time_us: self.time.sample_time_us(pkt.timestamp),
                is_key_frame: true,
                size: frame.len(),
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

    fn reader(encoding: &str, clock: u32) -> super::Reader {
        super::Reader::new(&PayloadFormat::new(MediaKind::Audio, encoding, clock)).unwrap()
    }

    #[test]
    fn frame_size_lookup() {
        // 12.2 kbps / GSM-EFR.
        assert_eq!(super::FRAME_SIZES_NB[7], 32);
        // 23.85 kbps wide-band.
        assert_eq!(super::FRAME_SIZES_WB[8], 61);
    }

    #[test]
    fn single_frame() {
        let mut r = reader("amr", 8_000);
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(160, 0);
        // CMR byte, then a type-7 ToC (0x3c = 0_0111_1_00) and 31 data bytes.
        let mut payload = vec![0xf0, 0x3c];
        payload.extend_from_slice(&[0xab; 31]);
        r.consume(
            &mut sink,
            PacketRef {
                payload: &payload,
                timestamp: 160,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        // The ToC byte is kept; the CMR byte is not.
        assert_eq!(samples[0].1.size, 32);
        assert_eq!(samples[0].0[0], 0x3c);
        assert_eq!(samples[0].1.time_us, 0);
    }

    #[test]
    fn rejects_compound_payload() {
        let mut r = reader("amr", 8_000);
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        // Type 7 implies 33 total bytes; give 40 (two frames' worth of data).
        let payload = vec![0xf0, 0x3c].into_iter().chain([0u8; 38]).collect::<Vec<_>>();
        let e = r
            .consume(
                &mut sink,
                PacketRef {
                    payload: &payload,
                    timestamp: 0,
                    sequence_number: 0,
                    mark: true,
                },
            )
            .unwrap_err();
        assert!(e.to_string().contains("compound"));
    }

    #[test]
    fn wide_band_sizes() {
        let mut r = reader("amr-wb", 16_000);
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        // Type 0 (6.6 kbps): 18 bytes including ToC.
        let mut payload = vec![0xf0, 0x04];
        payload.extend_from_slice(&[0x55; 17]);
        r.consume(
            &mut sink,
            PacketRef {
                payload: &payload,
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        assert_eq!(sink.samples(0)[0].1.size, 18);
    }

    #[test]
    fn wrong_clock_rate_rejected() {
        assert!(super::Reader::new(&PayloadFormat::new(MediaKind::Audio, "amr", 16_000)).is_err());
        assert!(
            super::Reader::new(&PayloadFormat::new(MediaKind::Audio, "amr-wb", 8_000)).is_err()
        );
    }
}
