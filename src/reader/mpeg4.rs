// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-4 Part 2 visual streams, with RTP encoding as in
//! [RFC 6416](https://tools.ietf.org/html/rfc6416).

use crate::error::{FormatError, PacketError};
use crate::format::{Format, PayloadFormat, VideoFormat};
use crate::rtp::PacketRef;
use crate::sink::SampleSink;
use crate::timestamp::TimeBase;

use super::{continuity, fixed_clock_rate, Assembly, Continuity};

const CODEC: &str = "mpeg4";

/// The `vop_start_code` prefix, ISO/IEC 14496-2 section 6.2.5.
const VOP_START_CODE: [u8; 4] = [0, 0, 1, 0xb6];

/// Reassembles MPEG-4 Part 2 access units.
///
/// There is no fragmentation descriptor; packets sharing a timestamp belong
/// to one access unit and the marker bit alone signals completion. The
/// key-frame flag is sniffed by locating a `vop_start_code` in the payload
/// and reading the two `vop_coding_type` bits after it (0 = I-VOP).
#[derive(Debug)]
pub(crate) struct Reader {
    format: Format,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,
    assembly: Assembly,
}

impl Reader {
    pub(super) fn new(format: &PayloadFormat) -> Result<Self, FormatError> {
        let clock_rate = fixed_clock_rate(format, 90_000)?;
        Ok(Self {
            format: Format::Video(VideoFormat::new(CODEC, 90_000)),
            track_id: None,
            time: TimeBase::new(clock_rate),
            previous_sequence_number: None,
            assembly: Assembly::default(),
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
        self.assembly.clear();
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
        let seq = pkt.sequence_number;
        if pkt.payload.is_empty() {
            return Err(PacketError::Malformed {
                codec: CODEC,
                sequence_number: seq,
                description: "empty payload".to_owned(),
            });
        }

        if let Some(ts) = self.assembly.rtp_timestamp() {
            if ts != pkt.timestamp {
                log::warn!(
                    "[{CODEC}] access unit with timestamp {ts} never marked complete; \
                     flushing at seq={seq:04x}"
                );
                if let Some(meta) = self.assembly.take() {
                    sink.sample_metadata(track_id, meta);
                }
            }
        }

        if self.assembly.is_accumulating() {
            match continuity(self.previous_sequence_number, seq) {
                Continuity::Behind => {
                    log::warn!(
                        "[{CODEC}] dropping stale or reordered continuation seq={seq:04x}"
                    );
                    return Ok(());
                }
                Continuity::Ahead => log::warn!(
                    "[{CODEC}] gap before continuation seq={seq:04x}; \
                     access unit will be damaged"
                ),
                Continuity::Consecutive => {}
            }
        } else {
            let time_us = self.time.sample_time_us(pkt.timestamp);
            self.assembly.begin(pkt.timestamp, time_us, false);
        }

        if vop_is_intra(pkt.payload) == Some(true) {
            self.assembly.note_key_frame();
        }
        sink.sample_data(track_id, pkt.payload);
        self.assembly.extend(pkt.payload.len());
        self.previous_sequence_number = Some(seq);
        if pkt.mark {
            if let Some(meta) = self.assembly.take() {
                sink.sample_metadata(track_id, meta);
            }
        }
        Ok(())
    }
}

/// Looks for a VOP header in `payload` and reads its coding type.
/// `Some(true)` for an I-VOP, `Some(false)` for P/B/S, `None` when no VOP
/// start code is present (e.g. a configuration-only packet or a fragment
/// that starts mid-VOP).
fn vop_is_intra(payload: &[u8]) -> Option<bool> {
    let pos = payload.windows(4).position(|w| w == VOP_START_CODE)?;
    // vop_coding_type is the two bits straight after the start code.
    payload.get(pos + 4).map(|b| (b >> 6) == 0)
}

#[cfg(test)]
mod tests {
    use crate::format::{MediaKind, PayloadFormat};
    use crate::rtp::PacketRef;
    use crate::testutil::RecordingSink;

    fn reader() -> super::Reader {
        super::Reader::new(&PayloadFormat::new(MediaKind::Video, "mp4v-es", 90_000)).unwrap()
    }

    #[test]
    fn vop_type_sniffing() {
        assert_eq!(super::vop_is_intra(b"\x00\x00\x01\xb6\x00rest"), Some(true));
        // 0x40: coding type 01 = P-VOP.
        assert_eq!(super::vop_is_intra(b"\x00\x00\x01\xb6\x40rest"), Some(false));
        assert_eq!(super::vop_is_intra(b"\x00\x00\x01\xb0config"), None);
        assert_eq!(super::vop_is_intra(b""), None);
    }

    #[test]
    fn marker_driven_assembly() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x00\x00\x01\xb6\x00ivop-part1",
                timestamp: 0,
                sequence_number: 0,
                mark: false,
            },
        )
        .unwrap();
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"part2",
                timestamp: 0,
                sequence_number: 1,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        let (data, meta) = &samples[0];
        assert_eq!(&data[..], b"\x00\x00\x01\xb6\x00ivop-part1part2");
        assert!(meta.is_key_frame);
        assert_eq!(meta.size, data.len());
    }

    #[test]
    fn p_vop_is_not_key() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x00\x00\x01\xb6\x7fpvop",
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        assert!(!sink.samples(0)[0].1.is_key_frame);
    }
}
