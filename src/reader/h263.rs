// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.263-1998/2000 video, with RTP encoding as in
//! [RFC 4629](https://tools.ietf.org/html/rfc4629).

use bitstream_io::BitRead;

use crate::error::{FormatError, PacketError};
use crate::format::{Format, PayloadFormat, VideoFormat};
use crate::rtp::PacketRef;
use crate::sink::SampleSink;
use crate::timestamp::TimeBase;

use super::{continuity, fixed_clock_rate, Assembly, Continuity};

const CODEC: &str = "h263";

/// Reassembles H.263 access units.
///
/// Each packet carries a 2-byte payload header (RFC 4629 section 5.1); when
/// its P bit is set, the two zero bytes elided from the picture/GOB start
/// code are restored in the output. The marker bit signals access unit
/// completion. The key-frame flag comes from the picture header's
/// `picture_coding_type` bit, readable only for the baseline (non-extended)
/// source formats.
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
        let payload = pkt.payload;
        let seq = pkt.sequence_number;
        let malformed = |description: String| PacketError::Malformed {
            codec: CODEC,
            sequence_number: seq,
            description,
        };
        if payload.len() < 2 {
            return Err(malformed("too short for payload header".to_owned()));
        }
        let p_bit = (payload[0] & 0x04) != 0;
        let v_bit = (payload[0] & 0x02) != 0;
        let plen = usize::from(((payload[0] & 0x01) << 5) | (payload[1] >> 3));
        let data_off = 2 + usize::from(v_bit) + plen;
        if data_off >= payload.len() {
            return Err(malformed(format!(
                "payload header (PLEN={plen}) leaves no picture data"
            )));
        }
        let data = &payload[data_off..];

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

        // With P set and the remaining 6 start-code bits matching, this
        // packet opens a picture (rather than a GOB or slice).
        let picture_start = p_bit && (data[0] >> 2) == 0b100000;
        if picture_start {
            if self.assembly.is_accumulating() {
                log::warn!(
                    "[{CODEC}] picture never marked complete; flushing at seq={seq:04x}"
                );
                if let Some(meta) = self.assembly.take() {
                    sink.sample_metadata(track_id, meta);
                }
            }
            let time_us = self.time.sample_time_us(pkt.timestamp);
            let is_key_frame = picture_is_intra(data).unwrap_or(false);
            self.assembly.begin(pkt.timestamp, time_us, is_key_frame);
        } else {
            if !self.assembly.is_accumulating() {
                log::warn!(
                    "[{CODEC}] dropping continuation seq={seq:04x} with no picture in progress"
                );
                return Ok(());
            }
            match continuity(self.previous_sequence_number, seq) {
                Continuity::Behind => {
                    log::warn!(
                        "[{CODEC}] dropping stale or reordered continuation seq={seq:04x}"
                    );
                    return Ok(());
                }
                Continuity::Ahead => log::warn!(
                    "[{CODEC}] gap before continuation seq={seq:04x}; picture will be damaged"
                ),
                Continuity::Consecutive => {}
            }
        }

        if p_bit {
            // Restore the two zero bytes the payload header elided.
            sink.sample_data(track_id, &[0, 0]);
            self.assembly.extend(2);
        }
        sink.sample_data(track_id, data);
        self.assembly.extend(data.len());
        self.previous_sequence_number = Some(seq);
        if pkt.mark {
            if let Some(meta) = self.assembly.take() {
                sink.sample_metadata(track_id, meta);
            }
        }
        Ok(())
    }
}

/// Reads the picture header starting at the 6 post-elision start-code bits,
/// returning whether `picture_coding_type` says I-picture.
///
/// `None` when the header doesn't parse or uses an extended (PLUSPTYPE)
/// source format whose coding type lives elsewhere.
fn picture_is_intra(data: &[u8]) -> Option<bool> {
    let mut r = bitstream_io::BitReader::endian(data, bitstream_io::BigEndian);
    if r.read::<u8>(6).ok()? != 0b100000 {
        return None;
    }
    r.skip(8).ok()?; // temporal reference
    if r.read::<u8>(2).ok()? != 0b10 {
        return None; // PTYPE must start '10'
    }
    r.skip(3).ok()?; // split screen, document camera, freeze picture release
    let source_format = r.read::<u8>(3).ok()?;
    if !(1..=5).contains(&source_format) {
        // 6 is reserved and 7 (extended PTYPE) moves the coding type; give up.
        return None;
    }
    Some(!r.read_bit().ok()?)
}

#[cfg(test)]
mod tests {
    use crate::format::{MediaKind, PayloadFormat};
    use crate::rtp::PacketRef;
    use crate::testutil::RecordingSink;

    fn reader() -> super::Reader {
        super::Reader::new(&PayloadFormat::new(MediaKind::Video, "h263-1998", 90_000)).unwrap()
    }

    /// Picture start: '100000' + TR(8) + PTYPE '10' + 000 + source format CIF
    /// (011) + coding type bit, packed from the third byte of the start code.
    fn picture_bytes(intra: bool) -> Vec<u8> {
        // Bits: 100000_00 | 000000_10 | 000_011_C0...
        let coding = if intra { 0u8 } else { 1 };
        vec![0b1000_0000, 0b0000_0010, 0b0000_1100 | (coding << 1), 0xAA]
    }

    #[test]
    fn picture_header_sniff() {
        assert_eq!(super::picture_is_intra(&picture_bytes(true)), Some(true));
        assert_eq!(super::picture_is_intra(&picture_bytes(false)), Some(false));
        assert_eq!(super::picture_is_intra(b"\xff\xff"), None);
    }

    #[test]
    fn picture_start_restores_start_code() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        // Payload header with P set, then the picture bytes.
        let mut payload = vec![0x04, 0x00];
        payload.extend_from_slice(&picture_bytes(true));
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
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        let (data, meta) = &samples[0];
        // The elided 0x00 0x00 are restored ahead of the picture start code.
        assert_eq!(&data[..4], b"\x00\x00\x80\x02");
        assert!(meta.is_key_frame);
        assert_eq!(meta.size, 2 + picture_bytes(true).len());
    }

    #[test]
    fn follow_on_packets_complete_the_picture() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        let mut payload = vec![0x04, 0x00];
        payload.extend_from_slice(&picture_bytes(false));
        r.consume(
            &mut sink,
            PacketRef {
                payload: &payload,
                timestamp: 0,
                sequence_number: 0,
                mark: false,
            },
        )
        .unwrap();
        // Follow-on packet, P=0, raw macroblock data.
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x00\x00rest-of-picture",
                timestamp: 0,
                sequence_number: 1,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].1.is_key_frame);
        assert!(samples[0].0.ends_with(b"rest-of-picture"));
    }

    #[test]
    fn orphan_continuation_dropped() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x00\x00orphan",
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        assert!(sink.samples(0).is_empty());
    }
}
