// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.265](https://www.itu.int/rec/T-REC-H.265)-encoded video,
//! with RTP encoding as in [RFC 7798](https://tools.ietf.org/html/rfc7798).

use crate::error::{FormatError, PacketError};
use crate::format::{Format, PayloadFormat, VideoFormat};
use crate::rtp::PacketRef;
use crate::sink::SampleSink;
use crate::timestamp::TimeBase;

use super::{continuity, fixed_clock_rate, Assembly, Continuity};

const CODEC: &str = "h265";

const NAL_START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types which start an IDR picture.
const NAL_UNIT_TYPE_IDR_W_RADL: u8 = 19;
const NAL_UNIT_TYPE_IDR_N_LP: u8 = 20;

/// The payload header type carried in RTP packets for aggregation packets
/// and fragmentation units, RFC 7798 section 4.4.
const PAYLOAD_TYPE_AP: u8 = 48;
const PAYLOAD_TYPE_FU: u8 = 49;

/// Finds access unit boundaries and emits Annex B NAL units as specified in
/// [RFC 7798](https://tools.ietf.org/html/rfc7798).
///
/// Single NAL unit packets and fragmentation units are supported;
/// aggregation packets (type 48) and PACI (type 50) fail fast rather than
/// risk emitting corrupt media.
#[derive(Debug)]
pub(crate) struct Reader {
    format: Format,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,
    assembly: Assembly,

    /// The synthesized 2-byte header of the in-progress FU NAL, if any.
    fu_nal_header: Option<[u8; 2]>,
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
            fu_nal_header: None,
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
        self.fu_nal_header = None;
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
        if payload.is_empty() {
            return Err(malformed(seq, "zero-length payload".to_owned()));
        }
        let payload_type = (payload[0] >> 1) & 0x3f;

        if let Some(ts) = self.assembly.rtp_timestamp() {
            if ts != pkt.timestamp {
                log::warn!(
                    "[{CODEC}] access unit with timestamp {ts} never marked complete; \
                     flushing at seq={seq:04x}"
                );
                self.fu_nal_header = None;
                if let Some(meta) = self.assembly.take() {
                    sink.sample_metadata(track_id, meta);
                }
            }
        }
        let time_us = self.time.sample_time_us(pkt.timestamp);

        match payload_type {
            PAYLOAD_TYPE_AP => {
                return Err(PacketError::Unsupported {
                    codec: CODEC,
                    sequence_number: seq,
                    description: "aggregation packets".to_owned(),
                })
            }
            PAYLOAD_TYPE_FU => {
                // A dropped continuation must not advance the expected
                // sequence number or finalize the unit.
                if !self.consume_fu(sink, track_id, pkt, time_us)? {
                    return Ok(());
                }
            }
            50.. => {
                return Err(PacketError::Unsupported {
                    codec: CODEC,
                    sequence_number: seq,
                    description: format!("payload type {payload_type} (PACI/reserved)"),
                })
            }
            t => {
                // Single NAL unit packet, RFC 7798 section 4.4.1.
                if payload.len() < 2 {
                    return Err(malformed(seq, "single NAL unit lacks 2-byte header".to_owned()));
                }
                if self.fu_nal_header.take().is_some() {
                    log::warn!(
                        "[{CODEC}] fragmented NAL abandoned by single NAL unit packet \
                         at seq={seq:04x}"
                    );
                }
                if !self.assembly.is_accumulating() {
                    self.assembly.begin(pkt.timestamp, time_us, false);
                }
                sink.sample_data(track_id, &NAL_START_CODE);
                sink.sample_data(track_id, payload);
                self.assembly.extend(NAL_START_CODE.len() + payload.len());
                if t == NAL_UNIT_TYPE_IDR_W_RADL || t == NAL_UNIT_TYPE_IDR_N_LP {
                    self.assembly.note_key_frame();
                }
            }
        }

        self.previous_sequence_number = Some(seq);
        if pkt.mark {
            self.fu_nal_header = None;
            if let Some(meta) = self.assembly.take() {
                sink.sample_metadata(track_id, meta);
            }
        }
        Ok(())
    }

    /// Fragmentation unit, RFC 7798 section 4.4.3: 2-byte payload header,
    /// then a 1-byte FU header, then the fragment. Returns false when the
    /// packet was dropped rather than applied.
    fn consume_fu(
        &mut self,
        sink: &mut dyn SampleSink,
        track_id: u32,
        pkt: PacketRef<'_>,
        time_us: i64,
    ) -> Result<bool, PacketError> {
        let payload = pkt.payload;
        let seq = pkt.sequence_number;
        if payload.len() < 3 {
            return Err(malformed(
                seq,
                format!("FU of {} bytes lacks FU header", payload.len()),
            ));
        }
        let fu_header = payload[2];
        let start = (fu_header & 0x80) != 0;
        let end = (fu_header & 0x40) != 0;
        let fu_type = fu_header & 0x3f;
        if start && end {
            return Err(malformed(seq, format!("invalid FU header {fu_header:08b}")));
        }
        let frag = &payload[3..];
        if start {
            if self.fu_nal_header.is_some() {
                log::warn!(
                    "[{CODEC}] FU start at seq={seq:04x} while fragment in progress; \
                     abandoning previous NAL"
                );
            }
            // Reconstruct the NAL header the fragmentation replaced: the
            // original type goes back into bits 1-6 of the first byte.
            let nal_header = [(payload[0] & 0x81) | (fu_type << 1), payload[1]];
            if !self.assembly.is_accumulating() {
                self.assembly.begin(pkt.timestamp, time_us, false);
            }
            self.fu_nal_header = Some(nal_header);
            sink.sample_data(track_id, &NAL_START_CODE);
            sink.sample_data(track_id, &nal_header);
            sink.sample_data(track_id, frag);
            self.assembly
                .extend(NAL_START_CODE.len() + nal_header.len() + frag.len());
            if fu_type == NAL_UNIT_TYPE_IDR_W_RADL || fu_type == NAL_UNIT_TYPE_IDR_N_LP {
                self.assembly.note_key_frame();
            }
        } else {
            match continuity(self.previous_sequence_number, seq) {
                Continuity::Behind => {
                    log::warn!(
                        "[{CODEC}] dropping stale or reordered FU continuation seq={seq:04x}"
                    );
                    return Ok(false);
                }
                Continuity::Ahead => log::warn!(
                    "[{CODEC}] gap before FU continuation seq={seq:04x}; \
                     current access unit will be damaged"
                ),
                Continuity::Consecutive => {}
            }
            let Some(expected) = self.fu_nal_header else {
                log::warn!(
                    "[{CODEC}] dropping FU continuation seq={seq:04x} with no fragment \
                     in progress"
                );
                return Ok(false);
            };
            let header = [(payload[0] & 0x81) | (fu_type << 1), payload[1]];
            if expected != header {
                log::warn!(
                    "[{CODEC}] FU NAL header changed {expected:02x?} -> {header:02x?} \
                     mid-fragment at seq={seq:04x}"
                );
            }
            if pkt.mark && !end {
                return Err(malformed(seq, "FU with marker but no end bit".to_owned()));
            }
            sink.sample_data(track_id, frag);
            self.assembly.extend(frag.len());
            if end {
                self.fu_nal_header = None;
            }
        }
        Ok(true)
    }
}

fn malformed(sequence_number: u16, description: String) -> PacketError {
    PacketError::Malformed {
        codec: CODEC,
        sequence_number,
        description,
    }
}

#[cfg(test)]
mod tests {
    use crate::format::{MediaKind, PayloadFormat};
    use crate::rtp::PacketRef;
    use crate::testutil::RecordingSink;

    fn reader() -> super::Reader {
        let format = PayloadFormat::new(MediaKind::Video, "h265", 90_000);
        super::Reader::new(&format).unwrap()
    }

    #[test]
    fn single_nal_unit() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        // Type 32 (VPS): (64 >> 1) & 0x3f == 32; not a key picture by itself.
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x40\x01vps",
                timestamp: 0,
                sequence_number: 0,
                mark: false,
            },
        )
        .unwrap();
        // Type 19 (IDR_W_RADL): 19 << 1 == 0x26.
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x26\x01idr",
                timestamp: 0,
                sequence_number: 1,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        let (data, meta) = &samples[0];
        assert_eq!(
            &data[..],
            b"\x00\x00\x00\x01\x40\x01vps\x00\x00\x00\x01\x26\x01idr"
        );
        assert!(meta.is_key_frame);
        assert_eq!(meta.size, data.len());
    }

    #[test]
    fn fu_reassembly() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        // Payload header type 49 (0x62), layer/TID byte 0x01, FU header with
        // start bit and type 20 (IDR_N_LP): 0x80 | 20 = 0x94.
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x62\x01\x94first ",
                timestamp: 0,
                sequence_number: 0,
                mark: false,
            },
        )
        .unwrap();
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x62\x01\x14middle ",
                timestamp: 0,
                sequence_number: 1,
                mark: false,
            },
        )
        .unwrap();
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x62\x01\x54last",
                timestamp: 0,
                sequence_number: 2,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        let (data, meta) = &samples[0];
        // Synthesized header: (0x62 & 0x81) | (20 << 1) = 0x28, then the
        // original second byte.
        assert_eq!(&data[..], b"\x00\x00\x00\x01\x28\x01first middle last");
        assert!(meta.is_key_frame);
        assert_eq!(meta.size, data.len());
    }

    #[test]
    fn rejects_aggregation_packets() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        // Type 48: 48 << 1 == 0x60.
        let e = r
            .consume(
                &mut sink,
                PacketRef {
                    payload: b"\x60\x01\x00\x02ab",
                    timestamp: 0,
                    sequence_number: 0,
                    mark: true,
                },
            )
            .unwrap_err();
        assert!(e.to_string().contains("aggregation"));
    }

    #[test]
    fn rejects_empty_and_truncated() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        let base = PacketRef {
            payload: b"",
            timestamp: 0,
            sequence_number: 0,
            mark: true,
        };
        assert!(r.consume(&mut sink, base).is_err());
        // FU with no FU header byte.
        assert!(r
            .consume(&mut sink, PacketRef { payload: b"\x62\x01", ..base })
            .is_err());
    }

    #[test]
    fn fu_gap_damages_but_does_not_halt() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        r.consume(
            &mut sink,
            PacketRef {
                // FU start, type 1.
                payload: b"\x62\x01\x82aa",
                timestamp: 0,
                sequence_number: 0,
                mark: false,
            },
        )
        .unwrap();
        // seq 1 lost; continuation at 2 still lands.
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x62\x01\x42cc",
                timestamp: 0,
                sequence_number: 2,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        assert_eq!(&samples[0].0[..], b"\x00\x00\x00\x01\x04\x01aacc");
        assert!(!samples[0].1.is_key_frame);
    }
}
