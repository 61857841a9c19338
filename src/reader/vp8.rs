// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP8 video, with RTP encoding as in
//! [RFC 7741](https://tools.ietf.org/html/rfc7741).

use crate::error::{FormatError, PacketError};
use crate::format::{Format, PayloadFormat, VideoFormat};
use crate::rtp::PacketRef;
use crate::sink::SampleSink;
use crate::timestamp::TimeBase;

use super::{continuity, fixed_clock_rate, Assembly, Continuity};

const CODEC: &str = "vp8";

/// Reassembles VP8 frames from their payload descriptor framing.
///
/// A frame starts at a packet whose descriptor has the S bit set with
/// partition index 0 and ends at the marker bit. The descriptor's optional
/// extension fields are skipped, not interpreted; the key-frame flag comes
/// from the inverted P bit of the first byte of the VP8 payload itself.
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
        let (start_of_partition, partition_index, data_off) = parse_descriptor(payload)
            .map_err(|description| PacketError::Malformed {
                codec: CODEC,
                sequence_number: seq,
                description,
            })?;
        let data = &payload[data_off..];

        if start_of_partition && partition_index == 0 {
            // A new frame begins. If the previous frame's marked packet was
            // lost, its metadata is still owed; flush before starting over.
            if self.assembly.is_accumulating() {
                log::warn!(
                    "[{CODEC}] frame never marked complete; flushing at seq={seq:04x}"
                );
                if let Some(meta) = self.assembly.take() {
                    sink.sample_metadata(track_id, meta);
                }
            }
            let time_us = self.time.sample_time_us(pkt.timestamp);
            let is_key_frame = (data[0] & 0x01) == 0;
            self.assembly.begin(pkt.timestamp, time_us, is_key_frame);
        } else {
            if !self.assembly.is_accumulating() {
                log::warn!(
                    "[{CODEC}] dropping continuation seq={seq:04x} with no frame in progress"
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
                    "[{CODEC}] gap before continuation seq={seq:04x}; frame will be damaged"
                ),
                Continuity::Consecutive => {}
            }
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

/// Walks the VP8 payload descriptor (RFC 7741 section 4.2), returning
/// `(start_of_partition, partition_index, payload_offset)`.
fn parse_descriptor(payload: &[u8]) -> Result<(bool, u8, usize), String> {
    if payload.is_empty() {
        return Err("empty payload".to_owned());
    }
    let b0 = payload[0];
    let start_of_partition = (b0 & 0x10) != 0;
    let partition_index = b0 & 0x0f;
    let mut off = 1;
    if (b0 & 0x80) != 0 {
        // Extension byte: I, L, T, K.
        let ext = *payload.get(off).ok_or("truncated descriptor extension")?;
        off += 1;
        if (ext & 0x80) != 0 {
            // PictureID, 7 or 15 bits.
            let pid = *payload.get(off).ok_or("truncated PictureID")?;
            off += 1;
            if (pid & 0x80) != 0 {
                payload.get(off).ok_or("truncated 15-bit PictureID")?;
                off += 1;
            }
        }
        if (ext & 0x40) != 0 {
            payload.get(off).ok_or("truncated TL0PICIDX")?;
            off += 1;
        }
        if (ext & 0x30) != 0 {
            payload.get(off).ok_or("truncated TID/KEYIDX")?;
            off += 1;
        }
    }
    if off >= payload.len() {
        return Err("descriptor leaves no VP8 payload".to_owned());
    }
    Ok((start_of_partition, partition_index, off))
}

#[cfg(test)]
mod tests {
    use crate::format::{MediaKind, PayloadFormat};
    use crate::rtp::PacketRef;
    use crate::testutil::RecordingSink;

    fn reader() -> super::Reader {
        super::Reader::new(&PayloadFormat::new(MediaKind::Video, "vp8", 90_000)).unwrap()
    }

    #[test]
    fn single_packet_key_frame() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        // Minimal descriptor: S bit, partition 0. First payload byte with P
        // bit clear means a key frame.
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x10\x00keyframe",
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        assert_eq!(&samples[0].0[..], b"\x00keyframe");
        assert!(samples[0].1.is_key_frame);
    }

    #[test]
    fn extended_descriptor_is_skipped() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        // X+S, extension I with 15-bit PictureID, then an interframe (P=1).
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x90\x80\x81\x23\x01inter",
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        assert_eq!(&samples[0].0[..], b"\x01inter");
        assert!(!samples[0].1.is_key_frame);
    }

    #[test]
    fn fragmented_frame() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(100, 1);
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x10\x00abc",
                timestamp: 100,
                sequence_number: 1,
                mark: false,
            },
        )
        .unwrap();
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x00def",
                timestamp: 100,
                sequence_number: 2,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        assert_eq!(&samples[0].0[..], b"\x00abcdef");
        assert_eq!(samples[0].1.size, 7);
    }

    #[test]
    fn continuation_without_start_dropped() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x00continuation",
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        assert!(sink.samples(0).is_empty());
    }

    #[test]
    fn unmarked_frame_flushed_when_next_starts() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x10\x01first",
                timestamp: 0,
                sequence_number: 0,
                mark: false,
            },
        )
        .unwrap();
        // Marker lost; the next frame's S-bit packet flushes the previous.
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x10\x01second",
                timestamp: 3_000,
                sequence_number: 2,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 2);
        assert_eq!(&samples[0].0[..], b"\x01first");
        assert_eq!(&samples[1].0[..], b"\x01second");
    }
}
