// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AC-3 audio, with RTP encoding as in
//! [RFC 4184](https://tools.ietf.org/html/rfc4184).
//!
//! The 2-byte payload header gives a frame type and count. Complete-frame
//! packets may concatenate several sync frames, each sized from its own
//! syncinfo header; oversized frames are fragmented across packets and
//! reassembled via the marker bit.

use crate::error::{FormatError, PacketError};
use crate::format::{AudioFormat, Format, PayloadFormat};
use crate::rtp::PacketRef;
use crate::sink::{SampleMetadata, SampleSink};
use crate::timestamp::TimeBase;

use super::{clock_rate, warn_on_gap, Assembly};

const CODEC: &str = "ac3";

/// Samples per AC-3 sync frame, fixed by the codec.
const SAMPLES_PER_FRAME: u32 = 1536;

/// Payload header frame types, RFC 4184 section 4.1.1.
const FRAME_TYPE_COMPLETE: u8 = 0;
const FRAME_TYPE_INITIAL_FRAGMENT_A: u8 = 1;
const FRAME_TYPE_INITIAL_FRAGMENT_B: u8 = 2;
const FRAME_TYPE_FRAGMENT: u8 = 3;

/// Nominal bitrates in kbit/s indexed by `frmsizecod >> 1`, ATSC A/52
/// table 5.18.
#[rustfmt::skip]
const BITRATES_KBPS: [usize; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128,
    160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

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
        let clock_rate = clock_rate(format)?;
        Ok(Self {
            format: Format::Audio(
                AudioFormat::new("ac3", clock_rate.get()).with_channels(format.channels()),
            ),
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
        warn_on_gap(CODEC, self.previous_sequence_number, seq);
        self.previous_sequence_number = Some(seq);

        if payload.len() < 3 {
            return Err(malformed("too short for payload header".to_owned()));
        }
        let frame_type = payload[0] & 0x03;
        let frame_count = payload[1];
        let data = &payload[2..];

        match frame_type {
            FRAME_TYPE_COMPLETE => {
                if self.assembly.is_accumulating() {
                    log::warn!(
                        "[{CODEC}] fragmented frame never marked complete; \
                         flushing at seq={seq:04x}"
                    );
                    if let Some(meta) = self.assembly.take() {
                        sink.sample_metadata(track_id, meta);
                    }
                }
                if frame_count <= 1 {
                    sink.sample_data(track_id, data);
                    sink.sample_metadata(
                        track_id,
                        SampleMetadata {
                            time_us: self.time.sample_time_us(pkt.timestamp),
                            is_key_frame: true,
                            size: data.len(),
                            offset: 0,
                        },
                    );
                    return Ok(());
                }
                // Several complete sync frames concatenated; each one's size
                // comes from its own syncinfo header and each is its own
                // access unit, one frame length apart.
                let mut off = 0;
                let mut i = 0u32;
                while off < data.len() {
                    let size = syncframe_size(&data[off..]).map_err(&malformed)?;
                    if data.len() - off < size {
                        return Err(malformed(format!(
                            "sync frame {i} declares {size} bytes but only {} remain",
                            data.len() - off
                        )));
                    }
                    sink.sample_data(track_id, &data[off..off + size]);
                    let rtp_timestamp =
                        pkt.timestamp.wrapping_add(i.wrapping_mul(SAMPLES_PER_FRAME));
                    sink.sample_metadata(
                        track_id,
                        SampleMetadata {
                            time_us: self.time.sample_time_us(rtp_timestamp),
                            is_key_frame: true,
                            size,
                            offset: 0,
                        },
                    );
                    off += size;
                    i += 1;
                }
                if i != u32::from(frame_count) {
                    log::warn!(
                        "[{CODEC}] header declared {frame_count} frames but packet held {i}"
                    );
                }
            }
            FRAME_TYPE_INITIAL_FRAGMENT_A | FRAME_TYPE_INITIAL_FRAGMENT_B => {
                if self.assembly.is_accumulating() {
                    log::warn!(
                        "[{CODEC}] new fragmented frame at seq={seq:04x} while one in \
                         progress; flushing previous"
                    );
                    if let Some(meta) = self.assembly.take() {
                        sink.sample_metadata(track_id, meta);
                    }
                }
                let time_us = self.time.sample_time_us(pkt.timestamp);
                self.assembly.begin(pkt.timestamp, time_us, true);
                sink.sample_data(track_id, data);
                self.assembly.extend(data.len());
            }
            FRAME_TYPE_FRAGMENT => {
                if !self.assembly.is_accumulating() {
                    log::warn!(
                        "[{CODEC}] dropping fragment seq={seq:04x} with no frame in progress"
                    );
                    return Ok(());
                }
                sink.sample_data(track_id, data);
                self.assembly.extend(data.len());
            }
            _ => unreachable!("two-bit frame type"),
        }

        if pkt.mark {
            if let Some(meta) = self.assembly.take() {
                sink.sample_metadata(track_id, meta);
            }
        }
        Ok(())
    }
}

/// Size in bytes of the sync frame starting at `data`, from its syncinfo
/// header (syncword, CRC1, fscod + frmsizecod).
fn syncframe_size(data: &[u8]) -> Result<usize, String> {
    if data.len() < 5 {
        return Err("truncated syncinfo".to_owned());
    }
    if data[0] != 0x0b || data[1] != 0x77 {
        return Err(format!("bad syncword {:02x}{:02x}", data[0], data[1]));
    }
    let fscod = data[4] >> 6;
    let frmsizecod = usize::from(data[4] & 0x3f);
    let Some(&bitrate) = BITRATES_KBPS.get(frmsizecod >> 1) else {
        return Err(format!("reserved frmsizecod {frmsizecod}"));
    };
    match fscod {
        0 => Ok(bitrate * 4),                                  // 48 kHz
        1 => Ok(2 * (320 * bitrate / 147 + (frmsizecod & 1))), // 44.1 kHz
        2 => Ok(bitrate * 6),                                  // 32 kHz
        _ => Err("reserved fscod".to_owned()),
    }
}
