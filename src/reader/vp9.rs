// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP9 video, with RTP encoding as in
//! [draft-ietf-payload-vp9](https://datatracker.ietf.org/doc/html/draft-ietf-payload-vp9).

use crate::error::{FormatError, PacketError};
use crate::format::{Format, PayloadFormat, VideoFormat};
use crate::rtp::PacketRef;
use crate::sink::SampleSink;
use crate::timestamp::TimeBase;

use super::{continuity, fixed_clock_rate, Assembly, Continuity};

const CODEC: &str = "vp9";

/// Reassembles VP9 frames from their payload descriptor framing.
///
/// Only non-flexible mode is supported; a descriptor with the F bit set
/// fails fast. When a scalability structure announces frame resolutions,
/// the track's format is re-declared with the new dimensions.
#[derive(Debug)]
pub(crate) struct Reader {
    format: VideoFormat,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,
    assembly: Assembly,
}

/// Fields of interest from one packet's payload descriptor.
struct Descriptor {
    start_of_frame: bool,
    inter_picture_predicted: bool,
    /// Resolution from a scalability structure, if one was present with the
    /// Y bit set. The last spatial layer's resolution wins.
    resolution: Option<(u32, u32)>,
    payload_offset: usize,
}

impl Reader {
    pub(super) fn new(format: &PayloadFormat) -> Result<Self, FormatError> {
        let clock_rate = fixed_clock_rate(format, 90_000)?;
        Ok(Self {
            format: VideoFormat::new(CODEC, 90_000),
            track_id: None,
            time: TimeBase::new(clock_rate),
            previous_sequence_number: None,
            assembly: Assembly::default(),
        })
    }

    pub(super) fn create_tracks(&mut self, sink: &mut dyn SampleSink, track_id: u32) {
        debug_assert!(self.track_id.is_none(), "create_tracks called twice");
        self.track_id = Some(track_id);
        sink.format(track_id, &Format::Video(self.format.clone()));
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
        let d = parse_descriptor(pkt.payload, seq)?;
        let data = &pkt.payload[d.payload_offset..];

        // Dynamic format update from the scalability structure.
        if let Some((width, height)) = d.resolution {
            if self.format.pixel_dimensions() != Some((width, height)) {
                self.format = VideoFormat::new(CODEC, 90_000).with_pixel_dimensions(width, height);
                sink.format(track_id, &Format::Video(self.format.clone()));
            }
        }

        if d.start_of_frame {
            if self.assembly.is_accumulating() {
                log::warn!(
                    "[{CODEC}] frame never marked complete; flushing at seq={seq:04x}"
                );
                if let Some(meta) = self.assembly.take() {
                    sink.sample_metadata(track_id, meta);
                }
            }
            let time_us = self.time.sample_time_us(pkt.timestamp);
            self.assembly
                .begin(pkt.timestamp, time_us, !d.inter_picture_predicted);
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

/// Walks the VP9 payload descriptor (draft-ietf-payload-vp9 section 4.2).
fn parse_descriptor(payload: &[u8], seq: u16) -> Result<Descriptor, PacketError> {
    let malformed = |description: String| PacketError::Malformed {
        codec: CODEC,
        sequence_number: seq,
        description,
    };
    if payload.is_empty() {
        return Err(malformed("empty payload".to_owned()));
    }
    let b0 = payload[0];
    let has_picture_id = (b0 & 0x80) != 0;
    let inter_picture_predicted = (b0 & 0x40) != 0;
    let has_layer_indices = (b0 & 0x20) != 0;
    let flexible_mode = (b0 & 0x10) != 0;
    let start_of_frame = (b0 & 0x08) != 0;
    let has_scalability_structure = (b0 & 0x02) != 0;
    if flexible_mode {
        return Err(PacketError::Unsupported {
            codec: CODEC,
            sequence_number: seq,
            description: "flexible mode".to_owned(),
        });
    }
    let mut off = 1;
    if has_picture_id {
        let pid = *payload
            .get(off)
            .ok_or_else(|| malformed("truncated PictureID".to_owned()))?;
        off += 1;
        if (pid & 0x80) != 0 {
            payload
                .get(off)
                .ok_or_else(|| malformed("truncated 15-bit PictureID".to_owned()))?;
            off += 1;
        }
    }
    if has_layer_indices {
        // Layer indices byte plus TL0PICIDX (present in non-flexible mode).
        off += 2;
        if off > payload.len() {
            return Err(malformed("truncated layer indices".to_owned()));
        }
    }
    let mut resolution = None;
    if has_scalability_structure {
        let header = *payload
            .get(off)
            .ok_or_else(|| malformed("truncated scalability structure".to_owned()))?;
        off += 1;
        let spatial_layers = usize::from(header >> 5) + 1;
        let has_resolutions = (header & 0x10) != 0;
        let has_picture_group = (header & 0x08) != 0;
        if has_resolutions {
            for _ in 0..spatial_layers {
                if off + 4 > payload.len() {
                    return Err(malformed("truncated scalability resolution".to_owned()));
                }
                let width = u32::from(u16::from_be_bytes([payload[off], payload[off + 1]]));
                let height = u32::from(u16::from_be_bytes([payload[off + 2], payload[off + 3]]));
                resolution = Some((width, height));
                off += 4;
            }
        }
        if has_picture_group {
            let count = *payload
                .get(off)
                .ok_or_else(|| malformed("truncated picture group count".to_owned()))?;
            off += 1;
            for _ in 0..count {
                let pg = *payload
                    .get(off)
                    .ok_or_else(|| malformed("truncated picture group".to_owned()))?;
                off += 1;
                let ref_count = usize::from((pg >> 2) & 0x03);
                off += ref_count;
                if off > payload.len() {
                    return Err(malformed("truncated picture group refs".to_owned()));
                }
            }
        }
    }
    if off >= payload.len() {
        return Err(malformed("descriptor leaves no VP9 payload".to_owned()));
    }
    Ok(Descriptor {
        start_of_frame,
        inter_picture_predicted,
        resolution,
        payload_offset: off,
    })
}
