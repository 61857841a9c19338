// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-4 audio in LATM framing, with RTP encoding as in
//! [RFC 3016](https://tools.ietf.org/html/rfc3016).
//!
//! The negotiated `config` parameter (a hex StreamMuxConfig) fixes the
//! number of subframes per audio mux element at construction time. Each
//! subframe is one access unit, prefixed by a 0xFF-continuation payload
//! length; an element whose final subframe overflows the packet continues,
//! without another length prefix, in the following packets.

use bitstream_io::BitRead;
use bytes::Bytes;

use crate::error::{FormatError, PacketError};
use crate::format::{AudioFormat, Format, PayloadFormat};
use crate::rtp::PacketRef;
use crate::sink::{SampleMetadata, SampleSink};
use crate::timestamp::TimeBase;

use super::{clock_rate, warn_on_gap, Assembly};

const CODEC: &str = "mp4a-latm";

/// Samples per subframe used to space timestamps within one element; the
/// common general-audio frame length.
const FRAME_LENGTH: u32 = 1024;

#[derive(Debug)]
pub(crate) struct Reader {
    format: Format,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,

    /// Subframes per audio mux element, from the StreamMuxConfig.
    subframe_count: u32,

    /// Subframes already finalized in the current element.
    subframes_parsed: u32,

    /// RTP timestamp of the current element's first subframe.
    element_timestamp: u32,

    assembly: Assembly,

    /// Bytes still missing from the subframe left open by the previous
    /// packet.
    fragment_remaining: usize,
}

impl Reader {
    pub(super) fn new(format: &PayloadFormat) -> Result<Self, FormatError> {
        let clock_rate = clock_rate(format)?;
        let config = format
            .parameter("config")
            .ok_or(FormatError::MissingParameter("config"))?;
        let raw = hex::decode(config).map_err(|_| FormatError::BadParameter {
            name: "config",
            description: "invalid hex encoding".to_owned(),
        })?;
        let subframe_count =
            parse_stream_mux_config(&raw).map_err(|description| FormatError::BadParameter {
                name: "config",
                description,
            })?;
        Ok(Self {
            format: Format::Audio(
                AudioFormat::new("mp4a-latm", clock_rate.get())
                    .with_channels(format.channels())
                    .with_extra_data(Bytes::from(raw)),
            ),
            track_id: None,
            time: TimeBase::new(clock_rate),
            previous_sequence_number: None,
            subframe_count,
            subframes_parsed: 0,
            element_timestamp: 0,
            assembly: Assembly::default(),
            fragment_remaining: 0,
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
        self.fragment_remaining = 0;
        self.subframes_parsed = 0;
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
        let malformed = |description: String| PacketError::Malformed {
            codec: CODEC,
            sequence_number: seq,
            description,
        };
        warn_on_gap(CODEC, self.previous_sequence_number, seq);
        self.previous_sequence_number = Some(seq);

        if pkt.payload.is_empty() {
            return Err(malformed("empty payload".to_owned()));
        }
        let mut data = pkt.payload;
        if self.fragment_remaining == 0 && self.subframes_parsed == 0 {
            self.element_timestamp = pkt.timestamp;
        }

        // Finish the subframe left open by the previous packet, if any.
        // Continuation bytes arrive raw; the length prefix was sent only in
        // the first fragment.
        if self.fragment_remaining > 0 {
            let take = self.fragment_remaining.min(data.len());
            sink.sample_data(track_id, &data[..take]);
            self.assembly.extend(take);
            self.fragment_remaining -= take;
            data = &data[take..];
            if self.fragment_remaining == 0 {
                if let Some(meta) = self.assembly.take() {
                    sink.sample_metadata(track_id, meta);
                }
                self.subframes_parsed += 1;
            }
        }

        while !data.is_empty() && self.fragment_remaining == 0 {
            if self.subframes_parsed >= self.subframe_count {
                return Err(malformed(format!(
                    "more than {} subframes in audio mux element",
                    self.subframe_count
                )));
            }
            // PayloadLengthInfo: sum of bytes, 0xFF meaning "continue".
            let mut length = 0usize;
            loop {
                let Some((&b, rest)) = data.split_first() else {
                    return Err(malformed("truncated payload length".to_owned()));
                };
                data = rest;
                length += usize::from(b);
                if b != 0xff {
                    break;
                }
            }
            let i = self.subframes_parsed;
            let rtp_timestamp = self.element_timestamp.wrapping_add(i * FRAME_LENGTH);
            let time_us = self.time.sample_time_us(rtp_timestamp);
            if length <= data.len() {
                sink.sample_data(track_id, &data[..length]);
                sink.sample_metadata(
                    track_id,
                    SampleMetadata {
                        time_us,
                        is_key_frame: true,
                        size: length,
                        offset: 0,
                    },
                );
                self.subframes_parsed += 1;
                data = &data[length..];
            } else {
                // Final subframe spills into the next packet(s).
                self.assembly.begin(rtp_timestamp, time_us, true);
                sink.sample_data(track_id, data);
                self.assembly.extend(data.len());
                self.fragment_remaining = length - data.len();
                data = &[];
            }
        }

        if pkt.mark {
            if self.fragment_remaining > 0 {
                log::warn!(
                    "[{CODEC}] element marked complete with {} bytes missing; \
                     emitting truncated subframe",
                    self.fragment_remaining
                );
                self.fragment_remaining = 0;
                if let Some(meta) = self.assembly.take() {
                    sink.sample_metadata(track_id, meta);
                }
            }
            self.subframes_parsed = 0;
        }
        Ok(())
    }
}

/// Parses a StreamMuxConfig (ISO/IEC 14496-3 section 1.7.3) far enough to
/// learn the subframe count.
fn parse_stream_mux_config(raw: &[u8]) -> Result<u32, String> {
    let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
    let audio_mux_version = r
        .read_bit()
        .map_err(|e| format!("unable to read audioMuxVersion: {e}"))?;
    if audio_mux_version {
        return Err("audioMuxVersion 1 is unsupported".to_owned());
    }
    r.read_bit()
        .map_err(|e| format!("unable to read allStreamsSameTimeFraming: {e}"))?;
    let num_sub_frames = r
        .read::<u8>(6)
        .map_err(|e| format!("unable to read numSubFrames: {e}"))?;
    let num_program = r
        .read::<u8>(4)
        .map_err(|e| format!("unable to read numProgram: {e}"))?;
    if num_program != 0 {
        return Err(format!("{} extra programs unsupported", num_program));
    }
    let num_layer = r
        .read::<u8>(3)
        .map_err(|e| format!("unable to read numLayer: {e}"))?;
    if num_layer != 0 {
        return Err(format!("{} extra layers unsupported", num_layer));
    }
    Ok(u32::from(num_sub_frames) + 1)
}
