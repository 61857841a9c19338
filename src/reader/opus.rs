// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opus audio, with RTP encoding as in
//! [RFC 7587](https://tools.ietf.org/html/rfc7587) and header packets as in
//! [RFC 7845](https://tools.ietf.org/html/rfc7845).
//!
//! The first two packets of the stream are not audio: an ID header
//! (`OpusHead`) and a comment header (`OpusTags`). Both are validated and
//! swallowed; the ID header's contents re-declare the track format. Every
//! later packet is one audio access unit.

use std::num::NonZeroU16;

use bytes::Bytes;

use crate::error::{FormatError, PacketError};
use crate::format::{AudioFormat, Format, PayloadFormat};
use crate::rtp::PacketRef;
use crate::sink::{SampleMetadata, SampleSink};
use crate::timestamp::TimeBase;

use super::{fixed_clock_rate, warn_on_gap};

const CODEC: &str = "opus";

const ID_HEADER_MAGIC: &[u8] = b"OpusHead";
const COMMENT_HEADER_MAGIC: &[u8] = b"OpusTags";

/// Minimum ID header length: magic, version, channel count, pre-skip,
/// input sample rate, output gain, mapping family.
const ID_HEADER_MIN_LEN: usize = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingIdHeader,
    AwaitingCommentHeader,
    Audio,
}

#[derive(Debug)]
pub(crate) struct Reader {
    format: Format,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,
    phase: Phase,
}

impl Reader {
    pub(super) fn new(format: &PayloadFormat) -> Result<Self, FormatError> {
        // RFC 7587 section 4.1: the RTP clock rate is always 48 kHz
        // regardless of the coded bandwidth.
        let clock_rate = fixed_clock_rate(format, 48_000)?;
        Ok(Self {
            format: Format::Audio(
                AudioFormat::new("opus", clock_rate.get()).with_channels(format.channels()),
            ),
            track_id: None,
            time: TimeBase::new(clock_rate),
            previous_sequence_number: None,
            phase: Phase::AwaitingIdHeader,
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
        // The header packets arrive only at stream start; a seek doesn't
        // replay them.
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

        match self.phase {
            Phase::AwaitingIdHeader => {
                if !payload.starts_with(ID_HEADER_MAGIC) || payload.len() < ID_HEADER_MIN_LEN {
                    return Err(malformed("expected OpusHead ID header".to_owned()));
                }
                let version = payload[8];
                // RFC 7845 section 5.1: only the upper nibble breaks
                // compatibility.
                if (version >> 4) != 0 {
                    return Err(malformed(format!("unsupported ID header version {version}")));
                }
                let channels = NonZeroU16::new(u16::from(payload[9]));
                self.format = Format::Audio(
                    AudioFormat::new("opus", 48_000)
                        .with_channels(channels)
                        .with_extra_data(Bytes::copy_from_slice(payload)),
                );
                sink.format(track_id, &self.format);
                self.phase = Phase::AwaitingCommentHeader;
            }
            Phase::AwaitingCommentHeader => {
                if !payload.starts_with(COMMENT_HEADER_MAGIC) {
                    return Err(malformed("expected OpusTags comment header".to_owned()));
                }
                self.phase = Phase::Audio;
            }
            Phase::Audio => {
                if payload.is_empty() {
                    return Err(malformed("empty audio payload".to_owned()));
                }
                sink.sample_data(track_id, payload);
                sink.sample_metadata(
                    track_id,
                    SampleMetadata {
                        time_us: self.time.sample_time_us(pkt.timestamp),
                        is_key_frame: true,
                        size: payload.len(),
                        offset: 0,
                    },
                );
            }
        }
        Ok(())
    }
}
