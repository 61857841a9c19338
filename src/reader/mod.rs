// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-codec payload readers and the factory that selects one.

use std::num::NonZeroU32;

use crate::error::{FormatError, PacketError};
use crate::format::{MediaKind, PayloadFormat};
use crate::rtp::PacketRef;
use crate::sink::{SampleMetadata, SampleSink};

pub(crate) mod aac;
pub(crate) mod ac3;
pub(crate) mod amr;
pub(crate) mod h263;
pub(crate) mod h264;
pub(crate) mod h265;
pub(crate) mod latm;
pub(crate) mod mpeg4;
pub(crate) mod opus;
pub(crate) mod pcm;
pub(crate) mod vp8;
pub(crate) mod vp9;

/// Turns one track's RTP payload stream into access units for a sink.
///
/// One instance per negotiated track; a track's packets must be fed from a
/// single thread, but distinct tracks are fully independent. `seek` must be
/// externally serialized with `consume`.
#[derive(Debug)]
pub struct PayloadReader(Inner);

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
enum Inner {
    Aac(aac::Reader),
    Ac3(ac3::Reader),
    Amr(amr::Reader),
    H263(h263::Reader),
    H264(h264::Reader),
    H265(h265::Reader),
    Latm(latm::Reader),
    Mpeg4(mpeg4::Reader),
    Opus(opus::Reader),
    Pcm(pcm::Reader),
    Vp8(vp8::Reader),
    Vp9(vp9::Reader),
}

impl PayloadReader {
    /// Selects and constructs a reader for the given negotiated format.
    ///
    /// Returns `Ok(None)` when no reader exists for the codec (the caller
    /// decides whether that is fatal for the session) and `Err` when the
    /// codec is known but its parameters are unusable.
    ///
    /// Encoding names follow the IANA RTP payload format media type registry.
    pub fn new(format: &PayloadFormat) -> Result<Option<Self>, FormatError> {
        Ok(Some(PayloadReader(
            match (format.media(), format.encoding_name()) {
                (MediaKind::Video, "h264") => Inner::H264(h264::Reader::new(format)?),
                (MediaKind::Video, "h265") => Inner::H265(h265::Reader::new(format)?),
                (MediaKind::Video, "vp8") => Inner::Vp8(vp8::Reader::new(format)?),
                (MediaKind::Video, "vp9") => Inner::Vp9(vp9::Reader::new(format)?),
                (MediaKind::Video, "mp4v-es") => Inner::Mpeg4(mpeg4::Reader::new(format)?),
                (MediaKind::Video, "h263-1998" | "h263-2000" | "h263") => {
                    Inner::H263(h263::Reader::new(format)?)
                }
                (MediaKind::Audio, "mpeg4-generic") => Inner::Aac(aac::Reader::new(format)?),
                (MediaKind::Audio, "mp4a-latm") => Inner::Latm(latm::Reader::new(format)?),
                (MediaKind::Audio, "amr" | "amr-wb") => Inner::Amr(amr::Reader::new(format)?),
                (MediaKind::Audio, "ac3") => Inner::Ac3(ac3::Reader::new(format)?),
                (MediaKind::Audio, "opus") => Inner::Opus(opus::Reader::new(format)?),
                (MediaKind::Audio, "l8" | "l16" | "pcma" | "pcmu" | "g722") => {
                    Inner::Pcm(pcm::Reader::new(format)?)
                }
                (media, encoding_name) => {
                    log::info!("no reader for {media:?}/{encoding_name}");
                    return Ok(None);
                }
            },
        )))
    }

    /// Registers this track with the sink, declaring its static format.
    ///
    /// Must be called exactly once, before the first `consume`.
    pub fn create_tracks(&mut self, sink: &mut dyn SampleSink, track_id: u32) {
        match &mut self.0 {
            Inner::Aac(r) => r.create_tracks(sink, track_id),
            Inner::Ac3(r) => r.create_tracks(sink, track_id),
            Inner::Amr(r) => r.create_tracks(sink, track_id),
            Inner::H263(r) => r.create_tracks(sink, track_id),
            Inner::H264(r) => r.create_tracks(sink, track_id),
            Inner::H265(r) => r.create_tracks(sink, track_id),
            Inner::Latm(r) => r.create_tracks(sink, track_id),
            Inner::Mpeg4(r) => r.create_tracks(sink, track_id),
            Inner::Opus(r) => r.create_tracks(sink, track_id),
            Inner::Pcm(r) => r.create_tracks(sink, track_id),
            Inner::Vp8(r) => r.create_tracks(sink, track_id),
            Inner::Vp9(r) => r.create_tracks(sink, track_id),
        }
    }

    /// Notes the RTP timestamp of the very first packet of the stream, which
    /// becomes the zero point for presentation time.
    ///
    /// Called once by the transport layer after classifying the first packet;
    /// calling again without an intervening `seek` is a caller bug.
    pub fn on_first_packet(&mut self, timestamp: u32, sequence_number: u16) {
        match &mut self.0 {
            Inner::Aac(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::Ac3(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::Amr(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::H263(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::H264(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::H265(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::Latm(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::Mpeg4(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::Opus(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::Pcm(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::Vp8(r) => r.on_first_packet(timestamp, sequence_number),
            Inner::Vp9(r) => r.on_first_packet(timestamp, sequence_number),
        }
    }

    /// Consumes one packet's payload, emitting any completed access units to
    /// the sink.
    ///
    /// Errors are structural framing violations and abort the track;
    /// sequence-number irregularities are logged and survived.
    pub fn consume(
        &mut self,
        sink: &mut dyn SampleSink,
        pkt: PacketRef<'_>,
    ) -> Result<(), PacketError> {
        match &mut self.0 {
            Inner::Aac(r) => r.consume(sink, pkt),
            Inner::Ac3(r) => r.consume(sink, pkt),
            Inner::Amr(r) => r.consume(sink, pkt),
            Inner::H263(r) => r.consume(sink, pkt),
            Inner::H264(r) => r.consume(sink, pkt),
            Inner::H265(r) => r.consume(sink, pkt),
            Inner::Latm(r) => r.consume(sink, pkt),
            Inner::Mpeg4(r) => r.consume(sink, pkt),
            Inner::Opus(r) => r.consume(sink, pkt),
            Inner::Pcm(r) => r.consume(sink, pkt),
            Inner::Vp8(r) => r.consume(sink, pkt),
            Inner::Vp9(r) => r.consume(sink, pkt),
        }
    }

    /// Rebases time after a server-acknowledged seek: `next_rtp_timestamp`
    /// now maps to presentation time `time_us`.
    ///
    /// Any partially assembled access unit spanning the seek boundary is
    /// discarded, never flushed.
    pub fn seek(&mut self, next_rtp_timestamp: u32, time_us: i64) {
        match &mut self.0 {
            Inner::Aac(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::Ac3(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::Amr(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::H263(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::H264(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::H265(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::Latm(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::Mpeg4(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::Opus(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::Pcm(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::Vp8(r) => r.seek(next_rtp_timestamp, time_us),
            Inner::Vp9(r) => r.seek(next_rtp_timestamp, time_us),
        }
    }
}

/// An access unit being assembled out of 1..N packets.
///
/// `Idle` → (first fragment) → `Accumulating` → (marker bit or codec-signaled
/// boundary) → emit → `Idle`. Readers that can detect the start of a new unit
/// flush a non-empty accumulator at that point, so an access unit whose
/// terminal packet was lost still gets its metadata.
#[derive(Debug, Default)]
pub(crate) enum Assembly {
    #[default]
    Idle,
    Accumulating {
        /// The RTP timestamp the unit started with; packets of one unit share it.
        rtp_timestamp: u32,
        time_us: i64,
        size: usize,
        is_key_frame: bool,
    },
}

impl Assembly {
    pub(crate) fn begin(&mut self, rtp_timestamp: u32, time_us: i64, is_key_frame: bool) {
        debug_assert!(!self.is_accumulating(), "begin while accumulating");
        *self = Assembly::Accumulating {
            rtp_timestamp,
            time_us,
            size: 0,
            is_key_frame,
        };
    }

    pub(crate) fn extend(&mut self, len: usize) {
        match self {
            Assembly::Accumulating { size, .. } => *size += len,
            Assembly::Idle => debug_assert!(false, "extend while idle"),
        }
    }

    pub(crate) fn note_key_frame(&mut self) {
        if let Assembly::Accumulating { is_key_frame, .. } = self {
            *is_key_frame = true;
        }
    }

    pub(crate) fn is_accumulating(&self) -> bool {
        matches!(self, Assembly::Accumulating { .. })
    }

    pub(crate) fn rtp_timestamp(&self) -> Option<u32> {
        match self {
            Assembly::Accumulating { rtp_timestamp, .. } => Some(*rtp_timestamp),
            Assembly::Idle => None,
        }
    }

    /// Finalizes the unit, returning its metadata and resetting to `Idle`.
    ///
    /// Returns `None` when there is nothing to emit (idle, or no bytes ever
    /// accumulated).
    pub(crate) fn take(&mut self) -> Option<SampleMetadata> {
        match std::mem::take(self) {
            Assembly::Accumulating {
                time_us,
                size,
                is_key_frame,
                ..
            } if size > 0 => Some(SampleMetadata {
                time_us,
                is_key_frame,
                size,
                offset: 0,
            }),
            _ => None,
        }
    }

    /// Discards any in-progress unit (seek).
    pub(crate) fn clear(&mut self) {
        *self = Assembly::Idle;
    }
}

/// Relationship of a packet's sequence number to the previously accepted one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Continuity {
    /// Directly follows (or no previous packet to compare with).
    Consecutive,
    /// Jumped forward: at least one packet was lost.
    Ahead,
    /// Went backward: stale, duplicated, or reordered.
    Behind,
}

pub(crate) fn continuity(previous: Option<u16>, sequence_number: u16) -> Continuity {
    let Some(prev) = previous else {
        return Continuity::Consecutive;
    };
    let delta = sequence_number.wrapping_sub(prev.wrapping_add(1));
    if delta == 0 {
        Continuity::Consecutive
    } else if delta < 0x8000 {
        Continuity::Ahead
    } else {
        Continuity::Behind
    }
}

/// Logs a warning if `sequence_number` doesn't directly follow `previous`.
/// Used by the audio readers, which recover from any irregularity.
pub(crate) fn warn_on_gap(codec: &'static str, previous: Option<u16>, sequence_number: u16) {
    if let Some(prev) = previous {
        let lost = sequence_number.wrapping_sub(prev).wrapping_sub(1);
        if lost != 0 {
            log::warn!(
                "[{codec}] sequence discontinuity: expected {:04x}, got {sequence_number:04x}",
                prev.wrapping_add(1),
            );
        }
    }
}

/// The negotiated clock rate as a `NonZeroU32`.
pub(crate) fn clock_rate(format: &PayloadFormat) -> Result<NonZeroU32, FormatError> {
    NonZeroU32::new(format.clock_rate()).ok_or(FormatError::BadClockRate {
        clock_rate: 0,
        description: "clock rate must be nonzero",
    })
}

/// The negotiated clock rate, which must equal `expected` for this codec.
pub(crate) fn fixed_clock_rate(
    format: &PayloadFormat,
    expected: u32,
) -> Result<NonZeroU32, FormatError> {
    if format.clock_rate() != expected {
        return Err(FormatError::BadClockRate {
            clock_rate: format.clock_rate(),
            description: "fixed clock rate for this codec",
        });
    }
    clock_rate(format)
}
