// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The downstream contract: where depacketized samples go.

use crate::format::Format;

/// Metadata finalizing one access unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleMetadata {
    /// Presentation time in microseconds, rebased as described in
    /// [`crate::timestamp`].
    pub time_us: i64,

    /// True iff this access unit is decodable without reference to prior
    /// frames (IDR / I-VOP / non-predicted frame). Audio access units are
    /// always key frames.
    pub is_key_frame: bool,

    /// Total size of the access unit: the sum of the lengths of the
    /// `sample_data` writes since the previous `sample_metadata` call.
    pub size: usize,

    /// Offset from the end of the most recent `sample_data` write to the end
    /// of this access unit. Currently always zero; readers finalize a unit
    /// immediately after its last byte.
    pub offset: usize,
}

/// Receives track declarations and depacketized samples.
///
/// One sink may serve several tracks (e.g. one audio + one video); calls are
/// tagged with the `track_id` passed to `create_tracks`. For a given track,
/// the call pattern is: one `format` call up front, then zero or more
/// repetitions of (`sample_data`+, `sample_metadata`), with occasional
/// additional `format` calls when in-band data revises the declaration.
///
/// Each access unit's bytes arrive through one or more `sample_data` calls
/// followed by exactly one `sample_metadata` call; a unit is never finalized
/// twice, and a unit whose terminal packet was lost is flushed when its
/// successor begins rather than dropped silently.
pub trait SampleSink {
    /// Declares (or re-declares) the format of `track_id`.
    fn format(&mut self, track_id: u32, format: &Format);

    /// Appends bytes to the current access unit of `track_id`.
    fn sample_data(&mut self, track_id: u32, data: &[u8]);

    /// Finalizes the current access unit of `track_id`.
    fn sample_metadata(&mut self, track_id: u32, metadata: SampleMetadata);
}
