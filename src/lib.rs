// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP depacketization into codec-specific access units.
//!
//! This library sits between a transport layer (which receives RTP datagrams,
//! strips their headers, and delivers payloads in sequence-number order) and a
//! decoder pipeline (which accepts track declarations and sample writes). For
//! each negotiated track, a [`reader::PayloadReader`] reassembles the payload
//! stream into timestamped access units: one video frame or one audio frame
//! per [`sink::SampleSink::sample_metadata`] call.
//!
//! The session/control plane is expected to:
//!
//! 1.  build a [`format::PayloadFormat`] from the SDP media description and
//!     construct a reader via [`reader::PayloadReader::new`],
//! 2.  call `create_tracks` once to declare the output track,
//! 3.  call `on_first_packet` with the first packet's RTP timestamp,
//! 4.  feed every packet's payload through `consume`, and
//! 5.  call `seek` after each server-acknowledged seek to rebase time.
//!
//! Packet loss is tolerated: sequence-number gaps are logged and reassembly
//! continues, at worst corrupting the access unit the loss landed in.
//! Structurally invalid payloads fail with a typed [`error::PacketError`]
//! which the caller may treat as fatal for the track.

#![forbid(clippy::print_stderr, clippy::print_stdout)]

pub mod error;
pub mod format;
pub mod reader;
pub mod rtp;
pub mod sink;
pub mod timestamp;

mod hex;

#[cfg(test)]
mod testutil;

pub use error::{FormatError, PacketError};
pub use format::{AudioFormat, Format, MediaKind, PayloadFormat, VideoFormat};
pub use reader::PayloadReader;
pub use rtp::PacketRef;
pub use sink::{SampleMetadata, SampleSink};
