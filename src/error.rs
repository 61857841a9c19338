// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.
//!
//! Two classes of failure are represented here; a third class, sequencing
//! anomalies (gaps, duplicates, reorders), is deliberately *not* an error.
//! Those are logged via [`log::warn!`] and reassembly continues, possibly
//! truncating one access unit.

use thiserror::Error;

/// A construction-time failure: the negotiated parameters for a track are
/// unusable.
///
/// These indicate a negotiation bug or an incompatible peer, discovered
/// before any packet flows. They are not recoverable by retrying.
#[derive(Debug, Error)]
pub enum FormatError {
    /// A required `fmtp` parameter was absent.
    #[error("missing format parameter {0:?}")]
    MissingParameter(&'static str),

    /// An `fmtp` parameter was present but unusable.
    #[error("bad format parameter {name:?}: {description}")]
    BadParameter {
        name: &'static str,
        description: String,
    },

    /// The negotiated RTP clock rate is impossible for this codec.
    #[error("bad clock rate {clock_rate}: {description}")]
    BadClockRate {
        clock_rate: u32,
        description: &'static str,
    },
}

/// A failure while consuming one RTP packet payload.
///
/// The stream's framing was structurally invalid in a way reassembly can't
/// route around. The caller decides whether to drop the track or the whole
/// session; the reader does not retry internally.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The payload violates the codec's RTP framing.
    #[error("[{codec} seq={sequence_number:04x}] malformed payload: {description}")]
    Malformed {
        codec: &'static str,
        sequence_number: u16,
        description: String,
    },

    /// The payload uses a framing feature this library deliberately rejects
    /// rather than half-parse (e.g. H.265 aggregation packets, AMR compound
    /// payloads).
    #[error("[{codec} seq={sequence_number:04x}] unsupported: {description}")]
    Unsupported {
        codec: &'static str,
        sequence_number: u16,
        description: String,
    },

    /// The caller violated the reader lifecycle, e.g. `consume` before
    /// `create_tracks`.
    #[error("contract violation: {0}")]
    ContractViolation(&'static str),
}
