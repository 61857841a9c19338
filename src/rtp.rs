// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-packet hand-off from the transport layer.

/// A borrowed view of one RTP packet's payload and the header fields the
/// readers care about.
///
/// The transport layer constructs one of these per packet (RTP header
/// already stripped, payload padding already removed) and hands it to
/// exactly one [`crate::reader::PayloadReader::consume`] call. Readers never
/// retain the view; any bytes needed across calls are copied into
/// reader-owned scratch buffers.
#[derive(Copy, Clone)]
pub struct PacketRef<'a> {
    /// The RTP payload, excluding header, CSRCs, extensions, and padding.
    pub payload: &'a [u8],

    /// The RTP timestamp: 32-bit, wrapping, in units of the stream's
    /// negotiated clock rate.
    pub timestamp: u32,

    /// The RTP sequence number: 16-bit, wrapping, non-decreasing modulo
    /// 2^16 except for loss.
    pub sequence_number: u16,

    /// The RTP marker bit. Payload-specific meaning; most commonly "this
    /// packet completes the current access unit".
    pub mark: bool,
}

impl std::fmt::Debug for PacketRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRef")
            .field("timestamp", &self.timestamp)
            .field("sequence_number", &self.sequence_number)
            .field("mark", &self.mark)
            .field("payload", &crate::hex::LimitedHex::new(self.payload, 64))
            .finish()
    }
}
