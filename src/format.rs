// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Track format descriptions: the negotiated input ([`PayloadFormat`]) and
//! the declaration handed to the sink ([`Format`]).

use std::collections::BTreeMap;
use std::num::NonZeroU16;

use bytes::Bytes;
use pretty_hex::PrettyHex;

/// Whether a track carries audio or video.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// The per-track parameters negotiated out-of-band (RTSP DESCRIBE / SDP),
/// consumed by [`crate::reader::PayloadReader::new`].
#[derive(Clone, Debug)]
pub struct PayloadFormat {
    media: MediaKind,
    encoding_name: String,
    clock_rate: u32,
    channels: Option<NonZeroU16>,
    parameters: BTreeMap<String, String>,
}

impl PayloadFormat {
    pub fn new(media: MediaKind, encoding_name: &str, clock_rate: u32) -> Self {
        Self {
            media,
            encoding_name: encoding_name.to_ascii_lowercase(),
            clock_rate,
            channels: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Sets the channel count from the `rtpmap` encoding parameters.
    pub fn with_channels(mut self, channels: Option<NonZeroU16>) -> Self {
        self.channels = channels;
        self
    }

    /// Parses the value of an `a=fmtp` attribute (`key=value` pairs separated
    /// by `;`) into the codec-specific parameter map.
    ///
    /// Keys are lowercased; SDP parameter names are case-insensitive.
    /// Malformed pairs and empty segments are skipped. (Some cameras leave a
    /// trailing `;`.)
    pub fn with_fmtp(mut self, fmtp: &str) -> Self {
        for p in fmtp.split(';') {
            let p = p.trim();
            if p.is_empty() {
                continue;
            }
            if let Some((key, value)) = p.split_once('=') {
                self.parameters
                    .insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }
        self
    }

    /// Inserts a single codec-specific parameter.
    pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters
            .insert(key.to_ascii_lowercase(), value.to_owned());
        self
    }

    pub fn media(&self) -> MediaKind {
        self.media
    }

    /// The lowercase RTP encoding name from the `rtpmap` attribute, e.g.
    /// `h264` or `mpeg4-generic`.
    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    /// The RTP clock rate in Hz. RTP timestamps on this track are expressed
    /// in units of this rate.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn channels(&self) -> Option<NonZeroU16> {
        self.channels
    }

    /// Looks up a codec-specific parameter by (case-insensitive) name.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A track's static format, declared to the sink by `create_tracks` and
/// re-declared when in-band data revises it (VP9 scalability structure,
/// Opus ID header).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Video(VideoFormat),
    Audio(AudioFormat),
}

#[derive(Clone, PartialEq, Eq)]
pub struct VideoFormat {
    encoding_name: String,
    clock_rate: u32,
    pixel_dimensions: Option<(u32, u32)>,
    extra_data: Bytes,
}

impl VideoFormat {
    pub(crate) fn new(encoding_name: &str, clock_rate: u32) -> Self {
        Self {
            encoding_name: encoding_name.to_owned(),
            clock_rate,
            pixel_dimensions: None,
            extra_data: Bytes::new(),
        }
    }

    pub(crate) fn with_pixel_dimensions(mut self, width: u32, height: u32) -> Self {
        self.pixel_dimensions = Some((width, height));
        self
    }

    pub(crate) fn with_extra_data(mut self, extra_data: Bytes) -> Self {
        self.extra_data = extra_data;
        self
    }

    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// The overall dimensions of the video frame in pixels, as
    /// `(width, height)`, if known.
    pub fn pixel_dimensions(&self) -> Option<(u32, u32)> {
        self.pixel_dimensions
    }

    /// Codec-specific initialization data for the decoder.
    /// *   H.264: the SPS and PPS NAL units in Annex B form, when the
    ///     `sprop-parameter-sets` attribute was negotiated.
    pub fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }
}

impl std::fmt::Debug for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFormat")
            .field("encoding_name", &self.encoding_name)
            .field("clock_rate", &self.clock_rate)
            .field("pixel_dimensions", &self.pixel_dimensions)
            .field("extra_data", &self.extra_data.hex_dump())
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AudioFormat {
    encoding_name: String,
    clock_rate: u32,
    channels: Option<NonZeroU16>,
    extra_data: Bytes,
}

impl AudioFormat {
    pub(crate) fn new(encoding_name: &str, clock_rate: u32) -> Self {
        Self {
            encoding_name: encoding_name.to_owned(),
            clock_rate,
            channels: None,
            extra_data: Bytes::new(),
        }
    }

    pub(crate) fn with_channels(mut self, channels: Option<NonZeroU16>) -> Self {
        self.channels = channels;
        self
    }

    pub(crate) fn with_extra_data(mut self, extra_data: Bytes) -> Self {
        self.extra_data = extra_data;
        self
    }

    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn channels(&self) -> Option<NonZeroU16> {
        self.channels
    }

    /// Codec-specific initialization data for the decoder.
    /// *   AAC / MP4A-LATM: the raw config from the `fmtp` attribute.
    /// *   Opus: the in-band ID header.
    pub fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }
}

impl std::fmt::Debug for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFormat")
            .field("encoding_name", &self.encoding_name)
            .field("clock_rate", &self.clock_rate)
            .field("channels", &self.channels)
            .field("extra_data", &self.extra_data.hex_dump())
            .finish()
    }
}
