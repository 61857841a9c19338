// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AAC (Advanced Audio Coding) elementary streams, with RTP encoding as in
//! [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640).
//!
//! Each packet carries a 16-bit AU-headers-length field followed by one
//! fixed-width AU header per access unit; the header's size field delimits
//! that unit's bytes within the packet. Access units never span packets.

use bitstream_io::BitRead;
use bytes::Bytes;

use crate::error::{FormatError, PacketError};
use crate::format::{AudioFormat, Format, PayloadFormat};
use crate::rtp::PacketRef;
use crate::sink::{SampleMetadata, SampleSink};
use crate::timestamp::TimeBase;

use super::{clock_rate, warn_on_gap};

const CODEC: &str = "aac";

#[derive(Debug)]
pub(crate) struct Reader {
    format: Format,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,

    /// Width in bits of the AU-size and AU-index fields, from the negotiated
    /// `mode` (AAC-hbr: 13+3, AAC-lbr: 6+2).
    size_length: u32,
    index_length: u32,

    /// Samples per access unit, used to space the timestamps of multiple
    /// units sharing one packet. The RTP timestamp covers the first unit
    /// only.
    frame_length: u32,

    /// Scratch for the parsed AU sizes, reused across packets.
    au_sizes: Vec<usize>,
}

impl Reader {
    pub(super) fn new(format: &PayloadFormat) -> Result<Self, FormatError> {
        let clock_rate = clock_rate(format)?;
        let mode = format
            .parameter("mode")
            .ok_or(FormatError::MissingParameter("mode"))?;
        let (size_length, index_length) = match &mode.to_ascii_lowercase()[..] {
            "aac-hbr" => (13, 3),
            "aac-lbr" => (6, 2),
            _ => {
                return Err(FormatError::BadParameter {
                    name: "mode",
                    description: format!("expected AAC-hbr or AAC-lbr, got {mode:?}"),
                })
            }
        };

        let mut frame_length = 1024;
        let mut extra_data = Bytes::new();
        if let Some(config) = format.parameter("config") {
            match hex::decode(config)
                .map_err(|_| "invalid hex encoding".to_owned())
                .and_then(|raw| parse_audio_specific_config(&raw).map(|c| (raw, c)))
            {
                Ok((raw, c)) => {
                    if c.sampling_frequency != clock_rate.get() {
                        log::warn!(
                            "[{CODEC}] RTP clock rate {clock_rate} != AAC sampling frequency {}",
                            c.sampling_frequency
                        );
                    }
                    frame_length = u32::from(c.frame_length);
                    extra_data = raw.into();
                }
                Err(e) => log::warn!("[{CODEC}] ignoring bad config {config:?}: {e}"),
            }
        }

        Ok(Self {
            format: Format::Audio(
                AudioFormat::new("mpeg4-generic", clock_rate.get())
                    .with_channels(format.channels())
                    .with_extra_data(extra_data),
            ),
            track_id: None,
            time: TimeBase::new(clock_rate),
            previous_sequence_number: None,
            size_length,
            index_length,
            frame_length,
            au_sizes: Vec::new(),
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

        if payload.len() < 2 {
            return Err(malformed("too short for AU-headers-length".to_owned()));
        }
        let au_headers_length_bits = u32::from(u16::from_be_bytes([payload[0], payload[1]]));
        let header_bits = self.size_length + self.index_length;
        if au_headers_length_bits == 0 || au_headers_length_bits % header_bits != 0 {
            return Err(malformed(format!(
                "bad AU-headers-length {au_headers_length_bits} for {header_bits}-bit headers"
            )));
        }
        let au_count = au_headers_length_bits / header_bits;
        let data_off = 2 + (au_headers_length_bits as usize + 7) / 8;
        if payload.len() < data_off {
            return Err(malformed("too short for AU headers".to_owned()));
        }

        self.au_sizes.clear();
        let mut r = bitstream_io::BitReader::endian(&payload[2..], bitstream_io::BigEndian);
        for i in 0..au_count {
            let size: u32 = r
                .read(self.size_length)
                .map_err(|_| malformed("AU header read failed".to_owned()))?;
            let index: u32 = r
                .read(self.index_length)
                .map_err(|_| malformed("AU header read failed".to_owned()))?;
            if index != 0 {
                // A nonzero first index or index-delta means interleaved
                // de-packetization, which isn't supported.
                return Err(PacketError::Unsupported {
                    codec: CODEC,
                    sequence_number: seq,
                    description: format!("interleaving (AU {i} has index {index})"),
                });
            }
            self.au_sizes.push(size as usize);
        }

        let mut data = &payload[data_off..];
        for (i, &size) in self.au_sizes.iter().enumerate() {
            if data.len() < size {
                return Err(malformed(format!(
                    "AU {i} declares {size} bytes but only {} remain",
                    data.len()
                )));
            }
            sink.sample_data(track_id, &data[..size]);
            // The packet timestamp covers AU 0; later units in the same
            // packet are one frame length apart.
            let rtp_timestamp = pkt
                .timestamp
                .wrapping_add((i as u32).wrapping_mul(self.frame_length));
            sink.sample_metadata(
                track_id,
                SampleMetadata {
                    time_us: self.time.sample_time_us(rtp_timestamp),
                    is_key_frame: true,
                    size,
                    offset: 0,
                },
            );
            data = &data[size..];
        }
        if !data.is_empty() {
            return Err(malformed(format!(
                "{} trailing bytes after final AU",
                data.len()
            )));
        }
        Ok(())
    }
}

struct AudioSpecificConfig {
    sampling_frequency: u32,
    frame_length: u16,
}

/// Parses an AudioSpecificConfig (ISO/IEC 14496-3 section 1.6.2.1) far
/// enough to learn the sampling frequency and frame length.
fn parse_audio_specific_config(raw: &[u8]) -> Result<AudioSpecificConfig, String> {
    let mut r = bitstream_io::BitReader::endian(raw, bitstream_io::BigEndian);
    let audio_object_type = match r
        .read::<u8>(5)
        .map_err(|e| format!("unable to read audio_object_type: {e}"))?
    {
        31 => {
            32 + r
                .read::<u8>(6)
                .map_err(|e| format!("unable to read audio_object_type ext: {e}"))?
        }
        o => o,
    };

    // ISO/IEC 14496-3 section 1.6.3.3.
    let sampling_frequency = match r
        .read::<u8>(4)
        .map_err(|e| format!("unable to read sampling_frequency: {e}"))?
    {
        0x0 => 96_000,
        0x1 => 88_200,
        0x2 => 64_000,
        0x3 => 48_000,
        0x4 => 44_100,
        0x5 => 32_000,
        0x6 => 24_000,
        0x7 => 22_050,
        0x8 => 16_000,
        0x9 => 12_000,
        0xa => 11_025,
        0xb => 8_000,
        0xc => 7_350,
        v @ 0xd | v @ 0xe => return Err(format!("reserved sampling_frequency_index 0x{v:x}")),
        0xf => r
            .read::<u32>(24)
            .map_err(|e| format!("unable to read sampling_frequency ext: {e}"))?,
        0x10..=0xff => unreachable!(),
    };
    r.skip(4)
        .map_err(|e| format!("unable to read channel configuration: {e}"))?;
    if audio_object_type == 5 || audio_object_type == 29 {
        // extensionSamplingFrequencyIndex + extensionSamplingFrequency.
        if r.read::<u8>(4)
            .map_err(|e| format!("unable to read extensionSamplingFrequencyIndex: {e}"))?
            == 0xf
        {
            r.skip(24)
                .map_err(|e| format!("unable to read extensionSamplingFrequency: {e}"))?;
        }
        // audioObjectType (a different one) + extensionChannelConfiguration.
        if r.read::<u8>(5)
            .map_err(|e| format!("unable to read second audioObjectType: {e}"))?
            == 22
        {
            r.skip(4)
                .map_err(|e| format!("unable to read extensionChannelConfiguration: {e}"))?;
        }
    }

    // The supported object types are the ones using GASpecificConfig.
    match audio_object_type {
        1 | 2 | 3 | 4 | 6 | 7 | 17 | 19 | 20 | 21 | 22 | 23 => {}
        o => return Err(format!("unsupported audio_object_type {o}")),
    }

    // GASpecificConfig, ISO/IEC 14496-3 section 4.4.1.
    let frame_length_flag = r
        .read_bit()
        .map_err(|e| format!("unable to read frame_length_flag: {e}"))?;
    let frame_length = match (audio_object_type, frame_length_flag) {
        (3 /* AAC SSR */, false) => 256,
        (3 /* AAC SSR */, true) => return Err("frame_length_flag must be false for AAC SSR".into()),
        (23 /* ER AAC LD */, false) => 512,
        (23 /* ER AAC LD */, true) => 480,
        (_, false) => 1024,
        (_, true) => 960,
    };

    Ok(AudioSpecificConfig {
        sampling_frequency,
        frame_length,
    })
}

#[cfg(test)]
mod tests {
    use crate::format::{Format, MediaKind, PayloadFormat};
    use crate::rtp::PacketRef;
    use crate::testutil::RecordingSink;

    fn reader() -> super::Reader {
        let format = PayloadFormat::new(MediaKind::Audio, "mpeg4-generic", 48_000).with_fmtp(
            "streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;\
             indexlength=3;indexdeltalength=3;config=1188",
        );
        super::Reader::new(&format).unwrap()
    }

    #[test]
    fn parse_config() {
        let c = super::parse_audio_specific_config(&[0x11, 0x88]).unwrap();
        assert_eq!(c.sampling_frequency, 48_000);
        assert_eq!(c.frame_length, 1024);

        let c = super::parse_audio_specific_config(&[0x14, 0x90]).unwrap();
        assert_eq!(c.sampling_frequency, 12_000);
        assert_eq!(c.frame_length, 1024);
    }

    #[test]
    fn requires_mode() {
        let format = PayloadFormat::new(MediaKind::Audio, "mpeg4-generic", 48_000);
        assert!(super::Reader::new(&format).is_err());
        let format = PayloadFormat::new(MediaKind::Audio, "mpeg4-generic", 48_000)
            .with_parameter("mode", "AAC-interleaved");
        assert!(super::Reader::new(&format).is_err());
    }

    #[test]
    fn single_au() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 3);
        match sink.last_format(3).unwrap() {
            Format::Audio(a) => assert_eq!(&a.extra_data()[..], &[0x11, 0x88]),
            _ => panic!("expected audio format"),
        }
        r.on_first_packet(0, 0);
        r.consume(
            &mut sink,
            PacketRef {
                // One 16-bit header: AU-size=4, AU-index=0.
                payload: b"\x00\x10\x00\x20asdf",
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(3);
        assert_eq!(samples.len(), 1);
        assert_eq!(&samples[0].0[..], b"asdf");
        assert!(samples[0].1.is_key_frame);
        assert_eq!(samples[0].1.size, 4);
    }

    #[test]
    fn aggregate_of_three() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x00\x30\x00\x18\x00\x18\x00\x18foobarbaz",
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 3);
        assert_eq!(&samples[0].0[..], b"foo");
        assert_eq!(&samples[1].0[..], b"bar");
        assert_eq!(&samples[2].0[..], b"baz");
        // Units are spaced one 1024-sample frame apart at 48 kHz.
        assert_eq!(samples[0].1.time_us, 0);
        assert_eq!(samples[1].1.time_us, 1024i64 * 1_000_000 / 48_000);
        assert_eq!(samples[2].1.time_us, 2048i64 * 1_000_000 / 48_000);
    }

    #[test]
    fn rejects_interleaving_and_truncation() {
        let mut r = reader();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        let base = PacketRef {
            payload: b"",
            timestamp: 0,
            sequence_number: 0,
            mark: true,
        };
        // AU-index = 1.
        assert!(r
            .consume(&mut sink, PacketRef { payload: b"\x00\x10\x00\x21asdf", ..base })
            .is_err());
        // Declared size 5, only 4 bytes present.
        assert!(r
            .consume(&mut sink, PacketRef { payload: b"\x00\x10\x00\x28asdf", ..base })
            .is_err());
        // Too short for the headers themselves.
        assert!(r
            .consume(&mut sink, PacketRef { payload: b"\x00\x30\x00", ..base })
            .is_err());
    }

    #[test]
    fn lbr_mode_field_widths() {
        let format = PayloadFormat::new(MediaKind::Audio, "mpeg4-generic", 48_000)
            .with_parameter("mode", "AAC-lbr");
        let mut r = super::Reader::new(&format).unwrap();
        let mut sink = RecordingSink::default();
        r.create_tracks(&mut sink, 0);
        r.on_first_packet(0, 0);
        // One 8-bit header: 6-bit size=5, 2-bit index=0 -> 0b000101_00.
        r.consume(
            &mut sink,
            PacketRef {
                payload: b"\x00\x08\x14hello",
                timestamp: 0,
                sequence_number: 0,
                mark: true,
            },
        )
        .unwrap();
        let samples = sink.samples(0);
        assert_eq!(samples.len(), 1);
        assert_eq!(&samples[0].0[..], b"hello");
    }
}
