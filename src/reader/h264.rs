// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [H.264](https://www.itu.int/rec/T-REC-H.264-201906-I/en)-encoded video,
//! with RTP encoding as in [RFC 6184](https://tools.ietf.org/html/rfc6184).

use base64::Engine as _;
use bytes::Bytes;
use h264_reader::nal::{NalHeader, UnitType};

use crate::error::{FormatError, PacketError};
use crate::format::{Format, PayloadFormat, VideoFormat};
use crate::rtp::PacketRef;
use crate::sink::SampleSink;
use crate::timestamp::TimeBase;

use super::{continuity, fixed_clock_rate, Assembly, Continuity};

const CODEC: &str = "h264";

/// The Annex B start code prepended to every emitted NAL unit.
const NAL_START_CODE: [u8; 4] = [0, 0, 0, 1];

const NAL_UNIT_TYPE_IDR: u8 = 5;

/// Finds access unit boundaries and emits Annex B NAL units as specified in
/// [RFC 6184](https://tools.ietf.org/html/rfc6184).
///
/// Packetization modes 0 (single NAL unit) and 1 (STAP-A, FU-A) are
/// supported; the interleaved mode 2 packet types fail fast. NAL contents are
/// not inspected beyond the header byte, so compliance with H.264 section
/// 7.4.1.2.3 "Order of NAL units ... and association to access units" is
/// neither required nor verified.
#[derive(Debug)]
pub(crate) struct Reader {
    format: Format,
    track_id: Option<u32>,
    time: TimeBase,
    previous_sequence_number: Option<u16>,
    assembly: Assembly,

    /// The synthesized header of the in-progress FU-A NAL, if any.
    fu_nal_header: Option<u8>,
}

impl Reader {
    pub(super) fn new(format: &PayloadFormat) -> Result<Self, FormatError> {
        let clock_rate = fixed_clock_rate(format, 90_000)?;
        let mut video = VideoFormat::new(CODEC, 90_000);
        if let Some(sprop) = format.parameter("sprop-parameter-sets") {
            match parse_sprop_parameter_sets(sprop) {
                Ok(extra_data) => video = video.with_extra_data(extra_data),
                Err(e) => {
                    log::warn!("[{CODEC}] ignoring bad sprop-parameter-sets {sprop:?}: {e}")
                }
            }
        }
        Ok(Self {
            format: Format::Video(video),
            track_id: None,
            time: TimeBase::new(clock_rate),
            previous_sequence_number: None,
            assembly: Assembly::default(),
            fu_nal_header: None,
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
        self.fu_nal_header = None;
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
        if payload.is_empty() {
            return Err(malformed(seq, "empty payload".to_owned()));
        }
        let nal_header = payload[0];
        if (nal_header & 0x80) != 0 {
            return Err(malformed(
                seq,
                format!("NAL header {nal_header:02x} has forbidden zero bit set"),
            ));
        }

        // A fresh timestamp while a unit is still accumulating means the
        // previous unit's marked packet was lost; flush it so its metadata
        // isn't silently dropped.
        if let Some(ts) = self.assembly.rtp_timestamp() {
            if ts != pkt.timestamp {
                log::warn!(
                    "[{CODEC}] access unit with timestamp {ts} never marked complete; \
                     flushing at seq={seq:04x}"
                );
                self.fu_nal_header = None;
                if let Some(meta) = self.assembly.take() {
                    sink.sample_metadata(track_id, meta);
                }
            }
        }
        let time_us = self.time.sample_time_us(pkt.timestamp);

        match nal_header & 0x1f {
            1..=23 => {
                // Single NAL unit packet, RFC 6184 section 5.6.
                if self.fu_nal_header.take().is_some() {
                    log::warn!(
                        "[{CODEC}] fragmented NAL abandoned by single NAL unit packet \
                         at seq={seq:04x}"
                    );
                }
                self.begin_unit_if_idle(pkt.timestamp, time_us);
                sink.sample_data(track_id, &NAL_START_CODE);
                sink.sample_data(track_id, payload);
                self.assembly.extend(NAL_START_CODE.len() + payload.len());
                if (nal_header & 0x1f) == NAL_UNIT_TYPE_IDR {
                    self.assembly.note_key_frame();
                }
            }
            24 => {
                // STAP-A, RFC 6184 section 5.7.1: 16-bit length, NALU, repeat.
                self.begin_unit_if_idle(pkt.timestamp, time_us);
                let mut data = &payload[1..];
                while !data.is_empty() {
                    if data.len() < 2 {
                        return Err(malformed(
                            seq,
                            format!("STAP-A has {} bytes left, expecting 2-byte length", data.len()),
                        ));
                    }
                    let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
                    data = &data[2..];
                    if len == 0 {
                        return Err(malformed(seq, "zero-length NALU in STAP-A".to_owned()));
                    }
                    if data.len() < len {
                        return Err(malformed(
                            seq,
                            format!(
                                "STAP-A declares {len}-byte NALU but only {} bytes remain",
                                data.len()
                            ),
                        ));
                    }
                    let nalu = &data[..len];
                    sink.sample_data(track_id, &NAL_START_CODE);
                    sink.sample_data(track_id, nalu);
                    self.assembly.extend(NAL_START_CODE.len() + len);
                    if (nalu[0] & 0x1f) == NAL_UNIT_TYPE_IDR {
                        self.assembly.note_key_frame();
                    }
                    data = &data[len..];
                }
            }
            28 => {
                // A dropped continuation must not advance the expected
                // sequence number or finalize the unit.
                if !self.consume_fu_a(sink, track_id, pkt, time_us)? {
                    return Ok(());
                }
            }
            t @ (25..=27 | 29) => {
                return Err(PacketError::Unsupported {
                    codec: CODEC,
                    sequence_number: seq,
                    description: format!("packetization type {t} (STAP-B/MTAP/FU-B)"),
                })
            }
            t => return Err(malformed(seq, format!("reserved NAL unit type {t}"))),
        }

        self.previous_sequence_number = Some(seq);
        if pkt.mark {
            self.fu_nal_header = None;
            if let Some(meta) = self.assembly.take() {
                sink.sample_metadata(track_id, meta);
            }
        }
        Ok(())
    }

    /// FU-A, RFC 6184 section 5.8. Returns false when the packet was
    /// dropped rather than applied.
    fn consume_fu_a(
        &mut self,
        sink: &mut dyn SampleSink,
        track_id: u32,
        pkt: PacketRef<'_>,
        time_us: i64,
    ) -> Result<bool, PacketError> {
        let payload = pkt.payload;
        let seq = pkt.sequence_number;
        if payload.len() < 2 {
            return Err(malformed(seq, "FU-A too short for FU header".to_owned()));
        }
        let fu_header = payload[1];
        let start = (fu_header & 0x80) != 0;
        let end = (fu_header & 0x40) != 0;
        if (start && end) || (fu_header & 0x20) != 0 {
            return Err(malformed(seq, format!("invalid FU header {fu_header:08b}")));
        }
        let nal_header = (payload[0] & 0xe0) | (fu_header & 0x1f);
        let frag = &payload[2..];
        if start {
            if self.fu_nal_header.is_some() {
                log::warn!(
                    "[{CODEC}] FU-A start at seq={seq:04x} while fragment in progress; \
                     abandoning previous NAL"
                );
            }
            self.begin_unit_if_idle(pkt.timestamp, time_us);
            self.fu_nal_header = Some(nal_header);
            sink.sample_data(track_id, &NAL_START_CODE);
            sink.sample_data(track_id, &[nal_header]);
            sink.sample_data(track_id, frag);
            self.assembly.extend(NAL_START_CODE.len() + 1 + frag.len());
            if (nal_header & 0x1f) == NAL_UNIT_TYPE_IDR {
                self.assembly.note_key_frame();
            }
        } else {
            match continuity(self.previous_sequence_number, seq) {
                Continuity::Behind => {
                    log::warn!(
                        "[{CODEC}] dropping stale or reordered FU-A continuation seq={seq:04x}"
                    );
                    return Ok(false);
                }
                Continuity::Ahead => log::warn!(
                    "[{CODEC}] gap before FU-A continuation seq={seq:04x}; \
                     current access unit will be damaged"
                ),
                Continuity::Consecutive => {}
            }
            let Some(expected) = self.fu_nal_header else {
                log::warn!(
                    "[{CODEC}] dropping FU-A continuation seq={seq:04x} with no fragment \
                     in progress"
                );
                return Ok(false);
            };
            if expected != nal_header {
                log::warn!(
                    "[{CODEC}] FU-A NAL header changed {expected:02x} -> {nal_header:02x} \
                     mid-fragment at seq={seq:04x}"
                );
            }
            if pkt.mark && !end {
                return Err(malformed(seq, "FU-A with marker but no end bit".to_owned()));
            }
            sink.sample_data(track_id, frag);
            self.assembly.extend(frag.len());
            if end {
                self.fu_nal_header = None;
            }
        }
        Ok(true)
    }

    fn begin_unit_if_idle(&mut self, rtp_timestamp: u32, time_us: i64) {
        if !self.assembly.is_accumulating() {
            self.assembly.begin(rtp_timestamp, time_us, false);
        }
    }
}

fn malformed(sequence_number: u16, description: String) -> PacketError {
    PacketError::Malformed {
        codec: CODEC,
        sequence_number,
        description,
    }
}

/// Parses the `sprop-parameter-sets` fmtp attribute into Annex B extra data
/// (SPS and PPS NAL units, each with a start code).
fn parse_sprop_parameter_sets(sprop: &str) -> Result<Bytes, String> {
    let mut out = Vec::new();
    for nal in sprop.split(',') {
        let nal = base64::engine::general_purpose::STANDARD
            .decode(nal)
            .map_err(|_| "invalid base64".to_owned())?;
        if nal.is_empty() {
            return Err("empty NAL".to_owned());
        }
        let header =
            NalHeader::new(nal[0]).map_err(|_| format!("bad NAL header {:02x}", nal[0]))?;
        match header.nal_unit_type() {
            UnitType::SeqParameterSet | UnitType::PicParameterSet => {}
            t => return Err(format!("unexpected {t:?} in parameter sets")),
        }
        // Some cameras leave an Annex B start code dangling on each set; strip
        // it rather than emitting a doubled one.
        let nal = nal.strip_suffix(b"\x00\x00\x00\x01").unwrap_or(&nal[..]);
        out.extend_from_slice(&NAL_START_CODE);
        out.extend_from_slice(nal);
    }
    Ok(out.into())
}
