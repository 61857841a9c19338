// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]
use libfuzzer_sys::fuzz_target;
use rtp_depay::{Format, MediaKind, PacketRef, PayloadFormat, PayloadReader, SampleMetadata,
                SampleSink};

struct NullSink;

impl SampleSink for NullSink {
    fn format(&mut self, _track_id: u32, _format: &Format) {}
    fn sample_data(&mut self, _track_id: u32, _data: &[u8]) {}
    fn sample_metadata(&mut self, _track_id: u32, _metadata: SampleMetadata) {}
}

fuzz_target!(|data: &[u8]| {
    let mut data = data;
    let format = PayloadFormat::new(MediaKind::Video, "h265", 90_000);
    let mut reader = PayloadReader::new(&format).unwrap().unwrap();
    let mut sink = NullSink;
    reader.create_tracks(&mut sink, 0);
    let mut timestamp = 0u32;
    let mut sequence_number = 0u16;
    loop {
        let Some((hdr, rest)) = data.split_first() else {
            return;
        };
        let ts_change = (hdr & 0b001) != 0;
        let mark = (hdr & 0b010) != 0;
        let loss = (hdr & 0b100) != 0;
        let len = usize::from(hdr >> 3);
        if rest.len() < len {
            return;
        }
        let (payload, rest) = rest.split_at(len);
        data = rest;
        if loss {
            sequence_number = sequence_number.wrapping_add(1);
        }
        if ts_change {
            timestamp = timestamp.wrapping_add(3_000);
        }
        if reader
            .consume(
                &mut sink,
                PacketRef {
                    payload,
                    timestamp,
                    sequence_number,
                    mark,
                },
            )
            .is_err()
        {
            return;
        }
        sequence_number = sequence_number.wrapping_add(1);
    }
});
