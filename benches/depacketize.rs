// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};
use rtp_depay::{
    Format, MediaKind, PacketRef, PayloadFormat, PayloadReader, SampleMetadata, SampleSink,
};

/// Counts bytes so the depacketization work can't be optimized away.
struct NullSink {
    bytes: u64,
    samples: u64,
}

impl SampleSink for NullSink {
    fn format(&mut self, _track_id: u32, _format: &Format) {}

    fn sample_data(&mut self, _track_id: u32, data: &[u8]) {
        self.bytes += data.len() as u64;
    }

    fn sample_metadata(&mut self, _track_id: u32, _metadata: SampleMetadata) {
        self.samples += 1;
    }
}

/// A synthetic H.264 stream: for each frame a STAP-A with parameter sets,
/// then an 8-packet FU-A fragmented slice.
fn h264_packets() -> Vec<(Vec<u8>, u32, u16, bool)> {
    let mut pkts = Vec::new();
    let mut seq = 0u16;
    for frame in 0..300u32 {
        let timestamp = frame * 3_000;
        let mut stap = b"\x18\x00\x0a".to_vec();
        stap.extend_from_slice(&[0x67; 10]);
        stap.extend_from_slice(b"\x00\x05");
        stap.extend_from_slice(&[0x68; 5]);
        pkts.push((stap, timestamp, seq, false));
        seq = seq.wrapping_add(1);
        for i in 0..8 {
            let fu_header = match i {
                0 => 0x85, // start, IDR
                7 => 0x45, // end
                _ => 0x05,
            };
            let mut fu = vec![0x7c, fu_header];
            fu.extend_from_slice(&[0xaa; 1_200]);
            pkts.push((fu, timestamp, seq, i == 7));
            seq = seq.wrapping_add(1);
        }
    }
    pkts
}

fn depacketize_h264(pkts: &[(Vec<u8>, u32, u16, bool)]) -> u64 {
    let format = PayloadFormat::new(MediaKind::Video, "h264", 90_000)
        .with_fmtp("packetization-mode=1;profile-level-id=42C01E");
    let mut reader = PayloadReader::new(&format).unwrap().unwrap();
    let mut sink = NullSink {
        bytes: 0,
        samples: 0,
    };
    reader.create_tracks(&mut sink, 0);
    reader.on_first_packet(pkts[0].1, pkts[0].2);
    for (payload, timestamp, sequence_number, mark) in pkts {
        reader
            .consume(
                &mut sink,
                PacketRef {
                    payload,
                    timestamp: *timestamp,
                    sequence_number: *sequence_number,
                    mark: *mark,
                },
            )
            .unwrap();
    }
    assert_eq!(sink.samples, 300);
    sink.bytes
}

fn criterion_benchmark(c: &mut Criterion) {
    let pkts = h264_packets();
    let total: u64 = pkts.iter().map(|(p, ..)| p.len() as u64).sum();
    let mut g = c.benchmark_group("depacketize");
    g.throughput(criterion::Throughput::Bytes(total))
        .bench_function("h264_fu_a", |b| b.iter(|| depacketize_h264(&pkts)));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
