// Copyright (C) 2025 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test helpers: a sink that records every call for assertions.

use crate::format::Format;
use crate::sink::{SampleMetadata, SampleSink};

#[derive(Debug)]
pub(crate) enum Event {
    Format {
        track_id: u32,
        format: Format,
    },
    Data {
        track_id: u32,
        data: Vec<u8>,
    },
    Metadata {
        track_id: u32,
        metadata: SampleMetadata,
    },
}

/// A [`SampleSink`] that records every call, in order.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub(crate) events: Vec<Event>,
}

impl SampleSink for RecordingSink {
    fn format(&mut self, track_id: u32, format: &Format) {
        self.events.push(Event::Format {
            track_id,
            format: format.clone(),
        });
    }

    fn sample_data(&mut self, track_id: u32, data: &[u8]) {
        self.events.push(Event::Data {
            track_id,
            data: data.to_vec(),
        });
    }

    fn sample_metadata(&mut self, track_id: u32, metadata: SampleMetadata) {
        self.events.push(Event::Metadata { track_id, metadata });
    }
}

impl RecordingSink {
    /// The access units finalized so far on `track_id`: each is the
    /// concatenation of its `sample_data` bytes paired with the finalizing
    /// metadata.
    pub(crate) fn samples(&self, track_id: u32) -> Vec<(Vec<u8>, SampleMetadata)> {
        let mut out = Vec::new();
        let mut pending = Vec::new();
        for e in &self.events {
            match e {
                Event::Data { track_id: t, data } if *t == track_id => {
                    pending.extend_from_slice(data)
                }
                Event::Metadata {
                    track_id: t,
                    metadata,
                } if *t == track_id => out.push((std::mem::take(&mut pending), *metadata)),
                _ => {}
            }
        }
        out
    }

    /// The most recently declared format for `track_id`.
    pub(crate) fn last_format(&self, track_id: u32) -> Option<&Format> {
        self.events.iter().rev().find_map(|e| match e {
            Event::Format {
                track_id: t,
                format,
            } if *t == track_id => Some(format),
            _ => None,
        })
    }

    /// How many times a format has been declared for `track_id`.
    pub(crate) fn format_count(&self, track_id: u32) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Format { track_id: t, .. } if *t == track_id))
            .count()
    }

    /// How many `sample_data` calls have been made for `track_id`.
    pub(crate) fn data_writes(&self, track_id: u32) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Data { track_id: t, .. } if *t == track_id))
            .count()
    }
}
