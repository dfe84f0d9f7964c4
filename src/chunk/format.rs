//! On-disk chunk frame layout
//!
//! A stored frame is: one format byte, then (for [`Format::TszWithSpan`])
//! one span code, then the opaque compressed point stream. Span codes are
//! indexes into [`CHUNK_SPANS`]; only spans from that table may ever be
//! written, because an unlisted span cannot be re-derived at read time.

use crate::{Error, Result};

/// Registered chunk spans in seconds, ordered ascending. The span code
/// stored in a frame is the index into this table.
///
/// Every entry divides `MONTH_SEC` (2_419_200 s) evenly; that is what keeps
/// a chunk and its predecessor inside the same month row (see the store's
/// row-key math).
pub const CHUNK_SPANS: [u32; 16] = [
    60,        // 1 minute
    120,       // 2 minutes
    300,       // 5 minutes
    600,       // 10 minutes
    900,       // 15 minutes
    1200,      // 20 minutes
    1800,      // 30 minutes
    3600,      // 1 hour
    7200,      // 2 hours
    10800,     // 3 hours
    21600,     // 6 hours
    43200,     // 12 hours
    86400,     // 1 day
    604_800,   // 1 week
    1_209_600, // 2 weeks
    2_419_200, // 4 weeks
];

/// Format byte at the head of every stored frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Format {
    /// Bare compressed stream. Written by old single-table deployments;
    /// still decoded, never produced.
    Tsz = 0,
    /// Compressed stream preceded by a span code.
    TszWithSpan = 1,
}

impl Format {
    pub fn from_byte(b: u8) -> Result<Format> {
        match b {
            0 => Ok(Format::Tsz),
            1 => Ok(Format::TszWithSpan),
            other => Err(Error::UnknownFormat(other)),
        }
    }
}

/// Looks up the span value for a stored span code.
pub fn span_for_code(code: u8) -> Result<u32> {
    CHUNK_SPANS
        .get(code as usize)
        .copied()
        .ok_or(Error::UnknownSpanCode(code))
}

/// Looks up the span code for a span value, `None` if the span is not
/// registered.
pub fn code_for_span(span: u32) -> Option<u8> {
    CHUNK_SPANS.iter().position(|s| *s == span).map(|i| i as u8)
}

/// True when `span` may be used as a chunk span at all.
pub fn span_is_registered(span: u32) -> bool {
    code_for_span(span).is_some()
}

/// Frames a sealed chunk's compressed bytes for storage.
///
/// Panics when `span` is not registered: persisting such a frame would
/// strand the chunk, since its span code could never be resolved again.
/// Configuration validation rejects unregistered spans long before a chunk
/// reaches this point.
pub fn encode_frame(span: u32, payload: &[u8]) -> Vec<u8> {
    let code = match code_for_span(span) {
        Some(code) => code,
        None => panic!("chunk span invalid: {span}"),
    };
    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.push(Format::TszWithSpan as u8);
    frame.push(code);
    frame.extend_from_slice(payload);
    frame
}
