//! Iterator generators over stored chunk frames
//!
//! A search returns [`IterGen`]s rather than decoded points: decoding is
//! deferred until the caller actually walks a generator, so over-fetched
//! chunks at the edges of a range cost only their frame bytes.

use crate::chunk::format::{span_for_code, Format};
use crate::{Error, Result};
use bytes::Bytes;
use tsz::stream::BufferedReader;
use tsz::{Decode, StdDecoder};

/// A single decompressed point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub ts: u32,
    pub value: f64,
}

/// A validated frame plus the `t0` it was stored under; a factory for point
/// iterators over the frame's compressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterGen {
    t0: u32,
    span: Option<u32>,
    payload: Bytes,
}

impl IterGen {
    /// Validates a stored frame and captures its payload.
    ///
    /// `t0` is the chunk start timestamp the frame was stored under (the
    /// row's `ts` column).
    pub fn new(frame: &[u8], t0: u32) -> Result<IterGen> {
        if frame.len() < 2 {
            return Err(Error::ChunkTooSmall(frame.len()));
        }
        match Format::from_byte(frame[0])? {
            Format::Tsz => Ok(IterGen {
                t0,
                span: None,
                payload: Bytes::copy_from_slice(&frame[1..]),
            }),
            Format::TszWithSpan => {
                let span = span_for_code(frame[1])?;
                Ok(IterGen {
                    t0,
                    span: Some(span),
                    payload: Bytes::copy_from_slice(&frame[2..]),
                })
            }
        }
    }

    pub fn t0(&self) -> u32 {
        self.t0
    }

    /// The chunk span recorded in the frame, `None` for legacy frames that
    /// predate span codes.
    pub fn span(&self) -> Option<u32> {
        self.span
    }

    /// Compressed payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Materializes a point iterator over the payload.
    pub fn get(&self) -> PointIter {
        let reader = BufferedReader::new(self.payload.to_vec().into_boxed_slice());
        PointIter {
            decoder: StdDecoder::new(reader),
            done: false,
        }
    }
}

/// Streaming decoder over one chunk's compressed points.
///
/// Yields points in timestamp order; a corrupt stream yields one `Err` and
/// then terminates.
pub struct PointIter {
    decoder: StdDecoder<BufferedReader>,
    done: bool,
}

impl Iterator for PointIter {
    type Item = Result<Point>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decoder.next() {
            Ok(dp) => Some(Ok(Point {
                ts: dp.get_time() as u32,
                value: dp.get_value(),
            })),
            Err(tsz::decode::Error::EndOfStream) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(Error::Codec(format!("{err:?}"))))
            }
        }
    }
}
