//! Chunks: contiguous spans of compressed points
//!
//! An open chunk accepts ordered appends into a TSZ compression stream.
//! Sealing a chunk freezes the stream into its final byte form; sealed
//! bytes are what the persistence layer frames and writes out.

pub mod format;
pub mod itergen;

pub use itergen::{IterGen, Point, PointIter};

use crate::{Error, Result};
use bytes::Bytes;
use tsz::stream::BufferedWriter;
use tsz::{DataPoint, Encode, StdEncoder};

/// One interval `[t0, t0 + span)` of a single metric.
///
/// The chunk itself does not know its span; the owning metric drives span
/// boundaries. It knows its aligned start, the timestamp of its newest
/// point, and the wall-clock second of its last append (which is what the
/// reaper's staleness check looks at).
pub struct Chunk {
    t0: u32,
    last_ts: u32,
    last_write: u32,
    num_points: u32,
    closed: bool,
    encoder: Option<StdEncoder<BufferedWriter>>,
    series: Bytes,
}

impl Chunk {
    /// Opens a chunk at the aligned start `t0`.
    pub fn new(t0: u32, now: u32) -> Self {
        Self {
            t0,
            last_ts: 0,
            last_write: now,
            num_points: 0,
            closed: false,
            encoder: Some(StdEncoder::new(u64::from(t0), BufferedWriter::new())),
            series: Bytes::new(),
        }
    }

    /// Appends one point. `now` is the current wall-clock second.
    ///
    /// Points must arrive in strictly increasing timestamp order and the
    /// chunk must still be open; the owning metric enforces both and treats
    /// a rejection as a dropped point.
    pub fn push(&mut self, now: u32, ts: u32, value: f64) -> Result<()> {
        if self.closed {
            return Err(Error::Codec(format!("chunk {} already sealed", self.t0)));
        }
        if self.num_points > 0 && ts <= self.last_ts {
            return Err(Error::Codec(format!(
                "point {ts} not after last point {}",
                self.last_ts
            )));
        }
        match self.encoder.as_mut() {
            Some(encoder) => encoder.encode(DataPoint::new(u64::from(ts), value)),
            None => return Err(Error::Codec(format!("chunk {} has no encoder", self.t0))),
        }
        self.last_ts = ts;
        self.last_write = now;
        self.num_points += 1;
        Ok(())
    }

    /// Seals the chunk, freezing the compressed stream. Idempotent; after
    /// the first call the series bytes never change again.
    pub fn finish(&mut self) -> Bytes {
        if let Some(encoder) = self.encoder.take() {
            self.series = Bytes::from(encoder.close().into_vec());
            self.closed = true;
        }
        self.series.clone()
    }

    pub fn t0(&self) -> u32 {
        self.t0
    }

    pub fn last_ts(&self) -> u32 {
        self.last_ts
    }

    pub fn last_write(&self) -> u32 {
        self.last_write
    }

    pub fn num_points(&self) -> u32 {
        self.num_points
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    /// Sealed series bytes; empty until [`Chunk::finish`] runs.
    pub fn series(&self) -> Bytes {
        self.series.clone()
    }
}

/// The immutable remains of a sealed chunk, as handed to the persistence
/// layer.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub t0: u32,
    pub series: Bytes,
    pub num_points: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_finish() {
        let mut chunk = Chunk::new(600, 1000);
        chunk.push(1000, 610, 1.0).unwrap();
        chunk.push(1001, 620, 2.0).unwrap();
        assert_eq!(chunk.num_points(), 2);
        assert_eq!(chunk.last_ts(), 620);
        assert_eq!(chunk.last_write(), 1001);
        assert!(!chunk.closed());

        let series = chunk.finish();
        assert!(chunk.closed());
        assert!(!series.is_empty());

        // decode what we just sealed
        let frame = format::encode_frame(600, &series);
        let gen = IterGen::new(&frame, 600).unwrap();
        let points: Vec<Point> = gen.get().map(|p| p.unwrap()).collect();
        assert_eq!(points, vec![
            Point { ts: 610, value: 1.0 },
            Point { ts: 620, value: 2.0 },
        ]);
    }

    #[test]
    fn test_rejects_out_of_order_point() {
        let mut chunk = Chunk::new(600, 1000);
        chunk.push(1000, 620, 1.0).unwrap();
        assert!(chunk.push(1000, 620, 1.5).is_err());
        assert!(chunk.push(1000, 610, 1.5).is_err());
        assert_eq!(chunk.num_points(), 1);
    }

    #[test]
    fn test_rejects_push_after_seal() {
        let mut chunk = Chunk::new(600, 1000);
        chunk.push(1000, 610, 1.0).unwrap();
        chunk.finish();
        assert!(chunk.push(1001, 620, 2.0).is_err());
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut chunk = Chunk::new(600, 1000);
        chunk.push(1000, 610, 1.0).unwrap();
        let first = chunk.finish();
        let second = chunk.finish();
        assert_eq!(first, second);
    }

    #[test]
    fn test_first_point_may_equal_t0() {
        let mut chunk = Chunk::new(600, 1000);
        chunk.push(1000, 600, 1.0).unwrap();
        assert_eq!(chunk.last_ts(), 600);
    }
}
