//! Binary request envelopes
//!
//! Envelopes are msgpack maps with literal string field tags, so decoders
//! can skip fields they do not know and encoders can add fields without
//! breaking old readers. Collections carry explicit length headers so
//! decoders may preallocate. Every envelope exposes an upper-bound size
//! estimator used to pre-size encode buffers.

use rmp::Marker;
use std::collections::BTreeMap;

/// Envelope encoding/decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of buffer")]
    Truncated,
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("buffer write failed: {0}")]
    Write(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::Write(err.to_string())
    }
}

impl From<rmp::encode::ValueWriteError<std::io::Error>> for WireError {
    fn from(err: rmp::encode::ValueWriteError<std::io::Error>) -> Self {
        WireError::Write(format!("{err:?}"))
    }
}

impl From<rmp::decode::ValueReadError<std::io::Error>> for WireError {
    fn from(err: rmp::decode::ValueReadError<std::io::Error>) -> Self {
        WireError::Malformed(format!("{err:?}"))
    }
}

impl From<rmp::decode::NumValueReadError<std::io::Error>> for WireError {
    fn from(err: rmp::decode::NumValueReadError<std::io::Error>) -> Self {
        WireError::Malformed(format!("{err:?}"))
    }
}

impl From<rmp::decode::MarkerReadError<std::io::Error>> for WireError {
    fn from(_: rmp::decode::MarkerReadError<std::io::Error>) -> Self {
        WireError::Truncated
    }
}

// worst-case header sizes for the estimators
const MAP_HEADER_MAX: usize = 5;
const ARRAY_HEADER_MAX: usize = 5;
const STR_PREFIX_MAX: usize = 5;
const INT_MAX: usize = 9;
const BOOL_SIZE: usize = 1;

fn str_max(s: &str) -> usize {
    STR_PREFIX_MAX + s.len()
}

/// A typed message with a tagged-map wire form.
pub trait Envelope: Sized {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError>;

    /// Decodes one envelope from the front of `rd`, leaving any trailing
    /// bytes in place.
    fn decode_from(rd: &mut &[u8]) -> Result<Self, WireError>;

    /// Upper bound on the encoded size, for pre-sizing buffers.
    fn max_encoded_len(&self) -> usize;

    fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(self.max_encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    fn decode(mut data: &[u8]) -> Result<Self, WireError> {
        Self::decode_from(&mut data)
    }
}

/// Request to delete series by path, optionally propagated to peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDeleteRequest {
    pub paths: Vec<String>,
    pub propagate: bool,
}

impl Envelope for TagDeleteRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        rmp::encode::write_map_len(buf, 2)?;
        rmp::encode::write_str(buf, "Paths")?;
        rmp::encode::write_array_len(buf, self.paths.len() as u32)?;
        for path in &self.paths {
            rmp::encode::write_str(buf, path)?;
        }
        rmp::encode::write_str(buf, "Propagate")?;
        rmp::encode::write_bool(buf, self.propagate)?;
        Ok(())
    }

    fn decode_from(rd: &mut &[u8]) -> Result<Self, WireError> {
        let mut out = TagDeleteRequest::default();
        let fields = rmp::decode::read_map_len(rd)?;
        for _ in 0..fields {
            match read_string(rd)?.as_str() {
                "Paths" => {
                    let len = rmp::decode::read_array_len(rd)? as usize;
                    out.paths = Vec::with_capacity(len.min(PREALLOC_CAP));
                    for _ in 0..len {
                        out.paths.push(read_string(rd)?);
                    }
                }
                "Propagate" => out.propagate = rmp::decode::read_bool(rd)?,
                _ => skip_value(rd)?,
            }
        }
        Ok(out)
    }

    fn max_encoded_len(&self) -> usize {
        let mut size = MAP_HEADER_MAX + str_max("Paths") + ARRAY_HEADER_MAX;
        for path in &self.paths {
            size += str_max(path);
        }
        size + str_max("Propagate") + BOOL_SIZE
    }
}

/// Outcome of a tag deletion: total series removed, and the per-peer counts
/// when the request propagated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDeleteResponse {
    pub count: i64,
    pub peers: BTreeMap<String, i64>,
}

impl Envelope for TagDeleteResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        rmp::encode::write_map_len(buf, 2)?;
        rmp::encode::write_str(buf, "Count")?;
        rmp::encode::write_sint(buf, self.count)?;
        rmp::encode::write_str(buf, "Peers")?;
        rmp::encode::write_map_len(buf, self.peers.len() as u32)?;
        for (peer, count) in &self.peers {
            rmp::encode::write_str(buf, peer)?;
            rmp::encode::write_sint(buf, *count)?;
        }
        Ok(())
    }

    fn decode_from(rd: &mut &[u8]) -> Result<Self, WireError> {
        let mut out = TagDeleteResponse::default();
        let fields = rmp::decode::read_map_len(rd)?;
        for _ in 0..fields {
            match read_string(rd)?.as_str() {
                "Count" => out.count = rmp::decode::read_int(rd)?,
                "Peers" => {
                    let len = rmp::decode::read_map_len(rd)?;
                    out.peers = BTreeMap::new();
                    for _ in 0..len {
                        let peer = read_string(rd)?;
                        let count = rmp::decode::read_int(rd)?;
                        out.peers.insert(peer, count);
                    }
                }
                _ => skip_value(rd)?,
            }
        }
        Ok(out)
    }

    fn max_encoded_len(&self) -> usize {
        let mut size = MAP_HEADER_MAX + str_max("Count") + INT_MAX + str_max("Peers") + MAP_HEADER_MAX;
        for peer in self.peers.keys() {
            size += str_max(peer) + INT_MAX;
        }
        size
    }
}

/// One serialized series description: its path, whether it is a leaf, and
/// the `[start, end]` intervals it covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesMetadataEntry {
    pub path: String,
    pub is_leaf: bool,
    pub intervals: Vec<(i64, i64)>,
}

impl Envelope for SeriesMetadataEntry {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        rmp::encode::write_map_len(buf, 3)?;
        rmp::encode::write_str(buf, "path")?;
        rmp::encode::write_str(buf, &self.path)?;
        rmp::encode::write_str(buf, "isLeaf")?;
        rmp::encode::write_bool(buf, self.is_leaf)?;
        rmp::encode::write_str(buf, "intervals")?;
        rmp::encode::write_array_len(buf, self.intervals.len() as u32)?;
        for (start, end) in &self.intervals {
            rmp::encode::write_array_len(buf, 2)?;
            rmp::encode::write_sint(buf, *start)?;
            rmp::encode::write_sint(buf, *end)?;
        }
        Ok(())
    }

    fn decode_from(rd: &mut &[u8]) -> Result<Self, WireError> {
        let mut out = SeriesMetadataEntry::default();
        let fields = rmp::decode::read_map_len(rd)?;
        for _ in 0..fields {
            match read_string(rd)?.as_str() {
                "path" => out.path = read_string(rd)?,
                "isLeaf" => out.is_leaf = rmp::decode::read_bool(rd)?,
                "intervals" => {
                    let len = rmp::decode::read_array_len(rd)? as usize;
                    out.intervals = Vec::with_capacity(len.min(PREALLOC_CAP));
                    for _ in 0..len {
                        let pair_len = rmp::decode::read_array_len(rd)?;
                        if pair_len != 2 {
                            return Err(WireError::Malformed(format!(
                                "interval of length {pair_len}, expected 2"
                            )));
                        }
                        let start = rmp::decode::read_int(rd)?;
                        let end = rmp::decode::read_int(rd)?;
                        out.intervals.push((start, end));
                    }
                }
                _ => skip_value(rd)?,
            }
        }
        Ok(out)
    }

    fn max_encoded_len(&self) -> usize {
        MAP_HEADER_MAX
            + str_max("path")
            + str_max(&self.path)
            + str_max("isLeaf")
            + BOOL_SIZE
            + str_max("intervals")
            + ARRAY_HEADER_MAX
            + self.intervals.len() * (ARRAY_HEADER_MAX + 2 * INT_MAX)
    }
}

/// Ordered collection of series descriptions, wire-compatible with the
/// pickle-shaped find responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesMetadata(pub Vec<SeriesMetadataEntry>);

impl Envelope for SeriesMetadata {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        rmp::encode::write_array_len(buf, self.0.len() as u32)?;
        for entry in &self.0 {
            entry.encode_into(buf)?;
        }
        Ok(())
    }

    fn decode_from(rd: &mut &[u8]) -> Result<Self, WireError> {
        let len = rmp::decode::read_array_len(rd)? as usize;
        let mut entries = Vec::with_capacity(len.min(PREALLOC_CAP));
        for _ in 0..len {
            entries.push(SeriesMetadataEntry::decode_from(rd)?);
        }
        Ok(SeriesMetadata(entries))
    }

    fn max_encoded_len(&self) -> usize {
        ARRAY_HEADER_MAX
            + self
                .0
                .iter()
                .map(SeriesMetadataEntry::max_encoded_len)
                .sum::<usize>()
    }
}

// Length headers are attacker-controlled; cap preallocation and let pushes
// grow past it when the data is really there.
const PREALLOC_CAP: usize = 4096;

fn take<'a>(rd: &mut &'a [u8], n: usize) -> Result<&'a [u8], WireError> {
    if rd.len() < n {
        return Err(WireError::Truncated);
    }
    let (head, tail) = rd.split_at(n);
    *rd = tail;
    Ok(head)
}

fn read_string(rd: &mut &[u8]) -> Result<String, WireError> {
    let len = rmp::decode::read_str_len(rd)? as usize;
    let raw = take(rd, len)?;
    match std::str::from_utf8(raw) {
        Ok(s) => Ok(s.to_owned()),
        Err(_) => Err(WireError::Malformed("invalid utf-8 in string".to_owned())),
    }
}

fn read_len_u8(rd: &mut &[u8]) -> Result<usize, WireError> {
    Ok(take(rd, 1)?[0] as usize)
}

fn read_len_u16(rd: &mut &[u8]) -> Result<usize, WireError> {
    let raw = take(rd, 2)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]) as usize)
}

fn read_len_u32(rd: &mut &[u8]) -> Result<usize, WireError> {
    let raw = take(rd, 4)?;
    Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
}

/// Skips one complete msgpack value, whatever its type. This is what makes
/// unknown-field tolerance work.
fn skip_value(rd: &mut &[u8]) -> Result<(), WireError> {
    let marker = rmp::decode::read_marker(rd)?;
    match marker {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {}
        Marker::U8 | Marker::I8 => {
            take(rd, 1)?;
        }
        Marker::U16 | Marker::I16 => {
            take(rd, 2)?;
        }
        Marker::U32 | Marker::I32 | Marker::F32 => {
            take(rd, 4)?;
        }
        Marker::U64 | Marker::I64 | Marker::F64 => {
            take(rd, 8)?;
        }
        Marker::FixStr(len) => {
            take(rd, len as usize)?;
        }
        Marker::Str8 | Marker::Bin8 => {
            let len = read_len_u8(rd)?;
            take(rd, len)?;
        }
        Marker::Str16 | Marker::Bin16 => {
            let len = read_len_u16(rd)?;
            take(rd, len)?;
        }
        Marker::Str32 | Marker::Bin32 => {
            let len = read_len_u32(rd)?;
            take(rd, len)?;
        }
        Marker::FixArray(len) => skip_values(rd, len as usize)?,
        Marker::Array16 => {
            let len = read_len_u16(rd)?;
            skip_values(rd, len)?;
        }
        Marker::Array32 => {
            let len = read_len_u32(rd)?;
            skip_values(rd, len)?;
        }
        Marker::FixMap(len) => skip_values(rd, len as usize * 2)?,
        Marker::Map16 => {
            let len = read_len_u16(rd)?;
            skip_values(rd, len * 2)?;
        }
        Marker::Map32 => {
            let len = read_len_u32(rd)?;
            skip_values(rd, len * 2)?;
        }
        Marker::FixExt1 => {
            take(rd, 2)?;
        }
        Marker::FixExt2 => {
            take(rd, 3)?;
        }
        Marker::FixExt4 => {
            take(rd, 5)?;
        }
        Marker::FixExt8 => {
            take(rd, 9)?;
        }
        Marker::FixExt16 => {
            take(rd, 17)?;
        }
        Marker::Ext8 => {
            let len = read_len_u8(rd)?;
            take(rd, len + 1)?;
        }
        Marker::Ext16 => {
            let len = read_len_u16(rd)?;
            take(rd, len + 1)?;
        }
        Marker::Ext32 => {
            let len = read_len_u32(rd)?;
            take(rd, len + 1)?;
        }
        Marker::Reserved => {
            return Err(WireError::Malformed("reserved marker".to_owned()));
        }
    }
    Ok(())
}

fn skip_values(rd: &mut &[u8], count: usize) -> Result<(), WireError> {
    for _ in 0..count {
        skip_value(rd)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Envelope + PartialEq + std::fmt::Debug>(value: &T) {
        let encoded = value.encode().unwrap();
        assert!(
            encoded.len() <= value.max_encoded_len(),
            "estimator must be an upper bound: {} > {}",
            encoded.len(),
            value.max_encoded_len()
        );
        let decoded = T::decode(&encoded).unwrap();
        assert_eq!(&decoded, value);
    }

    #[test]
    fn test_tag_delete_request_round_trip() {
        round_trip(&TagDeleteRequest {
            paths: vec!["some.series.*".to_owned(), "other.series.a".to_owned()],
            propagate: true,
        });
        round_trip(&TagDeleteRequest::default());
    }

    #[test]
    fn test_tag_delete_response_round_trip() {
        let mut peers = BTreeMap::new();
        peers.insert("node-a".to_owned(), 12);
        peers.insert("node-b".to_owned(), -3);
        round_trip(&TagDeleteResponse { count: 9, peers });
        round_trip(&TagDeleteResponse::default());
    }

    #[test]
    fn test_series_metadata_entry_round_trip() {
        round_trip(&SeriesMetadataEntry {
            path: "collectd.host1.cpu.0.idle".to_owned(),
            is_leaf: true,
            intervals: vec![(0, 3600), (7200, i64::MAX)],
        });
        round_trip(&SeriesMetadataEntry::default());
    }

    #[test]
    fn test_series_metadata_collection_round_trip() {
        round_trip(&SeriesMetadata(vec![
            SeriesMetadataEntry {
                path: "a.b".to_owned(),
                is_leaf: false,
                intervals: vec![],
            },
            SeriesMetadataEntry {
                path: "a.b.c".to_owned(),
                is_leaf: true,
                intervals: vec![(-100, 100)],
            },
        ]));
        round_trip(&SeriesMetadata::default());
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // map with three fields: Paths, then a field this decoder has never
        // heard of, then Propagate
        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 3).unwrap();
        rmp::encode::write_str(&mut buf, "Paths").unwrap();
        rmp::encode::write_array_len(&mut buf, 1).unwrap();
        rmp::encode::write_str(&mut buf, "a.b").unwrap();
        rmp::encode::write_str(&mut buf, "Shadow").unwrap();
        rmp::encode::write_array_len(&mut buf, 2).unwrap();
        rmp::encode::write_sint(&mut buf, 1).unwrap();
        rmp::encode::write_str(&mut buf, "nested").unwrap();
        rmp::encode::write_str(&mut buf, "Propagate").unwrap();
        rmp::encode::write_bool(&mut buf, true).unwrap();

        let decoded = TagDeleteRequest::decode(&buf).unwrap();
        assert_eq!(decoded.paths, vec!["a.b".to_owned()]);
        assert!(decoded.propagate);
    }

    #[test]
    fn test_trailing_bytes_left_in_place() {
        let value = TagDeleteRequest {
            paths: vec!["x".to_owned()],
            propagate: false,
        };
        let mut encoded = value.encode().unwrap();
        encoded.extend_from_slice(&[0xc0, 0xc0]);

        let mut rd: &[u8] = &encoded;
        let decoded = TagDeleteRequest::decode_from(&mut rd).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(rd.len(), 2);
    }

    #[test]
    fn test_truncated_input_fails() {
        let value = SeriesMetadataEntry {
            path: "a.b.c".to_owned(),
            is_leaf: true,
            intervals: vec![(1, 2)],
        };
        let encoded = value.encode().unwrap();
        for cut in 1..encoded.len() {
            assert!(
                SeriesMetadataEntry::decode(&encoded[..cut]).is_err(),
                "decode of {cut}-byte prefix should fail"
            );
        }
    }

    #[test]
    fn test_interval_pairs_must_be_pairs() {
        let mut buf = Vec::new();
        rmp::encode::write_map_len(&mut buf, 1).unwrap();
        rmp::encode::write_str(&mut buf, "intervals").unwrap();
        rmp::encode::write_array_len(&mut buf, 1).unwrap();
        rmp::encode::write_array_len(&mut buf, 3).unwrap();
        rmp::encode::write_sint(&mut buf, 1).unwrap();
        rmp::encode::write_sint(&mut buf, 2).unwrap();
        rmp::encode::write_sint(&mut buf, 3).unwrap();

        assert!(SeriesMetadataEntry::decode(&buf).is_err());
    }
}
