//! Error types for granary

use crate::wire::WireError;

/// Result type alias for granary operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for granary
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A search was issued with `start >= end`
    #[error("invalid range: start must be less than end")]
    InvalidRange,
    /// The requested TTL has no configured table
    #[error("no table found for ttl {0}")]
    TableNotFound(u32),
    /// The read queue was full and the request was not accepted
    #[error("the read queue is full")]
    ReadQueueFull,
    /// The read waited in the queue longer than the omit threshold
    #[error("the read is too old")]
    ReadTooOld,
    /// The caller canceled the request
    #[error("request canceled")]
    Canceled,
    /// A stored frame was too short to carry a format byte and payload
    #[error("impossibly small chunk of {0} bytes in storage")]
    ChunkTooSmall(usize),
    /// A stored frame carried an unregistered format byte
    #[error("unknown chunk format {0}")]
    UnknownFormat(u8),
    /// A stored frame carried a span code outside the registered span table
    #[error("unknown span code {0}")]
    UnknownSpanCode(u8),
    /// The backing store failed; writes retry on this, reads surface it
    #[error("storage error: {0}")]
    Storage(String),
    /// Invalid configuration, rejected at startup
    #[error("configuration error: {0}")]
    Config(String),
    /// A compressed point stream could not be decoded
    #[error("series codec error: {0}")]
    Codec(String),
    /// Envelope encoding or decoding failed
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),
}

impl Error {
    /// Stable label for per-kind error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRange => "invalid_range",
            Error::TableNotFound(_) => "table_not_found",
            Error::ReadQueueFull => "read_queue_full",
            Error::ReadTooOld => "read_too_old",
            Error::Canceled => "canceled",
            Error::ChunkTooSmall(_) => "chunk_too_small",
            Error::UnknownFormat(_) => "unknown_format",
            Error::UnknownSpanCode(_) => "unknown_span_code",
            Error::Storage(_) => "storage",
            Error::Config(_) => "config",
            Error::Codec(_) => "codec",
            Error::Wire(_) => "wire",
        }
    }
}
