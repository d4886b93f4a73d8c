//! Error and `Result` types for volume operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for needle, super-block, index and volume operations.
///
/// Corruption detected while parsing a record is fatal for that read only,
/// never for the volume.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key is not present in the needle cache.
    #[error("needle not found")]
    NoNeedle,

    /// The needle is logically deleted.
    #[error("needle deleted")]
    Deleted,

    /// Invalid needle header magic bytes.
    #[error("invalid needle header magic")]
    HeaderMagic,

    /// Invalid needle footer magic bytes.
    #[error("invalid needle footer magic")]
    FooterMagic,

    /// The flag byte is neither OK nor Deleted.
    #[error("invalid needle flag: {0}")]
    Flag(u8),

    /// The size field is out of range.
    #[error("invalid needle size: {0}")]
    Size(u32),

    /// Payload checksum mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        /// Checksum stored in the record footer.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// Padding bytes are not the canonical zero pattern.
    #[error("invalid needle padding")]
    Padding,

    /// The stored key does not match the requested key (stale offset).
    #[error("key mismatch: expected {expected}, got {actual}")]
    Key {
        /// Key the caller asked for.
        expected: u64,
        /// Key found in the record.
        actual: u64,
    },

    /// The stored cookie does not match the requested cookie.
    #[error("cookie mismatch")]
    Cookie,

    /// The record would exceed the maximum needle size.
    #[error("needle too large: {0} byte payload")]
    TooLarge(usize),

    /// Invalid super-block file magic bytes.
    #[error("invalid super-block magic: {0:?}")]
    BlockMagic([u8; 4]),

    /// Unsupported super-block format version.
    #[error("unsupported super-block version: {0}")]
    Version(u8),

    /// The index ring is saturated; the caller should retry later.
    #[error("index ring full")]
    RingFull,

    /// The delete queue is saturated; the cache tombstone stands and the
    /// physical flag write is deferred.
    #[error("delete queue full")]
    DeleteQueueFull,

    /// Compaction is already in progress on this volume.
    #[error("volume already compacting")]
    InCompaction,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
