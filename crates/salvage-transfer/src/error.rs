//! Error types for the transfer pipeline.
//!
//! Each codec and pipeline stage owns its error enum; the sender and
//! receiver orchestrators fold them into `SendError` / `ReceiveError`.
//! Recoverable data loss (missing pixel or payload frames) is never an
//! error: it is zero-filled and reported through `RecoveryStats`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Frame-level encoding and compression errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload does not fit into a single frame
    #[error("payload of {len} bytes exceeds frame limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// A field could not be read because the buffer ended early
    #[error("truncated {what}: need {needed} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },

    /// zlib compression failed
    #[error("compression failed: {0}")]
    Compress(#[source] io::Error),

    /// zlib decompression failed (corrupt or undersized data)
    #[error("decompression failed: {0}")]
    Decompress(#[source] io::Error),

    /// Decompressed segment would run past the end of its destination
    #[error("segment inflates to {needed} bytes but only {available} remain")]
    SegmentOverflow { needed: usize, available: usize },
}

/// Frame store and staging-area errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Staging target could not be created or opened
    #[error("cannot open staging file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Read or write on an open staging file failed
    #[error("staging I/O error: {0}")]
    Io(#[from] io::Error),

    /// A persisted record declares a length larger than a frame
    #[error("corrupt staging record {index}: length {len}")]
    CorruptRecord { index: u64, len: usize },
}

/// Raster-image (PNG) codec errors.
#[derive(Debug, Error)]
pub enum RasterError {
    /// Source image could not be decoded
    #[error("PNG decode error: {0}")]
    Decode(#[from] png::DecodingError),

    /// Reconstructed image could not be re-encoded
    #[error("PNG encode error: {0}")]
    Encode(#[from] png::EncodingError),

    /// Colour model code outside the PNG set
    #[error("unsupported colour model code {0}")]
    UnsupportedColor(u8),

    /// Header record is malformed
    #[error("malformed raster header: {0}")]
    BadHeader(String),

    /// No header frame survived the transfer
    #[error("raster header frame lost in transmission")]
    HeaderLost,

    /// Frame-level failure (including corrupt compressed segments)
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Media-container (MP4/MOV) codec errors.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Box header runs past the end of the input
    #[error("truncated box at offset {offset}")]
    TruncatedBox { offset: usize },

    /// Input lacks a metadata box or a non-empty payload box
    #[error("input is not a recoverable media container")]
    NotAContainer,

    /// Box is too large for 32-bit frame offsets
    #[error("box {name} of {size} bytes exceeds 32-bit framing")]
    BoxTooLarge { name: String, size: u64 },

    /// File-type box does not fit into a metadata frame
    #[error("file-type box of {size} bytes does not fit a metadata frame")]
    FileTypeTooLarge { size: usize },

    /// Metadata could not be completely reassembled
    #[error("metadata lost in transmission: recovered {actual} of {expected} bytes")]
    MetadataLost { expected: usize, actual: usize },

    /// Frame-level failure
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Staging stream I/O failure
    #[error("media staging I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket failure
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// Request name does not fit the datagram header
    #[error("request name of {len} bytes exceeds {max}")]
    NameTooLong { len: usize, max: usize },
}

/// Errors returned by `run_sender`.
#[derive(Debug, Error)]
pub enum SendError {
    /// Input file could not be read
    #[error("cannot read input {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// More frames than the 16-bit sequence space holds
    #[error("{frames} frames exceed the 16-bit sequence space")]
    SequenceSpaceExhausted { frames: usize },

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors returned by `run_receiver`.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Staging area failure (fatal, aborts the run)
    #[error(transparent)]
    Staging(#[from] StoreError),

    /// No frame arrived before the start timeout
    #[error("no frame received within {waited_ms} ms")]
    NothingReceived { waited_ms: u64 },

    /// Persistence thread panicked
    #[error("persistence thread panicked")]
    PersistencePanicked,

    /// Output file could not be written
    #[error("cannot write output {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ReceiveError {
    /// True when the frames that describe the file (container metadata or
    /// the raster header) did not survive. Staging is cleaned up before
    /// such an error is returned.
    pub fn is_structural_loss(&self) -> bool {
        matches!(
            self,
            ReceiveError::Media(MediaError::MetadataLost { .. })
                | ReceiveError::Raster(RasterError::HeaderLost)
        )
    }
}
