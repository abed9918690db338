/// Frame format shared by sender and receiver.
///
/// A frame is a 16-bit sequence number (assigned by the sender, monotonic
/// from 0) and up to 1024 payload bytes. Structured payloads start with a
/// 3-byte type tag that selects the reconstruction codec on the receiver.
/// Both structured codecs pack zlib segments back-to-back, each prefixed by
/// a u32 compressed length.
/// A trailing partial segment ends the list for that frame.
///
/// Fields we define are little-endian. Box sizes copied from a media
/// container's own header stay big-endian.

use std::io::{Read, Write};
use std::time::Duration;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::ProtocolError;

/// Maximum payload bytes per frame.
pub const FRAME_PAYLOAD: usize = 1024;

/// Sequence numbers are 16-bit, so one transfer holds at most this many frames.
pub const MAX_FRAMES: usize = u16::MAX as usize + 1;

/// Length of the codec type tag at the start of structured payloads.
pub const TYPE_TAG_LEN: usize = 3;

/// Size of the compressed-length prefix in front of each packed segment.
pub const SEGMENT_LEN_FIELD: usize = 4;

/// Silence after the last frame that declares the transmission finished.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the persistence task blocks on an empty queue before
/// re-checking the idle clock.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Codec selector carried in the first bytes of structured payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Raster,
    Media,
    General,
}

impl TypeTag {
    pub const RASTER: &'static [u8; 3] = b"PNG";
    pub const MEDIA: &'static [u8; 3] = b"MP4";

    /// Classify a payload by its leading bytes. Anything unrecognised is general.
    pub fn detect(payload: &[u8]) -> Self {
        match payload.get(..TYPE_TAG_LEN) {
            Some(tag) if tag == Self::RASTER => TypeTag::Raster,
            Some(tag) if tag == Self::MEDIA => TypeTag::Media,
            _ => TypeTag::General,
        }
    }

    /// Wire bytes for structured tags; general payloads carry none.
    pub fn bytes(self) -> &'static [u8] {
        match self {
            TypeTag::Raster => Self::RASTER,
            TypeTag::Media => Self::MEDIA,
            TypeTag::General => &[],
        }
    }
}

/// One received (or to-be-sent) transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(sequence: u16, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.len() > FRAME_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: FRAME_PAYLOAD,
            });
        }
        Ok(Self { sequence, payload })
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.payload.len() as u16
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn type_tag(&self) -> TypeTag {
        TypeTag::detect(&self.payload)
    }
}

/// Read a little-endian u32 at `at`.
pub fn read_u32(buf: &[u8], at: usize, what: &'static str) -> Result<u32, ProtocolError> {
    Ok(u32::from_le_bytes(read_array(buf, at, what)?))
}

/// Read a big-endian u32 at `at` (box sizes copied from a container header).
pub fn read_u32_be(buf: &[u8], at: usize, what: &'static str) -> Result<u32, ProtocolError> {
    Ok(u32::from_be_bytes(read_array(buf, at, what)?))
}

/// Read a little-endian u16 at `at`.
pub fn read_u16(buf: &[u8], at: usize, what: &'static str) -> Result<u16, ProtocolError> {
    Ok(u16::from_le_bytes(read_array(buf, at, what)?))
}

/// Copy `N` bytes at `at` into an array.
pub fn read_array<const N: usize>(
    buf: &[u8],
    at: usize,
    what: &'static str,
) -> Result<[u8; N], ProtocolError> {
    let mut out = [0u8; N];
    out.copy_from_slice(read_bytes(buf, at, N, what)?);
    Ok(out)
}

/// Borrow `len` bytes at `at`.
pub fn read_bytes<'a>(
    buf: &'a [u8],
    at: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], ProtocolError> {
    buf.get(at..at.saturating_add(len)).ok_or(ProtocolError::Truncated {
        what,
        needed: at + len,
        actual: buf.len(),
    })
}

/// zlib's worst-case compressed size for `n` input bytes.
pub const fn compress_bound(n: usize) -> usize {
    n + (n >> 12) + (n >> 14) + (n >> 25) + 13
}

/// Largest input whose worst-case compressed size fits in `space` bytes.
pub fn max_uncompressed_for(space: usize) -> usize {
    let mut n = space.saturating_sub(13);
    while n > 0 && compress_bound(n) > space {
        n -= 1;
    }
    n
}

/// Compress with zlib at best compression.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(compress_bound(data.len())),
        Compression::best(),
    );
    encoder.write_all(data).map_err(ProtocolError::Compress)?;
    encoder.finish().map_err(ProtocolError::Compress)
}

/// Inflate a complete zlib stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(ProtocolError::Decompress)?;
    Ok(out)
}

/// Inflate one segment into `dst`, returning the bytes written.
pub fn decompress_into(segment: &[u8], dst: &mut [u8]) -> Result<usize, ProtocolError> {
    let inflated = decompress(segment)?;
    if inflated.len() > dst.len() {
        return Err(ProtocolError::SegmentOverflow {
            needed: inflated.len(),
            available: dst.len(),
        });
    }
    dst[..inflated.len()].copy_from_slice(&inflated);
    Ok(inflated.len())
}

/// Builds one frame payload out of a fixed prefix plus packed segments.
pub struct SegmentPacker {
    buf: Vec<u8>,
    segments: usize,
}

impl SegmentPacker {
    pub fn new(prefix: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(FRAME_PAYLOAD);
        buf.extend_from_slice(prefix);
        Self { buf, segments: 0 }
    }

    /// Bytes still free in the frame.
    pub fn remaining(&self) -> usize {
        FRAME_PAYLOAD.saturating_sub(self.buf.len())
    }

    /// Append a compressed segment if it fits with its length prefix.
    pub fn try_push(&mut self, compressed: &[u8]) -> bool {
        if SEGMENT_LEN_FIELD + compressed.len() > self.remaining() {
            return false;
        }
        self.buf
            .extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(compressed);
        self.segments += 1;
        true
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterator over the complete segments packed into a frame body.
///
/// Stops at the first segment whose declared length exceeds what is left.
pub struct Segments<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Segments<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 0 }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let rest = &self.body[self.pos..];
        if rest.len() < SEGMENT_LEN_FIELD {
            return None;
        }
        let len = read_u32(rest, 0, "segment length").ok()? as usize;
        if len == 0 || rest.len() - SEGMENT_LEN_FIELD < len {
            return None;
        }
        self.pos += SEGMENT_LEN_FIELD + len;
        Some(&rest[SEGMENT_LEN_FIELD..SEGMENT_LEN_FIELD + len])
    }
}
