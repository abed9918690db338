//! Media-container (MP4/MOV) partial recovery.
//!
//! Only the payload (`mdat`) and metadata (`moov`) boxes travel, plus a
//! leading file-type (`ftyp`) box folded into every metadata frame.
//!
//! ```text
//! payload:  "MP4" | box_size u32 BE | "mdat" | offset u32 | raw bytes
//! metadata: "MP4" | box_size u32 BE | "moov" | order u8 | mdat_size u32 BE
//!           | ftyp_len u16 | ftyp | sub_seq u32 | zlib bytes
//! ```
//!
//! The metadata box is compressed once and sent twice, each pass numbering
//! its pieces from 0. Every metadata frame also declares the payload box
//! size, so even a transfer that lost all payload frames yields a file with
//! a zeroed payload. Losing any metadata piece from both passes loses the
//! whole file.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::codec::{OffsetSink, RecoveryStats, walk_offsets};
use crate::error::{MediaError, ProtocolError};
use crate::logging::{EventSink, TransferEvent};
use crate::protocol::{
    FRAME_PAYLOAD, TYPE_TAG_LEN, TypeTag, compress, decompress, read_array, read_bytes, read_u16,
    read_u32, read_u32_be,
};
use crate::store::{FrameStore, Staging};

const PAYLOAD_BOX: &[u8; 4] = b"mdat";
const METADATA_BOX: &[u8; 4] = b"moov";
const FILE_TYPE_BOX: &[u8; 4] = b"ftyp";

/// Empty 8-byte padding box written between the payload and metadata boxes.
pub const PADDING_BOX: [u8; 8] = [0, 0, 0, 8, b'w', b'i', b'd', b'e'];

/// Standard box header: size u32 BE + kind.
const BOX_HEADER: usize = 8;

/// Tag + box size + box kind.
const COMMON_PREFIX: usize = TYPE_TAG_LEN + BOX_HEADER;

/// Payload frame prefix up to the raw bytes.
const PAYLOAD_PREFIX: usize = COMMON_PREFIX + 4;

/// Number of independent metadata transmissions.
pub const METADATA_PASSES: usize = 2;

/// One top-level box located in a container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxRef {
    pub kind: [u8; 4],
    /// Offset of the box header in the file
    pub start: usize,
    /// 8, or 16 with a 64-bit size
    pub header_len: usize,
    /// Total size including the header
    pub size: usize,
}

impl BoxRef {
    pub fn content<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.start + self.header_len..self.start + self.size]
    }

    pub fn bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.start..self.start + self.size]
    }

    pub fn content_len(&self) -> usize {
        self.size - self.header_len
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.kind).into_owned()
    }
}

/// Split a container into its top-level boxes.
pub fn parse_boxes(data: &[u8]) -> Result<Vec<BoxRef>, MediaError> {
    let mut boxes = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let truncated = || MediaError::TruncatedBox { offset: pos };
        let size32 = read_u32_be(data, pos, "box size").map_err(|_| truncated())?;
        let kind: [u8; 4] = read_array(data, pos + 4, "box kind").map_err(|_| truncated())?;
        let (size, header_len) = match size32 {
            0 => (data.len() - pos, BOX_HEADER),
            1 => {
                let large: [u8; 8] =
                    read_array(data, pos + 8, "box largesize").map_err(|_| truncated())?;
                let large = u64::from_be_bytes(large);
                let size = usize::try_from(large).map_err(|_| MediaError::BoxTooLarge {
                    name: String::from_utf8_lossy(&kind).into_owned(),
                    size: large,
                })?;
                (size, BOX_HEADER + 8)
            }
            n => (n as usize, BOX_HEADER),
        };
        if size < header_len || data.len() - pos < size {
            return Err(truncated());
        }
        boxes.push(BoxRef {
            kind,
            start: pos,
            header_len,
            size,
        });
        pos += size;
    }
    Ok(boxes)
}

/// Content sizes must fit a 32-bit box header and 32-bit frame offsets.
fn check_size(b: &BoxRef) -> Result<u32, MediaError> {
    let total = b.content_len() as u64 + BOX_HEADER as u64;
    u32::try_from(total).map_err(|_| MediaError::BoxTooLarge {
        name: b.name(),
        size: total,
    })
}

/// Fragment a container: every metadata frame (both passes), then payload frames.
pub fn encode(data: &[u8]) -> Result<Vec<Vec<u8>>, MediaError> {
    let boxes = parse_boxes(data)?;
    let file_type = boxes.first().filter(|b| &b.kind == FILE_TYPE_BOX);
    let metadata = boxes.iter().find(|b| &b.kind == METADATA_BOX);
    let payload = boxes
        .iter()
        .find(|b| &b.kind == PAYLOAD_BOX && b.content_len() > 0);
    let (Some(metadata), Some(payload)) = (metadata, payload) else {
        return Err(MediaError::NotAContainer);
    };
    let metadata_first = metadata.start < payload.start;

    let mut frames = metadata_frames(
        data,
        metadata,
        check_size(payload)?,
        file_type.map(|b| b.bytes(data)).unwrap_or_default(),
        metadata_first,
    )?;
    let metadata_count = frames.len();
    frames.extend(payload_frames(data, payload)?);
    debug!(
        metadata_frames = metadata_count,
        payload_frames = frames.len() - metadata_count,
        metadata_first,
        "container fragmented"
    );
    Ok(frames)
}

fn metadata_frames(
    data: &[u8],
    metadata: &BoxRef,
    payload_size: u32,
    file_type: &[u8],
    metadata_first: bool,
) -> Result<Vec<Vec<u8>>, MediaError> {
    let box_size = check_size(metadata)?;
    let mut prefix = Vec::with_capacity(FRAME_PAYLOAD);
    prefix.extend_from_slice(TypeTag::MEDIA);
    prefix.extend_from_slice(&box_size.to_be_bytes());
    prefix.extend_from_slice(METADATA_BOX);
    prefix.push(metadata_first as u8);
    prefix.extend_from_slice(&payload_size.to_be_bytes());
    prefix.extend_from_slice(&(file_type.len() as u16).to_le_bytes());
    prefix.extend_from_slice(file_type);
    // sub_seq follows
    if prefix.len() + 4 >= FRAME_PAYLOAD {
        return Err(MediaError::FileTypeTooLarge {
            size: file_type.len(),
        });
    }
    let room = FRAME_PAYLOAD - prefix.len() - 4;

    let compressed = compress(metadata.content(data))?;
    let mut frames = Vec::new();
    for _ in 0..METADATA_PASSES {
        for (sub_seq, piece) in compressed.chunks(room).enumerate() {
            let mut frame = Vec::with_capacity(FRAME_PAYLOAD);
            frame.extend_from_slice(&prefix);
            frame.extend_from_slice(&(sub_seq as u32).to_le_bytes());
            frame.extend_from_slice(piece);
            frames.push(frame);
        }
    }
    Ok(frames)
}

fn payload_frames(data: &[u8], payload: &BoxRef) -> Result<Vec<Vec<u8>>, MediaError> {
    let box_size = check_size(payload)?;
    let room = FRAME_PAYLOAD - PAYLOAD_PREFIX;
    let content = payload.content(data);
    let mut frames = Vec::with_capacity(content.len().div_ceil(room));
    for (i, piece) in content.chunks(room).enumerate() {
        let offset = (i * room) as u32;
        let mut frame = Vec::with_capacity(FRAME_PAYLOAD);
        frame.extend_from_slice(TypeTag::MEDIA);
        frame.extend_from_slice(&box_size.to_be_bytes());
        frame.extend_from_slice(PAYLOAD_BOX);
        frame.extend_from_slice(&offset.to_le_bytes());
        frame.extend_from_slice(piece);
        frames.push(frame);
    }
    Ok(frames)
}

/// A received payload frame, located by offset.
#[derive(Debug, Clone, Copy)]
pub struct PayloadPiece<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

/// Metadata fields shared by every metadata frame.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MetadataInfo {
    box_size: u32,
    metadata_first: bool,
    /// Declared payload box size, header included
    payload_size: u32,
    file_type: Vec<u8>,
}

fn box_kind(payload: &[u8]) -> Option<[u8; 4]> {
    read_array(payload, TYPE_TAG_LEN + 4, "box kind").ok()
}

fn parse_metadata_frame(payload: &[u8]) -> Result<(MetadataInfo, u32, &[u8]), ProtocolError> {
    let box_size = read_u32_be(payload, TYPE_TAG_LEN, "metadata box size")?;
    let mut pos = COMMON_PREFIX;
    let [order] = read_array::<1>(payload, pos, "order flag")?;
    let payload_size = read_u32_be(payload, pos + 1, "payload box size")?;
    let ftyp_len = read_u16(payload, pos + 5, "file-type length")? as usize;
    pos += 7;
    let file_type = read_bytes(payload, pos, ftyp_len, "file-type box")?.to_vec();
    pos += ftyp_len;
    let sub_seq = read_u32(payload, pos, "sub-sequence")?;
    pos += 4;
    Ok((
        MetadataInfo {
            box_size,
            metadata_first: order == 1,
            payload_size,
            file_type,
        },
        sub_seq,
        &payload[pos..],
    ))
}

/// Rebuild the metadata box content from whichever pass delivered each piece.
fn recover_metadata(
    info: &MetadataInfo,
    pieces: &BTreeMap<u32, &[u8]>,
    events: &EventSink,
) -> Result<Vec<u8>, MediaError> {
    let expected = (info.box_size as usize).saturating_sub(BOX_HEADER);
    let lost = |actual: usize| {
        events.emit(TransferEvent::MetadataLost { expected, actual });
        MediaError::MetadataLost { expected, actual }
    };

    let max = pieces.keys().next_back().copied().unwrap_or_default();
    let mut compressed = Vec::new();
    for sub_seq in 0..=max {
        match pieces.get(&sub_seq) {
            Some(piece) => compressed.extend_from_slice(piece),
            None => return Err(lost(0)),
        }
    }
    let content = decompress(&compressed).map_err(|_| lost(0))?;
    if content.len() != expected {
        return Err(lost(content.len()));
    }
    events.emit(TransferEvent::MetadataRecovered {
        sub_sequences: max + 1,
        bytes: content.len(),
    });
    Ok(content)
}

struct PayloadSink<'a, W: Write> {
    pieces: &'a BTreeMap<u16, PayloadPiece<'a>>,
    out: W,
    total: u64,
    written: u64,
    events: &'a EventSink,
}

impl<W: Write> OffsetSink for PayloadSink<'_, W> {
    type Error = io::Error;

    fn copy(&mut self, seq: u16, offset: u64) -> io::Result<u64> {
        let Some(piece) = self.pieces.get(&seq) else {
            return Ok(0);
        };
        let end = (offset + piece.data.len() as u64).min(self.total);
        if end <= self.written {
            return Ok(0);
        }
        // Skip anything already written by an overlapping frame
        let from = self.written.max(offset);
        let slice = &piece.data[(from - offset) as usize..(end - offset) as usize];
        self.out.write_all(slice)?;
        self.written = end;
        Ok(end - offset)
    }

    fn fill(&mut self, seq: u16, offset: u64, len: u64) -> io::Result<()> {
        const ZEROS: [u8; 8192] = [0; 8192];
        let mut left = len;
        while left > 0 {
            let n = left.min(ZEROS.len() as u64) as usize;
            self.out.write_all(&ZEROS[..n])?;
            left -= n as u64;
        }
        self.written = offset + len;
        self.events.emit(TransferEvent::GapFilled {
            sequence: seq,
            offset,
            len,
        });
        Ok(())
    }
}

/// Write the payload content (header excluded) with every hole zero-filled.
///
/// `pieces` maps present payload sequences to their frames; `total` is the
/// declared content size.
pub fn write_payload<W: Write>(
    pieces: &BTreeMap<u16, PayloadPiece<'_>>,
    total: u64,
    out: W,
) -> io::Result<RecoveryStats> {
    write_payload_with(pieces, total, out, &EventSink::silent())
}

fn write_payload_with<W: Write>(
    pieces: &BTreeMap<u16, PayloadPiece<'_>>,
    total: u64,
    out: W,
    events: &EventSink,
) -> io::Result<RecoveryStats> {
    let index: BTreeMap<u16, u64> = pieces.iter().map(|(&s, p)| (s, p.offset)).collect();
    let start = index.keys().next().copied().unwrap_or_default();
    let mut sink = PayloadSink {
        pieces,
        out,
        total,
        written: 0,
        events,
    };
    let stats = walk_offsets(&index, start, total, &mut sink)?;
    sink.out.flush()?;
    Ok(stats)
}

/// Rebuild the container into `out`, using the staging area for the two
/// accumulation streams.
pub fn reconstruct<W: Write>(
    store: &FrameStore,
    staging: &Staging,
    out: &mut W,
) -> Result<RecoveryStats, MediaError> {
    reconstruct_with(store, staging, out, &EventSink::silent())
}

pub(crate) fn reconstruct_with<W: Write>(
    store: &FrameStore,
    staging: &Staging,
    out: &mut W,
    events: &EventSink,
) -> Result<RecoveryStats, MediaError> {
    let mut info: Option<MetadataInfo> = None;
    let mut metadata_pieces: BTreeMap<u32, &[u8]> = BTreeMap::new();
    let mut payload_pieces: BTreeMap<u16, PayloadPiece<'_>> = BTreeMap::new();

    for frame in store.iter() {
        if frame.type_tag() != TypeTag::Media {
            continue;
        }
        match box_kind(&frame.payload).as_ref() {
            Some(kind) if kind == METADATA_BOX => {
                let (frame_info, sub_seq, piece) = parse_metadata_frame(&frame.payload)?;
                info.get_or_insert(frame_info);
                // store iterates in ascending sequence: first pass wins
                if let Entry::Vacant(slot) = metadata_pieces.entry(sub_seq) {
                    slot.insert(piece);
                }
            }
            Some(kind) if kind == PAYLOAD_BOX => {
                let offset = read_u32(&frame.payload, COMMON_PREFIX, "payload offset")?;
                payload_pieces.insert(
                    frame.sequence,
                    PayloadPiece {
                        offset: offset as u64,
                        data: &frame.payload[PAYLOAD_PREFIX..],
                    },
                );
            }
            _ => {}
        }
    }

    let Some(info) = info else {
        events.emit(TransferEvent::MetadataLost { expected: 0, actual: 0 });
        return Err(MediaError::MetadataLost {
            expected: 0,
            actual: 0,
        });
    };
    let metadata = recover_metadata(&info, &metadata_pieces, events)?;
    let payload_size = info.payload_size;
    if payload_pieces.is_empty() {
        warn!(payload_size, "every payload frame lost, payload zero-filled");
    }
    let payload_total = (payload_size as u64).saturating_sub(BOX_HEADER as u64);

    // ── Payload stream ─────────────────────────────────────────────────
    let payload_path = staging.payload_path();
    let mut payload_out = BufWriter::new(File::create(&payload_path)?);
    payload_out.write_all(&payload_size.to_be_bytes())?;
    payload_out.write_all(PAYLOAD_BOX)?;
    let mut stats =
        write_payload_with(&payload_pieces, payload_total, &mut payload_out, events)?;
    drop(payload_out);

    // ── Metadata stream ────────────────────────────────────────────────
    let metadata_path = staging.metadata_path();
    {
        let mut metadata_out = BufWriter::new(File::create(&metadata_path)?);
        metadata_out.write_all(&info.box_size.to_be_bytes())?;
        metadata_out.write_all(METADATA_BOX)?;
        metadata_out.write_all(&metadata)?;
        metadata_out.flush()?;
    }
    stats.absorb(RecoveryStats {
        expected_bytes: metadata.len() as u64,
        frames_used: metadata_pieces.len() as u64,
        ..RecoveryStats::default()
    });

    // ── Assembly ───────────────────────────────────────────────────────
    out.write_all(&info.file_type)?;
    if info.metadata_first {
        append_file(&metadata_path, out)?;
        out.write_all(&PADDING_BOX)?;
        append_file(&payload_path, out)?;
    } else {
        out.write_all(&PADDING_BOX)?;
        append_file(&payload_path, out)?;
        append_file(&metadata_path, out)?;
    }

    info!(
        payload_bytes = payload_total,
        metadata_bytes = metadata.len(),
        filled = stats.filled_bytes,
        metadata_first = info.metadata_first,
        "container reassembled"
    );
    Ok(stats)
}

fn append_file<W: Write>(path: &Path, out: &mut W) -> io::Result<u64> {
    let mut file = File::open(path)?;
    io::copy(&mut file, out)
}
