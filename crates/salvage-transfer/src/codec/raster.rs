//! Raster-image (PNG) partial recovery.
//!
//! The sender decodes the image to raw samples and ships two kinds of frames:
//!
//! ```text
//! header: "PNG" | 0 | bpp u8 | colour u8 | width u32 | height u32 | records... | "IDAT"
//! pixels: "PNG" | 1 | offset u32 | { seg_len u32 | zlib }*
//! ```
//!
//! Each pixel frame says where in the raw sample buffer its content starts,
//! so a lost frame costs exactly its own byte range. The receiver zero-fills
//! those ranges and re-encodes a complete (possibly degraded) image.
//!
//! Records reuse the PNG chunk names as 4-byte kind tags. Bodies use our
//! little-endian layout, not the PNG chunk layout.

use std::collections::BTreeMap;
use std::io::Cursor;

use tracing::{debug, warn};

use crate::codec::{OffsetSink, RecoveryStats, walk_offsets};
use crate::error::{ProtocolError, RasterError};
use crate::logging::{EventSink, TransferEvent};
use crate::protocol::{
    FRAME_PAYLOAD, SEGMENT_LEN_FIELD, SegmentPacker, Segments, TYPE_TAG_LEN, TypeTag, compress,
    decompress_into, max_uncompressed_for, read_array, read_bytes, read_u16, read_u32,
};
use crate::store::FrameStore;

const KIND_HEADER: u8 = 0;
const KIND_PIXELS: u8 = 1;

/// Tag + kind + offset in front of pixel segments.
const PIXEL_PREFIX: usize = TYPE_TAG_LEN + 1 + 4;

/// Marks the end of the record list.
const END_MARKER: &[u8; 4] = b"IDAT";

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Substituted whenever a standard colour space intent is present (units of 1e-5).
pub const SRGB_GAMMA: u32 = 45455;
pub const SRGB_CHROMATICITIES: [u32; 8] = [31270, 32900, 64000, 33000, 30000, 60000, 15000, 6000];

/// Optional metadata carried alongside the pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Background,
    PixelDensity,
    ColorProfile,
    SrgbIntent,
    Chromaticity,
    Gamma,
}

impl RecordKind {
    /// Serialisation order.
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Background,
        RecordKind::PixelDensity,
        RecordKind::ColorProfile,
        RecordKind::SrgbIntent,
        RecordKind::Chromaticity,
        RecordKind::Gamma,
    ];

    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            RecordKind::Background => b"bKGD",
            RecordKind::PixelDensity => b"pHYs",
            RecordKind::ColorProfile => b"iCCP",
            RecordKind::SrgbIntent => b"sRGB",
            RecordKind::Chromaticity => b"cHRM",
            RecordKind::Gamma => b"gAMA",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelDensity {
    pub x: u32,
    pub y: u32,
    /// 1 = per metre, 0 = aspect ratio only
    pub unit: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IccProfile {
    pub name: String,
    /// zlib stream, as stored in the source file
    pub compressed: Vec<u8>,
}

/// Image geometry plus the optional records that survive the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterHeader {
    pub bytes_per_pixel: u8,
    /// PNG colour type code (0, 2, 4 or 6)
    pub color: u8,
    pub width: u32,
    pub height: u32,
    /// Raw bKGD sample bytes for the colour type
    pub background: Option<Vec<u8>>,
    pub pixel_density: Option<PixelDensity>,
    pub color_profile: Option<IccProfile>,
    pub srgb_intent: Option<u8>,
    /// white x/y, red x/y, green x/y, blue x/y
    pub chromaticities: Option<[u32; 8]>,
    pub gamma: Option<u32>,
}

fn channels(color: u8) -> Option<u8> {
    match color {
        0 => Some(1),
        2 => Some(3),
        4 => Some(2),
        6 => Some(4),
        _ => None,
    }
}

impl RasterHeader {
    pub fn new(bytes_per_pixel: u8, color: u8, width: u32, height: u32) -> Self {
        Self {
            bytes_per_pixel,
            color,
            width,
            height,
            background: None,
            pixel_density: None,
            color_profile: None,
            srgb_intent: None,
            chromaticities: None,
            gamma: None,
        }
    }

    /// Raw sample buffer size.
    pub fn image_size(&self) -> u64 {
        self.bytes_per_pixel as u64 * self.width as u64 * self.height as u64
    }

    pub fn bit_depth(&self) -> Result<u8, RasterError> {
        let ch = channels(self.color).ok_or(RasterError::UnsupportedColor(self.color))?;
        if self.bytes_per_pixel == 0 || self.bytes_per_pixel % ch != 0 {
            return Err(RasterError::BadHeader(format!(
                "{} bytes per pixel for colour type {}",
                self.bytes_per_pixel, self.color
            )));
        }
        match self.bytes_per_pixel / ch {
            1 => Ok(8),
            2 => Ok(16),
            n => Err(RasterError::BadHeader(format!("{} bytes per sample", n))),
        }
    }

    pub fn has(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Background => self.background.is_some(),
            RecordKind::PixelDensity => self.pixel_density.is_some(),
            RecordKind::ColorProfile => self.color_profile.is_some(),
            RecordKind::SrgbIntent => self.srgb_intent.is_some(),
            RecordKind::Chromaticity => self.chromaticities.is_some(),
            RecordKind::Gamma => self.gamma.is_some(),
        }
    }

    pub fn clear(&mut self, kind: RecordKind) {
        match kind {
            RecordKind::Background => self.background = None,
            RecordKind::PixelDensity => self.pixel_density = None,
            RecordKind::ColorProfile => self.color_profile = None,
            RecordKind::SrgbIntent => self.srgb_intent = None,
            RecordKind::Chromaticity => self.chromaticities = None,
            RecordKind::Gamma => self.gamma = None,
        }
    }

    /// Which records go on the wire. An intent record makes chromaticity
    /// and gamma redundant.
    fn wire_kinds(&self) -> impl Iterator<Item = RecordKind> + '_ {
        RecordKind::ALL.into_iter().filter(move |&k| {
            self.has(k)
                && !(self.srgb_intent.is_some()
                    && matches!(k, RecordKind::Chromaticity | RecordKind::Gamma))
        })
    }

    fn encode_record(&self, kind: RecordKind, out: &mut Vec<u8>) {
        out.extend_from_slice(kind.tag());
        match kind {
            RecordKind::Background => {
                let bg = self.background.as_deref().unwrap_or_default();
                out.push(bg.len() as u8);
                out.extend_from_slice(bg);
            }
            RecordKind::PixelDensity => {
                if let Some(d) = self.pixel_density {
                    out.extend_from_slice(&d.x.to_le_bytes());
                    out.extend_from_slice(&d.y.to_le_bytes());
                    out.push(d.unit);
                }
            }
            RecordKind::ColorProfile => {
                if let Some(icc) = &self.color_profile {
                    out.push(icc.name.len() as u8);
                    out.extend_from_slice(icc.name.as_bytes());
                    out.extend_from_slice(&(icc.compressed.len() as u16).to_le_bytes());
                    out.extend_from_slice(&icc.compressed);
                }
            }
            RecordKind::SrgbIntent => out.push(self.srgb_intent.unwrap_or_default()),
            RecordKind::Chromaticity => {
                for v in self.chromaticities.unwrap_or_default() {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            RecordKind::Gamma => {
                out.extend_from_slice(&self.gamma.unwrap_or_default().to_le_bytes())
            }
        }
    }

    fn encode_with(&self, kinds: &[RecordKind]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_PAYLOAD);
        out.extend_from_slice(TypeTag::RASTER);
        out.push(KIND_HEADER);
        out.push(self.bytes_per_pixel);
        out.push(self.color);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        for &kind in kinds {
            self.encode_record(kind, &mut out);
        }
        out.extend_from_slice(END_MARKER);
        out
    }

    /// Serialise into a header frame payload. Records that would overflow
    /// the frame are dropped, largest (the colour profile) first.
    pub fn encode(&self) -> Vec<u8> {
        let mut kinds: Vec<RecordKind> = self.wire_kinds().collect();
        loop {
            let out = self.encode_with(&kinds);
            if out.len() <= FRAME_PAYLOAD || kinds.is_empty() {
                return out;
            }
            let drop = if kinds.contains(&RecordKind::ColorProfile) {
                RecordKind::ColorProfile
            } else {
                kinds[kinds.len() - 1]
            };
            warn!(record = ?drop, "raster record does not fit the header frame, dropped");
            kinds.retain(|&k| k != drop);
        }
    }

    /// Parse a header frame payload. Missing chromaticity and gamma are
    /// filled with the standard values when an intent record is present.
    pub fn decode(payload: &[u8]) -> Result<Self, RasterError> {
        if TypeTag::detect(payload) != TypeTag::Raster
            || payload.get(TYPE_TAG_LEN) != Some(&KIND_HEADER)
        {
            return Err(RasterError::BadHeader("not a raster header frame".into()));
        }
        let mut pos = TYPE_TAG_LEN + 1;
        let [bpp, color] = read_array::<2>(payload, pos, "raster geometry")?;
        pos += 2;
        let width = read_u32(payload, pos, "raster width")?;
        let height = read_u32(payload, pos + 4, "raster height")?;
        pos += 8;

        let mut header = RasterHeader::new(bpp, color, width, height);
        header.bit_depth()?;
        if header.image_size() > u32::MAX as u64 {
            return Err(RasterError::BadHeader(format!(
                "{}x{} image exceeds 32-bit offsets",
                width, height
            )));
        }

        loop {
            let tag: [u8; 4] = read_array(payload, pos, "record tag")?;
            pos += 4;
            if &tag == END_MARKER {
                break;
            }
            let kind = RecordKind::from_tag(&tag).ok_or_else(|| {
                let name = String::from_utf8_lossy(&tag);
                RasterError::BadHeader(format!("unknown record {name:?}"))
            })?;
            match kind {
                RecordKind::Background => {
                    let len = read_array::<1>(payload, pos, "background length")?[0] as usize;
                    let background = read_bytes(payload, pos + 1, len, "background")?;
                    header.background = Some(background.to_vec());
                    pos += 1 + len;
                }
                RecordKind::PixelDensity => {
                    header.pixel_density = Some(PixelDensity {
                        x: read_u32(payload, pos, "density x")?,
                        y: read_u32(payload, pos + 4, "density y")?,
                        unit: read_array::<1>(payload, pos + 8, "density unit")?[0],
                    });
                    pos += 9;
                }
                RecordKind::ColorProfile => {
                    let [name_len] = read_array::<1>(payload, pos, "profile name length")?;
                    let name_len = name_len as usize;
                    let name = read_bytes(payload, pos + 1, name_len, "profile name")?;
                    pos += 1 + name_len;
                    let len = read_u16(payload, pos, "profile length")? as usize;
                    let compressed = read_bytes(payload, pos + 2, len, "profile")?.to_vec();
                    pos += 2 + len;
                    header.color_profile = Some(IccProfile {
                        name: String::from_utf8_lossy(name).into_owned(),
                        compressed,
                    });
                }
                RecordKind::SrgbIntent => {
                    header.srgb_intent = Some(read_array::<1>(payload, pos, "intent")?[0]);
                    pos += 1;
                }
                RecordKind::Chromaticity => {
                    let mut c = [0u32; 8];
                    for (i, v) in c.iter_mut().enumerate() {
                        *v = read_u32(payload, pos + i * 4, "chromaticity")?;
                    }
                    header.chromaticities = Some(c);
                    pos += 32;
                }
                RecordKind::Gamma => {
                    header.gamma = Some(read_u32(payload, pos, "gamma")?);
                    pos += 4;
                }
            }
        }

        if header.srgb_intent.is_some() {
            header.gamma = Some(SRGB_GAMMA);
            header.chromaticities = Some(SRGB_CHROMATICITIES);
        }
        Ok(header)
    }
}

/// Raw samples plus header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub header: RasterHeader,
    pub pixels: Vec<u8>,
}

/// Walk the chunk list of an encoded PNG. Stops quietly at IEND or at
/// anything truncated.
fn chunks(png: &[u8]) -> impl Iterator<Item = ([u8; 4], &[u8])> + '_ {
    let mut pos = PNG_SIGNATURE.len();
    std::iter::from_fn(move || {
        let len = u32::from_be_bytes(png.get(pos..pos + 4)?.try_into().ok()?) as usize;
        let kind: [u8; 4] = png.get(pos + 4..pos + 8)?.try_into().ok()?;
        let data = png.get(pos + 8..pos + 8 + len)?;
        if &kind == b"IEND" {
            return None;
        }
        pos += 12 + len;
        Some((kind, data))
    })
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

/// Pull the records we carry out of the source file's ancillary chunks.
fn read_records(png: &[u8], header: &mut RasterHeader) {
    for (kind, data) in chunks(png) {
        match &kind {
            b"bKGD" => header.background = Some(data.to_vec()),
            b"pHYs" => {
                let fields = (be_u32(data, 0), be_u32(data, 4), data.get(8));
                if let (Some(x), Some(y), Some(&unit)) = fields {
                    header.pixel_density = Some(PixelDensity { x, y, unit });
                }
            }
            b"iCCP" => {
                // name \0 method compressed...
                if let Some(nul) = data.iter().position(|&b| b == 0) {
                    if let Some(compressed) = data.get(nul + 2..) {
                        header.color_profile = Some(IccProfile {
                            name: String::from_utf8_lossy(&data[..nul]).into_owned(),
                            compressed: compressed.to_vec(),
                        });
                    }
                }
            }
            b"sRGB" => header.srgb_intent = data.first().copied(),
            b"cHRM" => {
                let mut c = [0u32; 8];
                let mut ok = true;
                for (i, v) in c.iter_mut().enumerate() {
                    match be_u32(data, i * 4) {
                        Some(x) => *v = x,
                        None => ok = false,
                    }
                }
                if ok {
                    header.chromaticities = Some(c);
                }
            }
            b"gAMA" => header.gamma = be_u32(data, 0),
            _ => {}
        }
    }
}

/// Decode a PNG into raw 8- or 16-bit samples. Indexed and sub-byte images
/// are expanded, which also invalidates their background record.
pub fn decode_png(png: &[u8]) -> Result<RasterImage, RasterError> {
    let mut decoder = png::Decoder::new(Cursor::new(png));
    decoder.set_transformations(png::Transformations::EXPAND);
    let mut reader = decoder.read_info()?;

    let (source_color, source_depth) = {
        let info = reader.info();
        (info.color_type, info.bit_depth)
    };
    let mut pixels = vec![0u8; reader.output_buffer_size()];
    let frame = reader.next_frame(&mut pixels)?;
    pixels.truncate(frame.buffer_size());

    let color = frame.color_type as u8;
    let ch = channels(color).ok_or(RasterError::UnsupportedColor(color))?;
    let depth_bytes = match frame.bit_depth {
        png::BitDepth::Sixteen => 2,
        _ => 1,
    };
    let mut header = RasterHeader::new(ch * depth_bytes, color, frame.width, frame.height);

    let expanded = source_color == png::ColorType::Indexed || (source_depth as u8) < 8;
    read_records(png, &mut header);
    if expanded {
        // bKGD was a palette index or a sub-byte sample
        header.clear(RecordKind::Background);
    }
    debug!(
        width = header.width,
        height = header.height,
        bpp = header.bytes_per_pixel,
        color = header.color,
        expanded,
        "raster decoded"
    );
    Ok(RasterImage { header, pixels })
}

fn color_type(code: u8) -> Result<png::ColorType, RasterError> {
    match code {
        0 => Ok(png::ColorType::Grayscale),
        2 => Ok(png::ColorType::Rgb),
        4 => Ok(png::ColorType::GrayscaleAlpha),
        6 => Ok(png::ColorType::Rgba),
        other => Err(RasterError::UnsupportedColor(other)),
    }
}

/// Re-encode raw samples with the carried records.
pub fn encode_png(image: &RasterImage) -> Result<Vec<u8>, RasterError> {
    use png::chunk::ChunkType;

    let h = &image.header;
    let depth = match h.bit_depth()? {
        16 => png::BitDepth::Sixteen,
        _ => png::BitDepth::Eight,
    };

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, h.width, h.height);
        encoder.set_color(color_type(h.color)?);
        encoder.set_depth(depth);
        let mut writer = encoder.write_header()?;

        // Colour space chunks first, then the rest, all before IDAT
        if let Some(intent) = h.srgb_intent {
            writer.write_chunk(ChunkType(*b"sRGB"), &[intent])?;
        }
        if let Some(gamma) = h.gamma {
            writer.write_chunk(ChunkType(*b"gAMA"), &gamma.to_be_bytes())?;
        }
        if let Some(c) = h.chromaticities {
            let body: Vec<u8> = c.iter().flat_map(|v| v.to_be_bytes()).collect();
            writer.write_chunk(ChunkType(*b"cHRM"), &body)?;
        }
        if let Some(icc) = h.color_profile.as_ref().filter(|_| h.srgb_intent.is_none()) {
            let mut body = Vec::with_capacity(icc.name.len() + 2 + icc.compressed.len());
            body.extend_from_slice(icc.name.as_bytes());
            body.extend_from_slice(&[0, 0]);
            body.extend_from_slice(&icc.compressed);
            writer.write_chunk(ChunkType(*b"iCCP"), &body)?;
        }
        if let Some(d) = h.pixel_density {
            let mut body = Vec::with_capacity(9);
            body.extend_from_slice(&d.x.to_be_bytes());
            body.extend_from_slice(&d.y.to_be_bytes());
            body.push(d.unit);
            writer.write_chunk(ChunkType(*b"pHYs"), &body)?;
        }
        if let Some(bg) = &h.background {
            writer.write_chunk(ChunkType(*b"bKGD"), bg)?;
        }

        writer.write_image_data(&image.pixels)?;
        writer.finish()?;
    }
    Ok(out)
}

/// Largest raw window per segment for a given pixel size.
pub fn window_size(bytes_per_pixel: u8) -> usize {
    let bpp = bytes_per_pixel.max(1) as usize;
    let n = max_uncompressed_for(FRAME_PAYLOAD - PIXEL_PREFIX - SEGMENT_LEN_FIELD);
    (n / bpp * bpp).max(bpp)
}

/// Split a decoded image into a header frame followed by pixel frames.
pub fn fragment(image: &RasterImage) -> Result<Vec<Vec<u8>>, RasterError> {
    let total = image.pixels.len();
    let window = window_size(image.header.bytes_per_pixel);
    let mut frames = vec![image.header.encode()];

    let mut cursor = 0usize;
    while cursor < total {
        let mut prefix = [0u8; PIXEL_PREFIX];
        prefix[..TYPE_TAG_LEN].copy_from_slice(TypeTag::RASTER);
        prefix[TYPE_TAG_LEN] = KIND_PIXELS;
        prefix[TYPE_TAG_LEN + 1..].copy_from_slice(&(cursor as u32).to_le_bytes());
        let mut packer = SegmentPacker::new(&prefix);

        while cursor < total {
            let n = window.min(total - cursor);
            let segment = compress(&image.pixels[cursor..cursor + n])?;
            if !packer.try_push(&segment) {
                if packer.segments() == 0 {
                    return Err(ProtocolError::SegmentOverflow {
                        needed: segment.len() + SEGMENT_LEN_FIELD,
                        available: packer.remaining(),
                    }
                    .into());
                }
                break;
            }
            cursor += n;
        }
        frames.push(packer.finish());
    }
    Ok(frames)
}

/// Decode a PNG file and fragment it.
pub fn encode(png: &[u8]) -> Result<Vec<Vec<u8>>, RasterError> {
    fragment(&decode_png(png)?)
}

/// Rebuild the raw sample buffer from whatever frames arrived.
pub fn reconstruct(store: &FrameStore) -> Result<(RasterImage, RecoveryStats), RasterError> {
    reconstruct_with(store, &EventSink::silent())
}

pub(crate) fn reconstruct_with(
    store: &FrameStore,
    events: &EventSink,
) -> Result<(RasterImage, RecoveryStats), RasterError> {
    let mut header = None;
    let mut index: BTreeMap<u16, u64> = BTreeMap::new();
    for frame in store.iter() {
        if frame.type_tag() != TypeTag::Raster {
            continue;
        }
        match frame.payload.get(TYPE_TAG_LEN) {
            Some(&KIND_HEADER) if header.is_none() => {
                header = Some(RasterHeader::decode(&frame.payload)?);
            }
            Some(&KIND_PIXELS) => {
                let offset = read_u32(&frame.payload, TYPE_TAG_LEN + 1, "pixel offset")?;
                index.insert(frame.sequence, offset as u64);
            }
            _ => {}
        }
    }
    let header = header.ok_or(RasterError::HeaderLost)?;
    let total = header.image_size();

    let mut sink = PixelSink {
        store,
        pixels: vec![0u8; total as usize],
        events,
    };
    let stats = walk_offsets(&index, 0, total, &mut sink)?;

    Ok((
        RasterImage {
            header,
            pixels: sink.pixels,
        },
        stats,
    ))
}

struct PixelSink<'a> {
    store: &'a FrameStore,
    pixels: Vec<u8>,
    events: &'a EventSink,
}

impl OffsetSink for PixelSink<'_> {
    type Error = RasterError;

    fn copy(&mut self, seq: u16, offset: u64) -> Result<u64, RasterError> {
        let Some(frame) = self.store.get(seq) else {
            return Ok(0);
        };
        let mut pos = offset as usize;
        for segment in Segments::new(&frame.payload[PIXEL_PREFIX.min(frame.payload.len())..]) {
            if pos >= self.pixels.len() {
                break;
            }
            pos += decompress_into(segment, &mut self.pixels[pos..])?;
        }
        Ok(pos as u64 - offset)
    }

    fn fill(&mut self, seq: u16, offset: u64, len: u64) -> Result<(), RasterError> {
        self.pixels[offset as usize..(offset + len) as usize].fill(0);
        self.events.emit(TransferEvent::GapFilled {
            sequence: seq,
            offset,
            len,
        });
        Ok(())
    }
}
