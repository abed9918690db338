/// Reconstruction codecs and the offset walk they share.

pub mod general;
pub mod media;
pub mod raster;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::protocol::TypeTag;

/// Which path a transfer takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Raster,
    Media,
    General,
}

impl CodecKind {
    /// Sender-side selection by file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png") => CodecKind::Raster,
            Some("mp4") | Some("mov") => CodecKind::Media,
            _ => CodecKind::General,
        }
    }

    /// Receiver-side selection by the first-arrival frame's tag.
    pub fn from_tag(tag: TypeTag) -> Self {
        match tag {
            TypeTag::Raster => CodecKind::Raster,
            TypeTag::Media => CodecKind::Media,
            TypeTag::General => CodecKind::General,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::Raster => "raster",
            CodecKind::Media => "media",
            CodecKind::General => "general",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a reconstruction recovered and what it had to make up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Size the reconstructed content should have had.
    pub expected_bytes: u64,
    /// Bytes known to be missing.
    pub lost_bytes: u64,
    /// Bytes replaced by zero filler (0 on the general path, which omits gaps).
    pub filled_bytes: u64,
    /// Distinct frames that contributed content.
    pub frames_used: u64,
    /// Holes filled (a run of consecutive absent sequences counts once).
    pub gaps: u64,
}

impl RecoveryStats {
    /// Best-effort loss percentage, 0.0 - 100.0.
    pub fn loss_pct(&self) -> f64 {
        if self.expected_bytes == 0 {
            return 0.0;
        }
        (self.lost_bytes as f64 / self.expected_bytes as f64 * 100.0).min(100.0)
    }

    pub fn is_lossless(&self) -> bool {
        self.lost_bytes == 0 && self.gaps == 0
    }

    pub(crate) fn absorb(&mut self, other: RecoveryStats) {
        self.expected_bytes += other.expected_bytes;
        self.lost_bytes += other.lost_bytes;
        self.filled_bytes += other.filled_bytes;
        self.frames_used += other.frames_used;
        self.gaps += other.gaps;
    }
}

/// Receives the steps of an offset walk.
pub(crate) trait OffsetSink {
    type Error;

    /// Place the content of present frame `seq` at `offset`; returns bytes written.
    fn copy(&mut self, seq: u16, offset: u64) -> Result<u64, Self::Error>;

    /// Write `len` zero bytes at `offset`. `seq` is the first absent
    /// sequence of the hole, or the present one it precedes.
    fn fill(&mut self, seq: u16, offset: u64, len: u64) -> Result<(), Self::Error>;
}

/// Walk present frames in ascending sequence, filling every hole in the
/// cumulative-offset space.
///
/// `index` maps each present sequence to the offset its content starts at.
/// The walk starts at `start`, stops once the cursor reaches `total`, and
/// finishes with a trailing fill up to `total`.
pub(crate) fn walk_offsets<S: OffsetSink>(
    index: &BTreeMap<u16, u64>,
    start: u16,
    total: u64,
    sink: &mut S,
) -> Result<RecoveryStats, S::Error> {
    let mut stats = RecoveryStats {
        expected_bytes: total,
        ..RecoveryStats::default()
    };
    let mut cursor: u64 = 0;
    let mut seq = start as u32;
    if let Some(last) = index.keys().next_back().map(|&s| s as u32) {
        while seq <= last && cursor < total {
            let s = seq as u16;
            match index.get(&s) {
                Some(&offset) => {
                    if offset > cursor {
                        let len = offset.min(total) - cursor;
                        sink.fill(s, cursor, len)?;
                        stats.filled_bytes += len;
                        stats.gaps += 1;
                        cursor += len;
                    }
                    let written = sink.copy(s, offset)?;
                    stats.frames_used += 1;
                    cursor = cursor.max(offset + written);
                    seq += 1;
                }
                None => {
                    let (next_seq, next_offset) = match index.range(s.saturating_add(1)..).next() {
                        Some((&n, &o)) => (n as u32, o.min(total)),
                        None => (last + 1, total),
                    };
                    if next_offset > cursor {
                        let len = next_offset - cursor;
                        sink.fill(s, cursor, len)?;
                        stats.filled_bytes += len;
                        stats.gaps += 1;
                        cursor = next_offset;
                    }
                    seq = next_seq;
                }
            }
        }
    }

    if cursor < total {
        let len = total - cursor;
        sink.fill(seq.min(u16::MAX as u32) as u16, cursor, len)?;
        stats.filled_bytes += len;
        stats.gaps += 1;
    }
    stats.lost_bytes = stats.filled_bytes;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    struct Buffer {
        sizes: BTreeMap<u16, usize>,
        out: Vec<u8>,
    }

    impl OffsetSink for Buffer {
        type Error = Infallible;

        fn copy(&mut self, seq: u16, offset: u64) -> Result<u64, Infallible> {
            let len = self.sizes[&seq];
            self.out[offset as usize..offset as usize + len].fill(seq as u8 + 1);
            Ok(len as u64)
        }

        fn fill(&mut self, _seq: u16, offset: u64, len: u64) -> Result<(), Infallible> {
            self.out[offset as usize..(offset + len) as usize].fill(0);
            Ok(())
        }
    }

    /// Run the walk over fixed-size chunks and materialise the output.
    fn materialise(
        chunks: &[(u16, u64, usize)],
        start: u16,
        total: u64,
    ) -> (Vec<u8>, RecoveryStats) {
        let index: BTreeMap<u16, u64> = chunks.iter().map(|&(s, o, _)| (s, o)).collect();
        let mut buffer = Buffer {
            sizes: chunks.iter().map(|&(s, _, l)| (s, l)).collect(),
            out: vec![0xEEu8; total as usize],
        };
        let stats = walk_offsets(&index, start, total, &mut buffer).unwrap();
        (buffer.out, stats)
    }

    #[test]
    fn test_codec_by_extension() {
        assert_eq!(CodecKind::from_path(Path::new("a/b/photo.PNG")), CodecKind::Raster);
        assert_eq!(CodecKind::from_path(Path::new("clip.mov")), CodecKind::Media);
        assert_eq!(CodecKind::from_path(Path::new("clip.mp4")), CodecKind::Media);
        assert_eq!(CodecKind::from_path(Path::new("notes.txt")), CodecKind::General);
        assert_eq!(CodecKind::from_path(Path::new("README")), CodecKind::General);
    }

    #[test]
    fn test_walk_without_loss() {
        let chunks = [(0, 0, 1024), (1, 1024, 1024), (2, 2048, 1024), (3, 3072, 928)];
        let (out, stats) = materialise(&chunks, 0, 4000);
        assert_eq!(out.len(), 4000);
        assert!(stats.is_lossless());
        assert_eq!(stats.frames_used, 4);
        assert!(out[..1024].iter().all(|&b| b == 1));
        assert!(out[3072..].iter().all(|&b| b == 4));
    }

    #[test]
    fn test_middle_gap_filled_exactly() {
        let chunks = [(0, 0, 1024), (2, 2048, 1024), (3, 3072, 928)];
        let (out, stats) = materialise(&chunks, 0, 4000);
        assert_eq!(out.len(), 4000);
        assert!(out[1024..2048].iter().all(|&b| b == 0));
        assert!(out[2048..3072].iter().all(|&b| b == 3));
        assert_eq!(stats.filled_bytes, 1024);
        assert_eq!(stats.gaps, 1);
        assert!((stats.loss_pct() - 25.6).abs() < 1e-9);
    }

    #[test]
    fn test_run_of_gaps_is_one_fill() {
        let chunks = [(0, 0, 100), (4, 400, 100)];
        let (out, stats) = materialise(&chunks, 0, 500);
        assert!(out[100..400].iter().all(|&b| b == 0));
        assert_eq!(stats.filled_bytes, 300);
        assert_eq!(stats.gaps, 1);
    }

    #[test]
    fn test_leading_and_trailing_gaps() {
        // first two and last frame lost
        let chunks = [(12, 200, 100)];
        let (out, stats) = materialise(&chunks, 12, 400);
        assert!(out[..200].iter().all(|&b| b == 0));
        assert!(out[200..300].iter().all(|&b| b == 13));
        assert!(out[300..].iter().all(|&b| b == 0));
        assert_eq!(stats.filled_bytes, 300);
        assert_eq!(stats.gaps, 2);
    }

    #[test]
    fn test_nothing_present_fills_everything() {
        let (out, stats) = materialise(&[], 0, 300);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(stats.filled_bytes, 300);
        assert!((stats.loss_pct() - 100.0).abs() < 1e-9);
    }
}
