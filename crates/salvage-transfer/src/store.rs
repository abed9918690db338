/// Append-only staging of received frames.
///
/// Every frame handed to the store is written verbatim as a fixed-size
/// record, so the staging file is a replayable log of the reception:
///
/// ```text
/// [0..2]     Sequence (u16 LE)
/// [2..4]     Length (u16 LE)
/// [4..1028]  Payload, zero-padded to 1024 bytes
/// ```
///
/// Lookups by sequence return the earliest appended frame; later duplicates
/// are kept in the log but only counted in memory.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StoreError;
use crate::protocol::{FRAME_PAYLOAD, Frame};

/// Size of one persisted record.
pub const RECORD_SIZE: usize = 4 + FRAME_PAYLOAD;

fn encode_record(frame: &Frame, out: &mut [u8; RECORD_SIZE]) {
    out.fill(0);
    out[0..2].copy_from_slice(&frame.sequence.to_le_bytes());
    out[2..4].copy_from_slice(&frame.len().to_le_bytes());
    out[4..4 + frame.payload.len()].copy_from_slice(&frame.payload);
}

fn decode_record(record: &[u8; RECORD_SIZE], index: u64) -> Result<Frame, StoreError> {
    let sequence = u16::from_le_bytes([record[0], record[1]]);
    let len = u16::from_le_bytes([record[2], record[3]]) as usize;
    if len > FRAME_PAYLOAD {
        return Err(StoreError::CorruptRecord { index, len });
    }
    Ok(Frame {
        sequence,
        payload: record[4..4 + len].to_vec(),
    })
}

pub struct FrameStore {
    log: Option<BufWriter<File>>,
    frames: BTreeMap<u16, Frame>,
    appended: u64,
    duplicates: u64,
}

impl FrameStore {
    /// Create (truncating) a persisted store at `path`.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| StoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let mut store = Self::in_memory();
        store.log = Some(BufWriter::new(file));
        Ok(store)
    }

    /// A store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            log: None,
            frames: BTreeMap::new(),
            appended: 0,
            duplicates: 0,
        }
    }

    /// Rebuild a store from a staging log. The result is not writable.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let mut store = Self::in_memory();
        let mut record = [0u8; RECORD_SIZE];
        loop {
            match reader.read_exact(&mut record) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let frame = decode_record(&record, store.appended)?;
            store.insert(frame);
        }
        Ok(store)
    }

    /// Persist a frame and index it by sequence.
    pub fn append(&mut self, frame: Frame) -> Result<(), StoreError> {
        if let Some(log) = &mut self.log {
            let mut record = [0u8; RECORD_SIZE];
            encode_record(&frame, &mut record);
            log.write_all(&record)?;
        }
        self.insert(frame);
        Ok(())
    }

    fn insert(&mut self, frame: Frame) {
        self.appended += 1;
        match self.frames.entry(frame.sequence) {
            Entry::Vacant(slot) => {
                slot.insert(frame);
            }
            Entry::Occupied(_) => {
                self.duplicates += 1;
                debug!(seq = frame.sequence, "duplicate frame kept in log only");
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        if let Some(log) = &mut self.log {
            log.flush()?;
        }
        Ok(())
    }

    pub fn get(&self, sequence: u16) -> Option<&Frame> {
        self.frames.get(&sequence)
    }

    /// Distinct frames in ascending sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.values()
    }

    pub fn highest(&self) -> Option<u16> {
        self.frames.keys().next_back().copied()
    }

    /// Distinct sequences held.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Total records appended, duplicates included.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}

/// Per-request staging directory layout.
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
    name: String,
}

impl Staging {
    /// Ensure the staging directory exists.
    pub fn create(dir: &Path, name: &str) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Open {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
        })
    }

    pub fn frames_path(&self) -> PathBuf {
        self.dir.join(format!("{}.frames", self.name))
    }

    pub fn payload_path(&self) -> PathBuf {
        self.dir.join(format!("{}.payload", self.name))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(format!("{}.metadata", self.name))
    }

    /// Remove every staging file for this request. Missing files are fine.
    pub fn cleanup(&self) -> Result<(), StoreError> {
        for path in [self.frames_path(), self.payload_path(), self.metadata_path()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "staging file removed"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("salvage_store_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_earliest_append_wins() {
        let mut store = FrameStore::in_memory();
        store.append(Frame::new(3, vec![1, 2, 3]).unwrap()).unwrap();
        store.append(Frame::new(3, vec![9, 9]).unwrap()).unwrap();
        store.append(Frame::new(1, vec![4]).unwrap()).unwrap();

        assert_eq!(store.get(3).unwrap().payload, vec![1, 2, 3]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.appended(), 3);
        assert_eq!(store.duplicates(), 1);
        assert_eq!(store.highest(), Some(3));
        let seqs: Vec<u16> = store.iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn test_log_replay() {
        let dir = temp_dir("replay");
        let staging = Staging::create(&dir, "img").unwrap();

        let mut store = FrameStore::create(&staging.frames_path()).unwrap();
        store.append(Frame::new(0, vec![0xAB; FRAME_PAYLOAD]).unwrap()).unwrap();
        store.append(Frame::new(5, b"tail".to_vec()).unwrap()).unwrap();
        store.append(Frame::new(5, b"late".to_vec()).unwrap()).unwrap();
        store.flush().unwrap();

        let len = fs::metadata(staging.frames_path()).unwrap().len();
        assert_eq!(len, 3 * RECORD_SIZE as u64);

        let replayed = FrameStore::load(&staging.frames_path()).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed.duplicates(), 1);
        assert_eq!(replayed.get(5).unwrap().payload, b"tail");
        assert_eq!(replayed.get(0).unwrap().payload.len(), FRAME_PAYLOAD);

        staging.cleanup().unwrap();
        assert!(!staging.frames_path().exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let dir = temp_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.frames");
        let mut record = [0u8; RECORD_SIZE];
        record[2..4].copy_from_slice(&2000u16.to_le_bytes());
        fs::write(&path, record).unwrap();

        assert!(matches!(
            FrameStore::load(&path),
            Err(StoreError::CorruptRecord { index: 0, len: 2000 })
        ));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unopenable_target() {
        let dir = temp_dir("missing");
        let path = dir.join("nested").join("x.frames");
        assert!(matches!(FrameStore::create(&path), Err(StoreError::Open { .. })));
    }
}
