//! End-to-end transfers over the in-memory lossy link.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use salvage_transfer::codec::{media, raster};
use salvage_transfer::{
    CodecKind, MediaError, ReceiveError, ReceiveReport, ReceiverConfig, SendReport, SenderConfig,
    SimConfig, SimTransport, TransferEvent, TransferLog, TransferLogger, run_receiver, run_sender,
};
use sha2::{Digest, Sha256};

struct Collect(Mutex<Vec<TransferLog>>);

impl TransferLogger for Collect {
    fn log(&self, entry: TransferLog) {
        self.0.lock().push(entry);
    }
}

struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("salvage_e2e_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    fn input(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn output(&self) -> PathBuf {
        self.dir.join("received").join("out")
    }

    fn staging(&self) -> PathBuf {
        self.dir.join("staging")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn noise(len: usize, mut x: u32) -> Vec<u8> {
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x as u8
        })
        .collect()
}

fn receiver_config(ws: &Workspace, name: &str) -> ReceiverConfig {
    let mut config = ReceiverConfig::new(name, ws.output());
    config.staging_dir = ws.staging();
    config.idle_timeout = Duration::from_millis(300);
    config.poll_interval = Duration::from_millis(10);
    config.start_timeout = Some(Duration::from_secs(10));
    config
}

/// Run sender and receiver concurrently over one link.
fn transfer(
    sim: &Arc<SimTransport>,
    input: &Path,
    rx_config: ReceiverConfig,
) -> (SendReport, Result<ReceiveReport, ReceiveError>) {
    let name = rx_config.request_name.clone();
    std::thread::scope(|s| {
        let receiver = s.spawn(|| run_receiver(sim, rx_config));
        let sent = run_sender(sim, SenderConfig::new(input, name)).unwrap();
        sim.flush();
        (sent, receiver.join().unwrap())
    })
}

fn boxed(kind: &[u8; 4], content: &[u8]) -> Vec<u8> {
    let mut b = ((content.len() + 8) as u32).to_be_bytes().to_vec();
    b.extend_from_slice(kind);
    b.extend_from_slice(content);
    b
}

struct Clip {
    file: Vec<u8>,
    ftyp: Vec<u8>,
    mdat: Vec<u8>,
    moov: Vec<u8>,
}

fn clip() -> Clip {
    let ftyp = boxed(b"ftyp", b"qt  \x00\x00\x02\x00qt  ");
    let mdat = boxed(b"mdat", &noise(30_000, 11));
    let mut meta: Vec<u8> = (0..4000u32)
        .flat_map(|i| format!("stsz{:06}", i * 7 % 3001).into_bytes())
        .collect();
    meta.extend(noise(2000, 5));
    let moov = boxed(b"moov", &meta);
    let file = [ftyp.clone(), mdat.clone(), moov.clone()].concat();
    Clip {
        file,
        ftyp,
        mdat,
        moov,
    }
}

/// Sequences of the metadata frames, split by pass.
fn metadata_passes(file: &[u8]) -> (Vec<u16>, Vec<u16>) {
    let frames = media::encode(file).unwrap();
    let meta: Vec<u16> = frames
        .iter()
        .enumerate()
        .filter(|(_, f)| &f[7..11] == b"moov")
        .map(|(i, _)| i as u16)
        .collect();
    let half = meta.len() / 2;
    (meta[..half].to_vec(), meta[half..].to_vec())
}

fn test_image() -> Vec<u8> {
    // noise keeps every pixel frame to a single window
    raster::encode_png(&raster::RasterImage {
        header: raster::RasterHeader::new(3, 2, 80, 60),
        pixels: noise(80 * 60 * 3, 21),
    })
    .unwrap()
}

/// Start offsets of two consecutive pixel frames.
fn pixel_offsets(png: &[u8], seq: usize) -> (usize, usize) {
    let frames = raster::encode(png).unwrap();
    let offset = |f: &Vec<u8>| u32::from_le_bytes(f[4..8].try_into().unwrap()) as usize;
    (offset(&frames[seq]), offset(&frames[seq + 1]))
}

#[test]
fn test_general_lossless() {
    let ws = Workspace::new("general");
    let data = noise(10_000, 1);
    let input = ws.input("report.bin", &data);
    let sim = SimTransport::new(SimConfig::perfect());

    let (sent, received) = transfer(&sim, &input, receiver_config(&ws, "report"));
    let received = received.unwrap();

    assert_eq!(sent.codec, CodecKind::General);
    assert_eq!(received.codec, CodecKind::General);
    assert_eq!(std::fs::read(ws.output()).unwrap(), data);
    assert_eq!(sent.input_sha256, received.output_sha256);
    assert!(received.stats.is_lossless());
}

#[test]
fn test_general_gap_shortens_output() {
    let ws = Workspace::new("general_gap");
    let data = noise(4000, 2);
    let input = ws.input("notes.txt", &data);
    let sim = SimTransport::new(SimConfig::dropping([1]));

    let (sent, received) = transfer(&sim, &input, receiver_config(&ws, "notes"));
    let received = received.unwrap();

    assert_eq!(sent.frames, 4);
    assert_eq!(received.output_bytes, 2976);
    let out = std::fs::read(ws.output()).unwrap();
    assert_eq!(&out[..1024], &data[..1024]);
    assert_eq!(&out[1024..], &data[2048..]);
}

#[test]
fn test_reordered_and_duplicated_general() {
    let ws = Workspace::new("reorder");
    let data = noise(50_000, 3);
    let input = ws.input("blob.dat", &data);
    let sim = SimTransport::new(SimConfig {
        reorder_window: 16,
        duplicate_all: true,
        seed: 9,
        ..SimConfig::default()
    });

    let (sent, received) = transfer(&sim, &input, receiver_config(&ws, "blob"));
    let received = received.unwrap();

    assert_eq!(std::fs::read(ws.output()).unwrap(), data);
    assert_eq!(received.frames, 2 * sent.frames as u64);
    assert_eq!(received.duplicates, sent.frames as u64);
}

#[test]
fn test_raster_lossless() {
    let ws = Workspace::new("raster");
    let png = test_image();
    let input = ws.input("photo.png", &png);
    let sim = SimTransport::new(SimConfig {
        reorder_window: 4,
        seed: 1,
        ..SimConfig::default()
    });

    let (sent, received) = transfer(&sim, &input, receiver_config(&ws, "photo"));
    let received = received.unwrap();

    assert_eq!(sent.codec, CodecKind::Raster);
    assert_eq!(received.codec, CodecKind::Raster);
    assert!(received.stats.is_lossless());
    let original = raster::decode_png(&png).unwrap();
    let rebuilt = raster::decode_png(&std::fs::read(ws.output()).unwrap()).unwrap();
    assert_eq!(rebuilt, original);
}

#[test]
fn test_raster_lost_frame_zero_filled() {
    let ws = Workspace::new("raster_gap");
    let png = test_image();
    let input = ws.input("photo.png", &png);
    let sim = SimTransport::new(SimConfig::dropping([2]));

    let (_, received) = transfer(&sim, &input, receiver_config(&ws, "photo"));
    let received = received.unwrap();

    let (from, to) = pixel_offsets(&png, 2);
    assert_eq!(to - from, raster::window_size(3));
    assert_eq!(received.stats.filled_bytes, (to - from) as u64);
    let original = raster::decode_png(&png).unwrap();
    let rebuilt = raster::decode_png(&std::fs::read(ws.output()).unwrap()).unwrap();
    assert_eq!(rebuilt.header.width, 80);
    assert_eq!(rebuilt.pixels.len(), original.pixels.len());
    assert!(rebuilt.pixels[from..to].iter().all(|&b| b == 0));
    assert_eq!(&rebuilt.pixels[..from], &original.pixels[..from]);
    assert_eq!(&rebuilt.pixels[to..], &original.pixels[to..]);
}

#[test]
fn test_media_lossless() {
    let ws = Workspace::new("media");
    let clip = clip();
    let input = ws.input("movie.MOV", &clip.file);
    let sim = SimTransport::new(SimConfig::perfect());
    let log = Arc::new(Collect(Mutex::new(Vec::new())));
    let mut config = receiver_config(&ws, "movie");
    config.logger = Some(log.clone());

    let (sent, received) = transfer(&sim, &input, config);
    let received = received.unwrap();

    assert_eq!(sent.codec, CodecKind::Media);
    assert_eq!(received.codec, CodecKind::Media);
    let expected = [clip.ftyp, media::PADDING_BOX.to_vec(), clip.mdat, clip.moov].concat();
    let out = std::fs::read(ws.output()).unwrap();
    assert_eq!(out, expected);
    assert_eq!(received.output_sha256, hex::encode(Sha256::digest(&expected)));
    assert!(
        log.0
            .lock()
            .iter()
            .any(|e| matches!(e.event, TransferEvent::MetadataRecovered { .. }))
    );
    assert!(!ws.staging().join("movie.payload").exists());
}

#[test]
fn test_media_survives_lost_metadata_pass() {
    let ws = Workspace::new("media_pass");
    let clip = clip();
    let (first_pass, _) = metadata_passes(&clip.file);
    let input = ws.input("movie.mp4", &clip.file);
    let sim = SimTransport::new(SimConfig::dropping(first_pass));

    let (_, received) = transfer(&sim, &input, receiver_config(&ws, "movie"));
    let received = received.unwrap();

    let out = std::fs::read(ws.output()).unwrap();
    assert!(out.ends_with(&clip.moov));
    assert!(received.stats.is_lossless());
}

#[test]
fn test_media_structural_loss() {
    let ws = Workspace::new("media_lost");
    let clip = clip();
    let (first_pass, second_pass) = metadata_passes(&clip.file);
    let input = ws.input("movie.mp4", &clip.file);
    let sim = SimTransport::new(SimConfig::dropping([first_pass[0], second_pass[0]]));

    let (_, received) = transfer(&sim, &input, receiver_config(&ws, "movie"));
    let err = received.unwrap_err();

    assert!(err.is_structural_loss());
    assert!(matches!(err, ReceiveError::Media(MediaError::MetadataLost { .. })));
    assert!(!ws.output().exists());
    for ext in ["frames", "payload", "metadata"] {
        assert!(!ws.staging().join(format!("movie.{}", ext)).exists());
    }
    assert_eq!(sim.released_names(), vec!["movie".to_string()]);
}

#[test]
fn test_media_payload_gap() {
    let ws = Workspace::new("media_gap");
    let clip = clip();
    let (first_pass, second_pass) = metadata_passes(&clip.file);
    let first_payload = (first_pass.len() + second_pass.len()) as u16;
    let input = ws.input("movie.mp4", &clip.file);
    let sim = SimTransport::new(SimConfig::dropping([first_payload + 1]));

    let (_, received) = transfer(&sim, &input, receiver_config(&ws, "movie"));
    let received = received.unwrap();

    let out = std::fs::read(ws.output()).unwrap();
    assert_eq!(out.len(), clip.file.len() + media::PADDING_BOX.len());
    assert!(received.stats.filled_bytes > 0);
    assert!(received.stats.loss_pct() > 0.0);
}

#[test]
fn test_media_every_payload_frame_lost() {
    let ws = Workspace::new("media_nopayload");
    let clip = clip();
    let (first_pass, second_pass) = metadata_passes(&clip.file);
    let first_payload = (first_pass.len() + second_pass.len()) as u16;
    let total = media::encode(&clip.file).unwrap().len() as u16;
    let input = ws.input("movie.mp4", &clip.file);
    let sim = SimTransport::new(SimConfig::dropping(first_payload..total));

    let (_, received) = transfer(&sim, &input, receiver_config(&ws, "movie"));
    let received = received.unwrap();

    let zeroed = [clip.mdat[..8].to_vec(), vec![0; clip.mdat.len() - 8]].concat();
    let expected = [clip.ftyp, media::PADDING_BOX.to_vec(), zeroed, clip.moov].concat();
    assert_eq!(std::fs::read(ws.output()).unwrap(), expected);
    assert_eq!(received.stats.filled_bytes, 30_000);
    for ext in ["frames", "payload", "metadata"] {
        assert!(!ws.staging().join(format!("movie.{}", ext)).exists());
    }
}

#[test]
fn test_media_reordered_and_duplicated() {
    let ws = Workspace::new("media_reorder");
    let clip = clip();
    let input = ws.input("movie.mov", &clip.file);
    let sim = SimTransport::new(SimConfig {
        reorder_window: 12,
        duplicate_all: true,
        seed: 3,
        ..SimConfig::default()
    });

    let (sent, received) = transfer(&sim, &input, receiver_config(&ws, "movie"));
    let received = received.unwrap();

    let expected = [clip.ftyp, media::PADDING_BOX.to_vec(), clip.mdat, clip.moov].concat();
    assert_eq!(std::fs::read(ws.output()).unwrap(), expected);
    assert_eq!(received.duplicates, sent.frames as u64);
    assert!(received.stats.is_lossless());
}

#[test]
fn test_reception_ends_after_idle_timeout() {
    let ws = Workspace::new("idle");
    let input = ws.input("small.bin", &noise(3000, 4));
    let sim = SimTransport::new(SimConfig::perfect());
    let config = receiver_config(&ws, "small");
    let idle = config.idle_timeout;

    let finished = std::thread::scope(|s| {
        let receiver = s.spawn(|| {
            let report = run_receiver(&sim, config);
            (report, Instant::now())
        });
        std::thread::sleep(Duration::from_millis(50));
        run_sender(&sim, SenderConfig::new(&input, "small")).unwrap();
        let sent_at = Instant::now();
        let (report, done_at) = receiver.join().unwrap();
        report.unwrap();
        done_at.duration_since(sent_at)
    });

    assert!(finished >= idle - Duration::from_millis(50));
    assert!(finished < idle + Duration::from_secs(2));
}
