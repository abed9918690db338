/// Receiver: 2-stage pipeline, then single-threaded reconstruction.
///
/// ```text
/// [Transport callback] ---> [Persistence] ---> [Reconstruct]
/// filter by name            recv_timeout()     codec from first arrival
/// tracker.observe()         append to store    zero-fill gaps
/// unbounded send            idle -> exit       write output, SHA-256
/// ```
///
/// End of transmission is never signalled by the sender. The persistence
/// thread exits once the channel has been silent for `idle_timeout` after
/// at least one frame arrived. Reconstruction reads the frames back from
/// the staging log, not from the persistence thread's memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, unbounded};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::codec::{CodecKind, RecoveryStats, general, media, raster};
use crate::error::ReceiveError;
use crate::logging::{EventSink, TransferEvent, TransferLogger};
use crate::protocol::{Frame, IDLE_TIMEOUT, POLL_INTERVAL};
use crate::store::{FrameStore, Staging};
use crate::tracker::{SequenceRange, SequenceTracker};
use crate::transport::{FrameKind, RateHint, Transport};

/// Configuration for one receive.
#[derive(Clone)]
pub struct ReceiverConfig {
    /// Request name announced to the sender; also filters inbound frames
    pub request_name: String,
    pub output_path: PathBuf,
    pub staging_dir: PathBuf,
    /// Silence after the last frame that ends reception
    pub idle_timeout: Duration,
    /// Persistence thread poll interval on an empty queue
    pub poll_interval: Duration,
    /// Give up if no frame arrives at all within this window (None = wait forever)
    pub start_timeout: Option<Duration>,
    /// Rate hint attached to the announce frame
    pub rate: RateHint,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl ReceiverConfig {
    pub fn new(request_name: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            request_name: request_name.into(),
            output_path: output_path.into(),
            staging_dir: PathBuf::from("staging"),
            idle_timeout: IDLE_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            start_timeout: None,
            rate: RateHint::Adaptive,
            logger: None,
        }
    }
}

/// Outcome of a completed receive.
#[derive(Debug, Clone)]
pub struct ReceiveReport {
    pub codec: CodecKind,
    /// Frames accepted by the callback, duplicates included
    pub frames: u64,
    pub bytes: u64,
    pub range: SequenceRange,
    pub duplicates: u64,
    pub stats: RecoveryStats,
    pub output_bytes: u64,
    pub output_sha256: String,
}

/// Run one receive. Blocks until the channel goes idle and the output is written.
///
/// The request name is released on every exit path. Staging files are
/// removed on success, on structural loss (see
/// [`ReceiveError::is_structural_loss`]) and when nothing arrived; other
/// failures leave them in place for inspection.
pub fn run_receiver<T: Transport + ?Sized>(
    transport: &T,
    config: ReceiverConfig,
) -> Result<ReceiveReport, ReceiveError> {
    let events = EventSink::new("receiver", &config.request_name, config.logger.clone());
    let staging = match Staging::create(&config.staging_dir, &config.request_name) {
        Ok(staging) => staging,
        Err(e) => {
            transport.release(&config.request_name);
            return Err(e.into());
        }
    };

    let result = receive(transport, &config, &staging, &events);
    transport.release(&config.request_name);

    match &result {
        Ok(_) => cleanup(&staging),
        Err(e) if e.is_structural_loss() || matches!(e, ReceiveError::NothingReceived { .. }) => {
            events.emit(TransferEvent::Error {
                message: e.to_string(),
            });
            cleanup(&staging);
        }
        Err(e) => {
            events.emit(TransferEvent::Error {
                message: e.to_string(),
            });
            warn!(
                staging = %config.staging_dir.display(),
                "receive failed, staging files kept"
            );
        }
    }
    result
}

fn cleanup(staging: &Staging) {
    if let Err(e) = staging.cleanup() {
        warn!(error = %e, "staging cleanup failed");
    }
}

fn receive<T: Transport + ?Sized>(
    transport: &T,
    config: &ReceiverConfig,
    staging: &Staging,
    events: &EventSink,
) -> Result<ReceiveReport, ReceiveError> {
    let name = config.request_name.clone();
    let mut store = FrameStore::create(&staging.frames_path())?;
    let tracker = Arc::new(SequenceTracker::new());
    let stop = Arc::new(AtomicBool::new(false));
    let (frame_tx, frame_rx) = unbounded::<Frame>();

    // ── Stage 1: Transport callback ────────────────────────────────────
    let tracker_cb = tracker.clone();
    let name_cb = name.clone();
    transport.register(Box::new(move |inbound| {
        if inbound.kind != FrameKind::Data || inbound.name != name_cb {
            return;
        }
        let frame = match Frame::new(inbound.sequence, inbound.payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(sequence = inbound.sequence, error = %e, "oversized frame dropped");
                return;
            }
        };
        tracker_cb.observe(frame.sequence, frame.payload.len());
        // Receiver gone: reception already finished
        let _ = frame_tx.send(frame);
    }));

    // ── Stage 2: Persistence ───────────────────────────────────────────
    let tracker_p = tracker.clone();
    let stop_p = stop.clone();
    let events_p = events.clone();
    let idle_timeout = config.idle_timeout;
    let poll_interval = config.poll_interval;
    let start_timeout = config.start_timeout;
    let persistence = std::thread::spawn(move || -> Result<FrameStore, ReceiveError> {
        let waiting_since = Instant::now();
        loop {
            match frame_rx.recv_timeout(poll_interval) {
                Ok(frame) => {
                    if store.is_empty() {
                        events_p.emit(TransferEvent::ReceptionStarted {
                            first_sequence: frame.sequence,
                        });
                    }
                    store.append(frame)?;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if tracker_p.is_idle(idle_timeout) || stop_p.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Some(limit) = start_timeout {
                        let waited = waiting_since.elapsed();
                        if !tracker_p.started() && waited >= limit {
                            return Err(ReceiveError::NothingReceived {
                                waited_ms: waited.as_millis() as u64,
                            });
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        store.flush()?;
        Ok(store)
    });

    let announced = transport.send(
        FrameKind::Announce,
        config.rate,
        0,
        name.as_bytes(),
        &name,
    );
    match announced {
        Ok(()) => events.emit(TransferEvent::AnnounceSent),
        Err(e) => {
            stop.store(true, Ordering::Relaxed);
            let _ = persistence.join();
            return Err(e.into());
        }
    }

    let persisted = persistence
        .join()
        .map_err(|_| ReceiveError::PersistencePanicked)??
        .appended();
    let store = FrameStore::load(&staging.frames_path())?;
    debug!(persisted, replayed = store.appended(), "staging log replayed");
    let waited_ms = tracker.silence().as_millis() as u64;
    let (Some(range), Some(first)) = (
        tracker.range(),
        tracker.range().and_then(|r| store.get(r.lowest)),
    ) else {
        return Err(ReceiveError::NothingReceived { waited_ms });
    };

    events.emit(TransferEvent::ReceptionIdle {
        frames: tracker.frames(),
        bytes: tracker.bytes(),
        lowest: range.lowest,
        highest: range.highest,
        duplicates: store.duplicates(),
    });

    // ── Reconstruction ─────────────────────────────────────────────────
    let codec = CodecKind::from_tag(first.type_tag());
    events.emit(TransferEvent::CodecSelected { codec });

    let start = Instant::now();
    let mut output = Vec::new();
    let stats = match codec {
        CodecKind::General => general::reassemble_with(&store, &mut output, events)
            .map_err(|source| output_error(&config.output_path, source))?,
        CodecKind::Raster => {
            let (image, stats) = raster::reconstruct_with(&store, events)?;
            output = raster::encode_png(&image)?;
            stats
        }
        CodecKind::Media => media::reconstruct_with(&store, staging, &mut output, events)?,
    };
    let duplicates = store.duplicates();
    drop(store);

    write_output(&config.output_path, &output)?;
    let output_sha256 = hex::encode(Sha256::digest(&output));

    events.emit(TransferEvent::OutputWritten {
        path: config.output_path.display().to_string(),
        bytes: output.len() as u64,
        filled_bytes: stats.filled_bytes,
        loss_pct: stats.loss_pct(),
    });
    info!(
        codec = %codec,
        frames = tracker.frames(),
        gaps = stats.gaps,
        loss_pct = format_args!("{:.1}", stats.loss_pct()),
        duration_ms = start.elapsed().as_millis() as u64,
        sha256 = %output_sha256,
        "receive complete"
    );

    Ok(ReceiveReport {
        codec,
        frames: tracker.frames(),
        bytes: tracker.bytes(),
        range,
        duplicates,
        stats,
        output_bytes: output.len() as u64,
        output_sha256,
    })
}

fn output_error(path: &Path, source: std::io::Error) -> ReceiveError {
    ReceiveError::Output {
        path: path.to_path_buf(),
        source,
    }
}

fn write_output(path: &Path, data: &[u8]) -> Result<(), ReceiveError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| output_error(path, e))?;
    }
    std::fs::write(path, data).map_err(|e| output_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RasterError;
    use crate::sim::{SimConfig, SimTransport};

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("salvage_rx_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn config(dir: &Path, name: &str) -> ReceiverConfig {
        let mut config = ReceiverConfig::new(name, dir.join("out.bin"));
        config.staging_dir = dir.join("staging");
        config.idle_timeout = Duration::from_millis(150);
        config.poll_interval = Duration::from_millis(10);
        config.start_timeout = Some(Duration::from_secs(5));
        config
    }

    fn preload(sim: &SimTransport, name: &str, frames: &[Vec<u8>]) {
        for (seq, payload) in frames.iter().enumerate() {
            sim.send(FrameKind::Data, RateHint::Adaptive, seq as u16, payload, name)
                .unwrap();
        }
    }

    #[test]
    fn test_receives_backlogged_general_frames() {
        let dir = scratch("general");
        let data: Vec<u8> = (0..4000).map(|i| (i % 97) as u8).collect();
        let sim = SimTransport::new(SimConfig::dropping([1]));
        preload(&sim, "doc", &general::fragment(&data));

        let report = run_receiver(&sim, config(&dir, "doc")).unwrap();
        assert_eq!(report.codec, CodecKind::General);
        assert_eq!(report.frames, 3);
        assert_eq!(report.output_bytes, 2976);
        assert_eq!(report.range, SequenceRange { lowest: 0, highest: 3 });

        let written = std::fs::read(dir.join("out.bin")).unwrap();
        assert_eq!(written.len(), 2976);
        assert_eq!(report.output_sha256, hex::encode(Sha256::digest(&written)));
        assert!(!dir.join("staging").join("doc.frames").exists());
        assert_eq!(sim.announces(), vec!["doc".to_string()]);
        assert_eq!(sim.released_names(), vec!["doc".to_string()]);
    }

    #[test]
    fn test_other_requests_ignored() {
        let dir = scratch("filter");
        let sim = SimTransport::new(SimConfig::perfect());
        preload(&sim, "other", &[vec![9; 10]]);
        preload(&sim, "mine", &[vec![1; 10]]);

        let report = run_receiver(&sim, config(&dir, "mine")).unwrap();
        assert_eq!(report.frames, 1);
        assert_eq!(std::fs::read(dir.join("out.bin")).unwrap(), vec![1; 10]);
    }

    #[test]
    fn test_nothing_received() {
        let dir = scratch("silent");
        let sim = SimTransport::new(SimConfig::perfect());
        let mut config = config(&dir, "void");
        config.start_timeout = Some(Duration::from_millis(100));

        let err = run_receiver(&sim, config).unwrap_err();
        assert!(matches!(err, ReceiveError::NothingReceived { .. }));
        assert!(!dir.join("out.bin").exists());
        assert!(!dir.join("staging").join("void.frames").exists());
        assert_eq!(sim.released_names(), vec!["void".to_string()]);
    }

    #[test]
    fn test_lost_raster_header_cleans_staging() {
        let dir = scratch("noheader");
        let png = raster::encode_png(&raster::RasterImage {
            header: raster::RasterHeader::new(3, 2, 16, 16),
            pixels: (0..16 * 16 * 3).map(|i| (i % 251) as u8).collect(),
        })
        .unwrap();
        let frames = raster::encode(&png).unwrap();
        let sim = SimTransport::new(SimConfig::dropping([0]));
        preload(&sim, "pic", &frames);

        let err = run_receiver(&sim, config(&dir, "pic")).unwrap_err();
        assert!(matches!(err, ReceiveError::Raster(RasterError::HeaderLost)));
        assert!(err.is_structural_loss());
        assert!(!dir.join("out.bin").exists());
        assert!(!dir.join("staging").join("pic.frames").exists());
        assert_eq!(sim.released_names(), vec!["pic".to_string()]);
    }

    #[test]
    fn test_first_arrival_selects_codec() {
        let dir = scratch("firstarrival");
        let sim = SimTransport::new(SimConfig::perfect());
        // sequence 5 arrives first and carries no tag
        sim.send(FrameKind::Data, RateHint::Adaptive, 5, b"plain", "x").unwrap();
        sim.send(FrameKind::Data, RateHint::Adaptive, 0, b"PNG\x00junk", "x").unwrap();

        let report = run_receiver(&sim, config(&dir, "x")).unwrap();
        assert_eq!(report.codec, CodecKind::General);
        assert_eq!(report.range.lowest, 5);
        assert_eq!(report.range.highest, 5);
    }
}
