/// Sender: read, encode, hold, send.
///
/// ```text
/// [Read file] ---> [Encode] ---> [Hold] ---> [Send]
/// SHA-256          by extension  countdown   seq 0..n, one frame each
///                  raw fallback              no resend
/// ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::codec::{CodecKind, general, media, raster};
use crate::error::{MediaError, SendError};
use crate::logging::{EventSink, TransferEvent, TransferLogger};
use crate::protocol::{Frame, MAX_FRAMES};
use crate::transport::{FrameKind, RateHint, Transport};

/// Configuration for one send.
#[derive(Clone)]
pub struct SenderConfig {
    pub input_path: PathBuf,
    /// Request name the receiver announced
    pub request_name: String,
    pub rate: RateHint,
    /// Pause before the first frame so the receiver can get ready
    pub hold: Duration,
    pub logger: Option<Arc<dyn TransferLogger>>,
}

impl SenderConfig {
    pub fn new(input_path: impl Into<PathBuf>, request_name: impl Into<String>) -> Self {
        Self {
            input_path: input_path.into(),
            request_name: request_name.into(),
            rate: RateHint::Adaptive,
            hold: Duration::ZERO,
            logger: None,
        }
    }
}

/// Result of a completed send.
#[derive(Debug, Clone)]
pub struct SendReport {
    /// Codec actually used, after any fallback
    pub codec: CodecKind,
    pub frames: usize,
    /// Payload bytes handed to the transport
    pub bytes: u64,
    pub input_sha256: String,
}

/// Run one send. Blocks through the hold and until every frame is handed off.
pub fn run_sender<T: Transport + ?Sized>(
    transport: &T,
    config: SenderConfig,
) -> Result<SendReport, SendError> {
    let events = EventSink::new("sender", &config.request_name, config.logger.clone());
    let data = std::fs::read(&config.input_path).map_err(|source| SendError::Input {
        path: config.input_path.clone(),
        source,
    })?;
    let input_sha256 = hex::encode(Sha256::digest(&data));

    let (codec, payloads) = encode(CodecKind::from_path(&config.input_path), &data, &events)?;
    check_sequence_space(payloads.len())?;
    debug!(
        codec = %codec,
        frames = payloads.len(),
        input_bytes = data.len(),
        "input encoded"
    );

    hold(config.hold, &events);

    let start = Instant::now();
    let frames = payloads.len();
    let mut bytes: u64 = 0;
    for (seq, payload) in payloads.into_iter().enumerate() {
        let frame = Frame::new(seq as u16, payload)?;
        transport.send(
            FrameKind::Data,
            config.rate,
            frame.sequence,
            &frame.payload,
            &config.request_name,
        )?;
        bytes += frame.payload.len() as u64;
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    events.emit(TransferEvent::FramesSent {
        codec,
        frames,
        bytes,
        duration_ms,
    });
    info!(
        codec = %codec,
        frames,
        bytes,
        duration_ms,
        sha256 = %input_sha256,
        "send complete"
    );

    Ok(SendReport {
        codec,
        frames,
        bytes,
        input_sha256,
    })
}

/// Fragment `data` with the requested codec. A media input that is not a
/// usable container goes out on the general path instead.
pub(crate) fn encode(
    codec: CodecKind,
    data: &[u8],
    events: &EventSink,
) -> Result<(CodecKind, Vec<Vec<u8>>), SendError> {
    match codec {
        CodecKind::General => Ok((CodecKind::General, general::fragment(data))),
        CodecKind::Raster => Ok((CodecKind::Raster, raster::encode(data)?)),
        CodecKind::Media => match media::encode(data) {
            Ok(frames) => Ok((CodecKind::Media, frames)),
            Err(
                e @ (MediaError::NotAContainer
                | MediaError::TruncatedBox { .. }
                | MediaError::BoxTooLarge { .. }
                | MediaError::FileTypeTooLarge { .. }),
            ) => {
                events.emit(TransferEvent::FallbackToGeneral {
                    reason: e.to_string(),
                });
                Ok((CodecKind::General, general::fragment(data)))
            }
            Err(e) => Err(e.into()),
        },
    }
}

fn check_sequence_space(frames: usize) -> Result<(), SendError> {
    if frames > MAX_FRAMES {
        return Err(SendError::SequenceSpaceExhausted { frames });
    }
    Ok(())
}

/// Sleep for `hold`, reporting every whole second left.
fn hold(hold: Duration, events: &EventSink) {
    let mut remaining = hold;
    while remaining >= Duration::from_secs(1) {
        events.emit(TransferEvent::HoldCountdown {
            remaining_secs: remaining.as_secs(),
        });
        std::thread::sleep(Duration::from_secs(1));
        remaining -= Duration::from_secs(1);
    }
    if !remaining.is_zero() {
        std::thread::sleep(remaining);
    }
}
