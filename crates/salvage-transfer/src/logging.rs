/// Structured transfer events.
///
/// Sender and receiver report lifecycle milestones through a
/// `TransferLogger`, so callers can route them to `tracing`, collect them
/// in tests, or drop them.

use std::fmt;

use crate::codec::CodecKind;

/// Structured log entry for one transfer.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub request: String,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sender: pre-send hold, one per remaining second
    HoldCountdown { remaining_secs: u64 },
    /// Sender: every frame handed to the transport
    FramesSent {
        codec: CodecKind,
        frames: usize,
        bytes: u64,
        duration_ms: u64,
    },
    /// Sender: structured encode rejected, raw fragmentation used instead
    FallbackToGeneral { reason: String },
    /// Receiver: announce frame sent for the named request
    AnnounceSent,
    /// Receiver: first frame arrived
    ReceptionStarted { first_sequence: u16 },
    /// Receiver: channel silent past the idle timeout
    ReceptionIdle {
        frames: u64,
        bytes: u64,
        lowest: u16,
        highest: u16,
        duplicates: u64,
    },
    /// Receiver: codec chosen from the first-arrival frame
    CodecSelected { codec: CodecKind },
    /// Receiver: zero-filled gap for an absent sequence
    GapFilled {
        sequence: u16,
        offset: u64,
        len: u64,
    },
    /// Receiver: media metadata reassembled
    MetadataRecovered { sub_sequences: u32, bytes: usize },
    /// Receiver: media metadata incomplete, output abandoned
    MetadataLost { expected: usize, actual: usize },
    /// Receiver: reconstructed file written
    OutputWritten {
        path: String,
        bytes: u64,
        filled_bytes: u64,
        loss_pct: f64,
    },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HoldCountdown { remaining_secs } => {
                write!(f, "hold remaining_secs={}", remaining_secs)
            }
            Self::FramesSent { codec, frames, bytes, duration_ms } => {
                write!(
                    f,
                    "frames_sent codec={} frames={} bytes={} duration_ms={}",
                    codec, frames, bytes, duration_ms
                )
            }
            Self::FallbackToGeneral { reason } => {
                write!(f, "fallback_to_general reason={}", reason)
            }
            Self::AnnounceSent => write!(f, "announce_sent"),
            Self::ReceptionStarted { first_sequence } => {
                write!(f, "reception_started first_seq={}", first_sequence)
            }
            Self::ReceptionIdle { frames, bytes, lowest, highest, duplicates } => {
                write!(
                    f,
                    "reception_idle frames={} bytes={} lowest={} highest={} duplicates={}",
                    frames, bytes, lowest, highest, duplicates
                )
            }
            Self::CodecSelected { codec } => write!(f, "codec_selected codec={}", codec),
            Self::GapFilled { sequence, offset, len } => {
                write!(f, "gap_filled seq={} offset={} len={}", sequence, offset, len)
            }
            Self::MetadataRecovered { sub_sequences, bytes } => {
                write!(f, "metadata_recovered sub_seqs={} bytes={}", sub_sequences, bytes)
            }
            Self::MetadataLost { expected, actual } => {
                write!(f, "metadata_lost expected={} actual={}", expected, actual)
            }
            Self::OutputWritten { path, bytes, filled_bytes, loss_pct } => {
                write!(
                    f,
                    "output_written path={} bytes={} filled={} loss={:.1}%",
                    path, bytes, filled_bytes, loss_pct
                )
            }
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Sink for transfer events.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Per-gap and countdown entries go to debug, lifecycle to info
        match &entry.event {
            TransferEvent::GapFilled { .. } | TransferEvent::HoldCountdown { .. } => {
                tracing::debug!(
                    component = entry.component,
                    request = %entry.request,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::MetadataLost { .. }
            | TransferEvent::FallbackToGeneral { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(
                    component = entry.component,
                    request = %entry.request,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    request = %entry.request,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Emits events for one request on behalf of a component.
#[derive(Clone)]
pub(crate) struct EventSink {
    component: &'static str,
    request: String,
    logger: Option<std::sync::Arc<dyn TransferLogger>>,
}

impl EventSink {
    pub(crate) fn new(
        component: &'static str,
        request: &str,
        logger: Option<std::sync::Arc<dyn TransferLogger>>,
    ) -> Self {
        Self {
            component,
            request: request.to_string(),
            logger,
        }
    }

    /// A sink that drops everything.
    pub(crate) fn silent() -> Self {
        Self::new("", "", None)
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        if let Some(logger) = &self.logger {
            logger.log(TransferLog {
                component: self.component,
                request: self.request.clone(),
                event,
            });
        }
    }
}
