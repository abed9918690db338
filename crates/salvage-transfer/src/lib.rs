/// Salvage: partial-recovery file transfer over a lossy frame transport.
///
/// Provides file transfer over an unreliable, 1024-byte-frame transport with:
/// - 2-thread receiver pipeline: transport callback → persistence
/// - Idle-timeout end-of-transmission detection (no terminator frame)
/// - Raster-image (PNG) reconstruction with zero-filled pixel gaps
/// - Media-container (MP4/MOV) reconstruction with redundant metadata passes
/// - Raw fallback fragmentation for everything else
/// - SHA-256 digests of sent input and written output

pub mod codec;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod sim;
pub mod store;
pub mod tracker;
pub mod transport;

// Re-export key types for convenience.
pub use codec::{CodecKind, RecoveryStats};
pub use error::{
    MediaError, ProtocolError, RasterError, ReceiveError, SendError, StoreError, TransportError,
};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use protocol::{FRAME_PAYLOAD, Frame, IDLE_TIMEOUT, MAX_FRAMES, POLL_INTERVAL, TypeTag};
pub use receiver::{ReceiveReport, ReceiverConfig, run_receiver};
pub use sender::{SendReport, SenderConfig, run_sender};
pub use sim::{SimConfig, SimStats, SimTransport};
pub use store::{FrameStore, Staging};
pub use tracker::{SequenceRange, SequenceTracker};
pub use transport::udp::UdpTransport;
pub use transport::{FrameHandler, FrameKind, InboundFrame, RateHint, Transport};
