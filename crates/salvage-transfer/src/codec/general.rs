/// Raw fragmentation for anything that is not a raster image or media container.
///
/// Frames carry plain file bytes with no tag and no offset. Missing
/// sequences are skipped on reassembly, so every gap shortens the output.

use std::io::{self, Write};

use crate::codec::RecoveryStats;
use crate::logging::{EventSink, TransferEvent};
use crate::protocol::FRAME_PAYLOAD;
use crate::store::FrameStore;

/// Split `data` into frame payloads. The last one may be short.
pub fn fragment(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(FRAME_PAYLOAD).map(|c| c.to_vec()).collect()
}

/// Write every present frame from sequence 0 up to the highest stored one.
pub fn reassemble<W: Write>(store: &FrameStore, out: &mut W) -> io::Result<RecoveryStats> {
    reassemble_with(store, out, &EventSink::silent())
}

pub(crate) fn reassemble_with<W: Write>(
    store: &FrameStore,
    out: &mut W,
    events: &EventSink,
) -> io::Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    let Some(highest) = store.highest() else {
        return Ok(stats);
    };

    let mut written: u64 = 0;
    for seq in 0..=highest {
        match store.get(seq) {
            Some(frame) => {
                out.write_all(&frame.payload)?;
                written += frame.payload.len() as u64;
                stats.frames_used += 1;
            }
            None => {
                // Assume a full frame went missing
                stats.gaps += 1;
                stats.lost_bytes += FRAME_PAYLOAD as u64;
                events.emit(TransferEvent::GapFilled {
                    sequence: seq,
                    offset: written,
                    len: 0,
                });
            }
        }
    }
    stats.expected_bytes = written + stats.lost_bytes;
    Ok(stats)
}
