/// Reception progress shared between the transport callback and the
/// persistence thread. All fields are atomic so the callback never takes a lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sentinel for "no frame observed yet" in the lowest-sequence slot.
const UNSET: u32 = u32::MAX;

/// Observed sequence bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    /// Sequence of the first frame to arrive (not the numeric minimum).
    pub lowest: u16,
    /// Highest sequence seen so far.
    pub highest: u16,
}

pub struct SequenceTracker {
    lowest: AtomicU32,
    highest: AtomicU32,
    started: AtomicBool,
    frames: AtomicU64,
    bytes: AtomicU64,
    /// Nanoseconds from `origin` to the most recent arrival.
    last_arrival: AtomicU64,
    origin: Instant,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self {
            lowest: AtomicU32::new(UNSET),
            highest: AtomicU32::new(0),
            started: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            last_arrival: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    /// Record one arrival. Called from the transport callback.
    pub fn observe(&self, sequence: u16, len: usize) {
        let _ = self.lowest.compare_exchange(
            UNSET,
            sequence as u32,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        self.highest.fetch_max(sequence as u32, Ordering::AcqRel);
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.last_arrival
            .store(self.origin.elapsed().as_nanos() as u64, Ordering::Release);
        self.started.store(true, Ordering::Release);
    }

    /// True once at least one frame has been observed.
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// `None` until the first frame arrives.
    pub fn range(&self) -> Option<SequenceRange> {
        let lowest = self.lowest.load(Ordering::Acquire);
        if lowest == UNSET {
            return None;
        }
        Some(SequenceRange {
            lowest: lowest as u16,
            highest: self.highest.load(Ordering::Acquire) as u16,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Time since the last arrival, or since construction if nothing arrived.
    pub fn silence(&self) -> Duration {
        let last = Duration::from_nanos(self.last_arrival.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Reception started and the channel has been quiet for at least `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.started() && self.silence() >= timeout
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
