//! In-memory lossy link.
//!
//! Delivers data frames straight to the registered handler on the sending
//! thread, after seeded loss and bounded reordering. Every effect comes
//! from a ChaCha8 RNG, so a given seed reproduces the same drops and the
//! same arrival order.
//!
//! Data frames sent before any handler registers are held back and
//! delivered on registration. Announce frames are recorded, not delivered.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::TransportError;
use crate::transport::{
    FrameHandler, FrameKind, InboundFrame, RateHint, SharedHandler, Transport, check_name,
};

/// Link impairments.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    /// Independent drop probability per data frame [0.0, 1.0]
    pub loss_rate: f64,
    /// Sequences always dropped, regardless of `loss_rate`
    pub drop_sequences: HashSet<u16>,
    /// Frames held back and released in random order (0 = in order)
    pub reorder_window: usize,
    /// Deliver every data frame twice
    pub duplicate_all: bool,
    pub seed: u64,
}

impl SimConfig {
    /// A link with no impairments.
    pub fn perfect() -> Self {
        Self::default()
    }

    pub fn dropping(sequences: impl IntoIterator<Item = u16>) -> Self {
        Self {
            drop_sequences: sequences.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Counters for one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
}

struct SimState {
    rng: ChaCha8Rng,
    /// Checked and backlogged under the same lock as `backlog`
    handler: Option<SharedHandler>,
    in_flight: Vec<InboundFrame>,
    backlog: Vec<InboundFrame>,
    announces: Vec<String>,
    released: HashSet<String>,
    stats: SimStats,
}

pub struct SimTransport {
    config: SimConfig,
    state: Mutex<SimState>,
}

impl SimTransport {
    pub fn new(config: SimConfig) -> Arc<Self> {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Arc::new(Self {
            config,
            state: Mutex::new(SimState {
                rng,
                handler: None,
                in_flight: Vec::new(),
                backlog: Vec::new(),
                announces: Vec::new(),
                released: HashSet::new(),
                stats: SimStats::default(),
            }),
        })
    }

    /// Deliver everything still held in the reorder window, in random order.
    pub fn flush(&self) {
        let drained = {
            let mut state = self.state.lock();
            let mut drained = std::mem::take(&mut state.in_flight);
            let n = drained.len();
            for i in (1..n).rev() {
                let j = state.rng.random_range(0..=i);
                drained.swap(i, j);
            }
            drained
        };
        for frame in drained {
            self.deliver(frame);
        }
    }

    /// Names announced by receivers, in order.
    pub fn announces(&self) -> Vec<String> {
        self.state.lock().announces.clone()
    }

    pub fn released_names(&self) -> Vec<String> {
        self.state.lock().released.iter().cloned().collect()
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    fn deliver(&self, frame: InboundFrame) {
        let mut state = self.state.lock();
        if state.released.contains(&frame.name) {
            return;
        }
        match state.handler.clone() {
            Some(handler) => {
                state.stats.delivered += 1;
                drop(state);
                handler(frame);
            }
            None => state.backlog.push(frame),
        }
    }
}

impl Transport for SimTransport {
    fn register(&self, handler: FrameHandler) {
        let handler: SharedHandler = Arc::from(handler);
        let backlog = {
            let mut state = self.state.lock();
            state.handler = Some(handler.clone());
            state.stats.delivered += state.backlog.len() as u64;
            std::mem::take(&mut state.backlog)
        };
        for frame in backlog {
            handler(frame);
        }
    }

    fn send(
        &self,
        kind: FrameKind,
        rate: RateHint,
        sequence: u16,
        payload: &[u8],
        name: &str,
    ) -> Result<(), TransportError> {
        check_name(name)?;
        let frame = InboundFrame {
            kind,
            encoding_hint: rate.to_byte() as u64,
            sequence,
            payload: payload.to_vec(),
            name: name.to_string(),
        };

        let ready = {
            let mut state = self.state.lock();
            if kind == FrameKind::Announce {
                state.announces.push(name.to_string());
                return Ok(());
            }
            state.stats.sent += 1;

            let dropped = self.config.drop_sequences.contains(&sequence)
                || (self.config.loss_rate > 0.0
                    && state.rng.random::<f64>() < self.config.loss_rate);
            if dropped {
                state.stats.dropped += 1;
                return Ok(());
            }

            let copies = if self.config.duplicate_all { 2 } else { 1 };
            let mut ready = Vec::new();
            for _ in 0..copies {
                if self.config.reorder_window == 0 {
                    ready.push(frame.clone());
                    continue;
                }
                state.in_flight.push(frame.clone());
                if state.in_flight.len() > self.config.reorder_window {
                    let n = state.in_flight.len();
                    let pick = state.rng.random_range(0..n);
                    ready.push(state.in_flight.swap_remove(pick));
                }
            }
            ready
        };

        for frame in ready {
            self.deliver(frame);
        }
        Ok(())
    }

    fn release(&self, name: &str) {
        self.state.lock().released.insert(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn collect(sim: &SimTransport) -> crossbeam_channel::Receiver<InboundFrame> {
        let (tx, rx) = unbounded();
        sim.register(Box::new(move |frame| {
            let _ = tx.send(frame);
        }));
        rx
    }

    fn send_n(sim: &SimTransport, n: u16) {
        for seq in 0..n {
            sim.send(FrameKind::Data, RateHint::Adaptive, seq, &[seq as u8], "f")
                .unwrap();
        }
    }

    #[test]
    fn test_drop_sequences() {
        let sim = SimTransport::new(SimConfig::dropping([1, 3]));
        let rx = collect(&sim);
        send_n(&sim, 5);
        let seqs: Vec<u16> = rx.try_iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![0, 2, 4]);
        assert_eq!(sim.stats().dropped, 2);
    }

    #[test]
    fn test_reorder_is_seeded_and_complete() {
        let run = |seed| {
            let sim = SimTransport::new(SimConfig {
                reorder_window: 8,
                seed,
                ..SimConfig::default()
            });
            let rx = collect(&sim);
            send_n(&sim, 50);
            sim.flush();
            rx.try_iter().map(|f| f.sequence).collect::<Vec<_>>()
        };
        let a = run(42);
        let b = run(42);
        assert_eq!(a, b);
        assert_ne!(a, (0..50).collect::<Vec<_>>());
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_backlog_until_registered() {
        let sim = SimTransport::new(SimConfig::perfect());
        send_n(&sim, 3);
        let rx = collect(&sim);
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn test_register_while_sending_loses_nothing() {
        for _ in 0..20 {
            let sim = SimTransport::new(SimConfig::perfect());
            let rx = std::thread::scope(|s| {
                s.spawn(|| send_n(&sim, 2000));
                collect(&sim)
            });
            assert_eq!(rx.try_iter().count(), 2000);
            assert_eq!(sim.stats().delivered, 2000);
        }
    }

    #[test]
    fn test_announce_recorded_and_release_filters() {
        let sim = SimTransport::new(SimConfig::perfect());
        let rx = collect(&sim);
        sim.send(FrameKind::Announce, RateHint::Adaptive, 0, b"f", "f").unwrap();
        assert_eq!(sim.announces(), vec!["f".to_string()]);
        assert_eq!(rx.try_iter().count(), 0);

        sim.release("f");
        send_n(&sim, 2);
        assert_eq!(rx.try_iter().count(), 0);
        assert_eq!(sim.released_names(), vec!["f".to_string()]);
    }

    #[test]
    fn test_random_loss_rate() {
        let sim = SimTransport::new(SimConfig {
            loss_rate: 0.5,
            seed: 7,
            ..SimConfig::default()
        });
        let rx = collect(&sim);
        send_n(&sim, 1000);
        let delivered = rx.try_iter().count();
        assert!((350..650).contains(&delivered), "delivered {}", delivered);
    }
}
