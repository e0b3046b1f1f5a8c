//! Peer reputation and delivery-rate tracking.
//!
//! `PeerScore` holds decaying misbehaviour points and decides when a peer
//! is dropped. `RateTracker` keeps per request kind throughput and
//! round-trip estimates for the request distributor.

use crate::penalties::{Penalties, PenaltyReason};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Weight of a new measurement in the rate estimates.
const MEASUREMENT_IMPACT: f64 = 0.1;

/// Throughput assumed for a peer that has not delivered anything yet.
pub const DEFAULT_THROUGHPUT: f64 = 16.0;

/// Misbehaviour points of one peer. Points decay linearly from the last
/// offence.
#[derive(Debug, Clone)]
pub struct PeerScore {
    points: u32,
    last_offence: Instant,
    offences: HashMap<PenaltyReason, u32>,
}

impl Default for PeerScore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerScore {
    pub fn new() -> Self {
        Self {
            points: 0,
            last_offence: Instant::now(),
            offences: HashMap::new(),
        }
    }

    /// Points left after decay.
    pub fn current_penalty(&self) -> u32 {
        let minutes = self.last_offence.elapsed().as_secs() / 60;
        let decayed = u32::try_from(minutes)
            .unwrap_or(u32::MAX)
            .saturating_mul(Penalties::DECAY_PER_MINUTE);
        self.points.saturating_sub(decayed)
    }

    /// Record an offence. Returns `true` once the peer should be dropped.
    pub fn apply_penalty(&mut self, reason: PenaltyReason) -> bool {
        self.points = self
            .current_penalty()
            .saturating_add(reason.penalty())
            .min(Penalties::MAX_PENALTY);
        self.last_offence = Instant::now();
        *self.offences.entry(reason).or_default() += 1;
        self.should_drop()
    }

    pub fn should_drop(&self) -> bool {
        self.current_penalty() >= Penalties::DROP_THRESHOLD
    }

    /// How often `reason` was recorded, regardless of decay.
    pub fn offences(&self, reason: PenaltyReason) -> u32 {
        self.offences.get(&reason).copied().unwrap_or(0)
    }
}

/// Throughput and round-trip estimate for one request kind.
#[derive(Debug, Clone, Copy)]
pub struct RateTracker {
    /// Items delivered per second.
    throughput: f64,
    /// Round-trip estimate.
    rtt: Duration,
    samples: u64,
}

impl Default for RateTracker {
    fn default() -> Self {
        Self {
            throughput: DEFAULT_THROUGHPUT,
            rtt: Duration::from_secs(1),
            samples: 0,
        }
    }
}

impl RateTracker {
    /// Fold in a completed request of `items` items that took `elapsed`.
    /// An empty delivery counts as zero throughput.
    pub fn update(&mut self, items: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(0.001);
        let measured = items as f64 / secs;
        if self.samples == 0 {
            self.throughput = measured;
            self.rtt = elapsed;
        } else {
            self.throughput =
                (1.0 - MEASUREMENT_IMPACT) * self.throughput + MEASUREMENT_IMPACT * measured;
            let rtt = (1.0 - MEASUREMENT_IMPACT) * self.rtt.as_secs_f64()
                + MEASUREMENT_IMPACT * elapsed.as_secs_f64();
            self.rtt = Duration::from_secs_f64(rtt);
        }
        self.samples += 1;
    }

    pub fn throughput(&self) -> f64 {
        self.throughput
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    /// Items this peer can be expected to serve within `target` round trip,
    /// clamped to `1..=max`.
    pub fn capacity(&self, target: Duration, max: usize) -> usize {
        let items = (self.throughput * target.as_secs_f64()).round() as usize;
        items.clamp(1, max.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_score() {
        let score = PeerScore::new();
        assert_eq!(score.current_penalty(), 0);
        assert!(!score.should_drop());
    }

    #[test]
    fn test_penalties_accumulate_to_drop() {
        let mut score = PeerScore::new();
        assert!(!score.apply_penalty(PenaltyReason::SlowResponse));
        assert_eq!(score.current_penalty(), Penalties::SLOW_RESPONSE);

        let mut dropped = false;
        for _ in 0..50 {
            dropped = score.apply_penalty(PenaltyReason::MissingResponse);
        }
        assert!(dropped);
        assert_eq!(score.offences(PenaltyReason::MissingResponse), 50);
        assert_eq!(score.offences(PenaltyReason::SlowResponse), 1);
    }

    #[test]
    fn test_penalty_decay() {
        let mut score = PeerScore::new();
        score.apply_penalty(PenaltyReason::InvalidHeader);
        score.last_offence = Instant::now() - Duration::from_secs(60 * 5);
        assert_eq!(score.current_penalty(), 50);

        score.last_offence = Instant::now() - Duration::from_secs(60 * 15);
        assert_eq!(score.current_penalty(), 0);
        assert_eq!(score.offences(PenaltyReason::InvalidHeader), 1);
    }

    #[test]
    fn test_critical_drops_immediately() {
        let mut score = PeerScore::new();
        assert!(score.apply_penalty(PenaltyReason::CheckpointMismatch));
    }

    #[test]
    fn test_rate_tracker_moves_towards_measurements() {
        let mut rate = RateTracker::default();
        rate.update(100, Duration::from_secs(1));
        assert!((rate.throughput() - 100.0).abs() < 1e-9);

        rate.update(0, Duration::from_secs(1));
        assert!((rate.throughput() - 90.0).abs() < 1e-9);
        assert_eq!(rate.capacity(Duration::from_secs(2), 128), 128);
        assert_eq!(rate.capacity(Duration::from_millis(100), 128), 9);
    }
}
