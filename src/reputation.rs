// =============================================================================
// SYNAPSE NODE : reputation.rs
// Reputation updates driven by behaviour, performance and reliability
// =============================================================================
//
// All inputs collapse to a signal in [-1, 1] which is then smoothed into the
// peer's stored reputation by the topology manager:
//
//   behaviour    signal = clamp(s)
//   performance  x = success · (1.2 if rt < 100ms | 0.8 if rt > 1s | 1.0)
//                signal = clamp(2x − 1)
//   reliability  signal = clamp(2·(0.6·uptime + 0.4·delivery) − 1)
//
// Rank 1..10 = clamp(⌊(rep + 1) · 5⌋, 1, 10)
// Tiers: Blacklisted → Suspect → Neutral → Reliable → Trusted
// =============================================================================

use crate::topology::{TopologyManager, REPUTATION_MAX, REPUTATION_MIN};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FAST_RESPONSE: Duration = Duration::from_millis(100);
pub const SLOW_RESPONSE: Duration = Duration::from_secs(1);
pub const FAST_BONUS: f64 = 1.2;
pub const SLOW_PENALTY: f64 = 0.8;
pub const UPTIME_WEIGHT: f64 = 0.6;
pub const DELIVERY_WEIGHT: f64 = 0.4;
pub const HISTORY_LIMIT: usize = 256; // recent events kept for inspection

pub const TRUSTED_THRESHOLD: f64 = 0.7;
pub const RELIABLE_THRESHOLD: f64 = 0.3;
pub const NEUTRAL_THRESHOLD: f64 = -0.3;
pub const SUSPECT_THRESHOLD: f64 = -0.7;

// -----------------------------------------------------------------------------
// ReputationTier
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReputationTier {
    Blacklisted, // < -0.7
    Suspect,     // -0.7 .. -0.3
    Neutral,     // -0.3 .. 0.3
    Reliable,    // 0.3 .. 0.7
    Trusted,     // >= 0.7
}

impl ReputationTier {
    pub fn from_score(score: f64) -> Self {
        if score >= TRUSTED_THRESHOLD { ReputationTier::Trusted }
        else if score >= RELIABLE_THRESHOLD { ReputationTier::Reliable }
        else if score >= NEUTRAL_THRESHOLD { ReputationTier::Neutral }
        else if score >= SUSPECT_THRESHOLD { ReputationTier::Suspect }
        else { ReputationTier::Blacklisted }
    }

    pub fn name(&self) -> &str {
        match self {
            ReputationTier::Blacklisted => "⛔ Blacklisted",
            ReputationTier::Suspect => "⚠️ Suspect",
            ReputationTier::Neutral => "⚪ Neutral",
            ReputationTier::Reliable => "🔵 Reliable",
            ReputationTier::Trusted => "🟢 Trusted",
        }
    }
}

// -----------------------------------------------------------------------------
// ReputationEvent
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ReputationEventKind {
    Behavior { signal: f64 },
    Performance { success_rate: f64, response_ms: u64 },
    Reliability { uptime_ratio: f64, delivery_rate: f64 },
    Decay { rate: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReputationEvent {
    pub peer_id: String,
    pub kind: ReputationEventKind,
    pub reputation: f64,
    pub timestamp: i64,
}

// -----------------------------------------------------------------------------
// ReputationSystem
// -----------------------------------------------------------------------------

fn clamp_signal(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(REPUTATION_MIN, REPUTATION_MAX)
    }
}

pub fn performance_signal(success_rate: f64, response_time: Duration) -> f64 {
    let mut score = success_rate;
    if response_time < FAST_RESPONSE {
        score *= FAST_BONUS;
    } else if response_time > SLOW_RESPONSE {
        score *= SLOW_PENALTY;
    }
    clamp_signal(2.0 * score - 1.0)
}

pub fn reliability_signal(uptime_ratio: f64, delivery_rate: f64) -> f64 {
    clamp_signal(2.0 * (UPTIME_WEIGHT * uptime_ratio + DELIVERY_WEIGHT * delivery_rate) - 1.0)
}

pub fn rank_of(reputation: f64) -> u8 {
    (((reputation + 1.0) * 5.0).floor() as i64).clamp(1, 10) as u8
}

pub struct ReputationSystem {
    topology: Arc<TopologyManager>,
    history: Mutex<VecDeque<ReputationEvent>>,
    total_events: AtomicU64,
}

impl ReputationSystem {
    pub fn new(topology: Arc<TopologyManager>) -> Self {
        ReputationSystem {
            topology,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            total_events: AtomicU64::new(0),
        }
    }

    fn record(&self, peer_id: &str, kind: ReputationEventKind, reputation: f64) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(ReputationEvent {
            peer_id: peer_id.to_string(),
            kind,
            reputation,
            timestamp: chrono::Utc::now().timestamp(),
        });
    }

    fn apply(&self, peer_id: &str, signal: f64, kind: ReputationEventKind) -> Option<f64> {
        let updated = self.topology.apply_reputation_signal(peer_id, signal)?;
        self.record(peer_id, kind, updated);
        Some(updated)
    }

    /// Returns the new reputation, or `None` for an unknown peer.
    pub fn record_behavior(&self, peer_id: &str, signal: f64) -> Option<f64> {
        let signal = clamp_signal(signal);
        self.apply(peer_id, signal, ReputationEventKind::Behavior { signal })
    }

    pub fn record_performance(
        &self,
        peer_id: &str,
        success_rate: f64,
        response_time: Duration,
    ) -> Option<f64> {
        let kind = ReputationEventKind::Performance {
            success_rate,
            response_ms: response_time.as_millis() as u64,
        };
        self.apply(peer_id, performance_signal(success_rate, response_time), kind)
    }

    pub fn record_reliability(
        &self,
        peer_id: &str,
        uptime_ratio: f64,
        delivery_rate: f64,
    ) -> Option<f64> {
        let kind = ReputationEventKind::Reliability { uptime_ratio, delivery_rate };
        self.apply(peer_id, reliability_signal(uptime_ratio, delivery_rate), kind)
    }

    pub fn decay(&self, peer_id: &str, rate: f64) -> Option<f64> {
        let updated = self.topology.decay_reputation(peer_id, rate)?;
        self.record(peer_id, ReputationEventKind::Decay { rate }, updated);
        Some(updated)
    }

    pub fn decay_all(&self, rate: f64) {
        self.topology.decay_all(rate);
        self.total_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reputation(&self, peer_id: &str) -> Option<f64> {
        self.topology.get_peer_info(peer_id).map(|p| p.reputation)
    }

    /// Ranked peers whose reputation is at least `threshold`.
    pub fn trusted_peers(&self, threshold: f64) -> Vec<String> {
        self.topology
            .ranked(|p| p.reputation >= threshold)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// 1..=10; unknown peers rank 1.
    pub fn rank(&self, peer_id: &str) -> u8 {
        self.reputation(peer_id).map_or(1, rank_of)
    }

    pub fn tier(&self, peer_id: &str) -> ReputationTier {
        ReputationTier::from_score(self.reputation(peer_id).unwrap_or(0.0))
    }

    pub fn history(&self, peer_id: &str) -> Vec<ReputationEvent> {
        self.history
            .lock()
            .iter()
            .filter(|e| e.peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> String {
        let peers = self.topology.ranked(|_| true);
        let trusted = peers
            .iter()
            .filter(|(id, _)| self.tier(id) == ReputationTier::Trusted)
            .count();
        let blacklisted = peers
            .iter()
            .filter(|(id, _)| self.tier(id) == ReputationTier::Blacklisted)
            .count();
        format!(
            "Peers: {}. Trusted: {}. Blacklisted: {}. Events: {}.",
            peers.len(),
            trusted,
            blacklisted,
            self.total_events()
        )
    }
}
