// =============================================================================
// SYNAPSE NODE : topology.rs
// Per-peer quality and reputation model, ranking, topology classification
// =============================================================================
//
// Quality score (each term clamped to [0,1], NaN → 0):
//
//   q = w_lat · 1/(1+latency_s)
//     + w_bw  · min(bw_mbps/100, 1)
//     + w_pl  · (1 − min(loss_pct/100, 1))
//     + w_jit · 1/(1+jitter_s)
//
// Rank score = w_q · q + w_rep · reputation      (ties → peer id ascending)
//
// Mutations notify observers after the write lock is released.
// =============================================================================

use crate::constants::{DEFAULT_MAX_PEERS, DEFAULT_MESH_THRESHOLD};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

pub const REPUTATION_MIN: f64 = -1.0;
pub const REPUTATION_MAX: f64 = 1.0;
pub const REPUTATION_SMOOTHING: f64 = 0.7; // weight kept from the old value

pub const DEFAULT_LATENCY_MS: f64 = 1000.0;
pub const DEFAULT_BANDWIDTH_MBPS: f64 = 1.0;
pub const DEFAULT_JITTER_MS: f64 = 10.0;

// ---- Quality ----

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub packet_loss_pct: f64,
    pub jitter_ms: f64,
    pub last_update: DateTime<Utc>,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        ConnectionQuality {
            latency_ms: DEFAULT_LATENCY_MS,
            bandwidth_mbps: DEFAULT_BANDWIDTH_MBPS,
            packet_loss_pct: 0.0,
            jitter_ms: DEFAULT_JITTER_MS,
            last_update: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub latency: f64,
    pub bandwidth: f64,
    pub packet_loss: f64,
    pub jitter: f64,
    pub quality: f64,
    pub reputation: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        ScoringWeights {
            latency: 0.3,
            bandwidth: 0.3,
            packet_loss: 0.2,
            jitter: 0.2,
            quality: 0.7,
            reputation: 0.3,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), String> {
        let all = [
            ("latency", self.latency),
            ("bandwidth", self.bandwidth),
            ("packet_loss", self.packet_loss),
            ("jitter", self.jitter),
            ("quality", self.quality),
            ("reputation", self.reputation),
        ];
        for (name, w) in all {
            if !w.is_finite() || w < 0.0 {
                return Err(format!("weight {} must be finite and non-negative, got {}", name, w));
            }
        }
        Ok(())
    }
}

fn unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

fn clamp_reputation(x: f64) -> f64 {
    x.clamp(REPUTATION_MIN, REPUTATION_MAX)
}

pub fn quality_score(q: &ConnectionQuality, w: &ScoringWeights) -> f64 {
    let latency = unit(1.0 / (1.0 + q.latency_ms / 1000.0));
    let bandwidth = unit((q.bandwidth_mbps / 100.0).min(1.0));
    let loss = unit(1.0 - (q.packet_loss_pct / 100.0).min(1.0));
    let jitter = unit(1.0 / (1.0 + q.jitter_ms / 1000.0));

    unit(w.latency * latency + w.bandwidth * bandwidth + w.packet_loss * loss + w.jitter * jitter)
}

// ---- Peer model ----

#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub quality: ConnectionQuality,
    pub reputation: f64,
    pub connected: bool,
    pub load: f64,
}

impl PeerInfo {
    fn new(id: &str, address: &str) -> Self {
        PeerInfo {
            id: id.to_string(),
            address: address.to_string(),
            quality: ConnectionQuality::default(),
            reputation: 0.0,
            connected: true,
            load: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TopologyType {
    #[serde(rename = "star")]
    Star,
    #[serde(rename = "full-mesh")]
    FullMesh,
    #[serde(rename = "partial-mesh")]
    PartialMesh,
}

impl TopologyType {
    pub fn classify(peer_count: usize, mesh_threshold: usize) -> Self {
        if peer_count <= 3 {
            TopologyType::Star
        } else if peer_count <= mesh_threshold {
            TopologyType::FullMesh
        } else {
            TopologyType::PartialMesh
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyType::Star => "star",
            TopologyType::FullMesh => "full-mesh",
            TopologyType::PartialMesh => "partial-mesh",
        }
    }
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkMetrics {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub topology_type: TopologyType,
    pub average_latency_ms: f64,
    pub average_bandwidth_mbps: f64,
    pub max_peers: usize,
}

// ---- Change notification ----

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    PeerAdded(String),
    PeerRemoved(String),
    QualityUpdated(String),
    ReputationUpdated(String),
    LoadUpdated(String),
    ConnectivityChanged { peer_id: String, connected: bool },
    Cleared,
}

pub trait TopologyObserver: Send + Sync {
    fn on_topology_event(&self, event: &TopologyEvent);
}

// ---- Manager ----

pub struct TopologyManager {
    peers: RwLock<HashMap<String, PeerInfo>>,
    observers: RwLock<Vec<Weak<dyn TopologyObserver>>>,
    weights: ScoringWeights,
    mesh_threshold: usize,
    max_peers: usize,
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new(ScoringWeights::default(), DEFAULT_MESH_THRESHOLD, DEFAULT_MAX_PEERS)
    }
}

impl TopologyManager {
    pub fn new(weights: ScoringWeights, mesh_threshold: usize, max_peers: usize) -> Self {
        TopologyManager {
            peers: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            weights,
            mesh_threshold,
            max_peers,
        }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn subscribe(&self, observer: Weak<dyn TopologyObserver>) {
        self.observers.write().push(observer);
    }

    fn notify(&self, event: TopologyEvent) {
        let live: Vec<Arc<dyn TopologyObserver>> = {
            let mut observers = self.observers.write();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in live {
            observer.on_topology_event(&event);
        }
    }

    /// Insert with default quality, or mark an existing entry reconnected.
    pub fn add_peer(&self, peer_id: &str, address: &str) {
        {
            let mut peers = self.peers.write();
            peers
                .entry(peer_id.to_string())
                .and_modify(|p| {
                    p.address = address.to_string();
                    p.connected = true;
                })
                .or_insert_with(|| PeerInfo::new(peer_id, address));
        }
        log::debug!("🗺️ Topology: peer [{}] added ({})", peer_id, address);
        self.notify(TopologyEvent::PeerAdded(peer_id.to_string()));
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        let removed = self.peers.write().remove(peer_id).is_some();
        if removed {
            self.notify(TopologyEvent::PeerRemoved(peer_id.to_string()));
        }
        removed
    }

    pub fn clear(&self) {
        self.peers.write().clear();
        self.notify(TopologyEvent::Cleared);
    }

    fn modify<F>(&self, peer_id: &str, event: TopologyEvent, f: F) -> bool
    where
        F: FnOnce(&mut PeerInfo),
    {
        let found = match self.peers.write().get_mut(peer_id) {
            Some(info) => {
                f(info);
                true
            }
            None => false,
        };
        if found {
            self.notify(event);
        }
        found
    }

    pub fn update_peer_quality(&self, peer_id: &str, quality: ConnectionQuality) -> bool {
        self.modify(peer_id, TopologyEvent::QualityUpdated(peer_id.to_string()), |p| {
            p.quality = quality;
        })
    }

    /// Overwrite latency and bandwidth, keeping loss and jitter.
    pub fn record_measurement(&self, peer_id: &str, latency_ms: f64, bandwidth_mbps: f64) -> bool {
        self.modify(peer_id, TopologyEvent::QualityUpdated(peer_id.to_string()), |p| {
            p.quality.latency_ms = latency_ms;
            p.quality.bandwidth_mbps = bandwidth_mbps;
            p.quality.last_update = Utc::now();
        })
    }

    /// Record a round trip: latency ← rtt, jitter ← |rtt − previous latency|.
    pub fn record_rtt(&self, peer_id: &str, rtt_ms: f64) -> bool {
        self.modify(peer_id, TopologyEvent::QualityUpdated(peer_id.to_string()), |p| {
            p.quality.jitter_ms = (rtt_ms - p.quality.latency_ms).abs();
            p.quality.latency_ms = rtt_ms;
            p.quality.last_update = Utc::now();
        })
    }

    pub fn update_peer_reputation(&self, peer_id: &str, reputation: f64) -> bool {
        self.adjust_reputation(peer_id, |_| reputation).is_some()
    }

    /// Read-modify-write of one reputation under the write lock.
    /// A NaN result leaves the old value in place.
    pub fn adjust_reputation<F>(&self, peer_id: &str, f: F) -> Option<f64>
    where
        F: FnOnce(f64) -> f64,
    {
        let updated = {
            let mut peers = self.peers.write();
            let info = peers.get_mut(peer_id)?;
            let next = f(info.reputation);
            if !next.is_nan() {
                info.reputation = clamp_reputation(next);
            }
            info.reputation
        };
        self.notify(TopologyEvent::ReputationUpdated(peer_id.to_string()));
        Some(updated)
    }

    /// newRep = clamp(0.7·old + 0.3·signal)
    pub fn apply_reputation_signal(&self, peer_id: &str, signal: f64) -> Option<f64> {
        self.adjust_reputation(peer_id, |old| {
            REPUTATION_SMOOTHING * old + (1.0 - REPUTATION_SMOOTHING) * signal
        })
    }

    pub fn decay_reputation(&self, peer_id: &str, rate: f64) -> Option<f64> {
        self.adjust_reputation(peer_id, |old| old * (1.0 - rate))
    }

    pub fn decay_all(&self, rate: f64) {
        let touched = {
            let mut peers = self.peers.write();
            for info in peers.values_mut() {
                let next = info.reputation * (1.0 - rate);
                if !next.is_nan() {
                    info.reputation = clamp_reputation(next);
                }
            }
            peers.len()
        };
        if touched > 0 {
            self.notify(TopologyEvent::ReputationUpdated("*".to_string()));
        }
    }

    pub fn update_peer_load(&self, peer_id: &str, load: f64) -> bool {
        self.modify(peer_id, TopologyEvent::LoadUpdated(peer_id.to_string()), |p| {
            p.load = load;
        })
    }

    pub fn set_peer_connected(&self, peer_id: &str, connected: bool) -> bool {
        let event = TopologyEvent::ConnectivityChanged {
            peer_id: peer_id.to_string(),
            connected,
        };
        self.modify(peer_id, event, |p| p.connected = connected)
    }

    pub fn get_peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .read()
            .values()
            .filter(|p| p.connected)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn score(&self, info: &PeerInfo) -> f64 {
        self.weights.quality * quality_score(&info.quality, &self.weights)
            + self.weights.reputation * info.reputation
    }

    /// Scored ids, best first, from one read-locked snapshot.
    pub fn ranked<F>(&self, keep: F) -> Vec<(String, f64)>
    where
        F: Fn(&PeerInfo) -> bool,
    {
        let mut scored: Vec<(String, f64)> = self
            .peers
            .read()
            .values()
            .filter(|p| keep(p))
            .map(|p| (p.id.clone(), self.score(p)))
            .collect();
        scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        scored
    }

    pub fn get_best_peers(&self, n: usize) -> Vec<String> {
        self.ranked(|_| true).into_iter().take(n).map(|(id, _)| id).collect()
    }

    pub fn get_optimal_peers_for_broadcast(&self, exclude: Option<&str>, max: usize) -> Vec<String> {
        self.ranked(|p| p.connected && Some(p.id.as_str()) != exclude)
            .into_iter()
            .take(max)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn topology_type(&self) -> TopologyType {
        TopologyType::classify(self.peer_count(), self.mesh_threshold)
    }

    pub fn network_metrics(&self) -> NetworkMetrics {
        let peers = self.peers.read();
        let total = peers.len();
        let (lat_sum, bw_sum) = peers.values().fold((0.0, 0.0), |(l, b), p| {
            (l + p.quality.latency_ms, b + p.quality.bandwidth_mbps)
        });
        let avg = |sum: f64| if total == 0 { 0.0 } else { sum / total as f64 };

        NetworkMetrics {
            total_peers: total,
            connected_peers: peers.values().filter(|p| p.connected).count(),
            topology_type: TopologyType::classify(total, self.mesh_threshold),
            average_latency_ms: avg(lat_sum),
            average_bandwidth_mbps: avg(bw_sum),
            max_peers: self.max_peers,
        }
    }
}
