// =============================================================================
// SYNAPSE NODE : routing.rs
// Strategy-selectable route computation with a self-invalidating cache
// =============================================================================
//
//   Direct        → [target] if known, else []
//   Gossip        → top-3 ranked peers, target ignored
//   ShortestPath  → Direct if known, else top-2 ranked peers (placeholder)
//
// Cache: read lock hit, else write lock + second lookup before computing.
// The router observes the topology manager and drops the whole cache on any
// topology event.
// =============================================================================

use crate::topology::{ConnectionQuality, TopologyEvent, TopologyManager, TopologyObserver};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub const GOSSIP_FANOUT: usize = 3;
pub const FALLBACK_FANOUT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    #[default]
    Direct,
    Gossip,
    ShortestPath,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Direct => "direct",
            RoutingStrategy::Gossip => "gossip",
            RoutingStrategy::ShortestPath => "shortest-path",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(RoutingStrategy::Direct),
            "gossip" => Ok(RoutingStrategy::Gossip),
            "shortest-path" | "shortest_path" => Ok(RoutingStrategy::ShortestPath),
            other => Err(format!("unknown routing strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub target: String,
    pub strategy: RoutingStrategy,
    pub route: Vec<String>,
    pub from_cache: bool,
    pub decision_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub strategy: RoutingStrategy,
    pub cached_routes: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalidations: u64,
}

pub struct Router {
    topology: Arc<TopologyManager>,
    strategy: RwLock<RoutingStrategy>,
    route_cache: RwLock<HashMap<String, Vec<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl Router {
    /// Builds the router and subscribes it to `topology`.
    pub fn new(topology: Arc<TopologyManager>, strategy: RoutingStrategy) -> Arc<Self> {
        let router = Arc::new(Router {
            topology: Arc::clone(&topology),
            strategy: RwLock::new(strategy),
            route_cache: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        });
        let observer: Weak<dyn TopologyObserver> = Arc::downgrade(&router) as Weak<dyn TopologyObserver>;
        topology.subscribe(observer);
        router
    }

    pub fn strategy(&self) -> RoutingStrategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: RoutingStrategy) {
        *self.strategy.write() = strategy;
        self.invalidate();
        log::info!("🧭 Routing strategy set to {}", strategy);
    }

    fn compute(&self, strategy: RoutingStrategy, target: &str) -> Vec<String> {
        match strategy {
            RoutingStrategy::Direct => {
                if self.topology.contains(target) {
                    vec![target.to_string()]
                } else {
                    vec![]
                }
            }
            RoutingStrategy::Gossip => self.topology.get_best_peers(GOSSIP_FANOUT),
            RoutingStrategy::ShortestPath => {
                if self.topology.contains(target) {
                    vec![target.to_string()]
                } else {
                    self.topology.get_best_peers(FALLBACK_FANOUT)
                }
            }
        }
    }

    pub fn route(&self, target: &str) -> Vec<String> {
        self.lookup(target).0
    }

    fn lookup(&self, target: &str) -> (Vec<String>, bool) {
        if let Some(route) = self.route_cache.read().get(target) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (route.clone(), true);
        }

        let mut cache = self.route_cache.write();
        if let Some(route) = cache.get(target) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return (route.clone(), true);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let route = self.compute(self.strategy(), target);
        cache.insert(target.to_string(), route.clone());
        (route, false)
    }

    pub fn decide(&self, target: &str) -> RoutingDecision {
        let strategy = self.strategy();
        let (route, from_cache) = self.lookup(target);
        let decision_reason = if route.is_empty() {
            format!("No route to [{}] via {}", target, strategy)
        } else {
            format!(
                "Route {:?} via {} ({} hop(s)){}",
                route,
                strategy,
                route.len(),
                if from_cache { ", cached" } else { "" }
            )
        };
        RoutingDecision {
            target: target.to_string(),
            strategy,
            route,
            from_cache,
            decision_reason,
        }
    }

    pub fn invalidate(&self) {
        let mut cache = self.route_cache.write();
        if !cache.is_empty() {
            cache.clear();
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cached_routes(&self) -> usize {
        self.route_cache.read().len()
    }

    /// Overwrite latency/bandwidth for `peer_id`; loss and jitter are kept.
    pub fn record_measurement(&self, peer_id: &str, latency_ms: f64, bandwidth_mbps: f64) -> bool {
        self.topology.record_measurement(peer_id, latency_ms, bandwidth_mbps)
    }

    pub fn peer_quality(&self, peer_id: &str) -> Option<ConnectionQuality> {
        self.topology.get_peer_info(peer_id).map(|p| p.quality)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            strategy: self.strategy(),
            cached_routes: self.cached_routes(),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl TopologyObserver for Router {
    fn on_topology_event(&self, event: &TopologyEvent) {
        log::trace!("🧭 Route cache invalidated by {:?}", event);
        self.invalidate();
    }
}
