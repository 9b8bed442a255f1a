// =============================================================================
// SYNAPSE NODE : discovery.rs
// Bootstrap connector and peer-exchange address book
// =============================================================================
//
// Both feed candidate addresses into `Network::connect`; neither dials on its
// own schedule. mDNS is not implemented.
// =============================================================================

use crate::error::NetworkError;
use crate::message::PeerRecord;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---- Bootstrap ----

pub struct BootstrapConnector {
    addresses: RwLock<Vec<String>>,
    connected: RwLock<HashSet<String>>,
    max_retries: u32,
    retry_delay: Duration,
}

impl BootstrapConnector {
    pub fn new(addresses: &[String], max_retries: u32, retry_delay: Duration) -> Self {
        let connector = BootstrapConnector {
            addresses: RwLock::new(Vec::new()),
            connected: RwLock::new(HashSet::new()),
            max_retries: max_retries.max(1),
            retry_delay,
        };
        for addr in addresses {
            connector.add_address(addr);
        }
        connector
    }

    /// Ignores duplicates and blanks.
    pub fn add_address(&self, address: &str) {
        let address = address.trim();
        if address.is_empty() {
            return;
        }
        let mut addrs = self.addresses.write();
        if !addrs.iter().any(|a| a == address) {
            addrs.push(address.to_string());
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.addresses.read().clone()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connected.read().contains(address)
    }

    pub fn connected_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.connected.read().iter().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Try every address with retries. Returns the number connected, or the
    /// last error if any address was given up on.
    pub async fn connect_all<F, Fut>(
        &self,
        connect: F,
        shutdown: &CancellationToken,
    ) -> Result<usize, NetworkError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), NetworkError>>,
    {
        let mut last_err = None;
        let mut connected = 0;

        for address in self.addresses() {
            match self.connect_with_retry(&address, &connect, shutdown).await {
                Ok(()) => connected += 1,
                Err(NetworkError::State(reason)) if shutdown.is_cancelled() => {
                    return Err(NetworkError::State(reason));
                }
                Err(e) => {
                    log::warn!("🔌 Bootstrap {} failed: {}", address, e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(connected),
        }
    }

    async fn connect_with_retry<F, Fut>(
        &self,
        address: &str,
        connect: &F,
        shutdown: &CancellationToken,
    ) -> Result<(), NetworkError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), NetworkError>>,
    {
        let mut last_err = NetworkError::state("bootstrap not attempted");
        for attempt in 1..=self.max_retries {
            if shutdown.is_cancelled() {
                return Err(NetworkError::state("bootstrap cancelled"));
            }

            match connect(address.to_string()).await {
                Ok(()) => {
                    self.connected.write().insert(address.to_string());
                    log::info!("🔌 Bootstrap {} connected (attempt {})", address, attempt);
                    return Ok(());
                }
                Err(e) => {
                    log::debug!(
                        "🔌 Bootstrap {} attempt {}/{} failed: {}",
                        address,
                        attempt,
                        self.max_retries,
                        e
                    );
                    last_err = e;
                }
            }

            if attempt < self.max_retries {
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(NetworkError::state("bootstrap cancelled")),
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }
        Err(last_err)
    }
}

// ---- Peer exchange ----

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPeer {
    pub id: String,
    pub address: String,
    pub version: String,
    pub last_seen: i64,
    pub discovered_at: DateTime<Utc>,
}

pub struct PeerExchange {
    book: RwLock<HashMap<String, DiscoveredPeer>>,
    max_entries: usize,
}

impl PeerExchange {
    pub fn new(max_entries: usize) -> Self {
        PeerExchange {
            book: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Returns true if the record was stored or refreshed.
    pub fn record(&self, peer: &PeerRecord) -> bool {
        if peer.id.is_empty() || peer.address.is_empty() {
            return false;
        }
        let mut book = self.book.write();
        if let Some(existing) = book.get_mut(&peer.id) {
            existing.address = peer.address.clone();
            existing.version = peer.version.clone();
            existing.last_seen = existing.last_seen.max(peer.last_seen);
            return true;
        }
        if book.len() >= self.max_entries {
            return false;
        }
        book.insert(
            peer.id.clone(),
            DiscoveredPeer {
                id: peer.id.clone(),
                address: peer.address.clone(),
                version: peer.version.clone(),
                last_seen: peer.last_seen,
                discovered_at: Utc::now(),
            },
        );
        true
    }

    /// Most recently seen first.
    pub fn candidates(&self, limit: usize) -> Vec<DiscoveredPeer> {
        let mut all: Vec<DiscoveredPeer> = self.book.read().values().cloned().collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        all.truncate(limit);
        all
    }

    pub fn remove(&self, peer_id: &str) -> Option<DiscoveredPeer> {
        self.book.write().remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.book.read().contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.book.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
