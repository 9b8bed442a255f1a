// =============================================================================
// SYNAPSE NODE : pool.rs
// Live connections, authenticated peers, idle eviction
// =============================================================================
//
//   ConnectionPool
//   ├── connections: conn_id -> Arc<Connection>   (capacity-enforced)
//   └── peers:       peer_id -> Arc<Peer>         (Weak back-ref to its Connection)
//
// The sweep is the only path that reclaims sockets whose peer never says
// goodbye. Removal is idempotent so teardown, sweep and failed handshakes
// may all race on the same id.
// =============================================================================

use crate::error::NetworkError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

// ---- Connection ----

pub struct Connection {
    id: String,
    remote_addr: SocketAddr,
    direction: Direction,
    peer_id: OnceLock<String>,
    writer: tokio::sync::Mutex<FrameWriter>,
    created_at: Instant,
    last_seen: Mutex<Instant>,
    token: CancellationToken,
}

impl Connection {
    pub fn new<W>(
        writer: W,
        remote_addr: SocketAddr,
        direction: Direction,
        token: CancellationToken,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let now = Instant::now();
        Arc::new(Connection {
            id: uuid::Uuid::new_v4().to_string(),
            remote_addr,
            direction,
            peer_id: OnceLock::new(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            created_at: now,
            last_seen: Mutex::new(now),
            token,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Set once the handshake verifies; later calls are ignored.
    pub fn set_peer_id(&self, peer_id: &str) -> bool {
        self.peer_id.set(peer_id.to_string()).is_ok()
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.get().map(String::as_str)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn is_active(&self, timeout: Duration) -> bool {
        self.idle_for() < timeout
    }

    /// Token the reader task selects on.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the reader; the socket closes once the last handle drops.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    pub async fn send_frame(&self, frame: &[u8], timeout: Duration) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::state("connection closed"));
        }

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result.map_err(NetworkError::from),
            Err(_) => Err(NetworkError::Timeout(format!("write to {}", self.remote_addr))),
        }
    }

    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

// ---- Peer ----

pub struct Peer {
    id: String,
    address: RwLock<String>,
    version: RwLock<String>,
    connected_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    connection: Weak<Connection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: String,
    pub address: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub direction: Option<Direction>,
}

impl Peer {
    pub fn new(id: &str, address: &str, version: &str, connection: &Arc<Connection>) -> Self {
        Peer {
            id: id.to_string(),
            address: RwLock::new(address.to_string()),
            version: RwLock::new(version.to_string()),
            connected_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            connection: Arc::downgrade(connection),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    pub fn set_address(&self, address: &str) {
        *self.address.write() = address.to_string();
    }

    pub fn version(&self) -> String {
        self.version.read().clone()
    }

    pub fn set_version(&self, version: &str) {
        *self.version.write() = version.to_string();
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn owns(&self, conn_id: &str) -> bool {
        self.connection().map_or(false, |c| c.id() == conn_id)
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen.lock().elapsed() < timeout
    }

    pub fn last_seen_unix(&self) -> i64 {
        let idle = self.last_seen.lock().elapsed().as_secs() as i64;
        Utc::now().timestamp() - idle
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            address: self.address(),
            version: self.version(),
            connected_at: self.connected_at,
            idle_secs: self.last_seen.lock().elapsed().as_secs(),
            direction: self.connection().map(|c| c.direction()),
        }
    }
}

// ---- Pool ----

pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    max_connections: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_connections: usize, idle_timeout: Duration) -> Self {
        ConnectionPool {
            connections: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            max_connections,
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn add_connection(&self, conn: Arc<Connection>) -> Result<(), NetworkError> {
        let mut conns = self.connections.write();
        if conns.len() >= self.max_connections {
            return Err(NetworkError::Capacity(format!(
                "connection pool full ({}/{})",
                conns.len(),
                self.max_connections
            )));
        }
        conns.insert(conn.id().to_string(), conn);
        Ok(())
    }

    /// Idempotent. Closes the connection if it was still pooled.
    pub fn remove_connection(&self, conn_id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(conn_id);
        if let Some(conn) = &removed {
            conn.close();
        }
        removed
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_full(&self) -> bool {
        self.connection_count() >= self.max_connections
    }

    /// Registers a peer, returning whatever entry it displaced.
    pub fn add_peer(&self, peer: Peer) -> Option<Arc<Peer>> {
        self.peers.write().insert(peer.id().to_string(), Arc::new(peer))
    }

    pub fn remove_peer(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.write().remove(peer_id)
    }

    /// Remove `peer_id` only while it is still bound to `conn_id`.
    pub fn remove_peer_if_owned(&self, peer_id: &str, conn_id: &str) -> bool {
        let mut peers = self.peers.write();
        let owned = peers.get(peer_id).map_or(false, |p| p.owns(conn_id));
        if owned {
            peers.remove(peer_id);
        }
        owned
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn clear_peers(&self) {
        self.peers.write().clear();
    }

    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Connection>> = self.connections.write().drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.close();
        }
        drained.len()
    }

    /// One eviction pass. Returns the ids that were closed.
    pub fn sweep_inactive(&self) -> Vec<String> {
        let stale: Vec<Arc<Connection>> = {
            let mut conns = self.connections.write();
            let ids: Vec<String> = conns
                .values()
                .filter(|c| !c.is_active(self.idle_timeout))
                .map(|c| c.id().to_string())
                .collect();
            ids.iter().filter_map(|id| conns.remove(id)).collect()
        };

        stale
            .into_iter()
            .map(|conn| {
                log::info!(
                    "🧹 Evicting idle connection {} ({}, idle {:?})",
                    conn.id(),
                    conn.remote_addr(),
                    conn.idle_for()
                );
                conn.close();
                conn.id().to_string()
            })
            .collect()
    }

    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep_inactive();
                    if !evicted.is_empty() {
                        log::info!("🧹 Sweep evicted {} connection(s)", evicted.len());
                    }
                }
            }
        }
    }
}
