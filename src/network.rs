// =============================================================================
// SYNAPSE NODE : network.rs
// Listener, dialer, handshake driver, per-connection read loops, dispatch
// =============================================================================
//
// Per-connection lifecycle:
//
//   Accepted/Dialed ─▶ Handshaking ─▶ Authenticated ─▶ Streaming ─▶ Closed
//          │                │                               │
//          └── pool full ───┴──── verify / io failure ──────┴─▶ Closed
//
// Background tasks (all stop on the shared CancellationToken):
//   accept loop · pool sweeper · backlog dispatch · heartbeat (discovery only)
//
// Control messages (HELLO, HEARTBEAT, PEER_LIST, PING, PONG) are handled on
// the read loop. Everything else goes through a bounded backlog and is
// republished on a broadcast channel for the application.
//
// Rejected inbound sockets and undecodable frames get an ERROR envelope whose
// code comes from NetworkError::code().
// =============================================================================

use crate::config::{Config, P2pConfig};
use crate::constants::{
    local_capabilities, INBOX_CHANNEL_SIZE, MAX_PEER_LIST_SIZE, PROTOCOL_VERSION, STOP_GRACE,
    UNHEALTHY_AFTER_HEARTBEATS,
};
use crate::crypto::NodeIdentity;
use crate::discovery::{DiscoveredPeer, PeerExchange};
use crate::error::{CryptoError, NetworkError, ProtocolError, Result};
use crate::handshake::{HandshakeManager, HandshakeMessage};
use crate::message::{
    frame_codec, ErrorPayload, HeartbeatPayload, HelloPayload, Message, MessageBody, PeerListPayload,
    PeerRecord, PingPayload, PongPayload,
};
use crate::pool::{Connection, ConnectionPool, Direction, Peer, PeerSnapshot};
use crate::reputation::ReputationSystem;
use crate::routing::Router;
use crate::stats::{NetworkStats, StatsSnapshot};
use crate::topology::TopologyManager;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type FrameReader = FramedRead<OwnedReadHalf, AnyDelimiterCodec>;

pub const SEND_FAILURE_SIGNAL: f64 = -1.0;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn codec_error(e: AnyDelimiterCodecError, limit: usize) -> NetworkError {
    match e {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => ProtocolError::FrameTooLarge { limit }.into(),
        AnyDelimiterCodecError::Io(io) => NetworkError::Io(io),
    }
}

/// A handshake slot that holds an ERROR envelope means the remote refused us.
fn parse_handshake(line: &[u8]) -> Result<HandshakeMessage> {
    match serde_json::from_slice::<HandshakeMessage>(line) {
        Ok(msg) => Ok(msg),
        Err(e) => match Message::from_frame(line).and_then(|m| m.body()) {
            Ok(MessageBody::Error(err)) => Err(NetworkError::Rejected {
                code: err.code,
                message: err.message,
            }),
            _ => Err(ProtocolError::from(e).into()),
        },
    }
}

fn handshake_frame(msg: &HandshakeMessage) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(msg).map_err(ProtocolError::from)?;
    buf.push(b'\n');
    Ok(buf)
}

// -----------------------------------------------------------------------------
// Status
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub node_id: String,
    pub listening: bool,
    pub local_addr: Option<String>,
    pub active_connections: usize,
    pub total_peers: usize,
    pub uptime_secs: u64,
    pub topology_type: String,
    pub routing_strategy: String,
    pub discovered_peers: usize,
    pub unhealthy_peers: Vec<String>,
    pub stats: StatsSnapshot,
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "═══════════════════════════════════════\n\
             SYNAPSE NODE STATUS\n\
             ═══════════════════════════════════════\n\
             ID:        {}\n\
             Addr:      {}\n\
             Conns:     {} active\n\
             Peers:     {} authenticated, {} discovered, {} unhealthy\n\
             Topology:  {} (routing: {})\n\
             Messages:  {} sent / {} received / {} dropped\n\
             Uptime:    {}s\n\
             ═══════════════════════════════════════",
            self.node_id,
            self.local_addr.as_deref().unwrap_or("not listening"),
            self.active_connections,
            self.total_peers,
            self.discovered_peers,
            self.unhealthy_peers.len(),
            self.topology_type,
            self.routing_strategy,
            self.stats.messages_sent,
            self.stats.messages_received,
            self.stats.messages_dropped,
            self.uptime_secs
        )
    }
}

// -----------------------------------------------------------------------------
// Network
// -----------------------------------------------------------------------------

pub struct Network {
    node_id: String,
    config: P2pConfig,
    handshake: HandshakeManager,
    pool: Arc<ConnectionPool>,
    topology: Arc<TopologyManager>,
    router: Arc<Router>,
    reputation: Arc<ReputationSystem>,
    exchange: Arc<PeerExchange>,
    stats: NetworkStats,

    shutdown: CancellationToken,
    tasks: TaskTracker,
    running: AtomicBool,
    stopped: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
    started_at: RwLock<Option<Instant>>,

    backlog_tx: mpsc::Sender<Message>,
    backlog_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    inbox: broadcast::Sender<Message>,
}

impl Network {
    pub fn new(node_id: &str, config: &Config, identity: Arc<NodeIdentity>) -> Result<Arc<Self>> {
        config.validate()?;
        if node_id.is_empty() {
            return Err(NetworkError::state("node id cannot be empty"));
        }

        let p2p = config.p2p.clone();
        let topology = Arc::new(TopologyManager::new(
            config.topology.weights,
            config.topology.mesh_threshold,
            p2p.max_peers,
        ));
        let router = Router::new(Arc::clone(&topology), config.routing.strategy);
        let reputation = Arc::new(ReputationSystem::new(Arc::clone(&topology)));
        let (backlog_tx, backlog_rx) = mpsc::channel(p2p.message_queue_size);
        let (inbox, _) = broadcast::channel(INBOX_CHANNEL_SIZE);

        log::info!(
            "[{}] 🔑 Identity {} ({} bits)",
            node_id,
            identity.fingerprint(),
            identity.key_bits()
        );

        Ok(Arc::new(Network {
            node_id: node_id.to_string(),
            handshake: HandshakeManager::new(node_id, identity, p2p.handshake_tolerance_secs),
            pool: Arc::new(ConnectionPool::new(p2p.max_connections, p2p.read_timeout())),
            exchange: Arc::new(PeerExchange::new(p2p.max_peers)),
            config: p2p,
            topology,
            router,
            reputation,
            stats: NetworkStats::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            local_addr: RwLock::new(None),
            started_at: RwLock::new(None),
            backlog_tx,
            backlog_rx: Mutex::new(Some(backlog_rx)),
            inbox,
        }))
    }

    // ---- Accessors ----

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn reputation(&self) -> &Arc<ReputationSystem> {
        &self.reputation
    }

    pub fn exchange(&self) -> &Arc<PeerExchange> {
        &self.exchange
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Generic (non-control) messages received from any peer.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inbox.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self.pool.peers().iter().map(|p| p.snapshot()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        self.exchange.candidates(usize::MAX)
    }

    /// Peers silent for longer than `threshold`, sorted by id.
    pub fn unhealthy_peers_after(&self, threshold: Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pool
            .peers()
            .iter()
            .filter(|p| !p.is_alive(threshold))
            .map(|p| p.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Peers that missed `UNHEALTHY_AFTER_HEARTBEATS` heartbeat intervals
    /// but have not yet hit the read timeout.
    pub fn unhealthy_peers(&self) -> Vec<String> {
        self.unhealthy_peers_after(self.config.heartbeat_interval() * UNHEALTHY_AFTER_HEARTBEATS)
    }

    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            node_id: self.node_id.clone(),
            listening: self.is_running(),
            local_addr: self.local_addr().map(|a| a.to_string()),
            active_connections: self.pool.connection_count(),
            total_peers: self.pool.peer_count(),
            uptime_secs: self.started_at.read().map_or(0, |t| t.elapsed().as_secs()),
            topology_type: self.topology.topology_type().to_string(),
            routing_strategy: self.router.strategy().to_string(),
            discovered_peers: self.exchange.len(),
            unhealthy_peers: self.unhealthy_peers(),
            stats: self.stats.snapshot(),
        }
    }

    // ---- Lifecycle ----

    /// Bind and launch the background loops. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NetworkError::state("network has been stopped"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::state("already running"));
        }

        let listener = match TcpListener::bind(self.config.listen_addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let local = listener.local_addr()?;
        *self.local_addr.write() = Some(local);
        *self.started_at.write() = Some(Instant::now());

        log::info!("🌐 Node [{}] listening on {}", self.node_id, local);

        self.tasks.spawn(Arc::clone(self).accept_loop(listener));
        self.tasks.spawn(
            Arc::clone(&self.pool).run_sweeper(self.shutdown.child_token(), self.config.sweep_interval()),
        );

        let backlog = self.backlog_rx.lock().take();
        if let Some(rx) = backlog {
            self.tasks.spawn(Arc::clone(self).dispatch_loop(rx));
        }

        if self.config.enable_discovery {
            self.tasks
                .spawn(Arc::clone(self).heartbeat_loop(self.config.heartbeat_interval()));
        }

        Ok(local)
    }

    /// Runs once; later calls return `Ok(())` immediately.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let closed = self.pool.close_all();
        self.pool.clear_peers();
        self.topology.clear();

        self.tasks.close();
        if tokio::time::timeout(STOP_GRACE, self.tasks.wait()).await.is_err() {
            log::warn!(
                "[{}] ⚠️ {} task(s) still running after {:?}",
                self.node_id,
                self.tasks.len(),
                STOP_GRACE
            );
        }

        log::info!("[{}] 🛑 Network stopped ({} connection(s) closed)", self.node_id, closed);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        log::debug!("[{}] 📡 Incoming connection from {}", self.node_id, remote);
                        let net = Arc::clone(&self);
                        self.tasks.spawn(net.handle_connection(stream, remote, Direction::Inbound));
                    }
                    Err(e) => {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        log::warn!("[{}] ❌ Accept error: {}", self.node_id, e);
                    }
                }
            }
        }
        log::debug!("[{}] Accept loop ended", self.node_id);
    }

    /// Dial `address`. Returns once TCP is up; the handshake runs on the
    /// connection task.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<SocketAddr> {
        if !self.is_running() {
            return Err(NetworkError::state("network not running"));
        }

        log::info!("[{}] 🔌 Connecting to {}...", self.node_id, address);
        let stream = tokio::time::timeout(self.config.dial_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::Timeout(format!("dial {}", address)))??;
        let remote = stream.peer_addr()?;

        let net = Arc::clone(self);
        self.tasks.spawn(net.handle_connection(stream, remote, Direction::Outbound));
        Ok(remote)
    }

    // ---- Per-connection task ----

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr, direction: Direction) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let conn = Connection::new(write_half, remote, direction, self.shutdown.child_token());

        if let Err(e) = self.pool.add_connection(Arc::clone(&conn)) {
            log::warn!("[{}] 🚫 Rejecting {}: {}", self.node_id, remote, e);
            self.reject(&conn, &e).await;
            conn.shutdown().await;
            return;
        }

        let mut reader = FramedRead::new(read_half, frame_codec(self.config.max_message_size));

        match self.perform_handshake(&conn, &mut reader).await {
            Ok(peer_id) => {
                self.stats.record_handshake(true);
                if direction == Direction::Outbound {
                    if let Err(e) = self.send_hello(&conn).await {
                        log::warn!("[{}] ⚠️ HELLO to [{}] failed: {}", self.node_id, peer_id, e);
                    }
                }
                self.read_loop(&conn, &peer_id, &mut reader).await;
            }
            Err(e) => {
                self.stats.record_handshake(false);
                log::warn!("[{}] 🤝 Handshake with {} failed: {}", self.node_id, remote, e);
                let answerable = !matches!(e, NetworkError::Io(_) | NetworkError::Rejected { .. });
                if direction == Direction::Inbound && answerable {
                    self.reject(&conn, &e).await;
                }
            }
        }

        self.teardown(&conn);
        conn.shutdown().await;
    }

    /// Accepting side: receive, verify, register, respond.
    /// Dialing side: send, receive, verify, register.
    pub async fn perform_handshake(&self, conn: &Arc<Connection>, reader: &mut FrameReader) -> Result<String> {
        let ours = handshake_frame(&self.handshake.create()?)?;
        let write_timeout = self.config.write_timeout();

        let peer_id = match conn.direction() {
            Direction::Inbound => {
                let theirs = self.receive_handshake(conn, reader).await?;
                let peer_id = self.verify_remote(&theirs)?;
                self.register_peer(conn, &peer_id);
                conn.send_frame(&ours, write_timeout).await?;
                peer_id
            }
            Direction::Outbound => {
                conn.send_frame(&ours, write_timeout).await?;
                let theirs = self.receive_handshake(conn, reader).await?;
                let peer_id = self.verify_remote(&theirs)?;
                self.register_peer(conn, &peer_id);
                peer_id
            }
        };
        Ok(peer_id)
    }

    async fn receive_handshake(&self, conn: &Connection, reader: &mut FrameReader) -> Result<HandshakeMessage> {
        let next = tokio::select! {
            _ = conn.closed() => return Err(NetworkError::state("connection closed during handshake")),
            next = tokio::time::timeout(self.config.handshake_timeout(), reader.next()) => next,
        };
        let line = match next {
            Err(_) => return Err(NetworkError::Timeout("handshake receive".into())),
            Ok(None) => {
                return Err(NetworkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "closed during handshake",
                )))
            }
            Ok(Some(Err(e))) => return Err(codec_error(e, self.config.max_message_size)),
            Ok(Some(Ok(line))) => line,
        };
        conn.touch();
        parse_handshake(&line)
    }

    /// Best-effort ERROR frame to a connection that is about to be closed.
    async fn reject(&self, conn: &Connection, err: &NetworkError) {
        let body = MessageBody::Error(ErrorPayload {
            code: err.code().to_string(),
            message: err.to_string(),
        });
        if let Err(e) = self.send_body_on(conn, body).await {
            log::debug!("[{}] ERROR reply to {} failed: {}", self.node_id, conn.remote_addr(), e);
        }
    }

    fn verify_remote(&self, msg: &HandshakeMessage) -> Result<String> {
        let verified = self.handshake.verify(msg)?;
        if verified.node_id == self.node_id {
            return Err(CryptoError::Verification("self-connection rejected".into()).into());
        }
        Ok(verified.node_id)
    }

    fn register_peer(&self, conn: &Arc<Connection>, peer_id: &str) {
        conn.set_peer_id(peer_id);
        let address = conn.remote_addr().to_string();
        if let Some(previous) = self.pool.add_peer(Peer::new(peer_id, &address, "unknown", conn)) {
            if !previous.owns(conn.id()) {
                log::info!("[{}] 🔁 Peer [{}] reconnected, replacing old session", self.node_id, peer_id);
            }
        }
        self.topology.add_peer(peer_id, &address);
        self.exchange.remove(peer_id);
        log::info!(
            "[{}] ✅ Peer [{}] authenticated ({}, {:?})",
            self.node_id,
            peer_id,
            address,
            conn.direction()
        );
    }

    fn teardown(&self, conn: &Arc<Connection>) {
        self.pool.remove_connection(conn.id());
        if let Some(peer_id) = conn.peer_id() {
            if self.pool.remove_peer_if_owned(peer_id, conn.id()) {
                self.topology.remove_peer(peer_id);
                log::info!("[{}] 👋 Peer [{}] disconnected", self.node_id, peer_id);
            }
        }
    }

    async fn read_loop(&self, conn: &Arc<Connection>, peer_id: &str, reader: &mut FrameReader) {
        let read_timeout = self.config.read_timeout();
        loop {
            let next = tokio::select! {
                _ = conn.closed() => {
                    log::debug!("[{}] Connection to [{}] cancelled", self.node_id, peer_id);
                    break;
                }
                next = tokio::time::timeout(read_timeout, reader.next()) => next,
            };

            let line = match next {
                Err(_) => {
                    log::info!("[{}] ⏱️ Peer [{}] idle for {:?}, closing", self.node_id, peer_id, read_timeout);
                    break;
                }
                Ok(None) => {
                    log::debug!("[{}] Peer [{}] closed the connection", self.node_id, peer_id);
                    break;
                }
                Ok(Some(Err(e))) => {
                    let err = codec_error(e, self.config.max_message_size);
                    log::warn!("[{}] ⚠️ Read from [{}] failed: {}", self.node_id, peer_id, err);
                    break;
                }
                Ok(Some(Ok(line))) => line,
            };

            conn.touch();
            if let Some(peer) = self.pool.get_peer(peer_id) {
                if peer.owns(conn.id()) {
                    peer.touch();
                }
            }
            self.stats.record_received(line.len() + 1);

            match Message::from_frame(&line) {
                Ok(msg) => self.dispatch(conn, peer_id, msg).await,
                Err(e) => {
                    self.stats.record_invalid();
                    log::warn!("[{}] ⚠️ Invalid frame from [{}]: {}", self.node_id, peer_id, e);
                    self.reject(conn, &NetworkError::Protocol(e)).await;
                }
            }
        }
    }

    // ---- Dispatch ----

    async fn dispatch(&self, conn: &Arc<Connection>, peer_id: &str, msg: Message) {
        let kind = msg.kind();
        let body = match msg.body() {
            Ok(body) => body,
            Err(e) if kind.is_control() => {
                self.stats.record_invalid();
                log::warn!("[{}] ⚠️ Bad {} from [{}]: {}", self.node_id, kind, peer_id, e);
                return;
            }
            Err(_) => {
                self.enqueue(msg);
                return;
            }
        };

        match body {
            MessageBody::Hello(hello) => self.on_hello(conn, peer_id, hello).await,
            MessageBody::Heartbeat(hb) => {
                log::trace!("[{}] 💓 Heartbeat from [{}] at {}", self.node_id, hb.node_id, hb.timestamp);
            }
            MessageBody::PeerList(list) => self.on_peer_list(peer_id, list),
            MessageBody::Ping(ping) => self.on_ping(conn, peer_id, &msg.id, ping).await,
            MessageBody::Pong(pong) => self.on_pong(peer_id, pong),
            MessageBody::DataSync(_)
            | MessageBody::Error(_)
            | MessageBody::SyncRequest(_)
            | MessageBody::SyncResponse(_)
            | MessageBody::Other { .. } => self.enqueue(msg),
        }
    }

    fn enqueue(&self, msg: Message) {
        match self.backlog_tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.stats.record_dropped();
                log::warn!(
                    "[{}] ⚠️ Message backlog full, dropping {} {} from [{}]",
                    self.node_id,
                    msg.msg_type,
                    msg.id,
                    msg.sender
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.record_dropped();
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Message>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(msg) => {
                        log::debug!("[{}] 📨 {} {} from [{}]", self.node_id, msg.msg_type, msg.id, msg.sender);
                        // no subscribers is not an error
                        let _ = self.inbox.send(msg);
                    }
                    None => break,
                }
            }
        }
    }

    async fn on_hello(&self, conn: &Arc<Connection>, peer_id: &str, hello: HelloPayload) {
        if let Some(peer) = self.pool.get_peer(peer_id) {
            peer.set_version(&hello.version);
            if hello.listen_port != 0 {
                let advertised = SocketAddr::new(conn.remote_addr().ip(), hello.listen_port).to_string();
                peer.set_address(&advertised);
                self.topology.add_peer(peer_id, &advertised);
            }
        }
        log::info!(
            "[{}] 👋 HELLO from [{}] v{} caps={:?}",
            self.node_id,
            peer_id,
            hello.version,
            hello.capabilities
        );

        let list = PeerListPayload::capped(self.known_peer_records(peer_id));
        if let Err(e) = self.send_body_on(conn, MessageBody::PeerList(list)).await {
            log::warn!("[{}] ⚠️ PEER_LIST to [{}] failed: {}", self.node_id, peer_id, e);
        }
    }

    fn on_peer_list(&self, from: &str, list: PeerListPayload) {
        let mut recorded = 0;
        for record in list.peers.iter().take(MAX_PEER_LIST_SIZE) {
            if record.id == self.node_id || self.pool.has_peer(&record.id) {
                continue;
            }
            if self.exchange.record(record) {
                recorded += 1;
            }
        }
        log::debug!(
            "[{}] 🧭 PEER_LIST from [{}]: {} entries, {} recorded",
            self.node_id,
            from,
            list.peers.len(),
            recorded
        );
    }

    async fn on_ping(&self, conn: &Arc<Connection>, peer_id: &str, request_id: &str, ping: PingPayload) {
        let pong = MessageBody::Pong(PongPayload {
            timestamp_ms: now_ms(),
            request_id: request_id.to_string(),
            echo_ms: ping.timestamp_ms,
        });
        if let Err(e) = self.send_body_on(conn, pong).await {
            log::debug!("[{}] PONG to [{}] failed: {}", self.node_id, peer_id, e);
        }
    }

    fn on_pong(&self, peer_id: &str, pong: PongPayload) {
        // echo_ms is peer-controlled
        let rtt = match now_ms().checked_sub(pong.echo_ms) {
            Some(rtt) if rtt >= 0 => rtt,
            _ => return,
        };
        self.topology.record_rtt(peer_id, rtt as f64);
        self.reputation
            .record_performance(peer_id, 1.0, Duration::from_millis(rtt as u64));
        log::trace!("[{}] 🏓 RTT to [{}] = {}ms", self.node_id, peer_id, rtt);
    }

    fn known_peer_records(&self, exclude: &str) -> Vec<PeerRecord> {
        self.pool
            .peers()
            .iter()
            .filter(|p| p.id() != exclude)
            .map(|p| PeerRecord {
                id: p.id().to_string(),
                address: p.address(),
                version: p.version(),
                last_seen: p.last_seen_unix(),
            })
            .collect()
    }

    // ---- Sending ----

    async fn send_on(&self, conn: &Connection, msg: &Message) -> Result<()> {
        let frame = msg.encode_frame(self.config.max_message_size)?;
        conn.send_frame(&frame, self.config.write_timeout()).await?;
        self.stats.record_sent(frame.len());
        Ok(())
    }

    async fn send_body_on(&self, conn: &Connection, body: MessageBody) -> Result<()> {
        let msg = Message::new(&self.node_id, body)?;
        self.send_on(conn, &msg).await
    }

    async fn send_hello(&self, conn: &Connection) -> Result<()> {
        let hello = HelloPayload {
            node_id: self.node_id.clone(),
            version: PROTOCOL_VERSION.to_string(),
            listen_port: self.local_addr().map_or(0, |a| a.port()),
            capabilities: local_capabilities(),
        };
        self.send_body_on(conn, MessageBody::Hello(hello)).await
    }

    fn penalize(&self, peer_id: &str, err: &NetworkError) {
        log::warn!("[{}] ⚠️ Send to [{}] failed: {}", self.node_id, peer_id, err);
        self.reputation.record_behavior(peer_id, SEND_FAILURE_SIGNAL);
        self.topology.set_peer_connected(peer_id, false);
    }

    pub async fn send_message(&self, peer_id: &str, msg: &Message) -> Result<()> {
        let conn = self
            .pool
            .get_peer(peer_id)
            .and_then(|p| p.connection())
            .ok_or_else(|| NetworkError::UnknownPeer(peer_id.to_string()))?;

        match self.send_on(&conn, msg).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.penalize(peer_id, &e);
                Err(e)
            }
        }
    }

    pub async fn send_body(&self, peer_id: &str, body: MessageBody) -> Result<()> {
        let msg = Message::new(&self.node_id, body)?;
        self.send_message(peer_id, &msg).await
    }

    /// Send to every authenticated peer. Keeps going past failures and
    /// reports only the last one; on success returns the delivery count.
    pub async fn broadcast(&self, msg: &Message) -> Result<usize> {
        let mut delivered = 0;
        let mut last_err = None;
        for peer in self.pool.peers() {
            match self.send_message(peer.id(), msg).await {
                Ok(()) => delivered += 1,
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    pub async fn broadcast_body(&self, body: MessageBody) -> Result<usize> {
        let msg = Message::new(&self.node_id, body)?;
        self.broadcast(&msg).await
    }

    pub async fn ping(&self, peer_id: &str) -> Result<()> {
        self.send_body(peer_id, MessageBody::Ping(PingPayload { timestamp_ms: now_ms() }))
            .await
    }

    // ---- Heartbeat ----

    async fn heartbeat_loop(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        log::info!("[{}] 💓 Heartbeat loop started ({:?})", self.node_id, every);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.heartbeat_round().await,
            }
        }
    }

    async fn heartbeat_round(&self) {
        let hb = MessageBody::Heartbeat(HeartbeatPayload {
            node_id: self.node_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        });
        if let Err(e) = self.broadcast_body(hb).await {
            log::debug!("[{}] Heartbeat broadcast incomplete: {}", self.node_id, e);
        }
        for peer in self.pool.peers() {
            if let Err(e) = self.ping(peer.id()).await {
                log::debug!("[{}] PING to [{}] failed: {}", self.node_id, peer.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ERROR_CODE_INVALID_MESSAGE, ERROR_CODE_MAX_PEERS_REACHED};
    use crate::crypto::test_keys;
    use crate::message::DataSyncPayload;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.p2p.listen_host = "127.0.0.1".into();
        cfg.p2p.listen_port = 0;
        cfg
    }

    fn network(slot: usize, cfg: &Config) -> Arc<Network> {
        let id = uuid::Uuid::new_v4().to_string();
        Network::new(&id, cfg, Arc::new(test_keys::identity(slot))).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        wait_for(cond, Duration::from_secs(3)).await
    }

    /// Registers `peer_id` over an in-memory pipe. Keep both handles alive.
    fn attach_peer(net: &Network, peer_id: &str) -> (Arc<Connection>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let conn = Connection::new(local, addr, Direction::Outbound, CancellationToken::new());
        net.register_peer(&conn, peer_id);
        (conn, remote)
    }

    fn error_code(msg: &Message) -> String {
        match msg.body().unwrap() {
            MessageBody::Error(err) => err.code,
            _ => panic!("expected ERROR, got {}", msg.msg_type),
        }
    }

    fn data_sync(sender: &str) -> Message {
        Message::new(
            sender,
            MessageBody::DataSync(DataSyncPayload {
                data_id: "doc-1".into(),
                data_type: "note".into(),
                content: serde_json::json!({"text": "hello"}),
                version: 1,
                timestamp: 0,
            }),
        )
        .unwrap()
    }

    async fn connected_pair() -> (Arc<Network>, Arc<Network>) {
        connected_pair_with(&test_config()).await
    }

    async fn connected_pair_with(cfg: &Config) -> (Arc<Network>, Arc<Network>) {
        let a = network(0, cfg);
        let b = network(1, cfg);
        let a_addr = a.start().await.unwrap();
        b.start().await.unwrap();
        b.connect(&a_addr.to_string()).await.unwrap();

        let (a2, b2) = (a.clone(), b.clone());
        assert!(wait_until(|| a2.pool().peer_count() == 1 && b2.pool().peer_count() == 1).await);
        (a, b)
    }

    #[tokio::test]
    async fn test_end_to_end_handshake_and_send() {
        let (a, b) = connected_pair().await;

        assert!(a.pool().has_peer(b.node_id()));
        assert!(b.pool().has_peer(a.node_id()));
        assert_eq!(a.topology().peer_count(), 1);
        assert_eq!(b.topology().peer_count(), 1);

        // let the HELLO / PEER_LIST exchange settle first
        let (a2, b_id) = (a.clone(), b.node_id().to_string());
        assert!(wait_until(|| a2.pool().get_peer(&b_id).map_or(false, |p| p.version() == PROTOCOL_VERSION)).await);

        let conn_at_b = b.pool().get_peer(a.node_id()).unwrap().connection().unwrap();
        let mut inbox = b.subscribe();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(conn_at_b.idle_for() >= Duration::from_millis(100));

        let msg = data_sync(a.node_id());
        a.send_message(b.node_id(), &msg).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(3), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, msg.id);
        assert_eq!(received.sender, a.node_id());
        assert!(conn_at_b.idle_for() < Duration::from_millis(100));

        assert!(a.stats().messages_sent >= 1);
        assert_eq!(a.stats().handshakes_ok, 1);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_updates_version_and_address() {
        let (a, b) = connected_pair().await;
        let b_port = b.local_addr().unwrap().port();

        let (a2, b_id) = (a.clone(), b.node_id().to_string());
        assert!(wait_until(|| a2.pool().get_peer(&b_id).map_or(false, |p| p.version() == PROTOCOL_VERSION)).await);

        let peer = a.pool().get_peer(b.node_id()).unwrap();
        assert_eq!(peer.address(), format!("127.0.0.1:{}", b_port));
        assert_eq!(a.topology().get_peer_info(b.node_id()).unwrap().address, peer.address());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_list_feeds_exchange() {
        let cfg = test_config();
        let a = network(0, &cfg);
        let b = network(1, &cfg);
        let c = network(2, &cfg);
        let a_addr = a.start().await.unwrap().to_string();
        b.start().await.unwrap();
        c.start().await.unwrap();

        b.connect(&a_addr).await.unwrap();
        let a2 = a.clone();
        assert!(wait_until(|| a2.pool().peer_count() == 1).await);

        c.connect(&a_addr).await.unwrap();
        let (c2, b_id) = (c.clone(), b.node_id().to_string());
        assert!(wait_until(|| c2.exchange().contains(&b_id)).await);
        assert!(!c.exchange().contains(a.node_id()));
        assert!(!c.exchange().contains(c.node_id()));

        for n in [&a, &b, &c] {
            n.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_ping_pong_updates_latency() {
        let (a, b) = connected_pair().await;
        let before = a.topology().get_peer_info(b.node_id()).unwrap().quality.latency_ms;
        assert_eq!(before, 1000.0);

        a.ping(b.node_id()).await.unwrap();
        let (a2, b_id) = (a.clone(), b.node_id().to_string());
        assert!(wait_until(|| {
            a2.topology().get_peer_info(&b_id).map_or(false, |p| p.quality.latency_ms < 1000.0)
        })
        .await);
        assert!(a.reputation().reputation(b.node_id()).unwrap() > 0.0);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer() {
        let (a, b) = connected_pair().await;
        a.stop().await.unwrap();

        let b2 = b.clone();
        assert!(wait_until(|| b2.pool().peer_count() == 0 && b2.pool().connection_count() == 0).await);
        assert_eq!(b.topology().peer_count(), 0);
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let cfg = test_config();
        let hub = network(0, &cfg);
        let x = network(1, &cfg);
        let y = network(2, &cfg);
        let hub_addr = hub.start().await.unwrap().to_string();
        x.start().await.unwrap();
        y.start().await.unwrap();

        let mut x_inbox = x.subscribe();
        let mut y_inbox = y.subscribe();
        x.connect(&hub_addr).await.unwrap();
        y.connect(&hub_addr).await.unwrap();
        let h2 = hub.clone();
        assert!(wait_until(|| h2.pool().peer_count() == 2).await);

        let delivered = hub.broadcast(&data_sync(hub.node_id())).await.unwrap();
        assert_eq!(delivered, 2);

        for inbox in [&mut x_inbox, &mut y_inbox] {
            let msg = tokio::time::timeout(Duration::from_secs(3), inbox.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg.msg_type, "DATA_SYNC");
        }

        for n in [&hub, &x, &y] {
            n.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_garbage_handshake_registers_nothing() {
        let a = network(0, &test_config());
        let addr = a.start().await.unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"this is not a handshake\n").await.unwrap();

        // one ERROR frame, then EOF
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), raw.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Message::from_frame(buf.strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(reply.sender, a.node_id());
        assert_eq!(error_code(&reply), ERROR_CODE_INVALID_MESSAGE);

        let a2 = a.clone();
        assert!(wait_until(|| a2.pool().connection_count() == 0).await);
        assert_eq!(a.pool().peer_count(), 0);
        assert_eq!(a.stats().handshakes_failed, 1);
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_pool_closes_new_sockets() {
        let mut cfg = test_config();
        cfg.p2p.max_connections = 1;
        let a = network(0, &cfg);
        let addr = a.start().await.unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        let a2 = a.clone();
        assert!(wait_until(|| a2.pool().connection_count() == 1).await);

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), second.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Message::from_frame(buf.strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(error_code(&reply), ERROR_CODE_MAX_PEERS_REACHED);
        assert_eq!(a.pool().connection_count(), 1);

        // a dialing node gives up on the handshake
        let b = network(1, &test_config());
        b.start().await.unwrap();
        b.connect(&addr.to_string()).await.unwrap();
        let b2 = b.clone();
        assert!(wait_until(|| b2.stats().handshakes_failed == 1).await);
        assert_eq!(b.pool().peer_count(), 0);
        assert_eq!(a.pool().connection_count(), 1);

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_envelope_in_handshake_slot() {
        let line = Message::new(
            "remote",
            MessageBody::Error(ErrorPayload {
                code: ERROR_CODE_MAX_PEERS_REACHED.into(),
                message: "pool full".into(),
            }),
        )
        .unwrap()
        .to_json()
        .unwrap();
        let err = parse_handshake(line.as_bytes()).unwrap_err();
        assert!(matches!(err, NetworkError::Rejected { ref code, .. } if code == ERROR_CODE_MAX_PEERS_REACHED));

        let err = parse_handshake(b"{\"nope\": 1}").unwrap_err();
        assert!(matches!(err, NetworkError::Protocol(ProtocolError::Json(_))));
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let a = network(0, &test_config());
        let addr = a.start().await.unwrap();
        a.connect(&addr.to_string()).await.unwrap();

        let a2 = a.clone();
        assert!(wait_until(|| a2.stats().handshakes_failed >= 1).await);
        assert_eq!(a.pool().peer_count(), 0);
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_start_fails_and_stop_is_idempotent() {
        let a = network(0, &test_config());
        a.start().await.unwrap();
        assert!(matches!(a.start().await, Err(NetworkError::State(_))));
        assert!(a.status().listening);

        a.stop().await.unwrap();
        a.stop().await.unwrap();
        assert!(!a.status().listening);
        assert!(matches!(a.start().await, Err(NetworkError::State(_))));
        assert!(matches!(a.connect("127.0.0.1:1").await, Err(NetworkError::State(_))));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let a = network(0, &test_config());
        let err = a.send_message("nobody", &data_sync(a.node_id())).await.unwrap_err();
        assert!(matches!(err, NetworkError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_full_backlog_drops() {
        let mut cfg = test_config();
        cfg.p2p.message_queue_size = 1;
        let a = network(0, &cfg);

        a.enqueue(data_sync("x"));
        a.enqueue(data_sync("x"));
        assert_eq!(a.stats().messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_undecodable_frame_keeps_session() {
        let (a, b) = connected_pair().await;
        let mut a_inbox = a.subscribe();
        let mut b_inbox = b.subscribe();

        let conn = a.pool().get_peer(b.node_id()).unwrap().connection().unwrap();
        conn.send_frame(b"\xff\xfe garbage\n", Duration::from_secs(1)).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(3), a_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.sender, b.node_id());
        assert_eq!(error_code(&reply), ERROR_CODE_INVALID_MESSAGE);
        assert_eq!(b.stats().invalid_frames, 1);

        let msg = data_sync(a.node_id());
        a.send_message(b.node_id(), &msg).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(3), b_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, msg.id);
        assert!(b.pool().has_peer(a.node_id()));

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_respects_configured_frame_cap() {
        let mut cfg = test_config();
        cfg.p2p.max_message_size = 1024;
        let a = network(0, &cfg);
        let (_conn, _remote) = attach_peer(&a, "ghost");

        let big = Message::new(
            a.node_id(),
            MessageBody::DataSync(DataSyncPayload {
                data_id: "doc-1".into(),
                data_type: "note".into(),
                content: serde_json::json!({"text": "x".repeat(4096)}),
                version: 1,
                timestamp: 0,
            }),
        )
        .unwrap();
        let err = a.send_message("ghost", &big).await.unwrap_err();
        assert!(matches!(err, NetworkError::Protocol(ProtocolError::FrameTooLarge { limit: 1024 })));
        assert_eq!(a.stats().messages_sent, 0);

        a.send_message("ghost", &data_sync(a.node_id())).await.unwrap();
        assert_eq!(a.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_failed_send_penalizes_peer() {
        let a = network(0, &test_config());
        let (_conn, remote) = attach_peer(&a, "ghost");
        assert!(a.topology().get_peer_info("ghost").unwrap().connected);
        drop(remote);

        let err = a.send_message("ghost", &data_sync(a.node_id())).await.unwrap_err();
        assert!(matches!(err, NetworkError::Io(_)));
        assert!(a.reputation().reputation("ghost").unwrap() < 0.0);
        assert!(!a.topology().get_peer_info("ghost").unwrap().connected);
    }

    #[tokio::test]
    async fn test_pong_with_bad_echo_is_ignored() {
        let a = network(0, &test_config());
        let (_conn, _remote) = attach_peer(&a, "ghost");

        for echo_ms in [i64::MIN, i64::MAX, now_ms() + 60_000] {
            a.on_pong(
                "ghost",
                PongPayload { timestamp_ms: 0, request_id: "r".into(), echo_ms },
            );
        }
        let info = a.topology().get_peer_info("ghost").unwrap();
        assert_eq!(info.quality.latency_ms, 1000.0);
        assert_eq!(info.reputation, 0.0);
        assert!(a.reputation().history("ghost").is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_pings_peers() {
        let mut cfg = test_config();
        cfg.p2p.enable_discovery = true;
        cfg.p2p.heartbeat_interval_secs = 1;
        let (a, b) = connected_pair_with(&cfg).await;

        fn measured(net: &Network, peer: &str) -> bool {
            net.topology()
                .get_peer_info(peer)
                .map_or(false, |p| p.quality.latency_ms < 1000.0)
        }
        let (a2, b2) = (a.clone(), b.clone());
        let (a_id, b_id) = (a.node_id().to_string(), b.node_id().to_string());
        assert!(wait_for(|| measured(&a2, &b_id) && measured(&b2, &a_id), Duration::from_secs(5)).await);
        // the opening HELLO or PEER_LIST, then at least a PONG
        assert!(a.stats().messages_received >= 2);
        assert!(b.stats().messages_received >= 2);

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_peers_are_evicted() {
        let mut cfg = test_config();
        cfg.p2p.read_timeout_secs = 1;
        cfg.p2p.sweep_interval_secs = 1;
        let (a, b) = connected_pair_with(&cfg).await;

        fn gone(net: &Network) -> bool {
            net.pool().peer_count() == 0
                && net.pool().connection_count() == 0
                && net.topology().peer_count() == 0
        }
        let (a2, b2) = (a.clone(), b.clone());
        assert!(wait_for(|| gone(&a2) && gone(&b2), Duration::from_secs(5)).await);
        assert!(a.is_running() && b.is_running());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unhealthy_peers_reported() {
        let (a, b) = connected_pair().await;
        let (a2, b_id) = (a.clone(), b.node_id().to_string());
        assert!(wait_until(|| a2.pool().get_peer(&b_id).map_or(false, |p| p.version() == PROTOCOL_VERSION)).await);

        assert!(a.unhealthy_peers().is_empty());
        assert!(a.status().unhealthy_peers.is_empty());

        // B sends nothing after HELLO
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(a.unhealthy_peers_after(Duration::from_millis(100)), vec![b_id.clone()]);
        assert!(a.unhealthy_peers_after(Duration::from_secs(60)).is_empty());

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_display() {
        let a = network(0, &test_config());
        a.start().await.unwrap();
        let status = a.status();
        assert_eq!(status.node_id, a.node_id());
        assert_eq!(status.topology_type, "star");
        assert_eq!(status.routing_strategy, "direct");
        let text = status.to_string();
        assert!(text.contains("SYNAPSE NODE STATUS"));
        assert!(text.contains(a.node_id()));
        a.stop().await.unwrap();
    }
}
