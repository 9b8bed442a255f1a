// =============================================================================
// SYNAPSE NODE : node.rs
// Lifecycle shell around the Network: identity, bootstrap, start/stop/wait
// =============================================================================
//
//   Stopped ──start()──▶ Starting ──▶ Running ──stop()──▶ Stopping ──▶ Stopped
//      ▲                    │
//      └──── bind error ────┘
//
// A Network cannot be restarted once stopped, so neither can a Node.
// =============================================================================

use crate::config::Config;
use crate::crypto::NodeIdentity;
use crate::discovery::BootstrapConnector;
use crate::error::{NetworkError, Result};
use crate::network::{Network, NetworkStatus};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Stopped => "stopped",
            NodeStatus::Starting => "starting",
            NodeStatus::Running => "running",
            NodeStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

pub struct Node {
    id: String,
    name: String,
    config: Config,
    network: Arc<Network>,
    bootstrap: Arc<BootstrapConnector>,
    status: watch::Sender<NodeStatus>,
}

impl Node {
    /// Validates `config`, assigns an id if none is set and loads the key
    /// from `node.key_file` (generating it on first run). Without a key file
    /// the identity is ephemeral.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let identity = match &config.node.key_file {
            Some(path) => NodeIdentity::load_or_generate(path)?,
            None => NodeIdentity::generate()?,
        };
        Self::with_identity(config, Arc::new(identity))
    }

    pub fn with_identity(config: Config, identity: Arc<NodeIdentity>) -> Result<Arc<Self>> {
        config.validate()?;
        let id = config
            .node
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let network = Network::new(&id, &config, identity)?;
        let bootstrap = Arc::new(BootstrapConnector::new(
            &config.p2p.bootstrap_peers,
            config.p2p.bootstrap_retries,
            config.p2p.bootstrap_retry_delay(),
        ));
        let (status, _) = watch::channel(NodeStatus::Stopped);

        Ok(Arc::new(Node {
            name: config.node.name.clone(),
            id,
            config,
            network,
            bootstrap,
            status,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.borrow()
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn bootstrap(&self) -> &Arc<BootstrapConnector> {
        &self.bootstrap
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.network.status()
    }

    fn transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        self.status.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    fn set_status(&self, status: NodeStatus) {
        self.status.send_replace(status);
    }

    pub async fn start(&self) -> Result<SocketAddr> {
        if !self.transition(NodeStatus::Stopped, NodeStatus::Starting) {
            return Err(NetworkError::State(format!("cannot start node while {}", self.status())));
        }

        log::info!("🚀 Starting node {} [{}]", self.name, self.id);
        let local = match self.network.start().await {
            Ok(addr) => addr,
            Err(e) => {
                self.set_status(NodeStatus::Stopped);
                return Err(e);
            }
        };
        self.set_status(NodeStatus::Running);

        if !self.bootstrap.addresses().is_empty() {
            self.spawn_bootstrap();
        }

        log::info!("✅ Node [{}] running on {}", self.id, local);
        Ok(local)
    }

    fn spawn_bootstrap(&self) {
        let network = Arc::clone(&self.network);
        let bootstrap = Arc::clone(&self.bootstrap);
        let shutdown = self.network.shutdown_token();

        tokio::spawn(async move {
            let dial = |addr: String| {
                let network = Arc::clone(&network);
                async move { network.connect(&addr).await.map(|_| ()) }
            };
            match bootstrap.connect_all(dial, &shutdown).await {
                Ok(n) => log::info!("[{}] 🔌 Bootstrap done: {} peer(s) dialed", network.node_id(), n),
                Err(e) => log::warn!("[{}] 🔌 Bootstrap incomplete: {}", network.node_id(), e),
            }
        });
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.transition(NodeStatus::Running, NodeStatus::Stopping) {
            return Err(NetworkError::State(format!("cannot stop node while {}", self.status())));
        }

        log::info!("🛑 Stopping node [{}]", self.id);
        let result = self.network.stop().await;
        self.set_status(NodeStatus::Stopped);
        result
    }

    /// Resolves once the node is stopped; immediately if it never started.
    pub async fn wait(&self) {
        let mut rx = self.status.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|s| *s == NodeStatus::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_keys;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.p2p.listen_host = "127.0.0.1".into();
        cfg.p2p.listen_port = 0;
        cfg
    }

    fn node(slot: usize, cfg: Config) -> Arc<Node> {
        Node::with_identity(cfg, Arc::new(test_keys::identity(slot))).unwrap()
    }

    #[test]
    fn test_assigns_uuid_when_unset() {
        let n = node(0, test_config());
        assert!(uuid::Uuid::parse_str(n.id()).is_ok());
        assert_eq!(n.status(), NodeStatus::Stopped);
    }

    #[test]
    fn test_keeps_configured_id() {
        let mut cfg = test_config();
        let id = uuid::Uuid::new_v4().to_string();
        cfg.node.id = Some(id.clone());
        let n = node(0, cfg);
        assert_eq!(n.id(), id);
        assert_eq!(n.network().node_id(), id);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut cfg = test_config();
        cfg.node.id = Some("not-a-uuid".into());
        let err = Node::with_identity(cfg, Arc::new(test_keys::identity(0)));
        assert!(matches!(err, Err(NetworkError::Config(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let n = node(0, test_config());

        assert!(matches!(n.stop().await, Err(NetworkError::State(_))));

        n.start().await.unwrap();
        assert_eq!(n.status(), NodeStatus::Running);
        assert!(n.network().is_running());
        assert!(matches!(n.start().await, Err(NetworkError::State(_))));

        n.stop().await.unwrap();
        assert_eq!(n.status(), NodeStatus::Stopped);
        assert!(matches!(n.stop().await, Err(NetworkError::State(_))));

        // the network is single-use
        assert!(n.start().await.is_err());
        assert_eq!(n.status(), NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_wait_resolves_on_stop() {
        let n = node(0, test_config());
        n.start().await.unwrap();

        let waiter = {
            let n = n.clone();
            tokio::spawn(async move { n.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        n.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_dials_configured_peers() {
        let seed = node(0, test_config());
        let seed_addr = seed.start().await.unwrap();

        let mut cfg = test_config();
        cfg.p2p.bootstrap_peers = vec![seed_addr.to_string()];
        let joiner = node(1, cfg);
        joiner.start().await.unwrap();

        let mut linked = false;
        for _ in 0..300 {
            if seed.network().pool().has_peer(joiner.id())
                && joiner.network().pool().has_peer(seed.id())
                && joiner.bootstrap().is_connected(&seed_addr.to_string())
            {
                linked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(linked);

        joiner.stop().await.unwrap();
        seed.stop().await.unwrap();
    }
}
