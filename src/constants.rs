//! Protocol constants for the Synapse node
//!
//! Defaults for sizes, timeouts and intervals used across the
//! session and topology engine. Runtime values come from `config`,
//! these are the fallbacks.

use std::time::Duration;

/// Network name
pub const NETWORK_NAME: &str = "Synapse";

/// Current version of the P2P protocol
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Crate version reported by the binary
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Project tagline
pub const TAGLINE: &str = "Authenticated sessions over a scored peer topology";

// ═══════════════════════════════════════════════════════════════
// Sizes
// ═══════════════════════════════════════════════════════════════

/// Maximum size of a single framed message (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum number of entries in one PEER_LIST payload
pub const MAX_PEER_LIST_SIZE: usize = 100;

/// Capacity of the generic message backlog
pub const DEFAULT_MESSAGE_QUEUE_SIZE: usize = 100;

/// Capacity of the application-facing broadcast channel
pub const INBOX_CHANNEL_SIZE: usize = 256;

/// Length of the random session key carried in a handshake
pub const SESSION_KEY_LEN: usize = 32;

/// Minimum accepted RSA modulus size
pub const MIN_RSA_BITS: usize = 2048;

// ═══════════════════════════════════════════════════════════════
// Network defaults
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_MAX_PEERS: usize = 50;
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_MESH_THRESHOLD: usize = 10;

// ═══════════════════════════════════════════════════════════════
// Timeouts and intervals
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TOLERANCE_SECS: i64 = 300;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Missed heartbeat intervals before a silent peer is reported unhealthy
pub const UNHEALTHY_AFTER_HEARTBEATS: u32 = 2;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════
// Capability flags advertised in HELLO
// ═══════════════════════════════════════════════════════════════

pub const CAPABILITY_SYNC: &str = "sync";
pub const CAPABILITY_DISCOVERY: &str = "discovery";
pub const CAPABILITY_ENCRYPTION: &str = "encryption";
pub const CAPABILITY_RELAY: &str = "relay";

// ═══════════════════════════════════════════════════════════════
// Error codes carried in ERROR payloads
// ═══════════════════════════════════════════════════════════════

pub const ERROR_CODE_INVALID_MESSAGE: &str = "INVALID_MESSAGE";
pub const ERROR_CODE_CONNECTION_FAILED: &str = "CONNECTION_FAILED";
pub const ERROR_CODE_PEER_NOT_FOUND: &str = "PEER_NOT_FOUND";
pub const ERROR_CODE_MAX_PEERS_REACHED: &str = "MAX_PEERS_REACHED";
pub const ERROR_CODE_TIMEOUT: &str = "TIMEOUT";

/// Capabilities this build advertises
pub fn local_capabilities() -> Vec<String> {
    vec![
        CAPABILITY_SYNC.to_string(),
        CAPABILITY_DISCOVERY.to_string(),
        CAPABILITY_ENCRYPTION.to_string(),
    ]
}

/// Print the startup banner
pub fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                    SYNAPSE NODE                            ║");
    println!("║                                                            ║");
    println!("║  Handshake • Pool • Topology • Routing                     ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  {} v{} (protocol {})", NETWORK_NAME, VERSION, PROTOCOL_VERSION);
    println!("  {}", TAGLINE);
    println!();
}
