// =============================================================================
// SYNAPSE NODE : lib.rs
// =============================================================================
//
//   crypto ─▶ handshake ─┐
//   message ─────────────┼─▶ network ─▶ node ─▶ api
//   pool ────────────────┤
//   topology ─▶ routing ─┤
//        └──▶ reputation ┘
// =============================================================================

pub mod api;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod message;
pub mod network;
pub mod node;
pub mod pool;
pub mod reputation;
pub mod routing;
pub mod stats;
pub mod topology;

pub use config::Config;
pub use error::{NetworkError, Result};
pub use message::{Message, MessageBody, MessageType};
pub use network::{Network, NetworkStatus};
pub use node::{Node, NodeStatus};
