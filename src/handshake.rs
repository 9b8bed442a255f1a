// =============================================================================
// SYNAPSE NODE : handshake.rs
// Signed handshake: creation and verification
// =============================================================================
//
//   dialer                               acceptor
//   ──────                               ────────
//   send  HS(A) ───────────────────────▶ recv + verify HS(A), register A
//   recv + verify HS(B), register B ◀── send  HS(B)
//
// Signature covers the JSON of every field except `signature`.
// =============================================================================

use crate::crypto::{self, NodeIdentity};
use crate::error::CryptoError;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub node_id: String,
    pub public_key: String,
    pub timestamp: i64,
    pub signature: String,
    pub session_key: String,
}

/// The signed portion, serialized in field order.
#[derive(Serialize)]
struct SignedFields<'a> {
    node_id: &'a str,
    public_key: &'a str,
    timestamp: i64,
    session_key: &'a str,
}

impl HandshakeMessage {
    fn signed_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(&SignedFields {
            node_id: &self.node_id,
            public_key: &self.public_key,
            timestamp: self.timestamp,
            session_key: &self.session_key,
        })
        .map_err(|e| CryptoError::Signing(e.to_string()))
    }

    pub fn session_key_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        hex::decode(&self.session_key).map_err(|e| CryptoError::Verification(e.to_string()))
    }
}

/// A handshake that passed verification, with the decoded peer key.
#[derive(Debug, Clone)]
pub struct VerifiedPeer {
    pub node_id: String,
    pub public_key: RsaPublicKey,
    pub session_key: Vec<u8>,
}

pub struct HandshakeManager {
    identity: Arc<NodeIdentity>,
    node_id: String,
    tolerance_secs: i64,
}

impl HandshakeManager {
    pub fn new(node_id: &str, identity: Arc<NodeIdentity>, tolerance_secs: i64) -> Self {
        HandshakeManager {
            identity,
            node_id: node_id.to_string(),
            tolerance_secs,
        }
    }

    pub fn create(&self) -> Result<HandshakeMessage, CryptoError> {
        self.create_at(chrono::Utc::now().timestamp())
    }

    pub fn create_at(&self, timestamp: i64) -> Result<HandshakeMessage, CryptoError> {
        let mut msg = HandshakeMessage {
            node_id: self.node_id.clone(),
            public_key: self.identity.public_key_pem().to_string(),
            timestamp,
            signature: String::new(),
            session_key: hex::encode(crypto::session_key()),
        };
        let signature = self.identity.sign(&msg.signed_bytes()?)?;
        msg.signature = hex::encode(signature);
        Ok(msg)
    }

    pub fn verify(&self, msg: &HandshakeMessage) -> Result<VerifiedPeer, CryptoError> {
        self.verify_at(msg, chrono::Utc::now().timestamp())
    }

    /// Key, then signature, then timestamp window.
    pub fn verify_at(&self, msg: &HandshakeMessage, now: i64) -> Result<VerifiedPeer, CryptoError> {
        if msg.node_id.is_empty() {
            return Err(CryptoError::Verification("empty node id".into()));
        }

        let public_key = crypto::decode_public_key(&msg.public_key)?;

        let signature = hex::decode(&msg.signature)
            .map_err(|e| CryptoError::Verification(format!("signature encoding: {}", e)))?;
        crypto::verify(&public_key, &msg.signed_bytes()?, &signature)?;

        let skew = now.saturating_sub(msg.timestamp).saturating_abs();
        if skew > self.tolerance_secs {
            return Err(CryptoError::Expired {
                skew_secs: skew,
                tolerance_secs: self.tolerance_secs,
            });
        }

        Ok(VerifiedPeer {
            node_id: msg.node_id.clone(),
            public_key,
            session_key: msg.session_key_bytes()?,
        })
    }

    /// Hybrid-encrypt a handshake for a peer whose key is already known.
    pub fn encrypt_for(
        &self,
        msg: &HandshakeMessage,
        recipient: &RsaPublicKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let json = serde_json::to_vec(msg).map_err(|e| CryptoError::Encryption(e.to_string()))?;
        crypto::encrypt_for(recipient, &json)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<HandshakeMessage, CryptoError> {
        let json = self.identity.decrypt(blob)?;
        serde_json::from_slice(&json).map_err(|e| CryptoError::CorruptMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{HANDSHAKE_TOLERANCE_SECS, SESSION_KEY_LEN};
    use crate::crypto::test_keys;

    fn manager(slot: usize, id: &str) -> HandshakeManager {
        HandshakeManager::new(id, Arc::new(test_keys::identity(slot)), HANDSHAKE_TOLERANCE_SECS)
    }

    #[test]
    fn test_create_and_verify() {
        let alice = manager(0, "alice");
        let bob = manager(1, "bob");

        let hs = alice.create().unwrap();
        assert_eq!(hs.session_key.len(), SESSION_KEY_LEN * 2);

        let peer = bob.verify(&hs).unwrap();
        assert_eq!(peer.node_id, "alice");
        assert_eq!(peer.session_key.len(), SESSION_KEY_LEN);
    }

    #[test]
    fn test_tampered_field_fails_signature() {
        let alice = manager(0, "alice");
        let bob = manager(1, "bob");

        let mut hs = alice.create().unwrap();
        hs.node_id = "mallory".into();
        assert!(matches!(bob.verify(&hs), Err(CryptoError::Verification(_))));

        let mut hs = alice.create().unwrap();
        hs.timestamp += 1;
        assert!(matches!(bob.verify(&hs), Err(CryptoError::Verification(_))));
    }

    #[test]
    fn test_swapped_key_fails_signature() {
        let alice = manager(0, "alice");
        let bob = manager(1, "bob");
        let mut hs = alice.create().unwrap();
        hs.public_key = test_keys::identity(1).public_key_pem().to_string();
        assert!(matches!(bob.verify(&hs), Err(CryptoError::Verification(_))));
    }

    #[test]
    fn test_timestamp_window_boundary() {
        let alice = manager(0, "alice");
        let bob = manager(1, "bob");
        let now = 1_700_000_000;

        let exact_past = alice.create_at(now - 300).unwrap();
        assert!(bob.verify_at(&exact_past, now).is_ok());

        let exact_future = alice.create_at(now + 300).unwrap();
        assert!(bob.verify_at(&exact_future, now).is_ok());

        let stale = alice.create_at(now - 301).unwrap();
        assert!(matches!(
            bob.verify_at(&stale, now),
            Err(CryptoError::Expired { skew_secs: 301, tolerance_secs: 300 })
        ));

        let future = alice.create_at(now + 301).unwrap();
        assert!(matches!(bob.verify_at(&future, now), Err(CryptoError::Expired { .. })));
    }

    #[test]
    fn test_malformed_key_checked_first() {
        let bob = manager(1, "bob");
        let hs = HandshakeMessage {
            node_id: "ghost".into(),
            public_key: "garbage".into(),
            timestamp: 0,
            signature: "zz".into(),
            session_key: String::new(),
        };
        assert!(matches!(bob.verify(&hs), Err(CryptoError::MalformedKey(_))));
    }

    #[test]
    fn test_small_key_rejected() {
        let weak = HandshakeManager::new(
            "weak",
            Arc::new(NodeIdentity::generate_with_bits(1024).unwrap()),
            HANDSHAKE_TOLERANCE_SECS,
        );
        let bob = manager(1, "bob");
        let hs = weak.create().unwrap();
        assert!(matches!(bob.verify(&hs), Err(CryptoError::MalformedKey(_))));
    }

    #[test]
    fn test_empty_node_id_rejected() {
        let anon = manager(0, "");
        let bob = manager(1, "bob");
        let hs = anon.create().unwrap();
        assert!(matches!(bob.verify(&hs), Err(CryptoError::Verification(_))));
    }

    #[test]
    fn test_encrypted_handshake() {
        let alice = manager(0, "alice");
        let bob = manager(1, "bob");
        let hs = alice.create().unwrap();

        let blob = alice
            .encrypt_for(&hs, test_keys::identity(1).public_key())
            .unwrap();
        let opened = bob.decrypt(&blob).unwrap();
        assert_eq!(opened, hs);
        assert!(bob.verify(&opened).is_ok());
    }

    #[test]
    fn test_wire_shape() {
        let hs = manager(0, "alice").create().unwrap();
        let json: serde_json::Value = serde_json::to_value(&hs).unwrap();
        for field in ["node_id", "public_key", "timestamp", "signature", "session_key"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert!(hs.public_key.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(hs.signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
