// =============================================================================
// SYNAPSE NODE : crypto.rs
// Node identity: RSA keypair, PSS signatures, hybrid RSA-OAEP + AES-256-GCM
// =============================================================================
//
// Hybrid ciphertext layout:
//
//   ┌──────────────────────┬────────────┬──────────────────────────┐
//   │ RSA-OAEP(aes key)    │ nonce (12) │ AES-256-GCM ct + tag(16) │
//   │ key.size() bytes     │            │                          │
//   └──────────────────────┴────────────┴──────────────────────────┘
// =============================================================================

use crate::constants::{MIN_RSA_BITS, SESSION_KEY_LEN};
use crate::error::{ConfigError, CryptoError, NetworkError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::path::Path;

const NONCE_LEN: usize = 12; // AES-GCM 96-bit nonce
const TAG_LEN: usize = 16; // AES-GCM authentication tag
pub const CHALLENGE_LEN: usize = 32;

// ---- Identity ----

/// The node's long-lived keypair. One per process.
pub struct NodeIdentity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_pem: String,
}

/// Owner-only on unix; fails if `path` already exists.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

impl NodeIdentity {
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(MIN_RSA_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_private_key(private)
    }

    pub fn from_private_key(private: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public = RsaPublicKey::from(&private);
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        Ok(NodeIdentity { private, public, public_pem })
    }

    /// PKCS#8 PEM of the private key.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        Self::from_private_key(private)
    }

    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))
    }

    /// Load the key at `path`, or generate one and persist it there.
    pub fn load_or_generate(path: &Path) -> Result<Self, NetworkError> {
        if path.exists() {
            let pem = std::fs::read_to_string(path)?;
            let identity = Self::from_pem(&pem).map_err(|e| {
                ConfigError::Invalid(format!("key file {}: {}", path.display(), e))
            })?;
            log::info!("🔑 Loaded node key from {}", path.display());
            return Ok(identity);
        }

        let identity = Self::generate()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_private(path, identity.to_pem()?.as_bytes())?;
        log::info!("🔑 Generated new node key at {}", path.display());
        Ok(identity)
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Short hex fingerprint of the public key, for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.public_pem.as_bytes());
        hex::encode(&digest[..8])
    }

    pub fn key_bits(&self) -> usize {
        self.public.size() * 8
    }

    // ---- Signatures ----

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(data);
        self.private
            .sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
            .map_err(|e| CryptoError::Signing(e.to_string()))
    }

    pub fn sign_challenge(&self, challenge: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.sign(challenge)
    }

    // ---- Hybrid decryption ----

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key_len = self.private.size();
        if blob.len() < key_len + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::CorruptMessage(format!(
                "{} bytes, need at least {}",
                blob.len(),
                key_len + NONCE_LEN + TAG_LEN
            )));
        }

        let (wrapped_key, rest) = blob.split_at(key_len);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self
            .private
            .decrypt(Oaep::new::<Sha256>(), wrapped_key)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("bits", &self.key_bits())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

// ---- Free helpers ----

/// Decode a PEM public key, rejecting anything under `MIN_RSA_BITS`.
pub fn decode_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(CryptoError::MalformedKey(format!(
            "{}-bit key, need at least {}",
            bits, MIN_RSA_BITS
        )));
    }
    Ok(key)
}

pub fn verify(public: &RsaPublicKey, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let digest = Sha256::digest(data);
    public
        .verify(Pss::new::<Sha256>(), &digest, signature)
        .map_err(|e| CryptoError::Verification(e.to_string()))
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn session_key() -> Vec<u8> {
    random_bytes(SESSION_KEY_LEN)
}

pub fn create_challenge() -> Vec<u8> {
    random_bytes(CHALLENGE_LEN)
}

pub fn verify_challenge(
    public: &RsaPublicKey,
    challenge: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    verify(public, challenge, signature)
}

/// Hybrid-encrypt `plaintext` for the holder of `recipient`.
pub fn encrypt_for(recipient: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let wrapped_key = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(wrapped_key.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&wrapped_key);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

// ---- Shared test keys ----


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let id = test_keys::identity(0);
        let sig = id.sign(b"hello synapse").unwrap();
        assert!(verify(id.public_key(), b"hello synapse", &sig).is_ok());
        assert!(matches!(
            verify(id.public_key(), b"hello synapsE", &sig),
            Err(CryptoError::Verification(_))
        ));
    }

    #[test]
    fn test_wrong_key_does_not_verify() {
        let a = test_keys::identity(0);
        let b = test_keys::identity(1);
        let sig = a.sign(b"payload").unwrap();
        assert!(verify(b.public_key(), b"payload", &sig).is_err());
    }

    #[test]
    fn test_hybrid_roundtrip() {
        let id = test_keys::identity(0);
        let blob = encrypt_for(id.public_key(), b"secret sync data").unwrap();
        assert_eq!(id.decrypt(&blob).unwrap(), b"secret sync data");
    }

    #[test]
    fn test_hybrid_tamper_detected() {
        let id = test_keys::identity(0);
        let mut blob = encrypt_for(id.public_key(), b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(id.decrypt(&blob), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_hybrid_short_input() {
        let id = test_keys::identity(0);
        assert!(matches!(id.decrypt(&[0u8; 40]), Err(CryptoError::CorruptMessage(_))));
    }

    #[test]
    fn test_hybrid_wrong_recipient() {
        let a = test_keys::identity(0);
        let b = test_keys::identity(1);
        let blob = encrypt_for(a.public_key(), b"for a only").unwrap();
        assert!(matches!(b.decrypt(&blob), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_pem_roundtrip() {
        let id = test_keys::identity(0);
        let restored = NodeIdentity::from_pem(&id.to_pem().unwrap()).unwrap();
        assert_eq!(restored.public_key_pem(), id.public_key_pem());
        assert_eq!(restored.fingerprint(), id.fingerprint());

        let public = decode_public_key(id.public_key_pem()).unwrap();
        assert_eq!(&public, id.public_key());
    }

    #[test]
    fn test_decode_rejects_garbage_and_small_keys() {
        assert!(matches!(
            decode_public_key("-----BEGIN PUBLIC KEY-----\nnope\n-----END PUBLIC KEY-----\n"),
            Err(CryptoError::MalformedKey(_))
        ));

        let small = NodeIdentity::generate_with_bits(1024).unwrap();
        assert!(matches!(
            decode_public_key(small.public_key_pem()),
            Err(CryptoError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_challenge() {
        let id = test_keys::identity(0);
        let challenge = create_challenge();
        assert_eq!(challenge.len(), CHALLENGE_LEN);
        let sig = id.sign_challenge(&challenge).unwrap();
        assert!(verify_challenge(id.public_key(), &challenge, &sig).is_ok());
        assert!(verify_challenge(id.public_key(), &create_challenge(), &sig).is_err());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.pem");

        let first = NodeIdentity::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = NodeIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_pem(), second.public_key_pem());
        assert_eq!(first.key_bits(), MIN_RSA_BITS);
    }

    #[cfg(unix)]
    #[test]
    fn test_generated_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.pem");

        NodeIdentity::load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_rejects_corrupt_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.pem");
        std::fs::write(&path, "not a key").unwrap();
        assert!(matches!(
            NodeIdentity::load_or_generate(&path),
            Err(NetworkError::Config(ConfigError::Invalid(_)))
        ));
    }
}
