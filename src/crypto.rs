//! Cryptographic primitives: X25519 group operations, ChaCha20-Poly1305
//! AEAD, SHA-256 hashing and randomness.
//!
//! The wire encoding of group elements lives behind
//! [`PublicKey::encode`] / [`PublicKey::decode`] so the representation can
//! change without touching the protocol layers. Every 32-byte string is a
//! valid ladder input, so uniformly random bytes decode successfully.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{ReunionError, Result};

/// Symmetric key length in bytes
pub const KEY_SIZE: usize = 32;

/// AEAD nonce length in bytes
pub const NONCE_SIZE: usize = 12;

/// AEAD authentication tag length in bytes
pub const TAG_SIZE: usize = 16;

/// Encoded group element length in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// A group element in its 32-byte wire encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Wire encoding of this element.
    pub fn encode(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0
    }

    /// Decode a wire-encoded group element.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            ReunionError::InvalidMessage(format!(
                "public key must be {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(PublicKey(arr))
    }

    /// Raw bytes of the encoding.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl From<&SecretKey> for PublicKey {
    fn from(secret: &SecretKey) -> Self {
        let scalar = StaticSecret::from(secret.0);
        PublicKey(*X25519PublicKey::from(&scalar).as_bytes())
    }
}

/// A private scalar. Zeroed on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Generate a fresh scalar from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        SecretKey(bytes)
    }

    /// X25519 scalar multiplication with a peer element.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> [u8; KEY_SIZE] {
        let scalar = StaticSecret::from(self.0);
        let shared = scalar.diffie_hellman(&X25519PublicKey::from(peer.0));
        *shared.as_bytes()
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Generates n random bytes
pub fn rand_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// SHA-256 over the concatenation of the given parts.
pub fn hash32(parts: &[&[u8]]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Encrypts plaintext under the given key with a fresh random nonce.
///
/// Layout: `nonce(12) || ciphertext || tag(16)`. Keys are reused across
/// messages within an epoch, so the nonce must be fresh per call.
pub fn aead_seal(key: &[u8; KEY_SIZE], ad: &[u8], pt: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("Invalid key length");
    let nonce_bytes = rand_bytes(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&nonce_bytes);

    let ct = cipher
        .encrypt(
            &Nonce::from(nonce),
            chacha20poly1305::aead::Payload { msg: pt, aad: ad },
        )
        .expect("Encryption should not fail");

    let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    out
}

/// Decrypts a `nonce || ciphertext || tag` blob produced by [`aead_seal`].
pub fn aead_open(key: &[u8; KEY_SIZE], ad: &[u8], ct: &[u8]) -> Result<Vec<u8>> {
    if ct.len() < NONCE_SIZE + TAG_SIZE {
        return Err(ReunionError::InvalidMessage(format!(
            "ciphertext too short: {} bytes",
            ct.len()
        )));
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).expect("Invalid key length");
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&ct[..NONCE_SIZE]);

    cipher
        .decrypt(
            &Nonce::from(nonce),
            chacha20poly1305::aead::Payload {
                msg: &ct[NONCE_SIZE..],
                aad: ad,
            },
        )
        .map_err(|e| ReunionError::Aead(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&rand_bytes(KEY_SIZE));
        let ad = b"associated data";
        let pt = b"rendezvous payload";

        let ct = aead_seal(&key, ad, pt);
        assert_eq!(ct.len(), NONCE_SIZE + pt.len() + TAG_SIZE);
        let decrypted = aead_open(&key, ad, &ct).unwrap();
        assert_eq!(decrypted, pt);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&rand_bytes(KEY_SIZE));
        let mut wrong = [0u8; KEY_SIZE];
        wrong.copy_from_slice(&rand_bytes(KEY_SIZE));

        let ct = aead_seal(&key, b"", b"secret");
        assert!(aead_open(&wrong, b"", &ct).is_err());
    }

    #[test]
    fn test_open_with_wrong_ad_fails() {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&rand_bytes(KEY_SIZE));

        let ct = aead_seal(&key, b"gamma", b"secret");
        assert!(aead_open(&key, b"other", &ct).is_err());
    }

    #[test]
    fn test_open_rejects_short_blob() {
        let key = [7u8; KEY_SIZE];
        let result = aead_open(&key, b"", &[0u8; 4]);
        assert!(matches!(result, Err(ReunionError::InvalidMessage(_))));
    }

    #[test]
    fn test_dh_agreement() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let a_pub = PublicKey::from(&a);
        let b_pub = PublicKey::from(&b);

        assert_eq!(a.diffie_hellman(&b_pub), b.diffie_hellman(&a_pub));
    }

    #[test]
    fn test_public_key_encode_decode() {
        let secret = SecretKey::generate();
        let pk = PublicKey::from(&secret);
        let decoded = PublicKey::decode(&pk.encode()).unwrap();
        assert_eq!(pk, decoded);

        assert!(PublicKey::decode(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_hash32_is_concatenation() {
        assert_eq!(hash32(&[b"ab", b"cd"]), hash32(&[b"abcd"]));
        assert_ne!(hash32(&[b"ab"]), hash32(&[b"cd"]));
    }
}
