//! Durable snapshot codec for the exchange state.
//!
//! Blob layout: `magic(4) || version(1) || CBOR body`. The body is the
//! self-describing serialization of [`SerializableExchange`]. Unknown
//! magic, unknown versions and trailing bytes are all rejected; there is
//! no attempt to read older formats.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::commands::ExchangeHash;
use crate::crypto::PublicKey;
use crate::error::{ReunionError, Result};
use crate::exchange::ExchangeStatus;
use crate::session::Session;

const SNAPSHOT_MAGIC: [u8; 4] = *b"RNSS";
const SNAPSHOT_VERSION: u8 = 1;
const HEADER_SIZE: usize = SNAPSHOT_MAGIC.len() + 1;

/// The persistent fields of an exchange, as one serializable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableExchange {
    pub contact_id: u64,
    pub status: ExchangeStatus,
    pub session: Session,
    pub sent_t1: Option<Vec<u8>>,
    pub sent_t2_map: HashMap<ExchangeHash, Vec<u8>>,
    pub received_t1s: HashMap<ExchangeHash, Vec<u8>>,
    pub received_t2s: HashMap<ExchangeHash, Vec<u8>>,
    pub received_t3s: HashMap<ExchangeHash, Vec<u8>>,
    pub replied_t1s: HashMap<ExchangeHash, Vec<u8>>,
    pub replied_t2s: HashMap<ExchangeHash, Vec<u8>>,
    pub received_t1_alphas: HashMap<ExchangeHash, PublicKey>,
    pub decrypted_t1_betas: HashMap<ExchangeHash, PublicKey>,
}

/// Serialize an exchange record into a versioned snapshot blob.
pub fn marshal(exchange: &SerializableExchange) -> Result<Vec<u8>> {
    let body =
        serde_cbor::to_vec(exchange).map_err(|e| ReunionError::Serialization(e.to_string()))?;
    let mut blob = Vec::with_capacity(HEADER_SIZE + body.len());
    blob.extend_from_slice(&SNAPSHOT_MAGIC);
    blob.push(SNAPSHOT_VERSION);
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Deserialize a snapshot blob produced by [`marshal`].
pub fn unmarshal(data: &[u8]) -> Result<SerializableExchange> {
    if data.len() < HEADER_SIZE {
        return Err(ReunionError::Serialization(
            "snapshot shorter than header".to_string(),
        ));
    }
    if data[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(ReunionError::Serialization(
            "bad snapshot magic".to_string(),
        ));
    }
    let version = data[SNAPSHOT_MAGIC.len()];
    if version != SNAPSHOT_VERSION {
        return Err(ReunionError::Serialization(format!(
            "unsupported snapshot version: {}",
            version
        )));
    }
    // serde_cbor::from_slice rejects trailing bytes after the document.
    serde_cbor::from_slice(&data[HEADER_SIZE..])
        .map_err(|e| ReunionError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SerializableExchange {
        let mut session = Session::new(b"hello", &[0u8; 32], 3).unwrap();
        let t1 = session.generate_t1(b"AAA").unwrap();

        let peer = Session::new(b"hello", &[0u8; 32], 3).unwrap();
        let peer_alpha = peer.process_t1_alpha(&t1[..32]).unwrap().1;

        let mut ex = SerializableExchange {
            contact_id: 42,
            status: ExchangeStatus::T1Sent,
            session,
            sent_t1: Some(t1.clone()),
            sent_t2_map: HashMap::new(),
            received_t1s: HashMap::new(),
            received_t2s: HashMap::new(),
            received_t3s: HashMap::new(),
            replied_t1s: HashMap::new(),
            replied_t2s: HashMap::new(),
            received_t1_alphas: HashMap::new(),
            decrypted_t1_betas: HashMap::new(),
        };
        ex.received_t1s.insert([1u8; 32], t1);
        ex.replied_t1s.insert([1u8; 32], vec![5, 6, 7]);
        ex.received_t2s.insert([1u8; 32], vec![8; 60]);
        ex.received_t1_alphas.insert([1u8; 32], peer_alpha);
        ex.decrypted_t1_betas.insert([1u8; 32], peer_alpha);
        ex
    }

    #[test]
    fn test_roundtrip() {
        let ex = sample();
        let blob = marshal(&ex).unwrap();
        assert_eq!(unmarshal(&blob).unwrap(), ex);
    }

    #[test]
    fn test_rejects_short_blob() {
        assert!(unmarshal(b"RN").is_err());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut blob = marshal(&sample()).unwrap();
        blob[0] ^= 0xFF;
        assert!(unmarshal(&blob).is_err());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut blob = marshal(&sample()).unwrap();
        blob[4] = 2;
        let result = unmarshal(&blob);
        assert!(matches!(result, Err(ReunionError::Serialization(_))));
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut blob = marshal(&sample()).unwrap();
        blob.push(0);
        assert!(unmarshal(&blob).is_err());
    }
}
