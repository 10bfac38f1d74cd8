//! Key derivation functions using HKDF-SHA256 and HMAC-SHA256.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::crypto::KEY_SIZE;
use crate::error::{ReunionError, Result};

/// Protocol-specified info strings
pub const SESSION_INFO: &[u8] = b"reunion-v1 session";
pub const T2_INFO: &[u8] = b"reunion-v1 t2";
pub const T3_INFO: &[u8] = b"reunion-v1 t3";

type HmacSha256 = Hmac<Sha256>;

/// Derives a key using HKDF-SHA256
fn hkdf_expand(secret: &[u8], salt: Option<&[u8]>, info: &[u8]) -> [u8; KEY_SIZE] {
    let hk = Hkdf::<Sha256>::new(salt, secret);
    let mut out = [0u8; KEY_SIZE];
    hk.expand(info, &mut out)
        .expect("HKDF expansion should not fail with valid length");
    out
}

/// Derives the per-epoch symmetric keys from the shared triple.
///
/// Both keys are deterministic in `(passphrase, shared_random, epoch)`:
/// two sessions built from the same triple hold identical `k_beta` and
/// `k_gamma`.
///
/// # Returns
/// Tuple of (k_beta, k_gamma)
pub fn derive_session_keys(
    passphrase: &[u8],
    shared_random: &[u8],
    epoch: u64,
) -> Result<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
    if passphrase.is_empty() {
        return Err(ReunionError::KeyDerivation("empty passphrase".to_string()));
    }
    if shared_random.is_empty() {
        return Err(ReunionError::KeyDerivation(
            "empty shared random value".to_string(),
        ));
    }

    let mut info = SESSION_INFO.to_vec();
    info.extend_from_slice(&epoch.to_be_bytes());

    let hk = Hkdf::<Sha256>::new(Some(shared_random), passphrase);
    let mut out = [0u8; 2 * KEY_SIZE];
    hk.expand(&info, &mut out)
        .expect("HKDF expansion should not fail with valid length");

    let mut k_beta = [0u8; KEY_SIZE];
    let mut k_gamma = [0u8; KEY_SIZE];
    k_beta.copy_from_slice(&out[..KEY_SIZE]);
    k_gamma.copy_from_slice(&out[KEY_SIZE..]);
    Ok((k_beta, k_gamma))
}

/// Derives the T2 wrapping key from an ephemeral-ephemeral DH secret and
/// the deriving party's passphrase key.
///
/// Mixing `k_beta` in is what makes T2 unwrapping fail for a peer holding
/// a different passphrase.
pub fn derive_t2_key(dh_secret: &[u8; KEY_SIZE], k_beta: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut ikm = dh_secret.to_vec();
    ikm.extend_from_slice(k_beta);
    hkdf_expand(&ikm, None, T2_INFO)
}

/// Derives the T3 payload key from the identity-identity DH secret.
pub fn derive_t3_key(dh_secret: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    hkdf_expand(dh_secret, None, T3_INFO)
}

/// HMAC-SHA256 over the concatenation of the given parts; the gamma
/// authenticator of a T1.
pub fn mac(key: &[u8; KEY_SIZE], parts: &[&[u8]]) -> [u8; 32] {
    let mut m = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        m.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&m.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys_deterministic() {
        let (kb1, kg1) = derive_session_keys(b"hello", &[0u8; 32], 1).unwrap();
        let (kb2, kg2) = derive_session_keys(b"hello", &[0u8; 32], 1).unwrap();
        assert_eq!(kb1, kb2);
        assert_eq!(kg1, kg2);
        assert_ne!(kb1, kg1);
    }

    #[test]
    fn test_session_keys_separate_by_triple() {
        let base = derive_session_keys(b"hello", &[0u8; 32], 1).unwrap();
        assert_ne!(base, derive_session_keys(b"world", &[0u8; 32], 1).unwrap());
        assert_ne!(base, derive_session_keys(b"hello", &[1u8; 32], 1).unwrap());
        assert_ne!(base, derive_session_keys(b"hello", &[0u8; 32], 2).unwrap());
    }

    #[test]
    fn test_session_keys_reject_empty_inputs() {
        assert!(derive_session_keys(b"", &[0u8; 32], 1).is_err());
        assert!(derive_session_keys(b"hello", &[], 1).is_err());
    }

    #[test]
    fn test_t2_key_mixes_passphrase_key() {
        let dh = [3u8; KEY_SIZE];
        let k1 = derive_t2_key(&dh, &[1u8; KEY_SIZE]);
        let k2 = derive_t2_key(&dh, &[2u8; KEY_SIZE]);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_mac_deterministic() {
        let key = [9u8; KEY_SIZE];
        assert_eq!(mac(&key, &[b"a", b"b"]), mac(&key, &[b"ab"]));
        assert_ne!(mac(&key, &[b"a"]), mac(&[8u8; KEY_SIZE], &[b"a"]));
    }
}
