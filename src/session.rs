//! Session management for the Reunion rendezvous protocol.
//!
//! A [`Session`] holds the per-epoch cryptographic material of one party:
//! the ephemeral scalar behind the wire element alpha, the identity scalar
//! behind beta, and the two symmetric keys derived from
//! `(passphrase, shared_random, epoch)`. One Session per contact per epoch;
//! cross-epoch carryover is forbidden.

use serde::{Deserialize, Serialize};

use crate::crypto::{
    aead_open, aead_seal, hash32, PublicKey, SecretKey, KEY_SIZE, NONCE_SIZE, PUBLIC_KEY_SIZE,
    TAG_SIZE,
};
use crate::error::{ReunionError, Result};
use crate::kdf::{derive_session_keys, derive_t2_key, derive_t3_key, mac};

/// Encoded alpha element length in a T1
pub const ALPHA_SIZE: usize = PUBLIC_KEY_SIZE;

/// Sealed beta ciphertext length in a T1
pub const BETA_CT_SIZE: usize = NONCE_SIZE + PUBLIC_KEY_SIZE + TAG_SIZE;

/// Gamma authenticator length in a T1
pub const GAMMA_SIZE: usize = 32;

/// Total T1 wire message length
pub const T1_MESSAGE_SIZE: usize = ALPHA_SIZE + BETA_CT_SIZE + GAMMA_SIZE;

/// Total T2 wire message length
pub const T2_MESSAGE_SIZE: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// Structurally split a T1 into `(alpha_enc, beta_ct, gamma)`.
///
/// Performs no verification.
pub fn decode_t1_message(t1: &[u8]) -> Result<([u8; ALPHA_SIZE], Vec<u8>, [u8; GAMMA_SIZE])> {
    if t1.len() != T1_MESSAGE_SIZE {
        return Err(ReunionError::InvalidMessage(format!(
            "t1 must be {} bytes, got {}",
            T1_MESSAGE_SIZE,
            t1.len()
        )));
    }
    let mut alpha = [0u8; ALPHA_SIZE];
    alpha.copy_from_slice(&t1[..ALPHA_SIZE]);
    let beta_ct = t1[ALPHA_SIZE..ALPHA_SIZE + BETA_CT_SIZE].to_vec();
    let mut gamma = [0u8; GAMMA_SIZE];
    gamma.copy_from_slice(&t1[ALPHA_SIZE + BETA_CT_SIZE..]);
    Ok((alpha, beta_ct, gamma))
}

/// Open a T1's sealed beta with a candidate key recovered from a T2.
///
/// Failure means the T2 sender and the T1 author do not share our
/// passphrase.
pub fn decrypt_t1_beta(candidate_key: &[u8; KEY_SIZE], beta_ct: &[u8]) -> Result<PublicKey> {
    let pt = aead_open(candidate_key, &[], beta_ct)?;
    PublicKey::decode(&pt)
}

/// Per-epoch cryptographic session state for one contact.
///
/// Two sessions built from the same `(passphrase, shared_random, epoch)`
/// triple hold identical `k_beta` / `k_gamma` but fresh, distinct scalars.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Ephemeral scalar behind the wire element alpha
    alpha_secret: SecretKey,
    /// Identity scalar behind beta
    beta_secret: SecretKey,
    /// Symmetric key sealing beta inside the T1
    k_beta: [u8; KEY_SIZE],
    /// MAC key for the gamma authenticator
    k_gamma: [u8; KEY_SIZE],
    /// Epoch this session is bound to
    epoch: u64,
    /// Our own gamma, recorded once `generate_t1` has run
    gamma: Option<[u8; GAMMA_SIZE]>,
    /// Our own payload, recorded once `generate_t1` has run
    payload: Option<Vec<u8>>,
}

impl Session {
    /// Create a session for the given shared triple.
    pub fn new(passphrase: &[u8], shared_random: &[u8], epoch: u64) -> Result<Self> {
        let (k_beta, k_gamma) = derive_session_keys(passphrase, shared_random, epoch)?;
        Ok(Session {
            alpha_secret: SecretKey::generate(),
            beta_secret: SecretKey::generate(),
            k_beta,
            k_gamma,
            epoch,
            gamma: None,
            payload: None,
        })
    }

    /// Produce the T1 wire message: `alpha_enc || beta_ct || gamma`.
    ///
    /// The payload itself is not carried by the T1; it travels in the T3.
    /// A commitment to it is bound into gamma, and both it and gamma are
    /// retained for the later [`Session::compose_t3`].
    pub fn generate_t1(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let alpha_enc = PublicKey::from(&self.alpha_secret).encode();
        let beta_enc = PublicKey::from(&self.beta_secret).encode();
        let beta_ct = aead_seal(&self.k_beta, &[], &beta_enc);

        let payload_commitment = hash32(&[payload]);
        let gamma = mac(&self.k_gamma, &[&alpha_enc, &beta_ct, &payload_commitment]);

        self.gamma = Some(gamma);
        self.payload = Some(payload.to_vec());

        let mut t1 = Vec::with_capacity(T1_MESSAGE_SIZE);
        t1.extend_from_slice(&alpha_enc);
        t1.extend_from_slice(&beta_ct);
        t1.extend_from_slice(&gamma);
        Ok(t1)
    }

    /// Respond to a foreign T1's alpha: derive the ephemeral-ephemeral
    /// secret and seal our passphrase key under it.
    ///
    /// # Returns
    /// Tuple of (t2 wire message, decoded peer alpha)
    pub fn process_t1_alpha(&self, alpha_enc: &[u8]) -> Result<(Vec<u8>, PublicKey)> {
        let alpha_pub = PublicKey::decode(alpha_enc)?;
        let dh = self.alpha_secret.diffie_hellman(&alpha_pub);
        let t2_key = derive_t2_key(&dh, &self.k_beta);
        let t2 = aead_seal(&t2_key, &[], &self.k_beta);
        Ok((t2, alpha_pub))
    }

    /// Recover the candidate beta key from a T2 addressed to our T1.
    ///
    /// `alpha_pub` is the stored alpha of the T2's sender. The unwrap key
    /// mixes our own passphrase key, so this fails with an AEAD error for
    /// a sender holding a different passphrase.
    pub fn candidate_key(&self, t2: &[u8], alpha_pub: &PublicKey) -> Result<[u8; KEY_SIZE]> {
        if t2.len() != T2_MESSAGE_SIZE {
            return Err(ReunionError::InvalidMessage(format!(
                "t2 must be {} bytes, got {}",
                T2_MESSAGE_SIZE,
                t2.len()
            )));
        }
        let dh = self.alpha_secret.diffie_hellman(alpha_pub);
        let t2_key = derive_t2_key(&dh, &self.k_beta);
        let pt = aead_open(&t2_key, &[], t2)?;
        pt.as_slice().try_into().map_err(|_| {
            ReunionError::InvalidMessage(format!("t2 plaintext must be {} bytes", KEY_SIZE))
        })
    }

    /// Seal our payload for the peer behind `beta_pub`, authenticated
    /// with our own gamma as associated data.
    pub fn compose_t3(&self, beta_pub: &PublicKey) -> Result<Vec<u8>> {
        let gamma = self.gamma.as_ref().ok_or_else(|| {
            ReunionError::KeyDerivation("t3 requires a previously generated t1".to_string())
        })?;
        let payload = self.payload.as_ref().ok_or_else(|| {
            ReunionError::KeyDerivation("t3 requires a previously generated t1".to_string())
        })?;
        let dh = self.beta_secret.diffie_hellman(beta_pub);
        let t3_key = derive_t3_key(&dh);
        Ok(aead_seal(&t3_key, gamma, payload))
    }

    /// Open a peer's T3 with their gamma (recovered from their T1) and
    /// their decrypted beta.
    ///
    /// # Returns
    /// The peer's payload
    pub fn process_t3(
        &self,
        t3: &[u8],
        gamma: &[u8; GAMMA_SIZE],
        beta_pub: &PublicKey,
    ) -> Result<Vec<u8>> {
        let dh = self.beta_secret.diffie_hellman(beta_pub);
        let t3_key = derive_t3_key(&dh);
        aead_open(&t3_key, gamma, t3)
    }

    /// Epoch this session is bound to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Payload recorded by `generate_t1`, if any.
    pub(crate) fn payload(&self) -> Option<&Vec<u8>> {
        self.payload.as_ref()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
