//! # Reunion
//!
//! Reunion is a rendezvous protocol: two parties sharing a low-entropy
//! passphrase (plus public per-epoch randomness) discover each other
//! through an untrusted append-only bulletin board and exchange a short
//! payload, without revealing the passphrase, the payload, or their
//! identities to the board or to other participants.
//!
//! ## Features
//!
//! - Three-message `T1 / T2 / T3` exchange with identity-blinded key
//!   material on the wire
//! - Per-epoch sessions; no cross-epoch carryover
//! - Crash-safe: every state transition is emitted as a snapshot that a
//!   host can feed back into [`Exchange::from_snapshot`]
//! - Pluggable bulletin board behind the [`ReunionDatabase`] trait, with
//!   an in-memory reference implementation
//!
//! ## Example
//!
//! ```rust,ignore
//! use reunion::{Exchange, MemoryDatabase, ReunionUpdate};
//!
//! // Spawn one Exchange per contact and drain its update channel;
//! // see the exchange module tests for full two-party runs.
//! ```

mod commands;
mod crypto;
mod db;
mod error;
mod exchange;
mod kdf;
mod session;
mod snapshot;

pub use commands::{
    Command, ExchangeHash, FetchState, MessageResponse, Response, SendT1, SendT2, SendT3,
    StateResponse, RESPONSE_STATUS_OK,
};
pub use crypto::{
    aead_open, aead_seal, hash32, rand_bytes, PublicKey, SecretKey, KEY_SIZE, NONCE_SIZE,
    PUBLIC_KEY_SIZE, TAG_SIZE,
};
pub use db::{
    MemoryDatabase, RequestedReunionState, ReunionDatabase, Shutdown, StateMessage,
};
pub use error::{ReunionError, Result};
pub use exchange::{Exchange, ExchangeStatus, ReunionUpdate};
pub use session::{
    decode_t1_message, decrypt_t1_beta, Session, ALPHA_SIZE, BETA_CT_SIZE, GAMMA_SIZE,
    T1_MESSAGE_SIZE, T2_MESSAGE_SIZE,
};
