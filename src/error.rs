//! Error types for the Reunion protocol.

use thiserror::Error;

/// Result type alias for Reunion operations
pub type Result<T> = std::result::Result<T, ReunionError>;

/// Errors that can occur during a Reunion exchange
#[derive(Debug, Error)]
pub enum ReunionError {
    /// A wire message failed structural decoding
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// AEAD open failed (bad key, tampered ciphertext, or a peer
    /// holding a different passphrase)
    #[error("aead failure: {0}")]
    Aead(String),

    /// Key derivation failed
    #[error("key derivation failure: {0}")]
    KeyDerivation(String),

    /// The Reunion DB returned an error status, an unexpected response
    /// command, or the query transport failed
    #[error("reunion db failure: {0}")]
    Database(String),

    /// The Reunion DB handed back a state blob that violates the
    /// protocol (e.g. a message carrying neither a T2 nor a T3)
    #[error("invalid reunion state: {0}")]
    StateCorruption(String),

    /// The Reunion DB truncated its state response
    #[error("truncated reunion db state not supported")]
    Truncated,

    /// Shutdown was requested
    #[error("shutdown requested")]
    Shutdown,

    /// Snapshot encode/decode failed
    #[error("serialization failure: {0}")]
    Serialization(String),
}
