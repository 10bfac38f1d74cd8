//! Reunion DB client contract and the reference in-memory board.
//!
//! The board is an untrusted append-only store keyed by
//! `(epoch, t1_hash)`. Transport to a real board (TCP, QUIC, mixnet) is a
//! host concern; this module fixes only the query contract and ships an
//! in-memory implementation for embedding and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::commands::{
    Command, ExchangeHash, MessageResponse, Response, StateResponse, RESPONSE_STATUS_OK,
};
use crate::crypto::hash32;
use crate::error::{ReunionError, Result};

/// One-shot, idempotent cancellation handle.
///
/// Cloned freely; every clone observes the same signal. Checked by the
/// exchange driver at loop boundaries and by database clients during
/// pending I/O.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Idempotent.
    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been raised.
    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Client contract against a Reunion DB.
///
/// `query` blocks until a response arrives, the transport fails, or
/// `cancel` is observed (in which case it must return
/// [`ReunionError::Shutdown`] promptly). Implementations are shared
/// across exchange drivers and must be safe to call from any of them.
pub trait ReunionDatabase: Send + Sync {
    fn query(&self, cmd: Command, cancel: &Shutdown) -> Result<Response>;
}

/// A T2 or T3 addressed to the requested T1, as carried inside a
/// `StateResponse`. Exactly one of the payload fields is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    pub src_t1_hash: ExchangeHash,
    pub t2_payload: Option<Vec<u8>>,
    pub t3_payload: Option<Vec<u8>>,
}

/// Board state relevant to one T1: every T1 of the epoch plus the
/// T2/T3 messages addressed to the requested T1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestedReunionState {
    pub t1_map: HashMap<ExchangeHash, Vec<u8>>,
    pub messages: Vec<StateMessage>,
}

impl RequestedReunionState {
    /// Serialize to the CBOR payload carried by a `StateResponse`.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| ReunionError::Serialization(e.to_string()))
    }

    /// Deserialize from a `StateResponse` payload.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        serde_cbor::from_slice(data).map_err(|e| ReunionError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BoardMessage {
    src_t1_hash: ExchangeHash,
    dst_t1_hash: ExchangeHash,
    t2_payload: Option<Vec<u8>>,
    t3_payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct EpochState {
    t1_map: HashMap<ExchangeHash, Vec<u8>>,
    messages: Vec<BoardMessage>,
}

/// Reference in-memory Reunion DB.
///
/// Append-only per epoch; duplicate submissions coalesce, so a resumed
/// exchange replaying a send is invisible to readers.
#[derive(Default)]
pub struct MemoryDatabase {
    epochs: Mutex<HashMap<u64, EpochState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of T1s stored for an epoch.
    pub fn t1_count(&self, epoch: u64) -> usize {
        self.epochs
            .lock()
            .get(&epoch)
            .map(|state| state.t1_map.len())
            .unwrap_or(0)
    }

    fn append_message(&self, epoch: u64, message: BoardMessage) {
        let mut epochs = self.epochs.lock();
        let state = epochs.entry(epoch).or_default();
        if !state.messages.contains(&message) {
            state.messages.push(message);
        }
    }
}

impl ReunionDatabase for MemoryDatabase {
    fn query(&self, cmd: Command, cancel: &Shutdown) -> Result<Response> {
        if cancel.is_signaled() {
            return Err(ReunionError::Shutdown);
        }
        match cmd {
            Command::SendT1(cmd) => {
                let t1_hash = hash32(&[&cmd.payload]);
                self.epochs
                    .lock()
                    .entry(cmd.epoch)
                    .or_default()
                    .t1_map
                    .insert(t1_hash, cmd.payload);
                Ok(Response::Message(MessageResponse {
                    error_code: RESPONSE_STATUS_OK,
                }))
            }
            Command::SendT2(cmd) => {
                self.append_message(
                    cmd.epoch,
                    BoardMessage {
                        src_t1_hash: cmd.src_t1_hash,
                        dst_t1_hash: cmd.dst_t1_hash,
                        t2_payload: Some(cmd.payload),
                        t3_payload: None,
                    },
                );
                Ok(Response::Message(MessageResponse {
                    error_code: RESPONSE_STATUS_OK,
                }))
            }
            Command::SendT3(cmd) => {
                self.append_message(
                    cmd.epoch,
                    BoardMessage {
                        src_t1_hash: cmd.src_t1_hash,
                        dst_t1_hash: cmd.dst_t1_hash,
                        t2_payload: None,
                        t3_payload: Some(cmd.payload),
                    },
                );
                Ok(Response::Message(MessageResponse {
                    error_code: RESPONSE_STATUS_OK,
                }))
            }
            Command::FetchState(cmd) => {
                let epochs = self.epochs.lock();
                let mut state = RequestedReunionState::default();
                if let Some(epoch_state) = epochs.get(&cmd.epoch) {
                    state.t1_map = epoch_state.t1_map.clone();
                    state.messages = epoch_state
                        .messages
                        .iter()
                        .filter(|m| m.dst_t1_hash == cmd.t1_hash)
                        .map(|m| StateMessage {
                            src_t1_hash: m.src_t1_hash,
                            t2_payload: m.t2_payload.clone(),
                            t3_payload: m.t3_payload.clone(),
                        })
                        .collect();
                }
                let payload = state.marshal()?;
                Ok(Response::State(StateResponse {
                    error_code: RESPONSE_STATUS_OK,
                    truncated: false,
                    payload,
                }))
            }
        }
    }
}
