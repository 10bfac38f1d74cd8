//! The per-contact exchange state machine.
//!
//! An [`Exchange`] owns one [`Session`], the payload to deliver, and every
//! T-message map of the protocol. Its [`Exchange::run`] drives the
//! `T1 / T2 / T3` sequence against a [`ReunionDatabase`] until a peer's
//! payload is recovered, a fatal error occurs, or shutdown is requested.
//!
//! For the linked protocol variant: for every other T1 on the board a
//! respective T2 is sent, and for every T2 received in reply to our own
//! T1 a T3 is sent.
//!
//! Exactly one task mutates an Exchange; the maps carry no locks. The
//! driver persists its state by emitting a snapshot on the update channel
//! after every step, so a host can resume a crashed exchange with
//! [`Exchange::from_snapshot`].

use std::collections::HashMap;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::commands::{
    Command, ExchangeHash, FetchState, Response, SendT1, SendT2, SendT3, RESPONSE_STATUS_OK,
};
use crate::crypto::{hash32, PublicKey};
use crate::db::{RequestedReunionState, ReunionDatabase, Shutdown};
use crate::error::{ReunionError, Result};
use crate::session::{decode_t1_message, decrypt_t1_beta, Session};
use crate::snapshot::{self, SerializableExchange};

/// An update to the exchange state or a report of its failure.
///
/// Exactly one of `error`, `serialized` and `result` is meaningful.
/// `serialized` carries a durable snapshot; `result` carries the peer's
/// decrypted payload and is terminal, as is `error`.
#[derive(Debug)]
pub struct ReunionUpdate {
    /// The unique contact identity.
    pub contact_id: u64,
    /// A fatal error, or `None`.
    pub error: Option<ReunionError>,
    /// The serialized exchange state.
    pub serialized: Option<Vec<u8>>,
    /// The received decrypted payload.
    pub result: Option<Vec<u8>>,
}

/// Exchange FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeStatus {
    /// No T1 published yet.
    Initial,
    /// Our T1 is on the board; the reply loop is running.
    T1Sent,
}

/// Client key material and protocol state for one contact.
pub struct Exchange {
    db: Arc<dyn ReunionDatabase>,
    update_tx: SyncSender<ReunionUpdate>,
    shutdown: Shutdown,

    status: ExchangeStatus,
    contact_id: u64,
    session: Session,

    payload: Vec<u8>,

    sent_t1: Option<Vec<u8>>,

    /// t2 hash -> t2
    sent_t2_map: HashMap<ExchangeHash, Vec<u8>>,

    /// t1 hash -> t1
    received_t1s: HashMap<ExchangeHash, Vec<u8>>,
    /// src t1 hash -> t2
    received_t2s: HashMap<ExchangeHash, Vec<u8>>,
    /// src t1 hash -> t3
    received_t3s: HashMap<ExchangeHash, Vec<u8>>,

    /// t1 hash -> t1
    replied_t1s: HashMap<ExchangeHash, Vec<u8>>,
    /// t2 hash -> t2
    replied_t2s: HashMap<ExchangeHash, Vec<u8>>,

    /// t1 hash -> decoded t1 alpha element
    received_t1_alphas: HashMap<ExchangeHash, PublicKey>,
    /// t1 hash -> beta recovered via a successful candidate key
    decrypted_t1_betas: HashMap<ExchangeHash, PublicKey>,
}

impl Exchange {
    /// Create a new exchange for one contact and epoch.
    pub fn new(
        payload: Vec<u8>,
        db: Arc<dyn ReunionDatabase>,
        contact_id: u64,
        passphrase: &[u8],
        shared_random: &[u8],
        epoch: u64,
        update_tx: SyncSender<ReunionUpdate>,
    ) -> Result<Self> {
        let session = Session::new(passphrase, shared_random, epoch)?;
        Ok(Exchange {
            db,
            update_tx,
            shutdown: Shutdown::new(),
            status: ExchangeStatus::Initial,
            contact_id,
            session,
            payload,
            sent_t1: None,
            sent_t2_map: HashMap::new(),
            received_t1s: HashMap::new(),
            received_t2s: HashMap::new(),
            received_t3s: HashMap::new(),
            replied_t1s: HashMap::new(),
            replied_t2s: HashMap::new(),
            received_t1_alphas: HashMap::new(),
            decrypted_t1_betas: HashMap::new(),
        })
    }

    /// Reconstruct an exchange from a snapshot blob.
    pub fn from_snapshot(
        serialized: &[u8],
        db: Arc<dyn ReunionDatabase>,
        update_tx: SyncSender<ReunionUpdate>,
    ) -> Result<Self> {
        let state = snapshot::unmarshal(serialized)?;
        let payload = state.session.payload().cloned().unwrap_or_default();
        Ok(Exchange {
            db,
            update_tx,
            shutdown: Shutdown::new(),
            status: state.status,
            contact_id: state.contact_id,
            session: state.session,
            payload,
            sent_t1: state.sent_t1,
            sent_t2_map: state.sent_t2_map,
            received_t1s: state.received_t1s,
            received_t2s: state.received_t2s,
            received_t3s: state.received_t3s,
            replied_t1s: state.replied_t1s,
            replied_t2s: state.replied_t2s,
            received_t1_alphas: state.received_t1_alphas,
            decrypted_t1_betas: state.decrypted_t1_betas,
        })
    }

    /// The contact this exchange belongs to.
    pub fn contact_id(&self) -> u64 {
        self.contact_id
    }

    /// Cancellation handle for this exchange. Signalling it makes the
    /// driver emit a final shutdown error update and exit.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    fn serializable(&self) -> SerializableExchange {
        SerializableExchange {
            contact_id: self.contact_id,
            status: self.status,
            session: self.session.clone(),
            sent_t1: self.sent_t1.clone(),
            sent_t2_map: self.sent_t2_map.clone(),
            received_t1s: self.received_t1s.clone(),
            received_t2s: self.received_t2s.clone(),
            received_t3s: self.received_t3s.clone(),
            replied_t1s: self.replied_t1s.clone(),
            replied_t2s: self.replied_t2s.clone(),
            received_t1_alphas: self.received_t1_alphas.clone(),
            decrypted_t1_betas: self.decrypted_t1_betas.clone(),
        }
    }

    fn my_t1_hash(&self) -> ExchangeHash {
        hash32(&[self.sent_t1.as_deref().unwrap_or(&[])])
    }

    /// Emit a final error update. The channel consumer may already be
    /// gone; nothing more can be done about the error in that case.
    fn emit_error(&self, error: ReunionError) {
        log::error!("reunion exchange {}: {}", self.contact_id, error);
        let _ = self.update_tx.send(ReunionUpdate {
            contact_id: self.contact_id,
            error: Some(error),
            serialized: None,
            result: None,
        });
    }

    /// Persist the current state through the update channel. Returns
    /// false if the driver must stop (consumer gone or state
    /// unserializable).
    fn emit_snapshot(&self) -> bool {
        match snapshot::marshal(&self.serializable()) {
            Ok(blob) => self
                .update_tx
                .send(ReunionUpdate {
                    contact_id: self.contact_id,
                    error: None,
                    serialized: Some(blob),
                    result: None,
                })
                .is_ok(),
            Err(e) => {
                self.emit_error(e);
                false
            }
        }
    }

    fn emit_result(&self, plaintext: Vec<u8>) {
        let _ = self.update_tx.send(ReunionUpdate {
            contact_id: self.contact_id,
            error: None,
            serialized: None,
            result: Some(plaintext),
        });
    }

    /// Check the cancellation signal, emitting the terminal shutdown
    /// update if it was raised.
    fn shutdown_requested(&self) -> bool {
        if self.shutdown.is_signaled() {
            self.emit_error(ReunionError::Shutdown);
            true
        } else {
            false
        }
    }

    fn expect_message_ok(&self, response: Response) -> Result<()> {
        match response {
            Response::Message(resp) if resp.error_code == RESPONSE_STATUS_OK => Ok(()),
            Response::Message(resp) => Err(ReunionError::Database(format!(
                "error status code from the reunion db: {}",
                resp.error_code
            ))),
            Response::State(_) => Err(ReunionError::Database(
                "wrong response command received".to_string(),
            )),
        }
    }

    /// Generate and publish our T1.
    fn send_t1(&mut self) -> Result<()> {
        let t1 = self.session.generate_t1(&self.payload)?;
        let cmd = Command::SendT1(SendT1 {
            epoch: self.session.epoch(),
            payload: t1.clone(),
        });
        self.sent_t1 = Some(t1);
        let response = self.db.query(cmd, &self.shutdown)?;
        self.expect_message_ok(response)
    }

    /// Merge a fetched board state into the local maps.
    fn process_state(&mut self, state: RequestedReunionState) -> Result<()> {
        let my_t1_hash = self.my_t1_hash();
        let mut new_items = 0usize;
        for (t1_hash, t1) in state.t1_map {
            if !self.received_t1s.contains_key(&t1_hash) {
                self.received_t1s.insert(t1_hash, t1);
                new_items += 1;
            }
        }
        for message in state.messages {
            // We never answer ourselves; drop anything claiming our own
            // T1 as its source.
            if message.src_t1_hash == my_t1_hash {
                continue;
            }
            match (message.t2_payload, message.t3_payload) {
                (Some(t2), None) if !t2.is_empty() => {
                    if !self.received_t2s.contains_key(&message.src_t1_hash) {
                        self.received_t2s.insert(message.src_t1_hash, t2);
                        new_items += 1;
                    }
                }
                (None, Some(t3)) if !t3.is_empty() => {
                    if !self.received_t3s.contains_key(&message.src_t1_hash) {
                        self.received_t3s.insert(message.src_t1_hash, t3);
                        new_items += 1;
                    }
                }
                _ => {
                    return Err(ReunionError::StateCorruption(
                        "message carries neither a t2 nor a t3 payload".to_string(),
                    ))
                }
            }
        }
        if new_items > 0 {
            log::debug!(
                "reunion exchange {}: merged {} new board items",
                self.contact_id,
                new_items
            );
        }
        Ok(())
    }

    /// Fetch the board state addressed to our T1 and merge it.
    fn fetch_state(&mut self) -> Result<()> {
        let cmd = Command::FetchState(FetchState {
            epoch: self.session.epoch(),
            t1_hash: self.my_t1_hash(),
        });
        let response = self.db.query(cmd, &self.shutdown)?;
        let resp = match response {
            Response::State(resp) => resp,
            Response::Message(_) => {
                return Err(ReunionError::Database(
                    "wrong response command received".to_string(),
                ))
            }
        };
        if resp.error_code != RESPONSE_STATUS_OK {
            return Err(ReunionError::Database(format!(
                "error status code from the reunion db: {}",
                resp.error_code
            )));
        }
        if resp.truncated {
            return Err(ReunionError::Truncated);
        }
        let state = RequestedReunionState::unmarshal(&resp.payload)
            .map_err(|e| ReunionError::StateCorruption(e.to_string()))?;
        self.process_state(state)
    }

    /// Send one T2 in reply to every foreign T1 not yet answered.
    ///
    /// Cryptographic failures on a single T1 skip that peer and leave it
    /// unmarked so a later iteration can retry; database failures are
    /// fatal. T1s are processed in ascending hash order.
    fn send_t2_messages(&mut self) -> Result<()> {
        let my_t1_hash = self.my_t1_hash();

        let mut pending: Vec<ExchangeHash> = self.received_t1s.keys().copied().collect();
        pending.sort_unstable();

        for t1_hash in pending {
            if t1_hash == my_t1_hash {
                continue;
            }
            if self.replied_t1s.contains_key(&t1_hash) {
                continue;
            }
            let t1 = match self.received_t1s.get(&t1_hash) {
                Some(t1) => t1.clone(),
                None => continue,
            };
            let (alpha_enc, _, _) = match decode_t1_message(&t1) {
                Ok(parts) => parts,
                Err(e) => {
                    log::warn!(
                        "reunion exchange {}: skipping undecodable t1: {}",
                        self.contact_id,
                        e
                    );
                    continue;
                }
            };
            let (t2, alpha_pub) = match self.session.process_t1_alpha(&alpha_enc) {
                Ok(out) => out,
                Err(e) => {
                    log::warn!(
                        "reunion exchange {}: skipping t1 alpha: {}",
                        self.contact_id,
                        e
                    );
                    continue;
                }
            };

            self.received_t1_alphas.insert(t1_hash, alpha_pub);

            let cmd = Command::SendT2(SendT2 {
                epoch: self.session.epoch(),
                src_t1_hash: my_t1_hash,
                dst_t1_hash: t1_hash,
                payload: t2.clone(),
            });
            let response = self.db.query(cmd, &self.shutdown)?;
            self.expect_message_ok(response)?;

            self.sent_t2_map.insert(hash32(&[&t2]), t2);
            self.replied_t1s.insert(t1_hash, t1);
        }
        Ok(())
    }

    /// Send one T3 for every T2 addressed to our T1 whose candidate key
    /// unwraps the sender's beta.
    ///
    /// A T2 whose matching T1 has not arrived yet is skipped silently; a
    /// T2 failing the AEAD check belongs to a peer with a different
    /// passphrase and is skipped without being marked replied.
    fn send_t3_messages(&mut self) -> Result<()> {
        let my_t1_hash = self.my_t1_hash();

        let mut pending: Vec<ExchangeHash> = self.received_t2s.keys().copied().collect();
        pending.sort_unstable();

        for src_t1_hash in pending {
            let t2 = match self.received_t2s.get(&src_t1_hash) {
                Some(t2) => t2.clone(),
                None => continue,
            };
            let t2_hash = hash32(&[&t2]);
            if self.replied_t2s.contains_key(&t2_hash) {
                continue;
            }
            // No alpha stored means the matching T1 has not been seen
            // yet; a later iteration will get to it.
            let alpha_pub = match self.received_t1_alphas.get(&src_t1_hash) {
                Some(alpha) => *alpha,
                None => continue,
            };
            let candidate_key = match self.session.candidate_key(&t2, &alpha_pub) {
                Ok(key) => key,
                Err(e) => {
                    log::debug!(
                        "reunion exchange {}: t2 candidate key rejected (different passphrase?): {}",
                        self.contact_id,
                        e
                    );
                    continue;
                }
            };
            let t1 = match self.received_t1s.get(&src_t1_hash) {
                Some(t1) => t1.clone(),
                None => continue,
            };
            let (_, beta_ct, _) = match decode_t1_message(&t1) {
                Ok(parts) => parts,
                Err(e) => {
                    log::warn!(
                        "reunion exchange {}: skipping undecodable t1: {}",
                        self.contact_id,
                        e
                    );
                    continue;
                }
            };
            let beta = match decrypt_t1_beta(&candidate_key, &beta_ct) {
                Ok(beta) => beta,
                Err(e) => {
                    log::debug!(
                        "reunion exchange {}: t1 beta rejected (different passphrase?): {}",
                        self.contact_id,
                        e
                    );
                    continue;
                }
            };
            let t3 = match self.session.compose_t3(&beta) {
                Ok(t3) => t3,
                Err(e) => {
                    log::warn!(
                        "reunion exchange {}: t3 composition failed: {}",
                        self.contact_id,
                        e
                    );
                    continue;
                }
            };

            let cmd = Command::SendT3(SendT3 {
                epoch: self.session.epoch(),
                src_t1_hash: my_t1_hash,
                dst_t1_hash: src_t1_hash,
                payload: t3,
            });
            let response = self.db.query(cmd, &self.shutdown)?;
            self.expect_message_ok(response)?;

            self.decrypted_t1_betas.insert(src_t1_hash, beta);
            self.replied_t2s.insert(t2_hash, t2);
        }
        Ok(())
    }

    /// Try to decrypt every T3 addressed to our T1. Returns the first
    /// recovered payload, if any. Failures are per-peer: another peer's
    /// T3 may still succeed.
    fn process_t3_messages(&mut self) -> Option<Vec<u8>> {
        let mut pending: Vec<ExchangeHash> = self.received_t3s.keys().copied().collect();
        pending.sort_unstable();

        for src_t1_hash in pending {
            let beta = match self.decrypted_t1_betas.get(&src_t1_hash) {
                Some(beta) => *beta,
                None => continue,
            };
            let t3 = match self.received_t3s.get(&src_t1_hash) {
                Some(t3) => t3.clone(),
                None => continue,
            };
            let t1 = match self.received_t1s.get(&src_t1_hash) {
                Some(t1) => t1.clone(),
                None => {
                    log::warn!(
                        "reunion exchange {}: t3 source t1 missing from map",
                        self.contact_id
                    );
                    continue;
                }
            };
            let (_, _, gamma) = match decode_t1_message(&t1) {
                Ok(parts) => parts,
                Err(e) => {
                    log::warn!(
                        "reunion exchange {}: skipping undecodable t1: {}",
                        self.contact_id,
                        e
                    );
                    continue;
                }
            };
            match self.session.process_t3(&t3, &gamma, &beta) {
                Ok(plaintext) => return Some(plaintext),
                Err(e) => {
                    log::warn!(
                        "reunion exchange {}: t3 processing failed: {}",
                        self.contact_id,
                        e
                    );
                    continue;
                }
            }
        }
        None
    }

    /// Perform the exchange. Meant to run on its own thread; emits a
    /// snapshot update after every step and terminates on success, fatal
    /// error or cancellation.
    pub fn run(mut self) {
        log::debug!("reunion exchange {}: driver started", self.contact_id);

        if self.status == ExchangeStatus::Initial {
            if let Err(e) = self.send_t1() {
                self.emit_error(e);
                return;
            }
            self.status = ExchangeStatus::T1Sent;
            if !self.emit_snapshot() {
                return;
            }
            if self.shutdown_requested() {
                return;
            }
        }

        loop {
            if let Err(e) = self.fetch_state() {
                self.emit_error(e);
                return;
            }
            if !self.emit_snapshot() {
                return;
            }
            if self.shutdown_requested() {
                return;
            }

            if let Err(e) = self.send_t2_messages() {
                self.emit_error(e);
                return;
            }
            if !self.emit_snapshot() {
                return;
            }
            if self.shutdown_requested() {
                return;
            }

            if let Err(e) = self.send_t3_messages() {
                self.emit_error(e);
                return;
            }
            if !self.emit_snapshot() {
                return;
            }
            if self.shutdown_requested() {
                return;
            }

            if let Some(plaintext) = self.process_t3_messages() {
                log::debug!("reunion exchange {}: completed", self.contact_id);
                self.emit_result(plaintext);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{MessageResponse, StateResponse};
    use crate::db::{MemoryDatabase, StateMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::{sync_channel, Receiver};
    use std::thread;
    use std::time::Duration;

    const SHARED_RANDOM: [u8; 32] = [0u8; 32];
    const EPOCH: u64 = 1;

    struct Party {
        driver: thread::JoinHandle<()>,
        collector: thread::JoinHandle<Vec<ReunionUpdate>>,
        shutdown: Shutdown,
    }

    impl Party {
        fn finish(self) -> Vec<ReunionUpdate> {
            self.driver.join().expect("driver panicked");
            self.collector.join().expect("collector panicked")
        }
    }

    fn collect(rx: Receiver<ReunionUpdate>) -> thread::JoinHandle<Vec<ReunionUpdate>> {
        thread::spawn(move || {
            let mut updates = Vec::new();
            while let Ok(update) = rx.recv() {
                updates.push(update);
            }
            updates
        })
    }

    fn spawn_party(
        db: Arc<dyn ReunionDatabase>,
        contact_id: u64,
        passphrase: &[u8],
        payload: &[u8],
    ) -> Party {
        let (tx, rx) = sync_channel(1);
        let exchange = Exchange::new(
            payload.to_vec(),
            db,
            contact_id,
            passphrase,
            &SHARED_RANDOM,
            EPOCH,
            tx,
        )
        .unwrap();
        let shutdown = exchange.shutdown_handle();
        Party {
            driver: thread::spawn(move || exchange.run()),
            collector: collect(rx),
            shutdown,
        }
    }

    fn snapshots(updates: &[ReunionUpdate]) -> Vec<SerializableExchange> {
        updates
            .iter()
            .filter_map(|u| u.serialized.as_deref())
            .map(|blob| snapshot::unmarshal(blob).unwrap())
            .collect()
    }

    fn terminal_result(updates: &[ReunionUpdate]) -> Option<&Vec<u8>> {
        updates.last().and_then(|u| u.result.as_ref())
    }

    #[test]
    fn test_pair_succeeds() {
        let db = Arc::new(MemoryDatabase::new());
        let a = spawn_party(db.clone(), 1, b"hello", b"AAA");
        let b = spawn_party(db.clone(), 2, b"hello", b"BBB");

        let a_updates = a.finish();
        let b_updates = b.finish();

        assert_eq!(terminal_result(&a_updates).unwrap(), b"BBB");
        assert_eq!(terminal_result(&b_updates).unwrap(), b"AAA");

        // Reply maps only ever grow, and we never answer our own T1.
        for updates in [&a_updates, &b_updates] {
            let states = snapshots(updates);
            let mut prev_t1s = 0;
            let mut prev_t2s = 0;
            for state in &states {
                let own_hash = hash32(&[state.sent_t1.as_deref().unwrap_or(&[])]);
                assert!(!state.replied_t1s.contains_key(&own_hash));
                assert!(state.replied_t1s.len() >= prev_t1s);
                assert!(state.replied_t2s.len() >= prev_t2s);
                prev_t1s = state.replied_t1s.len();
                prev_t2s = state.replied_t2s.len();
            }
        }
    }

    #[test]
    fn test_mismatched_passphrases_never_complete() {
        let db = Arc::new(MemoryDatabase::new());
        let a = spawn_party(db.clone(), 1, b"hello", b"AAA");
        let b = spawn_party(db.clone(), 2, b"world", b"BBB");

        thread::sleep(Duration::from_millis(200));
        a.shutdown.signal();
        b.shutdown.signal();

        for party_updates in [a.finish(), b.finish()] {
            assert!(party_updates.iter().all(|u| u.result.is_none()));
            let last = party_updates.last().unwrap();
            assert!(matches!(last.error, Some(ReunionError::Shutdown)));
        }
    }

    #[test]
    fn test_third_party_noise_does_not_block_pair() {
        let db = Arc::new(MemoryDatabase::new());

        // C's T1 is on the board before A and B start, so both will
        // answer it with a T2 and then reject C's replies.
        let c = spawn_party(db.clone(), 3, b"other", b"CCC");
        while db.t1_count(EPOCH) < 1 {
            thread::sleep(Duration::from_millis(5));
        }

        let a = spawn_party(db.clone(), 1, b"hello", b"AAA");
        let b = spawn_party(db.clone(), 2, b"hello", b"BBB");

        let a_updates = a.finish();
        let b_updates = b.finish();
        c.shutdown.signal();
        let c_updates = c.finish();

        assert_eq!(terminal_result(&a_updates).unwrap(), b"BBB");
        assert_eq!(terminal_result(&b_updates).unwrap(), b"AAA");
        assert!(c_updates.iter().all(|u| u.result.is_none()));

        // A replied a T2 to C's T1 (that step is passphrase-blind) but
        // never got past C's T2: exactly one T3 partner.
        let a_final = snapshots(&a_updates).pop().unwrap();
        let b_final = snapshots(&b_updates).pop().unwrap();
        let b_t1_hash = hash32(&[b_final.sent_t1.as_deref().unwrap()]);
        assert_eq!(a_final.replied_t2s.len(), 1);
        assert_eq!(
            a_final.decrypted_t1_betas.keys().collect::<Vec<_>>(),
            vec![&b_t1_hash]
        );
        assert_eq!(a_final.replied_t1s.len(), 2);
    }

    /// Forwards to a MemoryDatabase, counts T2/T3 sends and signals the
    /// given handle after the first successful T2.
    struct GateDatabase {
        inner: Arc<MemoryDatabase>,
        t2_sends: AtomicUsize,
        t3_sends: AtomicUsize,
        gate: parking_lot::Mutex<Option<Shutdown>>,
    }

    impl GateDatabase {
        fn new(inner: Arc<MemoryDatabase>) -> Self {
            GateDatabase {
                inner,
                t2_sends: AtomicUsize::new(0),
                t3_sends: AtomicUsize::new(0),
                gate: parking_lot::Mutex::new(None),
            }
        }
    }

    impl ReunionDatabase for GateDatabase {
        fn query(&self, cmd: Command, cancel: &Shutdown) -> Result<Response> {
            let is_t2 = matches!(cmd, Command::SendT2(_));
            let is_t3 = matches!(cmd, Command::SendT3(_));
            let response = self.inner.query(cmd, cancel)?;
            if is_t2 && self.t2_sends.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(shutdown) = self.gate.lock().take() {
                    shutdown.signal();
                }
            }
            if is_t3 {
                self.t3_sends.fetch_add(1, Ordering::SeqCst);
            }
            Ok(response)
        }
    }

    #[test]
    fn test_resume_from_snapshot_sends_no_duplicates() {
        let board = Arc::new(MemoryDatabase::new());
        let gate_db = Arc::new(GateDatabase::new(board.clone()));

        let b = spawn_party(board.clone(), 2, b"hello", b"BBB");

        let (tx, rx) = sync_channel(1);
        let exchange = Exchange::new(
            b"AAA".to_vec(),
            gate_db.clone(),
            1,
            b"hello",
            &SHARED_RANDOM,
            EPOCH,
            tx,
        )
        .unwrap();
        gate_db.gate.lock().replace(exchange.shutdown_handle());
        let driver = thread::spawn(move || exchange.run());
        let collector = collect(rx);

        driver.join().unwrap();
        let first_run = collector.join().unwrap();

        // Stopped right after its first (and only) T2 went out.
        assert!(matches!(
            first_run.last().unwrap().error,
            Some(ReunionError::Shutdown)
        ));
        assert!(first_run.iter().all(|u| u.result.is_none()));
        assert_eq!(gate_db.t2_sends.load(Ordering::SeqCst), 1);
        assert_eq!(gate_db.t3_sends.load(Ordering::SeqCst), 0);

        let blob = first_run
            .iter()
            .rev()
            .find_map(|u| u.serialized.clone())
            .unwrap();

        let (tx2, rx2) = sync_channel(1);
        let resumed = Exchange::from_snapshot(&blob, gate_db.clone(), tx2).unwrap();
        assert_eq!(resumed.contact_id(), 1);
        let driver2 = thread::spawn(move || resumed.run());
        let collector2 = collect(rx2);

        driver2.join().unwrap();
        let second_run = collector2.join().unwrap();
        let b_updates = b.finish();

        assert_eq!(terminal_result(&second_run).unwrap(), b"BBB");
        assert_eq!(terminal_result(&b_updates).unwrap(), b"AAA");

        // The board saw exactly one T2 and one T3 from A across both
        // runs: the resumed exchange never re-sent.
        assert_eq!(gate_db.t2_sends.load(Ordering::SeqCst), 1);
        assert_eq!(gate_db.t3_sends.load(Ordering::SeqCst), 1);
    }

    /// Accepts the T1, then fails every FetchState with the configured
    /// response.
    struct FailingDatabase {
        fetch_response: StateResponse,
    }

    impl ReunionDatabase for FailingDatabase {
        fn query(&self, cmd: Command, cancel: &Shutdown) -> Result<Response> {
            if cancel.is_signaled() {
                return Err(ReunionError::Shutdown);
            }
            match cmd {
                Command::FetchState(_) => Ok(Response::State(self.fetch_response.clone())),
                _ => Ok(Response::Message(MessageResponse {
                    error_code: RESPONSE_STATUS_OK,
                })),
            }
        }
    }

    #[test]
    fn test_transport_error_is_terminal() {
        let db = Arc::new(FailingDatabase {
            fetch_response: StateResponse {
                error_code: 1,
                truncated: false,
                payload: Vec::new(),
            },
        });
        let party = spawn_party(db, 1, b"hello", b"AAA");
        let updates = party.finish();

        let last = updates.last().unwrap();
        assert!(matches!(last.error, Some(ReunionError::Database(_))));
        assert_eq!(updates.iter().filter(|u| u.error.is_some()).count(), 1);
        assert!(updates.iter().all(|u| u.result.is_none()));
    }

    #[test]
    fn test_truncated_state_is_terminal() {
        let db = Arc::new(FailingDatabase {
            fetch_response: StateResponse {
                error_code: RESPONSE_STATUS_OK,
                truncated: true,
                payload: RequestedReunionState::default().marshal().unwrap(),
            },
        });
        let party = spawn_party(db, 1, b"hello", b"AAA");
        let updates = party.finish();

        let last = updates.last().unwrap();
        assert!(matches!(last.error, Some(ReunionError::Truncated)));
        assert!(last
            .error
            .as_ref()
            .unwrap()
            .to_string()
            .contains("truncated"));
    }

    /// Returns a state whose message carries neither a T2 nor a T3.
    struct CorruptDatabase;

    impl ReunionDatabase for CorruptDatabase {
        fn query(&self, cmd: Command, _cancel: &Shutdown) -> Result<Response> {
            match cmd {
                Command::FetchState(_) => {
                    let state = RequestedReunionState {
                        t1_map: HashMap::new(),
                        messages: vec![StateMessage {
                            src_t1_hash: [7u8; 32],
                            t2_payload: None,
                            t3_payload: None,
                        }],
                    };
                    Ok(Response::State(StateResponse {
                        error_code: RESPONSE_STATUS_OK,
                        truncated: false,
                        payload: state.marshal().unwrap(),
                    }))
                }
                _ => Ok(Response::Message(MessageResponse {
                    error_code: RESPONSE_STATUS_OK,
                })),
            }
        }
    }

    #[test]
    fn test_corrupt_state_message_is_terminal() {
        let party = spawn_party(Arc::new(CorruptDatabase), 1, b"hello", b"AAA");
        let updates = party.finish();
        assert!(matches!(
            updates.last().unwrap().error,
            Some(ReunionError::StateCorruption(_))
        ));
    }
}
