//! In-memory relay state
//!
//! Transactions being worked on live in the in-flight map. Once every message
//! of a transaction is terminal the record moves to a bounded terminal cache.
//! A secondary index maps attestation lookup ids to their source transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::bounded_cache::BoundedCache;
use crate::types::{MessageState, MessageStatus, TxState};

#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    in_flight: HashMap<String, TxState>,
    terminal: BoundedCache<String, TxState>,
    /// iris_lookup_id -> source tx hash
    index: HashMap<String, String>,
}

impl Inner {
    fn tx(&self, hash: &str) -> Option<&TxState> {
        let key = hash.to_string();
        self.in_flight.get(hash).or_else(|| self.terminal.get(&key))
    }

    fn index_tx(&mut self, tx: &TxState) {
        for msg in &tx.msgs {
            self.index
                .insert(msg.iris_lookup_id.clone(), tx.tx_hash.clone());
        }
    }

    fn move_to_terminal(&mut self, hash: &str) {
        if let Some(tx) = self.in_flight.remove(hash) {
            let evicted = self.terminal.insert(hash.to_string(), tx);
            for (evicted_hash, evicted_tx) in evicted {
                // A replaced entry under the same key keeps its index
                if evicted_hash == hash {
                    continue;
                }
                for msg in evicted_tx.msgs {
                    if self.index.get(&msg.iris_lookup_id) == Some(&evicted_hash) {
                        self.index.remove(&msg.iris_lookup_id);
                    }
                }
            }
        }
    }
}

impl StateStore {
    pub fn new(terminal_max_entries: usize, terminal_ttl_secs: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                in_flight: HashMap::new(),
                terminal: BoundedCache::new(terminal_max_entries, terminal_ttl_secs),
                index: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the stored snapshot of a transaction, creating it if unseen.
    ///
    /// Messages in `tx` that the stored record lacks (a re-scan picked up more
    /// events) are appended. The returned snapshot carries `tx.retry_attempt`.
    pub fn observe(&self, tx: &TxState) -> TxState {
        let mut inner = self.lock();
        let key = tx.tx_hash.clone();

        if let Some(stored) = inner.in_flight.get_mut(&key) {
            for msg in &tx.msgs {
                if !stored
                    .msgs
                    .iter()
                    .any(|m| m.iris_lookup_id == msg.iris_lookup_id)
                {
                    stored.msgs.push(msg.clone());
                }
            }
            let mut snapshot = stored.clone();
            snapshot.retry_attempt = tx.retry_attempt;
            inner.index_tx(&snapshot);
            return snapshot;
        }

        if let Some(stored) = inner.terminal.get(&key) {
            let has_new = tx.msgs.iter().any(|msg| {
                !stored
                    .msgs
                    .iter()
                    .any(|m| m.iris_lookup_id == msg.iris_lookup_id)
            });
            if !has_new {
                let mut snapshot = stored.clone();
                snapshot.retry_attempt = tx.retry_attempt;
                return snapshot;
            }
            // New messages reopen the transaction
            let mut reopened = inner.terminal.remove(&key).unwrap_or_else(|| tx.clone());
            for msg in &tx.msgs {
                if !reopened
                    .msgs
                    .iter()
                    .any(|m| m.iris_lookup_id == msg.iris_lookup_id)
                {
                    reopened.msgs.push(msg.clone());
                }
            }
            reopened.retry_attempt = tx.retry_attempt;
            inner.index_tx(&reopened);
            inner.in_flight.insert(key, reopened.clone());
            return reopened;
        }

        inner.index_tx(tx);
        inner.in_flight.insert(key, tx.clone());
        tx.clone()
    }

    /// Write back one message. Moves its transaction to the terminal store
    /// once every message there is terminal. A message that is already
    /// terminal in the store is never overwritten.
    pub fn update(&self, msg: &MessageState) {
        let mut inner = self.lock();
        let hash = msg.source_tx_hash.clone();

        if let Some(tx) = inner.in_flight.get_mut(&hash) {
            match tx
                .msgs
                .iter_mut()
                .find(|m| m.iris_lookup_id == msg.iris_lookup_id)
            {
                Some(stored) if stored.status.is_terminal() => {
                    skip_stale_write(stored, msg);
                    return;
                }
                Some(stored) => *stored = msg.clone(),
                None => tx.msgs.push(msg.clone()),
            }
            let terminal = tx.is_terminal();
            inner
                .index
                .insert(msg.iris_lookup_id.clone(), hash.clone());
            if terminal {
                inner.move_to_terminal(&hash);
            }
            return;
        }

        if let Some(tx) = inner.terminal.get_mut(&hash) {
            if let Some(stored) = tx
                .msgs
                .iter_mut()
                .find(|m| m.iris_lookup_id == msg.iris_lookup_id)
            {
                if stored.status.is_terminal() {
                    skip_stale_write(stored, msg);
                } else {
                    *stored = msg.clone();
                }
            }
            return;
        }

        // Unknown transaction: start tracking it
        let tx = TxState::new(hash.clone(), vec![msg.clone()]);
        inner.index_tx(&tx);
        let terminal = tx.is_terminal();
        inner.in_flight.insert(hash.clone(), tx);
        if terminal {
            inner.move_to_terminal(&hash);
        }
    }

    /// Current record of a message by attestation lookup id
    pub fn message(&self, iris_lookup_id: &str) -> Option<MessageState> {
        let inner = self.lock();
        let hash = inner.index.get(iris_lookup_id)?;
        inner
            .tx(hash)?
            .msgs
            .iter()
            .find(|m| m.iris_lookup_id == iris_lookup_id)
            .cloned()
    }

    pub fn status(&self, iris_lookup_id: &str) -> Option<MessageStatus> {
        self.message(iris_lookup_id).map(|m| m.status)
    }

    /// Snapshot of a transaction, in-flight or terminal
    pub fn get_tx(&self, tx_hash: &str) -> Option<TxState> {
        self.lock().tx(tx_hash).cloned()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn terminal_len(&self) -> usize {
        self.lock().terminal.len()
    }
}

fn skip_stale_write(stored: &MessageState, msg: &MessageState) {
    debug!(
        iris_lookup_id = %msg.iris_lookup_id,
        stored = %stored.status,
        incoming = %msg.status,
        "Ignoring write to terminal message"
    );
}
