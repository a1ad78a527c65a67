//! Destination account sequence allocation
//!
//! One [`SequenceMap`] is shared by every broadcast worker in the process. It
//! hands out the next account sequence (EVM nonce / Cosmos account sequence)
//! per destination domain. The lock is only held for the read-modify-write and
//! never across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub struct SequenceMap {
    inner: Arc<Mutex<HashMap<u32, u64>>>,
}

impl SequenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the next sequence for a domain
    pub fn put(&self, domain: u32, value: u64) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(domain, value);
    }

    /// Return the current sequence for a domain and advance it.
    /// An unseen domain starts at 0.
    pub fn next(&self, domain: u32) -> u64 {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(domain).or_insert(0);
        let current = *entry;
        *entry += 1;
        current
    }

    /// Read without advancing
    pub fn peek(&self, domain: u32) -> Option<u64> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(&domain).copied()
    }
}
