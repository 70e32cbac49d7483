//! Cache of remote protocols seen during handshakes.

use crate::descriptor::{Protocol, ProtocolHash};
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent, append-only map from protocol hash to parsed protocol.
///
/// Entries are never replaced or evicted: the first protocol stored under a
/// hash is the one every later lookup sees.
#[derive(Debug, Default)]
pub struct ProtocolCache {
    entries: DashMap<ProtocolHash, Arc<dyn Protocol>>,
}

impl ProtocolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a protocol by hash.
    pub fn get(&self, hash: &ProtocolHash) -> Option<Arc<dyn Protocol>> {
        self.entries.get(hash).map(|entry| Arc::clone(entry.value()))
    }

    /// Stores `protocol` under `hash` unless an entry already exists.
    ///
    /// Returns the protocol now cached under `hash`.
    pub fn insert(&self, hash: ProtocolHash, protocol: Arc<dyn Protocol>) -> Arc<dyn Protocol> {
        let entry = self.entries.entry(hash).or_insert(protocol);
        Arc::clone(entry.value())
    }

    pub fn contains(&self, hash: &ProtocolHash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
