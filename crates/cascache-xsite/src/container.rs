//! Local storage engine seen from the replication subsystem.
//!
//! The real engine (eviction, persistence, expiration timers) lives outside
//! this crate. Replication only needs to read the latest entry of a key and
//! write resolved entries coming from remote sites.

use crate::topology::segment_for_key;
use crate::types::{Key, Value};
use crate::version::IracMetadata;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};

/// A stored value and its replication metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Stored value.
    pub value: Value,
    /// Replication metadata, absent for entries never stamped.
    pub metadata: Option<IracMetadata>,
}

impl CacheEntry {
    /// Create an entry.
    pub fn new(value: Value, metadata: Option<IracMetadata>) -> Self {
        Self { value, metadata }
    }
}

/// Storage operations used by replication.
pub trait DataContainer: Send + Sync {
    /// Latest entry for `key`.
    fn get(&self, key: &Key) -> Option<CacheEntry>;

    /// Store `entry` under `key`, replacing any previous entry.
    fn put(&self, key: Key, entry: CacheEntry);

    /// Remove `key`, returning the previous entry.
    fn remove(&self, key: &Key) -> Option<CacheEntry>;

    /// Drop every entry.
    fn clear(&self);

    /// Whether `key` is present and was read or written since it was stored.
    ///
    /// Answers remote expiration checks.
    fn touch(&self, key: &Key) -> bool;

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// True when empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory container backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct MemoryContainer {
    entries: DashMap<Key, CacheEntry>,
}

impl MemoryContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`.
    pub fn value(&self, key: &[u8]) -> Option<Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }
}

impl DataContainer for MemoryContainer {
    fn get(&self, key: &Key) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    fn put(&self, key: Key, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    fn remove(&self, key: &Key) -> Option<CacheEntry> {
        self.entries.remove(key).map(|(_, e)| e)
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn touch(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Striped locks serializing read-compare-write sequences on one key.
///
/// Keys hash to a fixed set of stripes, so two keys may share a lock but one
/// key always maps to the same one. Guards must not be held across `.await`.
#[derive(Debug)]
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    /// Default number of stripes.
    pub const DEFAULT_STRIPES: usize = 64;

    /// Create `stripes` locks (at least one).
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Lock the stripe of `key`.
    pub fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let stripe = segment_for_key(key, self.stripes.len() as u32) as usize;
        self.stripes[stripe].lock()
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STRIPES)
    }
}
