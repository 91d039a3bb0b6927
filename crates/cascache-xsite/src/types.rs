//! Shared identifiers used across the cross-site replication subsystem.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key. Opaque bytes, cheap to clone.
pub type Key = bytes::Bytes;

/// Cache value. Opaque bytes, cheap to clone.
pub type Value = bytes::Bytes;

/// Identifier of a node within the local site's cluster.
pub type NodeId = u64;

/// Identifier of a key-space segment.
pub type SegmentId = u32;

/// Token identifying the writer that last mutated a key.
///
/// The Replication Coordinator compares tokens to find out whether a key was
/// written again while a send was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockOwner(pub u64);

static NEXT_LOCK_OWNER: AtomicU64 = AtomicU64::new(1);

impl LockOwner {
    /// Allocate a process-unique lock owner token.
    pub fn next() -> Self {
        LockOwner(NEXT_LOCK_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}
