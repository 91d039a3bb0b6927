//! Segment ownership within the local site's cluster.
//!
//! Ownership is computed elsewhere (consistent hashing); this module only
//! describes an installed topology and answers "what is this node for that
//! segment".

use crate::types::{NodeId, SegmentId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Role of a node for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    /// First write owner. Drives replication and tombstone cleanup.
    Primary,
    /// Other write owner. Defers decisions to the primary.
    Backup,
    /// Not a write owner of the segment.
    NonOwner,
}

impl Ownership {
    /// True for primary and backup owners.
    pub fn is_write_owner(self) -> bool {
        !matches!(self, Ownership::NonOwner)
    }
}

/// A topology installed in the local cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTopology {
    /// Topology generation.
    pub topology_id: u32,
    /// Current cluster members.
    pub members: Vec<NodeId>,
    /// Write owners per segment; the first one is the primary.
    pub owners: Vec<Vec<NodeId>>,
}

impl CacheTopology {
    /// Create a topology from explicit per-segment owners.
    pub fn new(topology_id: u32, members: Vec<NodeId>, owners: Vec<Vec<NodeId>>) -> Self {
        Self {
            topology_id,
            members,
            owners,
        }
    }

    /// Round-robin placement: segment `s` is owned by `num_owners` consecutive
    /// members starting at `s % members.len()`.
    pub fn round_robin(
        topology_id: u32,
        members: Vec<NodeId>,
        num_segments: u32,
        num_owners: usize,
    ) -> Self {
        let owners = (0..num_segments as usize)
            .map(|s| {
                if members.is_empty() {
                    return Vec::new();
                }
                let n = num_owners.clamp(1, members.len());
                (0..n).map(|i| members[(s + i) % members.len()]).collect()
            })
            .collect();
        Self::new(topology_id, members, owners)
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Segment owning a key.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        segment_for_key(key, self.num_segments())
    }

    /// Primary owner of a segment.
    pub fn primary(&self, segment: SegmentId) -> Option<NodeId> {
        self.owners
            .get(segment as usize)
            .and_then(|o| o.first().copied())
    }

    /// All write owners of a segment, primary first.
    pub fn write_owners(&self, segment: SegmentId) -> &[NodeId] {
        self.owners
            .get(segment as usize)
            .map(|o| o.as_slice())
            .unwrap_or(&[])
    }

    /// Role of `node` for `segment`.
    pub fn ownership(&self, segment: SegmentId, node: NodeId) -> Ownership {
        match self.write_owners(segment).iter().position(|&n| n == node) {
            Some(0) => Ownership::Primary,
            Some(_) => Ownership::Backup,
            None => Ownership::NonOwner,
        }
    }

    /// Segments where `node` is the primary owner.
    pub fn primary_segments(&self, node: NodeId) -> Vec<SegmentId> {
        (0..self.num_segments())
            .filter(|&s| self.primary(s) == Some(node))
            .collect()
    }
}

/// Hash a key to a segment. Stable across nodes and sites.
pub fn segment_for_key(key: &[u8], num_segments: u32) -> SegmentId {
    if num_segments == 0 {
        return 0;
    }
    let hash = blake3::hash(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % num_segments as u64) as SegmentId
}

/// Supplies the current topology and the local node identity.
pub trait TopologyProvider: Send + Sync {
    /// Identity of the local node.
    fn local_node(&self) -> NodeId;

    /// Topology currently installed.
    fn current(&self) -> Arc<CacheTopology>;

    /// Role of the local node for `segment` in the current topology.
    fn local_ownership(&self, segment: SegmentId) -> Ownership {
        self.current().ownership(segment, self.local_node())
    }
}

/// Holds the topology last installed on this node.
#[derive(Debug)]
pub struct StaticTopology {
    local_node: NodeId,
    current: RwLock<Arc<CacheTopology>>,
}

impl StaticTopology {
    /// Create a holder with an initial topology.
    pub fn new(local_node: NodeId, topology: CacheTopology) -> Self {
        Self {
            local_node,
            current: RwLock::new(Arc::new(topology)),
        }
    }

    /// Install a new topology, returning the previous one.
    pub fn install(&self, topology: CacheTopology) -> Arc<CacheTopology> {
        let mut current = self.current.write();
        std::mem::replace(&mut *current, Arc::new(topology))
    }
}

impl TopologyProvider for StaticTopology {
    fn local_node(&self) -> NodeId {
        self.local_node
    }

    fn current(&self) -> Arc<CacheTopology> {
        self.current.read().clone()
    }
}
