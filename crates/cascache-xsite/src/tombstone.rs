//! Tombstone Manager: version metadata of removed keys.
//!
//! A tombstone lets a site detect that a remote update arriving after a
//! local delete is older than (or concurrent with) that delete. Tombstones
//! are dropped by a periodic cleanup round once no pending replication
//! depends on them:
//!
//! - the primary owner removes eligible tombstones and tells the other
//!   write owners to drop them too;
//! - a backup owner only asks the primary, which decides and broadcasts;
//! - a node that is no longer a write owner drops them locally.
//!
//! The period adapts to the number of tombstones left after each round.

use crate::cluster::{ClusterCommand, ClusterRpc};
use crate::config::TombstoneConfig;
use crate::error::Result;
use crate::topology::{CacheTopology, Ownership, TopologyProvider};
use crate::types::{Key, NodeId, SegmentId};
use crate::version::{IracMetadata, VersionOrdering};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Version metadata retained for a removed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneRecord {
    /// Removed key.
    pub key: Key,
    /// Segment of the key.
    pub segment: SegmentId,
    /// Metadata of the removal.
    pub metadata: IracMetadata,
}

impl TombstoneRecord {
    /// Create a record.
    pub fn new(key: Key, segment: SegmentId, metadata: IracMetadata) -> Self {
        Self {
            key,
            segment,
            metadata,
        }
    }
}

/// Read-only view of the keys still waiting for cross-site delivery.
///
/// A tombstone of a pending key is still needed to build the outgoing
/// removal and is never eligible for cleanup.
pub trait PendingKeys: Send + Sync {
    /// True if `key` has not been delivered to every backup site yet.
    fn contains_key(&self, key: &Key) -> bool;
}

/// Outcome of one cleanup round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupRound {
    /// Tombstones removed while the round ran.
    pub removed: usize,
    /// Tombstones sent to a primary owner for a decision.
    pub checked: usize,
    /// Tombstones left after the round.
    pub remaining: usize,
    /// Delay before the next round.
    pub next_delay: Duration,
}

/// Adaptive delay between cleanup rounds, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupDelay {
    current: u64,
    max: u64,
    target: usize,
}

impl CleanupDelay {
    /// Start at half the ceiling.
    pub fn new(target: usize, max_delay_ms: u64) -> Self {
        let max = max_delay_ms.max(1);
        Self {
            current: (max / 2).clamp(1, max),
            max,
            target,
        }
    }

    /// Current delay.
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current)
    }

    /// Compute the next delay from the result of a round.
    ///
    /// - nothing removed and still above target: retry as soon as possible;
    /// - nothing left: grow geometrically toward the ceiling;
    /// - otherwise: scale by `sqrt(target / remaining)`.
    pub fn update(&mut self, removed: usize, remaining: usize) -> Duration {
        let current = self.current as f64;
        let next = if removed == 0 && remaining > self.target {
            1
        } else if remaining == 0 {
            (current * self.max as f64).sqrt().round() as u64
        } else {
            let ratio = self.target as f64 / remaining as f64;
            (current * ratio.sqrt()).round() as u64
        };
        self.current = next.clamp(1, self.max);
        self.current()
    }
}

/// Stores tombstones of one cache on one node and runs their cleanup.
pub struct TombstoneManager {
    tombstones: DashMap<Key, TombstoneRecord>,
    topology: Arc<dyn TopologyProvider>,
    rpc: Arc<dyn ClusterRpc>,
    pending: Arc<dyn PendingKeys>,
    delay: Mutex<CleanupDelay>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TombstoneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TombstoneManager")
            .field("tombstones", &self.tombstones.len())
            .field("delay", &*self.delay.lock())
            .finish()
    }
}

impl TombstoneManager {
    /// Create a manager. The cleanup task is not started.
    pub fn new(
        config: &TombstoneConfig,
        topology: Arc<dyn TopologyProvider>,
        rpc: Arc<dyn ClusterRpc>,
        pending: Arc<dyn PendingKeys>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tombstones: DashMap::new(),
            topology,
            rpc,
            pending,
            delay: Mutex::new(CleanupDelay::new(
                config.target_size,
                config.max_cleanup_delay_ms,
            )),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Store (or replace) the tombstone of `key`.
    pub fn store_tombstone(&self, segment: SegmentId, key: Key, metadata: IracMetadata) {
        let record = TombstoneRecord::new(key.clone(), segment, metadata);
        self.tombstones.insert(key, record);
    }

    /// Store a tombstone unless `key` already has one. Returns true if stored.
    pub fn store_tombstone_if_absent(
        &self,
        segment: SegmentId,
        key: Key,
        metadata: IracMetadata,
    ) -> bool {
        let mut stored = false;
        self.tombstones.entry(key.clone()).or_insert_with(|| {
            stored = true;
            TombstoneRecord::new(key, segment, metadata)
        });
        stored
    }

    /// Tombstone metadata of `key`.
    pub fn get_tombstone(&self, key: &Key) -> Option<IracMetadata> {
        self.tombstones.get(key).map(|r| r.metadata.clone())
    }

    /// Drop the tombstone of `key`.
    pub fn remove_tombstone(&self, key: &Key) -> Option<TombstoneRecord> {
        self.tombstones.remove(key).map(|(_, r)| r)
    }

    /// Drop the tombstone of `key` only if its metadata is `expected`.
    pub fn remove_tombstone_if(&self, key: &Key, expected: &IracMetadata) -> bool {
        self.tombstones
            .remove_if(key, |_, r| r.metadata == *expected)
            .is_some()
    }

    /// True if exactly this record is stored.
    pub fn contains(&self, record: &TombstoneRecord) -> bool {
        self.tombstones
            .get(&record.key)
            .map(|r| *r == *record)
            .unwrap_or(false)
    }

    /// Number of stored tombstones.
    pub fn size(&self) -> usize {
        self.tombstones.len()
    }

    /// True when no tombstone is stored.
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    /// Delay before the next cleanup round.
    pub fn current_delay(&self) -> Duration {
        self.delay.lock().current()
    }

    fn records_for(&self, segments: &HashSet<SegmentId>) -> Vec<TombstoneRecord> {
        self.tombstones
            .iter()
            .filter(|r| segments.contains(&r.segment))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Push the tombstones of `segments` to `target`.
    pub async fn send_state_to(&self, target: NodeId, segments: &[SegmentId]) -> Result<()> {
        let segments: HashSet<SegmentId> = segments.iter().copied().collect();
        let tombstones = self.records_for(&segments);
        if tombstones.is_empty() {
            return Ok(());
        }
        debug!(target, tombstones = tombstones.len(), "sending tombstone state");
        self.rpc
            .invoke(target, ClusterCommand::TombstoneState { tombstones })
            .await
    }

    /// Run one cleanup round and reschedule the delay.
    pub async fn run_cleanup_round(&self) -> CleanupRound {
        let topology = self.topology.current();
        let local = self.topology.local_node();
        let before = self.size();

        let mut broadcast: BTreeMap<NodeId, Vec<TombstoneRecord>> = BTreeMap::new();
        let mut checks: BTreeMap<NodeId, Vec<TombstoneRecord>> = BTreeMap::new();

        let candidates: Vec<TombstoneRecord> = self
            .tombstones
            .iter()
            .filter(|r| !self.pending.contains_key(&r.key))
            .map(|r| r.value().clone())
            .collect();

        for record in candidates {
            match topology.ownership(record.segment, local) {
                Ownership::Primary => {
                    if self.remove_tombstone_if(&record.key, &record.metadata) {
                        for &owner in topology.write_owners(record.segment) {
                            if owner != local {
                                broadcast.entry(owner).or_default().push(record.clone());
                            }
                        }
                    }
                }
                Ownership::Backup => {
                    if let Some(primary) = topology.primary(record.segment) {
                        checks.entry(primary).or_default().push(record);
                    }
                }
                Ownership::NonOwner => {
                    self.remove_tombstone_if(&record.key, &record.metadata);
                }
            }
        }

        for (node, tombstones) in broadcast {
            let count = tombstones.len();
            if let Err(e) = self
                .rpc
                .invoke(node, ClusterCommand::TombstoneCleanup { tombstones })
                .await
            {
                warn!(node, tombstones = count, error = %e, "tombstone cleanup broadcast failed");
            }
        }

        let mut checked = 0;
        for (primary, tombstones) in checks {
            checked += tombstones.len();
            let count = tombstones.len();
            if let Err(e) = self
                .rpc
                .invoke(primary, ClusterCommand::TombstonePrimaryCheck { tombstones })
                .await
            {
                warn!(primary, tombstones = count, error = %e, "tombstone primary check failed");
            }
        }

        let remaining = self.size();
        let removed = before.saturating_sub(remaining);
        let next_delay = self.delay.lock().update(removed, remaining);
        debug!(
            removed,
            checked,
            remaining,
            next_delay_ms = next_delay.as_millis() as u64,
            "tombstone cleanup round"
        );
        CleanupRound {
            removed,
            checked,
            remaining,
            next_delay,
        }
    }

    /// Drop tombstones as decided by the primary owner.
    pub fn handle_cleanup(&self, tombstones: &[TombstoneRecord]) -> usize {
        tombstones
            .iter()
            .filter(|r| self.remove_tombstone_if(&r.key, &r.metadata))
            .count()
    }

    /// Decide on tombstones a backup owner asked about.
    ///
    /// Eligible tombstones are removed here and a cleanup is sent to every
    /// other write owner of their segments, the requester included.
    pub async fn handle_primary_check(&self, from: NodeId, tombstones: Vec<TombstoneRecord>) {
        let topology = self.topology.current();
        let local = self.topology.local_node();
        let mut broadcast: BTreeMap<NodeId, Vec<TombstoneRecord>> = BTreeMap::new();

        for record in tombstones {
            if topology.ownership(record.segment, local) != Ownership::Primary {
                continue;
            }
            if self.pending.contains_key(&record.key) {
                continue;
            }
            let eligible = match self.get_tombstone(&record.key) {
                None => true,
                Some(local_meta) if local_meta == record.metadata => {
                    self.remove_tombstone_if(&record.key, &record.metadata)
                }
                Some(_) => false,
            };
            if !eligible {
                continue;
            }
            let mut targets: Vec<NodeId> = topology
                .write_owners(record.segment)
                .iter()
                .copied()
                .filter(|&n| n != local)
                .collect();
            if !targets.contains(&from) {
                targets.push(from);
            }
            for node in targets {
                broadcast.entry(node).or_default().push(record.clone());
            }
        }

        for (node, tombstones) in broadcast {
            if let Err(e) = self
                .rpc
                .invoke(node, ClusterCommand::TombstoneCleanup { tombstones })
                .await
            {
                warn!(node, error = %e, "tombstone cleanup after primary check failed");
            }
        }
    }

    /// Install tombstones pushed by a primary owner. Newer local ones win.
    pub fn handle_state(&self, tombstones: Vec<TombstoneRecord>) {
        for record in tombstones {
            self.tombstones
                .entry(record.key.clone())
                .and_modify(|existing| {
                    if record.metadata.version.compare(&existing.metadata.version)
                        == VersionOrdering::After
                    {
                        *existing = record.clone();
                    }
                })
                .or_insert(record);
        }
    }

    /// Push tombstones to nodes that became write owners of segments this
    /// node is now primary for.
    pub async fn on_topology_update(&self, old: Option<&CacheTopology>, new: &CacheTopology) {
        let local = self.topology.local_node();
        let mut targets: BTreeMap<NodeId, Vec<SegmentId>> = BTreeMap::new();

        for segment in new.primary_segments(local) {
            let previous: &[NodeId] = old.map(|t| t.write_owners(segment)).unwrap_or(&[]);
            for &owner in new.write_owners(segment) {
                if owner != local && !previous.contains(&owner) {
                    targets.entry(owner).or_default().push(segment);
                }
            }
        }

        for (node, segments) in targets {
            if let Err(e) = self.send_state_to(node, &segments).await {
                warn!(node, segments = segments.len(), error = %e, "tombstone state transfer failed");
            }
        }
    }

    /// Start the periodic cleanup task.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        self.shutdown.send_replace(false);
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(cleanup_loop(weak, shutdown)));
        info!("tombstone cleanup started");
    }

    /// Stop the periodic cleanup task.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("tombstone cleanup stopped");
        }
    }
}

async fn cleanup_loop(manager: Weak<TombstoneManager>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let delay = match manager.upgrade() {
            Some(m) => m.current_delay(),
            None => return,
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
        if *shutdown.borrow() {
            return;
        }
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.run_cleanup_round().await;
    }
}
