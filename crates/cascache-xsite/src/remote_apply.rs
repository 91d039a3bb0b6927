//! Applies updates received from remote sites.
//!
//! Each incoming update is compared with the local entry (or tombstone):
//! newer updates are applied, stale ones discarded, and concurrent ones go
//! through the cache's merge policy. The remote version is always folded
//! into the local version generator. Entries stored this way are copied to
//! the other write owners of their segment.

use crate::cluster::{ClusterCommand, ClusterRpc, ResolvedWrite};
use crate::container::{CacheEntry, DataContainer, KeyLocks};
use crate::error::{Result, XSiteError};
use crate::merge_policy::{MergePolicy, SiteEntry};
use crate::statistics::{ConflictOutcome, XSiteStatistics};
use crate::tombstone::TombstoneManager;
use crate::topology::TopologyProvider;
use crate::transport::{IracRequest, IracUpdate, SiteEndpoint, XSiteResponse};
use crate::types::{Key, NodeId, SegmentId};
use crate::version::{IracMetadata, VersionOrdering};
use crate::version_generator::VersionGenerator;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What happened to one remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update was newer and was applied.
    Applied,
    /// The local entry was equal or newer.
    Discarded,
    /// The versions conflicted and the merge policy decided.
    Conflict(ConflictOutcome),
    /// The merge policy failed; the update was dropped.
    MergeFailed,
}

/// Collaborators of a [`RemoteApplier`].
pub struct ApplyContext {
    /// Local storage.
    pub container: Arc<dyn DataContainer>,
    /// Version generator of the cache.
    pub generator: Arc<VersionGenerator>,
    /// Tombstone manager of the cache.
    pub tombstones: Arc<TombstoneManager>,
    /// Topology of the local site.
    pub topology: Arc<dyn TopologyProvider>,
    /// Link to the other write owners.
    pub rpc: Arc<dyn ClusterRpc>,
    /// Per-key locks shared with the local write path.
    pub locks: Arc<KeyLocks>,
    /// Counters of the cache.
    pub stats: Arc<XSiteStatistics>,
}

/// Remote-apply path of one cache on one node.
pub struct RemoteApplier {
    cache_name: String,
    container: Arc<dyn DataContainer>,
    generator: Arc<VersionGenerator>,
    tombstones: Arc<TombstoneManager>,
    topology: Arc<dyn TopologyProvider>,
    rpc: Arc<dyn ClusterRpc>,
    locks: Arc<KeyLocks>,
    policy: MergePolicy,
    stats: Arc<XSiteStatistics>,
}

impl std::fmt::Debug for RemoteApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteApplier")
            .field("cache_name", &self.cache_name)
            .field("policy", &self.policy.name())
            .finish()
    }
}

impl RemoteApplier {
    /// Create the remote-apply path.
    pub fn new(cache_name: impl Into<String>, policy: MergePolicy, ctx: ApplyContext) -> Self {
        Self {
            cache_name: cache_name.into(),
            container: ctx.container,
            generator: ctx.generator,
            tombstones: ctx.tombstones,
            topology: ctx.topology,
            rpc: ctx.rpc,
            locks: ctx.locks,
            policy,
            stats: ctx.stats,
        }
    }

    /// Local metadata of `key`: the stored entry's, else its tombstone's.
    fn local_metadata(&self, key: &Key, entry: Option<&CacheEntry>) -> Option<IracMetadata> {
        entry
            .and_then(|e| e.metadata.clone())
            .or_else(|| self.tombstones.get_tombstone(key))
    }

    /// Apply one update received from a remote site.
    ///
    /// Only touches this node; [`RemoteApplier::apply_updates`] also copies
    /// the stored entries to the other write owners.
    pub fn apply_update(&self, update: &IracUpdate) -> ApplyOutcome {
        self.apply_locked(update).0
    }

    /// Apply a batch of remote updates and copy what was stored to the
    /// other write owners of each segment.
    pub async fn apply_updates(&self, updates: &[IracUpdate]) -> Vec<ApplyOutcome> {
        let mut outcomes = Vec::with_capacity(updates.len());
        let mut writes = Vec::new();
        for update in updates {
            let (outcome, write) = self.apply_locked(update);
            outcomes.push(outcome);
            writes.extend(write);
        }
        self.forward_to_owners(writes).await;
        outcomes
    }

    fn apply_locked(&self, update: &IracUpdate) -> (ApplyOutcome, Option<ResolvedWrite>) {
        let _guard = self.locks.lock(&update.key);
        let segment = self.topology.current().segment_of(&update.key);
        let local_entry = self.container.get(&update.key);
        let local_meta = self.local_metadata(&update.key, local_entry.as_ref());

        self.generator
            .update_version(segment, &update.metadata.version);

        let incoming = || ResolvedWrite {
            key: update.key.clone(),
            segment,
            value: update.value.clone(),
            metadata: update.metadata.clone(),
        };
        let Some(local_meta) = local_meta else {
            return (ApplyOutcome::Applied, Some(self.store(incoming())));
        };

        match update.metadata.version.compare(&local_meta.version) {
            VersionOrdering::After => (ApplyOutcome::Applied, Some(self.store(incoming()))),
            VersionOrdering::Before | VersionOrdering::Equal => {
                trace!(site = %update.metadata.site, "discarding stale remote update");
                self.stats.record_discard();
                (ApplyOutcome::Discarded, None)
            }
            VersionOrdering::Conflicting => {
                let local = SiteEntry::new(
                    local_meta.site.clone(),
                    local_entry.map(|e| e.value),
                    local_meta.version.clone(),
                );
                let remote = SiteEntry::new(
                    update.metadata.site.clone(),
                    update.value.clone(),
                    update.metadata.version.clone(),
                );
                self.resolve(segment, &update.key, local, remote)
            }
        }
    }

    fn resolve(
        &self,
        segment: SegmentId,
        key: &Key,
        local: SiteEntry,
        remote: SiteEntry,
    ) -> (ApplyOutcome, Option<ResolvedWrite>) {
        let merged = match self.policy.merge(key, &local, &remote) {
            Ok(merged) => merged,
            Err(e) => {
                warn!(
                    policy = self.policy.name(),
                    local_site = %local.site,
                    remote_site = %remote.site,
                    error = %e,
                    "merge policy failed, dropping remote update"
                );
                self.stats.record_failed_merge();
                return (ApplyOutcome::MergeFailed, None);
            }
        };

        let outcome = if merged.same_outcome(&local) {
            ConflictOutcome::LocalWins
        } else if merged.same_outcome(&remote) {
            ConflictOutcome::RemoteWins
        } else {
            ConflictOutcome::Merged
        };
        debug!(
            policy = self.policy.name(),
            local_site = %local.site,
            remote_site = %remote.site,
            ?outcome,
            "resolved conflict"
        );

        let metadata =
            self.generator
                .merge_version(segment, &local.version, &remote.version, &merged.site);
        let write = self.store(ResolvedWrite {
            key: key.clone(),
            segment,
            value: merged.value,
            metadata,
        });
        self.stats.record_conflict(outcome);
        (ApplyOutcome::Conflict(outcome), Some(write))
    }

    fn store(&self, write: ResolvedWrite) -> ResolvedWrite {
        match &write.value {
            Some(value) => {
                self.tombstones.remove_tombstone(&write.key);
                self.container.put(
                    write.key.clone(),
                    CacheEntry::new(value.clone(), Some(write.metadata.clone())),
                );
            }
            None => {
                self.container.remove(&write.key);
                if self.topology.local_ownership(write.segment).is_write_owner() {
                    self.tombstones.store_tombstone(
                        write.segment,
                        write.key.clone(),
                        write.metadata.clone(),
                    );
                }
            }
        }
        write
    }

    async fn forward_to_owners(&self, writes: Vec<ResolvedWrite>) {
        if writes.is_empty() {
            return;
        }
        let topology = self.topology.current();
        let local = self.topology.local_node();
        let mut by_node: BTreeMap<NodeId, Vec<ResolvedWrite>> = BTreeMap::new();
        for write in writes {
            for &owner in topology.write_owners(write.segment) {
                if owner != local {
                    by_node.entry(owner).or_default().push(write.clone());
                }
            }
        }
        for (node, writes) in by_node {
            let count = writes.len();
            if let Err(e) = self
                .rpc
                .invoke(node, ClusterCommand::RemoteWrites { writes })
                .await
            {
                warn!(node, keys = count, error = %e, "copying remote writes to owner failed");
            }
        }
    }

    /// Store an entry the primary owner resolved from a remote update.
    ///
    /// Returns false, storing nothing, when the local entry is newer.
    pub fn apply_resolved(&self, write: ResolvedWrite) -> bool {
        let _guard = self.locks.lock(&write.key);
        let local_entry = self.container.get(&write.key);
        if let Some(local) = self.local_metadata(&write.key, local_entry.as_ref()) {
            if write.metadata.version.compare(&local.version) == VersionOrdering::Before {
                trace!(site = %write.metadata.site, "skipping outdated resolved write");
                return false;
            }
        }
        self.generator
            .update_version(write.segment, &write.metadata.version);
        self.store(write);
        true
    }

    /// The origin cleared its cache.
    pub fn apply_clear(&self) {
        self.container.clear();
    }

    /// Whether `key` was touched locally.
    pub fn touch(&self, key: &Key) -> bool {
        self.container.touch(key)
    }

    fn check_cache(&self, cache: &str) -> Result<()> {
        if cache != self.cache_name {
            return Err(XSiteError::Rejected {
                msg: format!("cache {} is not replicated here", cache),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SiteEndpoint for RemoteApplier {
    async fn handle(&self, request: IracRequest) -> Result<XSiteResponse> {
        match request {
            IracRequest::Updates {
                origin,
                cache,
                updates,
            } => {
                self.check_cache(&cache)?;
                debug!(origin = %origin, keys = updates.len(), "applying remote updates");
                self.apply_updates(&updates).await;
                Ok(XSiteResponse::Ack)
            }
            IracRequest::Clear { origin, cache } => {
                self.check_cache(&cache)?;
                debug!(origin = %origin, "applying remote clear");
                self.apply_clear();
                Ok(XSiteResponse::Ack)
            }
            IracRequest::Touch { cache, key, .. } => {
                self.check_cache(&cache)?;
                Ok(XSiteResponse::Touched(self.touch(&key)))
            }
        }
    }
}

/// Entry point of a site with several nodes.
///
/// Updates are routed to the primary owner of their segment, which copies
/// what it stores to the other write owners; a clear goes to every node.
pub struct SiteRouter {
    topology: Arc<dyn TopologyProvider>,
    nodes: RwLock<BTreeMap<NodeId, Arc<RemoteApplier>>>,
}

impl std::fmt::Debug for SiteRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRouter")
            .field("nodes", &self.nodes.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SiteRouter {
    /// Route with the topology seen by `topology`.
    pub fn new(topology: Arc<dyn TopologyProvider>) -> Self {
        Self {
            topology,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add the remote-apply path of `node`.
    pub fn add_node(&self, node: NodeId, applier: Arc<RemoteApplier>) {
        self.nodes.write().insert(node, applier);
    }

    fn primary_for(&self, key: &Key) -> Result<Arc<RemoteApplier>> {
        let topology = self.topology.current();
        let segment = topology.segment_of(key);
        let primary = topology
            .primary(segment)
            .ok_or_else(|| XSiteError::Rejected {
                msg: format!("segment {} has no owner", segment),
            })?;
        self.nodes
            .read()
            .get(&primary)
            .cloned()
            .ok_or(XSiteError::NodeUnreachable { node: primary })
    }
}

#[async_trait]
impl SiteEndpoint for SiteRouter {
    async fn handle(&self, request: IracRequest) -> Result<XSiteResponse> {
        match request {
            IracRequest::Updates {
                origin,
                cache,
                updates,
            } => {
                let mut by_node: Vec<(Arc<RemoteApplier>, Vec<IracUpdate>)> = Vec::new();
                for update in updates {
                    let applier = self.primary_for(&update.key)?;
                    match by_node.iter_mut().find(|(a, _)| Arc::ptr_eq(a, &applier)) {
                        Some((_, batch)) => batch.push(update),
                        None => by_node.push((applier, vec![update])),
                    }
                }
                for (applier, updates) in by_node {
                    applier
                        .handle(IracRequest::Updates {
                            origin: origin.clone(),
                            cache: cache.clone(),
                            updates,
                        })
                        .await?;
                }
                Ok(XSiteResponse::Ack)
            }
            IracRequest::Clear { origin, cache } => {
                let nodes: Vec<Arc<RemoteApplier>> = self.nodes.read().values().cloned().collect();
                for applier in nodes {
                    applier
                        .handle(IracRequest::Clear {
                            origin: origin.clone(),
                            cache: cache.clone(),
                        })
                        .await?;
                }
                Ok(XSiteResponse::Ack)
            }
            IracRequest::Touch { origin, cache, key } => {
                let applier = self.primary_for(&key)?;
                applier
                    .handle(IracRequest::Touch { origin, cache, key })
                    .await
            }
        }
    }
}
