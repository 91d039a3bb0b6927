//! One cache on one node, wired for cross-site replication.
//!
//! [`IracNode`] is the local write path seen from replication: every write
//! goes through the version generator and the container, then gets tracked
//! for the backup sites and forwarded to the other write owners of its
//! segment. It also dispatches the commands other nodes of the site send.

use crate::backoff::{BackOffFactory, ExponentialBackOffFactory};
use crate::cluster::{ClusterCommand, ClusterHandler, ClusterRpc, InMemoryCluster, LocalOnly};
use crate::config::XSiteConfig;
use crate::container::{CacheEntry, DataContainer, KeyLocks, MemoryContainer};
use crate::error::{Result, XSiteError};
use crate::irac_manager::{IracContext, IracManager, UpdatedKeys};
use crate::merge_policy::MergePolicy;
use crate::remote_apply::{ApplyContext, RemoteApplier};
use crate::statistics::XSiteStatistics;
use crate::tombstone::TombstoneManager;
use crate::topology::{CacheTopology, Ownership, StaticTopology, TopologyProvider};
use crate::transport::XSiteTransport;
use crate::types::{Key, LockOwner, NodeId, SegmentId, Value};
use crate::version::IracMetadata;
use crate::version_generator::VersionGenerator;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for an [`IracNode`].
pub struct IracNodeBuilder {
    config: XSiteConfig,
    node_id: NodeId,
    topology: CacheTopology,
    transport: Option<Arc<dyn XSiteTransport>>,
    rpc: Option<Arc<dyn ClusterRpc>>,
    backoff: Option<Arc<dyn BackOffFactory>>,
    merge_policy: Option<MergePolicy>,
    container: Option<Arc<dyn DataContainer>>,
}

impl IracNodeBuilder {
    /// Link to the remote sites. Required.
    pub fn transport(mut self, transport: Arc<dyn XSiteTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Link to the other nodes of the site. Defaults to a single-node site.
    pub fn cluster(mut self, rpc: Arc<dyn ClusterRpc>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Backoff factory. Defaults to exponential backoff from the config.
    pub fn backoff(mut self, factory: Arc<dyn BackOffFactory>) -> Self {
        self.backoff = Some(factory);
        self
    }

    /// Merge policy. Defaults to the configured built-in.
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = Some(policy);
        self
    }

    /// Storage engine. Defaults to an in-memory container.
    pub fn container(mut self, container: Arc<dyn DataContainer>) -> Self {
        self.container = Some(container);
        self
    }

    /// Validate the config and assemble the node.
    pub fn build(self) -> Result<Arc<IracNode>> {
        self.config.validate()?;
        let transport = self.transport.ok_or_else(|| XSiteError::Config {
            msg: "a cross-site transport is required".to_string(),
        })?;
        let rpc: Arc<dyn ClusterRpc> = match self.rpc {
            Some(rpc) => rpc,
            None => Arc::new(LocalOnly(self.node_id)),
        };
        let backoff: Arc<dyn BackOffFactory> = match self.backoff {
            Some(factory) => factory,
            None => Arc::new(self.config.backups.iter().fold(
                ExponentialBackOffFactory::new(self.config.backoff.clone()),
                |factory, site| match &site.backoff {
                    Some(cfg) => factory.with_override(site.name.clone(), cfg.clone()),
                    None => factory,
                },
            )),
        };
        let policy = self
            .merge_policy
            .unwrap_or_else(|| MergePolicy::from(self.config.merge_policy));
        let container: Arc<dyn DataContainer> = match self.container {
            Some(container) => container,
            None => Arc::new(MemoryContainer::new()),
        };

        let topology = Arc::new(StaticTopology::new(self.node_id, self.topology));
        let generator = Arc::new(match &self.config.global_state_path {
            Some(path) => VersionGenerator::with_persistence(self.config.local_site.clone(), path),
            None => VersionGenerator::new(self.config.local_site.clone()),
        });
        let stats = Arc::new(XSiteStatistics::new(self.config.statistics_enabled));
        let locks = Arc::new(KeyLocks::default());
        let updated_keys = UpdatedKeys::new();
        let tombstones = Arc::new(TombstoneManager::new(
            &self.config.tombstones,
            topology.clone(),
            rpc.clone(),
            updated_keys.clone(),
        ));
        let manager = Arc::new(IracManager::new(
            &self.config,
            IracContext {
                updated_keys,
                container: container.clone(),
                generator: generator.clone(),
                tombstones: tombstones.clone(),
                topology: topology.clone(),
                transport,
                rpc: rpc.clone(),
                backoff,
                stats: stats.clone(),
            },
        ));
        let applier = Arc::new(RemoteApplier::new(
            self.config.cache_name.clone(),
            policy,
            ApplyContext {
                container: container.clone(),
                generator: generator.clone(),
                tombstones: tombstones.clone(),
                topology: topology.clone(),
                rpc: rpc.clone(),
                locks: locks.clone(),
                stats: stats.clone(),
            },
        ));

        Ok(Arc::new(IracNode {
            config: self.config,
            node_id: self.node_id,
            topology,
            container,
            generator,
            tombstones,
            manager,
            applier,
            rpc,
            locks,
            stats,
        }))
    }
}

/// One replicated cache on one node.
pub struct IracNode {
    config: XSiteConfig,
    node_id: NodeId,
    topology: Arc<StaticTopology>,
    container: Arc<dyn DataContainer>,
    generator: Arc<VersionGenerator>,
    tombstones: Arc<TombstoneManager>,
    manager: Arc<IracManager>,
    applier: Arc<RemoteApplier>,
    rpc: Arc<dyn ClusterRpc>,
    locks: Arc<KeyLocks>,
    stats: Arc<XSiteStatistics>,
}

impl std::fmt::Debug for IracNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IracNode")
            .field("cache", &self.config.cache_name)
            .field("site", &self.config.local_site)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl IracNode {
    /// Start building node `node_id` with the initial `topology`.
    pub fn builder(config: XSiteConfig, node_id: NodeId, topology: CacheTopology) -> IracNodeBuilder {
        IracNodeBuilder {
            config,
            node_id,
            topology,
            transport: None,
            rpc: None,
            backoff: None,
            merge_policy: None,
            container: None,
        }
    }

    /// Register this node's command handler on `cluster`.
    pub fn join(self: &Arc<Self>, cluster: &InMemoryCluster) {
        let handler: Arc<dyn ClusterHandler> = self.clone();
        cluster.join(self.node_id, Arc::downgrade(&handler));
    }

    /// Restore persisted versions and start the background tasks.
    pub fn start(&self) -> Result<()> {
        self.generator.start()?;
        self.generator
            .on_topology_change(None, &self.topology.current());
        self.manager.start();
        self.tombstones.start();
        info!(
            cache = %self.config.cache_name,
            site = %self.config.local_site,
            node = self.node_id,
            "node started"
        );
        Ok(())
    }

    /// Stop the background tasks and persist versions.
    pub async fn stop(&self) -> Result<()> {
        self.manager.stop().await;
        self.tombstones.stop().await;
        self.generator.stop()
    }

    /// Node id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Local site name.
    pub fn site(&self) -> &str {
        &self.config.local_site
    }

    /// Replication Coordinator of the cache.
    pub fn manager(&self) -> &Arc<IracManager> {
        &self.manager
    }

    /// Tombstone Manager of the cache.
    pub fn tombstones(&self) -> &Arc<TombstoneManager> {
        &self.tombstones
    }

    /// Version generator of the cache.
    pub fn generator(&self) -> &Arc<VersionGenerator> {
        &self.generator
    }

    /// Endpoint receiving updates from remote sites.
    pub fn applier(&self) -> Arc<RemoteApplier> {
        Arc::clone(&self.applier)
    }

    /// Counters of the cache.
    pub fn statistics(&self) -> &XSiteStatistics {
        &self.stats
    }

    /// Current topology.
    pub fn topology(&self) -> Arc<CacheTopology> {
        self.topology.current()
    }

    /// Read a value.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.container
            .get(&Key::copy_from_slice(key))
            .map(|e| e.value)
    }

    /// Metadata stored with `key`.
    pub fn metadata(&self, key: &[u8]) -> Option<IracMetadata> {
        self.container
            .get(&Key::copy_from_slice(key))
            .and_then(|e| e.metadata)
    }

    fn primary_segment(&self, key: &Key) -> Result<SegmentId> {
        let segment = self.topology.current().segment_of(key);
        if self.topology.local_ownership(segment) != Ownership::Primary {
            return Err(XSiteError::Rejected {
                msg: format!("node {} is not the primary owner of segment {}", self.node_id, segment),
            });
        }
        Ok(segment)
    }

    /// Write `value` under `key`. Must run on the primary owner.
    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<IracMetadata> {
        let key = key.into();
        let value = value.into();
        let segment = self.primary_segment(&key)?;
        let owner = LockOwner::next();
        let metadata = {
            let _guard = self.locks.lock(&key);
            let metadata = self.generator.generate_new_metadata(segment);
            self.tombstones.remove_tombstone(&key);
            self.container.put(
                key.clone(),
                CacheEntry::new(value.clone(), Some(metadata.clone())),
            );
            self.manager.track_updated_key(segment, key.clone(), owner);
            metadata
        };
        self.forward_to_backups(segment, key, Some(value), metadata.clone(), owner, false)
            .await;
        Ok(metadata)
    }

    /// Remove `key`. Returns the removed value. Must run on the primary owner.
    pub async fn remove(&self, key: impl Into<Key>) -> Result<Option<Value>> {
        let key = key.into();
        let segment = self.primary_segment(&key)?;
        let owner = LockOwner::next();
        let (previous, metadata) = {
            let _guard = self.locks.lock(&key);
            let Some(previous) = self.container.remove(&key) else {
                return Ok(None);
            };
            let metadata = self.generator.generate_new_metadata(segment);
            self.tombstones
                .store_tombstone(segment, key.clone(), metadata.clone());
            self.manager
                .track_removed_key(segment, key.clone(), owner, metadata.clone(), false);
            (previous, metadata)
        };
        self.forward_to_backups(segment, key, None, metadata, owner, false)
            .await;
        Ok(Some(previous.value))
    }

    /// The lifespan of `key` ended. Removes it unless a backup site still
    /// uses it; returns whether it was removed.
    pub async fn expire(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        let segment = self.primary_segment(&key)?;
        let owner = LockOwner::next();
        if !self.manager.check_and_track_expiration(&key, owner).await {
            return Ok(false);
        }
        if let Some(tombstone) = self.tombstones.get_tombstone(&key) {
            self.forward_to_backups(segment, key, None, tombstone, owner, true)
                .await;
        }
        Ok(true)
    }

    /// Clear the cache on every node of the site and at every backup site.
    ///
    /// Only this node ships the clear to the backup sites; the other
    /// members drop their entries and tracked keys.
    pub async fn clear(&self) {
        self.container.clear();
        self.manager.track_clear();
        let topology = self.topology.current();
        for &member in &topology.members {
            if member == self.node_id {
                continue;
            }
            if let Err(e) = self.rpc.invoke(member, ClusterCommand::Clear).await {
                warn!(node = member, error = %e, "clear not delivered to node");
            }
        }
    }

    async fn forward_to_backups(
        &self,
        segment: SegmentId,
        key: Key,
        value: Option<Value>,
        metadata: IracMetadata,
        owner: LockOwner,
        expiration: bool,
    ) {
        let topology = self.topology.current();
        for &node in topology.write_owners(segment) {
            if node == self.node_id {
                continue;
            }
            let command = ClusterCommand::BackupWrite {
                key: key.clone(),
                segment,
                value: value.clone(),
                metadata: metadata.clone(),
                owner,
                expiration,
            };
            if let Err(e) = self.rpc.invoke(node, command).await {
                warn!(node, error = %e, "backup write failed");
            }
        }
    }

    fn apply_backup_write(
        &self,
        key: Key,
        segment: SegmentId,
        value: Option<Value>,
        metadata: IracMetadata,
        owner: LockOwner,
        expiration: bool,
    ) {
        let _guard = self.locks.lock(&key);
        self.generator
            .update_version(segment, &metadata.version);
        match value {
            Some(value) => {
                self.tombstones.remove_tombstone(&key);
                self.container
                    .put(key.clone(), CacheEntry::new(value, Some(metadata)));
                self.manager.track_updated_key(segment, key, owner);
            }
            None => {
                self.container.remove(&key);
                self.tombstones
                    .store_tombstone(segment, key.clone(), metadata.clone());
                self.manager
                    .track_removed_key(segment, key, owner, metadata, expiration);
            }
        }
    }

    /// Install a new topology on this node.
    pub async fn install_topology(&self, topology: CacheTopology) {
        let old = self.topology.install(topology.clone());
        self.generator.on_topology_change(Some(&old), &topology);
        self.manager.on_topology_update(Some(&old), &topology).await;
        self.tombstones
            .on_topology_update(Some(&old), &topology)
            .await;
        info!(
            node = self.node_id,
            topology_id = topology.topology_id,
            "installed topology"
        );
    }
}

#[async_trait]
impl ClusterHandler for IracNode {
    async fn handle_command(&self, from: NodeId, command: ClusterCommand) -> Result<()> {
        match command {
            ClusterCommand::BackupWrite {
                key,
                segment,
                value,
                metadata,
                owner,
                expiration,
            } => self.apply_backup_write(key, segment, value, metadata, owner, expiration),
            ClusterCommand::RemoteWrites { writes } => {
                for write in writes {
                    self.applier.apply_resolved(write);
                }
            }
            ClusterCommand::Clear => {
                self.container.clear();
                self.manager.drop_tracked_keys();
            }
            ClusterCommand::CleanupKeys { entries } => {
                for entry in entries {
                    self.manager
                        .cleanup_key(&entry.key, entry.owner, entry.tombstone.as_ref());
                }
            }
            ClusterCommand::TombstoneCleanup { tombstones } => {
                self.tombstones.handle_cleanup(&tombstones);
            }
            ClusterCommand::TombstonePrimaryCheck { tombstones } => {
                self.tombstones.handle_primary_check(from, tombstones).await;
            }
            ClusterCommand::TombstoneState { tombstones } => {
                self.tombstones.handle_state(tombstones);
            }
            ClusterCommand::RequestState { origin, segments } => {
                self.manager.request_state(origin, &segments).await?;
            }
            ClusterCommand::StateResponse { entries } => {
                self.manager.receive_state(entries);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CommandKind;
    use crate::transport::InMemorySiteNetwork;
    use parking_lot::Mutex;

    /// Node 2 of a cluster, recording what it receives.
    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<ClusterCommand>>,
    }

    #[async_trait]
    impl ClusterHandler for Recorder {
        async fn handle_command(&self, _from: NodeId, command: ClusterCommand) -> Result<()> {
            self.commands.lock().push(command);
            Ok(())
        }
    }

    fn with_recorder(topology: CacheTopology) -> (Arc<IracNode>, Arc<InMemoryCluster>, Arc<Recorder>) {
        let network = InMemorySiteNetwork::new();
        let cluster = InMemoryCluster::new();
        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn ClusterHandler> = recorder.clone();
        cluster.join(2, Arc::downgrade(&handler));
        let node = IracNode::builder(XSiteConfig::new("users", "LON", &["NYC"]), 1, topology)
            .transport(network.transport_for("LON"))
            .cluster(cluster.rpc_for(1))
            .build()
            .unwrap();
        node.join(&cluster);
        (node, cluster, recorder)
    }

    fn single(config: XSiteConfig) -> Arc<IracNode> {
        let network = InMemorySiteNetwork::new();
        let transport = network.transport_for(config.local_site.clone());
        IracNode::builder(config, 1, CacheTopology::round_robin(1, vec![1], 4, 1))
            .transport(transport)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_transport() {
        let config = XSiteConfig::new("users", "LON", &["NYC"]);
        let err = IracNode::builder(config, 1, CacheTopology::round_robin(1, vec![1], 4, 1))
            .build()
            .unwrap_err();
        assert!(matches!(err, XSiteError::Config { .. }));
    }

    #[test]
    fn test_build_validates_config() {
        let config = XSiteConfig::new("users", "LON", &["LON"]);
        let network = InMemorySiteNetwork::new();
        let result = IracNode::builder(config, 1, CacheTopology::round_robin(1, vec![1], 4, 1))
            .transport(network.transport_for("LON"))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_put_stamps_and_tracks() {
        let node = single(XSiteConfig::new("users", "LON", &["NYC"]));
        let metadata = node.put("k", "v").await.unwrap();
        assert_eq!(metadata.site, "LON");
        assert_eq!(node.get(b"k"), Some(Value::from_static(b"v")));
        assert_eq!(node.metadata(b"k"), Some(metadata));
        assert!(node.manager().is_tracked(&Key::from_static(b"k")));
        assert_eq!(node.statistics().queue_size(), 1);
    }

    #[tokio::test]
    async fn test_remove_stores_tombstone() {
        let node = single(XSiteConfig::new("users", "LON", &["NYC"]));
        node.put("k", "v").await.unwrap();
        let removed = node.remove("k").await.unwrap();
        assert_eq!(removed, Some(Value::from_static(b"v")));
        assert!(node.get(b"k").is_none());
        assert!(node.tombstones().get_tombstone(&Key::from_static(b"k")).is_some());

        assert_eq!(node.remove("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_writes_on_non_primary() {
        let network = InMemorySiteNetwork::new();
        let node = IracNode::builder(
            XSiteConfig::new("users", "LON", &["NYC"]),
            1,
            CacheTopology::new(1, vec![1, 2], vec![vec![2, 1]]),
        )
        .transport(network.transport_for("LON"))
        .build()
        .unwrap();
        let err = node.put("k", "v").await.unwrap_err();
        assert!(matches!(err, XSiteError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_backup_write_is_tracked() {
        let node = single(XSiteConfig::new("users", "LON", &["NYC"]));
        let owner = LockOwner::next();
        let metadata = node.generator().generate_new_metadata(0);
        node.handle_command(
            2,
            ClusterCommand::BackupWrite {
                key: Key::from_static(b"k"),
                segment: 0,
                value: Some(Value::from_static(b"v")),
                metadata,
                owner,
                expiration: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(node.get(b"k"), Some(Value::from_static(b"v")));
        assert!(node.manager().is_tracked(&Key::from_static(b"k")));

        node.handle_command(
            1,
            ClusterCommand::CleanupKeys {
                entries: vec![crate::cluster::CleanupEntry {
                    key: Key::from_static(b"k"),
                    segment: 0,
                    owner,
                    tombstone: None,
                }],
            },
        )
        .await
        .unwrap();
        assert!(!node.manager().is_tracked(&Key::from_static(b"k")));
    }

    #[tokio::test]
    async fn test_backup_removal_keeps_expiration_flag() {
        let (node, _cluster, recorder) = with_recorder(CacheTopology::new(1, vec![1, 2], vec![vec![2, 1]]));
        let key = Key::from_static(b"k");
        let metadata = node.generator().generate_new_metadata(0);
        node.handle_command(
            2,
            ClusterCommand::BackupWrite {
                key: key.clone(),
                segment: 0,
                value: None,
                metadata: metadata.clone(),
                owner: LockOwner::next(),
                expiration: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(node.tombstones().get_tombstone(&key), Some(metadata.clone()));

        // node 2 takes over the segment and asks for the pending keys
        node.manager().request_state(2, &[0]).await.unwrap();
        let commands = recorder.commands.lock();
        match commands.as_slice() {
            [ClusterCommand::StateResponse { entries }] => {
                assert_eq!(entries.len(), 1);
                assert!(entries[0].expiration);
                assert_eq!(entries[0].tombstone, Some(metadata));
            }
            other => panic!("unexpected commands {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expire_forwards_expiration_to_backups() {
        let (node, _cluster, recorder) = with_recorder(CacheTopology::new(1, vec![1, 2], vec![vec![1, 2]]));
        node.put("k", "v").await.unwrap();
        // NYC is not in the site view, so nothing vetoes the expiration
        assert!(node.expire("k").await.unwrap());

        let commands = recorder.commands.lock();
        assert!(matches!(
            commands.as_slice(),
            [
                ClusterCommand::BackupWrite { expiration: false, .. },
                ClusterCommand::BackupWrite { value: None, expiration: true, .. },
            ]
        ));
    }

    #[tokio::test]
    async fn test_clear_reaches_other_members() {
        let (node, cluster, recorder) = with_recorder(CacheTopology::new(1, vec![1, 2], vec![vec![1, 2]]));
        node.put("k", "v").await.unwrap();
        node.clear().await;
        assert!(node.get(b"k").is_none());
        assert_eq!(node.manager().queue_size(), 0);
        assert_eq!(cluster.count(CommandKind::Clear), 1);
        assert!(matches!(recorder.commands.lock().last(), Some(ClusterCommand::Clear)));
    }

    #[tokio::test]
    async fn test_clear_command_drops_entries_and_keys() {
        let (node, _cluster, _recorder) = with_recorder(CacheTopology::new(1, vec![1, 2], vec![vec![2, 1]]));
        let metadata = node.generator().generate_new_metadata(0);
        node.handle_command(
            2,
            ClusterCommand::BackupWrite {
                key: Key::from_static(b"k"),
                segment: 0,
                value: Some(Value::from_static(b"v")),
                metadata,
                owner: LockOwner::next(),
                expiration: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(node.manager().queue_size(), 1);

        node.handle_command(2, ClusterCommand::Clear).await.unwrap();
        assert!(node.get(b"k").is_none());
        assert_eq!(node.manager().queue_size(), 0);
    }
}
