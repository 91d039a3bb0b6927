//! Replication Coordinator: tracks locally written keys until every backup
//! site confirmed them.
//!
//! Each tracked key carries one state per backup site:
//!
//! ```text
//! (untracked) --track--> Pending --picked up--> InFlight --ack--> (site done)
//!                           ^                       |
//!                           +------- failure -------+
//! ```
//!
//! A write to a key that is already tracked replaces its lock owner and
//! resets every site to `Pending`, so the latest value is always sent again.
//! One sender task per backup site drains the `Pending` keys of segments
//! this node is primary for. Only the latest value of a key is shipped.

use crate::backoff::{BackOff, BackOffFactory};
use crate::cluster::{CleanupEntry, ClusterCommand, ClusterRpc, StateEntry};
use crate::config::XSiteConfig;
use crate::container::DataContainer;
use crate::error::{Result, XSiteError};
use crate::statistics::XSiteStatistics;
use crate::tombstone::{PendingKeys, TombstoneManager};
use crate::topology::{CacheTopology, Ownership, TopologyProvider};
use crate::transport::{IracRequest, IracUpdate, XSiteResponse, XSiteTransport};
use crate::types::{Key, LockOwner, NodeId, SegmentId};
use crate::version::IracMetadata;
use crate::version_generator::VersionGenerator;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Progress of a tracked key towards one backup site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    /// Waiting to be sent.
    Pending,
    /// Sent on behalf of this writer; waiting for the response.
    InFlight(LockOwner),
}

#[derive(Debug, Clone)]
struct TrackedKey {
    segment: SegmentId,
    owner: LockOwner,
    tombstone: Option<IracMetadata>,
    expiration: bool,
    sites: HashMap<String, SiteState>,
}

/// Keys written locally and not yet delivered to every backup site.
///
/// Owned by the [`IracManager`]; the tombstone manager only reads it.
#[derive(Debug, Default)]
pub struct UpdatedKeys {
    keys: DashMap<Key, TrackedKey>,
}

impl UpdatedKeys {
    /// Create an empty map.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl PendingKeys for UpdatedKeys {
    fn contains_key(&self, key: &Key) -> bool {
        self.keys.contains_key(key)
    }
}

/// Collaborators of an [`IracManager`].
pub struct IracContext {
    /// Tracked keys, shared read-only with the tombstone manager.
    pub updated_keys: Arc<UpdatedKeys>,
    /// Local storage.
    pub container: Arc<dyn DataContainer>,
    /// Version generator of the cache.
    pub generator: Arc<VersionGenerator>,
    /// Tombstone manager of the cache.
    pub tombstones: Arc<TombstoneManager>,
    /// Topology of the local site.
    pub topology: Arc<dyn TopologyProvider>,
    /// Link to the remote sites.
    pub transport: Arc<dyn XSiteTransport>,
    /// Link to the other nodes of the local site.
    pub rpc: Arc<dyn ClusterRpc>,
    /// Builds one backoff per backup site.
    pub backoff: Arc<dyn BackOffFactory>,
    /// Counters of the cache.
    pub stats: Arc<XSiteStatistics>,
}

struct SiteSender {
    site: String,
    notify: Notify,
    clear_pending: AtomicBool,
    degraded: AtomicBool,
    backoff: Arc<dyn BackOff>,
}

enum SendStep {
    Continue,
    Idle,
    Stop,
}

#[derive(Debug, Clone)]
struct PendingSend {
    key: Key,
    segment: SegmentId,
    owner: LockOwner,
    tombstone: Option<IracMetadata>,
    expiration: bool,
}

/// Replication Coordinator of one cache on one node.
pub struct IracManager {
    cache_name: String,
    local_site: String,
    batch_size: usize,
    retry_delay: Duration,
    updated: Arc<UpdatedKeys>,
    container: Arc<dyn DataContainer>,
    generator: Arc<VersionGenerator>,
    tombstones: Arc<TombstoneManager>,
    topology: Arc<dyn TopologyProvider>,
    transport: Arc<dyn XSiteTransport>,
    rpc: Arc<dyn ClusterRpc>,
    stats: Arc<XSiteStatistics>,
    senders: Vec<Arc<SiteSender>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for IracManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IracManager")
            .field("cache_name", &self.cache_name)
            .field("local_site", &self.local_site)
            .field("pending", &self.updated.len())
            .finish()
    }
}

impl IracManager {
    /// Create the coordinator. Sender tasks start with [`IracManager::start`].
    pub fn new(config: &XSiteConfig, ctx: IracContext) -> Self {
        let senders = config
            .backups
            .iter()
            .map(|b| {
                Arc::new(SiteSender {
                    site: b.name.clone(),
                    notify: Notify::new(),
                    clear_pending: AtomicBool::new(false),
                    degraded: AtomicBool::new(false),
                    backoff: ctx.backoff.create(&config.cache_name, &b.name),
                })
            })
            .collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            cache_name: config.cache_name.clone(),
            local_site: config.local_site.clone(),
            batch_size: config.irac.batch_size.max(1),
            retry_delay: Duration::from_millis(config.irac.retry_delay_ms),
            updated: ctx.updated_keys,
            container: ctx.container,
            generator: ctx.generator,
            tombstones: ctx.tombstones,
            topology: ctx.topology,
            transport: ctx.transport,
            rpc: ctx.rpc,
            stats: ctx.stats,
            senders,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start one sender task per backup site.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);
        for sender in &self.senders {
            let handle = tokio::spawn(send_loop(
                Arc::downgrade(self),
                Arc::clone(sender),
                self.shutdown.subscribe(),
            ));
            tasks.push(handle);
        }
        info!(
            cache = %self.cache_name,
            site = %self.local_site,
            backups = self.senders.len(),
            "cross-site replication started"
        );
    }

    /// Stop the sender tasks. Tracked keys stay with this instance.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(cache = %self.cache_name, site = %self.local_site, "cross-site replication stopped");
    }

    fn all_sites_pending(&self) -> HashMap<String, SiteState> {
        self.senders
            .iter()
            .map(|s| (s.site.clone(), SiteState::Pending))
            .collect()
    }

    fn wake_senders(&self) {
        for sender in &self.senders {
            sender.notify.notify_one();
        }
    }

    fn refresh_queue_size(&self) {
        self.stats.set_queue_size(self.updated.len());
    }

    fn track(&self, key: Key, tracked: TrackedKey) {
        if self.senders.is_empty() {
            return;
        }
        self.updated.keys.insert(key, tracked);
        self.refresh_queue_size();
        self.wake_senders();
    }

    /// Track a local write of `key`.
    pub fn track_updated_key(&self, segment: SegmentId, key: Key, owner: LockOwner) {
        let sites = self.all_sites_pending();
        self.track(
            key,
            TrackedKey {
                segment,
                owner,
                tombstone: None,
                expiration: false,
                sites,
            },
        );
    }

    /// Track several local writes.
    pub fn track_updated_keys(&self, keys: impl IntoIterator<Item = (SegmentId, Key, LockOwner)>) {
        for (segment, key, owner) in keys {
            self.track_updated_key(segment, key, owner);
        }
    }

    /// Track a local removal of `key` whose tombstone carries `tombstone`.
    pub fn track_removed_key(
        &self,
        segment: SegmentId,
        key: Key,
        owner: LockOwner,
        tombstone: IracMetadata,
        expiration: bool,
    ) {
        let sites = self.all_sites_pending();
        self.track(
            key,
            TrackedKey {
                segment,
                owner,
                tombstone: Some(tombstone),
                expiration,
                sites,
            },
        );
    }

    /// Track a clear of the whole cache.
    ///
    /// Tracked keys are dropped; every sender delivers the clear before any
    /// later update.
    pub fn track_clear(&self) {
        self.updated.keys.clear();
        self.refresh_queue_size();
        for sender in &self.senders {
            sender.clear_pending.store(true, Ordering::Release);
        }
        self.wake_senders();
        debug!(cache = %self.cache_name, "tracked clear");
    }

    /// Drop every tracked key without shipping a clear.
    ///
    /// Used on the members of a site cleared by another node, which ships
    /// the clear itself.
    pub fn drop_tracked_keys(&self) {
        self.updated.keys.clear();
        self.refresh_queue_size();
        debug!(cache = %self.cache_name, "dropped tracked keys");
    }

    /// Stop tracking `key` if it is still tracked for `owner`, and drop the
    /// matching tombstone.
    pub fn cleanup_key(&self, key: &Key, owner: LockOwner, tombstone: Option<&IracMetadata>) {
        self.updated.keys.remove_if(key, |_, t| t.owner == owner);
        if let Some(tombstone) = tombstone {
            self.tombstones.remove_tombstone_if(key, tombstone);
        }
        self.refresh_queue_size();
    }

    /// Number of tracked keys.
    pub fn queue_size(&self) -> usize {
        self.updated.len()
    }

    /// True when `key` is tracked.
    pub fn is_tracked(&self, key: &Key) -> bool {
        self.updated.contains_key(key)
    }

    /// State of `key` towards `site`, `None` when delivered or untracked.
    pub fn status(&self, key: &Key, site: &str) -> Option<SiteState> {
        self.updated
            .keys
            .get(key)
            .and_then(|t| t.sites.get(site).copied())
    }

    fn state_entries(&self, segments: &HashSet<SegmentId>) -> Vec<StateEntry> {
        self.updated
            .keys
            .iter()
            .filter(|t| segments.contains(&t.segment))
            .map(|t| StateEntry {
                key: t.key().clone(),
                segment: t.segment,
                owner: t.owner,
                tombstone: t.tombstone.clone(),
                expiration: t.expiration,
            })
            .collect()
    }

    /// React to a new topology.
    ///
    /// Keys of segments this node no longer owns are handed to the new
    /// primary; segments this node became primary for are requested from
    /// the other members.
    pub async fn on_topology_update(&self, old: Option<&CacheTopology>, new: &CacheTopology) {
        let local = self.topology.local_node();

        let mut handoff: BTreeMap<NodeId, Vec<StateEntry>> = BTreeMap::new();
        for tracked in self.updated.keys.iter() {
            if new.ownership(tracked.segment, local) != Ownership::NonOwner {
                continue;
            }
            if let Some(primary) = new.primary(tracked.segment) {
                handoff.entry(primary).or_default().push(StateEntry {
                    key: tracked.key().clone(),
                    segment: tracked.segment,
                    owner: tracked.owner,
                    tombstone: tracked.tombstone.clone(),
                    expiration: tracked.expiration,
                });
            }
        }

        for (node, entries) in handoff {
            let handed: Vec<(Key, LockOwner)> =
                entries.iter().map(|e| (e.key.clone(), e.owner)).collect();
            let count = handed.len();
            match self
                .rpc
                .invoke(node, ClusterCommand::StateResponse { entries })
                .await
            {
                Ok(()) => {
                    for (key, owner) in handed {
                        self.updated.keys.remove_if(&key, |_, t| t.owner == owner);
                    }
                    debug!(node, keys = count, "handed off tracked keys");
                }
                Err(e) => {
                    warn!(node, error = %e, "tracked key handoff failed, retrying on next topology");
                }
            }
        }

        let gained: Vec<SegmentId> = new
            .primary_segments(local)
            .into_iter()
            .filter(|&s| old.map(|o| o.primary(s) != Some(local)).unwrap_or(false))
            .collect();
        if !gained.is_empty() {
            for &member in &new.members {
                if member == local {
                    continue;
                }
                let command = ClusterCommand::RequestState {
                    origin: local,
                    segments: gained.clone(),
                };
                if let Err(e) = self.rpc.invoke(member, command).await {
                    warn!(node = member, error = %e, "state request failed");
                }
            }
        }

        self.refresh_queue_size();
        self.wake_senders();
    }

    /// Another node became primary for `segments` and asks for our keys.
    pub async fn request_state(&self, origin: NodeId, segments: &[SegmentId]) -> Result<()> {
        let segments: HashSet<SegmentId> = segments.iter().copied().collect();
        let entries = self.state_entries(&segments);
        if entries.is_empty() {
            return Ok(());
        }
        debug!(origin, keys = entries.len(), "sending tracked keys");
        self.rpc
            .invoke(origin, ClusterCommand::StateResponse { entries })
            .await
    }

    /// Install keys handed over by another node. Already tracked keys win.
    pub fn receive_state(&self, entries: Vec<StateEntry>) {
        if self.senders.is_empty() {
            return;
        }
        for entry in entries {
            if let Some(tombstone) = &entry.tombstone {
                self.tombstones
                    .store_tombstone_if_absent(entry.segment, entry.key.clone(), tombstone.clone());
            }
            let sites = self.all_sites_pending();
            self.updated.keys.entry(entry.key).or_insert(TrackedKey {
                segment: entry.segment,
                owner: entry.owner,
                tombstone: entry.tombstone,
                expiration: entry.expiration,
                sites,
            });
        }
        self.refresh_queue_size();
        self.wake_senders();
    }

    /// Decide whether an entry whose lifespan ended may be removed.
    ///
    /// Every reachable backup site is asked whether it touched `key`. If
    /// none did, the entry is removed locally, a tombstone is stored and
    /// the removal is tracked; returns true. Any touch or error keeps the
    /// entry and returns false.
    pub async fn check_and_track_expiration(&self, key: &Key, owner: LockOwner) -> bool {
        let view = self.transport.sites_view();
        for sender in &self.senders {
            if !view.contains(&sender.site) {
                continue;
            }
            let request = IracRequest::Touch {
                origin: self.local_site.clone(),
                cache: self.cache_name.clone(),
                key: key.clone(),
            };
            match self.transport.backup_remotely(&sender.site, request).await {
                Ok(XSiteResponse::Touched(false)) | Ok(XSiteResponse::Ack) => {}
                Ok(XSiteResponse::Touched(true)) => {
                    debug!(site = %sender.site, "entry touched remotely, expiration cancelled");
                    return false;
                }
                Err(e) => {
                    debug!(site = %sender.site, error = %e, "touch check failed, expiration cancelled");
                    return false;
                }
            }
        }

        let segment = self.topology.current().segment_of(key);
        if self.container.remove(key).is_none() {
            return true;
        }
        let metadata = self.generator.generate_new_metadata(segment);
        self.tombstones
            .store_tombstone(segment, key.clone(), metadata.clone());
        self.track_removed_key(segment, key.clone(), owner, metadata, true);
        true
    }

    fn next_batch(&self, site: &str) -> Vec<PendingSend> {
        let topology = self.topology.current();
        let local = self.topology.local_node();
        let mut batch = Vec::new();
        for mut entry in self.updated.keys.iter_mut() {
            if batch.len() >= self.batch_size {
                break;
            }
            let key = entry.key().clone();
            let tracked = entry.value_mut();
            if topology.ownership(tracked.segment, local) != Ownership::Primary {
                continue;
            }
            if tracked.sites.get(site) != Some(&SiteState::Pending) {
                continue;
            }
            tracked
                .sites
                .insert(site.to_string(), SiteState::InFlight(tracked.owner));
            batch.push(PendingSend {
                key,
                segment: tracked.segment,
                owner: tracked.owner,
                tombstone: tracked.tombstone.clone(),
                expiration: tracked.expiration,
            });
        }
        batch
    }

    /// Latest state of a tracked key: its stored value, else its tombstone.
    fn build_update(&self, pending: &PendingSend) -> Option<IracUpdate> {
        let removal = |metadata: IracMetadata| IracUpdate {
            key: pending.key.clone(),
            segment: pending.segment,
            metadata,
            value: None,
            expiration: pending.expiration,
        };
        if let Some(tombstone) = &pending.tombstone {
            return Some(removal(tombstone.clone()));
        }
        if let Some(entry) = self.container.get(&pending.key) {
            let metadata = entry.metadata.unwrap_or_else(|| {
                self.generator
                    .generate_metadata_with_current_version(pending.segment)
            });
            return Some(IracUpdate {
                key: pending.key.clone(),
                segment: pending.segment,
                metadata,
                value: Some(entry.value),
                expiration: false,
            });
        }
        self.tombstones.get_tombstone(&pending.key).map(removal)
    }

    fn requeue(&self, site: &str, sent: &[PendingSend]) {
        for pending in sent {
            if let Some(mut tracked) = self.updated.keys.get_mut(&pending.key) {
                if tracked.sites.get(site) == Some(&SiteState::InFlight(pending.owner)) {
                    tracked.sites.insert(site.to_string(), SiteState::Pending);
                }
            }
        }
    }

    /// Mark `pending` delivered to `site`. Returns the cleanup entry when
    /// the key reached every site.
    fn complete(&self, site: &str, pending: &PendingSend) -> Option<CleanupEntry> {
        let all_done = match self.updated.keys.get_mut(&pending.key) {
            Some(mut tracked) => {
                if tracked.sites.get(site) == Some(&SiteState::InFlight(pending.owner)) {
                    tracked.sites.remove(site);
                }
                tracked.sites.is_empty() && tracked.owner == pending.owner
            }
            None => false,
        };
        if !all_done {
            return None;
        }
        let (key, tracked) = self
            .updated
            .keys
            .remove_if(&pending.key, |_, t| {
                t.sites.is_empty() && t.owner == pending.owner
            })?;
        if let Some(tombstone) = &tracked.tombstone {
            self.tombstones.remove_tombstone_if(&key, tombstone);
        }
        Some(CleanupEntry {
            key,
            segment: tracked.segment,
            owner: tracked.owner,
            tombstone: tracked.tombstone,
        })
    }

    async fn complete_batch(&self, site: &str, sent: &[PendingSend]) {
        let topology = self.topology.current();
        let local = self.topology.local_node();
        let mut cleanups: BTreeMap<NodeId, Vec<CleanupEntry>> = BTreeMap::new();
        for pending in sent {
            if let Some(entry) = self.complete(site, pending) {
                for &owner in topology.write_owners(entry.segment) {
                    if owner != local {
                        cleanups.entry(owner).or_default().push(entry.clone());
                    }
                }
            }
        }
        self.refresh_queue_size();

        for (node, entries) in cleanups {
            let count = entries.len();
            if let Err(e) = self
                .rpc
                .invoke(node, ClusterCommand::CleanupKeys { entries })
                .await
            {
                warn!(node, keys = count, error = %e, "backup key cleanup failed");
            }
        }
    }

    /// One step of the sender of `sender.site`.
    async fn send_round(
        &self,
        sender: &SiteSender,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SendStep {
        let site = sender.site.as_str();

        if sender.clear_pending.swap(false, Ordering::AcqRel) {
            let request = IracRequest::Clear {
                origin: self.local_site.clone(),
                cache: self.cache_name.clone(),
            };
            let result = tokio::select! {
                result = self.transport.backup_remotely(site, request) => result,
                _ = shutdown.changed() => {
                    sender.clear_pending.store(true, Ordering::Release);
                    return SendStep::Stop;
                }
            };
            return match result {
                Ok(_) => {
                    debug!(site, "clear delivered");
                    self.on_success(sender);
                    SendStep::Continue
                }
                Err(e) => {
                    sender.clear_pending.store(true, Ordering::Release);
                    self.on_failure(sender, &e, shutdown).await
                }
            };
        }

        let batch = self.next_batch(site);
        if batch.is_empty() {
            return SendStep::Idle;
        }

        let mut sent = Vec::with_capacity(batch.len());
        let mut updates = Vec::with_capacity(batch.len());
        let mut vanished = Vec::new();
        for pending in batch {
            match self.build_update(&pending) {
                Some(update) => {
                    updates.push(update);
                    sent.push(pending);
                }
                None => vanished.push(pending),
            }
        }
        // nothing left to ship for these
        self.complete_batch(site, &vanished).await;
        if updates.is_empty() {
            return SendStep::Continue;
        }

        let count = updates.len();
        let request = IracRequest::Updates {
            origin: self.local_site.clone(),
            cache: self.cache_name.clone(),
            updates,
        };
        let result = tokio::select! {
            result = self.transport.backup_remotely(site, request) => result,
            _ = shutdown.changed() => {
                self.requeue(site, &sent);
                return SendStep::Stop;
            }
        };
        match result {
            Ok(_) => {
                debug!(site, keys = count, "updates delivered");
                self.complete_batch(site, &sent).await;
                self.on_success(sender);
                SendStep::Continue
            }
            Err(e) => {
                self.requeue(site, &sent);
                self.on_failure(sender, &e, shutdown).await
            }
        }
    }

    fn on_success(&self, sender: &SiteSender) {
        if sender.degraded.swap(false, Ordering::AcqRel) {
            info!(site = %sender.site, "backup site reachable again");
            sender.backoff.reset();
        }
    }

    async fn on_failure(
        &self,
        sender: &SiteSender,
        error: &XSiteError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SendStep {
        if error.is_transient() {
            if !sender.degraded.swap(true, Ordering::AcqRel) {
                warn!(site = %sender.site, error = %error, "backup site unavailable, backing off");
            }
            tokio::select! {
                _ = sender.backoff.back_off() => SendStep::Continue,
                _ = shutdown.changed() => SendStep::Stop,
            }
        } else {
            warn!(site = %sender.site, error = %error, "send to backup site failed, retrying");
            sender.degraded.store(false, Ordering::Release);
            sender.backoff.reset();
            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => SendStep::Continue,
                _ = shutdown.changed() => SendStep::Stop,
            }
        }
    }
}

async fn send_loop(
    manager: Weak<IracManager>,
    sender: Arc<SiteSender>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let step = match manager.upgrade() {
            Some(manager) => manager.send_round(&sender, &mut shutdown).await,
            None => return,
        };
        match step {
            SendStep::Continue => {}
            SendStep::Idle => {
                tokio::select! {
                    _ = sender.notify.notified() => {}
                    _ = shutdown.changed() => return,
                }
            }
            SendStep::Stop => return,
        }
    }
}
