//! Commands exchanged between the nodes of one site.
//!
//! Covers backup writes (local and resolved remote ones), clears, key
//! cleanup after delivery, the tombstone cleanup protocol and the state
//! handoff on topology changes. [`InMemoryCluster`]
//! connects in-process nodes and records every command it routes.

use crate::error::{Result, XSiteError};
use crate::tombstone::TombstoneRecord;
use crate::types::{Key, LockOwner, NodeId, SegmentId, Value};
use crate::version::IracMetadata;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Key delivered to every backup site, to be dropped by the other owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEntry {
    /// Delivered key.
    pub key: Key,
    /// Segment of the key.
    pub segment: SegmentId,
    /// Writer whose update was delivered.
    pub owner: LockOwner,
    /// Tombstone metadata when the delivered update was a removal.
    pub tombstone: Option<IracMetadata>,
}

/// Tracked key handed to a new primary owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    /// Tracked key.
    pub key: Key,
    /// Segment of the key.
    pub segment: SegmentId,
    /// Writer of the pending update.
    pub owner: LockOwner,
    /// Tombstone metadata for pending removals.
    pub tombstone: Option<IracMetadata>,
    /// Pending removal caused by expiration.
    pub expiration: bool,
}

/// Entry resolved by the primary owner from a remote site's update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWrite {
    /// Written key.
    pub key: Key,
    /// Segment of the key.
    pub segment: SegmentId,
    /// Resolved value, `None` for removals.
    pub value: Option<Value>,
    /// Metadata stored with the value or tombstone.
    pub metadata: IracMetadata,
}

/// Command sent from one node to another within a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCommand {
    /// Primary owner forwards a local write to the other write owners.
    BackupWrite {
        /// Written key.
        key: Key,
        /// Segment of the key.
        segment: SegmentId,
        /// New value, `None` for removals.
        value: Option<Value>,
        /// Metadata generated by the primary.
        metadata: IracMetadata,
        /// Writer token.
        owner: LockOwner,
        /// Removal caused by expiration.
        expiration: bool,
    },
    /// Primary owner copies entries it resolved from remote updates to the
    /// other write owners. Never replicated again.
    RemoteWrites {
        /// Resolved entries.
        writes: Vec<ResolvedWrite>,
    },
    /// The cache was cleared on another node.
    Clear,
    /// Keys confirmed by every backup site.
    CleanupKeys {
        /// Delivered keys.
        entries: Vec<CleanupEntry>,
    },
    /// Primary's decision: drop these tombstones.
    TombstoneCleanup {
        /// Tombstones to drop when their metadata matches.
        tombstones: Vec<TombstoneRecord>,
    },
    /// Backup owner asks the primary whether these tombstones can go.
    TombstonePrimaryCheck {
        /// Candidate tombstones.
        tombstones: Vec<TombstoneRecord>,
    },
    /// Tombstones pushed to a node that became a write owner.
    TombstoneState {
        /// Pushed tombstones.
        tombstones: Vec<TombstoneRecord>,
    },
    /// New primary asks for the tracked keys of `segments`.
    RequestState {
        /// Node asking.
        origin: NodeId,
        /// Segments it became primary for.
        segments: Vec<SegmentId>,
    },
    /// Tracked keys sent to a new primary.
    StateResponse {
        /// Tracked keys.
        entries: Vec<StateEntry>,
    },
}

/// Discriminant of a [`ClusterCommand`], used for bookkeeping and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// [`ClusterCommand::BackupWrite`]
    BackupWrite,
    /// [`ClusterCommand::RemoteWrites`]
    RemoteWrites,
    /// [`ClusterCommand::Clear`]
    Clear,
    /// [`ClusterCommand::CleanupKeys`]
    CleanupKeys,
    /// [`ClusterCommand::TombstoneCleanup`]
    TombstoneCleanup,
    /// [`ClusterCommand::TombstonePrimaryCheck`]
    TombstonePrimaryCheck,
    /// [`ClusterCommand::TombstoneState`]
    TombstoneState,
    /// [`ClusterCommand::RequestState`]
    RequestState,
    /// [`ClusterCommand::StateResponse`]
    StateResponse,
}

impl ClusterCommand {
    /// Kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            ClusterCommand::BackupWrite { .. } => CommandKind::BackupWrite,
            ClusterCommand::RemoteWrites { .. } => CommandKind::RemoteWrites,
            ClusterCommand::Clear => CommandKind::Clear,
            ClusterCommand::CleanupKeys { .. } => CommandKind::CleanupKeys,
            ClusterCommand::TombstoneCleanup { .. } => CommandKind::TombstoneCleanup,
            ClusterCommand::TombstonePrimaryCheck { .. } => CommandKind::TombstonePrimaryCheck,
            ClusterCommand::TombstoneState { .. } => CommandKind::TombstoneState,
            ClusterCommand::RequestState { .. } => CommandKind::RequestState,
            ClusterCommand::StateResponse { .. } => CommandKind::StateResponse,
        }
    }
}

/// Sends commands to other nodes of the local site.
#[async_trait]
pub trait ClusterRpc: Send + Sync {
    /// Identity of the sending node.
    fn local_node(&self) -> NodeId;

    /// Deliver `command` to `target` and wait until it was handled.
    async fn invoke(&self, target: NodeId, command: ClusterCommand) -> Result<()>;
}

/// Handles commands addressed to a node.
#[async_trait]
pub trait ClusterHandler: Send + Sync {
    /// Handle `command` sent by `from`.
    async fn handle_command(&self, from: NodeId, command: ClusterCommand) -> Result<()>;
}

/// One routed command, as recorded by [`InMemoryCluster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentCommand {
    /// Sender.
    pub from: NodeId,
    /// Receiver.
    pub to: NodeId,
    /// Kind of command.
    pub kind: CommandKind,
}

/// In-process cluster connecting the nodes of one site.
///
/// Handlers are held weakly so a node can own its RPC endpoint without a
/// reference cycle through the cluster.
#[derive(Default)]
pub struct InMemoryCluster {
    handlers: RwLock<HashMap<NodeId, Weak<dyn ClusterHandler>>>,
    sent: Mutex<Vec<SentCommand>>,
    blocked: RwLock<HashSet<CommandKind>>,
    down: RwLock<HashSet<NodeId>>,
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCluster")
            .field("nodes", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `handler` as `node`.
    pub fn join(&self, node: NodeId, handler: Weak<dyn ClusterHandler>) {
        self.handlers.write().insert(node, handler);
    }

    /// RPC endpoint for `node`.
    pub fn rpc_for(self: &Arc<Self>, node: NodeId) -> Arc<ClusterLink> {
        Arc::new(ClusterLink {
            node,
            cluster: Arc::clone(self),
        })
    }

    /// Commands routed so far (blocked ones included).
    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().clone()
    }

    /// Number of routed commands of `kind`.
    pub fn count(&self, kind: CommandKind) -> usize {
        self.sent.lock().iter().filter(|c| c.kind == kind).count()
    }

    /// Forget recorded commands.
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Record commands of `kind` but do not deliver them.
    pub fn block(&self, kind: CommandKind) {
        self.blocked.write().insert(kind);
    }

    /// Deliver commands of `kind` again.
    pub fn unblock(&self, kind: CommandKind) {
        self.blocked.write().remove(&kind);
    }

    /// Make `node` unreachable (`true`) or reachable again.
    pub fn set_down(&self, node: NodeId, down: bool) {
        let mut nodes = self.down.write();
        if down {
            nodes.insert(node);
        } else {
            nodes.remove(&node);
        }
    }

    async fn route(&self, from: NodeId, to: NodeId, command: ClusterCommand) -> Result<()> {
        let kind = command.kind();
        self.sent.lock().push(SentCommand { from, to, kind });
        trace!(from, to, ?kind, "routing cluster command");

        if self.down.read().contains(&to) {
            return Err(XSiteError::NodeUnreachable { node: to });
        }
        if self.blocked.read().contains(&kind) {
            return Ok(());
        }
        let handler = self.handlers.read().get(&to).and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.handle_command(from, command).await,
            None => Err(XSiteError::NodeUnreachable { node: to }),
        }
    }
}

/// A node's endpoint on an [`InMemoryCluster`].
#[derive(Debug)]
pub struct ClusterLink {
    node: NodeId,
    cluster: Arc<InMemoryCluster>,
}

#[async_trait]
impl ClusterRpc for ClusterLink {
    fn local_node(&self) -> NodeId {
        self.node
    }

    async fn invoke(&self, target: NodeId, command: ClusterCommand) -> Result<()> {
        self.cluster.route(self.node, target, command).await
    }
}

/// Cluster of a single node: every invocation fails as unreachable.
#[derive(Debug, Clone, Copy)]
pub struct LocalOnly(pub NodeId);

#[async_trait]
impl ClusterRpc for LocalOnly {
    fn local_node(&self) -> NodeId {
        self.0
    }

    async fn invoke(&self, target: NodeId, _command: ClusterCommand) -> Result<()> {
        Err(XSiteError::NodeUnreachable { node: target })
    }
}
