#![warn(missing_docs)]

//! CasCache cross-site replication: asynchronous multi-master replication
//! between sites (IRAC), causal versioning, conflict resolution, tombstones.

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod container;
pub mod error;
pub mod irac_manager;
pub mod merge_policy;
pub mod node;
pub mod remote_apply;
pub mod statistics;
pub mod tombstone;
pub mod topology;
pub mod transport;
pub mod types;
pub mod version;
pub mod version_generator;

pub use backoff::{BackOff, BackOffFactory, ExponentialBackOff, ExponentialBackOffFactory, NoBackOff};
pub use cluster::{ClusterCommand, ClusterHandler, ClusterRpc, InMemoryCluster, ResolvedWrite};
pub use config::{MergePolicyKind, XSiteConfig};
pub use container::{CacheEntry, DataContainer, KeyLocks, MemoryContainer};
pub use error::{Result, XSiteError};
pub use irac_manager::{IracManager, SiteState};
pub use merge_policy::{MergePolicy, SiteEntry, XSiteEntryMergePolicy};
pub use node::IracNode;
pub use remote_apply::{ApplyContext, ApplyOutcome, RemoteApplier, SiteRouter};
pub use statistics::{ConflictOutcome, XSiteStatistics};
pub use tombstone::{CleanupRound, TombstoneManager, TombstoneRecord};
pub use topology::{CacheTopology, Ownership, StaticTopology, TopologyProvider};
pub use transport::{InMemorySiteNetwork, IracRequest, IracUpdate, LinkFault, XSiteResponse, XSiteTransport};
pub use types::{Key, LockOwner, NodeId, SegmentId, Value};
pub use version::{EntryVersion, IracMetadata, SiteVersion, VersionOrdering};
pub use version_generator::VersionGenerator;
