//! Per-key causal versions for cross-site replication.
//!
//! An [`EntryVersion`] maps each site name to a [`SiteVersion`]: a counter
//! scoped to the topology generation in which it was allocated. Comparing
//! two entry versions yields one of four outcomes; `Conflicting` is what
//! triggers the merge policy on the receiving site.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Counter allocated by one site, scoped to a topology generation.
///
/// Ordered by topology generation first: a counter restarted after a
/// topology change is newer than any counter of an older generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SiteVersion {
    /// Topology generation the counter belongs to.
    pub topology_id: u32,
    /// Monotonic counter within the generation.
    pub counter: u64,
}

impl SiteVersion {
    /// Create a new site version.
    pub fn new(topology_id: u32, counter: u64) -> Self {
        Self {
            topology_id,
            counter,
        }
    }
}

impl PartialOrd for SiteVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SiteVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.topology_id
            .cmp(&other.topology_id)
            .then(self.counter.cmp(&other.counter))
    }
}

/// Outcome of comparing two entry versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionOrdering {
    /// The left version happened before the right one.
    Before,
    /// The left version happened after the right one.
    After,
    /// Both versions carry identical knowledge.
    Equal,
    /// Neither version dominates: concurrent updates.
    Conflicting,
}

impl VersionOrdering {
    /// The ordering seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            VersionOrdering::Before => VersionOrdering::After,
            VersionOrdering::After => VersionOrdering::Before,
            other => other,
        }
    }
}

/// Causal version of one key: site name to [`SiteVersion`].
///
/// A missing site means no causal knowledge of that site for the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntryVersion {
    versions: BTreeMap<String, SiteVersion>,
}

impl EntryVersion {
    /// Create an empty version.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a version holding a single site component.
    pub fn single(site: &str, version: SiteVersion) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(site.to_string(), version);
        Self { versions }
    }

    /// Component for a site, if any.
    pub fn get(&self, site: &str) -> Option<SiteVersion> {
        self.versions.get(site).copied()
    }

    /// Replace the component of a site.
    pub fn set(&mut self, site: &str, version: SiteVersion) {
        self.versions.insert(site.to_string(), version);
    }

    /// True when no site has a component.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Iterate over `(site, version)` components in site order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, SiteVersion)> {
        self.versions.iter().map(|(s, v)| (s.as_str(), *v))
    }

    /// Compare this version with another.
    pub fn compare(&self, other: &EntryVersion) -> VersionOrdering {
        let sites: BTreeSet<&String> = self.versions.keys().chain(other.versions.keys()).collect();

        let mut self_le = true; // every self[s] <= other[s]
        let mut other_le = true; // every other[s] <= self[s]

        for site in sites {
            match (self.versions.get(site), other.versions.get(site)) {
                (Some(a), Some(b)) => match a.cmp(b) {
                    Ordering::Less => other_le = false,
                    Ordering::Greater => self_le = false,
                    Ordering::Equal => {}
                },
                (Some(_), None) => self_le = false,
                (None, Some(_)) => other_le = false,
                (None, None) => {}
            }
            if !self_le && !other_le {
                return VersionOrdering::Conflicting;
            }
        }

        match (self_le, other_le) {
            (true, true) => VersionOrdering::Equal,
            (true, false) => VersionOrdering::Before,
            (false, true) => VersionOrdering::After,
            (false, false) => VersionOrdering::Conflicting,
        }
    }

    /// Component-wise maximum of two versions.
    pub fn merge(&self, other: &EntryVersion) -> EntryVersion {
        let mut versions = self.versions.clone();
        for (site, v) in &other.versions {
            versions
                .entry(site.clone())
                .and_modify(|mine| {
                    if *v > *mine {
                        *mine = *v;
                    }
                })
                .or_insert(*v);
        }
        EntryVersion { versions }
    }
}

impl std::fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, (site, v)) in self.versions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}:{}", site, v.topology_id, v.counter)?;
        }
        write!(f, ")")
    }
}

/// Replication metadata attached to every replicated entry and tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IracMetadata {
    /// Site that produced this version.
    pub site: String,
    /// Causal version of the entry.
    pub version: EntryVersion,
}

impl IracMetadata {
    /// Create new metadata.
    pub fn new(site: impl Into<String>, version: EntryVersion) -> Self {
        Self {
            site: site.into(),
            version,
        }
    }
}
