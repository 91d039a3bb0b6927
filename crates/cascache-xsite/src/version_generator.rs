//! Allocation of local versions and tracking of the maximum version seen.
//!
//! One generator exists per cache and node. For every segment it keeps the
//! component-wise maximum of all versions it has produced or observed, so a
//! freshly generated version causally dominates everything seen so far.

use crate::error::Result;
use crate::topology::CacheTopology;
use crate::types::SegmentId;
use crate::version::{EntryVersion, IracMetadata, SiteVersion};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct GeneratorState {
    /// Last topology passed to `on_topology_change`.
    topology_id: u32,
    /// Generation used by segments whose primary never changed.
    base_generation: u32,
    /// Generation bumped for segments whose primary changed.
    segment_generation: HashMap<SegmentId, u32>,
    /// Maximum version seen per segment.
    segments: HashMap<SegmentId, EntryVersion>,
}

impl GeneratorState {
    fn generation(&self, segment: SegmentId) -> u32 {
        self.segment_generation
            .get(&segment)
            .copied()
            .unwrap_or(self.base_generation)
    }
}

/// Serializable image of the generator, used for global-state persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    /// Last installed topology.
    pub topology_id: u32,
    /// Generation of untouched segments.
    pub base_generation: u32,
    /// Per-segment bumped generations.
    pub segment_generation: BTreeMap<SegmentId, u32>,
    /// Per-segment maximum versions.
    pub segments: BTreeMap<SegmentId, EntryVersion>,
}

/// Produces and tracks causal versions for one cache on one node.
#[derive(Debug)]
pub struct VersionGenerator {
    local_site: String,
    state: Mutex<GeneratorState>,
    persistence_path: Option<PathBuf>,
}

impl VersionGenerator {
    /// Create a generator for the given local site without persistence.
    pub fn new(local_site: impl Into<String>) -> Self {
        Self {
            local_site: local_site.into(),
            state: Mutex::new(GeneratorState::default()),
            persistence_path: None,
        }
    }

    /// Create a generator that snapshots to `path` on stop and restores on start.
    pub fn with_persistence(local_site: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            persistence_path: Some(path.into()),
            ..Self::new(local_site)
        }
    }

    /// Local site name.
    pub fn local_site(&self) -> &str {
        &self.local_site
    }

    /// Restore persisted versions if a snapshot exists.
    pub fn start(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !path.exists() {
            debug!(path = %path.display(), "no persisted versions, starting empty");
            return Ok(());
        }
        let snapshot = load_snapshot(path)?;
        info!(
            path = %path.display(),
            segments = snapshot.segments.len(),
            "restored persisted versions"
        );
        self.restore(snapshot);
        Ok(())
    }

    /// Persist versions if persistence is configured.
    pub fn stop(&self) -> Result<()> {
        if let Some(path) = &self.persistence_path {
            let snapshot = self.snapshot();
            std::fs::write(path, bincode::serialize(&snapshot)?)?;
            debug!(path = %path.display(), "persisted versions");
        }
        Ok(())
    }

    /// Allocate a fresh local version for `segment`.
    pub fn generate_new_metadata(&self, segment: SegmentId) -> IracMetadata {
        let mut state = self.state.lock();
        let generation = state.generation(segment);
        let version = state.segments.entry(segment).or_default();
        let next = match version.get(&self.local_site) {
            Some(current) if current.topology_id >= generation => {
                SiteVersion::new(current.topology_id, current.counter + 1)
            }
            _ => SiteVersion::new(generation, 1),
        };
        version.set(&self.local_site, next);
        IracMetadata::new(self.local_site.clone(), version.clone())
    }

    /// Stamp with the current version of `segment` without advancing it.
    ///
    /// Allocates a first version when the segment has no local component yet.
    pub fn generate_metadata_with_current_version(&self, segment: SegmentId) -> IracMetadata {
        {
            let state = self.state.lock();
            if let Some(version) = state.segments.get(&segment) {
                if version.get(&self.local_site).is_some() {
                    return IracMetadata::new(self.local_site.clone(), version.clone());
                }
            }
        }
        self.generate_new_metadata(segment)
    }

    /// Fold a remote version into the maximum seen for `segment`.
    pub fn update_version(&self, segment: SegmentId, remote: &EntryVersion) {
        let mut state = self.state.lock();
        let version = state.segments.entry(segment).or_default();
        *version = version.merge(remote);
    }

    /// Version to use for an entry produced by merging `local` and `remote`.
    ///
    /// The component-wise maximum dominates both inputs and is computed
    /// identically on every site, so no site needs to re-replicate the result.
    pub fn merge_version(
        &self,
        segment: SegmentId,
        local: &EntryVersion,
        remote: &EntryVersion,
        site: &str,
    ) -> IracMetadata {
        let merged = local.merge(remote);
        self.update_version(segment, &merged);
        IracMetadata::new(site, merged)
    }

    /// Bump the generation of segments whose primary changed.
    ///
    /// Repeated calls with the same (or an older) topology are no-ops.
    pub fn on_topology_change(&self, old: Option<&CacheTopology>, new: &CacheTopology) {
        let mut state = self.state.lock();
        if new.topology_id <= state.topology_id && state.topology_id != 0 {
            return;
        }
        match old {
            None => {
                if state.base_generation == 0 {
                    state.base_generation = new.topology_id;
                }
            }
            Some(old) => {
                let mut bumped = 0;
                for segment in 0..new.num_segments() {
                    if old.primary(segment) != new.primary(segment) {
                        state.segment_generation.insert(segment, new.topology_id);
                        bumped += 1;
                    }
                }
                debug!(
                    topology_id = new.topology_id,
                    segments = bumped,
                    "bumped version generation"
                );
            }
        }
        state.topology_id = new.topology_id;
    }

    /// Maximum version seen for `segment`.
    pub fn current_version(&self, segment: SegmentId) -> Option<EntryVersion> {
        self.state.lock().segments.get(&segment).cloned()
    }

    /// Copy of the generator state.
    pub fn snapshot(&self) -> VersionSnapshot {
        let state = self.state.lock();
        VersionSnapshot {
            topology_id: state.topology_id,
            base_generation: state.base_generation,
            segment_generation: state
                .segment_generation
                .iter()
                .map(|(s, g)| (*s, *g))
                .collect(),
            segments: state
                .segments
                .iter()
                .map(|(s, v)| (*s, v.clone()))
                .collect(),
        }
    }

    /// Merge a snapshot into the current state.
    pub fn restore(&self, snapshot: VersionSnapshot) {
        let mut state = self.state.lock();
        state.topology_id = state.topology_id.max(snapshot.topology_id);
        state.base_generation = state.base_generation.max(snapshot.base_generation);
        for (segment, generation) in snapshot.segment_generation {
            let entry = state.segment_generation.entry(segment).or_insert(generation);
            *entry = (*entry).max(generation);
        }
        for (segment, version) in snapshot.segments {
            let entry = state.segments.entry(segment).or_default();
            *entry = entry.merge(&version);
        }
    }
}

fn load_snapshot(path: &Path) -> Result<VersionSnapshot> {
    let bytes = std::fs::read(path)?;
    Ok(bincode::deserialize(&bytes)?)
}
