//! Conflict resolution between concurrent updates from different sites.
//!
//! A policy is only consulted when the two versions compare as
//! [`Conflicting`](crate::version::VersionOrdering::Conflicting). Every site
//! evaluates the policy on its own, so policies must be pure and give the
//! same answer for `(a, b)` and `(b, a)` wherever they run.

use crate::config::MergePolicyKind;
use crate::error::Result;
use crate::types::{Key, Value};
use crate::version::EntryVersion;
use std::fmt::Debug;
use std::sync::Arc;

/// One side of a conflict: the entry as known by a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteEntry {
    /// Site that wrote the entry.
    pub site: String,
    /// Value, or `None` for a tombstone.
    pub value: Option<Value>,
    /// Causal version of the entry.
    pub version: EntryVersion,
}

impl SiteEntry {
    /// Create a site entry.
    pub fn new(site: impl Into<String>, value: Option<Value>, version: EntryVersion) -> Self {
        Self {
            site: site.into(),
            value,
            version,
        }
    }

    /// True when this side deleted the key.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// True when both entries carry the same site and value.
    pub fn same_outcome(&self, other: &SiteEntry) -> bool {
        self.site == other.site && self.value == other.value
    }
}

/// Extension point for user-supplied conflict resolution.
///
/// Implementations must be deterministic and symmetric in their two inputs.
/// They may combine values (for example a set union) instead of picking one.
pub trait XSiteEntryMergePolicy: Send + Sync + Debug {
    /// Resolve a conflict on `key` between the local and the remote entry.
    fn merge(&self, key: &Key, local: &SiteEntry, remote: &SiteEntry) -> Result<SiteEntry>;
}

/// Merge policy configured for a cache.
#[derive(Debug, Clone, Default)]
pub enum MergePolicy {
    /// The entry written by the lexicographically smallest site wins.
    #[default]
    Default,
    /// A live value beats a tombstone; otherwise as `Default`.
    PreferNonNull,
    /// A tombstone beats a live value; otherwise as `Default`.
    PreferNull,
    /// Every conflict resolves to a tombstone.
    AlwaysRemove,
    /// User-supplied policy.
    Custom(Arc<dyn XSiteEntryMergePolicy>),
}

impl From<MergePolicyKind> for MergePolicy {
    fn from(kind: MergePolicyKind) -> Self {
        match kind {
            MergePolicyKind::Default => MergePolicy::Default,
            MergePolicyKind::PreferNonNull => MergePolicy::PreferNonNull,
            MergePolicyKind::PreferNull => MergePolicy::PreferNull,
            MergePolicyKind::AlwaysRemove => MergePolicy::AlwaysRemove,
        }
    }
}

impl MergePolicy {
    /// Wrap a custom policy.
    pub fn custom(policy: impl XSiteEntryMergePolicy + 'static) -> Self {
        MergePolicy::Custom(Arc::new(policy))
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            MergePolicy::Default => "default",
            MergePolicy::PreferNonNull => "prefer-non-null",
            MergePolicy::PreferNull => "prefer-null",
            MergePolicy::AlwaysRemove => "always-remove",
            MergePolicy::Custom(_) => "custom",
        }
    }

    /// Resolve a conflict on `key`.
    pub fn merge(&self, key: &Key, local: &SiteEntry, remote: &SiteEntry) -> Result<SiteEntry> {
        match self {
            MergePolicy::Default => Ok(site_order_winner(local, remote).clone()),
            MergePolicy::PreferNonNull => Ok(match (local.is_tombstone(), remote.is_tombstone()) {
                (false, true) => local.clone(),
                (true, false) => remote.clone(),
                _ => site_order_winner(local, remote).clone(),
            }),
            MergePolicy::PreferNull => Ok(match (local.is_tombstone(), remote.is_tombstone()) {
                (true, false) => local.clone(),
                (false, true) => remote.clone(),
                _ => site_order_winner(local, remote).clone(),
            }),
            MergePolicy::AlwaysRemove => {
                let winner = site_order_winner(local, remote);
                Ok(SiteEntry::new(winner.site.clone(), None, winner.version.clone()))
            }
            MergePolicy::Custom(policy) => policy.merge(key, local, remote),
        }
    }
}

/// Pick the entry of the smaller site name; ties break on the value bytes.
fn site_order_winner<'a>(a: &'a SiteEntry, b: &'a SiteEntry) -> &'a SiteEntry {
    match a.site.cmp(&b.site) {
        std::cmp::Ordering::Less => a,
        std::cmp::Ordering::Greater => b,
        std::cmp::Ordering::Equal => {
            if a.value <= b.value {
                a
            } else {
                b
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XSiteError;
    use crate::version::SiteVersion;
    use bytes::Bytes;

    fn entry(site: &str, value: Option<&'static str>) -> SiteEntry {
        SiteEntry::new(
            site,
            value.map(|s| Bytes::from_static(s.as_bytes())),
            EntryVersion::single(site, SiteVersion::new(1, 1)),
        )
    }

    fn key() -> Key {
        Bytes::from_static(b"k")
    }

    fn all_builtins() -> Vec<MergePolicy> {
        vec![
            MergePolicy::Default,
            MergePolicy::PreferNonNull,
            MergePolicy::PreferNull,
            MergePolicy::AlwaysRemove,
        ]
    }

    #[test]
    fn test_default_smaller_site_wins() {
        let lon = entry("LON", Some("v-2"));
        let nyc = entry("NYC", Some("v-3"));
        let policy = MergePolicy::Default;
        assert_eq!(policy.merge(&key(), &lon, &nyc).unwrap(), lon);
        assert_eq!(policy.merge(&key(), &nyc, &lon).unwrap(), lon);
    }

    #[test]
    fn test_prefer_non_null() {
        let lon = entry("LON", None);
        let nyc = entry("NYC", Some("v"));
        let policy = MergePolicy::PreferNonNull;
        assert_eq!(policy.merge(&key(), &lon, &nyc).unwrap(), nyc);
        assert_eq!(policy.merge(&key(), &nyc, &lon).unwrap(), nyc);
    }

    #[test]
    fn test_prefer_null() {
        let lon = entry("LON", Some("v"));
        let nyc = entry("NYC", None);
        let policy = MergePolicy::PreferNull;
        assert_eq!(policy.merge(&key(), &lon, &nyc).unwrap(), nyc);
        assert_eq!(policy.merge(&key(), &nyc, &lon).unwrap(), nyc);
    }

    #[test]
    fn test_prefer_falls_back_to_site_order() {
        let lon = entry("LON", Some("a"));
        let nyc = entry("NYC", Some("b"));
        assert_eq!(MergePolicy::PreferNull.merge(&key(), &nyc, &lon).unwrap(), lon);
        assert_eq!(MergePolicy::PreferNonNull.merge(&key(), &nyc, &lon).unwrap(), lon);
    }

    #[test]
    fn test_always_remove() {
        let lon = entry("LON", Some("a"));
        let nyc = entry("NYC", Some("b"));
        let merged = MergePolicy::AlwaysRemove.merge(&key(), &nyc, &lon).unwrap();
        assert!(merged.is_tombstone());
        assert_eq!(merged.site, "LON");
    }

    #[test]
    fn test_builtins_are_symmetric() {
        let sides = [
            entry("LON", Some("a")),
            entry("NYC", Some("b")),
            entry("SFO", None),
            entry("AMS", None),
        ];
        for policy in all_builtins() {
            for a in &sides {
                for b in &sides {
                    let ab = policy.merge(&key(), a, b).unwrap();
                    let ba = policy.merge(&key(), b, a).unwrap();
                    assert!(ab.same_outcome(&ba), "{} not symmetric", policy.name());
                }
            }
        }
    }

    #[derive(Debug)]
    struct FailingPolicy;

    impl XSiteEntryMergePolicy for FailingPolicy {
        fn merge(&self, _: &Key, _: &SiteEntry, _: &SiteEntry) -> Result<SiteEntry> {
            Err(XSiteError::MergeFailed {
                msg: "refusing".to_string(),
            })
        }
    }

    #[test]
    fn test_custom_policy_error_propagates() {
        let policy = MergePolicy::custom(FailingPolicy);
        assert_eq!(policy.name(), "custom");
        let err = policy
            .merge(&key(), &entry("LON", None), &entry("NYC", None))
            .unwrap_err();
        assert!(matches!(err, XSiteError::MergeFailed { .. }));
    }

    #[test]
    fn test_from_kind() {
        assert!(matches!(
            MergePolicy::from(MergePolicyKind::PreferNull),
            MergePolicy::PreferNull
        ));
        assert!(matches!(
            MergePolicy::from(MergePolicyKind::AlwaysRemove),
            MergePolicy::AlwaysRemove
        ));
    }
}
