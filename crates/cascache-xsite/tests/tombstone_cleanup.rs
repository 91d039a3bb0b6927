//! Tombstone cleanup across the write owners of one site.

mod common;

use bytes::Bytes;
use cascache_xsite::cluster::CommandKind;
use cascache_xsite::{CacheTopology, InMemorySiteNetwork, Key};
use common::{fast_config, TestSite};
use std::time::Duration;

/// One segment owned by nodes 1 (primary) and 2 (backup).
fn two_owners() -> CacheTopology {
    CacheTopology::round_robin(1, vec![1, 2], 1, 2)
}

fn key(k: &'static str) -> Key {
    Bytes::from_static(k.as_bytes())
}

#[tokio::test]
async fn test_primary_round_cleans_every_owner() {
    let network = InMemorySiteNetwork::new();
    let site = TestSite::build(&network, &fast_config("LON", &[]), 2, &two_owners());
    let (primary, backup) = (site.node(1), site.node(2));

    primary.put("k", "v").await.unwrap();
    primary.remove("k").await.unwrap();
    assert!(primary.tombstones().get_tombstone(&key("k")).is_some());
    assert!(backup.tombstones().get_tombstone(&key("k")).is_some());

    let round = primary.tombstones().run_cleanup_round().await;
    assert_eq!(round.removed, 1);
    assert_eq!(round.remaining, 0);
    assert!(primary.tombstones().is_empty());
    assert!(backup.tombstones().is_empty());
    assert_eq!(site.cluster.count(CommandKind::TombstoneCleanup), 1);
}

#[tokio::test]
async fn test_backup_waits_for_primary_decision() {
    let network = InMemorySiteNetwork::new();
    let site = TestSite::build(&network, &fast_config("LON", &[]), 2, &two_owners());
    let (primary, backup) = (site.node(1), site.node(2));

    primary.put("k", "v").await.unwrap();
    primary.remove("k").await.unwrap();

    // no answer from the primary: nothing may be removed
    site.cluster.block(CommandKind::TombstonePrimaryCheck);
    let round = backup.tombstones().run_cleanup_round().await;
    assert_eq!(round.removed, 0);
    assert_eq!(round.checked, 1);
    assert_eq!(backup.tombstones().size(), 1);
    assert_eq!(primary.tombstones().size(), 1);
    assert_eq!(site.cluster.count(CommandKind::TombstonePrimaryCheck), 1);
    assert_eq!(site.cluster.count(CommandKind::TombstoneCleanup), 0);

    site.cluster.unblock(CommandKind::TombstonePrimaryCheck);
    let round = backup.tombstones().run_cleanup_round().await;
    assert_eq!(round.removed, 1);
    assert!(backup.tombstones().is_empty());
    assert!(primary.tombstones().is_empty());
    assert_eq!(site.cluster.count(CommandKind::TombstoneCleanup), 1);
}

#[tokio::test]
async fn test_pending_keys_keep_their_tombstones() {
    let network = InMemorySiteNetwork::new();
    // NYC is never registered, and the nodes are not started: keys stay tracked
    let site = TestSite::build(&network, &fast_config("LON", &["NYC"]), 2, &two_owners());
    let (primary, backup) = (site.node(1), site.node(2));

    primary.put("k", "v").await.unwrap();
    primary.remove("k").await.unwrap();
    assert!(primary.manager().is_tracked(&key("k")));
    assert!(backup.manager().is_tracked(&key("k")));

    let round = primary.tombstones().run_cleanup_round().await;
    assert_eq!(round.removed, 0);
    assert_eq!(round.remaining, 1);
    let round = backup.tombstones().run_cleanup_round().await;
    assert_eq!(round.checked, 0);
    assert_eq!(backup.tombstones().size(), 1);
    assert_eq!(site.cluster.count(CommandKind::TombstoneCleanup), 0);
}

#[tokio::test]
async fn test_newer_tombstone_survives_stale_cleanup() {
    let network = InMemorySiteNetwork::new();
    let site = TestSite::build(&network, &fast_config("LON", &[]), 2, &two_owners());
    let (primary, backup) = (site.node(1), site.node(2));

    primary.put("k", "v1").await.unwrap();
    primary.remove("k").await.unwrap();
    let stale = backup.tombstones().get_tombstone(&key("k")).unwrap();

    // a newer removal reaches the backup while the primary cleans the old one
    site.cluster.block(CommandKind::TombstoneCleanup);
    primary.tombstones().run_cleanup_round().await;
    site.cluster.unblock(CommandKind::TombstoneCleanup);
    primary.put("k", "v2").await.unwrap();
    primary.remove("k").await.unwrap();
    let fresh = backup.tombstones().get_tombstone(&key("k")).unwrap();
    assert_ne!(stale, fresh);

    let removed = backup
        .tombstones()
        .handle_cleanup(&[cascache_xsite::TombstoneRecord::new(key("k"), 0, stale)]);
    assert_eq!(removed, 0);
    assert_eq!(backup.tombstones().get_tombstone(&key("k")), Some(fresh));
}

#[tokio::test]
async fn test_new_owner_receives_tombstones() {
    let network = InMemorySiteNetwork::new();
    let site = TestSite::build(
        &network,
        &fast_config("LON", &[]),
        2,
        &CacheTopology::round_robin(1, vec![1, 2], 1, 1),
    );
    let (primary, joiner) = (site.node(1), site.node(2));

    primary.put("k", "v").await.unwrap();
    primary.remove("k").await.unwrap();
    assert!(joiner.tombstones().is_empty());

    let next = CacheTopology::new(2, vec![1, 2], vec![vec![1, 2]]);
    primary.install_topology(next.clone()).await;
    joiner.install_topology(next).await;

    assert_eq!(site.cluster.count(CommandKind::TombstoneState), 1);
    assert!(joiner.tombstones().get_tombstone(&key("k")).is_some());
}

#[tokio::test]
async fn test_delay_adapts_to_progress() {
    let network = InMemorySiteNetwork::new();
    let mut config = fast_config("LON", &["NYC"]);
    config.tombstones.target_size = 5;
    config.tombstones.max_cleanup_delay_ms = 1000;
    let site = TestSite::build(
        &network,
        &config,
        1,
        &CacheTopology::round_robin(1, vec![1], 4, 1),
    );
    let node = site.node(1);
    assert_eq!(node.tombstones().current_delay(), Duration::from_millis(500));

    for i in 0..10 {
        let k = format!("key-{}", i);
        node.put(k.clone(), "v").await.unwrap();
        node.remove(k).await.unwrap();
    }
    assert_eq!(node.manager().queue_size(), 10);

    // every tombstone still waits for delivery: retry as soon as possible
    let round = node.tombstones().run_cleanup_round().await;
    assert_eq!((round.removed, round.remaining), (0, 10));
    assert_eq!(round.next_delay, Duration::from_millis(1));
    let round = node.tombstones().run_cleanup_round().await;
    assert_eq!(round.next_delay, Duration::from_millis(1));

    // keys dropped from tracking: the next round empties the store
    node.manager().track_clear();
    let round = node.tombstones().run_cleanup_round().await;
    assert_eq!((round.removed, round.remaining), (10, 0));
    assert_eq!(round.next_delay, Duration::from_millis(32));
}
