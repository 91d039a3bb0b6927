//! Common fixtures for the cross-site integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use cascache_xsite::backoff::{BackOff, BackOffFactory};
use cascache_xsite::config::BackOffConfig;
use cascache_xsite::{CacheTopology, InMemoryCluster, InMemorySiteNetwork, IracNode, XSiteConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration with short delays for fast tests.
pub fn fast_config(site: &str, backups: &[&str]) -> XSiteConfig {
    let mut config = XSiteConfig::new("users", site, backups);
    config.backoff = BackOffConfig {
        initial_delay_ms: 5,
        max_delay_ms: 40,
        jitter: false,
    };
    config.irac.retry_delay_ms = 5;
    config
}

/// Single-node topology with a handful of segments.
pub fn single_node_topology() -> CacheTopology {
    CacheTopology::round_robin(1, vec![1], 8, 1)
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Several single-node sites, all replicating to each other.
pub struct TestSites {
    pub network: Arc<InMemorySiteNetwork>,
    pub nodes: HashMap<String, Arc<IracNode>>,
}

impl TestSites {
    /// Build and start one node per site with `fast_config`.
    pub fn start(sites: &[&str]) -> Self {
        Self::start_with(sites, |config| config)
    }

    /// Like [`TestSites::start`], adjusting each config with `tweak`.
    pub fn start_with<F>(sites: &[&str], tweak: F) -> Self
    where
        F: Fn(XSiteConfig) -> XSiteConfig,
    {
        let network = InMemorySiteNetwork::new();
        let mut nodes = HashMap::new();
        for &site in sites {
            let backups: Vec<&str> = sites.iter().copied().filter(|s| *s != site).collect();
            let node = IracNode::builder(tweak(fast_config(site, &backups)), 1, single_node_topology())
                .transport(network.transport_for(site))
                .build()
                .unwrap();
            network.register(site, node.applier());
            node.start().unwrap();
            nodes.insert(site.to_string(), node);
        }
        Self { network, nodes }
    }

    pub fn node(&self, site: &str) -> &Arc<IracNode> {
        &self.nodes[site]
    }

    /// True once no site has a key waiting for delivery.
    pub fn drained(&self) -> bool {
        self.nodes.values().all(|n| n.manager().queue_size() == 0)
    }

    pub async fn stop(&self) {
        for node in self.nodes.values() {
            node.stop().await.unwrap();
        }
    }
}

/// Nodes of one site sharing an [`InMemoryCluster`].
pub struct TestSite {
    pub cluster: Arc<InMemoryCluster>,
    pub nodes: Vec<Arc<IracNode>>,
}

impl TestSite {
    /// Build (without starting) nodes `1..=n` of `site` on `topology`.
    pub fn build(
        network: &Arc<InMemorySiteNetwork>,
        config: &XSiteConfig,
        n: u64,
        topology: &CacheTopology,
    ) -> Self {
        let cluster = InMemoryCluster::new();
        let nodes = (1..=n)
            .map(|id| {
                let node = IracNode::builder(config.clone(), id, topology.clone())
                    .transport(network.transport_for(config.local_site.clone()))
                    .cluster(cluster.rpc_for(id))
                    .build()
                    .unwrap();
                node.join(&cluster);
                node
            })
            .collect();
        Self { cluster, nodes }
    }

    pub fn node(&self, id: u64) -> &Arc<IracNode> {
        &self.nodes[(id - 1) as usize]
    }

    /// First generated key whose primary owner is `node`.
    pub fn key_owned_by(&self, node: u64) -> String {
        let topology = self.nodes[0].topology();
        (0..)
            .map(|i| format!("key-{}", i))
            .find(|k| topology.primary(topology.segment_of(k.as_bytes())) == Some(node))
            .unwrap()
    }
}

/// Backoff that records how often it was used.
#[derive(Default)]
pub struct RecordingBackOff {
    pub waits: AtomicUsize,
    pub resets: AtomicUsize,
}

#[async_trait]
impl BackOff for RecordingBackOff {
    async fn back_off(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one [`RecordingBackOff`] per site and remembers them.
#[derive(Default)]
pub struct RecordingFactory {
    created: Mutex<HashMap<String, Arc<RecordingBackOff>>>,
}

impl RecordingFactory {
    pub fn get(&self, site: &str) -> Arc<RecordingBackOff> {
        self.created.lock()[site].clone()
    }
}

impl BackOffFactory for RecordingFactory {
    fn create(&self, _cache: &str, site: &str) -> Arc<dyn BackOff> {
        let backoff = Arc::new(RecordingBackOff::default());
        self.created.lock().insert(site.to_string(), backoff.clone());
        backoff
    }
}
