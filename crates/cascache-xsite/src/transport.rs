//! Cross-site transport: requests exchanged between sites.
//!
//! In production this wraps the site-to-site RPC channel. Tests and the
//! `cas-xsite` simulator use [`InMemorySiteNetwork`], which routes requests
//! between in-process sites and can inject link failures per site.

use crate::error::{Result, XSiteError};
use crate::types::{Key, SegmentId, Value};
use crate::version::IracMetadata;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Latest state of one key shipped to a backup site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IracUpdate {
    /// Updated key.
    pub key: Key,
    /// Segment of the key at the origin.
    pub segment: SegmentId,
    /// Resolved metadata of the update.
    pub metadata: IracMetadata,
    /// New value, or `None` for a removal.
    pub value: Option<Value>,
    /// Removal caused by expiration rather than an explicit delete.
    pub expiration: bool,
}

impl IracUpdate {
    /// True for removals.
    pub fn is_removal(&self) -> bool {
        self.value.is_none()
    }
}

/// Request sent from one site to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IracRequest {
    /// Latest values/tombstones for a batch of keys.
    Updates {
        /// Sending site.
        origin: String,
        /// Cache name.
        cache: String,
        /// Updated keys.
        updates: Vec<IracUpdate>,
    },
    /// The origin cleared the whole cache.
    Clear {
        /// Sending site.
        origin: String,
        /// Cache name.
        cache: String,
    },
    /// Ask whether a key expiring at the origin was touched remotely.
    Touch {
        /// Sending site.
        origin: String,
        /// Cache name.
        cache: String,
        /// Expiring key.
        key: Key,
    },
}

impl IracRequest {
    /// Origin site of the request.
    pub fn origin(&self) -> &str {
        match self {
            IracRequest::Updates { origin, .. }
            | IracRequest::Clear { origin, .. }
            | IracRequest::Touch { origin, .. } => origin,
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Response from the remote site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XSiteResponse {
    /// The request was applied (or deliberately discarded) remotely.
    Ack,
    /// Answer to a [`IracRequest::Touch`].
    Touched(bool),
}

/// Sends requests to remote sites.
#[async_trait]
pub trait XSiteTransport: Send + Sync {
    /// Send `request` to `target` and wait for its response.
    ///
    /// Link failures are reported as transient errors
    /// (see [`XSiteError::is_transient`]).
    async fn backup_remotely(&self, target: &str, request: IracRequest) -> Result<XSiteResponse>;

    /// Sites currently reachable.
    fn sites_view(&self) -> HashSet<String>;
}

/// Receives requests addressed to a site.
#[async_trait]
pub trait SiteEndpoint: Send + Sync {
    /// Handle a request from a remote site.
    async fn handle(&self, request: IracRequest) -> Result<XSiteResponse>;
}

/// Failure injected on the link to a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// Requests time out.
    Timeout,
    /// The site cannot be reached and drops out of the site view.
    Unreachable,
    /// The site is suspected and drops out of the site view.
    Suspected,
    /// The site answers with a rejection.
    Reject,
}

/// In-process network connecting several sites.
#[derive(Default)]
pub struct InMemorySiteNetwork {
    endpoints: RwLock<HashMap<String, Arc<dyn SiteEndpoint>>>,
    faults: RwLock<HashMap<String, LinkFault>>,
    requests: DashMap<String, AtomicU64>,
}

impl std::fmt::Debug for InMemorySiteNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySiteNetwork")
            .field("sites", &self.endpoints.read().keys().collect::<Vec<_>>())
            .field("faults", &*self.faults.read())
            .finish()
    }
}

impl InMemorySiteNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach the endpoint receiving requests for `site`.
    pub fn register(&self, site: impl Into<String>, endpoint: Arc<dyn SiteEndpoint>) {
        self.endpoints.write().insert(site.into(), endpoint);
    }

    /// Inject (`Some`) or clear (`None`) a fault on the link to `site`.
    pub fn set_fault(&self, site: &str, fault: Option<LinkFault>) {
        let mut faults = self.faults.write();
        match fault {
            Some(f) => {
                faults.insert(site.to_string(), f);
            }
            None => {
                faults.remove(site);
            }
        }
    }

    /// Number of requests that reached `site` (faulted ones excluded).
    pub fn requests_to(&self, site: &str) -> u64 {
        self.requests
            .get(site)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Transport used by `local_site` to reach the others.
    pub fn transport_for(self: &Arc<Self>, local_site: impl Into<String>) -> Arc<SiteLink> {
        Arc::new(SiteLink {
            local_site: local_site.into(),
            network: Arc::clone(self),
        })
    }

    async fn deliver(&self, target: &str, request: IracRequest) -> Result<XSiteResponse> {
        let fault = self.faults.read().get(target).copied();
        match fault {
            Some(LinkFault::Timeout) => {
                return Err(XSiteError::Timeout {
                    site: target.to_string(),
                })
            }
            Some(LinkFault::Unreachable) => {
                return Err(XSiteError::SiteUnreachable {
                    site: target.to_string(),
                })
            }
            Some(LinkFault::Suspected) => {
                return Err(XSiteError::SiteSuspected {
                    site: target.to_string(),
                })
            }
            Some(LinkFault::Reject) => {
                return Err(XSiteError::Rejected {
                    msg: format!("site {} rejected the request", target),
                })
            }
            None => {}
        }

        let endpoint = self.endpoints.read().get(target).cloned();
        let Some(endpoint) = endpoint else {
            return Err(XSiteError::SiteUnreachable {
                site: target.to_string(),
            });
        };

        // go through the wire format like a real link would
        let request = IracRequest::decode(&request.encode()?)?;
        self.requests
            .entry(target.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        endpoint.handle(request).await
    }
}

/// A site's view of an [`InMemorySiteNetwork`].
#[derive(Debug)]
pub struct SiteLink {
    local_site: String,
    network: Arc<InMemorySiteNetwork>,
}

#[async_trait]
impl XSiteTransport for SiteLink {
    async fn backup_remotely(&self, target: &str, request: IracRequest) -> Result<XSiteResponse> {
        if target == self.local_site {
            return Err(XSiteError::UnknownSite {
                site: target.to_string(),
            });
        }
        self.network.deliver(target, request).await
    }

    fn sites_view(&self) -> HashSet<String> {
        let faults = self.network.faults.read();
        self.network
            .endpoints
            .read()
            .keys()
            .filter(|site| {
                !matches!(
                    faults.get(*site),
                    Some(LinkFault::Unreachable) | Some(LinkFault::Suspected)
                )
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingEndpoint {
        seen: Mutex<Vec<IracRequest>>,
    }

    #[async_trait]
    impl SiteEndpoint for RecordingEndpoint {
        async fn handle(&self, request: IracRequest) -> Result<XSiteResponse> {
            let touch = matches!(request, IracRequest::Touch { .. });
            self.seen.lock().push(request);
            Ok(if touch {
                XSiteResponse::Touched(true)
            } else {
                XSiteResponse::Ack
            })
        }
    }

    fn clear(origin: &str) -> IracRequest {
        IracRequest::Clear {
            origin: origin.to_string(),
            cache: "c".to_string(),
        }
    }

    #[tokio::test]
    async fn test_deliver_to_registered_site() {
        let network = InMemorySiteNetwork::new();
        let nyc = Arc::new(RecordingEndpoint::default());
        network.register("NYC", nyc.clone());

        let link = network.transport_for("LON");
        let rsp = link.backup_remotely("NYC", clear("LON")).await.unwrap();
        assert_eq!(rsp, XSiteResponse::Ack);
        assert_eq!(nyc.seen.lock().len(), 1);
        assert_eq!(nyc.seen.lock()[0].origin(), "LON");
        assert_eq!(network.requests_to("NYC"), 1);
    }

    #[tokio::test]
    async fn test_unknown_site_is_unreachable() {
        let network = InMemorySiteNetwork::new();
        let link = network.transport_for("LON");
        let err = link.backup_remotely("SFO", clear("LON")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_faults() {
        let network = InMemorySiteNetwork::new();
        network.register("NYC", Arc::new(RecordingEndpoint::default()));
        let link = network.transport_for("LON");

        network.set_fault("NYC", Some(LinkFault::Suspected));
        let err = link.backup_remotely("NYC", clear("LON")).await.unwrap_err();
        assert!(matches!(err, XSiteError::SiteSuspected { .. }));
        assert!(!link.sites_view().contains("NYC"));

        network.set_fault("NYC", Some(LinkFault::Reject));
        let err = link.backup_remotely("NYC", clear("LON")).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(link.sites_view().contains("NYC"));

        network.set_fault("NYC", None);
        assert!(link.backup_remotely("NYC", clear("LON")).await.is_ok());
        assert_eq!(network.requests_to("NYC"), 1);
    }

    #[tokio::test]
    async fn test_touch_response() {
        let network = InMemorySiteNetwork::new();
        network.register("NYC", Arc::new(RecordingEndpoint::default()));
        let link = network.transport_for("LON");
        let rsp = link
            .backup_remotely(
                "NYC",
                IracRequest::Touch {
                    origin: "LON".into(),
                    cache: "c".into(),
                    key: Bytes::from_static(b"k"),
                },
            )
            .await
            .unwrap();
        assert_eq!(rsp, XSiteResponse::Touched(true));
    }

    #[test]
    fn test_update_removal_flag() {
        let update = IracUpdate {
            key: Bytes::from_static(b"k"),
            segment: 1,
            metadata: IracMetadata::new("LON", Default::default()),
            value: None,
            expiration: true,
        };
        assert!(update.is_removal());
    }
}
