//! Topic-based peer directory on top of the DHT.
//!
//! Each topic maps to one DHT key holding a JSON array of [`Listing`]s, at most one
//! per `node_id`. Announcing is a read-modify-write of that array and is not atomic
//! across the overlay: two agents announcing on the same topic at the same moment can
//! overwrite each other, and the later store wins. Agents re-announce periodically,
//! which repairs lost entries.

use crate::config::DiscoveryConfig;
use crate::dht::{DhtId, DhtNode};
use crate::error::{HyphaError, Result};
use crate::identity::{NodeId, DHT_ID_LEN};
use crate::model::Listing;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TOPIC_PREFIX: &str = "hypha:";

/// DHT key for a topic: the first 20 bytes of `SHA-256("hypha:" + topic)`.
pub fn topic_key(topic: &str) -> DhtId {
    let digest = Sha256::digest(format!("{}{}", TOPIC_PREFIX, topic).as_bytes());
    let mut key = [0u8; DHT_ID_LEN];
    key.copy_from_slice(&digest[..DHT_ID_LEN]);
    DhtId::from_bytes(key)
}

/// Decode a stored topic value. Anything that is not a listing array reads as empty.
pub fn decode_listings(raw: Option<&str>) -> Vec<Listing> {
    let Some(raw) = raw else {
        return vec![];
    };
    match serde_json::from_str::<Vec<Listing>>(raw) {
        Ok(listings) => listings,
        Err(e) => {
            warn!("Discarding corrupt topic value: {}", e);
            vec![]
        }
    }
}

pub struct PeerDirectory {
    config: DiscoveryConfig,
    dht_id: DhtId,
    node: Mutex<Option<Arc<DhtNode>>>,
    // serializes start/stop and our own announces
    lifecycle: tokio::sync::Mutex<()>,
    announce_lock: tokio::sync::Mutex<()>,
}

impl PeerDirectory {
    pub fn new(config: DiscoveryConfig, node_id: NodeId) -> Self {
        Self {
            config,
            dht_id: DhtId::from_bytes(node_id.dht_bytes()),
            node: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            announce_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dht_id(&self) -> DhtId {
        self.dht_id
    }

    pub fn is_running(&self) -> bool {
        self.node.lock().is_some()
    }

    /// UDP address the overlay node is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.node.lock().as_ref().map(|n| n.local_addr())
    }

    pub fn contact_count(&self) -> usize {
        self.node.lock().as_ref().map(|n| n.contact_count()).unwrap_or(0)
    }

    pub async fn start(&self) -> Result<()> {
        self.start_within(self.config.operation_timeout()).await
    }

    /// Bind and join the overlay. Calling it on a running directory does nothing.
    pub async fn start_within(&self, limit: Duration) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            debug!("Peer directory already running");
            return Ok(());
        }

        let node = DhtNode::bind(self.dht_id, self.config.dht_config()?).await?;
        let joined = within(limit, "bootstrap", async {
            let peers = resolve_bootstrap(&self.config.bootstrap).await?;
            node.bootstrap(&peers).await
        })
        .await;

        match joined {
            Ok(reachable) => {
                if reachable == 0 {
                    info!("Peer directory started an isolated overlay on {}", node.local_addr());
                } else {
                    info!(
                        "Peer directory joined overlay via {} peer(s) on {}",
                        reachable,
                        node.local_addr()
                    );
                }
                *self.node.lock() = Some(Arc::new(node));
                Ok(())
            }
            Err(e) => {
                node.shutdown();
                Err(e)
            }
        }
    }

    pub async fn announce(&self, topic: &str, listing: &Listing) -> Result<()> {
        self.announce_within(topic, listing, self.config.operation_timeout())
            .await
    }

    /// Publish `listing` under `topic`, replacing any earlier listing with the same
    /// `node_id`.
    pub async fn announce_within(&self, topic: &str, listing: &Listing, limit: Duration) -> Result<()> {
        let node = self.running_node()?;
        let _guard = self.announce_lock.lock().await;
        let key = topic_key(topic);

        let count = within(limit, "announce", async {
            let current = node.get(key).await?;
            let mut listings = decode_listings(current.as_deref());
            listings.retain(|l| l.node_id != listing.node_id);
            listings.push(listing.clone());

            let value = serde_json::to_string(&listings)?;
            node.set(key, value).await?;
            Ok(listings.len())
        })
        .await?;

        info!("Announced on topic '{}' ({} listing(s))", topic, count);
        Ok(())
    }

    pub async fn discover(&self, topic: &str) -> Result<Vec<Listing>> {
        self.discover_within(topic, self.config.operation_timeout()).await
    }

    /// Current listings for `topic`; empty when nothing (or nothing readable) is stored.
    pub async fn discover_within(&self, topic: &str, limit: Duration) -> Result<Vec<Listing>> {
        let node = self.running_node()?;
        let raw = within(limit, "discover", node.get(topic_key(topic))).await?;
        let listings = decode_listings(raw.as_deref());
        debug!("Discovered {} listing(s) on topic '{}'", listings.len(), topic);
        Ok(listings)
    }

    /// Leave the overlay and release the socket. Stopping twice is harmless.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(node) = self.node.lock().take() {
            node.shutdown();
            info!("Peer directory stopped");
        }
    }

    fn running_node(&self) -> Result<Arc<DhtNode>> {
        self.node
            .lock()
            .clone()
            .ok_or_else(|| HyphaError::DhtUnavailable("peer directory is not started".to_string()))
    }
}

async fn within<T>(limit: Duration, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(HyphaError::Timeout(format!("{} exceeded {:?}", operation, limit))),
    }
}

async fn resolve_bootstrap(entries: &[String]) -> Result<Vec<SocketAddr>> {
    let mut peers = Vec::new();
    for entry in entries {
        match tokio::net::lookup_host(entry.as_str()).await {
            Ok(addrs) => peers.extend(addrs),
            Err(e) => warn!("Cannot resolve bootstrap peer {}: {}", entry, e),
        }
    }
    if !entries.is_empty() && peers.is_empty() {
        return Err(HyphaError::DhtUnavailable(
            "no bootstrap peer could be resolved".to_string(),
        ));
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn loopback_config(bootstrap: Vec<String>) -> DiscoveryConfig {
        DiscoveryConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            bootstrap,
            timeout_seconds: 5,
            rpc_timeout_seconds: 1,
            ..DiscoveryConfig::default()
        }
    }

    fn identity(byte: u8) -> Identity {
        Identity::derive(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_topic_key_is_stable() {
        assert_eq!(topic_key("hypha-test"), topic_key("hypha-test"));
        assert_ne!(topic_key("hypha-test"), topic_key("hypha-other"));
    }

    #[test]
    fn test_decode_listings() {
        assert!(decode_listings(None).is_empty());
        assert!(decode_listings(Some("{not json")).is_empty());
        assert!(decode_listings(Some("{\"node_id\":\"a\"}")).is_empty());
        let listings = decode_listings(Some(
            r#"[{"node_id":"a","wallet_address":"0x1","timestamp":1}]"#,
        ));
        assert_eq!(listings.len(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let id = identity(1);
        let directory = PeerDirectory::new(loopback_config(vec![]), id.node_id());
        let listing = Listing::new(id.node_id().to_hex(), id.wallet_address());
        assert!(matches!(
            directory.announce("t", &listing).await,
            Err(HyphaError::DhtUnavailable(_))
        ));
        assert!(directory.discover("t").await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let id = identity(2);
        let directory = PeerDirectory::new(loopback_config(vec![]), id.node_id());
        directory.start().await.unwrap();
        let addr = directory.local_addr();
        directory.start().await.unwrap();
        assert_eq!(directory.local_addr(), addr);

        directory.stop().await;
        directory.stop().await;
        assert!(!directory.is_running());
    }

    #[tokio::test]
    async fn test_reannounce_replaces_entry() {
        let id = identity(3);
        let directory = PeerDirectory::new(loopback_config(vec![]), id.node_id());
        directory.start().await.unwrap();

        let first = Listing::new(id.node_id().to_hex(), id.wallet_address()).with_endpoint("127.0.0.1", 1);
        let second = Listing::new(id.node_id().to_hex(), id.wallet_address()).with_endpoint("127.0.0.1", 2);
        directory.announce("dup", &first).await.unwrap();
        directory.announce("dup", &second).await.unwrap();

        let listings = directory.discover("dup").await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].port, Some(2));
        assert!(directory.discover("nobody-here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_bootstrap_leaves_directory_stopped() {
        let dead = {
            let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            s.local_addr().unwrap().to_string()
        };
        let id = identity(4);
        let directory = PeerDirectory::new(loopback_config(vec![dead]), id.node_id());
        let err = directory.start().await.unwrap_err();
        assert!(err.is_retriable());
        assert!(!directory.is_running());
    }
}
