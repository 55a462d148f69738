//! Kademlia-style key/value overlay over UDP.
//!
//! A [`DhtNode`] binds one UDP socket, answers `ping`, `store`, `find_node` and
//! `find_value` from other nodes, and runs iterative lookups for its own `get`/`set`.
//! Values are opaque strings; the peer directory layers listing semantics on top.

pub mod routing;
pub mod rpc;
pub mod storage;

pub use routing::{Contact, DhtId, Insertion, RoutingTable};

use crate::error::{HyphaError, Result};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use rpc::{Datagram, Rpc, MAX_DATAGRAM_SIZE};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storage::ValueStore;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tuning knobs for a node.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub bind_addr: SocketAddr,
    /// Bucket size and replication factor.
    pub ksize: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    pub rpc_timeout: Duration,
    /// How long a stored value survives without being re-stored.
    pub storage_ttl: Duration,
    /// Most keys held for other nodes; the oldest is evicted beyond this.
    pub max_stored_keys: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8468)),
            ksize: 20,
            alpha: 3,
            rpc_timeout: Duration::from_secs(5),
            storage_ttl: Duration::from_secs(7 * 24 * 3600),
            max_stored_keys: 10_000,
        }
    }
}

struct Shared {
    id: DhtId,
    config: DhtConfig,
    socket: UdpSocket,
    routing: Mutex<RoutingTable>,
    storage: Mutex<ValueStore>,
    pending: DashMap<String, oneshot::Sender<Rpc>>,
}

#[derive(Debug, Default)]
struct Lookup {
    /// Nodes that answered, closest first.
    closest: Vec<Contact>,
    values: Vec<String>,
    queried: usize,
    responded: usize,
}

/// A running overlay node.
pub struct DhtNode {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    recv_task: JoinHandle<()>,
}

impl DhtNode {
    /// Bind the UDP socket and start answering requests.
    pub async fn bind(id: DhtId, config: DhtConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await.map_err(|e| {
            HyphaError::DhtUnavailable(format!("cannot bind {}: {}", config.bind_addr, e))
        })?;
        let local_addr = socket.local_addr()?;

        let shared = Arc::new(Shared {
            id,
            routing: Mutex::new(RoutingTable::new(id, config.ksize)),
            storage: Mutex::new(ValueStore::new(config.storage_ttl, config.max_stored_keys)),
            pending: DashMap::new(),
            socket,
            config,
        });

        let recv_task = tokio::spawn(Shared::recv_loop(Arc::clone(&shared)));
        info!("DHT: listening on {} (id={})", local_addr, id);

        Ok(Self {
            shared,
            local_addr,
            recv_task,
        })
    }

    pub fn id(&self) -> DhtId {
        self.shared.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn contact_count(&self) -> usize {
        self.shared.routing.lock().len()
    }

    pub fn stored_keys(&self) -> usize {
        self.shared.storage.lock().len()
    }

    /// Join the overlay through `peers`. Returns how many of them answered.
    ///
    /// An empty list is an isolated overlay and succeeds immediately. A non-empty
    /// list where nobody answers is `DhtUnavailable`.
    pub async fn bootstrap(&self, peers: &[SocketAddr]) -> Result<usize> {
        if peers.is_empty() {
            return Ok(0);
        }

        let replies = join_all(peers.iter().map(|addr| self.shared.request(*addr, Rpc::Ping))).await;
        let reachable = replies.iter().filter(|r| r.is_ok()).count();
        if reachable == 0 {
            return Err(HyphaError::DhtUnavailable(format!(
                "none of {} bootstrap peer(s) answered",
                peers.len()
            )));
        }

        // Populate our buckets with the neighbourhood of our own id.
        let lookup = self.shared.lookup(self.shared.id, false).await;
        info!(
            "DHT: bootstrapped via {}/{} peer(s), {} contact(s) known",
            reachable,
            peers.len(),
            lookup.closest.len().max(self.contact_count())
        );
        Ok(reachable)
    }

    /// Read the value stored under `key`, preferring what the overlay agrees on.
    pub async fn get(&self, key: DhtId) -> Result<Option<String>> {
        let local = self.shared.storage.lock().get(&key);
        let lookup = self.shared.lookup(key, true).await;

        if lookup.queried > 0 && lookup.responded == 0 && local.is_none() {
            return Err(HyphaError::DhtUnavailable(format!(
                "no overlay peer answered lookup for {}",
                key
            )));
        }

        let mut candidates = lookup.values;
        candidates.extend(local);
        Ok(most_common(candidates))
    }

    /// Replicate `value` under `key` to the closest nodes (including this one when
    /// it is among them). Returns the number of replicas written.
    pub async fn set(&self, key: DhtId, value: String) -> Result<usize> {
        let ksize = self.shared.config.ksize;
        let lookup = self.shared.lookup(key, false).await;

        if lookup.queried > 0 && lookup.responded == 0 {
            return Err(HyphaError::DhtUnavailable(format!(
                "no overlay peer answered lookup for {}",
                key
            )));
        }

        let targets = lookup.closest;
        let store_locally = targets.len() < ksize
            || targets
                .last()
                .map(|far| self.shared.id.distance(&key) < far.id.distance(&key))
                .unwrap_or(true);

        let replies = join_all(targets.iter().map(|contact| {
            self.shared.query(
                *contact,
                Rpc::Store {
                    key,
                    value: value.clone(),
                },
            )
        }))
        .await;
        let mut stored = replies
            .iter()
            .filter(|r| matches!(r, Some(Rpc::Stored)))
            .count();

        if !targets.is_empty() && stored == 0 && !store_locally {
            return Err(HyphaError::DhtUnavailable(format!(
                "no replica accepted value for {}",
                key
            )));
        }

        if store_locally {
            let mut storage = self.shared.storage.lock();
            storage.cull();
            storage.put(key, value);
            stored += 1;
        }

        debug!("DHT: stored {} on {} replica(s)", key, stored);
        Ok(stored)
    }

    /// Stop answering and release the socket. In-flight requests fail.
    pub fn shutdown(&self) {
        self.recv_task.abort();
        self.shared.pending.clear();
        info!("DHT: node {} stopped", self.shared.id);
    }
}

impl Drop for DhtNode {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

impl Shared {
    async fn recv_loop(shared: Arc<Shared>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match shared.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("DHT: recv error: {}", e);
                    continue;
                }
            };

            let datagram = match rpc::decode(&buf[..len]) {
                Ok(d) => d,
                Err(e) => {
                    debug!("DHT: dropping malformed datagram from {}: {}", from, e);
                    continue;
                }
            };

            shared.observe(Contact {
                id: datagram.sender,
                addr: from,
            });

            if datagram.rpc.is_response() {
                match shared.pending.remove(&datagram.id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(datagram.rpc);
                    }
                    None => debug!("DHT: unsolicited {} from {}", datagram.rpc.name(), from),
                }
                continue;
            }

            let reply = Datagram {
                id: datagram.id,
                sender: shared.id,
                rpc: shared.handle_request(datagram.sender, datagram.rpc),
            };
            if let Err(e) = shared.send_datagram(&reply, from).await {
                debug!("DHT: failed to answer {}: {}", from, e);
            }
        }
    }

    fn handle_request(&self, requester: DhtId, request: Rpc) -> Rpc {
        match request {
            Rpc::Ping => Rpc::Pong,
            Rpc::Store { key, value } => {
                let mut storage = self.storage.lock();
                storage.cull();
                if let Some(evicted) = storage.put(key, value) {
                    debug!("DHT: store full, evicted {} for {}", evicted, key);
                }
                Rpc::Stored
            }
            Rpc::FindNode { target } => Rpc::Nodes {
                contacts: self.closest_excluding(&target, &requester),
            },
            Rpc::FindValue { key } => match self.storage.lock().get(&key) {
                Some(value) => Rpc::Value { value },
                None => Rpc::Nodes {
                    contacts: self.closest_excluding(&key, &requester),
                },
            },
            // responses are routed to waiters before reaching here
            other => {
                warn!("DHT: {} received as a request", other.name());
                Rpc::Nodes { contacts: vec![] }
            }
        }
    }

    fn closest_excluding(&self, target: &DhtId, excluded: &DhtId) -> Vec<Contact> {
        let mut contacts = self.routing.lock().closest(target, self.config.ksize + 1);
        contacts.retain(|c| c.id != *excluded);
        contacts.truncate(self.config.ksize);
        contacts
    }

    /// Record that `contact` is alive, pinging the oldest entry of a full bucket.
    fn observe(self: &Arc<Self>, contact: Contact) {
        let insertion = self.routing.lock().insert(contact);
        if let Insertion::BucketFull { oldest } = insertion {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if this.request(oldest.addr, Rpc::Ping).await.is_err() {
                    debug!("DHT: evicting unresponsive {}", oldest.addr);
                    this.routing.lock().evict_and_insert(&oldest.id, contact);
                }
            });
        }
    }

    async fn send_datagram(&self, datagram: &Datagram, addr: SocketAddr) -> Result<()> {
        let bytes = rpc::encode(datagram)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(HyphaError::DhtUnavailable(format!(
                "datagram of {} bytes exceeds {} byte limit",
                bytes.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    async fn request(&self, addr: SocketAddr, rpc: Rpc) -> Result<Rpc> {
        let id = uuid::Uuid::new_v4().to_string();
        let name = rpc.name();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let datagram = Datagram {
            id: id.clone(),
            sender: self.id,
            rpc,
        };
        if let Err(e) = self.send_datagram(&datagram, addr).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(HyphaError::DhtUnavailable(format!(
                "{} to {} cancelled",
                name, addr
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(HyphaError::Timeout(format!(
                    "{} to {} after {:?}",
                    name, addr, self.config.rpc_timeout
                )))
            }
        }
    }

    /// Request that forgets `contact` when it does not answer.
    async fn query(&self, contact: Contact, rpc: Rpc) -> Option<Rpc> {
        match self.request(contact.addr, rpc).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!("DHT: {} unresponsive: {}", contact.addr, e);
                self.routing.lock().remove(&contact.id);
                None
            }
        }
    }

    async fn lookup(&self, target: DhtId, want_value: bool) -> Lookup {
        let ksize = self.config.ksize;
        let mut shortlist = self.routing.lock().closest(&target, ksize);
        let mut queried: HashSet<DhtId> = HashSet::new();
        let mut outcome = Lookup::default();
        let mut answered: Vec<Contact> = Vec::new();

        loop {
            let batch: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id))
                .take(self.config.alpha)
                .copied()
                .collect();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|c| c.id));

            let replies = join_all(batch.iter().map(|contact| async move {
                let request = if want_value {
                    Rpc::FindValue { key: target }
                } else {
                    Rpc::FindNode { target }
                };
                (*contact, self.query(*contact, request).await)
            }))
            .await;

            for (contact, reply) in replies {
                match reply {
                    Some(Rpc::Nodes { contacts }) => {
                        answered.push(contact);
                        for found in contacts {
                            if found.id != self.id && !shortlist.iter().any(|c| c.id == found.id) {
                                shortlist.push(found);
                            }
                        }
                    }
                    Some(Rpc::Value { value }) => {
                        answered.push(contact);
                        outcome.values.push(value);
                    }
                    Some(other) => {
                        debug!("DHT: unexpected {} during lookup", other.name());
                    }
                    None => shortlist.retain(|c| c.id != contact.id),
                }
            }

            shortlist.sort_by_key(|c| c.id.distance(&target));
            shortlist.truncate(ksize);

            if !outcome.values.is_empty() {
                break;
            }
        }

        answered.sort_by_key(|c| c.id.distance(&target));
        answered.truncate(ksize);
        outcome.queried = queried.len();
        outcome.responded = answered.len();
        outcome.closest = answered;
        outcome
    }
}

/// Pick the value reported most often; ties go to the earliest reported.
fn most_common(values: Vec<String>) -> Option<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, value) in values.iter().enumerate() {
        counts.entry(value.as_str()).or_insert((0, position)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
        .map(|(value, _)| value.to_string())
}
