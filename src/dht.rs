//! The DHT engine: iterative lookups, publication, listen loop and
//! maintenance.
//!
//! [`Dht`] owns the routing table and the local store behind their own
//! mutexes and drives every network exchange through a [`Transport`]. The
//! heart of the module is [`Dht::iterate`], the α-way concurrent walk used
//! by all three lookup kinds: FindNode walks toward a target, FindValue
//! short-circuits on a value hit, and Store is a FindNode-shaped walk
//! terminated by a fire-and-forget Store fan-out to the k closest peers.
//!
//! Neither lock is ever held across network I/O. The one subtle case is the
//! bucket liveness probe: [`Dht::add_contact`] takes the routing lock to
//! request the probe, awaits the ping unlocked, and re-locks to finalize the
//! bucket (see [`crate::routing`]).

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::identity::{distance_cmp, NetworkAddress, NodeId, ID_BYTES};
use crate::messages::{Envelope, Payload, MAX_VALUE_SIZE};
use crate::routing::RoutingTable;
use crate::storage::{LocalStore, EXPIRE_INTERVAL};
use crate::transport::{Transport, TransportError, PING_TIMEOUT};

/// Bucket capacity and lookup result width.
pub const K: usize = 20;

/// Concurrency of an iterative lookup.
pub const ALPHA: usize = 3;

/// Cadence of the expiry sweep and republish check.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on iterate rounds; the convergence rule terminates long
/// before this on any sane network.
const MAX_LOOKUP_ROUNDS: usize = 20;

/// Content address of a value: sha1 of its bytes.
pub fn hash_content(data: &[u8]) -> NodeId {
    let digest = Sha1::digest(data);
    let mut out = [0u8; ID_BYTES];
    out.copy_from_slice(&digest);
    NodeId::from_bytes(out)
}

/// One peer of the configured bootstrap set. The id may be unknown ahead of
/// time; a FindNode exchange establishes it during [`Dht::bootstrap`].
#[derive(Clone, Debug)]
pub struct BootstrapPeer {
    pub ip: IpAddr,
    pub port: u16,
    pub id: Option<NodeId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LookupKind {
    FindNode,
    FindValue,
    Store,
}

#[derive(Clone, Debug)]
pub(crate) enum LookupOutcome {
    /// FindNode result: closest peers, ascending by distance.
    Nodes(Vec<NetworkAddress>),
    /// FindValue hit.
    Value(Vec<u8>),
    /// FindValue miss. A normal result, not an error.
    NotFound,
    /// Store fan-out dispatched.
    Stored,
}

/// The working set of one iterative lookup: candidates ordered by distance
/// to the target plus the set of peers already contacted.
pub(crate) struct Shortlist {
    target: NodeId,
    entries: Vec<NetworkAddress>,
    known: HashSet<NodeId>,
    contacted: HashSet<NodeId>,
}

impl Shortlist {
    fn new(target: NodeId, seed: Vec<NetworkAddress>) -> Self {
        let mut list = Self {
            target,
            entries: Vec::new(),
            known: HashSet::new(),
            contacted: HashSet::new(),
        };
        list.append_unique(seed);
        list.sort_by_distance();
        list
    }

    /// Adds every address whose id is not already present.
    fn append_unique(&mut self, addrs: impl IntoIterator<Item = NetworkAddress>) {
        for addr in addrs {
            if self.known.insert(addr.id) {
                self.entries.push(addr);
            }
        }
    }

    fn remove(&mut self, id: &NodeId) {
        self.entries.retain(|entry| entry.id != *id);
    }

    fn sort_by_distance(&mut self) {
        let target = self.target;
        self.entries.sort_by(|a, b| {
            let da = a.id.xor_distance(&target);
            let db = b.id.xor_distance(&target);
            distance_cmp(&da, &db)
        });
    }

    fn head(&self) -> Option<NetworkAddress> {
        self.entries.first().copied()
    }

    /// Up to `alpha` uncontacted addresses from the head of the list,
    /// marked contacted. `skip` keeps the caller from querying itself.
    fn next_round(&mut self, alpha: usize, skip: &NodeId) -> Vec<NetworkAddress> {
        let picked: Vec<NetworkAddress> = self
            .entries
            .iter()
            .filter(|entry| entry.id != *skip && !self.contacted.contains(&entry.id))
            .take(alpha)
            .copied()
            .collect();
        for addr in &picked {
            self.contacted.insert(addr.id);
        }
        picked
    }

    fn closest(&self, count: usize) -> Vec<NetworkAddress> {
        self.entries.iter().take(count).copied().collect()
    }
}

struct Inner<T: Transport> {
    self_addr: NetworkAddress,
    k: usize,
    alpha: usize,
    routing: Mutex<RoutingTable>,
    store: Mutex<LocalStore>,
    transport: Arc<T>,
}

/// A DHT node engine, cheaply cloneable; clones share all state.
pub struct Dht<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Dht<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Dht<T> {
    pub fn new(self_addr: NetworkAddress, transport: Arc<T>) -> Self {
        Self::with_params(self_addr, transport, K, ALPHA)
    }

    pub fn with_params(
        self_addr: NetworkAddress,
        transport: Arc<T>,
        k: usize,
        alpha: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                self_addr,
                k,
                alpha,
                routing: Mutex::new(RoutingTable::new(self_addr, k)),
                store: Mutex::new(LocalStore::new()),
                transport,
            }),
        }
    }

    pub fn self_addr(&self) -> NetworkAddress {
        self.inner.self_addr
    }

    /// Publishes `data`: stores it locally under its content hash, walks to
    /// the k closest peers and hands each of them a copy. Returns the
    /// printable key.
    pub async fn put(&self, data: Vec<u8>) -> Result<String> {
        let key = hash_content(&data);
        {
            let mut store = self.inner.store.lock().await;
            store.store(key, data.clone(), Instant::now() + EXPIRE_INTERVAL, true);
        }
        self.iterate(LookupKind::Store, key, Some(data)).await?;
        Ok(key.to_base58())
    }

    /// Resolves a printable key: local store first, then a FindValue walk.
    /// `Ok(None)` means the network does not hold the value.
    pub async fn get(&self, key_str: &str) -> Result<Option<Vec<u8>>> {
        let key = NodeId::from_base58(key_str)?;
        if let Some(value) = self.inner.store.lock().await.retrieve(&key) {
            return Ok(Some(value));
        }
        match self.iterate(LookupKind::FindValue, key, None).await? {
            LookupOutcome::Value(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Removes the key from the local store only. No network traffic.
    pub async fn delete(&self, key_str: &str) -> Result<()> {
        let key = NodeId::from_base58(key_str)?;
        self.inner.store.lock().await.delete(&key);
        Ok(())
    }

    /// Runs a FindNode walk and returns the k closest peers found.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<NetworkAddress>> {
        match self.iterate(LookupKind::FindNode, target, None).await? {
            LookupOutcome::Nodes(nodes) => Ok(nodes),
            _ => Ok(Vec::new()),
        }
    }

    /// Joins the network: seeds the routing table from the configured
    /// bootstrap peers, then walks toward our own id to populate buckets.
    pub async fn bootstrap(&self, peers: &[BootstrapPeer]) -> Result<()> {
        for peer in peers {
            match peer.id {
                Some(id) => {
                    self.add_contact(NetworkAddress::new(id, peer.ip, peer.port))
                        .await;
                }
                None => match self.resolve_bootstrap_id(peer).await {
                    Some(addr) => self.add_contact(addr).await,
                    None => {
                        warn!(ip = %peer.ip, port = peer.port, "bootstrap peer did not answer");
                    }
                },
            }
        }
        self.iterate(LookupKind::FindNode, self.inner.self_addr.id, None)
            .await?;
        let contacts = self.inner.routing.lock().await.len();
        info!(contacts, "bootstrap complete");
        Ok(())
    }

    /// Learns the id of a bootstrap peer configured as bare (ip, port) by
    /// asking it for the nodes closest to us; its reply names its real id.
    async fn resolve_bootstrap_id(&self, peer: &BootstrapPeer) -> Option<NetworkAddress> {
        let placeholder = NetworkAddress::new(
            NodeId::from_bytes([0u8; crate::identity::ID_BYTES]),
            peer.ip,
            peer.port,
        );
        let query = Envelope::query(
            self.inner.self_addr,
            placeholder,
            Payload::FindNodeQuery {
                target: self.inner.self_addr.id,
            },
        );
        let handle = self.inner.transport.send(query, true).await.ok()??;
        let response = handle.response().await.ok()?;
        Some(response.sender)
    }

    /// Closes the transport; the listen loop exits on the empty sentinel and
    /// outstanding lookups surface a transport error.
    pub async fn shutdown(&self) {
        self.inner.transport.shutdown().await;
    }

    /// Offers a contact to the routing table, running the bucket liveness
    /// probe when required. The probe is requested under the table lock but
    /// awaited without it.
    pub async fn add_contact(&self, address: NetworkAddress) {
        let probe = { self.inner.routing.lock().await.insert(address) };
        let Some(probe) = probe else {
            return;
        };

        let head_alive = self.ping(probe.head).await;
        trace!(head = ?probe.head, head_alive, "bucket probe resolved");
        self.inner
            .routing
            .lock()
            .await
            .apply_probe_result(probe, head_alive);
    }

    /// Liveness probe: a Ping bounded by the probe timeout. A synchronous
    /// send failure counts the same as no Pong.
    async fn ping(&self, address: NetworkAddress) -> bool {
        let query = Envelope::query(self.inner.self_addr, address, Payload::PingQuery);
        match self.inner.transport.send(query, true).await {
            Ok(Some(handle)) => handle.wait(PING_TIMEOUT).await.is_ok(),
            _ => false,
        }
    }

    /// The iterative walk shared by all three lookup kinds (spec α-way
    /// fan-out with the no-closer-head termination rule).
    pub(crate) async fn iterate(
        &self,
        kind: LookupKind,
        target: NodeId,
        data: Option<Vec<u8>>,
    ) -> Result<LookupOutcome> {
        let seed = {
            self.inner
                .routing
                .lock()
                .await
                .closest(&target, self.inner.alpha, &[])
        };
        let mut shortlist = Shortlist::new(target, seed);

        let Some(mut closest_seen) = shortlist.head() else {
            return Ok(match kind {
                LookupKind::FindValue => LookupOutcome::NotFound,
                LookupKind::Store => LookupOutcome::Stored,
                LookupKind::FindNode => LookupOutcome::Nodes(Vec::new()),
            });
        };

        // Closest peer that answered without producing the value; on a
        // FindValue hit the initiator replays the value to it.
        let mut best_empty: Option<NetworkAddress> = None;
        let mut rounds = 0;

        loop {
            rounds += 1;
            if rounds > MAX_LOOKUP_ROUNDS {
                warn!(
                    target = %hex::encode(&target.as_bytes()[..8]),
                    rounds, "lookup exceeded round limit"
                );
                break;
            }

            let round = shortlist.next_round(self.inner.alpha, &self.inner.self_addr.id);
            if round.is_empty() {
                break;
            }

            let queries = round.into_iter().map(|address| {
                let transport = self.inner.transport.clone();
                let self_addr = self.inner.self_addr;
                let payload = match kind {
                    LookupKind::FindValue => Payload::FindValueQuery { target },
                    _ => Payload::FindNodeQuery { target },
                };
                async move {
                    let envelope = Envelope::query(self_addr, address, payload);
                    let outcome = match transport.send(envelope, true).await {
                        Ok(Some(handle)) => handle.response().await,
                        Ok(None) => Err(TransportError::AckTimeout),
                        Err(err) => Err(err),
                    };
                    (address, outcome)
                }
            });
            let results = futures::future::join_all(queries).await;

            for (address, outcome) in results {
                match outcome {
                    Err(TransportError::Down) => {
                        return Err(anyhow!("transport shut down during lookup"));
                    }
                    Err(_) => {
                        // Unresponsive peers drop out of the routing table;
                        // they stay contacted so the walk never retries them.
                        self.inner.routing.lock().await.remove(&address.id);
                    }
                    Ok(response) if response.error.is_some() => {
                        debug!(peer = ?address, error = ?response.error, "peer answered with an error");
                        shortlist.remove(&address.id);
                    }
                    Ok(response) => {
                        let sender = response.sender;
                        match response.payload {
                            Payload::FindValueResponse {
                                value: Some(value), ..
                            } => {
                                self.add_contact(sender).await;
                                if let Some(peer) = best_empty {
                                    self.seed_cache(peer, target, value.clone()).await;
                                }
                                return Ok(LookupOutcome::Value(value));
                            }
                            Payload::FindNodeResponse { closest }
                            | Payload::FindValueResponse {
                                value: None,
                                closest,
                            } => {
                                self.add_contact(sender).await;
                                if kind == LookupKind::FindValue {
                                    let improves = match &best_empty {
                                        Some(current) => {
                                            let ds = sender.id.xor_distance(&target);
                                            let dc = current.id.xor_distance(&target);
                                            distance_cmp(&ds, &dc) == std::cmp::Ordering::Less
                                        }
                                        None => true,
                                    };
                                    if improves {
                                        best_empty = Some(sender);
                                    }
                                }
                                shortlist.append_unique(closest);
                            }
                            other => {
                                trace!(payload = ?other, "ignoring unexpected response payload");
                            }
                        }
                    }
                }
            }

            shortlist.sort_by_distance();

            // Terminate once a round produces no strictly closer head.
            match shortlist.head() {
                Some(head) if head.id != closest_seen.id => closest_seen = head,
                _ => break,
            }
        }

        match kind {
            LookupKind::FindNode => Ok(LookupOutcome::Nodes(shortlist.closest(self.inner.k))),
            LookupKind::FindValue => Ok(LookupOutcome::NotFound),
            LookupKind::Store => {
                let data = data.unwrap_or_default();
                for address in shortlist.closest(self.inner.k) {
                    let envelope = Envelope::query(
                        self.inner.self_addr,
                        address,
                        Payload::StoreQuery {
                            key: target,
                            data: data.clone(),
                        },
                    );
                    if let Err(err) = self.inner.transport.send(envelope, false).await {
                        if matches!(err, TransportError::Down) {
                            return Err(err.into());
                        }
                        debug!(peer = ?address, error = %err, "store fan-out send failed");
                    }
                }
                Ok(LookupOutcome::Stored)
            }
        }
    }

    /// Cache-seeding after a FindValue hit: replay the value to the closest
    /// peer on the walk that did not hold it.
    async fn seed_cache(&self, peer: NetworkAddress, key: NodeId, value: Vec<u8>) {
        debug!(peer = ?peer, key = %hex::encode(&key.as_bytes()[..8]), "seeding value cache");
        let envelope = Envelope::query(
            self.inner.self_addr,
            peer,
            Payload::StoreQuery { key, data: value },
        );
        if let Err(err) = self.inner.transport.send(envelope, false).await {
            debug!(error = %err, "cache seeding send failed");
        }
    }

    /// Long-running reader of the transport. Exits on the shutdown
    /// sentinel; each envelope is handled in its own task so a slow bucket
    /// probe never stalls the reader.
    pub fn spawn_listen(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(envelope) = node.inner.transport.recv().await else {
                    debug!("transport closed, listen loop exiting");
                    break;
                };
                let handler = node.clone();
                tokio::spawn(async move {
                    handler.handle_envelope(envelope).await;
                });
            }
        })
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        self.add_contact(envelope.sender).await;

        match envelope.payload.clone() {
            Payload::FindNodeQuery { target } => {
                let closest = self.inner.routing.lock().await.closest(
                    &target,
                    self.inner.k,
                    &[envelope.sender.id],
                );
                let reply = Envelope::reply_to(
                    &envelope,
                    self.inner.self_addr,
                    Payload::FindNodeResponse { closest },
                );
                if let Err(err) = self.inner.transport.send(reply, false).await {
                    debug!(error = %err, "failed to answer find-node");
                }
            }
            Payload::FindValueQuery { target } => {
                let value = self.inner.store.lock().await.retrieve(&target);
                let payload = match value {
                    Some(value) => Payload::FindValueResponse {
                        value: Some(value),
                        closest: Vec::new(),
                    },
                    None => {
                        let closest = self.inner.routing.lock().await.closest(
                            &target,
                            self.inner.k,
                            &[envelope.sender.id],
                        );
                        Payload::FindValueResponse {
                            value: None,
                            closest,
                        }
                    }
                };
                let reply = Envelope::reply_to(&envelope, self.inner.self_addr, payload);
                if let Err(err) = self.inner.transport.send(reply, false).await {
                    debug!(error = %err, "failed to answer find-value");
                }
            }
            Payload::StoreQuery { key, data } => {
                if data.len() > MAX_VALUE_SIZE {
                    warn!(
                        len = data.len(),
                        peer = ?envelope.sender,
                        "rejecting oversized store"
                    );
                    return;
                }
                self.inner.store.lock().await.store(
                    key,
                    data,
                    Instant::now() + EXPIRE_INTERVAL,
                    false,
                );
            }
            Payload::PingQuery => {
                let reply =
                    Envelope::reply_to(&envelope, self.inner.self_addr, Payload::PingResponse);
                if let Err(err) = self.inner.transport.send(reply, false).await {
                    debug!(error = %err, "failed to answer ping");
                }
            }
            other => {
                trace!(payload = ?other, "ignoring envelope in listen loop");
            }
        }
    }

    /// Periodic driver for the store's two timers: sweep expired entries and
    /// republish keys whose refresh deadline passed.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                node.run_maintenance().await;
            }
        })
    }

    async fn run_maintenance(&self) {
        let due = {
            let mut store = self.inner.store.lock().await;
            store.sweep_expired();
            store.keys_due_for_refresh()
        };

        for key in due {
            let value = { self.inner.store.lock().await.retrieve(&key) };
            let Some(value) = value else { continue };

            match self.iterate(LookupKind::Store, key, Some(value)).await {
                Ok(_) => {
                    self.inner.store.lock().await.mark_refreshed(&key);
                    debug!(key = %hex::encode(&key.as_bytes()[..8]), "republished key");
                }
                Err(err) => {
                    debug!(
                        key = %hex::encode(&key.as_bytes()[..8]),
                        error = %err,
                        "republish failed"
                    );
                }
            }
        }
    }
}
