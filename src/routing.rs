//! XOR-metric routing table.
//!
//! One bucket per bit of the identifier space. Bucket `i` holds contacts
//! whose highest differing bit from our own id is bit `i` counted so that a
//! most-significant-bit difference lands in the last bucket (index 159);
//! equivalently, contacts in bucket `i` share exactly `B - 1 - i` prefix
//! bits with us. Buckets are ordered least-recently-seen at the head and
//! most-recently-seen at the tail.
//!
//! ## Insertion under churn
//!
//! A full bucket never evicts blindly: the least-recently-seen head gets a
//! liveness ping first, and only an unresponsive head is replaced. The probe
//! is network I/O, so [`RoutingTable::insert`] does not perform it — it
//! returns a [`PendingProbe`] while the table mutex is held, the caller
//! awaits the ping without the lock, and [`RoutingTable::apply_probe_result`]
//! finalizes the bucket on re-entry. While a probe is outstanding the head
//! carries `pending_probe` and further candidates for that bucket are
//! discarded.

use tokio::time::Instant;
use tracing::trace;

use crate::identity::{distance_cmp, NetworkAddress, NodeId, ID_BITS};

/// Returns the bucket index for `other` relative to `self_id`: the position
/// of the highest differing bit, with an MSB difference yielding
/// `ID_BITS - 1`. Equal ids map to 0; insertion rejects Self before calling
/// this.
pub fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let bit = byte_idx * 8 + byte.leading_zeros() as usize;
            return ID_BITS - 1 - bit;
        }
    }
    0
}

/// A peer known to the routing table.
///
/// Owned exclusively by the table; lookups and the iterative engine carry
/// plain [`NetworkAddress`] values and refer back by id.
#[derive(Clone, Debug)]
pub struct Contact {
    pub address: NetworkAddress,
    pub last_seen: Instant,
    pub pending_probe: bool,
}

impl Contact {
    fn new(address: NetworkAddress) -> Self {
        Self {
            address,
            last_seen: Instant::now(),
            pending_probe: false,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    contacts: Vec<Contact>,
}

enum BucketInsertOutcome {
    Inserted,
    Refreshed,
    /// Bucket is full; the head must prove liveness before anything changes.
    ProbeHead(NetworkAddress),
    /// Bucket is full and its head is already being probed.
    ProbeInFlight,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| c.address.id == *id)
    }

    fn insert(&mut self, address: NetworkAddress, k: usize) -> BucketInsertOutcome {
        if let Some(pos) = self.position(&address.id) {
            let mut existing = self.contacts.remove(pos);
            existing.address = address;
            existing.last_seen = Instant::now();
            self.contacts.push(existing);
            return BucketInsertOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(Contact::new(address));
            return BucketInsertOutcome::Inserted;
        }

        let head = &mut self.contacts[0];
        if head.pending_probe {
            return BucketInsertOutcome::ProbeInFlight;
        }
        head.pending_probe = true;
        trace!(
            idle = ?head.last_seen.elapsed(),
            "bucket full, probing least-recently-seen head"
        );
        BucketInsertOutcome::ProbeHead(head.address)
    }

    fn move_to_tail(&mut self, id: &NodeId) {
        if let Some(pos) = self.position(id) {
            let mut contact = self.contacts.remove(pos);
            contact.last_seen = Instant::now();
            self.contacts.push(contact);
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.position(id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }

    fn clear_probe(&mut self, id: &NodeId) {
        if let Some(pos) = self.position(id) {
            self.contacts[pos].pending_probe = false;
        }
    }
}

/// A liveness probe handed out by [`RoutingTable::insert`] when a bucket is
/// full. The caller pings `head` without holding the table lock and reports
/// the outcome through [`RoutingTable::apply_probe_result`].
#[derive(Clone, Debug)]
pub struct PendingProbe {
    pub bucket_index: usize,
    pub head: NetworkAddress,
    pub candidate: NetworkAddress,
}

/// All known peers, partitioned into one bucket per prefix length.
pub struct RoutingTable {
    self_addr: NetworkAddress,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_addr: NetworkAddress, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(Bucket::default());
        }
        Self {
            self_addr,
            k,
            buckets,
        }
    }

    /// Inserts or refreshes `address` per the Kademlia policy. Returns a
    /// probe request when the target bucket is full and its head must be
    /// pinged; the candidate is not yet in the table in that case.
    pub fn insert(&mut self, address: NetworkAddress) -> Option<PendingProbe> {
        if address.id == self.self_addr.id {
            return None;
        }
        let idx = bucket_index(&self.self_addr.id, &address.id);
        match self.buckets[idx].insert(address, self.k) {
            BucketInsertOutcome::Inserted | BucketInsertOutcome::Refreshed => None,
            BucketInsertOutcome::ProbeInFlight => {
                trace!(candidate = ?address, "bucket head probe already in flight, discarding candidate");
                None
            }
            BucketInsertOutcome::ProbeHead(head) => Some(PendingProbe {
                bucket_index: idx,
                head,
                candidate: address,
            }),
        }
    }

    /// Finalizes a probe issued by [`insert`](Self::insert). A live head is
    /// moved to the tail and the candidate is dropped; a dead head is
    /// evicted and the candidate appended.
    pub fn apply_probe_result(&mut self, probe: PendingProbe, head_alive: bool) {
        let bucket = &mut self.buckets[probe.bucket_index];
        bucket.clear_probe(&probe.head.id);

        if head_alive {
            bucket.move_to_tail(&probe.head.id);
            return;
        }

        bucket.remove(&probe.head.id);
        if bucket.position(&probe.candidate.id).is_none() && bucket.contacts.len() < self.k {
            bucket.contacts.push(Contact::new(probe.candidate));
        }
    }

    /// Drops the contact with `id`, wherever it lives.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        if *id == self.self_addr.id {
            return false;
        }
        let idx = bucket_index(&self.self_addr.id, id);
        self.buckets[idx].remove(id)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &NodeId) -> bool {
        if *id == self.self_addr.id {
            return false;
        }
        let idx = bucket_index(&self.self_addr.id, id);
        self.buckets[idx].position(id).is_some()
    }

    /// The `count` known contacts closest to `target`, sorted ascending by
    /// XOR distance, skipping ids in `exclude`.
    ///
    /// Gathering starts at the target's own bucket and expands outward in
    /// both directions until enough contacts are collected or every bucket
    /// has been visited; the gathered set is then sorted and truncated.
    pub fn closest(&self, target: &NodeId, count: usize, exclude: &[NodeId]) -> Vec<NetworkAddress> {
        if count == 0 {
            return Vec::new();
        }

        let start = bucket_index(&self.self_addr.id, target);
        let mut gathered: Vec<NetworkAddress> = Vec::new();

        let visit = |bucket: &Bucket, gathered: &mut Vec<NetworkAddress>| {
            for contact in &bucket.contacts {
                if !exclude.contains(&contact.address.id) {
                    gathered.push(contact.address);
                }
            }
        };

        visit(&self.buckets[start], &mut gathered);
        for span in 1..ID_BITS {
            if gathered.len() >= count {
                break;
            }
            if span <= start {
                visit(&self.buckets[start - span], &mut gathered);
            }
            if start + span < ID_BITS {
                visit(&self.buckets[start + span], &mut gathered);
            }
        }

        gathered.sort_by(|a, b| {
            let da = a.id.xor_distance(target);
            let db = b.id.xor_distance(target);
            distance_cmp(&da, &db)
        });
        gathered.truncate(count);
        gathered
    }

    /// Total number of contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn bucket_contacts(&self, idx: usize) -> Vec<NetworkAddress> {
        self.buckets[idx].contacts.iter().map(|c| c.address).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ID_BYTES;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_id(bytes: &[u8]) -> NodeId {
        let mut id = [0u8; ID_BYTES];
        id[..bytes.len()].copy_from_slice(bytes);
        NodeId::from_bytes(id)
    }

    fn make_addr(bytes: &[u8]) -> NetworkAddress {
        NetworkAddress::new(
            make_id(bytes),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            9000,
        )
    }

    #[test]
    fn bucket_index_counts_from_most_significant_bit() {
        let zero = make_id(&[]);

        assert_eq!(bucket_index(&zero, &make_id(&[0x80])), ID_BITS - 1);
        assert_eq!(bucket_index(&zero, &make_id(&[0x01])), ID_BITS - 8);

        // Differ only in the very last bit: the single closest partition.
        let mut last = [0u8; ID_BYTES];
        last[ID_BYTES - 1] = 0x01;
        assert_eq!(bucket_index(&zero, &NodeId::from_bytes(last)), 0);

        assert_eq!(bucket_index(&zero, &zero), 0);
    }

    #[test]
    fn self_is_never_inserted() {
        let me = make_addr(&[0x01]);
        let mut table = RoutingTable::new(me, 20);

        assert!(table.insert(me).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn reinsertion_moves_contact_to_tail() {
        let me = make_addr(&[]);
        let mut table = RoutingTable::new(me, 20);

        let first = make_addr(&[0x80, 0x01]);
        let second = make_addr(&[0x80, 0x02]);
        table.insert(first);
        table.insert(second);
        table.insert(first);

        let idx = bucket_index(&me.id, &first.id);
        let contacts = table.bucket_contacts(idx);
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].id, second.id);
        assert_eq!(contacts[1].id, first.id);
    }

    #[test]
    fn full_bucket_requests_probe_of_the_head() {
        let me = make_addr(&[]);
        let mut table = RoutingTable::new(me, 2);

        let a = make_addr(&[0x80, 0x01]);
        let b = make_addr(&[0x80, 0x02]);
        let c = make_addr(&[0x80, 0x03]);
        assert!(table.insert(a).is_none());
        assert!(table.insert(b).is_none());

        let probe = table.insert(c).expect("full bucket yields a probe");
        assert_eq!(probe.head.id, a.id);
        assert_eq!(probe.candidate.id, c.id);
        assert!(!table.contains(&c.id));

        // Second candidate while the probe is outstanding is discarded.
        let d = make_addr(&[0x80, 0x04]);
        assert!(table.insert(d).is_none());
    }

    #[test]
    fn live_head_survives_and_moves_to_tail() {
        let me = make_addr(&[]);
        let mut table = RoutingTable::new(me, 2);

        let a = make_addr(&[0x80, 0x01]);
        let b = make_addr(&[0x80, 0x02]);
        let c = make_addr(&[0x80, 0x03]);
        table.insert(a);
        table.insert(b);
        let probe = table.insert(c).unwrap();

        table.apply_probe_result(probe, true);

        let idx = bucket_index(&me.id, &a.id);
        let contacts = table.bucket_contacts(idx);
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].id, b.id);
        assert_eq!(contacts[1].id, a.id);
        assert!(!table.contains(&c.id));
    }

    #[test]
    fn dead_head_is_evicted_for_the_candidate() {
        let me = make_addr(&[]);
        let mut table = RoutingTable::new(me, 2);

        let a = make_addr(&[0x80, 0x01]);
        let b = make_addr(&[0x80, 0x02]);
        let c = make_addr(&[0x80, 0x03]);
        table.insert(a);
        table.insert(b);
        let probe = table.insert(c).unwrap();

        table.apply_probe_result(probe, false);

        assert!(!table.contains(&a.id));
        let idx = bucket_index(&me.id, &c.id);
        let contacts = table.bucket_contacts(idx);
        assert_eq!(contacts.last().map(|addr| addr.id), Some(c.id));
    }

    #[test]
    fn remove_drops_by_id() {
        let me = make_addr(&[]);
        let mut table = RoutingTable::new(me, 20);
        let peer = make_addr(&[0x40]);

        table.insert(peer);
        assert!(table.contains(&peer.id));
        assert!(table.remove(&peer.id));
        assert!(!table.contains(&peer.id));
        assert!(!table.remove(&peer.id));
    }

    #[test]
    fn closest_sorts_by_distance_to_target() {
        let me = make_addr(&[]);
        let mut table = RoutingTable::new(me, 20);

        for byte in [0x10u8, 0x20, 0x08] {
            table.insert(make_addr(&[byte]));
        }

        let target = make_id(&[0x18]);
        let closest = table.closest(&target, 3, &[]);
        let firsts: Vec<u8> = closest.iter().map(|a| a.id.as_bytes()[0]).collect();
        assert_eq!(firsts, vec![0x10, 0x08, 0x20]);
    }

    #[test]
    fn closest_expands_beyond_the_starting_bucket() {
        let me = make_addr(&[]);
        let mut table = RoutingTable::new(me, 20);

        // Contacts scattered across several buckets.
        for byte in [0x80u8, 0x40, 0x20, 0x01] {
            table.insert(make_addr(&[byte]));
        }

        let target = make_id(&[0x21]);
        let closest = table.closest(&target, 4, &[]);
        assert_eq!(closest.len(), 4);
        assert_eq!(closest[0].id.as_bytes()[0], 0x20);
    }

    #[test]
    fn closest_respects_exclusions_and_count() {
        let me = make_addr(&[]);
        let mut table = RoutingTable::new(me, 20);

        let a = make_addr(&[0x80, 0x01]);
        let b = make_addr(&[0x80, 0x02]);
        let c = make_addr(&[0x80, 0x03]);
        for addr in [a, b, c] {
            table.insert(addr);
        }

        let target = a.id;
        let closest = table.closest(&target, 2, &[a.id]);
        assert_eq!(closest.len(), 2);
        assert!(closest.iter().all(|addr| addr.id != a.id));
    }
}
