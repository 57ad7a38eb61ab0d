//! Kademlia-style routing table.
//!
//! Contacts are organized in k-buckets by XOR distance from the local node.
//! Each bucket updates atomically behind its own lock. A periodic cleaning
//! pass drops contacts whose advertised protocol is incompatible or whose
//! address is invalid, keeping the table free of peers we cannot use.

use std::collections::VecDeque;

use parking_lot::{Mutex, RwLock};
use storj_core::{NodeId, ProtocolVersion};
use storj_proto::Contact;
use tracing::debug;

use crate::DEFAULT_K;

/// Number of buckets: one per possible XOR-distance prefix length.
const BUCKET_COUNT: usize = 160;

/// A k-bucket holding up to k contacts, least-recently-seen first.
#[derive(Debug, Default)]
struct KBucket {
    contacts: VecDeque<Contact>,
}

impl KBucket {
    fn insert(&mut self, contact: Contact, k: usize) -> bool {
        if let Some(pos) = self
            .contacts
            .iter()
            .position(|c| c.node_id == contact.node_id)
        {
            // Known contact: refresh and move to the tail.
            let mut existing = self.contacts.remove(pos).expect("position just found");
            existing.address = contact.address;
            existing.port = contact.port;
            existing.protocol = contact.protocol;
            existing.touch();
            self.contacts.push_back(existing);
            return true;
        }

        if self.contacts.len() < k {
            self.contacts.push_back(contact);
            return true;
        }

        false
    }

    fn remove(&mut self, node_id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.node_id == *node_id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }

    fn touch(&mut self, node_id: &NodeId) {
        if let Some(contact) = self.contacts.iter_mut().find(|c| c.node_id == *node_id) {
            contact.touch();
        }
    }
}

/// The routing table: 160 k-buckets behind per-bucket locks.
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Mutex<KBucket>>,
    tunnelers: RwLock<TunnelerBucket>,
}

impl RoutingTable {
    /// Creates an empty table for the local node.
    pub fn new(local_id: NodeId) -> Self {
        Self::with_bucket_size(local_id, DEFAULT_K)
    }

    /// Creates an empty table with a custom bucket size.
    pub fn with_bucket_size(local_id: NodeId, k: usize) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| Mutex::new(KBucket::default())).collect();
        Self {
            local_id,
            k,
            buckets,
            tunnelers: RwLock::new(TunnelerBucket::new(k)),
        }
    }

    /// Returns the local node id.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    fn bucket_index(&self, node_id: &NodeId) -> usize {
        let distance = self.local_id.xor_distance(node_id);
        let zeros = NodeId::new(distance).leading_zeros() as usize;
        zeros.min(BUCKET_COUNT - 1)
    }

    /// Adds or refreshes a contact. The local node is never inserted.
    pub fn insert(&self, contact: Contact) -> bool {
        if contact.node_id == self.local_id {
            return false;
        }
        let index = self.bucket_index(&contact.node_id);
        self.buckets[index].lock().insert(contact, self.k)
    }

    /// Removes a contact.
    pub fn remove(&self, node_id: &NodeId) -> bool {
        let index = self.bucket_index(node_id);
        self.buckets[index].lock().remove(node_id)
    }

    /// Refreshes a contact's last-seen time.
    pub fn touch(&self, node_id: &NodeId) {
        let index = self.bucket_index(node_id);
        self.buckets[index].lock().touch(node_id);
    }

    /// Returns the contact for a node, if known.
    pub fn get(&self, node_id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(node_id);
        self.buckets[index]
            .lock()
            .contacts
            .iter()
            .find(|c| c.node_id == *node_id)
            .cloned()
    }

    /// Returns every known contact.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.lock().contacts.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Returns the number of known contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().contacts.len()).sum()
    }

    /// Returns true when no contacts are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns up to `count` contacts closest to the target by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all = self.contacts();
        all.sort_by_key(|c| c.node_id.xor_distance(target));
        all.truncate(count);
        all
    }

    /// Drops contacts that are protocol-incompatible or undialable.
    ///
    /// Returns the number removed.
    pub fn clean(&self, ours: &ProtocolVersion, allow_loopback: bool) -> usize {
        let mut removed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let before = bucket.contacts.len();
            bucket
                .contacts
                .retain(|c| c.is_compatible(ours) && c.is_valid(allow_loopback));
            removed += before - bucket.contacts.len();
        }
        if removed > 0 {
            debug!(removed, "Routing table cleaned");
        }
        removed
    }

    /// Records a tunneler advertisement.
    pub fn add_tunneler(&self, contact: Contact) {
        self.tunnelers.write().insert(contact);
    }

    /// Forgets a withdrawn tunneler.
    pub fn remove_tunneler(&self, node_id: &NodeId) {
        self.tunnelers.write().remove(node_id);
    }

    /// Returns up to `count` known tunnelers, most recently advertised first.
    pub fn tunnelers(&self, count: usize) -> Vec<Contact> {
        self.tunnelers.read().newest(count)
    }
}

/// Bounded set of known tunnelers; the oldest entry is evicted when full.
#[derive(Debug)]
pub struct TunnelerBucket {
    capacity: usize,
    contacts: VecDeque<Contact>,
}

impl TunnelerBucket {
    /// Creates an empty bucket.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            contacts: VecDeque::with_capacity(capacity),
        }
    }

    /// Inserts a tunneler, evicting the oldest when the bucket is full.
    pub fn insert(&mut self, contact: Contact) {
        if let Some(pos) = self
            .contacts
            .iter()
            .position(|c| c.node_id == contact.node_id)
        {
            self.contacts.remove(pos);
        }
        if self.contacts.len() >= self.capacity {
            self.contacts.pop_front();
        }
        self.contacts.push_back(contact);
    }

    /// Removes a tunneler.
    pub fn remove(&mut self, node_id: &NodeId) {
        if let Some(pos) = self.contacts.iter().position(|c| c.node_id == *node_id) {
            self.contacts.remove(pos);
        }
    }

    /// Returns up to `count` tunnelers, newest first.
    pub fn newest(&self, count: usize) -> Vec<Contact> {
        self.contacts.iter().rev().take(count).cloned().collect()
    }

    /// Returns the number of known tunnelers.
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    /// Returns true when no tunnelers are known.
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
