//! Per-shard metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use storj_audit::Challenge;
use storj_core::{NodeId, ShardHash, Timestamp};
use storj_proto::Contract;

/// Everything a node knows about one shard, keyed by counterparty.
///
/// On a renter the maps are keyed by farmer id; on a farmer by renter id.
/// Created on first consignment, mutated as audits consume challenges,
/// deleted when every contract has run out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageItem {
    /// The shard's content address.
    pub hash: ShardHash,
    /// Storage contracts per counterparty.
    #[serde(default)]
    pub contracts: HashMap<NodeId, Contract>,
    /// Public audit leaves per counterparty, hex encoded.
    #[serde(default)]
    pub trees: HashMap<NodeId, Vec<String>>,
    /// Unconsumed audit challenges per counterparty (renter side only).
    #[serde(default)]
    pub challenges: HashMap<NodeId, Vec<Challenge>>,
    /// Free-form metadata per counterparty.
    #[serde(default)]
    pub meta: HashMap<NodeId, serde_json::Value>,
    /// Whether the shard bytes are present locally. Not persisted; the
    /// adapter resolves it on load.
    #[serde(skip)]
    pub has_shard: bool,
}

impl StorageItem {
    /// Creates an empty item for a shard.
    pub fn new(hash: ShardHash) -> Self {
        Self {
            hash,
            contracts: HashMap::new(),
            trees: HashMap::new(),
            challenges: HashMap::new(),
            meta: HashMap::new(),
            has_shard: false,
        }
    }

    /// Merges another item's maps into this one.
    ///
    /// Entries union per counterparty; an incoming entry for a counterparty
    /// replaces the held one (challenge consumption works this way), but no
    /// counterparty is ever dropped.
    pub fn merge(&mut self, other: StorageItem) {
        self.contracts.extend(other.contracts);
        self.trees.extend(other.trees);
        self.challenges.extend(other.challenges);
        self.meta.extend(other.meta);
    }

    /// Records a contract with a counterparty.
    pub fn add_contract(&mut self, node_id: NodeId, contract: Contract) {
        self.contracts.insert(node_id, contract);
    }

    /// Returns the contract with a counterparty.
    pub fn contract_for(&self, node_id: &NodeId) -> Option<&Contract> {
        self.contracts.get(node_id)
    }

    /// Returns the public audit leaves for a counterparty, decoded.
    pub fn tree_for(&self, node_id: &NodeId) -> Option<Vec<[u8; 20]>> {
        let leaves = self.trees.get(node_id)?;
        let mut decoded = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let bytes = hex::decode(leaf).ok()?;
            if bytes.len() != 20 {
                return None;
            }
            let mut arr = [0u8; 20];
            arr.copy_from_slice(&bytes);
            decoded.push(arr);
        }
        Some(decoded)
    }

    /// Pops the next unconsumed challenge for a counterparty.
    pub fn take_challenge(&mut self, node_id: &NodeId) -> Option<Challenge> {
        let remaining = self.challenges.get_mut(node_id)?;
        if remaining.is_empty() {
            None
        } else {
            Some(remaining.remove(0))
        }
    }

    /// Returns true when every contract's storage window has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        !self.contracts.is_empty() && self.contracts.values().all(|c| c.is_expired(now))
    }

    /// Drops contracts whose storage window has passed; returns how many.
    pub fn reap_expired(&mut self, now: Timestamp) -> usize {
        let expired: Vec<NodeId> = self
            .contracts
            .iter()
            .filter(|(_, c)| c.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.contracts.remove(id);
            self.trees.remove(id);
            self.challenges.remove(id);
            self.meta.remove(id);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storj_core::KeyPair;

    fn contract(renter: &KeyPair, end_ms: i64) -> Contract {
        Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(11)
            .data_hash(ShardHash::of(b"hello storj"))
            .store_begin(Timestamp::new(0))
            .store_end(Timestamp::new(end_ms))
            .build()
            .unwrap()
    }

    #[test]
    fn test_merge_is_superset() {
        let renter = KeyPair::generate();
        let farmer_a = *KeyPair::generate().node_id();
        let farmer_b = *KeyPair::generate().node_id();
        let hash = ShardHash::of(b"hello storj");

        let mut held = StorageItem::new(hash);
        held.add_contract(farmer_a, contract(&renter, 1000));
        held.trees.insert(farmer_a, vec!["aa".repeat(20)]);

        let mut incoming = StorageItem::new(hash);
        incoming.add_contract(farmer_b, contract(&renter, 2000));

        held.merge(incoming);
        assert!(held.contract_for(&farmer_a).is_some());
        assert!(held.contract_for(&farmer_b).is_some());
        assert!(held.trees.contains_key(&farmer_a));
    }

    #[test]
    fn test_take_challenge_consumes() {
        let farmer = *KeyPair::generate().node_id();
        let mut item = StorageItem::new(ShardHash::of(b"x"));
        item.challenges
            .insert(farmer, vec![Challenge::random(), Challenge::random()]);

        assert!(item.take_challenge(&farmer).is_some());
        assert_eq!(item.challenges[&farmer].len(), 1);
        assert!(item.take_challenge(&farmer).is_some());
        assert!(item.take_challenge(&farmer).is_none());
    }

    #[test]
    fn test_tree_decoding() {
        let farmer = *KeyPair::generate().node_id();
        let mut item = StorageItem::new(ShardHash::of(b"x"));
        item.trees
            .insert(farmer, vec![hex::encode([7u8; 20]), hex::encode([9u8; 20])]);

        let decoded = item.tree_for(&farmer).unwrap();
        assert_eq!(decoded, vec![[7u8; 20], [9u8; 20]]);

        item.trees.insert(farmer, vec!["tooshort".to_string()]);
        assert!(item.tree_for(&farmer).is_none());
    }

    #[test]
    fn test_expiry_reaping() {
        let renter = KeyPair::generate();
        let farmer_a = *KeyPair::generate().node_id();
        let farmer_b = *KeyPair::generate().node_id();

        let mut item = StorageItem::new(ShardHash::of(b"hello storj"));
        item.add_contract(farmer_a, contract(&renter, 1_000));
        item.add_contract(farmer_b, contract(&renter, 10_000));

        assert!(!item.is_expired(Timestamp::new(5_000)));
        assert_eq!(item.reap_expired(Timestamp::new(5_000)), 1);
        assert!(item.contract_for(&farmer_a).is_none());
        assert!(item.contract_for(&farmer_b).is_some());

        assert!(item.is_expired(Timestamp::new(20_000)));
    }

    #[test]
    fn test_serde_skips_shard_presence() {
        let mut item = StorageItem::new(ShardHash::of(b"x"));
        item.has_shard = true;

        let json = serde_json::to_string(&item).unwrap();
        let back: StorageItem = serde_json::from_str(&json).unwrap();
        assert!(!back.has_shard);
        assert_eq!(back.hash, item.hash);
    }
}
