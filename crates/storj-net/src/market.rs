//! Renter-side contract market state.
//!
//! Publishing a contract registers a pending entry keyed by shard hash.
//! Offers race for it: the first to settle takes the completion channel and
//! wins; later offers see the entry already matched. The single map lock is
//! held only for the take, which is what makes the race atomic.

use std::collections::HashMap;

use parking_lot::Mutex;
use storj_core::ShardHash;
use storj_proto::Contract;
use tokio::sync::oneshot;
use tracing::debug;

use crate::NetError;

struct Pending {
    winner: Option<oneshot::Sender<Contract>>,
}

/// Pending contract publications awaiting offers.
#[derive(Default)]
pub struct Market {
    pending: Mutex<HashMap<ShardHash, Pending>>,
}

impl Market {
    /// Creates an empty market.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a publication; the receiver resolves with the completed
    /// contract when a farmer's offer is accepted.
    pub fn publish(&self, data_hash: ShardHash) -> oneshot::Receiver<Contract> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(data_hash, Pending { winner: Some(tx) });
        debug!(hash = %data_hash, "Publication registered");
        rx
    }

    /// Claims a pending publication for an incoming offer.
    ///
    /// The first offer per publication wins; later offers fail with
    /// `ContractAlreadyMatched`, offers with no matching publication with
    /// `UnknownPublication`.
    pub fn settle(&self, data_hash: &ShardHash) -> Result<oneshot::Sender<Contract>, NetError> {
        let mut pending = self.pending.lock();
        let entry = pending
            .get_mut(data_hash)
            .ok_or(NetError::UnknownPublication)?;
        entry.winner.take().ok_or(NetError::ContractAlreadyMatched)
    }

    /// Drops a publication the renter no longer waits on.
    pub fn abandon(&self, data_hash: &ShardHash) {
        self.pending.lock().remove(data_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storj_core::{KeyPair, Timestamp};

    fn contract(renter: &KeyPair, hash: ShardHash) -> Contract {
        Contract::builder()
            .renter_id(*renter.node_id())
            .data_size(11)
            .data_hash(hash)
            .store_begin(Timestamp::new(0))
            .store_end(Timestamp::new(10_000))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_offer_wins() {
        let market = Market::new();
        let renter = KeyPair::generate();
        let hash = ShardHash::of(b"hello storj");

        let rx = market.publish(hash);

        let winner = market.settle(&hash).unwrap();
        assert!(matches!(
            market.settle(&hash),
            Err(NetError::ContractAlreadyMatched)
        ));

        winner.send(contract(&renter, hash)).unwrap();
        let completed = rx.await.unwrap();
        assert_eq!(*completed.data_hash(), hash);
    }

    #[tokio::test]
    async fn test_unknown_publication() {
        let market = Market::new();
        assert!(matches!(
            market.settle(&ShardHash::of(b"nothing")),
            Err(NetError::UnknownPublication)
        ));
    }

    #[tokio::test]
    async fn test_abandoned_publication() {
        let market = Market::new();
        let hash = ShardHash::of(b"hello storj");
        let _rx = market.publish(hash);

        market.abandon(&hash);
        assert!(matches!(
            market.settle(&hash),
            Err(NetError::UnknownPublication)
        ));
    }
}
