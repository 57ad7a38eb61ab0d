//! Overlay primitives: publish/subscribe and record storage.
//!
//! The structured overlay is consumed through this trait; the node core
//! does not implement DHT internals. [`LocalOverlay`] is the in-process
//! implementation used by tests and single-host deployments: publications
//! fan out to every subscriber whose byte-prefix filter matches the topic.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storj_proto::{random_hex_id, Topic};
use tokio::sync::mpsc;
use tracing::debug;

use crate::NetError;

/// One publication on an opcode topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    /// Unique id suppressing routing loops.
    pub uuid: String,
    /// The opcode topic.
    pub topic: Topic,
    /// Publication contents.
    pub contents: Value,
}

/// The overlay surface the node consumes.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Publishes contents on a topic.
    async fn publish(&self, topic: Topic, contents: Value) -> Result<(), NetError>;

    /// Routes a publication received from a peer (loop-suppressed by uuid).
    async fn relay(&self, publication: Publication) -> Result<(), NetError>;

    /// Subscribes to topics matching any of the byte-prefix filters.
    fn subscribe(&self, prefixes: Vec<Vec<u8>>) -> mpsc::Receiver<Publication>;

    /// Stores a record under a key.
    async fn store_record(&self, key: String, value: Value) -> Result<(), NetError>;

    /// Looks a record up by key.
    async fn find_record(&self, key: &str) -> Option<Value>;
}

struct Subscriber {
    prefixes: Vec<Vec<u8>>,
    tx: mpsc::Sender<Publication>,
}

/// In-process overlay shared between nodes of one runtime.
#[derive(Default)]
pub struct LocalOverlay {
    subscribers: Mutex<Vec<Subscriber>>,
    records: Mutex<HashMap<String, Value>>,
    seen: Mutex<HashSet<String>>,
}

impl LocalOverlay {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes an externally received publication to local subscribers.
    pub fn deliver(&self, publication: Publication) {
        {
            let mut seen = self.seen.lock();
            if !seen.insert(publication.uuid.clone()) {
                return;
            }
            if seen.len() > 4096 {
                seen.clear();
            }
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            let matched = subscriber
                .prefixes
                .iter()
                .any(|p| publication.topic.matches_prefix(p));
            if matched {
                // A full queue drops the publication for that subscriber;
                // the market tolerates missed publications.
                let _ = subscriber.tx.try_send(publication.clone());
            }
        }
    }
}

#[async_trait]
impl Overlay for LocalOverlay {
    async fn publish(&self, topic: Topic, contents: Value) -> Result<(), NetError> {
        let publication = Publication {
            uuid: random_hex_id(),
            topic,
            contents,
        };
        debug!(topic = %topic, uuid = %publication.uuid, "Publishing");
        self.deliver(publication);
        Ok(())
    }

    async fn relay(&self, publication: Publication) -> Result<(), NetError> {
        self.deliver(publication);
        Ok(())
    }

    fn subscribe(&self, prefixes: Vec<Vec<u8>>) -> mpsc::Receiver<Publication> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().push(Subscriber { prefixes, tx });
        rx
    }

    async fn store_record(&self, key: String, value: Value) -> Result<(), NetError> {
        self.records.lock().insert(key, value);
        Ok(())
    }

    async fn find_record(&self, key: &str) -> Option<Value> {
        self.records.lock().get(key).cloned()
    }
}
