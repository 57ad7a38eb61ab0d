//! Multi-node test network.

use std::sync::Arc;
use std::time::Duration;

use storj_core::{Config, KeyPair};
use storj_net::{LocalOverlay, Network, NetworkOptions};
use storj_store::MemoryAdapter;
use tracing::info;

/// A set of in-process nodes sharing one overlay.
pub struct TestNetwork {
    overlay: Arc<LocalOverlay>,
    nodes: Vec<Arc<Network>>,
}

impl TestNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self {
            overlay: Arc::new(LocalOverlay::new()),
            nodes: Vec::new(),
        }
    }

    /// A config suitable for loopback testing.
    pub fn config() -> Config {
        Config {
            allow_loopback: true,
            response_timeout: Duration::from_secs(5),
            rate_limit_capacity: 10_000,
            ..Config::default()
        }
    }

    /// Adds a node; `farm` makes it offer on published contracts.
    pub async fn add_node(&mut self, farm: bool) -> Arc<Network> {
        self.add_node_with_config(farm, Self::config()).await
    }

    /// Adds a node with a custom config.
    pub async fn add_node_with_config(&mut self, farm: bool, config: Config) -> Arc<Network> {
        let seeds = self
            .nodes
            .first()
            .map(|n| vec![n.contact()])
            .unwrap_or_default();

        let overlay: Arc<dyn storj_net::Overlay> = Arc::clone(&self.overlay);
        let network = Network::create(
            KeyPair::generate(),
            Arc::new(MemoryAdapter::new()),
            overlay,
            config,
            NetworkOptions {
                listen_addr: "127.0.0.1:0".to_string(),
                advertise_address: None,
                farm,
                seeds,
            },
        )
        .await
        .expect("node creation");

        network.join().await.expect("node join");
        info!(contact = %network.contact(), farm, "Test node joined");

        self.nodes.push(Arc::clone(&network));
        network
    }

    /// Adds a renter node.
    pub async fn add_renter(&mut self) -> Arc<Network> {
        self.add_node(false).await
    }

    /// Adds a farmer node.
    pub async fn add_farmer(&mut self) -> Arc<Network> {
        self.add_node(true).await
    }

    /// Returns the shared overlay.
    pub fn overlay(&self) -> &Arc<LocalOverlay> {
        &self.overlay
    }

    /// Returns all nodes.
    pub fn nodes(&self) -> &[Arc<Network>] {
        &self.nodes
    }

    /// Stops every node.
    pub async fn shutdown(&mut self) {
        for node in self.nodes.drain(..) {
            node.leave().await;
        }
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}
