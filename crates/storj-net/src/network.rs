//! Network facade: lifecycle, renter operations, and maintenance loops.
//!
//! One `Network` owns a node's identity, storage, transport, and handler
//! state. `join` connects to seed nodes in series, resolves reachability
//! (falling back to a tunnel when probes fail), and starts the background
//! loops: routing-table cleaning, inactivity reentry, and the tunneler
//! announce beat. Renter-side operations (publish, upload, retrieve, audit,
//! mirror) live here so callers drive the whole protocol through one handle.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use storj_audit::{verify_proof, AuditRecord, AuditStream};
use storj_core::{Config, KeyPair, NodeId, ProtocolVersion, ShardHash, Timestamp};
use storj_proto::{
    contract_topic, tunneler_topic, AuditParams, AuditResult, ConsignParams, ConsignResult,
    Contact, Contract, MirrorParams, OfferParams, OfferResult, RetrieveParams, RetrieveResult,
    Role, RpcMessage, RpcMethod, PREFIX_CONTRACT, PREFIX_TUNNELER,
};
use storj_store::{ShardManager, StorageAdapter, StorageItem};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{DataChannelClient, TokenStore};
use crate::handlers::Protocols;
use crate::market::Market;
use crate::overlay::Overlay;
use crate::routing::RoutingTable;
use crate::transport::{Dispatcher, RpcServer, RpcTransport, TcpRpcTransport};
use crate::tunnel::{TunnelClient, TunnelEvent, TunnelServer};
use crate::NetError;

/// Node start-up options.
#[derive(Clone)]
pub struct NetworkOptions {
    /// Address the combined RPC/data listener binds.
    pub listen_addr: String,
    /// Address advertised to peers; defaults to the bound address.
    pub advertise_address: Option<String>,
    /// Whether this node offers on published contracts.
    pub farm: bool,
    /// Seed contacts tried in series on join.
    pub seeds: Vec<Contact>,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4000".to_string(),
            advertise_address: None,
            farm: false,
            seeds: Vec::new(),
        }
    }
}

/// The network facade.
pub struct Network {
    config: Config,
    options: NetworkOptions,
    keypair: Arc<KeyPair>,
    contact: Arc<RwLock<Contact>>,
    router: Arc<RoutingTable>,
    manager: Arc<ShardManager>,
    market: Arc<Market>,
    overlay: Arc<dyn Overlay>,
    transport: Arc<dyn RpcTransport>,
    protocols: Arc<Protocols>,
    tunnel_events: Mutex<Option<tokio::sync::mpsc::Receiver<TunnelEvent>>>,
    tunnel_events_tx: tokio::sync::mpsc::Sender<TunnelEvent>,
    activity: Arc<AtomicI64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Network {
    /// Builds a node and binds its listener; nothing runs until `join`.
    pub async fn create(
        keypair: KeyPair,
        adapter: Arc<dyn StorageAdapter>,
        overlay: Arc<dyn Overlay>,
        config: Config,
        options: NetworkOptions,
    ) -> Result<Arc<Self>, NetError> {
        let keypair = Arc::new(keypair);
        let node_id = *keypair.node_id();

        let manager = Arc::new(ShardManager::new(adapter, config.max_capacity));
        let tokens = Arc::new(TokenStore::new(config.token_ttl));
        let market = Arc::new(Market::new());
        let router = Arc::new(RoutingTable::new(node_id));
        let tunnel_server = Arc::new(TunnelServer::new(config.max_tunnel_slots));

        // Placeholder port until the listener reports what it bound.
        let contact = Arc::new(RwLock::new(Contact::new(
            options
                .advertise_address
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            1,
            node_id,
        )));

        let protocols = Arc::new(Protocols::new(
            Arc::clone(&keypair),
            Arc::clone(&contact),
            Arc::clone(&manager),
            Arc::clone(&tokens),
            Arc::clone(&market),
            Arc::clone(&router),
            tunnel_server,
            Arc::clone(&overlay),
            config.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&keypair),
            Arc::clone(&contact),
            Arc::clone(&router),
            Arc::clone(&protocols),
            &config,
        ));
        let activity = dispatcher.activity();

        let server = RpcServer::bind(
            &options.listen_addr,
            dispatcher,
            Arc::clone(&manager),
            Arc::clone(&tokens),
        )
        .await?;
        let bound = server.local_addr()?;
        {
            let mut contact = contact.write();
            contact.port = bound.port();
            if options.advertise_address.is_none() {
                contact.address = bound.ip().to_string();
            }
        }

        let transport: Arc<dyn RpcTransport> = Arc::new(TcpRpcTransport::new(
            Arc::clone(&keypair),
            Arc::clone(&contact),
            &config,
        ));
        protocols.set_transport(Arc::clone(&transport));

        let server_task = server.spawn();
        let (tunnel_tx, tunnel_rx) = tokio::sync::mpsc::channel(8);

        let network = Arc::new(Self {
            config,
            options,
            keypair,
            contact,
            router,
            manager,
            market,
            overlay,
            transport,
            protocols,
            tunnel_events: Mutex::new(Some(tunnel_rx)),
            tunnel_events_tx: tunnel_tx,
            activity,
            tasks: Mutex::new(vec![server_task]),
        });
        Ok(network)
    }

    /// Returns the contact this node advertises.
    pub fn contact(&self) -> Contact {
        self.contact.read().clone()
    }

    /// Returns the node identity.
    pub fn node_id(&self) -> NodeId {
        *self.keypair.node_id()
    }

    /// Returns the routing table.
    pub fn router(&self) -> &Arc<RoutingTable> {
        &self.router
    }

    /// Returns the shard manager.
    pub fn manager(&self) -> &Arc<ShardManager> {
        &self.manager
    }

    /// Returns the outbound transport.
    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.transport
    }

    /// Joins the overlay: seeds in series, reachability, background loops.
    pub async fn join(self: &Arc<Self>) -> Result<(), NetError> {
        let reached = self.connect_seeds().await?;

        // Reachability: ask the seed to probe us back. Without any seed the
        // node runs standalone and is trivially "reachable".
        if let Some(seed) = reached {
            let tunnel_client =
                TunnelClient::new(Arc::clone(&self.transport), self.tunnel_events_tx.clone());
            if !tunnel_client.probe(&seed).await {
                info!("Not publicly reachable, establishing tunnel");
                let neighbours = self.router.closest(&self.node_id(), crate::DEFAULT_K);
                let candidates = if neighbours.is_empty() {
                    vec![seed.clone()]
                } else {
                    neighbours
                };
                tunnel_client.establish(&candidates).await?;
                self.drain_tunnel_events();
            }
        }

        self.spawn_loops();
        info!(contact = %self.contact(), "Joined overlay");
        Ok(())
    }

    /// Leaves the overlay: withdraws announcements and stops every loop.
    pub async fn leave(&self) {
        if self.config.max_tunnel_slots > 0 {
            let contents = json!({ "contact": self.contact() });
            let _ = self.overlay.publish(tunneler_topic(false), contents).await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Left overlay");
    }

    async fn connect_seeds(&self) -> Result<Option<Contact>, NetError> {
        if self.options.seeds.is_empty() {
            return Ok(None);
        }

        for seed in &self.options.seeds {
            let ping = RpcMessage::request(RpcMethod::Ping, json!({}));
            match self.transport.request(seed, ping).await {
                Ok(_) => {
                    self.router.insert(seed.clone());

                    // Populate the routing table around our own id.
                    let find = RpcMessage::request(
                        RpcMethod::FindNode,
                        json!({ "key": self.node_id().to_hex() }),
                    );
                    if let Ok(response) = self.transport.request(seed, find).await {
                        if let Some(nodes) = response.payload().get("nodes") {
                            if let Ok(contacts) =
                                serde_json::from_value::<Vec<Contact>>(nodes.clone())
                            {
                                for contact in contacts {
                                    self.router.insert(contact);
                                }
                            }
                        }
                    }

                    info!(seed = %seed.node_id, "Connected to seed");
                    return Ok(Some(seed.clone()));
                }
                Err(e) => warn!(seed = %seed.node_id, error = %e, "Seed connection failed"),
            }
        }
        Err(NetError::NoSeedsReachable)
    }

    fn drain_tunnel_events(&self) {
        let mut guard = self.tunnel_events.lock();
        if let Some(rx) = guard.as_mut() {
            while let Ok(event) = rx.try_recv() {
                if let TunnelEvent::Established { alias, .. } = event {
                    info!(alias = %alias, "Advertising tunnel alias");
                    *self.contact.write() = alias;
                }
            }
        }
    }

    fn spawn_loops(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        // Routing-table cleaner.
        {
            let router = Arc::clone(&self.router);
            let protocols = Arc::clone(&self.protocols);
            let allow_loopback = self.config.allow_loopback;
            let interval = self.config.router_clean_interval;
            tasks.push(tokio::spawn(async move {
                let ours = ProtocolVersion::current();
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    router.clean(&ours, allow_loopback);
                    protocols.maintenance().await;
                }
            }));
        }

        // Inactivity reentry.
        {
            let weak: Weak<Network> = Arc::downgrade(self);
            let activity = Arc::clone(&self.activity);
            let idle = self.config.reentry_idle;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(idle / 2);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let last = Timestamp::new(activity.load(Ordering::Relaxed));
                    let idle_for = Timestamp::now().as_millis() - last.as_millis();
                    if idle_for < idle.as_millis() as i64 {
                        continue;
                    }
                    let Some(network) = weak.upgrade() else { break };
                    info!("Idle too long, re-running overlay join");
                    if let Err(e) = network.connect_seeds().await {
                        warn!(error = %e, "Reentry failed");
                    }
                    activity.store(Timestamp::now().as_millis(), Ordering::Relaxed);
                }
            }));
        }

        // Tunneler announce beat while offering relay slots.
        if self.config.max_tunnel_slots > 0 {
            let overlay = Arc::clone(&self.overlay);
            let contact = Arc::clone(&self.contact);
            let interval = self.config.tunnel_announce_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let contents = json!({ "contact": contact.read().clone() });
                    if let Err(e) = overlay.publish(tunneler_topic(true), contents).await {
                        warn!(error = %e, "Tunneler announce failed");
                    }
                }
            }));
        }

        // Track tunneler advertisements into the tunneler bucket.
        {
            let router = Arc::clone(&self.router);
            let own_id = self.node_id();
            let mut rx = self.overlay.subscribe(vec![vec![PREFIX_TUNNELER]]);
            tasks.push(tokio::spawn(async move {
                while let Some(publication) = rx.recv().await {
                    let Some(value) = publication.contents.get("contact") else {
                        continue;
                    };
                    let Ok(contact) = serde_json::from_value::<Contact>(value.clone()) else {
                        continue;
                    };
                    if contact.node_id == own_id {
                        continue;
                    }
                    if publication.topic == tunneler_topic(true) {
                        router.add_tunneler(contact);
                    } else {
                        router.remove_tunneler(&contact.node_id);
                    }
                }
            }));
        }

        // Farmer loop: offer on matching publications.
        if self.options.farm {
            let weak: Weak<Network> = Arc::downgrade(self);
            let mut rx = self.overlay.subscribe(vec![vec![PREFIX_CONTRACT]]);
            tasks.push(tokio::spawn(async move {
                while let Some(publication) = rx.recv().await {
                    let Some(network) = weak.upgrade() else { break };
                    if let Err(e) = network.handle_publication(publication.contents).await {
                        debug!(error = %e, "Publication not offered on");
                    }
                }
            }));
        }
    }

    /// Farmer side: build and send an OFFER for a published contract.
    async fn handle_publication(&self, contents: serde_json::Value) -> Result<(), NetError> {
        let renter_contact: Contact = serde_json::from_value(
            contents
                .get("contact")
                .cloned()
                .ok_or(storj_proto::ProtoError::MissingField("contact"))?,
        )
        .map_err(storj_proto::ProtoError::from)?;
        let mut contract: Contract = serde_json::from_value(
            contents
                .get("contract")
                .cloned()
                .ok_or(storj_proto::ProtoError::MissingField("contract"))?,
        )
        .map_err(storj_proto::ProtoError::from)?;

        if renter_contact.node_id == self.node_id() {
            return Ok(());
        }

        // Never bid on a shard already held under contract with this renter.
        if let Ok(item) = self.manager.get(contract.data_hash()).await {
            if item.has_shard && item.contract_for(&renter_contact.node_id).is_some() {
                return Ok(());
            }
        }

        // Capacity check before committing to store the shard.
        let used = self.manager.size().await?;
        if used.saturating_add(contract.data_size()) > self.config.max_capacity {
            debug!(hash = %contract.data_hash(), "Publication exceeds spare capacity");
            return Ok(());
        }

        contract.set_farmer_id(self.node_id())?;
        contract.set_payment_destination(self.node_id().to_hex())?;
        contract.sign(&self.keypair, Role::Farmer)?;

        // Record the terms before offering: the renter may consign the
        // moment it accepts, racing our receipt of the countersigned copy.
        let hash = *contract.data_hash();
        let mut item = StorageItem::new(hash);
        item.add_contract(*contract.renter_id(), contract.clone());
        self.manager.put(&hash, item).await?;

        let params = serde_json::to_value(OfferParams {
            contract: contract.clone(),
        })
        .map_err(storj_proto::ProtoError::from)?;
        let offer = RpcMessage::request(RpcMethod::Offer, params);

        let response = self.transport.request(&renter_contact, offer).await?;
        let result: OfferResult = response.typed_payload()?;
        let completed = result.contract;

        completed.verify(Role::Renter, completed.renter_id())?;
        if !completed.is_complete() {
            return Err(NetError::Remote("Returned contract incomplete".to_string()));
        }

        let mut item = StorageItem::new(hash);
        item.add_contract(*completed.renter_id(), completed);
        self.manager.put(&hash, item).await?;

        info!(hash = %hash, renter = %renter_contact.node_id, "Contract accepted");
        Ok(())
    }

    /// Publishes a contract draft and waits for the first farmer to win.
    pub async fn publish_contract(&self, draft: Contract) -> Result<Contract, NetError> {
        let hash = *draft.data_hash();
        let completion = self.market.publish(hash);

        let topic = contract_topic(
            draft.data_size(),
            draft.store_end().as_millis() - draft.store_begin().as_millis(),
        );
        let contents = json!({
            "contract": draft,
            "contact": self.contact(),
        });
        self.overlay.publish(topic, contents).await?;

        match tokio::time::timeout(self.config.response_timeout, completion).await {
            Ok(Ok(contract)) => Ok(contract),
            Ok(Err(_)) | Err(_) => {
                self.market.abandon(&hash);
                Err(NetError::NoOffer)
            }
        }
    }

    /// Full renter upload: audit generation, market publication, consign,
    /// and the data-channel push with retries.
    pub async fn store_shard(
        &self,
        data: &[u8],
        audit_count: usize,
        duration: Duration,
    ) -> Result<Contract, NetError> {
        let hash = ShardHash::of(data);

        let mut audit = AuditStream::new(audit_count)?;
        audit.update(data);
        let record = audit.finalize();

        let now = Timestamp::now();
        let draft = Contract::builder()
            .renter_id(self.node_id())
            .data_size(data.len() as u64)
            .data_hash(hash)
            .store_begin(now)
            .store_end(now.add(duration))
            .audit_count(audit_count as u32)
            .build()?;

        let completed = self.publish_contract(draft).await?;
        let farmer_id = *completed
            .farmer_id()
            .ok_or(storj_proto::ProtoError::MissingField("farmer_id"))?;
        let farmer = self
            .router
            .get(&farmer_id)
            .ok_or_else(|| NetError::Remote("Farmer contact unknown".to_string()))?;

        self.save_audit_state(hash, farmer_id, &record).await?;

        let leaves: Vec<String> = record
            .public_record()
            .iter()
            .map(hex::encode)
            .collect();
        let token = self.consign(&farmer, hash, leaves).await?;

        let mut attempt = 0;
        loop {
            match DataChannelClient::push(&farmer.socket_addr(), &token, hash, data).await {
                Ok(()) => break,
                Err(e) if attempt < self.config.transfer_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "Shard push failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(completed)
    }

    async fn save_audit_state(
        &self,
        hash: ShardHash,
        farmer_id: NodeId,
        record: &AuditRecord,
    ) -> Result<(), NetError> {
        let private = record.private_record();
        let mut item = StorageItem::new(hash);
        item.challenges.insert(farmer_id, private.challenges);
        item.trees.insert(
            farmer_id,
            record.public_record().iter().map(hex::encode).collect(),
        );
        item.meta.insert(
            farmer_id,
            json!({
                "root": hex::encode(private.root),
                "depth": private.depth,
            }),
        );
        self.manager.put(&hash, item).await?;
        Ok(())
    }

    /// CONSIGN: hand the audit leaves to the farmer, get a PUSH token.
    pub async fn consign(
        &self,
        farmer: &Contact,
        hash: ShardHash,
        audit_tree: Vec<String>,
    ) -> Result<String, NetError> {
        let params = serde_json::to_value(ConsignParams {
            data_hash: hash,
            audit_tree,
        })
        .map_err(storj_proto::ProtoError::from)?;
        let request = RpcMessage::request(RpcMethod::Consign, params);
        let response = self.transport.request(farmer, request).await?;
        let result: ConsignResult = response.typed_payload()?;
        Ok(result.token)
    }

    /// RETRIEVE: pull a shard back from a farmer and verify its hash.
    pub async fn retrieve_shard(
        &self,
        farmer: &Contact,
        hash: ShardHash,
    ) -> Result<Vec<u8>, NetError> {
        let params = serde_json::to_value(RetrieveParams { data_hash: hash })
            .map_err(storj_proto::ProtoError::from)?;
        let request = RpcMessage::request(RpcMethod::Retrieve, params);
        let response = self.transport.request(farmer, request).await?;
        let result: RetrieveResult = response.typed_payload()?;

        Ok(DataChannelClient::pull(&farmer.socket_addr(), &result.token, hash).await?)
    }

    /// AUDIT: consume one challenge and verify the farmer's proof.
    ///
    /// Returns true when the proof reduces to the stored root.
    pub async fn audit_shard(&self, hash: ShardHash, farmer_id: NodeId) -> Result<bool, NetError> {
        let farmer = self
            .router
            .get(&farmer_id)
            .ok_or_else(|| NetError::Remote("Farmer contact unknown".to_string()))?;

        let mut item = self.manager.get(&hash).await?;
        let challenge = item
            .take_challenge(&farmer_id)
            .ok_or(storj_audit::AuditError::UnknownChallenge)?;

        let meta = item
            .meta
            .get(&farmer_id)
            .cloned()
            .ok_or_else(|| NetError::Remote("No audit state for farmer".to_string()))?;
        let root = meta
            .get("root")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| hex::decode(s).ok())
            .filter(|b| b.len() == 20)
            .ok_or_else(|| NetError::Remote("No audit state for farmer".to_string()))?;
        let depth = meta
            .get("depth")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| NetError::Remote("No audit state for farmer".to_string()))?;
        let mut expected_root = [0u8; 20];
        expected_root.copy_from_slice(&root);

        // Persist the consumed challenge before the round trip.
        self.manager.put(&hash, item.clone()).await?;

        let params = serde_json::to_value(AuditParams {
            data_hash: hash,
            challenge,
        })
        .map_err(storj_proto::ProtoError::from)?;
        let request = RpcMessage::request(RpcMethod::Audit, params);
        let response = self.transport.request(&farmer, request).await?;
        let result: AuditResult = response.typed_payload()?;

        let (computed, expected) = verify_proof(&result.proof, &expected_root, depth as usize)?;
        Ok(computed == expected)
    }

    /// MIRROR: instruct a farmer to replicate a shard from another farmer.
    pub async fn mirror_shard(
        &self,
        target: &Contact,
        source: &Contact,
        hash: ShardHash,
    ) -> Result<(), NetError> {
        // A PULL token at the source authorizes the target's transfer.
        let params = serde_json::to_value(RetrieveParams { data_hash: hash })
            .map_err(storj_proto::ProtoError::from)?;
        let request = RpcMessage::request(RpcMethod::Retrieve, params);
        let response = self.transport.request(source, request).await?;
        let result: RetrieveResult = response.typed_payload()?;

        let params = serde_json::to_value(MirrorParams {
            data_hash: hash,
            token: result.token,
            farmer: source.clone(),
        })
        .map_err(storj_proto::ProtoError::from)?;
        let request = RpcMessage::request(RpcMethod::Mirror, params);
        self.transport.request(target, request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::LocalOverlay;
    use storj_store::MemoryAdapter;

    #[tokio::test]
    async fn test_create_binds_and_advertises() {
        let network = Network::create(
            KeyPair::generate(),
            Arc::new(MemoryAdapter::new()),
            Arc::new(LocalOverlay::new()),
            Config {
                allow_loopback: true,
                ..Config::default()
            },
            NetworkOptions {
                listen_addr: "127.0.0.1:0".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let contact = network.contact();
        assert!(contact.port > 1);
        assert_eq!(contact.node_id, network.node_id());

        network.leave().await;
    }

    #[tokio::test]
    async fn test_join_without_seeds_is_standalone() {
        let network = Network::create(
            KeyPair::generate(),
            Arc::new(MemoryAdapter::new()),
            Arc::new(LocalOverlay::new()),
            Config {
                allow_loopback: true,
                ..Config::default()
            },
            NetworkOptions {
                listen_addr: "127.0.0.1:0".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        network.join().await.unwrap();
        assert!(network.router().is_empty());
        network.leave().await;
    }
}
