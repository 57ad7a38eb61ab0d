//! Protocol handlers.
//!
//! One hub owns the server-side state machine for every method: the farmer
//! half of the contract market (CONSIGN/RETRIEVE/AUDIT/MIRROR), the renter
//! half (OFFER), reachability (PROBE), tunneling (FIND_TUNNEL/OPEN_TUNNEL),
//! and the thin overlay primitives (FIND_NODE/STORE/FIND_VALUE/PUBLISH).

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde_json::{json, Value};
use storj_audit::ProofStream;
use storj_core::{Config, KeyPair, Timestamp};
use storj_proto::{
    AuditParams, AuditResult, ConsignParams, ConsignResult, Contact, FindTunnelResult,
    MirrorParams, OfferParams, OfferResult, Operation, ProbeResult, PublishParams, RetrieveParams,
    RetrieveResult, Role, RpcMessage, RpcMethod,
};
use storj_store::{ShardManager, StorageItem, StoreError};
use tracing::{debug, info, warn};

use crate::channel::{DataChannelClient, TokenStore};
use crate::market::Market;
use crate::overlay::{Overlay, Publication};
use crate::routing::RoutingTable;
use crate::transport::RpcTransport;
use crate::tunnel::TunnelServer;
use crate::{NetError, DEFAULT_K};

/// Server-side protocol handler hub.
pub struct Protocols {
    keypair: Arc<KeyPair>,
    contact: Arc<RwLock<Contact>>,
    manager: Arc<ShardManager>,
    tokens: Arc<TokenStore>,
    market: Arc<Market>,
    router: Arc<RoutingTable>,
    tunnel_server: Arc<TunnelServer>,
    overlay: Arc<dyn Overlay>,
    transport: OnceLock<Arc<dyn RpcTransport>>,
    config: Config,
}

impl Protocols {
    /// Wires the hub.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: Arc<KeyPair>,
        contact: Arc<RwLock<Contact>>,
        manager: Arc<ShardManager>,
        tokens: Arc<TokenStore>,
        market: Arc<Market>,
        router: Arc<RoutingTable>,
        tunnel_server: Arc<TunnelServer>,
        overlay: Arc<dyn Overlay>,
        config: Config,
    ) -> Self {
        Self {
            keypair,
            contact,
            manager,
            tokens,
            market,
            router,
            tunnel_server,
            overlay,
            transport: OnceLock::new(),
            config,
        }
    }

    /// Injects the outbound transport once the facade has built it.
    ///
    /// PROBE needs to originate a reverse request; injecting late keeps the
    /// handler hub free of a construction cycle with the transport.
    pub fn set_transport(&self, transport: Arc<dyn RpcTransport>) {
        let _ = self.transport.set(transport);
    }

    fn transport(&self) -> Result<&Arc<dyn RpcTransport>, NetError> {
        self.transport
            .get()
            .ok_or_else(|| NetError::Remote("Transport not ready".to_string()))
    }

    /// Dispatches one verified request to its handler.
    pub async fn dispatch(
        &self,
        method: RpcMethod,
        message: &RpcMessage,
        sender: &Contact,
    ) -> Result<Value, NetError> {
        match method {
            RpcMethod::Ping => Ok(json!({})),
            RpcMethod::Probe => self.on_probe(sender).await,
            RpcMethod::Offer => self.on_offer(message, sender).await,
            RpcMethod::Consign => self.on_consign(message, sender).await,
            RpcMethod::Retrieve => self.on_retrieve(message, sender).await,
            RpcMethod::Audit => self.on_audit(message, sender).await,
            RpcMethod::Mirror => self.on_mirror(message, sender).await,
            RpcMethod::FindTunnel => self.on_find_tunnel(),
            RpcMethod::OpenTunnel => self.on_open_tunnel(sender),
            RpcMethod::FindNode => self.on_find_node(message),
            RpcMethod::Store => self.on_store(message).await,
            RpcMethod::FindValue => self.on_find_value(message).await,
            RpcMethod::Publish => self.on_publish(message).await,
            RpcMethod::Subscribe => Ok(json!({})),
        }
    }

    /// OFFER: a farmer bids on one of our published contracts.
    async fn on_offer(&self, message: &RpcMessage, sender: &Contact) -> Result<Value, NetError> {
        let params: OfferParams = message.typed_payload()?;
        let mut contract = params.contract;

        let farmer_id = *contract
            .farmer_id()
            .ok_or(storj_proto::ProtoError::MissingField("farmer_id"))?;
        if farmer_id != sender.node_id {
            return Err(storj_proto::ProtoError::IdentityMismatch.into());
        }
        if *contract.renter_id() != *self.keypair.node_id() {
            return Err(storj_proto::ProtoError::IdentityMismatch.into());
        }
        contract.verify(Role::Farmer, &farmer_id)?;

        // First offer wins; the market hands out the completion channel
        // exactly once per publication.
        let winner = self.market.settle(contract.data_hash())?;

        contract.sign(&self.keypair, Role::Renter)?;

        let hash = *contract.data_hash();
        let mut item = StorageItem::new(hash);
        item.add_contract(farmer_id, contract.clone());
        self.manager.put(&hash, item).await?;

        info!(farmer = %farmer_id, hash = %hash, "Offer accepted");
        let _ = winner.send(contract.clone());

        Ok(serde_json::to_value(OfferResult { contract }).map_err(storj_proto::ProtoError::from)?)
    }

    /// CONSIGN: the renter hands over audit leaves and asks for a PUSH token.
    async fn on_consign(&self, message: &RpcMessage, sender: &Contact) -> Result<Value, NetError> {
        let params: ConsignParams = message.typed_payload()?;

        let item = self.manager.get(&params.data_hash).await.map_err(|e| {
            match e {
                StoreError::NotFound(_) => NetError::Remote("ContractUnknown".to_string()),
                other => other.into(),
            }
        })?;
        let contract = item
            .contract_for(&sender.node_id)
            .ok_or_else(|| NetError::Remote("ContractUnknown".to_string()))?
            .clone();

        if item.has_shard {
            return Err(NetError::Remote("Shard already received".to_string()));
        }

        // Record the public leaves for later audits.
        let mut update = StorageItem::new(params.data_hash);
        update.trees.insert(sender.node_id, params.audit_tree);
        self.manager.put(&params.data_hash, update).await?;

        // Idempotent re-issue while the shard has not arrived.
        let token = self
            .tokens
            .existing(Operation::Push, &params.data_hash)
            .unwrap_or_else(|| self.tokens.issue_for_contract(Operation::Push, &contract));

        debug!(hash = %params.data_hash, renter = %sender.node_id, "Consignment accepted");
        Ok(serde_json::to_value(ConsignResult { token: token.value })
            .map_err(storj_proto::ProtoError::from)?)
    }

    /// RETRIEVE: the renter asks for a PULL token.
    async fn on_retrieve(&self, message: &RpcMessage, sender: &Contact) -> Result<Value, NetError> {
        let params: RetrieveParams = message.typed_payload()?;

        let item = self.manager.get(&params.data_hash).await.map_err(|e| {
            match e {
                StoreError::NotFound(_) => NetError::Remote("ContractUnknown".to_string()),
                other => other.into(),
            }
        })?;
        let contract = item
            .contract_for(&sender.node_id)
            .ok_or_else(|| NetError::Remote("ContractUnknown".to_string()))?;

        if !item.has_shard {
            return Err(NetError::Remote("ShardNotFound".to_string()));
        }

        let token = self.tokens.issue_for_contract(Operation::Pull, contract);
        Ok(serde_json::to_value(RetrieveResult { token: token.value })
            .map_err(storj_proto::ProtoError::from)?)
    }

    /// AUDIT: prove we still hold every byte of the shard.
    async fn on_audit(&self, message: &RpcMessage, sender: &Contact) -> Result<Value, NetError> {
        let params: AuditParams = message.typed_payload()?;

        let item = self.manager.get(&params.data_hash).await.map_err(|e| {
            match e {
                StoreError::NotFound(_) => NetError::Remote("ContractUnknown".to_string()),
                other => other.into(),
            }
        })?;
        let leaves = item
            .tree_for(&sender.node_id)
            .ok_or(storj_audit::AuditError::UnknownChallenge)?;

        let mut prover = ProofStream::new(leaves, &params.challenge);
        let mut source = self.manager.open_source(&params.data_hash).await?;
        while let Some(chunk) = source.next_chunk().await? {
            prover.update(&chunk);
        }
        let proof = prover.finalize()?;

        debug!(hash = %params.data_hash, renter = %sender.node_id, "Audit answered");
        Ok(serde_json::to_value(AuditResult { proof }).map_err(storj_proto::ProtoError::from)?)
    }

    /// MIRROR: replicate a shard from another farmer under our contract.
    async fn on_mirror(&self, message: &RpcMessage, sender: &Contact) -> Result<Value, NetError> {
        let params: MirrorParams = message.typed_payload()?;

        let item = self.manager.get(&params.data_hash).await.map_err(|e| {
            match e {
                StoreError::NotFound(_) => NetError::Remote("ContractUnknown".to_string()),
                other => other.into(),
            }
        })?;
        let contract = item
            .contract_for(&sender.node_id)
            .ok_or_else(|| NetError::Remote("ContractUnknown".to_string()))?
            .clone();

        if item.has_shard {
            return Ok(json!({}));
        }

        let data = DataChannelClient::pull(
            &params.farmer.socket_addr(),
            &params.token,
            params.data_hash,
        )
        .await?;

        let mut sink = self
            .manager
            .open_sink(&params.data_hash, contract.data_size())
            .await?;
        sink.write(&data).await?;
        sink.commit().await?;

        info!(hash = %params.data_hash, source = %params.farmer.node_id, "Shard mirrored");
        Ok(json!({}))
    }

    /// PROBE: dial the sender back to prove it is reachable.
    async fn on_probe(&self, sender: &Contact) -> Result<Value, NetError> {
        let transport = self.transport()?;
        let ping = RpcMessage::request(RpcMethod::Ping, json!({}));
        match transport.request(sender, ping).await {
            Ok(_) => Ok(serde_json::to_value(ProbeResult::default())
                .map_err(storj_proto::ProtoError::from)?),
            Err(e) => {
                debug!(target = %sender.node_id, error = %e, "Reverse probe failed");
                Err(NetError::Remote("Probe failed".to_string()))
            }
        }
    }

    /// FIND_TUNNEL: hand out known tunnelers.
    fn on_find_tunnel(&self) -> Result<Value, NetError> {
        let tunnels = self.router.tunnelers(DEFAULT_K);
        Ok(serde_json::to_value(FindTunnelResult { tunnels })
            .map_err(storj_proto::ProtoError::from)?)
    }

    /// OPEN_TUNNEL: grant a relay slot if any remain.
    fn on_open_tunnel(&self, sender: &Contact) -> Result<Value, NetError> {
        let local = { self.contact.read().clone() };
        match self.tunnel_server.open(sender, &local) {
            Some(result) => {
                Ok(serde_json::to_value(result).map_err(storj_proto::ProtoError::from)?)
            }
            None => Err(NetError::NoTunnelAvailable),
        }
    }

    /// FIND_NODE: closest known contacts to a key.
    fn on_find_node(&self, message: &RpcMessage) -> Result<Value, NetError> {
        let key = message
            .payload()
            .get("key")
            .and_then(Value::as_str)
            .and_then(|s| storj_core::NodeId::from_hex(s).ok())
            .ok_or(storj_proto::ProtoError::MissingField("key"))?;
        let nodes = self.router.closest(&key, DEFAULT_K);
        Ok(json!({ "nodes": nodes }))
    }

    /// STORE: keep an overlay record.
    async fn on_store(&self, message: &RpcMessage) -> Result<Value, NetError> {
        let key = message
            .payload()
            .get("key")
            .and_then(Value::as_str)
            .ok_or(storj_proto::ProtoError::MissingField("key"))?
            .to_string();
        let value = message
            .payload()
            .get("value")
            .cloned()
            .ok_or(storj_proto::ProtoError::MissingField("value"))?;
        self.overlay.store_record(key, value).await?;
        Ok(json!({}))
    }

    /// FIND_VALUE: record if held, closer nodes otherwise.
    async fn on_find_value(&self, message: &RpcMessage) -> Result<Value, NetError> {
        let key = message
            .payload()
            .get("key")
            .and_then(Value::as_str)
            .ok_or(storj_proto::ProtoError::MissingField("key"))?;

        if let Some(value) = self.overlay.find_record(key).await {
            return Ok(json!({ "value": value }));
        }
        let target = storj_core::NodeId::from_hex(key)
            .unwrap_or_else(|_| *self.router.local_id());
        Ok(json!({ "nodes": self.router.closest(&target, DEFAULT_K) }))
    }

    /// PUBLISH: relay a publication into the local overlay.
    async fn on_publish(&self, message: &RpcMessage) -> Result<Value, NetError> {
        let params: PublishParams = message.typed_payload()?;
        let topic = storj_proto::Topic::from_hex(&params.topic)
            .map_err(|_| storj_proto::ProtoError::MissingField("topic"))?;

        self.overlay
            .relay(Publication {
                uuid: params.uuid,
                topic,
                contents: params.contents,
            })
            .await?;
        Ok(json!({}))
    }

    /// Reaps expired tokens and shards; run from the facade's maintenance
    /// loop.
    pub async fn maintenance(&self) {
        self.tokens.reap();
        if let Err(e) = self.manager.clean_expired(Timestamp::now()).await {
            warn!(error = %e, "Expired-shard cleanup failed");
        }
    }

    /// The node's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}
