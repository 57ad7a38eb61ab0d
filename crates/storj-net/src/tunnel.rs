//! Tunnel subsystem for NAT-bound peers.
//!
//! A publicly reachable node offers relay slots and announces availability
//! on the tunneler topic. A node that fails its reachability probe finds
//! tunnelers through its neighbours and opens a slot; from then on it
//! advertises the alias the tunneler handed out. State changes flow to the
//! network facade over an event channel, so the tunnel layer never holds a
//! reference back into the facade.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use storj_core::NodeId;
use storj_proto::{
    FindTunnelResult, OpenTunnelResult, ProbeResult, RpcMessage, RpcMethod,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::transport::RpcTransport;
use crate::{NetError, DEFAULT_K};

/// Tunnel state changes the facade reacts to.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A relay slot opened; the node should advertise the alias.
    Established {
        /// Relay endpoint kept open by the client.
        tunnel: String,
        /// Publicly reachable contact to advertise.
        alias: storj_proto::Contact,
    },
    /// The relay went away; the facade should re-establish or re-join.
    Lost,
}

/// Relay-slot bookkeeping on a publicly reachable node.
///
/// A node acting as a tunnel client sets its own slot count to zero: it
/// may not relay for others while relayed itself.
pub struct TunnelServer {
    max_slots: usize,
    slots: Mutex<HashMap<NodeId, storj_proto::Contact>>,
}

impl TunnelServer {
    /// Creates the server with a slot budget.
    pub fn new(max_slots: usize) -> Self {
        Self {
            max_slots,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true while slots remain.
    pub fn is_available(&self) -> bool {
        self.max_slots > 0 && self.slots.lock().len() < self.max_slots
    }

    /// Returns the number of occupied slots.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Grants a relay slot to a client, if any remain.
    ///
    /// The alias points at this node's public address with the client's
    /// identity, so peers dial the relay and reach the client.
    pub fn open(
        &self,
        client: &storj_proto::Contact,
        local: &storj_proto::Contact,
    ) -> Option<OpenTunnelResult> {
        let mut slots = self.slots.lock();
        if self.max_slots == 0 || slots.len() >= self.max_slots {
            if !slots.contains_key(&client.node_id) {
                return None;
            }
        }
        slots.insert(client.node_id, client.clone());

        let alias = storj_proto::Contact {
            address: local.address.clone(),
            port: local.port,
            node_id: client.node_id,
            protocol: client.protocol.clone(),
            last_seen: storj_core::Timestamp::now(),
        };
        info!(client = %client.node_id, "Opened tunnel slot");
        Some(OpenTunnelResult {
            tunnel: format!("ws://{}:{}/tun/{}", local.address, local.port, client.node_id),
            alias,
        })
    }

    /// Releases a client's slot.
    pub fn close(&self, node_id: &NodeId) {
        if self.slots.lock().remove(node_id).is_some() {
            debug!(client = %node_id, "Closed tunnel slot");
        }
    }
}

/// Client side: reachability probing and tunnel establishment.
pub struct TunnelClient {
    transport: Arc<dyn RpcTransport>,
    events: mpsc::Sender<TunnelEvent>,
}

impl TunnelClient {
    /// Creates the client; events flow to the network facade.
    pub fn new(transport: Arc<dyn RpcTransport>, events: mpsc::Sender<TunnelEvent>) -> Self {
        Self { transport, events }
    }

    /// Asks a seed to probe us back; true means publicly reachable.
    pub async fn probe(&self, seed: &storj_proto::Contact) -> bool {
        let request = RpcMessage::request(RpcMethod::Probe, json!({}));
        match self.transport.request(seed, request).await {
            Ok(response) => response.typed_payload::<ProbeResult>().is_ok(),
            Err(e) => {
                debug!(seed = %seed.node_id, error = %e, "Probe failed");
                false
            }
        }
    }

    /// Finds tunnelers via neighbours and opens the first available slot.
    pub async fn establish(
        &self,
        neighbours: &[storj_proto::Contact],
    ) -> Result<OpenTunnelResult, NetError> {
        let mut tunnelers = Vec::new();
        for neighbour in neighbours {
            let request = RpcMessage::request(RpcMethod::FindTunnel, json!({}));
            match self.transport.request(neighbour, request).await {
                Ok(response) => {
                    if let Ok(result) = response.typed_payload::<FindTunnelResult>() {
                        for tunneler in result.tunnels {
                            if !tunnelers
                                .iter()
                                .any(|t: &storj_proto::Contact| t.node_id == tunneler.node_id)
                            {
                                tunnelers.push(tunneler);
                            }
                        }
                    }
                }
                Err(e) => debug!(neighbour = %neighbour.node_id, error = %e, "FIND_TUNNEL failed"),
            }
            if tunnelers.len() >= DEFAULT_K {
                break;
            }
        }

        for tunneler in &tunnelers {
            let request = RpcMessage::request(RpcMethod::OpenTunnel, json!({}));
            match self.transport.request(tunneler, request).await {
                Ok(response) => match response.typed_payload::<OpenTunnelResult>() {
                    Ok(result) => {
                        info!(tunneler = %tunneler.node_id, alias = %result.alias, "Tunnel established");
                        let _ = self
                            .events
                            .send(TunnelEvent::Established {
                                tunnel: result.tunnel.clone(),
                                alias: result.alias.clone(),
                            })
                            .await;
                        return Ok(result);
                    }
                    Err(e) => warn!(tunneler = %tunneler.node_id, error = %e, "Malformed OPEN_TUNNEL result"),
                },
                Err(e) => debug!(tunneler = %tunneler.node_id, error = %e, "OPEN_TUNNEL refused"),
            }
        }

        let _ = self.events.send(TunnelEvent::Lost).await;
        Err(NetError::NoTunnelAvailable)
    }
}
