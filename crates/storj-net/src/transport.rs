//! Signed RPC transport over TCP.
//!
//! Messages travel as length-prefixed JSON, one request per connection.
//! The transport stamps the envelope on egress and verifies it on ingress;
//! the server-side dispatcher additionally rate-limits and feeds the
//! routing table before any handler runs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use storj_core::{Config, KeyPair, Timestamp};
use storj_proto::{verify_envelope, Contact, RpcMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::handlers::Protocols;
use crate::limiter::RateLimiter;
use crate::routing::RoutingTable;
use crate::NetError;

/// Upper bound for one RPC frame.
const MAX_FRAME: u32 = 4 * 1024 * 1024;

/// Writes one length-prefixed JSON message.
pub(crate) async fn write_message(
    stream: &mut TcpStream,
    message: &RpcMessage,
) -> Result<(), NetError> {
    let encoded = serde_json::to_vec(message)?;
    stream.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame as raw bytes.
pub(crate) async fn read_raw_frame(stream: &mut TcpStream) -> Result<Vec<u8>, NetError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(NetError::Remote(format!("Frame too large: {len}")));
    }

    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads one length-prefixed JSON message.
pub(crate) async fn read_message(stream: &mut TcpStream) -> Result<RpcMessage, NetError> {
    let buf = read_raw_frame(stream).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Outbound request surface.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Sends a request to a contact and awaits the verified response.
    async fn request(&self, target: &Contact, message: RpcMessage) -> Result<RpcMessage, NetError>;

    /// Returns the contact this node currently advertises.
    fn local_contact(&self) -> Contact;
}

/// TCP client transport.
pub struct TcpRpcTransport {
    keypair: Arc<KeyPair>,
    contact: Arc<RwLock<Contact>>,
    response_timeout: Duration,
    nonce_expire: Duration,
}

impl TcpRpcTransport {
    /// Creates the transport for a node identity and advertised contact.
    pub fn new(keypair: Arc<KeyPair>, contact: Arc<RwLock<Contact>>, config: &Config) -> Self {
        Self {
            keypair,
            contact,
            response_timeout: config.response_timeout,
            nonce_expire: config.nonce_expire,
        }
    }
}

#[async_trait]
impl RpcTransport for TcpRpcTransport {
    async fn request(&self, target: &Contact, message: RpcMessage) -> Result<RpcMessage, NetError> {
        let mut message = message;
        let local = { self.contact.read().clone() };
        message.stamp(&self.keypair, &local)?;

        let request_id = message.id.clone();
        let addr = target.socket_addr();

        let exchange = async {
            let mut stream = TcpStream::connect(&addr).await?;
            write_message(&mut stream, &message).await?;
            read_message(&mut stream).await
        };

        let response = tokio::time::timeout(self.response_timeout, exchange)
            .await
            .map_err(|_| NetError::Timeout)??;

        if response.id != request_id {
            return Err(NetError::Remote("Mismatched response id".to_string()));
        }

        let envelope = response.envelope()?;
        verify_envelope(&response.id, &envelope, self.nonce_expire)?;
        if envelope.contact.node_id != target.node_id {
            return Err(storj_proto::ProtoError::IdentityMismatch.into());
        }

        if let Some(error) = response.error_message() {
            return Err(NetError::Remote(error.to_string()));
        }
        Ok(response)
    }

    fn local_contact(&self) -> Contact {
        self.contact.read().clone()
    }
}

/// Server-side middleware pipeline in front of the protocol handlers.
pub struct Dispatcher {
    keypair: Arc<KeyPair>,
    contact: Arc<RwLock<Contact>>,
    limiter: RateLimiter,
    router: Arc<RoutingTable>,
    protocols: Arc<Protocols>,
    nonce_expire: Duration,
    activity: Arc<AtomicI64>,
}

impl Dispatcher {
    /// Wires the pipeline.
    pub fn new(
        keypair: Arc<KeyPair>,
        contact: Arc<RwLock<Contact>>,
        router: Arc<RoutingTable>,
        protocols: Arc<Protocols>,
        config: &Config,
    ) -> Self {
        Self {
            keypair,
            contact,
            limiter: RateLimiter::new(config.rate_limit_capacity, config.rate_limit_window),
            router,
            protocols,
            nonce_expire: config.nonce_expire,
            activity: Arc::new(AtomicI64::new(Timestamp::now().as_millis())),
        }
    }

    /// Shared last-activity clock, read by the reentry timer.
    pub fn activity(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.activity)
    }

    fn stamped(&self, mut response: RpcMessage) -> Option<RpcMessage> {
        let local = { self.contact.read().clone() };
        match response.stamp(&self.keypair, &local) {
            Ok(()) => Some(response),
            Err(e) => {
                warn!(error = %e, "Failed to stamp response");
                None
            }
        }
    }

    /// Runs one inbound request through the pipeline.
    ///
    /// Returns `None` when the request is dropped (signature failure or a
    /// stray response frame).
    pub async fn handle(&self, message: RpcMessage) -> Option<RpcMessage> {
        self.activity
            .store(Timestamp::now().as_millis(), Ordering::Relaxed);

        let method = message.method()?;

        let envelope = match message.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Request without a parseable envelope");
                return self.stamped(RpcMessage::error_response(
                    message.id.clone(),
                    "Invalid message envelope",
                ));
            }
        };

        // Verify the envelope. Exempt methods tolerate failure because they
        // exist to establish verifiability; everyone else is dropped.
        let verified = verify_envelope(&message.id, &envelope, self.nonce_expire).is_ok();
        if !verified && !method.is_exempt() {
            debug!(method = ?method, sender = %envelope.contact.node_id, "Dropping unverified request");
            return None;
        }

        if let Err(wait) = self.limiter.try_request(&envelope.contact.node_id) {
            return self.stamped(RpcMessage::error_response(
                message.id.clone(),
                format!("RateLimitExceeded, retry in {}s", wait.as_secs().max(1)),
            ));
        }

        // Only verified senders enter the routing table.
        if verified {
            self.router.insert(envelope.contact.clone());
        }

        let response = match self
            .protocols
            .dispatch(method, &message, &envelope.contact)
            .await
        {
            Ok(result) => RpcMessage::response(message.id.clone(), result),
            Err(e) => RpcMessage::error_response(message.id.clone(), e.to_string()),
        };
        self.stamped(response)
    }
}

/// TCP listener serving both RPC and data-channel sessions on one port.
///
/// The first frame decides the session kind: a `{token, hash, operation}`
/// control frame opens a data channel, anything else is an RPC message.
/// Contacts therefore advertise a single port.
pub struct RpcServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<storj_store::ShardManager>,
    tokens: Arc<crate::channel::TokenStore>,
}

impl RpcServer {
    /// Binds the server.
    pub async fn bind(
        addr: &str,
        dispatcher: Arc<Dispatcher>,
        manager: Arc<storj_store::ShardManager>,
        tokens: Arc<crate::channel::TokenStore>,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatcher,
            manager,
            tokens,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, NetError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (mut stream, peer) = match self.listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };

                let dispatcher = Arc::clone(&self.dispatcher);
                let manager = Arc::clone(&self.manager);
                let tokens = Arc::clone(&self.tokens);
                tokio::spawn(async move {
                    let frame = match read_raw_frame(&mut stream).await {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "Unreadable frame");
                            return;
                        }
                    };

                    // Data-channel control frames carry token + operation.
                    if let Ok(control) =
                        serde_json::from_slice::<storj_proto::ChannelFrame>(&frame)
                    {
                        if let Err(e) =
                            crate::channel::serve_with_frame(manager, tokens, stream, control)
                                .await
                        {
                            debug!(peer = %peer, error = %e, "Data channel ended with error");
                        }
                        return;
                    }

                    let message: RpcMessage = match serde_json::from_slice(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "Unreadable RPC frame");
                            return;
                        }
                    };

                    if let Some(response) = dispatcher.handle(message).await {
                        if let Err(e) = write_message(&mut stream, &response).await {
                            debug!(peer = %peer, error = %e, "Failed to write response");
                        }
                    }
                });
            }
        })
    }
}
