//! Shard data channels.
//!
//! A data channel is a dedicated TCP stream, out of band from RPC, moving
//! exactly one shard in one direction. The client opens with a JSON control
//! frame `{token, hash, operation}`; the server validates the token and then
//! raw shard bytes flow. PUSH uploads verify the running content hash before
//! anything becomes visible in the store; a mismatch discards the shard and
//! leaves the token unconsumed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use storj_core::{Hash160Hasher, ShardHash, Timestamp};
use storj_proto::{ChannelFrame, Contract, Operation, Token};
use storj_store::{ShardManager, StoreError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Transfer chunk size.
const CHUNK: usize = 64 * 1024;

/// Upper bound for a control frame.
const MAX_CONTROL_FRAME: u32 = 64 * 1024;

/// Data channel failures, wire-visible by name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Token unknown, consumed, in flight, or bound to another operation.
    #[error("InvalidToken")]
    InvalidToken,

    /// Token TTL has passed.
    #[error("TokenExpired")]
    TokenExpired,

    /// Streamed bytes do not hash to the announced shard hash.
    #[error("HashMismatch")]
    HashMismatch,

    /// No contract covers the shard on this farmer.
    #[error("ContractUnknown")]
    ContractUnknown,

    /// The shard bytes are not held.
    #[error("ShardNotFound")]
    ShardNotFound,

    /// The farmer cannot accept more bytes.
    #[error("StorageFull")]
    StorageFull,

    /// The stream ended mid-transfer.
    #[error("ChannelClosed")]
    ChannelClosed,

    /// The server reported an unrecognized failure.
    #[error("Remote channel error: {0}")]
    Remote(String),

    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Control frame (de)serialization failure.
    #[error("Frame error: {0}")]
    Frame(String),
}

impl ChannelError {
    fn from_name(name: &str) -> Self {
        match name {
            "InvalidToken" => ChannelError::InvalidToken,
            "TokenExpired" => ChannelError::TokenExpired,
            "HashMismatch" => ChannelError::HashMismatch,
            "ContractUnknown" => ChannelError::ContractUnknown,
            "ShardNotFound" => ChannelError::ShardNotFound,
            "StorageFull" => ChannelError::StorageFull,
            "ChannelClosed" => ChannelError::ChannelClosed,
            other => ChannelError::Remote(other.to_string()),
        }
    }

    fn name(&self) -> String {
        self.to_string()
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        ChannelError::Frame(e.to_string())
    }
}

/// Result frame exchanged after the control frame and after a PUSH body.
#[derive(Debug, Serialize, Deserialize)]
struct ChannelAck {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ChannelAck {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn err(error: &ChannelError) -> Self {
        Self {
            ok: false,
            error: Some(error.name()),
        }
    }

    fn into_result(self) -> Result<(), ChannelError> {
        if self.ok {
            Ok(())
        } else {
            Err(ChannelError::from_name(self.error.as_deref().unwrap_or("")))
        }
    }
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, frame: &T) -> Result<(), ChannelError> {
    let encoded = serde_json::to_vec(frame)?;
    stream.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut TcpStream,
) -> Result<T, ChannelError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_CONTROL_FRAME {
        return Err(ChannelError::Frame(format!("Frame too large: {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

struct IssuedToken {
    token: Token,
    expected_size: u64,
    in_flight: bool,
    consumed: bool,
}

/// Issued data-channel tokens and their transfer state.
///
/// PUSH tokens are single-use: consumed on a successful upload. PULL tokens
/// stay valid within their TTL. Either kind admits at most one in-flight
/// transfer at a time.
pub struct TokenStore {
    ttl: Duration,
    tokens: Mutex<HashMap<String, IssuedToken>>,
}

impl TokenStore {
    /// Creates a store issuing tokens with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a fresh token scoped to a shard.
    pub fn issue(&self, operation: Operation, data_hash: ShardHash, expected_size: u64) -> Token {
        self.register(Token::issue(operation, data_hash, self.ttl), expected_size)
    }

    /// Issues a fresh token under a contract: scope, expected size, and
    /// contract id all come from the agreement.
    pub fn issue_for_contract(&self, operation: Operation, contract: &Contract) -> Token {
        let mut token = Token::issue(operation, *contract.data_hash(), self.ttl);
        if let Ok(id) = contract.contract_id() {
            token = token.for_contract(id);
        }
        self.register(token, contract.data_size())
    }

    fn register(&self, token: Token, expected_size: u64) -> Token {
        self.tokens.lock().insert(
            token.value.clone(),
            IssuedToken {
                token: token.clone(),
                expected_size,
                in_flight: false,
                consumed: false,
            },
        );
        token
    }

    /// Returns an already issued, still-usable token for the shard, making
    /// re-consignment idempotent.
    pub fn existing(&self, operation: Operation, data_hash: &ShardHash) -> Option<Token> {
        let now = Timestamp::now();
        self.tokens
            .lock()
            .values()
            .find(|t| {
                t.token.operation == operation
                    && t.token.data_hash == *data_hash
                    && !t.consumed
                    && !t.token.is_expired(now)
            })
            .map(|t| t.token.clone())
    }

    /// Validates a control frame and marks the token in flight.
    pub fn begin(&self, frame: &ChannelFrame) -> Result<u64, ChannelError> {
        let now = Timestamp::now();
        let mut tokens = self.tokens.lock();
        let issued = tokens
            .get_mut(&frame.token)
            .ok_or(ChannelError::InvalidToken)?;

        if issued.consumed || issued.in_flight {
            return Err(ChannelError::InvalidToken);
        }
        if issued.token.is_expired(now) {
            return Err(ChannelError::TokenExpired);
        }
        if issued.token.operation != frame.operation {
            return Err(ChannelError::InvalidToken);
        }
        if issued.token.data_hash != frame.hash {
            return Err(ChannelError::HashMismatch);
        }

        issued.in_flight = true;
        Ok(issued.expected_size)
    }

    /// Ends a transfer; `consume` retires the token (successful PUSH).
    pub fn finish(&self, value: &str, consume: bool) {
        let mut tokens = self.tokens.lock();
        if consume {
            tokens.remove(value);
        } else if let Some(issued) = tokens.get_mut(value) {
            issued.in_flight = false;
        }
    }

    /// Revokes a token outright.
    pub fn revoke(&self, value: &str) {
        self.tokens.lock().remove(value);
    }

    /// Drops expired tokens.
    pub fn reap(&self) {
        let now = Timestamp::now();
        self.tokens.lock().retain(|_, t| !t.token.is_expired(now));
    }
}

/// Server end of the data channel listener.
pub struct DataChannelServer {
    listener: TcpListener,
    manager: Arc<ShardManager>,
    tokens: Arc<TokenStore>,
}

impl DataChannelServer {
    /// Binds the listener.
    pub async fn bind(
        addr: &str,
        manager: Arc<ShardManager>,
        tokens: Arc<TokenStore>,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            manager,
            tokens,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop; each channel is served on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match self.listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Data channel accept failed");
                        continue;
                    }
                };

                let manager = Arc::clone(&self.manager);
                let tokens = Arc::clone(&self.tokens);
                tokio::spawn(async move {
                    if let Err(e) = serve_channel(manager, tokens, stream).await {
                        debug!(peer = %peer, error = %e, "Data channel ended with error");
                    }
                });
            }
        })
    }
}

async fn serve_channel(
    manager: Arc<ShardManager>,
    tokens: Arc<TokenStore>,
    mut stream: TcpStream,
) -> Result<(), ChannelError> {
    let frame: ChannelFrame = read_frame(&mut stream).await?;
    serve_with_frame(manager, tokens, stream, frame).await
}

/// Serves a data-channel session whose control frame was already read.
///
/// The RPC listener multiplexes both frame kinds on one port and hands
/// channel sessions over here.
pub async fn serve_with_frame(
    manager: Arc<ShardManager>,
    tokens: Arc<TokenStore>,
    mut stream: TcpStream,
    frame: ChannelFrame,
) -> Result<(), ChannelError> {
    let expected_size = match validate_channel(&manager, &tokens, &frame).await {
        Ok(size) => size,
        Err(e) => {
            write_frame(&mut stream, &ChannelAck::err(&e)).await?;
            return Err(e);
        }
    };

    match frame.operation {
        Operation::Push => serve_push(manager, tokens, stream, frame, expected_size).await,
        Operation::Pull => serve_pull(manager, tokens, stream, frame).await,
    }
}

async fn validate_channel(
    manager: &ShardManager,
    tokens: &TokenStore,
    frame: &ChannelFrame,
) -> Result<u64, ChannelError> {
    // A contract must exist for the shard before any bytes move.
    match manager.peek(&frame.hash).await {
        Ok(item) if !item.contracts.is_empty() => {}
        Ok(_) | Err(StoreError::NotFound(_)) => return Err(ChannelError::ContractUnknown),
        Err(e) => return Err(ChannelError::Remote(e.to_string())),
    }
    tokens.begin(frame)
}

async fn serve_push(
    manager: Arc<ShardManager>,
    tokens: Arc<TokenStore>,
    mut stream: TcpStream,
    frame: ChannelFrame,
    expected_size: u64,
) -> Result<(), ChannelError> {
    let mut sink = match manager.open_sink(&frame.hash, expected_size).await {
        Ok(sink) => sink,
        Err(StoreError::StorageFull) => {
            tokens.finish(&frame.token, false);
            let e = ChannelError::StorageFull;
            write_frame(&mut stream, &ChannelAck::err(&e)).await?;
            return Err(e);
        }
        Err(e) => {
            tokens.finish(&frame.token, false);
            let e = ChannelError::Remote(e.to_string());
            write_frame(&mut stream, &ChannelAck::err(&e)).await?;
            return Err(e);
        }
    };

    write_frame(&mut stream, &ChannelAck::ok()).await?;

    let mut hasher = Hash160Hasher::new();
    let mut buf = vec![0u8; CHUNK];
    let received = loop {
        match stream.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                hasher.update(&buf[..n]);
                if let Err(e) = sink.write(&buf[..n]).await {
                    break Err(ChannelError::Remote(e.to_string()));
                }
            }
            Err(e) => break Err(ChannelError::Io(e.to_string())),
        }
    };

    if let Err(e) = received {
        let _ = sink.abort().await;
        tokens.finish(&frame.token, false);
        return Err(e);
    }

    if ShardHash::new(hasher.finalize()) != frame.hash {
        // Shard discarded, token left unconsumed.
        let _ = sink.abort().await;
        tokens.finish(&frame.token, false);
        let e = ChannelError::HashMismatch;
        write_frame(&mut stream, &ChannelAck::err(&e)).await?;
        return Err(e);
    }

    sink.commit()
        .await
        .map_err(|e| ChannelError::Remote(e.to_string()))?;
    tokens.finish(&frame.token, true);
    debug!(hash = %frame.hash, "Shard received over data channel");

    write_frame(&mut stream, &ChannelAck::ok()).await?;
    Ok(())
}

async fn serve_pull(
    manager: Arc<ShardManager>,
    tokens: Arc<TokenStore>,
    mut stream: TcpStream,
    frame: ChannelFrame,
) -> Result<(), ChannelError> {
    let mut source = match manager.open_source(&frame.hash).await {
        Ok(source) => source,
        Err(StoreError::ShardMissing(_)) | Err(StoreError::NotFound(_)) => {
            tokens.finish(&frame.token, false);
            let e = ChannelError::ShardNotFound;
            write_frame(&mut stream, &ChannelAck::err(&e)).await?;
            return Err(e);
        }
        Err(e) => {
            tokens.finish(&frame.token, false);
            let e = ChannelError::Remote(e.to_string());
            write_frame(&mut stream, &ChannelAck::err(&e)).await?;
            return Err(e);
        }
    };

    write_frame(&mut stream, &ChannelAck::ok()).await?;

    let result = async {
        while let Some(chunk) = source
            .next_chunk()
            .await
            .map_err(|e| ChannelError::Remote(e.to_string()))?
        {
            stream.write_all(&chunk).await?;
        }
        stream.flush().await?;
        Ok::<(), ChannelError>(())
    }
    .await;

    tokens.finish(&frame.token, false);
    result?;
    debug!(hash = %frame.hash, "Shard served over data channel");
    Ok(())
}

/// Client end of a data channel.
pub struct DataChannelClient;

impl DataChannelClient {
    /// Streams shard bytes to a farmer under a PUSH token.
    pub async fn push(
        addr: &str,
        token: &str,
        hash: ShardHash,
        data: &[u8],
    ) -> Result<(), ChannelError> {
        let mut stream = TcpStream::connect(addr).await?;
        let frame = ChannelFrame {
            token: token.to_string(),
            hash,
            operation: Operation::Push,
        };
        write_frame(&mut stream, &frame).await?;
        read_frame::<ChannelAck>(&mut stream).await?.into_result()?;

        for chunk in data.chunks(CHUNK) {
            stream.write_all(chunk).await?;
        }
        stream.flush().await?;
        stream.shutdown().await?;

        read_frame::<ChannelAck>(&mut stream).await?.into_result()
    }

    /// Pulls shard bytes from a farmer under a PULL token and verifies the
    /// content hash.
    pub async fn pull(addr: &str, token: &str, hash: ShardHash) -> Result<Vec<u8>, ChannelError> {
        let mut stream = TcpStream::connect(addr).await?;
        let frame = ChannelFrame {
            token: token.to_string(),
            hash,
            operation: Operation::Pull,
        };
        write_frame(&mut stream, &frame).await?;
        read_frame::<ChannelAck>(&mut stream).await?.into_result()?;

        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;

        if ShardHash::of(&data) != hash {
            return Err(ChannelError::HashMismatch);
        }
        Ok(data)
    }
}
