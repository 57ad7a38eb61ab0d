//! The typed bridge client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use storj_audit::Challenge;
use storj_core::{sha256, KeyPair, ShardHash};
use tracing::debug;

use crate::retry::retry;
use crate::BridgeError;

/// How the client authenticates against the bridge.
#[derive(Clone)]
pub enum BridgeAuth {
    /// Unauthenticated (public endpoints only).
    None,
    /// HTTP basic: email plus SHA-256 of the password, hex encoded.
    Basic {
        /// Account email.
        email: String,
        /// `sha256(password)` as hex.
        password_hash: String,
    },
    /// ECDSA: sign `METHOD\nPATH\nPAYLOAD` with the node key.
    Key(Arc<KeyPair>),
}

impl BridgeAuth {
    /// Builds basic credentials from a clear-text password.
    pub fn basic(email: impl Into<String>, password: &str) -> Self {
        BridgeAuth::Basic {
            email: email.into(),
            password_hash: hex::encode(sha256(password.as_bytes())),
        }
    }
}

/// A staged frame grouping shards before file-entry finalization.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeFrame {
    /// Frame identifier.
    pub id: String,
    /// Creation time, ISO string as the bridge reports it.
    #[serde(default)]
    pub created: Option<String>,
}

/// One shard registered into a frame.
#[derive(Debug, Clone, Serialize)]
pub struct ShardEntry {
    /// Shard content address.
    pub hash: ShardHash,
    /// Shard size in bytes.
    pub size: u64,
    /// Position within the file.
    pub index: u32,
    /// Audit challenges for the shard, hex encoded.
    pub challenges: Vec<Challenge>,
    /// Public audit leaves, hex encoded.
    pub tree: Vec<String>,
    /// Node ids to exclude when the bridge picks farmers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// A storage bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketInfo {
    /// Bucket identifier.
    pub id: String,
    /// Bucket name.
    pub name: String,
}

/// A stored file's metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    /// File identifier.
    pub id: String,
    /// Declared mimetype.
    #[serde(default)]
    pub mimetype: Option<String>,
    /// File name.
    #[serde(default)]
    pub filename: Option<String>,
    /// Total size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
}

/// Client for the bridge REST surface.
pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
    auth: BridgeAuth,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl BridgeClient {
    /// Creates a client for a bridge URL.
    pub fn new(base_url: impl Into<String>, auth: BridgeAuth) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Overrides the retry policy for shard-registration calls.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BridgeError> {
        let url = format!("{}{}", self.base_url, path);
        let payload = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();

        let mut request = self.http.request(method.clone(), &url);
        match &self.auth {
            BridgeAuth::None => {}
            BridgeAuth::Basic {
                email,
                password_hash,
            } => {
                request = request.basic_auth(email, Some(password_hash));
            }
            BridgeAuth::Key(keypair) => {
                let (pubkey, signature) = sign_request(keypair, method.as_str(), path, &payload);
                request = request.header("x-pubkey", pubkey).header("x-signature", signature);
            }
        }
        if let Some(body) = &body {
            request = request.json(body);
        }

        debug!(method = %method, url = %url, "Bridge request");
        let response = request.send().await?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Unknown bridge error")
                .to_string();
            return Err(BridgeError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(value)
    }

    /// GET /contacts: pages through known farmer contacts.
    pub async fn get_contacts(&self) -> Result<Value, BridgeError> {
        self.request(Method::GET, "/contacts", None).await
    }

    /// GET /contacts/:nodeid.
    pub async fn get_contact(&self, node_id: &str) -> Result<Value, BridgeError> {
        self.request(Method::GET, &format!("/contacts/{node_id}"), None)
            .await
    }

    /// POST /users: registers an account.
    pub async fn create_user(&self, email: &str, password: &str) -> Result<Value, BridgeError> {
        let body = json!({
            "email": email,
            "password": hex::encode(sha256(password.as_bytes())),
        });
        self.request(Method::POST, "/users", Some(body)).await
    }

    /// POST /keys: registers this node's public key with the account.
    pub async fn add_public_key(&self, pubkey_hex: &str) -> Result<Value, BridgeError> {
        self.request(Method::POST, "/keys", Some(json!({ "key": pubkey_hex })))
            .await
    }

    /// GET /keys.
    pub async fn list_public_keys(&self) -> Result<Value, BridgeError> {
        self.request(Method::GET, "/keys", None).await
    }

    /// DELETE /keys/:pubkey.
    pub async fn delete_public_key(&self, pubkey_hex: &str) -> Result<(), BridgeError> {
        self.request(Method::DELETE, &format!("/keys/{pubkey_hex}"), None)
            .await?;
        Ok(())
    }

    /// GET /buckets.
    pub async fn get_buckets(&self) -> Result<Vec<BucketInfo>, BridgeError> {
        let value = self.request(Method::GET, "/buckets", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// POST /buckets.
    pub async fn create_bucket(&self, name: &str) -> Result<BucketInfo, BridgeError> {
        let value = self
            .request(Method::POST, "/buckets", Some(json!({ "name": name })))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// GET /buckets/:id.
    pub async fn get_bucket(&self, id: &str) -> Result<BucketInfo, BridgeError> {
        let value = self
            .request(Method::GET, &format!("/buckets/{id}"), None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// DELETE /buckets/:id.
    pub async fn delete_bucket(&self, id: &str) -> Result<(), BridgeError> {
        self.request(Method::DELETE, &format!("/buckets/{id}"), None)
            .await?;
        Ok(())
    }

    /// PATCH /buckets/:id.
    pub async fn rename_bucket(&self, id: &str, name: &str) -> Result<BucketInfo, BridgeError> {
        let value = self
            .request(
                Method::PATCH,
                &format!("/buckets/{id}"),
                Some(json!({ "name": name })),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// POST /buckets/:id/tokens: obtains a PUSH or PULL bucket token.
    pub async fn create_bucket_token(
        &self,
        bucket_id: &str,
        operation: &str,
    ) -> Result<Value, BridgeError> {
        self.request(
            Method::POST,
            &format!("/buckets/{bucket_id}/tokens"),
            Some(json!({ "operation": operation })),
        )
        .await
    }

    /// POST /buckets/:id/mirrors: requests replication of a file.
    pub async fn create_mirrors(
        &self,
        bucket_id: &str,
        file_id: &str,
        redundancy: u32,
    ) -> Result<Value, BridgeError> {
        self.request(
            Method::POST,
            &format!("/buckets/{bucket_id}/mirrors"),
            Some(json!({ "file": file_id, "redundancy": redundancy })),
        )
        .await
    }

    /// GET /buckets/:id/files.
    pub async fn list_files(&self, bucket_id: &str) -> Result<Vec<FileEntry>, BridgeError> {
        let value = self
            .request(Method::GET, &format!("/buckets/{bucket_id}/files"), None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// GET /buckets/:id/files/:file.
    pub async fn get_file(&self, bucket_id: &str, file_id: &str) -> Result<FileEntry, BridgeError> {
        let value = self
            .request(
                Method::GET,
                &format!("/buckets/{bucket_id}/files/{file_id}"),
                None,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// POST /frames: stages a new frame.
    pub async fn create_frame(&self) -> Result<BridgeFrame, BridgeError> {
        let value = self.request(Method::POST, "/frames", Some(json!({}))).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// GET /frames.
    pub async fn list_frames(&self) -> Result<Vec<BridgeFrame>, BridgeError> {
        let value = self.request(Method::GET, "/frames", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// DELETE /frames/:id.
    pub async fn delete_frame(&self, id: &str) -> Result<(), BridgeError> {
        self.request(Method::DELETE, &format!("/frames/{id}"), None)
            .await?;
        Ok(())
    }

    /// PUT /frames/:id: registers one shard's metadata, with retries.
    ///
    /// Registration is the flakiest bridge call during an upload, so it
    /// goes through the retry combinator.
    pub async fn add_shard_to_frame(
        &self,
        frame_id: &str,
        entry: &ShardEntry,
    ) -> Result<Value, BridgeError> {
        let body = serde_json::to_value(entry)?;
        let path = format!("/frames/{frame_id}");
        retry(self.retry_attempts, self.retry_backoff, || {
            self.request(Method::PUT, &path, Some(body.clone()))
        })
        .await
    }

    /// POST /buckets/:id/files: finalizes a frame into a file entry.
    pub async fn create_file_entry(
        &self,
        bucket_id: &str,
        frame_id: &str,
        mimetype: &str,
        filename: &str,
    ) -> Result<FileEntry, BridgeError> {
        let body = json!({
            "frame": frame_id,
            "mimetype": mimetype,
            "filename": filename,
        });
        let value = self
            .request(
                Method::POST,
                &format!("/buckets/{bucket_id}/files"),
                Some(body),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Signs `METHOD\nPATH\nPAYLOAD`, returning `(pubkey_hex, signature_hex)`.
///
/// The bridge expects the DER signature form here, unlike the compact form
/// used on every node-to-node surface.
fn sign_request(keypair: &KeyPair, method: &str, path: &str, payload: &str) -> (String, String) {
    let message = format!("{method}\n{path}\n{payload}");
    let digest = sha256(message.as_bytes());
    let signature = keypair.sign_der(&digest);
    (
        hex::encode(keypair.public_key_bytes()),
        hex::encode(signature),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_hashes_password() {
        let auth = BridgeAuth::basic("user@example.com", "hunter2");
        match auth {
            BridgeAuth::Basic {
                email,
                password_hash,
            } => {
                assert_eq!(email, "user@example.com");
                assert_eq!(password_hash, hex::encode(sha256(b"hunter2")));
            }
            _ => panic!("expected basic auth"),
        }
    }

    #[test]
    fn test_sign_request_binds_method_path_payload() {
        let keypair = KeyPair::generate();
        let (pubkey, signature) = sign_request(&keypair, "POST", "/frames", "{}");
        assert_eq!(pubkey, hex::encode(keypair.public_key_bytes()));

        // Different payloads must not share a signature.
        let (_, other) = sign_request(&keypair, "POST", "/frames", "{\"a\":1}");
        assert_ne!(signature, other);
    }

    #[test]
    fn test_shard_entry_serialization() {
        let entry = ShardEntry {
            hash: ShardHash::of(b"hello storj"),
            size: 11,
            index: 0,
            challenges: vec![Challenge::random()],
            tree: vec!["ab".repeat(20)],
            exclude: Vec::new(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["size"], 11);
        assert!(value.get("exclude").is_none());
        assert_eq!(
            value["hash"].as_str().unwrap(),
            ShardHash::of(b"hello storj").to_hex()
        );
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = BridgeClient::new("https://api.storj.io/", BridgeAuth::None);
        assert_eq!(client.base_url, "https://api.storj.io");
    }
}
