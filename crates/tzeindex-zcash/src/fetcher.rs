//! Zcash node client.
//!
//! Talks to a `zcashd`-compatible node over JSON-RPC 1.0 (`getblockcount`,
//! `getblockhash`, `getblock` with verbosity 2). No retries happen here: the
//! ingestion loop owns retry and rollback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tzeindex_core::error::IndexerError;
use tzeindex_core::reorg::ChainView;

/// Node RPC operations the pipeline consumes.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Height of the node's best chain tip.
    async fn get_block_count(&self) -> Result<u64, IndexerError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, IndexerError>;

    /// The fully decoded block (verbosity 2).
    async fn get_block(&self, hash: &str) -> Result<Value, IndexerError>;
}

/// Exposes a [`NodeClient`] as the [`ChainView`] reorg resolution walks.
pub struct NodeChainView<'a, C: ?Sized>(pub &'a C);

#[async_trait]
impl<C: NodeClient + ?Sized> ChainView for NodeChainView<'_, C> {
    async fn canonical_hash(&self, height: u64) -> Result<String, IndexerError> {
        self.0.get_block_hash(height).await
    }
}

/// Connection settings for [`HttpNodeClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8232".into(),
            user: None,
            password: None,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// HTTP JSON-RPC client for a Zcash node.
pub struct HttpNodeClient {
    url: String,
    http: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl HttpNodeClient {
    pub fn new(config: NodeConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| IndexerError::Rpc(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: config.url,
            http,
            user: config.user,
            password: config.password,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, IndexerError> {
        let req = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut builder = self.http.post(&self.url).json(&req);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_deref());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| IndexerError::Rpc(format!("{method}: {e}")))?;

        // zcashd reports RPC errors with a non-2xx status and a JSON body.
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| IndexerError::Rpc(format!("{method}: {e}")))?;
        let parsed: RpcResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(IndexerError::Rpc(format!(
                    "{method}: HTTP {}: {body}",
                    status.as_u16()
                )))
            }
            Err(e) => return Err(IndexerError::Rpc(format!("{method}: bad response: {e}"))),
        };

        if let Some(err) = parsed.error {
            return Err(IndexerError::Rpc(format!(
                "{method}: error {}: {}",
                err.code, err.message
            )));
        }
        match parsed.result {
            Some(Value::Null) | None => Err(IndexerError::Rpc(format!("{method}: empty result"))),
            Some(result) => Ok(result),
        }
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn get_block_count(&self) -> Result<u64, IndexerError> {
        let result = self.call("getblockcount", vec![]).await?;
        result
            .as_u64()
            .ok_or_else(|| IndexerError::Rpc(format!("getblockcount: not a height: {result}")))
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, IndexerError> {
        let result = self.call("getblockhash", vec![json!(height)]).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| IndexerError::Rpc(format!("getblockhash: not a hash: {result}")))
    }

    async fn get_block(&self, hash: &str) -> Result<Value, IndexerError> {
        tracing::trace!(hash, "getblock");
        self.call("getblock", vec![json!(hash), json!(2)]).await
    }
}
