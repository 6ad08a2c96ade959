//! EVM JSON-RPC client.
//!
//! Mutating calls go through `eth_sendTransaction`, so the endpoint must be a
//! node or remote signer that manages the deployer account. The client never
//! sees private key material; an optional bearer token authenticates it to
//! the signer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::abi::{self, AbiValue};
use crate::address::Address;
use crate::client::{Deployment, NetworkClient, NetworkError, Receipt, TxContext};
use crate::credentials::SecretString;
use crate::rpc_config::RpcConfig;

// ---------------------------------------------------------------------------
// JSON-RPC wire types (private)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    contract_address: Option<Address>,
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Resolves a bytecode reference to creation bytecode.
///
/// A reference is either inline `0x` hex, or the name of a JSON artifact in
/// the artifacts directory (`<dir>/<ref>.json`). Hardhat (`"bytecode": "0x.."`)
/// and Foundry (`"bytecode": {"object": "0x.."}`) layouts are accepted.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn bytecode(&self, bytecode_ref: &str) -> Result<Vec<u8>, NetworkError> {
        if bytecode_ref.starts_with("0x") {
            return decode_hex_data(bytecode_ref);
        }

        let path = self.artifact_path(bytecode_ref);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            NetworkError::Artifact(format!("cannot read {}: {e}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| NetworkError::Artifact(format!("{}: {e}", path.display())))?;
        let hex_code = match value.get("bytecode") {
            Some(Value::String(s)) => s.as_str(),
            Some(Value::Object(obj)) => obj.get("object").and_then(Value::as_str).unwrap_or(""),
            _ => "",
        };
        let code = decode_hex_data(hex_code)?;
        if code.is_empty() {
            return Err(NetworkError::Artifact(format!(
                "{} has no creation bytecode",
                path.display()
            )));
        }
        Ok(code)
    }

    fn artifact_path(&self, bytecode_ref: &str) -> PathBuf {
        let candidate = self.dir.join(bytecode_ref);
        if Path::new(bytecode_ref).extension().is_some() {
            candidate
        } else {
            self.dir.join(format!("{bytecode_ref}.json"))
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// JSON-RPC implementation of [`NetworkClient`].
pub struct EvmRpcClient {
    url: String,
    client: reqwest::Client,
    token: Option<SecretString>,
    artifacts: ArtifactStore,
    request_timeout: Duration,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    next_id: AtomicU64,
}

impl EvmRpcClient {
    pub fn new(
        rpc: &RpcConfig,
        artifacts: ArtifactStore,
        token: Option<SecretString>,
    ) -> Result<Self, NetworkError> {
        let request_timeout = Duration::from_secs(rpc.timeout_secs.max(1));
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NetworkError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: rpc.url.clone(),
            client,
            token,
            artifacts,
            request_timeout,
            confirmation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_confirmation(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, NetworkError> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token.expose_secret());
        }

        let resp = req.send().await.map_err(|e| self.map_reqwest(e))?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(NetworkError::RateLimited);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(NetworkError::Unauthorized(format!("endpoint returned {status}")));
        }
        if status.is_server_error() {
            return Err(NetworkError::Transport(format!("endpoint returned {status}")));
        }

        let parsed: RpcResponse = resp.json().await.map_err(|e| self.map_reqwest(e))?;
        if let Some(err) = parsed.error {
            debug!(method, code = err.code, "rpc error: {}", err.message);
            return Err(classify_rpc_error(err.code, &err.message));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    fn map_reqwest(&self, e: reqwest::Error) -> NetworkError {
        if e.is_timeout() {
            NetworkError::Timeout(self.request_timeout)
        } else if e.is_decode() {
            NetworkError::InvalidResponse(e.to_string())
        } else {
            NetworkError::Transport(e.to_string())
        }
    }

    async fn send_transaction(&self, tx: Value) -> Result<TxReceipt, NetworkError> {
        let hash = self.request("eth_sendTransaction", json!([tx])).await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| NetworkError::InvalidResponse(format!("expected tx hash, got {hash}")))?
            .to_string();
        debug!(tx_hash = %hash, "transaction submitted");
        self.wait_for_receipt(&hash).await
    }

    /// Poll until the receipt appears. A submitted transaction is never
    /// abandoned silently: exceeding the confirmation window is reported as
    /// a timeout.
    async fn wait_for_receipt(&self, hash: &str) -> Result<TxReceipt, NetworkError> {
        let deadline = Instant::now() + self.confirmation_timeout;
        loop {
            let value = self
                .request("eth_getTransactionReceipt", json!([hash]))
                .await?;
            if !value.is_null() {
                let receipt: TxReceipt = serde_json::from_value(value)
                    .map_err(|e| NetworkError::InvalidResponse(format!("bad receipt: {e}")))?;
                if receipt.status.as_deref() == Some("0x0") {
                    return Err(NetworkError::Reverted(format!("transaction {hash} failed")));
                }
                return Ok(receipt);
            }
            if Instant::now() >= deadline {
                warn!(tx_hash = %hash, "no receipt within confirmation window");
                return Err(NetworkError::Timeout(self.confirmation_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl NetworkClient for EvmRpcClient {
    async fn chain_id(&self) -> Result<u64, NetworkError> {
        let v = self.request("eth_chainId", json!([])).await?;
        Ok(parse_quantity(&v)? as u64)
    }

    async fn block_number(&self) -> Result<u64, NetworkError> {
        let v = self.request("eth_blockNumber", json!([])).await?;
        Ok(parse_quantity(&v)? as u64)
    }

    async fn next_nonce(&self, identity: Address) -> Result<u64, NetworkError> {
        let v = self
            .request(
                "eth_getTransactionCount",
                json!([identity.to_string(), "pending"]),
            )
            .await?;
        Ok(parse_quantity(&v)? as u64)
    }

    async fn get_balance(&self, identity: Address) -> Result<u128, NetworkError> {
        let v = self
            .request("eth_getBalance", json!([identity.to_string(), "latest"]))
            .await?;
        parse_quantity(&v)
    }

    async fn get_code(&self, address: Address) -> Result<Vec<u8>, NetworkError> {
        let v = self
            .request("eth_getCode", json!([address.to_string(), "latest"]))
            .await?;
        decode_hex_data(v.as_str().unwrap_or("0x"))
    }

    async fn deploy(
        &self,
        bytecode_ref: &str,
        args: &[AbiValue],
        tx: TxContext,
    ) -> Result<Deployment, NetworkError> {
        let mut data = self.artifacts.bytecode(bytecode_ref)?;
        data.extend(abi::encode(args));

        let receipt = self
            .send_transaction(json!({
                "from": tx.from.to_string(),
                "nonce": format!("0x{:x}", tx.nonce),
                "data": format!("0x{}", hex::encode(&data)),
            }))
            .await?;

        let address = receipt.contract_address.ok_or_else(|| {
            NetworkError::InvalidResponse("receipt has no contractAddress".into())
        })?;
        Ok(Deployment {
            address,
            block_number: receipt_block(&receipt)?,
            tx_hash: receipt.transaction_hash,
        })
    }

    async fn call(
        &self,
        address: Address,
        method: &str,
        args: &[AbiValue],
    ) -> Result<Vec<u8>, NetworkError> {
        let data = abi::encode_call(method, args)?;
        let v = self
            .request(
                "eth_call",
                json!([
                    { "to": address.to_string(), "data": format!("0x{}", hex::encode(&data)) },
                    "latest"
                ]),
            )
            .await?;
        decode_hex_data(v.as_str().unwrap_or("0x"))
    }

    async fn send(
        &self,
        address: Address,
        method: &str,
        args: &[AbiValue],
        tx: TxContext,
    ) -> Result<Receipt, NetworkError> {
        let data = abi::encode_call(method, args)?;
        let receipt = self
            .send_transaction(json!({
                "from": tx.from.to_string(),
                "to": address.to_string(),
                "nonce": format!("0x{:x}", tx.nonce),
                "data": format!("0x{}", hex::encode(&data)),
            }))
            .await?;
        Ok(Receipt {
            block_number: receipt_block(&receipt)?,
            tx_hash: receipt.transaction_hash,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a JSON-RPC error onto the orchestrator's taxonomy by code and message.
fn classify_rpc_error(code: i64, message: &str) -> NetworkError {
    let msg = message.to_ascii_lowercase();
    if msg.contains("nonce too low")
        || msg.contains("nonce too high")
        || msg.contains("invalid nonce")
        || msg.contains("replacement transaction underpriced")
        || msg.contains("already known")
    {
        NetworkError::Sequencing(message.to_string())
    } else if msg.contains("insufficient funds") {
        NetworkError::InsufficientFunds(message.to_string())
    } else if msg.contains("unauthorized")
        || msg.contains("not authorized")
        || msg.contains("accesscontrol")
        || msg.contains("unknown account")
    {
        NetworkError::Unauthorized(message.to_string())
    } else if msg.contains("revert") {
        NetworkError::Reverted(message.to_string())
    } else if code == -32005 || msg.contains("rate limit") || msg.contains("too many requests") {
        NetworkError::RateLimited
    } else if msg.contains("timeout") || msg.contains("timed out") {
        NetworkError::Transport(message.to_string())
    } else {
        NetworkError::Rpc {
            code,
            message: message.to_string(),
        }
    }
}

/// Parse a hex quantity (`"0x1a"`).
fn parse_quantity(value: &Value) -> Result<u128, NetworkError> {
    let s = value
        .as_str()
        .ok_or_else(|| NetworkError::InvalidResponse(format!("expected quantity, got {value}")))?;
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| NetworkError::InvalidResponse(format!("quantity without 0x: {s}")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| NetworkError::InvalidResponse(format!("bad quantity {s}: {e}")))
}

fn decode_hex_data(s: &str) -> Result<Vec<u8>, NetworkError> {
    let digits = s.trim().strip_prefix("0x").unwrap_or(s.trim());
    hex::decode(digits).map_err(|e| NetworkError::InvalidResponse(format!("bad hex data: {e}")))
}

fn receipt_block(receipt: &TxReceipt) -> Result<u64, NetworkError> {
    match &receipt.block_number {
        Some(n) => Ok(parse_quantity(&Value::String(n.clone()))? as u64),
        None => Ok(0),
    }
}
