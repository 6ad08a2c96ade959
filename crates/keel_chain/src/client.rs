//! The network seam. The orchestrator only ever talks to a [`NetworkClient`];
//! the concrete JSON-RPC implementation lives in [`crate::evm`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::abi::{AbiError, AbiValue};
use crate::address::Address;

/// Sender and ordering value for one mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    pub from: Address,
    pub nonce: u64,
}

/// A confirmed contract construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub address: Address,
    pub tx_hash: String,
    pub block_number: u64,
}

/// A confirmed mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
}

/// Errors a network client may return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    /// Connection reset, refused, or a 5xx from the endpoint.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited")]
    RateLimited,

    /// The ordering value (nonce) was stale or already used.
    #[error("Sequencing conflict: {0}")]
    Sequencing(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The sender lacks permission for the call.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Execution reverted: {0}")]
    Reverted(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Abi(#[from] AbiError),
}

impl NetworkError {
    /// Connection, timeout and rate-limit failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited
        )
    }
}

/// Unified interface to the target network, issued on behalf of one
/// deployer identity.
///
/// `deploy` and `send` block until the network confirms or rejects the
/// submission. Everything else is read-only.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, NetworkError>;

    async fn block_number(&self) -> Result<u64, NetworkError>;

    /// Next ordering value for `identity`, including pending submissions.
    async fn next_nonce(&self, identity: Address) -> Result<u64, NetworkError>;

    /// Native balance in the smallest unit (wei).
    async fn get_balance(&self, identity: Address) -> Result<u128, NetworkError>;

    /// Runtime code at `address`; empty when nothing is deployed there.
    async fn get_code(&self, address: Address) -> Result<Vec<u8>, NetworkError>;

    /// Construct the component named by `bytecode_ref` with `args`.
    async fn deploy(
        &self,
        bytecode_ref: &str,
        args: &[AbiValue],
        tx: TxContext,
    ) -> Result<Deployment, NetworkError>;

    /// Read-only call returning the raw ABI-encoded result.
    async fn call(
        &self,
        address: Address,
        method: &str,
        args: &[AbiValue],
    ) -> Result<Vec<u8>, NetworkError>;

    /// Mutating call.
    async fn send(
        &self,
        address: Address,
        method: &str,
        args: &[AbiValue],
        tx: TxContext,
    ) -> Result<Receipt, NetworkError>;
}
