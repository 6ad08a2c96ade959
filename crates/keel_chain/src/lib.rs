//! Chain-facing primitives for the deployment orchestrator.
//!
//! - [`address`]: 20-byte account/contract addresses.
//! - [`abi`]: selector hashing and ABI encoding for constructor/setter args.
//! - [`client`]: the [`NetworkClient`] seam the orchestrator depends on.
//! - [`evm`]: JSON-RPC implementation of [`NetworkClient`].
//! - [`rpc_config`]: network presets and endpoint resolution.
//! - [`credentials`]: run-time resolution of the deployer identity.

pub mod abi;
pub mod address;
pub mod client;
pub mod credentials;
pub mod evm;
pub mod rpc_config;

pub use abi::{AbiError, AbiValue};
pub use address::Address;
pub use client::{Deployment, NetworkClient, NetworkError, Receipt, TxContext};
pub use credentials::{
    CredentialError, CredentialProvider, Credentials, EnvCredentials, KeystoreCredentials,
    SecretString,
};
pub use evm::EvmRpcClient;
pub use rpc_config::{NetworkPreset, RpcConfig, get_network_presets, validate_url};
