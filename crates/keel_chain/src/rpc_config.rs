use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use keel_core::KeelConfig;

/// Built-in defaults for a named network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPreset {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub explorer_url: Option<String>,
}

/// Returns the networks known without extra configuration.
pub fn get_network_presets() -> Vec<NetworkPreset> {
    let preset = |name: &str, chain_id: u64, rpc_url: &str, explorer: Option<&str>| NetworkPreset {
        name: name.to_string(),
        chain_id,
        rpc_url: rpc_url.to_string(),
        explorer_url: explorer.map(str::to_string),
    };
    vec![
        preset("localhost", 31337, "http://127.0.0.1:8545", None),
        preset(
            "sepolia",
            11_155_111,
            "https://ethereum-sepolia-rpc.publicnode.com",
            Some("https://sepolia.etherscan.io"),
        ),
        preset(
            "base-sepolia",
            84_532,
            "https://sepolia.base.org",
            Some("https://sepolia.basescan.org"),
        ),
        preset("mainnet", 1, "https://eth.llamarpc.com", Some("https://etherscan.io")),
        preset("base", 8453, "https://mainnet.base.org", Some("https://basescan.org")),
    ]
}

pub fn find_preset(network: &str) -> Option<NetworkPreset> {
    get_network_presets()
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(network))
}

/// The endpoint a run talks to, resolved from config + presets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub network: String,
    pub url: String,
    pub is_custom: bool,
    /// Expected chain id; `None` means "accept whatever the endpoint reports".
    pub chain_id: Option<u64>,
    pub timeout_secs: u64,
}

impl RpcConfig {
    /// Resolve the endpoint for `config.network`. An explicit `rpc_url`
    /// overrides the preset and must pass [`validate_url`]; an unknown network
    /// without an explicit URL is an error.
    pub fn resolve(config: &KeelConfig) -> Result<Self> {
        let preset = find_preset(&config.network);

        let (url, is_custom) = match (&config.rpc_url, &preset) {
            (Some(url), _) => {
                if !validate_url(url) {
                    anyhow::bail!("invalid RPC URL: {url}");
                }
                (url.clone(), true)
            }
            (None, Some(p)) => (p.rpc_url.clone(), false),
            (None, None) => {
                return Err(anyhow::anyhow!("no RPC URL configured"))
                    .with_context(|| format!("unknown network '{}'", config.network));
            }
        };

        Ok(Self {
            network: config.network.clone(),
            url,
            is_custom,
            chain_id: config.chain_id.or(preset.map(|p| p.chain_id)),
            timeout_secs: config.call_timeout_secs,
        })
    }
}

/// Validate that a URL is well-formed and uses HTTP or HTTPS.
pub fn validate_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            (scheme == "http" || scheme == "https") && parsed.host().is_some()
        }
        Err(_) => false,
    }
}
