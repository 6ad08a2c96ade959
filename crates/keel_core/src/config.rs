use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Environment variable names
// ---------------------------------------------------------------------------

pub const ENV_NETWORK: &str = "KEEL_NETWORK";
pub const ENV_RPC_URL: &str = "KEEL_RPC_URL";
pub const ENV_CHAIN_ID: &str = "KEEL_CHAIN_ID";
pub const ENV_CREDENTIALS: &str = "KEEL_CREDENTIALS";

/// Where the deployer identity and signer token come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// `KEEL_DEPLOYER` / `KEEL_SIGNER_TOKEN` environment variables.
    Env,
    /// Encrypted keystore at `~/.keel/credentials.json`.
    Keystore,
}

impl std::str::FromStr for CredentialSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "env" => Ok(Self::Env),
            "keystore" => Ok(Self::Keystore),
            other => anyhow::bail!("unknown credential source '{other}' (expected env or keystore)"),
        }
    }
}

// ---------------------------------------------------------------------------
// KeelConfig
// ---------------------------------------------------------------------------

/// Orchestrator configuration stored at `~/.keel/config.json`.
///
/// No secret material lives here. Signer tokens are resolved at run time by a
/// credential provider (see [`CredentialSource`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    // Target network
    pub network: String,
    pub rpc_url: Option<String>,
    pub chain_id: Option<u64>,

    // Files
    pub blueprint_path: PathBuf,
    pub manifest_path: PathBuf,
    pub artifacts_dir: PathBuf,

    // Network calls
    pub call_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,

    // Retry
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,

    // Pre-flight
    /// Minimum deployer balance in wei, as a decimal string.
    pub min_balance_wei: String,

    // Credentials
    pub credentials: CredentialSource,

    // General
    pub log_level: String,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            network: "localhost".into(),
            rpc_url: None,
            chain_id: None,
            blueprint_path: PathBuf::from("deploy.json"),
            manifest_path: PathBuf::from("deployments/manifest.json"),
            artifacts_dir: PathBuf::from("artifacts"),
            call_timeout_secs: 30,
            confirmation_timeout_secs: 120,
            poll_interval_ms: 1_000,
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            min_balance_wei: "0".into(),
            credentials: CredentialSource::Env,
            log_level: "info".into(),
        }
    }
}

impl KeelConfig {
    /// Returns the base config directory: `~/.keel/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".keel"))
    }

    /// Returns the config file path: `~/.keel/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.keel/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Returns the encrypted keystore path: `~/.keel/credentials.json`
    pub fn keystore_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("credentials.json"))
    }

    /// Ensures all required directories exist.
    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::base_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Loads config from disk, or creates the default file if missing.
    pub fn load() -> Result<Self> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        Self::load_from_path(&path)
    }

    /// Load config from a specific file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Save config to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Apply `KEEL_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup. Empty values are
    /// ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(network) = get(ENV_NETWORK) {
            self.network = network;
        }
        if let Some(url) = get(ENV_RPC_URL) {
            self.rpc_url = Some(url);
        }
        if let Some(raw) = get(ENV_CHAIN_ID) {
            let id = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{ENV_CHAIN_ID} is not a number: {raw}"))?;
            self.chain_id = Some(id);
        }
        if let Some(source) = get(ENV_CREDENTIALS) {
            self.credentials = source.parse()?;
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Parse [`min_balance_wei`](Self::min_balance_wei). Malformed values fall
    /// back to zero with a warning.
    pub fn min_balance(&self) -> u128 {
        match self.min_balance_wei.trim().parse::<u128>() {
            Ok(v) => v,
            Err(e) => {
                warn!(value = %self.min_balance_wei, "invalid min_balance_wei, using 0: {e}");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_values() {
        let config = KeelConfig::default();
        assert_eq!(config.network, "localhost");
        assert!(config.rpc_url.is_none());
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.credentials, CredentialSource::Env);
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.min_balance(), 0);
    }

    #[test]
    fn load_missing_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.json");
        let config = KeelConfig::load_from_path(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.network, "localhost");
    }

    #[test]
    fn save_and_reload_preserves_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let mut config = KeelConfig::default();
        config.network = "sepolia".into();
        config.max_attempts = 7;
        config.credentials = CredentialSource::Keystore;
        config.save_to_path(&path).unwrap();

        let loaded = KeelConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.network, "sepolia");
        assert_eq!(loaded.max_attempts, 7);
        assert_eq!(loaded.credentials, CredentialSource::Keystore);
    }

    #[test]
    fn partial_file_uses_defaults_for_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{ "network": "base" }"#).unwrap();
        let loaded = KeelConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.network, "base");
        assert_eq!(loaded.poll_interval_ms, 1_000);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(KeelConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (ENV_NETWORK, "sepolia"),
            (ENV_RPC_URL, "https://rpc.example.com"),
            (ENV_CHAIN_ID, "11155111"),
            (ENV_CREDENTIALS, "keystore"),
        ]
        .into_iter()
        .collect();

        let mut config = KeelConfig::default();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.network, "sepolia");
        assert_eq!(config.rpc_url.as_deref(), Some("https://rpc.example.com"));
        assert_eq!(config.chain_id, Some(11_155_111));
        assert_eq!(config.credentials, CredentialSource::Keystore);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = KeelConfig::default();
        config
            .apply_overrides_from(|k| (k == ENV_NETWORK).then(|| "  ".to_string()))
            .unwrap();
        assert_eq!(config.network, "localhost");
    }

    #[test]
    fn bad_chain_id_override_fails() {
        let mut config = KeelConfig::default();
        let result = config.apply_overrides_from(|k| (k == ENV_CHAIN_ID).then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_min_balance_falls_back_to_zero() {
        let config = KeelConfig {
            min_balance_wei: "lots".into(),
            ..KeelConfig::default()
        };
        assert_eq!(config.min_balance(), 0);

        let config = KeelConfig {
            min_balance_wei: "1000000000000000000".into(),
            ..KeelConfig::default()
        };
        assert_eq!(config.min_balance(), 1_000_000_000_000_000_000);
    }
}
