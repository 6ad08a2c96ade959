//! Run-time resolution of the deployer identity.
//!
//! Secret material (the signer bearer token) is only ever held in a
//! [`SecretString`], whose `Debug`/`Display` output is redacted.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use keel_core::SecureStorage;

use crate::address::Address;

pub const ENV_DEPLOYER: &str = "KEEL_DEPLOYER";
pub const ENV_SIGNER_TOKEN: &str = "KEEL_SIGNER_TOKEN";

/// A string that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// The identity every mutating call of a run is issued under.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: Address,
    /// Bearer token for the signing endpoint, if it requires one.
    pub signer_token: Option<SecretString>,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential not provided: {0}")]
    Missing(String),

    #[error("invalid deployer identity: {0}")]
    InvalidIdentity(String),

    #[error("keystore error: {0}")]
    Keystore(String),
}

/// Supplies the signing identity for a run.
pub trait CredentialProvider: Send + Sync {
    /// Short label used in logs (never the secret itself).
    fn name(&self) -> &str;

    fn resolve(&self) -> Result<Credentials, CredentialError>;
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Reads `KEEL_DEPLOYER` and the optional `KEEL_SIGNER_TOKEN`.
pub struct EnvCredentials {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvCredentials {
    pub fn new() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for EnvCredentials {
    fn name(&self) -> &str {
        "env"
    }

    fn resolve(&self) -> Result<Credentials, CredentialError> {
        let raw = (self.lookup)(ENV_DEPLOYER)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| CredentialError::Missing(ENV_DEPLOYER.into()))?;
        let identity = raw
            .parse()
            .map_err(|_| CredentialError::InvalidIdentity(raw.clone()))?;
        let signer_token = (self.lookup)(ENV_SIGNER_TOKEN)
            .filter(|v| !v.is_empty())
            .map(SecretString::new);
        Ok(Credentials {
            identity,
            signer_token,
        })
    }
}

// ---------------------------------------------------------------------------
// Encrypted keystore
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct KeystoreFile {
    identity: Address,
    /// Hex ciphertext produced by [`SecureStorage::encrypt`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signer_token: Option<String>,
}

/// Deployer identity plus an encrypted signer token on disk.
pub struct KeystoreCredentials {
    path: PathBuf,
    storage: SecureStorage,
}

impl KeystoreCredentials {
    pub fn new(path: impl Into<PathBuf>, storage: SecureStorage) -> Self {
        Self {
            path: path.into(),
            storage,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the identity and (encrypted) token, owner-readable only.
    pub fn store(&self, identity: Address, token: Option<&SecretString>) -> anyhow::Result<()> {
        let signer_token = token
            .map(|t| self.storage.encrypt(t.expose_secret()))
            .transpose()?;
        let file = KeystoreFile {
            identity,
            signer_token,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&file).context("failed to serialize keystore")?;
        std::fs::write(&self.path, json).context("failed to write keystore file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .context("failed to set keystore file permissions")?;
        }

        info!(path = %self.path.display(), identity = %identity, "keystore saved");
        Ok(())
    }
}

impl CredentialProvider for KeystoreCredentials {
    fn name(&self) -> &str {
        "keystore"
    }

    fn resolve(&self) -> Result<Credentials, CredentialError> {
        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            CredentialError::Keystore(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let file: KeystoreFile = serde_json::from_str(&json)
            .map_err(|e| CredentialError::Keystore(format!("corrupt keystore: {e}")))?;
        let signer_token = file
            .signer_token
            .map(|enc| self.storage.decrypt(&enc))
            .transpose()
            .map_err(|e| CredentialError::Keystore(format!("cannot decrypt signer token: {e}")))?
            .map(SecretString::new);
        Ok(Credentials {
            identity: file.identity,
            signer_token,
        })
    }
}
