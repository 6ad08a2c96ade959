use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use anyhow::{Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::KeelConfig;

const AES_NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const SALT_FILENAME: &str = "keystore.salt";

/// Symmetric encryption for signer tokens kept in the local keystore.
///
/// AES-256-GCM with a key derived via Argon2id from a passphrase (or, when
/// none is supplied, from machine context) and a persisted random salt.
/// Ciphertexts are hex encoded as `nonce || ciphertext`.
pub struct SecureStorage {
    cipher: Aes256Gcm,
}

impl SecureStorage {
    /// Machine-bound storage with the salt at `~/.keel/keystore.salt`.
    pub fn new() -> Result<Self> {
        let salt_path = KeelConfig::base_dir()?.join(SALT_FILENAME);
        Self::with_salt_path(&salt_path)
    }

    /// Machine-bound storage with a salt file at a custom path.
    pub fn with_salt_path(salt_path: &Path) -> Result<Self> {
        let username = whoami::username();
        let home = dirs::home_dir()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let context = format!("keel-keystore-v1:{username}:{home}");
        Self::with_passphrase(salt_path, &context)
    }

    /// Storage keyed by an explicit passphrase, portable across machines.
    pub fn with_passphrase(salt_path: &Path, passphrase: &str) -> Result<Self> {
        let salt = load_or_create_salt(salt_path)?;
        let key_material = derive_key(passphrase.as_bytes(), &salt)?;
        let key = Key::<Aes256Gcm>::from_slice(&key_material);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt a plaintext string, returning hex-encoded ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; AES_NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {e}"))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(hex::encode(result))
    }

    /// Decrypt a hex-encoded ciphertext string.
    pub fn decrypt(&self, hex_ciphertext: &str) -> Result<String> {
        let data = hex::decode(hex_ciphertext).context("Invalid hex")?;
        if data.len() < AES_NONCE_LEN {
            anyhow::bail!("Ciphertext too short");
        }

        let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {e}"))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }

    /// Default salt location, exposed for callers that build their own paths.
    pub fn default_salt_path() -> Result<PathBuf> {
        Ok(KeelConfig::base_dir()?.join(SALT_FILENAME))
    }
}

/// Load a salt from disk, or generate and persist a new one. A salt file with
/// the wrong length is regenerated.
fn load_or_create_salt(salt_path: &Path) -> Result<[u8; SALT_LEN]> {
    if let Ok(data) = fs::read(salt_path) {
        if data.len() == SALT_LEN {
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(&data);
            return Ok(salt);
        }
    }

    let salt: [u8; SALT_LEN] = rand::random();
    if let Some(parent) = salt_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    fs::write(salt_path, salt)
        .with_context(|| format!("Failed to write salt file {}", salt_path.display()))?;
    Ok(salt)
}

/// Argon2id, m=19456 KiB, t=2, p=1.
fn derive_key(password: &[u8], salt: &[u8; SALT_LEN]) -> Result<[u8; 32]> {
    let params = Params::new(19_456, 2, 1, Some(32))
        .map_err(|e| anyhow::anyhow!("Invalid Argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| anyhow::anyhow!("Argon2 key derivation failed: {e}"))?;
    Ok(key)
}
