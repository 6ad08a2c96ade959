//! The durable record of a deployment and its atomic on-disk store.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_chain::Address;

use crate::error::{DeployError, ErrorKind, ErrorSummary};
use crate::registry::ComponentRegistry;
use crate::state::{ComponentStatus, RunPhase};

/// Resumable state of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentRecord {
    pub status: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub placeholders: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub network: String,
    pub chain_id: u64,
    pub deployer: Address,
    /// Name → address for every component confirmed on the network.
    pub contracts: BTreeMap<String, Address>,
    pub timestamp: DateTime<Utc>,
    /// Reference block height at the last write.
    pub block_number: u64,
    #[serde(default)]
    pub status: RunPhase,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentRecord>,
}

impl Manifest {
    pub fn new(network: impl Into<String>, chain_id: u64, deployer: Address) -> Self {
        Self {
            network: network.into(),
            chain_id,
            deployer,
            contracts: BTreeMap::new(),
            timestamp: Utc::now(),
            block_number: 0,
            status: RunPhase::Planning,
            components: BTreeMap::new(),
        }
    }

    /// Snapshot the registry into a fresh manifest.
    pub fn from_registry(
        registry: &ComponentRegistry,
        network: &str,
        chain_id: u64,
        deployer: Address,
        block_number: u64,
        status: RunPhase,
    ) -> Self {
        let mut manifest = Self::new(network, chain_id, deployer);
        manifest.block_number = block_number;
        manifest.status = status;
        for component in registry.iter() {
            if let Some(address) = component.address {
                manifest.contracts.insert(component.name.clone(), address);
            }
            manifest.components.insert(
                component.name.clone(),
                ComponentRecord {
                    status: component.status,
                    address: component.address,
                    tx_hash: component.tx_hash.clone(),
                    placeholders: component.placeholders.clone(),
                    error: component.error.clone(),
                },
            );
        }
        manifest
    }

    /// Per-component state. A `contracts` entry without a record (a manifest
    /// written by other tooling) counts as deployed, and fills in a record
    /// that has no address yet.
    pub fn record_for(&self, name: &str) -> Option<ComponentRecord> {
        if let Some(record) = self.components.get(name) {
            let mut record = record.clone();
            if record.address.is_none() {
                record.address = self.contracts.get(name).copied();
            }
            return Some(record);
        }
        self.contracts.get(name).map(|&address| ComponentRecord {
            status: ComponentStatus::Deployed,
            address: Some(address),
            tx_hash: None,
            placeholders: Vec::new(),
            error: None,
        })
    }

    /// First component whose construction may have landed without the run
    /// learning its address.
    pub fn unreconciled(&self) -> Option<&str> {
        self.components
            .iter()
            .find(|(name, record)| {
                record.status == ComponentStatus::Deploying
                    && record.address.is_none()
                    && !self.contracts.contains_key(*name)
                    && record
                        .error
                        .as_ref()
                        .is_some_and(|e| e.kind == ErrorKind::AmbiguousOutcome)
            })
            .map(|(name, _)| name.as_str())
    }

    /// Every component name the manifest knows, contracts first.
    pub fn component_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.contracts.keys().cloned().collect();
        for name in self.components.keys() {
            if !self.contracts.contains_key(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// Loads and atomically replaces a manifest file.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no manifest exists yet.
    pub fn load(&self) -> Result<Option<Manifest>, DeployError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(DeployError::ManifestIo {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| DeployError::ManifestCorrupt {
                path: self.path.clone(),
                message: e.to_string(),
            })
    }

    /// Write to a temp file in the same directory, fsync, then rename over
    /// the target. On any failure the previous file is left untouched.
    pub fn save(&self, manifest: &Manifest) -> Result<(), DeployError> {
        let json = serde_json::to_vec_pretty(manifest).map_err(|e| DeployError::ManifestIo {
            path: self.path.clone(),
            source: io::Error::other(e),
        })?;
        self.save_with(|file| {
            file.write_all(&json)?;
            file.write_all(b"\n")
        })
    }

    fn save_with(&self, write: impl FnOnce(&mut File) -> io::Result<()>) -> Result<(), DeployError> {
        let io_err = |source: io::Error| DeployError::ManifestIo {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".manifest-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(io_err)?;
        write(tmp.as_file_mut()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        // Make the rename itself durable.
        #[cfg(unix)]
        {
            if let Err(e) = File::open(&dir).and_then(|handle| handle.sync_all()) {
                tracing::warn!(
                    dir = %dir.display(),
                    error = %e,
                    "directory fsync failed; the rename may not survive a crash"
                );
            }
        }

        debug!(path = %self.path.display(), "manifest written");
        Ok(())
    }
}
