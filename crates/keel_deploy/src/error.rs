use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use keel_chain::{Address, NetworkError};

/// Errors that end a deployment run.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Constructor dependency cycle: {}", cycle.join(" -> "))]
    ConstructorCycle { cycle: Vec<String> },

    #[error("Invalid blueprint: {0}")]
    InvalidBlueprint(String),

    /// A read kept failing after every retry.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    TransientNetwork {
        operation: String,
        attempts: u32,
        source: NetworkError,
    },

    #[error("{operation} hit a sequencing conflict after refreshing the nonce: {source}")]
    SequencingConflict {
        operation: String,
        source: NetworkError,
    },

    /// An attempt failed after submission and a retry found its nonce used.
    #[error("{operation} may already be on chain after {attempts} attempt(s); reconcile before resuming: {source}")]
    AmbiguousOutcome {
        operation: String,
        attempts: u32,
        source: NetworkError,
    },

    #[error("{component} may already be deployed by an earlier run; record its address in the manifest or remove its entry before resuming")]
    Unreconciled { component: String },

    #[error("Deployer {identity} has insufficient balance: {detail}")]
    InsufficientBalance { identity: Address, detail: String },

    #[error("Not authorized to {operation}: {source}")]
    Authorization {
        operation: String,
        source: NetworkError,
    },

    #[error("Deploying {component} failed after {attempts} attempt(s): {source}")]
    DeployFailed {
        component: String,
        attempts: u32,
        source: NetworkError,
    },

    #[error("Wiring {from} -> {to} via {setter} failed after {attempts} attempt(s): {source}")]
    WireFailed {
        from: String,
        to: String,
        setter: String,
        attempts: u32,
        source: NetworkError,
    },

    #[error("Granting {grant} failed after {attempts} attempt(s): {source}")]
    ConfigureFailed {
        grant: String,
        attempts: u32,
        source: NetworkError,
    },

    #[error("{component} still holds a placeholder for {target} after wiring")]
    UnpatchedPlaceholder { component: String, target: String },

    #[error("Manifest I/O on {}: {source}", path.display())]
    ManifestIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Manifest {} is unreadable: {message}", path.display())]
    ManifestCorrupt { path: PathBuf, message: String },

    #[error("Manifest {} already exists; pass --resume to continue from it", path.display())]
    ManifestExists { path: PathBuf },

    #[error("Manifest targets {found}, this run targets {expected}")]
    ManifestMismatch { expected: String, found: String },

    #[error("{failed} component(s) failed verification")]
    Verification { failed: usize },

    #[error("Cancelled before {0}")]
    Cancelled(String),

    #[error("Credentials error: {0}")]
    Credentials(String),
}

/// Classification of [`DeployError`] for reports and exit handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConstructorCycle,
    InvalidBlueprint,
    TransientNetwork,
    SequencingConflict,
    AmbiguousOutcome,
    InsufficientBalance,
    Authorization,
    DeployFailed,
    WireFailed,
    ConfigureFailed,
    UnpatchedPlaceholder,
    ManifestIo,
    ManifestMismatch,
    Verification,
    Cancelled,
    Credentials,
}

impl ErrorKind {
    /// Errors caused by the inputs rather than the network. The CLI maps these
    /// to the usage exit code.
    pub fn is_configuration(self) -> bool {
        matches!(
            self,
            Self::ConstructorCycle | Self::InvalidBlueprint | Self::Credentials
        )
    }
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConstructorCycle { .. } => ErrorKind::ConstructorCycle,
            Self::InvalidBlueprint(_) => ErrorKind::InvalidBlueprint,
            Self::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Self::SequencingConflict { .. } => ErrorKind::SequencingConflict,
            Self::AmbiguousOutcome { .. } | Self::Unreconciled { .. } => {
                ErrorKind::AmbiguousOutcome
            }
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::DeployFailed { .. } => ErrorKind::DeployFailed,
            Self::WireFailed { .. } => ErrorKind::WireFailed,
            Self::ConfigureFailed { .. } => ErrorKind::ConfigureFailed,
            Self::UnpatchedPlaceholder { .. } => ErrorKind::UnpatchedPlaceholder,
            Self::ManifestIo { .. } | Self::ManifestCorrupt { .. } => ErrorKind::ManifestIo,
            Self::ManifestExists { .. } | Self::ManifestMismatch { .. } => {
                ErrorKind::ManifestMismatch
            }
            Self::Verification { .. } => ErrorKind::Verification,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Credentials(_) => ErrorKind::Credentials,
        }
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Terminal error kind + message, as recorded in the manifest and report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub message: String,
}
