//! Per-component and per-run state machines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one component:
/// `Pending → Deploying → Deployed → Wiring → Wired → Configured → Verified`,
/// with `Failed` reachable from any state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    #[default]
    Pending,
    Deploying,
    Deployed,
    Wiring,
    Wired,
    Configured,
    Verified,
    Failed,
}

impl ComponentStatus {
    /// Construction has been confirmed on the network.
    pub fn is_deployed(self) -> bool {
        matches!(
            self,
            Self::Deployed | Self::Wiring | Self::Wired | Self::Configured | Self::Verified
        )
    }

    /// Every setter owned by this component has been applied.
    pub fn is_wired(self) -> bool {
        matches!(self, Self::Wired | Self::Configured | Self::Verified)
    }

    /// Every grant on this component has been applied or found held.
    pub fn is_configured(self) -> bool {
        matches!(self, Self::Configured | Self::Verified)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Wiring => "wiring",
            Self::Wired => "wired",
            Self::Configured => "configured",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Process-level phase of a run:
/// `Planning → Deploying → Wiring → Configuring → Persisting → Verifying →
/// Done | Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Planning,
    Deploying,
    Wiring,
    Configuring,
    Persisting,
    Verifying,
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Deploying => "deploying",
            Self::Wiring => "wiring",
            Self::Configuring => "configuring",
            Self::Persisting => "persisting",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
