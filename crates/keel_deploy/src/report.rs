use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use keel_chain::Address;

use crate::error::ErrorSummary;
use crate::registry::ComponentRegistry;
use crate::state::{ComponentStatus, RunPhase};
use crate::verifier::VerificationReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentReport {
    pub name: String,
    pub status: ComponentStatus,
    pub address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

/// End-of-run summary: each component's final status and, for failures, the
/// terminal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub outcome: RunPhase,
    pub network: String,
    pub chain_id: Option<u64>,
    pub manifest: PathBuf,
    pub components: Vec<ComponentReport>,
    /// Mutating calls confirmed during this run.
    pub submitted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
}

impl RunReport {
    pub(crate) fn components_from(registry: &ComponentRegistry) -> Vec<ComponentReport> {
        registry
            .iter()
            .map(|c| ComponentReport {
                name: c.name.clone(),
                status: c.status,
                address: c.address,
                error: c.error.clone(),
            })
            .collect()
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunPhase::Done
    }

    /// 0 on success, 2 for configuration errors, 1 for any other failure.
    pub fn exit_code(&self) -> i32 {
        match (&self.error, self.succeeded()) {
            (_, true) => 0,
            (Some(e), false) if e.kind.is_configuration() => 2,
            _ => 1,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn count(&self, status: ComponentStatus) -> usize {
        self.components.iter().filter(|c| c.status == status).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain = self
            .chain_id
            .map(|id| format!(", chain {id}"))
            .unwrap_or_default();
        writeln!(
            f,
            "Run {} on {}{chain} ({} mutation(s) submitted)",
            self.outcome.label().to_uppercase(),
            self.network,
            self.submitted
        )?;
        for c in &self.components {
            let address = c
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".into());
            writeln!(f, "  {:<20} {:<11} {address}", c.name, c.status.label())?;
            if let Some(err) = &c.error {
                writeln!(f, "      {:?}: {}", err.kind, err.message)?;
            }
        }
        if let Some(err) = &self.error {
            writeln!(f, "Error: {}", err.message)?;
        }
        if let Some(verification) = &self.verification {
            write!(f, "{verification}")?;
        }
        write!(f, "Manifest: {}", self.manifest.display())
    }
}
