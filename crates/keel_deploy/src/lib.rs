//! Keel Deploy -- declarative multi-component deployment orchestration.
//!
//! A [`Blueprint`] names the components to construct, the constructor-time
//! and post-construction ("wiring") edges between them, and the role grants
//! to configure afterwards. The [`Orchestrator`] drives the run:
//!
//! 1. **Planning**: build the [`DependencyGraph`]; constructor cycles are fatal.
//! 2. **Deploying**: construct components in dependency order, substituting
//!    the zero address for partners that will be wired later.
//! 3. **Wiring**: call setters to close circular references.
//! 4. **Configuring**: apply role grants not already held.
//! 5. **Persisting**: the [`Manifest`] is rewritten atomically after every step.
//! 6. **Verifying**: the [`Verifier`] checks every recorded address.
//!
//! Re-running against an existing manifest skips completed work, so a run
//! that failed halfway can simply be resumed.

pub mod blueprint;
pub mod error;
pub mod events;
pub mod graph;
pub mod manifest;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod retry;
pub mod roles;
pub mod signer;
pub mod state;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testing;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use blueprint::{ArgDecl, Blueprint, ComponentDecl, EdgeDecl, EdgeKind, ProbeDecl, RoleGrant, Subject};
pub use error::{DeployError, ErrorKind, ErrorSummary};
pub use events::{DeployObserver, NoopObserver, ProgressEvent, TracingObserver};
pub use graph::{DependencyGraph, Plan, WiringEdge};
pub use manifest::{ComponentRecord, Manifest, ManifestStore};
pub use orchestrator::{Orchestrator, RunSettings};
pub use registry::{Component, ComponentRegistry};
pub use report::{ComponentReport, RunReport};
pub use retry::RetryPolicy;
pub use roles::RoleConfigurator;
pub use signer::{CancelFlag, SignerCursor};
pub use state::{ComponentStatus, RunPhase};
pub use verifier::{ComponentVerification, VerificationFailure, VerificationReport, Verifier};
