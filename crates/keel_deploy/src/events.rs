//! Structured progress reporting.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::state::{ComponentStatus, RunPhase};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted {
        phase: RunPhase,
    },
    StatusChanged {
        component: String,
        from: ComponentStatus,
        to: ComponentStatus,
    },
    PlaceholderSubstituted {
        component: String,
        target: String,
    },
    Retrying {
        operation: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    NonceRefreshed {
        nonce: u64,
    },
    WiringApplied {
        from: String,
        to: String,
        setter: String,
    },
    WiringSkipped {
        from: String,
        to: String,
        setter: String,
    },
    GrantApplied {
        grant: String,
    },
    GrantSkipped {
        grant: String,
    },
    ManifestSaved {
        phase: RunPhase,
    },
    Verified {
        component: String,
        passed: bool,
    },
}

/// Receives every [`ProgressEvent`] of a run, in order.
pub trait DeployObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Writes events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DeployObserver for TracingObserver {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PhaseStarted { phase } => info!(%phase, "phase started"),
            ProgressEvent::StatusChanged {
                component,
                from,
                to,
            } => info!(%component, %from, %to, "status changed"),
            ProgressEvent::PlaceholderSubstituted { component, target } => {
                info!(%component, %target, "placeholder substituted for deferred argument")
            }
            ProgressEvent::Retrying {
                operation,
                attempt,
                delay_ms,
                error,
            } => warn!(%operation, attempt, delay_ms, %error, "retrying"),
            ProgressEvent::NonceRefreshed { nonce } => warn!(nonce, "nonce refreshed"),
            ProgressEvent::WiringApplied { from, to, setter } => {
                info!(%from, %to, %setter, "wiring applied")
            }
            ProgressEvent::WiringSkipped { from, to, setter } => {
                debug!(%from, %to, %setter, "wiring already in place")
            }
            ProgressEvent::GrantApplied { grant } => info!(%grant, "role granted"),
            ProgressEvent::GrantSkipped { grant } => debug!(%grant, "role already held"),
            ProgressEvent::ManifestSaved { phase } => debug!(%phase, "manifest saved"),
            ProgressEvent::Verified { component, passed } => {
                if *passed {
                    info!(%component, "verified")
                } else {
                    warn!(%component, "verification failed")
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DeployObserver for NoopObserver {
    fn on_event(&self, _event: &ProgressEvent) {}
}
