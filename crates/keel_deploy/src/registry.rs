use std::collections::HashMap;

use tracing::warn;

use keel_chain::{Address, Deployment};

use crate::blueprint::{ArgDecl, Blueprint};
use crate::error::{DeployError, ErrorSummary};
use crate::manifest::Manifest;
use crate::state::ComponentStatus;

/// A declared component and what is known about it so far.
#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub artifact: String,
    pub args: Vec<ArgDecl>,
    pub address: Option<Address>,
    pub status: ComponentStatus,
    pub tx_hash: Option<String>,
    /// Components whose address was replaced by the placeholder at
    /// construction and still awaits its wiring setter.
    pub placeholders: Vec<String>,
    pub error: Option<ErrorSummary>,
}

/// Name-keyed record of every component in a run. Mutated only by the
/// orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    components: Vec<Component>,
    index: HashMap<String, usize>,
}

impl ComponentRegistry {
    pub fn from_blueprint(blueprint: &Blueprint) -> Result<Self, DeployError> {
        let mut registry = Self::default();
        for decl in &blueprint.components {
            if registry.index.contains_key(&decl.name) {
                return Err(DeployError::InvalidBlueprint(format!(
                    "duplicate component name '{}'",
                    decl.name
                )));
            }
            registry
                .index
                .insert(decl.name.clone(), registry.components.len());
            registry.components.push(Component {
                name: decl.name.clone(),
                artifact: decl.artifact_ref().to_string(),
                args: decl.args.clone(),
                address: None,
                status: ComponentStatus::Pending,
                tx_hash: None,
                placeholders: Vec::new(),
                error: None,
            });
        }
        Ok(registry)
    }

    /// Carry over progress recorded by an earlier run. A record with an
    /// address is never constructed again: it resumes from its recorded
    /// status, or from `Deployed` if it failed after construction. Records
    /// without an address start again from `Pending`.
    pub fn seed_from_manifest(&mut self, manifest: &Manifest) {
        for component in &mut self.components {
            let Some(record) = manifest.record_for(&component.name) else {
                continue;
            };
            match (record.status, record.address) {
                (status, Some(address)) => {
                    component.status = if status.is_deployed() {
                        status
                    } else {
                        ComponentStatus::Deployed
                    };
                    component.address = Some(address);
                    component.tx_hash = record.tx_hash.clone();
                    component.placeholders = record.placeholders.clone();
                }
                (ComponentStatus::Deploying, None) => {
                    warn!(
                        component = %component.name,
                        "previous run stopped mid-deployment; the earlier submission may have landed"
                    );
                }
                _ => {}
            }
        }
        for name in manifest.contracts.keys() {
            if !self.index.contains_key(name) {
                warn!(component = %name, "manifest entry not in blueprint; ignoring");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Component> {
        self.index.get(name).map(|&i| &self.components[i])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Component> {
        self.index.get(name).map(|&i| &mut self.components[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.get(name).and_then(|c| c.address)
    }

    pub fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.get(name).map(|c| c.status)
    }

    /// Move `name` to `status`, returning the previous status.
    pub fn set_status(&mut self, name: &str, status: ComponentStatus) -> Option<ComponentStatus> {
        let component = self.get_mut(name)?;
        let previous = component.status;
        component.status = status;
        if status != ComponentStatus::Failed {
            component.error = None;
        }
        Some(previous)
    }

    pub fn record_deployment(&mut self, name: &str, deployment: &Deployment) {
        if let Some(component) = self.get_mut(name) {
            component.address = Some(deployment.address);
            component.tx_hash = Some(deployment.tx_hash.clone());
            component.status = ComponentStatus::Deployed;
            component.error = None;
        }
    }

    pub fn record_placeholder(&mut self, name: &str, target: &str) {
        if let Some(component) = self.get_mut(name) {
            if !component.placeholders.iter().any(|t| t == target) {
                component.placeholders.push(target.to_string());
            }
        }
    }

    /// The wiring setter for `target` has been applied on `name`.
    pub fn clear_placeholder(&mut self, name: &str, target: &str) {
        if let Some(component) = self.get_mut(name) {
            component.placeholders.retain(|t| t != target);
        }
    }

    pub fn mark_failed(&mut self, name: &str, error: ErrorSummary) -> Option<ComponentStatus> {
        let component = self.get_mut(name)?;
        let previous = component.status;
        component.status = ComponentStatus::Failed;
        component.error = Some(error);
        Some(previous)
    }

    /// Attach an error without changing status (verification failures).
    pub fn note_error(&mut self, name: &str, error: ErrorSummary) {
        if let Some(component) = self.get_mut(name) {
            component.error = Some(error);
        }
    }

    /// First component still holding a placeholder, with its target.
    pub fn first_unpatched(&self) -> Option<(&str, &str)> {
        self.components.iter().find_map(|c| {
            c.placeholders
                .first()
                .map(|target| (c.name.as_str(), target.as_str()))
        })
    }
}
