//! Idempotent role grants on AccessControl-style components.

use keel_chain::abi::{self, AbiError, AbiValue};
use keel_chain::{Address, NetworkClient};

use crate::blueprint::{RoleGrant, Subject};
use crate::error::DeployError;
use crate::events::{DeployObserver, ProgressEvent};
use crate::registry::ComponentRegistry;
use crate::retry::{RetryPolicy, retry_read};
use crate::signer::{Operation, SignerCursor};

pub const HAS_ROLE: &str = "hasRole(bytes32,address)";
pub const GRANT_ROLE: &str = "grantRole(bytes32,address)";
pub const DEFAULT_ADMIN_ROLE: &str = "DEFAULT_ADMIN_ROLE";

/// 32-byte role identifier: a `0x` literal, the all-zero admin role, or the
/// keccak-256 hash of the role name.
pub fn role_id(role: &str) -> Result<[u8; 32], AbiError> {
    let role = role.trim();
    if role.is_empty() {
        return Err(AbiError::InvalidLiteral {
            ty: "role".into(),
            value: role.into(),
        });
    }
    if role == DEFAULT_ADMIN_ROLE {
        return Ok([0u8; 32]);
    }
    if role.starts_with("0x") {
        return abi::parse_bytes32(role);
    }
    Ok(abi::keccak256(role.as_bytes()))
}

/// A grant with every name resolved to an on-chain value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGrant {
    pub grant: RoleGrant,
    pub resource: Address,
    pub subject: Address,
    pub role: [u8; 32],
}

impl ResolvedGrant {
    fn args(&self) -> [AbiValue; 2] {
        [AbiValue::Bytes32(self.role), AbiValue::Address(self.subject)]
    }
}

/// Resolve component names against the registry. Every referenced
/// component must already be deployed.
pub fn resolve_grants(
    grants: &[RoleGrant],
    registry: &ComponentRegistry,
    deployer: Address,
) -> Result<Vec<ResolvedGrant>, DeployError> {
    let address_of = |name: &str| {
        registry.address_of(name).ok_or_else(|| {
            DeployError::InvalidBlueprint(format!("grant references undeployed component '{name}'"))
        })
    };
    grants
        .iter()
        .map(|grant| {
            let subject = match &grant.subject {
                Subject::Deployer => deployer,
                Subject::Address(address) => *address,
                Subject::Component(name) => address_of(name.as_str())?,
            };
            let role = role_id(&grant.role)
                .map_err(|e| DeployError::InvalidBlueprint(format!("grant {grant}: {e}")))?;
            Ok(ResolvedGrant {
                grant: grant.clone(),
                resource: address_of(grant.resource.as_str())?,
                subject,
                role,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Applied,
    AlreadyHeld,
}

pub struct RoleConfigurator<'a, C: NetworkClient + ?Sized> {
    client: &'a C,
    policy: &'a RetryPolicy,
    observer: &'a dyn DeployObserver,
}

impl<'a, C: NetworkClient + ?Sized> RoleConfigurator<'a, C> {
    pub fn new(client: &'a C, policy: &'a RetryPolicy, observer: &'a dyn DeployObserver) -> Self {
        Self {
            client,
            policy,
            observer,
        }
    }

    /// Read-only check whether the subject already holds the role.
    pub async fn is_held(&self, grant: &ResolvedGrant) -> Result<bool, DeployError> {
        let args = grant.args();
        let operation = format!("hasRole check for {}", grant.grant);
        let raw = retry_read(self.policy, self.observer, &operation, || {
            self.client.call(grant.resource, HAS_ROLE, &args)
        })
        .await
        .map_err(|f| DeployError::TransientNetwork {
            operation: operation.clone(),
            attempts: f.attempts,
            source: f.error,
        })?;
        abi::decode_bool(&raw).map_err(|e| DeployError::ConfigureFailed {
            grant: grant.grant.to_string(),
            attempts: 1,
            source: e.into(),
        })
    }

    /// Apply `grant` unless already held. At most one mutating call.
    pub async fn apply(
        &self,
        cursor: &mut SignerCursor<'_, C>,
        grant: &ResolvedGrant,
    ) -> Result<GrantOutcome, DeployError> {
        let label = grant.grant.to_string();
        if self.is_held(grant).await? {
            self.observer
                .on_event(&ProgressEvent::GrantSkipped { grant: label });
            return Ok(GrantOutcome::AlreadyHeld);
        }

        let identity = cursor.identity();
        let args = grant.args();
        let client = self.client;
        let resource = grant.resource;
        let args_ref = &args;
        cursor
            .submit(&format!("grant {label}"), move |tx| {
                client.send(resource, GRANT_ROLE, args_ref, tx)
            })
            .await
            .map_err(|failure| {
                Operation::Grant {
                    grant: label.clone(),
                }
                .escalate(failure, identity)
            })?;
        self.observer
            .on_event(&ProgressEvent::GrantApplied { grant: label });
        Ok(GrantOutcome::Applied)
    }
}
