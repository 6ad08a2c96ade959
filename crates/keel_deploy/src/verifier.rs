//! Post-hoc, read-only confirmation that a manifest matches the network.

use std::collections::BTreeMap;
use std::fmt;

use futures::future::join_all;
use serde::Serialize;
use tracing::debug;

use keel_chain::abi::{self, AbiValue};
use keel_chain::{Address, NetworkClient};

use crate::blueprint::Blueprint;
use crate::error::DeployError;
use crate::events::{DeployObserver, ProgressEvent};
use crate::manifest::Manifest;
use crate::retry::{RetryPolicy, retry_read};

const NO_ARGS: &[AbiValue] = &[];

/// What a probe's return value is compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Any successful return passes.
    Any,
    Equals(AbiValue),
    /// The expected value refers to a component the manifest has no address for.
    Unresolvable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub method: String,
    pub expect: Expectation,
}

/// Build probes from the blueprint, resolving `ref` expectations against the
/// manifest's addresses.
pub fn probes_from_blueprint(blueprint: &Blueprint, manifest: &Manifest) -> BTreeMap<String, Probe> {
    let mut probes = BTreeMap::new();
    for component in &blueprint.components {
        let Some(decl) = &component.probe else {
            continue;
        };
        let expect = match &decl.expect {
            None => Expectation::Any,
            Some(arg) => match arg.target() {
                Some(target) => match manifest.contracts.get(target) {
                    Some(address) => Expectation::Equals(AbiValue::Address(*address)),
                    None => Expectation::Unresolvable(target.to_string()),
                },
                None => match arg.literal_value() {
                    Ok(Some(value)) => Expectation::Equals(value),
                    Ok(None) => Expectation::Any,
                    Err(e) => Expectation::Unresolvable(e),
                },
            },
        };
        probes.insert(
            component.name.clone(),
            Probe {
                method: decl.method.clone(),
                expect,
            },
        );
    }
    probes
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VerificationFailure {
    /// The manifest holds no address for the component.
    NotDeployed,
    EmptyCode,
    Network { message: String },
    ProbeFailed { method: String, message: String },
    ProbeMismatch {
        method: String,
        expected: String,
        actual: String,
    },
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotDeployed => f.write_str("not deployed"),
            Self::EmptyCode => f.write_str("no code at address"),
            Self::Network { message } => write!(f, "network error: {message}"),
            Self::ProbeFailed { method, message } => write!(f, "probe {method} failed: {message}"),
            Self::ProbeMismatch {
                method,
                expected,
                actual,
            } => write!(f, "probe {method} returned {actual}, expected {expected}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentVerification {
    pub name: String,
    pub address: Option<Address>,
    pub code_size: usize,
    pub probed: bool,
    pub failure: Option<VerificationFailure>,
}

impl ComponentVerification {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub network: String,
    pub chain_id: u64,
    pub components: Vec<ComponentVerification>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.components.iter().all(ComponentVerification::passed)
    }

    pub fn failed_count(&self) -> usize {
        self.components.iter().filter(|c| !c.passed()).count()
    }

    pub fn get(&self, name: &str) -> Option<&ComponentVerification> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Process exit signal: 0 when every component verified.
    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Verification ({}, chain {}): {}/{} passed",
            self.network,
            self.chain_id,
            self.components.len() - self.failed_count(),
            self.components.len()
        )?;
        for c in &self.components {
            let address = c
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".into());
            match &c.failure {
                None => writeln!(f, "  ok    {:<20} {address} ({} bytes)", c.name, c.code_size)?,
                Some(failure) => writeln!(f, "  FAIL  {:<20} {address} {failure}", c.name)?,
            }
        }
        Ok(())
    }
}

pub struct Verifier<'a, C: NetworkClient + ?Sized> {
    client: &'a C,
    policy: &'a RetryPolicy,
    observer: &'a dyn DeployObserver,
    probes: BTreeMap<String, Probe>,
}

impl<'a, C: NetworkClient + ?Sized> Verifier<'a, C> {
    pub fn new(client: &'a C, policy: &'a RetryPolicy, observer: &'a dyn DeployObserver) -> Self {
        Self {
            client,
            policy,
            observer,
            probes: BTreeMap::new(),
        }
    }

    pub fn with_probes(mut self, probes: BTreeMap<String, Probe>) -> Self {
        self.probes = probes;
        self
    }

    /// Refuse to verify a manifest against an endpoint on another chain.
    pub async fn check_chain(&self, manifest: &Manifest) -> Result<u64, DeployError> {
        let operation = "chain id";
        let chain_id = retry_read(self.policy, self.observer, operation, || {
            self.client.chain_id()
        })
        .await
        .map_err(|f| DeployError::TransientNetwork {
            operation: operation.to_string(),
            attempts: f.attempts,
            source: f.error,
        })?;
        if chain_id != manifest.chain_id {
            return Err(DeployError::ManifestMismatch {
                expected: format!("chain {}", manifest.chain_id),
                found: format!("endpoint on chain {chain_id}"),
            });
        }
        Ok(chain_id)
    }

    /// Check every manifest entry concurrently. Never writes anything.
    pub async fn verify(&self, manifest: &Manifest) -> VerificationReport {
        let names = manifest.component_names();
        let checks = names.iter().map(|name| {
            let address = manifest.record_for(name).and_then(|r| r.address);
            self.verify_one(name, address)
        });
        let components = join_all(checks).await;
        for c in &components {
            self.observer.on_event(&ProgressEvent::Verified {
                component: c.name.clone(),
                passed: c.passed(),
            });
        }
        VerificationReport {
            network: manifest.network.clone(),
            chain_id: manifest.chain_id,
            components,
        }
    }

    async fn verify_one(&self, name: &str, address: Option<Address>) -> ComponentVerification {
        let mut result = ComponentVerification {
            name: name.to_string(),
            address,
            code_size: 0,
            probed: false,
            failure: None,
        };
        let Some(address) = address else {
            result.failure = Some(VerificationFailure::NotDeployed);
            return result;
        };

        let operation = format!("code check for {name}");
        let code = retry_read(self.policy, self.observer, &operation, || {
            self.client.get_code(address)
        })
        .await;
        match code {
            Ok(code) if code.is_empty() => {
                result.failure = Some(VerificationFailure::EmptyCode);
                return result;
            }
            Ok(code) => result.code_size = code.len(),
            Err(failure) => {
                result.failure = Some(VerificationFailure::Network {
                    message: failure.error.to_string(),
                });
                return result;
            }
        }

        if let Some(probe) = self.probes.get(name) {
            result.probed = true;
            result.failure = self.run_probe(name, address, probe).await;
        }
        debug!(component = %name, passed = result.passed(), "verified");
        result
    }

    async fn run_probe(
        &self,
        name: &str,
        address: Address,
        probe: &Probe,
    ) -> Option<VerificationFailure> {
        let operation = format!("probe {} on {name}", probe.method);
        let raw = match retry_read(self.policy, self.observer, &operation, || {
            self.client.call(address, &probe.method, NO_ARGS)
        })
        .await
        {
            Ok(raw) => raw,
            Err(failure) => {
                return Some(VerificationFailure::ProbeFailed {
                    method: probe.method.clone(),
                    message: failure.error.to_string(),
                });
            }
        };

        match &probe.expect {
            Expectation::Any => None,
            Expectation::Unresolvable(reason) => Some(VerificationFailure::ProbeFailed {
                method: probe.method.clone(),
                message: format!("cannot resolve expected value: {reason}"),
            }),
            Expectation::Equals(value) => {
                let expected = abi::encode(std::slice::from_ref(value));
                if raw == expected {
                    None
                } else {
                    Some(VerificationFailure::ProbeMismatch {
                        method: probe.method.clone(),
                        expected: format!("0x{}", hex_string(&expected)),
                        actual: format!("0x{}", hex_string(&raw)),
                    })
                }
            }
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopObserver;
    use crate::manifest::ComponentRecord;
    use crate::state::ComponentStatus;
    use crate::testing::{MockNetwork, fast_policy};
    use keel_chain::TxContext;

    fn deployer() -> Address {
        Address::from_bytes([0xdd; 20])
    }

    async fn deploy(mock: &MockNetwork, name: &str, nonce: u64) -> Address {
        mock.deploy(
            name,
            NO_ARGS,
            TxContext {
                from: deployer(),
                nonce,
            },
        )
        .await
        .unwrap()
        .address
    }

    #[tokio::test]
    async fn live_components_pass() {
        let mock = MockNetwork::new();
        let mut manifest = Manifest::new("localhost", 31337, deployer());
        for (i, name) in ["A", "B"].into_iter().enumerate() {
            let address = deploy(&mock, name, i as u64).await;
            manifest.contracts.insert(name.into(), address);
        }
        let policy = fast_policy();
        let report = Verifier::new(&mock, &policy, &NoopObserver)
            .verify(&manifest)
            .await;
        assert!(report.passed());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.components.len(), 2);
        assert!(report.get("A").unwrap().code_size > 0);
        assert_eq!(mock.mutating_calls(), 2);
    }

    #[tokio::test]
    async fn endpoint_on_another_chain_is_refused() {
        let mock = MockNetwork::new();
        let manifest = Manifest::new("localhost", 31337, deployer());
        let policy = fast_policy();
        let verifier = Verifier::new(&mock, &policy, &NoopObserver);
        assert_eq!(verifier.check_chain(&manifest).await.unwrap(), 31337);

        mock.set_chain_id(1);
        let err = verifier.check_chain(&manifest).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ManifestMismatch);
        assert!(err.to_string().contains("endpoint on chain 1"));
        assert_eq!(mock.total_calls(), mock.reads());
    }

    #[tokio::test]
    async fn empty_code_is_flagged_and_manifest_untouched() {
        let mock = MockNetwork::new();
        let mut manifest = Manifest::new("localhost", 31337, deployer());
        let a = deploy(&mock, "A", 0).await;
        let b = deploy(&mock, "B", 1).await;
        manifest.contracts.insert("A".into(), a);
        manifest.contracts.insert("B".into(), b);
        mock.wipe_code(b);
        let snapshot = manifest.clone();

        let policy = fast_policy();
        let report = Verifier::new(&mock, &policy, &NoopObserver)
            .verify(&manifest)
            .await;
        assert!(!report.passed());
        assert_eq!(report.exit_code(), 1);
        assert!(report.get("A").unwrap().passed());
        assert_eq!(
            report.get("B").unwrap().failure,
            Some(VerificationFailure::EmptyCode)
        );
        assert_eq!(manifest, snapshot);
        assert!(report.to_string().contains("FAIL"));
    }

    #[tokio::test]
    async fn never_deployed_components_fail() {
        let mock = MockNetwork::new();
        let mut manifest = Manifest::new("localhost", 31337, deployer());
        manifest.components.insert(
            "Late".into(),
            ComponentRecord {
                status: ComponentStatus::Pending,
                address: None,
                tx_hash: None,
                placeholders: Vec::new(),
                error: None,
            },
        );
        let policy = fast_policy();
        let report = Verifier::new(&mock, &policy, &NoopObserver)
            .verify(&manifest)
            .await;
        assert_eq!(
            report.get("Late").unwrap().failure,
            Some(VerificationFailure::NotDeployed)
        );
        assert_eq!(mock.reads(), 0);
    }

    #[tokio::test]
    async fn probe_compares_expected_address() {
        let mock = MockNetwork::new();
        let token = deploy(&mock, "Token", 0).await;
        let vault = deploy(&mock, "Vault", 1).await;
        mock.set_slot(vault, "asset", token);

        let bp = Blueprint::from_json(
            r#"{"components":[
                {"name":"Token"},
                {"name":"Vault","probe":{"method":"asset()","expect":{"type":"address","ref":"Token"}}},
                {"name":"Oracle","probe":{"method":"asset()","expect":{"type":"address","ref":"Token"}}}
            ]}"#,
        )
        .unwrap();
        let mut manifest = Manifest::new("localhost", 31337, deployer());
        manifest.contracts.insert("Token".into(), token);
        manifest.contracts.insert("Vault".into(), vault);
        manifest.contracts.insert("Oracle".into(), token);

        let probes = probes_from_blueprint(&bp, &manifest);
        assert_eq!(
            probes["Vault"].expect,
            Expectation::Equals(AbiValue::Address(token))
        );

        let policy = fast_policy();
        let report = Verifier::new(&mock, &policy, &NoopObserver)
            .with_probes(probes)
            .verify(&manifest)
            .await;
        let vault_check = report.get("Vault").unwrap();
        assert!(vault_check.probed);
        assert!(vault_check.passed());
        // Token has no `asset` slot, so the probe call reverts.
        assert!(matches!(
            report.get("Oracle").unwrap().failure,
            Some(VerificationFailure::ProbeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn probe_mismatch_reports_both_values() {
        let mock = MockNetwork::new();
        let token = deploy(&mock, "Token", 0).await;
        let vault = deploy(&mock, "Vault", 1).await;
        mock.set_slot(vault, "asset", vault);

        let mut manifest = Manifest::new("localhost", 31337, deployer());
        manifest.contracts.insert("Vault".into(), vault);
        let probes = BTreeMap::from([(
            "Vault".to_string(),
            Probe {
                method: "asset()".into(),
                expect: Expectation::Equals(AbiValue::Address(token)),
            },
        )]);
        let policy = fast_policy();
        let report = Verifier::new(&mock, &policy, &NoopObserver)
            .with_probes(probes)
            .verify(&manifest)
            .await;
        match &report.get("Vault").unwrap().failure {
            Some(VerificationFailure::ProbeMismatch { expected, actual, .. }) => {
                assert_ne!(expected, actual);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }
}
