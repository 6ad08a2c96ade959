//! Drives a run through its phases:
//! `Planning → Deploying → Wiring → Configuring → Persisting → Verifying`.
//!
//! The orchestrator is the single writer of the registry and the manifest.
//! The manifest is rewritten after every phase transition and after every
//! per-component completion, so an interrupted run always leaves a record of
//! exactly the work that finished.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};

use keel_chain::abi::{self, AbiValue};
use keel_chain::{Address, NetworkClient, NetworkError};

use crate::blueprint::{ArgSource, Blueprint};
use crate::error::{DeployError, ErrorKind, ErrorSummary};
use crate::events::{DeployObserver, ProgressEvent, TracingObserver};
use crate::graph::{DependencyGraph, WiringEdge};
use crate::manifest::{Manifest, ManifestStore};
use crate::registry::ComponentRegistry;
use crate::report::RunReport;
use crate::retry::{RetryPolicy, retry_read};
use crate::roles::{RoleConfigurator, resolve_grants};
use crate::signer::{CancelFlag, Operation, SignerCursor};
use crate::state::{ComponentStatus, RunPhase};
use crate::verifier::{Verifier, probes_from_blueprint};

const NO_ARGS: &[AbiValue] = &[];

/// Per-run inputs that do not come from the blueprint.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub network: String,
    /// Expected chain id; `None` accepts whatever the endpoint reports.
    pub chain_id: Option<u64>,
    pub deployer: Address,
    /// Continue from an existing manifest instead of refusing to overwrite it.
    pub resume: bool,
    pub retry: RetryPolicy,
    /// Minimum deployer balance (wei) required before the first deploy.
    pub min_balance: u128,
}

/// Mutable state of one run.
struct Run {
    registry: ComponentRegistry,
    phase: RunPhase,
    chain_id: Option<u64>,
    block_number: u64,
    /// Set once the chain id is known; before that nothing is written.
    persistable: bool,
    submitted: u64,
    verification: Option<crate::verifier::VerificationReport>,
}

pub struct Orchestrator<C: NetworkClient + ?Sized> {
    client: Arc<C>,
    blueprint: Blueprint,
    store: ManifestStore,
    settings: RunSettings,
    observer: Arc<dyn DeployObserver>,
    cancel: CancelFlag,
}

impl<C: NetworkClient + ?Sized> Orchestrator<C> {
    pub fn new(
        client: Arc<C>,
        blueprint: Blueprint,
        store: ManifestStore,
        settings: RunSettings,
    ) -> Self {
        Self {
            client,
            blueprint,
            store,
            settings,
            observer: Arc::new(TracingObserver),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DeployObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Execute the run to `Done` or `Failed`. Errors are reported in the
    /// returned [`RunReport`], never panicked or swallowed.
    pub async fn run(&self) -> RunReport {
        let mut run = Run {
            registry: ComponentRegistry::default(),
            phase: RunPhase::Planning,
            chain_id: None,
            block_number: 0,
            persistable: false,
            submitted: 0,
            verification: None,
        };

        let mut failure = match self.drive(&mut run).await {
            Ok(()) => {
                run.phase = RunPhase::Done;
                None
            }
            Err(e) => {
                error!(phase = %run.phase, kind = ?e.kind(), error = %e, "run failed");
                run.phase = RunPhase::Failed;
                Some(e)
            }
        };

        if run.persistable {
            if let Err(e) = self.persist(&run) {
                error!(error = %e, "could not write the final manifest");
                if failure.is_none() {
                    run.phase = RunPhase::Failed;
                    failure = Some(e);
                }
            }
        }
        self.observer
            .on_event(&ProgressEvent::PhaseStarted { phase: run.phase });
        info!(outcome = %run.phase, submitted = run.submitted, "run finished");

        RunReport {
            outcome: run.phase,
            network: self.settings.network.clone(),
            chain_id: run.chain_id,
            manifest: self.store.path().to_path_buf(),
            components: RunReport::components_from(&run.registry),
            submitted: run.submitted,
            error: failure.map(|e| e.summary()),
            verification: run.verification,
        }
    }

    async fn drive(&self, run: &mut Run) -> Result<(), DeployError> {
        self.enter(run, RunPhase::Planning)?;
        self.blueprint.validate()?;
        run.registry = ComponentRegistry::from_blueprint(&self.blueprint)?;
        let graph = DependencyGraph::build(&self.blueprint)?;
        let order = graph.deployment_order()?;
        info!(order = ?order, "deployment order");

        let previous = self.store.load()?;
        if let Some(manifest) = &previous {
            if !self.settings.resume {
                return Err(DeployError::ManifestExists {
                    path: self.store.path().to_path_buf(),
                });
            }
            if !manifest.network.eq_ignore_ascii_case(&self.settings.network) {
                return Err(DeployError::ManifestMismatch {
                    expected: format!("network {}", self.settings.network),
                    found: format!("network {}", manifest.network),
                });
            }
        }

        let chain_id = self.read("chain id", || self.client.chain_id()).await?;
        if let Some(expected) = self.settings.chain_id {
            if expected != chain_id {
                return Err(DeployError::ManifestMismatch {
                    expected: format!("chain {expected}"),
                    found: format!("endpoint on chain {chain_id}"),
                });
            }
        }
        if let Some(manifest) = &previous {
            if manifest.chain_id != chain_id {
                return Err(DeployError::ManifestMismatch {
                    expected: format!("chain {chain_id}"),
                    found: format!("chain {}", manifest.chain_id),
                });
            }
            if let Some(component) = manifest.unreconciled() {
                return Err(DeployError::Unreconciled {
                    component: component.to_string(),
                });
            }
            if manifest.deployer != self.settings.deployer {
                warn!(
                    previous = %manifest.deployer,
                    current = %self.settings.deployer,
                    "resuming with a different deployer identity"
                );
            }
            run.registry.seed_from_manifest(manifest);
            info!(path = %self.store.path().display(), "resuming from manifest");
        }
        run.chain_id = Some(chain_id);
        run.block_number = self.read("block number", || self.client.block_number()).await?;
        run.persistable = true;
        self.persist(run)?;

        let mut cursor = SignerCursor::new(
            &*self.client,
            self.settings.deployer,
            &self.settings.retry,
            &*self.observer,
            &self.cancel,
        );
        let result = self.execute(run, &graph, &order, &mut cursor).await;
        run.submitted = cursor.submitted();
        result
    }

    async fn execute(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        order: &[String],
        cursor: &mut SignerCursor<'_, C>,
    ) -> Result<(), DeployError> {
        self.deploy_all(run, graph, order, cursor).await?;
        self.wire_all(run, graph, order, cursor).await?;
        self.configure_all(run, order, cursor).await?;

        self.enter(run, RunPhase::Persisting)?;
        run.block_number = self.read("block number", || self.client.block_number()).await?;
        self.persist(run)?;

        self.verify_all(run).await
    }

    // -----------------------------------------------------------------------
    // Deploying
    // -----------------------------------------------------------------------

    async fn deploy_all(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        order: &[String],
        cursor: &mut SignerCursor<'_, C>,
    ) -> Result<(), DeployError> {
        self.enter(run, RunPhase::Deploying)?;
        let pending: Vec<&String> = order
            .iter()
            .filter(|name| {
                !run.registry
                    .status_of(name)
                    .is_some_and(ComponentStatus::is_deployed)
            })
            .collect();
        if pending.is_empty() {
            info!("every component is already deployed");
            return Ok(());
        }

        self.check_balance().await?;
        for name in pending {
            self.deploy_one(run, graph, name, cursor).await?;
        }
        Ok(())
    }

    async fn check_balance(&self) -> Result<(), DeployError> {
        let required = self.settings.min_balance;
        if required == 0 {
            return Ok(());
        }
        let identity = self.settings.deployer;
        let balance = self
            .read("balance check", || self.client.get_balance(identity))
            .await?;
        if balance < required {
            return Err(DeployError::InsufficientBalance {
                identity,
                detail: format!("{balance} wei available, {required} wei required"),
            });
        }
        info!(%identity, balance, required, "balance check passed");
        Ok(())
    }

    async fn deploy_one(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        name: &str,
        cursor: &mut SignerCursor<'_, C>,
    ) -> Result<(), DeployError> {
        if self.cancel.is_cancelled() {
            return Err(DeployError::Cancelled(format!("deploy {name}")));
        }
        let (artifact, args, deferred) = match resolve_args(&run.registry, graph, name) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail(run, name, &e);
                return Err(e);
            }
        };

        self.transition(run, name, ComponentStatus::Deploying);
        self.persist(run)?;

        let identity = cursor.identity();
        let client = &*self.client;
        let (artifact_ref, args_ref) = (artifact.as_str(), args.as_slice());
        let submitted = cursor
            .submit(&format!("deploy {name}"), move |tx| {
                client.deploy(artifact_ref, args_ref, tx)
            })
            .await;

        match submitted {
            Ok(deployment) => {
                run.registry.record_deployment(name, &deployment);
                for target in &deferred {
                    run.registry.record_placeholder(name, target);
                    self.observer.on_event(&ProgressEvent::PlaceholderSubstituted {
                        component: name.to_string(),
                        target: target.clone(),
                    });
                }
                self.observer.on_event(&ProgressEvent::StatusChanged {
                    component: name.to_string(),
                    from: ComponentStatus::Deploying,
                    to: ComponentStatus::Deployed,
                });
                info!(
                    component = %name,
                    address = %deployment.address,
                    tx = %deployment.tx_hash,
                    block = deployment.block_number,
                    "deployed"
                );
                self.persist(run)
            }
            Err(failure) => {
                let err = Operation::Deploy {
                    component: name.to_string(),
                }
                .escalate(failure, identity);
                match err.kind() {
                    ErrorKind::Cancelled => {
                        self.transition(run, name, ComponentStatus::Pending);
                    }
                    // Left in `Deploying`: the construction may have landed.
                    ErrorKind::AmbiguousOutcome => run.registry.note_error(name, err.summary()),
                    _ => self.fail(run, name, &err),
                }
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Wiring
    // -----------------------------------------------------------------------

    async fn wire_all(
        &self,
        run: &mut Run,
        graph: &DependencyGraph,
        order: &[String],
        cursor: &mut SignerCursor<'_, C>,
    ) -> Result<(), DeployError> {
        self.enter(run, RunPhase::Wiring)?;
        for name in order {
            if run
                .registry
                .status_of(name)
                .is_some_and(ComponentStatus::is_wired)
            {
                continue;
            }
            let edges: Vec<&WiringEdge> = graph
                .wiring_edges()
                .iter()
                .filter(|e| &e.from == name)
                .collect();
            if !edges.is_empty() {
                self.transition(run, name, ComponentStatus::Wiring);
                for edge in edges {
                    if let Err(e) = self.wire_one(run, edge, cursor).await {
                        self.fail(run, name, &e);
                        return Err(e);
                    }
                }
            }
            self.transition(run, name, ComponentStatus::Wired);
            self.persist(run)?;
        }

        if let Some((component, target)) = run.registry.first_unpatched() {
            return Err(DeployError::UnpatchedPlaceholder {
                component: component.to_string(),
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// Apply one setter unless its getter already reports the target.
    async fn wire_one(
        &self,
        run: &mut Run,
        edge: &WiringEdge,
        cursor: &mut SignerCursor<'_, C>,
    ) -> Result<(), DeployError> {
        let operation = Operation::Wire {
            from: edge.from.clone(),
            to: edge.to.clone(),
            setter: edge.setter.clone(),
        };
        let undeployed = |name: &str| {
            DeployError::InvalidBlueprint(format!("cannot wire undeployed component '{name}'"))
        };
        let from = run
            .registry
            .address_of(&edge.from)
            .ok_or_else(|| undeployed(&edge.from))?;
        let to = run
            .registry
            .address_of(&edge.to)
            .ok_or_else(|| undeployed(&edge.to))?;

        if let Some(getter) = &edge.getter {
            let read_op = format!("read {}.{getter}", edge.from);
            let current = retry_read(&self.settings.retry, &*self.observer, &read_op, || {
                self.client.call(from, getter, NO_ARGS)
            })
            .await;
            match current.map(|raw| abi::decode_address(&raw)) {
                Ok(Ok(current)) if current == to => {
                    run.registry.clear_placeholder(&edge.from, &edge.to);
                    self.observer.on_event(&ProgressEvent::WiringSkipped {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        setter: edge.setter.clone(),
                    });
                    return Ok(());
                }
                Ok(Ok(_)) => {}
                // An unreadable getter never blocks the setter.
                Ok(Err(e)) => warn!(operation = %read_op, error = %e, "getter returned undecodable data"),
                Err(failure) => warn!(operation = %read_op, error = %failure.error, "getter read failed"),
            }
        }

        let identity = cursor.identity();
        let client = &*self.client;
        let setter = edge.setter.as_str();
        let args = [AbiValue::Address(to)];
        let args_ref = &args;
        cursor
            .submit(&operation.label(), move |tx| {
                client.send(from, setter, args_ref, tx)
            })
            .await
            .map_err(|failure| operation.escalate(failure, identity))?;

        run.registry.clear_placeholder(&edge.from, &edge.to);
        self.observer.on_event(&ProgressEvent::WiringApplied {
            from: edge.from.clone(),
            to: edge.to.clone(),
            setter: edge.setter.clone(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Configuring
    // -----------------------------------------------------------------------

    async fn configure_all(
        &self,
        run: &mut Run,
        order: &[String],
        cursor: &mut SignerCursor<'_, C>,
    ) -> Result<(), DeployError> {
        self.enter(run, RunPhase::Configuring)?;
        let grants = resolve_grants(&self.blueprint.roles, &run.registry, self.settings.deployer)?;
        let configurator =
            RoleConfigurator::new(&*self.client, &self.settings.retry, &*self.observer);

        for name in order {
            if run
                .registry
                .status_of(name)
                .is_some_and(ComponentStatus::is_configured)
            {
                continue;
            }
            for grant in grants.iter().filter(|g| &g.grant.resource == name) {
                if let Err(e) = configurator.apply(cursor, grant).await {
                    self.fail(run, name, &e);
                    return Err(e);
                }
            }
            self.transition(run, name, ComponentStatus::Configured);
            self.persist(run)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Verifying
    // -----------------------------------------------------------------------

    async fn verify_all(&self, run: &mut Run) -> Result<(), DeployError> {
        self.enter(run, RunPhase::Verifying)?;
        let manifest = self.snapshot(run);
        let probes = probes_from_blueprint(&self.blueprint, &manifest);
        let report = Verifier::new(&*self.client, &self.settings.retry, &*self.observer)
            .with_probes(probes)
            .verify(&manifest)
            .await;

        for check in &report.components {
            match &check.failure {
                None => {
                    if run.registry.status_of(&check.name) == Some(ComponentStatus::Configured) {
                        self.transition(run, &check.name, ComponentStatus::Verified);
                    }
                }
                Some(failure) => run.registry.note_error(
                    &check.name,
                    ErrorSummary {
                        kind: ErrorKind::Verification,
                        message: failure.to_string(),
                    },
                ),
            }
        }
        let failed = report.failed_count();
        run.verification = Some(report);
        self.persist(run)?;

        if failed > 0 {
            return Err(DeployError::Verification { failed });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn read<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, DeployError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        retry_read(&self.settings.retry, &*self.observer, operation, op)
            .await
            .map_err(|f| DeployError::TransientNetwork {
                operation: operation.to_string(),
                attempts: f.attempts,
                source: f.error,
            })
    }

    fn enter(&self, run: &mut Run, phase: RunPhase) -> Result<(), DeployError> {
        run.phase = phase;
        self.observer.on_event(&ProgressEvent::PhaseStarted { phase });
        if run.persistable {
            self.persist(run)?;
        }
        Ok(())
    }

    fn transition(&self, run: &mut Run, name: &str, to: ComponentStatus) {
        if let Some(from) = run.registry.set_status(name, to) {
            if from != to {
                self.observer.on_event(&ProgressEvent::StatusChanged {
                    component: name.to_string(),
                    from,
                    to,
                });
            }
        }
    }

    fn fail(&self, run: &mut Run, name: &str, err: &DeployError) {
        if let Some(from) = run.registry.mark_failed(name, err.summary()) {
            self.observer.on_event(&ProgressEvent::StatusChanged {
                component: name.to_string(),
                from,
                to: ComponentStatus::Failed,
            });
        }
    }

    fn snapshot(&self, run: &Run) -> Manifest {
        Manifest::from_registry(
            &run.registry,
            &self.settings.network,
            run.chain_id.unwrap_or_default(),
            self.settings.deployer,
            run.block_number,
            run.phase,
        )
    }

    fn persist(&self, run: &Run) -> Result<(), DeployError> {
        self.store.save(&self.snapshot(run))?;
        self.observer
            .on_event(&ProgressEvent::ManifestSaved { phase: run.phase });
        Ok(())
    }
}

/// Constructor arguments for `name`: literals, deployed addresses, and the
/// zero-address placeholder for deferred partners. Returns the deferred
/// targets alongside.
fn resolve_args(
    registry: &ComponentRegistry,
    graph: &DependencyGraph,
    name: &str,
) -> Result<(String, Vec<AbiValue>, Vec<String>), DeployError> {
    let component = registry
        .get(name)
        .ok_or_else(|| DeployError::InvalidBlueprint(format!("unknown component '{name}'")))?;
    let invalid = |i: usize, msg: String| {
        DeployError::InvalidBlueprint(format!("{name} argument {i}: {msg}"))
    };

    let mut values = Vec::with_capacity(component.args.len());
    let mut deferred = Vec::new();
    for (i, arg) in component.args.iter().enumerate() {
        match arg.source().map_err(|e| invalid(i, e))? {
            ArgSource::Literal(_) => {
                let value = arg
                    .literal_value()
                    .map_err(|e| invalid(i, e))?
                    .ok_or_else(|| invalid(i, "missing literal".into()))?;
                values.push(value);
            }
            ArgSource::Ref(target) => match registry.address_of(target) {
                Some(address) => values.push(AbiValue::Address(address)),
                None if graph.is_deferred(name, target) => {
                    values.push(AbiValue::Address(Address::ZERO));
                    deferred.push(target.to_string());
                }
                None => {
                    return Err(invalid(i, format!("'{target}' is not deployed yet")));
                }
            },
        }
    }
    Ok((component.artifact.clone(), values, deferred))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockNetwork, RecordingObserver, fast_policy};
    use std::path::Path;

    /// A and B reference each other (wiring cycle); C needs D, D needs E at
    /// construction.
    const SCENARIO: &str = r#"{
        "components": [
            { "name": "A", "args": [ { "type": "address", "ref": "B" },
                                     { "type": "uint256", "value": "1000" } ],
              "probe": { "method": "b()", "expect": { "type": "address", "ref": "B" } } },
            { "name": "B", "args": [ { "type": "address", "ref": "A" } ] },
            { "name": "C", "args": [ { "type": "address", "ref": "D" } ] },
            { "name": "D", "args": [ { "type": "address", "ref": "E" } ] },
            { "name": "E" }
        ],
        "edges": [
            { "from": "A", "to": "B", "kind": "wiring", "setter": "setB(address)", "getter": "b()" },
            { "from": "B", "to": "A", "kind": "wiring", "setter": "setA(address)", "getter": "a()" }
        ],
        "roles": [
            { "subject": "A", "role": "MINTER_ROLE", "resource": "C" },
            { "subject": "deployer", "role": "DEFAULT_ADMIN_ROLE", "resource": "E" }
        ]
    }"#;

    fn deployer() -> Address {
        Address::from_bytes([0xdd; 20])
    }

    fn settings(resume: bool) -> RunSettings {
        RunSettings {
            network: "localhost".into(),
            chain_id: Some(31337),
            deployer: deployer(),
            resume,
            retry: fast_policy(),
            min_balance: 0,
        }
    }

    fn orchestrator(
        mock: &Arc<MockNetwork>,
        blueprint: &str,
        manifest: &Path,
        settings: RunSettings,
    ) -> Orchestrator<MockNetwork> {
        Orchestrator::new(
            Arc::clone(mock),
            Blueprint::from_json(blueprint).unwrap(),
            ManifestStore::new(manifest),
            settings,
        )
    }

    fn load(path: &Path) -> Manifest {
        ManifestStore::new(path).load().unwrap().unwrap()
    }

    fn status(manifest: &Manifest, name: &str) -> ComponentStatus {
        manifest.components[name].status
    }

    #[tokio::test]
    async fn full_run_deploys_wires_configures_and_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        let observer = Arc::new(RecordingObserver::default());

        let report = orchestrator(&mock, SCENARIO, &path, settings(false))
            .with_observer(observer.clone())
            .run()
            .await;
        assert!(report.succeeded(), "{report}");
        assert_eq!(report.exit_code(), 0);

        // A and B first (no constructor deps), then the E -> D -> C chain.
        assert_eq!(mock.deploy_order(), ["A", "B", "E", "D", "C"]);

        let manifest = load(&path);
        assert_eq!(manifest.status, RunPhase::Done);
        assert_eq!(manifest.contracts.len(), 5);
        assert_eq!(manifest.chain_id, 31337);
        for name in ["A", "B", "C", "D", "E"] {
            assert_eq!(status(&manifest, name), ComponentStatus::Verified, "{name}");
        }

        // A was built with the placeholder for B, then patched by its setter.
        let a = manifest.contracts["A"];
        let b = manifest.contracts["B"];
        assert_eq!(
            mock.deploy_args("A").unwrap()[0],
            AbiValue::Address(Address::ZERO)
        );
        assert_eq!(mock.deploy_args("B").unwrap()[0], AbiValue::Address(a));
        assert_eq!(mock.slot(a, "b"), Some(b));
        assert_eq!(mock.slot(b, "a"), Some(a));
        assert!(manifest.components["A"].placeholders.is_empty());

        // Constructor refs resolve to real addresses.
        assert_eq!(
            mock.deploy_args("C").unwrap()[0],
            AbiValue::Address(manifest.contracts["D"])
        );

        let minter = crate::roles::role_id("MINTER_ROLE").unwrap();
        assert!(mock.has_role(manifest.contracts["C"], minter, a));
        assert!(mock.has_role(manifest.contracts["E"], [0u8; 32], deployer()));

        // 5 deploys + 2 setters + 2 grants.
        assert_eq!(mock.confirmed(), 9);
        assert_eq!(report.submitted, 9);

        assert_eq!(
            observer.phases(),
            [
                RunPhase::Planning,
                RunPhase::Deploying,
                RunPhase::Wiring,
                RunPhase::Configuring,
                RunPhase::Persisting,
                RunPhase::Verifying,
                RunPhase::Done,
            ]
        );
        assert!(report.verification.as_ref().unwrap().passed());
    }

    #[tokio::test]
    async fn rerun_against_finished_manifest_makes_no_mutations() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        assert!(
            orchestrator(&mock, SCENARIO, &path, settings(false))
                .run()
                .await
                .succeeded()
        );
        let mutations = mock.mutating_calls();
        let before = load(&path);

        let report = orchestrator(&mock, SCENARIO, &path, settings(true)).run().await;
        assert!(report.succeeded(), "{report}");
        assert_eq!(mock.mutating_calls(), mutations);
        assert_eq!(report.submitted, 0);
        assert_eq!(load(&path).contracts, before.contracts);
    }

    #[tokio::test]
    async fn existing_manifest_requires_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        let calls = mock.total_calls();

        let report = orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        assert!(!report.succeeded());
        assert_eq!(report.error.unwrap().kind, ErrorKind::ManifestMismatch);
        assert_eq!(mock.total_calls(), calls);
    }

    #[tokio::test]
    async fn constructor_cycle_fails_without_network_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        let cyclic = r#"{"components":[
            {"name":"A","args":[{"type":"address","ref":"B"}]},
            {"name":"B","args":[{"type":"address","ref":"A"}]}
        ]}"#;

        let report = orchestrator(&mock, cyclic, &path, settings(false)).run().await;
        let error = report.error.clone().unwrap();
        assert_eq!(error.kind, ErrorKind::ConstructorCycle);
        assert!(error.message.contains("A -> B -> A"));
        assert_eq!(report.exit_code(), 2);
        assert_eq!(mock.total_calls(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_to_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        mock.fail_deploy("D", NetworkError::Transport("connection reset".into()));

        let report = orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        assert!(report.succeeded(), "{report}");
        let manifest = load(&path);
        assert_eq!(manifest.contracts.len(), 5);
        assert!(manifest
            .components
            .values()
            .all(|r| r.status == ComponentStatus::Verified));
        assert_eq!(mock.mutating_calls(), mock.confirmed() + 1);
    }

    #[tokio::test]
    async fn exhausted_retries_abort_and_resume_finishes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        mock.always_fail_deploy("E", NetworkError::Timeout(std::time::Duration::from_secs(30)));

        let report = orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        assert_eq!(report.outcome, RunPhase::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::DeployFailed);

        let manifest = load(&path);
        assert_eq!(manifest.status, RunPhase::Failed);
        assert_eq!(manifest.contracts.len(), 2);
        assert_eq!(status(&manifest, "A"), ComponentStatus::Deployed);
        assert_eq!(status(&manifest, "B"), ComponentStatus::Deployed);
        assert_eq!(status(&manifest, "E"), ComponentStatus::Failed);
        assert_eq!(status(&manifest, "D"), ComponentStatus::Pending);
        assert_eq!(status(&manifest, "C"), ComponentStatus::Pending);
        assert_eq!(
            manifest.components["E"].error.as_ref().unwrap().kind,
            ErrorKind::DeployFailed
        );
        assert_eq!(manifest.components["A"].placeholders, ["B"]);

        // The network recovers; resuming deploys only what is missing.
        mock.clear_failures();
        let report = orchestrator(&mock, SCENARIO, &path, settings(true)).run().await;
        assert!(report.succeeded(), "{report}");
        assert_eq!(mock.deploy_order(), ["A", "B", "E", "D", "C"]);
        let resumed = load(&path);
        assert_eq!(resumed.contracts["A"], manifest.contracts["A"]);
        assert_eq!(resumed.contracts.len(), 5);
    }

    #[tokio::test]
    async fn resume_after_wiring_failure_does_not_redeploy() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        for _ in 0..3 {
            mock.fail_send("setB(address)", NetworkError::Transport("connection reset".into()));
        }

        let report = orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::WireFailed);
        let failed = load(&path);
        assert_eq!(status(&failed, "A"), ComponentStatus::Failed);
        assert_eq!(failed.components["A"].placeholders, ["B"]);
        assert_eq!(failed.contracts.len(), 5);

        mock.clear_failures();
        let report = orchestrator(&mock, SCENARIO, &path, settings(true)).run().await;
        assert!(report.succeeded(), "{report}");
        assert_eq!(mock.deploy_order(), ["A", "B", "E", "D", "C"]);

        let resumed = load(&path);
        assert_eq!(resumed.contracts, failed.contracts);
        let (a, b) = (resumed.contracts["A"], resumed.contracts["B"]);
        assert_eq!(mock.deploy_args("B").unwrap()[0], AbiValue::Address(a));
        assert_eq!(mock.slot(a, "b"), Some(b));
        assert_eq!(status(&resumed, "A"), ComponentStatus::Verified);
    }

    #[tokio::test]
    async fn resume_after_configure_failure_does_not_redeploy() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        mock.deny_grants();

        let report = orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::Authorization);
        let failed = load(&path);
        assert_eq!(status(&failed, "E"), ComponentStatus::Failed);
        assert_eq!(failed.contracts.len(), 5);

        mock.clear_failures();
        let report = orchestrator(&mock, SCENARIO, &path, settings(true)).run().await;
        assert!(report.succeeded(), "{report}");
        assert_eq!(mock.deploy_order(), ["A", "B", "E", "D", "C"]);

        let resumed = load(&path);
        assert_eq!(resumed.contracts, failed.contracts);
        assert!(mock.has_role(resumed.contracts["E"], [0u8; 32], deployer()));
        assert_eq!(status(&resumed, "E"), ComponentStatus::Verified);
    }

    #[tokio::test]
    async fn deploy_landing_after_timeout_is_left_for_reconciliation() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        mock.lose_deploy_receipt("A", NetworkError::Timeout(std::time::Duration::from_secs(30)));

        let report = orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::AmbiguousOutcome);
        assert_eq!(mock.deploy_order(), ["A"]);
        let mut manifest = load(&path);
        assert_eq!(status(&manifest, "A"), ComponentStatus::Deploying);
        assert!(manifest.contracts.is_empty());
        assert_eq!(
            manifest.components["A"].error.as_ref().unwrap().kind,
            ErrorKind::AmbiguousOutcome
        );

        // Resuming refuses until the landed address is recorded.
        let mutations = mock.mutating_calls();
        let report = orchestrator(&mock, SCENARIO, &path, settings(true)).run().await;
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::AmbiguousOutcome);
        assert!(error.message.contains("A may already be deployed"));
        assert_eq!(mock.mutating_calls(), mutations);

        let landed = mock.deployed_address("A").unwrap();
        manifest.contracts.insert("A".into(), landed);
        ManifestStore::new(&path).save(&manifest).unwrap();

        let report = orchestrator(&mock, SCENARIO, &path, settings(true)).run().await;
        assert!(report.succeeded(), "{report}");
        assert_eq!(mock.deploy_order(), ["A", "B", "E", "D", "C"]);
        let resumed = load(&path);
        assert_eq!(resumed.contracts["A"], landed);
        assert_eq!(mock.slot(landed, "b"), Some(resumed.contracts["B"]));
    }

    #[tokio::test]
    async fn wiring_and_grants_are_not_repeated_when_already_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        assert!(
            orchestrator(&mock, SCENARIO, &path, settings(false))
                .run()
                .await
                .succeeded()
        );

        // Pretend the run crashed right after deploying: every component is
        // recorded as merely Deployed.
        let mut manifest = load(&path);
        for record in manifest.components.values_mut() {
            record.status = ComponentStatus::Deployed;
        }
        ManifestStore::new(&path).save(&manifest).unwrap();
        let mutations = mock.mutating_calls();

        let report = orchestrator(&mock, SCENARIO, &path, settings(true)).run().await;
        assert!(report.succeeded(), "{report}");
        assert_eq!(mock.mutating_calls(), mutations);
    }

    #[tokio::test]
    async fn insufficient_balance_is_fatal_before_any_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        mock.set_balance(10);
        let settings = RunSettings {
            min_balance: 1_000,
            ..settings(false)
        };

        let report = orchestrator(&mock, SCENARIO, &path, settings).run().await;
        assert_eq!(
            report.error.unwrap().kind,
            ErrorKind::InsufficientBalance
        );
        assert_eq!(mock.mutating_calls(), 0);
        assert_eq!(load(&path).status, RunPhase::Failed);
    }

    #[tokio::test]
    async fn chain_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;

        mock.set_chain_id(1);
        let settings = RunSettings {
            chain_id: None,
            ..settings(true)
        };
        let mutations = mock.mutating_calls();
        let report = orchestrator(&mock, SCENARIO, &path, settings).run().await;
        assert_eq!(report.error.unwrap().kind, ErrorKind::ManifestMismatch);
        assert_eq!(mock.mutating_calls(), mutations);
        assert_eq!(load(&path).chain_id, 31337);
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_submission() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        let orchestrator = orchestrator(&mock, SCENARIO, &path, settings(false));
        orchestrator.cancel_flag().cancel();

        let report = orchestrator.run().await;
        assert_eq!(report.error.unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(mock.mutating_calls(), 0);
        let manifest = load(&path);
        assert!(manifest.contracts.is_empty());
        assert!(manifest
            .components
            .values()
            .all(|r| r.status == ComponentStatus::Pending));
    }

    #[tokio::test]
    async fn empty_code_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        mock.empty_code_for("D");

        let report = orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        assert_eq!(report.outcome, RunPhase::Failed);
        assert_eq!(report.error.as_ref().unwrap().kind, ErrorKind::Verification);
        let verification = report.verification.as_ref().unwrap();
        assert_eq!(verification.failed_count(), 1);
        assert!(!verification.get("D").unwrap().passed());

        let manifest = load(&path);
        assert_eq!(status(&manifest, "D"), ComponentStatus::Configured);
        assert_eq!(status(&manifest, "C"), ComponentStatus::Verified);
        assert_eq!(
            manifest.components["D"].error.as_ref().unwrap().kind,
            ErrorKind::Verification
        );
    }

    #[tokio::test]
    async fn unpatched_placeholder_is_a_defect() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        let mock = Arc::new(MockNetwork::new());
        orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;

        let mut manifest = load(&path);
        manifest
            .components
            .get_mut("A")
            .unwrap()
            .placeholders
            .push("B".into());
        ManifestStore::new(&path).save(&manifest).unwrap();

        let report = orchestrator(&mock, SCENARIO, &path, settings(true)).run().await;
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::UnpatchedPlaceholder);
        assert!(error.message.contains("A still holds a placeholder for B"));
    }

    #[tokio::test]
    async fn manifest_write_failure_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        // The manifest path is an existing directory, so the rename fails.
        let path = tmp.path().join("manifest.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();
        let mock = Arc::new(MockNetwork::new());

        let report = orchestrator(&mock, SCENARIO, &path, settings(false)).run().await;
        assert_eq!(report.error.unwrap().kind, ErrorKind::ManifestIo);
        assert_eq!(mock.mutating_calls(), 0);
        assert!(path.join("keep").exists());
    }
}
