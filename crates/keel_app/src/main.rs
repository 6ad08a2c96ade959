mod cli;

use std::io::{self, BufRead};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use keel_chain::evm::ArtifactStore;
use keel_chain::{
    CredentialProvider, Credentials, EnvCredentials, EvmRpcClient, KeystoreCredentials,
    RpcConfig, SecretString,
};
use keel_core::{CredentialSource, KeelConfig, SecureStorage, logging};
use keel_deploy::verifier::probes_from_blueprint;
use keel_deploy::{
    Blueprint, CancelFlag, ManifestStore, Orchestrator, Plan, RetryPolicy, RunSettings,
    TracingObserver, Verifier,
};

use cli::{Cli, Command, CredentialsAction};

/// Exit code for configuration and usage errors.
const EXIT_CONFIG: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("keel: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let _log_guard = match logging::init_logging(&config.log_level) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("keel: logging disabled: {e:#}");
            None
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli, config)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("keel: {e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<KeelConfig> {
    let mut config = match path {
        Some(path) => KeelConfig::load_from_path(path)?,
        None => KeelConfig::load()?,
    };
    config.apply_env_overrides()?;
    Ok(config)
}

/// `Err` is reserved for configuration and usage problems; run outcomes are
/// reported through the returned exit code.
async fn dispatch(cli: Cli, config: KeelConfig) -> Result<ExitCode> {
    match cli.command {
        Command::Deploy {
            resume,
            manifest,
            blueprint,
        } => {
            let manifest = manifest.unwrap_or_else(|| config.manifest_path.clone());
            let blueprint = blueprint.unwrap_or_else(|| config.blueprint_path.clone());
            deploy(&config, &blueprint, &manifest, resume, cli.json).await
        }
        Command::Verify {
            manifest,
            blueprint,
        } => verify(&config, &manifest, blueprint.as_deref(), cli.json).await,
        Command::Plan { blueprint } => {
            let blueprint = blueprint.unwrap_or_else(|| config.blueprint_path.clone());
            plan(&blueprint, cli.json)
        }
        Command::Credentials {
            action: CredentialsAction::Set { identity },
        } => {
            let token = read_token()?;
            let keystore = KeystoreCredentials::new(KeelConfig::keystore_path()?, SecureStorage::new()?);
            keystore.store(identity, token.as_ref())?;
            println!(
                "Stored deployer {identity}{} in {}",
                if token.is_some() { " with signer token" } else { "" },
                keystore.path().display()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn deploy(
    config: &KeelConfig,
    blueprint_path: &Path,
    manifest_path: &Path,
    resume: bool,
    json: bool,
) -> Result<ExitCode> {
    let blueprint = Blueprint::load_from_path(blueprint_path)?;
    let rpc = RpcConfig::resolve(config)?;
    let credentials = resolve_credentials(config)?;
    info!(
        network = %rpc.network,
        url = %rpc.url,
        deployer = %credentials.identity,
        "starting deployment"
    );

    let client = Arc::new(build_client(config, &rpc, credentials.signer_token)?);
    let settings = RunSettings {
        network: rpc.network.clone(),
        chain_id: rpc.chain_id,
        deployer: credentials.identity,
        resume,
        retry: RetryPolicy::from_config(config),
        min_balance: config.min_balance(),
    };

    let cancel = CancelFlag::new();
    spawn_interrupt_handler(cancel.clone());

    let report = Orchestrator::new(client, blueprint, ManifestStore::new(manifest_path), settings)
        .with_cancel_flag(cancel)
        .run()
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    Ok(exit_code(report.exit_code()))
}

async fn verify(
    config: &KeelConfig,
    manifest_path: &Path,
    blueprint_path: Option<&Path>,
    json: bool,
) -> Result<ExitCode> {
    let manifest = ManifestStore::new(manifest_path)
        .load()?
        .with_context(|| format!("no manifest at {}", manifest_path.display()))?;
    let probes = match blueprint_path {
        Some(path) => probes_from_blueprint(&Blueprint::load_from_path(path)?, &manifest),
        None => Default::default(),
    };

    let mut config = config.clone();
    config.network = manifest.network.clone();
    let rpc = RpcConfig::resolve(&config)?;

    // Reads only; a signer token is passed along when one is available.
    let token = match resolve_credentials(&config) {
        Ok(credentials) => credentials.signer_token,
        Err(e) => {
            warn!("Verifying without a signer token: {e:#}");
            None
        }
    };
    let client = build_client(&config, &rpc, token)?;
    let policy = RetryPolicy::from_config(&config);
    let verifier = Verifier::new(&client, &policy, &TracingObserver).with_probes(probes);
    verifier
        .check_chain(&manifest)
        .await
        .with_context(|| format!("verifying {}", manifest_path.display()))?;
    let report = verifier.verify(&manifest).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(exit_code(report.exit_code()))
}

fn plan(blueprint_path: &Path, json: bool) -> Result<ExitCode> {
    let blueprint = Blueprint::load_from_path(blueprint_path)?;
    let plan = Plan::build(&blueprint)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{plan}");
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn resolve_credentials(config: &KeelConfig) -> Result<Credentials> {
    let provider: Box<dyn CredentialProvider> = match config.credentials {
        CredentialSource::Env => Box::new(EnvCredentials::new()),
        CredentialSource::Keystore => Box::new(KeystoreCredentials::new(
            KeelConfig::keystore_path()?,
            SecureStorage::new()?,
        )),
    };
    let credentials = provider
        .resolve()
        .with_context(|| format!("resolving credentials from {}", provider.name()))?;
    info!(
        source = provider.name(),
        identity = %credentials.identity,
        token = credentials.signer_token.is_some(),
        "credentials resolved"
    );
    Ok(credentials)
}

fn build_client(
    config: &KeelConfig,
    rpc: &RpcConfig,
    token: Option<SecretString>,
) -> Result<EvmRpcClient> {
    let artifacts = ArtifactStore::new(&config.artifacts_dir);
    let client = EvmRpcClient::new(rpc, artifacts, token)
        .with_context(|| format!("connecting to {}", rpc.url))?;
    Ok(client.with_confirmation(config.confirmation_timeout(), config.poll_interval()))
}

/// One line from stdin; empty means no token.
fn read_token() -> Result<Option<SecretString>> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading signer token from stdin")?;
    let token = line.trim();
    Ok((!token.is_empty()).then(|| SecretString::new(token)))
}

/// Ctrl-C stops the run before its next mutating call; the manifest keeps
/// everything confirmed so far.
fn spawn_interrupt_handler(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping before the next submission");
            cancel.cancel();
        }
    });
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
