use std::path::PathBuf;

use clap::{Parser, Subcommand};

use keel_chain::Address;

#[derive(Debug, Parser)]
#[command(name = "keel", author, version, about = "Deploy, wire and verify multi-contract systems")]
pub struct Cli {
    /// Print the report as JSON on stdout.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Config file (defaults to ~/.keel/config.json).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy, wire and configure every component in the blueprint.
    Deploy {
        /// Continue from an existing manifest instead of refusing to overwrite it.
        #[arg(long, default_value_t = false)]
        resume: bool,

        #[arg(long, value_name = "PATH")]
        manifest: Option<PathBuf>,

        #[arg(long, value_name = "PATH")]
        blueprint: Option<PathBuf>,
    },

    /// Check every address recorded in a manifest. Read-only.
    Verify {
        #[arg(long, value_name = "PATH")]
        manifest: PathBuf,

        /// Blueprint whose probes to run against the recorded addresses.
        #[arg(long, value_name = "PATH")]
        blueprint: Option<PathBuf>,
    },

    /// Print the deployment order, placeholders, wiring and grants.
    Plan {
        #[arg(long, value_name = "PATH")]
        blueprint: Option<PathBuf>,
    },

    /// Manage the local encrypted keystore.
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum CredentialsAction {
    /// Store the deployer identity. A signer token, if any, is read from stdin.
    Set {
        #[arg(long, value_name = "ADDR")]
        identity: Address,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_deploy_flags() {
        let cli = Cli::try_parse_from([
            "keel",
            "--json",
            "deploy",
            "--resume",
            "--manifest",
            "out/m.json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Deploy {
                resume,
                manifest,
                blueprint,
            } => {
                assert!(resume);
                assert_eq!(manifest, Some(PathBuf::from("out/m.json")));
                assert_eq!(blueprint, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn verify_requires_manifest() {
        assert!(Cli::try_parse_from(["keel", "verify"]).is_err());
        assert!(Cli::try_parse_from(["keel", "verify", "--manifest", "m.json"]).is_ok());
    }

    #[test]
    fn credentials_identity_must_be_an_address() {
        assert!(Cli::try_parse_from(["keel", "credentials", "set", "--identity", "nope"]).is_err());
        let addr = format!("0x{}", "ab".repeat(20));
        let cli =
            Cli::try_parse_from(["keel", "credentials", "set", "--identity", addr.as_str()]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Credentials {
                action: CredentialsAction::Set { .. }
            }
        ));
    }
}
