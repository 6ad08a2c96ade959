//! In-memory network double for tests: scripted failures, nonce
//! enforcement, and counters for every read and mutating call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use keel_chain::abi::{self, AbiValue};
use keel_chain::{Address, Deployment, NetworkClient, NetworkError, Receipt, TxContext};

use crate::events::{DeployObserver, ProgressEvent};
use crate::retry::RetryPolicy;
use crate::roles::{GRANT_ROLE, HAS_ROLE};
use crate::state::RunPhase;

pub(crate) const NO_ARGS: &[AbiValue] = &[];

pub(crate) fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        call_timeout: Duration::from_secs(1),
    }
}

/// `setVault(address)` and `vault()` share the storage slot `vault`.
fn slot_for(method: &str) -> String {
    let name = method.split('(').next().unwrap_or(method);
    let name = name.strip_prefix("set").unwrap_or(name);
    name.to_ascii_lowercase()
}

#[derive(Default)]
struct Contract {
    artifact: String,
    args: Vec<AbiValue>,
    code: Vec<u8>,
    slots: HashMap<String, Address>,
    roles: HashSet<([u8; 32], Address)>,
}

#[derive(Default)]
struct State {
    chain_id: u64,
    block: u64,
    balance: u128,
    nonce: u64,
    next_id: u32,
    contracts: HashMap<Address, Contract>,
    deploy_order: Vec<String>,
    deploy_failures: HashMap<String, VecDeque<NetworkError>>,
    always_fail: HashMap<String, NetworkError>,
    lost_receipts: HashMap<String, VecDeque<NetworkError>>,
    send_failures: HashMap<String, VecDeque<NetworkError>>,
    deny_grants: bool,
    empty_code: HashSet<String>,
    nonces_seen: Vec<u64>,
    mutating: usize,
    confirmed: usize,
    reads: usize,
}

impl State {
    fn check_nonce(&self, tx: TxContext) -> Result<(), NetworkError> {
        if tx.nonce == self.nonce {
            Ok(())
        } else {
            Err(NetworkError::Sequencing(format!(
                "nonce {} does not match expected {}",
                tx.nonce, self.nonce
            )))
        }
    }

    fn confirm(&mut self) -> u64 {
        self.nonce += 1;
        self.block += 1;
        self.confirmed += 1;
        self.block
    }
}

pub(crate) struct MockNetwork {
    state: Mutex<State>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                chain_id: 31337,
                block: 100,
                balance: 10u128.pow(21),
                ..State::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.with(|s| s.nonce = nonce);
    }

    pub fn set_balance(&self, balance: u128) {
        self.with(|s| s.balance = balance);
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.with(|s| s.chain_id = chain_id);
    }

    /// Fail the next deploy attempt of `artifact` with `error`. Stacks.
    pub fn fail_deploy(&self, artifact: &str, error: NetworkError) {
        self.with(|s| {
            s.deploy_failures
                .entry(artifact.to_string())
                .or_default()
                .push_back(error)
        });
    }

    pub fn always_fail_deploy(&self, artifact: &str, error: NetworkError) {
        self.with(|s| s.always_fail.insert(artifact.to_string(), error));
    }

    /// The next deploy of `artifact` is included on chain, but the caller
    /// sees `error` instead of the receipt.
    pub fn lose_deploy_receipt(&self, artifact: &str, error: NetworkError) {
        self.with(|s| {
            s.lost_receipts
                .entry(artifact.to_string())
                .or_default()
                .push_back(error)
        });
    }

    pub fn clear_failures(&self) {
        self.with(|s| {
            s.deploy_failures.clear();
            s.always_fail.clear();
            s.send_failures.clear();
            s.lost_receipts.clear();
            s.deny_grants = false;
        });
    }

    pub fn fail_send(&self, method: &str, error: NetworkError) {
        self.with(|s| {
            s.send_failures
                .entry(method.to_string())
                .or_default()
                .push_back(error)
        });
    }

    pub fn deny_grants(&self) {
        self.with(|s| s.deny_grants = true);
    }

    /// Deploys of `artifact` succeed but leave no code behind.
    pub fn empty_code_for(&self, artifact: &str) {
        self.with(|s| s.empty_code.insert(artifact.to_string()));
    }

    pub fn wipe_code(&self, address: Address) {
        self.with(|s| {
            if let Some(contract) = s.contracts.get_mut(&address) {
                contract.code.clear();
            }
        });
    }

    pub fn set_slot(&self, address: Address, slot: &str, value: Address) {
        self.with(|s| {
            if let Some(contract) = s.contracts.get_mut(&address) {
                contract.slots.insert(slot.to_string(), value);
            }
        });
    }

    pub fn slot(&self, address: Address, slot: &str) -> Option<Address> {
        self.with(|s| s.contracts.get(&address)?.slots.get(slot).copied())
    }

    pub fn has_role(&self, address: Address, role: [u8; 32], subject: Address) -> bool {
        self.with(|s| {
            s.contracts
                .get(&address)
                .is_some_and(|c| c.roles.contains(&(role, subject)))
        })
    }

    /// Constructor arguments of the deployed instance of `artifact`.
    pub fn deploy_args(&self, artifact: &str) -> Option<Vec<AbiValue>> {
        self.with(|s| {
            s.contracts
                .values()
                .find(|c| c.artifact == artifact)
                .map(|c| c.args.clone())
        })
    }

    /// Address of the most recent deploy of `artifact`.
    pub fn deployed_address(&self, artifact: &str) -> Option<Address> {
        self.with(|s| {
            s.contracts
                .iter()
                .filter(|(_, c)| c.artifact == artifact)
                .map(|(address, _)| *address)
                .max()
        })
    }

    pub fn deploy_order(&self) -> Vec<String> {
        self.with(|s| s.deploy_order.clone())
    }

    pub fn nonces_seen(&self) -> Vec<u64> {
        self.with(|s| s.nonces_seen.clone())
    }

    /// Every deploy/send attempt, including rejected ones.
    pub fn mutating_calls(&self) -> usize {
        self.with(|s| s.mutating)
    }

    /// Deploy/send attempts that were confirmed.
    pub fn confirmed(&self) -> usize {
        self.with(|s| s.confirmed)
    }

    pub fn reads(&self) -> usize {
        self.with(|s| s.reads)
    }

    pub fn total_calls(&self) -> usize {
        self.with(|s| s.reads + s.mutating)
    }
}

#[async_trait]
impl NetworkClient for MockNetwork {
    async fn chain_id(&self) -> Result<u64, NetworkError> {
        Ok(self.with(|s| {
            s.reads += 1;
            s.chain_id
        }))
    }

    async fn block_number(&self) -> Result<u64, NetworkError> {
        Ok(self.with(|s| {
            s.reads += 1;
            s.block
        }))
    }

    async fn next_nonce(&self, _identity: Address) -> Result<u64, NetworkError> {
        Ok(self.with(|s| {
            s.reads += 1;
            s.nonce
        }))
    }

    async fn get_balance(&self, _identity: Address) -> Result<u128, NetworkError> {
        Ok(self.with(|s| {
            s.reads += 1;
            s.balance
        }))
    }

    async fn get_code(&self, address: Address) -> Result<Vec<u8>, NetworkError> {
        Ok(self.with(|s| {
            s.reads += 1;
            s.contracts
                .get(&address)
                .map(|c| c.code.clone())
                .unwrap_or_default()
        }))
    }

    async fn deploy(
        &self,
        bytecode_ref: &str,
        args: &[AbiValue],
        tx: TxContext,
    ) -> Result<Deployment, NetworkError> {
        self.with(|s| {
            s.mutating += 1;
            s.nonces_seen.push(tx.nonce);
            if let Some(error) = s
                .deploy_failures
                .get_mut(bytecode_ref)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            if let Some(error) = s.always_fail.get(bytecode_ref) {
                return Err(error.clone());
            }
            s.check_nonce(tx)?;

            s.next_id += 1;
            let mut bytes = [0u8; 20];
            bytes[0] = 0xc0;
            bytes[16..].copy_from_slice(&s.next_id.to_be_bytes());
            let address = Address::from_bytes(bytes);
            let code = if s.empty_code.contains(bytecode_ref) {
                Vec::new()
            } else {
                [&[0x60, 0x80, 0x60, 0x40, 0x52][..], bytecode_ref.as_bytes()].concat()
            };
            s.contracts.insert(
                address,
                Contract {
                    artifact: bytecode_ref.to_string(),
                    args: args.to_vec(),
                    code,
                    ..Contract::default()
                },
            );
            s.deploy_order.push(bytecode_ref.to_string());
            let id = s.next_id;
            let block_number = s.confirm();
            if let Some(error) = s
                .lost_receipts
                .get_mut(bytecode_ref)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            Ok(Deployment {
                address,
                tx_hash: format!("0x{id:064x}"),
                block_number,
            })
        })
    }

    async fn call(
        &self,
        address: Address,
        method: &str,
        args: &[AbiValue],
    ) -> Result<Vec<u8>, NetworkError> {
        self.with(|s| {
            s.reads += 1;
            let contract = s
                .contracts
                .get(&address)
                .ok_or_else(|| NetworkError::Reverted(format!("no contract at {address}")))?;
            if method == HAS_ROLE {
                let held = match args {
                    [AbiValue::Bytes32(role), AbiValue::Address(subject)] => {
                        contract.roles.contains(&(*role, *subject))
                    }
                    _ => return Err(NetworkError::Reverted("bad hasRole args".into())),
                };
                return Ok(abi::encode(&[AbiValue::Bool(held)]));
            }
            match contract.slots.get(&slot_for(method)) {
                Some(value) => Ok(abi::encode(&[AbiValue::Address(*value)])),
                None => Err(NetworkError::Reverted(format!("unknown method {method}"))),
            }
        })
    }

    async fn send(
        &self,
        address: Address,
        method: &str,
        args: &[AbiValue],
        tx: TxContext,
    ) -> Result<Receipt, NetworkError> {
        self.with(|s| {
            s.mutating += 1;
            s.nonces_seen.push(tx.nonce);
            if let Some(error) = s
                .send_failures
                .get_mut(method)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            if method == GRANT_ROLE && s.deny_grants {
                return Err(NetworkError::Unauthorized(
                    "AccessControl: account is missing role".into(),
                ));
            }
            s.check_nonce(tx)?;

            let contract = s
                .contracts
                .get_mut(&address)
                .ok_or_else(|| NetworkError::Reverted(format!("no contract at {address}")))?;
            match (method, args) {
                (GRANT_ROLE, [AbiValue::Bytes32(role), AbiValue::Address(subject)]) => {
                    contract.roles.insert((*role, *subject));
                }
                (_, [AbiValue::Address(value)]) => {
                    contract.slots.insert(slot_for(method), *value);
                }
                _ => return Err(NetworkError::Reverted(format!("unsupported call {method}"))),
            }
            let block_number = s.confirm();
            Ok(Receipt {
                tx_hash: format!("0x{:064x}", block_number),
                block_number,
            })
        })
    }
}

/// Collects every event for later assertions.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn phases(&self) -> Vec<RunPhase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::PhaseStarted { phase } => Some(phase),
                _ => None,
            })
            .collect()
    }
}

impl DeployObserver for RecordingObserver {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
