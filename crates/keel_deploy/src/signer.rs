//! The single in-process cursor through which every mutating call passes.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use keel_chain::{Address, NetworkClient, NetworkError, TxContext};

use crate::error::DeployError;
use crate::events::{DeployObserver, ProgressEvent};
use crate::retry::{RetryFailure, RetryPolicy, retry_read};

/// Operator cancellation, observed only between submissions.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a mutating call did not go through.
#[derive(Debug, Clone)]
pub enum MutationFailure {
    /// Cancellation was requested before submission.
    Cancelled,
    /// The nonce lookup itself failed.
    Nonce(RetryFailure),
    /// Transient failures outlasted the retry ceiling.
    Exhausted { error: NetworkError, attempts: u32 },
    /// A second sequencing conflict after refreshing the nonce.
    Sequencing { error: NetworkError, attempts: u32 },
    /// A sequencing conflict after an attempt that may already have been
    /// included. Resubmitting could duplicate the operation.
    Ambiguous { error: NetworkError, attempts: u32 },
    /// A non-retryable rejection.
    Fatal { error: NetworkError, attempts: u32 },
}

/// What a failed mutation was trying to do; decides the escalated error.
#[derive(Debug, Clone)]
pub enum Operation {
    Deploy { component: String },
    Wire { from: String, to: String, setter: String },
    Grant { grant: String },
}

impl Operation {
    pub fn label(&self) -> String {
        match self {
            Self::Deploy { component } => format!("deploy {component}"),
            Self::Wire { from, to, setter } => format!("wire {from}.{setter} <- {to}"),
            Self::Grant { grant } => format!("grant {grant}"),
        }
    }

    fn failed(self, attempts: u32, source: NetworkError) -> DeployError {
        match self {
            Self::Deploy { component } => DeployError::DeployFailed {
                component,
                attempts,
                source,
            },
            Self::Wire { from, to, setter } => DeployError::WireFailed {
                from,
                to,
                setter,
                attempts,
                source,
            },
            Self::Grant { grant } => DeployError::ConfigureFailed {
                grant,
                attempts,
                source,
            },
        }
    }

    /// Translate a cursor failure into the run-level error for this operation.
    pub fn escalate(self, failure: MutationFailure, identity: Address) -> DeployError {
        let label = self.label();
        match failure {
            MutationFailure::Cancelled => DeployError::Cancelled(label),
            MutationFailure::Nonce(RetryFailure { error, attempts }) => {
                DeployError::TransientNetwork {
                    operation: format!("nonce lookup for {label}"),
                    attempts,
                    source: error,
                }
            }
            MutationFailure::Sequencing { error, .. } => DeployError::SequencingConflict {
                operation: label,
                source: error,
            },
            MutationFailure::Ambiguous { error, attempts } => DeployError::AmbiguousOutcome {
                operation: label,
                attempts,
                source: error,
            },
            MutationFailure::Fatal {
                error: source @ NetworkError::Unauthorized(_),
                ..
            } => DeployError::Authorization {
                operation: label,
                source,
            },
            MutationFailure::Fatal {
                error: NetworkError::InsufficientFunds(detail),
                ..
            } => DeployError::InsufficientBalance { identity, detail },
            MutationFailure::Exhausted { error, attempts }
            | MutationFailure::Fatal { error, attempts } => self.failed(attempts, error),
        }
    }
}

/// Owns the deployer identity and its next nonce. Borrowed `&mut` for every
/// submission, so mutations are strictly serialized.
pub struct SignerCursor<'a, C: NetworkClient + ?Sized> {
    client: &'a C,
    identity: Address,
    nonce: Option<u64>,
    policy: &'a RetryPolicy,
    observer: &'a dyn DeployObserver,
    cancel: &'a CancelFlag,
    submitted: u64,
}

impl<'a, C: NetworkClient + ?Sized> SignerCursor<'a, C> {
    /// The nonce is fetched lazily on the first submission.
    pub fn new(
        client: &'a C,
        identity: Address,
        policy: &'a RetryPolicy,
        observer: &'a dyn DeployObserver,
        cancel: &'a CancelFlag,
    ) -> Self {
        Self {
            client,
            identity,
            nonce: None,
            policy,
            observer,
            cancel,
            submitted: 0,
        }
    }

    pub fn identity(&self) -> Address {
        self.identity
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    /// Confirmed mutations issued through this cursor.
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    async fn fetch_nonce(&self) -> Result<u64, RetryFailure> {
        let identity = self.identity;
        retry_read(self.policy, self.observer, "nonce lookup", || {
            self.client.next_nonce(identity)
        })
        .await
    }

    /// Submit one mutation and wait for its outcome.
    ///
    /// Transient failures are retried with the same nonce, so at most one
    /// of the attempts can be included. A sequencing conflict refreshes the
    /// nonce once, unless an earlier attempt failed transiently: that attempt
    /// may have landed and consumed the nonce, so the outcome is reported as
    /// ambiguous instead of submitting again.
    pub async fn submit<T, F, Fut>(
        &mut self,
        operation: &str,
        mut op: F,
    ) -> Result<T, MutationFailure>
    where
        F: FnMut(TxContext) -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(MutationFailure::Cancelled);
        }
        let mut nonce = match self.nonce {
            Some(nonce) => nonce,
            None => self.fetch_nonce().await.map_err(MutationFailure::Nonce)?,
        };
        self.nonce = Some(nonce);

        let mut attempt = 0;
        let mut refreshed = false;
        let mut maybe_landed = false;
        loop {
            attempt += 1;
            let tx = TxContext {
                from: self.identity,
                nonce,
            };
            debug!(operation, nonce, attempt, "submitting");
            match op(tx).await {
                Ok(value) => {
                    self.nonce = Some(nonce + 1);
                    self.submitted += 1;
                    return Ok(value);
                }
                Err(error @ NetworkError::Sequencing(_)) => {
                    if maybe_landed {
                        warn!(operation, nonce, error = %error, "earlier attempt may have been included");
                        self.nonce = None;
                        return Err(MutationFailure::Ambiguous {
                            error,
                            attempts: attempt,
                        });
                    }
                    if refreshed {
                        return Err(MutationFailure::Sequencing {
                            error,
                            attempts: attempt,
                        });
                    }
                    refreshed = true;
                    warn!(operation, nonce, error = %error, "sequencing conflict, refreshing nonce");
                    nonce = self.fetch_nonce().await.map_err(MutationFailure::Nonce)?;
                    self.nonce = Some(nonce);
                    self.observer
                        .on_event(&ProgressEvent::NonceRefreshed { nonce });
                }
                Err(error) if error.is_transient() => {
                    maybe_landed = true;
                    if attempt >= self.policy.max_attempts {
                        return Err(MutationFailure::Exhausted {
                            error,
                            attempts: attempt,
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    self.observer.on_event(&ProgressEvent::Retrying {
                        operation: operation.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: error.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(MutationFailure::Fatal {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}
