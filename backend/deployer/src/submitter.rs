//! Transaction submission.
//!
//! For each contract: compile, acquire a nonce, sign, broadcast, and append
//! a [`TransactionRecord`] to the log.  Nonce acquisition is serialized
//! through one mutex for the whole run, even when broadcasts run
//! concurrently.
//!
//! Transient failures (signer or network unavailable) are retried with
//! exponential back-off, re-broadcasting the *same* signed bytes so a retry
//! can never produce a second transaction.  A node rejection is final.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{is_nonce_rejection, normalize_tx_id, ChainRpc};
use crate::compiler::Compiler;
use crate::config::Network;
use crate::contract::{Contract, ContractStatus, TerminalStatus, TransactionRecord};
use crate::db;
use crate::errors::{DeployerError, Result};
use crate::funding::Phase;
use crate::signer::{SignedTransaction, Signer, UnsignedTransaction};

const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

// ─────────────────────────────────────────────────────────
// Nonces
// ─────────────────────────────────────────────────────────

/// Hands out nonces for the deployer account.
///
/// The starting point is the larger of the chain's mempool-aware next nonce
/// and one past the highest logged transaction that has not settled, so
/// transactions left in the mempool by an earlier run are never collided
/// with.  Nonces the node never accepted are released and handed out again
/// before fresh ones.
pub struct NonceManager {
    chain: Arc<dyn ChainRpc>,
    pool: SqlitePool,
    address: String,
    state: Mutex<NonceState>,
}

#[derive(Debug, Default)]
struct NonceState {
    next: Option<u64>,
    released: BTreeSet<u64>,
}

impl NonceManager {
    pub fn new(chain: Arc<dyn ChainRpc>, pool: SqlitePool, address: impl Into<String>) -> Self {
        Self {
            chain,
            pool,
            address: address.into(),
            state: Mutex::new(NonceState::default()),
        }
    }

    pub async fn acquire(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        if let Some(nonce) = state.released.pop_first() {
            debug!("Reusing released nonce {nonce}");
            return Ok(nonce);
        }
        let nonce = match state.next {
            Some(n) => n,
            None => self.read_next().await?,
        };
        state.next = Some(nonce + 1);
        Ok(nonce)
    }

    async fn read_next(&self) -> Result<u64> {
        let on_chain = self.chain.get_account_nonce(&self.address).await?;
        let logged = db::highest_unsettled_nonce(&self.pool)
            .await?
            .map_or(0, |n| n + 1);
        if logged > on_chain {
            info!(
                "Account {} reports nonce {on_chain} but the log has unsettled transactions up to {}; starting at {logged}",
                self.address,
                logged - 1
            );
        } else {
            debug!("Account nonce for {} read from chain: {on_chain}", self.address);
        }
        Ok(on_chain.max(logged))
    }

    /// Give back a nonce the node never accepted.
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        let Some(next) = state.next else {
            return;
        };
        if nonce >= next {
            return;
        }
        state.released.insert(nonce);
        // Fold released nonces at the top back into the counter.
        let mut next = next;
        while next > 0 && state.released.remove(&(next - 1)) {
            next -= 1;
        }
        state.next = Some(next);
    }

    /// Forget everything cached; the next acquisition re-reads the chain and
    /// the log.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.next = None;
        state.released.clear();
    }
}

/// A failed sign-and-broadcast.
struct BroadcastFailure {
    error: DeployerError,
    /// Signed bytes were sent at least once, so the node may hold them.
    reached_node: bool,
}

// ─────────────────────────────────────────────────────────
// Submitter
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubmitterSettings {
    pub sender: String,
    pub key_ref: String,
    pub network: Network,
    pub fee: u64,
    /// Total broadcast attempts for transient failures, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub parallel: bool,
    /// Worker pool size when `parallel` is set.
    pub concurrency: usize,
}

impl SubmitterSettings {
    pub fn new(sender: impl Into<String>, key_ref: impl Into<String>, network: Network) -> Self {
        Self {
            sender: sender.into(),
            key_ref: key_ref.into(),
            network,
            fee: 0,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECS),
            parallel: false,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(TransactionRecord),
    /// The registry or the transaction log already shows a confirmation.
    AlreadyConfirmed { tx_id: Option<String> },
    Failed { reason: String },
    /// Cancelled before the contract was picked up.
    NotAttempted,
}

pub struct Submitter {
    chain: Arc<dyn ChainRpc>,
    signer: Arc<dyn Signer>,
    compiler: Arc<dyn Compiler>,
    nonces: NonceManager,
    pool: SqlitePool,
    settings: SubmitterSettings,
}

impl Submitter {
    pub fn new(
        chain: Arc<dyn ChainRpc>,
        signer: Arc<dyn Signer>,
        compiler: Arc<dyn Compiler>,
        pool: SqlitePool,
        settings: SubmitterSettings,
    ) -> Self {
        let nonces = NonceManager::new(Arc::clone(&chain), pool.clone(), settings.sender.clone());
        Self {
            chain,
            signer,
            compiler,
            nonces,
            pool,
            settings,
        }
    }

    pub fn settings(&self) -> &SubmitterSettings {
        &self.settings
    }

    /// Submit one batch, sequentially or through a bounded worker pool.
    /// Results come back in input order.
    pub async fn submit_batch(
        self: &Arc<Self>,
        contracts: Vec<Contract>,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Vec<(Contract, SubmitOutcome)> {
        if !self.settings.parallel || contracts.len() <= 1 {
            let mut out = Vec::with_capacity(contracts.len());
            for contract in contracts {
                let outcome = if cancel.is_cancelled() {
                    SubmitOutcome::NotAttempted
                } else {
                    self.submit(&contract, phase).await
                };
                out.push((contract, outcome));
            }
            return out;
        }

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut workers = JoinSet::new();
        for (index, contract) in contracts.into_iter().enumerate() {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            workers.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) if !cancel.is_cancelled() => this.submit(&contract, phase).await,
                    _ => SubmitOutcome::NotAttempted,
                };
                (index, contract, outcome)
            });
        }

        let mut out = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => out.push(result),
                Err(e) => error!("Submission worker failed: {e}"),
            }
        }
        out.sort_by_key(|(index, _, _)| *index);
        out.into_iter().map(|(_, c, o)| (c, o)).collect()
    }

    /// Submit a single contract.  Never returns an error: every failure is
    /// folded into [`SubmitOutcome::Failed`] so one contract cannot abort
    /// its batch.
    pub async fn submit(&self, contract: &Contract, phase: Phase) -> SubmitOutcome {
        match self.try_submit(contract, phase).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Submission of {} failed: {e}", contract.name);
                SubmitOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_submit(&self, contract: &Contract, phase: Phase) -> Result<SubmitOutcome> {
        if contract.status == ContractStatus::Confirmed {
            return Ok(SubmitOutcome::AlreadyConfirmed {
                tx_id: contract.last_tx_id.clone(),
            });
        }
        let history = db::transactions_for_contract(&self.pool, &contract.name).await?;
        if let Some(done) = history
            .iter()
            .find(|r| r.terminal_status == Some(TerminalStatus::Confirmed))
        {
            info!("{} already confirmed as {}; skipping", contract.name, done.tx_id);
            return Ok(SubmitOutcome::AlreadyConfirmed {
                tx_id: Some(done.tx_id.clone()),
            });
        }

        let source = tokio::fs::read_to_string(&contract.source)
            .await
            .map_err(|e| DeployerError::Compile {
                contract: contract.name.clone(),
                message: format!("cannot read {}: {e}", contract.source.display()),
            })?;
        let artifact_hash = self.compiler.compile(contract, &source).await?;

        let nonce = self.nonces.acquire().await?;
        let unsigned = UnsignedTransaction {
            contract_name: contract.name.clone(),
            code_body: source,
            sender: self.settings.sender.clone(),
            nonce,
            fee: self.settings.fee,
            network: self.settings.network,
            artifact_hash,
        };

        let tx_id = match self.sign_and_broadcast(&unsigned).await {
            Ok(tx_id) => tx_id,
            Err(failure) => {
                self.recover_nonce(nonce, &failure).await;
                return Err(failure.error);
            }
        };

        let record = TransactionRecord {
            contract: contract.name.clone(),
            tx_id: tx_id.clone(),
            nonce,
            submitted_at: chrono::Utc::now().timestamp(),
            terminal_status: None,
        };
        if let Err(e) = db::insert_transaction(&self.pool, &record).await {
            error!("Broadcast {tx_id} for {} could not be logged: {e}", contract.name);
        }
        info!(
            "Broadcast {} (nonce {nonce}, phase {phase}) as {tx_id}",
            contract.name
        );
        Ok(SubmitOutcome::Submitted(record))
    }

    async fn recover_nonce(&self, nonce: u64, failure: &BroadcastFailure) {
        match &failure.error {
            DeployerError::Rejected { reason } if is_nonce_rejection(reason) => {
                warn!("Nonce {nonce} refused ({reason}); re-reading the account nonce");
                self.nonces.invalidate().await;
            }
            DeployerError::Rejected { .. } => self.nonces.release(nonce).await,
            // The last attempt may still have landed in the mempool.
            _ if failure.reached_node => self.nonces.invalidate().await,
            _ => self.nonces.release(nonce).await,
        }
    }

    async fn sign_and_broadcast(
        &self,
        unsigned: &UnsignedTransaction,
    ) -> std::result::Result<String, BroadcastFailure> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut backoff = self.settings.initial_backoff;
        let mut signed: Option<SignedTransaction> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let step = match &signed {
                Some(tx) => self.chain.broadcast_transaction(&tx.raw).await,
                None => match self.signer.sign(unsigned, &self.settings.key_ref).await {
                    Ok(tx) => {
                        let sent = self.chain.broadcast_transaction(&tx.raw).await;
                        signed = Some(tx);
                        sent
                    }
                    Err(e) => Err(e),
                },
            };

            match step {
                Ok(tx_id) => return Ok(normalize_tx_id(&tx_id)),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        "Attempt {attempt}/{max_attempts} for {} failed: {e}; retrying in {:?}",
                        unsigned.contract_name, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.max_backoff);
                }
                Err(error) => {
                    return Err(BroadcastFailure {
                        error,
                        reached_node: signed.is_some(),
                    })
                }
            }
        }
    }
}
