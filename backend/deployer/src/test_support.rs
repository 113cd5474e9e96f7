//! Scripted stand-ins for the chain, signer, and compiler boundaries.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::chain::{ChainRpc, TxStatus};
use crate::compiler::{artifact_hash, Compiler};
use crate::config::Network;
use crate::contract::{Category, Contract};
use crate::errors::{DeployerError, Result};
use crate::funding::{CurveParams, PhaseSchedule};
use crate::orchestrator::OrchestratorSettings;
use crate::signer::{SignedTransaction, Signer, UnsignedTransaction};
use crate::submitter::SubmitterSettings;

/// Millisecond timings so confirmation waits and retries stay fast.
pub fn orchestrator_settings() -> OrchestratorSettings {
    let schedule = PhaseSchedule::default();
    let mut submitter = SubmitterSettings::new("ST1DEPLOYER", "key:test", Network::Devnet);
    submitter.fee = 1_000;
    submitter.initial_backoff = Duration::from_millis(1);
    submitter.max_backoff = Duration::from_millis(2);
    OrchestratorSettings {
        batch_size: 5,
        dry_run: false,
        follow: false,
        poll_interval: Duration::from_millis(2),
        confirmation_timeout: Duration::from_millis(40),
        curve: CurveParams::new(1_000, schedule.final_threshold()),
        phase_schedule: schedule,
        manifest_export_path: None,
        verify_deployment: true,
        submitter,
    }
}

#[derive(Debug, Clone)]
pub enum BroadcastStep {
    Accept,
    Transient(String),
    Reject(String),
}

/// In-memory chain with a mempool.  Broadcast ids are the SHA-256 of the
/// payload, so the same bytes always produce the same id.  A second
/// transaction for a nonce already in the mempool is refused, as a node does.
pub struct MockChain {
    mined_nonce: Mutex<u64>,
    /// Report only the mined nonce, like a node without the extended API.
    mined_only: bool,
    balance: u64,
    broadcast_script: Mutex<VecDeque<BroadcastStep>>,
    rejected_contracts: Mutex<HashMap<String, String>>,
    statuses: Mutex<HashMap<String, VecDeque<TxStatus>>>,
    contract_statuses: Mutex<HashMap<String, VecDeque<TxStatus>>>,
    tx_contracts: Mutex<HashMap<String, String>>,
    tx_nonces: Mutex<HashMap<String, u64>>,
    mempool: Mutex<BTreeMap<u64, String>>,
    deployed: Mutex<HashSet<String>>,
    default_status: Mutex<TxStatus>,
    payloads: Mutex<Vec<Vec<u8>>>,
    pub broadcasts: AtomicUsize,
    pub nonce_reads: AtomicUsize,
    pub status_queries: AtomicUsize,
    pub contract_lookups: AtomicUsize,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::with_nonce(0)
    }
}

impl MockChain {
    pub fn with_nonce(nonce: u64) -> Self {
        Self {
            mined_nonce: Mutex::new(nonce),
            mined_only: false,
            balance: 1_000_000_000_000,
            broadcast_script: Mutex::new(VecDeque::new()),
            rejected_contracts: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            contract_statuses: Mutex::new(HashMap::new()),
            tx_contracts: Mutex::new(HashMap::new()),
            tx_nonces: Mutex::new(HashMap::new()),
            mempool: Mutex::new(BTreeMap::new()),
            deployed: Mutex::new(HashSet::new()),
            default_status: Mutex::new(TxStatus::Confirmed),
            payloads: Mutex::new(Vec::new()),
            broadcasts: AtomicUsize::new(0),
            nonce_reads: AtomicUsize::new(0),
            status_queries: AtomicUsize::new(0),
            contract_lookups: AtomicUsize::new(0),
        }
    }

    pub fn with_balance(mut self, balance: u64) -> Self {
        self.balance = balance;
        self
    }

    pub fn mined_nonce_only(mut self) -> Self {
        self.mined_only = true;
        self
    }

    /// Mark `contract` as already deployed under the deployer address.
    pub fn deploy_on_chain(&self, contract: &str) {
        self.deployed.lock().unwrap().insert(contract.to_string());
    }

    /// Outcomes for the next broadcasts, in order.  Once drained every
    /// broadcast is accepted.
    pub fn script_broadcasts(&self, steps: impl IntoIterator<Item = BroadcastStep>) {
        self.broadcast_script.lock().unwrap().extend(steps);
    }

    /// Every broadcast for `contract` is refused by the node.
    pub fn reject_contract(&self, contract: &str, reason: &str) {
        self.rejected_contracts
            .lock()
            .unwrap()
            .insert(contract.to_string(), reason.to_string());
    }

    pub fn script_status(&self, tx_id: &str, statuses: impl IntoIterator<Item = TxStatus>) {
        self.statuses
            .lock()
            .unwrap()
            .entry(tx_id.to_string())
            .or_default()
            .extend(statuses);
    }

    /// Statuses reported for whatever transaction deploys `contract`.
    pub fn script_contract_status(
        &self,
        contract: &str,
        statuses: impl IntoIterator<Item = TxStatus>,
    ) {
        self.contract_statuses
            .lock()
            .unwrap()
            .entry(contract.to_string())
            .or_default()
            .extend(statuses);
    }

    pub fn set_default_status(&self, status: TxStatus) {
        *self.default_status.lock().unwrap() = status;
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }

    /// Contract names in broadcast order (one entry per broadcast call).
    pub fn broadcast_contracts(&self) -> Vec<String> {
        self.payloads()
            .iter()
            .map(|p| payload_parts(p).0)
            .collect()
    }

    /// Nonces of transactions waiting in the mempool, ascending.
    pub fn mempool_nonces(&self) -> Vec<u64> {
        self.mempool.lock().unwrap().keys().copied().collect()
    }

    pub fn tx_id_for(payload: &[u8]) -> String {
        format!("0x{}", hex::encode(Sha256::digest(payload)))
    }

    fn accept(&self, contract: String, nonce: Option<u64>, tx_id: String) -> Result<String> {
        if let Some(nonce) = nonce {
            if nonce < *self.mined_nonce.lock().unwrap() {
                return Err(DeployerError::Rejected {
                    reason: "BadNonce".to_string(),
                });
            }
            {
                let mut mempool = self.mempool.lock().unwrap();
                match mempool.get(&nonce) {
                    Some(existing) if *existing != tx_id => {
                        return Err(DeployerError::Rejected {
                            reason: "ConflictingNonceInMempool".to_string(),
                        })
                    }
                    _ => {
                        mempool.insert(nonce, tx_id.clone());
                    }
                }
            }
            self.tx_nonces.lock().unwrap().insert(tx_id.clone(), nonce);
        }
        self.tx_contracts
            .lock()
            .unwrap()
            .insert(tx_id.clone(), contract);
        Ok(tx_id)
    }

    /// Leave the mempool once a final status has been observed.
    fn observe(&self, tx_id: &str, status: &TxStatus) {
        if *status == TxStatus::Pending {
            return;
        }
        let nonce = self.tx_nonces.lock().unwrap().get(tx_id).copied();
        if let Some(nonce) = nonce {
            self.mempool.lock().unwrap().remove(&nonce);
            if *status == TxStatus::Confirmed {
                let mut mined = self.mined_nonce.lock().unwrap();
                *mined = (*mined).max(nonce + 1);
            }
        }
        if *status == TxStatus::Confirmed {
            let contract = self.tx_contracts.lock().unwrap().get(tx_id).cloned();
            if let Some(contract) = contract {
                self.deployed.lock().unwrap().insert(contract);
            }
        }
    }
}

/// `(contract, nonce)` from a `"<contract>:<nonce>:<seq>"` payload.
fn payload_parts(payload: &[u8]) -> (String, Option<u64>) {
    let text = String::from_utf8_lossy(payload);
    let mut parts = text.split(':');
    let contract = parts.next().unwrap_or_default().to_string();
    let nonce = parts.next().and_then(|n| n.parse().ok());
    (contract, nonce)
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn broadcast_transaction(&self, signed_tx: &[u8]) -> Result<String> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(signed_tx.to_vec());
        let (contract, nonce) = payload_parts(signed_tx);

        if let Some(reason) = self.rejected_contracts.lock().unwrap().get(&contract) {
            return Err(DeployerError::Rejected {
                reason: reason.clone(),
            });
        }
        let step = self
            .broadcast_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BroadcastStep::Accept);
        match step {
            BroadcastStep::Accept => self.accept(contract, nonce, Self::tx_id_for(signed_tx)),
            BroadcastStep::Transient(msg) => Err(DeployerError::Submission(msg)),
            BroadcastStep::Reject(reason) => Err(DeployerError::Rejected { reason }),
        }
    }

    async fn get_transaction_status(&self, tx_id: &str) -> Result<TxStatus> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .statuses
            .lock()
            .unwrap()
            .get_mut(tx_id)
            .and_then(VecDeque::pop_front);
        let status = match scripted {
            Some(status) => status,
            None => {
                let contract = self.tx_contracts.lock().unwrap().get(tx_id).cloned();
                contract
                    .and_then(|c| {
                        self.contract_statuses
                            .lock()
                            .unwrap()
                            .get_mut(&c)
                            .and_then(VecDeque::pop_front)
                    })
                    .unwrap_or_else(|| self.default_status.lock().unwrap().clone())
            }
        };
        self.observe(tx_id, &status);
        Ok(status)
    }

    async fn get_account_nonce(&self, _address: &str) -> Result<u64> {
        self.nonce_reads.fetch_add(1, Ordering::SeqCst);
        let mined = *self.mined_nonce.lock().unwrap();
        if self.mined_only {
            return Ok(mined);
        }
        let pending_next = self
            .mempool
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .map_or(0, |n| n + 1);
        Ok(mined.max(pending_next))
    }

    async fn get_account_balance(&self, _address: &str) -> Result<u64> {
        Ok(self.balance)
    }

    async fn contract_exists(&self, _address: &str, name: &str) -> Result<bool> {
        self.contract_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.deployed.lock().unwrap().contains(name))
    }

    async fn get_chain_tip(&self) -> Result<Option<u64>> {
        Ok(Some(150_000))
    }
}

/// Produces `"<contract>:<nonce>:<seq>"` as the signed payload, where `seq`
/// counts signatures so a re-signed transaction gets a fresh id.
#[derive(Default)]
pub struct MockSigner {
    signed: Mutex<Vec<(String, u64)>>,
}

impl MockSigner {
    pub fn signed(&self) -> Vec<(String, u64)> {
        self.signed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signer for MockSigner {
    async fn sign(&self, tx: &UnsignedTransaction, _key_ref: &str) -> Result<SignedTransaction> {
        let mut signed = self.signed.lock().unwrap();
        signed.push((tx.contract_name.clone(), tx.nonce));
        Ok(SignedTransaction {
            raw: format!("{}:{}:{}", tx.contract_name, tx.nonce, signed.len()).into_bytes(),
        })
    }
}

#[derive(Default)]
pub struct MockCompiler {
    failing: HashSet<String>,
}

impl MockCompiler {
    pub fn failing<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            failing: names.into_iter().map(str::to_string).collect(),
        }
    }
}

#[async_trait]
impl Compiler for MockCompiler {
    async fn compile(&self, contract: &Contract, source: &str) -> Result<String> {
        if self.failing.contains(&contract.name) {
            return Err(DeployerError::Compile {
                contract: contract.name.clone(),
                message: "unresolved contract".to_string(),
            });
        }
        Ok(artifact_hash(source))
    }
}

/// Temporary directory of `.clar` files.
pub struct SourceDir {
    dir: TempDir,
}

impl Default for SourceDir {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{name}.clar"))
    }

    /// Write a source file for `name` and return a contract pointing at it.
    pub fn contract(&self, name: &str, category: Category) -> Contract {
        let path = self.path(name);
        std::fs::write(&path, format!("(define-constant CONTRACT \"{name}\")\n")).unwrap();
        Contract::new(name, category, path)
    }
}
