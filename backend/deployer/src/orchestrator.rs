//! Orchestration context.
//!
//! Owns the registry, the deployment plan, the phase controller, and the
//! collaborators, and runs scheduling passes over them:
//!
//! 1. restore the persisted manifest and funding state ([`Orchestrator::load`]);
//! 2. reconcile contracts left `Pending` by an earlier run, and adopt
//!    contracts the chain already holds under the deployer address;
//! 3. plan batches for the current phase and submit them, blocking before a
//!    batch only until the confirmations its contracts depend on are known;
//! 4. re-plan after every pass so a phase advance unlocks more work; in
//!    follow mode, wait for the next phase once nothing is left;
//! 5. verify the result against the chain.
//!
//! Cancellation stops new submissions immediately.  Broadcast transactions
//! are never cancelled; they stay `Pending` and are reconciled next run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{normalize_tx_id, ChainRpc, TxStatus};
use crate::compiler::Compiler;
use crate::config::Config;
use crate::contract::{Category, Contract, ContractStatus, TransactionRecord};
use crate::db;
use crate::errors::{DeployerError, Result};
use crate::events::{DeploymentEvent, EventFeed, EventStatus};
use crate::funding::{
    Contribution, ContributionOutcome, CurveParams, FundingSnapshot, FundingState, Phase,
    PhaseController, PhaseSchedule,
};
use crate::monitor::{Confirmation, Monitor};
use crate::registry::Registry;
use crate::resolver::{ancestors, resolve, DeploymentPlan};
use crate::scheduler::{plan_batches, Schedule, SkipReason, WithholdReason};
use crate::signer::Signer;
use crate::submitter::{SubmitOutcome, Submitter, SubmitterSettings};

// ─────────────────────────────────────────────────────────
// Settings & collaborators
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub batch_size: usize,
    pub dry_run: bool,
    pub follow: bool,
    pub poll_interval: Duration,
    pub confirmation_timeout: Duration,
    pub phase_schedule: PhaseSchedule,
    pub curve: CurveParams,
    pub manifest_export_path: Option<PathBuf>,
    /// Check every contract against the chain once a run ends.
    pub verify_deployment: bool,
    pub submitter: SubmitterSettings,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut submitter = SubmitterSettings::new(
            config.deployer_address.clone(),
            config.deployer_key_ref.clone(),
            config.network,
        );
        submitter.fee = config.deploy_fee_ustx;
        submitter.max_attempts = config.max_submit_attempts;
        submitter.parallel = config.parallel;
        submitter.concurrency = config.batch_size;

        Self {
            batch_size: config.batch_size,
            dry_run: config.dry_run,
            follow: config.follow,
            poll_interval: config.poll_interval(),
            confirmation_timeout: config.confirmation_timeout(),
            phase_schedule: config.phase_schedule.clone(),
            curve: config.curve_params(),
            manifest_export_path: config.manifest_export_path.clone(),
            verify_deployment: config.verify_deployment,
            submitter,
        }
    }
}

pub struct Collaborators {
    pub chain: Arc<dyn ChainRpc>,
    pub signer: Arc<dyn Signer>,
    pub compiler: Arc<dyn Compiler>,
}

// ─────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Confirmed,
    Failed,
    Unconfirmed,
    Withheld,
    Blocked,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub contract: String,
    pub category: Category,
    pub outcome: Outcome,
    pub tx_id: Option<String>,
    pub detail: Option<String>,
}

/// Post-run comparison of the local record with the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verification {
    /// Contracts recorded as confirmed.
    pub expected: Vec<String>,
    /// Recorded as confirmed and present on chain.
    pub verified: Vec<String>,
    /// Recorded as confirmed but absent from the chain.
    pub missing: Vec<String>,
    /// Present on chain but not recorded as confirmed.
    pub extra: Vec<String>,
}

impl Verification {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub phase: Phase,
    pub dry_run: bool,
    /// Every scheduling pass, in order.  A dry run has exactly one.
    pub passes: Vec<Schedule>,
    pub entries: Vec<ReportEntry>,
    /// Absent for dry runs, when disabled, or when the chain could not be read.
    pub verification: Option<Verification>,
}

impl DeploymentReport {
    pub fn entry(&self, contract: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.contract == contract)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.entries.iter().filter(|e| e.outcome == outcome).count()
    }
}

/// Latest outcome per contract for the current run.
type Ledger = BTreeMap<String, ReportEntry>;

/// Per-pass bookkeeping shared by the batches of one pass.
#[derive(Default)]
struct PassState {
    /// Contracts whose confirmation is still being awaited.
    watching: BTreeSet<String>,
    /// Contracts that failed, were blocked, or did not confirm in this pass.
    unresolved: BTreeSet<String>,
}

// ─────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────

pub struct Orchestrator {
    registry: RwLock<Registry>,
    plan: DeploymentPlan,
    funding: Mutex<PhaseController>,
    pool: SqlitePool,
    feed: EventFeed,
    chain: Arc<dyn ChainRpc>,
    submitter: Arc<Submitter>,
    monitor: Monitor,
    settings: OrchestratorSettings,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Resolve the plan and restore persisted state.  Planning errors
    /// (unknown dependency, cycle) abort here, before anything is submitted.
    pub async fn load(
        mut registry: Registry,
        collaborators: Collaborators,
        pool: SqlitePool,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        let plan = resolve(&registry)?;
        info!(
            "Resolved deployment order for {} contracts ({} uncategorized)",
            plan.len(),
            registry.uncategorized().count()
        );

        restore_statuses(&pool, &mut registry).await?;

        let (cumulative, phase) = db::load_funding(&pool).await?;
        let seen = db::contribution_ids(&pool).await?;
        let controller = PhaseController::restore(
            settings.phase_schedule.clone(),
            FundingState {
                cumulative,
                phase,
                curve: settings.curve.clone(),
            },
            seen,
        );
        info!(
            "Funding restored: {} uSTX, phase {}",
            controller.cumulative(),
            controller.phase()
        );

        let Collaborators {
            chain,
            signer,
            compiler,
        } = collaborators;
        let submitter = Arc::new(Submitter::new(
            Arc::clone(&chain),
            signer,
            compiler,
            pool.clone(),
            settings.submitter.clone(),
        ));
        let monitor = Monitor::new(
            Arc::clone(&chain),
            settings.poll_interval,
            settings.confirmation_timeout,
        );

        Ok(Self {
            registry: RwLock::new(registry),
            plan,
            funding: Mutex::new(controller),
            feed: EventFeed::new(pool.clone()),
            pool,
            chain,
            submitter,
            monitor,
            settings,
            cancel: CancellationToken::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn feed(&self) -> &EventFeed {
        &self.feed
    }

    pub fn plan(&self) -> &DeploymentPlan {
        &self.plan
    }

    /// Token that aborts the run.  Cancelling it stops new submissions.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn contracts(&self) -> Vec<Contract> {
        self.registry.read().await.iter().cloned().collect()
    }

    pub async fn funding(&self) -> FundingSnapshot {
        self.funding.lock().await.snapshot()
    }

    /// The schedule the next pass would execute.
    pub async fn preview(&self) -> Schedule {
        let phase = self.funding.lock().await.phase();
        self.schedule_for(phase, &BTreeSet::new()).await
    }

    async fn schedule_for(&self, phase: Phase, settled: &BTreeSet<String>) -> Schedule {
        let registry = self.registry.read().await;
        plan_batches(
            &registry,
            &self.plan,
            phase,
            self.settings.batch_size,
            settled,
        )
    }

    // ─── Run ───────────────────────────────────────────────

    pub async fn run(&self) -> Result<DeploymentReport> {
        let mut ledger = Ledger::new();

        if self.settings.dry_run {
            self.adopt_deployed(&mut ledger, false).await;
            let schedule = self.preview().await;
            info!(
                "Dry run: {} batches, {} withheld, {} skipped",
                schedule.batches.len(),
                schedule.withheld.len(),
                schedule.skipped.len()
            );
            self.note_unscheduled(&schedule, &mut ledger, false).await;
            return Ok(self.report(ledger, vec![schedule], true).await);
        }

        self.reconcile(&mut ledger).await?;
        self.adopt_deployed(&mut ledger, true).await;

        let mut passes = Vec::new();
        let mut settled = BTreeSet::new();
        let mut preflight_done = false;
        loop {
            if self.cancel.is_cancelled() {
                info!("Abort requested; no further submissions");
                break;
            }

            let phase = self.funding.lock().await.phase();
            let schedule = self.schedule_for(phase, &settled).await;
            self.note_unscheduled(&schedule, &mut ledger, true).await;

            if schedule.is_empty() {
                if !self.settings.follow || !self.wait_for_phase_change(phase).await {
                    break;
                }
                continue;
            }

            if !preflight_done {
                self.preflight(&schedule).await?;
                preflight_done = true;
            }

            info!(
                "Pass {} in phase {phase}: {} batches",
                passes.len() + 1,
                schedule.batches.len()
            );
            self.execute(&schedule, &mut settled, &mut ledger).await?;
            passes.push(schedule);
        }

        let mut report = self.report(ledger, passes, false).await;
        if self.settings.verify_deployment {
            report.verification = self.verify().await;
        }
        info!(
            "Run finished in phase {}: {} confirmed, {} failed, {} unconfirmed, {} withheld, {} blocked",
            report.phase,
            report.count(Outcome::Confirmed),
            report.count(Outcome::Failed),
            report.count(Outcome::Unconfirmed),
            report.count(Outcome::Withheld),
            report.count(Outcome::Blocked),
        );

        if let Some(path) = &self.settings.manifest_export_path {
            self.export_manifest(path).await?;
        }
        Ok(report)
    }

    /// Settle contracts left `Pending` by an earlier run with one status query each.
    async fn reconcile(&self, ledger: &mut Ledger) -> Result<()> {
        let pending: Vec<(String, Option<String>)> = self
            .registry
            .read()
            .await
            .iter()
            .filter(|c| c.status == ContractStatus::Pending)
            .map(|c| (c.name.clone(), c.last_tx_id.clone()))
            .collect();

        if !pending.is_empty() {
            info!("Reconciling {} pending contracts", pending.len());
        }

        for (name, tx_id) in pending {
            let Some(tx_id) = tx_id else {
                warn!("{name} is pending without a transaction id; marking failed");
                self.transition(&name, ContractStatus::Failed, None).await?;
                continue;
            };
            let confirmation = match self.monitor.check_once(&tx_id).await {
                Ok(TxStatus::Confirmed) => Confirmation::Confirmed,
                Ok(TxStatus::Rejected { reason }) => Confirmation::Rejected { reason },
                Ok(TxStatus::Pending) => {
                    info!("{name} ({tx_id}) is still pending");
                    Confirmation::TimedOut
                }
                Err(e) => {
                    warn!("Could not reconcile {name} ({tx_id}): {e}");
                    continue;
                }
            };
            let entry = self.settle(&name, &tx_id, confirmation).await?;
            ledger.insert(name, entry);
        }
        Ok(())
    }

    /// Mark contracts the chain already holds under the deployer address as
    /// confirmed, so a lost or stale manifest never causes a redeployment.
    /// With `persist` unset only the in-memory registry changes.
    async fn adopt_deployed(&self, ledger: &mut Ledger, persist: bool) {
        let candidates: Vec<(String, Category)> = self
            .registry
            .read()
            .await
            .deployable()
            .filter(|c| matches!(c.status, ContractStatus::Undeployed | ContractStatus::Failed))
            .map(|c| (c.name.clone(), c.category))
            .collect();
        let sender = &self.submitter.settings().sender;

        for (name, category) in candidates {
            match self.chain.contract_exists(sender, &name).await {
                Ok(false) => {}
                Ok(true) => {
                    info!("{name} is already deployed at {sender}.{name}; skipping");
                    {
                        let mut registry = self.registry.write().await;
                        let tx_id = registry.get(&name).and_then(|c| c.last_tx_id.clone());
                        registry.restore(&name, ContractStatus::Confirmed, tx_id);
                    }
                    if persist {
                        if let Err(e) = db::save_contract_status(
                            &self.pool,
                            &name,
                            category,
                            ContractStatus::Confirmed,
                            None,
                            None,
                        )
                        .await
                        {
                            error!("Could not record {name} as deployed: {e}");
                        }
                        self.feed
                            .publish(
                                DeploymentEvent::new(name.as_str(), category, EventStatus::Confirmed)
                                    .with_detail("found on chain"),
                            )
                            .await;
                    }
                    ledger.insert(
                        name.clone(),
                        entry(
                            &name,
                            category,
                            Outcome::Skipped,
                            None,
                            Some("already deployed on chain".to_string()),
                        ),
                    );
                }
                Err(e) => {
                    warn!("Could not check the chain for deployed contracts: {e}");
                    break;
                }
            }
        }
    }

    /// Compare every registered contract with the chain.
    async fn verify(&self) -> Option<Verification> {
        let contracts: Vec<(String, bool)> = self
            .registry
            .read()
            .await
            .iter()
            .map(|c| (c.name.clone(), c.status == ContractStatus::Confirmed))
            .collect();
        let sender = &self.submitter.settings().sender;

        let mut verification = Verification::default();
        for (name, expected) in contracts {
            let on_chain = match self.chain.contract_exists(sender, &name).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("Deployment verification skipped: {e}");
                    return None;
                }
            };
            match (expected, on_chain) {
                (true, true) => verification.verified.push(name.clone()),
                (true, false) => {
                    warn!("{name} is recorded as confirmed but {sender}.{name} is not on chain");
                    verification.missing.push(name.clone());
                }
                (false, true) => verification.extra.push(name.clone()),
                (false, false) => {}
            }
            if expected {
                verification.expected.push(name);
            }
        }
        info!(
            "Verified {}/{} contracts on chain ({} missing, {} unrecorded)",
            verification.verified.len(),
            verification.expected.len(),
            verification.missing.len(),
            verification.extra.len()
        );
        Some(verification)
    }

    /// Network reachability and a balance estimate.  A short balance is
    /// only a warning; the node rejects what it cannot fund.
    async fn preflight(&self, schedule: &Schedule) -> Result<()> {
        match self.chain.get_chain_tip().await? {
            Some(height) => info!("Chain reachable at height {height}"),
            None => info!("Chain reachable"),
        }

        let settings = self.submitter.settings();
        let needed = settings
            .fee
            .saturating_mul(schedule.scheduled().count() as u64);
        match self.chain.get_account_balance(&settings.sender).await {
            Ok(balance) if balance < needed => warn!(
                "Deployer balance {balance} uSTX is below the estimated {needed} uSTX for this pass"
            ),
            Ok(balance) => info!("Deployer balance {balance} uSTX (estimated cost {needed} uSTX)"),
            Err(e) => warn!("Could not read deployer balance: {e}"),
        }
        Ok(())
    }

    async fn wait_for_phase_change(&self, current: Phase) -> bool {
        let mut rx = self.funding.lock().await.subscribe();
        if *rx.borrow_and_update() != current {
            return true;
        }
        info!("Nothing deployable in phase {current}; waiting for the next phase");
        tokio::select! {
            changed = rx.changed() => changed.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Execute one pass: submit batch by batch while confirmations run in
    /// the background.
    async fn execute(
        &self,
        schedule: &Schedule,
        settled: &mut BTreeSet<String>,
        ledger: &mut Ledger,
    ) -> Result<()> {
        let mut inflight: JoinSet<(String, String, Confirmation)> = JoinSet::new();
        let mut pass = PassState::default();

        for batch in &schedule.batches {
            if self.cancel.is_cancelled() {
                break;
            }

            let prerequisites: BTreeMap<&str, BTreeSet<String>> = {
                let registry = self.registry.read().await;
                batch
                    .iter()
                    .map(|name| (name.as_str(), ancestors(&registry, name)))
                    .collect()
            };

            while prerequisites
                .values()
                .any(|deps| deps.iter().any(|d| pass.watching.contains(d)))
            {
                if !self.join_one(&mut inflight, &mut pass, settled, ledger).await? {
                    break;
                }
            }

            let mut ready = Vec::with_capacity(batch.len());
            for name in batch {
                let blocker = prerequisites
                    .get(name.as_str())
                    .and_then(|deps| deps.iter().find(|d| pass.unresolved.contains(*d)))
                    .cloned();
                if let Some(dep) = blocker {
                    let category = self.category_of(name).await;
                    let detail = format!("prerequisite {dep} did not confirm");
                    info!("Blocking {name}: {detail}");
                    self.feed
                        .publish(
                            DeploymentEvent::new(name.as_str(), category, EventStatus::Blocked)
                                .with_detail(detail.clone()),
                        )
                        .await;
                    ledger.insert(
                        name.clone(),
                        entry(name, category, Outcome::Blocked, None, Some(detail)),
                    );
                    settled.insert(name.clone());
                    pass.unresolved.insert(name.clone());
                    continue;
                }
                if let Some(contract) = self.registry.read().await.get(name).cloned() {
                    ready.push(contract);
                }
            }

            let phase = self.funding.lock().await.phase();
            let results = self.submitter.submit_batch(ready, phase, &self.cancel).await;
            for (contract, outcome) in results {
                self.record_submission(&contract, outcome, &mut inflight, &mut pass, settled, ledger)
                    .await?;
            }
        }

        while self.join_one(&mut inflight, &mut pass, settled, ledger).await? {}
        Ok(())
    }

    async fn record_submission(
        &self,
        contract: &Contract,
        outcome: SubmitOutcome,
        inflight: &mut JoinSet<(String, String, Confirmation)>,
        pass: &mut PassState,
        settled: &mut BTreeSet<String>,
        ledger: &mut Ledger,
    ) -> Result<()> {
        let name = contract.name.clone();
        match outcome {
            SubmitOutcome::Submitted(TransactionRecord { tx_id, .. }) => {
                self.transition(&name, ContractStatus::Pending, Some(&tx_id))
                    .await?;
                self.feed
                    .publish(
                        DeploymentEvent::new(name.as_str(), contract.category, EventStatus::Pending)
                            .with_tx(Some(&tx_id)),
                    )
                    .await;
                ledger.insert(
                    name.clone(),
                    entry(&name, contract.category, Outcome::Unconfirmed, Some(&tx_id), None),
                );

                let monitor = self.monitor.clone();
                let cancel = self.cancel.clone();
                pass.watching.insert(name.clone());
                inflight.spawn(async move {
                    let confirmation = monitor.await_confirmation(&tx_id, &cancel).await;
                    (name, tx_id, confirmation)
                });
            }
            SubmitOutcome::AlreadyConfirmed { tx_id } => {
                {
                    let mut registry = self.registry.write().await;
                    registry.restore(&name, ContractStatus::Confirmed, tx_id.clone());
                }
                db::save_contract_status(
                    &self.pool,
                    &name,
                    contract.category,
                    ContractStatus::Confirmed,
                    tx_id.as_deref(),
                    None,
                )
                .await?;
                ledger.insert(
                    name.clone(),
                    entry(
                        &name,
                        contract.category,
                        Outcome::Skipped,
                        tx_id.as_deref(),
                        Some("already confirmed".to_string()),
                    ),
                );
                settled.insert(name);
            }
            SubmitOutcome::Failed { reason } => {
                self.transition(&name, ContractStatus::Pending, None).await?;
                self.transition(&name, ContractStatus::Failed, None).await?;
                self.feed
                    .publish(
                        DeploymentEvent::new(name.as_str(), contract.category, EventStatus::Failed)
                            .with_detail(reason.clone()),
                    )
                    .await;
                error!("{name} ({}) failed: {reason}", contract.category);
                ledger.insert(
                    name.clone(),
                    entry(&name, contract.category, Outcome::Failed, None, Some(reason)),
                );
                settled.insert(name.clone());
                pass.unresolved.insert(name);
            }
            SubmitOutcome::NotAttempted => debug!("{name} not attempted"),
        }
        Ok(())
    }

    /// Wait for the next confirmation and apply it.  Returns `false` once
    /// nothing is in flight.
    async fn join_one(
        &self,
        inflight: &mut JoinSet<(String, String, Confirmation)>,
        pass: &mut PassState,
        settled: &mut BTreeSet<String>,
        ledger: &mut Ledger,
    ) -> Result<bool> {
        match inflight.join_next().await {
            Some(Ok((name, tx_id, confirmation))) => {
                pass.watching.remove(&name);
                let result = self.settle(&name, &tx_id, confirmation).await?;
                match result.outcome {
                    Outcome::Confirmed => {}
                    Outcome::Failed => {
                        settled.insert(name.clone());
                        pass.unresolved.insert(name.clone());
                    }
                    _ => {
                        pass.unresolved.insert(name.clone());
                    }
                }
                ledger.insert(name, result);
                Ok(true)
            }
            Some(Err(e)) => {
                error!("Confirmation task failed: {e}");
                Ok(true)
            }
            None => {
                // Anything still listed as watched lost its task.
                let lost = std::mem::take(&mut pass.watching);
                pass.unresolved.extend(lost);
                Ok(false)
            }
        }
    }

    /// Apply a final (or timed-out) confirmation result to the log, the
    /// registry, the manifest, and the feed.
    async fn settle(
        &self,
        name: &str,
        tx_id: &str,
        confirmation: Confirmation,
    ) -> Result<ReportEntry> {
        db::set_terminal_status(&self.pool, tx_id, confirmation.terminal_status()).await?;

        let result = match confirmation {
            Confirmation::Confirmed => {
                let category = self
                    .transition(name, ContractStatus::Confirmed, Some(tx_id))
                    .await?;
                self.feed
                    .publish(
                        DeploymentEvent::new(name, category, EventStatus::Confirmed)
                            .with_tx(Some(tx_id)),
                    )
                    .await;
                info!("{name} ({category}) confirmed in {tx_id}");
                entry(name, category, Outcome::Confirmed, Some(tx_id), None)
            }
            Confirmation::Rejected { reason } => {
                let category = self
                    .transition(name, ContractStatus::Failed, Some(tx_id))
                    .await?;
                self.feed
                    .publish(
                        DeploymentEvent::new(name, category, EventStatus::Failed)
                            .with_tx(Some(tx_id))
                            .with_detail(reason.clone()),
                    )
                    .await;
                error!("{name} ({category}) failed on chain in {tx_id}: {reason}");
                entry(name, category, Outcome::Failed, Some(tx_id), Some(reason))
            }
            Confirmation::TimedOut => {
                let category = self.category_of(name).await;
                let detail = DeployerError::Timeout {
                    tx_id: tx_id.to_string(),
                }
                .to_string();
                self.feed
                    .publish(
                        DeploymentEvent::new(name, category, EventStatus::Unconfirmed)
                            .with_tx(Some(tx_id))
                            .with_detail(detail.clone()),
                    )
                    .await;
                warn!("{name} ({category}) unconfirmed: {detail}");
                entry(name, category, Outcome::Unconfirmed, Some(tx_id), Some(detail))
            }
        };
        Ok(result)
    }

    /// Apply a status transition in memory and persist it.
    async fn transition(
        &self,
        name: &str,
        status: ContractStatus,
        tx_id: Option<&str>,
    ) -> Result<Category> {
        let category = {
            let mut registry = self.registry.write().await;
            registry.set_status(name, status, tx_id)?;
            registry
                .get(name)
                .map(|c| c.category)
                .unwrap_or(Category::Uncategorized)
        };
        let phase = if status == ContractStatus::Pending {
            Some(self.funding.lock().await.phase())
        } else {
            None
        };
        db::save_contract_status(&self.pool, name, category, status, tx_id, phase).await?;
        Ok(category)
    }

    async fn category_of(&self, name: &str) -> Category {
        self.registry
            .read()
            .await
            .get(name)
            .map(|c| c.category)
            .unwrap_or(Category::Uncategorized)
    }

    /// Record withheld contracts, publishing an event only when the reason changes.
    async fn note_unscheduled(&self, schedule: &Schedule, ledger: &mut Ledger, publish: bool) {
        for held in &schedule.withheld {
            let detail = match &held.reason {
                WithholdReason::CategoryLocked => format!(
                    "category {} is locked in phase {}",
                    held.category, schedule.phase
                ),
                WithholdReason::PrerequisiteWithheld { dependency } => {
                    format!("waiting on {dependency}")
                }
                WithholdReason::PrerequisitePending { dependency } => {
                    format!("waiting on confirmation of {dependency}")
                }
            };
            let unchanged = ledger.get(&held.contract).is_some_and(|e| {
                e.outcome == Outcome::Withheld && e.detail.as_deref() == Some(detail.as_str())
            });
            if unchanged {
                continue;
            }
            if publish {
                self.feed
                    .publish(
                        DeploymentEvent::new(held.contract.as_str(), held.category, EventStatus::Withheld)
                            .with_detail(detail.clone()),
                    )
                    .await;
            }
            debug!("Withholding {}: {detail}", held.contract);
            ledger.insert(
                held.contract.clone(),
                entry(&held.contract, held.category, Outcome::Withheld, None, Some(detail)),
            );
        }
    }

    async fn report(&self, mut ledger: Ledger, passes: Vec<Schedule>, dry_run: bool) -> DeploymentReport {
        let phase = self.funding.lock().await.phase();
        let registry = self.registry.read().await;
        let skipped_this_run: BTreeMap<&str, SkipReason> = passes
            .iter()
            .flat_map(|s| s.skipped.iter())
            .map(|s| (s.contract.as_str(), s.reason))
            .collect();

        let entries = registry
            .iter()
            .map(|c| {
                ledger.remove(&c.name).unwrap_or_else(|| {
                    let tx = c.last_tx_id.as_deref();
                    if !c.category.is_deployable() {
                        return entry(&c.name, c.category, Outcome::Skipped, None, Some("uncategorized".into()));
                    }
                    match c.status {
                        ContractStatus::Confirmed => entry(
                            &c.name,
                            c.category,
                            Outcome::Skipped,
                            tx,
                            Some("already confirmed".into()),
                        ),
                        ContractStatus::Pending => {
                            entry(&c.name, c.category, Outcome::Unconfirmed, tx, None)
                        }
                        _ => {
                            let detail = match skipped_this_run.get(c.name.as_str()) {
                                Some(SkipReason::SettledThisRun) => "settled earlier in this run",
                                _ if dry_run => "scheduled",
                                _ => "not attempted",
                            };
                            entry(&c.name, c.category, Outcome::Skipped, tx, Some(detail.into()))
                        }
                    }
                })
            })
            .collect();

        DeploymentReport {
            phase,
            dry_run,
            passes,
            entries,
            verification: None,
        }
    }

    async fn export_manifest(&self, path: &Path) -> Result<()> {
        let rows = db::load_manifest(&self.pool).await?;
        tokio::fs::write(path, serde_json::to_string_pretty(&rows)?).await?;
        info!("Deployment manifest exported to {}", path.display());
        Ok(())
    }

    // ─── Funding ───────────────────────────────────────────

    /// Count a contribution once its transaction is confirmed on chain.  The
    /// new funding state is persisted before it is applied in memory, so a
    /// failed write leaves both untouched.
    pub async fn record_contribution(
        &self,
        mut contribution: Contribution,
    ) -> Result<ContributionOutcome> {
        if !contribution.tx_id.trim().is_empty() {
            contribution.tx_id = normalize_tx_id(&contribution.tx_id);
        }
        self.funding.lock().await.validate(&contribution)?;

        match self
            .chain
            .get_transaction_status(&contribution.tx_id)
            .await?
        {
            TxStatus::Confirmed => {}
            TxStatus::Pending => {
                return Err(DeployerError::FundingValidation(format!(
                    "contribution {} is not confirmed yet",
                    contribution.tx_id
                )))
            }
            TxStatus::Rejected { reason } => {
                return Err(DeployerError::FundingValidation(format!(
                    "contribution {} failed on chain: {reason}",
                    contribution.tx_id
                )))
            }
        }

        let mut controller = self.funding.lock().await;
        let next = controller.preview(&contribution)?;
        db::save_contribution(&self.pool, &contribution, &next).await?;
        let outcome = controller.apply(&contribution)?;
        for phase in &outcome.advanced_to {
            info!("Phase {phase} unlocked: {:?}", phase.unlocks());
        }
        Ok(outcome)
    }
}

fn entry(
    contract: &str,
    category: Category,
    outcome: Outcome,
    tx_id: Option<&str>,
    detail: Option<String>,
) -> ReportEntry {
    ReportEntry {
        contract: contract.to_string(),
        category,
        outcome,
        tx_id: tx_id.map(str::to_string),
        detail,
    }
}

/// Apply the persisted manifest to a freshly discovered registry, then adopt
/// any broadcast the manifest never recorded so it is reconciled rather than
/// sent again.
async fn restore_statuses(pool: &SqlitePool, registry: &mut Registry) -> Result<()> {
    let mut restored = 0usize;
    for row in db::load_manifest(pool).await? {
        let Some(status) = row.contract_status() else {
            warn!("Ignoring manifest row {} with status '{}'", row.name, row.status);
            continue;
        };
        if !registry.contains(&row.name) {
            debug!("Manifest row {} has no contract in the registry", row.name);
            continue;
        }
        registry.restore(&row.name, status, row.tx_id);
        restored += 1;
    }

    let mut latest: BTreeMap<String, TransactionRecord> = BTreeMap::new();
    for record in db::all_transactions(pool).await? {
        latest.insert(record.contract.clone(), record);
    }
    for (name, record) in latest {
        let adopt = record.terminal_status.is_none()
            && registry.get(&name).is_some_and(|c| {
                matches!(c.status, ContractStatus::Undeployed | ContractStatus::Failed)
            });
        if adopt {
            warn!(
                "{name} has an unsettled broadcast {} missing from the manifest; treating as pending",
                record.tx_id
            );
            registry.restore(&name, ContractStatus::Pending, Some(record.tx_id));
        }
    }

    if restored > 0 {
        info!("Restored {restored} contract statuses from the deployment manifest");
    }
    Ok(())
}
