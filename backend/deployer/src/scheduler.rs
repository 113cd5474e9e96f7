//! Batch scheduling.
//!
//! A pass walks the deployment plan once.  Each contract is either skipped
//! (already confirmed, still pending, or settled earlier in this run),
//! withheld (category locked, or a prerequisite is not deployable yet), or
//! placed into a batch.  Batches are contiguous runs of the eligible order:
//! a new batch starts when the current one is full or when the next contract
//! depends, directly or transitively, on something already in it.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::contract::{Category, ContractStatus};
use crate::errors::Result;
use crate::funding::Phase;
use crate::registry::Registry;
use crate::resolver::{ancestors, DeploymentPlan};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WithholdReason {
    /// The current phase has not unlocked the category.
    CategoryLocked,
    /// A dependency is withheld or otherwise not deployable in this pass.
    PrerequisiteWithheld { dependency: String },
    /// A dependency was broadcast but its confirmation has not been seen.
    PrerequisitePending { dependency: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Withheld {
    pub contract: String,
    pub category: Category,
    pub reason: WithholdReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyConfirmed,
    AwaitingConfirmation,
    /// Failed or blocked earlier in the same run.
    SettledThisRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub contract: String,
    pub reason: SkipReason,
}

/// Output of one scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub fingerprint: String,
    pub phase: Phase,
    pub batch_size: usize,
    pub batches: Vec<Vec<String>>,
    pub withheld: Vec<Withheld>,
    pub skipped: Vec<Skipped>,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn scheduled(&self) -> impl Iterator<Item = &String> {
        self.batches.iter().flatten()
    }

    /// Stable JSON rendering.  Field order follows the struct definitions and
    /// every collection is already ordered, so equal schedules render equal.
    pub fn to_canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Partition `plan` into batches of at most `batch_size` for `phase`.
///
/// `settled` names contracts that reached a final outcome earlier in the
/// current run and must not be attempted again until the next run.
pub fn plan_batches(
    registry: &Registry,
    plan: &DeploymentPlan,
    phase: Phase,
    batch_size: usize,
    settled: &BTreeSet<String>,
) -> Schedule {
    let batch_size = batch_size.max(1);
    let unlocked = phase.unlocked();

    let mut withheld = Vec::new();
    let mut skipped = Vec::new();
    // Contracts this pass cannot rely on, mapped to why.
    let mut unavailable: BTreeMap<&str, bool> = BTreeMap::new();
    let mut eligible: Vec<&str> = Vec::new();

    for name in &plan.order {
        let Some(contract) = registry.get(name) else {
            continue;
        };

        match contract.status {
            ContractStatus::Confirmed => {
                skipped.push(Skipped {
                    contract: name.clone(),
                    reason: SkipReason::AlreadyConfirmed,
                });
                continue;
            }
            ContractStatus::Pending => {
                skipped.push(Skipped {
                    contract: name.clone(),
                    reason: SkipReason::AwaitingConfirmation,
                });
                // `true` marks an in-flight prerequisite.
                unavailable.insert(name.as_str(), true);
                continue;
            }
            ContractStatus::Undeployed | ContractStatus::Failed => {}
        }

        if settled.contains(name) {
            skipped.push(Skipped {
                contract: name.clone(),
                reason: SkipReason::SettledThisRun,
            });
            unavailable.insert(name.as_str(), false);
            continue;
        }

        let reason = if !unlocked.contains(&contract.category) {
            Some(WithholdReason::CategoryLocked)
        } else {
            contract.depends_on.iter().find_map(|dep| {
                unavailable.get(dep.as_str()).map(|pending| {
                    if *pending {
                        WithholdReason::PrerequisitePending {
                            dependency: dep.clone(),
                        }
                    } else {
                        WithholdReason::PrerequisiteWithheld {
                            dependency: dep.clone(),
                        }
                    }
                })
            })
        };

        match reason {
            Some(reason) => {
                withheld.push(Withheld {
                    contract: name.clone(),
                    category: contract.category,
                    reason,
                });
                unavailable.insert(name.as_str(), false);
            }
            None => eligible.push(name.as_str()),
        }
    }

    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for name in eligible {
        let needs = ancestors(registry, name);
        let related = current.iter().any(|member| needs.contains(member));
        if current.len() == batch_size || related {
            batches.push(std::mem::take(&mut current));
        }
        current.push(name.to_string());
    }
    if !current.is_empty() {
        batches.push(current);
    }

    Schedule {
        fingerprint: plan.fingerprint.clone(),
        phase,
        batch_size,
        batches,
        withheld,
        skipped,
    }
}
