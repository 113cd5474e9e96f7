//! Funding-curve phase controller.
//!
//! Cumulative funding only grows, and the current phase only moves forward.
//! A contribution is validated in full before it touches any state, so a
//! rejected contribution leaves the controller exactly as it was.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::contract::Category;
use crate::errors::{DeployerError, Result};

/// Micro-STX per STX.
pub const USTX_PER_STX: u64 = 1_000_000;

// ─────────────────────────────────────────────────────────
// Phases
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Bootstrap,
    Core,
    Liquidity,
    Governance,
    Autonomous,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Self::Bootstrap,
        Self::Core,
        Self::Liquidity,
        Self::Governance,
        Self::Autonomous,
    ];

    pub fn next(self) -> Option<Phase> {
        match self {
            Self::Bootstrap => Some(Self::Core),
            Self::Core => Some(Self::Liquidity),
            Self::Liquidity => Some(Self::Governance),
            Self::Governance => Some(Self::Autonomous),
            Self::Autonomous => None,
        }
    }

    /// Categories that become deployable when this phase is reached.
    pub fn unlocks(self) -> &'static [Category] {
        match self {
            Self::Bootstrap => &[Category::Base],
            Self::Core => &[Category::Core, Category::Token],
            Self::Liquidity => &[Category::Dex, Category::Dimensional, Category::Oracle],
            Self::Governance => &[Category::Governance, Category::Security],
            Self::Autonomous => &[Category::Chainhooks, Category::Enterprise],
        }
    }

    /// Every category deployable once this phase has been reached.
    pub fn unlocked(self) -> BTreeSet<Category> {
        Self::ALL
            .into_iter()
            .filter(|p| *p <= self)
            .flat_map(|p| p.unlocks().iter().copied())
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Core => "core",
            Self::Liquidity => "liquidity",
            Self::Governance => "governance",
            Self::Autonomous => "autonomous",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative funding (micro-STX) needed to leave each gated phase.
/// `Autonomous` is terminal and has no threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSchedule {
    thresholds: [u64; 4],
}

impl Default for PhaseSchedule {
    fn default() -> Self {
        Self {
            thresholds: [
                10_000 * USTX_PER_STX,
                25_000 * USTX_PER_STX,
                50_000 * USTX_PER_STX,
                100_000 * USTX_PER_STX,
            ],
        }
    }
}

impl PhaseSchedule {
    /// Thresholds must be strictly increasing and non-zero.
    pub fn new(thresholds: [u64; 4]) -> Result<Self> {
        if thresholds[0] == 0 || thresholds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DeployerError::Config(format!(
                "phase thresholds must be non-zero and strictly increasing: {thresholds:?}"
            )));
        }
        Ok(Self { thresholds })
    }

    pub fn threshold(&self, phase: Phase) -> Option<u64> {
        match phase {
            Phase::Bootstrap => Some(self.thresholds[0]),
            Phase::Core => Some(self.thresholds[1]),
            Phase::Liquidity => Some(self.thresholds[2]),
            Phase::Governance => Some(self.thresholds[3]),
            Phase::Autonomous => None,
        }
    }

    /// The last gated threshold; reaching it means every phase is unlocked.
    pub fn final_threshold(&self) -> u64 {
        self.thresholds[3]
    }
}

// ─────────────────────────────────────────────────────────
// Price curve
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveParams {
    /// Unit price at zero funding, in micro-STX.
    pub base_price: u64,
    /// Funding at which the price reaches the cap.
    pub target: u64,
    /// Upper bound as a multiple of `base_price`.
    pub multiplier_cap: f64,
}

impl CurveParams {
    pub fn new(base_price: u64, target: u64) -> Self {
        Self {
            base_price,
            target,
            multiplier_cap: 1.5,
        }
    }

    /// `base * (1 + (cap - 1) * min(1, cumulative / target))`.
    pub fn price_at(&self, cumulative: u64) -> f64 {
        curve_price(self.base_price, cumulative, self.target, self.multiplier_cap)
    }
}

/// Linear curve from `base` at zero funding up to `cap * base` at `threshold`,
/// flat beyond.  A zero threshold is treated as already reached.
pub fn curve_price(base: u64, cumulative: u64, threshold: u64, cap: f64) -> f64 {
    let progress = if threshold == 0 {
        1.0
    } else {
        (cumulative as f64 / threshold as f64).min(1.0)
    };
    base as f64 * (1.0 + (cap - 1.0) * progress)
}

// ─────────────────────────────────────────────────────────
// Contributions & state
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub tx_id: String,
    pub contributor: Option<String>,
    /// Micro-STX.
    pub amount: u64,
    /// Unix seconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingState {
    pub cumulative: u64,
    pub phase: Phase,
    pub curve: CurveParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributionOutcome {
    pub cumulative: u64,
    pub phase: Phase,
    /// Phases entered because of this contribution, in order.
    pub advanced_to: Vec<Phase>,
    pub price: f64,
}

/// Read-only view of the controller for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundingSnapshot {
    pub cumulative: u64,
    pub phase: Phase,
    pub price: f64,
    pub phase_progress: f64,
    /// Cumulative funding needed to leave the current phase.
    pub next_threshold: Option<u64>,
    pub unlocked: Vec<Category>,
}

/// Sole owner and writer of [`FundingState`].
#[derive(Debug)]
pub struct PhaseController {
    state: FundingState,
    schedule: PhaseSchedule,
    seen: HashSet<String>,
    phase_tx: watch::Sender<Phase>,
}

impl PhaseController {
    pub fn new(schedule: PhaseSchedule, curve: CurveParams) -> Self {
        let state = FundingState {
            cumulative: 0,
            phase: Phase::Bootstrap,
            curve,
        };
        Self::restore(schedule, state, std::iter::empty())
    }

    /// Rebuild from persisted state.  The stored phase is kept even if the
    /// schedule has since been raised; phases never move backwards.
    pub fn restore(
        schedule: PhaseSchedule,
        state: FundingState,
        seen_tx_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(state.phase);
        let mut controller = Self {
            state,
            schedule,
            seen: seen_tx_ids.into_iter().collect(),
            phase_tx,
        };
        controller.advance();
        controller
    }

    pub fn state(&self) -> &FundingState {
        &self.state
    }

    pub fn schedule(&self) -> &PhaseSchedule {
        &self.schedule
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn cumulative(&self) -> u64 {
        self.state.cumulative
    }

    pub fn current_price(&self) -> f64 {
        self.state.curve.price_at(self.state.cumulative)
    }

    /// Progress toward leaving the current phase, in `[0, 1]`.
    pub fn phase_progress(&self) -> f64 {
        match self.schedule.threshold(self.state.phase) {
            Some(threshold) => (self.state.cumulative as f64 / threshold as f64).min(1.0),
            None => 1.0,
        }
    }

    pub fn snapshot(&self) -> FundingSnapshot {
        FundingSnapshot {
            cumulative: self.state.cumulative,
            phase: self.state.phase,
            price: self.current_price(),
            phase_progress: self.phase_progress(),
            next_threshold: self.schedule.threshold(self.state.phase),
            unlocked: self.unlocked_categories().into_iter().collect(),
        }
    }

    pub fn has_seen(&self, tx_id: &str) -> bool {
        self.seen.contains(tx_id)
    }

    pub fn unlocked_categories(&self) -> BTreeSet<Category> {
        self.state.phase.unlocked()
    }

    /// Subscribe to phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Check a contribution without applying it.
    pub fn validate(&self, contribution: &Contribution) -> Result<()> {
        if contribution.tx_id.trim().is_empty() {
            return Err(DeployerError::FundingValidation(
                "contribution has no transaction id".to_string(),
            ));
        }
        if contribution.amount == 0 {
            return Err(DeployerError::FundingValidation(format!(
                "contribution {} has zero amount",
                contribution.tx_id
            )));
        }
        if self.has_seen(&contribution.tx_id) {
            return Err(DeployerError::FundingValidation(format!(
                "duplicate contribution {}",
                contribution.tx_id
            )));
        }
        if self
            .state
            .cumulative
            .checked_add(contribution.amount)
            .is_none()
        {
            return Err(DeployerError::FundingValidation(format!(
                "contribution {} overflows cumulative funding",
                contribution.tx_id
            )));
        }
        Ok(())
    }

    /// The state `contribution` would produce, without applying it.  Lets the
    /// caller persist the new state before committing it in memory.
    pub fn preview(&self, contribution: &Contribution) -> Result<FundingState> {
        self.validate(contribution)?;
        let cumulative = self.state.cumulative + contribution.amount;
        let phase = self
            .phases_entered(self.state.phase, cumulative)
            .last()
            .copied()
            .unwrap_or(self.state.phase);
        Ok(FundingState {
            cumulative,
            phase,
            curve: self.state.curve.clone(),
        })
    }

    /// Validate and count a contribution, advancing phases as thresholds are met.
    pub fn apply(&mut self, contribution: &Contribution) -> Result<ContributionOutcome> {
        self.validate(contribution)?;

        self.seen.insert(contribution.tx_id.clone());
        self.state.cumulative += contribution.amount;
        let advanced_to = self.advance();

        info!(
            "Contribution {} of {} uSTX counted (cumulative={}, phase={})",
            contribution.tx_id, contribution.amount, self.state.cumulative, self.state.phase
        );

        Ok(ContributionOutcome {
            cumulative: self.state.cumulative,
            phase: self.state.phase,
            advanced_to,
            price: self.current_price(),
        })
    }

    fn phases_entered(&self, from: Phase, cumulative: u64) -> Vec<Phase> {
        let mut phase = from;
        let mut entered = Vec::new();
        while let (Some(threshold), Some(next)) = (self.schedule.threshold(phase), phase.next()) {
            if cumulative < threshold {
                break;
            }
            phase = next;
            entered.push(next);
        }
        entered
    }

    fn advance(&mut self) -> Vec<Phase> {
        let entered = self.phases_entered(self.state.phase, self.state.cumulative);
        for next in &entered {
            info!(
                "Phase advanced {} -> {next} at {} uSTX",
                self.state.phase, self.state.cumulative
            );
            self.state.phase = *next;
        }
        if !entered.is_empty() {
            self.phase_tx.send_replace(self.state.phase);
        }
        entered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PhaseController {
        let schedule = PhaseSchedule::default();
        let curve = CurveParams::new(1_000, schedule.final_threshold());
        PhaseController::new(schedule, curve)
    }

    fn contribution(tx: &str, stx: u64) -> Contribution {
        Contribution {
            tx_id: tx.to_string(),
            contributor: Some("SP2J6ZY48GV1EZ5V2V5RB9MP66SW86PYKKNRV9EJ7".to_string()),
            amount: stx * USTX_PER_STX,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn threshold_contribution_advances_exactly_once() {
        let mut c = controller();
        let mut rx = c.subscribe();
        let outcome = c.apply(&contribution("0x01", 10_000)).unwrap();
        assert_eq!(outcome.phase, Phase::Core);
        assert_eq!(outcome.advanced_to, vec![Phase::Core]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Phase::Core);

        let err = c.apply(&contribution("0x01", 10_000)).unwrap_err();
        assert!(matches!(err, DeployerError::FundingValidation(_)));
        assert_eq!(c.phase(), Phase::Core);
        assert_eq!(c.cumulative(), 10_000 * USTX_PER_STX);

        let outcome = c.apply(&contribution("0x02", 10_000)).unwrap();
        assert_eq!(outcome.phase, Phase::Core);
        assert!(outcome.advanced_to.is_empty());
    }

    #[test]
    fn snapshot_reports_progress_toward_next_phase() {
        let mut c = controller();
        c.apply(&contribution("0x01", 5_000)).unwrap();
        let snap = c.snapshot();
        assert_eq!(snap.phase, Phase::Bootstrap);
        assert_eq!(snap.phase_progress, 0.5);
        assert_eq!(snap.next_threshold, Some(10_000 * USTX_PER_STX));
        assert_eq!(snap.unlocked, vec![Category::Base]);
        assert!((snap.price - 1_025.0).abs() < 1e-9);
    }

    #[test]
    fn preview_matches_apply_without_mutating() {
        let mut c = controller();
        let preview = c.preview(&contribution("0x01", 30_000)).unwrap();
        assert_eq!(preview.phase, Phase::Liquidity);
        assert_eq!(c.phase(), Phase::Bootstrap);
        assert_eq!(c.cumulative(), 0);
        let outcome = c.apply(&contribution("0x01", 30_000)).unwrap();
        assert_eq!(outcome.phase, preview.phase);
        assert_eq!(outcome.cumulative, preview.cumulative);
        assert!(c.preview(&contribution("0x01", 1)).is_err());
    }

    #[test]
    fn large_contribution_crosses_several_phases() {
        let mut c = controller();
        let outcome = c.apply(&contribution("0xbig", 60_000)).unwrap();
        assert_eq!(outcome.advanced_to, vec![Phase::Core, Phase::Liquidity, Phase::Governance]);
        assert_eq!(c.phase(), Phase::Governance);
        c.apply(&contribution("0xmore", 1_000_000)).unwrap();
        assert_eq!(c.phase(), Phase::Autonomous);
        c.apply(&contribution("0xagain", 1)).unwrap();
        assert_eq!(c.phase(), Phase::Autonomous);
    }

    #[test]
    fn invalid_contributions_do_not_mutate_state() {
        let mut c = controller();
        assert!(c.apply(&contribution("0x00", 0)).is_err());
        assert!(c.apply(&contribution("  ", 5)).is_err());
        assert_eq!(c.cumulative(), 0);
        assert!(!c.has_seen("0x00"));

        c.apply(&contribution("0x01", 1)).unwrap();
        let overflow = Contribution {
            amount: u64::MAX,
            ..contribution("0x02", 0)
        };
        assert!(c.apply(&overflow).is_err());
        assert_eq!(c.cumulative(), USTX_PER_STX);
    }

    #[test]
    fn eligibility_is_cumulative_over_phases() {
        let mut c = controller();
        assert!(c.unlocked_categories().contains(&Category::Base));
        assert!(!c.unlocked_categories().contains(&Category::Core));
        assert!(!c.unlocked_categories().contains(&Category::Uncategorized));
        c.apply(&contribution("0x01", 25_000)).unwrap();
        assert_eq!(c.phase(), Phase::Liquidity);
        assert!(c.unlocked_categories().contains(&Category::Base));
        assert!(c.unlocked_categories().contains(&Category::Token));
        assert!(c.unlocked_categories().contains(&Category::Dex));
        assert!(!c.unlocked_categories().contains(&Category::Governance));
        assert_eq!(c.unlocked_categories().len(), 6);
    }

    #[test]
    fn price_is_monotonic_and_bounded() {
        let base = 1_000u64;
        let curve = CurveParams::new(base, 100_000 * USTX_PER_STX);
        let mut last = 0.0;
        for step in 0..=300u64 {
            let price = curve.price_at(step * 500 * USTX_PER_STX);
            assert!(price >= last, "price decreased at step {step}");
            assert!(price >= base as f64 && price <= 1.5 * base as f64);
            last = price;
        }
        assert_eq!(curve.price_at(0), 1_000.0);
        assert_eq!(curve.price_at(50_000 * USTX_PER_STX), 1_250.0);
        assert_eq!(curve.price_at(u64::MAX), 1_500.0);
    }

    #[test]
    fn curve_formula_against_threshold() {
        assert_eq!(curve_price(100, 0, 10_000, 1.5), 100.0);
        assert_eq!(curve_price(100, 5_000, 10_000, 1.5), 125.0);
        assert_eq!(curve_price(100, 20_000, 10_000, 1.5), 150.0);
        assert_eq!(curve_price(100, 0, 0, 1.5), 150.0);
    }

    #[test]
    fn restore_never_moves_backwards() {
        let schedule = PhaseSchedule::default();
        let state = FundingState {
            cumulative: 0,
            phase: Phase::Governance,
            curve: CurveParams::new(1_000, schedule.final_threshold()),
        };
        let c = PhaseController::restore(schedule, state, vec!["0xold".to_string()]);
        assert_eq!(c.phase(), Phase::Governance);
        assert!(c.has_seen("0xold"));
    }

    #[test]
    fn schedule_must_increase() {
        assert!(PhaseSchedule::new([1, 2, 3, 4]).is_ok());
        assert!(PhaseSchedule::new([0, 2, 3, 4]).is_err());
        assert!(PhaseSchedule::new([5, 5, 6, 7]).is_err());
    }

    #[test]
    fn phase_labels_round_trip() {
        for p in Phase::ALL {
            assert_eq!(Phase::parse(p.as_str()), Some(p));
        }
        assert_eq!(Phase::Autonomous.next(), None);
    }
}
