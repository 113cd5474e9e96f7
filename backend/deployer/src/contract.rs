//! Core domain types: contracts, categories, statuses, and transaction records.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Classification label used for grouping and for phase-gated eligibility.
///
/// Variant order is the deployment priority used to break ties between
/// contracts with no ordering constraint between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Base,
    Core,
    Token,
    Dex,
    Dimensional,
    Oracle,
    Governance,
    Security,
    Chainhooks,
    Enterprise,
    /// No rule matched. Visible in the registry but never planned.
    Uncategorized,
}

impl Category {
    pub const DEPLOYABLE: [Category; 10] = [
        Self::Base,
        Self::Core,
        Self::Token,
        Self::Dex,
        Self::Dimensional,
        Self::Oracle,
        Self::Governance,
        Self::Security,
        Self::Chainhooks,
        Self::Enterprise,
    ];

    /// Parse a manifest label. Accepts the plural spellings used by older manifests.
    pub fn from_label(label: &str) -> Option<Self> {
        let category = match label.trim().to_ascii_lowercase().as_str() {
            "base" | "traits" | "utils" => Self::Base,
            "core" => Self::Core,
            "token" | "tokens" => Self::Token,
            "dex" | "defi" => Self::Dex,
            "dimensional" => Self::Dimensional,
            "oracle" | "oracles" => Self::Oracle,
            "governance" | "dao" => Self::Governance,
            "security" => Self::Security,
            "chainhooks" | "automation" => Self::Chainhooks,
            "enterprise" => Self::Enterprise,
            "uncategorized" => Self::Uncategorized,
            _ => return None,
        };
        Some(category)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Core => "core",
            Self::Token => "token",
            Self::Dex => "dex",
            Self::Dimensional => "dimensional",
            Self::Oracle => "oracle",
            Self::Governance => "governance",
            Self::Security => "security",
            Self::Chainhooks => "chainhooks",
            Self::Enterprise => "enterprise",
            Self::Uncategorized => "uncategorized",
        }
    }

    pub fn is_deployable(&self) -> bool {
        !matches!(self, Self::Uncategorized)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment status of a single contract.
///
/// Allowed transitions: `Undeployed -> Pending -> {Confirmed, Failed}` and
/// `Failed -> Pending` for a retry with a brand-new transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Undeployed,
    Pending,
    Confirmed,
    Failed,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undeployed => "undeployed",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "undeployed" => Some(Self::Undeployed),
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: ContractStatus) -> bool {
        use ContractStatus::*;
        matches!(
            (self, next),
            (Undeployed, Pending) | (Pending, Confirmed) | (Pending, Failed) | (Failed, Pending)
        )
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployable contract artifact as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub name: String,
    pub category: Category,
    /// Declared dependency names, in manifest order.
    pub depends_on: Vec<String>,
    pub source: PathBuf,
    pub status: ContractStatus,
    pub last_tx_id: Option<String>,
}

impl Contract {
    pub fn new(name: impl Into<String>, category: Category, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            category,
            depends_on: Vec::new(),
            source: source.into(),
            status: ContractStatus::Undeployed,
            last_tx_id: None,
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Final state of a broadcast transaction as observed by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Confirmed,
    Rejected,
    TimedOut,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// One broadcast deployment transaction. The log of these is append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub contract: String,
    pub tx_id: String,
    pub nonce: u64,
    /// Unix seconds.
    pub submitted_at: i64,
    pub terminal_status: Option<TerminalStatus>,
}
