//! Contract discovery.
//!
//! Contracts come from two sources, merged by name:
//!
//! * an explicit TOML manifest (`Clarinet.toml` layout, `[contracts.<name>]`
//!   tables with `path`, optional `category` and `depends_on`), and
//! * a scan of a contracts directory for `*.clar` files not named by the
//!   manifest.  Scanned contracts get their category from [`CategoryRules`]
//!   and their dependencies from `.contract` references in the source.
//!
//! Explicit entries always win.  A contract no rule matches is kept as
//! [`Category::Uncategorized`] so it stays visible, but it is never planned.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::contract::{Category, Contract, ContractStatus};
use crate::errors::{DeployerError, Result};

// ─────────────────────────────────────────────────────────
// Category rules
// ─────────────────────────────────────────────────────────

/// Ordered `(pattern, category)` table.  The first pattern contained in the
/// lower-cased contract name wins.
#[derive(Debug, Clone)]
pub struct CategoryRules {
    rules: Vec<(String, Category)>,
}

impl Default for CategoryRules {
    fn default() -> Self {
        let table: &[(&[&str], Category)] = &[
            (
                &["trait", "utils", "lib-", "math", "constants", "error-codes", "encoding"],
                Category::Base,
            ),
            (
                &["dim-", "dimensional", "position-nft", "concentrated-liquidity"],
                Category::Dimensional,
            ),
            (
                &["circuit-breaker", "pausable", "access-control", "rate-limiter", "mev-protector"],
                Category::Security,
            ),
            (
                &["chainhook", "batch-processor", "keeper", "automation", "predictive-scaling"],
                Category::Chainhooks,
            ),
            (
                &["enterprise", "compliance", "budget-manager", "loan-manager", "lending"],
                Category::Enterprise,
            ),
            (
                &["oracle", "btc-adapter", "price-feed", "aggregator"],
                Category::Oracle,
            ),
            (
                &["governance", "proposal", "timelock", "upgrade-controller", "dao", "voting"],
                Category::Governance,
            ),
            (&["token", "nft", "emission", "-ft"], Category::Token),
            (
                &["dex", "swap", "pool", "router", "factory", "vault", "liquidity", "fee-manager"],
                Category::Dex,
            ),
            (
                &["core", "registry", "coordinator", "initializer", "manager"],
                Category::Core,
            ),
        ];

        let rules = table
            .iter()
            .flat_map(|(patterns, category)| patterns.iter().map(|p| (p.to_string(), *category)))
            .collect();
        Self { rules }
    }
}

impl CategoryRules {
    pub fn categorize(&self, name: &str) -> Category {
        let lower = name.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|(pattern, _)| lower.contains(pattern.as_str()))
            .map(|(_, category)| *category)
            .unwrap_or(Category::Uncategorized)
    }
}

// ─────────────────────────────────────────────────────────
// Manifest shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    contracts: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    path: PathBuf,
    category: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

// ─────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────

/// The in-memory contract set for one deployment run.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    contracts: BTreeMap<String, Contract>,
}

impl Registry {
    /// Build a registry from already-constructed contracts.  Duplicate names
    /// are a validation error.
    pub fn from_contracts(contracts: impl IntoIterator<Item = Contract>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for contract in contracts {
            let name = contract.name.clone();
            if map.insert(name.clone(), contract).is_some() {
                return Err(DeployerError::Validation(format!(
                    "duplicate contract name: {name}"
                )));
            }
        }
        Ok(Self { contracts: map })
    }

    /// Discover contracts from an explicit manifest and/or a directory scan.
    ///
    /// A missing manifest file is not an error as long as the scan finds
    /// something; finding nothing at all is.
    pub fn discover(
        manifest: Option<&Path>,
        contracts_dir: Option<&Path>,
        rules: &CategoryRules,
    ) -> Result<Self> {
        let mut contracts = BTreeMap::new();

        if let Some(path) = manifest.filter(|p| p.exists()) {
            for contract in parse_manifest(path, rules)? {
                contracts.insert(contract.name.clone(), contract);
            }
            info!("Loaded {} contracts from {}", contracts.len(), path.display());
        }

        if let Some(dir) = contracts_dir.filter(|d| d.is_dir()) {
            let scanned = scan_directory(dir, rules, &contracts)?;
            info!("Scan of {} found {} additional contracts", dir.display(), scanned.len());
            for contract in scanned {
                contracts.insert(contract.name.clone(), contract);
            }
        }

        if contracts.is_empty() {
            return Err(DeployerError::Validation(
                "no contracts found in manifest or contracts directory".to_string(),
            ));
        }

        let registry = Self { contracts };
        for contract in registry.uncategorized() {
            warn!(
                "Contract {} matched no category rule; excluded from the plan",
                contract.name
            );
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Contract> {
        self.contracts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contracts.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// All contracts in name order, including uncategorized ones.
    pub fn iter(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values()
    }

    pub fn deployable(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values().filter(|c| c.category.is_deployable())
    }

    pub fn uncategorized(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values().filter(|c| !c.category.is_deployable())
    }

    /// Apply a status transition, rejecting ones the lifecycle does not allow.
    /// Setting the current status again is a no-op.
    pub fn set_status(
        &mut self,
        name: &str,
        status: ContractStatus,
        tx_id: Option<&str>,
    ) -> Result<()> {
        let contract = self
            .contracts
            .get_mut(name)
            .ok_or_else(|| DeployerError::Validation(format!("unknown contract: {name}")))?;

        if contract.status != status && !contract.status.can_transition_to(status) {
            return Err(DeployerError::Validation(format!(
                "illegal status transition for {name}: {} -> {status}",
                contract.status
            )));
        }
        contract.status = status;
        if let Some(tx) = tx_id {
            contract.last_tx_id = Some(tx.to_string());
        }
        Ok(())
    }

    /// Restore persisted state without lifecycle checks.  Used only when
    /// loading the deployment manifest at startup.
    pub fn restore(&mut self, name: &str, status: ContractStatus, tx_id: Option<String>) {
        if let Some(contract) = self.contracts.get_mut(name) {
            contract.status = status;
            contract.last_tx_id = tx_id;
        }
    }

    /// SHA-256 over every field that influences planning, hex-encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for contract in self.contracts.values() {
            hasher.update(contract.name.as_bytes());
            hasher.update([0]);
            hasher.update(contract.category.as_str().as_bytes());
            hasher.update([0]);
            for dep in &contract.depends_on {
                hasher.update(dep.as_bytes());
                hasher.update([1]);
            }
            hasher.update(contract.source.to_string_lossy().as_bytes());
            hasher.update([0xff]);
        }
        hex::encode(hasher.finalize())
    }
}

// ─────────────────────────────────────────────────────────
// Discovery helpers
// ─────────────────────────────────────────────────────────

fn parse_manifest(path: &Path, rules: &CategoryRules) -> Result<Vec<Contract>> {
    let raw = fs::read_to_string(path)?;
    let file: ManifestFile = toml::from_str(&raw)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    file.contracts
        .into_iter()
        .map(|(name, entry)| {
            let category = match entry.category.as_deref() {
                Some(label) => Category::from_label(label).ok_or_else(|| {
                    DeployerError::Validation(format!(
                        "contract {name}: unknown category '{label}'"
                    ))
                })?,
                None => rules.categorize(&name),
            };
            let source = if entry.path.is_absolute() {
                entry.path
            } else {
                base.join(entry.path)
            };
            Ok(Contract::new(name, category, source).with_deps(entry.depends_on))
        })
        .collect()
}

fn scan_directory(
    dir: &Path,
    rules: &CategoryRules,
    explicit: &BTreeMap<String, Contract>,
) -> Result<Vec<Contract>> {
    let mut files = Vec::new();
    collect_clar_files(dir, &mut files)?;
    files.sort();

    let mut found: BTreeMap<String, (PathBuf, String)> = BTreeMap::new();
    for path in files {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        if explicit.contains_key(&name) {
            continue;
        }
        if found.contains_key(&name) {
            warn!("Duplicate contract file {} ignored", path.display());
            continue;
        }
        let source = fs::read_to_string(&path)?;
        found.insert(name, (path, source));
    }

    let known: BTreeSet<&str> = explicit
        .keys()
        .map(String::as_str)
        .chain(found.keys().map(String::as_str))
        .collect();

    let contracts = found
        .iter()
        .map(|(name, (path, source))| {
            let deps = infer_dependencies(name, source, &known);
            debug!("Scanned {name}: deps={deps:?}");
            Contract::new(name.clone(), rules.categorize(name), path.clone()).with_deps(deps)
        })
        .collect();
    Ok(contracts)
}

fn collect_clar_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_clar_files(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("clar") {
            out.push(path);
        }
    }
    Ok(())
}

static CONTRACT_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:contract-call\?|use-trait\s+[\w-]+|impl-trait)\s+'?(?:[A-Z0-9]+)?\.([a-zA-Z][\w-]*)",
    )
    .expect("valid regex")
});

/// Names of other known contracts referenced by `contract-call?`,
/// `use-trait`, or `impl-trait`, in order of first appearance.
pub fn infer_dependencies(name: &str, source: &str, known: &BTreeSet<&str>) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    for cap in CONTRACT_REFERENCE.captures_iter(source) {
        let dep = &cap[1];
        if dep != name && known.contains(dep) && !deps.iter().any(|d| d == dep) {
            deps.push(dep.to_string());
        }
    }
    deps
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_are_ordered() {
        let rules = CategoryRules::default();
        assert_eq!(rules.categorize("all-traits"), Category::Base);
        assert_eq!(rules.categorize("cxd-token"), Category::Token);
        assert_eq!(rules.categorize("governance-token"), Category::Governance);
        assert_eq!(rules.categorize("dex-factory-v2"), Category::Dex);
        assert_eq!(rules.categorize("dim-registry"), Category::Dimensional);
        assert_eq!(rules.categorize("position-nft"), Category::Dimensional);
        assert_eq!(rules.categorize("oracle-aggregator"), Category::Oracle);
        assert_eq!(rules.categorize("circuit-breaker"), Category::Security);
        assert_eq!(rules.categorize("keeper-coordinator"), Category::Chainhooks);
        assert_eq!(rules.categorize("budget-manager"), Category::Enterprise);
        assert_eq!(rules.categorize("token-system-coordinator"), Category::Token);
        assert_eq!(rules.categorize("protocol-core"), Category::Core);
        assert_eq!(rules.categorize("mystery"), Category::Uncategorized);
    }

    #[test]
    fn infers_dependencies_from_references() {
        let known: BTreeSet<&str> = ["all-traits", "dex-factory", "dex-router"].into();
        let source = r#"
            (use-trait sip-010 .all-traits.sip-010-ft-trait)
            (impl-trait .all-traits.router-trait)
            (define-public (go)
              (contract-call? .dex-factory create-pool)
              (contract-call? 'SP000000000000000000002Q6VF78.pox-4 stack-stx))
        "#;
        let deps = infer_dependencies("dex-router", source, &known);
        assert_eq!(deps, vec!["all-traits".to_string(), "dex-factory".to_string()]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = Registry::from_contracts(vec![
            Contract::new("a", Category::Base, "a.clar"),
            Contract::new("a", Category::Core, "b.clar"),
        ])
        .unwrap_err();
        assert!(matches!(err, DeployerError::Validation(_)));
    }

    #[test]
    fn discover_merges_manifest_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("contracts/dex")).unwrap();
        fs::write(root.join("contracts/all-traits.clar"), "(define-trait t ())").unwrap();
        fs::write(
            root.join("contracts/dex/dex-factory.clar"),
            "(impl-trait .all-traits.factory-trait)",
        )
        .unwrap();
        fs::write(root.join("contracts/mystery.clar"), ";; nothing").unwrap();
        fs::write(
            root.join("Clarinet.toml"),
            r#"
[project]
name = "demo"

[contracts.all-traits]
path = "contracts/all-traits.clar"
clarity_version = 2

[contracts.cxd-token]
path = "contracts/cxd-token.clar"
category = "tokens"
depends_on = ["all-traits"]
"#,
        )
        .unwrap();

        let registry = Registry::discover(
            Some(&root.join("Clarinet.toml")),
            Some(&root.join("contracts")),
            &CategoryRules::default(),
        )
        .unwrap();

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.get("cxd-token").unwrap().category, Category::Token);
        assert_eq!(
            registry.get("all-traits").unwrap().source,
            root.join("contracts/all-traits.clar")
        );
        let factory = registry.get("dex-factory").unwrap();
        assert_eq!(factory.category, Category::Dex);
        assert_eq!(factory.depends_on, vec!["all-traits".to_string()]);

        let uncategorized: Vec<_> = registry.uncategorized().map(|c| c.name.as_str()).collect();
        assert_eq!(uncategorized, vec!["mystery"]);
        assert_eq!(registry.deployable().count(), 3);
    }

    #[test]
    fn unknown_manifest_category_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("Clarinet.toml");
        fs::write(
            &manifest,
            "[contracts.x]\npath = \"x.clar\"\ncategory = \"wizardry\"\n",
        )
        .unwrap();
        let err = Registry::discover(Some(&manifest), None, &CategoryRules::default()).unwrap_err();
        assert!(matches!(err, DeployerError::Validation(_)));
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut registry =
            Registry::from_contracts(vec![Contract::new("a", Category::Base, "a.clar")]).unwrap();
        assert!(registry
            .set_status("a", ContractStatus::Confirmed, None)
            .is_err());
        registry
            .set_status("a", ContractStatus::Pending, Some("0xabc"))
            .unwrap();
        registry
            .set_status("a", ContractStatus::Confirmed, None)
            .unwrap();
        let a = registry.get("a").unwrap();
        assert_eq!(a.status, ContractStatus::Confirmed);
        assert_eq!(a.last_tx_id.as_deref(), Some("0xabc"));
    }

    #[test]
    fn fingerprint_tracks_dependencies() {
        let a = Registry::from_contracts(vec![
            Contract::new("a", Category::Base, "a.clar"),
            Contract::new("b", Category::Core, "b.clar"),
        ])
        .unwrap();
        let b = Registry::from_contracts(vec![
            Contract::new("a", Category::Base, "a.clar"),
            Contract::new("b", Category::Core, "b.clar").with_deps(["a"]),
        ])
        .unwrap();
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
