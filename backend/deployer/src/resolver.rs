//! Dependency resolution — Kahn's algorithm with a deterministic tie-break.
//!
//! Among contracts whose dependencies are all placed, the next one is the
//! lowest `(category priority, name)`.  Any dependency naming a contract the
//! registry does not know (or one that is uncategorized and therefore never
//! deployable) is a validation error; a cycle is fatal and reported with the
//! contracts that participate in it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use serde::Serialize;

use crate::contract::Category;
use crate::errors::{DeployerError, Result};
use crate::registry::Registry;

/// An ordered deployment sequence for one registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentPlan {
    /// Fingerprint of the registry the plan was computed from.
    pub fingerprint: String,
    pub order: Vec<String>,
}

impl DeploymentPlan {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Compute the deployment order for every deployable contract in `registry`.
pub fn resolve(registry: &Registry) -> Result<DeploymentPlan> {
    // dependents[dep] = contracts that list `dep` as a dependency
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut category: BTreeMap<&str, Category> = BTreeMap::new();

    for contract in registry.deployable() {
        in_degree.entry(contract.name.as_str()).or_insert(0);
        category.insert(contract.name.as_str(), contract.category);
    }

    for contract in registry.deployable() {
        let mut seen = BTreeSet::new();
        for dep in &contract.depends_on {
            if dep == &contract.name {
                return Err(DeployerError::CyclicDependency {
                    contracts: vec![contract.name.clone()],
                });
            }
            if !seen.insert(dep.as_str()) {
                continue;
            }
            match registry.get(dep) {
                None => {
                    return Err(DeployerError::Validation(format!(
                        "{} depends on unknown contract {dep}",
                        contract.name
                    )))
                }
                Some(target) if !target.category.is_deployable() => {
                    return Err(DeployerError::Validation(format!(
                        "{} depends on uncategorized contract {dep}",
                        contract.name
                    )))
                }
                Some(_) => {}
            }
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(contract.name.as_str());
            *in_degree.entry(contract.name.as_str()).or_insert(0) += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<(Category, &str)>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&name, _)| Reverse((category[name], name)))
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse((_, name))) = ready.pop() {
        order.push(name.to_string());
        for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((category[dependent], dependent)));
                }
            }
        }
    }

    if order.len() < in_degree.len() {
        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let remaining: BTreeSet<&str> = in_degree
            .keys()
            .copied()
            .filter(|n| !placed.contains(n))
            .collect();
        return Err(DeployerError::CyclicDependency {
            contracts: cycle_members(registry, remaining),
        });
    }

    Ok(DeploymentPlan {
        fingerprint: registry.fingerprint(),
        order,
    })
}

/// Narrow Kahn's leftovers down to contracts on (or between) cycles by
/// repeatedly dropping nodes nothing else in the set depends on.
fn cycle_members(registry: &Registry, mut remaining: BTreeSet<&str>) -> Vec<String> {
    loop {
        let depended_on: BTreeSet<&str> = remaining
            .iter()
            .filter_map(|n| registry.get(n))
            .flat_map(|c| c.depends_on.iter().map(String::as_str))
            .filter(|d| remaining.contains(d))
            .collect();
        let before = remaining.len();
        remaining.retain(|n| depended_on.contains(n));
        if remaining.len() == before {
            break;
        }
    }
    remaining.into_iter().map(str::to_string).collect()
}

/// Every contract `name` depends on, directly or transitively.
pub fn ancestors(registry: &Registry, name: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut stack: Vec<&str> = vec![name];
    while let Some(current) = stack.pop() {
        let Some(contract) = registry.get(current) else {
            continue;
        };
        for dep in &contract.depends_on {
            if out.insert(dep.clone()) {
                stack.push(dep.as_str());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Contract;

    fn registry(contracts: Vec<Contract>) -> Registry {
        Registry::from_contracts(contracts).unwrap()
    }

    fn assert_topological(registry: &Registry, plan: &DeploymentPlan) {
        let position = |name: &str| plan.order.iter().position(|n| n == name).unwrap();
        for contract in registry.deployable() {
            let at = position(&contract.name);
            for dep in &contract.depends_on {
                assert!(
                    position(dep) < at,
                    "{dep} must precede {}",
                    contract.name
                );
            }
        }
    }

    #[test]
    fn ties_break_by_category_then_name() {
        let reg = registry(vec![
            Contract::new("zeta-token", Category::Token, "z.clar"),
            Contract::new("alpha-dex", Category::Dex, "a.clar"),
            Contract::new("beta-core", Category::Core, "b.clar"),
            Contract::new("all-traits", Category::Base, "t.clar"),
            Contract::new("aa-core", Category::Core, "c.clar"),
        ]);
        let plan = resolve(&reg).unwrap();
        assert_eq!(
            plan.order,
            vec!["all-traits", "aa-core", "beta-core", "zeta-token", "alpha-dex"]
        );
    }

    #[test]
    fn dependencies_override_category_priority() {
        let reg = registry(vec![
            Contract::new("base-lib", Category::Base, "b.clar").with_deps(["price-oracle"]),
            Contract::new("price-oracle", Category::Oracle, "o.clar"),
        ]);
        let plan = resolve(&reg).unwrap();
        assert_eq!(plan.order, vec!["price-oracle", "base-lib"]);
    }

    #[test]
    fn diamond_graph_is_topological() {
        let reg = registry(vec![
            Contract::new("a", Category::Base, "a.clar"),
            Contract::new("b", Category::Core, "b.clar").with_deps(["a"]),
            Contract::new("c", Category::Token, "c.clar").with_deps(["a"]),
            Contract::new("d", Category::Dex, "d.clar").with_deps(["b", "c"]),
            Contract::new("e", Category::Governance, "e.clar").with_deps(["d", "a"]),
        ]);
        let plan = resolve(&reg).unwrap();
        assert_eq!(plan.len(), 5);
        assert_topological(&reg, &plan);
        assert_eq!(plan.fingerprint, reg.fingerprint());
    }

    #[test]
    fn uncategorized_contracts_are_not_planned() {
        let reg = registry(vec![
            Contract::new("a", Category::Base, "a.clar"),
            Contract::new("odd", Category::Uncategorized, "odd.clar"),
        ]);
        assert_eq!(resolve(&reg).unwrap().order, vec!["a"]);
    }

    #[test]
    fn depending_on_uncategorized_is_invalid() {
        let reg = registry(vec![
            Contract::new("a", Category::Base, "a.clar").with_deps(["odd"]),
            Contract::new("odd", Category::Uncategorized, "odd.clar"),
        ]);
        assert!(matches!(resolve(&reg), Err(DeployerError::Validation(_))));
    }

    #[test]
    fn missing_dependency_is_a_validation_error() {
        let reg = registry(vec![Contract::new("a", Category::Base, "a.clar").with_deps(["ghost"])]);
        match resolve(&reg) {
            Err(DeployerError::Validation(msg)) => assert!(msg.contains("ghost")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn cycle_is_reported_with_members() {
        let reg = registry(vec![
            Contract::new("root", Category::Base, "r.clar"),
            Contract::new("x", Category::Core, "x.clar").with_deps(["root", "z"]),
            Contract::new("y", Category::Core, "y.clar").with_deps(["x"]),
            Contract::new("z", Category::Core, "z.clar").with_deps(["y"]),
            Contract::new("downstream", Category::Dex, "d.clar").with_deps(["z"]),
        ]);
        match resolve(&reg) {
            Err(DeployerError::CyclicDependency { contracts }) => {
                assert_eq!(contracts, vec!["x", "y", "z"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let reg = registry(vec![Contract::new("a", Category::Base, "a.clar").with_deps(["a"])]);
        assert!(matches!(
            resolve(&reg),
            Err(DeployerError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn ancestors_are_transitive() {
        let reg = registry(vec![
            Contract::new("a", Category::Base, "a.clar"),
            Contract::new("b", Category::Core, "b.clar").with_deps(["a"]),
            Contract::new("c", Category::Token, "c.clar").with_deps(["b"]),
        ]);
        let anc = ancestors(&reg, "c");
        assert!(anc.contains("a") && anc.contains("b"));
        assert!(ancestors(&reg, "a").is_empty());
    }
}
