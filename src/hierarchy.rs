//! Expands a project into every namespace it owns, following namespace
//! claims transitively.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use kube::ResourceExt;
use tracing::debug;

use crate::client::ClusterClient;
use crate::crd::{Paas, PaasNS};
use crate::error::{Error, Result};

/// namespace -> number of claims (or seeds) that produce it
pub type NamespaceCounts = BTreeMap<String, usize>;

/// Breadth-first walk from the project's seed namespaces through the claims
/// that reference the project. A claim that produces its own namespace or one
/// of its ancestors is reported as [`Error::NamespaceCycle`].
pub async fn resolve_namespaces<C: ClusterClient>(
    client: &C,
    paas: &Paas,
) -> Result<NamespaceCounts> {
    let project = paas.name_any();
    let seeds = paas.seed_namespaces();

    let mut counts: NamespaceCounts = seeds.iter().map(|ns| (ns.clone(), 1)).collect();
    let mut visited: BTreeSet<String> = seeds.iter().cloned().collect();
    let mut parents: HashMap<String, String> = HashMap::new();
    let mut queue: VecDeque<String> = seeds.into_iter().collect();

    while let Some(namespace) = queue.pop_front() {
        let mut claims: Vec<PaasNS> = client.list(Some(&namespace), None).await?;
        claims.retain(|claim| claim.spec.paas == project);
        claims.sort_by_key(|claim| claim.name_any());

        for claim in claims {
            let derived = claim.derived_namespace();
            if is_ancestor(&parents, &namespace, &derived) {
                return Err(Error::NamespaceCycle(derived));
            }
            *counts.entry(derived.clone()).or_default() += 1;
            if visited.insert(derived.clone()) {
                debug!(paas = %project, parent = %namespace, namespace = %derived, "claimed namespace");
                parents.insert(derived.clone(), namespace.clone());
                queue.push_back(derived);
            }
        }
    }

    Ok(counts)
}

fn is_ancestor(parents: &HashMap<String, String>, from: &str, candidate: &str) -> bool {
    let mut current = Some(from);
    while let Some(ns) = current {
        if ns == candidate {
            return true;
        }
        current = parents.get(ns).map(String::as_str);
    }
    false
}
