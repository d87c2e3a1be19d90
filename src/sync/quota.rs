use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceQuotaSpec;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::warn;

use super::{Synced, managed_labels};
use crate::client::ClusterClient;
use crate::crd::{
    CapabilityKind, ClusterResourceQuota, ClusterResourceQuotaSelector, ClusterResourceQuotaSpec,
    Paas, PaasCapability, PaasConfigSpec, QuotaPolicy,
};
use crate::error::Result;
use crate::quota::{self, Quota, QuotaAccumulator};

fn hard(q: &ClusterResourceQuota) -> BTreeMap<String, Quantity> {
    q.spec.quota.hard.clone().unwrap_or_default()
}

impl Synced for ClusterResourceQuota {
    fn spec_matches(&self, desired: &Self) -> bool {
        quota::same_values(&hard(self), &hard(desired)) && self.spec.selector == desired.spec.selector
    }

    fn merge_spec(&mut self, desired: &Self) {
        self.spec = desired.spec.clone();
    }
}

/// A quota object selecting every namespace labelled `{quota_label}={name}`.
pub fn desired_quota(
    config: &PaasConfigSpec,
    name: &str,
    values: &Quota,
    owners: Vec<OwnerReference>,
) -> ClusterResourceQuota {
    let selector = LabelSelector {
        match_labels: Some(BTreeMap::from([(config.quota_label.clone(), name.to_string())])),
        ..Default::default()
    };
    let mut crq = ClusterResourceQuota::new(
        name,
        ClusterResourceQuotaSpec {
            quota: ResourceQuotaSpec {
                hard: Some(quota::to_quantities(values)),
                ..Default::default()
            },
            selector: ClusterResourceQuotaSelector {
                labels: Some(selector),
                annotations: None,
            },
        },
    );
    crq.metadata.labels = Some(managed_labels());
    crq.metadata.owner_references = Some(owners);
    crq
}

/// The capability's own quota merged over the configured defaults.
pub fn capability_quota(policy: &QuotaPolicy, capability: &PaasCapability) -> Result<Quota> {
    Ok(quota::merge(&policy.defaults, &quota::parse_quota(&capability.quota)?))
}

/// Values and owners of the quota shared by every project that enables
/// `kind`. Recomputed from the full current set of projects on every call.
pub async fn clusterwide_quota<C: ClusterClient>(
    client: &C,
    policy: &QuotaPolicy,
    kind: CapabilityKind,
) -> Result<(Quota, Vec<OwnerReference>)> {
    let mut projects: Vec<Paas> = client.list(None, None).await?;
    projects.sort_by_key(|p| p.name_any());

    let mut accumulator = QuotaAccumulator::new();
    for resource in policy.defaults.keys() {
        accumulator.track(resource);
    }

    let mut owners = Vec::new();
    for project in projects {
        if project.meta().deletion_timestamp.is_some() {
            continue;
        }
        let Some(capability) = project.spec.capabilities.get(kind).filter(|c| c.enabled) else {
            continue;
        };
        match capability_quota(policy, capability) {
            Ok(values) => accumulator.append(&values),
            Err(err) => {
                warn!(paas = %project.name_any(), capability = %kind, error = %err, "skipping invalid capability quota");
                continue;
            }
        }
        owners.push(project.shared_owner_reference()?);
    }

    let values = accumulator.optimal_values(policy.ratio, &policy.min, &policy.max);
    Ok((values, owners))
}

/// Name of the quota object a capability namespace belongs to.
pub fn capability_quota_group(config: &PaasConfigSpec, paas: &Paas, kind: CapabilityKind) -> String {
    let clusterwide = config
        .capability(kind)
        .map(|c| c.quotas.clusterwide)
        .unwrap_or(false);
    if clusterwide {
        kind.clusterwide_quota_name()
    } else {
        paas.capability_quota_name(kind)
    }
}
