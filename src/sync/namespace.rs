use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;

use super::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, Synced};
use crate::crd::{Paas, PaasConfigSpec};

impl Synced for Namespace {
    fn spec_matches(&self, _desired: &Self) -> bool {
        true
    }

    fn merge_spec(&mut self, _desired: &Self) {}
}

/// Labels every namespace of `paas` carries. `quota_group` is the name of
/// the quota object whose selector should pick the namespace up.
pub fn namespace_labels(
    config: &PaasConfigSpec,
    paas: &Paas,
    quota_group: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (config.quota_label.clone(), quota_group.to_string()),
        (
            config.managed_by_label.clone(),
            format!("{}-{}", paas.managed_by(), config.managed_by_suffix),
        ),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ]);
    if !paas.spec.requestor.is_empty() {
        labels.insert(config.requestor_label.clone(), paas.spec.requestor.clone());
    }
    labels
}

pub fn desired_namespace(
    name: &str,
    labels: BTreeMap<String, String>,
    owner: OwnerReference,
) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        ..Default::default()
    }
}
