use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::PaasStatus;

pub const PAASNS_FINALIZER: &str = "paasns.cpet.belastingdienst.nl/finalizer";

/// A claim for an extra namespace, placed inside a namespace that already
/// belongs to the referenced project.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cpet.belastingdienst.nl",
    version = "v1alpha1",
    kind = "PaasNS",
    plural = "paasns",
    namespaced,
    status = "PaasStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PaasNSSpec {
    pub paas: String,
    /// Subset of the project's group keys granted access; empty means all.
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub ssh_secrets: BTreeMap<String, String>,
    /// Give the claimed namespace its own quota object instead of sharing
    /// the project default quota.
    #[serde(default)]
    pub separate_quota: bool,
}

impl PaasNS {
    /// The namespace this claim materializes: `{paas}-{claim}`.
    pub fn derived_namespace(&self) -> String {
        format!("{}-{}", self.spec.paas, self.name_any())
    }

    pub fn grants_group(&self, key: &str) -> bool {
        self.spec.groups.is_empty() || self.spec.groups.iter().any(|g| g == key)
    }
}
