pub mod foreign;
pub mod paas;
pub mod paas_config;
pub mod paasns;

pub use foreign::{
    Application, ApplicationSet, ApplicationSetGenerator, ApplicationSetSpec, ApplicationSpec,
    ClusterResourceQuota, ClusterResourceQuotaSelector, ClusterResourceQuotaSpec, Group, ListGenerator,
};
pub use paas::{
    CapabilityKind, PAAS_FINALIZER, Paas, PaasCapabilities, PaasCapability, PaasGroup, PaasSpec,
};
pub use paas_config::{
    ConfigCapability, NamespacedName, PaasConfig, PaasConfigSpec, PaasConfigStatus, QuotaPolicy,
};
pub use paasns::{PAASNS_FINALIZER, PaasNS, PaasNSSpec};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status shared by `Paas` and `PaasNS`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaasStatus {
    /// Human-readable log of the last reconcile pass.
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
