use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::CapabilityKind;
use crate::error::{Error, Result};
use crate::status::{CONDITION_ACTIVE, is_condition_true};
use crate::quota::{self, Quota};

/// Cluster-wide operator policy. Exactly one instance carries the `Active`
/// condition at a time.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "cpet.belastingdienst.nl",
    version = "v1alpha1",
    kind = "PaasConfig",
    plural = "paasconfig",
    status = "PaasConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PaasConfigSpec {
    #[serde(default)]
    pub capabilities: BTreeMap<String, ConfigCapability>,
    #[serde(default = "default_argocd_namespace")]
    pub clusterwide_argocd_namespace: String,
    #[serde(default)]
    pub decrypt_keys_secret: NamespacedName,
    #[serde(default)]
    pub group_sync_list: NamespacedName,
    #[serde(default = "default_group_sync_list_key")]
    pub group_sync_list_key: String,
    #[serde(default)]
    pub ldap: ConfigLdap,
    #[serde(default = "default_managed_by_label")]
    pub managed_by_label: String,
    #[serde(default = "default_managed_by_suffix")]
    pub managed_by_suffix: String,
    #[serde(default = "default_requestor_label")]
    pub requestor_label: String,
    #[serde(default = "default_quota_label")]
    pub quota_label: String,
    /// role -> cluster roles bound for that role
    #[serde(default)]
    pub role_mappings: BTreeMap<String, Vec<String>>,
    /// Roles granted to groups that do not list any.
    #[serde(default = "default_roles")]
    pub default_roles: Vec<String>,
}

fn default_argocd_namespace() -> String {
    "asns".into()
}

fn default_group_sync_list_key() -> String {
    "groupsynclist.txt".into()
}

fn default_managed_by_label() -> String {
    "argocd.argoproj.io/managed-by".into()
}

fn default_managed_by_suffix() -> String {
    "argocd".into()
}

fn default_requestor_label() -> String {
    "o.lbl".into()
}

fn default_quota_label() -> String {
    "clusterquotagroup".into()
}

fn default_roles() -> Vec<String> {
    vec!["admin".into()]
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct NamespacedName {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ConfigLdap {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigCapability {
    /// Name of the ApplicationSet (in the cluster-wide Argo CD namespace)
    /// holding one list entry per project.
    #[serde(default)]
    pub appset: String,
    #[serde(default)]
    pub quotas: ConfigQuotas,
    /// cluster role -> service accounts, granted when a project asks for
    /// extra permissions
    #[serde(default)]
    pub extra_permissions: BTreeMap<String, Vec<String>>,
    /// cluster role -> service accounts, always granted
    #[serde(default)]
    pub default_permissions: BTreeMap<String, Vec<String>>,
    /// field -> default value merged into application-set entries
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ConfigQuotas {
    #[serde(default)]
    pub clusterwide: bool,
    #[serde(default)]
    pub defaults: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub min: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub max: BTreeMap<String, Quantity>,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
}

impl Default for ConfigQuotas {
    fn default() -> Self {
        Self {
            clusterwide: false,
            defaults: BTreeMap::new(),
            min: BTreeMap::new(),
            max: BTreeMap::new(),
            ratio: default_ratio(),
        }
    }
}

fn default_ratio() -> f64 {
    0.8
}

/// Parsed quota policy for one capability.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaPolicy {
    pub clusterwide: bool,
    pub defaults: Quota,
    pub min: Quota,
    pub max: Quota,
    pub ratio: f64,
}

impl ConfigQuotas {
    pub fn policy(&self) -> Result<QuotaPolicy> {
        Ok(QuotaPolicy {
            clusterwide: self.clusterwide,
            defaults: quota::parse_quota(&self.defaults)?,
            min: quota::parse_quota(&self.min)?,
            max: quota::parse_quota(&self.max)?,
            ratio: self.ratio.clamp(0.0, 1.0),
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PaasConfigStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl PaasConfigSpec {
    pub fn capability(&self, kind: CapabilityKind) -> Result<&ConfigCapability> {
        self.capabilities
            .get(kind.name())
            .ok_or_else(|| Error::CapabilityNotConfigured(kind.name().to_string()))
    }

    pub fn cluster_roles_for(&self, role: &str) -> Vec<String> {
        self.role_mappings
            .get(role)
            .cloned()
            .unwrap_or_else(|| vec![role.to_string()])
    }

    pub fn ldap_url(&self) -> Option<String> {
        if self.ldap.host.is_empty() {
            return None;
        }
        Some(format!("ldap://{}:{}", self.ldap.host, self.ldap.port))
    }
}

impl PaasConfig {
    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_ACTIVE))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::config_spec;
    use super::*;

    #[test]
    fn test_defaults_are_filled_in() {
        let spec: PaasConfigSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.quota_label, "clusterquotagroup");
        assert_eq!(spec.managed_by_label, "argocd.argoproj.io/managed-by");
        assert_eq!(spec.group_sync_list_key, "groupsynclist.txt");
        assert_eq!(spec.default_roles, vec!["admin".to_string()]);
    }

    #[test]
    fn test_capability_lookup() {
        let spec = config_spec();
        assert!(spec.capability(CapabilityKind::Tekton).is_ok());
        assert!(matches!(
            spec.capability(CapabilityKind::Keycloak),
            Err(Error::CapabilityNotConfigured(name)) if name == "keycloak"
        ));
    }

    #[test]
    fn test_quota_policy_parses() {
        let spec = config_spec();
        let policy = spec
            .capability(CapabilityKind::Tekton)
            .unwrap()
            .quotas
            .policy()
            .unwrap();
        assert!(policy.clusterwide);
        assert_eq!(policy.ratio, 0.7);
        assert_eq!(policy.min["cpu"].to_string(), "10");
        let grafana = spec.capability(CapabilityKind::Grafana).unwrap();
        assert_eq!(grafana.quotas.ratio, 0.8);
    }

    #[test]
    fn test_role_mapping_falls_back_to_role_name() {
        let spec = config_spec();
        assert_eq!(spec.cluster_roles_for("viewer"), vec!["view".to_string()]);
        assert_eq!(spec.cluster_roles_for("edit"), vec!["edit".to_string()]);
        assert_eq!(spec.ldap_url().as_deref(), Some("ldap://ldap.example.org:636"));
    }
}
