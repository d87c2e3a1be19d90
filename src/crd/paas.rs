use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::PaasStatus;
use crate::error::{Error, Result};

pub const PAAS_FINALIZER: &str = "paas.cpet.belastingdienst.nl/finalizer";

/// A project: one platform tenant with its namespaces, quotas, groups and
/// capabilities.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "cpet.belastingdienst.nl",
    version = "v1alpha1",
    kind = "Paas",
    plural = "paas",
    shortname = "paas",
    status = "PaasStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PaasSpec {
    #[serde(default)]
    pub requestor: String,
    /// Default quota for the project namespace and its claims.
    #[serde(default)]
    pub quota: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub capabilities: PaasCapabilities,
    #[serde(default)]
    pub groups: BTreeMap<String, PaasGroup>,
    /// Extra namespaces, created as `{paas}-{namespace}`.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// url -> encrypted private key
    #[serde(default)]
    pub ssh_secrets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_by_paas: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityKind {
    ArgoCd,
    Tekton,
    Keycloak,
    Grafana,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 4] = [
        CapabilityKind::ArgoCd,
        CapabilityKind::Tekton,
        CapabilityKind::Keycloak,
        CapabilityKind::Grafana,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CapabilityKind::ArgoCd => "argocd",
            CapabilityKind::Tekton => "tekton",
            CapabilityKind::Keycloak => "keycloak",
            CapabilityKind::Grafana => "grafana",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Name of the quota object shared by every project using this
    /// capability when its quota is configured cluster-wide.
    pub fn clusterwide_quota_name(self) -> String {
        format!("paas-{}", self.name())
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PaasCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argocd: Option<PaasCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tekton: Option<PaasCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keycloak: Option<PaasCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana: Option<PaasCapability>,
}

impl PaasCapabilities {
    pub fn get(&self, kind: CapabilityKind) -> Option<&PaasCapability> {
        match kind {
            CapabilityKind::ArgoCd => self.argocd.as_ref(),
            CapabilityKind::Tekton => self.tekton.as_ref(),
            CapabilityKind::Keycloak => self.keycloak.as_ref(),
            CapabilityKind::Grafana => self.grafana.as_ref(),
        }
    }

    pub fn get_mut(&mut self, kind: CapabilityKind) -> &mut Option<PaasCapability> {
        match kind {
            CapabilityKind::ArgoCd => &mut self.argocd,
            CapabilityKind::Tekton => &mut self.tekton,
            CapabilityKind::Keycloak => &mut self.keycloak,
            CapabilityKind::Grafana => &mut self.grafana,
        }
    }

    pub fn is_enabled(&self, kind: CapabilityKind) -> bool {
        self.get(kind).is_some_and(|c| c.enabled)
    }

    pub fn enabled(&self) -> impl Iterator<Item = (CapabilityKind, &PaasCapability)> {
        CapabilityKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).filter(|c| c.enabled).map(|c| (kind, c)))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaasCapability {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_path: Option<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    #[serde(default)]
    pub quota: BTreeMap<String, Quantity>,
    #[serde(default)]
    pub ssh_secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_permissions: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PaasGroup {
    /// LDAP query; groups with a query are synced from LDAP and shared
    /// between projects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl PaasGroup {
    pub fn ldap_query(&self) -> Option<&str> {
        self.query.as_deref().filter(|q| !q.is_empty())
    }
}

impl Paas {
    pub fn namespace_for(&self, suffix: &str) -> String {
        format!("{}-{}", self.name_any(), suffix)
    }

    pub fn capability_namespace(&self, kind: CapabilityKind) -> String {
        self.namespace_for(kind.name())
    }

    pub fn capability_quota_name(&self, kind: CapabilityKind) -> String {
        self.namespace_for(kind.name())
    }

    /// Namespaces the project owns directly: its own, one per enabled
    /// capability and one per explicit namespace entry.
    pub fn seed_namespaces(&self) -> Vec<String> {
        let mut seeds = vec![self.name_any()];
        let derived = self
            .spec
            .capabilities
            .enabled()
            .map(|(kind, _)| self.capability_namespace(kind))
            .chain(self.spec.namespaces.iter().map(|ns| self.namespace_for(ns)));
        for ns in derived {
            if !seeds.contains(&ns) {
                seeds.push(ns);
            }
        }
        seeds
    }

    pub fn group_name(&self, key: &str, group: &PaasGroup) -> String {
        match group.ldap_query() {
            Some(_) => key.to_string(),
            None => self.namespace_for(key),
        }
    }

    /// Project whose GitOps instance manages this project's namespaces.
    pub fn managed_by(&self) -> String {
        self.spec
            .managed_by_paas
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    pub fn owner_reference(&self) -> Result<OwnerReference> {
        self.controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey("uid"))
    }

    /// Non-controlling reference, used on objects shared between projects.
    pub fn shared_owner_reference(&self) -> Result<OwnerReference> {
        let mut owner = self.owner_reference()?;
        owner.controller = None;
        owner.block_owner_deletion = None;
        Ok(owner)
    }

    pub fn uid_or_err(&self) -> Result<String> {
        self.meta().uid.clone().ok_or(Error::MissingObjectKey("uid"))
    }
}
