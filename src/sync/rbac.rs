use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use super::{Synced, managed_labels, managed_selector};
use crate::client::{ClusterClient, describe};
use crate::crd::{CapabilityKind, Paas, PaasConfigSpec};
use crate::error::Result;
use crate::ownership::OwnerSet;
use crate::status::{StatusAction, StatusLog};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

type SubjectKey = (String, String, String);

fn subject_key(subject: &Subject) -> SubjectKey {
    (
        subject.kind.clone(),
        subject.namespace.clone().unwrap_or_default(),
        subject.name.clone(),
    )
}

fn subject_keys(subjects: Option<&Vec<Subject>>) -> BTreeSet<SubjectKey> {
    subjects.into_iter().flatten().map(subject_key).collect()
}

fn cluster_role_ref(role: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.into(),
        kind: "ClusterRole".into(),
        name: role.into(),
    }
}

pub fn binding_name(cluster_role: &str) -> String {
    format!("paas-{cluster_role}")
}

impl Synced for RoleBinding {
    fn spec_matches(&self, desired: &Self) -> bool {
        self.role_ref == desired.role_ref
            && subject_keys(self.subjects.as_ref()) == subject_keys(desired.subjects.as_ref())
    }

    fn merge_spec(&mut self, desired: &Self) {
        self.role_ref = desired.role_ref.clone();
        self.subjects = desired.subjects.clone();
    }
}

/// Cluster role bindings collect subjects from several projects, so the
/// desired subjects only have to be present.
impl Synced for ClusterRoleBinding {
    fn spec_matches(&self, desired: &Self) -> bool {
        self.role_ref == desired.role_ref
            && subject_keys(desired.subjects.as_ref()).is_subset(&subject_keys(self.subjects.as_ref()))
    }

    fn merge_spec(&mut self, desired: &Self) {
        self.role_ref = desired.role_ref.clone();
        let mut subjects = self.subjects.take().unwrap_or_default();
        let present = subject_keys(Some(&subjects));
        for subject in desired.subjects.iter().flatten() {
            if !present.contains(&subject_key(subject)) {
                subjects.push(subject.clone());
            }
        }
        self.subjects = Some(subjects);
    }
}

/// Role bindings for one namespace: per cluster role, the project groups
/// that map to it. `grants` filters group keys (claims may grant a subset).
pub fn role_bindings(
    config: &PaasConfigSpec,
    paas: &Paas,
    namespace: &str,
    grants: impl Fn(&str) -> bool,
    owner: &OwnerReference,
) -> Vec<RoleBinding> {
    let mut by_role: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (key, group) in paas.spec.groups.iter().filter(|(key, _)| grants(key)) {
        let roles = if group.roles.is_empty() {
            &config.default_roles
        } else {
            &group.roles
        };
        for role in roles {
            for cluster_role in config.cluster_roles_for(role) {
                by_role
                    .entry(cluster_role)
                    .or_default()
                    .insert(paas.group_name(key, group));
            }
        }
    }

    by_role
        .into_iter()
        .map(|(cluster_role, groups)| RoleBinding {
            metadata: ObjectMeta {
                name: Some(binding_name(&cluster_role)),
                namespace: Some(namespace.to_string()),
                labels: Some(managed_labels()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            role_ref: cluster_role_ref(&cluster_role),
            subjects: Some(
                groups
                    .into_iter()
                    .map(|name| Subject {
                        api_group: Some(RBAC_API_GROUP.into()),
                        kind: "Group".into(),
                        name,
                        namespace: None,
                    })
                    .collect(),
            ),
        })
        .collect()
}

/// Deletes role bindings in `namespace` owned by `uid` that are no longer
/// desired.
pub async fn prune_role_bindings<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    namespace: &str,
    keep: &BTreeSet<String>,
    uid: &str,
) -> Result<()> {
    let existing: Vec<RoleBinding> = client
        .list(Some(namespace), Some(&managed_selector()))
        .await?;
    for binding in existing {
        let name = binding.name_any();
        if keep.contains(&name) || !OwnerSet::from_meta(&binding.metadata).contains(uid) {
            continue;
        }
        super::remove::<C, RoleBinding>(client, log, Some(namespace), &name).await?;
    }
    Ok(())
}

/// Cluster role bindings granted to the service accounts of the project's
/// enabled capabilities: default permissions always, extra permissions
/// when the capability asks for them.
pub fn capability_cluster_role_bindings(
    config: &PaasConfigSpec,
    paas: &Paas,
    owner: &OwnerReference,
) -> Result<Vec<ClusterRoleBinding>> {
    let mut by_role: BTreeMap<String, Vec<Subject>> = BTreeMap::new();
    for (kind, capability) in paas.spec.capabilities.enabled() {
        let configured = config.capability(kind)?;
        let namespace = paas.capability_namespace(kind);
        let extra = capability
            .extra_permissions
            .then_some(&configured.extra_permissions);
        for permissions in std::iter::once(&configured.default_permissions).chain(extra) {
            for (cluster_role, accounts) in permissions {
                let subjects = by_role.entry(cluster_role.clone()).or_default();
                for account in accounts {
                    let subject = Subject {
                        api_group: None,
                        kind: "ServiceAccount".into(),
                        name: account.clone(),
                        namespace: Some(namespace.clone()),
                    };
                    if !subjects.iter().any(|s| subject_key(s) == subject_key(&subject)) {
                        subjects.push(subject);
                    }
                }
            }
        }
    }

    Ok(by_role
        .into_iter()
        .map(|(cluster_role, subjects)| ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(binding_name(&cluster_role)),
                labels: Some(managed_labels()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            role_ref: cluster_role_ref(&cluster_role),
            subjects: Some(subjects),
        })
        .collect())
}

/// Removes this project's service accounts from shared cluster role
/// bindings where they are no longer desired. A binding left without
/// subjects is deleted; a binding left without this project's subjects
/// drops the project as owner. Passing no desired bindings releases them
/// all.
pub async fn prune_cluster_role_bindings<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    paas: &Paas,
    desired: &[ClusterRoleBinding],
) -> Result<()> {
    let uid = paas.uid_or_err()?;
    let project_namespaces: BTreeSet<String> = CapabilityKind::ALL
        .into_iter()
        .map(|kind| paas.capability_namespace(kind))
        .collect();
    let wanted: BTreeMap<String, BTreeSet<SubjectKey>> = desired
        .iter()
        .map(|b| (b.name_any(), subject_keys(b.subjects.as_ref())))
        .collect();
    let is_ours = |s: &Subject| {
        s.namespace
            .as_ref()
            .is_some_and(|ns| project_namespaces.contains(ns))
    };

    let existing: Vec<ClusterRoleBinding> = client.list(None, Some(&managed_selector())).await?;
    for mut binding in existing {
        let name = binding.name_any();
        let mut owners = OwnerSet::from_meta(&binding.metadata);
        if !owners.contains(&uid) {
            continue;
        }
        let keep = wanted.get(&name);
        let subjects = binding.subjects.take().unwrap_or_default();
        let before = subjects.len();
        let remaining: Vec<Subject> = subjects
            .into_iter()
            .filter(|s| !is_ours(s) || keep.is_some_and(|k| k.contains(&subject_key(s))))
            .collect();
        let still_ours = remaining.iter().any(|s| is_ours(s));
        if remaining.len() == before && still_ours {
            continue;
        }

        let target = describe::<ClusterRoleBinding>(None, &name);
        if remaining.is_empty() {
            super::remove::<C, ClusterRoleBinding>(client, log, None, &name).await?;
            continue;
        }
        if !still_ours {
            owners.release(&uid);
            owners.apply_to(&mut binding.metadata);
        }
        binding.subjects = Some(remaining);
        if let Err(err) = client.replace(&binding).await {
            log.error(StatusAction::Update, &target, &err.to_string());
            return Err(err);
        }
        info!(object = %target, paas = %paas.name_any(), "removed project subjects");
        log.info(StatusAction::Update, &target, "removed project subjects");
    }
    Ok(())
}
